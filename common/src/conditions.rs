use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static READY: &str = "Ready";
pub static GROUP_REF_VALIDATED: &str = "GroupRefValidated";
pub static COMPOSITE_TOOL_REFS_VALIDATED: &str = "CompositeToolRefsValidated";
pub static POD_TEMPLATE_SPEC_VALID: &str = "PodTemplateSpecValid";
pub static BACKENDS_DISCOVERED: &str = "BackendsDiscovered";
pub static AUTH_CONFIGURED: &str = "AuthConfigured";
pub static TOOL_CONFIG_VALIDATED: &str = "ToolConfigValidated";
pub static EXTERNAL_AUTH_CONFIG_VALIDATED: &str = "ExternalAuthConfigValidated";
pub static SERVERS_CHECKED: &str = "MCPServersChecked";

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
pub enum ConditionsStatus {
    #[default]
    True,
    False,
    Unknown,
}

/// ApplicationCondition contains details about one aspect of the current state of a resource
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationCondition {
    /// Type of the condition, ie: Ready
    #[serde(rename = "type")]
    pub condition_type: String,
    /// Status ("True", "False" or "Unknown")
    pub status: ConditionsStatus,
    /// Machine readable reason for the last transition
    pub reason: String,
    /// Message contains human-readable message indicating details about condition
    pub message: String,
    /// Generation of the resource this condition was computed against
    pub observed_generation: i64,
    /// LastTransitionTime is the time the status last changed
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl ApplicationCondition {
    #[must_use]
    pub fn new(
        condition_type: &str,
        status: ConditionsStatus,
        reason: &str,
        message: &str,
        generation: i64,
    ) -> ApplicationCondition {
        ApplicationCondition {
            condition_type: condition_type.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: generation,
            last_transition_time: Some(Utc::now()),
        }
    }

    pub fn ok(condition_type: &str, reason: &str, message: &str, generation: i64) -> ApplicationCondition {
        ApplicationCondition::new(condition_type, ConditionsStatus::True, reason, message, generation)
    }

    pub fn ko(condition_type: &str, reason: &str, message: &str, generation: i64) -> ApplicationCondition {
        ApplicationCondition::new(condition_type, ConditionsStatus::False, reason, message, generation)
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionsStatus::True
    }
}

/// Insert or replace the condition of the same type.
///
/// The transition time of an existing condition is kept when its status does not change so
/// that re-applying an identical condition leaves the list byte-identical.
pub fn set_condition(conditions: &mut Vec<ApplicationCondition>, mut cond: ApplicationCondition) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == cond.condition_type)
    {
        Some(existing) => {
            if existing.status == cond.status {
                cond.last_transition_time = existing.last_transition_time;
            }
            *existing = cond;
        }
        None => conditions.push(cond),
    }
}

pub fn find_condition<'a>(
    conditions: &'a [ApplicationCondition],
    condition_type: &str,
) -> Option<&'a ApplicationCondition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

pub fn get_conditions_excluding(
    conditions: &[ApplicationCondition],
    exclude: &[&str],
) -> Vec<ApplicationCondition> {
    conditions
        .iter()
        .filter(|c| !exclude.iter().any(|e| c.condition_type == *e))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_keeps_transition_time_when_status_is_stable() {
        let mut conds = vec![];
        set_condition(&mut conds, ApplicationCondition::ok(READY, "DeploymentReady", "ok", 1));
        let first = conds[0].last_transition_time;
        set_condition(&mut conds, ApplicationCondition::ok(READY, "DeploymentReady", "ok", 1));
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].last_transition_time, first);
    }

    #[test]
    fn test_set_condition_replaces_on_status_change() {
        let mut conds = vec![ApplicationCondition::ok(READY, "DeploymentReady", "ok", 1)];
        set_condition(&mut conds, ApplicationCondition::ko(READY, "DeploymentFailed", "ko", 2));
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].status, ConditionsStatus::False);
        assert_eq!(conds[0].observed_generation, 2);
        assert_eq!(conds[0].reason, "DeploymentFailed");
    }

    #[test]
    fn test_get_conditions_excluding() {
        let conds = vec![
            ApplicationCondition::ok(READY, "a", "a", 1),
            ApplicationCondition::ok(GROUP_REF_VALIDATED, "b", "b", 1),
        ];
        let rest = get_conditions_excluding(&conds, &[READY]);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].condition_type, GROUP_REF_VALIDATED);
        assert!(find_condition(&conds, READY).is_some_and(|c| c.is_true()));
    }
}
