use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    #[default]
    Tool,
    Elicitation,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorAction {
    #[default]
    Abort,
    Continue,
    Retry,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHandling {
    pub action: ErrorAction,
    /// Required (at least 1) when action is retry
    pub max_retries: Option<i32>,
}

/// One step of a composite tool workflow
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    #[serde(rename = "type", default)]
    pub step_type: StepType,
    /// `workload.tool_name` for tool steps
    pub tool: Option<String>,
    /// Prompt shown for elicitation steps
    pub message: Option<String>,
    /// Tool arguments, may contain templates
    #[schemars(schema_with = "crate::preserve_unknown_fields")]
    pub arguments: Option<serde_json::Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub on_error: Option<ErrorHandling>,
}

/// A reusable multi-step tool exposed by VirtualMCPServers
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    kind = "VirtualMCPCompositeToolDefinition",
    root = "VirtualMcpCompositeToolDefinition",
    shortname = "vmcpctd",
    group = "mcphive.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(
    doc = "Custom resource representing a composite tool workflow",
    printcolumn = r#"
    {"name":"Description", "type":"string", "description":"Description", "jsonPath":".spec.description"},
    {"name":"Age",         "type":"date",   "description":"Age", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMcpCompositeToolDefinitionSpec {
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

fn is_tool_reference(tool: &str) -> bool {
    matches!(tool.split_once('.'), Some((workload, name)) if !workload.is_empty() && !name.is_empty())
}

impl VirtualMcpCompositeToolDefinitionSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err("steps must not be empty".to_string());
        }
        let mut ids = BTreeSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            if step.id.is_empty() {
                return Err(format!("steps[{i}].id is required"));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(format!("steps[{i}].id {:?} is duplicated", step.id));
            }
        }
        for (i, step) in self.steps.iter().enumerate() {
            match step.step_type {
                StepType::Tool => match step.tool.as_deref() {
                    None | Some("") => return Err(format!("steps[{i}].tool is required when type is tool")),
                    Some(t) if !is_tool_reference(t) => {
                        return Err(format!("steps[{i}].tool must be in format 'workload.tool_name'"));
                    }
                    _ => {}
                },
                StepType::Elicitation => {
                    if step.message.as_deref().is_none_or(str::is_empty) {
                        return Err(format!("steps[{i}].message is required when type is elicitation"));
                    }
                }
            }
            if let Some(dep) = step.depends_on.iter().find(|d| !ids.contains(d.as_str())) {
                return Err(format!("steps[{i}].dependsOn references unknown step {dep:?}"));
            }
            if let Some(on_error) = step.on_error.as_ref() {
                if on_error.action == ErrorAction::Retry && on_error.max_retries.unwrap_or(0) < 1 {
                    return Err(format!(
                        "steps[{i}].onError.maxRetries must be at least 1 when action is retry"
                    ));
                }
            }
        }
        self.check_cycles()
    }

    fn check_cycles(&self) -> Result<(), String> {
        let deps: BTreeMap<&str, Vec<&str>> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.depends_on.iter().map(String::as_str).collect()))
            .collect();
        // 1 = on the current path, 2 = fully explored
        let mut state: BTreeMap<&str, u8> = BTreeMap::new();
        fn visit<'a>(
            id: &'a str,
            deps: &BTreeMap<&'a str, Vec<&'a str>>,
            state: &mut BTreeMap<&'a str, u8>,
        ) -> Result<(), String> {
            match state.get(id) {
                Some(1) => return Err(format!("steps: dependency cycle detected involving step {id:?}")),
                Some(_) => return Ok(()),
                None => {}
            }
            state.insert(id, 1);
            for dep in deps.get(id).into_iter().flatten() {
                visit(*dep, deps, state)?;
            }
            state.insert(id, 2);
            Ok(())
        }
        for id in deps.keys() {
            visit(*id, &deps, &mut state)?;
        }
        Ok(())
    }
}
