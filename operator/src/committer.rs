use common::{
    Phase, Result,
    conditions::{ApplicationCondition, set_condition},
    platform::Platform,
    status::{ObservedStatus, StatusResource},
};
use tracing::debug;

type Patch<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Everything a pass wants to change in a status.
///
/// Built up while the pass runs, then consumed exactly once by [`commit`].
pub struct StatusDelta<S> {
    phase: Option<Phase>,
    message: Option<Option<String>>,
    url: Option<Option<String>>,
    observed_generation: Option<i64>,
    conditions: Vec<ApplicationCondition>,
    removed: Vec<String>,
    patches: Vec<Patch<S>>,
}

impl<S> Default for StatusDelta<S> {
    fn default() -> Self {
        Self {
            phase: None,
            message: None,
            url: None,
            observed_generation: None,
            conditions: vec![],
            removed: vec![],
            patches: vec![],
        }
    }
}

impl<S: ObservedStatus> StatusDelta<S> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&mut self, phase: Phase, message: impl Into<String>) {
        self.phase = Some(phase);
        self.message = Some(Some(message.into()));
    }

    pub fn url(&mut self, url: Option<String>) {
        self.url = Some(url);
    }

    pub fn observed_generation(&mut self, generation: i64) {
        self.observed_generation = Some(generation);
    }

    /// Later conditions of the same type win
    pub fn condition(&mut self, cond: ApplicationCondition) {
        self.conditions.retain(|c| c.condition_type != cond.condition_type);
        self.removed.retain(|t| *t != cond.condition_type);
        self.conditions.push(cond);
    }

    /// Kind specific field update, applied on the freshly read status
    pub fn patch(&mut self, f: impl FnOnce(&mut S) + Send + 'static) {
        self.patches.push(Box::new(f));
    }

    /// Drop a condition whose subject is no longer set on the object
    pub fn remove_condition(&mut self, condition_type: &str) {
        self.conditions.retain(|c| c.condition_type != condition_type);
        if !self.removed.iter().any(|t| t == condition_type) {
            self.removed.push(condition_type.to_string());
        }
    }

    /// Whether the delta already sets a condition of this type
    pub fn carries(&self, condition_type: &str) -> bool {
        self.conditions.iter().any(|c| c.condition_type == condition_type)
    }

    pub fn is_empty(&self) -> bool {
        self.phase.is_none()
            && self.message.is_none()
            && self.url.is_none()
            && self.observed_generation.is_none()
            && self.conditions.is_empty()
            && self.removed.is_empty()
            && self.patches.is_empty()
    }

    fn apply(self, status: &mut S) {
        if let Some(phase) = self.phase {
            status.set_phase(phase);
        }
        if let Some(message) = self.message {
            status.set_message(message);
        }
        if let Some(url) = self.url {
            status.set_url(url);
        }
        if let Some(generation) = self.observed_generation {
            status.set_observed_generation(generation);
        }
        status.conditions_mut().retain(|c| !self.removed.contains(&c.condition_type));
        for cond in self.conditions {
            set_condition(status.conditions_mut(), cond);
        }
        for patch in self.patches {
            patch(status);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Committed {
    /// Nothing to write, the object was not even read
    Skipped,
    /// The merged status equals the stored one
    Unchanged,
    Written,
    /// The object disappeared in the meantime
    Gone,
}

/// Merge `delta` over the latest stored status and write it in a single request.
///
/// A conflict is returned as is, the caller retries the whole pass.
pub async fn commit<P: Platform, K: StatusResource>(
    platform: &P,
    ns: &str,
    name: &str,
    delta: StatusDelta<K::Status>,
) -> Result<Committed> {
    if delta.is_empty() {
        return Ok(Committed::Skipped);
    }
    let Some(mut latest) = platform.get::<K>(ns, name).await? else {
        debug!("{} {ns}/{name} is gone, dropping its status update", K::kind(&()));
        return Ok(Committed::Gone);
    };
    let fresh = latest.current_status().cloned().unwrap_or_default();
    let mut merged = fresh.clone();
    delta.apply(&mut merged);
    if merged == fresh {
        return Ok(Committed::Unchanged);
    }
    *latest.status_slot() = Some(merged);
    platform.replace_status(ns, &latest).await?;
    Ok(Committed::Written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{
        Error,
        conditions::{GROUP_REF_VALIDATED, READY},
        k8smock::{MockPlatform, Verb},
        virtualserver::{VirtualMcpServer, VirtualMcpServerSpec, VirtualMcpServerStatus},
    };

    fn seed(mock: &MockPlatform) {
        let mut vmcp = VirtualMcpServer::new("agg", VirtualMcpServerSpec {
            group_ref: "team".to_string(),
            ..VirtualMcpServerSpec::default()
        });
        vmcp.status = Some(VirtualMcpServerStatus {
            backend_count: 3,
            ..VirtualMcpServerStatus::default()
        });
        mock.seed("ns", vmcp).unwrap();
    }

    fn delta() -> StatusDelta<VirtualMcpServerStatus> {
        let mut d = StatusDelta::new();
        d.phase(Phase::Ready, "Virtual MCP server is running");
        d.observed_generation(1);
        d.condition(ApplicationCondition::ok(READY, "DeploymentReady", "ok", 1));
        d
    }

    #[tokio::test]
    async fn test_empty_delta_touches_nothing() {
        let mock = MockPlatform::new();
        let res = commit::<_, VirtualMcpServer>(&mock, "ns", "agg", StatusDelta::new())
            .await
            .unwrap();
        assert_eq!(res, Committed::Skipped);
        assert_eq!(mock.write_count(), 0);
    }

    #[tokio::test]
    async fn test_commit_is_idempotent_and_keeps_foreign_fields() {
        let mock = MockPlatform::new();
        seed(&mock);
        let first = commit::<_, VirtualMcpServer>(&mock, "ns", "agg", delta()).await.unwrap();
        assert_eq!(first, Committed::Written);
        let second = commit::<_, VirtualMcpServer>(&mock, "ns", "agg", delta()).await.unwrap();
        assert_eq!(second, Committed::Unchanged);
        assert_eq!(mock.count(Verb::ReplaceStatus), 1);

        let stored = mock.fetch::<VirtualMcpServer>("ns", "agg").unwrap().status.unwrap();
        assert_eq!(stored.phase, Some(Phase::Ready));
        assert_eq!(stored.observed_generation, Some(1));
        // written by somebody else, not part of the delta
        assert_eq!(stored.backend_count, 3);
    }

    #[tokio::test]
    async fn test_conflict_writes_nothing() {
        let mock = MockPlatform::new();
        seed(&mock);
        mock.inject_conflict("VirtualMCPServer", 1);
        let mut d = delta();
        d.condition(ApplicationCondition::ko(GROUP_REF_VALIDATED, "GroupRefNotFound", "ko", 1));
        let err = commit::<_, VirtualMcpServer>(&mock, "ns", "agg", d).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        let stored = mock.fetch::<VirtualMcpServer>("ns", "agg").unwrap().status.unwrap();
        assert!(stored.conditions.is_empty());
        assert_eq!(stored.phase, None);

        // the retried pass goes through
        let res = commit::<_, VirtualMcpServer>(&mock, "ns", "agg", delta()).await.unwrap();
        assert_eq!(res, Committed::Written);
    }

    #[tokio::test]
    async fn test_gone_object() {
        let mock = MockPlatform::new();
        let res = commit::<_, VirtualMcpServer>(&mock, "ns", "agg", delta()).await.unwrap();
        assert_eq!(res, Committed::Gone);
    }

    #[tokio::test]
    async fn test_removed_condition_disappears() {
        let mock = MockPlatform::new();
        seed(&mock);
        let mut d = delta();
        d.condition(ApplicationCondition::ko(GROUP_REF_VALIDATED, "GroupRefNotFound", "ko", 1));
        commit::<_, VirtualMcpServer>(&mock, "ns", "agg", d).await.unwrap();

        let mut d = StatusDelta::<VirtualMcpServerStatus>::new();
        d.remove_condition(GROUP_REF_VALIDATED);
        assert!(!d.is_empty());
        assert_eq!(
            commit::<_, VirtualMcpServer>(&mock, "ns", "agg", d).await.unwrap(),
            Committed::Written
        );
        let stored = mock.fetch::<VirtualMcpServer>("ns", "agg").unwrap().status.unwrap();
        assert!(stored.conditions.iter().all(|c| c.condition_type != GROUP_REF_VALIDATED));
        assert!(stored.conditions.iter().any(|c| c.condition_type == READY));

        // removing an absent condition writes nothing
        let mut d = StatusDelta::<VirtualMcpServerStatus>::new();
        d.remove_condition(GROUP_REF_VALIDATED);
        assert_eq!(
            commit::<_, VirtualMcpServer>(&mock, "ns", "agg", d).await.unwrap(),
            Committed::Unchanged
        );
    }

    #[tokio::test]
    async fn test_patches_run_on_the_fresh_status() {
        let mock = MockPlatform::new();
        seed(&mock);
        let mut d = StatusDelta::<VirtualMcpServerStatus>::new();
        d.patch(|s| s.backend_count += 1);
        commit::<_, VirtualMcpServer>(&mock, "ns", "agg", d).await.unwrap();
        let stored = mock.fetch::<VirtualMcpServer>("ns", "agg").unwrap().status.unwrap();
        assert_eq!(stored.backend_count, 4);
    }
}
