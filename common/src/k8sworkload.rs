use crate::{Error, Result};
use k8s_openapi::api::{
    apps::v1::StatefulSet,
    core::v1::{Pod, PodTemplateSpec},
};

/// Pods of a workload grouped by readiness
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PodCounts {
    pub ready: usize,
    pub pending: usize,
    pub failed: usize,
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

fn is_pod_failed(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|p| p == "Failed")
}

impl PodCounts {
    /// Failed pods first, then the `Ready` condition decides, a Running pod that did not
    /// pass its readiness probe yet is still pending
    pub fn from_pods(pods: &[Pod]) -> Self {
        pods.iter().fold(PodCounts::default(), |mut acc, pod| {
            if is_pod_failed(pod) {
                acc.failed += 1;
            } else if is_pod_ready(pod) {
                acc.ready += 1;
            } else {
                acc.pending += 1;
            }
            acc
        })
    }
}

pub fn statefulset_ready_replicas(sts: &StatefulSet) -> i32 {
    sts.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0)
}

/// A user supplied pod template must at least deserialize as a `PodTemplateSpec`
pub fn parse_pod_template(raw: &serde_json::Value) -> Result<PodTemplateSpec> {
    serde_json::from_value(raw.clone())
        .map_err(|e| Error::Validation(format!("failed to parse podTemplateSpec: {e}")))
}
