use crate::{
    Metrics,
    builders::embedding as build,
    committer::StatusDelta,
    discovery::{BackendCounts, decide_phase},
    driver::{Reconciler, Step, ensure, generation},
    manager::Context,
    metrics::ReconcileMetrics,
};
use async_trait::async_trait;
use common::{
    Phase, Result,
    conditions::{ApplicationCondition, READY},
    embedding::{EmbeddingServer, EmbeddingServerStatus},
    k8sworkload::{PodCounts, statefulset_ready_replicas},
    platform::Platform,
};
use k8s_openapi::api::{apps::v1::StatefulSet, core::v1::Pod};
use kube::ResourceExt;

#[async_trait]
impl<P: Platform> Reconciler<P> for EmbeddingServer {
    async fn converge(&self, ctx: &Context<P>, _delta: &mut StatusDelta<EmbeddingServerStatus>) -> Result<Step> {
        ensure(ctx, self, &build::statefulset_for(self, &ctx.settings.embedding_image)).await?;
        ensure(ctx, self, &build::service_for(self)).await?;
        Ok(Step::Continue)
    }

    async fn observe(&self, ctx: &Context<P>, delta: &mut StatusDelta<EmbeddingServerStatus>) -> Result<()> {
        let ns = self.namespace().unwrap_or_default();
        let pods: Vec<Pod> = ctx.platform.list(&ns, Some(&build::selector(self))).await?;
        let decision = decide_phase(PodCounts::from_pods(&pods), BackendCounts::default());
        let ready_replicas = ctx
            .platform
            .get::<StatefulSet>(&ns, &self.name_any())
            .await?
            .map(|sts| statefulset_ready_replicas(&sts))
            .unwrap_or_default();
        let r#gen = generation(self);
        delta.condition(if decision.phase == Phase::Ready {
            ApplicationCondition::ok(READY, decision.reason, &decision.message, r#gen)
        } else {
            ApplicationCondition::ko(READY, decision.reason, &decision.message, r#gen)
        });
        delta.phase(decision.phase, decision.message);
        delta.url(Some(build::url(self)));
        delta.patch(move |s: &mut EmbeddingServerStatus| s.ready_replicas = ready_replicas);
        Ok(())
    }

    fn metrics(metrics: &Metrics) -> &ReconcileMetrics {
        &metrics.embedding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Settings,
        driver::{Outcome, drive},
    };
    use common::{httpmock::HealthProbeMock, k8smock::MockPlatform};
    use k8s_openapi::api::{apps::v1::StatefulSetStatus, core::v1::Service};
    use serde_json::json;
    use std::sync::Arc;

    fn embedding() -> EmbeddingServer {
        serde_json::from_value(json!({
            "apiVersion": "mcphive.io/v1alpha1",
            "kind": "EmbeddingServer",
            "metadata": {"name": "bge"},
            "spec": {"model": "BAAI/bge-small-en-v1.5", "replicas": 2}
        }))
        .unwrap()
    }

    fn status(platform: &MockPlatform) -> EmbeddingServerStatus {
        platform
            .fetch::<EmbeddingServer>("default", "bge")
            .and_then(|e| e.status)
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_statefulset_service_and_replicas() {
        let platform = MockPlatform::new();
        platform.seed("default", embedding()).unwrap();
        let ctx = Context::new(platform.clone(), Arc::new(HealthProbeMock::new()), Settings::default());

        let outcome = drive::<MockPlatform, EmbeddingServer>(&ctx, "default", "bge").await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert!(platform.fetch::<Service>("default", "embedding-bge").is_some());
        let st = status(&platform);
        assert_eq!(st.phase, Some(Phase::Pending));
        assert_eq!(st.ready_replicas, 0);
        assert_eq!(st.url.as_deref(), Some("http://embedding-bge.default.svc.cluster.local:8080"));

        // the StatefulSet controller reports its pods
        let mut sts = platform.fetch::<StatefulSet>("default", "bge").unwrap();
        sts.status = Some(StatefulSetStatus {
            ready_replicas: Some(2),
            replicas: 2,
            ..StatefulSetStatus::default()
        });
        platform.seed("default", sts).unwrap();
        for i in 0..2 {
            let pod: Pod = serde_json::from_value(json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": format!("bge-{i}"), "labels": build::selector(&embedding())},
                "status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]}
            }))
            .unwrap();
            platform.seed("default", pod).unwrap();
        }

        platform.reset_log();
        drive::<MockPlatform, EmbeddingServer>(&ctx, "default", "bge").await.unwrap();
        let st = status(&platform);
        assert_eq!(st.phase, Some(Phase::Ready));
        assert_eq!(st.ready_replicas, 2);
        // the live replicas are left alone
        assert_eq!(platform.write_count(), 1);
    }
}
