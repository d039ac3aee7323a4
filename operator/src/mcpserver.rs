use crate::{
    Metrics,
    committer::StatusDelta,
    driver::{Reconciler, Step, Verdict, generation, validate_pod_template},
    manager::Context,
    metrics::ReconcileMetrics,
    runner,
};
use async_trait::async_trait;
use common::{
    Result,
    mcpserver::{McpServer, McpServerStatus},
    platform::Platform,
};

#[async_trait]
impl<P: Platform> Reconciler<P> for McpServer {
    async fn validate(&self, ctx: &Context<P>, delta: &mut StatusDelta<McpServerStatus>) -> Result<Verdict> {
        let verdict = validate_pod_template(self.spec.pod_template_spec.as_ref(), generation(self), delta);
        if verdict != Verdict::Valid {
            return Ok(verdict);
        }
        runner::validate_refs(self, ctx, delta).await
    }

    async fn converge(&self, ctx: &Context<P>, delta: &mut StatusDelta<McpServerStatus>) -> Result<Step> {
        runner::converge(self, ctx, delta).await
    }

    async fn observe(&self, ctx: &Context<P>, delta: &mut StatusDelta<McpServerStatus>) -> Result<()> {
        runner::observe(self, ctx, delta).await
    }

    fn metrics(metrics: &Metrics) -> &ReconcileMetrics {
        &metrics.server
    }
}
