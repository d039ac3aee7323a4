use crate::{
    Metrics,
    committer::StatusDelta,
    driver::{Reconciler, Step, Verdict},
    manager::Context,
    metrics::ReconcileMetrics,
    runner,
};
use async_trait::async_trait;
use common::{
    Result,
    platform::Platform,
    remoteproxy::{McpRemoteProxy, McpRemoteProxyStatus},
};

/// Only plain http(s) endpoints with a host can be proxied
fn check_remote_url(url: &str) -> Result<(), String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| format!("remoteURL {url} must use the http or https scheme"))?;
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if host.is_empty() {
        return Err(format!("remoteURL {url} has no host"));
    }
    Ok(())
}

#[async_trait]
impl<P: Platform> Reconciler<P> for McpRemoteProxy {
    async fn validate(&self, ctx: &Context<P>, delta: &mut StatusDelta<McpRemoteProxyStatus>) -> Result<Verdict> {
        if let Err(msg) = check_remote_url(&self.spec.remote_url) {
            return Ok(Verdict::Invalid(msg));
        }
        runner::validate_refs(self, ctx, delta).await
    }

    async fn converge(&self, ctx: &Context<P>, delta: &mut StatusDelta<McpRemoteProxyStatus>) -> Result<Step> {
        runner::converge(self, ctx, delta).await
    }

    async fn observe(&self, ctx: &Context<P>, delta: &mut StatusDelta<McpRemoteProxyStatus>) -> Result<()> {
        runner::observe(self, ctx, delta).await
    }

    fn metrics(metrics: &Metrics) -> &ReconcileMetrics {
        &metrics.remote_proxy
    }
}
