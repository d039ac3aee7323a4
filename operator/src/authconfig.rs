use crate::{
    Metrics,
    committer::StatusDelta,
    driver::{Reconciler, Step, Verdict, generation},
    manager::Context,
    metrics::ReconcileMetrics,
    toolconfig::{block_deletion, referencing},
};
use async_trait::async_trait;
use common::{
    Result,
    authconfig::{AUTHCONFIG_FINALIZER, McpExternalAuthConfig, McpExternalAuthConfigStatus},
    conditions::{ApplicationCondition, READY},
    hasheshandlers::{config_hash, short_hash},
    platform::Platform,
};
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::debug;

/// Hash of `.spec`, folded with the content of every referenced secret.
///
/// A rotated secret changes the hash, which rolls the workloads using it.
async fn effective_hash<P: Platform>(auth: &McpExternalAuthConfig, ctx: &Context<P>) -> Result<String> {
    let spec_hash = config_hash(&auth.spec)?;
    let refs = auth.spec.secret_refs();
    if refs.is_empty() {
        return Ok(spec_hash);
    }
    let ns = auth.namespace().unwrap_or_default();
    let mut parts = vec![spec_hash];
    for r in refs {
        let value = ctx
            .platform
            .get::<Secret>(&ns, &r.name)
            .await?
            .and_then(|s| s.data)
            .and_then(|mut d| d.remove(&r.key));
        parts.push(match value {
            Some(v) => format!("{}/{}={}", r.name, r.key, short_hash(&String::from_utf8_lossy(&v.0))),
            None => {
                debug!("Secret key {}/{} not found for {}", r.name, r.key, auth.name_any());
                format!("{}-not-found", r.name)
            }
        });
    }
    Ok(short_hash(&parts.join("\n")))
}

async fn referrers<P: Platform>(auth: &McpExternalAuthConfig, ctx: &Context<P>) -> Result<Vec<String>> {
    let name = auth.name_any();
    referencing(&ctx.platform, &auth.namespace().unwrap_or_default(), |m| {
        m.external_auth_config() == Some(name.as_str())
    })
    .await
}

#[async_trait]
impl<P: Platform> Reconciler<P> for McpExternalAuthConfig {
    fn finalizer() -> Option<&'static str> {
        Some(AUTHCONFIG_FINALIZER)
    }

    async fn validate(&self, _ctx: &Context<P>, delta: &mut StatusDelta<McpExternalAuthConfigStatus>) -> Result<Verdict> {
        if let Err(msg) = self.spec.validate() {
            delta.condition(ApplicationCondition::ko(READY, "InvalidConfig", &msg, generation(self)));
            return Ok(Verdict::Invalid(msg));
        }
        Ok(Verdict::Valid)
    }

    async fn converge(&self, ctx: &Context<P>, delta: &mut StatusDelta<McpExternalAuthConfigStatus>) -> Result<Step> {
        let hash = effective_hash(self, ctx).await?;
        let servers = referrers(self, ctx).await?;
        delta.condition(ApplicationCondition::ok(
            READY,
            "ConfigHashed",
            &format!("Used by {} server(s)", servers.len()),
            generation(self),
        ));
        delta.patch(move |s: &mut McpExternalAuthConfigStatus| {
            s.config_hash = Some(hash);
            s.referencing_servers = servers;
        });
        Ok(Step::Continue)
    }

    async fn finalize(&self, ctx: &Context<P>) -> Result<Step> {
        let servers = referrers(self, ctx).await?;
        Ok(block_deletion(ctx, self, &servers).await)
    }

    fn metrics(metrics: &Metrics) -> &ReconcileMetrics {
        &metrics.auth_config
    }
}
