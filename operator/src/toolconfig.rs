use crate::{
    Metrics,
    committer::StatusDelta,
    discovery::{Member, members},
    driver::{Reconciler, Step, generation, publish},
    events,
    manager::Context,
    metrics::ReconcileMetrics,
};
use async_trait::async_trait;
use common::{
    Result,
    conditions::{ApplicationCondition, READY},
    hasheshandlers::config_hash,
    platform::{Managed, Platform},
    toolconfig::{McpToolConfig, McpToolConfigStatus, TOOLCONFIG_FINALIZER},
};
use kube::ResourceExt;
use std::time::Duration;
use tracing::warn;

/// Delay before trying again to delete a configuration still in use
pub static DELETION_BACKOFF: Duration = Duration::from_secs(30);

/// Sorted names of the servers and proxies for which `uses` holds
pub async fn referencing<P: Platform>(platform: &P, ns: &str, uses: impl Fn(&Member) -> bool) -> Result<Vec<String>> {
    let mut names: Vec<String> = members(platform, ns)
        .await?
        .into_iter()
        .filter(|m| uses(m))
        .map(|m| m.name())
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}

/// Keep the object while `referrers` is not empty
pub async fn block_deletion<P: Platform, K: Managed>(
    ctx: &Context<P>,
    obj: &K,
    referrers: &[String],
) -> Step {
    if referrers.is_empty() {
        return Step::Continue;
    }
    warn!(
        "{} {} is still referenced by {}",
        K::kind(&()),
        obj.name_any(),
        referrers.join(", ")
    );
    publish(ctx, obj, events::deletion_blocked(&K::kind(&()), &obj.name_any(), referrers)).await;
    Step::Requeue(DELETION_BACKOFF)
}

async fn referrers<P: Platform>(tool: &McpToolConfig, ctx: &Context<P>) -> Result<Vec<String>> {
    let name = tool.name_any();
    referencing(&ctx.platform, &tool.namespace().unwrap_or_default(), |m| {
        m.tool_config() == Some(name.as_str())
    })
    .await
}

#[async_trait]
impl<P: Platform> Reconciler<P> for McpToolConfig {
    fn finalizer() -> Option<&'static str> {
        Some(TOOLCONFIG_FINALIZER)
    }

    async fn converge(&self, ctx: &Context<P>, delta: &mut StatusDelta<McpToolConfigStatus>) -> Result<Step> {
        let hash = config_hash(&self.spec)?;
        let servers = referrers(self, ctx).await?;
        delta.condition(ApplicationCondition::ok(
            READY,
            "ConfigHashed",
            &format!("Used by {} server(s)", servers.len()),
            generation(self),
        ));
        delta.patch(move |s: &mut McpToolConfigStatus| {
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
        &metrics.tool_config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Settings,
        driver::{Outcome, drive},
    };
    use common::{
        httpmock::HealthProbeMock, k8smock::MockPlatform, mcpserver::McpServer, toolconfig::McpToolConfigSpec,
    };
    use kube::runtime::events::EventType;
    use serde_json::json;
    use std::sync::Arc;

    fn server(name: &str, tool: &str) -> McpServer {
        serde_json::from_value(json!({
            "apiVersion": "mcphive.io/v1alpha1",
            "kind": "MCPServer",
            "metadata": {"name": name},
            "spec": {"image": "img", "toolConfigRef": {"name": tool}}
        }))
        .unwrap()
    }

    fn seeded() -> MockPlatform {
        let platform = MockPlatform::new();
        let spec = McpToolConfigSpec {
            tools_filter: vec!["fetch".to_string()],
            ..McpToolConfigSpec::default()
        };
        platform.seed("default", McpToolConfig::new("filter", spec)).unwrap();
        platform.seed("default", server("web", "filter")).unwrap();
        platform.seed("default", server("api", "filter")).unwrap();
        platform.seed("default", server("other", "another")).unwrap();
        platform
    }

    #[tokio::test]
    async fn test_hash_and_referencing_servers() {
        let platform = seeded();
        let ctx = Context::new(platform.clone(), Arc::new(HealthProbeMock::new()), Settings::default());
        drive::<MockPlatform, McpToolConfig>(&ctx, "default", "filter").await.unwrap();

        let tool = platform.fetch::<McpToolConfig>("default", "filter").unwrap();
        let st = tool.status.clone().unwrap();
        assert_eq!(st.config_hash, Some(config_hash(&tool.spec).unwrap()));
        assert_eq!(st.referencing_servers, vec!["api", "web"]);
        assert_eq!(st.observed_generation, Some(1));

        platform.reset_log();
        drive::<MockPlatform, McpToolConfig>(&ctx, "default", "filter").await.unwrap();
        assert_eq!(platform.write_count(), 0);
    }

    #[tokio::test]
    async fn test_deletion_is_blocked_while_referenced() {
        let platform = seeded();
        let ctx = Context::new(platform.clone(), Arc::new(HealthProbeMock::new()), Settings::default());
        drive::<MockPlatform, McpToolConfig>(&ctx, "default", "filter").await.unwrap();
        platform.delete::<McpToolConfig>("default", "filter").unwrap();

        let outcome = drive::<MockPlatform, McpToolConfig>(&ctx, "default", "filter").await.unwrap();
        assert_eq!(outcome, Outcome::Requeue(DELETION_BACKOFF));
        assert!(platform.fetch::<McpToolConfig>("default", "filter").is_some());
        let blocked = platform.events().into_iter().find(|e| e.reason == "DeletionBlocked").unwrap();
        assert_eq!(blocked.type_, EventType::Warning);
        assert!(blocked.note.unwrap_or_default().contains("api, web"));

        for name in ["web", "api"] {
            let mut srv = platform.fetch::<McpServer>("default", name).unwrap();
            srv.spec.tool_config_ref = None;
            platform.seed("default", srv).unwrap();
        }
        let outcome = drive::<MockPlatform, McpToolConfig>(&ctx, "default", "filter").await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert!(platform.fetch::<McpToolConfig>("default", "filter").is_none());
    }
}
