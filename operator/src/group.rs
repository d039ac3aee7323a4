use crate::{
    Metrics,
    committer::{StatusDelta, commit},
    discovery::{Member, group_members},
    driver::{Reconciler, Step, generation},
    manager::Context,
    metrics::ReconcileMetrics,
};
use async_trait::async_trait;
use common::{
    Phase, Result,
    conditions::{ApplicationCondition, GROUP_REF_VALIDATED, SERVERS_CHECKED},
    group::{GROUP_FINALIZER, McpGroup, McpGroupStatus},
    mcpserver::McpServer,
    platform::Platform,
    remoteproxy::McpRemoteProxy,
};
use kube::ResourceExt;
use tracing::info;

fn count(names: &[String]) -> i32 {
    i32::try_from(names.len()).unwrap_or(i32::MAX)
}

#[async_trait]
impl<P: Platform> Reconciler<P> for McpGroup {
    fn finalizer() -> Option<&'static str> {
        Some(GROUP_FINALIZER)
    }

    async fn converge(&self, ctx: &Context<P>, delta: &mut StatusDelta<McpGroupStatus>) -> Result<Step> {
        let ns = self.namespace().unwrap_or_default();
        let members = group_members(&ctx.platform, &ns, &self.name_any()).await?;
        let (mut servers, mut proxies) = (vec![], vec![]);
        for member in members {
            match member {
                Member::Server(s) => servers.push(s.name_any()),
                Member::Proxy(p) => proxies.push(p.name_any()),
            }
        }
        servers.sort();
        proxies.sort();
        delta.condition(ApplicationCondition::ok(
            SERVERS_CHECKED,
            "ListMCPServersSucceeded",
            &format!("Found {} MCPServer(s) and {} MCPRemoteProxy(ies)", servers.len(), proxies.len()),
            generation(self),
        ));
        delta.phase(Phase::Ready, "Group is ready");
        delta.patch(move |s: &mut McpGroupStatus| {
            s.server_count = count(&servers);
            s.remote_proxy_count = count(&proxies);
            s.servers = servers;
            s.remote_proxies = proxies;
        });
        Ok(Step::Continue)
    }

    /// Every member loses its group reference before the group goes away
    async fn finalize(&self, ctx: &Context<P>) -> Result<Step> {
        let ns = self.namespace().unwrap_or_default();
        let name = self.name_any();
        let members = group_members(&ctx.platform, &ns, &name).await?;
        let orphaned = |r#gen: i64| {
            ApplicationCondition::ko(
                GROUP_REF_VALIDATED,
                "GroupRefNotFound",
                &format!("MCPGroup {name} is being deleted"),
                r#gen,
            )
        };
        for member in members {
            info!("MCPGroup {ns}/{name} is going away, flagging {}", member.name());
            match member {
                Member::Server(s) => {
                    let mut delta = StatusDelta::new();
                    delta.condition(orphaned(generation(&s)));
                    commit::<P, McpServer>(&ctx.platform, &ns, &s.name_any(), delta).await?;
                }
                Member::Proxy(p) => {
                    let mut delta = StatusDelta::new();
                    delta.condition(orphaned(generation(&p)));
                    commit::<P, McpRemoteProxy>(&ctx.platform, &ns, &p.name_any(), delta).await?;
                }
            }
        }
        Ok(Step::Continue)
    }

    fn metrics(metrics: &Metrics) -> &ReconcileMetrics {
        &metrics.group
    }
}
