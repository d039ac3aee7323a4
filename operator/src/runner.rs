//! Reconciliation shared by the kinds running behind a proxy runner
use crate::{
    builders::{
        rbac,
        runner::{self as build, Resolved, RunnerSource},
    },
    committer::StatusDelta,
    converge::fetch_checksum,
    driver::{Step, Verdict, ensure, generation, waiting_for},
    manager::Context,
};
use common::{
    Result,
    authconfig::McpExternalAuthConfig,
    conditions::{ApplicationCondition, EXTERNAL_AUTH_CONFIG_VALIDATED, GROUP_REF_VALIDATED, READY, TOOL_CONFIG_VALIDATED},
    group::McpGroup,
    hasheshandlers::config_hash,
    k8sworkload::PodCounts,
    mcpserver::McpServerStatus,
    platform::Platform,
    remoteproxy::McpRemoteProxyStatus,
    status::ObservedStatus,
    toolconfig::McpToolConfig,
};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::discovery::{BackendCounts, decide_phase};

/// Status fields only the runner kinds carry
pub trait RunnerStatus: ObservedStatus {
    fn set_config_hashes(&mut self, tool_config: Option<String>, external_auth_config: Option<String>);
}

impl RunnerStatus for McpServerStatus {
    fn set_config_hashes(&mut self, tool_config: Option<String>, external_auth_config: Option<String>) {
        self.tool_config_hash = tool_config;
        self.external_auth_config_hash = external_auth_config;
    }
}

impl RunnerStatus for McpRemoteProxyStatus {
    fn set_config_hashes(&mut self, tool_config: Option<String>, external_auth_config: Option<String>) {
        self.tool_config_hash = tool_config;
        self.external_auth_config_hash = external_auth_config;
    }
}

/// Referenced tool and auth configurations must exist, a group is only reported on
pub async fn validate_refs<P: Platform, K: RunnerSource>(
    obj: &K,
    ctx: &Context<P>,
    delta: &mut StatusDelta<K::Status>,
) -> Result<Verdict> {
    let ns = obj.namespace().unwrap_or_default();
    let r#gen = generation(obj);
    if let Some(name) = obj.tool_config() {
        if ctx.platform.get::<McpToolConfig>(&ns, name).await?.is_none() {
            let msg = format!("MCPToolConfig {name} not found");
            delta.condition(ApplicationCondition::ko(TOOL_CONFIG_VALIDATED, "ToolConfigNotFound", &msg, r#gen));
            return Ok(Verdict::Invalid(msg));
        }
        delta.condition(ApplicationCondition::ok(
            TOOL_CONFIG_VALIDATED,
            "ToolConfigFound",
            &format!("MCPToolConfig {name} is valid"),
            r#gen,
        ));
    } else {
        delta.remove_condition(TOOL_CONFIG_VALIDATED);
    }
    if let Some(name) = obj.external_auth_config() {
        let Some(auth) = ctx.platform.get::<McpExternalAuthConfig>(&ns, name).await? else {
            let msg = format!("MCPExternalAuthConfig {name} not found");
            delta.condition(ApplicationCondition::ko(
                EXTERNAL_AUTH_CONFIG_VALIDATED,
                "ExternalAuthConfigNotFound",
                &msg,
                r#gen,
            ));
            return Ok(Verdict::Invalid(msg));
        };
        if let Err(e) = auth.spec.validate() {
            let msg = format!("MCPExternalAuthConfig {name} is invalid: {e}");
            delta.condition(ApplicationCondition::ko(
                EXTERNAL_AUTH_CONFIG_VALIDATED,
                "ExternalAuthConfigInvalid",
                &msg,
                r#gen,
            ));
            return Ok(Verdict::Invalid(msg));
        }
        delta.condition(ApplicationCondition::ok(
            EXTERNAL_AUTH_CONFIG_VALIDATED,
            "ExternalAuthConfigFound",
            &format!("MCPExternalAuthConfig {name} is valid"),
            r#gen,
        ));
    } else {
        delta.remove_condition(EXTERNAL_AUTH_CONFIG_VALIDATED);
    }
    if let Some(group) = obj.group() {
        let cond = match ctx.platform.get::<McpGroup>(&ns, group).await? {
            None => ApplicationCondition::ko(
                GROUP_REF_VALIDATED,
                "GroupRefNotFound",
                &format!("MCPGroup {group} not found"),
                r#gen,
            ),
            Some(g) if !g.is_ready() => ApplicationCondition::ko(
                GROUP_REF_VALIDATED,
                "GroupRefNotReady",
                &format!("MCPGroup {group} is not ready"),
                r#gen,
            ),
            Some(_) => ApplicationCondition::ok(
                GROUP_REF_VALIDATED,
                "GroupRefValidated",
                &format!("MCPGroup {group} is ready"),
                r#gen,
            ),
        };
        delta.condition(cond);
    } else {
        delta.remove_condition(GROUP_REF_VALIDATED);
    }
    Ok(Verdict::Valid)
}

/// Resolve the referenced configurations along with the hashes reported in the status
async fn resolve<P: Platform, K: RunnerSource>(
    obj: &K,
    ctx: &Context<P>,
) -> Result<(Resolved, Option<String>, Option<String>)> {
    let ns = obj.namespace().unwrap_or_default();
    let mut resolved = Resolved::default();
    let mut tool_hash = None;
    let mut auth_hash = None;
    if let Some(name) = obj.tool_config() {
        if let Some(tool) = ctx.platform.get::<McpToolConfig>(&ns, name).await? {
            tool_hash = match tool.status.as_ref().and_then(|s| s.config_hash.clone()) {
                Some(h) => Some(h),
                None => Some(config_hash(&tool.spec)?),
            };
            resolved.tools_filter = tool.spec.tools_filter;
            resolved.tools_override = tool.spec.tools_override;
        }
    }
    if let Some(name) = obj.external_auth_config() {
        if let Some(auth) = ctx.platform.get::<McpExternalAuthConfig>(&ns, name).await? {
            auth_hash = match auth.status.as_ref().and_then(|s| s.config_hash.clone()) {
                Some(h) => Some(h),
                None => Some(config_hash(&auth.spec)?),
            };
            resolved.external_auth = Some(auth.spec);
        }
    }
    Ok((resolved, tool_hash, auth_hash))
}

/// RBAC, run configuration, Deployment then Service
pub async fn converge<P: Platform, K>(obj: &K, ctx: &Context<P>, delta: &mut StatusDelta<K::Status>) -> Result<Step>
where
    K: RunnerSource,
    K::Status: RunnerStatus,
{
    let ns = obj.namespace().unwrap_or_default();
    if obj.service_account().is_none() {
        let rbac = rbac::build(obj, &obj.rbac_name(), &build::labels(obj), rbac::runner_rules());
        ensure(ctx, obj, &rbac.service_account).await?;
        ensure(ctx, obj, &rbac.role).await?;
        ensure(ctx, obj, &rbac.binding).await?;
    }

    let (resolved, tool_hash, auth_hash) = resolve(obj, ctx).await?;
    delta.patch(move |s: &mut K::Status| s.set_config_hashes(tool_hash, auth_hash));
    ensure(ctx, obj, &build::config_map(obj, &resolved)?).await?;

    let configmap = build::config_name(&obj.name_any());
    let Some(checksum) = fetch_checksum(&ctx.platform, &ns, &configmap).await? else {
        return Ok(waiting_for(delta, &configmap));
    };
    ensure(
        ctx,
        obj,
        &build::deployment_for(obj, &ctx.settings.proxy_runner_image, &checksum)?,
    )
    .await?;
    ensure(ctx, obj, &build::service_for(obj)).await?;
    Ok(Step::Continue)
}

/// Phase from the runner pods, a runner has no backend of its own
pub async fn observe<P: Platform, K: RunnerSource>(
    obj: &K,
    ctx: &Context<P>,
    delta: &mut StatusDelta<K::Status>,
) -> Result<()> {
    let ns = obj.namespace().unwrap_or_default();
    let pods: Vec<Pod> = ctx.platform.list(&ns, Some(&build::selector(obj))).await?;
    let decision = decide_phase(PodCounts::from_pods(&pods), BackendCounts::default());
    let r#gen = generation(obj);
    delta.condition(if decision.phase == common::Phase::Ready {
        ApplicationCondition::ok(READY, decision.reason, &decision.message, r#gen)
    } else {
        ApplicationCondition::ko(READY, decision.reason, &decision.message, r#gen)
    });
    delta.phase(decision.phase, decision.message);
    delta.url(Some(build::url(obj)));
    Ok(())
}
