use crate::{
    Metrics,
    builders::{rbac, vmcp},
    committer::StatusDelta,
    converge::fetch_checksum,
    discovery::{BackendCounts, decide_phase, discover, group_members},
    driver::{Reconciler, Step, Verdict, ensure, generation, validate_pod_template, waiting_for},
    manager::Context,
    metrics::ReconcileMetrics,
};
use async_trait::async_trait;
use common::{
    Phase, Result,
    authconfig::McpExternalAuthConfig,
    compositetool::VirtualMcpCompositeToolDefinition,
    conditions::{
        AUTH_CONFIGURED, ApplicationCondition, BACKENDS_DISCOVERED, COMPOSITE_TOOL_REFS_VALIDATED,
        GROUP_REF_VALIDATED, READY, TOOL_CONFIG_VALIDATED,
    },
    group::McpGroup,
    k8sworkload::PodCounts,
    platform::Platform,
    toolconfig::McpToolConfig,
    virtualserver::{VirtualMcpServer, VirtualMcpServerStatus},
};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::{collections::BTreeSet, time::Duration};
use tracing::debug;

/// Delay before checking again a group that is not ready
pub static GROUP_BACKOFF: Duration = Duration::from_secs(10);

type Delta = StatusDelta<VirtualMcpServerStatus>;

fn ns(obj: &VirtualMcpServer) -> String {
    obj.namespace().unwrap_or_default()
}

async fn validate_group<P: Platform>(obj: &VirtualMcpServer, ctx: &Context<P>, delta: &mut Delta) -> Result<Verdict> {
    let group = &obj.spec.group_ref;
    let r#gen = generation(obj);
    match ctx.platform.get::<McpGroup>(&ns(obj), group).await? {
        None => {
            let msg = format!("MCPGroup {group} not found");
            delta.condition(ApplicationCondition::ko(GROUP_REF_VALIDATED, "GroupRefNotFound", &msg, r#gen));
            Ok(Verdict::Invalid(msg))
        }
        Some(g) if !g.is_ready() => {
            let msg = format!("MCPGroup {group} is not ready");
            delta.condition(ApplicationCondition::ko(GROUP_REF_VALIDATED, "GroupRefNotReady", &msg, r#gen));
            delta.phase(Phase::Pending, msg);
            Ok(Verdict::Wait(GROUP_BACKOFF))
        }
        Some(_) => {
            delta.condition(ApplicationCondition::ok(
                GROUP_REF_VALIDATED,
                "GroupRefValidated",
                &format!("MCPGroup {group} is ready"),
                r#gen,
            ));
            Ok(Verdict::Valid)
        }
    }
}

async fn validate_tool_configs<P: Platform>(obj: &VirtualMcpServer, ctx: &Context<P>, delta: &mut Delta) -> Result<Verdict> {
    let names = obj.tool_configs();
    if names.is_empty() {
        delta.remove_condition(TOOL_CONFIG_VALIDATED);
        return Ok(Verdict::Valid);
    }
    let r#gen = generation(obj);
    for name in names {
        if ctx.platform.get::<McpToolConfig>(&ns(obj), name).await?.is_none() {
            let msg = format!("MCPToolConfig {name} not found");
            delta.condition(ApplicationCondition::ko(TOOL_CONFIG_VALIDATED, "ToolConfigNotFound", &msg, r#gen));
            return Ok(Verdict::Invalid(msg));
        }
    }
    delta.condition(ApplicationCondition::ok(
        TOOL_CONFIG_VALIDATED,
        "ToolConfigsFound",
        "All referenced MCPToolConfigs exist",
        r#gen,
    ));
    Ok(Verdict::Valid)
}

async fn validate_composite_tools<P: Platform>(obj: &VirtualMcpServer, ctx: &Context<P>, delta: &mut Delta) -> Result<Verdict> {
    let names = obj.composite_tools();
    if names.is_empty() {
        delta.remove_condition(COMPOSITE_TOOL_REFS_VALIDATED);
        return Ok(Verdict::Valid);
    }
    let r#gen = generation(obj);
    for name in names {
        let found = ctx
            .platform
            .get::<VirtualMcpCompositeToolDefinition>(&ns(obj), name)
            .await?;
        let failure = match found {
            None => Some(("CompositeToolRefNotFound", format!("VirtualMCPCompositeToolDefinition {name} not found"))),
            Some(def) => def.spec.validate().err().map(|e| {
                (
                    "CompositeToolRefInvalid",
                    format!("VirtualMCPCompositeToolDefinition {name} is invalid: {e}"),
                )
            }),
        };
        if let Some((reason, msg)) = failure {
            delta.condition(ApplicationCondition::ko(COMPOSITE_TOOL_REFS_VALIDATED, reason, &msg, r#gen));
            return Ok(Verdict::Invalid(msg));
        }
    }
    delta.condition(ApplicationCondition::ok(
        COMPOSITE_TOOL_REFS_VALIDATED,
        "CompositeToolRefsValid",
        "All referenced composite tools are valid",
        r#gen,
    ));
    Ok(Verdict::Valid)
}

async fn resolve<P: Platform>(obj: &VirtualMcpServer, ctx: &Context<P>) -> Result<vmcp::Resolved> {
    let ns = ns(obj);
    let mut resolved = vmcp::Resolved::default();
    for name in obj.tool_configs() {
        if let Some(tool) = ctx.platform.get::<McpToolConfig>(&ns, name).await? {
            resolved
                .tool_configs
                .insert(name.to_string(), (tool.spec.tools_filter, tool.spec.tools_override));
        }
    }
    for name in obj.composite_tools() {
        if let Some(def) = ctx
            .platform
            .get::<VirtualMcpCompositeToolDefinition>(&ns, name)
            .await?
        {
            resolved.composite_tools.push(def);
        }
    }
    Ok(resolved)
}

/// Auth configurations named by the outgoing auth settings or by a member of the group
async fn referenced_auth_configs<P: Platform>(obj: &VirtualMcpServer, ctx: &Context<P>) -> Result<Vec<McpExternalAuthConfig>> {
    let ns = ns(obj);
    let members = group_members(&ctx.platform, &ns, &obj.spec.group_ref).await?;
    let wanted: BTreeSet<String> = obj
        .auth_configs()
        .into_iter()
        .map(str::to_string)
        .chain(members.iter().filter_map(|m| m.external_auth_config().map(str::to_string)))
        .collect();
    if wanted.is_empty() {
        return Ok(vec![]);
    }
    let all: Vec<McpExternalAuthConfig> = ctx.platform.list(&ns, None).await?;
    Ok(all.into_iter().filter(|c| wanted.contains(&c.name_any())).collect())
}

#[async_trait]
impl<P: Platform> Reconciler<P> for VirtualMcpServer {
    async fn validate(&self, ctx: &Context<P>, delta: &mut Delta) -> Result<Verdict> {
        let r#gen = generation(self);
        let verdict = validate_pod_template(self.spec.pod_template_spec.as_ref(), r#gen, delta);
        if verdict != Verdict::Valid {
            return Ok(verdict);
        }
        if let Err(msg) = self.validate_outgoing_auth() {
            delta.condition(ApplicationCondition::ko(AUTH_CONFIGURED, "InvalidOutgoingAuth", &msg, r#gen));
            return Ok(Verdict::Invalid(msg));
        }
        match validate_group(self, ctx, delta).await? {
            Verdict::Valid => {}
            other => return Ok(other),
        }
        match validate_tool_configs(self, ctx, delta).await? {
            Verdict::Valid => {}
            other => return Ok(other),
        }
        validate_composite_tools(self, ctx, delta).await
    }

    async fn converge(&self, ctx: &Context<P>, delta: &mut Delta) -> Result<Step> {
        let name = self.name_any();
        if self.spec.service_account.is_none() {
            let rbac = rbac::build(self, &vmcp::rbac_name(&name), &vmcp::labels(self), rbac::vmcp_rules());
            ensure(ctx, self, &rbac.service_account).await?;
            ensure(ctx, self, &rbac.role).await?;
            ensure(ctx, self, &rbac.binding).await?;
        }

        let resolved = resolve(self, ctx).await?;
        ensure(ctx, self, &vmcp::config_map(self, &resolved)?).await?;
        let configmap = vmcp::config_name(&name);
        let Some(checksum) = fetch_checksum(&ctx.platform, &ns(self), &configmap).await? else {
            return Ok(waiting_for(delta, &configmap));
        };

        let auth_configs = referenced_auth_configs(self, ctx).await?;
        ensure(
            ctx,
            self,
            &vmcp::deployment_for(self, &ctx.settings.vmcp_image, &checksum, &auth_configs)?,
        )
        .await?;
        ensure(ctx, self, &vmcp::service_for(self)).await?;
        Ok(Step::Continue)
    }

    async fn observe(&self, ctx: &Context<P>, delta: &mut Delta) -> Result<()> {
        let ns = ns(self);
        let r#gen = generation(self);
        let pods: Vec<Pod> = ctx.platform.list(&ns, Some(&vmcp::selector(self))).await?;
        let counts = PodCounts::from_pods(&pods);
        let found = discover(&ctx.platform, ctx.probe.as_ref(), self, &ns, counts).await?;
        let backends = BackendCounts::from_backends(&found.backends);
        let decision = decide_phase(counts, backends);
        debug!("{} backend(s), {} ready, phase {}", backends.total, backends.ready, decision.phase);

        delta.condition(if decision.phase == Phase::Ready {
            ApplicationCondition::ok(READY, decision.reason, &decision.message, r#gen)
        } else {
            ApplicationCondition::ko(READY, decision.reason, &decision.message, r#gen)
        });
        delta.condition(ApplicationCondition::ok(
            BACKENDS_DISCOVERED,
            "BackendsDiscovered",
            &format!("{} backend(s) discovered in group {}", backends.total, self.spec.group_ref),
            r#gen,
        ));
        delta.condition(if found.missing_auth.is_empty() {
            ApplicationCondition::ok(AUTH_CONFIGURED, "AuthConfigured", "Outgoing authentication is resolved", r#gen)
        } else {
            ApplicationCondition::ko(
                AUTH_CONFIGURED,
                "AuthConfigNotFound",
                &format!("MCPExternalAuthConfig not found: {}", found.missing_auth.join(", ")),
                r#gen,
            )
        });
        delta.phase(decision.phase, decision.message);
        delta.url(Some(vmcp::url(self)));
        let count = i32::try_from(backends.total).unwrap_or(i32::MAX);
        let discovered = found.backends;
        delta.patch(move |s: &mut VirtualMcpServerStatus| {
            s.discovered_backends = discovered;
            s.backend_count = count;
        });
        Ok(())
    }

    fn metrics(metrics: &Metrics) -> &ReconcileMetrics {
        &metrics.virtual_server
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Settings,
        driver::{CHECKSUM_BACKOFF, Outcome, drive},
    };
    use common::{
        Error,
        conditions::{POD_TEMPLATE_SPEC_VALID, find_condition},
        httpmock::HealthProbeMock,
        k8smock::{MockPlatform, Verb},
        mcpserver::McpServer,
        platform::Managed,
        virtualserver::BackendStatus,
    };
    use k8s_openapi::api::{
        apps::v1::Deployment,
        core::v1::{ConfigMap, ObjectReference, Service, ServiceAccount},
    };
    use kube::runtime::events::{Event, EventType};
    use serde_json::json;
    use std::{collections::BTreeMap, sync::Arc};

    fn from_json<K: Managed>(v: serde_json::Value) -> K {
        serde_json::from_value(v).unwrap()
    }

    fn group(phase: &str) -> McpGroup {
        from_json(json!({
            "apiVersion": "mcphive.io/v1alpha1",
            "kind": "MCPGroup",
            "metadata": {"name": "team"},
            "spec": {},
            "status": {"phase": phase}
        }))
    }

    fn server(name: &str) -> McpServer {
        from_json(json!({
            "apiVersion": "mcphive.io/v1alpha1",
            "kind": "MCPServer",
            "metadata": {"name": name},
            "spec": {"image": "ghcr.io/example/fetch", "groupRef": "team"},
            "status": {"phase": "Ready", "url": format!("http://mcp-{name}-proxy.default.svc.cluster.local:8080/mcp")}
        }))
    }

    fn aggregator(extra: serde_json::Value) -> VirtualMcpServer {
        let mut spec = json!({"groupRef": "team"});
        if let (Some(s), Some(e)) = (spec.as_object_mut(), extra.as_object()) {
            s.extend(e.clone());
        }
        from_json(json!({
            "apiVersion": "mcphive.io/v1alpha1",
            "kind": "VirtualMCPServer",
            "metadata": {"name": "agg"},
            "spec": spec
        }))
    }

    fn ready_pod() -> Pod {
        let mut labels = vmcp::selector(&aggregator(json!({})));
        labels.insert("pod-template-hash".to_string(), "abc".to_string());
        from_json(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "agg-abc", "labels": labels},
            "status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]}
        }))
    }

    fn context(platform: MockPlatform) -> (Context<MockPlatform>, Arc<HealthProbeMock>) {
        let probe = Arc::new(HealthProbeMock::new());
        (Context::new(platform, probe.clone(), Settings::default()), probe)
    }

    fn seeded(extra: serde_json::Value) -> MockPlatform {
        let platform = MockPlatform::new();
        platform.seed("default", group("Ready")).unwrap();
        platform.seed("default", server("fetch")).unwrap();
        platform.seed("default", aggregator(extra)).unwrap();
        platform
    }

    fn status(platform: &MockPlatform) -> VirtualMcpServerStatus {
        platform
            .fetch::<VirtualMcpServer>("default", "agg")
            .and_then(|v| v.status)
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_create_then_nothing_to_do() {
        let platform = seeded(json!({}));
        let (ctx, _) = context(platform.clone());

        let outcome = drive::<MockPlatform, VirtualMcpServer>(&ctx, "default", "agg").await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert!(platform.fetch::<ServiceAccount>("default", "agg-vmcp").is_some());
        assert!(platform.fetch::<ConfigMap>("default", "agg-vmcp-config").is_some());
        assert!(platform.fetch::<Deployment>("default", "agg").is_some());
        assert!(platform.fetch::<Service>("default", "vmcp-agg").is_some());
        let created = platform
            .events()
            .iter()
            .filter(|e| e.type_ == EventType::Normal && e.reason.ends_with("Created"))
            .count();
        assert_eq!(created, 6);

        let st = status(&platform);
        assert_eq!(st.phase, Some(Phase::Pending));
        assert_eq!(st.observed_generation, Some(1));
        assert_eq!(st.backend_count, 1);
        assert_eq!(st.url.as_deref(), Some("http://vmcp-agg.default.svc.cluster.local:4483"));
        assert!(find_condition(&st.conditions, BACKENDS_DISCOVERED).is_some_and(|c| c.is_true()));

        platform.reset_log();
        let again = drive::<MockPlatform, VirtualMcpServer>(&ctx, "default", "agg").await.unwrap();
        assert_eq!(again, Outcome::Done);
        assert_eq!(platform.write_count(), 0);
        assert!(platform.events().is_empty());
        assert_eq!(status(&platform), st);
    }

    #[tokio::test]
    async fn test_ready_pods_and_live_health() {
        let platform = seeded(json!({}));
        platform.seed("default", ready_pod()).unwrap();
        let (ctx, probe) = context(platform.clone());
        let agg = platform.fetch::<VirtualMcpServer>("default", "agg").unwrap();
        probe.answer(&vmcp::url(&agg), &[("fetch", "unhealthy")]);

        drive::<MockPlatform, VirtualMcpServer>(&ctx, "default", "agg").await.unwrap();
        let st = status(&platform);
        assert_eq!(st.phase, Some(Phase::Degraded));
        assert_eq!(st.discovered_backends[0].status, BackendStatus::Unavailable);
        let ready = find_condition(&st.conditions, READY).unwrap();
        assert_eq!(ready.reason, "BackendsUnavailable");

        probe.answer(&vmcp::url(&agg), &[("fetch", "healthy")]);
        drive::<MockPlatform, VirtualMcpServer>(&ctx, "default", "agg").await.unwrap();
        assert_eq!(status(&platform).phase, Some(Phase::Ready));
    }

    #[tokio::test]
    async fn test_missing_group_is_terminal() {
        let platform = MockPlatform::new();
        platform.seed("default", aggregator(json!({}))).unwrap();
        let (ctx, _) = context(platform.clone());

        let outcome = drive::<MockPlatform, VirtualMcpServer>(&ctx, "default", "agg").await.unwrap();
        assert!(matches!(outcome, Outcome::Terminal(_)));
        assert_eq!(platform.count(Verb::Create), 0);
        let st = status(&platform);
        assert_eq!(st.phase, Some(Phase::Failed));
        assert_eq!(st.observed_generation, Some(1));
        let cond = find_condition(&st.conditions, GROUP_REF_VALIDATED).unwrap();
        assert_eq!(cond.reason, "GroupRefNotFound");
        let events = platform.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].type_, EventType::Warning);
        assert_eq!(events[0].object, "VirtualMCPServer/agg");
    }

    #[tokio::test]
    async fn test_group_not_ready_waits() {
        let platform = MockPlatform::new();
        platform.seed("default", group("Pending")).unwrap();
        platform.seed("default", aggregator(json!({}))).unwrap();
        let (ctx, _) = context(platform.clone());

        let outcome = drive::<MockPlatform, VirtualMcpServer>(&ctx, "default", "agg").await.unwrap();
        assert_eq!(outcome, Outcome::Requeue(GROUP_BACKOFF));
        assert_eq!(platform.count(Verb::Create), 0);
        assert_eq!(status(&platform).phase, Some(Phase::Pending));
    }

    #[tokio::test]
    async fn test_invalid_references_are_terminal() {
        let cases = [
            (json!({"podTemplateSpec": {"spec": {"containers": "nope"}}}), POD_TEMPLATE_SPEC_VALID),
            (json!({"outgoingAuth": {"backends": {"fetch": {"type": "magic"}}}}), AUTH_CONFIGURED),
            (
                json!({"aggregation": {"tools": [{"workload": "fetch", "toolConfigRef": {"name": "absent"}}]}}),
                TOOL_CONFIG_VALIDATED,
            ),
            (json!({"compositeToolRefs": [{"name": "absent"}]}), COMPOSITE_TOOL_REFS_VALIDATED),
        ];
        for (extra, condition) in cases {
            let platform = seeded(extra);
            let (ctx, _) = context(platform.clone());
            let outcome = drive::<MockPlatform, VirtualMcpServer>(&ctx, "default", "agg").await.unwrap();
            assert!(matches!(outcome, Outcome::Terminal(_)), "{condition}");
            let st = status(&platform);
            assert!(find_condition(&st.conditions, condition).is_some_and(|c| !c.is_true()), "{condition}");
            assert!(platform.fetch::<Deployment>("default", "agg").is_none());
        }
    }

    #[tokio::test]
    async fn test_fixing_the_spec_clears_stale_conditions() {
        let platform = seeded(json!({
            "podTemplateSpec": {"spec": {"containers": "nope"}},
            "compositeToolRefs": [{"name": "absent"}]
        }));
        let (ctx, _) = context(platform.clone());
        let outcome = drive::<MockPlatform, VirtualMcpServer>(&ctx, "default", "agg").await.unwrap();
        assert!(matches!(outcome, Outcome::Terminal(_)));
        assert!(find_condition(&status(&platform).conditions, POD_TEMPLATE_SPEC_VALID).is_some_and(|c| !c.is_true()));

        let mut agg = platform.fetch::<VirtualMcpServer>("default", "agg").unwrap();
        agg.spec.pod_template_spec = None;
        platform.seed("default", agg).unwrap();
        let outcome = drive::<MockPlatform, VirtualMcpServer>(&ctx, "default", "agg").await.unwrap();
        assert!(matches!(outcome, Outcome::Terminal(_)));
        let st = status(&platform);
        assert!(find_condition(&st.conditions, POD_TEMPLATE_SPEC_VALID).is_none());
        assert!(find_condition(&st.conditions, COMPOSITE_TOOL_REFS_VALIDATED).is_some_and(|c| !c.is_true()));

        let mut agg = platform.fetch::<VirtualMcpServer>("default", "agg").unwrap();
        agg.spec.composite_tool_refs = vec![];
        platform.seed("default", agg).unwrap();
        let outcome = drive::<MockPlatform, VirtualMcpServer>(&ctx, "default", "agg").await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        let st = status(&platform);
        assert!(find_condition(&st.conditions, COMPOSITE_TOOL_REFS_VALIDATED).is_none());
        assert!(find_condition(&st.conditions, TOOL_CONFIG_VALIDATED).is_none());
        assert_eq!(st.phase, Some(Phase::Pending));
    }

    #[tokio::test]
    async fn test_commit_conflict_is_retried_by_a_new_pass() {
        let platform = seeded(json!({}));
        let (ctx, _) = context(platform.clone());
        platform.inject_conflict("VirtualMCPServer", 1);

        let err = drive::<MockPlatform, VirtualMcpServer>(&ctx, "default", "agg").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(status(&platform), VirtualMcpServerStatus::default());

        drive::<MockPlatform, VirtualMcpServer>(&ctx, "default", "agg").await.unwrap();
        assert_eq!(status(&platform).observed_generation, Some(1));
    }

    #[tokio::test]
    async fn test_missing_member_auth_config_is_reported() {
        let platform = MockPlatform::new();
        platform.seed("default", group("Ready")).unwrap();
        let mut member = server("github");
        member.spec.external_auth_config_ref = Some(common::ExternalAuthConfigRef {
            name: "gh-token".to_string(),
        });
        platform.seed("default", member).unwrap();
        platform.seed("default", aggregator(json!({}))).unwrap();
        let (ctx, _) = context(platform.clone());

        drive::<MockPlatform, VirtualMcpServer>(&ctx, "default", "agg").await.unwrap();
        let st = status(&platform);
        let auth = find_condition(&st.conditions, AUTH_CONFIGURED).unwrap();
        assert!(!auth.is_true());
        assert_eq!(auth.reason, "AuthConfigNotFound");
        assert_eq!(st.discovered_backends[0].auth_config_ref.as_deref(), Some("gh-token"));
    }

    /// A cache that has not seen any ConfigMap yet
    #[derive(Clone)]
    struct LaggingCache(MockPlatform);

    #[async_trait]
    impl Platform for LaggingCache {
        async fn get<K: Managed>(&self, ns: &str, name: &str) -> Result<Option<K>> {
            if K::kind(&()) == "ConfigMap" {
                return Ok(None);
            }
            self.0.get(ns, name).await
        }

        async fn list<K: Managed>(&self, ns: &str, labels: Option<&BTreeMap<String, String>>) -> Result<Vec<K>> {
            self.0.list(ns, labels).await
        }

        async fn create<K: Managed>(&self, ns: &str, obj: &K) -> Result<K> {
            self.0.create(ns, obj).await
        }

        async fn replace<K: Managed>(&self, ns: &str, obj: &K) -> Result<K> {
            self.0.replace(ns, obj).await
        }

        async fn replace_status<K: Managed>(&self, ns: &str, obj: &K) -> Result<K> {
            self.0.replace_status(ns, obj).await
        }

        async fn publish(&self, reference: &ObjectReference, ev: Event) -> Result<()> {
            self.0.publish(reference, ev).await
        }
    }

    #[tokio::test]
    async fn test_workload_waits_for_its_configuration() {
        let platform = seeded(json!({}));
        let ctx = Context::new(
            LaggingCache(platform.clone()),
            Arc::new(HealthProbeMock::new()),
            Settings::default(),
        );
        let outcome = drive::<LaggingCache, VirtualMcpServer>(&ctx, "default", "agg").await.unwrap();
        assert_eq!(outcome, Outcome::Requeue(CHECKSUM_BACKOFF));
        assert!(platform.fetch::<Deployment>("default", "agg").is_none());
        let st = status(&platform);
        assert_eq!(st.phase, Some(Phase::Pending));
        assert_eq!(st.message.as_deref(), Some("Waiting for ConfigMap agg-vmcp-config"));
    }
}
