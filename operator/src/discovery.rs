use crate::builders::vmcp;
use chrono::Utc;
use common::{
    Phase, Result,
    authconfig::McpExternalAuthConfig,
    httphandler::{BackendsHealth, HealthProbe},
    k8sworkload::PodCounts,
    mcpserver::McpServer,
    platform::Platform,
    remoteproxy::McpRemoteProxy,
    status::StatusResource,
    virtualserver::{AUTH_DISCOVERED, AUTH_EXTERNAL_CONFIG_REF, BackendStatus, DiscoveredBackend, VirtualMcpServer},
};
use kube::ResourceExt;
use tracing::{debug, warn};

/// A workload member of a group
#[derive(Clone, Debug)]
pub enum Member {
    Server(McpServer),
    Proxy(McpRemoteProxy),
}

impl Member {
    pub fn name(&self) -> String {
        match self {
            Member::Server(s) => s.name_any(),
            Member::Proxy(p) => p.name_any(),
        }
    }

    pub fn url(&self) -> Option<String> {
        match self {
            Member::Server(s) => s.status.as_ref().and_then(|s| s.url.clone()),
            Member::Proxy(p) => p.status.as_ref().and_then(|s| s.url.clone()),
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            Member::Server(s) => s.current_phase(),
            Member::Proxy(p) => p.current_phase(),
        }
    }

    pub fn external_auth_config(&self) -> Option<&str> {
        match self {
            Member::Server(s) => s.external_auth_config(),
            Member::Proxy(p) => p.external_auth_config(),
        }
    }

    pub fn tool_config(&self) -> Option<&str> {
        match self {
            Member::Server(s) => s.tool_config(),
            Member::Proxy(p) => p.tool_config(),
        }
    }

    pub fn group(&self) -> Option<&str> {
        match self {
            Member::Server(s) => s.group(),
            Member::Proxy(p) => p.group(),
        }
    }
}

/// Every server and proxy of the namespace, sorted by name
pub async fn members<P: Platform>(platform: &P, ns: &str) -> Result<Vec<Member>> {
    let servers: Vec<McpServer> = platform.list(ns, None).await?;
    let proxies: Vec<McpRemoteProxy> = platform.list(ns, None).await?;
    let mut members: Vec<Member> = servers
        .into_iter()
        .map(Member::Server)
        .chain(proxies.into_iter().map(Member::Proxy))
        .collect();
    members.sort_by_key(Member::name);
    Ok(members)
}

/// Servers and proxies referencing `group`, sorted by name
pub async fn group_members<P: Platform>(platform: &P, ns: &str, group: &str) -> Result<Vec<Member>> {
    let mut members = members(platform, ns).await?;
    members.retain(|m| m.group() == Some(group));
    Ok(members)
}

// ── Backend status ───────────────────────────────────────────────────────────

/// Status reported by the live health endpoint, unknown values keep `current`
pub fn status_from_health(health: &str, current: BackendStatus) -> BackendStatus {
    match health {
        "healthy" => BackendStatus::Ready,
        "unhealthy" => BackendStatus::Unavailable,
        "degraded" => BackendStatus::Degraded,
        "unknown" => BackendStatus::Unknown,
        _ => current,
    }
}

/// Status derived from what the member reports about itself
pub fn status_from_phase(phase: Option<Phase>, url: Option<&str>) -> BackendStatus {
    if url.is_none() {
        return BackendStatus::Unavailable;
    }
    match phase {
        Some(Phase::Ready) => BackendStatus::Ready,
        Some(Phase::Degraded) => BackendStatus::Degraded,
        Some(Phase::Pending | Phase::Failed | Phase::Terminating) => BackendStatus::Unavailable,
        None => BackendStatus::Unknown,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackendCounts {
    pub total: usize,
    pub ready: usize,
}

impl BackendCounts {
    pub fn from_backends(backends: &[DiscoveredBackend]) -> Self {
        Self {
            total: backends.len(),
            ready: backends.iter().filter(|b| b.status == BackendStatus::Ready).count(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    pub phase: Phase,
    pub reason: &'static str,
    pub message: String,
}

/// Combine pod liveness and backend health, first match wins
pub fn decide_phase(pods: PodCounts, backends: BackendCounts) -> Decision {
    let decision = |phase: Phase, reason: &'static str, message: String| Decision { phase, reason, message };
    if pods.ready == 0 {
        if pods.failed > 0 {
            return decision(Phase::Failed, "PodsFailed", format!("{} pod(s) failed", pods.failed));
        }
        return decision(Phase::Pending, "PodsPending", "Waiting for a ready pod".to_string());
    }
    if backends.total == 0 {
        return decision(Phase::Ready, "DeploymentReady", format!("{} pod(s) ready", pods.ready));
    }
    if backends.ready == 0 {
        return decision(
            Phase::Degraded,
            "BackendsUnavailable",
            format!("All {} backend(s) are unhealthy", backends.total),
        );
    }
    if backends.ready < backends.total {
        return decision(
            Phase::Degraded,
            "BackendsDegraded",
            format!("{}/{} backend(s) ready", backends.ready, backends.total),
        );
    }
    decision(
        Phase::Ready,
        "DeploymentReady",
        format!("{} pod(s) and {} backend(s) ready", pods.ready, backends.total),
    )
}

// ── Auth ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Auth {
    auth_type: String,
    config_ref: Option<String>,
}

/// Explicit per backend entry, then the member's own config, then the default entry
fn resolve_auth(vmcp: &VirtualMcpServer, member: &Member) -> Auth {
    let outgoing = vmcp.spec.outgoing_auth.as_ref();
    if let Some(explicit) = outgoing.and_then(|o| o.backends.get(&member.name())) {
        return Auth {
            auth_type: explicit.auth_type.clone(),
            config_ref: explicit.config_ref().map(str::to_string),
        };
    }
    if let Some(name) = member.external_auth_config() {
        return Auth {
            auth_type: AUTH_EXTERNAL_CONFIG_REF.to_string(),
            config_ref: Some(name.to_string()),
        };
    }
    if let Some(default) = outgoing.and_then(|o| o.default.as_ref()) {
        return Auth {
            auth_type: default.auth_type.clone(),
            config_ref: default.config_ref().map(str::to_string),
        };
    }
    Auth {
        auth_type: AUTH_DISCOVERED.to_string(),
        config_ref: None,
    }
}

// ── Discovery ────────────────────────────────────────────────────────────────

/// Backends of one aggregator
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Discovery {
    pub backends: Vec<DiscoveredBackend>,
    /// Auth configurations named by a backend that do not exist
    pub missing_auth: Vec<String>,
}

async fn probe(probe: &dyn HealthProbe, url: &str) -> Option<BackendsHealth> {
    match probe.backends_health(url).await {
        Ok(answer) => answer,
        Err(e) => {
            warn!("Health probe of {url} failed, using the reported phases: {e}");
            None
        }
    }
}

/// Build the backends of `vmcp` from its group members.
///
/// The live probe is only attempted when a pod can answer it.
pub async fn discover<P: Platform>(
    platform: &P,
    health: &dyn HealthProbe,
    vmcp: &VirtualMcpServer,
    ns: &str,
    pods: PodCounts,
) -> Result<Discovery> {
    let members = group_members(platform, ns, &vmcp.spec.group_ref).await?;
    let auth_configs: Vec<McpExternalAuthConfig> = platform.list(ns, None).await?;
    let answer = if pods.ready > 0 && !members.is_empty() {
        probe(health, &vmcp::url(vmcp)).await
    } else {
        None
    };
    let previous = vmcp
        .status
        .as_ref()
        .map(|s| s.discovered_backends.clone())
        .unwrap_or_default();
    let now = Utc::now();

    let mut discovery = Discovery::default();
    for member in members {
        let name = member.name();
        let url = member.url();
        let fallback = status_from_phase(member.phase(), url.as_deref());
        let live = answer.as_ref().and_then(|a| a.find(&name));
        let status = live.map_or(fallback, |h| status_from_health(&h.status, fallback));
        let auth = resolve_auth(vmcp, &member);
        if let Some(config) = auth.config_ref.as_ref() {
            if !auth_configs.iter().any(|c| c.name_any() == *config) {
                discovery.missing_auth.push(config.clone());
            }
        }
        let mut backend = DiscoveredBackend {
            name,
            status,
            url,
            auth_type: Some(auth.auth_type),
            auth_config_ref: auth.config_ref,
            last_health_check: None,
        };
        backend.last_health_check = match live.and_then(|h| h.last_check_time) {
            Some(t) => Some(t),
            None => previous
                .iter()
                .find(|p| p.same_observation(&backend))
                .and_then(|p| p.last_health_check)
                .or(Some(now)),
        };
        debug!("Backend {} of {}: {:?}", backend.name, vmcp.name_any(), backend.status);
        discovery.backends.push(backend);
    }
    discovery.missing_auth.sort();
    discovery.missing_auth.dedup();
    Ok(discovery)
}
