//! Objects realizing a VirtualMCPServer: its configuration, Deployment and Service
use super::{
    apply_pod_template, cluster_url, config_volume, container_port, deployment, env_var, owned_meta,
    pod_template, read_only_mount, selector_labels, service, with_required_env,
};
use crate::converge::CHECKSUM_ANNOTATION;
use common::{
    Result,
    authconfig::{ExternalAuthType, McpExternalAuthConfig},
    compositetool::{VirtualMcpCompositeToolDefinition, WorkflowStep},
    hasheshandlers::short_hash,
    managed_labels,
    toolconfig::ToolOverride,
    virtualserver::{
        BackendAuthConfig, ConflictResolution, IncomingAuthConfig, VMCP_PORT, VirtualMcpServer,
    },
};
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, Container, EnvVar, EnvVarSource, SecretKeySelector, Service},
};
use kube::ResourceExt;
use serde::Serialize;
use std::collections::BTreeMap;

pub static APP: &str = "vmcp";
pub static CONFIG_FILE: &str = "config.yaml";
pub static CONFIG_DIR: &str = "/etc/vmcp-config";

pub fn service_name(name: &str) -> String {
    format!("vmcp-{name}")
}

pub fn config_name(name: &str) -> String {
    format!("{name}-vmcp-config")
}

pub fn rbac_name(name: &str) -> String {
    format!("{name}-vmcp")
}

pub fn url(vmcp: &VirtualMcpServer) -> String {
    cluster_url(
        &service_name(&vmcp.name_any()),
        &vmcp.namespace().unwrap_or_default(),
        VMCP_PORT,
    )
}

pub fn labels(vmcp: &VirtualMcpServer) -> BTreeMap<String, String> {
    managed_labels(APP, &vmcp.name_any())
}

pub fn selector(vmcp: &VirtualMcpServer) -> BTreeMap<String, String> {
    selector_labels(APP, &vmcp.name_any())
}

// ── Configuration file ───────────────────────────────────────────────────────

/// Tool filtering of one workload once its MCPToolConfig is resolved
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct WorkloadTools {
    pub workload: String,
    pub filter: Vec<String>,
    pub overrides: BTreeMap<String, ToolOverride>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Aggregation {
    pub conflict_resolution: ConflictResolution,
    pub priority_order: Vec<String>,
    pub tools: Vec<WorkloadTools>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct OutgoingAuth {
    pub source: String,
    pub default: Option<BackendAuthConfig>,
    pub backends: BTreeMap<String, BackendAuthConfig>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct CompositeTool {
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
}

/// Content of `config.yaml` read by the aggregator
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct VmcpConfig {
    pub name: String,
    pub group: String,
    pub incoming_auth: Option<IncomingAuthConfig>,
    pub outgoing_auth: OutgoingAuth,
    pub aggregation: Aggregation,
    pub composite_tools: Vec<CompositeTool>,
}

/// Everything the configuration file depends on besides the VirtualMCPServer itself
#[derive(Clone, Debug, Default)]
pub struct Resolved {
    pub tool_configs: BTreeMap<String, (Vec<String>, BTreeMap<String, ToolOverride>)>,
    pub composite_tools: Vec<VirtualMcpCompositeToolDefinition>,
}

pub fn config(vmcp: &VirtualMcpServer, resolved: &Resolved) -> VmcpConfig {
    let aggregation = vmcp.spec.aggregation.clone().unwrap_or_default();
    let tools = aggregation
        .tools
        .iter()
        .map(|t| {
            let (mut filter, overrides) = t
                .tool_config_ref
                .as_ref()
                .and_then(|r| resolved.tool_configs.get(&r.name))
                .cloned()
                .unwrap_or_default();
            // the inline filter applies on top of the shared one
            filter.extend(t.filter.iter().cloned());
            WorkloadTools {
                workload: t.workload.clone(),
                filter,
                overrides,
            }
        })
        .collect();
    let outgoing = vmcp.spec.outgoing_auth.clone().unwrap_or_default();
    VmcpConfig {
        name: vmcp.name_any(),
        group: vmcp.spec.group_ref.clone(),
        incoming_auth: vmcp.spec.incoming_auth.clone(),
        outgoing_auth: OutgoingAuth {
            source: outgoing.source.unwrap_or_else(|| "discovered".to_string()),
            default: outgoing.default,
            backends: outgoing.backends,
        },
        aggregation: Aggregation {
            conflict_resolution: aggregation.conflict_resolution.unwrap_or_default(),
            priority_order: aggregation.priority_order,
            tools,
        },
        composite_tools: resolved
            .composite_tools
            .iter()
            .map(|d| CompositeTool {
                name: d.name_any(),
                description: d.spec.description.clone(),
                steps: d.spec.steps.clone(),
            })
            .collect(),
    }
}

/// The configuration ConfigMap, annotated with the checksum of its content
pub fn config_map(vmcp: &VirtualMcpServer, resolved: &Resolved) -> Result<ConfigMap> {
    let content = serde_yaml::to_string(&config(vmcp, resolved))?;
    let mut meta = owned_meta(vmcp, &config_name(&vmcp.name_any()), &labels(vmcp));
    meta.annotations = Some(BTreeMap::from([(
        CHECKSUM_ANNOTATION.to_string(),
        short_hash(&content),
    )]));
    Ok(ConfigMap {
        metadata: meta,
        data: Some(BTreeMap::from([(CONFIG_FILE.to_string(), content)])),
        ..ConfigMap::default()
    })
}

// ── Workload ─────────────────────────────────────────────────────────────────

/// `my-auth.v2` becomes `MY_AUTH_V2`
fn env_token(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

fn secret_env(name: String, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name,
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..EnvVarSource::default()
        }),
    }
}

/// Secrets of the outgoing auth configurations exposed to the aggregator, sorted by variable name
pub fn auth_env(configs: &[McpExternalAuthConfig]) -> Vec<EnvVar> {
    let mut env: Vec<EnvVar> = configs
        .iter()
        .filter_map(|cfg| {
            let token = env_token(&cfg.name_any());
            let spec = &cfg.spec;
            match spec.auth_type {
                ExternalAuthType::TokenExchange => spec
                    .token_exchange
                    .as_ref()
                    .and_then(|t| t.client_secret_ref.as_ref())
                    .map(|s| secret_env(format!("MCPHIVE_AUTH_{token}_CLIENT_SECRET"), &s.name, &s.key)),
                ExternalAuthType::HeaderInjection => spec.header_injection.as_ref().map(|h| {
                    secret_env(
                        format!("MCPHIVE_AUTH_{token}_HEADER_VALUE"),
                        &h.value_secret_ref.name,
                        &h.value_secret_ref.key,
                    )
                }),
                ExternalAuthType::BearerToken => spec.bearer_token.as_ref().map(|b| {
                    secret_env(
                        format!("MCPHIVE_AUTH_{token}_BEARER_TOKEN"),
                        &b.token_secret_ref.name,
                        &b.token_secret_ref.key,
                    )
                }),
                ExternalAuthType::Unauthenticated => None,
            }
        })
        .collect();
    env.sort_by(|a, b| a.name.cmp(&b.name));
    env.dedup_by(|a, b| a.name == b.name);
    env
}

pub fn args(vmcp: &VirtualMcpServer) -> Vec<String> {
    let mut args = vec![
        "serve".to_string(),
        format!("--config={CONFIG_DIR}/{CONFIG_FILE}"),
        "--host=0.0.0.0".to_string(),
        format!("--port={VMCP_PORT}"),
    ];
    if vmcp.debug() {
        args.push("--debug".to_string());
    }
    args
}

/// Identity first, then the auth secrets, then the runtime defaults
pub fn env(vmcp: &VirtualMcpServer, auth_configs: &[McpExternalAuthConfig]) -> Vec<EnvVar> {
    let mut env = vec![
        env_var("VMCP_NAME", &vmcp.name_any()),
        env_var("VMCP_NAMESPACE", &vmcp.namespace().unwrap_or_default()),
    ];
    env.extend(auth_env(auth_configs));
    with_required_env(env)
}

pub fn deployment_for(
    vmcp: &VirtualMcpServer,
    image: &str,
    checksum: &str,
    auth_configs: &[McpExternalAuthConfig],
) -> Result<Deployment> {
    let name = vmcp.name_any();
    let container = Container {
        name: APP.to_string(),
        image: Some(image.to_string()),
        args: Some(args(vmcp)),
        env: Some(env(vmcp, auth_configs)),
        ports: Some(vec![container_port(VMCP_PORT)]),
        volume_mounts: Some(vec![read_only_mount("vmcp-config", CONFIG_DIR)]),
        ..Container::default()
    };
    let service_account = vmcp.spec.service_account.clone().unwrap_or_else(|| rbac_name(&name));
    let template = pod_template(
        &labels(vmcp),
        checksum,
        &service_account,
        container,
        vec![config_volume("vmcp-config", &config_name(&name))],
    );
    let template = apply_pod_template(template, vmcp.spec.pod_template_spec.as_ref())?;
    Ok(deployment(vmcp, &name, &labels(vmcp), selector(vmcp), template))
}

pub fn service_for(vmcp: &VirtualMcpServer) -> Service {
    service(
        vmcp,
        &service_name(&vmcp.name_any()),
        &labels(vmcp),
        selector(vmcp),
        VMCP_PORT,
        &vmcp.service_type(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{
        SecretKeyRef,
        authconfig::{BearerTokenConfig, HeaderInjectionConfig, McpExternalAuthConfigSpec},
        toolconfig::ToolOverride,
    };
    use kube::Resource;
    use serde_json::json;

    fn vmcp() -> VirtualMcpServer {
        let mut v: VirtualMcpServer = serde_json::from_value(json!({
            "apiVersion": "mcphive.io/v1alpha1",
            "kind": "VirtualMCPServer",
            "metadata": {"name": "agg", "namespace": "team-a", "uid": "uid-7"},
            "spec": {
                "groupRef": "team",
                "logLevel": "debug",
                "aggregation": {"tools": [{"workload": "fetch", "toolConfigRef": {"name": "fetch-tools"}, "filter": ["extra"]}]}
            }
        }))
        .unwrap();
        v.meta_mut().generation = Some(1);
        v
    }

    fn auth(name: &str, spec: McpExternalAuthConfigSpec) -> McpExternalAuthConfig {
        McpExternalAuthConfig::new(name, spec)
    }

    fn secret(name: &str) -> SecretKeyRef {
        SecretKeyRef {
            name: name.to_string(),
            key: "value".to_string(),
        }
    }

    #[test]
    fn test_env_is_built_in_a_stable_order() {
        let configs = vec![
            auth("zz-bearer", McpExternalAuthConfigSpec {
                auth_type: ExternalAuthType::BearerToken,
                bearer_token: Some(BearerTokenConfig {
                    token_secret_ref: secret("tok"),
                }),
                ..McpExternalAuthConfigSpec::default()
            }),
            auth("api.header", McpExternalAuthConfigSpec {
                auth_type: ExternalAuthType::HeaderInjection,
                header_injection: Some(HeaderInjectionConfig {
                    header_name: "X-Api-Key".to_string(),
                    value_secret_ref: secret("key"),
                }),
                ..McpExternalAuthConfigSpec::default()
            }),
        ];
        let first = env(&vmcp(), &configs);
        let mut reversed = configs.clone();
        reversed.reverse();
        assert_eq!(first, env(&vmcp(), &reversed));
        let names: Vec<&str> = first.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![
            "VMCP_NAME",
            "VMCP_NAMESPACE",
            "MCPHIVE_AUTH_API_HEADER_HEADER_VALUE",
            "MCPHIVE_AUTH_ZZ_BEARER_BEARER_TOKEN",
            "XDG_CONFIG_HOME",
            "HOME",
            "MCPHIVE_RUNTIME",
            "UNSTRUCTURED_LOGS",
        ]);
    }

    #[test]
    fn test_config_resolves_tool_configs() {
        let resolved = Resolved {
            tool_configs: BTreeMap::from([(
                "fetch-tools".to_string(),
                (
                    vec!["fetch".to_string()],
                    BTreeMap::from([("fetch".to_string(), ToolOverride {
                        name: Some("web_fetch".to_string()),
                        description: None,
                    })]),
                ),
            )]),
            composite_tools: vec![],
        };
        let cfg = config(&vmcp(), &resolved);
        assert_eq!(cfg.group, "team");
        assert_eq!(cfg.outgoing_auth.source, "discovered");
        assert_eq!(cfg.aggregation.tools[0].filter, vec!["fetch", "extra"]);
        assert!(cfg.aggregation.tools[0].overrides.contains_key("fetch"));

        let a = config_map(&vmcp(), &resolved).unwrap();
        let b = config_map(&vmcp(), &Resolved::default()).unwrap();
        let checksum = |cm: &ConfigMap| cm.annotations().get(CHECKSUM_ANNOTATION).cloned();
        assert!(checksum(&a).is_some());
        assert_ne!(checksum(&a), checksum(&b));
    }

    #[test]
    fn test_deployment_shape() {
        let dep = deployment_for(&vmcp(), "vmcp:1", "abc", &[]).unwrap();
        assert_eq!(dep.name_any(), "agg");
        let spec = dep.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("agg-vmcp"));
        let args = pod.containers[0].args.clone().unwrap();
        assert_eq!(args.last().map(String::as_str), Some("--debug"));
        assert_eq!(
            spec.template.metadata.unwrap().annotations.unwrap().get(CHECKSUM_ANNOTATION).map(String::as_str),
            Some("abc")
        );
        assert_eq!(url(&vmcp()), "http://vmcp-agg.team-a.svc.cluster.local:4483");
    }
}
