use crate::{ExternalAuthConfigRef, Phase, ToolConfigRef, conditions::ApplicationCondition};
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Port the aggregator listens on
pub static VMCP_PORT: i32 = 4483;
pub static AUTH_DISCOVERED: &str = "discovered";
pub static AUTH_EXTERNAL_CONFIG_REF: &str = "external_auth_config_ref";

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct IncomingAuthConfig {
    /// anonymous or oidc
    #[serde(rename = "type")]
    pub auth_type: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

/// How the aggregator authenticates towards one backend
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct BackendAuthConfig {
    /// discovered or external_auth_config_ref
    #[serde(rename = "type")]
    pub auth_type: String,
    pub external_auth_config_ref: Option<ExternalAuthConfigRef>,
}

impl BackendAuthConfig {
    pub fn config_ref(&self) -> Option<&str> {
        self.external_auth_config_ref.as_ref().map(|r| r.name.as_str())
    }
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingAuthConfig {
    /// discovered (default) or inline
    pub source: Option<String>,
    /// Applied to backends without an explicit entry
    pub default: Option<BackendAuthConfig>,
    /// Per backend overrides, keyed by backend name
    #[serde(default)]
    pub backends: BTreeMap<String, BackendAuthConfig>,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolution {
    #[default]
    Prefix,
    Priority,
    Manual,
}

/// Tool filtering for one workload of the group
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadToolConfig {
    pub workload: String,
    pub tool_config_ref: Option<ToolConfigRef>,
    #[serde(default)]
    pub filter: Vec<String>,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AggregationConfig {
    pub conflict_resolution: Option<ConflictResolution>,
    /// Workload order when conflictResolution is priority
    #[serde(default)]
    pub priority_order: Vec<String>,
    #[serde(default)]
    pub tools: Vec<WorkloadToolConfig>,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompositeToolRef {
    /// Name of the VirtualMCPCompositeToolDefinition
    pub name: String,
}

/// Describe a virtual MCP server aggregating every member of a MCPGroup
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    kind = "VirtualMCPServer",
    root = "VirtualMcpServer",
    status = "VirtualMcpServerStatus",
    shortname = "vmcp",
    group = "mcphive.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(
    doc = "Custom resource representing an aggregating MCP server",
    printcolumn = r#"
    {"name":"Phase",    "type":"string",  "description":"Phase", "jsonPath":".status.phase"},
    {"name":"Backends", "type":"integer", "description":"Discovered backends", "jsonPath":".status.backendCount"},
    {"name":"URL",      "type":"string",  "description":"Service URL", "jsonPath":".status.url"},
    {"name":"Age",      "type":"date",    "description":"Age", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMcpServerSpec {
    /// MCPGroup whose members are aggregated
    pub group_ref: String,
    pub incoming_auth: Option<IncomingAuthConfig>,
    pub outgoing_auth: Option<OutgoingAuthConfig>,
    pub aggregation: Option<AggregationConfig>,
    #[serde(default)]
    pub composite_tool_refs: Vec<CompositeToolRef>,
    /// ClusterIP (default), NodePort or LoadBalancer
    pub service_type: Option<String>,
    /// Use an existing service account instead of the generated one
    pub service_account: Option<String>,
    /// Pod template overrides merged into the generated Deployment
    #[schemars(schema_with = "crate::preserve_unknown_fields")]
    pub pod_template_spec: Option<serde_json::Value>,
    /// info (default) or debug
    pub log_level: Option<String>,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Ready,
    Unavailable,
    Degraded,
    #[default]
    Unknown,
}

/// One member of the group as seen by the aggregator
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredBackend {
    pub name: String,
    pub status: BackendStatus,
    pub url: Option<String>,
    pub auth_type: Option<String>,
    pub auth_config_ref: Option<String>,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl DiscoveredBackend {
    /// Equal on everything but the check time
    pub fn same_observation(&self, other: &DiscoveredBackend) -> bool {
        self.name == other.name
            && self.status == other.status
            && self.url == other.url
            && self.auth_type == other.auth_type
            && self.auth_config_ref == other.auth_config_ref
    }
}

/// The status object of `VirtualMcpServer`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMcpServerStatus {
    pub phase: Option<Phase>,
    pub message: Option<String>,
    pub url: Option<String>,
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<ApplicationCondition>,
    #[serde(default)]
    pub discovered_backends: Vec<DiscoveredBackend>,
    #[serde(default)]
    pub backend_count: i32,
}

impl_status_resource!(VirtualMcpServer, VirtualMcpServerStatus);
impl_observed_status!(VirtualMcpServerStatus, phase, url);

impl VirtualMcpServer {
    pub fn service_type(&self) -> String {
        self.spec
            .service_type
            .clone()
            .unwrap_or_else(|| "ClusterIP".to_string())
    }

    pub fn debug(&self) -> bool {
        self.spec.log_level.as_deref() == Some("debug")
    }

    pub fn composite_tools(&self) -> Vec<&str> {
        self.spec.composite_tool_refs.iter().map(|r| r.name.as_str()).collect()
    }

    /// MCPToolConfigs referenced by the aggregation settings
    pub fn tool_configs(&self) -> Vec<&str> {
        self.spec
            .aggregation
            .as_ref()
            .map(|a| {
                a.tools
                    .iter()
                    .filter_map(|t| t.tool_config_ref.as_ref().map(|r| r.name.as_str()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// MCPExternalAuthConfigs named directly in the outgoing auth settings
    pub fn auth_configs(&self) -> Vec<&str> {
        let Some(out) = self.spec.outgoing_auth.as_ref() else {
            return vec![];
        };
        out.default
            .iter()
            .chain(out.backends.values())
            .filter_map(BackendAuthConfig::config_ref)
            .collect()
    }

    /// Structural checks the API server schema cannot express
    pub fn validate_outgoing_auth(&self) -> Result<(), String> {
        let Some(out) = self.spec.outgoing_auth.as_ref() else {
            return Ok(());
        };
        for (name, auth) in out.backends.iter() {
            if auth.auth_type == AUTH_EXTERNAL_CONFIG_REF {
                if auth.config_ref().is_none_or(str::is_empty) {
                    return Err(format!(
                        "outgoingAuth.backends[{name}].externalAuthConfigRef is required when type is {AUTH_EXTERNAL_CONFIG_REF}"
                    ));
                }
            } else if auth.auth_type != AUTH_DISCOVERED {
                return Err(format!(
                    "outgoingAuth.backends[{name}].type must be one of: {AUTH_DISCOVERED}, {AUTH_EXTERNAL_CONFIG_REF}"
                ));
            }
        }
        Ok(())
    }
}
