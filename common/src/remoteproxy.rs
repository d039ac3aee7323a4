use crate::{
    ExternalAuthConfigRef, Phase, ResourceRequirements, ToolConfigRef, conditions::ApplicationCondition,
    mcpserver::{DEFAULT_PORT, Transport},
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Describe a proxy in front of a MCP server running outside of the cluster
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    kind = "MCPRemoteProxy",
    root = "McpRemoteProxy",
    status = "McpRemoteProxyStatus",
    shortname = "mcprp",
    group = "mcphive.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(
    doc = "Custom resource representing a proxy to a remote MCP server",
    printcolumn = r#"
    {"name":"Phase",  "type":"string", "description":"Phase", "jsonPath":".status.phase"},
    {"name":"Remote", "type":"string", "description":"Remote URL", "jsonPath":".spec.remoteURL"},
    {"name":"URL",    "type":"string", "description":"Service URL", "jsonPath":".status.url"},
    {"name":"Age",    "type":"date",   "description":"Age", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct McpRemoteProxySpec {
    /// URL of the remote MCP server
    #[serde(rename = "remoteURL")]
    pub remote_url: String,
    /// Port the proxy listens on, default to 8080
    pub port: Option<i32>,
    /// Transport towards the remote server, default to streamable-http
    pub transport: Option<Transport>,
    pub external_auth_config_ref: Option<ExternalAuthConfigRef>,
    pub tool_config_ref: Option<ToolConfigRef>,
    /// MCPGroup this proxy belongs to
    pub group_ref: Option<String>,
    pub service_account: Option<String>,
    pub resources: Option<ResourceRequirements>,
}

/// The status object of `McpRemoteProxy`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McpRemoteProxyStatus {
    pub phase: Option<Phase>,
    pub message: Option<String>,
    pub url: Option<String>,
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<ApplicationCondition>,
    pub tool_config_hash: Option<String>,
    pub external_auth_config_hash: Option<String>,
}

impl_status_resource!(McpRemoteProxy, McpRemoteProxyStatus);
impl_observed_status!(McpRemoteProxyStatus, phase, url);

impl McpRemoteProxy {
    pub fn port(&self) -> i32 {
        self.spec.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn transport(&self) -> Transport {
        self.spec.transport.unwrap_or(Transport::StreamableHttp)
    }

    pub fn group(&self) -> Option<&str> {
        self.spec.group_ref.as_deref().filter(|g| !g.is_empty())
    }

    pub fn tool_config(&self) -> Option<&str> {
        self.spec.tool_config_ref.as_ref().map(|r| r.name.as_str())
    }

    pub fn external_auth_config(&self) -> Option<&str> {
        self.spec.external_auth_config_ref.as_ref().map(|r| r.name.as_str())
    }
}
