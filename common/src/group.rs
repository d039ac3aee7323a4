use crate::{Phase, conditions::ApplicationCondition};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static GROUP_FINALIZER: &str = "mcphive.io/group-finalizer";

/// Logical grouping of MCPServers and MCPRemoteProxies
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    kind = "MCPGroup",
    root = "McpGroup",
    status = "McpGroupStatus",
    shortname = "mcpg",
    group = "mcphive.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(
    doc = "Custom resource representing a group of MCP servers",
    printcolumn = r#"
    {"name":"Phase",   "type":"string",  "description":"Phase", "jsonPath":".status.phase"},
    {"name":"Servers", "type":"integer", "description":"Servers in the group", "jsonPath":".status.serverCount"},
    {"name":"Proxies", "type":"integer", "description":"Remote proxies in the group", "jsonPath":".status.remoteProxyCount"},
    {"name":"Age",     "type":"date",    "description":"Age", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct McpGroupSpec {
    pub description: Option<String>,
}

/// The status object of `McpGroup`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McpGroupStatus {
    pub phase: Option<Phase>,
    pub message: Option<String>,
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<ApplicationCondition>,
    /// Sorted names of the member MCPServers
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub server_count: i32,
    /// Sorted names of the member MCPRemoteProxies
    #[serde(default)]
    pub remote_proxies: Vec<String>,
    #[serde(default)]
    pub remote_proxy_count: i32,
}

impl_status_resource!(McpGroup, McpGroupStatus);
impl_observed_status!(McpGroupStatus, phase);

impl McpGroup {
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().and_then(|s| s.phase) == Some(Phase::Ready)
    }

    /// Members listed in the status at the last pass
    pub fn listed_servers(&self) -> &[String] {
        self.status.as_ref().map(|s| s.servers.as_slice()).unwrap_or_default()
    }

    pub fn listed_proxies(&self) -> &[String] {
        self.status
            .as_ref()
            .map(|s| s.remote_proxies.as_slice())
            .unwrap_or_default()
    }
}
