use crate::conditions::ApplicationCondition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub static TOOLCONFIG_FINALIZER: &str = "mcphive.io/toolconfig-finalizer";

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolOverride {
    /// New name exposed to clients
    pub name: Option<String>,
    /// New description exposed to clients
    pub description: Option<String>,
}

/// Tool filtering and renaming shared by several MCP servers
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    kind = "MCPToolConfig",
    root = "McpToolConfig",
    status = "McpToolConfigStatus",
    shortname = "tcfg",
    group = "mcphive.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(
    doc = "Custom resource representing a tool configuration",
    printcolumn = r#"
    {"name":"Hash", "type":"string", "description":"Configuration hash", "jsonPath":".status.configHash"},
    {"name":"Age",  "type":"date",   "description":"Age", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct McpToolConfigSpec {
    /// Only expose these tools
    #[serde(default)]
    pub tools_filter: Vec<String>,
    /// Renames and description overrides keyed by the original tool name
    #[serde(default)]
    pub tools_override: BTreeMap<String, ToolOverride>,
}

/// The status object of `McpToolConfig`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McpToolConfigStatus {
    pub config_hash: Option<String>,
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<ApplicationCondition>,
    /// Sorted names of the MCPServers and MCPRemoteProxies using this configuration
    #[serde(default)]
    pub referencing_servers: Vec<String>,
}

impl_status_resource!(McpToolConfig, McpToolConfigStatus);
impl_observed_status!(McpToolConfigStatus);
