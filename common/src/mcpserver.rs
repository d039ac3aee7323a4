use crate::{
    EnvVarSpec, ExternalAuthConfigRef, Phase, ResourceRequirements, ToolConfigRef,
    conditions::ApplicationCondition,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static DEFAULT_PORT: i32 = 8080;

/// Transport used by the MCP server process
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    #[default]
    Stdio,
    Sse,
    StreamableHttp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Stdio => "stdio",
            Transport::Sse => "sse",
            Transport::StreamableHttp => "streamable-http",
        }
    }
}

/// Describe a MCP server run behind a proxy runner
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    kind = "MCPServer",
    root = "McpServer",
    status = "McpServerStatus",
    shortname = "mcps",
    group = "mcphive.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(
    doc = "Custom resource representing a MCP server",
    printcolumn = r#"
    {"name":"Phase", "type":"string", "description":"Phase", "jsonPath":".status.phase"},
    {"name":"URL",   "type":"string", "description":"Service URL", "jsonPath":".status.url"},
    {"name":"Group", "type":"string", "description":"Group", "jsonPath":".spec.groupRef"},
    {"name":"Age",   "type":"date",   "description":"Age", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct McpServerSpec {
    /// Container image of the MCP server
    pub image: String,
    /// Transport of the MCP server, default to stdio
    pub transport: Option<Transport>,
    /// Port the proxy listens on, default to 8080
    pub port: Option<i32>,
    /// Port the MCP server listens on (non-stdio transports)
    pub target_port: Option<i32>,
    /// Extra arguments passed to the MCP server
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables of the MCP server
    #[serde(default)]
    pub env: Vec<EnvVarSpec>,
    /// Compute resources of the proxy container
    pub resources: Option<ResourceRequirements>,
    /// Use an existing service account instead of the generated one
    pub service_account: Option<String>,
    /// Pod template overrides merged into the generated Deployment
    #[schemars(schema_with = "crate::preserve_unknown_fields")]
    pub pod_template_spec: Option<serde_json::Value>,
    /// Tool filtering and overrides
    pub tool_config_ref: Option<ToolConfigRef>,
    /// Token exchange or header injection towards the MCP server
    pub external_auth_config_ref: Option<ExternalAuthConfigRef>,
    /// MCPGroup this server belongs to
    pub group_ref: Option<String>,
    /// Only expose these tools (ignored when toolConfigRef is set)
    #[serde(default)]
    pub tools: Vec<String>,
}

/// The status object of `McpServer`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McpServerStatus {
    pub phase: Option<Phase>,
    pub message: Option<String>,
    /// In-cluster URL of the proxy
    pub url: Option<String>,
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<ApplicationCondition>,
    /// Hash of the referenced MCPToolConfig when it was last applied
    pub tool_config_hash: Option<String>,
    /// Hash of the referenced MCPExternalAuthConfig when it was last applied
    pub external_auth_config_hash: Option<String>,
}

impl_status_resource!(McpServer, McpServerStatus);
impl_observed_status!(McpServerStatus, phase, url);

impl McpServer {
    pub fn port(&self) -> i32 {
        self.spec.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn transport(&self) -> Transport {
        self.spec.transport.unwrap_or_default()
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults() {
        let srv: McpServer = serde_json::from_value(serde_json::json!({
            "apiVersion": "mcphive.io/v1alpha1",
            "kind": "MCPServer",
            "metadata": {"name": "fetch", "namespace": "default"},
            "spec": {"image": "ghcr.io/example/fetch:1.0", "transport": "streamable-http", "groupRef": ""}
        }))
        .unwrap();
        assert_eq!(srv.port(), 8080);
        assert_eq!(srv.transport(), Transport::StreamableHttp);
        assert!(srv.spec.args.is_empty());
        assert_eq!(srv.group(), None);
        assert_eq!(srv.tool_config(), None);
    }
}
