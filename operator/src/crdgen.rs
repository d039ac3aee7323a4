use common::{
    Result, authconfig::McpExternalAuthConfig, compositetool::VirtualMcpCompositeToolDefinition,
    embedding::EmbeddingServer, group::McpGroup, mcpserver::McpServer, remoteproxy::McpRemoteProxy,
    toolconfig::McpToolConfig, virtualserver::VirtualMcpServer,
};
use kube::CustomResourceExt;

fn main() -> Result<()> {
    let crds = [
        McpServer::crd(),
        McpRemoteProxy::crd(),
        McpGroup::crd(),
        McpToolConfig::crd(),
        McpExternalAuthConfig::crd(),
        VirtualMcpServer::crd(),
        VirtualMcpCompositeToolDefinition::crd(),
        EmbeddingServer::crd(),
    ];
    for crd in crds {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
