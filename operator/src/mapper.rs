use common::{
    Result,
    authconfig::McpExternalAuthConfig,
    group::McpGroup,
    mcpserver::McpServer,
    platform::{Managed, Platform},
    remoteproxy::McpRemoteProxy,
    toolconfig::McpToolConfig,
    virtualserver::VirtualMcpServer,
};
use kube::{ResourceExt, runtime::reflector::ObjectRef};
use std::collections::{BTreeSet, VecDeque};
use tracing::warn;

/// An object of the reference graph, by kind and name within one namespace
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Node {
    Group(String),
    Server(String),
    Proxy(String),
    VirtualServer(String),
    ToolConfig(String),
    AuthConfig(String),
    CompositeTool(String),
}

/// Breadth first traversal from `start`, `neighbors` gives the next hop of a node.
///
/// Every node is visited once so cycles terminate. The result excludes `start` and keeps
/// the discovery order.
pub fn walk<N: Ord + Clone>(start: N, mut neighbors: impl FnMut(&N) -> Vec<N>) -> Vec<N> {
    let mut seen = BTreeSet::from([start.clone()]);
    let mut queue = VecDeque::from([start]);
    let mut found = vec![];
    while let Some(node) = queue.pop_front() {
        for next in neighbors(&node) {
            if seen.insert(next.clone()) {
                found.push(next.clone());
                queue.push_back(next);
            }
        }
    }
    found
}

/// Snapshot of the references between the custom resources of one namespace.
///
/// Loaded from a live listing every time a mapping is needed.
#[derive(Default, Debug)]
pub struct ReferenceGraph {
    groups: Vec<McpGroup>,
    servers: Vec<McpServer>,
    proxies: Vec<McpRemoteProxy>,
    virtual_servers: Vec<VirtualMcpServer>,
    tool_configs: Vec<McpToolConfig>,
    auth_configs: Vec<McpExternalAuthConfig>,
}

impl ReferenceGraph {
    pub async fn load<P: Platform>(platform: &P, ns: &str) -> Result<Self> {
        Ok(Self {
            groups: platform.list(ns, None).await?,
            servers: platform.list(ns, None).await?,
            proxies: platform.list(ns, None).await?,
            virtual_servers: platform.list(ns, None).await?,
            tool_configs: platform.list(ns, None).await?,
            auth_configs: platform.list(ns, None).await?,
        })
    }

    /// Groups a member belongs to, by its current reference or a group status still listing it
    fn groups_of(&self, member: &Node) -> Vec<Node> {
        let (name, current, listed): (&String, Option<&str>, fn(&McpGroup) -> &[String]) = match member {
            Node::Server(name) => (
                name,
                self.servers
                    .iter()
                    .find(|s| s.name_any() == *name)
                    .and_then(McpServer::group),
                McpGroup::listed_servers,
            ),
            Node::Proxy(name) => (
                name,
                self.proxies
                    .iter()
                    .find(|p| p.name_any() == *name)
                    .and_then(McpRemoteProxy::group),
                McpGroup::listed_proxies,
            ),
            _ => return vec![],
        };
        self.groups
            .iter()
            .filter(|g| Some(g.name_any().as_str()) == current || listed(g).contains(name))
            .map(|g| Node::Group(g.name_any()))
            .collect()
    }

    fn members_of(&self, group: &str) -> Vec<Node> {
        let servers = self
            .servers
            .iter()
            .filter(|s| s.group() == Some(group))
            .map(|s| Node::Server(s.name_any()));
        let proxies = self
            .proxies
            .iter()
            .filter(|p| p.group() == Some(group))
            .map(|p| Node::Proxy(p.name_any()));
        servers.chain(proxies).collect()
    }

    fn virtual_servers_of(&self, group: &str) -> Vec<Node> {
        self.virtual_servers
            .iter()
            .filter(|v| v.spec.group_ref == group)
            .map(|v| Node::VirtualServer(v.name_any()))
            .collect()
    }

    /// Servers and proxies referencing a tool or auth configuration
    fn referrers_of(&self, config: &Node) -> Vec<Node> {
        let (servers, proxies): (Vec<&McpServer>, Vec<&McpRemoteProxy>) = match config {
            Node::ToolConfig(name) => (
                self.servers
                    .iter()
                    .filter(|s| s.tool_config() == Some(name.as_str()))
                    .collect(),
                self.proxies
                    .iter()
                    .filter(|p| p.tool_config() == Some(name.as_str()))
                    .collect(),
            ),
            Node::AuthConfig(name) => (
                self.servers
                    .iter()
                    .filter(|s| s.external_auth_config() == Some(name.as_str()))
                    .collect(),
                self.proxies
                    .iter()
                    .filter(|p| p.external_auth_config() == Some(name.as_str()))
                    .collect(),
            ),
            _ => return vec![],
        };
        servers
            .into_iter()
            .map(|s| Node::Server(s.name_any()))
            .chain(proxies.into_iter().map(|p| Node::Proxy(p.name_any())))
            .collect()
    }

    /// VirtualMCPServers naming a configuration object directly in their spec
    fn virtual_servers_naming(&self, config: &Node) -> Vec<Node> {
        self.virtual_servers
            .iter()
            .filter(|v| match config {
                Node::ToolConfig(name) => v.tool_configs().contains(&name.as_str()),
                Node::AuthConfig(name) => v.auth_configs().contains(&name.as_str()),
                Node::CompositeTool(name) => v.composite_tools().contains(&name.as_str()),
                _ => false,
            })
            .map(|v| Node::VirtualServer(v.name_any()))
            .collect()
    }

    /// Configurations whose status still lists `member` as a referrer
    fn configs_listing(&self, member: &str) -> Vec<Node> {
        let tools = self
            .tool_configs
            .iter()
            .filter(|t| {
                t.status
                    .as_ref()
                    .is_some_and(|s| s.referencing_servers.iter().any(|r| r == member))
            })
            .map(|t| Node::ToolConfig(t.name_any()));
        let auths = self
            .auth_configs
            .iter()
            .filter(|a| {
                a.status
                    .as_ref()
                    .is_some_and(|s| s.referencing_servers.iter().any(|r| r == member))
            })
            .map(|a| Node::AuthConfig(a.name_any()));
        tools.chain(auths).collect()
    }

    // ── Mappings ──────────────────────────────────────────────────────────

    /// VirtualMCPServers to reconcile when `changed` changed
    pub fn virtual_servers_for(&self, changed: &Node) -> Vec<String> {
        let reached = walk(changed.clone(), |node| match node {
            Node::Group(g) => self.virtual_servers_of(g),
            Node::Server(_) | Node::Proxy(_) => self.groups_of(node),
            Node::AuthConfig(_) => {
                let mut next = self.virtual_servers_naming(node);
                next.extend(self.referrers_of(node));
                next
            }
            Node::ToolConfig(_) | Node::CompositeTool(_) => self.virtual_servers_naming(node),
            Node::VirtualServer(_) => vec![],
        });
        reached
            .into_iter()
            .filter_map(|n| match n {
                Node::VirtualServer(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// MCPServers (or MCPRemoteProxies with `proxies`) to reconcile when `changed` changed
    pub fn members_for(&self, changed: &Node, proxies: bool) -> Vec<String> {
        let direct = match changed {
            Node::Group(g) => self.members_of(g),
            Node::ToolConfig(_) | Node::AuthConfig(_) => self.referrers_of(changed),
            _ => vec![],
        };
        direct
            .into_iter()
            .filter_map(|n| match (n, proxies) {
                (Node::Server(name), false) | (Node::Proxy(name), true) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// MCPGroups to reconcile when a member changed
    pub fn groups_for(&self, member: &Node) -> Vec<String> {
        self.groups_of(member)
            .into_iter()
            .filter_map(|n| match n {
                Node::Group(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Tool and auth configurations whose referrer list may have changed with `member`
    pub fn configs_for(&self, member: &Node) -> (Vec<String>, Vec<String>) {
        let (name, current_tool, current_auth) = match member {
            Node::Server(name) => {
                let srv = self.servers.iter().find(|s| s.name_any() == *name);
                (
                    name,
                    srv.and_then(McpServer::tool_config),
                    srv.and_then(McpServer::external_auth_config),
                )
            }
            Node::Proxy(name) => {
                let prx = self.proxies.iter().find(|p| p.name_any() == *name);
                (
                    name,
                    prx.and_then(McpRemoteProxy::tool_config),
                    prx.and_then(McpRemoteProxy::external_auth_config),
                )
            }
            _ => return (vec![], vec![]),
        };
        let mut tools: BTreeSet<String> = current_tool.map(str::to_string).into_iter().collect();
        let mut auths: BTreeSet<String> = current_auth.map(str::to_string).into_iter().collect();
        for node in self.configs_listing(name) {
            match node {
                Node::ToolConfig(t) => {
                    tools.insert(t);
                }
                Node::AuthConfig(a) => {
                    auths.insert(a);
                }
                _ => {}
            }
        }
        (tools.into_iter().collect(), auths.into_iter().collect())
    }
}

/// Turns watch events on referenced objects into the keys of the primaries to reconcile
#[derive(Clone)]
pub struct Mapper<P: Platform> {
    platform: P,
}

fn refs<K: Managed>(names: Vec<String>, ns: &str) -> Vec<ObjectRef<K>> {
    names.into_iter().map(|n| ObjectRef::new(&n).within(ns)).collect()
}

impl<P: Platform> Mapper<P> {
    #[must_use]
    pub fn new(platform: P) -> Self {
        Self { platform }
    }

    async fn graph(&self, ns: &str) -> Option<ReferenceGraph> {
        match ReferenceGraph::load(&self.platform, ns).await {
            Ok(g) => Some(g),
            Err(e) => {
                warn!("Unable to list the references of namespace {ns}, skipping this event: {e}");
                None
            }
        }
    }

    async fn resolve<K: Managed, T>(
        &self,
        obj: &K,
        node: Node,
        pick: impl FnOnce(&ReferenceGraph, &Node) -> Vec<String>,
    ) -> Vec<ObjectRef<T>>
    where
        T: Managed,
    {
        let Some(ns) = obj.namespace() else {
            return vec![];
        };
        match self.graph(&ns).await {
            Some(graph) => refs(pick(&graph, &node), &ns),
            None => vec![],
        }
    }

    // ── VirtualMCPServer triggers ─────────────────────────────────────────

    pub async fn virtual_servers_for_group(&self, group: &McpGroup) -> Vec<ObjectRef<VirtualMcpServer>> {
        self.resolve(group, Node::Group(group.name_any()), ReferenceGraph::virtual_servers_for)
            .await
    }

    pub async fn virtual_servers_for_server(&self, srv: &McpServer) -> Vec<ObjectRef<VirtualMcpServer>> {
        self.resolve(srv, Node::Server(srv.name_any()), ReferenceGraph::virtual_servers_for)
            .await
    }

    pub async fn virtual_servers_for_proxy(&self, prx: &McpRemoteProxy) -> Vec<ObjectRef<VirtualMcpServer>> {
        self.resolve(prx, Node::Proxy(prx.name_any()), ReferenceGraph::virtual_servers_for)
            .await
    }

    pub async fn virtual_servers_for_auth_config(
        &self,
        auth: &McpExternalAuthConfig,
    ) -> Vec<ObjectRef<VirtualMcpServer>> {
        self.resolve(auth, Node::AuthConfig(auth.name_any()), ReferenceGraph::virtual_servers_for)
            .await
    }

    pub async fn virtual_servers_for_tool_config(&self, tool: &McpToolConfig) -> Vec<ObjectRef<VirtualMcpServer>> {
        self.resolve(tool, Node::ToolConfig(tool.name_any()), ReferenceGraph::virtual_servers_for)
            .await
    }

    pub async fn virtual_servers_for_composite_tool<K: Managed>(&self, def: &K) -> Vec<ObjectRef<VirtualMcpServer>> {
        self.resolve(def, Node::CompositeTool(def.name_any()), ReferenceGraph::virtual_servers_for)
            .await
    }

    // ── MCPServer and MCPRemoteProxy triggers ─────────────────────────────

    pub async fn servers_for<K: Managed>(&self, changed: &K, node: Node) -> Vec<ObjectRef<McpServer>> {
        self.resolve(changed, node, |g, n| g.members_for(n, false)).await
    }

    pub async fn proxies_for<K: Managed>(&self, changed: &K, node: Node) -> Vec<ObjectRef<McpRemoteProxy>> {
        self.resolve(changed, node, |g, n| g.members_for(n, true)).await
    }

    // ── MCPGroup and configuration triggers ───────────────────────────────

    pub async fn groups_for<K: Managed>(&self, member: &K, node: Node) -> Vec<ObjectRef<McpGroup>> {
        self.resolve(member, node, ReferenceGraph::groups_for).await
    }

    pub async fn tool_configs_for<K: Managed>(&self, member: &K, node: Node) -> Vec<ObjectRef<McpToolConfig>> {
        self.resolve(member, node, |g, n| g.configs_for(n).0).await
    }

    pub async fn auth_configs_for<K: Managed>(
        &self,
        member: &K,
        node: Node,
    ) -> Vec<ObjectRef<McpExternalAuthConfig>> {
        self.resolve(member, node, |g, n| g.configs_for(n).1).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;
    use common::{
        ExternalAuthConfigRef, Phase, ToolConfigRef,
        authconfig::McpExternalAuthConfigSpec,
        group::{McpGroupSpec, McpGroupStatus},
        k8smock::MockPlatform,
        mcpserver::McpServerSpec,
        remoteproxy::McpRemoteProxySpec,
        compositetool::{VirtualMcpCompositeToolDefinition, VirtualMcpCompositeToolDefinitionSpec},
        toolconfig::McpToolConfigSpec,
        virtualserver::{
            AggregationConfig, CompositeToolRef, VirtualMcpServerSpec, WorkloadToolConfig,
        },
    };

    fn server(name: &str, group: Option<&str>, auth: Option<&str>, tool: Option<&str>) -> McpServer {
        McpServer::new(name, McpServerSpec {
            image: "img".to_string(),
            group_ref: group.map(str::to_string),
            external_auth_config_ref: auth.map(|a| ExternalAuthConfigRef { name: a.to_string() }),
            tool_config_ref: tool.map(|t| ToolConfigRef { name: t.to_string() }),
            ..McpServerSpec::default()
        })
    }

    fn vmcp(name: &str, group: &str) -> VirtualMcpServer {
        VirtualMcpServer::new(name, VirtualMcpServerSpec {
            group_ref: group.to_string(),
            ..VirtualMcpServerSpec::default()
        })
    }

    fn names<K>(refs: Vec<ObjectRef<K>>) -> Vec<String>
    where
        K: kube::Resource<DynamicType = ()>,
    {
        let mut res: Vec<String> = refs.into_iter().map(|r| r.name).collect();
        res.sort();
        res
    }

    fn populate(mock: &MockPlatform) {
        mock.seed("ns", McpGroup::new("team", McpGroupSpec::default())).unwrap();
        mock.seed("ns", McpGroup::new("other", McpGroupSpec::default())).unwrap();
        mock.seed("ns", server("fetch", Some("team"), Some("gh-auth"), Some("fetch-tools"))).unwrap();
        mock.seed("ns", server("lonely", None, None, None)).unwrap();
        mock.seed("ns", McpRemoteProxy::new("remote", McpRemoteProxySpec {
            remote_url: "https://mcp.example.com".to_string(),
            group_ref: Some("other".to_string()),
            ..McpRemoteProxySpec::default()
        }))
        .unwrap();
        let mut agg = vmcp("agg", "team");
        agg.spec.aggregation = Some(AggregationConfig {
            tools: vec![WorkloadToolConfig {
                workload: "fetch".to_string(),
                tool_config_ref: Some(ToolConfigRef {
                    name: "agg-tools".to_string(),
                }),
                filter: vec![],
            }],
            ..AggregationConfig::default()
        });
        agg.spec.composite_tool_refs = vec![CompositeToolRef {
            name: "deploy".to_string(),
        }];
        mock.seed("ns", agg).unwrap();
        mock.seed("ns", vmcp("agg-other", "other")).unwrap();
        mock.seed("ns", vmcp("agg-elsewhere", "team")).unwrap();
        // same names in another namespace must never leak in
        mock.seed("prod", vmcp("agg-prod", "team")).unwrap();
    }

    fn ns_obj<K: Managed>(mut obj: K) -> K {
        obj.meta_mut().namespace = Some("ns".to_string());
        obj
    }

    #[test]
    fn test_walk_visits_each_node_once() {
        let edges = |n: &u8| match n {
            1 => vec![2, 3],
            2 => vec![3, 1],
            3 => vec![4],
            _ => vec![],
        };
        assert_eq!(walk(1u8, edges), vec![2, 3, 4]);
        assert!(walk(9u8, edges).is_empty());
    }

    #[tokio::test]
    async fn test_group_maps_to_its_virtual_servers_only() {
        let mock = MockPlatform::new();
        populate(&mock);
        let mapper = Mapper::new(mock);
        let group = ns_obj(McpGroup::new("team", McpGroupSpec::default()));
        assert_eq!(
            names(mapper.virtual_servers_for_group(&group).await),
            vec!["agg", "agg-elsewhere"]
        );
    }

    #[tokio::test]
    async fn test_member_maps_through_its_group() {
        let mock = MockPlatform::new();
        populate(&mock);
        let mapper = Mapper::new(mock);
        let fetch = ns_obj(server("fetch", Some("team"), None, None));
        assert_eq!(
            names(mapper.virtual_servers_for_server(&fetch).await),
            vec!["agg", "agg-elsewhere"]
        );
        let lonely = ns_obj(server("lonely", None, None, None));
        assert!(mapper.virtual_servers_for_server(&lonely).await.is_empty());
    }

    #[tokio::test]
    async fn test_member_leaving_a_group_still_reaches_the_old_one() {
        let mock = MockPlatform::new();
        populate(&mock);
        let mut other = McpGroup::new("other", McpGroupSpec::default());
        other.status = Some(McpGroupStatus {
            phase: Some(Phase::Ready),
            servers: vec!["fetch".to_string()],
            server_count: 1,
            ..McpGroupStatus::default()
        });
        mock.seed("ns", other).unwrap();
        let mapper = Mapper::new(mock);
        let fetch = ns_obj(server("fetch", Some("team"), None, None));
        assert_eq!(
            names(mapper.virtual_servers_for_server(&fetch).await),
            vec!["agg", "agg-elsewhere", "agg-other"]
        );
        assert_eq!(
            names(mapper.groups_for(&fetch, Node::Server("fetch".to_string())).await),
            vec!["other", "team"]
        );
    }

    #[tokio::test]
    async fn test_auth_config_reaches_aggregators_through_members() {
        let mock = MockPlatform::new();
        populate(&mock);
        mock.seed("ns", McpExternalAuthConfig::new("gh-auth", McpExternalAuthConfigSpec::default()))
            .unwrap();
        let mapper = Mapper::new(mock);
        let auth = ns_obj(McpExternalAuthConfig::new("gh-auth", McpExternalAuthConfigSpec::default()));
        // auth -> fetch -> team -> vmcp
        assert_eq!(
            names(mapper.virtual_servers_for_auth_config(&auth).await),
            vec!["agg", "agg-elsewhere"]
        );
        assert_eq!(
            names(mapper.servers_for(&auth, Node::AuthConfig("gh-auth".to_string())).await),
            vec!["fetch"]
        );
        assert!(
            mapper
                .proxies_for(&auth, Node::AuthConfig("gh-auth".to_string()))
                .await
                .is_empty()
        );
        let unused = ns_obj(McpExternalAuthConfig::new("unused", McpExternalAuthConfigSpec::default()));
        assert!(mapper.virtual_servers_for_auth_config(&unused).await.is_empty());
    }

    #[tokio::test]
    async fn test_tool_config_only_reaches_direct_referrers() {
        let mock = MockPlatform::new();
        populate(&mock);
        let mapper = Mapper::new(mock);
        // used by the fetch server, not by any aggregation setting
        let member_tools = ns_obj(McpToolConfig::new("fetch-tools", McpToolConfigSpec::default()));
        assert!(mapper.virtual_servers_for_tool_config(&member_tools).await.is_empty());
        assert_eq!(
            names(mapper.servers_for(&member_tools, Node::ToolConfig("fetch-tools".to_string())).await),
            vec!["fetch"]
        );
        let agg_tools = ns_obj(McpToolConfig::new("agg-tools", McpToolConfigSpec::default()));
        assert_eq!(names(mapper.virtual_servers_for_tool_config(&agg_tools).await), vec!["agg"]);
    }

    #[tokio::test]
    async fn test_composite_tool_and_group_members() {
        let mock = MockPlatform::new();
        populate(&mock);
        let mapper = Mapper::new(mock);
        let def = ns_obj(VirtualMcpCompositeToolDefinition::new(
            "deploy",
            VirtualMcpCompositeToolDefinitionSpec::default(),
        ));
        assert_eq!(names(mapper.virtual_servers_for_composite_tool(&def).await), vec!["agg"]);
        let other = ns_obj(McpGroup::new("other", McpGroupSpec::default()));
        assert_eq!(
            names(mapper.proxies_for(&other, Node::Group("other".to_string())).await),
            vec!["remote"]
        );
        assert!(
            mapper
                .servers_for(&other, Node::Group("other".to_string()))
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_listing_failure_maps_to_nothing() {
        let mock = MockPlatform::new();
        populate(&mock);
        mock.inject_list_error("MCPServer", 1);
        let mapper = Mapper::new(mock);
        let group = ns_obj(McpGroup::new("team", McpGroupSpec::default()));
        assert!(mapper.virtual_servers_for_group(&group).await.is_empty());
        // the next event sees the cluster again
        assert_eq!(mapper.virtual_servers_for_group(&group).await.len(), 2);
    }

    #[tokio::test]
    async fn test_configs_listing_a_former_referrer() {
        let mock = MockPlatform::new();
        populate(&mock);
        let mut old = McpToolConfig::new("old-tools", McpToolConfigSpec::default());
        old.status = Some(common::toolconfig::McpToolConfigStatus {
            referencing_servers: vec!["fetch".to_string()],
            ..Default::default()
        });
        mock.seed("ns", old).unwrap();
        let mapper = Mapper::new(mock);
        let fetch = ns_obj(server("fetch", Some("team"), Some("gh-auth"), Some("fetch-tools")));
        let node = Node::Server("fetch".to_string());
        assert_eq!(
            names(mapper.tool_configs_for(&fetch, node.clone()).await),
            vec!["fetch-tools", "old-tools"]
        );
        assert_eq!(names(mapper.auth_configs_for(&fetch, node).await), vec!["gh-auth"]);
    }
}
