use crate::{
    Metrics,
    config::Settings,
    driver::{Reconciler, error_policy, reconcile},
    mapper::{Mapper, Node},
};
use chrono::{DateTime, Utc};
use common::{
    Error, Result,
    authconfig::McpExternalAuthConfig,
    compositetool::VirtualMcpCompositeToolDefinition,
    context::get_reporter,
    embedding::EmbeddingServer,
    group::McpGroup,
    httphandler::{HealthClient, HealthProbe},
    mcpserver::McpServer,
    platform::{KubePlatform, Managed, Platform},
    remoteproxy::McpRemoteProxy,
    toolconfig::McpToolConfig,
    virtualserver::VirtualMcpServer,
};
use futures::{
    FutureExt, Stream, StreamExt,
    future::{BoxFuture, select_all},
    stream,
};
use k8s_openapi::api::{
    apps::v1::{Deployment, StatefulSet},
    core::v1::{ConfigMap, Service, ServiceAccount},
    rbac::v1::{Role, RoleBinding},
};
use kube::{
    ResourceExt,
    api::{Api, ListParams},
    client::Client,
    runtime::{
        WatchStreamExt,
        controller::Controller,
        events::Reporter,
        reflector::ObjectRef,
        watcher::{self, watcher},
    },
};
use serde::Serialize;
use std::{future::Future, sync::Arc};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Shared by every reconcile pass
pub struct Context<P: Platform = KubePlatform> {
    /// Cluster access
    pub platform: P,
    /// Live health endpoint of the aggregators
    pub probe: Arc<dyn HealthProbe>,
    pub settings: Settings,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Arc<Metrics>,
}

impl<P: Platform> Context<P> {
    pub fn new(platform: P, probe: Arc<dyn HealthProbe>, settings: Settings) -> Self {
        Self {
            platform,
            probe,
            settings,
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            metrics: Arc::new(Metrics::default()),
        }
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: get_reporter(),
        }
    }
}

/// Data owned by the Manager
#[derive(Clone)]
pub struct Manager {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    metrics: Arc<Metrics>,
}

static CRD_HINT: &str = "is the crd installed? please run: cargo run --bin crdgen | kubectl apply -f -";

async fn ensure_crd<K: Managed>(client: &Client) -> Result<()> {
    Api::<K>::all(client.clone())
        .list(&ListParams::default().limit(1))
        .await
        .map_err(|e| Error::Other(format!("listing {}: {e}, {CRD_HINT}", K::kind(&()))))?;
    Ok(())
}

/// Only the objects created by the operator are watched
fn owned_config() -> watcher::Config {
    watcher::Config::default().labels("app.kubernetes.io/managed-by=mcphive")
}

/// Keys of primaries to reconcile each time an object of kind `K` is touched
fn triggers<K, T, F, Fut>(client: &Client, mapper: Arc<Mapper<KubePlatform>>, map: F) -> impl Stream<Item = ObjectRef<T>> + Send + 'static
where
    K: Managed,
    T: Managed,
    F: Fn(Arc<Mapper<KubePlatform>>, K) -> Fut + Send + 'static,
    Fut: Future<Output = Vec<ObjectRef<T>>> + Send + 'static,
{
    watcher(Api::<K>::all(client.clone()), watcher::Config::default())
        .touched_objects()
        .filter_map(|res| async move {
            match res {
                Ok(obj) => Some(obj),
                Err(e) => {
                    warn!("{} watch failed: {e}", K::kind(&()));
                    None
                }
            }
        })
        .then(move |obj| map(mapper.clone(), obj))
        .flat_map(stream::iter)
}

fn run<K, S>(controller: Controller<K>, triggers: S, ctx: Arc<Context>) -> BoxFuture<'static, ()>
where
    K: Reconciler<KubePlatform>,
    S: Stream<Item = ObjectRef<K>> + Send + 'static,
{
    controller
        .reconcile_on(triggers)
        .shutdown_on_signal()
        .run(reconcile::<KubePlatform, K>, error_policy::<KubePlatform, K>, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .boxed()
}

/// Manager that owns one Controller per custom resource kind
impl Manager {
    /// Lifecycle initialization interface for app
    ///
    /// This returns a `Manager` that drives the `Controller`s + a future to be awaited
    /// It is up to `main` to wait for the controllers.
    pub async fn new(settings: Settings) -> Result<(Self, BoxFuture<'static, ()>)> {
        let client = Client::try_default().await?;
        let platform = KubePlatform::new(client.clone());
        let probe = Arc::new(HealthClient::new(settings.health_probe_timeout)?);
        let context = Arc::new(Context::new(platform.clone(), probe, settings));
        let manager = Manager {
            diagnostics: context.diagnostics.clone(),
            metrics: context.metrics.clone(),
        };
        let mapper = Arc::new(Mapper::new(platform));

        // Ensure every CRD is installed before loop-watching
        ensure_crd::<VirtualMcpServer>(&client).await?;
        ensure_crd::<McpServer>(&client).await?;
        ensure_crd::<McpRemoteProxy>(&client).await?;
        ensure_crd::<McpGroup>(&client).await?;
        ensure_crd::<McpToolConfig>(&client).await?;
        ensure_crd::<McpExternalAuthConfig>(&client).await?;
        ensure_crd::<VirtualMcpCompositeToolDefinition>(&client).await?;
        ensure_crd::<EmbeddingServer>(&client).await?;
        info!("All custom resource definitions are installed");

        let c = &client;
        let m = || mapper.clone();

        // ── VirtualMCPServer ──────────────────────────────────────────────
        let vmcp = Controller::new(Api::<VirtualMcpServer>::all(c.clone()), watcher::Config::default().any_semantic())
            .owns(Api::<Deployment>::all(c.clone()), owned_config())
            .owns(Api::<Service>::all(c.clone()), owned_config())
            .owns(Api::<ConfigMap>::all(c.clone()), owned_config())
            .owns(Api::<ServiceAccount>::all(c.clone()), owned_config())
            .owns(Api::<Role>::all(c.clone()), owned_config())
            .owns(Api::<RoleBinding>::all(c.clone()), owned_config());
        let vmcp_triggers = stream::select_all(vec![
            triggers(c, m(), |m, g: McpGroup| async move { m.virtual_servers_for_group(&g).await }).boxed(),
            triggers(c, m(), |m, s: McpServer| async move { m.virtual_servers_for_server(&s).await }).boxed(),
            triggers(c, m(), |m, p: McpRemoteProxy| async move { m.virtual_servers_for_proxy(&p).await }).boxed(),
            triggers(c, m(), |m, a: McpExternalAuthConfig| async move {
                m.virtual_servers_for_auth_config(&a).await
            })
            .boxed(),
            triggers(c, m(), |m, t: McpToolConfig| async move { m.virtual_servers_for_tool_config(&t).await }).boxed(),
            triggers(c, m(), |m, d: VirtualMcpCompositeToolDefinition| async move {
                m.virtual_servers_for_composite_tool(&d).await
            })
            .boxed(),
        ]);

        // ── MCPServer and MCPRemoteProxy ──────────────────────────────────
        let servers = Controller::new(Api::<McpServer>::all(c.clone()), watcher::Config::default().any_semantic())
            .owns(Api::<Deployment>::all(c.clone()), owned_config())
            .owns(Api::<Service>::all(c.clone()), owned_config())
            .owns(Api::<ConfigMap>::all(c.clone()), owned_config());
        let server_triggers = stream::select_all(vec![
            triggers(c, m(), |m, g: McpGroup| async move {
                let node = Node::Group(g.name_any());
                m.servers_for(&g, node).await
            })
            .boxed(),
            triggers(c, m(), |m, t: McpToolConfig| async move {
                let node = Node::ToolConfig(t.name_any());
                m.servers_for(&t, node).await
            })
            .boxed(),
            triggers(c, m(), |m, a: McpExternalAuthConfig| async move {
                let node = Node::AuthConfig(a.name_any());
                m.servers_for(&a, node).await
            })
            .boxed(),
        ]);
        let proxies = Controller::new(Api::<McpRemoteProxy>::all(c.clone()), watcher::Config::default().any_semantic())
            .owns(Api::<Deployment>::all(c.clone()), owned_config())
            .owns(Api::<Service>::all(c.clone()), owned_config())
            .owns(Api::<ConfigMap>::all(c.clone()), owned_config());
        let proxy_triggers = stream::select_all(vec![
            triggers(c, m(), |m, g: McpGroup| async move {
                let node = Node::Group(g.name_any());
                m.proxies_for(&g, node).await
            })
            .boxed(),
            triggers(c, m(), |m, t: McpToolConfig| async move {
                let node = Node::ToolConfig(t.name_any());
                m.proxies_for(&t, node).await
            })
            .boxed(),
            triggers(c, m(), |m, a: McpExternalAuthConfig| async move {
                let node = Node::AuthConfig(a.name_any());
                m.proxies_for(&a, node).await
            })
            .boxed(),
        ]);

        // ── MCPGroup ──────────────────────────────────────────────────────
        let groups = Controller::new(Api::<McpGroup>::all(c.clone()), watcher::Config::default().any_semantic());
        let group_triggers = stream::select_all(vec![
            triggers(c, m(), |m, s: McpServer| async move {
                let node = Node::Server(s.name_any());
                m.groups_for(&s, node).await
            })
            .boxed(),
            triggers(c, m(), |m, p: McpRemoteProxy| async move {
                let node = Node::Proxy(p.name_any());
                m.groups_for(&p, node).await
            })
            .boxed(),
        ]);

        // ── MCPToolConfig and MCPExternalAuthConfig ───────────────────────
        let tools = Controller::new(Api::<McpToolConfig>::all(c.clone()), watcher::Config::default().any_semantic());
        let tool_triggers = stream::select_all(vec![
            triggers(c, m(), |m, s: McpServer| async move {
                let node = Node::Server(s.name_any());
                m.tool_configs_for(&s, node).await
            })
            .boxed(),
            triggers(c, m(), |m, p: McpRemoteProxy| async move {
                let node = Node::Proxy(p.name_any());
                m.tool_configs_for(&p, node).await
            })
            .boxed(),
        ]);
        let auths =
            Controller::new(Api::<McpExternalAuthConfig>::all(c.clone()), watcher::Config::default().any_semantic());
        let auth_triggers = stream::select_all(vec![
            triggers(c, m(), |m, s: McpServer| async move {
                let node = Node::Server(s.name_any());
                m.auth_configs_for(&s, node).await
            })
            .boxed(),
            triggers(c, m(), |m, p: McpRemoteProxy| async move {
                let node = Node::Proxy(p.name_any());
                m.auth_configs_for(&p, node).await
            })
            .boxed(),
        ]);

        // ── EmbeddingServer ───────────────────────────────────────────────
        let embeddings = Controller::new(Api::<EmbeddingServer>::all(c.clone()), watcher::Config::default().any_semantic())
            .owns(Api::<StatefulSet>::all(c.clone()), owned_config())
            .owns(Api::<Service>::all(c.clone()), owned_config());

        let controllers = vec![
            run(vmcp, vmcp_triggers, context.clone()),
            run(servers, server_triggers, context.clone()),
            run(proxies, proxy_triggers, context.clone()),
            run(groups, group_triggers, context.clone()),
            run(tools, tool_triggers, context.clone()),
            run(auths, auth_triggers, context.clone()),
            run(embeddings, stream::empty(), context),
        ];
        let all = select_all(controllers).map(|_| ()).boxed();
        Ok((manager, all))
    }

    /// Metrics getter
    #[must_use]
    pub fn metrics(&self) -> String {
        self.metrics.encode()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}
