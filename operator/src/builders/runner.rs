//! Objects realizing a MCPServer or a MCPRemoteProxy, both run behind the proxy runner
use super::{
    apply_pod_template, cluster_url, config_volume, container_port, deployment, env_from_spec, owned_meta,
    pod_template, read_only_mount, resources, selector_labels, service, with_required_env,
};
use crate::converge::CHECKSUM_ANNOTATION;
use common::{
    EnvVarSpec, ResourceRequirements, Result,
    authconfig::McpExternalAuthConfigSpec,
    hasheshandlers::short_hash,
    managed_labels,
    mcpserver::{McpServer, Transport},
    remoteproxy::McpRemoteProxy,
    status::StatusResource,
    toolconfig::ToolOverride,
};
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, Container, Service},
};
use kube::ResourceExt;
use serde::Serialize;
use std::collections::BTreeMap;

pub static RUNCONFIG_FILE: &str = "runconfig.json";
pub static RUNCONFIG_DIR: &str = "/etc/runconfig";
pub static RUNCONFIG_SCHEMA: &str = "v1";

/// What the runner proxies to
#[derive(Clone, Debug, PartialEq)]
pub enum Target<'a> {
    /// A MCP server container started by the runner
    Image {
        image: &'a str,
        args: &'a [String],
        target_port: Option<i32>,
    },
    Remote { url: &'a str },
}

/// The kinds running behind a proxy runner
pub trait RunnerSource: StatusResource {
    /// Value of the `app` label, also prefix of the generated names
    const APP: &'static str;

    fn target(&self) -> Target<'_>;
    fn port(&self) -> i32;
    fn transport(&self) -> Transport;
    fn env(&self) -> &[EnvVarSpec] {
        &[]
    }
    fn resources(&self) -> Option<&ResourceRequirements>;
    fn service_account(&self) -> Option<&str>;
    fn pod_template_spec(&self) -> Option<&serde_json::Value> {
        None
    }
    fn group(&self) -> Option<&str>;
    fn tool_config(&self) -> Option<&str>;
    fn external_auth_config(&self) -> Option<&str>;

    fn service_name(&self) -> String;
    fn rbac_name(&self) -> String;
}

impl RunnerSource for McpServer {
    const APP: &'static str = "mcpserver";

    fn target(&self) -> Target<'_> {
        Target::Image {
            image: &self.spec.image,
            args: &self.spec.args,
            target_port: self.spec.target_port,
        }
    }

    fn port(&self) -> i32 {
        McpServer::port(self)
    }

    fn transport(&self) -> Transport {
        McpServer::transport(self)
    }

    fn env(&self) -> &[EnvVarSpec] {
        &self.spec.env
    }

    fn resources(&self) -> Option<&ResourceRequirements> {
        self.spec.resources.as_ref()
    }

    fn service_account(&self) -> Option<&str> {
        self.spec.service_account.as_deref()
    }

    fn pod_template_spec(&self) -> Option<&serde_json::Value> {
        self.spec.pod_template_spec.as_ref()
    }

    fn group(&self) -> Option<&str> {
        McpServer::group(self)
    }

    fn tool_config(&self) -> Option<&str> {
        McpServer::tool_config(self)
    }

    fn external_auth_config(&self) -> Option<&str> {
        McpServer::external_auth_config(self)
    }

    fn service_name(&self) -> String {
        format!("mcp-{}-proxy", self.name_any())
    }

    fn rbac_name(&self) -> String {
        format!("{}-proxy-runner", self.name_any())
    }
}

impl RunnerSource for McpRemoteProxy {
    const APP: &'static str = "mcpremoteproxy";

    fn target(&self) -> Target<'_> {
        Target::Remote {
            url: &self.spec.remote_url,
        }
    }

    fn port(&self) -> i32 {
        McpRemoteProxy::port(self)
    }

    fn transport(&self) -> Transport {
        McpRemoteProxy::transport(self)
    }

    fn resources(&self) -> Option<&ResourceRequirements> {
        self.spec.resources.as_ref()
    }

    fn service_account(&self) -> Option<&str> {
        self.spec.service_account.as_deref()
    }

    fn group(&self) -> Option<&str> {
        McpRemoteProxy::group(self)
    }

    fn tool_config(&self) -> Option<&str> {
        McpRemoteProxy::tool_config(self)
    }

    fn external_auth_config(&self) -> Option<&str> {
        McpRemoteProxy::external_auth_config(self)
    }

    fn service_name(&self) -> String {
        format!("mcp-{}-remote-proxy", self.name_any())
    }

    fn rbac_name(&self) -> String {
        format!("{}-remote-proxy-runner", self.name_any())
    }
}

pub fn config_name(name: &str) -> String {
    format!("{name}-runconfig")
}

pub fn labels<K: RunnerSource>(obj: &K) -> BTreeMap<String, String> {
    managed_labels(K::APP, &obj.name_any())
}

pub fn selector<K: RunnerSource>(obj: &K) -> BTreeMap<String, String> {
    selector_labels(K::APP, &obj.name_any())
}

/// In-cluster URL of the proxy, the path depends on the transport
pub fn url<K: RunnerSource>(obj: &K) -> String {
    let path = match obj.transport() {
        Transport::Sse => "sse",
        _ => "mcp",
    };
    format!(
        "{}/{path}",
        cluster_url(&obj.service_name(), &obj.namespace().unwrap_or_default(), obj.port())
    )
}

// ── Run configuration ────────────────────────────────────────────────────────

/// Content of `runconfig.json` read by the proxy runner
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub schema_version: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    pub transport: String,
    pub port: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_port: Option<i32>,
    pub cmd_args: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    pub tools_filter: Vec<String>,
    pub tools_override: BTreeMap<String, ToolOverride>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_auth_config: Option<McpExternalAuthConfigSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// Referenced configurations, resolved by the controller
#[derive(Clone, Debug, Default)]
pub struct Resolved {
    pub tools_filter: Vec<String>,
    pub tools_override: BTreeMap<String, ToolOverride>,
    pub external_auth: Option<McpExternalAuthConfigSpec>,
}

pub fn run_config<K: RunnerSource>(obj: &K, resolved: &Resolved) -> RunConfig {
    let (image, remote_url, cmd_args, target_port) = match obj.target() {
        Target::Image {
            image,
            args,
            target_port,
        } => (Some(image.to_string()), None, args.to_vec(), target_port),
        Target::Remote { url } => (None, Some(url.to_string()), vec![], None),
    };
    RunConfig {
        schema_version: RUNCONFIG_SCHEMA.to_string(),
        name: obj.name_any(),
        image,
        remote_url,
        transport: obj.transport().as_str().to_string(),
        port: obj.port(),
        target_port,
        cmd_args,
        env_vars: obj.env().iter().map(|e| (e.name.clone(), e.value.clone())).collect(),
        tools_filter: resolved.tools_filter.clone(),
        tools_override: resolved.tools_override.clone(),
        external_auth_config: resolved.external_auth.clone(),
        group: obj.group().map(str::to_string),
    }
}

pub fn config_map<K: RunnerSource>(obj: &K, resolved: &Resolved) -> Result<ConfigMap> {
    let content = serde_json::to_string_pretty(&run_config(obj, resolved))?;
    let mut meta = owned_meta(obj, &config_name(&obj.name_any()), &labels(obj));
    meta.annotations = Some(BTreeMap::from([(
        CHECKSUM_ANNOTATION.to_string(),
        short_hash(&content),
    )]));
    Ok(ConfigMap {
        metadata: meta,
        data: Some(BTreeMap::from([(RUNCONFIG_FILE.to_string(), content)])),
        ..ConfigMap::default()
    })
}

// ── Workload ─────────────────────────────────────────────────────────────────

pub fn args<K: RunnerSource>(obj: &K) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--foreground=true".to_string(),
        format!("--from-config={RUNCONFIG_DIR}/{RUNCONFIG_FILE}"),
    ];
    match obj.target() {
        Target::Image { image, args: extra, .. } => {
            args.push(image.to_string());
            if !extra.is_empty() {
                args.push("--".to_string());
                args.extend(extra.iter().cloned());
            }
        }
        Target::Remote { url } => args.push(format!("--remote-url={url}")),
    }
    args
}

pub fn deployment_for<K: RunnerSource>(obj: &K, image: &str, checksum: &str) -> Result<Deployment> {
    let name = obj.name_any();
    let container = Container {
        name: "mcp".to_string(),
        image: Some(image.to_string()),
        args: Some(args(obj)),
        env: Some(with_required_env(env_from_spec(obj.env()))),
        ports: Some(vec![container_port(obj.port())]),
        resources: resources(obj.resources()),
        volume_mounts: Some(vec![read_only_mount("runconfig", RUNCONFIG_DIR)]),
        ..Container::default()
    };
    let service_account = obj.service_account().map_or_else(|| obj.rbac_name(), str::to_string);
    let template = pod_template(
        &labels(obj),
        checksum,
        &service_account,
        container,
        vec![config_volume("runconfig", &config_name(&name))],
    );
    let template = apply_pod_template(template, obj.pod_template_spec())?;
    Ok(deployment(obj, &name, &labels(obj), selector(obj), template))
}

pub fn service_for<K: RunnerSource>(obj: &K) -> Service {
    service(
        obj,
        &obj.service_name(),
        &labels(obj),
        selector(obj),
        obj.port(),
        "ClusterIP",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn server() -> McpServer {
        serde_json::from_value(json!({
            "apiVersion": "mcphive.io/v1alpha1",
            "kind": "MCPServer",
            "metadata": {"name": "fetch", "namespace": "default", "uid": "uid-1"},
            "spec": {
                "image": "ghcr.io/example/fetch:1.0",
                "transport": "sse",
                "args": ["--verbose"],
                "env": [{"name": "B", "value": "2"}, {"name": "A", "value": "1"}],
                "resources": {"limits": {"memory": "128Mi"}}
            }
        }))
        .unwrap()
    }

    fn proxy() -> McpRemoteProxy {
        serde_json::from_value(json!({
            "apiVersion": "mcphive.io/v1alpha1",
            "kind": "MCPRemoteProxy",
            "metadata": {"name": "remote", "namespace": "default", "uid": "uid-2"},
            "spec": {"remoteURL": "https://mcp.example.com/mcp"}
        }))
        .unwrap()
    }

    #[test]
    fn test_names_do_not_collide_across_kinds() {
        assert_eq!(server().service_name(), "mcp-fetch-proxy");
        assert_eq!(proxy().service_name(), "mcp-remote-remote-proxy");
        assert_eq!(server().rbac_name(), "fetch-proxy-runner");
        assert_eq!(proxy().rbac_name(), "remote-remote-proxy-runner");
        assert_eq!(url(&server()), "http://mcp-fetch-proxy.default.svc.cluster.local:8080/sse");
        assert_eq!(url(&proxy()), "http://mcp-remote-remote-proxy.default.svc.cluster.local:8080/mcp");
    }

    #[test]
    fn test_args_and_env_keep_the_declared_order() {
        assert_eq!(args(&server()), vec![
            "run",
            "--foreground=true",
            "--from-config=/etc/runconfig/runconfig.json",
            "ghcr.io/example/fetch:1.0",
            "--",
            "--verbose"
        ]);
        assert_eq!(args(&proxy())[3], "--remote-url=https://mcp.example.com/mcp");
        let dep = deployment_for(&server(), "runner:1", "sum").unwrap();
        let container = &dep.spec.unwrap().template.spec.unwrap().containers[0];
        let names: Vec<&str> = container.env.as_ref().unwrap().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(&names[..2], &["B", "A"]);
        assert!(container.resources.as_ref().unwrap().limits.is_some());
    }

    #[test]
    fn test_run_config_content() {
        let resolved = Resolved {
            tools_filter: vec!["fetch".to_string()],
            ..Resolved::default()
        };
        let cfg = run_config(&server(), &resolved);
        assert_eq!(cfg.image.as_deref(), Some("ghcr.io/example/fetch:1.0"));
        assert_eq!(cfg.transport, "sse");
        assert_eq!(cfg.tools_filter, vec!["fetch"]);
        let remote = run_config(&proxy(), &Resolved::default());
        assert_eq!(remote.remote_url.as_deref(), Some("https://mcp.example.com/mcp"));
        assert_eq!(remote.transport, "streamable-http");

        let cm = config_map(&server(), &resolved).unwrap();
        assert_eq!(cm.name_any(), "fetch-runconfig");
        assert!(cm.data.unwrap()[RUNCONFIG_FILE].contains("\"schemaVersion\": \"v1\""));
    }
}
