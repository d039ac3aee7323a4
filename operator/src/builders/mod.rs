use common::{
    EnvVarSpec, Error, Result, ResourceList, ResourceRequirements,
    hasheshandlers::short_hash,
    k8sworkload::parse_pod_template,
    platform::Managed,
};
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            ConfigMapVolumeSource, Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec,
            ResourceRequirements as K8sResources, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
use kube::{Resource, ResourceExt, api::ObjectMeta};
use serde_json::Value;
use std::collections::BTreeMap;

pub mod embedding;
pub mod rbac;
pub mod runner;
pub mod vmcp;

pub use crate::converge::CHECKSUM_ANNOTATION;
/// Hash of the user supplied pod template overrides, so changing only them still rolls the pods
pub static POD_TEMPLATE_HASH_ANNOTATION: &str = "mcphive.io/pod-template-hash";

pub(crate) fn cluster_url(service: &str, ns: &str, port: i32) -> String {
    format!("http://{service}.{ns}.svc.cluster.local:{port}")
}

/// Metadata of an object owned (and garbage collected with) `owner`
pub fn owned_meta<K: Managed>(owner: &K, name: &str, labels: &BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: owner.namespace(),
        labels: Some(labels.clone()),
        owner_references: owner.controller_owner_ref(&()).map(|o| vec![o]),
        ..ObjectMeta::default()
    }
}

/// The subset of the managed labels used as selector, it never changes for an object
pub fn selector_labels(app: &str, name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), app.to_string()),
        ("app.kubernetes.io/instance".to_string(), name.to_string()),
    ])
}

fn quantities(list: &ResourceList) -> Option<BTreeMap<String, Quantity>> {
    let mut res = BTreeMap::new();
    if let Some(cpu) = list.cpu.as_ref() {
        res.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = list.memory.as_ref() {
        res.insert("memory".to_string(), Quantity(memory.clone()));
    }
    (!res.is_empty()).then_some(res)
}

pub fn resources(spec: Option<&ResourceRequirements>) -> Option<K8sResources> {
    spec.map(|r| K8sResources {
        limits: r.limits.as_ref().and_then(quantities),
        requests: r.requests.as_ref().and_then(quantities),
        ..K8sResources::default()
    })
}

pub fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

/// User variables in their declared order
pub fn env_from_spec(env: &[EnvVarSpec]) -> Vec<EnvVar> {
    env.iter().map(|e| env_var(&e.name, &e.value)).collect()
}

/// Append the variables every proxy container needs, unless already set
pub fn with_required_env(mut env: Vec<EnvVar>) -> Vec<EnvVar> {
    for (name, value) in [
        ("XDG_CONFIG_HOME", "/tmp"),
        ("HOME", "/tmp"),
        ("MCPHIVE_RUNTIME", "kubernetes"),
        ("UNSTRUCTURED_LOGS", "false"),
    ] {
        if !env.iter().any(|e| e.name == name) {
            env.push(env_var(name, value));
        }
    }
    env
}

pub fn http_port(port: i32) -> ServicePort {
    ServicePort {
        name: Some("http".to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..ServicePort::default()
    }
}

/// Service exposing the `http` port of the pods selected by `selector`
pub fn service<K: Managed>(
    owner: &K,
    name: &str,
    labels: &BTreeMap<String, String>,
    selector: BTreeMap<String, String>,
    port: i32,
    service_type: &str,
) -> Service {
    Service {
        metadata: owned_meta(owner, name, labels),
        spec: Some(ServiceSpec {
            type_: Some(service_type.to_string()),
            selector: Some(selector),
            ports: Some(vec![http_port(port)]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

/// Merge `overrides` into `base`, the overrides win.
///
/// Lists of named objects (containers, volumes, env...) are merged by name and an empty
/// override leaves them untouched, any other list is replaced as a whole.
pub fn merge_json(base: &mut Value, overrides: &Value) {
    match (base, overrides) {
        (Value::Object(b), Value::Object(o)) => {
            for (k, v) in o {
                match b.get_mut(k) {
                    Some(existing) if !v.is_null() => merge_json(existing, v),
                    _ => {
                        b.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (Value::Array(b), Value::Array(o)) if o.is_empty() && is_named_list(b) => {}
        (Value::Array(b), Value::Array(o)) if is_named_list(b) && is_named_list(o) => {
            for item in o {
                match b.iter_mut().find(|i| i.get("name") == item.get("name")) {
                    Some(existing) => merge_json(existing, item),
                    None => b.push(item.clone()),
                }
            }
        }
        (b, o) => *b = o.clone(),
    }
}

fn is_named_list(items: &[Value]) -> bool {
    !items.is_empty() && items.iter().all(|i| i.get("name").is_some_and(Value::is_string))
}

/// Apply the user supplied pod template on top of the generated one.
///
/// The overrides hash is recorded on the pod template so that any change rolls the pods.
pub fn apply_pod_template(base: PodTemplateSpec, overrides: Option<&Value>) -> Result<PodTemplateSpec> {
    let Some(raw) = overrides else {
        return Ok(base);
    };
    // validated beforehand, checked again so a bad template never reaches the cluster
    parse_pod_template(raw)?;
    let mut merged = serde_json::to_value(&base)?;
    merge_json(&mut merged, raw);
    let mut tpl: PodTemplateSpec = serde_json::from_value(merged)
        .map_err(|e| Error::Validation(format!("podTemplateSpec does not merge into the generated one: {e}")))?;
    let hash = short_hash(&serde_json::to_string(raw)?);
    tpl.metadata
        .get_or_insert_with(ObjectMeta::default)
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(POD_TEMPLATE_HASH_ANNOTATION.to_string(), hash);
    Ok(tpl)
}

/// Pod template annotations carrying the configuration checksum
pub fn checksum_annotations(checksum: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(CHECKSUM_ANNOTATION.to_string(), checksum.to_string())])
}

/// Volume projecting a ConfigMap
pub fn config_volume(volume: &str, configmap: &str) -> Volume {
    Volume {
        name: volume.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: configmap.to_string(),
            ..ConfigMapVolumeSource::default()
        }),
        ..Volume::default()
    }
}

pub fn read_only_mount(volume: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..VolumeMount::default()
    }
}

pub fn container_port(port: i32) -> ContainerPort {
    ContainerPort {
        name: Some("http".to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..ContainerPort::default()
    }
}

/// Pod template of a configuration driven workload, the checksum rolls the pods when the
/// mounted configuration changes
pub fn pod_template(
    labels: &BTreeMap<String, String>,
    checksum: &str,
    service_account: &str,
    container: Container,
    volumes: Vec<Volume>,
) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels.clone()),
            annotations: Some(checksum_annotations(checksum)),
            ..ObjectMeta::default()
        }),
        spec: Some(PodSpec {
            service_account_name: Some(service_account.to_string()),
            containers: vec![container],
            volumes: (!volumes.is_empty()).then_some(volumes),
            ..PodSpec::default()
        }),
    }
}

/// A single replica Deployment, the replica count is only set on creation
pub fn deployment<K: Managed>(
    owner: &K,
    name: &str,
    labels: &BTreeMap<String, String>,
    selector: BTreeMap<String, String>,
    template: PodTemplateSpec,
) -> Deployment {
    Deployment {
        metadata: owned_meta(owner, name, labels),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..LabelSelector::default()
            },
            template,
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_named_lists_merge_by_name() {
        let mut base = json!({
            "spec": {
                "containers": [{"name": "vmcp", "image": "a", "args": ["serve"]}],
                "tolerations": [{"key": "a"}]
            }
        });
        merge_json(&mut base, &json!({
            "spec": {
                "containers": [
                    {"name": "vmcp", "resources": {"limits": {"cpu": "1"}}},
                    {"name": "sidecar", "image": "b"}
                ],
                "tolerations": [{"key": "b"}]
            }
        }));
        let containers = base["spec"]["containers"].as_array().unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0]["image"], "a");
        assert_eq!(containers[0]["resources"]["limits"]["cpu"], "1");
        assert_eq!(base["spec"]["tolerations"], json!([{"key": "b"}]));
    }

    #[test]
    fn test_empty_named_list_keeps_generated_containers() {
        let base: PodTemplateSpec = serde_json::from_value(json!({
            "spec": {"containers": [{"name": "vmcp", "image": "a"}]}
        }))
        .unwrap();
        let overrides = json!({"spec": {"containers": [], "nodeSelector": {"disk": "ssd"}}});
        let tpl = apply_pod_template(base, Some(&overrides)).unwrap();
        let spec = tpl.spec.unwrap();
        assert_eq!(spec.containers.len(), 1);
        assert_eq!(spec.containers[0].image.as_deref(), Some("a"));
        assert_eq!(spec.node_selector.unwrap()["disk"], "ssd");
    }

    #[test]
    fn test_pod_template_overrides_are_hashed() {
        let base: PodTemplateSpec = serde_json::from_value(json!({
            "spec": {"containers": [{"name": "vmcp", "image": "a"}]}
        }))
        .unwrap();
        let same = apply_pod_template(base.clone(), None).unwrap();
        assert_eq!(same, base);

        let overrides = json!({"spec": {"nodeSelector": {"disk": "ssd"}}});
        let tpl = apply_pod_template(base, Some(&overrides)).unwrap();
        let annotations = tpl.metadata.unwrap().annotations.unwrap();
        assert!(annotations.contains_key(POD_TEMPLATE_HASH_ANNOTATION));
        let spec = tpl.spec.unwrap();
        assert_eq!(spec.containers[0].image.as_deref(), Some("a"));
        assert_eq!(spec.node_selector.unwrap().get("disk").map(String::as_str), Some("ssd"));
    }

    #[test]
    fn test_required_env_keeps_user_values() {
        let env = with_required_env(vec![env_var("HOME", "/home/mcp")]);
        let names: Vec<&str> = env.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["HOME", "XDG_CONFIG_HOME", "MCPHIVE_RUNTIME", "UNSTRUCTURED_LOGS"]);
        assert_eq!(env[0].value.as_deref(), Some("/home/mcp"));
    }

    #[test]
    fn test_resources_conversion() {
        let res = resources(Some(&ResourceRequirements {
            limits: Some(ResourceList {
                cpu: Some("500m".to_string()),
                memory: None,
            }),
            requests: None,
        }))
        .unwrap();
        assert_eq!(res.limits.unwrap().get("cpu"), Some(&Quantity("500m".to_string())));
        assert!(res.requests.is_none());
    }
}
