use super::{cluster_url, container_port, env_from_spec, env_var, owned_meta, resources, selector_labels, service};
use common::{embedding::EmbeddingServer, managed_labels};
use k8s_openapi::{
    api::{
        apps::v1::{StatefulSet, StatefulSetSpec},
        core::v1::{
            Container, HTTPGetAction, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec,
            Probe, Service, VolumeMount, VolumeResourceRequirements,
        },
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
use kube::{ResourceExt, api::ObjectMeta};
use std::collections::BTreeMap;

pub static APP: &str = "embedding";
pub static MODEL_CACHE_VOLUME: &str = "model-cache";
pub static MODEL_CACHE_PATH: &str = "/data";

pub fn service_name(name: &str) -> String {
    format!("embedding-{name}")
}

pub fn url(emb: &EmbeddingServer) -> String {
    cluster_url(
        &service_name(&emb.name_any()),
        &emb.namespace().unwrap_or_default(),
        emb.port(),
    )
}

pub fn labels(emb: &EmbeddingServer) -> BTreeMap<String, String> {
    managed_labels(APP, &emb.name_any())
}

pub fn selector(emb: &EmbeddingServer) -> BTreeMap<String, String> {
    selector_labels(APP, &emb.name_any())
}

/// `--model-id` first, the user variables keep their order
pub fn container(emb: &EmbeddingServer, image: &str) -> Container {
    let port = emb.port();
    let mut env = vec![env_var("MODEL_ID", &emb.spec.model), env_var("PORT", &port.to_string())];
    env.extend(env_from_spec(&emb.spec.env));
    let mounts = emb.spec.model_cache.as_ref().map(|_| {
        vec![VolumeMount {
            name: MODEL_CACHE_VOLUME.to_string(),
            mount_path: MODEL_CACHE_PATH.to_string(),
            ..VolumeMount::default()
        }]
    });
    Container {
        name: APP.to_string(),
        image: Some(emb.spec.image.clone().unwrap_or_else(|| image.to_string())),
        args: Some(vec![
            "--model-id".to_string(),
            emb.spec.model.clone(),
            "--port".to_string(),
            port.to_string(),
        ]),
        env: Some(env),
        ports: Some(vec![container_port(port)]),
        resources: resources(emb.spec.resources.as_ref()),
        volume_mounts: mounts,
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/health".to_string()),
                port: IntOrString::String("http".to_string()),
                ..HTTPGetAction::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            ..Probe::default()
        }),
        ..Container::default()
    }
}

fn model_cache_claim(emb: &EmbeddingServer) -> Option<Vec<PersistentVolumeClaim>> {
    let cache = emb.spec.model_cache.as_ref()?;
    Some(vec![PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(MODEL_CACHE_VOLUME.to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: cache.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(cache.size.clone()),
                )])),
                ..VolumeResourceRequirements::default()
            }),
            ..PersistentVolumeClaimSpec::default()
        }),
        ..PersistentVolumeClaim::default()
    }])
}

/// Replicas are only written when `.spec.replicas` is set, otherwise they belong to whoever scales
pub fn statefulset_for(emb: &EmbeddingServer, image: &str) -> StatefulSet {
    let name = emb.name_any();
    StatefulSet {
        metadata: owned_meta(emb, &name, &labels(emb)),
        spec: Some(StatefulSetSpec {
            replicas: emb.spec.replicas,
            service_name: service_name(&name),
            selector: LabelSelector {
                match_labels: Some(selector(emb)),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(emb)),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container(emb, image)],
                    ..PodSpec::default()
                }),
            },
            volume_claim_templates: model_cache_claim(emb),
            ..StatefulSetSpec::default()
        }),
        ..StatefulSet::default()
    }
}

pub fn service_for(emb: &EmbeddingServer) -> Service {
    service(
        emb,
        &service_name(&emb.name_any()),
        &labels(emb),
        selector(emb),
        emb.port(),
        "ClusterIP",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn emb(extra: serde_json::Value) -> EmbeddingServer {
        let mut spec = json!({"model": "BAAI/bge-small-en-v1.5"});
        if let (Some(s), Some(e)) = (spec.as_object_mut(), extra.as_object()) {
            s.extend(e.clone());
        }
        serde_json::from_value(json!({
            "apiVersion": "mcphive.io/v1alpha1",
            "kind": "EmbeddingServer",
            "metadata": {"name": "bge", "namespace": "ml", "uid": "uid-3"},
            "spec": spec
        }))
        .unwrap()
    }

    #[test]
    fn test_replicas_only_when_requested() {
        let sts = statefulset_for(&emb(json!({})), "tei:cpu");
        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, None);
        assert!(spec.volume_claim_templates.is_none());
        assert_eq!(spec.service_name.as_deref(), Some("embedding-bge"));

        let sts = statefulset_for(&emb(json!({"replicas": 3})), "tei:cpu");
        assert_eq!(sts.spec.unwrap().replicas, Some(3));
    }

    #[test]
    fn test_model_cache_adds_a_claim_and_a_mount() {
        let e = emb(json!({"modelCache": {"size": "10Gi", "storageClassName": "fast"}, "image": "tei:gpu"}));
        let spec = statefulset_for(&e, "tei:cpu").spec.unwrap();
        let claim = &spec.volume_claim_templates.unwrap()[0];
        assert_eq!(claim.spec.as_ref().unwrap().storage_class_name.as_deref(), Some("fast"));
        let container = &spec.template.spec.unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("tei:gpu"));
        assert_eq!(container.volume_mounts.as_ref().unwrap()[0].mount_path, MODEL_CACHE_PATH);
        assert_eq!(url(&e), "http://embedding-bge.ml.svc.cluster.local:8080");
    }
}
