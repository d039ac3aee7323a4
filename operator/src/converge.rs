use common::{
    Error, Result,
    platform::{Managed, Platform},
};
use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec},
    core::v1::{ConfigMap, Container, PodTemplateSpec, Service, ServiceAccount, ServicePort},
    rbac::v1::{Role, RoleBinding},
};
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Pod template and ConfigMap annotation carrying the hash of the rendered configuration
pub static CHECKSUM_ANNOTATION: &str = "mcphive.io/config-checksum";

/// One observable field of a managed kind, compared desired against live
pub struct Comparator<K> {
    pub name: &'static str,
    pub differs: fn(&K, &K) -> bool,
}

/// A native kind the operator creates and keeps converged
pub trait ManagedKind: Managed {
    /// Comparators in a fixed order, the update reason lists the names that differ
    fn comparators() -> Vec<Comparator<Self>>;

    /// Live object with the desired fields carried forward.
    /// Fields owned by someone else (replicas, allocated IPs and ports) stay as they are.
    fn merge_into(desired: &Self, live: Self) -> Self;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ensured {
    Created,
    Updated(Vec<&'static str>),
    Unchanged,
}

/// Create `desired` when missing, otherwise update the live object only when a comparator reports drift
pub async fn ensure_resource<P: Platform, K: ManagedKind>(platform: &P, desired: &K) -> Result<Ensured> {
    let ns = desired
        .namespace()
        .ok_or_else(|| Error::Validation(format!("{} {} has no namespace", K::kind(&()), desired.name_any())))?;
    let name = desired.name_any();
    let Some(live) = platform.get::<K>(&ns, &name).await? else {
        info!("Creating {} {ns}/{name}", K::kind(&()));
        platform.create(&ns, desired).await?;
        return Ok(Ensured::Created);
    };
    let drift: Vec<&'static str> = K::comparators()
        .iter()
        .filter(|c| (c.differs)(desired, &live))
        .map(|c| c.name)
        .collect();
    if drift.is_empty() {
        debug!("{} {ns}/{name} is up to date", K::kind(&()));
        return Ok(Ensured::Unchanged);
    }
    info!("Updating {} {ns}/{name}: {} changed", K::kind(&()), drift.join(", "));
    platform.replace(&ns, &K::merge_into(desired, live)).await?;
    Ok(Ensured::Updated(drift))
}

/// The checksum annotation of a ConfigMap, `None` when the ConfigMap does not exist (yet)
pub async fn fetch_checksum<P: Platform>(platform: &P, ns: &str, name: &str) -> Result<Option<String>> {
    Ok(platform
        .get::<ConfigMap>(ns, name)
        .await?
        .and_then(|cm| cm.annotations().get(CHECKSUM_ANNOTATION).cloned()))
}

// ── Map helpers ──────────────────────────────────────────────────────────────

type Labels = Option<BTreeMap<String, String>>;

/// Every desired entry is present in live, extra live entries are fine
fn is_subset(desired: &Labels, live: &Labels) -> bool {
    desired
        .iter()
        .flatten()
        .all(|(k, v)| live.as_ref().and_then(|l| l.get(k)) == Some(v))
}

fn overlay(desired: &Labels, live: &Labels) -> Labels {
    if desired.is_none() && live.is_none() {
        return None;
    }
    let mut res = live.clone().unwrap_or_default();
    res.extend(desired.clone().unwrap_or_default());
    Some(res)
}

fn labels_differ<K: Managed>(desired: &K, live: &K) -> bool {
    !is_subset(&desired.meta().labels, &live.meta().labels)
}

fn annotations_differ<K: Managed>(desired: &K, live: &K) -> bool {
    !is_subset(&desired.meta().annotations, &live.meta().annotations)
}

fn merge_meta<K: Managed>(desired: &K, live: &mut K) {
    let labels = overlay(&desired.meta().labels, &live.meta().labels);
    let annotations = overlay(&desired.meta().annotations, &live.meta().annotations);
    let meta = live.meta_mut();
    meta.labels = labels;
    meta.annotations = annotations;
    meta.owner_references = desired.meta().owner_references.clone();
}

// ── Pod templates (Deployment and StatefulSet) ───────────────────────────────

fn main_container(tpl: Option<&PodTemplateSpec>) -> Option<&Container> {
    tpl.and_then(|t| t.spec.as_ref()).and_then(|s| s.containers.first())
}

fn tpl_annotations(tpl: Option<&PodTemplateSpec>) -> Labels {
    tpl.and_then(|t| t.metadata.as_ref()).and_then(|m| m.annotations.clone())
}

fn tpl_labels(tpl: Option<&PodTemplateSpec>) -> Labels {
    tpl.and_then(|t| t.metadata.as_ref()).and_then(|m| m.labels.clone())
}

/// Pod template annotations other than the checksum, which has its own comparator
fn extra_annotations(tpl: Option<&PodTemplateSpec>) -> Labels {
    tpl_annotations(tpl).map(|mut a| {
        a.remove(CHECKSUM_ANNOTATION);
        a
    })
}

fn checksum_of(tpl: Option<&PodTemplateSpec>) -> Option<String> {
    tpl_annotations(tpl).and_then(|a| a.get(CHECKSUM_ANNOTATION).cloned())
}

fn service_account_of(tpl: Option<&PodTemplateSpec>) -> Option<String> {
    tpl.and_then(|t| t.spec.as_ref())
        .and_then(|s| s.service_account_name.clone())
}

/// The desired template, keeping annotations added on the live one (ie: `kubectl rollout restart`)
fn merge_template(desired: Option<&PodTemplateSpec>, live: Option<&PodTemplateSpec>) -> PodTemplateSpec {
    let mut tpl = desired.cloned().unwrap_or_default();
    let annotations = overlay(&tpl_annotations(desired), &tpl_annotations(live));
    tpl.metadata.get_or_insert_with(Default::default).annotations = annotations;
    tpl
}

/// Workloads whose pods run the operator managed container first
trait Workload {
    fn template(&self) -> Option<&PodTemplateSpec>;
}

impl Workload for Deployment {
    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }
}

impl Workload for StatefulSet {
    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }
}

fn pod_comparators<K: Managed + Workload>() -> Vec<Comparator<K>> {
    vec![
        Comparator {
            name: "image",
            differs: |d, l| {
                main_container(d.template()).map(|c| &c.image) != main_container(l.template()).map(|c| &c.image)
            },
        },
        Comparator {
            name: "args",
            differs: |d, l| {
                main_container(d.template()).map(|c| &c.args) != main_container(l.template()).map(|c| &c.args)
            },
        },
        Comparator {
            name: "env",
            differs: |d, l| {
                main_container(d.template()).map(|c| &c.env) != main_container(l.template()).map(|c| &c.env)
            },
        },
        Comparator {
            name: "ports",
            differs: |d, l| {
                main_container(d.template()).map(|c| &c.ports) != main_container(l.template()).map(|c| &c.ports)
            },
        },
        Comparator {
            name: "resources",
            differs: |d, l| {
                main_container(d.template()).map(|c| &c.resources)
                    != main_container(l.template()).map(|c| &c.resources)
            },
        },
        Comparator {
            name: "config-checksum",
            differs: |d, l| checksum_of(d.template()) != checksum_of(l.template()),
        },
        Comparator {
            name: "pod-annotations",
            differs: |d, l| !is_subset(&extra_annotations(d.template()), &tpl_annotations(l.template())),
        },
        Comparator {
            name: "service-account",
            differs: |d, l| service_account_of(d.template()) != service_account_of(l.template()),
        },
        Comparator {
            name: "pod-labels",
            differs: |d, l| !is_subset(&tpl_labels(d.template()), &tpl_labels(l.template())),
        },
        Comparator {
            name: "labels",
            differs: labels_differ::<K>,
        },
        Comparator {
            name: "annotations",
            differs: annotations_differ::<K>,
        },
    ]
}

impl ManagedKind for Deployment {
    fn comparators() -> Vec<Comparator<Self>> {
        pod_comparators()
    }

    fn merge_into(desired: &Self, mut live: Self) -> Self {
        merge_meta(desired, &mut live);
        let want = desired.spec.clone().unwrap_or_default();
        let have = live.spec.take().unwrap_or_default();
        live.spec = Some(DeploymentSpec {
            template: merge_template(Some(&want.template), Some(&have.template)),
            // replicas belong to whoever scales the Deployment, the selector is immutable
            replicas: have.replicas,
            selector: have.selector,
            ..want
        });
        live
    }
}

impl ManagedKind for StatefulSet {
    fn comparators() -> Vec<Comparator<Self>> {
        let mut cmp = pod_comparators();
        cmp.push(Comparator {
            name: "replicas",
            differs: |d: &StatefulSet, l: &StatefulSet| {
                let want = d.spec.as_ref().and_then(|s| s.replicas);
                want.is_some() && want != l.spec.as_ref().and_then(|s| s.replicas)
            },
        });
        cmp
    }

    fn merge_into(desired: &Self, mut live: Self) -> Self {
        merge_meta(desired, &mut live);
        let want = desired.spec.clone().unwrap_or_default();
        let have = live.spec.take().unwrap_or_default();
        live.spec = Some(StatefulSetSpec {
            template: merge_template(Some(&want.template), Some(&have.template)),
            replicas: want.replicas.or(have.replicas),
            // immutable once created
            selector: have.selector,
            service_name: have.service_name,
            volume_claim_templates: have.volume_claim_templates,
            pod_management_policy: have.pod_management_policy,
            ..want
        });
        live
    }
}

// ── Service ──────────────────────────────────────────────────────────────────

type PortKey = (Option<String>, i32, Option<String>, String);

fn port_keys(svc: &Service) -> Vec<PortKey> {
    svc.spec
        .iter()
        .flat_map(|s| s.ports.iter().flatten())
        .map(|p| {
            (
                p.name.clone(),
                p.port,
                p.target_port.as_ref().map(|t| match t {
                    k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(i) => i.to_string(),
                    k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::String(s) => s.clone(),
                }),
                p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
            )
        })
        .collect()
}

fn service_type(svc: &Service) -> String {
    svc.spec
        .as_ref()
        .and_then(|s| s.type_.clone())
        .unwrap_or_else(|| "ClusterIP".to_string())
}

impl ManagedKind for Service {
    fn comparators() -> Vec<Comparator<Self>> {
        vec![
            Comparator {
                name: "ports",
                differs: |d, l| port_keys(d) != port_keys(l),
            },
            Comparator {
                name: "type",
                differs: |d, l| service_type(d) != service_type(l),
            },
            Comparator {
                name: "selector",
                differs: |d, l| {
                    d.spec.as_ref().and_then(|s| s.selector.as_ref()) != l.spec.as_ref().and_then(|s| s.selector.as_ref())
                },
            },
            Comparator {
                name: "labels",
                differs: labels_differ::<Service>,
            },
            Comparator {
                name: "annotations",
                differs: annotations_differ::<Service>,
            },
        ]
    }

    fn merge_into(desired: &Self, mut live: Self) -> Self {
        merge_meta(desired, &mut live);
        let mut want = desired.spec.clone().unwrap_or_default();
        let have = live.spec.take().unwrap_or_default();
        // allocated by the platform
        want.cluster_ip = have.cluster_ip;
        want.cluster_ips = have.cluster_ips;
        want.ip_families = have.ip_families;
        want.ip_family_policy = have.ip_family_policy;
        let exposed = matches!(want.type_.as_deref(), Some("NodePort") | Some("LoadBalancer"));
        if exposed {
            want.health_check_node_port = have.health_check_node_port;
            let live_ports: Vec<ServicePort> = have.ports.unwrap_or_default();
            for port in want.ports.iter_mut().flatten() {
                if port.node_port.is_none() {
                    port.node_port = live_ports
                        .iter()
                        .find(|p| p.name == port.name && p.port == port.port)
                        .and_then(|p| p.node_port);
                }
            }
        }
        live.spec = Some(want);
        live
    }
}

// ── ConfigMap and RBAC ───────────────────────────────────────────────────────

impl ManagedKind for ConfigMap {
    fn comparators() -> Vec<Comparator<Self>> {
        vec![
            Comparator {
                name: "data",
                differs: |d, l| d.data != l.data,
            },
            Comparator {
                name: "labels",
                differs: labels_differ::<ConfigMap>,
            },
            Comparator {
                name: "annotations",
                differs: annotations_differ::<ConfigMap>,
            },
        ]
    }

    fn merge_into(desired: &Self, mut live: Self) -> Self {
        merge_meta(desired, &mut live);
        live.data = desired.data.clone();
        live
    }
}

impl ManagedKind for ServiceAccount {
    fn comparators() -> Vec<Comparator<Self>> {
        vec![Comparator {
            name: "labels",
            differs: labels_differ::<ServiceAccount>,
        }]
    }

    fn merge_into(desired: &Self, mut live: Self) -> Self {
        merge_meta(desired, &mut live);
        live
    }
}

impl ManagedKind for Role {
    fn comparators() -> Vec<Comparator<Self>> {
        vec![
            Comparator {
                name: "rules",
                differs: |d, l| d.rules != l.rules,
            },
            Comparator {
                name: "labels",
                differs: labels_differ::<Role>,
            },
        ]
    }

    fn merge_into(desired: &Self, mut live: Self) -> Self {
        merge_meta(desired, &mut live);
        live.rules = desired.rules.clone();
        live
    }
}

impl ManagedKind for RoleBinding {
    fn comparators() -> Vec<Comparator<Self>> {
        vec![
            Comparator {
                name: "role-ref",
                differs: |d, l| d.role_ref != l.role_ref,
            },
            Comparator {
                name: "subjects",
                differs: |d, l| d.subjects != l.subjects,
            },
            Comparator {
                name: "labels",
                differs: labels_differ::<RoleBinding>,
            },
        ]
    }

    fn merge_into(desired: &Self, mut live: Self) -> Self {
        merge_meta(desired, &mut live);
        live.role_ref = desired.role_ref.clone();
        live.subjects = desired.subjects.clone();
        live
    }
}
