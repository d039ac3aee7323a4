use crate::{Error, Result, context::get_reporter};
use async_trait::async_trait;
use k8s_openapi::{NamespaceResourceScope, api::core::v1::ObjectReference};
use kube::{
    Client, Resource, ResourceExt,
    api::{Api, ListParams, PostParams},
    runtime::events::{Event, Recorder, Reporter},
};
use serde::{Serialize, de::DeserializeOwned};
use std::{collections::BTreeMap, fmt::Debug};

/// Any namespaced object the operator reads or writes
pub trait Managed:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> Managed for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Operations the reconcilers need from the cluster.
///
/// Every method is one API round-trip. Errors are already classified into
/// `Error::NotFound`, `Error::Conflict` or a transient `Error::KubeError`.
#[async_trait]
pub trait Platform: Clone + Send + Sync + 'static {
    /// Read one object, `None` when it does not exist
    async fn get<K: Managed>(&self, ns: &str, name: &str) -> Result<Option<K>>;
    /// List the objects of a namespace, optionally restricted by an equality label selector
    async fn list<K: Managed>(&self, ns: &str, labels: Option<&BTreeMap<String, String>>) -> Result<Vec<K>>;
    async fn create<K: Managed>(&self, ns: &str, obj: &K) -> Result<K>;
    /// Full replace, guarded by the resourceVersion carried by `obj`
    async fn replace<K: Managed>(&self, ns: &str, obj: &K) -> Result<K>;
    /// Status subresource replace, guarded by the resourceVersion carried by `obj`
    async fn replace_status<K: Managed>(&self, ns: &str, obj: &K) -> Result<K>;
    async fn publish(&self, reference: &ObjectReference, ev: Event) -> Result<()>;
}

pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<String>>()
        .join(",")
}

#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
    reporter: Reporter,
}

impl KubePlatform {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            reporter: get_reporter(),
        }
    }
}

#[async_trait]
impl Platform for KubePlatform {
    async fn get<K: Managed>(&self, ns: &str, name: &str) -> Result<Option<K>> {
        let api = Api::<K>::namespaced(self.client.clone(), ns);
        api.get_opt(name).await.map_err(Error::from)
    }

    async fn list<K: Managed>(&self, ns: &str, labels: Option<&BTreeMap<String, String>>) -> Result<Vec<K>> {
        let api = Api::<K>::namespaced(self.client.clone(), ns);
        let lp = match labels {
            Some(l) => ListParams::default().labels(&label_selector(l)),
            None => ListParams::default(),
        };
        Ok(api.list(&lp).await.map_err(Error::from)?.items)
    }

    async fn create<K: Managed>(&self, ns: &str, obj: &K) -> Result<K> {
        let api = Api::<K>::namespaced(self.client.clone(), ns);
        api.create(&PostParams::default(), obj).await.map_err(Error::from)
    }

    async fn replace<K: Managed>(&self, ns: &str, obj: &K) -> Result<K> {
        let api = Api::<K>::namespaced(self.client.clone(), ns);
        api.replace(&obj.name_any(), &PostParams::default(), obj)
            .await
            .map_err(Error::from)
    }

    async fn replace_status<K: Managed>(&self, ns: &str, obj: &K) -> Result<K> {
        let api = Api::<K>::namespaced(self.client.clone(), ns);
        let data = serde_json::to_vec(obj)?;
        api.replace_status(&obj.name_any(), &PostParams::default(), data)
            .await
            .map_err(Error::from)
    }

    async fn publish(&self, reference: &ObjectReference, ev: Event) -> Result<()> {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference.clone());
        match recorder.publish(ev).await {
            Ok(_) => Ok(()),
            Err(e) => match e {
                kube::Error::Api(src) => {
                    if !src.message.as_str().contains("being terminated") {
                        tracing::warn!("Ignoring {:?} while sending an event", src);
                    }
                    Ok(())
                }
                _ => Err(Error::from(e)),
            },
        }
    }
}
