use crate::{
    Error, Result,
    platform::{Managed, Platform},
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType};
use serde_json::{Map, Value};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Create,
    Replace,
    ReplaceStatus,
}

/// One write issued against the mock
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRecord {
    pub verb: Verb,
    pub kind: String,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct RecordedEvent {
    /// `Kind/name` of the object the event is about
    pub object: String,
    pub type_: EventType,
    pub reason: String,
    pub note: Option<String>,
}

type Key = (String, String, String);

#[derive(Default)]
struct Store {
    objects: BTreeMap<Key, Value>,
    writes: Vec<WriteRecord>,
    events: Vec<RecordedEvent>,
    conflicts: BTreeMap<String, usize>,
    list_failures: BTreeMap<String, usize>,
    serial: u64,
}

impl Store {
    fn next_serial(&mut self) -> u64 {
        self.serial += 1;
        self.serial
    }
}

/// In-memory stand-in for the cluster.
///
/// Honours resourceVersion guards, generation bumps on spec changes, finalizer driven
/// deletion and keeps a log of every write and event so tests can assert on them.
#[derive(Clone, Default)]
pub struct MockPlatform {
    store: Arc<Mutex<Store>>,
}

fn kind_of<K: Managed>() -> String {
    K::kind(&()).to_string()
}

fn key_of<K: Managed>(ns: &str, name: &str) -> Key {
    (kind_of::<K>(), ns.to_string(), name.to_string())
}

fn metadata_mut(v: &mut Value) -> Result<&mut Map<String, Value>> {
    let obj = v
        .as_object_mut()
        .ok_or_else(|| Error::Other("object is not a map".to_string()))?;
    obj.entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| Error::Other("metadata is not a map".to_string()))
}

fn meta_str(v: &Value, field: &str) -> Option<String> {
    v.get("metadata")?.get(field)?.as_str().map(str::to_string)
}

fn without(v: &Value, fields: &[&str]) -> Value {
    match v.as_object() {
        Some(m) => Value::Object(
            m.iter()
                .filter(|(k, _)| !fields.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        None => v.clone(),
    }
}

fn labels_match(v: &Value, selector: &BTreeMap<String, String>) -> bool {
    let labels = v.get("metadata").and_then(|m| m.get("labels"));
    selector.iter().all(|(k, want)| {
        labels
            .and_then(|l| l.get(k))
            .and_then(Value::as_str)
            .is_some_and(|have| have == want)
    })
}

fn pending_finalizers(v: &Value) -> bool {
    v.get("metadata")
        .and_then(|m| m.get("finalizers"))
        .and_then(Value::as_array)
        .is_some_and(|f| !f.is_empty())
}

impl MockPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert an object as-is (status included), filling uid, resourceVersion and generation
    pub fn seed<K: Managed>(&self, ns: &str, obj: K) -> Result<()> {
        let mut value = serde_json::to_value(&obj)?;
        let mut store = self.lock();
        let serial = store.next_serial();
        let meta = metadata_mut(&mut value)?;
        meta.insert("namespace".to_string(), Value::String(ns.to_string()));
        meta.entry("uid")
            .or_insert_with(|| Value::String(format!("uid-{serial}")));
        meta.insert("resourceVersion".to_string(), Value::String(serial.to_string()));
        meta.entry("generation").or_insert_with(|| Value::from(1));
        let name = meta_str(&value, "name").unwrap_or_default();
        store.objects.insert(key_of::<K>(ns, &name), value);
        Ok(())
    }

    /// Read an object without going through the (logged) platform interface
    pub fn fetch<K: Managed>(&self, ns: &str, name: &str) -> Option<K> {
        let store = self.lock();
        store
            .objects
            .get(&key_of::<K>(ns, name))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Simulate `kubectl delete`: set the deletionTimestamp, drop the object when no finalizer remains
    pub fn delete<K: Managed>(&self, ns: &str, name: &str) -> Result<()> {
        let mut store = self.lock();
        let key = key_of::<K>(ns, name);
        let serial = store.next_serial();
        let value = store
            .objects
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(format!("{}/{name}", key.0)))?;
        if !pending_finalizers(value) {
            store.objects.remove(&key);
            return Ok(());
        }
        let meta = metadata_mut(value)?;
        meta.insert(
            "deletionTimestamp".to_string(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
        meta.insert("resourceVersion".to_string(), Value::String(serial.to_string()));
        Ok(())
    }

    /// The next `count` status writes on `kind` fail with a conflict
    pub fn inject_conflict(&self, kind: &str, count: usize) {
        self.lock().conflicts.insert(kind.to_string(), count);
    }

    /// The next `count` listings of `kind` fail with a transient error
    pub fn inject_list_error(&self, kind: &str, count: usize) {
        self.lock().list_failures.insert(kind.to_string(), count);
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    pub fn count(&self, verb: Verb) -> usize {
        self.lock().writes.iter().filter(|w| w.verb == verb).count()
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.lock().events.clone()
    }

    /// Forget the writes and events recorded so far
    pub fn reset_log(&self) {
        let mut store = self.lock();
        store.writes.clear();
        store.events.clear();
    }

    fn record(store: &mut Store, verb: Verb, kind: String, name: &str) {
        store.writes.push(WriteRecord {
            verb,
            kind,
            name: name.to_string(),
        });
    }
}

#[async_trait]
impl Platform for MockPlatform {
    async fn get<K: Managed>(&self, ns: &str, name: &str) -> Result<Option<K>> {
        let store = self.lock();
        match store.objects.get(&key_of::<K>(ns, name)) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    async fn list<K: Managed>(&self, ns: &str, labels: Option<&BTreeMap<String, String>>) -> Result<Vec<K>> {
        let kind = kind_of::<K>();
        let mut store = self.lock();
        if let Some(left) = store.list_failures.get_mut(&kind) {
            if *left > 0 {
                *left -= 1;
                return Err(Error::Other(format!("injected listing failure for {kind}")));
            }
        }
        store
            .objects
            .iter()
            .filter(|((k, n, _), v)| *k == kind && n == ns && labels.is_none_or(|l| labels_match(v, l)))
            .map(|(_, v)| serde_json::from_value(v.clone()).map_err(Error::SerializationError))
            .collect()
    }

    async fn create<K: Managed>(&self, ns: &str, obj: &K) -> Result<K> {
        let kind = kind_of::<K>();
        let mut value = without(&serde_json::to_value(obj)?, &["status"]);
        let name = meta_str(&value, "name").ok_or_else(|| Error::Validation(format!("{kind} without name")))?;
        let mut store = self.lock();
        let key = key_of::<K>(ns, &name);
        if store.objects.contains_key(&key) {
            return Err(Error::Conflict(format!("{kind}/{name} already exists")));
        }
        let serial = store.next_serial();
        let meta = metadata_mut(&mut value)?;
        meta.insert("namespace".to_string(), Value::String(ns.to_string()));
        meta.insert("uid".to_string(), Value::String(format!("uid-{serial}")));
        meta.insert("resourceVersion".to_string(), Value::String(serial.to_string()));
        meta.insert("generation".to_string(), Value::from(1));
        store.objects.insert(key, value.clone());
        Self::record(&mut store, Verb::Create, kind, &name);
        Ok(serde_json::from_value(value)?)
    }

    async fn replace<K: Managed>(&self, ns: &str, obj: &K) -> Result<K> {
        let kind = kind_of::<K>();
        let incoming = serde_json::to_value(obj)?;
        let name = meta_str(&incoming, "name").unwrap_or_default();
        let mut store = self.lock();
        let key = key_of::<K>(ns, &name);
        let current = store
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{kind}/{name}")))?;
        if let Some(rv) = meta_str(&incoming, "resourceVersion") {
            if Some(&rv) != meta_str(&current, "resourceVersion").as_ref() {
                return Err(Error::Conflict(format!("{kind}/{name} has been modified")));
            }
        }
        let serial = store.next_serial();
        let mut next = without(&incoming, &["status"]);
        if let Some(status) = current.get("status") {
            if let Some(m) = next.as_object_mut() {
                m.insert("status".to_string(), status.clone());
            }
        }
        let spec_changed = without(&incoming, &["metadata", "status"]) != without(&current, &["metadata", "status"]);
        let generation = current
            .get("metadata")
            .and_then(|m| m.get("generation"))
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let meta = metadata_mut(&mut next)?;
        for field in ["uid", "namespace", "deletionTimestamp", "creationTimestamp"] {
            match current.get("metadata").and_then(|m| m.get(field)) {
                Some(v) => meta.insert(field.to_string(), v.clone()),
                None => meta.remove(field),
            };
        }
        meta.insert("resourceVersion".to_string(), Value::String(serial.to_string()));
        meta.insert(
            "generation".to_string(),
            Value::from(if spec_changed { generation + 1 } else { generation }),
        );
        Self::record(&mut store, Verb::Replace, kind, &name);
        let deleting = meta_str(&next, "deletionTimestamp").is_some();
        if deleting && !pending_finalizers(&next) {
            store.objects.remove(&key);
        } else {
            store.objects.insert(key, next.clone());
        }
        Ok(serde_json::from_value(next)?)
    }

    async fn replace_status<K: Managed>(&self, ns: &str, obj: &K) -> Result<K> {
        let kind = kind_of::<K>();
        let incoming = serde_json::to_value(obj)?;
        let name = meta_str(&incoming, "name").unwrap_or_default();
        let mut store = self.lock();
        if let Some(left) = store.conflicts.get_mut(&kind) {
            if *left > 0 {
                *left -= 1;
                return Err(Error::Conflict(format!("{kind}/{name} has been modified")));
            }
        }
        let key = key_of::<K>(ns, &name);
        let mut current = store
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{kind}/{name}")))?;
        if let Some(rv) = meta_str(&incoming, "resourceVersion") {
            if Some(&rv) != meta_str(&current, "resourceVersion").as_ref() {
                return Err(Error::Conflict(format!("{kind}/{name} has been modified")));
            }
        }
        let serial = store.next_serial();
        if let Some(m) = current.as_object_mut() {
            match incoming.get("status") {
                Some(s) => m.insert("status".to_string(), s.clone()),
                None => m.remove("status"),
            };
        }
        metadata_mut(&mut current)?.insert("resourceVersion".to_string(), Value::String(serial.to_string()));
        store.objects.insert(key, current.clone());
        Self::record(&mut store, Verb::ReplaceStatus, kind, &name);
        Ok(serde_json::from_value(current)?)
    }

    async fn publish(&self, reference: &ObjectReference, ev: Event) -> Result<()> {
        let object = format!(
            "{}/{}",
            reference.kind.clone().unwrap_or_default(),
            reference.name.clone().unwrap_or_default()
        );
        self.lock().events.push(RecordedEvent {
            object,
            type_: ev.type_,
            reason: ev.reason,
            note: ev.note,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn cm(name: &str, data: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), name.to_string())])),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([("k".to_string(), data.to_string())])),
            ..ConfigMap::default()
        }
    }

    #[tokio::test]
    async fn test_create_then_guarded_replace() {
        let mock = MockPlatform::new();
        let created = mock.create("ns", &cm("a", "1")).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert!(mock.create("ns", &cm("a", "1")).await.is_err());

        let mut stale = created.clone();
        let mut fresh = created.clone();
        fresh.data = Some(BTreeMap::from([("k".to_string(), "2".to_string())]));
        let updated = mock.replace("ns", &fresh).await.unwrap();
        assert_eq!(updated.metadata.generation, Some(2));

        stale.data = Some(BTreeMap::from([("k".to_string(), "3".to_string())]));
        assert!(matches!(mock.replace("ns", &stale).await, Err(Error::Conflict(_))));
        assert_eq!(mock.count(Verb::Create), 1);
        assert_eq!(mock.count(Verb::Replace), 1);
    }

    #[tokio::test]
    async fn test_list_by_labels_and_injected_failure() {
        let mock = MockPlatform::new();
        mock.seed("ns", cm("a", "1")).unwrap();
        mock.seed("ns", cm("b", "1")).unwrap();
        mock.seed("other", cm("a", "1")).unwrap();
        let sel = BTreeMap::from([("app".to_string(), "a".to_string())]);
        let found: Vec<ConfigMap> = mock.list("ns", Some(&sel)).await.unwrap();
        assert_eq!(found.len(), 1);
        let all: Vec<ConfigMap> = mock.list("ns", None).await.unwrap();
        assert_eq!(all.len(), 2);

        mock.inject_list_error("ConfigMap", 1);
        assert!(mock.list::<ConfigMap>("ns", None).await.is_err());
        assert!(mock.list::<ConfigMap>("ns", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() {
        let mock = MockPlatform::new();
        let mut obj = cm("a", "1");
        obj.metadata.finalizers = Some(vec!["mcphive.io/test".to_string()]);
        mock.seed("ns", obj).unwrap();
        mock.delete::<ConfigMap>("ns", "a").unwrap();
        let mut live = mock.fetch::<ConfigMap>("ns", "a").unwrap();
        assert!(live.metadata.deletion_timestamp.is_some());
        live.metadata.finalizers = None;
        mock.replace("ns", &live).await.unwrap();
        assert!(mock.fetch::<ConfigMap>("ns", "a").is_none());
    }
}
