use crate::{
    Error, Result,
    httphandler::{BackendHealth, BackendsHealth, HealthProbe},
};
use async_trait::async_trait;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

#[derive(Clone, Debug)]
pub enum HealthMockItem {
    Answer(BackendsHealth),
    /// The aggregator answers 503
    Unavailable,
    /// Any other failure
    Broken(String),
}

/// Canned answers per base url, anything unknown is unreachable
#[derive(Clone, Debug, Default)]
pub struct HealthProbeMock {
    mocks: Arc<Mutex<BTreeMap<String, HealthMockItem>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl HealthProbeMock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, base_url: &str, item: HealthMockItem) {
        self.mocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(base_url.to_string(), item);
    }

    /// Shortcut for an answer made of `(backendId, status)` pairs
    pub fn answer(&self, base_url: &str, backends: &[(&str, &str)]) {
        self.set(
            base_url,
            HealthMockItem::Answer(BackendsHealth {
                backends: backends
                    .iter()
                    .map(|(id, status)| BackendHealth {
                        backend_id: id.to_string(),
                        status: status.to_string(),
                        last_check_time: None,
                    })
                    .collect(),
            }),
        );
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl HealthProbe for HealthProbeMock {
    async fn backends_health(&self, base_url: &str) -> Result<Option<BackendsHealth>> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(base_url.to_string());
        let found = self
            .mocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(base_url)
            .cloned();
        match found {
            Some(HealthMockItem::Answer(h)) => Ok(Some(h)),
            Some(HealthMockItem::Unavailable) | None => Ok(None),
            Some(HealthMockItem::Broken(msg)) => Err(Error::Other(msg)),
        }
    }
}
