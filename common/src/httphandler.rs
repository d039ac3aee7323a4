use crate::{Error, Result, get_client_name};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::*;

pub static HEALTH_PATH: &str = "api/backends/health";

/// Health of one backend as reported by a running aggregator
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackendHealth {
    pub backend_id: String,
    /// healthy, unhealthy, degraded or unknown
    pub status: String,
    pub last_check_time: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct BackendsHealth {
    #[serde(default)]
    pub backends: Vec<BackendHealth>,
}

impl BackendsHealth {
    pub fn find(&self, backend: &str) -> Option<&BackendHealth> {
        self.backends.iter().find(|b| b.backend_id == backend)
    }
}

/// Queries the live health endpoint of an aggregator.
///
/// `Ok(None)` means "no answer worth using": the endpoint is not serving yet (503) or the
/// aggregator is unreachable. Callers then fall back to what the platform reports.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn backends_health(&self, base_url: &str) -> Result<Option<BackendsHealth>>;
}

#[derive(Clone, Debug)]
pub struct HealthClient {
    client: Client,
}

impl HealthClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(get_client_name())
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HealthClient {
    async fn backends_health(&self, base_url: &str) -> Result<Option<BackendsHealth>> {
        let url = format!("{}/{HEALTH_PATH}", base_url.trim_end_matches('/'));
        debug!("http_get '{url}'");
        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) if e.is_connect() || e.is_timeout() => {
                debug!("{url} is unreachable: {e}");
                return Ok(None);
            }
            Err(e) => return Err(Error::ReqwestError(e)),
        };
        let status = response.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            debug!("{url} is not serving health yet");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Error::Other(format!(
                "GET {url} returned {} {}",
                status.as_str(),
                status.canonical_reason().unwrap_or("unknown")
            )));
        }
        let text = response.text().await?;
        Ok(Some(serde_json::from_str(&text)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_health_payload() {
        let body = r#"{"backends":[
            {"backendId":"fetch","status":"healthy","lastCheckTime":"2025-01-02T03:04:05Z"},
            {"backendId":"github","status":"unhealthy"}
        ]}"#;
        let health: BackendsHealth = serde_json::from_str(body).unwrap();
        assert_eq!(health.backends.len(), 2);
        assert_eq!(health.find("fetch").map(|b| b.status.as_str()), Some("healthy"));
        assert!(health.find("github").unwrap().last_check_time.is_none());
        assert!(health.find("missing").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_is_no_answer() {
        let probe = HealthClient::new(Duration::from_millis(200)).unwrap();
        // nothing listens on port 9 of the loopback
        let res = probe.backends_health("http://127.0.0.1:9").await.unwrap();
        assert!(res.is_none());
    }
}
