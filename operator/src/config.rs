use common::{Error, Result};
use std::time::Duration;

pub static DEFAULT_VMCP_IMAGE: &str = "ghcr.io/mcphive/vmcp:latest";
pub static DEFAULT_PROXY_RUNNER_IMAGE: &str = "ghcr.io/mcphive/proxyrunner:latest";
pub static DEFAULT_EMBEDDING_IMAGE: &str = "ghcr.io/huggingface/text-embeddings-inference:cpu-latest";

/// Operator settings, read once at startup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub vmcp_image: String,
    pub proxy_runner_image: String,
    pub embedding_image: String,
    pub health_probe_timeout: Duration,
    pub listen_addr: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vmcp_image: DEFAULT_VMCP_IMAGE.to_string(),
            proxy_runner_image: DEFAULT_PROXY_RUNNER_IMAGE.to_string(),
            embedding_image: DEFAULT_EMBEDDING_IMAGE.to_string(),
            health_probe_timeout: Duration::from_secs(5),
            listen_addr: "0.0.0.0:9000".to_string(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Settings::default();
        let health_probe_timeout = match lookup("HEALTH_PROBE_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(
                v.parse::<u64>()
                    .map_err(|e| Error::Validation(format!("HEALTH_PROBE_TIMEOUT_SECS={v}: {e}")))?,
            ),
            None => defaults.health_probe_timeout,
        };
        Ok(Self {
            vmcp_image: lookup("VMCP_IMAGE").unwrap_or(defaults.vmcp_image),
            proxy_runner_image: lookup("PROXY_RUNNER_IMAGE").unwrap_or(defaults.proxy_runner_image),
            embedding_image: lookup("EMBEDDING_IMAGE").unwrap_or(defaults.embedding_image),
            listen_addr: lookup("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            health_probe_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_env_overrides_defaults() {
        let env = BTreeMap::from([
            ("VMCP_IMAGE", "registry.local/vmcp:1.2"),
            ("HEALTH_PROBE_TIMEOUT_SECS", "2"),
        ]);
        let settings = Settings::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(settings.vmcp_image, "registry.local/vmcp:1.2");
        assert_eq!(settings.health_probe_timeout, Duration::from_secs(2));
        assert_eq!(settings.proxy_runner_image, DEFAULT_PROXY_RUNNER_IMAGE);
        assert_eq!(settings.listen_addr, "0.0.0.0:9000");
    }

    #[test]
    fn test_bad_timeout_is_rejected() {
        let res = Settings::from_lookup(|k| (k == "HEALTH_PROBE_TIMEOUT_SECS").then(|| "soon".to_string()));
        assert!(matches!(res, Err(Error::Validation(_))));
    }
}
