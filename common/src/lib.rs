use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict while writing {0}")]
    Conflict(String),

    #[error("Invalid resource: {0}")]
    Validation(String),

    #[error("K8s error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YamlError: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("Error: {0}")]
    Other(String),
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(resp.message.clone()),
            kube::Error::Api(resp) if resp.code == 409 => Error::Conflict(resp.message.clone()),
            _ => Error::KubeError(e),
        }
    }
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::NotFound(_) => "notfound".to_string(),
            Error::Conflict(_) => "conflict".to_string(),
            Error::Validation(_) => "validation".to_string(),
            _ => format!("{self:?}").to_lowercase(),
        }
    }

    /// Anything that is neither a missing object nor a rejected spec is worth retrying
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Error::NotFound(_) | Error::Validation(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[macro_use]
mod instance_macros;
pub mod authconfig;
pub mod compositetool;
pub mod conditions;
pub mod context;
pub mod embedding;
pub mod group;
pub mod hasheshandlers;
pub mod httphandler;
pub mod httpmock;
pub mod k8smock;
pub mod k8sworkload;
pub mod mcpserver;
pub mod platform;
pub mod remoteproxy;
pub mod status;
pub mod toolconfig;
pub mod virtualserver;

pub use context::get_client_name;

/// API group shared by every custom resource of the operator
pub static GROUP: &str = "mcphive.io";
pub static VERSION: &str = "v1alpha1";

/// Coarse lifecycle phase reported on every primary resource
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
pub enum Phase {
    #[default]
    Pending,
    Ready,
    Degraded,
    Failed,
    Terminating,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Ready => "Ready",
            Phase::Degraded => "Degraded",
            Phase::Failed => "Failed",
            Phase::Terminating => "Terminating",
        };
        f.write_str(s)
    }
}

/// Reference to a MCPToolConfig in the same namespace
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfigRef {
    /// Name of the MCPToolConfig
    pub name: String,
}

/// Reference to a MCPExternalAuthConfig in the same namespace
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalAuthConfigRef {
    /// Name of the MCPExternalAuthConfig
    pub name: String,
}

/// Reference to a key within a Secret in the same namespace
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    /// Name of the secret
    pub name: String,
    /// Key within the secret
    pub key: String,
}

/// A plain environment variable
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSpec {
    pub name: String,
    pub value: String,
}

/// Compute resources as plain quantity strings
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceList {
    /// CPU quantity, ie: "500m"
    pub cpu: Option<String>,
    /// Memory quantity, ie: "256Mi"
    pub memory: Option<String>,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    pub limits: Option<ResourceList>,
    pub requests: Option<ResourceList>,
}

/// Schema of free-form objects (pod templates, tool arguments) so the CRD stays structural
pub fn preserve_unknown_fields(_: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
    let mut obj = schemars::schema::SchemaObject {
        instance_type: Some(schemars::schema::InstanceType::Object.into()),
        ..Default::default()
    };
    obj.extensions
        .insert("nullable".to_string(), serde_json::Value::Bool(true));
    obj.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    schemars::schema::Schema::Object(obj)
}

/// Labels shared by every object derived from a primary resource
#[must_use]
pub fn managed_labels(app: &str, name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), app.to_string()),
        ("app.kubernetes.io/name".to_string(), app.to_string()),
        ("app.kubernetes.io/instance".to_string(), name.to_string()),
        ("app.kubernetes.io/managed-by".to_string(), "mcphive".to_string()),
        ("mcphive.io/name".to_string(), name.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kube_error_classification() {
        let notfound = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "deployments \"x\" not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        let conflict = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        });
        let throttled = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "too many requests".to_string(),
            reason: "TooManyRequests".to_string(),
            code: 429,
        });
        assert!(matches!(Error::from(notfound), Error::NotFound(_)));
        assert!(matches!(Error::from(conflict), Error::Conflict(_)));
        let transient = Error::from(throttled);
        assert!(matches!(transient, Error::KubeError(_)));
        assert!(transient.is_transient());
    }

    #[test]
    fn test_metric_labels() {
        assert_eq!(Error::Conflict("a".into()).metric_label(), "conflict");
        assert_eq!(Error::Validation("b".into()).metric_label(), "validation");
        assert!(!Error::Validation("b".into()).is_transient());
    }
}
