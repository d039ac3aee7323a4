use crate::{EnvVarSpec, Phase, ResourceRequirements, conditions::ApplicationCondition};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static EMBEDDING_PORT: i32 = 8080;

/// Persistent cache for downloaded model weights
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModelCacheConfig {
    /// Volume size, ie: "10Gi"
    pub size: String,
    pub storage_class_name: Option<String>,
}

/// Describe a text embedding inference server
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    kind = "EmbeddingServer",
    root = "EmbeddingServer",
    status = "EmbeddingServerStatus",
    shortname = "emb",
    group = "mcphive.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(
    doc = "Custom resource representing an embedding server",
    printcolumn = r#"
    {"name":"Phase", "type":"string",  "description":"Phase", "jsonPath":".status.phase"},
    {"name":"Model", "type":"string",  "description":"Model", "jsonPath":".spec.model"},
    {"name":"Ready", "type":"integer", "description":"Ready replicas", "jsonPath":".status.readyReplicas"},
    {"name":"Age",   "type":"date",    "description":"Age", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingServerSpec {
    /// HuggingFace model identifier
    pub model: String,
    /// Override the operator default image
    pub image: Option<String>,
    /// Port the server listens on, default to 8080
    pub port: Option<i32>,
    /// When unset the replica count is left to whoever scales the StatefulSet
    pub replicas: Option<i32>,
    #[serde(default)]
    pub env: Vec<EnvVarSpec>,
    pub resources: Option<ResourceRequirements>,
    pub model_cache: Option<ModelCacheConfig>,
}

/// The status object of `EmbeddingServer`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingServerStatus {
    pub phase: Option<Phase>,
    pub message: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub ready_replicas: i32,
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<ApplicationCondition>,
}

impl_status_resource!(EmbeddingServer, EmbeddingServerStatus);
impl_observed_status!(EmbeddingServerStatus, phase, url);

impl EmbeddingServer {
    pub fn port(&self) -> i32 {
        self.spec.port.unwrap_or(EMBEDDING_PORT)
    }
}
