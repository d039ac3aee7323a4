use crate::{SecretKeyRef, conditions::ApplicationCondition};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static AUTHCONFIG_FINALIZER: &str = "mcphive.io/externalauthconfig-finalizer";

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub enum ExternalAuthType {
    TokenExchange,
    HeaderInjection,
    BearerToken,
    #[default]
    Unauthenticated,
}

/// RFC-8693 token exchange
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct TokenExchangeConfig {
    pub token_url: String,
    pub client_id: Option<String>,
    pub client_secret_ref: Option<SecretKeyRef>,
    pub audience: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// access_token (default), id_token or jwt
    pub subject_token_type: Option<String>,
    /// Put the exchanged token in this header instead of Authorization
    pub external_token_header_name: Option<String>,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeaderInjectionConfig {
    pub header_name: String,
    pub value_secret_ref: SecretKeyRef,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BearerTokenConfig {
    pub token_secret_ref: SecretKeyRef,
}

/// Authentication towards an external service, shared by several MCP servers
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[kube(
    kind = "MCPExternalAuthConfig",
    root = "McpExternalAuthConfig",
    status = "McpExternalAuthConfigStatus",
    shortname = "extauth",
    group = "mcphive.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(
    doc = "Custom resource representing an external authentication configuration",
    printcolumn = r#"
    {"name":"Type", "type":"string", "description":"Authentication type", "jsonPath":".spec.type"},
    {"name":"Age",  "type":"date",   "description":"Age", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct McpExternalAuthConfigSpec {
    #[serde(rename = "type")]
    pub auth_type: ExternalAuthType,
    pub token_exchange: Option<TokenExchangeConfig>,
    pub header_injection: Option<HeaderInjectionConfig>,
    pub bearer_token: Option<BearerTokenConfig>,
}

/// The status object of `McpExternalAuthConfig`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McpExternalAuthConfigStatus {
    pub config_hash: Option<String>,
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<ApplicationCondition>,
    #[serde(default)]
    pub referencing_servers: Vec<String>,
}

impl_status_resource!(McpExternalAuthConfig, McpExternalAuthConfigStatus);
impl_observed_status!(McpExternalAuthConfigStatus);

impl McpExternalAuthConfigSpec {
    /// The per-type block must be set exactly when the type asks for it
    pub fn validate(&self) -> Result<(), String> {
        let blocks = [
            (ExternalAuthType::TokenExchange, self.token_exchange.is_some(), "tokenExchange"),
            (ExternalAuthType::HeaderInjection, self.header_injection.is_some(), "headerInjection"),
            (ExternalAuthType::BearerToken, self.bearer_token.is_some(), "bearerToken"),
        ];
        for (auth_type, set, field) in blocks {
            if (auth_type == self.auth_type) != set {
                return Err(format!("{field} configuration must be set if and only if type is '{field}'"));
            }
        }
        Ok(())
    }

    /// Secrets whose content changes the effective configuration
    pub fn secret_refs(&self) -> Vec<&SecretKeyRef> {
        let mut refs = vec![];
        if let Some(te) = self.token_exchange.as_ref() {
            refs.extend(te.client_secret_ref.iter());
        }
        if let Some(hi) = self.header_injection.as_ref() {
            refs.push(&hi.value_secret_ref);
        }
        if let Some(bt) = self.bearer_token.as_ref() {
            refs.push(&bt.token_secret_ref);
        }
        refs
    }
}
