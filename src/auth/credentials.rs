//! Upstream credential resolution.
//!
//! Non-Anthropic providers store a single encrypted secret per
//! (user, provider); the Anthropic path delegates to the OAuth token manager.
//! Plaintext credentials exist only transiently inside a request.

use serde::Deserialize;
use std::sync::Arc;

use crate::auth::oauth::OAuthManager;
use crate::constants::VERTEX_DEFAULT_REGION;
use crate::crypto::Crypto;
use crate::error::GatewayError;
use crate::store::{ProviderType, StoreClient};

/// A live upstream credential, ready for an adapter.
#[derive(Debug, Clone)]
pub enum Credential {
    ApiKey(String),
    Vertex {
        api_key: String,
        project_id: String,
        region: String,
    },
    /// A current Anthropic OAuth access token.
    OAuth(String),
}

impl Credential {
    pub fn api_key(&self) -> &str {
        match self {
            Credential::ApiKey(key) => key,
            Credential::Vertex { api_key, .. } => api_key,
            Credential::OAuth(token) => token,
        }
    }
}

#[derive(Deserialize)]
struct VertexCredentialJson {
    #[serde(rename = "apiKey")]
    api_key: String,
    #[serde(rename = "projectId")]
    project_id: String,
    region: Option<String>,
}

pub struct CredentialResolver {
    store: Arc<StoreClient>,
    crypto: Arc<Crypto>,
    oauth: Arc<OAuthManager>,
}

impl CredentialResolver {
    pub fn new(store: Arc<StoreClient>, crypto: Arc<Crypto>, oauth: Arc<OAuthManager>) -> Self {
        Self {
            store,
            crypto,
            oauth,
        }
    }

    pub async fn resolve(
        &self,
        user_id: &str,
        provider: ProviderType,
    ) -> Result<Credential, GatewayError> {
        if provider == ProviderType::AnthropicAgent {
            let token = self.oauth.get_access_token(user_id).await?;
            return Ok(Credential::OAuth(token));
        }

        let record = self
            .store
            .get_credential(user_id, provider)
            .await?
            .ok_or_else(|| {
                GatewayError::InvalidRequest(format!(
                    "No {} credentials configured",
                    provider.as_str()
                ))
            })?;

        let plaintext = self
            .crypto
            .decrypt(&record.encrypted_api_key, &record.iv)?;

        if provider == ProviderType::VertexAi {
            let parsed: VertexCredentialJson = serde_json::from_str(&plaintext)
                .map_err(|_| GatewayError::InvalidRequest("Invalid Vertex AI credentials".into()))?;
            return Ok(Credential::Vertex {
                api_key: parsed.api_key,
                project_id: parsed.project_id,
                region: parsed
                    .region
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| VERTEX_DEFAULT_REGION.to_string()),
            });
        }

        Ok(Credential::ApiKey(plaintext))
    }

    /// Cheap existence check used by model listing.
    pub async fn is_configured(&self, user_id: &str, provider: ProviderType) -> bool {
        if provider == ProviderType::AnthropicAgent {
            return self.oauth.is_configured(user_id).await;
        }
        matches!(self.store.get_credential(user_id, provider).await, Ok(Some(_)))
    }

    /// Providers this user holds credentials for, in no particular order.
    pub async fn configured_providers(&self, user_id: &str) -> Vec<ProviderType> {
        let mut providers: Vec<ProviderType> = self
            .store
            .list_credentials(user_id)
            .await
            .map(|records| records.into_iter().map(|r| r.provider_type).collect())
            .unwrap_or_default();
        if self.oauth.is_configured(user_id).await
            && !providers.contains(&ProviderType::AnthropicAgent)
        {
            providers.push(ProviderType::AnthropicAgent);
        }
        providers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_credential_json_defaults_region() {
        let parsed: VertexCredentialJson =
            serde_json::from_str(r#"{"apiKey":"AIzaX","projectId":"proj-1"}"#).unwrap();
        assert!(parsed.region.is_none());

        let parsed: VertexCredentialJson = serde_json::from_str(
            r#"{"apiKey":"AIzaX","projectId":"proj-1","region":"us-central1"}"#,
        )
        .unwrap();
        assert_eq!(parsed.region.as_deref(), Some("us-central1"));
    }

    #[test]
    fn test_vertex_credential_json_rejects_garbage() {
        assert!(serde_json::from_str::<VertexCredentialJson>("not json").is_err());
        assert!(serde_json::from_str::<VertexCredentialJson>(r#"{"apiKey":"x"}"#).is_err());
    }
}
