//! HTTP client for the persistent store.
//!
//! The store is an external service; this module is pure transport. Every
//! operation is a JSON POST to `{STORE_URL}/api/<op>` authenticated with the
//! admin key header. Entity shapes mirror what the store persists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::GatewayError;

/// Upstream providers a user can hold credentials for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderType {
    #[serde(rename = "anthropic-agent")]
    AnthropicAgent,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "vertex-ai")]
    VertexAi,
    #[serde(rename = "openrouter")]
    OpenRouter,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::AnthropicAgent => "anthropic-agent",
            ProviderType::Gemini => "gemini",
            ProviderType::VertexAi => "vertex-ai",
            ProviderType::OpenRouter => "openrouter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "anthropic-agent" => Some(ProviderType::AnthropicAgent),
            "gemini" => Some(ProviderType::Gemini),
            "vertex-ai" => Some(ProviderType::VertexAi),
            "openrouter" => Some(ProviderType::OpenRouter),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyKeyRecord {
    pub key_id: String,
    pub user_id: String,
    pub hashed_key: String,
    pub key_prefix: String,
    pub name: String,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_minute: Option<u32>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamCredentialRecord {
    pub user_id: String,
    pub provider_type: ProviderType,
    pub encrypted_api_key: String,
    pub iv: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthTokenRecord {
    pub user_id: String,
    pub encrypted_access_token: String,
    pub access_token_iv: String,
    pub encrypted_refresh_token: String,
    pub refresh_token_iv: String,
    /// Epoch milliseconds; absent when the upstream omitted `expires_in`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPromptPreset {
    pub user_id: String,
    pub name: String,
    pub content: String,
    pub is_default: bool,
    #[serde(default)]
    pub associated_models: Option<Vec<String>>,
}

/// Append-only usage record. Written fire-and-forget after each request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLogEntry {
    pub user_id: String,
    pub key_id: String,
    pub provider_type: Option<String>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    pub latency_ms: u64,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streamed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_tools: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

pub struct StoreClient {
    base_url: String,
    admin_key: String,
    http: reqwest::Client,
}

impl StoreClient {
    pub fn new(base_url: String, admin_key: String, http: reqwest::Client) -> Self {
        Self {
            base_url,
            admin_key,
            http,
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        op: &str,
        body: serde_json::Value,
    ) -> Result<T, GatewayError> {
        let response = self
            .http
            .post(format!("{}/api/{}", self.base_url, op))
            .header("x-admin-key", &self.admin_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Provider {
                status: 500,
                message: format!("Store request failed: {e}"),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Provider {
                status: 500,
                message: format!("Store returned {status}: {text}"),
            });
        }

        response.json().await.map_err(|e| GatewayError::Provider {
            status: 500,
            message: format!("Failed to parse store response: {e}"),
        })
    }

    pub async fn get_key_by_hash(
        &self,
        hashed_key: &str,
    ) -> Result<Option<ProxyKeyRecord>, GatewayError> {
        self.call("keys/by-hash", json!({ "hashedKey": hashed_key }))
            .await
    }

    pub async fn list_keys(&self, user_id: &str) -> Result<Vec<ProxyKeyRecord>, GatewayError> {
        self.call("keys/list", json!({ "userId": user_id })).await
    }

    pub async fn insert_key(&self, record: &ProxyKeyRecord) -> Result<(), GatewayError> {
        let _: serde_json::Value = self
            .call("keys/insert", serde_json::to_value(record).unwrap_or_default())
            .await?;
        Ok(())
    }

    pub async fn touch_key_last_used(&self, key_id: &str) -> Result<(), GatewayError> {
        let _: serde_json::Value = self
            .call("keys/touch", json!({ "keyId": key_id }))
            .await?;
        Ok(())
    }

    pub async fn get_credential(
        &self,
        user_id: &str,
        provider_type: ProviderType,
    ) -> Result<Option<UpstreamCredentialRecord>, GatewayError> {
        self.call(
            "credentials/get",
            json!({ "userId": user_id, "providerType": provider_type.as_str() }),
        )
        .await
    }

    pub async fn list_credentials(
        &self,
        user_id: &str,
    ) -> Result<Vec<UpstreamCredentialRecord>, GatewayError> {
        self.call("credentials/list", json!({ "userId": user_id }))
            .await
    }

    pub async fn upsert_credential(
        &self,
        user_id: &str,
        provider_type: ProviderType,
        encrypted_api_key: &str,
        iv: &str,
    ) -> Result<(), GatewayError> {
        let _: serde_json::Value = self
            .call(
                "credentials/upsert",
                json!({
                    "userId": user_id,
                    "providerType": provider_type.as_str(),
                    "encryptedApiKey": encrypted_api_key,
                    "iv": iv,
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn get_oauth_tokens(
        &self,
        user_id: &str,
    ) -> Result<Option<OAuthTokenRecord>, GatewayError> {
        self.call("oauth/get", json!({ "userId": user_id })).await
    }

    pub async fn upsert_oauth_tokens(&self, record: &OAuthTokenRecord) -> Result<(), GatewayError> {
        let _: serde_json::Value = self
            .call(
                "oauth/upsert",
                serde_json::to_value(record).unwrap_or_default(),
            )
            .await?;
        Ok(())
    }

    pub async fn delete_oauth_tokens(&self, user_id: &str) -> Result<(), GatewayError> {
        let _: serde_json::Value = self.call("oauth/delete", json!({ "userId": user_id })).await?;
        Ok(())
    }

    pub async fn list_all_oauth_tokens(&self) -> Result<Vec<OAuthTokenRecord>, GatewayError> {
        self.call("oauth/list-all", json!({})).await
    }

    pub async fn insert_usage_log(&self, entry: &UsageLogEntry) -> Result<(), GatewayError> {
        let _: serde_json::Value = self
            .call(
                "usage/insert",
                serde_json::to_value(entry).unwrap_or_default(),
            )
            .await?;
        Ok(())
    }

    pub async fn get_system_prompt_for_model(
        &self,
        user_id: &str,
        model: &str,
    ) -> Result<Option<SystemPromptPreset>, GatewayError> {
        self.call(
            "system-prompts/for-model",
            json!({ "userId": user_id, "model": model }),
        )
        .await
    }
}
