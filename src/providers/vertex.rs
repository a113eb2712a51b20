//! Google Vertex-AI adapter.
//!
//! Identical translation to the Gemini adapter; only the URL base and the
//! structured credential differ.

use async_trait::async_trait;

use crate::auth::Credential;
use crate::error::GatewayError;
use crate::openai::{ChatRequest, ChatResponse, ModelEntry};
use crate::providers::gemini::{complete_gemini, read_upstream_json, stream_gemini};
use crate::providers::{Provider, SseStream};
use crate::store::ProviderType;

pub struct VertexProvider {
    http: reqwest::Client,
}

impl VertexProvider {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

fn vertex_parts(credential: &Credential) -> Result<(&str, &str, &str), GatewayError> {
    match credential {
        Credential::Vertex {
            api_key,
            project_id,
            region,
        } => Ok((api_key, project_id, region)),
        _ => Err(GatewayError::InvalidRequest(
            "Invalid Vertex AI credentials".into(),
        )),
    }
}

fn model_base(project_id: &str, region: &str) -> String {
    format!(
        "https://{region}-aiplatform.googleapis.com/v1beta1/projects/{project_id}/locations/{region}/publishers/google/models"
    )
}

#[async_trait]
impl Provider for VertexProvider {
    fn name(&self) -> ProviderType {
        ProviderType::VertexAi
    }

    async fn complete(
        &self,
        request: &ChatRequest,
        credential: &Credential,
    ) -> Result<ChatResponse, GatewayError> {
        let (api_key, project_id, region) = vertex_parts(credential)?;
        let url = format!(
            "{}/{}:generateContent?key={}",
            model_base(project_id, region),
            request.model,
            api_key
        );
        complete_gemini(&self.http, &url, request).await
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        credential: &Credential,
    ) -> Result<SseStream, GatewayError> {
        let (api_key, project_id, region) = vertex_parts(credential)?;
        let url = format!(
            "{}/{}:streamGenerateContent?alt=sse&key={}",
            model_base(project_id, region),
            request.model,
            api_key
        );
        stream_gemini(&self.http, &url, request).await
    }

    async fn list_models(
        &self,
        credential: &Credential,
    ) -> Result<Vec<ModelEntry>, GatewayError> {
        let (api_key, project_id, region) = vertex_parts(credential)?;
        let url = format!("{}?key={}", model_base(project_id, region), api_key);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| GatewayError::provider(crate::error::sanitize_secrets(&e.to_string())))?;
        let body = read_upstream_json(response).await?;

        let models = body
            .get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                    .map(|name| name.rsplit('/').next().unwrap_or(name))
                    .filter(|id| id.contains("gemini"))
                    .map(|id| ModelEntry::new(id, "google"))
                    .collect()
            })
            .unwrap_or_default();

        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_base_interpolation() {
        let base = model_base("proj-1", "us-central1");
        assert_eq!(
            base,
            "https://us-central1-aiplatform.googleapis.com/v1beta1/projects/proj-1/locations/us-central1/publishers/google/models"
        );
    }

    #[test]
    fn test_vertex_parts_requires_structured_credential() {
        let cred = Credential::Vertex {
            api_key: "AIzaX".into(),
            project_id: "p".into(),
            region: "asia-northeast1".into(),
        };
        assert!(vertex_parts(&cred).is_ok());
        assert!(vertex_parts(&Credential::ApiKey("AIzaX".into())).is_err());
    }
}
