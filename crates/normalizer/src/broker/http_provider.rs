use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ProviderError;
use crate::model::ProviderConfig;

use super::provider::{ModelInfo, Provider, ProviderHealth};

#[derive(Debug, Deserialize)]
struct NormalizeResponse {
    result: String,
}

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    index: usize,
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<RemoteModel>,
}

#[derive(Debug, Deserialize)]
struct RemoteModel {
    name: String,
    quality_tier: Option<String>,
    speed_tier: Option<String>,
}

/// Talks to a single AI provider over HTTP: `POST {base_url}/normalize` and
/// `POST {base_url}/classify`, bearer-authenticated, each request tagged with
/// a fresh `X-Request-ID` for upstream correlation.
pub struct HttpProvider {
    http: Client,
    base_url: String,
    api_key: String,
    name: String,
}

impl HttpProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(client: Client, config: &ProviderConfig) -> Self {
        Self {
            http: client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            name: config.name.clone(),
        }
    }

    fn request_id() -> String {
        Uuid::new_v4().to_string()
    }

    async fn map_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ProviderError::Authentication(body)
            }
            StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimitExceeded {
                details: body,
                retry_delay: None,
            },
            s if s.is_server_error() => ProviderError::ServerError(body),
            s => ProviderError::RequestFailed(format!("{}: {}", s, body)),
        })
    }

    fn to_network_error(err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else {
            ProviderError::NetworkError(err.to_string())
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn normalize(&self, input: &str) -> Result<String, ProviderError> {
        let resp = self
            .http
            .post(format!("{}/normalize", self.base_url))
            .bearer_auth(&self.api_key)
            .header("X-Request-ID", Self::request_id())
            .json(&serde_json::json!({ "input": input }))
            .send()
            .await
            .map_err(Self::to_network_error)?;
        let resp = Self::map_status(resp).await?;
        let body: NormalizeResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::EmptyResponse(e.to_string()))?;
        Ok(body.result)
    }

    async fn classify(
        &self,
        name: &str,
        category: Option<&str>,
        candidates: &[String],
    ) -> Result<(usize, f64), ProviderError> {
        let resp = self
            .http
            .post(format!("{}/classify", self.base_url))
            .bearer_auth(&self.api_key)
            .header("X-Request-ID", Self::request_id())
            .json(&serde_json::json!({
                "name": name,
                "category": category,
                "candidates": candidates,
            }))
            .send()
            .await
            .map_err(Self::to_network_error)?;
        let resp = Self::map_status(resp).await?;
        let body: ClassifyResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::EmptyResponse(e.to_string()))?;
        if body.index >= candidates.len() {
            return Err(ProviderError::RequestFailed(
                "classify response index out of range".to_string(),
            ));
        }
        Ok((body.index, body.confidence))
    }

    async fn get_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let resp = self
            .http
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .header("X-Request-ID", Self::request_id())
            .send()
            .await
            .map_err(Self::to_network_error)?;
        let resp = Self::map_status(resp).await?;
        let body: ModelsResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::EmptyResponse(e.to_string()))?;
        Ok(body
            .models
            .into_iter()
            .map(|m| ModelInfo {
                name: m.name,
                quality_tier: m.quality_tier,
                speed_tier: m.speed_tier,
            })
            .collect())
    }

    async fn check(&self) -> ProviderHealth {
        let resp = self
            .http
            .get(format!("{}/health", self.base_url))
            .bearer_auth(&self.api_key)
            .header("X-Request-ID", Self::request_id())
            .send()
            .await;
        match resp {
            Ok(r) if r.status().is_success() => ProviderHealth::Healthy,
            Ok(_) => ProviderHealth::Degraded,
            Err(_) => ProviderHealth::Unreachable,
        }
    }
}
