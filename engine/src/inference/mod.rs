//! Judgment-step gateway.
//!
//! Every reasoning step the loop takes (planning, hypothesis revision,
//! discovery extraction, reflection, continuation judgment) goes through
//! [`InferenceGateway::infer`], which returns opaque text. Consumers must
//! never trust that text to be well-formed - they parse it through the
//! decode chain in [`decode`] and fall back component-by-component.

use async_trait::async_trait;
use serde_json::json;

pub mod decode;

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("inference transport error: {0}")]
    Transport(String),
    #[error("inference provider returned {status}: {message}")]
    Provider { status: u16, message: String },
    #[error("inference response missing content")]
    EmptyResponse,
}

/// The judgment/inference step consumed by all reasoning components.
#[async_trait]
pub trait InferenceGateway: Send + Sync {
    /// Run one judgment call. `role` names the calling component
    /// (planner, hypothesis, discovery, reflection, decider) for tracing
    /// and model routing.
    async fn infer(&self, role: &str, prompt: &str) -> Result<String, InferenceError>;
}

/// Connection settings for the default HTTP gateway.
#[derive(Debug, Clone)]
pub struct InferenceSettings {
    /// Base URL of an OpenAI-compatible chat completions endpoint.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub request_timeout: std::time::Duration,
}

/// Default gateway: OpenAI-compatible `/chat/completions` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpInferenceGateway {
    client: reqwest::Client,
    settings: InferenceSettings,
}

impl HttpInferenceGateway {
    pub fn new(settings: InferenceSettings) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| InferenceError::Transport(e.to_string()))?;
        Ok(Self { client, settings })
    }
}

#[async_trait]
impl InferenceGateway for HttpInferenceGateway {
    async fn infer(&self, role: &str, prompt: &str) -> Result<String, InferenceError> {
        let url = format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        );
        let body = json!({
            "model": self.settings.model,
            "messages": [
                { "role": "user", "content": prompt },
            ],
        });

        tracing::debug!(role, model = %self.settings.model, "Dispatching inference call");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(InferenceError::Provider {
                status: status.as_u16(),
                message,
            });
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| InferenceError::Transport(e.to_string()))?;

        payload
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .map(ToString::to_string)
            .ok_or(InferenceError::EmptyResponse)
    }
}
