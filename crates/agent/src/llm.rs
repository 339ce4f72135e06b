//! Chat-completions port and the OpenAI-compatible implementation.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use metamcp_core::{GatewayError, Result};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TEMPERATURE: f32 = 0.2;

/// One JSON-mode chat call.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    /// Defaults to 30 s.
    pub timeout: Option<Duration>,
    /// Defaults to the client's configured base URL.
    pub base_url: Option<String>,
}

/// Chat-completions provider. The response must be a single JSON object.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat_json(&self, request: ChatRequest) -> Result<Value>;
}

/// `ChatClient` over any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiChatClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiChatClient {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }
}

#[async_trait]
impl ChatClient for OpenAiChatClient {
    async fn chat_json(&self, request: ChatRequest) -> Result<Value> {
        let base = request
            .base_url
            .as_deref()
            .unwrap_or(&self.base_url)
            .trim_end_matches('/');
        let url = format!("{base}/chat/completions");

        let body = json!({
            "model": request.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user},
            ],
            "temperature": DEFAULT_TEMPERATURE,
            "response_format": {"type": "json_object"},
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(request.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Internal(format!("chat provider request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(GatewayError::Internal(format!(
                "chat provider returned {status}: {detail}"
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Internal(format!("chat provider sent invalid JSON: {e}")))?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                GatewayError::Internal("chat provider response missing message content".into())
            })?;

        serde_json::from_str(content).map_err(|e| {
            GatewayError::Internal(format!("chat model did not return valid JSON: {e}"))
        })
    }
}
