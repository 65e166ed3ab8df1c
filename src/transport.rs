use async_trait::async_trait;
use reqwest::Client;

use crate::config::{API_KEY_ENV, ProviderConfig};
use crate::error::{ProviderError, Result, TriageError};
use crate::models::{ApiErrorEnvelope, GenerateRequest, GenerateResponse};

/// One generation call against one model. Implementations do not retry.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        req: &GenerateRequest,
    ) -> std::result::Result<String, ProviderError>;
}

pub struct GeminiTransport {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiTransport {
    /// Fails fast when no credential was configured.
    pub fn new(cfg: &ProviderConfig, timeout: std::time::Duration) -> Result<Self> {
        let api_key = cfg
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| TriageError::Config(format!("{API_KEY_ENV} is not set")))?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent", self.base_url, model)
    }
}

#[async_trait]
impl Transport for GeminiTransport {
    async fn generate(
        &self,
        model: &str,
        req: &GenerateRequest,
    ) -> std::result::Result<String, ProviderError> {
        let response = self
            .client
            .post(self.endpoint(model))
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(req)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Network(format!("Failed to read response body: {e}")))?;

        if status.is_success() {
            extract_text(&body)
        } else {
            Err(classify_failure(status.as_u16(), &body))
        }
    }
}

/// Turn a non-success response into a classified error.
/// The body's `error.status` wins over the HTTP code when it names a transient condition.
pub fn classify_failure(status: u16, body: &str) -> ProviderError {
    let parsed = serde_json::from_str::<ApiErrorEnvelope>(body).ok();
    let message = parsed
        .as_ref()
        .map(|env| env.error.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| body.trim().to_string());

    match parsed.and_then(|env| env.error.status).as_deref() {
        Some("RESOURCE_EXHAUSTED") => ProviderError::ResourceExhausted(message),
        Some("UNAVAILABLE") => ProviderError::Unavailable(message),
        _ => ProviderError::from_status(status, message),
    }
}

/// Pull the generated text out of a successful response body.
pub fn extract_text(body: &str) -> std::result::Result<String, ProviderError> {
    if body.trim().is_empty() {
        return Err(ProviderError::EmptyResponse);
    }
    let response: GenerateResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::Decode(e.to_string()))?;

    let text: String = response
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|content| content.parts.iter().map(|p| p.text.as_str()).collect())
        .unwrap_or_default();

    if !text.trim().is_empty() {
        return Ok(text);
    }

    if let Some(reason) = response
        .prompt_feedback
        .and_then(|feedback| feedback.block_reason)
    {
        return Err(ProviderError::SafetyBlocked(reason));
    }
    if response
        .candidates
        .first()
        .and_then(|c| c.finish_reason.as_deref())
        .is_some_and(|reason| reason == "SAFETY")
    {
        return Err(ProviderError::SafetyBlocked("finishReason SAFETY".to_string()));
    }

    Err(ProviderError::EmptyResponse)
}
