//! HTTP client for an Ollama-compatible LLM service.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::TokenBucket;
use crate::config::LlmConfig;
use crate::error::{PipelineError, Result};

/// Transport retries within one adapter call.
const MAX_TRANSPORT_RETRIES: u32 = 3;

/// LLM adapter. Cloning shares the HTTP connection pool and the rate
/// limiter.
#[derive(Clone)]
pub struct LlmClient {
    config: LlmConfig,
    client: Client,
    limiter: Arc<TokenBucket>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<String>>,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .expect("reqwest client");
        let limiter = Arc::new(TokenBucket::new(config.rate_per_minute));
        Self {
            config,
            client,
            limiter,
        }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    /// Probe the service, for the health endpoint.
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.config.endpoint);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Text completion with the configured model.
    pub async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        self.generate(&self.config.model, prompt, None, max_tokens)
            .await
    }

    /// Vision completion: page images attached as base64 payloads.
    pub async fn complete_vision(
        &self,
        prompt: &str,
        image_paths: &[&Path],
        max_tokens: u32,
    ) -> Result<String> {
        let mut images = Vec::with_capacity(image_paths.len());
        for path in image_paths {
            let bytes = std::fs::read(path)?;
            images.push(base64::engine::general_purpose::STANDARD.encode(bytes));
        }
        self.generate(&self.config.vision_model, prompt, Some(images), max_tokens)
            .await
    }

    /// Truncate prompt content to the configured budget at a UTF-8
    /// boundary.
    pub fn truncate_content<'a>(&self, text: &'a str) -> &'a str {
        let max = self.config.max_content_chars;
        if text.len() <= max {
            return text;
        }
        let mut end = max;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        &text[..end]
    }

    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        images: Option<Vec<String>>,
        max_tokens: u32,
    ) -> Result<String> {
        let request = GenerateRequest {
            model: model.to_string(),
            prompt: prompt.to_string(),
            stream: false,
            images,
            options: GenerateOptions {
                temperature: 0.1,
                num_predict: max_tokens,
            },
        };
        let url = format!("{}/api/generate", self.config.endpoint);

        let mut last_error = String::new();
        for attempt in 1..=MAX_TRANSPORT_RETRIES {
            self.limiter.acquire().await;
            debug!(model, attempt, "llm call");

            match self.client.post(&url).json(&request).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let parsed: GenerateResponse = resp.json().await.map_err(|e| {
                        PipelineError::Upstream(format!("llm response decode: {e}"))
                    })?;
                    return Ok(parsed.response);
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    last_error = format!("llm HTTP {status}: {body}");
                    // 4xx other than 429 will not improve with retries.
                    if status.is_client_error() && status.as_u16() != 429 {
                        return Err(PipelineError::Upstream(last_error));
                    }
                }
                Err(e) => {
                    last_error = format!("llm transport: {e}");
                }
            }

            if attempt < MAX_TRANSPORT_RETRIES {
                let delay = Duration::from_secs(1 << (attempt - 1));
                warn!(attempt, %last_error, "llm call failed, backing off");
                tokio::time::sleep(delay).await;
            }
        }
        Err(PipelineError::Upstream(last_error))
    }
}
