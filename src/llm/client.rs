//! Gemini REST client for embeddings and generation.
//!
//! Credentials form a pool of equivalent keys; each call picks one uniformly
//! at random (stateless load balancing across quota buckets). Embedding
//! calls retry transient failures with jittered exponential backoff;
//! non-retryable failures propagate immediately.

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use super::{is_retryable_message, is_retryable_status, Embedder, Generator};
use crate::config::Config;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const EMBED_MAX_ATTEMPTS: u32 = 10;

const GENERATION_TEMPERATURE: f64 = 0.3;
const GENERATION_TOP_P: f64 = 0.9;
const GENERATION_MAX_OUTPUT_TOKENS: u32 = 2048;

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_keys: Vec<String>,
    embedding_model: String,
    chat_model: String,
    embedding_dim: usize,
}

#[derive(Debug)]
struct ApiError {
    status: Option<u16>,
    message: String,
}

impl ApiError {
    fn retryable(&self) -> bool {
        self.status.map(is_retryable_status).unwrap_or(false)
            || is_retryable_message(&self.message)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {}: {}", status, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl GeminiClient {
    pub fn new(config: &Config, http: reqwest::Client) -> Self {
        Self {
            http,
            api_keys: config.gemini_api_keys.clone(),
            embedding_model: config.embedding_model.clone(),
            chat_model: config.chat_model.clone(),
            embedding_dim: config.embedding_dim,
        }
    }

    fn pick_key(&self) -> &str {
        let idx = rand::thread_rng().gen_range(0..self.api_keys.len());
        &self.api_keys[idx]
    }

    async fn embed_with_retry(&self, text: &str, label: &str) -> anyhow::Result<Vec<f32>> {
        for attempt in 0..EMBED_MAX_ATTEMPTS {
            match self.embed_once(text).await {
                Ok(vector) => {
                    debug!("{}: embedded {} chars", label, text.chars().count());
                    return Ok(vector);
                }
                Err(e) if e.retryable() && attempt + 1 < EMBED_MAX_ATTEMPTS => {
                    let delay = backoff_with_jitter(attempt);
                    warn!(
                        "{}: attempt {}/{} failed ({}), retrying in {:.1}s",
                        label,
                        attempt + 1,
                        EMBED_MAX_ATTEMPTS,
                        e,
                        delay.as_secs_f64()
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    return Err(anyhow::anyhow!("{} failed: {}", label, e));
                }
            }
        }
        unreachable!("retry loop always returns")
    }

    async fn embed_once(&self, text: &str) -> Result<Vec<f32>, ApiError> {
        let url = format!(
            "{}/models/{}:embedContent",
            GEMINI_API_BASE, self.embedding_model
        );
        let body = json!({
            "model": format!("models/{}", self.embedding_model),
            "content": { "parts": [{ "text": text }] },
            "outputDimensionality": self.embedding_dim,
        });

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", self.pick_key())
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError {
                status: None,
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError {
                status: Some(status.as_u16()),
                message,
            });
        }

        let payload: serde_json::Value = response.json().await.map_err(|e| ApiError {
            status: None,
            message: e.to_string(),
        })?;
        let values = payload["embedding"]["values"]
            .as_array()
            .ok_or_else(|| ApiError {
                status: None,
                message: "embedContent response missing embedding.values".to_string(),
            })?;
        Ok(values
            .iter()
            .filter_map(|v| v.as_f64())
            .map(|v| v as f32)
            .collect())
    }
}

#[async_trait]
impl Embedder for GeminiClient {
    async fn embed_window(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.embed_with_retry(text, "embedWindow").await
    }

    async fn embed_query(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.embed_with_retry(text, "embedQuery").await
    }
}

#[async_trait]
impl Generator for GeminiClient {
    async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
        let url = format!(
            "{}/models/{}:generateContent",
            GEMINI_API_BASE, self.chat_model
        );
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "temperature": GENERATION_TEMPERATURE,
                "topP": GENERATION_TOP_P,
                "maxOutputTokens": GENERATION_MAX_OUTPUT_TOKENS,
            },
        });

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", self.pick_key())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("generateContent returned {}: {}", status, message));
        }

        let payload: serde_json::Value = response.json().await?;
        let parts = payload["candidates"][0]["content"]["parts"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let answer: String = parts
            .iter()
            .filter_map(|part| part["text"].as_str())
            .collect::<Vec<_>>()
            .concat();
        if answer.is_empty() {
            return Err(anyhow::anyhow!("generateContent returned no text parts"));
        }
        Ok(answer)
    }
}

/// `2^attempt` seconds plus up to two seconds of uniform jitter.
fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = 2f64.powi(attempt as i32);
    let jitter: f64 = rand::thread_rng().gen_range(0.0..2.0);
    Duration::from_secs_f64(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_exponentially() {
        for attempt in 0..6 {
            let delay = backoff_with_jitter(attempt).as_secs_f64();
            let base = 2f64.powi(attempt as i32);
            assert!(delay >= base && delay < base + 2.0, "attempt {}: {}", attempt, delay);
        }
    }

    #[test]
    fn test_api_error_retryable_by_status_and_message() {
        let rate_limited = ApiError {
            status: Some(429),
            message: String::new(),
        };
        assert!(rate_limited.retryable());

        let transient_text = ApiError {
            status: None,
            message: "the model is overloaded".to_string(),
        };
        assert!(transient_text.retryable());

        let bad_request = ApiError {
            status: Some(400),
            message: "invalid dimension".to_string(),
        };
        assert!(!bad_request.retryable());
    }
}
