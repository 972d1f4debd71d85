pub mod client;
pub mod rerank;

pub use client::GeminiClient;

use async_trait::async_trait;

/// Dense-vector embedding collaborator. Two entry points with identical
/// semantics but distinct log labels, so window and query traffic can be
/// told apart.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_window(&self, text: &str) -> anyhow::Result<Vec<f32>>;
    async fn embed_query(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// Generative model collaborator.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Messages that indicate a transient upstream condition worth retrying.
const RETRYABLE_MARKERS: [&str; 9] = [
    "rate limit",
    "overloaded",
    "UNAVAILABLE",
    "RESOURCE_EXHAUSTED",
    "DEADLINE_EXCEEDED",
    "fetch failed",
    "ECONNRESET",
    "ETIMEDOUT",
    "timeout",
];

pub(crate) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

pub(crate) fn is_retryable_message(message: &str) -> bool {
    RETRYABLE_MARKERS.iter().any(|marker| message.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        for status in [429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status), "{} should retry", status);
        }
        for status in [400, 401, 403, 404] {
            assert!(!is_retryable_status(status), "{} should not retry", status);
        }
    }

    #[test]
    fn test_retryable_messages() {
        assert!(is_retryable_message("googleapi: RESOURCE_EXHAUSTED"));
        assert!(is_retryable_message("upstream connect timeout"));
        assert!(is_retryable_message("read ECONNRESET"));
        assert!(is_retryable_message("model is overloaded, try later"));
        assert!(!is_retryable_message("invalid argument: bad dimension"));
    }
}
