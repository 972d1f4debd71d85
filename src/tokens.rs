//! Token counting and budget enforcement for LLM input.
//!
//! Local estimation runs a cl100k byte-pair encoding with zero I/O and is a
//! lower bound for Gemini's own tokenizer. Precise counts go through the
//! remote countTokens endpoint and degrade back to the local estimate when
//! the endpoint is unavailable. Failures never surface to callers.

use rand::Rng;
use serde_json::json;
use std::sync::OnceLock;
use tiktoken_rs::{cl100k_base, CoreBPE};
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Break characters for truncation snapping, covering Japanese and ASCII
/// sentence/clause boundaries plus common closing brackets.
const BREAK_CHARS: [char; 9] = ['\n', '。', '、', '.', ',', ' ', '}', ']', ')'];

/// How far back (in chars) the truncation point may move to land on a break.
const SNAP_WINDOW: usize = 100;

const COUNT_MAX_ATTEMPTS: u32 = 5;
const COUNT_BASE_DELAY_MS: u64 = 250;

fn bpe() -> &'static CoreBPE {
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    BPE.get_or_init(|| cl100k_base().expect("cl100k vocabulary is bundled"))
}

/// Result of [`TokenCounter::ensure_within_limit`].
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedText {
    pub text: String,
    pub tokens: usize,
    pub truncated: bool,
}

#[derive(Clone)]
pub struct TokenCounter {
    http: reqwest::Client,
    api_keys: Vec<String>,
    model: String,
    max_tokens: usize,
    safety_margin: usize,
}

impl TokenCounter {
    pub fn new(config: &crate::config::Config, http: reqwest::Client) -> Self {
        Self {
            http,
            api_keys: config.gemini_api_keys.clone(),
            model: config.chat_model.clone(),
            max_tokens: config.max_input_tokens,
            safety_margin: config.llm_token_safety_margin,
        }
    }

    /// Test constructor without remote credentials; precise counting falls
    /// straight back to the local estimate.
    #[cfg(test)]
    pub fn local_only(max_tokens: usize, safety_margin: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_keys: Vec::new(),
            model: "test-model".to_string(),
            max_tokens,
            safety_margin,
        }
    }

    /// Local, zero-I/O token estimate.
    pub fn estimate(&self, text: &str) -> usize {
        bpe().encode_ordinary(text).len()
    }

    /// Count tokens via the remote countTokens endpoint, retrying transient
    /// failures (429/5xx, timeouts, connection resets) with exponential
    /// backoff. Falls back to [`Self::estimate`] on exhaustion.
    pub async fn count_precisely(&self, text: &str) -> usize {
        if self.api_keys.is_empty() {
            return self.estimate(text);
        }

        let mut delay = Duration::from_millis(COUNT_BASE_DELAY_MS);
        for attempt in 1..=COUNT_MAX_ATTEMPTS {
            match self.count_tokens_once(text).await {
                Ok(n) => return n,
                Err(e) if e.retryable && attempt < COUNT_MAX_ATTEMPTS => {
                    debug!(
                        "countTokens attempt {}/{} failed ({}), retrying in {:?}",
                        attempt, COUNT_MAX_ATTEMPTS, e.detail, delay
                    );
                    sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    warn!(
                        "countTokens failed ({}), falling back to local estimate",
                        e.detail
                    );
                    return self.estimate(text);
                }
            }
        }
        self.estimate(text)
    }

    async fn count_tokens_once(&self, text: &str) -> Result<usize, CountError> {
        let key = &self.api_keys[rand::thread_rng().gen_range(0..self.api_keys.len())];
        let url = format!(
            "{}/models/{}:countTokens",
            GEMINI_API_BASE, self.model
        );
        let body = json!({
            "contents": [{ "parts": [{ "text": text }] }]
        });

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CountError {
                retryable: e.is_timeout() || e.is_connect() || e.is_request(),
                detail: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CountError {
                retryable: status.as_u16() == 429 || status.is_server_error(),
                detail: format!("countTokens returned {}", status),
            });
        }

        let payload: serde_json::Value = response.json().await.map_err(|e| CountError {
            retryable: true,
            detail: e.to_string(),
        })?;
        payload["totalTokens"]
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| CountError {
                retryable: false,
                detail: "countTokens response missing totalTokens".to_string(),
            })
    }

    /// Binary-search the largest prefix whose precise token count fits the
    /// limit, then snap backward to the nearest break character so the cut
    /// does not land mid-word. O(log |text|) precise counts.
    pub async fn truncate(&self, text: &str, limit: usize) -> String {
        let chars: Vec<char> = text.chars().collect();
        if chars.is_empty() || self.count_precisely(text).await <= limit {
            return text.to_string();
        }

        let mut lo = 0usize;
        let mut hi = chars.len();
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            let prefix: String = chars[..mid].iter().collect();
            if self.count_precisely(&prefix).await <= limit {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }

        let cut = snap_to_break(&chars, lo);
        chars[..cut].iter().collect()
    }

    /// Keep `text` within `max_tokens - safety_margin`. Fast path trusts the
    /// local estimate; only texts near the boundary pay for precise counting
    /// and, if still over, truncation.
    pub async fn ensure_within_limit(&self, text: &str) -> BoundedText {
        let budget = self.max_tokens.saturating_sub(self.safety_margin);

        let estimated = self.estimate(text);
        if estimated <= budget {
            return BoundedText {
                text: text.to_string(),
                tokens: estimated,
                truncated: false,
            };
        }

        let precise = self.count_precisely(text).await;
        if precise <= budget {
            return BoundedText {
                text: text.to_string(),
                tokens: precise,
                truncated: false,
            };
        }

        let truncated = self.truncate(text, budget).await;
        let tokens = self.count_precisely(&truncated).await;
        BoundedText {
            text: truncated,
            tokens,
            truncated: true,
        }
    }
}

struct CountError {
    retryable: bool,
    detail: String,
}

/// Move a char-index cut point backward (at most [`SNAP_WINDOW`] chars) so the
/// text ends just after a break character. Keeps the original cut when no
/// break exists in the window.
fn snap_to_break(chars: &[char], cut: usize) -> usize {
    if cut == 0 || cut >= chars.len() {
        return cut;
    }
    let floor = cut.saturating_sub(SNAP_WINDOW);
    for i in (floor..cut).rev() {
        if BREAK_CHARS.contains(&chars[i]) {
            return i + 1;
        }
    }
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_is_nonzero_for_text() {
        let counter = TokenCounter::local_only(2048, 128);
        assert_eq!(counter.estimate(""), 0);
        assert!(counter.estimate("hello world") >= 2);
        // Roughly 4 chars per token for plain ASCII prose.
        let long = "the quick brown fox jumps over the lazy dog ".repeat(20);
        let est = counter.estimate(&long);
        assert!(est > long.len() / 8 && est < long.len());
    }

    #[test]
    fn test_snap_to_break_prefers_nearest_break() {
        let chars: Vec<char> = "hello world, this is a test".chars().collect();
        // Cut in the middle of "test": snaps back past the last space.
        let cut = snap_to_break(&chars, 25);
        assert_eq!(chars[cut - 1], ' ');

        // No break chars at all: cut stays put.
        let solid: Vec<char> = "abcdefghij".chars().collect();
        assert_eq!(snap_to_break(&solid, 5), 5);
    }

    #[test]
    fn test_snap_to_break_japanese_punctuation() {
        let chars: Vec<char> = "今日は良い天気です。明日も晴れるでしょう".chars().collect();
        let cut = snap_to_break(&chars, chars.len() - 1);
        assert_eq!(chars[cut - 1], '。');
    }

    #[tokio::test]
    async fn test_truncate_ends_on_break_character() {
        let counter = TokenCounter::local_only(2048, 128);
        let text = "word ".repeat(2000);
        let out = counter.truncate(&text, 100).await;
        assert!(counter.estimate(&out) <= 100);
        assert!(out.ends_with(' '), "expected break char, got {:?}", out.chars().last());
        assert!(!out.is_empty());
    }

    #[tokio::test]
    async fn test_truncate_noop_when_under_limit() {
        let counter = TokenCounter::local_only(2048, 128);
        let text = "short text";
        assert_eq!(counter.truncate(text, 100).await, text);
    }

    #[tokio::test]
    async fn test_ensure_within_limit_passthrough() {
        let counter = TokenCounter::local_only(2048, 128);
        let out = counter.ensure_within_limit("a small message").await;
        assert!(!out.truncated);
        assert_eq!(out.text, "a small message");
        assert!(out.tokens <= 2048 - 128);
    }

    #[tokio::test]
    async fn test_ensure_within_limit_truncates_over_budget() {
        let counter = TokenCounter::local_only(100, 10);
        let text = "x ".repeat(5000);
        let out = counter.ensure_within_limit(&text).await;
        assert!(out.truncated);
        assert!(out.tokens <= 90);
        assert!(out.text.len() < text.len());
    }
}
