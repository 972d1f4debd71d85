//! Token-bounded message windowing.
//!
//! Groups an ordered channel-date (or thread-date) partition of messages into
//! windows that stay under a token budget, breaking early on temporal gaps
//! and top-level messages. Output is deterministic for identical input and
//! configuration, which makes re-chunking idempotent.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::tokens::TokenCounter;

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    pub max_tokens_per_window: usize,
    pub soft_gap_minutes: i64,
    pub overlap_messages: usize,
}

impl ChunkerConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            max_tokens_per_window: config.max_tokens_per_window,
            soft_gap_minutes: config.soft_gap_minutes,
            overlap_messages: config.overlap_messages,
        }
    }
}

/// One message of a partition, ordered by `created_at` ascending.
#[derive(Debug, Clone)]
pub struct ChunkInput {
    pub id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Channel messages that start a new conversation (thread starters,
    /// non-reply posts) force a window boundary.
    pub is_top_level: bool,
}

/// An emitted window, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowDraft {
    /// 1-based, strictly increasing within the partition.
    pub window_seq: i32,
    pub message_ids: Vec<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub token_est: usize,
    pub text: String,
    pub truncated: bool,
}

/// Single pass over one partition. Soft breaks (time gap over the configured
/// threshold, or a top-level message) and token overflow both flush the
/// rolling buffer; the trailing `overlap_messages` carry into the next
/// buffer for context continuity.
pub async fn chunk_messages(
    counter: &TokenCounter,
    config: &ChunkerConfig,
    messages: &[ChunkInput],
) -> Vec<WindowDraft> {
    let mut windows = Vec::new();
    let mut buffer: Vec<ChunkInput> = Vec::new();
    let mut budget = 0usize;
    let mut last_timestamp: Option<DateTime<Utc>> = None;
    let mut seq = 1i32;

    for message in messages {
        let estimate = counter.estimate(&message.content);
        let would_overflow = budget + estimate > config.max_tokens_per_window;
        let gap_minutes = last_timestamp
            .map(|prev| (message.created_at - prev).num_seconds() as f64 / 60.0)
            .unwrap_or(0.0);
        let soft_break = gap_minutes > config.soft_gap_minutes as f64 || message.is_top_level;

        if !buffer.is_empty() && (would_overflow || soft_break) {
            let window = flush(counter, config, &mut buffer, &mut budget, seq).await;
            windows.push(window);
            seq += 1;
        }

        budget += estimate;
        buffer.push(message.clone());
        last_timestamp = Some(message.created_at);
    }

    if !buffer.is_empty() {
        let window = flush(counter, config, &mut buffer, &mut budget, seq).await;
        windows.push(window);
    }

    windows
}

async fn flush(
    counter: &TokenCounter,
    config: &ChunkerConfig,
    buffer: &mut Vec<ChunkInput>,
    budget: &mut usize,
    seq: i32,
) -> WindowDraft {
    let text = buffer
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let bounded = counter.ensure_within_limit(&text).await;
    if bounded.truncated {
        debug!("window {} text truncated to {} tokens", seq, bounded.tokens);
    }

    let window = WindowDraft {
        window_seq: seq,
        message_ids: buffer.iter().map(|m| m.id.clone()).collect(),
        start_at: buffer[0].created_at,
        end_at: buffer[buffer.len() - 1].created_at,
        token_est: bounded.tokens,
        text: bounded.text,
        truncated: bounded.truncated,
    };

    // Carry the trailing overlap into the next buffer.
    let keep_from = buffer.len().saturating_sub(config.overlap_messages);
    let carried: Vec<ChunkInput> = buffer.split_off(keep_from);
    buffer.clear();
    buffer.extend(carried);
    *budget = buffer.iter().map(|m| counter.estimate(&m.content)).sum();

    window
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn counter() -> TokenCounter {
        TokenCounter::local_only(2048, 128)
    }

    fn config() -> ChunkerConfig {
        ChunkerConfig {
            max_tokens_per_window: 1200,
            soft_gap_minutes: 5,
            overlap_messages: 0,
        }
    }

    fn msg(id: &str, content: &str, minute_offset: i64, top_level: bool) -> ChunkInput {
        ChunkInput {
            id: id.to_string(),
            content: content.to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
                + chrono::Duration::minutes(minute_offset),
            is_top_level: top_level,
        }
    }

    #[tokio::test]
    async fn test_soft_gap_break() {
        let messages = vec![
            msg("1", "first", 0, false),
            msg("2", "second", 1, false),
            msg("3", "after the lull", 10, false),
        ];
        let windows = chunk_messages(&counter(), &config(), &messages).await;

        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].message_ids, vec!["1", "2"]);
        assert_eq!(windows[1].message_ids, vec!["3"]);
        assert_eq!(windows[0].window_seq, 1);
        assert_eq!(windows[1].window_seq, 2);
    }

    #[tokio::test]
    async fn test_top_level_break() {
        let messages = vec![
            msg("1", "reply chatter", 0, false),
            msg("2", "new topic", 1, true),
        ];
        let windows = chunk_messages(&counter(), &config(), &messages).await;

        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].message_ids, vec!["1"]);
        assert_eq!(windows[1].message_ids, vec!["2"]);
    }

    #[tokio::test]
    async fn test_token_overflow_flushes() {
        let big = "lorem ipsum dolor sit amet ".repeat(40);
        let messages = vec![
            msg("1", &big, 0, false),
            msg("2", &big, 1, false),
            msg("3", &big, 2, false),
        ];
        let cfg = ChunkerConfig {
            max_tokens_per_window: 300,
            ..config()
        };
        let windows = chunk_messages(&counter(), &cfg, &messages).await;

        assert_eq!(windows.len(), 3);
        for w in &windows {
            assert_eq!(w.message_ids.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_single_oversized_message_truncated() {
        let huge = "abcdefgh ".repeat(1200);
        let messages = vec![msg("1", &huge, 0, false)];
        let cfg = ChunkerConfig {
            max_tokens_per_window: 100,
            ..config()
        };
        let local = TokenCounter::local_only(100, 0);
        let windows = chunk_messages(&local, &cfg, &messages).await;

        assert_eq!(windows.len(), 1);
        assert!(windows[0].truncated);
        assert!(windows[0].token_est <= 100);
        let last = windows[0].text.chars().last().unwrap();
        assert!(
            ['\n', '。', '、', '.', ',', ' ', '}', ']', ')'].contains(&last),
            "cut should land on a break char, got {:?}",
            last
        );
    }

    #[tokio::test]
    async fn test_window_ordering_invariants() {
        let messages: Vec<ChunkInput> = (0..30)
            .map(|i| msg(&format!("{}", i), "steady chatter in the channel", i, false))
            .collect();
        let cfg = ChunkerConfig {
            max_tokens_per_window: 40,
            soft_gap_minutes: 5,
            overlap_messages: 0,
        };
        let windows = chunk_messages(&counter(), &cfg, &messages).await;

        assert!(windows.len() > 1);
        let mut prev_seq = 0;
        for w in &windows {
            assert!(w.window_seq > prev_seq);
            prev_seq = w.window_seq;
            assert!(w.start_at <= w.end_at);
            assert!(!w.message_ids.is_empty());
            let mut ids: Vec<u64> = w.message_ids.iter().map(|s| s.parse().unwrap()).collect();
            let sorted = ids.clone();
            ids.sort_unstable();
            assert_eq!(ids, sorted, "message ids must stay in created_at order");
        }
    }

    #[tokio::test]
    async fn test_chunking_is_deterministic() {
        let messages: Vec<ChunkInput> = (0..20)
            .map(|i| {
                msg(
                    &format!("m{}", i),
                    "some ordinary message content here",
                    i * 2,
                    i % 7 == 0,
                )
            })
            .collect();
        let a = chunk_messages(&counter(), &config(), &messages).await;
        let b = chunk_messages(&counter(), &config(), &messages).await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_overlap_carries_trailing_messages() {
        let messages = vec![
            msg("1", "one", 0, false),
            msg("2", "two", 1, false),
            msg("3", "three", 10, false),
        ];
        let cfg = ChunkerConfig {
            overlap_messages: 1,
            ..config()
        };
        let windows = chunk_messages(&counter(), &cfg, &messages).await;

        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].message_ids, vec!["1", "2"]);
        // Window 2 starts with the carried overlap message.
        assert_eq!(windows[1].message_ids, vec!["2", "3"]);
    }

    #[tokio::test]
    async fn test_empty_input_emits_nothing() {
        let windows = chunk_messages(&counter(), &config(), &[]).await;
        assert!(windows.is_empty());
    }
}
