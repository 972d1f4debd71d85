//! Durable embed queue drain.
//!
//! Claims batches of `ready` rows, embeds each window's text under a
//! concurrency bound, and completes rows transactionally: the vector upsert
//! happens before the queue row flips to `done`, so a crash between the two
//! re-embeds (idempotent) rather than losing work. Embedding failures leave
//! the row `ready` until the attempt budget runs out.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::db::{Database, EmbedQueueRow};
use crate::llm::Embedder;
use crate::tokens::TokenCounter;

const BATCH_SIZE: i64 = 500;
const CONCURRENCY: usize = 15;
const MAX_ATTEMPTS: i32 = 5;
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_IDLE_SLEEP: Duration = Duration::from_secs(30);

pub struct EmbedWorker {
    db: Database,
    embedder: Arc<dyn Embedder>,
    counter: TokenCounter,
}

impl EmbedWorker {
    pub fn new(db: Database, embedder: Arc<dyn Embedder>, counter: TokenCounter) -> Self {
        Self {
            db,
            embedder,
            counter,
        }
    }

    pub async fn run(self) {
        let worker = Arc::new(self);
        let limiter = Arc::new(Semaphore::new(CONCURRENCY));
        let mut idle_count = 0u32;

        loop {
            let batch = match worker.db.claim_embed_batch(BATCH_SIZE).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("embed queue read failed: {}", e);
                    sleep(POLL_INTERVAL).await;
                    continue;
                }
            };

            if batch.is_empty() {
                idle_count += 1;
                sleep(idle_backoff(idle_count)).await;
                continue;
            }
            idle_count = 0;
            debug!("embed worker: processing {} queue rows", batch.len());

            let mut handles = Vec::with_capacity(batch.len());
            for row in batch {
                let worker = worker.clone();
                let limiter = limiter.clone();
                handles.push(tokio::spawn(async move {
                    let Ok(_permit) = limiter.acquire().await else {
                        return;
                    };
                    worker.process_window(&row).await;
                }));
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!("embed task join error: {}", e);
                }
            }
        }
    }

    async fn process_window(&self, row: &EmbedQueueRow) {
        let text = match self.resolve_text(row).await {
            Ok(Some(text)) => text,
            Ok(None) => {
                // No text can ever be recovered for this window.
                warn!("queue {}: window {} has no text, failing", row.id, row.window_id);
                if let Err(e) = self.db.mark_queue_failed(row.id).await {
                    warn!("queue {}: failed-mark write error: {}", row.id, e);
                }
                return;
            }
            Err(e) => {
                warn!("queue {}: text resolution error: {}", row.id, e);
                self.record_failure(row).await;
                return;
            }
        };

        let bounded = self.counter.ensure_within_limit(&text).await;
        if bounded.truncated {
            info!(
                "queue {}: window {} truncated to {} tokens before embedding",
                row.id, row.window_id, bounded.tokens
            );
        }

        let embedding = match self.embedder.embed_window(&bounded.text).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!("queue {}: embedding failed: {}", row.id, e);
                self.record_failure(row).await;
                return;
            }
        };

        if let Err(e) = self.db.upsert_embedding(row.window_id, &embedding).await {
            warn!("queue {}: vector upsert failed: {}", row.id, e);
            self.record_failure(row).await;
            return;
        }

        if let Err(e) = self.db.mark_queue_done(row.id).await {
            warn!("queue {}: done-mark write error: {}", row.id, e);
        }
    }

    /// The window's own text, or a reconstruction from its messages in
    /// `message_ids` order. `Ok(None)` means the window is terminally empty.
    async fn resolve_text(&self, row: &EmbedQueueRow) -> anyhow::Result<Option<String>> {
        let Some((text, message_ids)) = self.db.get_window_for_embedding(row.window_id).await?
        else {
            return Ok(None);
        };

        if let Some(text) = text {
            if !text.trim().is_empty() {
                return Ok(Some(text));
            }
        }

        let fetched = self.db.get_message_texts(&message_ids).await?;
        let by_id: HashMap<String, Option<String>> = fetched.into_iter().collect();
        let joined = message_ids
            .iter()
            .filter_map(|id| by_id.get(id).cloned().flatten())
            .collect::<Vec<_>>()
            .join("\n");

        if joined.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(joined))
        }
    }

    /// Bump `attempts` and flip to `failed` once the budget is spent. A DB
    /// error here is logged, not retried.
    async fn record_failure(&self, row: &EmbedQueueRow) {
        match self.db.record_queue_failure(row.id, MAX_ATTEMPTS).await {
            Ok(attempts) if attempts >= MAX_ATTEMPTS => {
                warn!(
                    "queue {}: window {} failed permanently after {} attempts",
                    row.id, row.window_id, attempts
                );
            }
            Ok(attempts) => {
                debug!("queue {}: attempt {}/{}, staying ready", row.id, attempts, MAX_ATTEMPTS);
            }
            Err(e) => {
                warn!("queue {}: attempt bookkeeping failed: {}", row.id, e);
            }
        }
    }
}

/// Exponential idle backoff, capped at 30 s.
fn idle_backoff(idle_count: u32) -> Duration {
    let scaled = POLL_INTERVAL.as_secs_f64() * 1.5f64.powi(idle_count.min(16) as i32);
    Duration::from_secs_f64(scaled.min(MAX_IDLE_SLEEP.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_backoff_grows_and_caps() {
        assert!(idle_backoff(1) > POLL_INTERVAL);
        let mut prev = Duration::ZERO;
        for idle in 1..10 {
            let delay = idle_backoff(idle);
            assert!(delay >= prev);
            prev = delay;
        }
        assert_eq!(idle_backoff(50), MAX_IDLE_SLEEP);
    }
}
