//! Sync job orchestration.
//!
//! A single long-lived runner polls `sync_operations` for queued jobs and
//! drives each through fetch → persist → chunk/enqueue → embed-wait →
//! cursor. Job claiming is a conditional status transition, so concurrent
//! runners never execute the same job twice. Progress percentages map each
//! phase onto a fixed range of the bar.

use chrono::{NaiveDate, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::chunker::{chunk_messages, ChunkInput, ChunkerConfig};
use crate::db::{Database, SyncOperation, SyncProgress, SyncStatus, WindowRecord};
use crate::error::PipelineError;
use crate::fetch::{FetchedMessage, MessageFetcher, ProgressFn};
use crate::tokens::TokenCounter;

const JOB_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MESSAGE_BATCH_SIZE: usize = 50;
const BATCH_MAX_ATTEMPTS: u32 = 3;
const EMBED_WAIT_POLL: Duration = Duration::from_secs(5);
const EMBED_WAIT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const EMBED_WAIT_MAX_ERRORS: u32 = 3;
const STALE_RUNNING_MINUTES: i64 = 30;

pub struct SyncRunner {
    db: Database,
    fetcher: Arc<dyn MessageFetcher>,
    counter: TokenCounter,
    chunker_config: ChunkerConfig,
}

impl SyncRunner {
    pub fn new(
        db: Database,
        fetcher: Arc<dyn MessageFetcher>,
        counter: TokenCounter,
        chunker_config: ChunkerConfig,
    ) -> Self {
        Self {
            db,
            fetcher,
            counter,
            chunker_config,
        }
    }

    pub async fn run(self) {
        match self.db.reset_stale_running(STALE_RUNNING_MINUTES).await {
            Ok(0) => {}
            Ok(n) => info!("requeued {} stale running sync operations", n),
            Err(e) => warn!("stale sync sweep failed: {}", e),
        }

        let mut ticker = tokio::time::interval(JOB_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            let op = match self.db.claim_next_sync_operation().await {
                Ok(Some(op)) => op,
                Ok(None) => continue,
                Err(e) => {
                    error!("sync job poll failed: {}", e);
                    continue;
                }
            };

            info!(
                "sync {} claimed: guild={} scope={} mode={}",
                op.id, op.guild_id, op.scope, op.mode
            );
            let op_id = op.id;
            match self.run_job(&op).await {
                Ok(()) => {
                    let done = SyncProgress::new(100, 100, "completed");
                    if let Err(e) = self
                        .db
                        .finish_sync_operation(op_id, SyncStatus::Completed, &done)
                        .await
                    {
                        error!("sync {}: completion write failed: {}", op_id, e);
                    }
                    info!("sync {} completed", op_id);
                }
                Err(e) => {
                    error!("sync {} failed: {:#}", op_id, e);
                    let failed = SyncProgress::new(0, 100, e.to_string());
                    if let Err(e) = self
                        .db
                        .finish_sync_operation(op_id, SyncStatus::Failed, &failed)
                        .await
                    {
                        error!("sync {}: failure write failed: {}", op_id, e);
                    }
                }
            }
        }
    }

    async fn run_job(&self, op: &SyncOperation) -> anyhow::Result<()> {
        // Phase 1: fetch (0-30%).
        let mut messages = self.fetch_phase(op).await?;
        if messages.is_empty() {
            info!("sync {}: nothing to fetch, leaving cursor untouched", op.id);
            return Ok(());
        }

        // Fan-out order across containers is arbitrary; chunking needs
        // ascending timestamps.
        messages.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });

        // Phase 2: persist messages (30-50%).
        self.persist_phase(op.id, &messages).await?;

        // Phase 3: chunk & enqueue (50-90%).
        let window_ids = self.chunk_phase(op, &messages).await?;

        // Phase 4: wait for the embed worker to drain this guild (90-99%).
        self.await_embeddings_phase(op.id, &op.guild_id, window_ids.len()).await;

        // Phase 5: cursor (99-100%). The newest created_at decides the
        // cursor; array position depends on fan-out order and must not.
        self.progress(op.id, 99, "updating sync cursor").await;
        if let Some(newest) = messages.iter().max_by_key(|m| m.created_at) {
            self.db
                .upsert_sync_cursor(&op.guild_id, &newest.message_id, Utc::now())
                .await?;
        }
        Ok(())
    }

    async fn fetch_phase(&self, op: &SyncOperation) -> anyhow::Result<Vec<FetchedMessage>> {
        self.progress(op.id, 0, "fetching messages").await;

        let messages = match op.scope.as_str() {
            "channel" | "thread" => {
                let targets = op.target_ids.clone().unwrap_or_default();
                let mut out = Vec::new();
                for target in &targets {
                    out.extend(
                        self.fetcher
                            .fetch_channel(&op.guild_id, target, op.since)
                            .await?,
                    );
                }
                out
            }
            _ => {
                let progress_cb = self.fetch_progress_callback(op.id);
                self.fetcher
                    .fetch_guild(&op.guild_id, op.since, progress_cb)
                    .await?
            }
        };
        self.progress(op.id, 30, &format!("fetched {} messages", messages.len()))
            .await;
        Ok(messages)
    }

    /// Map `(completed, total)` container counts onto the 0-30% band. Updates
    /// are spawned fire-and-forget and guarded to stay monotone.
    fn fetch_progress_callback(&self, op_id: Uuid) -> ProgressFn {
        let db = self.db.clone();
        let high_water = Arc::new(AtomicU32::new(0));
        Arc::new(move |completed, total, label| {
            let pct = ((completed * 30) / total.max(1)).min(30) as u32;
            if high_water.fetch_max(pct, Ordering::SeqCst) >= pct {
                return;
            }
            let db = db.clone();
            let message = format!("fetching {}: {}/{}", label, completed, total);
            tokio::spawn(async move {
                let progress = SyncProgress::new(pct, 100, message);
                if let Err(e) = db.update_sync_progress(op_id, &progress).await {
                    warn!("sync {}: progress write failed: {}", op_id, e);
                }
            });
        })
    }

    async fn persist_phase(
        &self,
        op_id: Uuid,
        messages: &[FetchedMessage],
    ) -> anyhow::Result<()> {
        let batches: Vec<&[FetchedMessage]> = messages.chunks(MESSAGE_BATCH_SIZE).collect();
        let total_batches = batches.len();

        for (index, batch) in batches.into_iter().enumerate() {
            let records: Vec<crate::db::MessageRecord> = batch
                .iter()
                .map(|message| {
                    let mut record = to_message_record(message);
                    record.token_count = record
                        .content_plain
                        .as_deref()
                        .map(|text| self.counter.estimate(text) as i32);
                    record
                })
                .collect();
            save_with_retry(|| self.db.upsert_messages(&records), "message batch")
                .await
                .map_err(|e| PipelineError::MessageSaveFailed(e.to_string()))?;

            let pct = 30 + ((index + 1) * 20 / total_batches.max(1)) as u32;
            self.progress(
                op_id,
                pct.min(50),
                &format!("saved {}/{} message batches", index + 1, total_batches),
            )
            .await;
        }
        Ok(())
    }

    /// Partition by `(thread_id ?? channel_id, calendar date)`, chunk each
    /// partition, and upsert windows plus their queue rows. Returns the
    /// window ids touched by this job.
    async fn chunk_phase(
        &self,
        op: &SyncOperation,
        messages: &[FetchedMessage],
    ) -> anyhow::Result<Vec<Uuid>> {
        let partitions = partition_messages(messages);
        let total_partitions = partitions.len();
        let mut window_ids = Vec::new();

        for (index, ((container_id, date), partition)) in partitions.into_iter().enumerate() {
            let inputs: Vec<ChunkInput> = partition.iter().map(|m| to_chunk_input(m)).collect();
            let windows = chunk_messages(&self.counter, &self.chunker_config, &inputs).await;

            let mut chunk_error: Option<String> = None;
            for draft in &windows {
                let record = WindowRecord {
                    window_id: Uuid::nil(),
                    guild_id: op.guild_id.clone(),
                    channel_id: container_id.clone(),
                    thread_id: partition[0].thread_id.clone(),
                    date,
                    window_seq: draft.window_seq,
                    message_ids: draft.message_ids.clone(),
                    start_at: draft.start_at,
                    end_at: draft.end_at,
                    token_est: Some(draft.token_est as i32),
                    text: Some(draft.text.clone()),
                };
                let window_id = match save_with_retry(
                    || self.db.upsert_window(&record),
                    "window upsert",
                )
                .await
                {
                    Ok(id) => id,
                    Err(e) => {
                        chunk_error = Some(e.to_string());
                        break;
                    }
                };

                if let Err(e) = self.db.enqueue_embed(window_id, 0).await {
                    chunk_error = Some(e.to_string());
                    break;
                }
                window_ids.push(window_id);
            }

            let (status, last_error) = match &chunk_error {
                None => ("done", None),
                Some(e) => ("failed", Some(e.as_str())),
            };
            if let Err(e) = self
                .db
                .record_sync_chunk(op.id, &container_id, date, status, last_error)
                .await
            {
                warn!("sync {}: sync_chunks write failed: {}", op.id, e);
            }

            if let Some(detail) = chunk_error {
                return Err(PipelineError::WindowSaveFailed(detail).into());
            }

            let pct = 50 + ((index + 1) * 40 / total_partitions.max(1)) as u32;
            self.progress(
                op.id,
                pct.min(90),
                &format!("chunked {}/{} partitions", index + 1, total_partitions),
            )
            .await;
        }
        Ok(window_ids)
    }

    /// Poll the embed queue until every window of this guild is drained, the
    /// ceiling is hit, or the queue becomes unreadable.
    async fn await_embeddings_phase(&self, op_id: Uuid, guild_id: &str, enqueued: usize) {
        self.progress(op_id, 90, &format!("embedding {} windows", enqueued))
            .await;
        let deadline = Instant::now() + EMBED_WAIT_TIMEOUT;
        let mut consecutive_errors = 0u32;

        loop {
            if Instant::now() >= deadline {
                warn!("sync {}: embed wait hit {:?} ceiling", op_id, EMBED_WAIT_TIMEOUT);
                return;
            }

            let remaining = match self.guild_ready_count(guild_id).await {
                Ok(n) => {
                    consecutive_errors = 0;
                    n
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(
                        "sync {}: embed wait query failed ({}/{}): {}",
                        op_id, consecutive_errors, EMBED_WAIT_MAX_ERRORS, e
                    );
                    if consecutive_errors >= EMBED_WAIT_MAX_ERRORS {
                        // The queue is unreadable; assume the worker got there.
                        return;
                    }
                    sleep(EMBED_WAIT_POLL).await;
                    continue;
                }
            };

            if remaining == 0 {
                return;
            }
            self.progress(op_id, 95, &format!("{} windows awaiting embedding", remaining))
                .await;
            sleep(EMBED_WAIT_POLL).await;
        }
    }

    async fn guild_ready_count(&self, guild_id: &str) -> anyhow::Result<i64> {
        let ids = self.db.get_guild_window_ids(guild_id).await?;
        if ids.is_empty() {
            return Ok(0);
        }
        self.db.count_ready_in(&ids).await
    }

    async fn progress(&self, op_id: Uuid, processed: u32, message: &str) {
        let progress = SyncProgress::new(processed, 100, message);
        if let Err(e) = self.db.update_sync_progress(op_id, &progress).await {
            warn!("sync {}: progress write failed: {}", op_id, e);
        }
    }
}

async fn save_with_retry<T, F, Fut>(mut save: F, label: &str) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let mut last_error = None;
    for attempt in 0..BATCH_MAX_ATTEMPTS {
        match save().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let wait = Duration::from_secs(2u64.pow(attempt));
                warn!(
                    "{} attempt {}/{} failed ({}), retrying in {:?}",
                    label,
                    attempt + 1,
                    BATCH_MAX_ATTEMPTS,
                    e,
                    wait
                );
                last_error = Some(e);
                if attempt + 1 < BATCH_MAX_ATTEMPTS {
                    sleep(wait).await;
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("{} failed", label)))
}

/// Group messages by `(thread_id ?? channel_id, UTC calendar date)`. BTreeMap
/// keeps partition order deterministic.
fn partition_messages(
    messages: &[FetchedMessage],
) -> BTreeMap<(String, NaiveDate), Vec<&FetchedMessage>> {
    let mut partitions: BTreeMap<(String, NaiveDate), Vec<&FetchedMessage>> = BTreeMap::new();
    for message in messages {
        let container = message
            .thread_id
            .clone()
            .unwrap_or_else(|| message.channel_id.clone());
        partitions
            .entry((container, message.created_at.date_naive()))
            .or_default()
            .push(message);
    }
    partitions
}

fn to_chunk_input(message: &FetchedMessage) -> ChunkInput {
    ChunkInput {
        id: message.message_id.clone(),
        content: message
            .content_plain
            .clone()
            .or_else(|| message.content_md.clone())
            .unwrap_or_default(),
        created_at: message.created_at,
        is_top_level: message.is_top_level,
    }
}

fn to_message_record(message: &FetchedMessage) -> crate::db::MessageRecord {
    crate::db::MessageRecord {
        message_id: message.message_id.clone(),
        guild_id: message.guild_id.clone(),
        category_id: message.category_id.clone(),
        channel_id: message.channel_id.clone(),
        thread_id: message.thread_id.clone(),
        author_id: message.author_id.clone(),
        content_md: message.content_md.clone(),
        content_plain: message.content_plain.clone(),
        created_at: Some(message.created_at),
        edited_at: message.edited_at,
        mentions: message.mentions.clone(),
        attachments: message.attachments.clone(),
        jump_link: Some(message.jump_link.clone()),
        token_count: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fetched(id: &str, channel: &str, thread: Option<&str>, day: u32, hour: u32) -> FetchedMessage {
        FetchedMessage {
            message_id: id.to_string(),
            guild_id: "g1".to_string(),
            category_id: None,
            channel_id: channel.to_string(),
            thread_id: thread.map(str::to_string),
            author_id: Some("u1".to_string()),
            content_md: Some("hello".to_string()),
            content_plain: Some("hello".to_string()),
            created_at: Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap(),
            edited_at: None,
            mentions: None,
            attachments: None,
            jump_link: format!("https://discord.com/channels/g1/{}/{}", channel, id),
            is_top_level: false,
        }
    }

    #[test]
    fn test_partition_by_container_and_date() {
        let messages = vec![
            fetched("1", "c1", None, 1, 9),
            fetched("2", "c1", None, 1, 10),
            fetched("3", "c1", None, 2, 9),
            fetched("4", "c1", Some("t1"), 1, 9),
            fetched("5", "c2", None, 1, 9),
        ];
        let partitions = partition_messages(&messages);

        assert_eq!(partitions.len(), 4);
        let date1 = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let date2 = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();
        assert_eq!(partitions[&("c1".to_string(), date1)].len(), 2);
        assert_eq!(partitions[&("c1".to_string(), date2)].len(), 1);
        assert_eq!(partitions[&("t1".to_string(), date1)].len(), 1);
        assert_eq!(partitions[&("c2".to_string(), date1)].len(), 1);
    }

    #[test]
    fn test_chunk_input_prefers_plain_content() {
        let mut message = fetched("1", "c1", None, 1, 9);
        message.content_md = Some("**bold**".to_string());
        message.content_plain = Some("bold".to_string());
        assert_eq!(to_chunk_input(&message).content, "bold");

        message.content_plain = None;
        assert_eq!(to_chunk_input(&message).content, "**bold**");
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_with_retry_eventually_succeeds() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = AtomicU32::new(0);
        let result = save_with_retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 1 {
                        Err(anyhow::anyhow!("transient"))
                    } else {
                        Ok(42)
                    }
                }
            },
            "test",
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_with_retry_exhausts() {
        let result: anyhow::Result<()> =
            save_with_retry(|| async { Err(anyhow::anyhow!("down")) }, "test").await;
        assert!(result.is_err());
    }
}
