pub mod schema;

use chrono::{DateTime, NaiveDate, Utc};
use half::f16;
use pgvector::HalfVector;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::Config;

/// Chunk size for `ANY(...)` lookups against large id sets.
const IN_BATCH: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncScope {
    Guild,
    Channel,
    Thread,
}

impl SyncScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncScope::Guild => "guild",
            SyncScope::Channel => "channel",
            SyncScope::Thread => "thread",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Delta,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Delta => "delta",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Queued => "queued",
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }
}

/// Structured progress stored in `sync_operations.progress`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncProgress {
    pub processed: u32,
    pub total: u32,
    pub message: String,
}

impl SyncProgress {
    pub fn new(processed: u32, total: u32, message: impl Into<String>) -> Self {
        Self {
            processed,
            total,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub guild_id: String,
    pub category_id: Option<String>,
    pub name: Option<String>,
    pub kind: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ThreadRecord {
    pub thread_id: String,
    pub guild_id: String,
    pub channel_id: String,
    pub name: Option<String>,
    pub archived: bool,
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub message_id: String,
    pub guild_id: String,
    pub category_id: Option<String>,
    pub channel_id: String,
    pub thread_id: Option<String>,
    pub author_id: Option<String>,
    pub content_md: Option<String>,
    pub content_plain: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub edited_at: Option<DateTime<Utc>>,
    pub mentions: Option<serde_json::Value>,
    pub attachments: Option<serde_json::Value>,
    pub jump_link: Option<String>,
    pub token_count: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct WindowRecord {
    pub window_id: Uuid,
    pub guild_id: String,
    pub channel_id: String,
    pub thread_id: Option<String>,
    pub date: NaiveDate,
    pub window_seq: i32,
    pub message_ids: Vec<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub token_est: Option<i32>,
    pub text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EmbedQueueRow {
    pub id: i64,
    pub window_id: Uuid,
    pub priority: i32,
    pub attempts: i32,
}

#[derive(Debug, Clone)]
pub struct SyncOperation {
    pub id: Uuid,
    pub guild_id: String,
    pub scope: String,
    pub mode: String,
    pub target_ids: Option<Vec<String>>,
    pub since: Option<DateTime<Utc>>,
    pub requested_by: String,
    pub status: String,
    pub progress: SyncProgress,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SyncCursor {
    pub guild_id: String,
    pub last_message_id: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct WindowMatch {
    pub window_id: Uuid,
    pub similarity: f64,
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(&config.database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Apply the schema idempotently (tables, HNSW index, vector RPC).
    pub async fn execute_init(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(schema::SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    // ---- registry -------------------------------------------------------

    pub async fn upsert_channel(&self, channel: &ChannelRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO channels (channel_id, guild_id, category_id, name, type, last_scanned_at)
             VALUES ($1, $2, $3, $4, $5, now())
             ON CONFLICT (channel_id) DO UPDATE
             SET guild_id = EXCLUDED.guild_id, category_id = EXCLUDED.category_id,
                 name = EXCLUDED.name, type = EXCLUDED.type, last_scanned_at = now()",
        )
        .bind(&channel.channel_id)
        .bind(&channel.guild_id)
        .bind(&channel.category_id)
        .bind(&channel.name)
        .bind(&channel.kind)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_thread(&self, thread: &ThreadRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO threads (thread_id, guild_id, channel_id, name, archived, last_scanned_at)
             VALUES ($1, $2, $3, $4, $5, now())
             ON CONFLICT (thread_id) DO UPDATE
             SET name = EXCLUDED.name, archived = EXCLUDED.archived, last_scanned_at = now()",
        )
        .bind(&thread.thread_id)
        .bind(&thread.guild_id)
        .bind(&thread.channel_id)
        .bind(&thread.name)
        .bind(thread.archived)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- messages -------------------------------------------------------

    /// Upsert one batch of messages in a single transaction. Edits overwrite
    /// by `message_id`.
    pub async fn upsert_messages(&self, messages: &[MessageRecord]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for m in messages {
            sqlx::query(
                "INSERT INTO messages (message_id, guild_id, category_id, channel_id, thread_id,
                                       author_id, content_md, content_plain, created_at, edited_at,
                                       mentions, attachments, jump_link, token_count)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                 ON CONFLICT (message_id) DO UPDATE
                 SET content_md = EXCLUDED.content_md, content_plain = EXCLUDED.content_plain,
                     edited_at = EXCLUDED.edited_at, mentions = EXCLUDED.mentions,
                     attachments = EXCLUDED.attachments, token_count = EXCLUDED.token_count",
            )
            .bind(&m.message_id)
            .bind(&m.guild_id)
            .bind(&m.category_id)
            .bind(&m.channel_id)
            .bind(&m.thread_id)
            .bind(&m.author_id)
            .bind(&m.content_md)
            .bind(&m.content_plain)
            .bind(m.created_at)
            .bind(m.edited_at)
            .bind(&m.mentions)
            .bind(&m.attachments)
            .bind(&m.jump_link)
            .bind(m.token_count)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Fetch `content_plain` (falling back to `content_md`) for a set of
    /// message ids. Order is the caller's concern.
    pub async fn get_message_texts(
        &self,
        message_ids: &[String],
    ) -> anyhow::Result<Vec<(String, Option<String>)>> {
        let mut out = Vec::with_capacity(message_ids.len());
        for batch in message_ids.chunks(IN_BATCH) {
            let rows = sqlx::query(
                "SELECT message_id, COALESCE(content_plain, content_md) AS content
                 FROM messages WHERE message_id = ANY($1)",
            )
            .bind(batch)
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                out.push((row.try_get("message_id")?, row.try_get("content")?));
            }
        }
        Ok(out)
    }

    // ---- windows --------------------------------------------------------

    /// Upsert a window on its `(channel_id, date, window_seq)` identity and
    /// return the row's `window_id`. Re-chunking the same partition rewrites
    /// the same rows.
    pub async fn upsert_window(&self, window: &WindowRecord) -> anyhow::Result<Uuid> {
        let row = sqlx::query(
            "INSERT INTO message_windows (guild_id, channel_id, thread_id, date, window_seq,
                                          message_ids, start_at, end_at, token_est, text)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (channel_id, date, window_seq) DO UPDATE
             SET message_ids = EXCLUDED.message_ids, start_at = EXCLUDED.start_at,
                 end_at = EXCLUDED.end_at, token_est = EXCLUDED.token_est, text = EXCLUDED.text
             RETURNING window_id",
        )
        .bind(&window.guild_id)
        .bind(&window.channel_id)
        .bind(&window.thread_id)
        .bind(window.date)
        .bind(window.window_seq)
        .bind(&window.message_ids)
        .bind(window.start_at)
        .bind(window.end_at)
        .bind(window.token_est)
        .bind(&window.text)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("window_id")?)
    }

    pub async fn get_windows_by_ids(&self, ids: &[Uuid]) -> anyhow::Result<Vec<WindowRecord>> {
        let mut out = Vec::with_capacity(ids.len());
        for batch in ids.chunks(IN_BATCH) {
            let rows = sqlx::query(
                "SELECT window_id, guild_id, channel_id, thread_id, date, window_seq,
                        message_ids, start_at, end_at, token_est, text
                 FROM message_windows WHERE window_id = ANY($1)",
            )
            .bind(batch)
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                out.push(row_to_window(&row)?);
            }
        }
        Ok(out)
    }

    pub async fn get_window_for_embedding(
        &self,
        window_id: Uuid,
    ) -> anyhow::Result<Option<(Option<String>, Vec<String>)>> {
        let row = sqlx::query(
            "SELECT text, message_ids FROM message_windows WHERE window_id = $1",
        )
        .bind(window_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some((row.try_get("text")?, row.try_get("message_ids")?))),
            None => Ok(None),
        }
    }

    pub async fn get_guild_window_ids(&self, guild_id: &str) -> anyhow::Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT window_id FROM message_windows WHERE guild_id = $1")
            .bind(guild_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("window_id").map_err(Into::into))
            .collect()
    }

    // ---- embed queue ----------------------------------------------------

    /// Queue a window for embedding. A window is queued at most once; the
    /// UNIQUE(window_id) constraint swallows duplicates.
    pub async fn enqueue_embed(&self, window_id: Uuid, priority: i32) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO embed_queue (window_id, priority, status)
             VALUES ($1, $2, 'ready')
             ON CONFLICT (window_id) DO NOTHING",
        )
        .bind(window_id)
        .bind(priority)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn claim_embed_batch(&self, batch_size: i64) -> anyhow::Result<Vec<EmbedQueueRow>> {
        let rows = sqlx::query(
            "SELECT id, window_id, priority, attempts FROM embed_queue
             WHERE status = 'ready'
             ORDER BY priority DESC, updated_at ASC
             LIMIT $1",
        )
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(EmbedQueueRow {
                    id: row.try_get("id")?,
                    window_id: row.try_get("window_id")?,
                    priority: row.try_get("priority")?,
                    attempts: row.try_get("attempts")?,
                })
            })
            .collect()
    }

    pub async fn mark_queue_done(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE embed_queue SET status = 'done', updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Terminal failure (e.g. no text can be resolved for the window).
    pub async fn mark_queue_failed(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE embed_queue SET status = 'failed', updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record one failed embedding attempt. The row flips to `failed` once
    /// attempts reach `max_attempts`, otherwise stays `ready` for a later
    /// cycle. Returns the new attempt count.
    pub async fn record_queue_failure(&self, id: i64, max_attempts: i32) -> anyhow::Result<i32> {
        let row = sqlx::query(
            "UPDATE embed_queue
             SET attempts = attempts + 1,
                 status = CASE WHEN attempts + 1 >= $2 THEN 'failed' ELSE 'ready' END,
                 updated_at = now()
             WHERE id = $1
             RETURNING attempts",
        )
        .bind(id)
        .bind(max_attempts)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("attempts")?)
    }

    /// Count still-`ready` queue rows among the given windows, batching the
    /// `IN` lookup.
    pub async fn count_ready_in(&self, window_ids: &[Uuid]) -> anyhow::Result<i64> {
        let mut total = 0i64;
        for batch in window_ids.chunks(IN_BATCH) {
            let row = sqlx::query(
                "SELECT count(*) AS n FROM embed_queue
                 WHERE status = 'ready' AND window_id = ANY($1)",
            )
            .bind(batch)
            .fetch_one(&self.pool)
            .await?;
            total += row.try_get::<i64, _>("n")?;
        }
        Ok(total)
    }

    // ---- embeddings -----------------------------------------------------

    /// Write the window's vector, overwriting any previous one.
    pub async fn upsert_embedding(&self, window_id: Uuid, embedding: &[f32]) -> anyhow::Result<()> {
        let vector = HalfVector::from(
            embedding.iter().map(|v| f16::from_f32(*v)).collect::<Vec<f16>>(),
        );
        sqlx::query(
            "INSERT INTO message_embeddings (window_id, embedding, updated_at)
             VALUES ($1, $2, now())
             ON CONFLICT (window_id) DO UPDATE
             SET embedding = EXCLUDED.embedding, updated_at = now()",
        )
        .bind(window_id)
        .bind(vector)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Nearest windows in a guild by cosine distance, via the SQL RPC.
    pub async fn match_windows_in_guild(
        &self,
        query_embedding: &[f32],
        guild_id: &str,
        limit: i32,
    ) -> anyhow::Result<Vec<WindowMatch>> {
        let vector = HalfVector::from(
            query_embedding.iter().map(|v| f16::from_f32(*v)).collect::<Vec<f16>>(),
        );
        let rows = sqlx::query("SELECT window_id, similarity FROM match_windows_in_guild($1, $2, $3)")
            .bind(vector)
            .bind(guild_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(WindowMatch {
                    window_id: row.try_get("window_id")?,
                    similarity: row.try_get("similarity")?,
                })
            })
            .collect()
    }

    // ---- sync operations ------------------------------------------------

    pub async fn enqueue_sync_operation(
        &self,
        guild_id: &str,
        scope: SyncScope,
        mode: SyncMode,
        target_ids: Option<&[String]>,
        since: Option<DateTime<Utc>>,
        requested_by: &str,
    ) -> anyhow::Result<Uuid> {
        let progress = serde_json::to_value(SyncProgress::new(0, 100, "queued"))?;
        let row = sqlx::query(
            "INSERT INTO sync_operations (guild_id, scope, mode, target_ids, since, requested_by, status, progress)
             VALUES ($1, $2, $3, $4, $5, $6, 'queued', $7)
             RETURNING id",
        )
        .bind(guild_id)
        .bind(scope.as_str())
        .bind(mode.as_str())
        .bind(target_ids)
        .bind(since)
        .bind(requested_by)
        .bind(progress)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    /// Claim the oldest queued operation. The `running` transition is
    /// conditional on the status still being `queued`, so concurrent runners
    /// never double-claim; a losing updater gets `None` and moves on.
    pub async fn claim_next_sync_operation(&self) -> anyhow::Result<Option<SyncOperation>> {
        let row = sqlx::query(
            "SELECT id FROM sync_operations WHERE status = 'queued' ORDER BY created_at ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let id: Uuid = row.try_get("id")?;

        let claimed = sqlx::query(
            "UPDATE sync_operations SET status = 'running', updated_at = now()
             WHERE id = $1 AND status = 'queued'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if claimed.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(self.get_sync_operation(id).await?))
    }

    pub async fn get_sync_operation(&self, id: Uuid) -> anyhow::Result<SyncOperation> {
        let row = sqlx::query(
            "SELECT id, guild_id, scope, mode, target_ids, since, requested_by, status, progress, created_at
             FROM sync_operations WHERE id = $1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        let progress: serde_json::Value = row.try_get("progress")?;
        Ok(SyncOperation {
            id: row.try_get("id")?,
            guild_id: row.try_get("guild_id")?,
            scope: row.try_get("scope")?,
            mode: row.try_get("mode")?,
            target_ids: row.try_get("target_ids")?,
            since: row.try_get("since")?,
            requested_by: row.try_get("requested_by")?,
            status: row.try_get("status")?,
            progress: serde_json::from_value(progress).unwrap_or_default(),
            created_at: row.try_get("created_at")?,
        })
    }

    pub async fn update_sync_progress(
        &self,
        id: Uuid,
        progress: &SyncProgress,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE sync_operations SET progress = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(serde_json::to_value(progress)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn finish_sync_operation(
        &self,
        id: Uuid,
        status: SyncStatus,
        progress: &SyncProgress,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE sync_operations SET status = $2, progress = $3, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(serde_json::to_value(progress)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Startup sweep: operations stuck at `running` past the threshold go
    /// back to `queued` so a restarted process picks them up again.
    pub async fn reset_stale_running(&self, older_than_minutes: i64) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_operations SET status = 'queued', updated_at = now()
             WHERE status = 'running' AND updated_at < now() - make_interval(mins => $1)",
        )
        .bind(older_than_minutes as i32)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ---- sync cursors ---------------------------------------------------

    pub async fn get_sync_cursor(&self, guild_id: &str) -> anyhow::Result<Option<SyncCursor>> {
        let row = sqlx::query(
            "SELECT guild_id, last_message_id, last_synced_at FROM sync_cursors WHERE guild_id = $1",
        )
        .bind(guild_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(SyncCursor {
                guild_id: row.try_get("guild_id")?,
                last_message_id: row.try_get("last_message_id")?,
                last_synced_at: row.try_get("last_synced_at")?,
            })),
            None => Ok(None),
        }
    }

    pub async fn upsert_sync_cursor(
        &self,
        guild_id: &str,
        last_message_id: &str,
        last_synced_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO sync_cursors (guild_id, last_message_id, last_synced_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (guild_id) DO UPDATE
             SET last_message_id = EXCLUDED.last_message_id,
                 last_synced_at = EXCLUDED.last_synced_at",
        )
        .bind(guild_id)
        .bind(last_message_id)
        .bind(last_synced_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- sync chunks ----------------------------------------------------

    pub async fn record_sync_chunk(
        &self,
        op_id: Uuid,
        target_id: &str,
        date: NaiveDate,
        status: &str,
        last_error: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO sync_chunks (op_id, target_id, date, status, attempts, last_error)
             VALUES ($1, $2, $3, $4, 1, $5)",
        )
        .bind(op_id)
        .bind(target_id)
        .bind(date)
        .bind(status)
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_window(row: &sqlx::postgres::PgRow) -> anyhow::Result<WindowRecord> {
    Ok(WindowRecord {
        window_id: row.try_get("window_id")?,
        guild_id: row.try_get("guild_id")?,
        channel_id: row.try_get("channel_id")?,
        thread_id: row.try_get("thread_id")?,
        date: row.try_get("date")?,
        window_seq: row.try_get("window_seq")?,
        message_ids: row.try_get("message_ids")?,
        start_at: row.try_get("start_at")?,
        end_at: row.try_get("end_at")?,
        token_est: row.try_get("token_est")?,
        text: row.try_get("text")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        assert_eq!(SyncStatus::Queued.as_str(), "queued");
        assert_eq!(SyncStatus::Running.as_str(), "running");
        assert_eq!(SyncStatus::Completed.as_str(), "completed");
        assert_eq!(SyncStatus::Failed.as_str(), "failed");
        assert_eq!(SyncScope::Guild.as_str(), "guild");
        assert_eq!(SyncMode::Delta.as_str(), "delta");
    }

    #[test]
    fn test_progress_serialization_shape() {
        let progress = SyncProgress::new(42, 100, "chunking");
        let value = serde_json::to_value(&progress).unwrap();
        assert_eq!(value["processed"], 42);
        assert_eq!(value["total"], 100);
        assert_eq!(value["message"], "chunking");
        let back: SyncProgress = serde_json::from_value(value).unwrap();
        assert_eq!(back, progress);
    }
}
