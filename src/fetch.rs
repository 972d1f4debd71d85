//! Guild message fetching with bounded fan-out.
//!
//! A guild sync walks every text channel plus its active and archived
//! threads. Channel tasks enqueue thread tasks, so the two levels use
//! separate semaphores; sharing one would let a channel task deadlock
//! waiting on permits it is itself holding. Thread drains carry a hard
//! wall-clock timeout and resolve to an empty list when it fires.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::all::{
    ChannelId, ChannelType, GetMessages, GuildChannel, GuildId, Message, MessageId,
};
use serenity::http::Http;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::db::{ChannelRecord, Database, ThreadRecord};
use crate::discord_text::markdown_to_plain;

const THREAD_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_SIZE: u8 = 100;
const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;

/// One message as the sync pipeline consumes it.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub message_id: String,
    pub guild_id: String,
    pub category_id: Option<String>,
    pub channel_id: String,
    pub thread_id: Option<String>,
    pub author_id: Option<String>,
    pub content_md: Option<String>,
    pub content_plain: Option<String>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub mentions: Option<serde_json::Value>,
    pub attachments: Option<serde_json::Value>,
    pub jump_link: String,
    /// True when the message spawned a thread, i.e. opened a new topic.
    pub is_top_level: bool,
}

/// `(completed_containers, total_containers, phase_label)`.
pub type ProgressFn = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;

#[async_trait]
pub trait MessageFetcher: Send + Sync {
    /// Fan out across all channels and threads of a guild.
    async fn fetch_guild(
        &self,
        guild_id: &str,
        since: Option<DateTime<Utc>>,
        progress: ProgressFn,
    ) -> anyhow::Result<Vec<FetchedMessage>>;

    /// Drain a single container.
    async fn fetch_channel(
        &self,
        guild_id: &str,
        channel_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<FetchedMessage>>;
}

pub struct DiscordFetcher {
    http: Arc<Http>,
    db: Database,
    channel_limit: Arc<Semaphore>,
    thread_limit: Arc<Semaphore>,
}

impl DiscordFetcher {
    pub fn new(http: Arc<Http>, db: Database, fetch_concurrency: usize) -> Self {
        Self {
            http,
            db,
            channel_limit: Arc::new(Semaphore::new(fetch_concurrency.max(1))),
            thread_limit: Arc::new(Semaphore::new(fetch_concurrency.max(1))),
        }
    }

    /// Drain one container from `after` forward, oldest first.
    async fn drain_container(
        http: &Http,
        container: ChannelId,
        after: Option<MessageId>,
    ) -> anyhow::Result<Vec<Message>> {
        let mut cursor = after;
        let mut out = Vec::new();
        loop {
            let mut request = GetMessages::new().limit(PAGE_SIZE);
            if let Some(anchor) = cursor {
                request = request.after(anchor);
            }
            let mut batch = container.messages(http, request).await?;
            if batch.is_empty() {
                break;
            }
            batch.sort_by_key(|m| m.id);
            if let Some(last) = batch.last() {
                cursor = Some(last.id);
            }
            let page_len = batch.len();
            out.extend(batch);
            if page_len < PAGE_SIZE as usize {
                break;
            }
        }
        Ok(out)
    }

    fn convert(
        guild_id: &str,
        channel_id: ChannelId,
        thread_id: Option<ChannelId>,
        category_id: Option<&str>,
        message: &Message,
    ) -> FetchedMessage {
        let container = thread_id.unwrap_or(channel_id);
        let mentions: Vec<String> = message.mentions.iter().map(|u| u.id.to_string()).collect();
        let attachments: Vec<serde_json::Value> = message
            .attachments
            .iter()
            .map(|a| serde_json::json!({ "filename": a.filename, "url": a.url }))
            .collect();

        FetchedMessage {
            message_id: message.id.to_string(),
            guild_id: guild_id.to_string(),
            category_id: category_id.map(str::to_string),
            channel_id: channel_id.to_string(),
            thread_id: thread_id.map(|id| id.to_string()),
            author_id: Some(message.author.id.to_string()),
            content_md: Some(message.content.clone()),
            content_plain: Some(markdown_to_plain(&message.content)),
            created_at: *message.timestamp,
            edited_at: message.edited_timestamp.map(|t| *t),
            mentions: Some(serde_json::json!(mentions)),
            attachments: Some(serde_json::json!(attachments)),
            jump_link: format!(
                "https://discord.com/channels/{}/{}/{}",
                guild_id, container, message.id
            ),
            is_top_level: message.thread.is_some(),
        }
    }
}

#[async_trait]
impl MessageFetcher for DiscordFetcher {
    async fn fetch_guild(
        &self,
        guild_id: &str,
        since: Option<DateTime<Utc>>,
        progress: ProgressFn,
    ) -> anyhow::Result<Vec<FetchedMessage>> {
        let gid = GuildId::new(guild_id.parse()?);
        let after = since.map(snowflake_after);

        let channels = self.http.get_channels(gid).await?;
        let text_channels: Vec<GuildChannel> = channels
            .into_iter()
            .filter(|c| matches!(c.kind, ChannelType::Text | ChannelType::News))
            .collect();
        let category_of: HashMap<ChannelId, Option<String>> = text_channels
            .iter()
            .map(|c| (c.id, c.parent_id.map(|p| p.to_string())))
            .collect();

        for channel in &text_channels {
            self.db
                .upsert_channel(&ChannelRecord {
                    channel_id: channel.id.to_string(),
                    guild_id: guild_id.to_string(),
                    category_id: channel.parent_id.map(|p| p.to_string()),
                    name: Some(channel.name.clone()),
                    kind: Some(format!("{:?}", channel.kind)),
                })
                .await?;
        }

        // Active threads are listed guild-wide; group them by parent so each
        // channel task picks up its own.
        let mut active_by_parent: HashMap<ChannelId, Vec<GuildChannel>> = HashMap::new();
        match self.http.get_guild_active_threads(gid).await {
            Ok(data) => {
                for thread in data.threads {
                    if let Some(parent) = thread.parent_id {
                        active_by_parent.entry(parent).or_default().push(thread);
                    }
                }
            }
            Err(e) => warn!("active thread listing failed for guild {}: {}", guild_id, e),
        }

        let completed = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(text_channels.len()));

        let mut handles = Vec::with_capacity(text_channels.len());
        for channel in text_channels {
            let http = self.http.clone();
            let db = self.db.clone();
            let channel_limit = self.channel_limit.clone();
            let thread_limit = self.thread_limit.clone();
            let guild = guild_id.to_string();
            let category = category_of.get(&channel.id).cloned().flatten();
            let active_threads = active_by_parent.remove(&channel.id).unwrap_or_default();
            let completed = completed.clone();
            let total = total.clone();
            let progress = progress.clone();

            handles.push(tokio::spawn(async move {
                let mut collected: Vec<FetchedMessage> = Vec::new();
                let _permit = match channel_limit.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return collected,
                };

                match Self::drain_container(&http, channel.id, after).await {
                    Ok(messages) => {
                        debug!("channel {}: {} messages", channel.id, messages.len());
                        collected.extend(messages.iter().map(|m| {
                            Self::convert(&guild, channel.id, None, category.as_deref(), m)
                        }));
                    }
                    Err(e) => warn!("channel {} fetch failed: {}", channel.id, e),
                }
                progress(
                    completed.fetch_add(1, Ordering::SeqCst) + 1,
                    total.load(Ordering::SeqCst),
                    "channels",
                );

                // Collect this channel's threads: active (from the guild-wide
                // listing) plus archived.
                let mut threads = active_threads;
                match http
                    .get_channel_archived_public_threads(channel.id, None, None)
                    .await
                {
                    Ok(archived) => threads.extend(archived.threads),
                    Err(e) => warn!("archived thread listing failed for {}: {}", channel.id, e),
                }
                total.fetch_add(threads.len(), Ordering::SeqCst);

                let mut thread_handles = Vec::with_capacity(threads.len());
                for thread in threads {
                    let http = http.clone();
                    let db = db.clone();
                    let thread_limit = thread_limit.clone();
                    let guild = guild.clone();
                    let category = category.clone();
                    let parent = channel.id;
                    let completed = completed.clone();
                    let total = total.clone();
                    let progress = progress.clone();

                    thread_handles.push(tokio::spawn(async move {
                        let mut out: Vec<FetchedMessage> = Vec::new();
                        let _permit = match thread_limit.acquire().await {
                            Ok(permit) => permit,
                            Err(_) => return out,
                        };

                        let archived = thread
                            .thread_metadata
                            .map(|meta| meta.archived)
                            .unwrap_or(false);
                        if let Err(e) = db
                            .upsert_thread(&ThreadRecord {
                                thread_id: thread.id.to_string(),
                                guild_id: guild.clone(),
                                channel_id: parent.to_string(),
                                name: Some(thread.name.clone()),
                                archived,
                            })
                            .await
                        {
                            warn!("thread {} registry upsert failed: {}", thread.id, e);
                        }

                        match timeout(
                            THREAD_FETCH_TIMEOUT,
                            Self::drain_container(&http, thread.id, after),
                        )
                        .await
                        {
                            Ok(Ok(messages)) => {
                                out.extend(messages.iter().map(|m| {
                                    Self::convert(
                                        &guild,
                                        parent,
                                        Some(thread.id),
                                        category.as_deref(),
                                        m,
                                    )
                                }));
                            }
                            Ok(Err(e)) => warn!("thread {} fetch failed: {}", thread.id, e),
                            Err(_) => {
                                warn!(
                                    "thread {} fetch timed out after {:?}, skipping",
                                    thread.id, THREAD_FETCH_TIMEOUT
                                );
                            }
                        }
                        progress(
                            completed.fetch_add(1, Ordering::SeqCst) + 1,
                            total.load(Ordering::SeqCst),
                            "threads",
                        );
                        out
                    }));
                }

                for handle in thread_handles {
                    if let Ok(thread_messages) = handle.await {
                        collected.extend(thread_messages);
                    }
                }
                collected
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(messages) => all.extend(messages),
                Err(e) => warn!("channel task join error: {}", e),
            }
        }
        info!("guild {}: fetched {} messages", guild_id, all.len());
        Ok(all)
    }

    async fn fetch_channel(
        &self,
        guild_id: &str,
        channel_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<FetchedMessage>> {
        let cid = ChannelId::new(channel_id.parse()?);
        let after = since.map(snowflake_after);
        let messages = Self::drain_container(&self.http, cid, after).await?;
        Ok(messages
            .iter()
            .map(|m| Self::convert(guild_id, cid, None, None, m))
            .collect())
    }
}

/// Smallest snowflake strictly newer than the given instant, for use as an
/// `after` cursor.
fn snowflake_after(ts: DateTime<Utc>) -> MessageId {
    let unix_ms = ts.timestamp_millis().max(0) as u64;
    let since_epoch = unix_ms.saturating_sub(DISCORD_EPOCH_MS);
    MessageId::new((since_epoch << 22).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_snowflake_after_round_trips_timestamp() {
        let ts = Utc.with_ymd_and_hms(2023, 6, 15, 12, 0, 0).unwrap();
        let id = snowflake_after(ts);
        let decoded_ms = (id.get() >> 22) + DISCORD_EPOCH_MS;
        assert_eq!(decoded_ms, ts.timestamp_millis() as u64);
    }

    #[test]
    fn test_snowflake_after_clamps_pre_epoch() {
        let ancient = Utc.with_ymd_and_hms(2010, 1, 1, 0, 0, 0).unwrap();
        // Pre-Discord timestamps clamp to the smallest valid id.
        assert_eq!(snowflake_after(ancient).get(), 1);
    }
}
