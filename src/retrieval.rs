//! Retrieval-augmented answering.
//!
//! Embeds the query, pulls the nearest windows for the guild through the
//! vector RPC, optionally reranks, and prompts the generative model with the
//! selected windows as numbered context blocks.

use chrono::FixedOffset;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{Database, WindowMatch, WindowRecord};
use crate::error::PipelineError;
use crate::llm::rerank::Reranker;
use crate::llm::{Embedder, Generator};

/// Candidates requested from the vector RPC.
const RPC_LIMIT: i32 = 200;
/// Windows kept after referential-integrity filtering.
const TOP_WINDOWS: usize = 15;
/// Citations attached to the reply.
const CITATION_COUNT: usize = 3;

/// Canned reply when the guild has no synchronized context yet.
pub const NO_CONTEXT_ANSWER: &str =
    "まだ同期されたメッセージがありません。`/sync` を実行してから、もう一度質問してください。";

#[derive(Debug, Clone)]
pub struct Citation {
    pub label: String,
    pub jump_link: String,
}

#[derive(Debug, Clone)]
pub struct ChatAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub latency_ms: u128,
}

pub struct AnswerService {
    db: Database,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    reranker: Option<Arc<dyn Reranker>>,
    rerank_topk: usize,
    top_candidates: usize,
}

impl AnswerService {
    pub fn new(
        db: Database,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        reranker: Option<Arc<dyn Reranker>>,
        rerank_topk: usize,
        top_candidates: usize,
    ) -> Self {
        Self {
            db,
            embedder,
            generator,
            reranker,
            rerank_topk,
            top_candidates,
        }
    }

    pub async fn answer(
        &self,
        guild_id: &str,
        user_id: &str,
        query: &str,
    ) -> anyhow::Result<ChatAnswer> {
        let started = Instant::now();

        let candidates = self.candidates(guild_id, query).await;
        let windows = match candidates {
            Ok(matches) if matches.is_empty() => Vec::new(),
            Ok(mut matches) => {
                matches.truncate(self.top_candidates);
                let ids: Vec<Uuid> = matches.iter().map(|m| m.window_id).collect();
                let rows = self
                    .db
                    .get_windows_by_ids(&ids)
                    .await
                    .map_err(|e| PipelineError::WindowFetchFailed(e.to_string()))?;
                reconstruct_order(&matches, rows, TOP_WINDOWS)
            }
            Err(e) => {
                warn!("vector search failed, answering without context: {}", e);
                Vec::new()
            }
        };

        if windows.is_empty() {
            return Ok(ChatAnswer {
                answer: NO_CONTEXT_ANSWER.to_string(),
                citations: Vec::new(),
                latency_ms: started.elapsed().as_millis(),
            });
        }

        let selected = self.select(query, windows).await;
        let prompt = build_prompt(query, user_id, &selected);
        let answer = self
            .generator
            .generate(&prompt)
            .await
            .map_err(|e| PipelineError::ChatFailed(e.to_string()))?;

        let citations = build_citations(guild_id, &selected);
        let latency_ms = started.elapsed().as_millis();
        info!(
            "answered query for guild {} with {} windows in {}ms",
            guild_id,
            selected.len(),
            latency_ms
        );
        Ok(ChatAnswer {
            answer,
            citations,
            latency_ms,
        })
    }

    async fn candidates(&self, guild_id: &str, query: &str) -> anyhow::Result<Vec<WindowMatch>> {
        let embedding = self.embedder.embed_query(query).await?;
        self.db
            .match_windows_in_guild(&embedding, guild_id, RPC_LIMIT)
            .await
    }

    /// Rerank pass; any rerank error degrades to the plain vector order.
    /// Without a reranker the vector-ordered windows pass through unchanged.
    async fn select(&self, query: &str, windows: Vec<WindowRecord>) -> Vec<WindowRecord> {
        let Some(reranker) = &self.reranker else {
            return windows;
        };

        let documents: Vec<String> = windows
            .iter()
            .map(|w| w.text.clone().unwrap_or_default())
            .collect();
        match reranker.rerank(query, &documents, self.rerank_topk).await {
            Ok(order) => order
                .into_iter()
                .filter_map(|i| windows.get(i).cloned())
                .take(self.rerank_topk)
                .collect(),
            Err(e) => {
                warn!("rerank failed, keeping vector order: {}", e);
                let k = self.rerank_topk.min(windows.len());
                windows.into_iter().take(k).collect()
            }
        }
    }
}

/// Re-impose the RPC's similarity order on the fetched rows and drop ids
/// whose row has gone missing.
fn reconstruct_order(
    matches: &[WindowMatch],
    rows: Vec<WindowRecord>,
    limit: usize,
) -> Vec<WindowRecord> {
    let mut by_id: HashMap<Uuid, WindowRecord> =
        rows.into_iter().map(|w| (w.window_id, w)).collect();
    matches
        .iter()
        .filter_map(|m| by_id.remove(&m.window_id))
        .take(limit)
        .collect()
}

fn build_prompt(query: &str, user_id: &str, windows: &[WindowRecord]) -> String {
    let mut context = String::new();
    for (index, window) in windows.iter().enumerate() {
        context.push_str(&format!(
            "[#{}] ({} – {})\n{}\n\n",
            index + 1,
            window.start_at.format("%Y-%m-%d %H:%M"),
            window.end_at.format("%Y-%m-%d %H:%M"),
            window.text.as_deref().unwrap_or(""),
        ));
    }

    format!(
        "あなたはこのDiscordサーバーの会話履歴に詳しいアシスタントです。\
以下のコンテキストだけを根拠に質問へ答えてください。\n\
- 既定では日本語で回答し、質問が別の言語ならその言語に合わせてください。\n\
- コンテキストを根拠にした箇所には [#n] 形式で出典を付けてください。\n\
- コンテキストに無い内容を述べる場合は推測であると明示してください。\n\n\
# コンテキスト\n{}\n# 質問\n{}: {}",
        context, user_id, query
    )
}

/// First few windows become citations, labelled with their JST start time
/// and linked to their first message.
fn build_citations(guild_id: &str, windows: &[WindowRecord]) -> Vec<Citation> {
    // 9-hour offset is always in range.
    let jst = FixedOffset::east_opt(9 * 3600).unwrap();
    windows
        .iter()
        .take(CITATION_COUNT)
        .enumerate()
        .map(|(index, window)| {
            let first_message = window
                .message_ids
                .first()
                .cloned()
                .unwrap_or_default();
            Citation {
                label: format!(
                    "[#{}] {}",
                    index + 1,
                    window.start_at.with_timezone(&jst).format("%Y-%m-%d %H:%M")
                ),
                jump_link: format!(
                    "https://discord.com/channels/{}/{}/{}",
                    guild_id, window.channel_id, first_message
                ),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn window(id: Uuid, seq: i32, text: &str) -> WindowRecord {
        WindowRecord {
            window_id: id,
            guild_id: "g1".to_string(),
            channel_id: "c1".to_string(),
            thread_id: None,
            date: chrono::NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            window_seq: seq,
            message_ids: vec![format!("m{}", seq)],
            start_at: Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap(),
            end_at: Utc.with_ymd_and_hms(2024, 5, 1, 3, 30, 0).unwrap(),
            token_est: Some(10),
            text: Some(text.to_string()),
        }
    }

    #[test]
    fn test_reconstruct_order_preserves_rpc_ranking() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let matches = vec![
            WindowMatch { window_id: b, similarity: 0.9 },
            WindowMatch { window_id: a, similarity: 0.8 },
            WindowMatch { window_id: c, similarity: 0.7 },
        ];
        // Rows arrive in arbitrary (storage) order.
        let rows = vec![window(a, 1, "a"), window(c, 3, "c"), window(b, 2, "b")];

        let ordered = reconstruct_order(&matches, rows, 15);
        let ids: Vec<Uuid> = ordered.iter().map(|w| w.window_id).collect();
        assert_eq!(ids, vec![b, a, c]);
    }

    #[test]
    fn test_reconstruct_order_drops_missing_rows() {
        let a = Uuid::new_v4();
        let gone = Uuid::new_v4();
        let matches = vec![
            WindowMatch { window_id: gone, similarity: 0.9 },
            WindowMatch { window_id: a, similarity: 0.8 },
        ];
        let rows = vec![window(a, 1, "a")];

        let ordered = reconstruct_order(&matches, rows, 15);
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].window_id, a);
    }

    #[test]
    fn test_reconstruct_order_respects_limit() {
        let ids: Vec<Uuid> = (0..20).map(|_| Uuid::new_v4()).collect();
        let matches: Vec<WindowMatch> = ids
            .iter()
            .map(|id| WindowMatch { window_id: *id, similarity: 0.5 })
            .collect();
        let rows: Vec<WindowRecord> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| window(*id, i as i32, "w"))
            .collect();

        assert_eq!(reconstruct_order(&matches, rows, 15).len(), 15);
    }

    #[test]
    fn test_prompt_contains_context_blocks_and_question() {
        let windows = vec![
            window(Uuid::new_v4(), 1, "昨日はリリースの話をした"),
            window(Uuid::new_v4(), 2, "次回のミーティングは金曜"),
        ];
        let prompt = build_prompt("次のミーティングはいつ?", "user42", &windows);

        assert!(prompt.contains("[#1]"));
        assert!(prompt.contains("[#2]"));
        assert!(prompt.contains("昨日はリリースの話をした"));
        assert!(prompt.contains("user42: 次のミーティングはいつ?"));
        assert!(prompt.contains("# コンテキスト"));
    }

    #[test]
    fn test_citations_use_jst_and_first_message() {
        let windows = vec![window(Uuid::new_v4(), 1, "text"); 5];
        let citations = build_citations("g1", &windows);

        assert_eq!(citations.len(), 3);
        // 03:00 UTC renders as 12:00 JST.
        assert_eq!(citations[0].label, "[#1] 2024-05-01 12:00");
        assert_eq!(
            citations[0].jump_link,
            "https://discord.com/channels/g1/c1/m1"
        );
    }
}
