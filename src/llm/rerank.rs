//! Cross-encoder rerank pass over vector-retrieved candidates.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::config::{Config, RerankProvider};

const COHERE_RERANK_URL: &str = "https://api.cohere.com/v2/rerank";

/// Secondary scoring collaborator. Returns candidate indices ordered by
/// relevance, best first, at most `top_k` of them.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> anyhow::Result<Vec<usize>>;
}

pub struct CohereReranker {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl CohereReranker {
    pub fn new(http: reqwest::Client, api_key: String, model: String) -> Self {
        Self { http, api_key, model }
    }
}

#[async_trait]
impl Reranker for CohereReranker {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> anyhow::Result<Vec<usize>> {
        let body = json!({
            "model": self.model,
            "query": query,
            "documents": documents,
            "top_n": top_k,
        });

        let response = self
            .http
            .post(COHERE_RERANK_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("rerank returned {}: {}", status, message));
        }

        let payload: serde_json::Value = response.json().await?;
        let results = payload["results"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("rerank response missing results"))?;
        Ok(results
            .iter()
            .filter_map(|r| r["index"].as_u64())
            .map(|i| i as usize)
            .filter(|i| *i < documents.len())
            .collect())
    }
}

/// Build the configured reranker, or `None` when reranking is disabled or
/// credentials are missing.
pub fn build_reranker(config: &Config, http: reqwest::Client) -> Option<Arc<dyn Reranker>> {
    match config.rerank_provider {
        RerankProvider::None => None,
        RerankProvider::Cohere => match &config.cohere_api_key {
            Some(key) => {
                info!("rerank enabled: cohere/{}", config.rerank_model);
                Some(Arc::new(CohereReranker::new(
                    http,
                    key.clone(),
                    config.rerank_model.clone(),
                )))
            }
            None => {
                tracing::warn!("RERANK_PROVIDER=cohere but COHERE_API_KEY is unset; rerank disabled");
                None
            }
        },
    }
}
