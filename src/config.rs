use dotenvy::dotenv;
use std::env;

/// Rerank provider selection. `None` disables the rerank pass entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerankProvider {
    None,
    Cohere,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub discord_token: String,
    pub discord_app_id: u64,
    pub discord_public_key: Option<String>,
    pub database_url: String,
    /// Pool of equivalent Gemini credentials, one picked at random per call.
    pub gemini_api_keys: Vec<String>,
    pub chat_model: String,
    pub embedding_model: String,
    pub embedding_dim: usize,
    pub rerank_provider: RerankProvider,
    pub rerank_model: String,
    pub rerank_topk: usize,
    pub cohere_api_key: Option<String>,
    pub max_tokens_per_window: usize,
    pub soft_gap_minutes: i64,
    pub overlap_messages: usize,
    pub max_input_tokens: usize,
    pub llm_token_safety_margin: usize,
    pub discord_fetch_concurrency: usize,
    pub top_candidates_limit: usize,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        Ok(Config {
            discord_token: env::var("DISCORD_TOKEN")
                .map_err(|_| anyhow::anyhow!("DISCORD_TOKEN must be set"))?,
            discord_app_id: env::var("DISCORD_APP_ID")
                .map_err(|_| anyhow::anyhow!("DISCORD_APP_ID must be set"))?
                .parse()
                .map_err(|_| anyhow::anyhow!("DISCORD_APP_ID must be a valid u64"))?,
            discord_public_key: env::var("DISCORD_PUBLIC_KEY").ok(),
            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?,
            gemini_api_keys: Self::load_gemini_keys()?,
            chat_model: env::var("CHAT_MODEL")
                .unwrap_or_else(|_| "gemini-2.5-flash-lite".to_string()),
            embedding_model: env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "gemini-embedding-001".to_string()),
            embedding_dim: parse_or("EMBEDDING_DIM", 3072),
            rerank_provider: match env::var("RERANK_PROVIDER").as_deref() {
                Ok("cohere") => RerankProvider::Cohere,
                _ => RerankProvider::None,
            },
            rerank_model: env::var("RERANK_MODEL")
                .unwrap_or_else(|_| "rerank-multilingual-v3.0".to_string()),
            rerank_topk: parse_or("RERANK_TOPK", 5),
            cohere_api_key: env::var("COHERE_API_KEY").ok(),
            max_tokens_per_window: parse_or("MAX_TOKENS_PER_WINDOW", 1200),
            soft_gap_minutes: parse_or("SOFT_GAP_MINUTES", 5),
            overlap_messages: parse_or("OVERLAP_MESSAGES", 0),
            max_input_tokens: parse_or("MAX_INPUT_TOKENS", 2048),
            llm_token_safety_margin: parse_or("LLM_TOKEN_SAFETY_MARGIN", 128),
            discord_fetch_concurrency: parse_or("DISCORD_FETCH_CONCURRENCY", 15),
            top_candidates_limit: parse_or("TOP_CANDIDATES_LIMIT", 50),
            port: parse_or("PORT", 8080),
        })
    }

    /// Collect GEMINI_API_KEY plus the numbered GEMINI_API_KEY2..GEMINI_API_KEY20
    /// overflow slots into a single pool.
    fn load_gemini_keys() -> anyhow::Result<Vec<String>> {
        let mut keys = Vec::new();
        if let Ok(key) = env::var("GEMINI_API_KEY") {
            if !key.trim().is_empty() {
                keys.push(key);
            }
        }
        for n in 2..=20 {
            if let Ok(key) = env::var(format!("GEMINI_API_KEY{}", n)) {
                if !key.trim().is_empty() {
                    keys.push(key);
                }
            }
        }
        if keys.is_empty() {
            return Err(anyhow::anyhow!("GEMINI_API_KEY must be set"));
        }
        Ok(keys)
    }
}

fn parse_or<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Discord message limit is 2000 characters
pub const DISCORD_MESSAGE_LIMIT: usize = 2000;
/// Embed description limit is 4096 characters
pub const DISCORD_EMBED_LIMIT: usize = 4096;

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Env vars are process-global; serialize the tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn set_required() {
        env::set_var("DISCORD_TOKEN", "test_token");
        env::set_var("DISCORD_APP_ID", "12345");
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::set_var("GEMINI_API_KEY", "k1");
    }

    fn clear_required() {
        env::remove_var("DISCORD_TOKEN");
        env::remove_var("DISCORD_APP_ID");
        env::remove_var("DATABASE_URL");
        env::remove_var("GEMINI_API_KEY");
    }

    #[test]
    fn test_config_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        set_required();

        let config = Config::build().unwrap();

        assert_eq!(config.discord_token, "test_token");
        assert_eq!(config.discord_app_id, 12345);
        assert_eq!(config.embedding_dim, 3072);
        assert_eq!(config.max_tokens_per_window, 1200);
        assert_eq!(config.soft_gap_minutes, 5);
        assert_eq!(config.overlap_messages, 0);
        assert_eq!(config.max_input_tokens, 2048);
        assert_eq!(config.llm_token_safety_margin, 128);
        assert_eq!(config.rerank_provider, RerankProvider::None);
        assert_eq!(config.rerank_topk, 5);
        assert_eq!(config.port, 8080);

        clear_required();
    }

    #[test]
    fn test_config_key_pool() {
        let _guard = ENV_LOCK.lock().unwrap();
        set_required();
        env::set_var("GEMINI_API_KEY2", "k2");
        env::set_var("GEMINI_API_KEY7", "k7");

        let config = Config::build().unwrap();
        assert_eq!(config.gemini_api_keys, vec!["k1", "k2", "k7"]);

        env::remove_var("GEMINI_API_KEY2");
        env::remove_var("GEMINI_API_KEY7");
        clear_required();
    }

    #[test]
    fn test_config_missing_vars() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_required();
        let result = Config::build();
        assert!(result.is_err());
    }
}
