pub mod chunker;
pub mod commands;
pub mod config;
pub mod db;
pub mod discord_text;
pub mod embed_worker;
pub mod error;
pub mod fetch;
pub mod health;
pub mod llm;
pub mod retrieval;
pub mod sync;
pub mod tokens;

/// Custom data passed to all commands
pub struct Data {
    pub config: config::Config,
    pub db: db::Database,
    pub answers: std::sync::Arc<retrieval::AnswerService>,
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
