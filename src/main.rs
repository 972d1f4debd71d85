use anyhow::Context as AnyhowContext;
use kiroku::commands::{chat, help, sync};
use kiroku::{config::Config, Data};
use poise::serenity_prelude as serenity;
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with EnvFilter
    // Default: debug for kiroku, info for key deps, warn for noisy HTTP internals
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            "kiroku=debug,\
             poise=info,\
             serenity=info,\
             reqwest=info,\
             sqlx=info,\
             axum=info,\
             h2=warn,\
             hyper=warn,\
             hyper_util=warn,\
             rustls=warn",
        )
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).compact())
        .init();

    info!("Starting kiroku...");

    debug!("Loading configuration...");
    let config = Config::from_env()?;
    info!(
        "Configuration loaded ({} Gemini keys in pool)",
        config.gemini_api_keys.len()
    );

    let discord_token = config.discord_token.clone();
    let app_id = config.discord_app_id;

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![sync::sync(), chat::chat(), help::help()],
            on_error: |error| {
                Box::pin(async move {
                    match error {
                        poise::FrameworkError::Command { error, ctx, .. } => {
                            tracing::error!(
                                "Command error in {}: {}",
                                ctx.command().qualified_name,
                                error
                            );
                            let _ = ctx
                                .send(
                                    poise::CreateReply::default()
                                        .content("⚠️ 内部エラーが発生しました。")
                                        .ephemeral(true),
                                )
                                .await;
                        }
                        poise::FrameworkError::UnknownCommand { ctx, msg, .. } => {
                            tracing::warn!("unknown command: {}", msg.content);
                            let _ = msg.reply(ctx, "not implemented").await;
                        }
                        other => {
                            let _ = poise::builtins::on_error(other).await;
                        }
                    }
                })
            },
            ..Default::default()
        })
        .setup(move |ctx, _ready, framework| {
            Box::pin(async move {
                info!("Bot is ready!");
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;

                let db = kiroku::db::Database::new(&config)
                    .await
                    .context("Failed to open database")?;
                db.execute_init()
                    .await
                    .context("Failed to initialize schema")?;

                let http_client = reqwest::Client::new();
                let gemini = Arc::new(kiroku::llm::GeminiClient::new(
                    &config,
                    http_client.clone(),
                ));
                let counter = kiroku::tokens::TokenCounter::new(&config, http_client.clone());
                let reranker = kiroku::llm::rerank::build_reranker(&config, http_client.clone());

                let answers = Arc::new(kiroku::retrieval::AnswerService::new(
                    db.clone(),
                    gemini.clone(),
                    gemini.clone(),
                    reranker,
                    config.rerank_topk,
                    config.top_candidates_limit,
                ));

                // Background sync runner: claims queued operations and drives
                // the fetch → chunk → enqueue pipeline.
                let fetcher = Arc::new(kiroku::fetch::DiscordFetcher::new(
                    ctx.http.clone(),
                    db.clone(),
                    config.discord_fetch_concurrency,
                ));
                let runner = kiroku::sync::SyncRunner::new(
                    db.clone(),
                    fetcher,
                    counter.clone(),
                    kiroku::chunker::ChunkerConfig::from_config(&config),
                );
                tokio::spawn(runner.run());

                // Background embed worker: drains the embed queue into
                // message_embeddings.
                let worker = kiroku::embed_worker::EmbedWorker::new(
                    db.clone(),
                    gemini.clone(),
                    counter.clone(),
                );
                tokio::spawn(worker.run());

                let port = config.port;
                tokio::spawn(async move {
                    if let Err(e) = kiroku::health::serve(port).await {
                        error!("health endpoint error: {}", e);
                    }
                });

                Ok(Data {
                    config,
                    db,
                    answers,
                })
            })
        })
        .build();
    debug!("Poise framework built successfully");

    let intents = serenity::GatewayIntents::non_privileged();
    let mut client = serenity::ClientBuilder::new(&discord_token, intents)
        .application_id(serenity::ApplicationId::new(app_id))
        .framework(framework)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create client: {}", e))?;
    info!("Discord client created successfully");

    // Graceful shutdown handler
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Could not register ctrl+c handler: {}", e);
            return;
        }
        info!("Received shutdown signal, closing shards...");
        shard_manager.shutdown_all().await;
    });

    info!("Bot is connecting to Discord...");
    if let Err(why) = client.start().await {
        error!("Fatal client error: {:?}", why);
    }

    Ok(())
}
