use crate::config::DISCORD_EMBED_LIMIT;
use crate::{Context, Error};
use poise::serenity_prelude::{CreateEmbed, CreateEmbedFooter};
use tracing::{error, info};

/// Ask a question grounded in this server's synchronized history
#[poise::command(slash_command, guild_only)]
pub async fn chat(
    ctx: Context<'_>,
    #[description = "質問の内容"] query: String,
) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        ctx.say("このコマンドはサーバー内でのみ使えます。").await?;
        return Ok(());
    };
    info!(
        "chat command from {} in guild {}: {}",
        ctx.author().id,
        guild_id,
        query
    );
    ctx.defer().await?;

    let result = ctx
        .data()
        .answers
        .answer(
            &guild_id.to_string(),
            &ctx.author().id.to_string(),
            &query,
        )
        .await;

    match result {
        Ok(answer) => {
            let mut description = answer.answer;
            if description.chars().count() > DISCORD_EMBED_LIMIT {
                description = description.chars().take(DISCORD_EMBED_LIMIT - 1).collect();
                description.push('…');
            }

            let mut embed = CreateEmbed::new()
                .description(description)
                .color(0x5865F2)
                .footer(CreateEmbedFooter::new(format!(
                    "{} ms",
                    answer.latency_ms
                )));
            if !answer.citations.is_empty() {
                let sources = answer
                    .citations
                    .iter()
                    .map(|c| format!("{} — {}", c.label, c.jump_link))
                    .collect::<Vec<_>>()
                    .join("\n");
                embed = embed.field("出典", sources, false);
            }

            ctx.send(poise::CreateReply::default().embed(embed)).await?;
        }
        Err(e) => {
            error!("chat failed for guild {}: {:#}", guild_id, e);
            ctx.say("⚠️ 回答の生成に失敗しました。しばらくしてからもう一度お試しください。")
                .await?;
        }
    }
    Ok(())
}
