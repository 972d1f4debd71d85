use crate::db::{SyncMode, SyncScope};
use crate::error::PipelineError;
use crate::{Context, Error};
use tracing::info;

/// Synchronize this server's message history
#[poise::command(slash_command, guild_only)]
pub async fn sync(ctx: Context<'_>) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        ctx.say("このコマンドはサーバー内でのみ使えます。").await?;
        return Ok(());
    };
    ctx.defer_ephemeral().await?;

    let guild = guild_id.to_string();
    let cursor = ctx
        .data()
        .db
        .get_sync_cursor(&guild)
        .await
        .map_err(|e| PipelineError::SyncCursorReadFailed(e.to_string()))?;

    // Delta mode iff a cursor exists for this guild.
    let (mode, since) = match cursor.and_then(|c| c.last_synced_at) {
        Some(last_synced_at) => (SyncMode::Delta, Some(last_synced_at)),
        None => (SyncMode::Full, None),
    };

    let op_id = ctx
        .data()
        .db
        .enqueue_sync_operation(
            &guild,
            SyncScope::Guild,
            mode,
            None,
            since,
            &ctx.author().id.to_string(),
        )
        .await
        .map_err(|e| PipelineError::SyncEnqueueFailed(e.to_string()))?;

    info!(
        "sync requested by {} for guild {}: op {} ({})",
        ctx.author().id,
        guild,
        op_id,
        mode.as_str()
    );
    ctx.send(
        poise::CreateReply::default()
            .content(format!(
                "🔄 同期ジョブを受け付けました\nID: `{}`\nモード: {}\n進捗: 0/100",
                op_id,
                mode.as_str()
            ))
            .ephemeral(true),
    )
    .await?;
    Ok(())
}
