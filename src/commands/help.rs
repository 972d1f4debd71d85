use crate::{Context, Error};

const HELP_TEXT: &str = "**使い方**\n\
`/sync` — このサーバーのメッセージ履歴を同期します(初回は全件、以降は差分)。\n\
`/chat <質問>` — 同期済みの履歴を根拠に質問へ答えます。\n\
`/help` — このヘルプを表示します。";

/// Show usage help
#[poise::command(slash_command)]
pub async fn help(ctx: Context<'_>) -> Result<(), Error> {
    ctx.send(
        poise::CreateReply::default()
            .content(HELP_TEXT)
            .ephemeral(true),
    )
    .await?;
    Ok(())
}
