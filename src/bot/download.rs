//! Bucket → Telegram flow and link commands

use super::handlers::{check_rate_limit, get_user_id_safe, resolve_user_key};
use super::links::build_share_links;
use super::reporter::{spawn_reporter, StatusMessage};
use super::resilient::{delete_message_quiet, edit_message_safe_resilient, send_html, with_flood_wait};
use super::upload::{expiry_label, href, staged, temp_path};
use crate::app::AppContext;
use crate::stats::ActiveTransfer;
use crate::storage::{display_name, user_message};
use crate::transfer::TransferProgress;
use crate::utils::{escape_html, human_bytes};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{InputFile, MessageId, ParseMode};
use tracing::{error, info, warn};

/// A backup of the object in the storage channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChannelCopy {
    pub channel: ChatId,
    pub message_id: MessageId,
}

/// How an object is delivered when no channel copy is used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BucketDelivery {
    /// Over Telegram's upload limit: reply with a presigned link
    Link { size: u64 },
    /// Fetch from the bucket and send as a document
    Document { size: u64 },
}

/// Channel copy for `key`, if a storage channel is configured and the
/// registry knows the backup message.
pub(crate) fn channel_copy_for(ctx: &AppContext, key: &str) -> Option<ChannelCopy> {
    let channel = ChatId(ctx.settings.storage_channel_id?);
    let message_id = MessageId(ctx.registry.get(key)?.channel_message_id?);
    Some(ChannelCopy {
        channel,
        message_id,
    })
}

/// Picks link or document by the object's size.
///
/// # Errors
///
/// Returns the storage error of the `HeadObject` call.
pub(crate) async fn bucket_delivery(ctx: &AppContext, key: &str) -> Result<BucketDelivery> {
    let size = ctx.storage.head_object(key).await?.size;
    Ok(if size > ctx.settings.telegram_upload_limit() {
        BucketDelivery::Link { size }
    } else {
        BucketDelivery::Document { size }
    })
}

/// `/download <name>`: sends a stored file back into the chat.
///
/// # Errors
///
/// Returns an error if no reply could be sent.
pub async fn download(bot: Bot, msg: Message, ctx: Arc<AppContext>, name: String) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    if name.trim().is_empty() {
        send_html(&bot, msg.chat.id, "Usage: <code>/download &lt;file name&gt;</code>").await?;
        return Ok(());
    }
    if !check_rate_limit(&bot, &msg, &ctx).await? {
        return Ok(());
    }

    let key = match resolve_user_key(&ctx, user_id, &name).await {
        Ok(Some(key)) => key,
        Ok(None) => {
            send_html(&bot, msg.chat.id, not_found_text(&name)).await?;
            return Ok(());
        }
        Err(e) => {
            send_html(&bot, msg.chat.id, user_message(&e)).await?;
            return Ok(());
        }
    };

    if let Some(copy) = channel_copy_for(&ctx, &key) {
        if send_channel_copy(&bot, msg.chat.id, &key, copy).await {
            ctx.stats.record_download();
            return Ok(());
        }
    }

    let status = send_html(
        &bot,
        msg.chat.id,
        format!("⏳ Fetching <code>{}</code>…", escape_html(display_name(&key))),
    )
    .await?;

    let _active = ActiveTransfer::start(&ctx.stats);
    let temp = temp_path(&ctx, display_name(&key));
    let result = staged(&temp, run_download(&bot, &msg, &ctx, &key, &temp, status.id)).await;

    match result {
        Ok(()) => ctx.stats.record_download(),
        Err(e) => {
            error!(user_id = user_id, key = %key, "Download failed: {e:#}");
            ctx.stats.set_last_error(format!("download: {e}"));
            edit_message_safe_resilient(&bot, msg.chat.id, status.id, &user_message(&e)).await;
        }
    }
    Ok(())
}

/// Copies the backup message into `chat_id`; `false` means fall back to the bucket.
pub(crate) async fn send_channel_copy(bot: &Bot, chat_id: ChatId, key: &str, copy: ChannelCopy) -> bool {
    match with_flood_wait(|| {
        bot.copy_message(chat_id, copy.channel, copy.message_id)
            .send()
    })
    .await
    {
        Ok(_) => {
            info!(key = %key, "Served download from channel copy");
            true
        }
        Err(e) => {
            warn!(key = %key, "Channel copy failed, falling back to bucket: {e}");
            false
        }
    }
}

async fn run_download(
    bot: &Bot,
    msg: &Message,
    ctx: &AppContext,
    key: &str,
    temp: &Path,
    status_id: MessageId,
) -> Result<()> {
    let name = display_name(key);
    let size = match bucket_delivery(ctx, key).await? {
        BucketDelivery::Document { size } => size,
        BucketDelivery::Link { size } => {
            let links = build_share_links(ctx.storage.as_ref(), &ctx.settings, &ctx.signer, key).await?;
            let text = format!(
                "📦 <code>{}</code> is {}, above Telegram's {} limit for bots.\n\n\
                 🔗 <a href=\"{}\">Download from storage</a> (valid {})",
                escape_html(name),
                human_bytes(size),
                human_bytes(ctx.settings.telegram_upload_limit()),
                href(&links.direct),
                expiry_label(ctx.settings.presign_expiry()),
            );
            edit_message_safe_resilient(bot, msg.chat.id, status_id, &text).await;
            return Ok(());
        }
    };

    tokio::fs::create_dir_all(ctx.settings.work_dir())
        .await
        .context("creating work directory")?;
    let progress = Arc::new(TransferProgress::new(size));
    let reporter = spawn_reporter(
        StatusMessage::new(bot.clone(), msg.chat.id, status_id),
        format!("📥 Fetching {name}"),
        Arc::clone(&progress),
        ctx.settings.progress_interval(),
    );
    let fetched = ctx.storage.download_file(key, temp, progress).await;
    reporter.finish().await;
    let size = fetched?;

    edit_message_safe_resilient(
        bot,
        msg.chat.id,
        status_id,
        &format!("📤 Sending <code>{}</code> to Telegram…", escape_html(name)),
    )
    .await;

    let caption = format!("📄 <code>{}</code>\n📦 {}", escape_html(name), human_bytes(size));
    let chat_id = msg.chat.id;
    with_flood_wait(|| {
        bot.send_document(chat_id, InputFile::file(temp).file_name(name.to_string()))
            .caption(caption.clone())
            .parse_mode(ParseMode::Html)
            .send()
    })
    .await
    .context("sending document")?;

    delete_message_quiet(bot, chat_id, status_id).await;
    info!(key = %key, size = size, "Download sent");
    Ok(())
}

/// `/stream <name>` and `/play <name>`: replies with presigned, player and proxy links.
///
/// # Errors
///
/// Returns an error if no reply could be sent.
pub async fn stream(bot: Bot, msg: Message, ctx: Arc<AppContext>, name: String) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    if name.trim().is_empty() {
        send_html(&bot, msg.chat.id, "Usage: <code>/stream &lt;file name&gt;</code>").await?;
        return Ok(());
    }
    if !check_rate_limit(&bot, &msg, &ctx).await? {
        return Ok(());
    }

    let result = async {
        let Some(key) = resolve_user_key(&ctx, user_id, &name).await? else {
            return Ok(None);
        };
        let info = ctx.storage.head_object(&key).await?;
        let links = build_share_links(ctx.storage.as_ref(), &ctx.settings, &ctx.signer, &key).await?;
        Ok::<_, anyhow::Error>(Some((key, info, links)))
    }
    .await;

    let (key, info, links) = match result {
        Ok(Some(found)) => found,
        Ok(None) => {
            send_html(&bot, msg.chat.id, not_found_text(&name)).await?;
            return Ok(());
        }
        Err(e) => {
            error!(user_id = user_id, name = %name, "Stream links failed: {e:#}");
            ctx.stats.set_last_error(format!("stream: {e}"));
            send_html(&bot, msg.chat.id, user_message(&e)).await?;
            return Ok(());
        }
    };

    let text = format!(
        "🎬 <code>{}</code>\n📦 {}\n⏳ Links valid {}\n\n\
         🔗 <a href=\"{}\">Direct link</a>\n\
         ▶️ <a href=\"{}\">Player</a>\n\
         📡 <a href=\"{}\">Stream</a>",
        escape_html(display_name(&key)),
        human_bytes(info.size),
        expiry_label(ctx.settings.presign_expiry()),
        href(&links.direct),
        href(&links.player),
        href(&links.stream),
    );

    let mut req = bot.send_message(msg.chat.id, text).parse_mode(ParseMode::Html);
    if let Some(kb) = links.keyboard() {
        req = req.reply_markup(kb);
    }
    req.await?;
    info!(user_id = user_id, key = %key, "Stream links sent");
    Ok(())
}

pub(crate) fn not_found_text(name: &str) -> String {
    format!(
        "❌ File <code>{}</code> not found. Use /list to see your files.",
        escape_html(name.trim())
    )
}
