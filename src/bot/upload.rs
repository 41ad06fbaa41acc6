//! Telegram → bucket upload flow

use super::handlers::{check_rate_limit, get_user_id_safe};
use super::links::{build_share_links, ShareLinks};
use super::reporter::{spawn_reporter, StatusMessage};
use super::resilient::{edit_message_safe_resilient, send_html, with_flood_wait};
use crate::app::AppContext;
use crate::registry::FileRecord;
use crate::stats::ActiveTransfer;
use crate::storage::{user_message, user_object_key};
use crate::transfer::TransferProgress;
use crate::utils::{
    escape_html, format_duration, human_bytes, retry_telegram_operation, sanitize_filename,
};
use anyhow::{Context, Result};
use futures_util::StreamExt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{FileId, InlineKeyboardMarkup, MessageId, ParseMode};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A file attached to an incoming message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingFile {
    pub file_id: FileId,
    pub file_name: String,
    pub size: u64,
}

/// Extracts the uploadable file of a document, video, audio or photo message.
///
/// Photos use the largest available size. Media without a file name get one
/// derived from the file's unique id.
#[must_use]
pub fn incoming_file(msg: &Message) -> Option<IncomingFile> {
    if let Some(doc) = msg.document() {
        return Some(IncomingFile {
            file_id: doc.file.id.clone(),
            file_name: doc
                .file_name
                .clone()
                .unwrap_or_else(|| format!("document_{}", doc.file.unique_id.0)),
            size: u64::from(doc.file.size),
        });
    }
    if let Some(video) = msg.video() {
        return Some(IncomingFile {
            file_id: video.file.id.clone(),
            file_name: video
                .file_name
                .clone()
                .unwrap_or_else(|| format!("video_{}.mp4", video.file.unique_id.0)),
            size: u64::from(video.file.size),
        });
    }
    if let Some(audio) = msg.audio() {
        return Some(IncomingFile {
            file_id: audio.file.id.clone(),
            file_name: audio
                .file_name
                .clone()
                .unwrap_or_else(|| format!("audio_{}.mp3", audio.file.unique_id.0)),
            size: u64::from(audio.file.size),
        });
    }
    let photo = msg.photo()?.iter().max_by_key(|p| p.file.size)?;
    Some(IncomingFile {
        file_id: photo.file.id.clone(),
        file_name: format!("photo_{}.jpg", photo.file.unique_id.0),
        size: u64::from(photo.file.size),
    })
}

/// Why an incoming file is refused before any transfer starts
pub fn size_rejection(ctx: &AppContext, size: u64) -> Option<String> {
    let settings = &ctx.settings;
    if size > settings.max_file_size {
        return Some(format!(
            "❌ File too large: {} (max {}).",
            human_bytes(size),
            human_bytes(settings.max_file_size)
        ));
    }
    let telegram_limit = settings.telegram_download_limit();
    if size > telegram_limit {
        return Some(format!(
            "❌ Telegram only lets bots download files up to {}. This one is {}.",
            human_bytes(telegram_limit),
            human_bytes(size)
        ));
    }
    None
}

/// Unique scratch path in the work directory
pub(crate) fn temp_path(ctx: &AppContext, file_name: &str) -> PathBuf {
    ctx.settings.work_dir().join(format!(
        "{}_{}",
        Uuid::new_v4().simple(),
        sanitize_filename(file_name)
    ))
}

pub(crate) async fn remove_temp(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), "Failed to remove temp file: {e}");
        }
    }
}

/// Awaits `op`, then removes `temp` whether it succeeded or not.
pub(crate) async fn staged<T>(temp: &Path, op: impl Future<Output = T>) -> T {
    let out = op.await;
    remove_temp(temp).await;
    out
}

/// `<32 hex digits>_<name>`, the shape [`temp_path`] produces
fn is_staged_file(name: &str) -> bool {
    name.len() > 33
        && name.as_bytes()[32] == b'_'
        && name[..32].bytes().all(|b| b.is_ascii_hexdigit())
}

/// Deletes staged files left in `dir` by an interrupted run.
///
/// Only names produced by [`temp_path`] are touched, so a shared directory
/// keeps its other files.
///
/// # Errors
///
/// Returns the I/O error if the directory cannot be read or a file cannot
/// be removed.
pub async fn clear_work_dir(dir: &Path) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let staged = entry.file_name().to_str().is_some_and(is_staged_file);
        if staged && entry.file_type().await?.is_file() {
            tokio::fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Handles a media message: Telegram → disk → bucket → links.
///
/// # Errors
///
/// Returns an error only if no reply could be sent at all; transfer failures
/// are reported in the chat.
pub async fn handle_upload(bot: Bot, msg: Message, ctx: Arc<AppContext>) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    let Some(file) = incoming_file(&msg) else {
        return Ok(());
    };
    if !check_rate_limit(&bot, &msg, &ctx).await? {
        return Ok(());
    }
    if let Some(reason) = size_rejection(&ctx, file.size) {
        send_html(&bot, msg.chat.id, reason).await?;
        return Ok(());
    }

    info!(user_id = user_id, file = %file.file_name, size = file.size, "Upload requested");
    let status = send_html(
        &bot,
        msg.chat.id,
        format!("⏳ Preparing <code>{}</code>…", escape_html(&file.file_name)),
    )
    .await?;

    let _active = ActiveTransfer::start(&ctx.stats);
    let temp = temp_path(&ctx, &file.file_name);
    let result = staged(&temp, run_upload(&bot, &msg, &ctx, &file, &temp, status.id)).await;

    match result {
        Ok(()) => ctx.stats.record_upload(),
        Err(e) => {
            error!(user_id = user_id, file = %file.file_name, "Upload failed: {e:#}");
            ctx.stats.set_last_error(format!("upload: {e}"));
            edit_message_safe_resilient(&bot, msg.chat.id, status.id, &user_message(&e)).await;
        }
    }
    Ok(())
}

async fn run_upload(
    bot: &Bot,
    msg: &Message,
    ctx: &AppContext,
    file: &IncomingFile,
    temp: &Path,
    status_id: MessageId,
) -> Result<()> {
    let user_id = get_user_id_safe(msg);
    let started = Instant::now();
    let interval = ctx.settings.progress_interval();
    tokio::fs::create_dir_all(ctx.settings.work_dir())
        .await
        .context("creating work directory")?;

    let progress = Arc::new(TransferProgress::new(file.size));
    let reporter = spawn_reporter(
        StatusMessage::new(bot.clone(), msg.chat.id, status_id),
        format!("📥 Downloading {}", file.file_name),
        Arc::clone(&progress),
        interval,
    );
    let fetched = fetch_from_telegram(bot, &file.file_id, temp, &progress).await;
    reporter.finish().await;
    fetched.context("downloading from Telegram")?;

    let size = tokio::fs::metadata(temp).await?.len();
    let key = user_object_key(user_id, &file.file_name);
    let progress = Arc::new(TransferProgress::new(size));
    let reporter = spawn_reporter(
        StatusMessage::new(bot.clone(), msg.chat.id, status_id),
        format!("📤 Uploading {}", file.file_name),
        Arc::clone(&progress),
        interval,
    );
    let uploaded = ctx.storage.upload_file(temp, &key, progress).await;
    reporter.finish().await;
    uploaded?;

    let links = build_share_links(ctx.storage.as_ref(), &ctx.settings, &ctx.signer, &key).await?;
    let channel_message_id = backup_to_channel(bot, msg, ctx, &key).await;
    ctx.registry
        .insert(FileRecord::new(&file.file_name, size, &key).with_channel_message(channel_message_id));

    info!(user_id = user_id, key = %key, size = size, "Upload complete");
    let text = upload_summary(&key, size, started.elapsed(), &links, ctx.settings.presign_expiry());
    deliver_summary(bot, msg.chat.id, status_id, &text, links.keyboard()).await;
    Ok(())
}

/// How the final upload message reached the chat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SummaryDelivery {
    Edited,
    Sent,
    Lost,
}

/// Replaces the status message with the summary, or sends it as a new
/// message if the edit fails. The object is stored by now, so a lost
/// summary is only logged.
pub(crate) async fn deliver_summary(
    bot: &Bot,
    chat_id: ChatId,
    status_id: MessageId,
    text: &str,
    keyboard: Option<InlineKeyboardMarkup>,
) -> SummaryDelivery {
    let edited = with_flood_wait(|| {
        let mut req = bot
            .edit_message_text(chat_id, status_id, text.to_string())
            .parse_mode(ParseMode::Html);
        if let Some(kb) = keyboard.clone() {
            req = req.reply_markup(kb);
        }
        req.send()
    })
    .await;
    let Err(e) = edited else {
        return SummaryDelivery::Edited;
    };
    warn!("Could not edit upload summary, sending it instead: {e}");

    let sent = with_flood_wait(|| {
        let mut req = bot
            .send_message(chat_id, text.to_string())
            .parse_mode(ParseMode::Html);
        if let Some(kb) = keyboard.clone() {
            req = req.reply_markup(kb);
        }
        req.send()
    })
    .await;
    match sent {
        Ok(_) => SummaryDelivery::Sent,
        Err(e) => {
            error!("Upload summary could not be delivered: {e}");
            SummaryDelivery::Lost
        }
    }
}

/// Copies the user's original message to the storage channel.
async fn backup_to_channel(bot: &Bot, msg: &Message, ctx: &AppContext, key: &str) -> Option<i32> {
    let channel = ChatId(ctx.settings.storage_channel_id?);
    match with_flood_wait(|| {
        bot.copy_message(channel, msg.chat.id, msg.id)
            .caption(key.to_string())
            .send()
    })
    .await
    {
        Ok(copied) => Some(copied.0),
        Err(e) => {
            warn!(key = %key, "Channel backup failed: {e}");
            None
        }
    }
}

/// Streams a Telegram file to `dest`, counting bytes into `progress`.
///
/// A self-hosted Bot API server in local mode reports an absolute path on
/// its own disk; such files are copied directly.
async fn fetch_from_telegram(
    bot: &Bot,
    file_id: &FileId,
    dest: &Path,
    progress: &TransferProgress,
) -> Result<()> {
    let remote = retry_telegram_operation(|| async {
        Ok(bot.get_file(file_id.clone()).await?)
    })
    .await?;

    let local = Path::new(&remote.path);
    if local.is_absolute() && tokio::fs::try_exists(local).await.unwrap_or(false) {
        let copied = tokio::fs::copy(local, dest).await?;
        progress.add(copied);
        return Ok(());
    }

    let mut out = tokio::fs::File::create(dest).await?;
    let mut stream = bot.download_file_stream(&remote.path);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        out.write_all(&chunk).await?;
        progress.add(chunk.len() as u64);
    }
    out.flush().await?;
    Ok(())
}

/// "24h" for whole hours, otherwise the full duration
pub(crate) fn expiry_label(expiry: Duration) -> String {
    let secs = expiry.as_secs();
    if secs > 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else {
        format_duration(expiry)
    }
}

pub(crate) fn href(url: &str) -> std::borrow::Cow<'_, str> {
    html_escape::encode_double_quoted_attribute(url)
}

fn upload_summary(
    key: &str,
    size: u64,
    took: Duration,
    links: &ShareLinks,
    expiry: Duration,
) -> String {
    format!(
        "✅ <b>Upload complete</b>\n\n\
         📄 <code>{}</code>\n\
         📦 {}\n\
         ⏱ {}\n\n\
         🔗 <a href=\"{}\">Direct link</a> (valid {})\n\
         ▶️ <a href=\"{}\">Player</a>\n\
         📡 <a href=\"{}\">Stream</a>",
        escape_html(crate::storage::display_name(key)),
        human_bytes(size),
        format_duration(took),
        href(&links.direct),
        expiry_label(expiry),
        href(&links.player),
        href(&links.stream),
    )
}
