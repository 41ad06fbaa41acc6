//! Resilient messaging utilities for Telegram API operations.
//!
//! Two kinds of failure are handled here. Transient network errors on
//! idempotent calls are retried with backoff. Flood-wait (`RetryAfter`) on
//! chat edits and sends is honoured by sleeping the requested time and
//! trying exactly once more.

use anyhow::Result;
use std::future::Future;
use teloxide::prelude::*;
use teloxide::types::{ChatId, Message, MessageId, ParseMode};
use teloxide::RequestError;
use tracing::{debug, warn};

/// Telegram's limit is 4096; the margin leaves room for markup.
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4000;

/// Runs `operation`, and on flood-wait sleeps the reported time and retries once.
///
/// # Errors
///
/// Returns the error of the last attempt.
pub async fn with_flood_wait<T, F, Fut>(mut operation: F) -> Result<T, RequestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
{
    match operation().await {
        Err(RequestError::RetryAfter(wait)) => {
            warn!("Flood wait for {:?}, retrying once", wait.duration());
            tokio::time::sleep(wait.duration()).await;
            operation().await
        }
        other => other,
    }
}

/// Send an HTML message, honouring flood-wait.
///
/// # Errors
///
/// Returns an error if Telegram rejects the message.
pub async fn send_html(bot: &Bot, chat_id: ChatId, text: impl Into<String>) -> Result<Message> {
    let text = text.into();
    let msg = with_flood_wait(|| {
        bot.send_message(chat_id, text.clone())
            .parse_mode(ParseMode::Html)
            .send()
    })
    .await?;
    Ok(msg)
}

/// Send a message with automatic retry on network failures.
///
/// Uses [`crate::utils::retry_telegram_operation`]; flood-wait inside each
/// attempt is handled by [`with_flood_wait`].
///
/// # Errors
///
/// Returns an error after all retries are exhausted.
pub async fn send_message_resilient(
    bot: &Bot,
    chat_id: ChatId,
    text: impl Into<String>,
    parse_mode: Option<ParseMode>,
) -> Result<Message> {
    let text = text.into();
    crate::utils::retry_telegram_operation(|| async {
        with_flood_wait(|| {
            let mut req = bot.send_message(chat_id, text.clone());
            if let Some(pm) = parse_mode {
                req = req.parse_mode(pm);
            }
            req.send()
        })
        .await
        .map_err(|e| anyhow::anyhow!("Telegram send error: {e}"))
    })
    .await
}

/// Edit a status message, swallowing failures.
///
/// Text over [`TELEGRAM_MESSAGE_LIMIT`] is truncated. "Not modified" and
/// "not found" are expected during progress updates and only logged at
/// debug level.
///
/// Returns `true` if the message was edited.
pub async fn edit_message_safe_resilient(
    bot: &Bot,
    chat_id: ChatId,
    msg_id: MessageId,
    text: &str,
) -> bool {
    const ERROR_NOT_MODIFIED: &str = "message is not modified";
    const ERROR_NOT_FOUND: &str = "message to edit not found";

    let text = if text.chars().count() > TELEGRAM_MESSAGE_LIMIT {
        format!("{}…", crate::utils::truncate_str(text, TELEGRAM_MESSAGE_LIMIT))
    } else {
        text.to_string()
    };

    let result = with_flood_wait(|| {
        bot.edit_message_text(chat_id, msg_id, text.clone())
            .parse_mode(ParseMode::Html)
            .send()
    })
    .await;

    match result {
        Ok(_) => true,
        Err(e) => {
            let err_msg = e.to_string();
            if err_msg.contains(ERROR_NOT_MODIFIED) || err_msg.contains(ERROR_NOT_FOUND) {
                debug!("Message update skipped: {err_msg}");
            } else {
                warn!("Failed to edit message: {e}");
            }
            false
        }
    }
}

/// Deletes a status message; failures are only logged.
pub async fn delete_message_quiet(bot: &Bot, chat_id: ChatId, msg_id: MessageId) {
    if let Err(e) = with_flood_wait(|| bot.delete_message(chat_id, msg_id).send()).await {
        debug!("Failed to delete message {}: {e}", msg_id.0);
    }
}

/// Sends `text` split into Telegram-sized HTML messages.
///
/// # Errors
///
/// Returns an error if any part fails to send.
pub async fn send_long_html(bot: &Bot, chat_id: ChatId, text: &str) -> Result<()> {
    for part in crate::utils::split_long_message(text, TELEGRAM_MESSAGE_LIMIT) {
        send_html(bot, chat_id, part).await?;
    }
    Ok(())
}
