use super::names::match_object_name;
use super::resilient::{send_html, send_long_html, send_message_resilient};
use super::upload::expiry_label;
use crate::access::{AccessList, Removal};
use crate::app::AppContext;
use crate::storage::{display_name, user_message, user_prefix, ObjectInfo};
use crate::utils::{escape_html, format_duration, human_bytes};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use teloxide::types::ParseMode;
use teloxide::{prelude::*, utils::command::BotCommands};
use tracing::{error, info, warn};

/// Files shown by `/list` before the remainder is summarized
pub const LIST_LIMIT: usize = 20;

/// Window used for the "active users" figure
pub const ACTIVE_USER_WINDOW: Duration = Duration::from_secs(300);

// Helper function to get user name from Message
pub(crate) fn get_user_name(msg: &Message) -> String {
    if let Some(ref user) = msg.from {
        if let Some(ref username) = user.username {
            return username.clone();
        }
        if !user.first_name.is_empty() {
            return user.first_name.clone();
        }
    }
    "Unknown".to_string()
}

/// Safe extraction of user ID from a message.
/// Returns 0 if the user information is missing.
pub fn get_user_id_safe(msg: &Message) -> i64 {
    msg.from.as_ref().map_or(0, |u| u.id.0.cast_signed())
}

/// Supported commands for the bot
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Supported commands:")]
pub enum Command {
    #[command(description = "Start the bot.")]
    Start,
    #[command(description = "Show help.")]
    Help,
    #[command(description = "List your stored files.")]
    List,
    #[command(description = "Send a stored file back to this chat.")]
    Download(String),
    #[command(description = "Get streaming links for a file.")]
    Stream(String),
    #[command(description = "Same as /stream.")]
    Play(String),
    #[command(description = "Delete a stored file.")]
    Delete(String),
    #[command(description = "Check storage and Telegram connectivity.")]
    Test,
    #[command(description = "Show bot status.")]
    Status,
    #[command(description = "Admin: allow a user ID.")]
    AddUser(String),
    #[command(description = "Admin: revoke a user ID.")]
    RemoveUser(String),
    #[command(description = "Admin: show the allow-list.")]
    ListUsers,
}

/// Records a request for the sender and tells them off when over the limit.
///
/// Returns `false` if the request must be dropped.
///
/// # Errors
///
/// Returns an error if the rate-limit notice cannot be sent.
pub async fn check_rate_limit(bot: &Bot, msg: &Message, ctx: &AppContext) -> Result<bool> {
    let user_id = get_user_id_safe(msg);
    if ctx.limiter.check(user_id) {
        return Ok(true);
    }
    warn!(user_id = user_id, "Rate limit exceeded");
    send_html(
        bot,
        msg.chat.id,
        format!(
            "⏳ Rate limit exceeded ({} requests per minute). Please wait a moment.",
            ctx.limiter.max_requests()
        ),
    )
    .await?;
    Ok(false)
}

/// Maps a user-supplied name to one of the user's object keys.
///
/// # Errors
///
/// Returns the storage error if listing fails.
pub async fn resolve_user_key(ctx: &AppContext, user_id: i64, name: &str) -> Result<Option<String>> {
    let keys: Vec<String> = ctx
        .storage
        .list_objects(&user_prefix(user_id))
        .await?
        .into_iter()
        .map(|o| o.key)
        .collect();
    Ok(match_object_name(&keys, user_id, name))
}

/// Start handler
///
/// # Errors
///
/// Returns an error if the welcome message cannot be sent.
pub async fn start(bot: Bot, msg: Message, ctx: Arc<AppContext>) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    let user_name = get_user_name(&msg);
    info!("User {user_id} ({user_name}) initiated /start command.");

    let text = format!(
        "👋 <b>Hello, {}!</b>\n\n\
         Send me any document, video, audio or photo and I will store it in the cloud \
         and give you a download link.\n\n\
         📦 Max file size: {}\n\
         🔗 Links stay valid for {}\n\n\
         Type /help to see all commands.",
        escape_html(&user_name),
        human_bytes(ctx.settings.max_file_size),
        expiry_label(ctx.settings.presign_expiry()),
    );
    send_message_resilient(&bot, msg.chat.id, text, Some(ParseMode::Html)).await?;
    Ok(())
}

/// Help handler
///
/// # Errors
///
/// Returns an error if the message cannot be sent.
pub async fn help(bot: Bot, msg: Message) -> Result<()> {
    send_message_resilient(&bot, msg.chat.id, Command::descriptions().to_string(), None).await?;
    Ok(())
}

fn format_listing(objects: &[ObjectInfo]) -> String {
    let mut lines = vec![format!("📁 <b>Your files</b> ({})", objects.len()), String::new()];
    for (i, obj) in objects.iter().take(LIST_LIMIT).enumerate() {
        lines.push(format!(
            "{}. <code>{}</code> ({})",
            i + 1,
            escape_html(display_name(&obj.key)),
            human_bytes(obj.size)
        ));
    }
    if objects.len() > LIST_LIMIT {
        lines.push(format!("\n…and {} more files", objects.len() - LIST_LIMIT));
    }
    lines.join("\n")
}

/// `/list`: newest files of the user, straight from the bucket
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn list(bot: Bot, msg: Message, ctx: Arc<AppContext>) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    if !check_rate_limit(&bot, &msg, &ctx).await? {
        return Ok(());
    }

    match ctx.storage.list_objects(&user_prefix(user_id)).await {
        Ok(objects) if objects.is_empty() => {
            send_html(&bot, msg.chat.id, "📂 You have no stored files yet.").await?;
        }
        Ok(mut objects) => {
            objects.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
            send_long_html(&bot, msg.chat.id, &format_listing(&objects)).await?;
        }
        Err(e) => {
            error!(user_id = user_id, "Listing failed: {e}");
            ctx.stats.set_last_error(format!("list: {e}"));
            send_html(&bot, msg.chat.id, e.user_message()).await?;
        }
    }
    Ok(())
}

/// `/delete <name>`
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn delete(bot: Bot, msg: Message, ctx: Arc<AppContext>, name: String) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    if name.trim().is_empty() {
        send_html(&bot, msg.chat.id, "Usage: <code>/delete &lt;file name&gt;</code>").await?;
        return Ok(());
    }
    if !check_rate_limit(&bot, &msg, &ctx).await? {
        return Ok(());
    }

    let result = async {
        let Some(key) = resolve_user_key(&ctx, user_id, &name).await? else {
            return Ok(None);
        };
        ctx.storage.delete_object(&key).await?;
        ctx.registry.remove(&key);
        Ok::<_, anyhow::Error>(Some(key))
    }
    .await;

    let reply = match result {
        Ok(Some(key)) => {
            info!(user_id = user_id, key = %key, "Deleted by user");
            format!("🗑 Deleted <code>{}</code>.", escape_html(display_name(&key)))
        }
        Ok(None) => super::download::not_found_text(&name),
        Err(e) => {
            error!(user_id = user_id, name = %name, "Delete failed: {e:#}");
            ctx.stats.set_last_error(format!("delete: {e}"));
            user_message(&e)
        }
    };
    send_html(&bot, msg.chat.id, reply).await?;
    Ok(())
}

/// `/test`: checks the bucket and the Bot API.
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn test(bot: Bot, msg: Message, ctx: Arc<AppContext>) -> Result<()> {
    let storage_line = match ctx.storage.check_connection().await {
        Ok(()) => format!("✅ Storage: bucket <code>{}</code> reachable", escape_html(ctx.bucket())),
        Err(e) => {
            ctx.stats.set_last_error(format!("storage check: {e}"));
            format!("❌ Storage: {}", escape_html(&e.to_string()))
        }
    };
    let telegram_line = match bot.get_me().await {
        Ok(me) => format!("✅ Telegram: @{}", escape_html(me.username())),
        Err(e) => format!("❌ Telegram: {}", escape_html(&e.to_string())),
    };

    send_html(
        &bot,
        msg.chat.id,
        format!("🧪 <b>Connectivity test</b>\n\n{storage_line}\n{telegram_line}"),
    )
    .await?;
    Ok(())
}

fn format_status(ctx: &AppContext, user_id: i64) -> String {
    let stats = &ctx.stats;
    let session_uploads = ctx.registry.for_user(&user_prefix(user_id)).len();
    format!(
        "📊 <b>Bot status</b>\n\n\
         ⏱ Uptime: {}\n\
         📤 Uploads: {}\n\
         📥 Downloads: {}\n\
         🔄 Active transfers: {}\n\
         👥 Tracked users: {}\n\
         🚦 Rate limit: {} requests/min\n\
         📦 Max file size: {}\n\
         ⚠️ Last error: {}\n\n\
         🗂 Your uploads since start: {}",
        format_duration(stats.uptime()),
        stats.uploads(),
        stats.downloads(),
        stats.active_transfers(),
        ctx.limiter.tracked_users(),
        ctx.limiter.max_requests(),
        human_bytes(ctx.settings.max_file_size),
        stats
            .last_error()
            .map_or_else(|| "none".to_string(), |e| escape_html(&crate::utils::truncate_str(e, 200))),
        session_uploads,
    )
}

/// `/status`
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn status(bot: Bot, msg: Message, ctx: Arc<AppContext>) -> Result<()> {
    send_html(&bot, msg.chat.id, format_status(&ctx, get_user_id_safe(&msg))).await?;
    Ok(())
}

const ADD_USER_USAGE: &str = "⚠️ Usage: <code>/adduser &lt;user_id&gt;</code>";
const REMOVE_USER_USAGE: &str = "⚠️ Usage: <code>/removeuser &lt;user_id&gt;</code>";

fn parse_user_id(arg: &str) -> Option<i64> {
    arg.trim().parse().ok()
}

pub(crate) fn add_user_reply(access: &AccessList, arg: &str) -> String {
    let Some(id) = parse_user_id(arg) else {
        return ADD_USER_USAGE.to_string();
    };
    if access.add(id) {
        format!("✅ User <code>{id}</code> has been added.")
    } else {
        format!("ℹ️ User <code>{id}</code> is already authorized.")
    }
}

pub(crate) fn remove_user_reply(access: &AccessList, arg: &str) -> String {
    let Some(id) = parse_user_id(arg) else {
        return REMOVE_USER_USAGE.to_string();
    };
    match access.remove(id) {
        Removal::Removed => format!("🗑 User <code>{id}</code> has been removed."),
        Removal::NotListed => format!("🤷 User <code>{id}</code> is not in the authorized list."),
        Removal::Admin => "🚫 You cannot remove the admin.".to_string(),
    }
}

pub(crate) fn list_users_reply(access: &AccessList) -> String {
    let users = access.users();
    let mut lines = vec![format!("👥 <b>Authorized users</b> ({})", users.len())];
    if let Some(admin) = access.admin() {
        lines.push(format!("👑 Admin: <code>{admin}</code>"));
    }
    lines.extend(users.iter().map(|id| format!("• <code>{id}</code>")));
    if access.is_open() {
        lines.push("🔓 Nobody is listed, so the bot is open to everyone.".to_string());
    }
    lines.join("\n")
}

/// Lets the admin through; everyone else gets a refusal.
async fn require_admin(bot: &Bot, msg: &Message, ctx: &AppContext) -> Result<bool> {
    let user_id = get_user_id_safe(msg);
    if ctx.access.is_admin(user_id) {
        return Ok(true);
    }
    warn!(user_id = user_id, "Admin command refused");
    send_html(bot, msg.chat.id, "⛔️ This command is for the admin only.").await?;
    Ok(false)
}

/// `/adduser <id>`
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn add_user(bot: Bot, msg: Message, ctx: Arc<AppContext>, arg: String) -> Result<()> {
    if require_admin(&bot, &msg, &ctx).await? {
        let reply = add_user_reply(&ctx.access, &arg);
        info!(arg = %arg.trim(), "Admin edited allow-list (add)");
        send_html(&bot, msg.chat.id, reply).await?;
    }
    Ok(())
}

/// `/removeuser <id>`
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn remove_user(bot: Bot, msg: Message, ctx: Arc<AppContext>, arg: String) -> Result<()> {
    if require_admin(&bot, &msg, &ctx).await? {
        let reply = remove_user_reply(&ctx.access, &arg);
        info!(arg = %arg.trim(), "Admin edited allow-list (remove)");
        send_html(&bot, msg.chat.id, reply).await?;
    }
    Ok(())
}

/// `/listusers`
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn list_users(bot: Bot, msg: Message, ctx: Arc<AppContext>) -> Result<()> {
    if require_admin(&bot, &msg, &ctx).await? {
        send_html(&bot, msg.chat.id, list_users_reply(&ctx.access)).await?;
    }
    Ok(())
}

/// Reply to plain text from authorized users
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn hint(bot: Bot, msg: Message) -> Result<()> {
    send_html(
        &bot,
        msg.chat.id,
        "📎 Send me a file to upload it, or use /help to see what I can do.",
    )
    .await?;
    Ok(())
}
