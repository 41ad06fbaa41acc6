/// Bucket to Telegram transfers and link commands
pub mod download;
/// Command handlers
pub mod handlers;
/// Presigned, player and stream links
pub mod links;
/// Object name resolution
pub mod names;
/// Progress message rendering
pub mod progress_render;
/// Periodic progress updates
pub mod reporter;
/// Flood-wait and retry aware messaging
pub mod resilient;
/// Cooldown for unauthorized access notices
pub mod unauthorized_cache;
/// Telegram to bucket transfers
pub mod upload;

pub use unauthorized_cache::UnauthorizedCache;

/// Bot whose requests fail fast: nothing listens on port 1.
#[cfg(test)]
pub(crate) fn offline_bot() -> teloxide::Bot {
    let url = url::Url::parse("http://127.0.0.1:1/").expect("static url");
    teloxide::Bot::new("123456:TEST").set_api_url(url)
}
