//! Utility functions for file names, sizes, durations and message formatting.
//!
//! Regex patterns are declared with `lazy_regex!` so they are validated at
//! compile time and built on first use.

// lazy_regex! uses once_cell internally
#![allow(clippy::non_std_lazy_statics)]

use anyhow::Result;
use lazy_regex::lazy_regex;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::warn;
use unicode_segmentation::UnicodeSegmentation;

/// Longest file name kept after sanitization, extension included.
pub const MAX_FILENAME_LEN: usize = 200;

/// Anything that is not a letter, digit, space, underscore, dot or dash
static RE_UNSAFE_FILENAME_CHARS: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r"[^a-zA-Z0-9 _.\-]");

const SIZE_UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Formats a byte count with base-1024 units and two decimals.
///
/// # Examples
///
/// ```
/// use oxide_wasabi::utils::human_bytes;
/// assert_eq!(human_bytes(0), "0 B");
/// assert_eq!(human_bytes(1536), "1.50 KB");
/// assert_eq!(human_bytes(1_073_741_824), "1.00 GB");
/// ```
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn human_bytes(size: u64) -> String {
    if size == 0 {
        return "0 B".to_string();
    }

    let mut value = size as f64;
    let mut idx = 0;
    while value >= 1024.0 && idx < SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        idx += 1;
    }
    format!("{value:.2} {}", SIZE_UNITS[idx])
}

/// Makes a user-supplied file name safe to use as an object key segment.
///
/// Every character outside `[a-zA-Z0-9 _.-]` becomes `_`. Names longer than
/// [`MAX_FILENAME_LEN`] are shortened while keeping the extension.
///
/// # Examples
///
/// ```
/// use oxide_wasabi::utils::sanitize_filename;
/// assert_eq!(sanitize_filename("my report (final).pdf"), "my report _final_.pdf");
/// ```
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let cleaned = RE_UNSAFE_FILENAME_CHARS.replace_all(name, "_").into_owned();

    // Output is pure ASCII from here on, so byte offsets are char offsets
    if cleaned.len() <= MAX_FILENAME_LEN {
        return cleaned;
    }

    let (stem, ext) = split_extension(&cleaned);
    if ext.len() >= MAX_FILENAME_LEN {
        return cleaned[..MAX_FILENAME_LEN].to_string();
    }
    format!("{}{ext}", &stem[..MAX_FILENAME_LEN - ext.len()])
}

/// Splits `name` into stem and extension (dot included).
///
/// A leading dot is part of the stem, so `.bashrc` has no extension.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 && name[..pos].chars().any(|c| c != '.') => name.split_at(pos),
        _ => (name, ""),
    }
}

/// Formats a duration as `1h 02m 03s`, `4m 05s` or `7s`.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{hours}h {minutes:02}m {seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

/// Escapes text for Telegram HTML parse mode.
#[must_use]
pub fn escape_html(text: &str) -> String {
    html_escape::encode_text(text).into_owned()
}

/// Guesses a MIME type from the file name, falling back to
/// `application/octet-stream`.
#[must_use]
pub fn content_type_for(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// How a stored object is presented by the player page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    File,
}

impl MediaKind {
    /// Path segment used in `/player/<type>/...`
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::File => "file",
        }
    }

    /// Parses the player path segment; unknown values are treated as plain files.
    #[must_use]
    pub fn from_segment(segment: &str) -> Self {
        match segment {
            "video" => Self::Video,
            "audio" => Self::Audio,
            _ => Self::File,
        }
    }
}

/// Classifies a file name by its guessed MIME type.
#[must_use]
pub fn media_kind(name: &str) -> MediaKind {
    let mime = content_type_for(name);
    if mime.starts_with("video/") {
        MediaKind::Video
    } else if mime.starts_with("audio/") {
        MediaKind::Audio
    } else {
        MediaKind::File
    }
}

/// Splits a long message into parts that fit within Telegram's message limit.
///
/// Lines are kept whole where possible. A single line longer than
/// `max_length` is split by grapheme clusters.
///
/// # Examples
///
/// ```
/// use oxide_wasabi::utils::split_long_message;
/// let long_msg = "some_file_name.bin - 1.00 MB\n".repeat(300);
/// let parts = split_long_message(&long_msg, 4096);
/// assert!(parts.len() > 1);
/// ```
#[must_use]
pub fn split_long_message(message: &str, max_length: usize) -> Vec<String> {
    if message.is_empty() {
        return Vec::new();
    }
    if message.len() <= max_length {
        return vec![message.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = String::new();

    for line in message.lines() {
        if line.len() > max_length {
            if !current.is_empty() {
                parts.push(current.trim_end().to_string());
                current.clear();
            }
            let mut chunk = String::new();
            for grapheme in line.graphemes(true) {
                if chunk.len() + grapheme.len() > max_length {
                    parts.push(std::mem::take(&mut chunk));
                }
                chunk.push_str(grapheme);
            }
            current = chunk;
            current.push('\n');
            continue;
        }

        if current.len() + line.len() + 1 > max_length && !current.is_empty() {
            parts.push(current.trim_end().to_string());
            current.clear();
        }
        current.push_str(line);
        current.push('\n');
    }

    if !current.trim_end().is_empty() {
        parts.push(current.trim_end().to_string());
    }
    parts
}

/// Safely truncates a string to a maximum character length (not bytes).
///
/// # Examples
///
/// ```
/// use oxide_wasabi::utils::truncate_str;
/// let s = "Привет, мир!";
/// assert_eq!(truncate_str(s, 6), "Привет");
/// ```
pub fn truncate_str(s: impl AsRef<str>, max_chars: usize) -> String {
    let s = s.as_ref();
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.char_indices()
        .nth(max_chars)
        .map_or_else(|| s.to_string(), |(pos, _)| s[..pos].to_string())
}

/// Delays between retries of a Telegram call: 500ms, doubling, capped at 10s.
///
/// `ExponentialBackoff` raises its base to the n-th power, so the base is 2
/// and the factor scales it to the initial delay.
pub fn telegram_backoff() -> impl Iterator<Item = Duration> {
    use crate::config::{
        TELEGRAM_API_INITIAL_BACKOFF_MS, TELEGRAM_API_MAX_BACKOFF_MS, TELEGRAM_API_MAX_RETRIES,
    };

    ExponentialBackoff::from_millis(2)
        .factor(TELEGRAM_API_INITIAL_BACKOFF_MS / 2)
        .max_delay(Duration::from_millis(TELEGRAM_API_MAX_BACKOFF_MS))
        .take(TELEGRAM_API_MAX_RETRIES)
}

/// Retry an idempotent Telegram API operation with exponential backoff.
///
/// Used for `get_file` and similar calls that may fail on transient network
/// errors. Delays follow [`telegram_backoff`] with jitter applied.
///
/// # Examples
///
/// ```no_run
/// use oxide_wasabi::utils::retry_telegram_operation;
/// use anyhow::Result;
///
/// async fn resolve_path() -> Result<String> {
///     Ok("documents/file_1.pdf".to_string())
/// }
///
/// # async fn example() -> Result<()> {
/// let path = retry_telegram_operation(|| async { resolve_path().await }).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns the last error once all attempts are exhausted.
pub async fn retry_telegram_operation<F, Fut, T>(operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    use crate::config::TELEGRAM_API_MAX_RETRIES;

    let retry_strategy = telegram_backoff().map(jitter);

    Retry::spawn(retry_strategy, operation).await.map_err(|e| {
        warn!(
            "Telegram API operation failed after {} retries: {}",
            TELEGRAM_API_MAX_RETRIES, e
        );
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_telegram_backoff_doubles_from_half_a_second() {
        let delays: Vec<u128> = telegram_backoff().map(|d| d.as_millis()).collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 4_000, 8_000]);
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(0), "0 B");
        assert_eq!(human_bytes(512), "512.00 B");
        assert_eq!(human_bytes(1536), "1.50 KB");
        assert_eq!(human_bytes(1_073_741_824), "1.00 GB");
        assert_eq!(human_bytes(5 * 1024_u64.pow(5)), "5120.00 TB");
    }

    #[test]
    fn test_sanitize_replaces_unsafe_chars() {
        assert_eq!(sanitize_filename("photo_2024.jpg"), "photo_2024.jpg");
        assert_eq!(sanitize_filename("a/b\\c:d.txt"), "a_b_c_d.txt");
        assert_eq!(sanitize_filename("отчёт.pdf"), "_____.pdf");
        assert_eq!(sanitize_filename("my-file v2.tar.gz"), "my-file v2.tar.gz");
    }

    #[test]
    fn test_sanitize_truncates_keeping_extension() {
        let name = format!("{}.mp4", "x".repeat(300));
        let sanitized = sanitize_filename(&name);
        assert_eq!(sanitized.len(), MAX_FILENAME_LEN);
        assert!(sanitized.ends_with(".mp4"));
        assert!(sanitized.starts_with("xxx"));
    }

    #[test]
    fn test_sanitize_huge_extension_is_hard_truncated() {
        let name = format!("a.{}", "e".repeat(300));
        assert_eq!(sanitize_filename(&name).len(), MAX_FILENAME_LEN);

        let dotfile = format!(".{}", "z".repeat(250));
        let sanitized = sanitize_filename(&dotfile);
        assert_eq!(sanitized.len(), MAX_FILENAME_LEN);
        assert!(sanitized.starts_with('.'));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(7)), "7s");
        assert_eq!(format_duration(Duration::from_secs(245)), "4m 05s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 02m 03s");
    }

    #[test]
    fn test_media_kind() {
        assert_eq!(media_kind("clip.mp4"), MediaKind::Video);
        assert_eq!(media_kind("song.mp3"), MediaKind::Audio);
        assert_eq!(media_kind("notes.pdf"), MediaKind::File);
        assert_eq!(media_kind("no_extension"), MediaKind::File);
        assert_eq!(MediaKind::from_segment("audio"), MediaKind::Audio);
        assert_eq!(MediaKind::from_segment("weird"), MediaKind::File);
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("a.pdf"), "application/pdf");
        assert_eq!(content_type_for("blob"), "application/octet-stream");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<b>&"), "&lt;b&gt;&amp;");
    }

    #[test]
    fn test_truncate_str_unicode() {
        let s = "Привет, мир!";
        assert_eq!(truncate_str(s, 6), "Привет");
        assert_eq!(truncate_str(s, 50), "Привет, мир!");
    }

    #[test]
    fn test_split_long_message_simple() {
        let input = "Line 1\nLine 2\nLine 3";
        let parts = split_long_message(input, 13);
        assert_eq!(parts, vec!["Line 1", "Line 2", "Line 3"]);
    }

    #[test]
    fn test_split_very_long_line() {
        let input = "a".repeat(10000);
        let parts = split_long_message(&input, 4096);

        assert!(parts.len() >= 3);
        for part in &parts {
            assert!(part.len() <= 4096);
        }
        let concatenated: String = parts.join("");
        assert_eq!(concatenated.len(), input.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_telegram_operation_recovers() {
        let calls = AtomicUsize::new(0);
        let result = retry_telegram_operation(|| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    anyhow::bail!("transient");
                }
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result.ok(), Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
