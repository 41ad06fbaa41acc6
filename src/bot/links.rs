//! Share links for stored objects
//!
//! Every object can be reached three ways: the presigned bucket URL, the
//! player page of the HTTP server and the streaming proxy. Proxy links are
//! signed and expire together with the presigned URL.

use crate::config::Settings;
use crate::signing::StreamSigner;
use crate::storage::{StorageError, StorageProvider};
use crate::utils::{media_kind, MediaKind};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};
use url::Url;

/// URL-safe base64 that accepts input with or without `=` padding
const PLAYER_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareLinks {
    pub kind: MediaKind,
    /// Presigned bucket URL
    pub direct: String,
    pub player: String,
    pub stream: String,
}

/// Encodes a target URL for the `/player/<type>/<encoded_url>` route.
#[must_use]
pub fn encode_player_target(url: &str) -> String {
    PLAYER_ENGINE.encode(url)
}

/// Decodes a player path segment back into an http(s) URL.
#[must_use]
pub fn decode_player_target(encoded: &str) -> Option<String> {
    let bytes = PLAYER_ENGINE.decode(encoded.trim()).ok()?;
    let target = String::from_utf8(bytes).ok()?;
    let parsed = Url::parse(&target).ok()?;
    matches!(parsed.scheme(), "http" | "https").then_some(target)
}

/// `<base>/player/<kind>/<encoded target>`
#[must_use]
pub fn player_url(base: &str, kind: MediaKind, target: &str) -> String {
    format!(
        "{base}/player/{}/{}",
        kind.as_str(),
        encode_player_target(target)
    )
}

/// `<base>/stream/<key>?expires=<unix>&sig=<hex>` with each key segment
/// percent-encoded
#[must_use]
pub fn stream_url(base: &str, key: &str, expires: i64, signature: &str) -> String {
    let fallback = || format!("{base}/stream/{key}?expires={expires}&sig={signature}");
    let Ok(mut url) = Url::parse(base) else {
        return fallback();
    };
    match url.path_segments_mut() {
        Ok(mut segments) => {
            segments.pop_if_empty().push("stream").extend(key.split('/'));
        }
        Err(()) => return fallback(),
    }
    url.query_pairs_mut()
        .append_pair("expires", &expires.to_string())
        .append_pair("sig", signature);
    url.to_string()
}

/// Presigns `key` and derives the player and stream links from it.
///
/// # Errors
///
/// Returns the storage error if presigning fails.
pub async fn build_share_links(
    storage: &dyn StorageProvider,
    settings: &Settings,
    signer: &StreamSigner,
    key: &str,
) -> Result<ShareLinks, StorageError> {
    let expiry = settings.presign_expiry();
    let direct = storage.presigned_url(key, expiry).await?;
    let base = settings.public_base_url();
    let kind = media_kind(key);
    let expires = chrono::Utc::now().timestamp() + i64::try_from(expiry.as_secs()).unwrap_or(i64::MAX / 2);

    Ok(ShareLinks {
        kind,
        player: player_url(&base, kind, &direct),
        stream: stream_url(&base, key, expires, &signer.sign(key, expires)),
        direct,
    })
}

impl ShareLinks {
    /// URL buttons for the links Telegram will accept.
    ///
    /// Telegram rejects plain-http and localhost URLs in buttons, so those
    /// links only appear in the message text.
    #[must_use]
    pub fn keyboard(&self) -> Option<InlineKeyboardMarkup> {
        let label = match self.kind {
            MediaKind::Video => "▶️ Play video",
            MediaKind::Audio => "🎵 Play audio",
            MediaKind::File => "📄 Open page",
        };
        let rows: Vec<Vec<InlineKeyboardButton>> = [
            ("⬇️ Direct download", &self.direct),
            (label, &self.player),
            ("📡 Stream", &self.stream),
        ]
        .into_iter()
        .filter_map(|(text, link)| button_url(link).map(|u| vec![InlineKeyboardButton::url(text, u)]))
        .collect();

        (!rows.is_empty()).then(|| InlineKeyboardMarkup::new(rows))
    }
}

fn button_url(link: &str) -> Option<Url> {
    let url = Url::parse(link).ok()?;
    let public = url.scheme() == "https"
        && url
            .host_str()
            .is_some_and(|h| h != "localhost" && h != "127.0.0.1");
    public.then_some(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MockStorageProvider;
    use mockall::predicate::eq;
    use std::time::Duration;

    #[test]
    fn player_target_round_trips_with_and_without_padding() {
        let target = "https://s3.wasabisys.com/b/user_1/a.mp4?X-Amz-Expires=86400";
        let encoded = encode_player_target(target);
        assert_eq!(decode_player_target(&encoded).as_deref(), Some(target));

        let unpadded = encoded.trim_end_matches('=');
        assert_eq!(decode_player_target(unpadded).as_deref(), Some(target));
    }

    #[test]
    fn player_target_rejects_garbage_and_other_schemes() {
        assert_eq!(decode_player_target("%%%"), None);
        assert_eq!(
            decode_player_target(&encode_player_target("javascript:alert(1)")),
            None
        );
    }

    #[test]
    fn stream_url_encodes_segments() {
        assert_eq!(
            stream_url("https://files.example.com", "user_1/my clip.mp4", 100, "ab12"),
            "https://files.example.com/stream/user_1/my%20clip.mp4?expires=100&sig=ab12"
        );
        assert_eq!(
            stream_url("http://localhost:8080", "user_1/a.txt", 7, "ff"),
            "http://localhost:8080/stream/user_1/a.txt?expires=7&sig=ff"
        );
    }

    #[tokio::test]
    async fn share_links_delegate_presign_verbatim() {
        let mut settings = crate::config::test_settings();
        settings.public_url = Some("https://files.example.com".to_string());

        let mut storage = MockStorageProvider::new();
        storage
            .expect_presigned_url()
            .with(eq("user_7/clip.mp4"), eq(Duration::from_secs(86_400)))
            .times(1)
            .returning(|_, _| Ok("https://bucket.example/user_7/clip.mp4?sig=1".to_string()));

        let signer = StreamSigner::new(b"secret");
        let links = build_share_links(&storage, &settings, &signer, "user_7/clip.mp4").await;
        let links = links.ok();

        assert_eq!(
            links.as_ref().map(|l| l.direct.as_str()),
            Some("https://bucket.example/user_7/clip.mp4?sig=1")
        );
        assert_eq!(links.as_ref().map(|l| l.kind), Some(MediaKind::Video));
        assert!(links
            .as_ref()
            .is_some_and(|l| l.player.starts_with("https://files.example.com/player/video/")));
        assert_eq!(
            links.as_ref().and_then(ShareLinks::keyboard).map(|k| k.inline_keyboard.len()),
            Some(3)
        );

        // The proxy link is signed for the same lifetime as the presigned URL
        let stream = links.map(|l| l.stream).unwrap_or_default();
        let url = Url::parse(&stream).expect("stream url");
        assert_eq!(url.path(), "/stream/user_7/clip.mp4");
        let query: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        let expires: i64 = query["expires"].parse().expect("expires");
        let now = chrono::Utc::now().timestamp();
        assert!((now + 86_390..=now + 86_400).contains(&expires));
        assert_eq!(
            signer.verify("user_7/clip.mp4", expires, &query["sig"], now),
            Ok(())
        );
    }

    #[test]
    fn keyboard_skips_local_links() {
        let links = ShareLinks {
            kind: MediaKind::File,
            direct: "https://bucket.example/x".to_string(),
            player: "http://localhost:8080/player/file/abc".to_string(),
            stream: "http://localhost:8080/stream/user_1/x".to_string(),
        };
        assert_eq!(links.keyboard().map(|k| k.inline_keyboard.len()), Some(1));
    }
}
