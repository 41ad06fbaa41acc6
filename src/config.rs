//! Configuration and settings management
//!
//! Loads settings from config files and environment variables and defines
//! transfer and Telegram constants.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Smallest part size S3 accepts for every part but the last one.
pub const MIN_MULTIPART_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Telegram file limits on the public Bot API.
pub const CLOUD_BOT_API_DOWNLOAD_LIMIT: u64 = 20 * 1024 * 1024;
/// Upload (sendDocument) limit on the public Bot API.
pub const CLOUD_BOT_API_UPLOAD_LIMIT: u64 = 50 * 1024 * 1024;
/// Download and upload limit of a self-hosted Bot API server.
pub const LOCAL_BOT_API_LIMIT: u64 = 2000 * 1024 * 1024;

/// SigV4 presigned URLs live at most one week.
pub const MAX_PRESIGN_EXPIRY_SECS: u64 = 7 * 24 * 3600;

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub bot_token: String,

    /// Telegram application id. Only a self-hosted Bot API server needs it.
    pub api_id: Option<i64>,
    /// Telegram application hash. Only a self-hosted Bot API server needs it.
    pub api_hash: Option<String>,
    /// Base URL of a self-hosted Bot API server (lifts the 20/50 MB limits)
    pub telegram_api_url: Option<String>,

    /// Wasabi access key
    pub wasabi_access_key: Option<String>,
    /// Wasabi secret key
    pub wasabi_secret_key: Option<String>,
    /// Wasabi bucket name
    pub wasabi_bucket: Option<String>,
    /// Wasabi region, e.g. `eu-central-1`
    #[serde(default = "default_region")]
    pub wasabi_region: String,
    /// Explicit endpoint; derived from the region when unset
    pub wasabi_endpoint_url: Option<String>,

    /// Private channel that receives a backup copy of every upload
    pub storage_channel_id: Option<i64>,

    /// Comma-separated list of allowed user IDs. Empty means everyone.
    #[serde(rename = "authorized_users")]
    pub authorized_users_str: Option<String>,
    /// User who may edit the allow-list at runtime
    pub admin_id: Option<i64>,

    /// Port of the auxiliary HTTP server
    #[serde(default = "default_port")]
    pub port: u16,
    /// Externally reachable base URL of the HTTP server
    pub public_url: Option<String>,

    /// Requests per user per minute
    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: usize,
    /// Largest accepted file in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Lifetime of presigned links in seconds
    #[serde(default = "default_presign_expiry_secs")]
    pub presign_expiry_secs: u64,

    /// Objects at least this large are uploaded in parts
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: u64,
    /// Part size for multipart uploads
    #[serde(default = "default_multipart_chunk_size")]
    pub multipart_chunk_size: u64,
    /// Parts uploaded in parallel
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// SDK retry attempts per request
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Seconds between progress message edits
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
    /// Staging directory for transfers
    pub download_dir: Option<String>,
    /// How long shutdown waits for running transfers
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Key for signing `/stream` links. Falls back to the Wasabi secret key.
    pub stream_secret: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

const fn default_port() -> u16 {
    8080
}

const fn default_max_requests_per_minute() -> usize {
    30
}

const fn default_max_file_size() -> u64 {
    10 * 1024 * 1024 * 1024
}

const fn default_presign_expiry_secs() -> u64 {
    86_400
}

const fn default_multipart_threshold() -> u64 {
    8 * 1024 * 1024
}

const fn default_multipart_chunk_size() -> u64 {
    8 * 1024 * 1024
}

const fn default_max_concurrency() -> usize {
    16
}

const fn default_max_attempts() -> u32 {
    10
}

const fn default_progress_interval_secs() -> u64 {
    5
}

const fn default_shutdown_grace_secs() -> u64 {
    300
}

/// Transfer tuning handed to the storage layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// Objects at least this large are uploaded in parts
    pub multipart_threshold: u64,
    /// Part size
    pub chunk_size: u64,
    /// Parts in flight
    pub max_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: default_multipart_threshold(),
            chunk_size: default_multipart_chunk_size(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

/// Build the layered configuration source.
///
/// # Errors
///
/// Returns a `ConfigError` if a source cannot be read.
pub fn build_config() -> Result<Config, ConfigError> {
    let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

    Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
        // Not checked into git
        .add_source(File::with_name("config/local").required(false))
        // `APP__PORT=9000` sets `port`
        .add_source(Environment::with_prefix("APP").separator("__"))
        // Bare UPPER_SNAKE_CASE variables map to snake_case keys; empty ones count as unset
        .add_source(Environment::default().ignore_empty(true))
        .build()
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use oxide_wasabi::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let mut settings: Self = build_config()?.try_deserialize()?;

        // The automatic mapping occasionally misses these; read them directly
        env_fallback(&mut settings.wasabi_access_key, "WASABI_ACCESS_KEY");
        env_fallback(&mut settings.wasabi_secret_key, "WASABI_SECRET_KEY");
        env_fallback(&mut settings.wasabi_bucket, "WASABI_BUCKET");
        env_fallback(&mut settings.wasabi_endpoint_url, "WASABI_ENDPOINT_URL");

        settings.normalize();
        Ok(settings)
    }

    /// Pulls values the SDK would reject back into range.
    fn normalize(&mut self) {
        if self.presign_expiry_secs > MAX_PRESIGN_EXPIRY_SECS {
            warn!(
                "PRESIGN_EXPIRY_SECS={} exceeds the 7 day SigV4 limit, using {}",
                self.presign_expiry_secs, MAX_PRESIGN_EXPIRY_SECS
            );
            self.presign_expiry_secs = MAX_PRESIGN_EXPIRY_SECS;
        }
        if self.presign_expiry_secs == 0 {
            warn!("PRESIGN_EXPIRY_SECS=0 is not usable, using the default");
            self.presign_expiry_secs = default_presign_expiry_secs();
        }
    }

    /// Returns the set of Telegram IDs allowed to use the bot
    #[must_use]
    pub fn authorized_users(&self) -> HashSet<i64> {
        self.authorized_users_str
            .as_ref()
            .map(|s| {
                s.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
                    .filter(|token| !token.is_empty())
                    .filter_map(|id| id.parse::<i64>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// S3 endpoint for the configured region
    #[must_use]
    pub fn endpoint_url(&self) -> String {
        self.wasabi_endpoint_url
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.wasabisys.com", self.wasabi_region))
    }

    /// Base URL used in player and stream links, without a trailing slash
    #[must_use]
    pub fn public_base_url(&self) -> String {
        self.public_url
            .as_deref()
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("http://localhost:{}", self.port))
    }

    /// Directory where transfers are staged
    #[must_use]
    pub fn work_dir(&self) -> PathBuf {
        self.download_dir
            .as_ref()
            .map_or_else(|| std::env::temp_dir().join("oxide-wasabi"), PathBuf::from)
    }

    /// Largest file the bot can fetch from Telegram
    #[must_use]
    pub const fn telegram_download_limit(&self) -> u64 {
        if self.telegram_api_url.is_some() {
            LOCAL_BOT_API_LIMIT
        } else {
            CLOUD_BOT_API_DOWNLOAD_LIMIT
        }
    }

    /// Largest file the bot can send to Telegram
    #[must_use]
    pub const fn telegram_upload_limit(&self) -> u64 {
        if self.telegram_api_url.is_some() {
            LOCAL_BOT_API_LIMIT
        } else {
            CLOUD_BOT_API_UPLOAD_LIMIT
        }
    }

    /// Presigned link lifetime, never above [`MAX_PRESIGN_EXPIRY_SECS`]
    #[must_use]
    pub const fn presign_expiry(&self) -> Duration {
        let secs = if self.presign_expiry_secs > MAX_PRESIGN_EXPIRY_SECS {
            MAX_PRESIGN_EXPIRY_SECS
        } else {
            self.presign_expiry_secs
        };
        Duration::from_secs(secs)
    }

    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    #[must_use]
    pub const fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }

    /// Multipart tuning, with the part size clamped to what S3 accepts
    #[must_use]
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            multipart_threshold: self.multipart_threshold,
            chunk_size: self.multipart_chunk_size.max(MIN_MULTIPART_CHUNK_SIZE),
            max_concurrency: self.max_concurrency.max(1),
        }
    }
}

fn env_fallback(slot: &mut Option<String>, name: &str) {
    if slot.is_none() {
        if let Ok(val) = std::env::var(name) {
            if !val.is_empty() {
                *slot = Some(val);
            }
        }
    }
}

/// Cooldown period (seconds) between "Unauthorized" notices for the same user.
/// Default: 20 minutes.
pub const UNAUTHORIZED_COOLDOWN_SECS: u64 = 1200;
/// Time-to-live (seconds) for cache entries.
/// Default: 2 hours.
pub const UNAUTHORIZED_CACHE_TTL_SECS: u64 = 7200;
/// Maximum cache capacity (number of entries).
pub const UNAUTHORIZED_CACHE_MAX_SIZE: u64 = 10_000;

/// Get unauthorized cooldown from env or default.
///
/// Environment variable: `UNAUTHORIZED_COOLDOWN_SECS`.
#[must_use]
pub fn get_unauthorized_cooldown() -> u64 {
    env_u64("UNAUTHORIZED_COOLDOWN_SECS", UNAUTHORIZED_COOLDOWN_SECS)
}

/// Get unauthorized cache TTL from env or default.
///
/// Environment variable: `UNAUTHORIZED_CACHE_TTL_SECS`.
#[must_use]
pub fn get_unauthorized_cache_ttl() -> u64 {
    env_u64("UNAUTHORIZED_CACHE_TTL_SECS", UNAUTHORIZED_CACHE_TTL_SECS)
}

/// Get unauthorized cache max size from env or default.
///
/// Environment variable: `UNAUTHORIZED_CACHE_MAX_SIZE`.
#[must_use]
pub fn get_unauthorized_cache_max_size() -> u64 {
    env_u64("UNAUTHORIZED_CACHE_MAX_SIZE", UNAUTHORIZED_CACHE_MAX_SIZE)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

// Telegram API retry configuration
/// Delay before the first retry of a Telegram call; doubles after each retry
pub const TELEGRAM_API_INITIAL_BACKOFF_MS: u64 = 500;
/// Backoff ceiling for retried Telegram calls
pub const TELEGRAM_API_MAX_BACKOFF_MS: u64 = 10_000;
/// Retries after the first attempt, so a call is tried at most six times
pub const TELEGRAM_API_MAX_RETRIES: usize = 5;

#[cfg(test)]
pub(crate) fn test_settings() -> Settings {
    Settings {
        bot_token: "dummy".to_string(),
        api_id: None,
        api_hash: None,
        telegram_api_url: None,
        wasabi_access_key: Some("AKIDEXAMPLE".to_string()),
        wasabi_secret_key: Some("secret".to_string()),
        wasabi_bucket: Some("test-bucket".to_string()),
        wasabi_region: default_region(),
        wasabi_endpoint_url: None,
        storage_channel_id: None,
        authorized_users_str: None,
        admin_id: None,
        port: default_port(),
        public_url: None,
        max_requests_per_minute: default_max_requests_per_minute(),
        max_file_size: default_max_file_size(),
        presign_expiry_secs: default_presign_expiry_secs(),
        multipart_threshold: default_multipart_threshold(),
        multipart_chunk_size: default_multipart_chunk_size(),
        max_concurrency: default_max_concurrency(),
        max_attempts: default_max_attempts(),
        progress_interval_secs: default_progress_interval_secs(),
        download_dir: None,
        shutdown_grace_secs: default_shutdown_grace_secs(),
        stream_secret: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    // Environment mutation happens in one test to avoid races between threads
    #[test]
    fn test_config_env_loading() -> Result<(), Box<dyn std::error::Error>> {
        env::set_var("BOT_TOKEN", "dummy_token");
        env::set_var("WASABI_BUCKET", "media");
        env::set_var("WASABI_REGION", "eu-central-1");
        env::set_var("PORT", "9090");
        env::set_var("PRESIGN_EXPIRY_SECS", "900000");

        let settings = Settings::new()?;
        assert_eq!(settings.bot_token, "dummy_token");
        assert_eq!(settings.wasabi_bucket, Some("media".to_string()));
        assert_eq!(settings.port, 9090);
        assert_eq!(settings.endpoint_url(), "https://s3.eu-central-1.wasabisys.com");
        assert_eq!(settings.presign_expiry_secs, MAX_PRESIGN_EXPIRY_SECS);

        // Empty values are treated as unset
        env::set_var("WASABI_BUCKET", "");
        let settings = Settings::new()?;
        assert_eq!(settings.wasabi_bucket, None);

        for name in [
            "BOT_TOKEN",
            "WASABI_BUCKET",
            "WASABI_REGION",
            "PORT",
            "PRESIGN_EXPIRY_SECS",
        ] {
            env::remove_var(name);
        }
        Ok(())
    }

    #[test]
    fn test_authorized_users_parsing() {
        let mut settings = test_settings();

        settings.authorized_users_str = Some("123,456".to_string());
        let allowed = settings.authorized_users();
        assert!(allowed.contains(&123));
        assert!(allowed.contains(&456));
        assert_eq!(allowed.len(), 2);

        settings.authorized_users_str = Some("333; 444 555".to_string());
        assert_eq!(settings.authorized_users().len(), 3);

        settings.authorized_users_str = Some("abc, 777".to_string());
        let allowed = settings.authorized_users();
        assert!(allowed.contains(&777));
        assert_eq!(allowed.len(), 1);
    }

    #[test]
    fn test_presign_expiry_is_capped_at_one_week() {
        let mut settings = test_settings();
        settings.presign_expiry_secs = 8 * 86_400;
        assert_eq!(settings.presign_expiry(), Duration::from_secs(MAX_PRESIGN_EXPIRY_SECS));

        settings.normalize();
        assert_eq!(settings.presign_expiry_secs, MAX_PRESIGN_EXPIRY_SECS);

        settings.presign_expiry_secs = 0;
        settings.normalize();
        assert_eq!(settings.presign_expiry_secs, 86_400);

        settings.presign_expiry_secs = 3600;
        settings.normalize();
        assert_eq!(settings.presign_expiry(), Duration::from_secs(3600));
    }

    #[test]
    fn test_telegram_limits_follow_api_url() {
        let mut settings = test_settings();
        assert_eq!(settings.telegram_download_limit(), CLOUD_BOT_API_DOWNLOAD_LIMIT);
        assert_eq!(settings.telegram_upload_limit(), CLOUD_BOT_API_UPLOAD_LIMIT);

        settings.telegram_api_url = Some("http://localhost:8081".to_string());
        assert_eq!(settings.telegram_download_limit(), LOCAL_BOT_API_LIMIT);
        assert_eq!(settings.telegram_upload_limit(), LOCAL_BOT_API_LIMIT);
    }

    #[test]
    fn test_transfer_config_clamps_chunk_size() {
        let mut settings = test_settings();
        settings.multipart_chunk_size = 1024;
        settings.max_concurrency = 0;

        let transfer = settings.transfer_config();
        assert_eq!(transfer.chunk_size, MIN_MULTIPART_CHUNK_SIZE);
        assert_eq!(transfer.max_concurrency, 1);
    }

    #[test]
    fn test_public_base_url() {
        let mut settings = test_settings();
        assert_eq!(settings.public_base_url(), "http://localhost:8080");

        settings.public_url = Some("https://files.example.com/".to_string());
        assert_eq!(settings.public_base_url(), "https://files.example.com");
    }
}
