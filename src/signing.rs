//! Signed `/stream` links
//!
//! The streaming proxy reads with the server's own credentials, so every
//! link it serves carries an expiry and an HMAC-SHA256 over key and expiry.

use crate::config::Settings;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    #[error("link has expired")]
    Expired,
    #[error("invalid link signature")]
    BadSignature,
}

#[derive(Clone)]
pub struct StreamSigner {
    mac: HmacSha256,
}

impl std::fmt::Debug for StreamSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StreamSigner(..)")
    }
}

impl StreamSigner {
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        // HMAC takes keys of any length, the zero-key branch is unreachable
        let mac = <HmacSha256 as KeyInit>::new_from_slice(secret)
            .unwrap_or_else(|_| <HmacSha256 as KeyInit>::new(&Default::default()));
        Self { mac }
    }

    /// Keyed with `STREAM_SECRET`, else the Wasabi secret key, else a
    /// per-process random key.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        match settings
            .stream_secret
            .as_deref()
            .or(settings.wasabi_secret_key.as_deref())
        {
            Some(secret) => Self::new(secret.as_bytes()),
            None => {
                warn!("No STREAM_SECRET configured; stream links stop working after a restart");
                Self::new(Uuid::new_v4().as_bytes())
            }
        }
    }

    fn keyed(&self, key: &str, expires: i64) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        mac
    }

    /// Hex signature for `key` valid until the unix time `expires`
    #[must_use]
    pub fn sign(&self, key: &str, expires: i64) -> String {
        hex::encode(self.keyed(key, expires).finalize().into_bytes())
    }

    /// Checks the signature first, then the expiry against `now`.
    ///
    /// # Errors
    ///
    /// [`LinkError::BadSignature`] for a forged or malformed signature,
    /// [`LinkError::Expired`] once `now` is past `expires`.
    pub fn verify(&self, key: &str, expires: i64, signature: &str, now: i64) -> Result<(), LinkError> {
        let raw = hex::decode(signature).map_err(|_| LinkError::BadSignature)?;
        self.keyed(key, expires)
            .verify_slice(&raw)
            .map_err(|_| LinkError::BadSignature)?;
        if now > expires {
            return Err(LinkError::Expired);
        }
        Ok(())
    }
}
