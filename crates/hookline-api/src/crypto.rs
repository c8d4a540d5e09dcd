//! HMAC-SHA256 signature verification for inbound webhooks.
//!
//! Senders sign the raw request body (or `"{timestamp}.{body}"` under the
//! timestamped scheme) with the shared secret and send the MAC as
//! `sha256=<hex>` or bare hex. Comparison is constant time via
//! [`Mac::verify_slice`].

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Length of a hex-encoded SHA-256 MAC.
const SIGNATURE_HEX_LEN: usize = 64;

/// What the sender's MAC covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigningScheme {
    /// MAC over the raw body.
    #[default]
    Body,
    /// MAC over `"{timestamp}.{body}"`; the timestamp header is required.
    Timestamped,
}

/// Why a signature was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// No signature header on the request.
    #[error("missing signature header")]
    Missing,

    /// Header present but not `sha256=<hex>` or 64 hex characters.
    #[error("malformed signature: {0}")]
    Malformed(String),

    /// Timestamp required by the scheme or replay window is absent.
    #[error("missing timestamp header")]
    MissingTimestamp,

    /// Timestamp header is not a unix timestamp in seconds.
    #[error("malformed timestamp: {0}")]
    MalformedTimestamp(String),

    /// Timestamp lies outside the replay window.
    #[error("timestamp outside replay window ({skew_seconds}s skew, {window_seconds}s allowed)")]
    StaleTimestamp {
        /// Absolute distance between timestamp and now.
        skew_seconds: i64,
        /// Configured window.
        window_seconds: u64,
    },

    /// MAC does not match.
    #[error("signature mismatch")]
    Mismatch,
}

/// Verifies request signatures against one shared secret.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
    scheme: SigningScheme,
    replay_window: Option<Duration>,
}

impl fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"<redacted>")
            .field("scheme", &self.scheme)
            .field("replay_window", &self.replay_window)
            .finish()
    }
}

impl SignatureVerifier {
    /// Creates a verifier with no replay window.
    pub fn new(secret: impl Into<Vec<u8>>, scheme: SigningScheme) -> Self {
        Self { secret: secret.into(), scheme, replay_window: None }
    }

    /// Requires a timestamp within `window` of the verification time.
    #[must_use]
    pub fn with_replay_window(mut self, window: Duration) -> Self {
        self.replay_window = Some(window);
        self
    }

    /// Signing scheme in use.
    pub fn scheme(&self) -> SigningScheme {
        self.scheme
    }

    /// Checks `signature` over `body`.
    ///
    /// The timestamp is consulted when the scheme signs it or a replay
    /// window is configured; otherwise it is ignored.
    pub fn verify(
        &self,
        body: &[u8],
        signature: Option<&str>,
        timestamp: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let signature = signature.map(str::trim).filter(|s| !s.is_empty());
        let provided = parse_signature_format(signature.ok_or(SignatureError::Missing)?)?;

        let needs_timestamp =
            self.scheme == SigningScheme::Timestamped || self.replay_window.is_some();
        let timestamp = if needs_timestamp {
            let raw = timestamp
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or(SignatureError::MissingTimestamp)?;
            let seconds = raw
                .parse::<i64>()
                .map_err(|_| SignatureError::MalformedTimestamp(raw.to_string()))?;
            Some((raw, seconds))
        } else {
            None
        };

        if let (Some(window), Some((_, seconds))) = (self.replay_window, timestamp) {
            let skew_seconds = (now.timestamp() - seconds).abs();
            let window_seconds = window.as_secs();
            if u64::try_from(skew_seconds).unwrap_or(u64::MAX) > window_seconds {
                return Err(SignatureError::StaleTimestamp { skew_seconds, window_seconds });
            }
        }

        let mut mac = self.mac();
        if self.scheme == SigningScheme::Timestamped {
            if let Some((raw, _)) = timestamp {
                mac.update(raw.as_bytes());
                mac.update(b".");
            }
        }
        mac.update(body);
        mac.verify_slice(&provided).map_err(|_| SignatureError::Mismatch)
    }

    fn mac(&self) -> HmacSha256 {
        match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC-SHA256 accepts keys of any length"),
        }
    }
}

/// Decodes `sha256=<hex>` or bare 64-character hex into MAC bytes.
pub fn parse_signature_format(signature: &str) -> Result<Vec<u8>, SignatureError> {
    let hex_part = signature.strip_prefix("sha256=").unwrap_or(signature);

    if hex_part.len() != SIGNATURE_HEX_LEN {
        return Err(SignatureError::Malformed(format!(
            "expected {SIGNATURE_HEX_LEN} hex characters, got {}",
            hex_part.len()
        )));
    }

    hex::decode(hex_part).map_err(|e| SignatureError::Malformed(e.to_string()))
}
