//! Verification of signed config center responses.
//!
//! The config center signs `timestamp + "\n" + body` with HMAC-SHA256 under a
//! shared secret and sends the timestamp (epoch seconds) and the hex digest in
//! the `X-SF-SIGNATURE-TS` and `X-SF-SIGNATURE` headers. A payload is accepted
//! at most once within the replay window.

use crate::config::SignatureConfig;
use crate::remote_config::RemoteConfigError;
use hmac::{Hmac, Mac};
use moka::sync::Cache;
use sha2::{Digest, Sha256};
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_TS_HEADER: &str = "X-SF-SIGNATURE-TS";
pub const SIGNATURE_HEADER: &str = "X-SF-SIGNATURE";

const REPLAY_CACHE_CAPACITY: u64 = 100_000;

pub struct ResponseVerifier {
    secret: Vec<u8>,
    max_skew_secs: u64,
    seen_payloads: Cache<String, ()>,
    seen_versions: Option<Cache<u64, ()>>,
}

impl ResponseVerifier {
    pub fn new(config: &SignatureConfig) -> Self {
        let window = Duration::from_secs(config.replay_window_seconds.max(1));
        let seen_payloads = Cache::builder()
            .max_capacity(REPLAY_CACHE_CAPACITY)
            .time_to_live(window)
            .build();
        let seen_versions = config.reject_replayed_version.then(|| {
            Cache::builder()
                .max_capacity(REPLAY_CACHE_CAPACITY)
                .time_to_live(window)
                .build()
        });

        ResponseVerifier {
            secret: config.secret.as_bytes().to_vec(),
            max_skew_secs: config.max_skew_seconds,
            seen_payloads,
            seen_versions,
        }
    }

    /// Hex HMAC-SHA256 of `ts + "\n" + body`.
    pub fn sign(&self, ts: &str, body: &[u8]) -> String {
        hex::encode(self.mac(ts, body).finalize().into_bytes())
    }

    /// Checks signature, freshness and replay. A payload that passes is
    /// remembered, so verifying the same `(ts, body)` again fails.
    pub fn verify(
        &self,
        ts: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
        now_epoch_secs: u64,
    ) -> Result<(), RemoteConfigError> {
        let (Some(ts), Some(signature)) = (ts, signature) else {
            return Err(RemoteConfigError::MissingSignature);
        };
        let ts = ts.trim();

        let signed_at: u64 = ts
            .parse()
            .map_err(|_| RemoteConfigError::InvalidSignatureTimestamp(ts.to_string()))?;
        let skew = now_epoch_secs.abs_diff(signed_at);
        if skew > self.max_skew_secs {
            return Err(RemoteConfigError::StaleSignature { skew_secs: skew });
        }

        let expected =
            hex::decode(signature.trim()).map_err(|_| RemoteConfigError::SignatureMismatch)?;
        self.mac(ts, body)
            .verify_slice(&expected)
            .map_err(|_| RemoteConfigError::SignatureMismatch)?;

        let entry = self
            .seen_payloads
            .entry(payload_key(ts, body))
            .or_insert(());
        if !entry.is_fresh() {
            return Err(RemoteConfigError::Replay);
        }
        Ok(())
    }

    /// Records an accepted snapshot version. Fails if the version was already
    /// accepted within the replay window and version replay is rejected.
    pub fn check_version(&self, version: u64) -> Result<(), RemoteConfigError> {
        let Some(seen) = &self.seen_versions else {
            return Ok(());
        };
        if !seen.entry(version).or_insert(()).is_fresh() {
            return Err(RemoteConfigError::ReplayedVersion(version));
        }
        Ok(())
    }

    fn mac(&self, ts: &str, body: &[u8]) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(ts.as_bytes());
        mac.update(b"\n");
        mac.update(body);
        mac
    }
}

fn payload_key(ts: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ts.as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    hex::encode(hasher.finalize())
}
