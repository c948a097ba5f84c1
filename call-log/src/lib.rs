//! AI-call telemetry: the record model shared by clients and the ingestion
//! server, the contract allowlist guard, an in-process call-log cache, and the
//! client-side batching uploader.

pub mod cache;
pub mod config;
pub mod contract;
pub mod errors;
pub mod metrics_defs;
pub mod record;
pub mod uploader;

use url::Url;

/// Header carrying the API key on every authenticated request.
pub const API_KEY_HEADER: &str = "X-SF-API-KEY";

/// Path of the batch ingestion endpoint.
pub const BATCH_PATH: &str = "/v1/logs/ai-calls/batch";

/// Milliseconds since the Unix epoch. A clock before 1970 reads as zero.
pub fn now_epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Resolves an endpoint path below `base`, keeping any path prefix the base
/// carries: `https://host/center` and `/v1/x` give `https://host/center/v1/x`.
pub fn endpoint_url(base: &Url, path: &str) -> Result<Url, url::ParseError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let prefix = format!("{}/", base.path());
        base.set_path(&prefix);
    }
    base.join(path.trim_start_matches('/'))
}
