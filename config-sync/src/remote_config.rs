//! Client for the config center: snapshot fetch, governance feedback and the
//! finalize feed.
//!
//! Every request carries the API key. Retriable statuses and connect errors
//! are retried with exponential backoff; anything else is returned to the
//! caller as is.

use crate::config::{RemoteConfig, SignatureConfig};
use crate::metrics_defs::{REMOTE_REQUEST_RETRIES, SIGNATURE_REJECTED};
use crate::signature::{ResponseVerifier, SIGNATURE_HEADER, SIGNATURE_TS_HEADER};
use crate::types::{FinalizeAck, FinalizePage, GovernanceFeedback, GovernanceSnapshot};
use async_trait::async_trait;
use call_log::API_KEY_HEADER;
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use shared::counter;
use std::time::Duration;
use tokio::time::sleep;
use url::Url;

const SNAPSHOT_PATH: &str = "/v1/config/snapshot";
const FEEDBACK_PATH: &str = "/v1/governance/feedback";
const FINALIZE_PATH: &str = "/v1/governance/finalize";
const FINALIZE_ACK_PATH: &str = "/v1/governance/finalize/ack";

const INVALID_CURSOR_CODE: &str = "INVALID_CURSOR";

const RETRIABLE_STATUS_CODES: &[StatusCode] = &[
    StatusCode::TOO_MANY_REQUESTS,     // 429
    StatusCode::INTERNAL_SERVER_ERROR, // 500
    StatusCode::BAD_GATEWAY,           // 502
    StatusCode::SERVICE_UNAVAILABLE,   // 503
    StatusCode::GATEWAY_TIMEOUT,       // 504
];

#[derive(thiserror::Error, Debug)]
pub enum RemoteConfigError {
    #[error("config center request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("could not decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("config center returned status {0}")]
    UnexpectedStatus(u16),

    #[error("config center unavailable after retries")]
    RetriesExceeded,

    #[error("response is not signed")]
    MissingSignature,

    #[error("invalid signature timestamp: {0}")]
    InvalidSignatureTimestamp(String),

    #[error("signature timestamp is {skew_secs}s away from local time")]
    StaleSignature { skew_secs: u64 },

    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("signed response was already accepted")]
    Replay,

    #[error("snapshot version {0} was already accepted")]
    ReplayedVersion(u64),

    #[error("finalize cursor is invalid or expired")]
    InvalidCursor,
}

impl RemoteConfigError {
    /// Integrity failures of a signed response.
    pub fn is_signature_error(&self) -> bool {
        matches!(
            self,
            RemoteConfigError::MissingSignature
                | RemoteConfigError::InvalidSignatureTimestamp(_)
                | RemoteConfigError::StaleSignature { .. }
                | RemoteConfigError::SignatureMismatch
                | RemoteConfigError::Replay
                | RemoteConfigError::ReplayedVersion(_)
        )
    }
}

/// Calls the sync service makes against the config center.
#[async_trait]
pub trait ConfigCenter: Send + Sync {
    /// A snapshot newer than `known_version`, or `None` if there is none.
    async fn fetch_snapshot(
        &self,
        known_version: Option<u64>,
    ) -> Result<Option<GovernanceSnapshot>, RemoteConfigError>;

    async fn send_feedback(&self, feedback: &GovernanceFeedback) -> Result<(), RemoteConfigError>;

    /// One page of the finalize feed, starting at `cursor` or at the start of
    /// the feed when `cursor` is `None`.
    async fn pull_finalize(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<FinalizePage, RemoteConfigError>;

    async fn ack_finalize(&self, ack: &FinalizeAck) -> Result<(), RemoteConfigError>;
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
}

pub struct SignedRemoteConfigClient {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
    tenant_id: Option<String>,
    app_id: Option<String>,
    max_retries: u32,
    retry_base_delay: Duration,
    verifier: Option<ResponseVerifier>,
}

impl SignedRemoteConfigClient {
    pub fn new(remote: &RemoteConfig, signature: &SignatureConfig) -> Result<Self, RemoteConfigError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(remote.connect_timeout_ms))
            .timeout(Duration::from_millis(remote.read_timeout_ms))
            .build()?;

        Ok(SignedRemoteConfigClient {
            client,
            base_url: remote.base_url.clone(),
            api_key: remote.api_key.clone(),
            tenant_id: remote.tenant_id.clone(),
            app_id: remote.app_id.clone(),
            max_retries: remote.max_retries,
            retry_base_delay: Duration::from_millis(remote.retry_base_delay_ms),
            verifier: signature.enabled.then(|| ResponseVerifier::new(signature)),
        })
    }

    /// Sends the request built by `build`, retrying retriable failures.
    /// Returns the first response that is not retriable.
    async fn send_with_retry<F>(&self, build: F) -> Result<Response, RemoteConfigError>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut retries = 0;
        loop {
            let result = build().header(API_KEY_HEADER, &self.api_key).send().await;

            let retriable = match &result {
                Ok(response) => RETRIABLE_STATUS_CODES.contains(&response.status()),
                Err(e) => e.is_connect() || e.is_timeout(),
            };
            if !retriable {
                return Ok(result?);
            }
            if retries >= self.max_retries {
                return match result {
                    Ok(_) => Err(RemoteConfigError::RetriesExceeded),
                    Err(e) => Err(e.into()),
                };
            }

            let delay = self.retry_base_delay * 2_u32.saturating_pow(retries.min(16));
            match &result {
                Ok(response) => {
                    tracing::warn!(status = %response.status(), retries, "Retrying config center request")
                }
                Err(e) => tracing::warn!(error = %e, retries, "Retrying config center request"),
            }
            counter!(REMOTE_REQUEST_RETRIES).increment(1);
            sleep(delay).await;
            retries += 1;
        }
    }

    fn url(&self, path: &str) -> Result<Url, RemoteConfigError> {
        Ok(call_log::endpoint_url(&self.base_url, path)?)
    }

    fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), RemoteConfigError> {
        let Some(verifier) = &self.verifier else {
            return Ok(());
        };

        verifier
            .verify(
                header_str(headers, SIGNATURE_TS_HEADER),
                header_str(headers, SIGNATURE_HEADER),
                body,
                call_log::now_epoch_ms() / 1000,
            )
            .inspect_err(|e| {
                counter!(SIGNATURE_REJECTED).increment(1);
                tracing::error!(error = %e, "Rejected config center response");
            })
    }
}

#[async_trait]
impl ConfigCenter for SignedRemoteConfigClient {
    async fn fetch_snapshot(
        &self,
        known_version: Option<u64>,
    ) -> Result<Option<GovernanceSnapshot>, RemoteConfigError> {
        let mut url = self.url(SNAPSHOT_PATH)?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(version) = known_version {
                query.append_pair("knownVersion", &version.to_string());
            }
            if let Some(tenant_id) = &self.tenant_id {
                query.append_pair("tenantId", tenant_id);
            }
            if let Some(app_id) = &self.app_id {
                query.append_pair("appId", app_id);
            }
        }

        let response = self.send_with_retry(|| self.client.get(url.clone())).await?;
        let status = response.status();
        if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(RemoteConfigError::UnexpectedStatus(status.as_u16()));
        }

        let headers = response.headers().clone();
        let body = response.bytes().await?;
        self.verify(&headers, &body)?;

        let snapshot: GovernanceSnapshot = serde_json::from_slice(&body)?;
        if known_version.is_some_and(|known| snapshot.version <= known) {
            return Ok(None);
        }
        if let Some(verifier) = &self.verifier {
            verifier.check_version(snapshot.version)?;
        }
        Ok(Some(snapshot))
    }

    async fn send_feedback(&self, feedback: &GovernanceFeedback) -> Result<(), RemoteConfigError> {
        let url = self.url(FEEDBACK_PATH)?;
        let response = self
            .send_with_retry(|| self.client.post(url.clone()).json(feedback))
            .await?;
        expect_success(response.status())
    }

    async fn pull_finalize(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<FinalizePage, RemoteConfigError> {
        let mut url = self.url(FINALIZE_PATH)?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor);
            }
            query.append_pair("limit", &limit.to_string());
        }

        let response = self.send_with_retry(|| self.client.get(url.clone())).await?;
        let status = response.status();
        if status == StatusCode::GONE {
            return Err(RemoteConfigError::InvalidCursor);
        }
        if status == StatusCode::BAD_REQUEST {
            let body = response.bytes().await?;
            let code = serde_json::from_slice::<ErrorBody>(&body)
                .ok()
                .and_then(|b| b.code);
            if code.as_deref() == Some(INVALID_CURSOR_CODE) {
                return Err(RemoteConfigError::InvalidCursor);
            }
            return Err(RemoteConfigError::UnexpectedStatus(status.as_u16()));
        }
        expect_success(status)?;

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn ack_finalize(&self, ack: &FinalizeAck) -> Result<(), RemoteConfigError> {
        let url = self.url(FINALIZE_ACK_PATH)?;
        let response = self
            .send_with_retry(|| self.client.post(url.clone()).json(ack))
            .await?;
        expect_success(response.status())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn expect_success(status: StatusCode) -> Result<(), RemoteConfigError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(RemoteConfigError::UnexpectedStatus(status.as_u16()))
    }
}
