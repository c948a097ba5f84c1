//! Leader election for the governance sync loop.
//!
//! Two layers, tried in order: an exclusive non-blocking lock on a local file
//! (one process per host) and, when configured, a TTL lease held in the config
//! center (one holder per fleet). Acquisition never waits; an instance that
//! loses simply skips its tick.

use crate::config::{LeaseConfig, RemoteConfig};
use crate::metrics_defs::LEASE_ACQUIRE;
use crate::types::{LeaseRequest, LeaseResponse};
use async_trait::async_trait;
use call_log::API_KEY_HEADER;
use fs2::FileExt;
use reqwest::StatusCode;
use serde::Serialize;
use shared::counter;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const ACQUIRE_PATH: &str = "/v1/governance/lease/acquire";
const RENEW_PATH: &str = "/v1/governance/lease/renew";
const RELEASE_PATH: &str = "/v1/governance/lease/release";

#[derive(thiserror::Error, Debug)]
pub enum LeaseError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("lease request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("lease service returned status {0}")]
    UnexpectedStatus(u16),
}

/// Which layer granted the lease on the last attempt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseMode {
    #[default]
    None,
    Local,
    Remote,
}

impl LeaseMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LeaseMode::None => "none",
            LeaseMode::Local => "local",
            LeaseMode::Remote => "remote",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub holder_id: String,
    pub acquired_at_epoch_ms: u64,
    pub ttl_seconds: Option<u64>,
    pub mode: LeaseMode,
}

#[async_trait]
pub trait RemoteLeaseClient: Send + Sync {
    /// Returns false if another holder owns the lease.
    async fn acquire(&self, key: &str, holder_id: &str, ttl_seconds: u64) -> Result<bool, LeaseError>;

    /// Extends a lease this holder owns. Returns false if it was lost.
    async fn renew(&self, key: &str, holder_id: &str, ttl_seconds: u64) -> Result<bool, LeaseError>;

    async fn release(&self, key: &str, holder_id: &str) -> Result<(), LeaseError>;
}

/// Remote lease served by the config center.
pub struct HttpLeaseClient {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
}

impl HttpLeaseClient {
    pub fn new(remote: &RemoteConfig) -> Result<Self, LeaseError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(remote.connect_timeout_ms))
            .timeout(Duration::from_millis(remote.read_timeout_ms))
            .build()?;

        Ok(HttpLeaseClient {
            client,
            base_url: remote.base_url.clone(),
            api_key: remote.api_key.clone(),
        })
    }

    async fn post(&self, path: &str, request: &LeaseRequest) -> Result<bool, LeaseError> {
        let response = self
            .client
            .post(call_log::endpoint_url(&self.base_url, path)?)
            .header(API_KEY_HEADER, &self.api_key)
            .json(request)
            .send()
            .await?;

        match response.status() {
            StatusCode::CONFLICT => Ok(false),
            status if status.is_success() => {
                if status == StatusCode::NO_CONTENT {
                    return Ok(true);
                }
                Ok(response.json::<LeaseResponse>().await?.granted)
            }
            status => Err(LeaseError::UnexpectedStatus(status.as_u16())),
        }
    }
}

#[async_trait]
impl RemoteLeaseClient for HttpLeaseClient {
    async fn acquire(&self, key: &str, holder_id: &str, ttl_seconds: u64) -> Result<bool, LeaseError> {
        self.post(ACQUIRE_PATH, &lease_request(key, holder_id, Some(ttl_seconds)))
            .await
    }

    async fn renew(&self, key: &str, holder_id: &str, ttl_seconds: u64) -> Result<bool, LeaseError> {
        self.post(RENEW_PATH, &lease_request(key, holder_id, Some(ttl_seconds)))
            .await
    }

    async fn release(&self, key: &str, holder_id: &str) -> Result<(), LeaseError> {
        self.post(RELEASE_PATH, &lease_request(key, holder_id, None))
            .await
            .map(|_| ())
    }
}

fn lease_request(key: &str, holder_id: &str, ttl_seconds: Option<u64>) -> LeaseRequest {
    LeaseRequest {
        key: key.to_string(),
        holder_id: holder_id.to_string(),
        ttl_seconds,
    }
}

struct RemoteLease {
    client: Arc<dyn RemoteLeaseClient>,
    key: String,
    ttl_seconds: u64,
}

struct Held {
    lock_file: File,
    acquired_at_epoch_ms: u64,
    mode: LeaseMode,
}

pub struct LeaseManager {
    lock_path: PathBuf,
    holder_id: String,
    remote: Option<RemoteLease>,
    held: tokio::sync::Mutex<Option<Held>>,
    last_mode: parking_lot::Mutex<LeaseMode>,
}

impl LeaseManager {
    /// `remote_client` is only used when the config enables a remote lease.
    pub fn new(config: &LeaseConfig, remote_client: Option<Arc<dyn RemoteLeaseClient>>) -> Self {
        let remote = config
            .remote
            .as_ref()
            .zip(remote_client)
            .map(|(remote, client)| RemoteLease {
                client,
                key: remote.key.clone(),
                ttl_seconds: remote.ttl_seconds,
            });

        LeaseManager {
            lock_path: config.lock_path.clone(),
            holder_id: new_holder_id(),
            remote,
            held: tokio::sync::Mutex::new(None),
            last_mode: parking_lot::Mutex::new(LeaseMode::None),
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Acquires the lease, or keeps it if already held. A held remote lease is
    /// renewed; losing it drops leadership entirely.
    pub async fn try_acquire(&self) -> bool {
        let mut held = self.held.lock().await;

        if let Some(current) = held.as_ref() {
            if current.mode != LeaseMode::Remote || self.renew_remote().await {
                return true;
            }
            self.give_up(&mut held);
            return self.finish(LeaseMode::None);
        }

        let lock_file = match lock_local(&self.lock_path, &self.holder_id) {
            Ok(Some(file)) => file,
            Ok(None) => {
                tracing::debug!(path = %self.lock_path.display(), "Local lease held by another process");
                return self.finish(LeaseMode::None);
            }
            Err(e) => {
                tracing::warn!(path = %self.lock_path.display(), error = %e, "Could not take local lease");
                return self.finish(LeaseMode::None);
            }
        };

        let mode = match &self.remote {
            None => LeaseMode::Local,
            Some(remote) => {
                match remote
                    .client
                    .acquire(&remote.key, &self.holder_id, remote.ttl_seconds)
                    .await
                {
                    Ok(true) => LeaseMode::Remote,
                    Ok(false) => {
                        tracing::debug!(key = %remote.key, "Remote lease held by another instance");
                        unlock(&lock_file);
                        return self.finish(LeaseMode::None);
                    }
                    Err(e) => {
                        tracing::warn!(key = %remote.key, error = %e, "Remote lease acquisition failed");
                        unlock(&lock_file);
                        return self.finish(LeaseMode::None);
                    }
                }
            }
        };

        *held = Some(Held {
            lock_file,
            acquired_at_epoch_ms: call_log::now_epoch_ms(),
            mode,
        });
        tracing::info!(holder = %self.holder_id, mode = mode.as_str(), "Acquired governance lease");
        self.finish(mode)
    }

    /// Checks that the lease is still held before a step with side effects.
    /// A remote lease is renewed; losing it drops leadership as in
    /// [`try_acquire`](Self::try_acquire).
    pub async fn confirm(&self) -> bool {
        let mut held = self.held.lock().await;
        let Some(current) = held.as_ref() else {
            return false;
        };
        if current.mode != LeaseMode::Remote || self.renew_remote().await {
            return true;
        }
        self.give_up(&mut held);
        *self.last_mode.lock() = LeaseMode::None;
        false
    }

    pub fn last_acquire_mode(&self) -> LeaseMode {
        *self.last_mode.lock()
    }

    pub async fn current(&self) -> Option<Lease> {
        self.held.lock().await.as_ref().map(|held| Lease {
            holder_id: self.holder_id.clone(),
            acquired_at_epoch_ms: held.acquired_at_epoch_ms,
            ttl_seconds: match held.mode {
                LeaseMode::Remote => self.remote.as_ref().map(|r| r.ttl_seconds),
                _ => None,
            },
            mode: held.mode,
        })
    }

    /// Gives up whatever is held. Safe to call at any time, any number of times.
    pub async fn release(&self) {
        let Some(held) = self.held.lock().await.take() else {
            *self.last_mode.lock() = LeaseMode::None;
            return;
        };

        if held.mode == LeaseMode::Remote
            && let Some(remote) = &self.remote
            && let Err(e) = remote.client.release(&remote.key, &self.holder_id).await
        {
            tracing::warn!(key = %remote.key, error = %e, "Failed to release remote lease");
        }
        unlock(&held.lock_file);
        *self.last_mode.lock() = LeaseMode::None;
        tracing::info!(holder = %self.holder_id, "Released governance lease");
    }

    async fn renew_remote(&self) -> bool {
        let Some(remote) = &self.remote else {
            return false;
        };
        match remote
            .client
            .renew(&remote.key, &self.holder_id, remote.ttl_seconds)
            .await
        {
            Ok(renewed) => renewed,
            Err(e) => {
                tracing::warn!(key = %remote.key, error = %e, "Remote lease renewal failed");
                false
            }
        }
    }

    fn give_up(&self, held: &mut Option<Held>) {
        tracing::warn!(holder = %self.holder_id, "Remote lease lost, giving up leadership");
        if let Some(lost) = held.take() {
            unlock(&lost.lock_file);
        }
    }

    fn finish(&self, mode: LeaseMode) -> bool {
        *self.last_mode.lock() = mode;
        counter!(LEASE_ACQUIRE, "mode" => mode.as_str()).increment(1);
        mode != LeaseMode::None
    }
}

/// Returns `None` when another process holds the lock.
fn lock_local(path: &Path, holder_id: &str) -> Result<Option<File>, io::Error> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?;

    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => return Ok(None),
        Err(e) => return Err(e),
    }

    // The holder id is informational only.
    file.set_len(0)?;
    file.write_all(holder_id.as_bytes())?;
    Ok(Some(file))
}

fn unlock(file: &File) {
    if let Err(e) = FileExt::unlock(file) {
        tracing::warn!(error = %e, "Failed to unlock lease file");
    }
}

/// `hostname-pid-suffix`, unique per process start.
fn new_holder_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".into());
    format!("{host}-{}-{:08x}", std::process::id(), rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteLeaseConfig;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct FakeRemote {
        deny: AtomicBool,
        fail_renew: AtomicBool,
        releases: AtomicUsize,
    }

    #[async_trait]
    impl RemoteLeaseClient for FakeRemote {
        async fn acquire(&self, _key: &str, _holder: &str, _ttl: u64) -> Result<bool, LeaseError> {
            Ok(!self.deny.load(Ordering::SeqCst))
        }

        async fn renew(&self, _key: &str, _holder: &str, _ttl: u64) -> Result<bool, LeaseError> {
            if self.fail_renew.load(Ordering::SeqCst) {
                return Err(LeaseError::UnexpectedStatus(503));
            }
            Ok(true)
        }

        async fn release(&self, _key: &str, _holder: &str) -> Result<(), LeaseError> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn local_config(path: &Path) -> LeaseConfig {
        LeaseConfig {
            lock_path: path.to_path_buf(),
            remote: None,
        }
    }

    fn remote_config(path: &Path) -> LeaseConfig {
        LeaseConfig {
            lock_path: path.to_path_buf(),
            remote: Some(RemoteLeaseConfig {
                key: "sync".into(),
                ttl_seconds: 30,
            }),
        }
    }

    #[tokio::test]
    async fn test_one_local_holder_per_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("nested/sync.lock");
        let first = LeaseManager::new(&local_config(&lock_path), None);
        let second = LeaseManager::new(&local_config(&lock_path), None);

        assert!(first.try_acquire().await);
        assert_eq!(first.last_acquire_mode(), LeaseMode::Local);
        assert!(!second.try_acquire().await);
        assert_eq!(second.last_acquire_mode(), LeaseMode::None);

        // Holding is sticky across ticks.
        assert!(first.try_acquire().await);
        let lease = first.current().await.unwrap();
        assert_eq!(lease.mode, LeaseMode::Local);
        assert_eq!(lease.holder_id, first.holder_id());

        first.release().await;
        first.release().await;
        assert!(first.current().await.is_none());
        assert!(second.try_acquire().await);
    }

    #[tokio::test]
    async fn test_release_without_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LeaseManager::new(&local_config(&dir.path().join("l")), None);
        manager.release().await;
        assert_eq!(manager.last_acquire_mode(), LeaseMode::None);
    }

    #[tokio::test]
    async fn test_remote_lease() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("sync.lock");
        let remote = Arc::new(FakeRemote::default());
        let manager = LeaseManager::new(&remote_config(&lock_path), Some(remote.clone()));

        assert!(manager.try_acquire().await);
        assert_eq!(manager.last_acquire_mode(), LeaseMode::Remote);
        assert_eq!(manager.current().await.unwrap().ttl_seconds, Some(30));

        manager.release().await;
        assert_eq!(remote.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_denied_releases_local_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("sync.lock");
        let remote = Arc::new(FakeRemote::default());
        remote.deny.store(true, Ordering::SeqCst);

        let manager = LeaseManager::new(&remote_config(&lock_path), Some(remote));
        assert!(!manager.try_acquire().await);
        assert_eq!(manager.last_acquire_mode(), LeaseMode::None);

        let local_only = LeaseManager::new(&local_config(&lock_path), None);
        assert!(local_only.try_acquire().await);
    }

    #[tokio::test]
    async fn test_failed_renewal_drops_leadership() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("sync.lock");
        let remote = Arc::new(FakeRemote::default());
        let manager = LeaseManager::new(&remote_config(&lock_path), Some(remote.clone()));

        assert!(manager.try_acquire().await);
        remote.fail_renew.store(true, Ordering::SeqCst);
        assert!(!manager.try_acquire().await);
        assert_eq!(manager.last_acquire_mode(), LeaseMode::None);
        assert!(manager.current().await.is_none());

        // The local lock went with it.
        let other = LeaseManager::new(&local_config(&lock_path), None);
        assert!(other.try_acquire().await);
    }

    #[tokio::test]
    async fn test_confirm_renews_remote_lease() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("sync.lock");
        let remote = Arc::new(FakeRemote::default());
        let manager = LeaseManager::new(&remote_config(&lock_path), Some(remote.clone()));

        assert!(!manager.confirm().await);
        assert!(manager.try_acquire().await);
        assert!(manager.confirm().await);

        remote.fail_renew.store(true, Ordering::SeqCst);
        assert!(!manager.confirm().await);
        assert_eq!(manager.last_acquire_mode(), LeaseMode::None);
        assert!(manager.current().await.is_none());

        let other = LeaseManager::new(&local_config(&lock_path), None);
        assert!(other.try_acquire().await);
    }

    #[tokio::test]
    async fn test_confirm_local_lease() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LeaseManager::new(&local_config(&dir.path().join("l")), None);
        assert!(manager.try_acquire().await);
        assert!(manager.confirm().await);
        manager.release().await;
        assert!(!manager.confirm().await);
    }

    #[tokio::test]
    async fn test_http_lease_client_keeps_base_path() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/config-center{RENEW_PATH}")))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = HttpLeaseClient::new(&RemoteConfig {
            base_url: Url::parse(&format!("{}/config-center", mock_server.uri())).unwrap(),
            api_key: "key".into(),
            tenant_id: None,
            app_id: None,
            connect_timeout_ms: 1_000,
            read_timeout_ms: 1_000,
            max_retries: 0,
            retry_base_delay_ms: 1,
        })
        .unwrap();
        assert!(client.renew("sync", "h", 30).await.unwrap());
    }

    #[tokio::test]
    async fn test_http_lease_client() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(ACQUIRE_PATH))
            .and(body_partial_json(serde_json::json!({"key": "sync", "ttlSeconds": 30})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"granted": true})),
            )
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path(RENEW_PATH))
            .respond_with(ResponseTemplate::new(409))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path(RELEASE_PATH))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let client = HttpLeaseClient::new(&RemoteConfig {
            base_url: Url::parse(&mock_server.uri()).unwrap(),
            api_key: "key".into(),
            tenant_id: None,
            app_id: None,
            connect_timeout_ms: 1_000,
            read_timeout_ms: 1_000,
            max_retries: 0,
            retry_base_delay_ms: 1,
        })
        .unwrap();

        assert!(client.acquire("sync", "h", 30).await.unwrap());
        assert!(!client.renew("sync", "h", 30).await.unwrap());
        assert!(matches!(
            client.release("sync", "h").await,
            Err(LeaseError::UnexpectedStatus(500))
        ));
    }
}
