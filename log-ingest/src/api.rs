//! HTTP surface of the ingestion server.
//!
//! Every route requires the `X-SF-API-KEY` header. Admission failures are the
//! only errors a caller ever sees; persistence problems after admission are
//! logged and counted, and the batch is still acknowledged.

use crate::config::LimitsConfig;
use crate::errors::IngestError;
use crate::maintenance::IndexMaintenance;
use crate::metrics_defs::{
    INGEST_BATCH_ACCEPTED, INGEST_BATCH_REJECTED, INGEST_QUOTA_REJECTED, REQUEST_DURATION,
};
use crate::quota::MinuteQuota;
use crate::store::{LogStore, SaveOutcome};
use call_log::API_KEY_HEADER;
use call_log::contract::ContractAllowlist;
use call_log::record::{BatchAccepted, UploadBatch};
use http_body_util::{BodyExt, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use shared::http::{ResponseBody, json_error_response, json_response};
use shared::{counter, histogram};
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

const LOGS_PATH: &str = "/v1/logs/ai-calls";
const MAINTENANCE_METRICS_PATH: &str = "/v1/logs/ai-calls/index-maintenance/metrics";
const MAINTENANCE_REBUILD_PATH: &str = "/v1/logs/ai-calls/index-maintenance/rebuild";
const ALLOWLIST_VALIDATE_PATH: &str = "/v1/logs/ai-calls/contract-allowlist/validate";

const DEFAULT_PAGE_SIZE: usize = 100;

/// Everything the request handlers share.
pub struct AppState {
    pub api_keys: HashSet<String>,
    pub limits: LimitsConfig,
    pub store: Arc<LogStore>,
    pub quota: MinuteQuota,
    pub allowlist: Arc<ContractAllowlist>,
    pub maintenance: Arc<IndexMaintenance>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    Batch,
    Logs,
    MaintenanceMetrics,
    MaintenanceRebuild,
    ValidateAllowlist,
}

impl Route {
    fn resolve(path: &str) -> Option<Self> {
        match path.trim_end_matches('/') {
            call_log::BATCH_PATH => Some(Route::Batch),
            LOGS_PATH => Some(Route::Logs),
            MAINTENANCE_METRICS_PATH => Some(Route::MaintenanceMetrics),
            MAINTENANCE_REBUILD_PATH => Some(Route::MaintenanceRebuild),
            ALLOWLIST_VALIDATE_PATH => Some(Route::ValidateAllowlist),
            _ => None,
        }
    }

    fn method(self) -> Method {
        match self {
            Route::Logs | Route::MaintenanceMetrics => Method::GET,
            Route::Batch | Route::MaintenanceRebuild | Route::ValidateAllowlist => Method::POST,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Route::Batch => "batch",
            Route::Logs => "logs",
            Route::MaintenanceMetrics => "maintenance_metrics",
            Route::MaintenanceRebuild => "maintenance_rebuild",
            Route::ValidateAllowlist => "validate_allowlist",
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateAllowlistRequest {
    #[serde(default)]
    proposed_versions: Vec<String>,
}

#[derive(Clone)]
pub struct IngestService {
    state: Arc<AppState>,
}

impl IngestService {
    pub fn new(state: Arc<AppState>) -> Self {
        IngestService { state }
    }
}

impl Service<Request<Incoming>> for IngestService {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let state = self.state.clone();
        Box::pin(async move {
            let started = Instant::now();
            let route = Route::resolve(req.uri().path());

            let response = match state.handle(route, req).await {
                Ok(response) => response,
                Err(e) => {
                    if route == Some(Route::Batch) {
                        counter!(INGEST_BATCH_REJECTED, "reason" => e.reason()).increment(1);
                    }
                    if let IngestError::Internal(message) = &e {
                        tracing::error!(error = %message, "Request failed");
                    }
                    json_error_response(e.status(), &e.to_string())
                }
            };

            let route_name = route.map(Route::name).unwrap_or("unknown");
            histogram!(REQUEST_DURATION, "route" => route_name)
                .record(started.elapsed().as_secs_f64());
            Ok(response)
        })
    }
}

impl AppState {
    async fn handle(
        self: Arc<Self>,
        route: Option<Route>,
        req: Request<Incoming>,
    ) -> Result<Response<ResponseBody>, IngestError> {
        let route = route.ok_or(IngestError::NotFound)?;
        if req.method() != route.method() {
            return Err(IngestError::MethodNotAllowed);
        }
        self.authenticate(&req)?;

        match route {
            Route::Batch => {
                let body = self.read_body(req.into_body()).await?;
                self.ingest_batch(&body).await
            }
            Route::Logs => self.query_logs(req.uri().query().unwrap_or("")).await,
            Route::MaintenanceMetrics => {
                Ok(json_response(StatusCode::OK, &self.maintenance.metrics()))
            }
            Route::MaintenanceRebuild => {
                let report = self.maintenance.rebuild_once().await;
                Ok(json_response(StatusCode::OK, &report))
            }
            Route::ValidateAllowlist => {
                let body = self.read_body(req.into_body()).await?;
                let request: ValidateAllowlistRequest = serde_json::from_slice(&body)
                    .map_err(|e| IngestError::BadRequest(e.to_string()))?;
                let report = self.allowlist.validate(&request.proposed_versions);
                Ok(json_response(StatusCode::OK, &report))
            }
        }
    }

    fn authenticate<B>(&self, req: &Request<B>) -> Result<(), IngestError> {
        let key = req
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .ok_or(IngestError::Unauthorized)?;

        if key.is_empty() || !self.api_keys.contains(key) {
            return Err(IngestError::Unauthorized);
        }
        Ok(())
    }

    async fn read_body(&self, body: Incoming) -> Result<Bytes, IngestError> {
        let collected = Limited::new(body, self.limits.max_body_bytes)
            .collect()
            .await
            .map_err(|e| IngestError::BadRequest(format!("unreadable body: {e}")))?;
        Ok(collected.to_bytes())
    }

    async fn ingest_batch(self: Arc<Self>, body: &[u8]) -> Result<Response<ResponseBody>, IngestError> {
        let batch: UploadBatch =
            serde_json::from_slice(body).map_err(|e| IngestError::BadRequest(e.to_string()))?;

        if !self.allowlist.is_supported(&batch.contract_version) {
            return Err(IngestError::UnsupportedContract(batch.contract_version));
        }
        if batch.items.is_empty() {
            return Err(IngestError::EmptyBatch);
        }
        if batch.items.len() > self.limits.max_batch_size {
            return Err(IngestError::BatchTooLarge {
                size: batch.items.len(),
                max: self.limits.max_batch_size,
            });
        }

        let tenant_id = self.resolve_id(batch.tenant_id.as_deref(), &self.limits.default_tenant_id)?;
        let app_id = self.resolve_id(batch.app_id.as_deref(), &self.limits.default_app_id)?;

        let size = batch.items.len();
        if !self.quota.try_acquire(&tenant_id, &app_id, size as u64) {
            counter!(INGEST_QUOTA_REJECTED).increment(1);
            return Err(IngestError::QuotaExceeded { tenant_id, app_id });
        }

        let state = self.clone();
        let (tenant, app) = (tenant_id.clone(), app_id.clone());
        let outcome = tokio::task::spawn_blocking(move || {
            state.store.save_batch(&tenant, &app, &batch.items)
        })
        .await;

        // Admission already happened; the caller is told so either way.
        match outcome {
            Ok(SaveOutcome::Saved(_)) => {}
            Ok(SaveOutcome::Failed(error)) => {
                tracing::warn!(tenant = %tenant_id, app = %app_id, %error, "Accepted batch was not persisted")
            }
            Err(e) => {
                tracing::error!(tenant = %tenant_id, app = %app_id, error = %e, "Store task failed")
            }
        }

        counter!(INGEST_BATCH_ACCEPTED).increment(size as u64);
        Ok(json_response(
            StatusCode::OK,
            &BatchAccepted {
                accepted: size,
                tenant_id,
                app_id,
            },
        ))
    }

    fn resolve_id(&self, id: Option<&str>, default: &str) -> Result<String, IngestError> {
        match id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => Ok(id.to_string()),
            None if self.limits.require_tenant_app => Err(IngestError::MissingTenantApp),
            None => Ok(default.to_string()),
        }
    }

    async fn query_logs(self: Arc<Self>, query: &str) -> Result<Response<ResponseBody>, IngestError> {
        let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();

        let tenant_id = self.resolve_id(
            params.get("tenantId").map(String::as_str),
            &self.limits.default_tenant_id,
        )?;
        let app_id = self.resolve_id(
            params.get("appId").map(String::as_str),
            &self.limits.default_app_id,
        )?;
        let cursor = parse_param::<u64>(&params, "cursor")?.unwrap_or(0);
        let limit = parse_param::<usize>(&params, "limit")?
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, self.limits.max_page_size.max(1));

        let store = self.store.clone();
        let page = tokio::task::spawn_blocking(move || {
            store.query_page(&tenant_id, &app_id, cursor, limit)
        })
        .await
        .map_err(|e| IngestError::Internal(e.to_string()))?;

        Ok(json_response(StatusCode::OK, &page))
    }
}

fn parse_param<T: std::str::FromStr>(
    params: &HashMap<String, String>,
    name: &str,
) -> Result<Option<T>, IngestError> {
    params
        .get(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| IngestError::BadRequest(format!("invalid {name}: {raw}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MaintenanceConfig, StorageConfig};
    use call_log::config::ContractPolicy;
    use serde_json::{Value, json};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    struct TestServer {
        addr: SocketAddr,
        client: reqwest::Client,
        _shutdown: oneshot::Sender<()>,
        _dir: tempfile::TempDir,
    }

    impl TestServer {
        async fn start(limits: LimitsConfig, quota_per_minute: i64) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(LogStore::new(&StorageConfig {
                dir: dir.path().to_path_buf(),
                index_stride: 2,
                retention_days: 7,
                sync_writes: false,
            }));
            let maintenance = Arc::new(IndexMaintenance::start(
                store.clone(),
                MaintenanceConfig {
                    enabled: false,
                    ..MaintenanceConfig::default()
                },
            ));
            let state = Arc::new(AppState {
                api_keys: HashSet::from(["secret".to_string()]),
                limits,
                store,
                quota: MinuteQuota::new(quota_per_minute),
                allowlist: Arc::new(ContractAllowlist::new(&ContractPolicy::default())),
                maintenance,
            });

            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (tx, rx) = oneshot::channel::<()>();
            tokio::spawn(shared::http::serve_listener(
                listener,
                IngestService::new(state),
                async move {
                    let _ = rx.await;
                },
            ));

            TestServer {
                addr,
                client: reqwest::Client::new(),
                _shutdown: tx,
                _dir: dir,
            }
        }

        fn url(&self, path: &str) -> String {
            format!("http://{}{}", self.addr, path)
        }

        async fn post(&self, path: &str, key: &str, body: &Value) -> (u16, Value) {
            let response = self
                .client
                .post(self.url(path))
                .header(API_KEY_HEADER, key)
                .json(body)
                .send()
                .await
                .unwrap();
            let status = response.status().as_u16();
            (status, response.json().await.unwrap_or(Value::Null))
        }

        async fn get(&self, path: &str) -> (u16, Value) {
            let response = self
                .client
                .get(self.url(path))
                .header(API_KEY_HEADER, "secret")
                .send()
                .await
                .unwrap();
            let status = response.status().as_u16();
            (status, response.json().await.unwrap_or(Value::Null))
        }
    }

    fn batch(tenant: Option<&str>, count: usize) -> Value {
        let items: Vec<Value> = (0..count)
            .map(|i| {
                json!({
                    "callId": format!("call-{i}"),
                    "operationType": "chat",
                    "modelName": "model-a",
                    "callTime": 1_700_000_000_000_u64,
                    "durationMillis": 12,
                    "status": "SUCCESS",
                })
            })
            .collect();
        json!({
            "contractVersion": "v1",
            "tenantId": tenant,
            "appId": "chat",
            "items": items,
        })
    }

    #[tokio::test]
    async fn test_batch_accepted_and_paged() {
        let server = TestServer::start(LimitsConfig::default(), 100).await;

        let (status, body) = server
            .post(call_log::BATCH_PATH, "secret", &batch(Some("acme"), 3))
            .await;
        assert_eq!(status, 200);
        assert_eq!(body, json!({"accepted": 3, "tenantId": "acme", "appId": "chat"}));

        let (status, page) = server
            .get("/v1/logs/ai-calls?tenantId=acme&appId=chat&cursor=1&limit=10")
            .await;
        assert_eq!(status, 200);
        assert_eq!(page["nextCursor"], 3);
        assert_eq!(page["hasMore"], false);
        assert_eq!(page["items"][0]["item"]["callId"], "call-1");
        assert_eq!(page["items"][0]["tenantId"], "acme");
    }

    #[tokio::test]
    async fn test_batch_admission_errors() {
        let limits = LimitsConfig {
            max_batch_size: 2,
            require_tenant_app: true,
            ..LimitsConfig::default()
        };
        let server = TestServer::start(limits, 3).await;

        let (status, body) = server
            .post(call_log::BATCH_PATH, "wrong", &batch(Some("acme"), 1))
            .await;
        assert_eq!(status, 401);
        assert!(body["error_message"].is_string());

        let (status, _) = server
            .post(call_log::BATCH_PATH, "secret", &batch(Some("acme"), 0))
            .await;
        assert_eq!(status, 400);

        let (status, _) = server
            .post(call_log::BATCH_PATH, "secret", &batch(Some("acme"), 3))
            .await;
        assert_eq!(status, 400);

        let (status, _) = server
            .post(call_log::BATCH_PATH, "secret", &batch(None, 1))
            .await;
        assert_eq!(status, 400);

        let mut unsupported = batch(Some("acme"), 1);
        unsupported["contractVersion"] = json!("v9");
        let (status, body) = server
            .post(call_log::BATCH_PATH, "secret", &unsupported)
            .await;
        assert_eq!(status, 400);
        assert_eq!(body["error_message"], "unsupported contract version: v9");

        let (status, _) = server
            .post(call_log::BATCH_PATH, "secret", &batch(Some("acme"), 2))
            .await;
        assert_eq!(status, 200);
        let (status, _) = server
            .post(call_log::BATCH_PATH, "secret", &batch(Some("acme"), 2))
            .await;
        assert_eq!(status, 429);
    }

    #[tokio::test]
    async fn test_default_tenant_when_not_required() {
        let server = TestServer::start(LimitsConfig::default(), 100).await;
        let (status, body) = server
            .post(call_log::BATCH_PATH, "secret", &batch(None, 1))
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["tenantId"], "default");
    }

    #[tokio::test]
    async fn test_maintenance_and_allowlist_routes() {
        let server = TestServer::start(LimitsConfig::default(), 100).await;
        let _ = server
            .post(call_log::BATCH_PATH, "secret", &batch(Some("acme"), 1))
            .await;

        let (status, report) = server
            .post(MAINTENANCE_REBUILD_PATH, "secret", &json!({}))
            .await;
        assert_eq!(status, 200);
        assert_eq!(report["success"], true);
        assert_eq!(report["rebuiltFiles"], 1);

        let (status, metrics) = server.get(MAINTENANCE_METRICS_PATH).await;
        assert_eq!(status, 200);
        assert_eq!(metrics["runCount"], 1);

        let (status, validation) = server
            .post(
                ALLOWLIST_VALIDATE_PATH,
                "secret",
                &json!({"proposedVersions": ["v2", "v3"]}),
            )
            .await;
        assert_eq!(status, 200);
        assert_eq!(validation["valid"], false);
        assert_eq!(validation["currentVersions"], json!(["v1"]));
    }

    #[tokio::test]
    async fn test_unknown_route_and_method() {
        let server = TestServer::start(LimitsConfig::default(), 100).await;
        let (status, _) = server.get("/v1/unknown").await;
        assert_eq!(status, 404);
        let (status, _) = server.get(call_log::BATCH_PATH).await;
        assert_eq!(status, 405);
    }
}
