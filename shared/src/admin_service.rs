//! Admin listener shared by every component: liveness, readiness and a JSON
//! status document for operators.

use crate::http::{ResponseBody, full_body, json_response, make_error_response};
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type ReadyFn = Arc<dyn Fn() -> bool + Send + Sync>;
type StatusFn = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

#[derive(Clone)]
pub struct AdminService {
    is_ready: ReadyFn,
    status: Option<StatusFn>,
}

impl AdminService {
    pub fn new<F>(is_ready: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            is_ready: Arc::new(is_ready),
            status: None,
        }
    }

    /// Serve `/status` with the document produced by `status`.
    pub fn with_status<F>(mut self, status: F) -> Self
    where
        F: Fn() -> serde_json::Value + Send + Sync + 'static,
    {
        self.status = Some(Arc::new(status));
        self
    }

    fn respond(&self, method: &Method, path: &str) -> Response<ResponseBody> {
        if method != Method::GET {
            return make_error_response(StatusCode::METHOD_NOT_ALLOWED);
        }

        match path {
            "/health" => Response::new(full_body("ok\n")),
            "/ready" => match (self.is_ready)() {
                true => Response::new(full_body("ok\n")),
                false => make_error_response(StatusCode::SERVICE_UNAVAILABLE),
            },
            "/status" => match &self.status {
                Some(status) => json_response(StatusCode::OK, &status()),
                None => make_error_response(StatusCode::NOT_FOUND),
            },
            _ => make_error_response(StatusCode::NOT_FOUND),
        }
    }
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let res = self.respond(req.method(), req.uri().path());
        Box::pin(async move { Ok(res) })
    }
}
