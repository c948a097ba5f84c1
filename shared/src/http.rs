use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Body type shared by every service in the workspace. Bodies are fully
/// buffered, so building one can never fail.
pub type ResponseBody = BoxBody<Bytes, Infallible>;

pub fn full_body<B: Into<Bytes>>(bytes: B) -> ResponseBody {
    Full::new(bytes.into()).boxed()
}

/// Plain-text response carrying the canonical reason of `status`.
pub fn make_error_response(status: StatusCode) -> Response<ResponseBody> {
    let reason = status.canonical_reason().unwrap_or("error");
    let mut response = Response::new(full_body(format!("{reason}\n")));
    *response.status_mut() = status;
    response
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error_message: &'a str,
}

/// JSON response with `value` as the body.
///
/// Falls back to a bare 500 if `value` cannot be serialized, which only
/// happens for maps with non-string keys.
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ResponseBody> {
    match serde_json::to_vec(value) {
        Ok(bytes) => {
            let mut response = Response::new(full_body(bytes));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize response body");
            make_error_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// JSON error response of the form `{"error_message": "..."}`.
pub fn json_error_response(status: StatusCode, message: &str) -> Response<ResponseBody> {
    json_response(
        status,
        &ErrorBody {
            error_message: message,
        },
    )
}

/// Accepts connections on `host:port` and serves each one with `service` until
/// `shutdown` resolves. Connections already accepted keep running to completion.
pub async fn run_http_service<S, F>(
    host: &str,
    port: u16,
    service: S,
    shutdown: F,
) -> std::io::Result<()>
where
    S: Service<Request<Incoming>, Response = Response<ResponseBody>> + Send + Sync + 'static,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    S::Future: Send + 'static,
    F: Future<Output = ()>,
{
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    tracing::info!(host, port, "Listening");
    serve_listener(listener, service, shutdown).await
}

/// Same as [`run_http_service`] for an already bound listener. Tests bind to
/// port 0 and use this directly.
pub async fn serve_listener<S, F>(
    listener: TcpListener,
    service: S,
    shutdown: F,
) -> std::io::Result<()>
where
    S: Service<Request<Incoming>, Response = Response<ResponseBody>> + Send + Sync + 'static,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    S::Future: Send + 'static,
    F: Future<Output = ()>,
{
    let service_arc = Arc::new(service);
    tokio::pin!(shutdown);

    loop {
        let (stream, _peer_addr) = tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted?,
        };
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let svc = service_arc.clone();

        // Hand the connection to hyper; auto-detect h1/h2 on this socket
        tokio::spawn(async move {
            if let Err(e) = Builder::new(TokioExecutor::new())
                .serve_connection(io, svc)
                .await
            {
                tracing::debug!(error = %e, "Connection closed with error");
            }
        });
    }
}
