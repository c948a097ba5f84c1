use hyper::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("missing or invalid API key")]
    Unauthorized,

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("batch contains no items")]
    EmptyBatch,

    #[error("batch of {size} items exceeds the limit of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("tenantId and appId are required")]
    MissingTenantApp,

    #[error("unsupported contract version: {0}")]
    UnsupportedContract(String),

    #[error("quota exceeded for {tenant_id}/{app_id}")]
    QuotaExceeded { tenant_id: String, app_id: String },

    #[error("not found")]
    NotFound,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl IngestError {
    pub fn status(&self) -> StatusCode {
        match self {
            IngestError::Unauthorized => StatusCode::UNAUTHORIZED,
            IngestError::BadRequest(_)
            | IngestError::EmptyBatch
            | IngestError::BatchTooLarge { .. }
            | IngestError::MissingTenantApp
            | IngestError::UnsupportedContract(_) => StatusCode::BAD_REQUEST,
            IngestError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            IngestError::NotFound => StatusCode::NOT_FOUND,
            IngestError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            IngestError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used to tag rejection metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            IngestError::Unauthorized => "unauthorized",
            IngestError::BadRequest(_) => "bad_request",
            IngestError::EmptyBatch => "empty_batch",
            IngestError::BatchTooLarge { .. } => "batch_too_large",
            IngestError::MissingTenantApp => "missing_tenant_app",
            IngestError::UnsupportedContract(_) => "unsupported_contract",
            IngestError::QuotaExceeded { .. } => "quota_exceeded",
            IngestError::NotFound => "not_found",
            IngestError::MethodNotAllowed => "method_not_allowed",
            IngestError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(IngestError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            IngestError::BatchTooLarge { size: 3, max: 2 }.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            IngestError::QuotaExceeded {
                tenant_id: "t".into(),
                app_id: "a".into()
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            IngestError::UnsupportedContract("v9".into()).to_string(),
            "unsupported contract version: v9"
        );
    }
}
