use thiserror::Error;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("HTTP client error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("ingestion server rejected batch with status {0}")]
    Rejected(u16),

    #[error("uploader is shut down")]
    Closed,
}
