use thiserror::Error;

/// Failure while fetching a task snapshot or a list page.
///
/// Every variant is treated as transient by the poller and the page loader:
/// the operation is retried on the next tick or request.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("task {0} not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("task store error: {0}")]
    Store(String),
}

impl FetchError {
    pub fn store(err: anyhow::Error) -> Self {
        FetchError::Store(format!("{:#}", err))
    }
}
