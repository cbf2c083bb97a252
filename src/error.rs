use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("fetcher unavailable: {0}")]
    ToolUnavailable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("tool install failed: {0}")]
    InstallFailed(String),

    #[error("settings error: {0}")]
    Settings(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
