use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DownloadError>;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("server ignored the range request at offset {offset}")]
    RangeIgnored { offset: u64 },

    #[error("body ended early: expected {expected} bytes, got {received}")]
    ShortBody { expected: u64, received: u64 },

    #[error("no data received for {0:?}")]
    ReadTimeout(std::time::Duration),

    #[error("io error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("merged file '{}' has {actual} bytes, expected {expected}", path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("task store error: {0}")]
    Store(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether another attempt at the same range can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http(_)
                | Self::Status { .. }
                | Self::RangeIgnored { .. }
                | Self::ShortBody { .. }
                | Self::ReadTimeout(_)
                | Self::Io { .. }
        )
    }
}
