use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, REFERER};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Stopped,
    Error,
    Merging,
    Completed,
}

impl DownloadStatus {
    /// A run that ended here has no workers left.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error | Self::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Downloading => "Downloading",
            Self::Paused => "Paused",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
            Self::Merging => "Merging",
            Self::Completed => "Completed",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Queued" => Ok(Self::Queued),
            "Downloading" => Ok(Self::Downloading),
            "Paused" => Ok(Self::Paused),
            "Stopped" => Ok(Self::Stopped),
            "Error" => Ok(Self::Error),
            "Merging" => Ok(Self::Merging),
            "Completed" => Ok(Self::Completed),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// The queue-visible unit. Also the row shape of the task store; `speed` and
/// `eta` are runtime-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: String,
    pub url: String,
    pub filename: String,
    pub filepath: PathBuf,
    pub connections: usize,
    pub priority: i32,
    /// Bytes per second, 0 = unlimited.
    #[serde(default)]
    pub speed_limit: u64,
    #[serde(default)]
    pub referer: String,
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
    pub category: String,
    pub status: DownloadStatus,
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub downloaded: u64,
    #[serde(skip)]
    pub speed: f64,
    #[serde(skip)]
    pub eta: u64,
    #[serde(default)]
    pub error_message: String,
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadTask {
    /// Extra headers plus `Referer`, skipping anything that is not a valid header.
    pub fn request_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.extra_headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(task = %self.id, header = %name, "skipping invalid header"),
            }
        }
        if !self.referer.is_empty() {
            match HeaderValue::from_str(&self.referer) {
                Ok(value) => {
                    headers.insert(REFERER, value);
                }
                Err(_) => warn!(task = %self.id, "skipping invalid referer"),
            }
        }
        headers
    }

    pub fn percent(&self) -> f64 {
        if self.total_size == 0 {
            0.0
        } else {
            (self.downloaded as f64 / self.total_size as f64) * 100.0
        }
    }
}

/// Field subset written by `TaskStore::update_row`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<DownloadStatus>,
    pub total_size: Option<u64>,
    pub downloaded: Option<u64>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn status(status: DownloadStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn bytes(mut self, downloaded: u64, total_size: u64) -> Self {
        self.downloaded = Some(downloaded);
        self.total_size = Some(total_size);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn apply(&self, task: &mut DownloadTask) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(total_size) = self.total_size {
            task.total_size = total_size;
        }
        if let Some(downloaded) = self.downloaded {
            task.downloaded = downloaded;
        }
        if let Some(message) = &self.error_message {
            task.error_message = message.clone();
        }
        if let Some(at) = self.started_at {
            task.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            task.completed_at = Some(at);
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_task(id: &str) -> DownloadTask {
    DownloadTask {
        id: id.to_string(),
        url: format!("http://example.com/{id}.bin"),
        filename: format!("{id}.bin"),
        filepath: PathBuf::from(format!("/tmp/{id}.bin")),
        connections: 4,
        priority: 1,
        speed_limit: 0,
        referer: String::new(),
        extra_headers: BTreeMap::new(),
        category: "Other".to_string(),
        status: DownloadStatus::Queued,
        total_size: 0,
        downloaded: 0,
        speed: 0.0,
        eta: 0,
        error_message: String::new(),
        added_at: Utc::now(),
        started_at: None,
        completed_at: None,
    }
}
