//! Durable per-transfer snapshot used to resume after a restart.
//!
//! One JSON file per in-flight transfer, stored next to the target file so a
//! new process finds it from the target path alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{DownloadError, Result};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub index: usize,
    pub start: u64,
    /// Inclusive.
    pub end: u64,
    #[serde(default)]
    pub downloaded: u64,
    #[serde(default)]
    pub completed: bool,
}

impl ChunkInfo {
    pub fn new(index: usize, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            downloaded: 0,
            completed: false,
        }
    }

    pub fn len(&self) -> u64 {
        if self.start > self.end {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First byte still missing.
    pub fn offset(&self) -> u64 {
        self.start + self.downloaded
    }

    pub fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.downloaded)
    }

    pub fn file_name(&self) -> String {
        format!("chunk_{}.part", self.index)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TransferState {
    pub url: String,
    pub filepath: PathBuf,
    pub total_size: u64,
    pub chunks: Vec<ChunkInfo>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl TransferState {
    pub fn new(url: &str, filepath: &Path, total_size: u64, chunks: Vec<ChunkInfo>) -> Self {
        Self {
            url: url.to_string(),
            filepath: filepath.to_path_buf(),
            total_size,
            chunks,
            completed: false,
            timestamp: Utc::now(),
        }
    }

    /// The whole resume contract: same URL string and not finished.
    pub fn resumable_for(&self, url: &str) -> bool {
        self.url == url && !self.completed
    }

    pub fn downloaded(&self) -> u64 {
        self.chunks.iter().map(|c| c.downloaded).sum()
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

pub fn state_path(filepath: &Path) -> PathBuf {
    with_suffix(filepath, ".part.json")
}

pub fn temp_dir(filepath: &Path) -> PathBuf {
    with_suffix(filepath, ".parts")
}

/// Reads a snapshot; anything unreadable counts as "no usable state".
pub async fn load(path: &Path) -> Option<TransferState> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unable to read transfer state");
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "discarding corrupt transfer state");
            None
        }
    }
}

pub async fn save(path: &Path, state: &TransferState) -> Result<()> {
    let bytes = serde_json::to_vec(state).map_err(|source| DownloadError::Serialize {
        what: "transfer state",
        source,
    })?;
    let tmp = with_suffix(path, ".tmp");
    fs::write(&tmp, &bytes)
        .await
        .map_err(|e| DownloadError::io(&tmp, e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    debug!(path = %path.display(), downloaded = state.downloaded(), "transfer state saved");
    Ok(())
}

pub async fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DownloadError::io(path, e)),
    }
}
