//! Task rows, settings and categories.
//!
//! The scheduler only talks to [`TaskStore`]; [`JsonStore`] is the bundled
//! implementation, kept in memory and optionally mirrored to one JSON file.
//!
//! Callers only serialize under the table lock. The file itself is written by
//! a dedicated writer thread, so no update blocks an async worker on disk I/O.
//! Snapshots queued faster than the disk keeps up are coalesced to the newest.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard};
use std::thread::JoinHandle;
use tracing::{debug, warn};

use crate::config::{SETTING_DEFAULT_CONNECTIONS, SETTING_MAX_CONCURRENT};
use crate::error::{DownloadError, Result};
use crate::naming::{default_categories, Category};
use crate::task::{DownloadTask, TaskPatch};

pub trait TaskStore: Send + Sync {
    fn upsert_row(&self, task: &DownloadTask) -> Result<()>;
    /// Unknown ids are ignored.
    fn update_row(&self, id: &str, patch: &TaskPatch) -> Result<()>;
    /// Several row updates persisted together.
    fn update_rows(&self, patches: &[(String, TaskPatch)]) -> Result<()> {
        for (id, patch) in patches {
            self.update_row(id, patch)?;
        }
        Ok(())
    }
    /// Newest first.
    fn rows(&self) -> Result<Vec<DownloadTask>>;
    fn delete_row(&self, id: &str) -> Result<()>;
    fn setting(&self, key: &str) -> Result<Option<String>>;
    fn set_setting(&self, key: &str, value: &str) -> Result<()>;
    fn categories(&self) -> Result<Vec<Category>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tables {
    #[serde(default)]
    downloads: BTreeMap<String, DownloadTask>,
    #[serde(default = "default_settings")]
    settings: BTreeMap<String, String>,
    #[serde(default = "default_categories")]
    categories: Vec<Category>,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            downloads: BTreeMap::new(),
            settings: default_settings(),
            categories: default_categories(),
        }
    }
}

fn default_settings() -> BTreeMap<String, String> {
    BTreeMap::from([
        (SETTING_MAX_CONCURRENT.to_string(), "3".to_string()),
        (SETTING_DEFAULT_CONNECTIONS.to_string(), "8".to_string()),
    ])
}

pub struct JsonStore {
    path: Option<PathBuf>,
    tables: Mutex<Tables>,
    writes: Option<Sender<Vec<u8>>>,
    writer: Option<JoinHandle<()>>,
}

impl JsonStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            tables: Mutex::new(Tables::default()),
            writes: None,
            writer: None,
        }
    }

    /// Loads `path` if it exists; the file is created on the first write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tables = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| DownloadError::Store(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(e) => return Err(DownloadError::io(&path, e)),
        };
        let (writes, queued) = mpsc::channel();
        let target = path.clone();
        let writer = std::thread::Builder::new()
            .name("fdl-store".to_string())
            .spawn(move || write_loop(&target, queued))
            .map_err(|e| DownloadError::io(&path, e))?;
        Ok(Self {
            path: Some(path),
            tables: Mutex::new(tables),
            writes: Some(writes),
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| DownloadError::Store("store lock poisoned".to_string()))
    }

    /// Called with the lock held so queued snapshots follow the update order.
    fn flush(&self, tables: &Tables) -> Result<()> {
        let Some(writes) = &self.writes else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(tables).map_err(|source| DownloadError::Serialize {
            what: "task store",
            source,
        })?;
        writes
            .send(bytes)
            .map_err(|_| DownloadError::Store("store writer has stopped".to_string()))
    }
}

/// Dropping the store waits for the last queued snapshot to reach the disk.
impl Drop for JsonStore {
    fn drop(&mut self) {
        self.writes.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!("task store writer panicked");
            }
        }
    }
}

fn write_loop(path: &Path, queued: Receiver<Vec<u8>>) {
    while let Ok(mut bytes) = queued.recv() {
        while let Ok(newer) = queued.try_recv() {
            bytes = newer;
        }
        match write_atomic(path, &bytes) {
            Ok(()) => debug!(path = %path.display(), bytes = bytes.len(), "task store written"),
            Err(e) => warn!(error = %e, "failed to write task store"),
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| DownloadError::io(parent, e))?;
    }
    let mut tmp = path.to_path_buf().into_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes).map_err(|e| DownloadError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| DownloadError::io(path, e))
}

impl TaskStore for JsonStore {
    fn upsert_row(&self, task: &DownloadTask) -> Result<()> {
        let mut tables = self.lock()?;
        tables.downloads.insert(task.id.clone(), task.clone());
        self.flush(&tables)
    }

    fn update_row(&self, id: &str, patch: &TaskPatch) -> Result<()> {
        let mut tables = self.lock()?;
        let Some(row) = tables.downloads.get_mut(id) else {
            return Ok(());
        };
        patch.apply(row);
        self.flush(&tables)
    }

    fn update_rows(&self, patches: &[(String, TaskPatch)]) -> Result<()> {
        let mut tables = self.lock()?;
        let mut changed = false;
        for (id, patch) in patches {
            if let Some(row) = tables.downloads.get_mut(id) {
                patch.apply(row);
                changed = true;
            }
        }
        if changed {
            self.flush(&tables)?;
        }
        Ok(())
    }

    fn rows(&self) -> Result<Vec<DownloadTask>> {
        let tables = self.lock()?;
        let mut rows: Vec<DownloadTask> = tables.downloads.values().cloned().collect();
        rows.sort_by(|a, b| b.added_at.cmp(&a.added_at));
        Ok(rows)
    }

    fn delete_row(&self, id: &str) -> Result<()> {
        let mut tables = self.lock()?;
        if tables.downloads.remove(id).is_some() {
            self.flush(&tables)?;
        }
        Ok(())
    }

    fn setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.settings.get(key).cloned())
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let mut tables = self.lock()?;
        tables.settings.insert(key.to_string(), value.to_string());
        self.flush(&tables)
    }

    fn categories(&self) -> Result<Vec<Category>> {
        Ok(self.lock()?.categories.clone())
    }
}

/// Parses a numeric setting, falling back on absence or garbage.
pub fn setting_or(store: &dyn TaskStore, key: &str, fallback: usize) -> usize {
    match store.setting(key) {
        Ok(Some(value)) => value.trim().parse().unwrap_or(fallback),
        _ => fallback,
    }
}
