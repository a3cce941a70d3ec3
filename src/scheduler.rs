//! Admission-controlled download queue.
//!
//! Owns every known [`DownloadTask`], starts sessions in priority order while
//! fewer than `max_concurrent` tasks are downloading, mirrors their progress
//! and status into the [`TaskStore`] and publishes task snapshots to an
//! optional update channel.
//!
//! Lock order is scheduler map first, session second. Sessions never call
//! back into the scheduler; their events arrive through a channel drained by
//! a forwarder task.

use chrono::{DateTime, Utc};
use reqwest::Client;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, SETTING_DEFAULT_CONNECTIONS, SETTING_MAX_CONCURRENT};
use crate::error::{DownloadError, Result};
use crate::naming::{category_for, filename_from, sanitize_filename, save_path_for, unique_filepath};
use crate::probe::probe;
use crate::session::{discard_files, DownloadSession, SessionEvent, SessionOutcome, SessionRequest};
use crate::store::{setting_or, TaskStore};
use crate::task::{DownloadStatus, DownloadTask, TaskPatch};

/// Parameters of [`QueueScheduler::add`].
#[derive(Debug, Clone)]
pub struct AddRequest {
    pub url: String,
    pub filename: Option<String>,
    /// Full target path; skips category folders and de-duplication.
    pub save_path: Option<PathBuf>,
    pub connections: Option<usize>,
    pub priority: i32,
    pub speed_limit: u64,
    pub referer: String,
    pub extra_headers: BTreeMap<String, String>,
    pub auto_start: bool,
    /// Known size, e.g. reported by the browser.
    pub size: u64,
    pub skip_probe: bool,
}

impl AddRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            filename: None,
            save_path: None,
            connections: None,
            priority: 1,
            speed_limit: 0,
            referer: String::new(),
            extra_headers: BTreeMap::new(),
            auto_start: true,
            size: 0,
            skip_probe: false,
        }
    }
}

struct Entry {
    task: DownloadTask,
    session: Option<DownloadSession>,
    run: Option<JoinHandle<()>>,
    seq: u64,
}

struct Inner {
    store: Arc<dyn TaskStore>,
    client: Client,
    config: EngineConfig,
    updates: Option<UnboundedSender<DownloadTask>>,
    tasks: Mutex<HashMap<String, Entry>>,
    next_seq: AtomicU64,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct QueueScheduler {
    inner: Arc<Inner>,
}

pub fn new_task_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

impl QueueScheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        config: EngineConfig,
        updates: Option<UnboundedSender<DownloadTask>>,
    ) -> Result<Self> {
        let client = config.build_client()?;
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                client,
                config,
                updates,
                tasks: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.inner.store
    }

    pub fn max_concurrent(&self) -> usize {
        setting_or(
            self.inner.store.as_ref(),
            SETTING_MAX_CONCURRENT,
            self.inner.config.max_concurrent,
        )
        .max(1)
    }

    pub fn default_connections(&self) -> usize {
        setting_or(
            self.inner.store.as_ref(),
            SETTING_DEFAULT_CONNECTIONS,
            self.inner.config.default_connections,
        )
    }

    /// Loads stored rows. A row left `Downloading` (or `Merging`) by a previous
    /// process comes back `Paused`.
    pub fn load_from_store(&self) -> Result<usize> {
        let mut rows = self.inner.store.rows()?;
        rows.sort_by(|a, b| a.added_at.cmp(&b.added_at));
        let mut tasks = self.lock();
        let mut loaded = 0;
        for mut task in rows {
            if tasks.contains_key(&task.id) {
                continue;
            }
            if matches!(task.status, DownloadStatus::Downloading | DownloadStatus::Merging) {
                debug!(task = %task.id, "interrupted download marked paused");
                task.status = DownloadStatus::Paused;
                self.sync_row(&task.id, &TaskPatch::status(DownloadStatus::Paused));
            }
            let seq = self.next_seq();
            tasks.insert(
                task.id.clone(),
                Entry {
                    task,
                    session: None,
                    run: None,
                    seq,
                },
            );
            loaded += 1;
        }
        info!(loaded, "tasks loaded from store");
        Ok(loaded)
    }

    pub async fn add(&self, request: AddRequest) -> Result<String> {
        let connections = request
            .connections
            .unwrap_or_else(|| self.default_connections());
        let categories = self.inner.store.categories()?;

        let mut task = DownloadTask {
            id: new_task_id(),
            url: request.url.clone(),
            filename: String::new(),
            filepath: PathBuf::new(),
            connections,
            priority: request.priority,
            speed_limit: request.speed_limit,
            referer: request.referer.clone(),
            extra_headers: request.extra_headers.clone(),
            category: String::new(),
            status: DownloadStatus::Queued,
            total_size: request.size,
            downloaded: 0,
            speed: 0.0,
            eta: 0,
            error_message: String::new(),
            added_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        let filename = if request.skip_probe {
            request
                .filename
                .clone()
                .unwrap_or_else(|| filename_from(&request.url, None))
        } else {
            let info = probe(
                &self.inner.client,
                &request.url,
                &task.request_headers(),
                self.inner.config.probe_timeout,
            )
            .await;
            if task.total_size == 0 && !info.is_html() {
                task.total_size = info.total_size;
            }
            task.url = info.final_url.clone();
            request.filename.clone().unwrap_or_else(|| {
                filename_from(&info.final_url, info.content_disposition.as_deref())
            })
        };
        task.filename = sanitize_filename(&filename);
        task.category = category_for(&task.filename, &categories);

        let id = task.id.clone();
        {
            let mut tasks = self.lock();
            task.filepath = match &request.save_path {
                Some(path) => path.clone(),
                None => {
                    let wanted = save_path_for(
                        &task.filename,
                        &task.category,
                        &categories,
                        &self.inner.config.download_dir,
                    );
                    unique_filepath(&wanted, |candidate| path_taken(&tasks, candidate))
                }
            };
            self.inner.store.upsert_row(&task)?;
            info!(task = %id, url = %task.url, path = %task.filepath.display(), "task added");
            self.publish(&task);
            let seq = self.next_seq();
            tasks.insert(
                id.clone(),
                Entry {
                    task,
                    session: None,
                    run: None,
                    seq,
                },
            );
        }

        if request.auto_start {
            self.admit();
        }
        Ok(id)
    }

    /// Starts queued tasks, best first, until the ceiling is reached.
    pub fn admit(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let max = self.max_concurrent();
        let mut tasks = self.lock();
        let mut active = tasks
            .values()
            .filter(|e| e.task.status == DownloadStatus::Downloading)
            .count();
        if active >= max {
            return;
        }

        let mut queued: Vec<(i32, DateTime<Utc>, u64, String)> = tasks
            .values()
            .filter(|e| e.task.status == DownloadStatus::Queued)
            .map(|e| (e.task.priority, e.task.added_at, e.seq, e.task.id.clone()))
            .collect();
        queued.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        for (_, _, _, id) in queued {
            if active >= max {
                break;
            }
            let Some(entry) = tasks.get_mut(&id) else {
                continue;
            };
            match entry.session.clone() {
                Some(session) if session.is_cancelled() => {
                    debug!(task = %id, "previous run still winding down");
                    continue;
                }
                Some(session) => {
                    session.resume();
                    entry.task.status = DownloadStatus::Downloading;
                    self.sync_row(&id, &TaskPatch::status(DownloadStatus::Downloading));
                    info!(task = %id, "download resumed");
                    self.publish(&entry.task);
                }
                None => self.launch(entry),
            }
            active += 1;
        }
    }

    fn launch(&self, entry: &mut Entry) {
        let id = entry.task.id.clone();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = DownloadSession::builder(
            self.inner.client.clone(),
            self.inner.config.clone(),
            SessionRequest::from(&entry.task),
        )
        .events(events_tx)
        .build();

        let now = Utc::now();
        entry.task.status = DownloadStatus::Downloading;
        entry.task.started_at = Some(now);
        entry.task.error_message.clear();
        self.sync_row(
            &id,
            &TaskPatch::status(DownloadStatus::Downloading)
                .started_at(now)
                .error(""),
        );
        info!(task = %id, connections = entry.task.connections, "download started");
        self.publish(&entry.task);

        entry.session = Some(session.clone());
        tokio::spawn(self.clone().forward_events(id.clone(), session.clone(), events_rx));
        let scheduler = self.clone();
        entry.run = Some(tokio::spawn(async move {
            let outcome = session.run().await;
            scheduler.finish_run(&id, &session, outcome);
        }));
    }

    async fn forward_events(self, id: String, session: DownloadSession, mut events: UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            self.apply_event(&id, &session, event);
        }
    }

    /// Events of a detached or cancelled session are stale; the end of its
    /// run is handled by `finish_run`.
    fn apply_event(&self, id: &str, session: &DownloadSession, event: SessionEvent) {
        let mut tasks = self.lock();
        let Some(entry) = tasks.get_mut(id) else {
            return;
        };
        let attached = entry.session.as_ref().is_some_and(|s| s.is_same(session));
        if !attached || session.is_cancelled() {
            return;
        }
        match event {
            SessionEvent::Progress(progress) => {
                entry.task.downloaded = progress.downloaded;
                entry.task.total_size = progress.total;
                entry.task.speed = progress.speed;
                entry.task.eta = progress.eta;
            }
            SessionEvent::Status { status, .. } => {
                if status.is_terminal() || entry.task.status == status {
                    return;
                }
                entry.task.status = status;
                let mut patch = TaskPatch::status(status);
                if status == DownloadStatus::Paused {
                    entry.task.speed = 0.0;
                    entry.task.eta = 0;
                    patch = patch.bytes(entry.task.downloaded, entry.task.total_size);
                }
                self.sync_row(id, &patch);
            }
        }
        self.publish(&entry.task);
    }

    fn finish_run(&self, id: &str, session: &DownloadSession, outcome: SessionOutcome) {
        let progress = session.progress();
        {
            let mut tasks = self.lock();
            if let Some(entry) = tasks.get_mut(id) {
                if entry.session.as_ref().is_some_and(|s| s.is_same(session)) {
                    entry.session = None;
                    entry.run = None;
                }
                let task = &mut entry.task;
                task.downloaded = progress.downloaded;
                task.total_size = progress.total;
                task.speed = 0.0;
                task.eta = 0;

                // A paused task stays paused when its session is torn down.
                let running = matches!(task.status, DownloadStatus::Downloading | DownloadStatus::Merging);
                let patch = match outcome {
                    SessionOutcome::Completed => {
                        let now = Utc::now();
                        task.status = DownloadStatus::Completed;
                        task.completed_at = Some(now);
                        task.downloaded = task.total_size;
                        TaskPatch::status(DownloadStatus::Completed)
                            .bytes(task.total_size, task.total_size)
                            .completed_at(now)
                    }
                    SessionOutcome::Failed(message) if !session.is_cancelled() => {
                        task.status = DownloadStatus::Error;
                        task.error_message = message.clone();
                        TaskPatch::status(DownloadStatus::Error)
                            .bytes(task.downloaded, task.total_size)
                            .error(message)
                    }
                    SessionOutcome::Stopped if running => {
                        task.status = DownloadStatus::Stopped;
                        TaskPatch::status(DownloadStatus::Stopped).bytes(task.downloaded, task.total_size)
                    }
                    // A stop, restart or removal already decided the status.
                    _ => TaskPatch::default().bytes(task.downloaded, task.total_size),
                };
                self.sync_row(id, &patch);
                self.publish(&entry.task);
            }
        }
        self.admit();
    }

    pub fn start(&self, id: &str) -> Result<()> {
        {
            let mut tasks = self.lock();
            let entry = tasks
                .get_mut(id)
                .ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))?;
            if !matches!(
                entry.task.status,
                DownloadStatus::Queued
                    | DownloadStatus::Paused
                    | DownloadStatus::Stopped
                    | DownloadStatus::Error
            ) {
                return Ok(());
            }
            entry.task.status = DownloadStatus::Queued;
            entry.task.error_message.clear();
            self.sync_row(id, &TaskPatch::status(DownloadStatus::Queued).error(""));
            self.publish(&entry.task);
        }
        self.admit();
        Ok(())
    }

    /// A paused task goes back through admission; an attached paused session
    /// is resumed in place there.
    pub fn resume(&self, id: &str) -> Result<()> {
        {
            let mut tasks = self.lock();
            let entry = tasks
                .get_mut(id)
                .ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))?;
            if entry.task.status != DownloadStatus::Paused {
                return Ok(());
            }
            entry.task.status = DownloadStatus::Queued;
            self.sync_row(id, &TaskPatch::status(DownloadStatus::Queued));
            self.publish(&entry.task);
        }
        self.admit();
        Ok(())
    }

    /// Parks a queued or downloading task. The freed slot goes to the next
    /// queued task straight away.
    pub fn pause(&self, id: &str) -> Result<()> {
        {
            let mut tasks = self.lock();
            let entry = tasks
                .get_mut(id)
                .ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))?;
            match entry.task.status {
                DownloadStatus::Downloading | DownloadStatus::Queued => {}
                _ => return Ok(()),
            }
            // A session that is winding down needs no signal; parking the task is enough.
            if let Some(session) = entry.session.as_ref().filter(|s| !s.is_cancelled()) {
                session.pause();
            }
            entry.task.status = DownloadStatus::Paused;
            entry.task.speed = 0.0;
            entry.task.eta = 0;
            self.sync_row(
                id,
                &TaskPatch::status(DownloadStatus::Paused).bytes(entry.task.downloaded, entry.task.total_size),
            );
            info!(task = %id, "download paused");
            self.publish(&entry.task);
        }
        self.admit();
        Ok(())
    }

    /// Cancels the run keeping chunk files and state for a later start.
    pub fn stop(&self, id: &str) -> Result<()> {
        let mut tasks = self.lock();
        let entry = tasks
            .get_mut(id)
            .ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))?;
        if matches!(
            entry.task.status,
            DownloadStatus::Stopped | DownloadStatus::Completed | DownloadStatus::Error
        ) {
            return Ok(());
        }
        if let Some(session) = &entry.session {
            session.stop_and_save();
        }
        entry.task.status = DownloadStatus::Stopped;
        entry.task.speed = 0.0;
        entry.task.eta = 0;
        self.sync_row(
            id,
            &TaskPatch::status(DownloadStatus::Stopped).bytes(entry.task.downloaded, entry.task.total_size),
        );
        self.publish(&entry.task);
        Ok(())
    }

    /// Cancels and waits for the run, then drops the task. With `delete_file`
    /// the target, chunk directory and state file are deleted too.
    pub async fn remove(&self, id: &str, delete_file: bool) -> Result<()> {
        let (session, run, filepath) = {
            let mut tasks = self.lock();
            let entry = tasks
                .get_mut(id)
                .ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))?;
            entry.task.status = DownloadStatus::Stopped;
            (entry.session.take(), entry.run.take(), entry.task.filepath.clone())
        };
        if let Some(session) = session {
            session.cancel();
        }
        if let Some(run) = run {
            if let Err(e) = run.await {
                warn!(task = %id, error = %e, "download run ended abnormally");
            }
        }
        if delete_file {
            discard_files(&filepath, true).await;
        }
        self.lock().remove(id);
        self.inner.store.delete_row(id)?;
        info!(task = %id, delete_file, "task removed");
        Ok(())
    }

    pub fn start_all(&self) {
        {
            let mut tasks = self.lock();
            for entry in tasks.values_mut() {
                if matches!(
                    entry.task.status,
                    DownloadStatus::Paused | DownloadStatus::Stopped
                ) {
                    entry.task.status = DownloadStatus::Queued;
                    self.sync_row(&entry.task.id, &TaskPatch::status(DownloadStatus::Queued));
                    self.publish(&entry.task);
                }
            }
        }
        self.admit();
    }

    pub fn stop_all(&self) {
        let ids: Vec<String> = self
            .lock()
            .values()
            .filter(|e| {
                e.task.status == DownloadStatus::Downloading
                    || (e.task.status == DownloadStatus::Paused && e.session.is_some())
            })
            .map(|e| e.task.id.clone())
            .collect();
        for id in ids {
            if let Err(e) = self.stop(&id) {
                debug!(task = %id, error = %e, "stop skipped");
            }
        }
    }

    /// Snapshots in insertion order.
    pub fn tasks(&self) -> Vec<DownloadTask> {
        let tasks = self.lock();
        let mut entries: Vec<&Entry> = tasks.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.task.clone()).collect()
    }

    pub fn task(&self, id: &str) -> Option<DownloadTask> {
        self.lock().get(id).map(|e| e.task.clone())
    }

    /// Nothing queued, running or merging.
    pub fn is_idle(&self) -> bool {
        self.lock().values().all(|e| {
            e.run.is_none()
                && !matches!(
                    e.task.status,
                    DownloadStatus::Queued | DownloadStatus::Downloading | DownloadStatus::Merging
                )
        })
    }

    /// Periodic admission plus byte counts of running tasks into the store.
    pub fn spawn_loop(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.inner.config.scheduler_tick);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = scheduler.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        scheduler.admit();
                        scheduler.snapshot_running();
                    }
                }
            }
            debug!("scheduler loop exited");
        })
    }

    /// One batched store update per tick. It stays under the map lock so a
    /// stale snapshot can never land after a later status change.
    fn snapshot_running(&self) {
        let tasks = self.lock();
        let patches: Vec<(String, TaskPatch)> = tasks
            .values()
            .filter(|e| e.task.status == DownloadStatus::Downloading)
            .map(|e| {
                let patch = TaskPatch::status(DownloadStatus::Downloading)
                    .bytes(e.task.downloaded, e.task.total_size);
                (e.task.id.clone(), patch)
            })
            .collect();
        if patches.is_empty() {
            return;
        }
        if let Err(e) = self.inner.store.update_rows(&patches) {
            warn!(error = %e, "failed to snapshot running tasks");
        }
    }

    /// Stops admission, stops every session and waits for the runs to end.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let runs: Vec<JoinHandle<()>> = {
            let mut tasks = self.lock();
            tasks
                .values_mut()
                .filter_map(|entry| {
                    if let Some(session) = &entry.session {
                        session.stop_and_save();
                    }
                    entry.run.take()
                })
                .collect()
        };
        info!(running = runs.len(), "scheduler shutting down");
        for run in runs {
            if let Err(e) = run.await {
                warn!(error = %e, "download run ended abnormally");
            }
        }
    }

    fn next_seq(&self) -> u64 {
        self.inner.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sync_row(&self, id: &str, patch: &TaskPatch) {
        if let Err(e) = self.inner.store.update_row(id, patch) {
            warn!(task = %id, error = %e, "failed to update task row");
        }
    }

    fn publish(&self, task: &DownloadTask) {
        if let Some(updates) = &self.inner.updates {
            let _ = updates.send(task.clone());
        }
    }
}

fn path_taken(tasks: &HashMap<String, Entry>, candidate: &Path) -> bool {
    tasks.values().any(|e| e.task.filepath == candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_sixteen_hex_chars() {
        let id = new_task_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_task_id());
    }

    #[test]
    fn add_request_defaults() {
        let request = AddRequest::new("http://example.com/a.zip");
        assert_eq!(request.priority, 1);
        assert!(request.auto_start);
        assert!(!request.skip_probe);
        assert!(request.connections.is_none());
    }
}
