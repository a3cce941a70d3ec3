//! One file transfer end to end.
//!
//! A session probes the URL (or adopts a saved [`TransferState`]), splits the
//! file into chunks, runs one [`ChunkWorker`] per unfinished chunk, persists
//! progress every few seconds and finally concatenates the chunk files into
//! the target. Counters, the speed window and the chunk list live behind a
//! single mutex; no I/O happens while it is held.

use reqwest::header::HeaderMap;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{clamp_connections, EngineConfig};
use crate::error::{DownloadError, Result};
use crate::probe::probe;
use crate::progress::{Progress, ProgressTracker};
use crate::state::{self, ChunkInfo, TransferState};
use crate::task::{DownloadStatus, DownloadTask};
use crate::worker::{tokio_sleeper, ChunkOutcome, ChunkWorker, PauseToken, ProgressFn, RateCap, Sleeper};

pub const MERGE_BUFFER: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Progress(Progress),
    Status {
        status: DownloadStatus,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    /// Cancelled; chunk files and the state file are kept for resume.
    Stopped,
    Failed(String),
}

impl SessionOutcome {
    pub fn status(&self) -> DownloadStatus {
        match self {
            Self::Completed => DownloadStatus::Completed,
            Self::Stopped => DownloadStatus::Stopped,
            Self::Failed(_) => DownloadStatus::Error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub task_id: String,
    pub url: String,
    pub filepath: PathBuf,
    pub connections: usize,
    pub headers: HeaderMap,
    /// Bytes per second for the whole file, 0 = unlimited.
    pub speed_limit: u64,
}

impl SessionRequest {
    pub fn new(task_id: impl Into<String>, url: impl Into<String>, filepath: impl Into<PathBuf>) -> Self {
        Self {
            task_id: task_id.into(),
            url: url.into(),
            filepath: filepath.into(),
            connections: 1,
            headers: HeaderMap::new(),
            speed_limit: 0,
        }
    }

    pub fn connections(mut self, connections: usize) -> Self {
        self.connections = connections;
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn speed_limit(mut self, bytes_per_sec: u64) -> Self {
        self.speed_limit = bytes_per_sec;
        self
    }
}

impl From<&DownloadTask> for SessionRequest {
    fn from(task: &DownloadTask) -> Self {
        SessionRequest::new(&task.id, &task.url, &task.filepath)
            .connections(task.connections)
            .headers(task.request_headers())
            .speed_limit(task.speed_limit)
    }
}

struct Shared {
    status: DownloadStatus,
    total_size: u64,
    chunks: Vec<ChunkInfo>,
    tracker: ProgressTracker,
    failures: Vec<String>,
}

struct Inner {
    request: SessionRequest,
    client: Client,
    config: EngineConfig,
    sleeper: Sleeper,
    events: Option<UnboundedSender<SessionEvent>>,
    cancel: CancellationToken,
    pause: PauseToken,
    shared: Mutex<Shared>,
}

pub struct SessionBuilder {
    client: Client,
    config: EngineConfig,
    request: SessionRequest,
    events: Option<UnboundedSender<SessionEvent>>,
    sleeper: Sleeper,
}

impl SessionBuilder {
    pub fn events(mut self, events: UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Replaces the retry back-off timer.
    pub fn sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn build(self) -> DownloadSession {
        DownloadSession {
            inner: Arc::new(Inner {
                request: self.request,
                client: self.client,
                config: self.config,
                sleeper: self.sleeper,
                events: self.events,
                cancel: CancellationToken::new(),
                pause: PauseToken::new(),
                shared: Mutex::new(Shared {
                    status: DownloadStatus::Queued,
                    total_size: 0,
                    chunks: Vec::new(),
                    tracker: ProgressTracker::new(0, 0),
                    failures: Vec::new(),
                }),
            }),
        }
    }
}

/// Cheap to clone; every clone controls the same transfer.
#[derive(Clone)]
pub struct DownloadSession {
    inner: Arc<Inner>,
}

impl DownloadSession {
    pub fn builder(client: Client, config: EngineConfig, request: SessionRequest) -> SessionBuilder {
        SessionBuilder {
            client,
            config,
            request,
            events: None,
            sleeper: tokio_sleeper(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.inner.request.task_id
    }

    pub fn request(&self) -> &SessionRequest {
        &self.inner.request
    }

    pub fn status(&self) -> DownloadStatus {
        self.lock().status
    }

    pub fn progress(&self) -> Progress {
        self.lock().tracker.snapshot()
    }

    pub fn chunks(&self) -> Vec<ChunkInfo> {
        self.lock().chunks.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn is_same(&self, other: &DownloadSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Workers stop pulling bytes within one poll interval; connections stay open.
    pub fn pause(&self) {
        self.inner.pause.pause();
        if self.is_cancelled() {
            return;
        }
        let mut shared = self.lock();
        if matches!(shared.status, DownloadStatus::Queued | DownloadStatus::Downloading) {
            self.transition(&mut shared, DownloadStatus::Paused, None);
        }
    }

    pub fn resume(&self) {
        self.inner.pause.resume();
        let mut shared = self.lock();
        if shared.status == DownloadStatus::Paused {
            self.transition(&mut shared, DownloadStatus::Downloading, None);
        }
    }

    /// Ends the run as `Stopped`. Nothing on disk is deleted.
    pub fn cancel(&self) {
        self.inner.pause.resume();
        self.inner.cancel.cancel();
    }

    pub fn stop_and_save(&self) {
        info!(task = %self.task_id(), "stopping, progress kept for resume");
        self.cancel();
    }

    pub async fn run(&self) -> SessionOutcome {
        let outcome = match self.execute().await {
            Ok(outcome) => outcome,
            Err(_) if self.is_cancelled() => SessionOutcome::Stopped,
            Err(e) => SessionOutcome::Failed(e.to_string()),
        };

        let mut shared = self.lock();
        shared.tracker.idle();
        let snapshot = shared.tracker.snapshot();
        self.emit(SessionEvent::Progress(snapshot));
        let task = self.task_id();
        match &outcome {
            SessionOutcome::Completed => {
                info!(task, bytes = snapshot.downloaded, "download complete");
                self.transition(&mut shared, DownloadStatus::Completed, None);
            }
            SessionOutcome::Stopped => {
                info!(task, bytes = snapshot.downloaded, "download stopped");
                self.transition(&mut shared, DownloadStatus::Stopped, None);
            }
            SessionOutcome::Failed(message) => {
                warn!(task, error = %message, "download failed");
                self.transition(&mut shared, DownloadStatus::Error, Some(message.clone()));
            }
        }
        outcome
    }

    async fn execute(&self) -> Result<SessionOutcome> {
        if self.is_cancelled() {
            return Ok(SessionOutcome::Stopped);
        }
        let filepath = &self.inner.request.filepath;
        let temp_dir = state::temp_dir(filepath);
        let state_path = state::state_path(filepath);
        fs::create_dir_all(&temp_dir)
            .await
            .map_err(|e| DownloadError::io(&temp_dir, e))?;

        {
            let mut shared = self.lock();
            let status = if self.inner.pause.is_paused() {
                DownloadStatus::Paused
            } else {
                DownloadStatus::Downloading
            };
            self.transition(&mut shared, status, None);
        }

        let (url, total_size, chunks) = self.prepare(&temp_dir, &state_path).await?;
        let open_ended = total_size == 0;
        {
            let mut shared = self.lock();
            let downloaded = chunks.iter().map(|c| c.downloaded).sum();
            shared.total_size = total_size;
            shared.chunks = chunks;
            shared.tracker = ProgressTracker::new(total_size, downloaded);
            let snapshot = shared.tracker.snapshot();
            self.emit(SessionEvent::Progress(snapshot));
        }

        self.run_chunks(&url, open_ended, &temp_dir, &state_path).await;

        if self.is_cancelled() {
            return Ok(SessionOutcome::Stopped);
        }

        let chunks = {
            let mut shared = self.lock();
            if !shared.failures.is_empty() {
                return Ok(SessionOutcome::Failed(shared.failures.join("; ")));
            }
            if !shared.chunks.iter().all(|c| c.completed) {
                return Ok(SessionOutcome::Failed("download incomplete".to_string()));
            }
            if open_ended {
                let received = shared.tracker.downloaded();
                shared.total_size = received;
                shared.tracker.set_total(received);
            }
            self.transition(&mut shared, DownloadStatus::Merging, None);
            shared.chunks.clone()
        };

        let written = merge_chunks(&temp_dir, &chunks, filepath, total_size).await?;
        debug!(task = %self.task_id(), bytes = written, "chunks merged");
        cleanup(&temp_dir, &state_path).await;
        Ok(SessionOutcome::Completed)
    }

    /// Adopts matching saved state, otherwise probes and writes a fresh plan.
    /// Returns the URL workers should fetch, the total size and the chunks.
    async fn prepare(&self, temp_dir: &Path, state_path: &Path) -> Result<(String, u64, Vec<ChunkInfo>)> {
        let request = &self.inner.request;
        if let Some(saved) = state::load(state_path).await {
            if saved.resumable_for(&request.url) {
                let chunks = reconcile_with_disk(temp_dir, saved.chunks).await;
                info!(
                    task = %request.task_id,
                    downloaded = chunks.iter().map(|c| c.downloaded).sum::<u64>(),
                    total = saved.total_size,
                    "resuming from saved state"
                );
                return Ok((request.url.clone(), saved.total_size, chunks));
            }
            debug!(task = %request.task_id, "saved state belongs to another transfer, starting over");
        }

        let info = probe(
            &self.inner.client,
            &request.url,
            &request.headers,
            self.inner.config.probe_timeout,
        )
        .await;
        let chunks = plan_chunks(info.total_size, info.accepts_ranges, request.connections);
        info!(
            task = %request.task_id,
            size = info.total_size,
            ranges = info.accepts_ranges,
            chunks = chunks.len(),
            "starting download"
        );
        let fresh = TransferState::new(&request.url, &request.filepath, info.total_size, chunks.clone());
        state::save(state_path, &fresh).await?;
        Ok((info.final_url, info.total_size, chunks))
    }

    async fn run_chunks(&self, url: &str, open_ended: bool, temp_dir: &Path, state_path: &Path) {
        let request = &self.inner.request;
        let config = &self.inner.config;
        let pending: Vec<ChunkInfo> = self
            .lock()
            .chunks
            .iter()
            .filter(|c| !c.completed)
            .cloned()
            .collect();
        let rate_cap = RateCap::per_second(request.speed_limit);

        let mut workers = JoinSet::new();
        for chunk in pending {
            let index = chunk.index;
            let session = self.clone();
            let on_progress: ProgressFn = Arc::new(move |bytes| session.record_bytes(index, bytes));
            let worker = ChunkWorker::new(self.inner.client.clone(), url, chunk, temp_dir)
                .headers(request.headers.clone())
                .open_ended(open_ended)
                .read_timeout(config.read_timeout)
                .retry(config.retry)
                .rate_cap(rate_cap.clone())
                .sleeper(self.inner.sleeper.clone())
                .on_progress(on_progress)
                .signals(self.inner.cancel.clone(), self.inner.pause.clone());
            workers.spawn(worker.run());
        }

        let mut persist = tokio::time::interval(config.persist_interval.max(Duration::from_millis(10)));
        persist.set_missed_tick_behavior(MissedTickBehavior::Delay);
        persist.tick().await;
        loop {
            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(Ok(outcome)) => self.absorb(outcome),
                    Some(Err(e)) => {
                        warn!(task = %request.task_id, error = %e, "chunk worker aborted");
                        self.lock().failures.push(format!("chunk worker aborted: {e}"));
                    }
                    None => break,
                },
                _ = persist.tick() => self.persist(state_path).await,
            }
        }
        self.persist(state_path).await;
    }

    fn record_bytes(&self, index: usize, bytes: u64) {
        let mut shared = self.lock();
        if let Some(chunk) = shared.chunks.iter_mut().find(|c| c.index == index) {
            chunk.downloaded += bytes;
        }
        if let Some(progress) = shared.tracker.record(bytes, Instant::now()) {
            if shared.status == DownloadStatus::Downloading {
                self.emit(SessionEvent::Progress(progress));
            }
        }
    }

    fn absorb(&self, outcome: ChunkOutcome) {
        let mut shared = self.lock();
        let index = outcome.chunk.index;
        if let Some(chunk) = shared.chunks.iter_mut().find(|c| c.index == index) {
            chunk.downloaded = outcome.chunk.downloaded;
            chunk.completed = outcome.chunk.completed;
        }
        if let Some(e) = outcome.error {
            shared.failures.push(format!("chunk {index}: {e}"));
        }
    }

    async fn persist(&self, state_path: &Path) {
        let snapshot = {
            let shared = self.lock();
            TransferState::new(
                &self.inner.request.url,
                &self.inner.request.filepath,
                shared.total_size,
                shared.chunks.clone(),
            )
        };
        if let Err(e) = state::save(state_path, &snapshot).await {
            warn!(task = %self.task_id(), error = %e, "failed to persist transfer state");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sent under the lock so observers see transitions in order.
    fn transition(&self, shared: &mut Shared, status: DownloadStatus, error: Option<String>) {
        if shared.status == status && error.is_none() {
            return;
        }
        shared.status = status;
        if status != DownloadStatus::Downloading {
            shared.tracker.idle();
        }
        self.emit(SessionEvent::Status { status, error });
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.inner.events {
            let _ = events.send(event);
        }
    }
}

/// Splits `total_size` into `connections` contiguous ranges, the remainder
/// going to the last one. Unknown size, no range support or one connection
/// give a single chunk covering everything.
pub fn plan_chunks(total_size: u64, accepts_ranges: bool, connections: usize) -> Vec<ChunkInfo> {
    let wanted = clamp_connections(connections) as u64;
    if total_size == 0 || !accepts_ranges || wanted == 1 {
        return vec![ChunkInfo::new(0, 0, total_size.saturating_sub(1))];
    }

    // Never more chunks than bytes.
    let count = wanted.min(total_size);
    let part_size = total_size / count;
    (0..count)
        .map(|i| {
            let start = i * part_size;
            let end = if i == count - 1 {
                total_size - 1
            } else {
                (i + 1) * part_size - 1
            };
            ChunkInfo::new(i as usize, start, end)
        })
        .collect()
}

/// A chunk file shorter than its recorded count wins over the record.
async fn reconcile_with_disk(temp_dir: &Path, mut chunks: Vec<ChunkInfo>) -> Vec<ChunkInfo> {
    for chunk in chunks.iter_mut().filter(|c| c.downloaded > 0) {
        let path = temp_dir.join(chunk.file_name());
        let on_disk = fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        if on_disk < chunk.downloaded {
            warn!(
                chunk = chunk.index,
                recorded = chunk.downloaded,
                on_disk,
                "chunk file shorter than recorded, resuming from disk"
            );
            chunk.downloaded = on_disk;
            chunk.completed = false;
        }
    }
    chunks
}

async fn merge_chunks(temp_dir: &Path, chunks: &[ChunkInfo], target: &Path, total_size: u64) -> Result<u64> {
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::io(parent, e))?;
    }

    let mut ordered: Vec<&ChunkInfo> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.index);

    let mut output = File::create(target)
        .await
        .map_err(|e| DownloadError::io(target, e))?;
    let mut buffer = vec![0u8; MERGE_BUFFER];
    let mut written = 0u64;

    for chunk in ordered {
        let path = temp_dir.join(chunk.file_name());
        let input = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && chunk.downloaded == 0 => continue,
            Err(e) => return Err(DownloadError::io(&path, e)),
        };
        let limit = if total_size > 0 { chunk.len() } else { u64::MAX };
        let mut input = input.take(limit);
        loop {
            let n = input
                .read(&mut buffer)
                .await
                .map_err(|e| DownloadError::io(&path, e))?;
            if n == 0 {
                break;
            }
            output
                .write_all(&buffer[..n])
                .await
                .map_err(|e| DownloadError::io(target, e))?;
            written += n as u64;
        }
    }
    output
        .flush()
        .await
        .map_err(|e| DownloadError::io(target, e))?;

    if total_size > 0 && written != total_size {
        return Err(DownloadError::SizeMismatch {
            path: target.to_path_buf(),
            expected: total_size,
            actual: written,
        });
    }
    Ok(written)
}

async fn cleanup(temp_dir: &Path, state_path: &Path) {
    if let Err(e) = fs::remove_dir_all(temp_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %temp_dir.display(), error = %e, "failed to remove chunk directory");
        }
    }
    if let Err(e) = state::remove(state_path).await {
        warn!(error = %e, "failed to remove transfer state");
    }
}

/// Deletes the chunk directory and the state file of `filepath`, plus the
/// target itself when `with_target` is set.
pub async fn discard_files(filepath: &Path, with_target: bool) {
    cleanup(&state::temp_dir(filepath), &state::state_path(filepath)).await;
    if with_target {
        match fs::remove_file(filepath).await {
            Ok(()) => debug!(path = %filepath.display(), "target removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %filepath.display(), error = %e, "failed to remove target"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(chunks: &[ChunkInfo]) -> Vec<(u64, u64)> {
        chunks.iter().map(|c| (c.start, c.end)).collect()
    }

    #[test]
    fn plan_gives_remainder_to_last_chunk() {
        let chunks = plan_chunks(10, true, 3);
        assert_eq!(ranges(&chunks), vec![(0, 2), (3, 5), (6, 9)]);
        assert_eq!(chunks.iter().map(ChunkInfo::len).sum::<u64>(), 10);
        assert!(chunks.iter().enumerate().all(|(i, c)| c.index == i));
    }

    #[test]
    fn plan_falls_back_to_one_chunk() {
        assert_eq!(ranges(&plan_chunks(1000, false, 8)), vec![(0, 999)]);
        assert_eq!(ranges(&plan_chunks(1000, true, 1)), vec![(0, 999)]);
        assert_eq!(ranges(&plan_chunks(0, true, 8)), vec![(0, 0)]);
    }

    #[test]
    fn plan_clamps_connections() {
        assert_eq!(plan_chunks(1 << 20, true, 100).len(), 32);
        assert_eq!(plan_chunks(1 << 20, true, 0).len(), 1);
        assert_eq!(ranges(&plan_chunks(3, true, 8)), vec![(0, 0), (1, 1), (2, 2)]);
    }

    #[tokio::test]
    async fn reconcile_trusts_shorter_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("chunk_0.part"), b"abc").await.unwrap();

        let mut short = ChunkInfo::new(0, 0, 9);
        short.downloaded = 7;
        let mut done = ChunkInfo::new(1, 10, 19);
        done.downloaded = 10;
        done.completed = true;
        let fresh = ChunkInfo::new(2, 20, 29);

        let chunks = reconcile_with_disk(dir.path(), vec![short, done, fresh]).await;
        assert_eq!(chunks[0].downloaded, 3);
        assert_eq!((chunks[1].downloaded, chunks[1].completed), (0, false));
        assert_eq!(chunks[2].downloaded, 0);
    }

    #[tokio::test]
    async fn merge_concatenates_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        let parts = dir.path().join("out.bin.parts");
        tokio::fs::create_dir_all(&parts).await.unwrap();
        tokio::fs::write(parts.join("chunk_0.part"), b"hello ").await.unwrap();
        tokio::fs::write(parts.join("chunk_1.part"), b"world").await.unwrap();

        let mut first = ChunkInfo::new(0, 0, 5);
        first.downloaded = 6;
        let mut second = ChunkInfo::new(1, 6, 10);
        second.downloaded = 5;
        let target = dir.path().join("nested").join("out.bin");

        let written = merge_chunks(&parts, &[second, first], &target, 11).await.unwrap();
        assert_eq!(written, 11);
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn merge_rejects_wrong_total() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("chunk_0.part"), b"abc").await.unwrap();
        let mut chunk = ChunkInfo::new(0, 0, 4);
        chunk.downloaded = 3;
        let err = merge_chunks(dir.path(), &[chunk], &dir.path().join("t"), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::SizeMismatch { actual: 3, .. }));
    }
}
