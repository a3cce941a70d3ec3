//! One byte range of a file, downloaded into its own temp file.

use futures::future::BoxFuture;
use futures::StreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::header::{HeaderMap, RANGE};
use reqwest::Client;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{DownloadError, Result};
use crate::state::ChunkInfo;

pub const BUFFER_SIZE: usize = 64 * 1024;
pub const PAUSE_POLL: Duration = Duration::from_millis(200);

pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;
pub type Sleeper = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

pub fn tokio_sleeper() -> Sleeper {
    Arc::new(|delay| Box::pin(tokio::time::sleep(delay)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Wait after the failed attempt number `attempt` (1-based): `base * 2^attempt`.
    /// Unbounded in `max_attempts`; with the default five attempts the
    /// longest single wait is 16 s.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// Cooperative pause flag shared by all workers of one session.
#[derive(Debug, Clone, Default)]
pub struct PauseToken(Arc<AtomicBool>);

impl PauseToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-task byte-rate cap shared by the workers of one session.
#[derive(Clone)]
pub struct RateCap {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    burst: u32,
}

impl RateCap {
    /// `None` for 0 (unlimited).
    pub fn per_second(bytes: u64) -> Option<Self> {
        let burst = NonZeroU32::new(u32::try_from(bytes).unwrap_or(u32::MAX))?;
        Some(Self {
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(burst))),
            burst: burst.get(),
        })
    }

    /// Writes never ask for more cells than one second of quota.
    fn buffer_size(&self) -> usize {
        BUFFER_SIZE.min(self.burst as usize)
    }
}

#[derive(Debug)]
pub struct ChunkOutcome {
    pub chunk: ChunkInfo,
    pub cancelled: bool,
    pub error: Option<DownloadError>,
}

impl ChunkOutcome {
    pub fn is_complete(&self) -> bool {
        self.chunk.completed && self.error.is_none() && !self.cancelled
    }
}

pub struct ChunkWorker {
    client: Client,
    url: String,
    chunk: ChunkInfo,
    temp_dir: PathBuf,
    headers: HeaderMap,
    open_ended: bool,
    read_timeout: Duration,
    retry: RetryPolicy,
    rate_cap: Option<RateCap>,
    sleeper: Sleeper,
    on_progress: ProgressFn,
    cancel: CancellationToken,
    pause: PauseToken,
}

impl ChunkWorker {
    /// The proxy, if any, is part of `client`.
    pub fn new(client: Client, url: impl Into<String>, chunk: ChunkInfo, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            url: url.into(),
            chunk,
            temp_dir: temp_dir.into(),
            headers: HeaderMap::new(),
            open_ended: false,
            read_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            rate_cap: None,
            sleeper: tokio_sleeper(),
            on_progress: Arc::new(|_| {}),
            cancel: CancellationToken::new(),
            pause: PauseToken::new(),
        }
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Total size unknown: read to EOF instead of stopping at `chunk.end`.
    pub fn open_ended(mut self, open_ended: bool) -> Self {
        self.open_ended = open_ended;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn rate_cap(mut self, cap: Option<RateCap>) -> Self {
        self.rate_cap = cap;
        self
    }

    pub fn sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn on_progress(mut self, on_progress: ProgressFn) -> Self {
        self.on_progress = on_progress;
        self
    }

    pub fn signals(mut self, cancel: CancellationToken, pause: PauseToken) -> Self {
        self.cancel = cancel;
        self.pause = pause;
        self
    }

    pub fn chunk_path(&self) -> PathBuf {
        self.temp_dir.join(self.chunk.file_name())
    }

    pub async fn run(mut self) -> ChunkOutcome {
        let index = self.chunk.index;
        if !self.open_ended && self.chunk.offset() > self.chunk.end {
            self.chunk.completed = true;
            return self.finish(false, None);
        }

        let path = self.chunk_path();
        let mut append = self.chunk.downloaded > 0;
        let mut last_error = None;

        for attempt in 1..=self.retry.max_attempts {
            // Covers the first request and every retry after a backoff.
            if self.wait_while_paused().await.is_err() || self.cancel.is_cancelled() {
                return self.finish(true, None);
            }
            match self.attempt(&path, append).await {
                Ok(()) => {
                    self.chunk.completed = true;
                    debug!(chunk = index, bytes = self.chunk.downloaded, "chunk complete");
                    return self.finish(false, None);
                }
                Err(DownloadError::Cancelled) => return self.finish(true, None),
                Err(e) => {
                    warn!(
                        chunk = index,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        error = %e,
                        "chunk attempt failed"
                    );
                    let again = e.is_retryable() && attempt < self.retry.max_attempts;
                    last_error = Some(e);
                    if !again {
                        break;
                    }
                    let delay = self.retry.delay_for(attempt);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return self.finish(true, None),
                        _ = (self.sleeper)(delay) => {}
                    }
                }
            }
            append = true;
        }
        self.finish(false, last_error)
    }

    fn finish(self, cancelled: bool, error: Option<DownloadError>) -> ChunkOutcome {
        ChunkOutcome {
            chunk: self.chunk,
            cancelled,
            error,
        }
    }

    fn range_header(&self) -> Option<String> {
        let offset = self.chunk.offset();
        if self.open_ended {
            (offset > 0).then(|| format!("bytes={}-", offset))
        } else {
            Some(format!("bytes={}-{}", offset, self.chunk.end))
        }
    }

    async fn attempt(&mut self, path: &Path, append: bool) -> Result<()> {
        let offset = self.chunk.offset();
        let mut request = self.client.get(&self.url).headers(self.headers.clone());
        if let Some(range) = self.range_header() {
            request = request.header(RANGE, range);
        }

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
            response = request.send() => response?,
        };
        match response.status().as_u16() {
            206 => {}
            200 if offset == 0 => {}
            200 => return Err(DownloadError::RangeIgnored { offset }),
            status => {
                return Err(DownloadError::Status {
                    url: self.url.clone(),
                    status,
                })
            }
        }

        let mut file = open_chunk_file(path, append, self.chunk.downloaded).await?;
        let streamed = self.stream_body(response, &mut file, path).await;
        // Flush on every exit so a later attempt or resume sees all counted bytes.
        let flushed = file.flush().await.map_err(|e| DownloadError::io(path, e));
        streamed?;
        flushed?;

        if !self.open_ended && self.chunk.remaining() > 0 {
            return Err(DownloadError::ShortBody {
                expected: self.chunk.len(),
                received: self.chunk.downloaded,
            });
        }
        Ok(())
    }

    async fn stream_body(&mut self, response: reqwest::Response, file: &mut File, path: &Path) -> Result<()> {
        let buffer_size = self
            .rate_cap
            .as_ref()
            .map_or(BUFFER_SIZE, RateCap::buffer_size);
        let mut stream = response.bytes_stream();

        loop {
            self.wait_while_paused().await?;

            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                next = tokio::time::timeout(self.read_timeout, stream.next()) => next,
            };
            let bytes = match next {
                Err(_) => return Err(DownloadError::ReadTimeout(self.read_timeout)),
                Ok(None) => return Ok(()),
                Ok(Some(item)) => item?,
            };

            let mut data: &[u8] = &bytes;
            if !self.open_ended {
                let remaining = self.chunk.remaining();
                if (data.len() as u64) > remaining {
                    data = &data[..remaining as usize];
                }
            }

            for piece in data.chunks(buffer_size) {
                if self.cancel.is_cancelled() {
                    return Err(DownloadError::Cancelled);
                }
                self.throttle(piece.len()).await?;
                self.wait_while_paused().await?;
                file.write_all(piece)
                    .await
                    .map_err(|e| DownloadError::io(path, e))?;
                let n = piece.len() as u64;
                self.chunk.downloaded += n;
                (self.on_progress)(n);
            }

            if !self.open_ended && self.chunk.remaining() == 0 {
                return Ok(());
            }
        }
    }

    async fn wait_while_paused(&self) -> Result<()> {
        while self.pause.is_paused() {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                _ = tokio::time::sleep(PAUSE_POLL) => {}
            }
        }
        Ok(())
    }

    async fn throttle(&self, len: usize) -> Result<()> {
        let Some(cap) = &self.rate_cap else {
            return Ok(());
        };
        let Some(cells) = NonZeroU32::new(len as u32) else {
            return Ok(());
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(DownloadError::Cancelled),
            ready = cap.limiter.until_n_ready(cells) => {
                if let Err(e) = ready {
                    debug!(error = %e, "rate cap smaller than buffer, not throttled");
                }
                Ok(())
            }
        }
    }
}

/// Truncates for a fresh chunk; for a resumed one keeps exactly the counted
/// bytes and positions at the end.
async fn open_chunk_file(path: &Path, append: bool, downloaded: u64) -> Result<File> {
    if !append {
        return File::create(path)
            .await
            .map_err(|e| DownloadError::io(path, e));
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    let on_disk = file
        .metadata()
        .await
        .map_err(|e| DownloadError::io(path, e))?
        .len();
    if on_disk > downloaded {
        file.set_len(downloaded)
            .await
            .map_err(|e| DownloadError::io(path, e))?;
    }
    file.seek(SeekFrom::End(0))
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..policy.max_attempts)
            .map(|a| policy.delay_for(a).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 16]);
        assert_eq!(policy.delay_for(40), Duration::from_secs(u32::MAX as u64));
    }

    #[test]
    fn pause_token_is_shared_between_clones() {
        let token = PauseToken::new();
        let worker_view = token.clone();
        token.pause();
        assert!(worker_view.is_paused());
        token.resume();
        assert!(!worker_view.is_paused());
    }

    #[test]
    fn rate_cap_bounds_the_write_size() {
        assert!(RateCap::per_second(0).is_none());
        assert_eq!(RateCap::per_second(1024).unwrap().buffer_size(), 1024);
        assert_eq!(RateCap::per_second(10 << 20).unwrap().buffer_size(), BUFFER_SIZE);
    }

    #[tokio::test]
    async fn resumed_chunk_file_drops_uncounted_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunk_0.part");
        tokio::fs::write(&path, b"abcdefgh").await.unwrap();

        let mut file = open_chunk_file(&path, true, 5).await.unwrap();
        file.write_all(b"XY").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"abcdeXY");
    }
}
