use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// At most five notifications per second.
pub const NOTIFY_INTERVAL: Duration = Duration::from_millis(200);
pub const SPEED_WINDOW: Duration = Duration::from_secs(3);
const MIN_WINDOW_SECS: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Progress {
    pub downloaded: u64,
    pub total: u64,
    /// Bytes per second over the sliding window.
    pub speed: f64,
    /// Seconds, 0 when unknown.
    pub eta: u64,
}

/// Byte accumulator of one session: total counter plus a sliding window of
/// `(instant, bytes)` samples for the instantaneous speed.
#[derive(Debug)]
pub struct ProgressTracker {
    downloaded: u64,
    total: u64,
    speed: f64,
    unsampled: u64,
    samples: VecDeque<(Instant, u64)>,
    last_notify: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(total: u64, downloaded: u64) -> Self {
        Self {
            downloaded,
            total,
            speed: 0.0,
            unsampled: 0,
            samples: VecDeque::new(),
            last_notify: None,
        }
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn set_total(&mut self, total: u64) {
        self.total = total;
    }

    /// Adds freshly written bytes; returns a snapshot when a notification is due.
    pub fn record(&mut self, bytes: u64, now: Instant) -> Option<Progress> {
        self.downloaded += bytes;
        self.unsampled += bytes;

        let due = self
            .last_notify
            .map_or(true, |last| now.saturating_duration_since(last) >= NOTIFY_INTERVAL);
        if !due {
            return None;
        }

        self.samples.push_back((now, self.unsampled));
        self.unsampled = 0;
        while let Some(&(at, _)) = self.samples.front() {
            if now.saturating_duration_since(at) > SPEED_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        let in_window: u64 = self.samples.iter().map(|(_, b)| b).sum();
        let elapsed = match self.samples.front() {
            Some(&(first, _)) if self.samples.len() > 1 => {
                now.saturating_duration_since(first).as_secs_f64()
            }
            _ => 1.0,
        };
        self.speed = in_window as f64 / elapsed.max(MIN_WINDOW_SECS);
        self.last_notify = Some(now);
        Some(self.snapshot())
    }

    pub fn snapshot(&self) -> Progress {
        let remaining = self.total.saturating_sub(self.downloaded);
        let eta = if self.speed > 0.0 {
            (remaining as f64 / self.speed) as u64
        } else {
            0
        };
        Progress {
            downloaded: self.downloaded,
            total: self.total,
            speed: self.speed,
            eta,
        }
    }

    /// Zeroes the speed once transfers stop (paused, finished).
    pub fn idle(&mut self) {
        self.speed = 0.0;
        self.samples.clear();
        self.unsampled = 0;
    }
}
