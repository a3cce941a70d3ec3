#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fdl::worker::Sleeper;
use fdl::EngineConfig;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Deterministic, non-repeating-per-chunk bytes.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        persist_interval: Duration::from_millis(50),
        scheduler_tick: Duration::from_millis(50),
        ..EngineConfig::default()
    }
}

/// Serves `Range: bytes=a-b` and `bytes=a-` slices of `body` with 206, and
/// the full body with 200 otherwise.
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
    delay: Duration,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

fn parse_range(header: &str, total: usize) -> Option<(usize, usize)> {
    let range = header.strip_prefix("bytes=")?;
    let (start, end) = range.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let last = total.checked_sub(1)?;
    let end = if end.is_empty() {
        last
    } else {
        end.parse::<usize>().ok()?.min(last)
    };
    (start <= end).then_some((start, end))
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len();
        let range = request
            .headers
            .get("Range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_range(v, total));
        let template = match range {
            Some((start, end)) => ResponseTemplate::new(206)
                .append_header("Content-Range", format!("bytes {}-{}/{}", start, end, total))
                .set_body_bytes(self.body[start..=end].to_vec()),
            None => ResponseTemplate::new(200).set_body_bytes(self.body.to_vec()),
        };
        template.set_delay(self.delay)
    }
}

pub async fn mount_head(server: &MockServer, file: &str, len: usize, ranges: bool) {
    let mut template = ResponseTemplate::new(200).append_header("Content-Length", len.to_string());
    if ranges {
        template = template.append_header("Accept-Ranges", "bytes");
    }
    Mock::given(method("HEAD"))
        .and(path(file))
        .respond_with(template)
        .mount(server)
        .await;
}

/// HEAD advertising ranges plus a range-aware GET for `file`.
pub async fn mount_file(server: &MockServer, file: &str, body: &[u8], delay: Duration) {
    mount_head(server, file, body.len(), true).await;
    Mock::given(method("GET"))
        .and(path(file))
        .respond_with(RangeResponder::new(body.to_vec()).delayed(delay))
        .mount(server)
        .await;
}

pub async fn range_headers(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == "GET")
        .filter_map(|r| r.headers.get("Range").and_then(|v| v.to_str().ok()).map(String::from))
        .collect()
}

pub fn recording_sleeper() -> (Sleeper, Arc<Mutex<Vec<Duration>>>) {
    let delays = Arc::new(Mutex::new(Vec::new()));
    let recorded = delays.clone();
    let sleeper: Sleeper = Arc::new(move |delay| {
        recorded.lock().unwrap().push(delay);
        Box::pin(async {})
    });
    (sleeper, delays)
}

/// Polls `check` every 20 ms for up to `timeout`.
pub async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
