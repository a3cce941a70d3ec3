use std::path::PathBuf;
use std::time::Duration;

use crate::worker::RetryPolicy;

pub const SETTING_MAX_CONCURRENT: &str = "max_concurrent";
pub const SETTING_DEFAULT_CONNECTIONS: &str = "default_connections";

pub const MIN_CONNECTIONS: usize = 1;
pub const MAX_CONNECTIONS: usize = 32;

/// Knobs shared by the scheduler, every session and every chunk worker.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub user_agent: String,
    pub connect_timeout: Duration,
    /// Longest silence tolerated between two body frames.
    pub read_timeout: Duration,
    pub probe_timeout: Duration,
    pub proxy: Option<String>,
    pub persist_interval: Duration,
    pub scheduler_tick: Duration,
    pub retry: RetryPolicy,
    pub download_dir: PathBuf,
    pub default_connections: usize,
    pub max_concurrent: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("fdl/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(15),
            proxy: None,
            persist_interval: Duration::from_secs(3),
            scheduler_tick: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            download_dir: PathBuf::from("downloads"),
            default_connections: 8,
            max_concurrent: 3,
        }
    }
}

impl EngineConfig {
    /// Builds the HTTP client every request of the engine goes through.
    pub fn build_client(&self) -> crate::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .connect_timeout(self.connect_timeout);
        if let Some(proxy) = &self.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(builder.build()?)
    }
}

pub fn clamp_connections(connections: usize) -> usize {
    connections.clamp(MIN_CONNECTIONS, MAX_CONNECTIONS)
}
