//! Multi-connection download engine with resumable chunked transfers and an
//! admission-controlled queue.

pub mod config;
pub mod error;
pub mod naming;
pub mod probe;
pub mod progress;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod store;
pub mod task;
pub mod worker;

pub use config::EngineConfig;
pub use error::{DownloadError, Result};
pub use scheduler::{AddRequest, QueueScheduler};
pub use session::{DownloadSession, SessionEvent, SessionOutcome, SessionRequest};
pub use store::{JsonStore, TaskStore};
pub use task::{DownloadStatus, DownloadTask, TaskPatch};
