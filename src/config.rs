//! Construction options for a [`crate::scheduler::Scheduler`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_db_name() -> String {
    "queue.db".to_string()
}

fn default_group_parallelism() -> usize {
    1
}

fn default_cleanup_interval() -> u64 {
    1000
}

/// Mirrors the `TaskManagerOpts` pattern this codebase uses for its other
/// embedded-store components: a plain, serde-friendly options struct with
/// sensible defaults, independent of how the caller assembles it (CLI,
/// config file, or plain Rust construction).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOpts {
    /// Directory holding the database file. `None` means in-memory,
    /// non-persistent, non-resumable.
    pub path: Option<PathBuf>,

    /// Filename within `path`.
    #[serde(default = "default_db_name")]
    pub db_name: String,

    /// Reopen an existing database instead of recreating it.
    pub resume: bool,

    /// Insertion-order tiebreak: LIFO instead of FIFO.
    pub lifo: bool,

    /// Maximum number of concurrently in-flight jobs per group.
    #[serde(default = "default_group_parallelism")]
    pub group_parallelism: usize,

    /// Seconds of post-completion delay enforced per group. 0 disables it.
    pub throttle: f64,

    /// Number of `task_done` calls between inline vacuum/cleanup passes.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
}

impl Default for QueueOpts {
    fn default() -> Self {
        Self {
            path: None,
            db_name: default_db_name(),
            resume: false,
            lifo: false,
            group_parallelism: default_group_parallelism(),
            throttle: 0.0,
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

impl QueueOpts {
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn resuming(mut self) -> Self {
        self.resume = true;
        self
    }

    pub fn lifo(mut self) -> Self {
        self.lifo = true;
        self
    }

    pub fn with_group_parallelism(mut self, n: usize) -> Self {
        self.group_parallelism = n;
        self
    }

    pub fn with_throttle(mut self, seconds: f64) -> Self {
        self.throttle = seconds;
        self
    }

    pub fn with_cleanup_interval(mut self, n: u64) -> Self {
        self.cleanup_interval = n;
        self
    }
}
