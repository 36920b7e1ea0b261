//! # Runtime Settings
//!
//! `TileConfig` is built once by the application, wrapped in an `Arc` and
//! handed to every backend through the [`TileContext`](crate::TileContext).
//! Backends only read it.
//!
//! ```ignore
//! let config = TileConfig::default()
//!     .with_queue_size_limit(8 * 1024 * 1024)
//!     .with_swap_dir("/var/tmp/tiles")
//!     .with_lock_timeout(Some(Duration::from_secs(5)));
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use super::constants::{
    DEFAULT_LOCK_POLL_INTERVAL, DEFAULT_QUEUE_SIZE_LIMIT, ENV_QUEUE_SIZE, ENV_SWAP_DIR,
};
use crate::error::IoFailurePolicy;

#[derive(Debug, Clone)]
pub struct TileConfig {
    /// Bytes of queued write payload allowed before `enqueue` blocks.
    pub queue_size_limit: usize,
    /// Directory holding the per-process shared swap file.
    pub swap_dir: PathBuf,
    /// Sleep between header re-reads while another process holds the lock.
    pub lock_poll_interval: Duration,
    /// Give up waiting for a foreign lock after this long. `None` waits forever.
    pub lock_timeout: Option<Duration>,
    /// What happens when a read or a queued write fails.
    pub io_failure_policy: IoFailurePolicy,
    /// Hard ceiling on the size of any backing file.
    pub max_file_size: Option<u64>,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            queue_size_limit: DEFAULT_QUEUE_SIZE_LIMIT,
            swap_dir: std::env::temp_dir(),
            lock_poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
            lock_timeout: None,
            io_failure_policy: IoFailurePolicy::default(),
            max_file_size: None,
        }
    }
}

impl TileConfig {
    /// Defaults overridden by `TILEBUF_SWAP` and `TILEBUF_QUEUE_SIZE`.
    ///
    /// An unparsable queue size is logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(dir) = std::env::var_os(ENV_SWAP_DIR) {
            config.swap_dir = PathBuf::from(dir);
        }

        if let Ok(raw) = std::env::var(ENV_QUEUE_SIZE) {
            match raw.trim().parse::<usize>() {
                Ok(limit) => config.queue_size_limit = limit,
                Err(e) => warn!(value = %raw, error = %e, "ignoring invalid {}", ENV_QUEUE_SIZE),
            }
        }

        config
    }

    pub fn with_queue_size_limit(mut self, bytes: usize) -> Self {
        self.queue_size_limit = bytes;
        self
    }

    pub fn with_swap_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.swap_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_io_failure_policy(mut self, policy: IoFailurePolicy) -> Self {
        self.io_failure_policy = policy;
        self
    }

    pub fn with_max_file_size(mut self, bytes: Option<u64>) -> Self {
        self.max_file_size = bytes;
        self
    }
}
