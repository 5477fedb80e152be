//! Tunables and runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Length of the state register at the head of every shared buffer.
pub const STATE_STORAGE_LENGTH: usize = 100;
/// Offset of the first per-worker flag, right after the writer/reader counts.
pub const START_OFFSET: usize = 1;
pub const MAX_WRITING_WORKERS: u8 = 4;
pub const MAX_READING_WORKERS: u8 = 32;

/// Base poll interval of `wait_to_write`, multiplied by the writer index.
pub const WRITE_WAIT_INTERVAL: Duration = Duration::from_millis(10);
pub const WRITE_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub const QUEUE_TIMEOUT: Duration = Duration::from_secs(5);
pub const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_CAPACITY: usize = 50 * 1_024 * 1_024;
pub const DEFAULT_ROOT_PATH: &str = "data";
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Options of a task [`Queue`](crate::task::Queue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    /// Residency limit of a pending task before it gets evicted and destroyed.
    pub timeout: Duration,
    /// Artificial admission delay.
    pub delay: Duration,
    /// Maximum number of pending tasks, unbounded if `None`.
    pub capacity: Option<usize>,
    /// Grace period for an in-flight task when the queue is destroyed.
    pub timeout_before_destroy: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            timeout: QUEUE_TIMEOUT,
            delay: Duration::ZERO,
            capacity: None,
            timeout_before_destroy: GRACEFUL_TIMEOUT,
        }
    }
}

impl QueueOptions {
    #[inline]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    #[inline]
    pub fn with_delay(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }

    #[inline]
    pub fn with_capacity(self, capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..self
        }
    }

    #[inline]
    pub fn with_timeout_before_destroy(self, timeout_before_destroy: Duration) -> Self {
        Self {
            timeout_before_destroy,
            ..self
        }
    }
}

/// Configuration of a [`WriteWorker`](crate::worker::WriteWorker).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Root directory of the served files.
    pub root_path: PathBuf,
    /// Capacity in bytes of the file content area, the state register excluded.
    pub capacity: usize,
    /// Options of the worker's write queue.
    pub queue: QueueOptions,
    /// Poll interval of the file system watcher, disabled if `None`.
    pub watch_interval: Option<Duration>,
    /// Writer slots of the state register.
    pub writers: u8,
    /// Reader slots of the state register.
    pub readers: u8,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from(DEFAULT_ROOT_PATH),
            capacity: DEFAULT_CAPACITY,
            queue: QueueOptions::default().with_capacity(100),
            watch_interval: None,
            writers: 1,
            readers: MAX_READING_WORKERS,
        }
    }
}

impl WorkerConfig {
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            ..Default::default()
        }
    }

    #[inline]
    pub fn with_capacity(self, capacity: usize) -> Self {
        Self { capacity, ..self }
    }

    #[inline]
    pub fn with_queue(self, queue: QueueOptions) -> Self {
        Self { queue, ..self }
    }

    #[inline]
    pub fn with_workers(self, writers: u8, readers: u8) -> Self {
        Self { writers, readers, ..self }
    }

    #[inline]
    pub fn with_watch_interval(self, interval: Duration) -> Self {
        Self {
            watch_interval: Some(interval),
            ..self
        }
    }
}
