use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::task::TaskId;

/// Boxed error returned by task handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Worker role, used to qualify index errors on the state register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Writer,
    Reader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Writer => f.write_str("writer"),
            Role::Reader => f.write_str("reader"),
        }
    }
}

/// What timed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timeout {
    /// Readers did not drain before a writer could proceed.
    WaitToWrite { worker: u8 },
    /// A writer kept writing while a reader wanted to proceed.
    WaitToRead { worker: u8 },
    /// A task was evicted from its queue before it ran.
    Queued { task_id: TaskId },
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeout::WaitToWrite { worker } => write!(f, "writer {worker} timed out waiting for readers to drain"),
            Timeout::WaitToRead { worker } => write!(f, "reader {worker} timed out waiting for writers to finish"),
            Timeout::Queued { task_id } => write!(f, "task {task_id} expired before being executed"),
        }
    }
}

/// Crate error.
///
/// Errors are cheaply cloneable so that a single failure can be broadcast to every listener of a queue.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid {role} index {index}, expected 1..={max}")]
    IndexOutOfRange { role: Role, index: u8, max: u8 },
    #[error("capacity exceeded: {requested} bytes requested, {available} available")]
    CapacityExceeded { requested: usize, available: usize },
    #[error("the path `{0}` is in use")]
    DuplicatePath(String),
    #[error("the file `{0}` not found")]
    NotFound(String),
    #[error("timeout: {0}")]
    Timeout(Timeout),
    #[error("already destroyed")]
    Destroyed,
    #[error("invalid task status: {0}")]
    InvalidTaskStatus(crate::task::TaskStatus),
    #[error("task {task_id} failed: {source}")]
    Task {
        task_id: TaskId,
        #[source]
        source: SharedError,
    },
    #[error(transparent)]
    Io(Arc<io::Error>),
}

impl From<io::Error> for Error {
    #[inline]
    fn from(error: io::Error) -> Self {
        Error::Io(Arc::new(error))
    }
}

impl Error {
    /// Id of the task this error was raised for, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Error::Task { task_id, .. } | Error::Timeout(Timeout::Queued { task_id }) => Some(task_id),
            _ => None,
        }
    }

    /// Innermost crate error wrapped by a failed task, if the handler returned one.
    pub fn cause(&self) -> &Error {
        match self {
            Error::Task { source, .. } => source.downcast_ref::<Error>().map_or(self, Error::cause),
            _ => self,
        }
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self.cause(), Error::NotFound(_))
    }

    pub(crate) fn task(task_id: TaskId, source: BoxError) -> Self {
        Error::Task {
            task_id,
            source: Arc::from(source),
        }
    }
}
