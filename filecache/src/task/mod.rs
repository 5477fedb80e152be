//! This module provides deferred units of work and the queue driving them.
//!
//! A [`Task`] wraps an asynchronous handler and tracks its lifecycle:
//!
//! ```text
//!     ready --execute--> started --+--> done
//!       ^                          +--> error
//!       +----------- reset --------+
//!     (any) --destroy--> destroyed
//! ```
//!
//! Tasks are handed over to a [`Queue`] which executes them one at a time and reports their outcome as [`QueueEvent`]s.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, TryFutureExt};

use crate::error::{BoxError, Error};

mod queue;
pub use queue::*;

/// Opaque unique task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(Arc<str>);

impl TaskId {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string().into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Ready,
    Started,
    Done,
    Error,
    Destroyed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            TaskStatus::Ready => "ready",
            TaskStatus::Started => "started",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
            TaskStatus::Destroyed => "destroyed",
        };

        f.write_str(status)
    }
}

type Handler<A, T> = Box<dyn FnMut(A) -> BoxFuture<'static, Result<T, BoxError>> + Send>;

/// A unit of deferred work.
///
/// `A` is the type of the arguments given on execution (use `()` for none) and `T` the handler's output.
pub struct Task<A, T> {
    id: TaskId,
    handler: Option<Handler<A, T>>,
    status: TaskStatus,
    errors: Vec<Error>,
}

impl<A, T> Task<A, T> {
    /// Create a new `ready` task around `handler`.
    ///
    /// ```
    /// # tokio_test::block_on(async {
    /// # use filecache::task::{Task, TaskStatus};
    /// let mut task = Task::new(|n: u32| async move { Ok::<_, std::io::Error>(n * 2) });
    ///
    /// assert_eq!(task.execute(21).await.unwrap(), 42);
    /// assert_eq!(task.status(), TaskStatus::Done);
    /// # })
    /// ```
    pub fn new<F, Fut, E>(mut handler: F) -> Self
    where
        A: 'static,
        T: 'static,
        F: FnMut(A) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Self {
            id: TaskId::generate(),
            handler: Some(Box::new(move |args| handler(args).err_into::<BoxError>().boxed())),
            status: TaskStatus::Ready,
            errors: Vec::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    #[inline]
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Errors accumulated since creation or the last reset.
    #[inline]
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Run the handler with `args`.
    ///
    /// Only valid from `ready`. A handler failure is recorded, turns the task into `error` and is returned wrapped with the
    /// task id.
    pub async fn execute(&mut self, args: A) -> Result<T, Error> {
        let handler = match (&mut self.handler, self.status) {
            (Some(handler), TaskStatus::Ready) => handler,
            (_, status) => return Err(Error::InvalidTaskStatus(status)),
        };

        tracing::trace!("Executing task {}...", self.id);

        self.status = TaskStatus::Started;

        match handler(args).await {
            Ok(result) => {
                self.status = TaskStatus::Done;
                Ok(result)
            }
            Err(source) => {
                let error = Error::task(self.id.clone(), source);

                self.status = TaskStatus::Error;
                self.errors.push(error.clone());

                Err(error)
            }
        }
    }

    /// Make a finished task executable again.
    pub fn reset(&mut self) {
        if self.status != TaskStatus::Destroyed {
            self.status = TaskStatus::Ready;
            self.errors.clear();
        }
    }

    /// Retire the task for good, releasing its handler.
    pub fn destroy(&mut self) {
        self.handler = None;
        self.errors.clear();
        self.status = TaskStatus::Destroyed;
    }
}

impl<A, T> fmt::Debug for Task<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("errors", &self.errors.len())
            .finish_non_exhaustive()
    }
}
