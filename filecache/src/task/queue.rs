use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use futures::future::{AbortHandle, Abortable};
use tokio::sync::Notify;

use super::{Task, TaskId};
use crate::config::QueueOptions;
use crate::error::{Error, Timeout};
use crate::events::{Emitter, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Ready,
    Running,
    Destroyed,
}

/// Notifications published by a [`Queue`].
#[derive(Debug, Clone)]
pub enum QueueEvent<T> {
    /// A task was dropped because the queue reached its capacity.
    Full,
    /// `next` was called on an empty queue.
    Empty,
    /// A task is about to be executed.
    Next(TaskId),
    /// A task completed successfully.
    Complete { task_id: TaskId, result: T },
    /// A task failed or expired. The error identifies the task through [`Error::task_id`].
    Error(Error),
}

/// Outcome of [`Queue::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a dropped task is neither executed nor destroyed"]
pub enum Admission {
    Queued,
    /// The queue was full or destroyed, the task has been released.
    Dropped,
}

struct State<A, T> {
    /// Pending tasks, drained from the tail.
    tasks: Vec<Task<A, T>>,
    current: Option<(TaskId, AbortHandle)>,
    status: QueueStatus,
    /// Whether a `start` loop is currently driving the queue.
    driving: bool,
    /// Whether `full` has already been emitted for the current capacity-reached transition.
    full: bool,
}

struct Shared<A, T> {
    options: QueueOptions,
    state: Mutex<State<A, T>>,
    events: Emitter<QueueEvent<T>>,
    /// Notified whenever the current task is released.
    idle: Notify,
}

/// A bounded, serialized, cancellable task worklist.
///
/// At most one task is executed at a time. Pending tasks are drained most-recently-added first. Each admitted task is
/// automatically evicted and destroyed once it stayed `timeout` in the queue, whether or not it has run.
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use filecache::config::QueueOptions;
/// # use filecache::task::{Admission, Queue, QueueEvent, Task};
/// let queue = Queue::new(QueueOptions::default());
/// let mut events = queue.subscribe();
///
/// for i in 0..3 {
///     let admission = queue.add(Task::new(move |()| async move { Ok::<_, std::io::Error>(i) })).await;
///     assert_eq!(admission, Admission::Queued);
/// }
///
/// queue.start(()).await;
///
/// while let Some(event) = events.try_recv() {
///     if let QueueEvent::Complete { result, .. } = event {
///         println!("Task #{result} completed!");
///     }
/// }
/// # })
/// ```
/// ```text
/// Task #2 completed!
/// Task #1 completed!
/// Task #0 completed!
/// ```
pub struct Queue<A, T> {
    shared: Arc<Shared<A, T>>,
}

impl<A, T> Clone for Queue<A, T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<A, T> fmt::Debug for Queue<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock().unwrap();

        f.debug_struct("Queue")
            .field("options", &self.shared.options)
            .field("size", &state.tasks.len())
            .field("status", &state.status)
            .field("current", &state.current.as_ref().map(|(id, _)| id))
            .finish()
    }
}

impl<A, T> Queue<A, T>
where
    A: Send + 'static,
    T: Clone + Send + 'static,
{
    pub fn new(options: QueueOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                state: Mutex::new(State {
                    tasks: Vec::new(),
                    current: None,
                    status: QueueStatus::Ready,
                    driving: false,
                    full: false,
                }),
                events: Emitter::new(),
                idle: Notify::new(),
            }),
        }
    }

    #[inline]
    pub fn options(&self) -> &QueueOptions {
        &self.shared.options
    }

    /// Number of pending tasks, the current one excluded.
    pub fn size(&self) -> usize {
        self.shared.state.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_full(&self) -> bool {
        self.shared.is_full(self.size())
    }

    pub fn status(&self) -> QueueStatus {
        self.shared.state.lock().unwrap().status
    }

    /// Id of the task being executed, if any.
    pub fn current_task(&self) -> Option<TaskId> {
        self.shared.state.lock().unwrap().current.as_ref().map(|(id, _)| id.clone())
    }

    /// Listen to the queue notifications.
    ///
    /// The subscription ends once the queue is destroyed.
    #[inline]
    pub fn subscribe(&self) -> Subscription<QueueEvent<T>> {
        self.shared.events.subscribe()
    }

    /// Number of live subscriptions.
    #[inline]
    pub fn listener_count(&self) -> usize {
        self.shared.events.listener_count()
    }

    /// Admit `task` after the configured delay.
    ///
    /// When the queue is full or destroyed, the task is dropped: it is neither executed nor destroyed, and the caller only
    /// learns about it through the returned [`Admission`] (plus a single `full` notification per capacity-reached
    /// transition).
    pub async fn add(&self, task: Task<A, T>) -> Admission {
        if !self.shared.options.delay.is_zero() {
            tokio::time::sleep(self.shared.options.delay).await;
        }

        let mut state = self.shared.state.lock().unwrap();

        if state.status == QueueStatus::Destroyed {
            tracing::debug!("Dropping task {} sent to a destroyed queue.", task.id());
            return Admission::Dropped;
        }

        if self.shared.is_full(state.tasks.len()) {
            tracing::warn!("Queue is full, dropping task {}.", task.id());

            if !state.full {
                state.full = true;
                self.shared.events.emit(QueueEvent::Full);
            }

            return Admission::Dropped;
        }

        let task_id = task.id().clone();
        state.tasks.push(task);
        drop(state);

        tracing::trace!("Queued task {task_id}.");

        let shared = Arc::downgrade(&self.shared);
        let timeout = self.shared.options.timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            if let Some(shared) = Weak::upgrade(&shared) {
                shared.evict(&task_id);
            }
        });

        Admission::Queued
    }

    /// Execute the most recently added task with `args`.
    ///
    /// Returns immediately if the queue is empty, destroyed or already executing a task. Handler failures are emitted as
    /// `error` notifications and never returned.
    pub async fn next(&self, args: A) {
        let (mut task, registration) = {
            let mut state = self.shared.state.lock().unwrap();

            if state.status == QueueStatus::Destroyed || state.current.is_some() {
                return;
            }

            match state.tasks.pop() {
                Some(task) => {
                    let (handle, registration) = AbortHandle::new_pair();

                    state.current = Some((task.id().clone(), handle));
                    state.full = false;

                    (task, registration)
                }
                None => {
                    if state.status == QueueStatus::Running {
                        state.status = QueueStatus::Ready;
                    }
                    drop(state);

                    self.shared.events.emit(QueueEvent::Empty);
                    return;
                }
            }
        };

        let task_id = task.id().clone();

        self.shared.events.emit(QueueEvent::Next(task_id.clone()));

        match Abortable::new(task.execute(args), registration).await {
            Ok(Ok(result)) => {
                self.shared.events.emit(QueueEvent::Complete { task_id, result });
            }
            Ok(Err(error)) => {
                tracing::debug!("Task {task_id} failed: {error}");

                self.shared.events.emit(QueueEvent::Error(error));
            }
            Err(_) => {
                tracing::warn!("Task {task_id} abandoned.");
            }
        }

        task.destroy();

        {
            let mut state = self.shared.state.lock().unwrap();

            state.current = None;

            if state.tasks.is_empty() && state.status == QueueStatus::Running {
                state.status = QueueStatus::Ready;
            }
        }

        self.shared.idle.notify_waiters();
    }

    /// Drive the queue, executing tasks with `args` until it is drained or stopped.
    ///
    /// If the queue is already driven, it only gets (re)marked as running and the active driver keeps going.
    pub async fn start(&self, args: A)
    where
        A: Clone,
    {
        {
            let mut state = self.shared.state.lock().unwrap();

            if state.status == QueueStatus::Destroyed {
                return;
            }

            state.status = QueueStatus::Running;

            if state.driving {
                return;
            }

            state.driving = true;
        }

        tracing::debug!("Starting queue...");

        loop {
            {
                let mut state = self.shared.state.lock().unwrap();

                if state.status != QueueStatus::Running {
                    state.driving = false;
                    break;
                }
            }

            self.next(args.clone()).await;
        }

        tracing::debug!("Queue drained.");
    }

    /// Admit `task`, drive the queue with `args` in the background if idle, and wait for the task outcome.
    ///
    /// The returned error is the one emitted for this task, or:
    /// - [`Error::CapacityExceeded`] if the task was dropped because the queue is full,
    /// - [`Error::Destroyed`] if the queue is destroyed before the task completes, or was already.
    pub async fn submit(&self, task: Task<A, T>, args: A) -> Result<T, Error>
    where
        A: Clone,
    {
        // subscribe before admission, the outcome could be emitted before this future is polled again
        let mut events = self.subscribe();
        let task_id = task.id().clone();

        if self.add(task).await == Admission::Dropped {
            return Err(match self.status() {
                QueueStatus::Destroyed => Error::Destroyed,
                _ => Error::CapacityExceeded {
                    requested: self.size() + 1,
                    available: self.shared.options.capacity.unwrap_or(usize::MAX),
                },
            });
        }

        if self.status() == QueueStatus::Ready {
            let queue = self.clone();

            tokio::spawn(async move { queue.start(args).await });
        }

        let outcome = events
            .find_map(|event| match event {
                QueueEvent::Complete { task_id: id, result } if id == task_id => Some(Ok(result)),
                QueueEvent::Error(error) if error.task_id() == Some(&task_id) => Some(Err(error)),
                _ => None,
            })
            .await;

        outcome.unwrap_or(Err(Error::Destroyed))
    }

    /// Mark the queue as ready and wait for the current task, if any, to finish.
    ///
    /// A running task cannot be cancelled, only awaited.
    pub async fn stop(&self) {
        let notified = self.shared.idle.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        {
            let mut state = self.shared.state.lock().unwrap();

            if state.status != QueueStatus::Destroyed {
                state.status = QueueStatus::Ready;
            }

            if state.current.is_none() {
                return;
            }
        }

        notified.await;
    }

    /// Irreversibly destroy the queue.
    ///
    /// An in-flight task is given `timeout_before_destroy` to finish, after which it is abandoned. Every pending task is
    /// destroyed and every subscription is released.
    pub async fn destroy(&self) {
        let busy = {
            let state = self.shared.state.lock().unwrap();

            state.status != QueueStatus::Destroyed && (state.status == QueueStatus::Running || state.current.is_some())
        };

        if busy {
            tokio::select! {
                _ = self.stop() => {}
                _ = tokio::time::sleep(self.shared.options.timeout_before_destroy) => {
                    if let Some((task_id, handle)) = &self.shared.state.lock().unwrap().current {
                        tracing::warn!("Grace period elapsed, abandoning task {task_id}.");
                        handle.abort();
                    }
                }
            }
        }

        {
            let mut state = self.shared.state.lock().unwrap();

            for mut task in state.tasks.drain(..) {
                task.destroy();
            }

            state.status = QueueStatus::Destroyed;
        }

        self.shared.events.clear();
        self.shared.idle.notify_waiters();

        tracing::debug!("Queue destroyed.");
    }
}

impl<A, T: Clone> Shared<A, T> {
    #[inline]
    fn is_full(&self, size: usize) -> bool {
        self.options.capacity.is_some_and(|capacity| size >= capacity)
    }

    /// Remove and destroy a task that outlived its residency limit.
    fn evict(&self, task_id: &TaskId) {
        let mut state = self.state.lock().unwrap();

        if let Some(index) = state.tasks.iter().position(|task| task.id() == task_id) {
            let mut task = state.tasks.remove(index);
            task.destroy();
            state.full = false;
            drop(state);

            tracing::warn!("Task {task_id} expired before being executed.");

            self.events.emit(QueueEvent::Error(Error::Timeout(Timeout::Queued {
                task_id: task_id.clone(),
            })));
        }
    }
}
