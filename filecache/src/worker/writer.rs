use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use futures::future::{AbortHandle, Abortable};

use super::{Published, Worker, WorkerEvent, WorkerStatus};
use crate::config::{WorkerConfig, STATE_STORAGE_LENGTH};
use crate::error::{Error, Result};
use crate::events::{Emitter, Subscription};
use crate::memory::{ActiveWrite, AddressMap, PendingWrite, SharedBuffer, WorkerStateRegister};
use crate::storage::{FileEvent, FileObject, FileSystemStorage};
use crate::task::{Queue, Task};

/// Slot of the write worker in the state register.
const WRITER_INDEX: u8 = 1;

#[derive(Debug)]
struct Inner {
    config: WorkerConfig,
    storage: FileSystemStorage,
    buffer: Arc<SharedBuffer>,
    register: WorkerStateRegister,
    /// Serializes every update of the buffer.
    queue: Queue<(), String>,
    map: tokio::sync::Mutex<AddressMap>,
    status: Mutex<WorkerStatus>,
    events: Emitter<WorkerEvent>,
    /// Task applying the storage changes detected while watching.
    follower: Mutex<Option<AbortHandle>>,
}

/// The worker owning the file system storage and filling the shared buffer.
///
/// The buffer is filled once on [`start`](Worker::start), smallest files first, until its capacity is reached. Files
/// written afterwards are appended in place while they fit. Otherwise, and whenever a cached file changes or gets deleted
/// out of band, the whole buffer is rebuilt from disk once readers have drained.
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use filecache::config::WorkerConfig;
/// # use filecache::worker::{Worker, WorkerEvent, WriteWorker};
/// let root = tempfile::tempdir().unwrap();
/// std::fs::write(root.path().join("a.txt"), "hi").unwrap();
///
/// let worker = WriteWorker::new(WorkerConfig::new(root.path()).with_capacity(1_024)).unwrap();
/// let mut events = worker.subscribe();
///
/// worker.start().await.unwrap();
///
/// if let Some(WorkerEvent::Start(published)) = events.recv().await {
///     assert_eq!(published.address_map.get_file_address("a.txt"), Some(0..2));
/// }
/// # })
/// ```
#[derive(Debug, Clone)]
pub struct WriteWorker {
    inner: Arc<Inner>,
}

impl WriteWorker {
    /// Create a write worker over an anonymous buffer, shareable within this process.
    pub fn new(config: WorkerConfig) -> Result<Self> {
        let buffer = SharedBuffer::anonymous(STATE_STORAGE_LENGTH + config.capacity)?;

        Self::with_buffer(config, Arc::new(buffer))
    }

    /// Create a write worker over a buffer file at `path`, which other processes can [`open`](SharedBuffer::open).
    pub fn create(config: WorkerConfig, path: impl AsRef<Path>) -> Result<Self> {
        let buffer = SharedBuffer::create(path, STATE_STORAGE_LENGTH + config.capacity)?;

        Self::with_buffer(config, Arc::new(buffer))
    }

    fn with_buffer(config: WorkerConfig, buffer: Arc<SharedBuffer>) -> Result<Self> {
        let register = WorkerStateRegister::with_buffer(Arc::clone(&buffer), config.writers, config.readers)?;

        Ok(Self {
            inner: Arc::new(Inner {
                storage: FileSystemStorage::new(&config.root_path),
                buffer,
                register,
                queue: Queue::new(config.queue.clone()),
                map: tokio::sync::Mutex::new(AddressMap::new(config.capacity)),
                status: Mutex::new(WorkerStatus::Ready),
                events: Emitter::new(),
                follower: Mutex::new(None),
                config,
            }),
        })
    }

    #[inline]
    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    #[inline]
    pub fn storage(&self) -> &FileSystemStorage {
        &self.inner.storage
    }

    #[inline]
    pub fn register(&self) -> &WorkerStateRegister {
        &self.inner.register
    }

    #[inline]
    pub fn buffer(&self) -> &Arc<SharedBuffer> {
        &self.inner.buffer
    }

    /// The buffer and its current address map, for readers to attach to.
    pub async fn published(&self) -> Published {
        Published {
            address_map: self.inner.map.lock().await.clone(),
            buffer: Arc::clone(&self.inner.buffer),
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        match self.status() {
            WorkerStatus::Destroyed => Err(Error::Destroyed),
            _ => Ok(()),
        }
    }

    /// Write a new file to the storage, cache it and return the relative path it was actually stored at.
    ///
    /// A file too large for the remaining capacity, even after a rebuild, is stored on disk only.
    pub async fn write_file(&self, relative_path: &str, content: Bytes) -> Result<String> {
        self.ensure_alive()?;

        let task = {
            let inner = Arc::clone(&self.inner);
            let relative_path = relative_path.to_owned();

            Task::new(move |()| {
                let inner = Arc::clone(&inner);
                let relative_path = relative_path.clone();
                let content = content.clone();

                async move { inner.store(&relative_path, content).await }
            })
        };

        self.inner.queue.submit(task, ()).await.map_err(|error| error.cause().clone())
    }

    /// Apply the storage changes to the buffer, in the background.
    fn follow(&self) {
        let mut follower = self.inner.follower.lock().unwrap();

        if follower.is_some() {
            return;
        }

        let (handle, registration) = AbortHandle::new_pair();
        let events = self.inner.storage.subscribe();

        tokio::spawn(Abortable::new(Self::forward(Arc::downgrade(&self.inner), events), registration));

        *follower = Some(handle);
    }

    fn unfollow(&self) {
        if let Some(handle) = self.inner.follower.lock().unwrap().take() {
            handle.abort();
        }
    }

    async fn forward(inner: Weak<Inner>, mut events: Subscription<FileEvent>) {
        while let Some(event) = events.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };

            let task = {
                let inner = Arc::clone(&inner);

                Task::new(move |()| {
                    let inner = Arc::clone(&inner);
                    let event = event.clone();

                    async move { inner.refresh(event).await }
                })
            };

            if let Err(error) = inner.queue.submit(task, ()).await {
                let error = error.cause().clone();

                tracing::warn!("Failed to apply a storage change: {error}");

                inner.events.emit(WorkerEvent::Error(error));
            }
        }
    }
}

impl Worker for WriteWorker {
    /// Fill the buffer with the files of the storage and publish it.
    async fn start(&self) -> Result<()> {
        match self.status() {
            WorkerStatus::Destroyed => return Err(Error::Destroyed),
            WorkerStatus::Running => return Ok(()),
            WorkerStatus::Ready => {}
        }

        tracing::debug!("Starting write worker: `{}`", self.inner.config.root_path.display());

        let published = {
            let mut map = self.inner.map.lock().await;

            let pending = self.inner.register.begin_write(WRITER_INDEX)?;
            let (rebuilt, _active) = self.inner.rebuild(pending).await?;
            *map = rebuilt;

            Published {
                address_map: map.clone(),
                buffer: Arc::clone(&self.inner.buffer),
            }
        };

        {
            let mut status = self.inner.status.lock().unwrap();

            if *status == WorkerStatus::Destroyed {
                return Err(Error::Destroyed);
            }

            *status = WorkerStatus::Running;
        }

        if let Some(interval) = self.inner.config.watch_interval {
            self.follow();
            self.inner.storage.watch(interval);
        }

        tracing::debug!(
            "Write worker started with {} files ({} bytes).",
            published.address_map.len(),
            published.address_map.size()
        );

        self.inner.events.emit(WorkerEvent::Start(published));

        Ok(())
    }

    /// Stop watching the storage and wait for the in-flight update, if any.
    async fn stop(&self) -> Result<()> {
        self.ensure_alive()?;

        self.inner.storage.stop_watch();
        self.unfollow();
        self.inner.queue.stop().await;

        {
            let mut status = self.inner.status.lock().unwrap();

            if *status == WorkerStatus::Destroyed {
                return Err(Error::Destroyed);
            }

            *status = WorkerStatus::Ready;
        }

        tracing::debug!("Write worker stopped.");

        self.inner.events.emit(WorkerEvent::Stop);

        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        {
            let mut status = self.inner.status.lock().unwrap();

            if *status == WorkerStatus::Destroyed {
                return Ok(());
            }

            *status = WorkerStatus::Destroyed;
        }

        self.unfollow();
        self.inner.queue.destroy().await;
        self.inner.storage.destroy();
        self.inner.events.clear();

        tracing::debug!("Write worker destroyed.");

        Ok(())
    }

    fn status(&self) -> WorkerStatus {
        *self.inner.status.lock().unwrap()
    }

    fn subscribe(&self) -> Subscription<WorkerEvent> {
        self.inner.events.subscribe()
    }
}

impl Inner {
    /// Write a new file to disk, then cache it.
    async fn store(&self, relative_path: &str, content: Bytes) -> Result<String> {
        let pending = self.register.begin_write(WRITER_INDEX)?;

        let relative_path = self.storage.write_file(relative_path, content.clone()).await?;

        self.cache(pending, FileObject::new(relative_path.clone(), content)).await?;

        Ok(relative_path)
    }

    /// Bring the buffer up to date with a storage change.
    async fn refresh(&self, event: FileEvent) -> Result<String> {
        match event {
            FileEvent::New { relative_path, content } => {
                // files written through `store` are already cached
                if !self.map.lock().await.contains(&relative_path) {
                    let pending = self.register.begin_write(WRITER_INDEX)?;

                    self.cache(pending, FileObject::new(relative_path.clone(), content)).await?;
                }

                Ok(relative_path)
            }
            FileEvent::Change { relative_path, .. } | FileEvent::Delete { relative_path } => {
                let pending = self.register.begin_write(WRITER_INDEX)?;

                let mut map = self.map.lock().await;
                let (rebuilt, _active) = self.rebuild(pending).await?;
                *map = rebuilt;

                self.events.emit(WorkerEvent::Update(map.clone()));

                Ok(relative_path)
            }
            FileEvent::Error(error) => Err(error),
        }
    }

    /// Append `file` to the buffer if it fits, otherwise rebuild the whole buffer.
    async fn cache(&self, pending: PendingWrite, file: FileObject) -> Result<()> {
        let mut map = self.map.lock().await;

        let _active = match map.add_file(&file.relative_path, &file.content) {
            Ok(range) => {
                // the appended range is not mapped by any reader yet, no need to drain
                self.buffer.write_content(range.start, &file.content)?;

                tracing::trace!("Appended file `{}` at {range:?}.", file.relative_path);

                drop(pending);
                None
            }
            Err(Error::CapacityExceeded { .. }) => {
                let (rebuilt, active) = self.rebuild(pending).await?;
                *map = rebuilt;

                if !map.contains(&file.relative_path) {
                    tracing::warn!("File `{}` does not fit into the buffer.", file.relative_path);
                }

                Some(active)
            }
            Err(error) => return Err(error),
        };

        // published before releasing the writing flag so readers resume with the new map
        self.events.emit(WorkerEvent::Update(map.clone()));

        Ok(())
    }

    /// Drain readers and refill the whole buffer from disk, smallest files first.
    ///
    /// The returned guard keeps readers out until dropped.
    async fn rebuild(&self, pending: PendingWrite) -> Result<(AddressMap, ActiveWrite)> {
        let mut files = self.storage.read_all_files().await?;
        files.sort_by_key(FileObject::len);

        let active = pending.drain().await?;

        let map = AddressMap::from_files(&files, self.config.capacity);

        self.buffer.clear_content();

        for file in &files {
            if let Some(range) = map.get_file_address(&file.relative_path) {
                self.buffer.write_content(range.start, &file.content)?;
            }
        }

        tracing::debug!("Rebuilt buffer with {} of {} files ({} bytes).", map.len(), files.len(), map.size());

        Ok((map, active))
    }
}
