use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use futures::future::{AbortHandle, Abortable};

use super::{Published, Worker, WorkerEvent, WorkerStatus};
use crate::config::QueueOptions;
use crate::error::{Error, Result};
use crate::events::{Emitter, Subscription};
use crate::memory::{SharedBuffer, WorkerStateRegister};
use crate::storage::ReadStorage;

#[derive(Debug)]
struct Inner {
    index: u8,
    storage: ReadStorage,
    buffer: Arc<SharedBuffer>,
    status: Mutex<WorkerStatus>,
    events: Emitter<WorkerEvent>,
    /// Task applying the updates of the writer.
    follower: Mutex<Option<AbortHandle>>,
}

/// A worker serving files out of a published buffer.
#[derive(Debug, Clone)]
pub struct ReadWorker {
    inner: Arc<Inner>,
}

impl ReadWorker {
    /// Attach to `published` as the reader slot `index` of its state register.
    pub fn attach(published: Published, index: u8, options: QueueOptions) -> Result<Self> {
        let Published { address_map, buffer } = published;

        let register = WorkerStateRegister::from_buffer(Arc::clone(&buffer))?;
        let storage = ReadStorage::new(Arc::clone(&buffer), address_map, options)?.with_reader(register, index)?;

        tracing::debug!("Reader {index} attached to a buffer of {} files.", storage.files_count());

        Ok(Self {
            inner: Arc::new(Inner {
                index,
                storage,
                buffer,
                status: Mutex::new(WorkerStatus::Ready),
                events: Emitter::new(),
                follower: Mutex::new(None),
            }),
        })
    }

    #[inline]
    pub fn index(&self) -> u8 {
        self.inner.index
    }

    #[inline]
    pub fn storage(&self) -> &ReadStorage {
        &self.inner.storage
    }

    pub async fn read_file(&self, path: &str) -> Result<Bytes> {
        if self.status() == WorkerStatus::Destroyed {
            return Err(Error::Destroyed);
        }

        self.inner.storage.read_file(path).await
    }

    /// Apply the address maps published through `events`, in the background.
    ///
    /// Replaces the previously followed subscription, if any.
    ///
    /// Maps are applied asynchronously: once the writer releases its writing flag, a read may still pass
    /// [`begin_read`](WorkerStateRegister::begin_read) before the `Update` of the new generation is applied here, and
    /// slice the rebuilt buffer with the previous map. The window closes as soon as the update is applied.
    pub fn follow(&self, events: Subscription<WorkerEvent>) {
        let mut follower = self.inner.follower.lock().unwrap();

        if let Some(handle) = follower.take() {
            handle.abort();
        }

        let (handle, registration) = AbortHandle::new_pair();

        tokio::spawn(Abortable::new(Self::forward(Arc::downgrade(&self.inner), events), registration));

        *follower = Some(handle);
    }

    fn unfollow(&self) {
        if let Some(handle) = self.inner.follower.lock().unwrap().take() {
            handle.abort();
        }
    }

    async fn forward(inner: Weak<Inner>, mut events: Subscription<WorkerEvent>) {
        while let Some(event) = events.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };

            let map = match event {
                WorkerEvent::Update(map) => map,
                WorkerEvent::Start(published) if Arc::ptr_eq(&published.buffer, &inner.buffer) => published.address_map,
                WorkerEvent::Start(_) => {
                    tracing::warn!("Reader {} ignored a start on another buffer.", inner.index);
                    continue;
                }
                WorkerEvent::Stop | WorkerEvent::Error(_) => continue,
            };

            match inner.storage.set_address_map(map.clone()) {
                Ok(()) => inner.events.emit(WorkerEvent::Update(map)),
                Err(error) => inner.events.emit(WorkerEvent::Error(error)),
            };
        }
    }
}

impl Worker for ReadWorker {
    async fn start(&self) -> Result<()> {
        {
            let mut status = self.inner.status.lock().unwrap();

            match *status {
                WorkerStatus::Destroyed => return Err(Error::Destroyed),
                WorkerStatus::Running => return Ok(()),
                WorkerStatus::Ready => *status = WorkerStatus::Running,
            }
        }

        self.inner.events.emit(WorkerEvent::Start(Published {
            address_map: self.inner.storage.address_map(),
            buffer: Arc::clone(&self.inner.buffer),
        }));

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        {
            let mut status = self.inner.status.lock().unwrap();

            if *status == WorkerStatus::Destroyed {
                return Err(Error::Destroyed);
            }

            *status = WorkerStatus::Ready;
        }

        self.inner.events.emit(WorkerEvent::Stop);

        Ok(())
    }

    /// Stop following the writer and fail every pending read.
    async fn destroy(&self) -> Result<()> {
        {
            let mut status = self.inner.status.lock().unwrap();

            if *status == WorkerStatus::Destroyed {
                return Ok(());
            }

            *status = WorkerStatus::Destroyed;
        }

        self.unfollow();
        self.inner.storage.destroy().await;
        self.inner.events.clear();

        tracing::debug!("Reader {} destroyed.", self.inner.index);

        Ok(())
    }

    fn status(&self) -> WorkerStatus {
        *self.inner.status.lock().unwrap()
    }

    fn subscribe(&self) -> Subscription<WorkerEvent> {
        self.inner.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::STATE_STORAGE_LENGTH;
    use crate::memory::AddressMap;

    fn published() -> Published {
        let buffer = Arc::new(SharedBuffer::anonymous(STATE_STORAGE_LENGTH + 100).unwrap());
        WorkerStateRegister::with_buffer(Arc::clone(&buffer), 1, 2).unwrap();

        let mut address_map = AddressMap::new(100);
        let range = address_map.add_file("a.txt", b"hi").unwrap();
        buffer.write_content(range.start, b"hi").unwrap();

        Published { address_map, buffer }
    }

    #[tokio::test]
    async fn test_attach() {
        let worker = ReadWorker::attach(published(), 2, QueueOptions::default()).unwrap();

        assert_eq!(worker.index(), 2);
        assert_eq!(worker.read_file("a.txt").await.unwrap(), "hi");
        assert!(worker.read_file("b.txt").await.unwrap_err().is_not_found());

        assert!(matches!(
            ReadWorker::attach(published(), 3, QueueOptions::default()),
            Err(Error::IndexOutOfRange { index: 3, max: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_attach_without_register() {
        let buffer = Arc::new(SharedBuffer::anonymous(STATE_STORAGE_LENGTH).unwrap());
        let published = Published {
            address_map: AddressMap::new(0),
            buffer,
        };

        assert!(matches!(
            ReadWorker::attach(published, 1, QueueOptions::default()),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_follow_updates() {
        let published = published();
        let writer = Emitter::new();
        let worker = ReadWorker::attach(published.clone(), 1, QueueOptions::default()).unwrap();
        let mut events = worker.subscribe();

        worker.follow(writer.subscribe());

        let mut map = published.address_map.clone();
        let range = map.add_file("b.txt", b"yo").unwrap();
        published.buffer.write_content(range.start, b"yo").unwrap();
        writer.emit(WorkerEvent::Update(map));

        assert!(matches!(events.recv().await, Some(WorkerEvent::Update(map)) if map.contains("b.txt")));
        assert_eq!(worker.read_file("b.txt").await.unwrap(), "yo");
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let worker = ReadWorker::attach(published(), 1, QueueOptions::default()).unwrap();
        let mut events = worker.subscribe();

        worker.start().await.unwrap();
        assert_eq!(worker.status(), WorkerStatus::Running);
        assert!(matches!(events.try_recv(), Some(WorkerEvent::Start(published)) if published.address_map.len() == 1));

        worker.stop().await.unwrap();
        assert_eq!(worker.status(), WorkerStatus::Ready);
        assert!(matches!(events.try_recv(), Some(WorkerEvent::Stop)));

        worker.destroy().await.unwrap();
        worker.destroy().await.unwrap();
        assert!(events.recv().await.is_none());
        assert!(matches!(worker.read_file("a.txt").await, Err(Error::Destroyed)));
        assert!(matches!(worker.start().await, Err(Error::Destroyed)));
    }
}
