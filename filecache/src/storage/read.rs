use std::sync::{Arc, RwLock};

use bytes::Bytes;

use crate::config::QueueOptions;
use crate::error::{Error, Result};
use crate::memory::{AddressMap, SharedBuffer, WorkerStateRegister};
use crate::task::{Queue, Task};

/// Serialized read access to the files of a shared buffer.
///
/// Every read is a task of an internal [`Queue`], so a single read touches the buffer at a time. When attached to a reader
/// slot of the [`WorkerStateRegister`], the slot is flagged as reading while the buffer is sliced, which is what writers
/// wait for before any destructive update.
#[derive(Debug)]
pub struct ReadStorage {
    queue: Queue<(), Bytes>,
    map: Arc<RwLock<AddressMap>>,
    buffer: Arc<SharedBuffer>,
    reader: Option<(WorkerStateRegister, u8)>,
}

impl ReadStorage {
    /// Serve the files of `map` out of `buffer`.
    ///
    /// Fails if `map` does not fit into the content area of `buffer`.
    pub fn new(buffer: Arc<SharedBuffer>, map: AddressMap, options: QueueOptions) -> Result<Self> {
        check_fits(&buffer, &map)?;

        Ok(Self {
            queue: Queue::new(options),
            map: Arc::new(RwLock::new(map)),
            buffer,
            reader: None,
        })
    }

    /// Flag the reader slot `index` of `register` while reading.
    pub fn with_reader(self, register: WorkerStateRegister, index: u8) -> Result<Self> {
        register.is_reading(index)?;

        Ok(Self {
            reader: Some((register, index)),
            ..self
        })
    }

    /// Capacity in bytes of the address map.
    pub fn capacity(&self) -> usize {
        self.map.read().unwrap().capacity()
    }

    /// Bytes used by the mapped files.
    pub fn current_size(&self) -> usize {
        self.map.read().unwrap().size()
    }

    pub fn files_count(&self) -> usize {
        self.map.read().unwrap().len()
    }

    /// Whether no byte is used by the mapped files.
    pub fn is_empty(&self) -> bool {
        self.current_size() == 0
    }

    pub fn contains(&self, path: &str) -> bool {
        self.map.read().unwrap().contains(path)
    }

    /// Number of reads waiting for their turn.
    #[inline]
    pub fn pending_reads(&self) -> usize {
        self.queue.size()
    }

    /// Number of reads waiting for their outcome.
    #[inline]
    pub fn listener_count(&self) -> usize {
        self.queue.listener_count()
    }

    /// Snapshot of the current address map.
    pub fn address_map(&self) -> AddressMap {
        self.map.read().unwrap().clone()
    }

    /// Swap in the address map of a new buffer generation.
    pub fn set_address_map(&self, map: AddressMap) -> Result<()> {
        check_fits(&self.buffer, &map)?;

        tracing::debug!("Switching to an address map of {} files ({} bytes).", map.len(), map.size());

        *self.map.write().unwrap() = map;

        Ok(())
    }

    /// Read the whole content of the file at `path`.
    ///
    /// # Errors
    /// - [`Error::NotFound`] if `path` is not mapped,
    /// - [`Error::CapacityExceeded`] if too many reads are already pending,
    /// - [`Error::Timeout`] if the read waited too long for its turn, or for a writer to finish,
    /// - [`Error::Destroyed`] if the storage is destroyed before the read completes.
    pub async fn read_file(&self, path: &str) -> Result<Bytes> {
        let map = Arc::clone(&self.map);
        let buffer = Arc::clone(&self.buffer);
        let reader = self.reader.clone();
        let path = path.to_owned();

        let task = Task::new(move |()| {
            let map = Arc::clone(&map);
            let buffer = Arc::clone(&buffer);
            let reader = reader.clone();
            let path = path.clone();

            async move {
                let _guard = match &reader {
                    Some((register, index)) => Some(register.begin_read(*index).await?),
                    None => None,
                };

                // looked up once no writer is active, so the range matches the generation in the buffer
                let range = map.read().unwrap().get_file_address(&path);
                let range = range.ok_or(Error::NotFound(path))?;

                buffer.read_content(range)
            }
        });

        self.queue.submit(task, ()).await.map_err(|error| error.cause().clone())
    }

    /// Tear down the read queue. Pending reads fail with [`Error::Destroyed`].
    pub async fn destroy(&self) {
        self.queue.destroy().await;
    }
}

fn check_fits(buffer: &SharedBuffer, map: &AddressMap) -> Result<()> {
    if map.capacity() > buffer.content_capacity() {
        return Err(Error::CapacityExceeded {
            requested: map.capacity(),
            available: buffer.content_capacity(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::STATE_STORAGE_LENGTH;
    use crate::storage::FileObject;

    const CAPACITY: usize = 1000;

    fn storage() -> ReadStorage {
        let files = [FileObject::new("a.txt", "hi"), FileObject::new("b/c.txt", "yo")];
        let map = AddressMap::from_files(&files, CAPACITY);

        let buffer = Arc::new(SharedBuffer::anonymous(STATE_STORAGE_LENGTH + CAPACITY).unwrap());
        for file in &files {
            let range = map.get_file_address(&file.relative_path).unwrap();
            buffer.write_content(range.start, &file.content).unwrap();
        }

        ReadStorage::new(buffer, map, QueueOptions::default().with_capacity(100)).unwrap()
    }

    #[tokio::test]
    async fn test_read_file() {
        let storage = storage();

        assert_eq!(storage.read_file("a.txt").await.unwrap(), "hi");
        assert_eq!(storage.read_file("b/c.txt").await.unwrap(), "yo");
        assert_eq!(storage.files_count(), 2);
        assert_eq!(storage.current_size(), 4);
        assert_eq!(storage.capacity(), CAPACITY);
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let storage = storage();

        let error = storage.read_file("missing.txt").await.unwrap_err();

        assert!(matches!(error, Error::NotFound(path) if path == "missing.txt"));
        assert_eq!(storage.read_file("a.txt").await.unwrap(), "hi");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reads() {
        let storage = Arc::new(storage());

        let reads = (0..20).map(|i| {
            let storage = Arc::clone(&storage);
            let (path, expected) = if i % 2 == 0 { ("a.txt", "hi") } else { ("b/c.txt", "yo") };

            async move { assert_eq!(storage.read_file(path).await.unwrap(), expected) }
        });

        futures::future::join_all(reads).await;

        assert_eq!(storage.pending_reads(), 0);
        assert_eq!(storage.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_read_with_reader_slot() {
        let register = WorkerStateRegister::new(1, 2).unwrap();
        let reader_storage = storage().with_reader(register.clone(), 2).unwrap();

        assert_eq!(reader_storage.read_file("a.txt").await.unwrap(), "hi");
        assert!(!register.is_reading(2).unwrap());

        assert!(storage().with_reader(register, 3).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_waits_for_writer() {
        let register = WorkerStateRegister::new(1, 1).unwrap();
        let storage = storage().with_reader(register.clone(), 1).unwrap();

        let active = register.begin_write(1).unwrap().drain().await.unwrap();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(active);
        });

        let now = tokio::time::Instant::now();
        assert_eq!(storage.read_file("b/c.txt").await.unwrap(), "yo");
        assert!(now.elapsed() >= Duration::from_millis(200));

        release.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_after_rebuild_uses_new_map() {
        let register = WorkerStateRegister::new(1, 1).unwrap();
        let storage = Arc::new(storage().with_reader(register.clone(), 1).unwrap());

        let active = register.begin_write(1).unwrap().drain().await.unwrap();

        let read = tokio::spawn({
            let storage = Arc::clone(&storage);
            async move { storage.read_file("a.txt").await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!read.is_finished());

        // same files, stored the other way around
        storage.buffer.write_content(0, b"yohi").unwrap();
        let mut map = AddressMap::new(CAPACITY);
        map.add_file("b/c.txt", b"yo").unwrap();
        map.add_file("a.txt", b"hi").unwrap();
        storage.set_address_map(map).unwrap();

        drop(active);

        assert_eq!(read.await.unwrap().unwrap(), "hi");
        assert!(!register.is_reading(1).unwrap());
    }

    #[tokio::test]
    async fn test_set_address_map() {
        let storage = storage();

        storage.buffer.write_content(10, b"new").unwrap();
        let mut map = AddressMap::new(CAPACITY);
        map.add_file("padding", &[0; 10]).unwrap();
        map.add_file("d.txt", b"new").unwrap();

        storage.set_address_map(map).unwrap();

        assert_eq!(storage.read_file("d.txt").await.unwrap(), "new");
        assert!(storage.read_file("a.txt").await.unwrap_err().is_not_found());
        assert!(storage.set_address_map(AddressMap::new(CAPACITY + 1)).is_err());
    }

    #[test]
    fn test_map_larger_than_buffer() {
        let buffer = Arc::new(SharedBuffer::anonymous(STATE_STORAGE_LENGTH + 10).unwrap());

        let result = ReadStorage::new(buffer, AddressMap::new(11), QueueOptions::default());

        assert!(matches!(result, Err(Error::CapacityExceeded { .. })));
    }

    #[tokio::test]
    async fn test_read_after_destroy() {
        let storage = storage();

        storage.destroy().await;

        assert!(matches!(storage.read_file("a.txt").await, Err(Error::Destroyed)));
        assert_eq!(storage.listener_count(), 0);
    }
}
