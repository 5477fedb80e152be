use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use filecache::config::{QueueOptions, WorkerConfig};
use filecache::memory::SharedBuffer;
use filecache::worker::{Published, ReadWorker, Worker, WorkerEvent, WriteWorker};
use filecache::Error;

async fn fixture(root: &Path) {
    tokio::fs::create_dir_all(root.join("b")).await.unwrap();
    tokio::fs::write(root.join("a.txt"), "hi").await.unwrap();
    tokio::fs::write(root.join("b/c.txt"), "yo").await.unwrap();
}

async fn start(writer: &WriteWorker) -> Published {
    let mut events = writer.subscribe();

    writer.start().await.unwrap();

    match events.recv().await {
        Some(WorkerEvent::Start(published)) => published,
        event => panic!("unexpected event: {event:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_through_reader_workers() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path()).await;

    let writer = WriteWorker::new(WorkerConfig::new(dir.path()).with_capacity(1000).with_workers(1, 2)).unwrap();
    let published = start(&writer).await;

    let readers = [1, 2].map(|index| ReadWorker::attach(published.clone(), index, QueueOptions::default()).unwrap());

    for reader in &readers {
        reader.start().await.unwrap();

        assert_eq!(reader.read_file("a.txt").await.unwrap(), "hi");
        assert_eq!(reader.read_file("b/c.txt").await.unwrap(), "yo");
        assert!(matches!(reader.read_file("missing.txt").await, Err(Error::NotFound(path)) if path == "missing.txt"));
    }

    let reads = (0..50).map(|i| {
        let reader = readers[i % 2].clone();
        let (path, expected) = if i % 3 == 0 { ("a.txt", "hi") } else { ("b/c.txt", "yo") };

        tokio::spawn(async move { assert_eq!(reader.read_file(path).await.unwrap(), expected) })
    });

    for read in futures::future::join_all(reads).await {
        read.unwrap();
    }

    for reader in &readers {
        assert_eq!(reader.storage().pending_reads(), 0);
        assert_eq!(reader.storage().listener_count(), 0);
        assert!(!writer.register().is_reading(reader.index()).unwrap());
    }
}

#[tokio::test]
async fn test_readers_follow_writes() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path()).await;

    let writer = WriteWorker::new(WorkerConfig::new(dir.path()).with_capacity(8)).unwrap();
    let published = start(&writer).await;

    let reader = ReadWorker::attach(published, 1, QueueOptions::default()).unwrap();
    let mut updates = reader.subscribe();
    reader.follow(writer.subscribe());

    // appended in place
    assert_eq!(writer.write_file("d.txt", Bytes::from_static(b"new")).await.unwrap(), "d.txt");
    assert!(matches!(updates.recv().await, Some(WorkerEvent::Update(map)) if map.contains("d.txt")));
    assert_eq!(reader.read_file("d.txt").await.unwrap(), "new");

    // does not fit anymore: the buffer is rebuilt from disk, smallest files first
    tokio::fs::remove_file(dir.path().join("d.txt")).await.unwrap();
    writer.write_file("e.txt", Bytes::from_static(b"four")).await.unwrap();

    let Some(WorkerEvent::Update(map)) = updates.recv().await else {
        panic!("expected an update");
    };
    assert_eq!(map.size(), 8);
    assert_eq!(map.get_file_address("e.txt"), Some(4..8));
    assert_eq!(reader.read_file("a.txt").await.unwrap(), "hi");
    assert_eq!(reader.read_file("e.txt").await.unwrap(), "four");
    assert!(reader.read_file("d.txt").await.unwrap_err().is_not_found());

    writer.destroy().await.unwrap();
    reader.destroy().await.unwrap();
}

#[tokio::test]
async fn test_writer_waits_for_readers() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path()).await;

    let writer = WriteWorker::new(WorkerConfig::new(dir.path()).with_capacity(4)).unwrap();
    start(&writer).await;

    // a reader of another process slicing the buffer
    writer.register().set_reading(1, true).unwrap();

    let write = tokio::spawn({
        let writer = writer.clone();
        async move { writer.write_file("f.txt", Bytes::from_static(b"ff")).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!write.is_finished());
    assert!(writer.register().is_write_pending());
    assert!(!writer.register().is_any_writing());

    writer.register().set_reading(1, false).unwrap();

    assert_eq!(write.await.unwrap().unwrap(), "f.txt");
    assert!(!writer.register().is_write_pending());
}

#[tokio::test]
async fn test_file_backed_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("data");
    fixture(&root).await;
    let path = dir.path().join("cache.shm");

    let writer = WriteWorker::create(WorkerConfig::new(&root).with_capacity(100), &path).unwrap();
    let published = start(&writer).await;

    // mapped again, as another process would
    let buffer = Arc::new(SharedBuffer::open(&path).unwrap());
    let published = Published {
        address_map: published.address_map,
        buffer,
    };
    let reader = ReadWorker::attach(published, 1, QueueOptions::default()).unwrap();

    assert_eq!(reader.read_file("b/c.txt").await.unwrap(), "yo");
}
