use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures::future::{AbortHandle, Abortable};

use super::{FileEvent, FileObject};
use crate::error::{Error, Result};
use crate::events::{Emitter, Subscription};

/// What the watcher compares to detect a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl From<&std::fs::Metadata> for Stamp {
    fn from(metadata: &std::fs::Metadata) -> Self {
        Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

#[derive(Debug)]
struct Inner {
    root_path: PathBuf,
    events: Emitter<FileEvent>,
    /// Files known to the storage, either read, written or already reported by the watcher.
    snapshot: tokio::sync::Mutex<HashMap<String, Stamp>>,
    watcher: Mutex<Option<AbortHandle>>,
    destroyed: AtomicBool,
}

/// Local file system storage rooted at a directory.
///
/// Changes made through the storage itself are emitted right away. Out-of-band changes are only detected while
/// [`watch`](Self::watch)ing, by polling the tree.
#[derive(Debug, Clone)]
pub struct FileSystemStorage {
    inner: Arc<Inner>,
}

impl FileSystemStorage {
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                root_path: root_path.into(),
                events: Emitter::new(),
                snapshot: Default::default(),
                watcher: Mutex::new(None),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    #[inline]
    pub fn root_path(&self) -> &Path {
        &self.inner.root_path
    }

    #[inline]
    pub fn subscribe(&self) -> Subscription<FileEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_watching(&self) -> bool {
        self.inner.watcher.lock().unwrap().is_some()
    }

    fn ensure_alive(&self) -> Result<()> {
        match self.inner.destroyed.load(Ordering::Acquire) {
            true => Err(Error::Destroyed),
            false => Ok(()),
        }
    }

    /// Read every file below the root, creating the root directory if missing.
    pub async fn read_all_files(&self) -> Result<Vec<FileObject>> {
        self.ensure_alive()?;

        tokio::fs::create_dir_all(self.root_path()).await?;

        tracing::debug!("Reading all files from local storage: `{}`", self.root_path().display());

        let mut snapshot = self.inner.snapshot.lock().await;
        let mut files = vec![];

        snapshot.clear();

        for (relative_path, path, stamp) in walk_dir(self.root_path()).await? {
            let content = tokio::fs::read(&path).await?;

            tracing::trace!("Read file `{relative_path}` ({} bytes).", content.len());

            snapshot.insert(relative_path.clone(), stamp);
            files.push(FileObject::new(relative_path, content));
        }

        Ok(files)
    }

    /// Read a single file.
    pub async fn get_file(&self, relative_path: &str) -> Result<FileObject> {
        self.ensure_alive()?;

        let relative_path = normalize(relative_path)?;
        let path = self.root_path().join(&relative_path);

        let metadata = tokio::fs::metadata(&path).await.map_err(|error| not_found(error, &relative_path))?;

        if metadata.is_dir() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("`{relative_path}` is a directory")).into());
        }

        let content = tokio::fs::read(&path).await.map_err(|error| not_found(error, &relative_path))?;

        Ok(FileObject::new(relative_path, content))
    }

    /// Write a new file and return the relative path it was actually stored at.
    ///
    /// An existing file is never overwritten: a numbered suffix is appended to the file name instead, e.g. `b/c_1.txt`.
    pub async fn write_file(&self, relative_path: &str, content: Bytes) -> Result<String> {
        use tokio::io::AsyncWriteExt;

        self.ensure_alive()?;

        let relative_path = normalize(relative_path)?;
        let path = self.root_path().join(&relative_path);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // hold the snapshot so that the watcher does not report this write on its own
        let mut snapshot = self.inner.snapshot.lock().await;

        let (path, file) = create_new(&path).await?;
        let relative_path = relative(self.root_path(), &path)?;

        let mut writer = tokio::io::BufWriter::new(file);
        writer.write_all(&content).await?;
        writer.shutdown().await?;

        let file = writer.into_inner();
        file.sync_all().await?;

        snapshot.insert(relative_path.clone(), Stamp::from(&file.metadata().await?));
        drop(snapshot);

        tracing::debug!("Wrote file `{relative_path}` ({} bytes) to local storage.", content.len());

        self.inner.events.emit(FileEvent::New {
            relative_path: relative_path.clone(),
            content,
        });

        Ok(relative_path)
    }

    pub async fn delete_file(&self, relative_path: &str) -> Result<()> {
        self.ensure_alive()?;

        let relative_path = normalize(relative_path)?;

        let mut snapshot = self.inner.snapshot.lock().await;

        tokio::fs::remove_file(self.root_path().join(&relative_path))
            .await
            .map_err(|error| not_found(error, &relative_path))?;

        snapshot.remove(&relative_path);
        drop(snapshot);

        tracing::debug!("Deleted file `{relative_path}` from local storage.");

        self.inner.events.emit(FileEvent::Delete { relative_path });

        Ok(())
    }

    /// Poll the tree every `interval` and emit a notification for each new, changed or deleted file.
    ///
    /// Changes are relative to what the storage already knows: files not yet read nor written through it are reported
    /// as new. Does nothing if already watching.
    pub fn watch(&self, interval: Duration) {
        if self.ensure_alive().is_err() {
            return;
        }

        let mut watcher = self.inner.watcher.lock().unwrap();

        if watcher.is_some() {
            return;
        }

        tracing::debug!("Watching local storage every {interval:?}: `{}`", self.root_path().display());

        let (handle, registration) = AbortHandle::new_pair();
        let inner = Arc::downgrade(&self.inner);

        tokio::spawn(Abortable::new(Self::poll(inner, interval), registration));

        *watcher = Some(handle);
    }

    async fn poll(inner: Weak<Inner>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;

            let Some(inner) = inner.upgrade() else {
                break;
            };

            if let Err(error) = Self::poll_once(&inner).await {
                tracing::warn!("Failed to poll local storage: {error}");

                inner.events.emit(FileEvent::Error(error));
            }
        }
    }

    async fn poll_once(inner: &Inner) -> Result<()> {
        let mut snapshot = inner.snapshot.lock().await;
        let mut seen = HashSet::with_capacity(snapshot.len());

        for (relative_path, path, stamp) in walk_dir(&inner.root_path).await? {
            seen.insert(relative_path.clone());

            let known = match snapshot.get(&relative_path) {
                Some(known) if *known == stamp => continue,
                Some(_) => true,
                None => false,
            };

            let content = match tokio::fs::read(&path).await {
                Ok(content) => Bytes::from(content),
                // removed in the meantime, reported on the next poll
                Err(error) if error.kind() == io::ErrorKind::NotFound => continue,
                Err(error) => {
                    inner.events.emit(FileEvent::Error(error.into()));
                    continue;
                }
            };

            snapshot.insert(relative_path.clone(), stamp);

            tracing::trace!("Detected {} file `{relative_path}`.", if known { "changed" } else { "new" });

            inner.events.emit(match known {
                true => FileEvent::Change { relative_path, content },
                false => FileEvent::New { relative_path, content },
            });
        }

        snapshot.retain(|relative_path, _| {
            let retained = seen.contains(relative_path);

            if !retained {
                tracing::trace!("Detected deleted file `{relative_path}`.");

                inner.events.emit(FileEvent::Delete {
                    relative_path: relative_path.clone(),
                });
            }

            retained
        });

        Ok(())
    }

    pub fn stop_watch(&self) {
        if let Some(handle) = self.inner.watcher.lock().unwrap().take() {
            handle.abort();

            tracing::debug!("Stopped watching local storage: `{}`", self.root_path().display());
        }
    }

    /// Stop watching and release every subscription. Further operations fail with [`Error::Destroyed`].
    pub fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::Release);
        self.stop_watch();
        self.inner.events.clear();
    }
}

/// Map a missing file to [`Error::NotFound`].
fn not_found(error: io::Error, relative_path: &str) -> Error {
    match error.kind() {
        io::ErrorKind::NotFound => Error::NotFound(relative_path.to_owned()),
        _ => error.into(),
    }
}

/// Validate a relative path and turn it into its `/`-separated form.
fn normalize(relative_path: &str) -> Result<String> {
    let mut parts = vec![];

    for component in Path::new(relative_path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or(io::Error::from(io::ErrorKind::InvalidInput))?),
            Component::CurDir => {}
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("`{relative_path}` is not a relative path below the storage root"),
                )
                .into());
            }
        }
    }

    if parts.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty path").into());
    }

    Ok(parts.join("/"))
}

/// `/`-separated form of `path` relative to `root`.
fn relative(root: &Path, path: &Path) -> io::Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| io::ErrorKind::InvalidInput)?;

    let parts = relative
        .components()
        .map(|component| component.as_os_str().to_str().ok_or(io::ErrorKind::InvalidData))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(parts.join("/"))
}

/// Create a file at `path`, or at the first free `{stem}_{n}.{ext}` sibling.
async fn create_new(path: &Path) -> io::Result<(PathBuf, tokio::fs::File)> {
    let stem = path.file_stem().and_then(|stem| stem.to_str()).ok_or(io::ErrorKind::InvalidInput)?;
    let extension = path.extension().and_then(|extension| extension.to_str());

    let mut candidate = path.to_path_buf();
    let mut n = 0;

    loop {
        match tokio::fs::File::options().write(true).create_new(true).open(&candidate).await {
            Ok(file) => return Ok((candidate, file)),
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                n += 1;
                candidate.set_file_name(match extension {
                    Some(extension) => format!("{stem}_{n}.{extension}"),
                    None => format!("{stem}_{n}"),
                });
            }
            Err(error) => return Err(error),
        }
    }
}

/// Walk through the whole tree below `root` and return every regular file with its relative path and stamp.
async fn walk_dir(root: &Path) -> io::Result<Vec<(String, PathBuf, Stamp)>> {
    if !tokio::fs::metadata(root).await?.is_dir() {
        return Err(io::ErrorKind::InvalidInput.into());
    }

    let mut files = vec![];
    let mut dirs = vec![root.to_path_buf()];

    while let Some(dir) = dirs.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = entry.path();

            if file_type.is_dir() {
                dirs.push(path);
            } else if file_type.is_file() {
                let metadata = entry.metadata().await?;

                files.push((relative(root, &path)?, path, Stamp::from(&metadata)));
            }
        }
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn storage() -> (tempfile::TempDir, FileSystemStorage) {
        let dir = tempfile::tempdir().unwrap();

        tokio::fs::create_dir_all(dir.path().join("b")).await.unwrap();
        tokio::fs::write(dir.path().join("a.txt"), "hi").await.unwrap();
        tokio::fs::write(dir.path().join("b/c.txt"), "yo").await.unwrap();

        let storage = FileSystemStorage::new(dir.path());

        (dir, storage)
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("a.txt").unwrap(), "a.txt");
        assert_eq!(normalize("./b//c.txt").unwrap(), "b/c.txt");

        for path in ["", ".", "/etc/passwd", "../a.txt", "b/../../a.txt"] {
            assert!(normalize(path).is_err(), "`{path}` should be rejected");
        }
    }

    #[tokio::test]
    async fn test_read_all_files() {
        let (_dir, storage) = storage().await;

        let mut files = storage.read_all_files().await.unwrap();
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        assert_eq!(files, [FileObject::new("a.txt", "hi"), FileObject::new("b/c.txt", "yo")]);
    }

    #[tokio::test]
    async fn test_read_all_files_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSystemStorage::new(dir.path().join("data"));

        assert!(storage.read_all_files().await.unwrap().is_empty());
        assert!(dir.path().join("data").is_dir());
    }

    #[tokio::test]
    async fn test_get_file() {
        let (_dir, storage) = storage().await;

        assert_eq!(storage.get_file("b/c.txt").await.unwrap().content, "yo");
        assert!(storage.get_file("missing.txt").await.unwrap_err().is_not_found());
        assert!(matches!(storage.get_file("b").await, Err(Error::Io(error)) if error.kind() == io::ErrorKind::InvalidInput));
    }

    #[tokio::test]
    async fn test_write_file() {
        let (dir, storage) = storage().await;
        let mut events = storage.subscribe();

        let path = storage.write_file("d/e.txt", Bytes::from_static(b"new")).await.unwrap();

        assert_eq!(path, "d/e.txt");
        assert_eq!(tokio::fs::read(dir.path().join("d/e.txt")).await.unwrap(), b"new");
        assert!(matches!(events.try_recv(), Some(FileEvent::New { relative_path, content }) if relative_path == "d/e.txt" && content == "new"));
    }

    #[tokio::test]
    async fn test_write_file_never_overwrites() {
        let (dir, storage) = storage().await;

        assert_eq!(storage.write_file("a.txt", Bytes::from_static(b"1")).await.unwrap(), "a_1.txt");
        assert_eq!(storage.write_file("a.txt", Bytes::from_static(b"2")).await.unwrap(), "a_2.txt");

        assert_eq!(tokio::fs::read(dir.path().join("a.txt")).await.unwrap(), b"hi");
        assert_eq!(tokio::fs::read(dir.path().join("a_2.txt")).await.unwrap(), b"2");
    }

    #[tokio::test]
    async fn test_delete_file() {
        let (dir, storage) = storage().await;
        let mut events = storage.subscribe();

        storage.delete_file("b/c.txt").await.unwrap();

        assert!(!dir.path().join("b/c.txt").exists());
        assert!(matches!(events.try_recv(), Some(FileEvent::Delete { relative_path }) if relative_path == "b/c.txt"));
        assert!(storage.delete_file("b/c.txt").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_watch() {
        let (dir, storage) = storage().await;
        storage.read_all_files().await.unwrap();

        let mut events = storage.subscribe();
        storage.watch(Duration::from_millis(20));
        assert!(storage.is_watching());

        tokio::fs::write(dir.path().join("new.txt"), "out of band").await.unwrap();
        tokio::fs::remove_file(dir.path().join("a.txt")).await.unwrap();

        let mut created = false;
        let mut deleted = false;

        while !(created && deleted) {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
                Some(FileEvent::New { relative_path, content }) => {
                    assert_eq!(relative_path, "new.txt");
                    assert_eq!(content, "out of band");
                    created = true;
                }
                Some(FileEvent::Delete { relative_path }) => {
                    assert_eq!(relative_path, "a.txt");
                    deleted = true;
                }
                event => panic!("unexpected event: {event:?}"),
            }
        }

        storage.stop_watch();
        assert!(!storage.is_watching());
    }

    #[tokio::test]
    async fn test_writes_are_not_reported_twice() {
        let (_dir, storage) = storage().await;
        storage.read_all_files().await.unwrap();

        let mut events = storage.subscribe();
        storage.write_file("d.txt", Bytes::from_static(b"d")).await.unwrap();

        FileSystemStorage::poll_once(&storage.inner).await.unwrap();

        assert!(matches!(events.try_recv(), Some(FileEvent::New { .. })));
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_destroy() {
        let (_dir, storage) = storage().await;
        let mut events = storage.subscribe();
        storage.watch(Duration::from_secs(1));

        storage.destroy();

        assert!(!storage.is_watching());
        assert!(events.recv().await.is_none());
        assert!(matches!(storage.read_all_files().await, Err(Error::Destroyed)));
        assert!(matches!(storage.write_file("z.txt", Bytes::new()).await, Err(Error::Destroyed)));

        storage.watch(Duration::from_secs(1));
        assert!(!storage.is_watching());
    }
}
