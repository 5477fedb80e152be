//! This module provides file access, either from the local file system or from a shared buffer.
//!
//! The [`FileSystemStorage`] is the source of truth: the writer scans it to build the shared buffer and writes uploaded
//! files through it. The [`ReadStorage`] serves file contents straight from the shared buffer.
//!
//! Files are identified by their path relative to the storage root, always `/`-separated:
//!
//! ```text
//!     - root path
//!       L a.txt                   -> "a.txt"
//!       L b
//!         L c.txt                 -> "b/c.txt"
//! ```

use bytes::Bytes;

use crate::error::Error;

mod fs;
pub use fs::*;

mod read;
pub use read::*;

/// A file and its whole content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileObject {
    /// `/`-separated path, relative to the storage root.
    pub relative_path: String,
    pub content: Bytes,
}

impl FileObject {
    pub fn new(relative_path: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            relative_path: relative_path.into(),
            content: content.into(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.content.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Change notifications of a [`FileSystemStorage`].
#[derive(Debug, Clone)]
pub enum FileEvent {
    New { relative_path: String, content: Bytes },
    Change { relative_path: String, content: Bytes },
    Delete { relative_path: String },
    Error(Error),
}

impl FileEvent {
    /// Path of the file this event is about, if any.
    pub fn relative_path(&self) -> Option<&str> {
        match self {
            FileEvent::New { relative_path, .. }
            | FileEvent::Change { relative_path, .. }
            | FileEvent::Delete { relative_path } => Some(relative_path),
            FileEvent::Error(_) => None,
        }
    }
}
