use std::collections::HashMap;
use std::ops::Range;

use crate::error::{Error, Result};
use crate::storage::FileObject;

/// Location of a file in the content area of a [`SharedBuffer`](super::SharedBuffer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAddress {
    pub path: String,
    pub range: Range<usize>,
}

/// Append-only directory of the files stored in a shared buffer.
///
/// Ranges are relative to the content area and assigned one after the other, so they never overlap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressMap {
    map: HashMap<String, Range<usize>>,
    capacity: usize,
    current_size: usize,
}

impl AddressMap {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            capacity,
            current_size: 0,
        }
    }

    /// Build a map from `files`, in order.
    ///
    /// Files that would overflow `capacity`, or whose path is already mapped, are skipped instead of failing the whole
    /// construction.
    pub fn from_files(files: &[FileObject], capacity: usize) -> Self {
        let mut map = Self::new(capacity);

        for file in files {
            if let Err(error) = map.add_file(&file.relative_path, &file.content) {
                tracing::debug!("Skipping file `{}`: {error}", file.relative_path);
            }
        }

        map
    }

    #[inline]
    pub fn get_file_address(&self, path: &str) -> Option<Range<usize>> {
        self.map.get(path).cloned()
    }

    /// Append `content` under `path` and return its range.
    ///
    /// The map is left untouched on failure.
    pub fn add_file(&mut self, path: &str, content: &[u8]) -> Result<Range<usize>> {
        if self.map.contains_key(path) {
            return Err(Error::DuplicatePath(path.to_owned()));
        }

        let end = self
            .current_size
            .checked_add(content.len())
            .filter(|&end| end <= self.capacity)
            .ok_or(Error::CapacityExceeded {
                requested: content.len(),
                available: self.remaining(),
            })?;

        let range = self.current_size..end;

        self.map.insert(path.to_owned(), range.clone());
        self.current_size = end;

        tracing::trace!("Mapped file `{path}` at {range:?}.");

        Ok(range)
    }

    /// Every mapped file, in no particular order.
    pub fn get_all(&self) -> Vec<FileAddress> {
        self.map
            .iter()
            .map(|(path, range)| FileAddress {
                path: path.clone(),
                range: range.clone(),
            })
            .collect()
    }

    #[inline]
    pub fn contains(&self, path: &str) -> bool {
        self.map.contains_key(path)
    }

    /// Bytes used so far.
    #[inline]
    pub fn size(&self) -> usize {
        self.current_size
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.current_size
    }

    /// Number of mapped files.
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
