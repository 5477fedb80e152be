//! This module provides the workers sharing a cache.
//!
//! A single [`WriteWorker`] owns the file system storage. It copies every file into a [`SharedBuffer`], records their
//! location in an [`AddressMap`] and publishes both. Any number of [`ReadWorker`]s, up to the reader slots of the state
//! register, attach to the published buffer and serve file contents straight out of it:
//!
//! ```text
//!     WriteWorker --start--> Published { address_map, buffer } --attach--> ReadWorker
//!                 --update-> AddressMap ----------------------- follow --> ReadWorker
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::events::Subscription;
use crate::memory::{AddressMap, SharedBuffer};

mod reader;
pub use reader::*;

mod writer;
pub use writer::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Ready,
    Running,
    Destroyed,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Ready => f.write_str("ready"),
            WorkerStatus::Running => f.write_str("running"),
            WorkerStatus::Destroyed => f.write_str("destroyed"),
        }
    }
}

/// What a writer hands over to the readers.
#[derive(Debug, Clone)]
pub struct Published {
    pub address_map: AddressMap,
    pub buffer: Arc<SharedBuffer>,
}

/// Notifications published by a [`Worker`].
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Start(Published),
    Stop,
    /// A new address map is in effect for the published buffer.
    Update(AddressMap),
    Error(Error),
}

/// Worker lifecycle.
///
/// ```text
///     ready --start--> running --stop--> ready
///     (any) --destroy--> destroyed
/// ```
pub trait Worker: Send + Sync {
    fn start(&self) -> impl Future<Output = Result<()>> + Send;

    fn stop(&self) -> impl Future<Output = Result<()>> + Send;

    /// Irreversibly release the worker. Further operations fail with [`Error::Destroyed`].
    fn destroy(&self) -> impl Future<Output = Result<()>> + Send;

    fn status(&self) -> WorkerStatus;

    fn subscribe(&self) -> Subscription<WorkerEvent>;
}
