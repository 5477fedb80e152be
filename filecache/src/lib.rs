//! A shared-memory file cache.
//!
//! A crate serving whole file contents out of a memory region shared by a bounded set of workers:
//! - a [`WriteWorker`](worker::WriteWorker) scans a local file system storage, copies every file into a
//!   [`SharedBuffer`](memory::SharedBuffer) and records their location in an [`AddressMap`](memory::AddressMap),
//! - [`ReadWorker`](worker::ReadWorker)s attach to the published buffer and answer reads by slicing it, without copying
//!   through the writer nor touching the disk.
//!
//! There is no lock manager between workers. The head of the buffer holds a
//! [`WorkerStateRegister`](memory::WorkerStateRegister): one atomic flag per worker, which every worker only flips for
//! itself. Readers flag themselves while slicing the buffer, and a writer announces any destructive update, waits for
//! readers to drain, then flags itself while writing. The register is advisory: it reports state and relies on every
//! participant to honor it.
//!
//! Within a worker, every access to the buffer goes through a [`Queue`](task::Queue) of [`Task`](task::Task)s, executed
//! one at a time, whose outcomes are published as typed notifications.
//!
//! Here is the layout of a shared buffer:
//!
//! ```text
//!     0   1   2 ..  5   6 ..       37  38         100                                  100 + capacity
//!     | W | R | writing | reading      | pending ... | a.txt | b/c.txt | ...  (free)    |
//! ```
//!
//! The address map is never persisted: it is rebuilt from the file system storage whenever the writer (re)starts.

pub mod config;
pub mod error;
pub mod events;
pub mod memory;
pub mod storage;
pub mod task;
pub mod worker;

pub use error::{Error, Result};
