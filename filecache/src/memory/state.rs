use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use super::SharedBuffer;
use crate::config::{
    MAX_READING_WORKERS, MAX_WRITING_WORKERS, START_OFFSET, STATE_STORAGE_LENGTH, WRITE_WAIT_INTERVAL, WRITE_WAIT_TIMEOUT,
};
use crate::error::{Error, Result, Role, Timeout};

// 0   1   2   3   4   5   6   7...         ...38
// |00 |00 |00 |00 |00 |00 |00 |00...       ...|00
// |   |   |   |   |   |   |   |               |
// |writers|   |   |   |   |   |               |
//     |readers|   |   |   |   |               |
//         |is_writing(1)  |   |               |
//             |is_writing(2)  |               |
//                 |is_writing(3)              |
//                     |is_writing(4)          |
//                         |is_reading(1)      |
//                             |is_reading(2)  |
//                                             |write_pending
const WRITERS_OFFSET: usize = 0;
const READERS_OFFSET: usize = 1;
const WRITE_PENDING_OFFSET: usize = START_OFFSET + MAX_WRITING_WORKERS as usize + MAX_READING_WORKERS as usize + 1;

const _: () = assert!(WRITE_PENDING_OFFSET < STATE_STORAGE_LENGTH);

#[inline]
const fn writer_offset(index: u8) -> usize {
    START_OFFSET + index as usize
}

#[inline]
const fn reader_offset(index: u8) -> usize {
    START_OFFSET + MAX_WRITING_WORKERS as usize + index as usize
}

/// Write activity as observed from the register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Idle,
    /// A writer announced a write, no reader is active.
    WritePending,
    /// A writer announced a write and waits for readers to drain.
    Draining,
    Writing,
}

/// Worker activity flags living at the head of a [`SharedBuffer`].
///
/// Every worker maps the same region and only flips its own flag, atomically, so transitions are visible to every other
/// worker without any lock. The register is advisory: it reports state and never enforces it. A destructive write must
/// follow the protocol exposed by [`begin_write`](Self::begin_write):
///
/// ```text
///     Idle --begin_write--> WritePending --drain--> Draining --readers drained--> Writing --drop--> Idle
/// ```
#[derive(Clone)]
pub struct WorkerStateRegister {
    buffer: Arc<SharedBuffer>,
    writers: u8,
    readers: u8,
}

impl WorkerStateRegister {
    /// Create a fresh register in its own anonymous region.
    ///
    /// Both quantities must be at least 1, up to [`MAX_WRITING_WORKERS`] writers and [`MAX_READING_WORKERS`] readers. A zero
    /// count is what an uninitialized header reads as, so [`from_buffer`](Self::from_buffer) rejects it too.
    pub fn new(writers: u8, readers: u8) -> Result<Self> {
        Self::with_buffer(Arc::new(SharedBuffer::anonymous(STATE_STORAGE_LENGTH)?), writers, readers)
    }

    /// Initialize a fresh register at the head of `buffer`, resetting every flag.
    pub fn with_buffer(buffer: Arc<SharedBuffer>, writers: u8, readers: u8) -> Result<Self> {
        Self::validate(writers, readers)?;

        for offset in 0..STATE_STORAGE_LENGTH {
            buffer.atomic(offset).store(0, Ordering::SeqCst);
        }
        buffer.atomic(WRITERS_OFFSET).store(writers, Ordering::SeqCst);
        buffer.atomic(READERS_OFFSET).store(readers, Ordering::SeqCst);

        Ok(Self {
            buffer,
            writers,
            readers,
        })
    }

    /// Attach to the register already living at the head of `buffer`.
    pub fn from_buffer(buffer: Arc<SharedBuffer>) -> Result<Self> {
        if buffer.len() < STATE_STORAGE_LENGTH {
            return Err(Error::InvalidConfiguration(format!(
                "buffer of {} bytes is too short for the state register",
                buffer.len()
            )));
        }

        let writers = buffer.atomic(WRITERS_OFFSET).load(Ordering::SeqCst);
        let readers = buffer.atomic(READERS_OFFSET).load(Ordering::SeqCst);

        Self::validate(writers, readers)?;

        Ok(Self {
            buffer,
            writers,
            readers,
        })
    }

    /// Rebuild a register, in its own anonymous region, from an exported snapshot.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < STATE_STORAGE_LENGTH {
            return Err(Error::InvalidConfiguration(format!(
                "buffer of {} bytes is too short for the state register",
                bytes.len()
            )));
        }

        let buffer = SharedBuffer::anonymous(STATE_STORAGE_LENGTH)?;
        buffer.write(0, &bytes[..STATE_STORAGE_LENGTH])?;

        Self::from_buffer(Arc::new(buffer))
    }

    fn validate(writers: u8, readers: u8) -> Result<()> {
        if !(1..=MAX_WRITING_WORKERS).contains(&writers) || !(1..=MAX_READING_WORKERS).contains(&readers) {
            return Err(Error::InvalidConfiguration(format!(
                "invalid workers quantity: {writers} writers (max {MAX_WRITING_WORKERS}), {readers} readers (max {MAX_READING_WORKERS})"
            )));
        }

        Ok(())
    }

    /// Snapshot of the whole register.
    pub fn export(&self) -> [u8; STATE_STORAGE_LENGTH] {
        std::array::from_fn(|offset| self.buffer.atomic(offset).load(Ordering::SeqCst))
    }

    /// The region this register lives in.
    #[inline]
    pub fn buffer(&self) -> &Arc<SharedBuffer> {
        &self.buffer
    }

    #[inline]
    pub fn writers(&self) -> u8 {
        self.writers
    }

    #[inline]
    pub fn readers(&self) -> u8 {
        self.readers
    }

    fn writer_flag(&self, index: u8) -> Result<&AtomicU8> {
        if index == 0 || index > self.writers {
            return Err(Error::IndexOutOfRange {
                role: Role::Writer,
                index,
                max: self.writers,
            });
        }

        Ok(self.buffer.atomic(writer_offset(index)))
    }

    fn reader_flag(&self, index: u8) -> Result<&AtomicU8> {
        if index == 0 || index > self.readers {
            return Err(Error::IndexOutOfRange {
                role: Role::Reader,
                index,
                max: self.readers,
            });
        }

        Ok(self.buffer.atomic(reader_offset(index)))
    }

    #[inline]
    fn write_pending_flag(&self) -> &AtomicU8 {
        self.buffer.atomic(WRITE_PENDING_OFFSET)
    }

    pub fn is_writing(&self, index: u8) -> Result<bool> {
        Ok(load(self.writer_flag(index)?))
    }

    pub fn is_reading(&self, index: u8) -> Result<bool> {
        Ok(load(self.reader_flag(index)?))
    }

    pub fn is_write_pending(&self) -> bool {
        load(self.write_pending_flag())
    }

    /// Set the writing flag of writer `index`, returning the previous value.
    pub fn set_writing(&self, index: u8, value: bool) -> Result<bool> {
        Ok(exchange(self.writer_flag(index)?, value))
    }

    /// Set the reading flag of reader `index`, returning the previous value.
    pub fn set_reading(&self, index: u8, value: bool) -> Result<bool> {
        Ok(exchange(self.reader_flag(index)?, value))
    }

    /// Set the write pending flag, returning the previous value.
    pub fn set_write_pending(&self, value: bool) -> bool {
        exchange(self.write_pending_flag(), value)
    }

    pub fn is_any_writing(&self) -> bool {
        (1..=self.writers).any(|index| load(self.buffer.atomic(writer_offset(index))))
    }

    pub fn is_any_reading(&self) -> bool {
        (1..=self.readers).any(|index| load(self.buffer.atomic(reader_offset(index))))
    }

    pub fn write_state(&self) -> WriteState {
        match (self.is_any_writing(), self.is_write_pending(), self.is_any_reading()) {
            (true, _, _) => WriteState::Writing,
            (false, true, true) => WriteState::Draining,
            (false, true, false) => WriteState::WritePending,
            (false, false, _) => WriteState::Idle,
        }
    }

    /// Wait until no reader holds its reading flag.
    ///
    /// The poll interval is scaled by `index` to desynchronize competing writers.
    pub async fn wait_to_write(&self, index: u8) -> Result<()> {
        self.writer_flag(index)?;

        let interval = WRITE_WAIT_INTERVAL * index.into();

        tokio::time::timeout(WRITE_WAIT_TIMEOUT, async {
            while self.is_any_reading() {
                tokio::time::sleep(interval).await;
            }
        })
        .await
        .map_err(|_| Error::Timeout(Timeout::WaitToWrite { worker: index }))
    }

    /// Announce a write from writer `index`.
    pub fn begin_write(&self, index: u8) -> Result<PendingWrite> {
        self.writer_flag(index)?;

        self.set_write_pending(true);

        tracing::trace!("Writer {index} announced a write.");

        Ok(PendingWrite {
            register: self.clone(),
            index,
        })
    }

    /// Flag reader `index` as reading, once no writer is writing.
    pub async fn begin_read(&self, index: u8) -> Result<ReadGuard> {
        self.reader_flag(index)?;

        tokio::time::timeout(WRITE_WAIT_TIMEOUT, async {
            loop {
                let guard = ReadGuard::new(self.clone(), index);

                // the reading flag is raised before checking writers, mirroring `PendingWrite::drain`
                if !self.is_any_writing() {
                    return guard;
                }

                drop(guard);
                tokio::time::sleep(WRITE_WAIT_INTERVAL).await;
            }
        })
        .await
        .map_err(|_| Error::Timeout(Timeout::WaitToRead { worker: index }))
    }
}

impl fmt::Debug for WorkerStateRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerStateRegister")
            .field("writers", &self.writers)
            .field("readers", &self.readers)
            .field("state", &self.write_state())
            .finish()
    }
}

#[inline]
fn load(flag: &AtomicU8) -> bool {
    flag.load(Ordering::SeqCst) != 0
}

#[inline]
fn exchange(flag: &AtomicU8, value: bool) -> bool {
    flag.swap(value.into(), Ordering::SeqCst) != 0
}

/// A write announced on the register, not started yet.
///
/// Dropping it withdraws the announcement.
#[derive(Debug)]
pub struct PendingWrite {
    register: WorkerStateRegister,
    index: u8,
}

impl PendingWrite {
    /// Wait for readers to drain, then flag the writer as writing.
    pub async fn drain(self) -> Result<ActiveWrite> {
        let index = self.index;
        let register = self.register.clone();

        tokio::time::timeout(WRITE_WAIT_TIMEOUT, async {
            loop {
                register.wait_to_write(index).await?;
                register.set_writing(index, true)?;

                // a reader may have raised its flag between the drain and the writing flag
                if !register.is_any_reading() {
                    return Ok::<_, Error>(());
                }

                register.set_writing(index, false)?;
                tokio::time::sleep(WRITE_WAIT_INTERVAL * index.into()).await;
            }
        })
        .await
        .map_err(|_| Error::Timeout(Timeout::WaitToWrite { worker: index }))??;

        tracing::trace!("Writer {index} is writing.");

        Ok(ActiveWrite { pending: self })
    }

    #[inline]
    pub fn index(&self) -> u8 {
        self.index
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        self.register.set_write_pending(false);
    }
}

/// An exclusive write in progress.
///
/// Dropping it clears the writing flag, then the pending flag.
#[derive(Debug)]
pub struct ActiveWrite {
    pending: PendingWrite,
}

impl ActiveWrite {
    #[inline]
    pub fn index(&self) -> u8 {
        self.pending.index
    }
}

impl Drop for ActiveWrite {
    fn drop(&mut self) {
        let _ = self.pending.register.set_writing(self.pending.index, false);

        tracing::trace!("Writer {} is done writing.", self.pending.index);
    }
}

/// A reader flagged as reading, cleared on drop.
#[derive(Debug)]
pub struct ReadGuard {
    register: WorkerStateRegister,
    index: u8,
}

impl ReadGuard {
    fn new(register: WorkerStateRegister, index: u8) -> Self {
        let _ = register.set_reading(index, true);

        Self { register, index }
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        let _ = self.register.set_reading(self.index, false);
    }
}
