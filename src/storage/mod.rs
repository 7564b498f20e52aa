//! External storage for blocks that don't fit in memory.
//!
//! The registry only ever hands a storage opaque serialized records and gets
//! back a handle. Reading a record consumes it.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use hashbrown::HashMap;

use crate::{
    error::{Error, Result},
    serialization::BinaryBuffer,
};

#[cfg(feature = "file-storage")]
mod file;

#[cfg(feature = "file-storage")]
pub use file::{FileStorage, FileStorageConfig};

pub type StorageHandle = u64;

pub trait Storage: Send + Sync {
    /// Stores a record and returns the handle to fetch it with.
    fn put(&self, record: BinaryBuffer) -> Result<StorageHandle>;

    /// Returns the record and forgets it.
    fn get(&self, handle: StorageHandle) -> Result<BinaryBuffer>;

    /// Forgets a record without reading it.
    fn discard(&self, handle: StorageHandle) -> Result<()>;

    /// Records currently stored.
    fn count(&self) -> usize;

    /// The most records ever stored at once.
    fn max_size(&self) -> usize;
}

/// Keeps the counters every storage reports.
#[derive(Debug, Default)]
pub(crate) struct Occupancy {
    next: AtomicU64,
    count: AtomicUsize,
    max: AtomicUsize,
}

impl Occupancy {
    pub(crate) fn next_handle(&self) -> StorageHandle {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn added(&self) {
        let now = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        self.max.fetch_max(now, Ordering::AcqRel);
    }

    pub(crate) fn removed(&self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn max(&self) -> usize {
        self.max.load(Ordering::Acquire)
    }
}

/// Storage that keeps serialized records on the heap. Useful for tests and
/// for trading memory held in live blocks for compact serialized form.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: Mutex<HashMap<StorageHandle, Vec<u8>>>,
    occupancy: Occupancy,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<StorageHandle, Vec<u8>>>>
    {
        self.records
            .lock()
            .map_err(|_| Error::Aborted("memory storage lock poisoned".into()))
    }
}

impl Storage for MemoryStorage {
    fn put(&self, record: BinaryBuffer) -> Result<StorageHandle> {
        let handle = self.occupancy.next_handle();
        self.records()?.insert(handle, record.into_vec());
        self.occupancy.added();
        Ok(handle)
    }

    fn get(&self, handle: StorageHandle) -> Result<BinaryBuffer> {
        let bytes = self
            .records()?
            .remove(&handle)
            .ok_or(Error::MissingRecord(handle))?;
        self.occupancy.removed();
        Ok(BinaryBuffer::from_vec(bytes))
    }

    fn discard(&self, handle: StorageHandle) -> Result<()> {
        self.records()?
            .remove(&handle)
            .ok_or(Error::MissingRecord(handle))?;
        self.occupancy.removed();
        Ok(())
    }

    fn count(&self) -> usize {
        self.occupancy.count()
    }

    fn max_size(&self) -> usize {
        self.occupancy.max()
    }
}
