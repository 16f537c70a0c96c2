//! Port definition for the journaled key/value store behind the disk tier.
//!
//! The store is crash-consistent and atomic on commit. Callers never observe a
//! partially written entry: an uncommitted edit is invisible to `get`.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::entities::DiskDigest;
use crate::domain::errors::StoreResult;

/// Opens a store rooted at a directory.
#[async_trait]
pub trait StoreOpener: Send + Sync {
    /// Opens (or creates) the store.
    ///
    /// An existing store written with a different `app_version` or
    /// `value_count` is discarded.
    async fn open(
        &self,
        directory: &Path,
        app_version: u32,
        value_count: usize,
        max_size: u64,
    ) -> StoreResult<Box<dyn JournaledStore>>;
}

/// An open journaled store.
#[async_trait]
pub trait JournaledStore: Send + Sync {
    /// Returns a snapshot of the committed entry, or `None` if absent.
    async fn get(&self, digest: &DiskDigest) -> StoreResult<Option<Box<dyn Snapshot>>>;

    /// Starts an edit, or returns `None` if another edit is in progress.
    async fn edit(&self, digest: &DiskDigest) -> StoreResult<Option<Box<dyn Editor>>>;

    /// Persists the journal.
    async fn flush(&self) -> StoreResult<()>;

    /// Flushes and closes the store. Closing twice is a no-op.
    async fn close(&self) -> StoreResult<()>;

    /// Closes the store and deletes everything in its directory.
    async fn delete(&self) -> StoreResult<()>;

    /// True once closed.
    fn is_closed(&self) -> bool;

    /// Bytes currently committed.
    fn size(&self) -> u64;

    /// Configured byte budget.
    fn max_size(&self) -> u64;
}

/// Read handle on a committed entry. Dropping it releases the handle.
#[async_trait]
pub trait Snapshot: Send {
    /// Reads the value at `index` to the end.
    async fn read_value(&mut self, index: usize) -> StoreResult<Bytes>;
}

/// Write handle on an entry. Dropping it without committing discards the edit.
#[async_trait]
pub trait Editor: Send {
    /// Sets the value at `index`.
    fn set_value(&mut self, index: usize, value: Bytes) -> StoreResult<()>;

    /// Atomically publishes every value set on this editor.
    async fn commit(self: Box<Self>) -> StoreResult<()>;

    /// Discards the edit.
    async fn abort(self: Box<Self>) -> StoreResult<()>;
}
