//! Transactional key/value store contract.
//!
//! The metadata layer only needs snapshot-isolated transactions with point
//! reads and writes plus ordered forward scans. Backends:
//!
//! - [`memory::MemoryStore`]: in-process, snapshot per transaction,
//!   first-committer-wins on conflicting writes. Used by tests and tooling.
//! - [`sqlite::SqliteStore`]: durable store on SQLite through `sqlx`.

pub mod memory;
pub mod sqlite;

use crate::errors::MetaResult;
use crate::keys::KeyRange;
use async_trait::async_trait;
use bytes::Bytes;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// A handle on a transactional key/value store.
#[async_trait]
pub trait MetaStore: Send + Sync + 'static {
    type Txn: StoreTxn;

    /// Start a transaction observing a consistent snapshot of the store.
    async fn begin(&self) -> MetaResult<Self::Txn>;
}

/// One snapshot-isolated transaction.
///
/// Writes stay invisible to everyone else until [`StoreTxn::commit`]
/// succeeds. A failed commit leaves the store unchanged. Dropping an
/// uncommitted transaction discards its writes.
#[async_trait]
pub trait StoreTxn: Send + Sized {
    type Cursor: RangeCursor;

    /// `Ok(None)` when the key is absent.
    async fn get(&mut self, key: &[u8]) -> MetaResult<Option<Bytes>>;

    async fn set(&mut self, key: &[u8], value: &[u8]) -> MetaResult<()>;

    async fn delete(&mut self, key: &[u8]) -> MetaResult<()>;

    /// Open a forward cursor over `[range.lo, range.hi)`.
    ///
    /// The cursor takes over the transaction and its snapshot; the cursor's
    /// `close` ends the transaction without committing.
    async fn scan(self, range: KeyRange) -> MetaResult<Self::Cursor>;

    async fn commit(self) -> MetaResult<()>;

    /// End the transaction, discarding its writes.
    async fn rollback(self);
}

/// Forward-only cursor over a key range, positioned on the first entry when
/// opened.
///
/// `key` and `value` return empty slices once the cursor is no longer valid.
#[async_trait]
pub trait RangeCursor: Send + Sized {
    fn valid(&self) -> bool;

    /// Advance to the next entry. No-op once the cursor is exhausted.
    async fn next(&mut self) -> MetaResult<()>;

    fn key(&self) -> &[u8];

    fn value(&self) -> &[u8];

    /// Release the cursor's transaction.
    async fn close(self);
}
