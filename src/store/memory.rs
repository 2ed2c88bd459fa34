//! In-process transactional store.
//!
//! Committed state is an `im::OrdMap`, so a snapshot is an O(1) clone taken
//! when a transaction begins. Transactions buffer writes locally and apply
//! them atomically on commit, after checking that no key they write was
//! committed by someone else since their snapshot (first committer wins).

use super::{MetaStore, RangeCursor, StoreTxn};
use crate::errors::{MetaError, MetaResult};
use crate::keys::KeyRange;
use async_trait::async_trait;
use bytes::Bytes;
use im::OrdMap;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};

type Snapshot = OrdMap<Vec<u8>, Bytes>;

#[derive(Debug, Default)]
struct Shared {
    data: Snapshot,
    /// Commit version that last wrote (or deleted) each key.
    written_at: HashMap<Vec<u8>, u64>,
    version: u64,
    failing_commits: usize,
    failing_scans: Vec<Vec<u8>>,
}

/// Thread-safe in-memory store. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail without applying any write.
    pub fn inject_commit_failure(&self, count: usize) -> MetaResult<()> {
        self.lock()?.failing_commits = count;
        Ok(())
    }

    /// Make every scan whose lower bound starts with `prefix` fail to open.
    pub fn inject_scan_failure(&self, prefix: impl Into<Vec<u8>>) -> MetaResult<()> {
        self.lock()?.failing_scans.push(prefix.into());
        Ok(())
    }

    pub fn clear_failures(&self) -> MetaResult<()> {
        let mut shared = self.lock()?;
        shared.failing_commits = 0;
        shared.failing_scans.clear();
        Ok(())
    }

    /// Number of committed keys.
    pub fn len(&self) -> MetaResult<usize> {
        Ok(self.lock()?.data.len())
    }

    pub fn is_empty(&self) -> MetaResult<bool> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> MetaResult<MutexGuard<'_, Shared>> {
        lock(&self.shared)
    }
}

fn lock(shared: &Mutex<Shared>) -> MetaResult<MutexGuard<'_, Shared>> {
    shared
        .lock()
        .map_err(|_| MetaError::store("memory store lock poisoned"))
}

#[async_trait]
impl MetaStore for MemoryStore {
    type Txn = MemoryTxn;

    async fn begin(&self) -> MetaResult<MemoryTxn> {
        let shared = self.lock()?;
        Ok(MemoryTxn {
            shared: Arc::clone(&self.shared),
            snapshot: shared.data.clone(),
            start_version: shared.version,
            writes: BTreeMap::new(),
        })
    }
}

#[derive(Debug)]
pub struct MemoryTxn {
    shared: Arc<Mutex<Shared>>,
    snapshot: Snapshot,
    start_version: u64,
    /// `None` marks a buffered delete.
    writes: BTreeMap<Vec<u8>, Option<Bytes>>,
}

#[async_trait]
impl StoreTxn for MemoryTxn {
    type Cursor = MemoryCursor;

    async fn get(&mut self, key: &[u8]) -> MetaResult<Option<Bytes>> {
        if let Some(pending) = self.writes.get(key) {
            return Ok(pending.clone());
        }
        Ok(self.snapshot.get(key).cloned())
    }

    async fn set(&mut self, key: &[u8], value: &[u8]) -> MetaResult<()> {
        self.writes
            .insert(key.to_vec(), Some(Bytes::copy_from_slice(value)));
        Ok(())
    }

    async fn delete(&mut self, key: &[u8]) -> MetaResult<()> {
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }

    async fn scan(self, range: KeyRange) -> MetaResult<MemoryCursor> {
        {
            let shared = lock(&self.shared)?;
            if shared
                .failing_scans
                .iter()
                .any(|prefix| range.lo.starts_with(prefix))
            {
                return Err(MetaError::store(format!(
                    "injected scan failure for `{}`",
                    String::from_utf8_lossy(&range.lo)
                )));
            }
        }

        // The cursor sees the snapshot plus this transaction's own writes.
        let mut view = self.snapshot;
        for (key, value) in self.writes {
            match value {
                Some(value) => {
                    view.insert(key, value);
                }
                None => {
                    view.remove(&key);
                }
            }
        }
        Ok(MemoryCursor::open(view, range))
    }

    async fn commit(self) -> MetaResult<()> {
        let mut shared = lock(&self.shared)?;
        if shared.failing_commits > 0 {
            shared.failing_commits -= 1;
            return Err(MetaError::store("injected commit failure"));
        }
        if self.writes.is_empty() {
            return Ok(());
        }
        if let Some(key) = self.writes.keys().find(|key| {
            shared
                .written_at
                .get(*key)
                .is_some_and(|version| *version > self.start_version)
        }) {
            return Err(MetaError::store(format!(
                "write conflict on key `{}`",
                String::from_utf8_lossy(key)
            )));
        }

        shared.version += 1;
        let version = shared.version;
        for (key, value) in self.writes {
            match value {
                Some(value) => {
                    shared.data.insert(key.clone(), value);
                }
                None => {
                    shared.data.remove(&key);
                }
            }
            shared.written_at.insert(key, version);
        }
        Ok(())
    }

    async fn rollback(self) {}
}

/// Cursor over a private snapshot view; holds no lock while open.
#[derive(Debug)]
pub struct MemoryCursor {
    view: Snapshot,
    hi: Vec<u8>,
    current: Option<(Vec<u8>, Bytes)>,
}

impl MemoryCursor {
    fn open(view: Snapshot, range: KeyRange) -> Self {
        let current = if range.lo < range.hi {
            Self::first_after(&view, Bound::Included(range.lo.as_slice()), &range.hi)
        } else {
            None
        };
        Self {
            view,
            hi: range.hi,
            current,
        }
    }

    fn first_after(view: &Snapshot, lower: Bound<&[u8]>, hi: &[u8]) -> Option<(Vec<u8>, Bytes)> {
        view.range::<_, [u8]>((lower, Bound::Excluded(hi)))
            .next()
            .map(|(key, value)| (key.clone(), value.clone()))
    }
}

#[async_trait]
impl RangeCursor for MemoryCursor {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    async fn next(&mut self) -> MetaResult<()> {
        if let Some((key, _)) = self.current.take() {
            self.current =
                Self::first_after(&self.view, Bound::Excluded(key.as_slice()), &self.hi);
        }
        Ok(())
    }

    fn key(&self) -> &[u8] {
        self.current
            .as_ref()
            .map(|(key, _)| key.as_slice())
            .unwrap_or_default()
    }

    fn value(&self) -> &[u8] {
        self.current
            .as_ref()
            .map(|(_, value)| &value[..])
            .unwrap_or_default()
    }

    async fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn put(store: &MemoryStore, key: &str, value: &str) {
        let mut txn = store.begin().await.unwrap();
        txn.set(key.as_bytes(), value.as_bytes()).await.unwrap();
        txn.commit().await.unwrap();
    }

    async fn collect(store: &MemoryStore, lo: &str, hi: &str) -> Vec<String> {
        let txn = store.begin().await.unwrap();
        let mut cursor = txn.scan(KeyRange::new(lo, hi)).await.unwrap();
        let mut keys = Vec::new();
        while cursor.valid() {
            keys.push(String::from_utf8(cursor.key().to_vec()).unwrap());
            cursor.next().await.unwrap();
        }
        cursor.close().await;
        keys
    }

    #[tokio::test]
    async fn scan_is_ordered_and_half_open() {
        let store = MemoryStore::new();
        for key in ["b", "a", "d", "c", "e"] {
            put(&store, key, "v").await;
        }
        assert_eq!(collect(&store, "b", "e").await, vec!["b", "c", "d"]);
        assert!(collect(&store, "x", "z").await.is_empty());
        assert!(collect(&store, "z", "a").await.is_empty());
    }

    #[tokio::test]
    async fn snapshot_ignores_later_commits() {
        let store = MemoryStore::new();
        put(&store, "k1", "old").await;

        let mut reader = store.begin().await.unwrap();
        put(&store, "k1", "new").await;
        put(&store, "k2", "v").await;

        assert_eq!(reader.get(b"k1").await.unwrap().unwrap(), Bytes::from("old"));
        assert!(reader.get(b"k2").await.unwrap().is_none());
        let mut cursor = reader.scan(KeyRange::new("k", "l")).await.unwrap();
        assert_eq!(cursor.key(), b"k1");
        cursor.next().await.unwrap();
        assert!(!cursor.valid());
        assert!(cursor.key().is_empty());
    }

    #[tokio::test]
    async fn own_writes_are_visible_before_commit() {
        let store = MemoryStore::new();
        put(&store, "a", "1").await;

        let mut txn = store.begin().await.unwrap();
        txn.delete(b"a").await.unwrap();
        txn.set(b"b", b"2").await.unwrap();
        assert!(txn.get(b"a").await.unwrap().is_none());
        let cursor = txn.scan(KeyRange::new("a", "c")).await.unwrap();
        assert_eq!(cursor.key(), b"b");
        cursor.close().await;

        // Never committed.
        assert_eq!(collect(&store, "a", "c").await, vec!["a"]);
    }

    #[tokio::test]
    async fn first_committer_wins() {
        let store = MemoryStore::new();
        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first.set(b"k", b"1").await.unwrap();
        second.set(b"k", b"2").await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(err.is_store_failure());

        let mut txn = store.begin().await.unwrap();
        assert_eq!(txn.get(b"k").await.unwrap().unwrap(), Bytes::from("1"));
    }

    #[tokio::test]
    async fn failed_commit_applies_nothing() {
        let store = MemoryStore::new();
        store.inject_commit_failure(1).unwrap();

        let mut txn = store.begin().await.unwrap();
        txn.set(b"a", b"1").await.unwrap();
        txn.set(b"b", b"2").await.unwrap();
        assert!(txn.commit().await.is_err());
        assert!(store.is_empty().unwrap());

        put(&store, "a", "1").await;
        assert_eq!(store.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn injected_scan_failure() {
        let store = MemoryStore::new();
        store.inject_scan_failure("MULTIPART#").unwrap();
        let txn = store.begin().await.unwrap();
        assert!(txn.scan(KeyRange::new("MULTIPART#", "MULTIPART$")).await.is_err());

        store.clear_failures().unwrap();
        let txn = store.begin().await.unwrap();
        assert!(txn.scan(KeyRange::new("MULTIPART#", "MULTIPART$")).await.is_ok());
    }
}
