//! Transaction patterns shared by every entity service.

use super::cursor::MetaCursor;
use crate::errors::{MetaError, MetaResult};
use crate::keys::{KeyRange, TombstoneClock};
use crate::models::Record;
use crate::store::{MetaStore, RangeCursor, StoreTxn};
use bytes::Bytes;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::debug;

/// Raw cursor type produced by a store's transactions.
pub type StoreCursor<S> = <<S as MetaStore>::Txn as StoreTxn>::Cursor;

/// One raw entry returned by a materialized scan.
#[derive(Debug, Clone, PartialEq)]
pub struct Kv {
    pub key: Vec<u8>,
    pub value: Bytes,
}

impl Kv {
    pub fn key_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }
}

/// Upper bound on the number of entries a materialized scan returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Unbounded,
    AtMost(usize),
}

impl Limit {
    fn reached(self, taken: usize) -> bool {
        matches!(self, Limit::AtMost(max) if taken >= max)
    }
}

/// Owned handle on the metadata store.
///
/// Cheap to clone; every clone shares the same store and tombstone clock.
pub struct MetaHandle<S> {
    store: Arc<S>,
    clock: Arc<TombstoneClock>,
}

impl<S> Clone for MetaHandle<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S: MetaStore> MetaHandle<S> {
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(store),
            clock: Arc::new(TombstoneClock::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Timestamp for the next tombstone key written through this handle.
    pub fn next_tombstone_ts(&self) -> i64 {
        self.clock.next()
    }

    /// Read one key in a short read-only transaction.
    pub async fn get(&self, key: &[u8]) -> MetaResult<Option<Bytes>> {
        let mut txn = self.store.begin().await?;
        let value = txn.get(key).await;
        txn.rollback().await;
        value
    }

    /// Read and decode one record; `Ok(None)` when absent.
    pub async fn get_record<T: Record>(&self, key: &[u8]) -> MetaResult<Option<T>> {
        match self.get(key).await? {
            Some(raw) => T::decode(&raw)
                .map(Some)
                .map_err(|err| MetaError::decode(key, err)),
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: &[u8], value: &[u8]) -> MetaResult<()> {
        let mut txn = self.store.begin().await?;
        txn.set(key, value).await?;
        txn.commit().await
    }

    /// Write `value` only when `key` is absent.
    ///
    /// Optimistic: the existence check and the write share one transaction,
    /// and a concurrent writer of the same key makes the commit fail.
    pub async fn set_if_absent(&self, key: &[u8], value: &[u8]) -> MetaResult<()> {
        let mut txn = self.store.begin().await?;
        if txn.get(key).await?.is_some() {
            txn.rollback().await;
            return Err(MetaError::already_exists(key));
        }
        txn.set(key, value).await?;
        txn.commit().await
    }

    /// Remove every key in one transaction. Absent keys are ignored.
    pub async fn delete_keys(&self, keys: &[&[u8]]) -> MetaResult<()> {
        let mut txn = self.store.begin().await?;
        for key in keys {
            txn.delete(key).await?;
        }
        txn.commit().await
    }

    /// Overwrite `key`, first copying its prior value (if any) to
    /// `tombstone_key`, all in one transaction.
    ///
    /// Returns whether a prior value was tombstoned.
    pub async fn save_with_tombstone(
        &self,
        key: &[u8],
        tombstone_key: &[u8],
        value: &[u8],
    ) -> MetaResult<bool> {
        let mut txn = self.store.begin().await?;
        let prior = txn.get(key).await?;
        if let Some(prior) = &prior {
            txn.set(tombstone_key, prior).await?;
        }
        txn.set(key, value).await?;
        txn.commit().await?;
        Ok(prior.is_some())
    }

    /// Move the live value of `key` to `tombstone_key` in one transaction.
    ///
    /// Fails with `NotFound` when `key` is already absent.
    pub async fn mark_deleted(&self, key: &[u8], tombstone_key: &[u8]) -> MetaResult<()> {
        let mut txn = self.store.begin().await?;
        let Some(value) = txn.get(key).await? else {
            txn.rollback().await;
            return Err(MetaError::not_found(key));
        };
        txn.set(tombstone_key, &value).await?;
        txn.delete(key).await?;
        txn.commit().await
    }

    /// Write a tombstone for a caller-supplied value; the live key is left alone.
    pub async fn put_tombstone(&self, tombstone_key: &[u8], value: &[u8]) -> MetaResult<()> {
        self.set(tombstone_key, value).await
    }

    /// Materialize every entry under `prefix`, up to `limit`.
    pub async fn list(&self, prefix: &[u8], limit: Limit) -> MetaResult<Vec<Kv>> {
        self.scan(KeyRange::prefix(prefix)?, limit).await
    }

    /// Materialize the entries of `range`, up to `limit`.
    pub async fn scan(&self, range: KeyRange, limit: Limit) -> MetaResult<Vec<Kv>> {
        let txn = self.store.begin().await?;
        let mut cursor = txn.scan(range).await?;
        let mut out = Vec::new();
        let result = loop {
            if !cursor.valid() || limit.reached(out.len()) {
                break Ok(());
            }
            out.push(Kv {
                key: cursor.key().to_vec(),
                value: Bytes::copy_from_slice(cursor.value()),
            });
            if let Err(err) = cursor.next().await {
                break Err(err);
            }
        };
        cursor.close().await;
        debug!(entries = out.len(), "materialized scan finished");
        result.map(|()| out)
    }

    /// Open a streaming cursor over `range` decoding entries as `T`.
    pub async fn iter<T: Record>(
        &self,
        range: KeyRange,
    ) -> MetaResult<MetaCursor<T, StoreCursor<S>>> {
        let txn = self.store.begin().await?;
        Ok(MetaCursor::new(txn.scan(range).await?))
    }
}

/// Decode every entry of a materialized scan, failing on the first bad value.
pub(crate) fn decode_all<T: Record>(kvs: Vec<Kv>) -> MetaResult<Vec<(String, T)>> {
    kvs.into_iter()
        .map(|kv| -> MetaResult<(String, T)> {
            let record = T::decode(&kv.value)
                .map_err(|err| MetaError::decode(&kv.key, err))?;
            Ok((kv.key_str().into_owned(), record))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn set_if_absent_keeps_first_value() {
        let meta = MetaHandle::new(MemoryStore::new());
        meta.set_if_absent(b"k", b"first").await.unwrap();
        let err = meta.set_if_absent(b"k", b"second").await.unwrap_err();
        assert!(matches!(err, MetaError::AlreadyExists { .. }));
        assert_eq!(meta.get(b"k").await.unwrap().unwrap(), Bytes::from("first"));
    }

    #[tokio::test]
    async fn list_respects_limit_and_prefix() {
        let meta = MetaHandle::new(MemoryStore::new());
        for key in ["p#1", "p#2", "p#3", "q#1"] {
            meta.set(key.as_bytes(), b"v").await.unwrap();
        }
        assert_eq!(meta.list(b"p#", Limit::Unbounded).await.unwrap().len(), 3);
        let two = meta.list(b"p#", Limit::AtMost(2)).await.unwrap();
        assert_eq!(
            two.iter().map(|kv| kv.key_str().into_owned()).collect::<Vec<_>>(),
            vec!["p#1", "p#2"]
        );
        assert!(meta.list(b"p#", Limit::AtMost(0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_deleted_requires_live_key() {
        let meta = MetaHandle::new(MemoryStore::new());
        let err = meta.mark_deleted(b"live", b"tomb").await.unwrap_err();
        assert!(matches!(err, MetaError::NotFound { .. }));

        meta.set(b"live", b"v").await.unwrap();
        meta.mark_deleted(b"live", b"tomb").await.unwrap();
        assert!(meta.get(b"live").await.unwrap().is_none());
        assert_eq!(meta.get(b"tomb").await.unwrap().unwrap(), Bytes::from("v"));
    }

    #[tokio::test]
    async fn delete_keys_is_one_transaction() {
        let store = MemoryStore::new();
        let meta = MetaHandle::new(store.clone());
        meta.set(b"a", b"1").await.unwrap();
        meta.set(b"b", b"2").await.unwrap();

        store.inject_commit_failure(1).unwrap();
        assert!(meta.delete_keys(&[b"a".as_slice(), b"b"]).await.is_err());
        assert_eq!(store.len().unwrap(), 2);

        meta
            .delete_keys(&[b"a".as_slice(), b"b", b"missing"])
            .await
            .unwrap();
        assert!(store.is_empty().unwrap());
    }
}
