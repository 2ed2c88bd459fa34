//! Object records and their tombstones.
//!
//! Every overwrite or soft delete of a live object first copies the prior
//! record to a fresh `DELETED_OBJECT#{ts}#...` key in the same transaction,
//! so reachability analysis sees both live and tombstoned objects.

use super::cursor::MetaCursor;
use super::meta::{Limit, MetaHandle, StoreCursor, decode_all};
use crate::errors::{MetaError, MetaResult};
use crate::keys::{
    self, DELETED_OBJECT_PREFIX, KeyRange, bucket_object_prefix, deleted_object_key, object_key,
    validate_bucket_name, validate_name,
};
use crate::models::{ObjectInfo, Record};
use crate::store::MetaStore;
use tracing::debug;

pub type ObjectCursor<S> = MetaCursor<ObjectInfo, StoreCursor<S>>;

#[derive(Clone)]
pub struct ObjectService<S> {
    meta: MetaHandle<S>,
}

impl<S: MetaStore> ObjectService<S> {
    pub fn new(meta: MetaHandle<S>) -> Self {
        Self { meta }
    }

    fn live_key(bucket: &str, name: &str) -> MetaResult<String> {
        validate_bucket_name(bucket)?;
        validate_name("object name", name)?;
        Ok(object_key(bucket, name))
    }

    fn tombstone_key(&self, bucket: &str, name: &str) -> String {
        deleted_object_key(self.meta.next_tombstone_ts(), bucket, name)
    }

    /// Write `info` as the live record, tombstoning the previous record if
    /// there was one. Returns whether a tombstone was written.
    pub async fn save_object(
        &self,
        bucket: &str,
        name: &str,
        info: &ObjectInfo,
    ) -> MetaResult<bool> {
        let key = Self::live_key(bucket, name)?;
        let value = info.encode().map_err(MetaError::Encode)?;
        let tombstoned = self
            .meta
            .save_with_tombstone(
                key.as_bytes(),
                self.tombstone_key(bucket, name).as_bytes(),
                &value,
            )
            .await?;
        debug!(bucket, object = name, tombstoned, "saved object");
        Ok(tombstoned)
    }

    /// `Ok(None)` when no live record exists.
    pub async fn get_object(&self, bucket: &str, name: &str) -> MetaResult<Option<ObjectInfo>> {
        let key = Self::live_key(bucket, name)?;
        self.meta.get_record(key.as_bytes()).await
    }

    /// Remove the live record without leaving a tombstone.
    pub async fn delete_object(&self, bucket: &str, name: &str) -> MetaResult<()> {
        let key = Self::live_key(bucket, name)?;
        self.meta.delete_keys(&[key.as_bytes()]).await
    }

    /// Soft delete: move the live record to a tombstone. Fails with
    /// `NotFound` when there is no live record.
    pub async fn mark_object_deleted(&self, bucket: &str, name: &str) -> MetaResult<()> {
        let key = Self::live_key(bucket, name)?;
        self.meta
            .mark_deleted(key.as_bytes(), self.tombstone_key(bucket, name).as_bytes())
            .await?;
        debug!(bucket, object = name, "marked object deleted");
        Ok(())
    }

    /// Record a tombstone for `info` without touching the live key.
    pub async fn mark_object_deleted_with_value(
        &self,
        bucket: &str,
        name: &str,
        info: &ObjectInfo,
    ) -> MetaResult<()> {
        Self::live_key(bucket, name)?;
        let value = info.encode().map_err(MetaError::Encode)?;
        self.meta
            .put_tombstone(self.tombstone_key(bucket, name).as_bytes(), &value)
            .await
    }

    /// Live objects of `bucket` whose name starts with `prefix`, as
    /// `(key, record)` pairs in key order.
    pub async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        limit: Limit,
    ) -> MetaResult<Vec<(String, ObjectInfo)>> {
        validate_bucket_name(bucket)?;
        let key_prefix = format!("{}{prefix}", bucket_object_prefix(bucket));
        decode_all(self.meta.list(key_prefix.as_bytes(), limit).await?)
    }

    /// Tombstones whose key continues `DELETED_OBJECT#` with `start`
    /// (typically a timestamp prefix), oldest first.
    pub async fn list_deleted_objects(
        &self,
        start: &str,
        limit: Limit,
    ) -> MetaResult<Vec<(String, ObjectInfo)>> {
        let key_prefix = format!("{DELETED_OBJECT_PREFIX}{start}");
        decode_all(self.meta.list(key_prefix.as_bytes(), limit).await?)
    }

    /// Purge one tombstone. Refuses keys outside the tombstone family.
    pub async fn delete_by_deleted_key(&self, key: &str) -> MetaResult<()> {
        if keys::parse_deleted_object_key(key).is_none() {
            return Err(MetaError::InvalidKey(format!(
                "`{key}` is not a deleted object key"
            )));
        }
        self.meta.delete_keys(&[key.as_bytes()]).await
    }

    /// Key range holding exactly the live objects of `bucket`.
    pub fn bucket_object_range(bucket: &str) -> MetaResult<KeyRange> {
        validate_bucket_name(bucket)?;
        KeyRange::prefix(bucket_object_prefix(bucket))
    }

    /// Key range holding every object tombstone, across all buckets.
    pub fn deleted_object_range() -> MetaResult<KeyRange> {
        KeyRange::prefix(DELETED_OBJECT_PREFIX)
    }

    /// Object name of `key` when it is a live object key of `bucket`.
    pub fn object_name_from_key<'a>(bucket: &str, key: &'a str) -> Option<&'a str> {
        keys::parse_object_key(key)
            .filter(|(key_bucket, _)| *key_bucket == bucket)
            .map(|(_, name)| name)
    }

    /// Stream the live objects of `bucket`.
    pub async fn bucket_objects_iter(&self, bucket: &str) -> MetaResult<ObjectCursor<S>> {
        self.meta.iter(Self::bucket_object_range(bucket)?).await
    }

    /// Stream every object tombstone.
    pub async fn deleted_objects_iter(&self) -> MetaResult<ObjectCursor<S>> {
        self.meta.iter(Self::deleted_object_range()?).await
    }
}
