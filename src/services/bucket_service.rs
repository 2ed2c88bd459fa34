//! Bucket records: create-if-absent, lookup, hard delete, listing.

use super::meta::{Limit, MetaHandle, decode_all};
use crate::errors::{MetaError, MetaResult};
use crate::keys::{BUCKET_PREFIX, bucket_key, validate_bucket_name};
use crate::models::{BucketInfo, Record};
use crate::store::MetaStore;
use tracing::debug;

#[derive(Clone)]
pub struct BucketService<S> {
    meta: MetaHandle<S>,
}

impl<S: MetaStore> BucketService<S> {
    pub fn new(meta: MetaHandle<S>) -> Self {
        Self { meta }
    }

    /// Store a new bucket record under `info.name`.
    ///
    /// Returns `AlreadyExists` if the bucket is already present; the stored
    /// record is left untouched in that case.
    pub async fn create_bucket(&self, info: &BucketInfo) -> MetaResult<()> {
        validate_bucket_name(&info.name)?;
        let value = info.encode().map_err(MetaError::Encode)?;
        self.meta
            .set_if_absent(bucket_key(&info.name).as_bytes(), &value)
            .await?;
        debug!(bucket = %info.name, "created bucket");
        Ok(())
    }

    /// `Ok(None)` when the bucket does not exist.
    pub async fn get_bucket(&self, name: &str) -> MetaResult<Option<BucketInfo>> {
        validate_bucket_name(name)?;
        self.meta.get_record(bucket_key(name).as_bytes()).await
    }

    /// Hard delete; no tombstone is kept for buckets.
    pub async fn delete_bucket(&self, name: &str) -> MetaResult<()> {
        validate_bucket_name(name)?;
        self.meta
            .delete_keys(&[bucket_key(name).as_bytes()])
            .await
    }

    /// Every bucket, in name order. A record that fails to decode aborts
    /// the listing.
    pub async fn list_buckets(&self) -> MetaResult<Vec<BucketInfo>> {
        let kvs = self
            .meta
            .list(BUCKET_PREFIX.as_bytes(), Limit::Unbounded)
            .await?;
        Ok(decode_all::<BucketInfo>(kvs)?
            .into_iter()
            .map(|(_, info)| info)
            .collect())
    }

    pub async fn list_buckets_by_type(&self, kind: &str) -> MetaResult<Vec<BucketInfo>> {
        Ok(self
            .list_buckets()
            .await?
            .into_iter()
            .filter(|info| info.kind == kind)
            .collect())
    }
}
