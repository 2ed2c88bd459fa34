//! Fragment records of multipart uploads.
//!
//! Live fragments sit under `MULTIPART#`; their tombstones use the separate
//! `DELETED_MULTIPART#` family so a scan of live fragments never picks them
//! up.

use super::cursor::MetaCursor;
use super::meta::{Limit, MetaHandle, StoreCursor, decode_all};
use crate::errors::{MetaError, MetaResult};
use crate::keys::{
    DELETED_MULTIPART_PREFIX, KeyRange, MULTIPART_PREFIX, deleted_multipart_key, multipart_key,
    parse_multipart_key, prefix_upper, upload_fragment_prefix, validate_bucket_name, validate_name,
};
use crate::models::{FragmentRecord, Record};
use crate::store::MetaStore;
use tracing::debug;

pub type FragmentCursor<S> = MetaCursor<FragmentRecord, StoreCursor<S>>;

/// Page size used when a fragment listing asks for "no limit" (0).
pub const DEFAULT_FRAGMENT_LIST_LIMIT: usize = 10_000;

#[derive(Clone)]
pub struct MultipartService<S> {
    meta: MetaHandle<S>,
}

impl<S: MetaStore> MultipartService<S> {
    pub fn new(meta: MetaHandle<S>) -> Self {
        Self { meta }
    }

    fn live_key(bucket: &str, upload_id: &str, index: u32) -> MetaResult<String> {
        validate_bucket_name(bucket)?;
        validate_name("upload id", upload_id)?;
        Ok(multipart_key(bucket, upload_id, index))
    }

    fn tombstone_key(&self, bucket: &str, upload_id: &str, index: u32) -> String {
        deleted_multipart_key(self.meta.next_tombstone_ts(), bucket, upload_id, index)
    }

    /// Write a fragment record, tombstoning any previous record for the
    /// same fragment. Returns whether a tombstone was written.
    pub async fn save_fragment(
        &self,
        bucket: &str,
        upload_id: &str,
        index: u32,
        record: &FragmentRecord,
    ) -> MetaResult<bool> {
        let key = Self::live_key(bucket, upload_id, index)?;
        let value = record.encode().map_err(MetaError::Encode)?;
        let tombstoned = self
            .meta
            .save_with_tombstone(
                key.as_bytes(),
                self.tombstone_key(bucket, upload_id, index).as_bytes(),
                &value,
            )
            .await?;
        debug!(bucket, upload_id, index, "saved fragment");
        Ok(tombstoned)
    }

    pub async fn get_fragment(
        &self,
        bucket: &str,
        upload_id: &str,
        index: u32,
    ) -> MetaResult<Option<FragmentRecord>> {
        let key = Self::live_key(bucket, upload_id, index)?;
        self.meta.get_record(key.as_bytes()).await
    }

    /// Soft delete; `NotFound` when the fragment record is absent.
    pub async fn mark_fragment_deleted(
        &self,
        bucket: &str,
        upload_id: &str,
        index: u32,
    ) -> MetaResult<()> {
        let key = Self::live_key(bucket, upload_id, index)?;
        self.meta
            .mark_deleted(
                key.as_bytes(),
                self.tombstone_key(bucket, upload_id, index).as_bytes(),
            )
            .await
    }

    /// Hard delete of the live fragment record.
    pub async fn delete_fragment(
        &self,
        bucket: &str,
        upload_id: &str,
        index: u32,
    ) -> MetaResult<()> {
        let key = Self::live_key(bucket, upload_id, index)?;
        self.meta.delete_keys(&[key.as_bytes()]).await
    }

    /// Fragments of one upload with index greater than `start_after`, in
    /// index order. A `limit` of 0 means [`DEFAULT_FRAGMENT_LIST_LIMIT`].
    pub async fn list_upload_fragments(
        &self,
        bucket: &str,
        upload_id: &str,
        start_after: u32,
        limit: usize,
    ) -> MetaResult<Vec<(String, FragmentRecord)>> {
        let Some(first) = start_after.checked_add(1) else {
            return Ok(Vec::new());
        };
        let lo = Self::live_key(bucket, upload_id, first)?;
        let hi = prefix_upper(upload_fragment_prefix(bucket, upload_id).as_bytes())?;
        let limit = if limit == 0 {
            DEFAULT_FRAGMENT_LIST_LIMIT
        } else {
            limit
        };

        // Upload ids may contain `#`, so `u` and `u#x` share a key prefix;
        // keep only fragments of this exact upload.
        let mut fragments = Vec::new();
        let mut range = KeyRange::new(lo, hi);
        loop {
            let kvs = self.meta.scan(range.clone(), Limit::AtMost(limit)).await?;
            let exhausted = kvs.len() < limit;
            let next_lo = kvs.last().map(|kv| {
                let mut key = kv.key.clone();
                key.push(0);
                key
            });
            for (key, record) in decode_all::<FragmentRecord>(kvs)? {
                if parse_multipart_key(&key).is_some_and(|(_, id, _)| id == upload_id) {
                    fragments.push((key, record));
                    if fragments.len() == limit {
                        return Ok(fragments);
                    }
                }
            }
            match next_lo {
                Some(lo) if !exhausted => range.lo = lo,
                _ => return Ok(fragments),
            }
        }
    }

    /// Fragment tombstones, oldest first.
    pub async fn list_deleted_fragments(
        &self,
        limit: Limit,
    ) -> MetaResult<Vec<(String, FragmentRecord)>> {
        decode_all(
            self.meta
                .list(DELETED_MULTIPART_PREFIX.as_bytes(), limit)
                .await?,
        )
    }

    /// Stream every live fragment record across all buckets.
    pub async fn fragments_iter(&self) -> MetaResult<FragmentCursor<S>> {
        self.meta.iter(KeyRange::prefix(MULTIPART_PREFIX)?).await
    }
}
