//! Mark-and-sweep pass that finds orphaned multipart fragments.
//!
//! Mark: every fragmented object, live or tombstoned, names the fragment
//! keys it owns. Sweep: every fragment record whose key was not marked is an
//! orphan. The pass never writes to the store.

use super::bucket_service::BucketService;
use super::cursor::MetaCursor;
use super::meta::MetaHandle;
use super::multipart_service::MultipartService;
use super::object_service::ObjectService;
use crate::errors::{MetaError, MetaResult};
use crate::keys::multipart_key;
use crate::models::{FragmentRecord, ObjectInfo};
use crate::store::{MetaStore, RangeCursor};
use std::collections::HashSet;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

const BYTES_PER_GIGABYTE: f64 = (1u64 << 30) as f64;

/// Counters collected while scanning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub buckets: u64,
    pub live_objects: u64,
    pub tombstones: u64,
    /// Distinct fragment keys owned by some live or tombstoned object.
    pub reachable_fragments: u64,
    pub fragments_scanned: u64,
    pub undecodable_objects: u64,
    /// Unreferenced fragment records skipped because their value did not decode.
    pub undecodable_fragments: u64,
}

/// Result of one complete pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub orphan_count: u64,
    pub orphan_bytes: u64,
    /// Orphaned fragment keys in key order.
    pub orphan_keys: Vec<String>,
    pub stats: ScanStats,
}

impl ReconcileReport {
    pub fn orphan_gigabytes(&self) -> f64 {
        self.orphan_bytes as f64 / BYTES_PER_GIGABYTE
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "clean finished, multiparts count is {}, multiparts size is {:.2}GB",
            self.orphan_count,
            self.orphan_gigabytes()
        )
    }
}

#[derive(Debug, Default)]
struct MarkTally {
    objects: u64,
    undecodable: u64,
}

pub struct Reconciler<S> {
    buckets: BucketService<S>,
    objects: ObjectService<S>,
    multiparts: MultipartService<S>,
}

impl<S: MetaStore> Reconciler<S> {
    pub fn new(meta: MetaHandle<S>) -> Self {
        Self {
            buckets: BucketService::new(meta.clone()),
            objects: ObjectService::new(meta.clone()),
            multiparts: MultipartService::new(meta),
        }
    }

    /// Run one full pass.
    ///
    /// Any store error, and cancellation through `cancel`, aborts the pass
    /// without a report: a partial reachable set would flag live fragments.
    pub async fn run(&self, cancel: &CancellationToken) -> MetaResult<ReconcileReport> {
        let run_id = Uuid::new_v4();
        self.run_pass(cancel)
            .instrument(info_span!("reconcile", %run_id))
            .await
    }

    async fn run_pass(&self, cancel: &CancellationToken) -> MetaResult<ReconcileReport> {
        let mut stats = ScanStats::default();
        let mut reachable = HashSet::new();

        check(cancel)?;
        let buckets = self.buckets.list_buckets().await?;
        stats.buckets = buckets.len() as u64;
        info!(buckets = stats.buckets, "marking fragments of live objects");

        for bucket in &buckets {
            check(cancel)?;
            let mut cursor = self.objects.bucket_objects_iter(&bucket.name).await?;
            let marked = mark_reachable(&mut cursor, cancel, &mut reachable).await;
            cursor.close().await;
            let tally = marked?;
            debug!(bucket = %bucket.name, objects = tally.objects, "bucket marked");
            stats.live_objects += tally.objects;
            stats.undecodable_objects += tally.undecodable;
        }

        check(cancel)?;
        let mut cursor = self.objects.deleted_objects_iter().await?;
        let marked = mark_reachable(&mut cursor, cancel, &mut reachable).await;
        cursor.close().await;
        let tally = marked?;
        stats.tombstones = tally.objects;
        stats.undecodable_objects += tally.undecodable;
        stats.reachable_fragments = reachable.len() as u64;
        info!(
            live_objects = stats.live_objects,
            tombstones = stats.tombstones,
            reachable = stats.reachable_fragments,
            "mark phase finished"
        );

        check(cancel)?;
        let mut report = ReconcileReport::default();
        let mut cursor = self.multiparts.fragments_iter().await?;
        let swept = sweep(&mut cursor, cancel, &reachable, &mut report, &mut stats).await;
        cursor.close().await;
        swept?;

        report.stats = stats;
        info!(
            orphans = report.orphan_count,
            orphan_bytes = report.orphan_bytes,
            scanned = report.stats.fragments_scanned,
            skipped = report.stats.undecodable_fragments,
            "sweep phase finished"
        );
        Ok(report)
    }
}

fn check(cancel: &CancellationToken) -> MetaResult<()> {
    if cancel.is_cancelled() {
        return Err(MetaError::Cancelled);
    }
    Ok(())
}

/// Insert the fragment keys owned by every fragmented object under `cursor`.
async fn mark_reachable<C: RangeCursor>(
    cursor: &mut MetaCursor<ObjectInfo, C>,
    cancel: &CancellationToken,
    reachable: &mut HashSet<Vec<u8>>,
) -> MetaResult<MarkTally> {
    let mut tally = MarkTally::default();
    while cursor.valid() {
        check(cancel)?;
        match cursor.value() {
            Some(object) if object.is_large() => match object.fragment_count() {
                Some(count) => {
                    tally.objects += 1;
                    for index in 0..count {
                        let key = multipart_key(&object.bucket, &object.upload_id, index);
                        reachable.insert(key.into_bytes());
                    }
                }
                None => {
                    warn!(
                        key = %cursor.key_str(),
                        part_total = object.part_total,
                        "skipping object with out-of-range partTotal"
                    );
                    tally.undecodable += 1;
                }
            },
            Some(_) => tally.objects += 1,
            None => tally.undecodable += 1,
        }
        cursor.next().await?;
    }
    Ok(tally)
}

async fn sweep<C: RangeCursor>(
    cursor: &mut MetaCursor<FragmentRecord, C>,
    cancel: &CancellationToken,
    reachable: &HashSet<Vec<u8>>,
    report: &mut ReconcileReport,
    stats: &mut ScanStats,
) -> MetaResult<()> {
    while cursor.valid() {
        check(cancel)?;
        stats.fragments_scanned += 1;
        if !reachable.contains(cursor.key()) {
            match cursor.value() {
                Some(fragment) => {
                    report.orphan_count += 1;
                    let bytes = fragment.reclaimable_bytes();
                    report.orphan_bytes = report.orphan_bytes.saturating_add(bytes);
                    report.orphan_keys.push(cursor.key_str().into_owned());
                }
                None => stats.undecodable_fragments += 1,
            }
        }
        cursor.next().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyRange;
    use crate::models::{BucketInfo, LARGE_OBJECT_TYPE};
    use crate::store::memory::{MemoryCursor, MemoryTxn};
    use crate::store::{MemoryStore, StoreTxn};
    use async_trait::async_trait;
    use bytes::Bytes;

    /// Wraps a memory store; cursors whose range starts with `trigger`
    /// cancel `token` as soon as they advance.
    struct CancellingStore {
        inner: MemoryStore,
        trigger: &'static str,
        token: CancellationToken,
    }

    struct CancellingTxn {
        inner: MemoryTxn,
        trigger: &'static str,
        token: CancellationToken,
    }

    struct CancellingCursor {
        inner: MemoryCursor,
        token: Option<CancellationToken>,
    }

    #[async_trait]
    impl MetaStore for CancellingStore {
        type Txn = CancellingTxn;

        async fn begin(&self) -> MetaResult<CancellingTxn> {
            Ok(CancellingTxn {
                inner: self.inner.begin().await?,
                trigger: self.trigger,
                token: self.token.clone(),
            })
        }
    }

    #[async_trait]
    impl StoreTxn for CancellingTxn {
        type Cursor = CancellingCursor;

        async fn get(&mut self, key: &[u8]) -> MetaResult<Option<Bytes>> {
            self.inner.get(key).await
        }

        async fn set(&mut self, key: &[u8], value: &[u8]) -> MetaResult<()> {
            self.inner.set(key, value).await
        }

        async fn delete(&mut self, key: &[u8]) -> MetaResult<()> {
            self.inner.delete(key).await
        }

        async fn scan(self, range: KeyRange) -> MetaResult<CancellingCursor> {
            let armed = range.lo.starts_with(self.trigger.as_bytes());
            Ok(CancellingCursor {
                inner: self.inner.scan(range).await?,
                token: armed.then_some(self.token),
            })
        }

        async fn commit(self) -> MetaResult<()> {
            self.inner.commit().await
        }

        async fn rollback(self) {
            self.inner.rollback().await
        }
    }

    #[async_trait]
    impl RangeCursor for CancellingCursor {
        fn valid(&self) -> bool {
            self.inner.valid()
        }

        async fn next(&mut self) -> MetaResult<()> {
            self.inner.next().await?;
            if let Some(token) = &self.token {
                token.cancel();
            }
            Ok(())
        }

        fn key(&self) -> &[u8] {
            self.inner.key()
        }

        fn value(&self) -> &[u8] {
            self.inner.value()
        }

        async fn close(self) {
            self.inner.close().await
        }
    }

    struct Fixture {
        store: MemoryStore,
        meta: MetaHandle<MemoryStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = MemoryStore::new();
            let meta = MetaHandle::new(store.clone());
            Self { store, meta }
        }

        async fn bucket(&self, name: &str) {
            BucketService::new(self.meta.clone())
                .create_bucket(&BucketInfo::new(name, "seaweedfs"))
                .await
                .unwrap();
        }

        async fn large_object(&self, bucket: &str, name: &str, upload_id: &str, parts: i64) {
            let info = ObjectInfo {
                name: name.into(),
                bucket: bucket.into(),
                kind: LARGE_OBJECT_TYPE.into(),
                upload_id: upload_id.into(),
                part_total: parts,
                ..ObjectInfo::default()
            };
            ObjectService::new(self.meta.clone())
                .save_object(bucket, name, &info)
                .await
                .unwrap();
        }

        async fn fragment(&self, bucket: &str, upload_id: &str, index: u32, size: i64) {
            let record = FragmentRecord {
                size,
                ..FragmentRecord::default()
            };
            MultipartService::new(self.meta.clone())
                .save_fragment(bucket, upload_id, index, &record)
                .await
                .unwrap();
        }

        async fn run(&self) -> MetaResult<ReconcileReport> {
            Reconciler::new(self.meta.clone())
                .run(&CancellationToken::new())
                .await
        }
    }

    #[tokio::test]
    async fn unreferenced_upload_is_orphaned() {
        let fx = Fixture::new();
        fx.bucket("b1").await;
        fx.large_object("b1", "big", "u1", 3).await;
        for index in 0..3 {
            fx.fragment("b1", "u1", index, 100).await;
        }
        fx.fragment("b1", "u2", 0, 4096).await;

        let report = fx.run().await.unwrap();
        assert_eq!(report.orphan_count, 1);
        assert_eq!(report.orphan_bytes, 4096);
        assert_eq!(report.orphan_keys, vec!["MULTIPART#b1#u2#00000"]);
        assert_eq!(report.stats.reachable_fragments, 3);
        assert_eq!(report.stats.fragments_scanned, 4);
    }

    #[tokio::test]
    async fn tombstoned_objects_keep_fragments_reachable() {
        let fx = Fixture::new();
        fx.bucket("b1").await;
        fx.large_object("b1", "big", "u1", 2).await;
        fx.fragment("b1", "u1", 0, 10).await;
        fx.fragment("b1", "u1", 1, 10).await;
        ObjectService::new(fx.meta.clone())
            .mark_object_deleted("b1", "big")
            .await
            .unwrap();

        let report = fx.run().await.unwrap();
        assert_eq!(report.orphan_count, 0);
        assert_eq!(report.stats.live_objects, 0);
        assert_eq!(report.stats.tombstones, 1);
    }

    #[tokio::test]
    async fn empty_store_reports_nothing() {
        let report = Fixture::new().run().await.unwrap();
        assert_eq!(report, ReconcileReport::default());
        assert_eq!(
            report.to_string(),
            "clean finished, multiparts count is 0, multiparts size is 0.00GB"
        );
    }

    #[tokio::test]
    async fn overwritten_object_protects_old_and_new_uploads() {
        let fx = Fixture::new();
        fx.bucket("b1").await;
        fx.large_object("b1", "big", "old", 1).await;
        fx.large_object("b1", "big", "new", 1).await;
        fx.fragment("b1", "old", 0, 1).await;
        fx.fragment("b1", "new", 0, 1).await;
        fx.fragment("b1", "new", 1, 1).await;

        let report = fx.run().await.unwrap();
        assert_eq!(report.orphan_keys, vec!["MULTIPART#b1#new#00001"]);
    }

    #[tokio::test]
    async fn fragments_are_scoped_to_their_bucket() {
        let fx = Fixture::new();
        fx.bucket("b1").await;
        fx.bucket("b2").await;
        fx.large_object("b1", "big", "u1", 1).await;
        fx.fragment("b1", "u1", 0, 1).await;
        fx.fragment("b2", "u1", 0, 1).await;

        let report = fx.run().await.unwrap();
        assert_eq!(report.orphan_keys, vec!["MULTIPART#b2#u1#00000"]);
        assert_eq!(report.stats.buckets, 2);
    }

    #[tokio::test]
    async fn undecodable_records_are_skipped() {
        let fx = Fixture::new();
        fx.bucket("b1").await;
        fx.meta
            .set(multipart_key("b1", "u9", 0).as_bytes(), b"garbage")
            .await
            .unwrap();
        fx.meta.set(b"OBJECT#b1#broken", b"{").await.unwrap();
        fx.fragment("b1", "u9", 1, 7).await;

        let report = fx.run().await.unwrap();
        assert_eq!(report.orphan_count, 1);
        assert_eq!(report.orphan_bytes, 7);
        assert_eq!(report.stats.undecodable_fragments, 1);
        assert_eq!(report.stats.undecodable_objects, 1);
    }

    #[tokio::test]
    async fn store_failure_aborts_the_pass() {
        let fx = Fixture::new();
        fx.bucket("b1").await;
        fx.store.inject_scan_failure("MULTIPART#").unwrap();

        let err = fx.run().await.unwrap_err();
        assert!(err.is_store_failure());
    }

    #[tokio::test]
    async fn cancelled_pass_returns_no_report() {
        let fx = Fixture::new();
        fx.bucket("b1").await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = Reconciler::new(fx.meta.clone())
            .run(&cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::Cancelled));
    }

    async fn run_cancelled_within(
        fx: &Fixture,
        trigger: &'static str,
    ) -> MetaResult<ReconcileReport> {
        let token = CancellationToken::new();
        let store = CancellingStore {
            inner: fx.store.clone(),
            trigger,
            token: token.clone(),
        };
        Reconciler::new(MetaHandle::new(store)).run(&token).await
    }

    #[tokio::test]
    async fn cancellation_while_marking_discards_the_pass() {
        let fx = Fixture::new();
        fx.bucket("b1").await;
        fx.large_object("b1", "first", "u1", 1).await;
        fx.large_object("b1", "second", "u2", 1).await;
        fx.fragment("b1", "u9", 0, 1).await;

        let err = run_cancelled_within(&fx, "OBJECT#").await.unwrap_err();
        assert!(matches!(err, MetaError::Cancelled));
    }

    #[tokio::test]
    async fn cancellation_while_sweeping_discards_the_pass() {
        let fx = Fixture::new();
        fx.bucket("b1").await;
        fx.fragment("b1", "u1", 0, 1).await;
        fx.fragment("b1", "u2", 0, 1).await;

        let err = run_cancelled_within(&fx, "MULTIPART#").await.unwrap_err();
        assert!(matches!(err, MetaError::Cancelled));

        // The same data reconciles normally without cancellation.
        assert_eq!(fx.run().await.unwrap().orphan_count, 2);
    }

    #[tokio::test]
    async fn orphan_bytes_saturate_instead_of_overflowing() {
        let fx = Fixture::new();
        fx.bucket("b1").await;
        for index in 0..3 {
            fx.fragment("b1", "u1", index, i64::MAX).await;
        }

        let report = fx.run().await.unwrap();
        assert_eq!(report.orphan_count, 3);
        assert_eq!(report.orphan_bytes, u64::MAX);
    }

    #[tokio::test]
    async fn oversized_part_total_is_skipped() {
        let fx = Fixture::new();
        fx.bucket("b1").await;
        fx.large_object("b1", "corrupt", "u1", i64::from(u32::MAX))
            .await;
        fx.large_object("b1", "fine", "u2", 1).await;
        fx.fragment("b1", "u1", 0, 5).await;
        fx.fragment("b1", "u2", 0, 5).await;

        let report = fx.run().await.unwrap();
        assert_eq!(report.stats.undecodable_objects, 1);
        assert_eq!(report.stats.live_objects, 1);
        assert_eq!(report.stats.reachable_fragments, 1);
        assert_eq!(report.orphan_keys, vec!["MULTIPART#b1#u1#00000"]);
    }

    #[test]
    fn size_line_uses_binary_gigabytes() {
        let report = ReconcileReport {
            orphan_count: 2,
            orphan_bytes: 3 << 29,
            ..ReconcileReport::default()
        };
        assert_eq!(
            report.to_string(),
            "clean finished, multiparts count is 2, multiparts size is 1.50GB"
        );
    }
}
