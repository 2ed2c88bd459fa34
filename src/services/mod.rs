//! Entity services over the metadata namespace and the reconciliation pass
//! built on top of them.
//!
//! Every service is constructed from a [`MetaHandle`]: an owned store handle
//! plus the tombstone clock, cloned into each service that needs it.

pub mod bucket_service;
pub mod cursor;
pub mod meta;
pub mod multipart_service;
pub mod object_service;
pub mod reconcile;

pub use bucket_service::BucketService;
pub use cursor::MetaCursor;
pub use meta::{Kv, Limit, MetaHandle, StoreCursor};
pub use multipart_service::MultipartService;
pub use object_service::ObjectService;
pub use reconcile::{ReconcileReport, Reconciler, ScanStats};
