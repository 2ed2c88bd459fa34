//! Represents an object (file) stored in a bucket.

use super::ExtFields;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `type` value of an object whose content is split into fragments.
pub const LARGE_OBJECT_TYPE: &str = "large";

/// Fragment indices are 5-digit, so no upload has more fragments than this.
pub const MAX_FRAGMENTS: u32 = 100_000;

/// Object metadata, stored under `OBJECT#{bucket}#{name}` while live and
/// copied verbatim under `DELETED_OBJECT#...` when overwritten or deleted.
///
/// The record describes the content, it does not hold it. Large objects
/// point at `part_total` fragment records named `{upload_id}#{index:05}`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ObjectInfo {
    /// Object name within the bucket (may contain `/` and `#`).
    pub name: String,

    /// Size in bytes.
    pub size: i64,

    /// Parent bucket name.
    pub bucket: String,

    pub etag: String,

    /// Timestamp when the object was last modified.
    #[serde(rename = "modifyTime")]
    pub mod_time: DateTime<Utc>,

    /// Content type (MIME type).
    pub content_type: String,

    pub content_encoding: String,

    /// Storage layout; [`LARGE_OBJECT_TYPE`] for fragmented objects.
    #[serde(rename = "type")]
    pub kind: String,

    pub ext_fields: ExtFields,

    /// Upload that produced the fragments of a large object.
    #[serde(rename = "uploadID")]
    pub upload_id: String,

    /// Nominal size of each fragment.
    pub part_size: i64,

    /// Number of fragments, indices `0..part_total`.
    pub part_total: i64,

    pub version: String,
}

impl ObjectInfo {
    pub fn is_large(&self) -> bool {
        self.kind == LARGE_OBJECT_TYPE
    }

    /// Number of fragments this object owns, or `None` for objects that are
    /// not fragmented or whose `part_total` is outside `0..=MAX_FRAGMENTS`.
    pub fn fragment_count(&self) -> Option<u32> {
        if !self.is_large() {
            return None;
        }
        u32::try_from(self.part_total)
            .ok()
            .filter(|count| *count <= MAX_FRAGMENTS)
    }
}
