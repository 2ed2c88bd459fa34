//! Represents the fragment records of completed multipart uploads.

use super::null_as_default;
use serde::{Deserialize, Serialize};

/// One fragment of a large object, stored under
/// `MULTIPART#{bucket}#{upload_id}#{index:05}`.
///
/// `fragment_locations` maps the fragment onto blob-store handles; it is what
/// a physical reclamation step would need to free the underlying data.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct FragmentRecord {
    /// Declared fragment size in bytes.
    #[serde(rename = "Size")]
    pub size: i64,

    #[serde(rename = "Etag")]
    pub etag: String,

    #[serde(rename = "FidInfos", deserialize_with = "null_as_default")]
    pub fragment_locations: Vec<FragmentLocation>,
}

impl FragmentRecord {
    /// Size counted towards reclaimable bytes; negative sizes count as zero.
    pub fn reclaimable_bytes(&self) -> u64 {
        u64::try_from(self.size).unwrap_or(0)
    }
}

/// A contiguous slice of a fragment held by the blob store.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct FragmentLocation {
    /// Blob-store file handle.
    #[serde(rename = "FileId")]
    pub id: String,

    #[serde(rename = "Offset")]
    pub offset: i64,

    #[serde(rename = "FileSize")]
    pub size: i64,
}
