//! Bucket records: top-level containers for objects.

use super::ExtFields;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A bucket record, stored under `BUCKET#{name}`.
///
/// Buckets are created once (create-if-absent) and removed with a hard
/// delete; they never get a tombstone.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct BucketInfo {
    /// Bucket name, unique across the namespace.
    pub name: String,

    /// Backend the bucket's content lives on (e.g. "seaweedfs").
    #[serde(rename = "type")]
    pub kind: String,

    /// When this bucket was created.
    pub create_time: DateTime<Utc>,

    pub ext_fields: ExtFields,
}

impl BucketInfo {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            create_time: Utc::now(),
            ext_fields: ExtFields::none(),
        }
    }
}
