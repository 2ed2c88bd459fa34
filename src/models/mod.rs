//! Metadata records stored as JSON values in the key/value namespace.
//!
//! Field names follow the documents already present in the store, so records
//! written by older components decode unchanged. Missing fields fall back to
//! their defaults and unknown fields are ignored.

pub mod bucket;
pub mod metadata;
pub mod multipart;
pub mod object;

use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};

pub use bucket::BucketInfo;
pub use metadata::ExtFields;
pub use multipart::{FragmentLocation, FragmentRecord};
pub use object::{LARGE_OBJECT_TYPE, MAX_FRAGMENTS, ObjectInfo};

/// JSON encoding shared by every stored record.
pub trait Record: Serialize + DeserializeOwned {
    fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    fn decode(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }
}

impl Record for BucketInfo {}
impl Record for ObjectInfo {}
impl Record for FragmentRecord {}

/// Treat an explicit JSON `null` like a missing field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
