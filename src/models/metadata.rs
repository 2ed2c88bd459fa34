//! Free-form extension fields attached to bucket and object records.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::value::RawValue;

/// Opaque JSON blob carried verbatim through decode and encode.
///
/// The core never interprets it; callers that know the schema of a given
/// field set can decode it with [`ExtFields::parse`].
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(transparent)]
pub struct ExtFields(Option<Box<RawValue>>);

impl ExtFields {
    pub fn none() -> Self {
        Self(None)
    }

    /// Serialize `value` into a new blob.
    pub fn from_value<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        serde_json::value::to_raw_value(value).map(|raw| Self(Some(raw)))
    }

    /// Wrap raw JSON text, validating that it is well-formed.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        RawValue::from_string(json.to_owned()).map(|raw| Self(Some(raw)))
    }

    pub fn as_json(&self) -> Option<&str> {
        self.0.as_deref().map(RawValue::get)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Option<serde_json::Result<T>> {
        self.as_json().map(serde_json::from_str)
    }
}

impl PartialEq for ExtFields {
    fn eq(&self, other: &Self) -> bool {
        self.as_json() == other.as_json()
    }
}
