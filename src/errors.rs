//! Error taxonomy shared by the key codec, the store adapters, the entity
//! services and the reconciliation engine.
//!
//! A missing key is not an error: lookups return `Ok(None)`. `NotFound` is
//! only raised by operations that require the key to exist (soft-delete).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("key `{key}` already exists")]
    AlreadyExists { key: String },
    #[error("key `{key}` not found")]
    NotFound { key: String },
    #[error("store error: {0}")]
    Store(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("decode `{key}`: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("encode record: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("invalid metadata store address `{0}`")]
    InvalidAddress(String),
    #[error("reconciliation cancelled")]
    Cancelled,
}

impl MetaError {
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub(crate) fn not_found(key: &[u8]) -> Self {
        Self::NotFound {
            key: String::from_utf8_lossy(key).into_owned(),
        }
    }

    pub(crate) fn already_exists(key: &[u8]) -> Self {
        Self::AlreadyExists {
            key: String::from_utf8_lossy(key).into_owned(),
        }
    }

    pub(crate) fn decode(key: &[u8], source: serde_json::Error) -> Self {
        Self::Decode {
            key: String::from_utf8_lossy(key).into_owned(),
            source,
        }
    }

    /// True for failures of the store itself (transport, transaction, commit).
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Sqlx(_))
    }
}

pub type MetaResult<T> = Result<T, MetaError>;
