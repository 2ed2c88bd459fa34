//! Key codec for the flat metadata namespace.
//!
//! Every entity kind lives under its own prefix family and all components are
//! joined with `#`:
//!
//! - `BUCKET#{bucket}`
//! - `OBJECT#{bucket}#{object}`
//! - `DELETED_OBJECT#{ts}#{bucket}#{object}`
//! - `MULTIPART#{bucket}#{upload_id}#{index}`
//! - `DELETED_MULTIPART#{ts}#{bucket}#{upload_id}#{index}`
//!
//! `{ts}` is a 19-digit zero-padded nanosecond timestamp and `{index}` a
//! 5-digit zero-padded fragment index, so lexical order follows numeric order.
//! No two prefix families are adjacent under a last-byte increment.

use crate::errors::{MetaError, MetaResult};
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

pub const KEY_SEPARATOR: char = '#';

pub const BUCKET_PREFIX: &str = "BUCKET#";
pub const OBJECT_PREFIX: &str = "OBJECT#";
pub const DELETED_OBJECT_PREFIX: &str = "DELETED_OBJECT#";
pub const MULTIPART_PREFIX: &str = "MULTIPART#";
pub const DELETED_MULTIPART_PREFIX: &str = "DELETED_MULTIPART#";

const BUCKET_NAME_MIN_LEN: usize = 1;
const BUCKET_NAME_MAX_LEN: usize = 63;

/// Half-open byte range `[lo, hi)` over the key space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub lo: Vec<u8>,
    pub hi: Vec<u8>,
}

impl KeyRange {
    pub fn new(lo: impl Into<Vec<u8>>, hi: impl Into<Vec<u8>>) -> Self {
        Self {
            lo: lo.into(),
            hi: hi.into(),
        }
    }

    /// Range covering every key that starts with `prefix`.
    pub fn prefix(prefix: impl AsRef<[u8]>) -> MetaResult<Self> {
        let prefix = prefix.as_ref();
        Ok(Self {
            lo: prefix.to_vec(),
            hi: prefix_upper(prefix)?,
        })
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.lo.as_slice() && key < self.hi.as_slice()
    }
}

/// Exclusive upper bound of a prefix scan: the prefix with its last byte
/// incremented.
pub fn prefix_upper(prefix: &[u8]) -> MetaResult<Vec<u8>> {
    prefix_upper_with_offset(prefix, 1)
}

/// Like [`prefix_upper`] but adds `offset` to the last byte, for sub-prefix
/// scans that must skip a run of neighbouring byte values.
pub fn prefix_upper_with_offset(prefix: &[u8], offset: u8) -> MetaResult<Vec<u8>> {
    let mut upper = prefix.to_vec();
    let last = upper
        .last_mut()
        .ok_or_else(|| MetaError::InvalidKey("cannot bound an empty prefix".into()))?;
    *last = last.checked_add(offset).ok_or_else(|| {
        MetaError::InvalidKey(format!(
            "prefix `{}` has no upper bound",
            String::from_utf8_lossy(prefix)
        ))
    })?;
    Ok(upper)
}

/// Validate a bucket name before it is embedded in a key.
///
/// S3-style rules: 1-63 characters of lowercase letters, digits, dots and
/// hyphens, starting and ending with a letter or digit, no `..`, `.-` or
/// `-.`, and not shaped like an IPv4 address. The separator can therefore
/// never appear inside a bucket segment.
pub fn validate_bucket_name(name: &str) -> MetaResult<()> {
    let invalid = |reason: &str| MetaError::InvalidBucketName {
        name: name.to_string(),
        reason: reason.into(),
    };

    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return Err(invalid("must be between 1 and 63 characters"));
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return Err(invalid(
            "allowed characters are lowercase letters, digits, dots, and hyphens",
        ));
    }
    if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
        return Err(invalid("must start and end with a lowercase letter or digit"));
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err(invalid(
            "cannot contain consecutive dots or dot-hyphen combinations",
        ));
    }
    if is_ipv4_like(name) {
        return Err(invalid("must not be formatted like an IP address"));
    }
    Ok(())
}

/// Object names and upload ids only need to be present; they may contain `#`.
pub fn validate_name(kind: &str, name: &str) -> MetaResult<()> {
    if name.is_empty() {
        return Err(MetaError::InvalidKey(format!("{kind} must not be empty")));
    }
    Ok(())
}

fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

pub fn bucket_key(bucket: &str) -> String {
    format!("{BUCKET_PREFIX}{bucket}")
}

pub fn object_key(bucket: &str, object: &str) -> String {
    format!("{OBJECT_PREFIX}{bucket}#{object}")
}

/// Prefix shared by every live object of `bucket`, separator included.
pub fn bucket_object_prefix(bucket: &str) -> String {
    format!("{OBJECT_PREFIX}{bucket}#")
}

pub fn deleted_object_key(ts: i64, bucket: &str, object: &str) -> String {
    format!("{DELETED_OBJECT_PREFIX}{ts:019}#{bucket}#{object}")
}

/// `{upload_id}#{index:05}`, the name a fragment is stored under.
pub fn fragment_name(upload_id: &str, index: u32) -> String {
    format!("{upload_id}#{index:05}")
}

pub fn multipart_key(bucket: &str, upload_id: &str, index: u32) -> String {
    format!("{MULTIPART_PREFIX}{bucket}#{}", fragment_name(upload_id, index))
}

/// Prefix shared by every fragment of one upload, separator included.
pub fn upload_fragment_prefix(bucket: &str, upload_id: &str) -> String {
    format!("{MULTIPART_PREFIX}{bucket}#{upload_id}#")
}

pub fn deleted_multipart_key(ts: i64, bucket: &str, upload_id: &str, index: u32) -> String {
    format!(
        "{DELETED_MULTIPART_PREFIX}{ts:019}#{bucket}#{}",
        fragment_name(upload_id, index)
    )
}

pub fn parse_bucket_key(key: &str) -> Option<&str> {
    key.strip_prefix(BUCKET_PREFIX).filter(|b| !b.is_empty())
}

/// Split an object key into `(bucket, object)`.
pub fn parse_object_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(OBJECT_PREFIX)?;
    let (bucket, object) = split_pair(rest)?;
    Some((bucket, object))
}

/// Split a tombstoned object key into `(timestamp, bucket, object)`.
pub fn parse_deleted_object_key(key: &str) -> Option<(i64, &str, &str)> {
    let rest = key.strip_prefix(DELETED_OBJECT_PREFIX)?;
    let (ts, rest) = rest.split_once(KEY_SEPARATOR)?;
    let ts = parse_timestamp(ts)?;
    let (bucket, object) = split_pair(rest)?;
    Some((ts, bucket, object))
}

/// Split a fragment name into `(upload_id, index)`.
pub fn parse_fragment_name(name: &str) -> Option<(&str, u32)> {
    let (upload_id, index) = name.rsplit_once(KEY_SEPARATOR)?;
    if upload_id.is_empty() {
        return None;
    }
    Some((upload_id, parse_index(index)?))
}

/// Split a fragment key into `(bucket, upload_id, index)`.
pub fn parse_multipart_key(key: &str) -> Option<(&str, &str, u32)> {
    let rest = key.strip_prefix(MULTIPART_PREFIX)?;
    let (bucket, name) = split_pair(rest)?;
    let (upload_id, index) = parse_fragment_name(name)?;
    Some((bucket, upload_id, index))
}

/// Split a tombstoned fragment key into `(timestamp, bucket, upload_id, index)`.
pub fn parse_deleted_multipart_key(key: &str) -> Option<(i64, &str, &str, u32)> {
    let rest = key.strip_prefix(DELETED_MULTIPART_PREFIX)?;
    let (ts, rest) = rest.split_once(KEY_SEPARATOR)?;
    let ts = parse_timestamp(ts)?;
    let (bucket, name) = split_pair(rest)?;
    let (upload_id, index) = parse_fragment_name(name)?;
    Some((ts, bucket, upload_id, index))
}

fn split_pair(rest: &str) -> Option<(&str, &str)> {
    let (head, tail) = rest.split_once(KEY_SEPARATOR)?;
    if head.is_empty() || tail.is_empty() {
        return None;
    }
    Some((head, tail))
}

// Only canonical spellings are accepted, so a parsed key always re-encodes
// to the same bytes.
fn parse_timestamp(raw: &str) -> Option<i64> {
    let ts = raw.parse::<i64>().ok().filter(|ts| *ts >= 0)?;
    (format!("{ts:019}") == raw).then_some(ts)
}

fn parse_index(raw: &str) -> Option<u32> {
    let index = raw.parse::<u32>().ok()?;
    (format!("{index:05}") == raw).then_some(index)
}

/// Source of tombstone timestamps.
///
/// Values are wall-clock nanoseconds, bumped past the previous value when the
/// clock stalls or steps backwards, so no two tombstones written through the
/// same handle ever share a timestamp.
#[derive(Debug, Default)]
pub struct TombstoneClock {
    last: AtomicI64,
}

impl TombstoneClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> i64 {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}
