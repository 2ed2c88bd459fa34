//! Typed, forward-only cursor over one key range.

use crate::errors::MetaResult;
use crate::models::Record;
use crate::store::RangeCursor;
use std::borrow::Cow;
use std::marker::PhantomData;
use tracing::{debug, warn};

/// Streams the entries of a key range, decoding values as `T` on demand.
///
/// The cursor owns its own transaction snapshot; cursors opened separately
/// are not mutually consistent. Call [`MetaCursor::close`] when done. A
/// cursor dropped without closing (early return, panic) still releases its
/// snapshot through the inner cursor's drop.
pub struct MetaCursor<T, C: RangeCursor> {
    inner: Option<C>,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record, C: RangeCursor> MetaCursor<T, C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner: Some(inner),
            _record: PhantomData,
        }
    }

    pub fn valid(&self) -> bool {
        self.inner.as_ref().is_some_and(RangeCursor::valid)
    }

    /// Advance; no-op once the cursor is exhausted.
    pub async fn next(&mut self) -> MetaResult<()> {
        match self.inner.as_mut() {
            Some(inner) if inner.valid() => inner.next().await,
            _ => Ok(()),
        }
    }

    pub fn key(&self) -> &[u8] {
        self.inner
            .as_ref()
            .map(RangeCursor::key)
            .unwrap_or_default()
    }

    pub fn key_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.key())
    }

    pub fn raw_value(&self) -> &[u8] {
        self.inner
            .as_ref()
            .map(RangeCursor::value)
            .unwrap_or_default()
    }

    /// Decoded value at the current position.
    ///
    /// `None` when the stored bytes do not decode; callers skip such entries.
    pub fn value(&self) -> Option<T> {
        if !self.valid() {
            return None;
        }
        match T::decode(self.raw_value()) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(key = %self.key_str(), error = %err, "skipping undecodable record");
                None
            }
        }
    }

    /// Release the underlying transaction.
    pub async fn close(mut self) {
        if let Some(inner) = self.inner.take() {
            inner.close().await;
        }
    }
}

impl<T, C: RangeCursor> Drop for MetaCursor<T, C> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            debug!("cursor dropped without close; releasing its snapshot");
        }
    }
}
