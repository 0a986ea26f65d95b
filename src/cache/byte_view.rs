//! Immutable byte snapshots handed out by the cache.
//!
//! A [`ByteView`] is the only value type the cache stores and returns. It
//! wraps [`bytes::Bytes`], so clones are reference-counted and the payload
//! can never be mutated through the view. Producers hand their buffer over
//! (or copy on ingest for borrowed data); consumers that need an owned,
//! detached buffer use [`ByteView::to_vec`].

use std::fmt;

use bytes::Bytes;

use crate::cache::lru::Weighted;

/// Read-only snapshot of a cached byte payload.
///
/// # Examples
///
/// ```rust
/// use ika::cache::ByteView;
///
/// let view = ByteView::from("squid");
/// assert_eq!(view.len(), 5);
/// assert_eq!(view.to_string(), "squid");
/// ```
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ByteView {
    bytes: Bytes,
}

impl ByteView {
    /// Number of bytes in the snapshot.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Cheap immutable handle to the underlying buffer.
    pub fn as_bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    /// Detached copy of the payload.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }
}

impl fmt::Display for ByteView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.bytes))
    }
}

impl fmt::Debug for ByteView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteView({} bytes)", self.bytes.len())
    }
}

impl AsRef<[u8]> for ByteView {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<Bytes> for ByteView {
    fn from(bytes: Bytes) -> Self {
        Self { bytes }
    }
}

impl From<Vec<u8>> for ByteView {
    fn from(buf: Vec<u8>) -> Self {
        Self { bytes: Bytes::from(buf) }
    }
}

impl From<&[u8]> for ByteView {
    fn from(buf: &[u8]) -> Self {
        Self { bytes: Bytes::copy_from_slice(buf) }
    }
}

impl From<String> for ByteView {
    fn from(s: String) -> Self {
        Self { bytes: Bytes::from(s.into_bytes()) }
    }
}

impl From<&str> for ByteView {
    fn from(s: &str) -> Self {
        Self { bytes: Bytes::copy_from_slice(s.as_bytes()) }
    }
}

impl Weighted for ByteView {
    fn weight(&self) -> usize {
        self.bytes.len()
    }
}
