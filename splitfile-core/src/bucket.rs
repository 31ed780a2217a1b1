//! Owned block buffers. A `Bucket` is released exactly once, when it is dropped.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

#[derive(Debug, Default)]
struct Ledger {
    allocated: AtomicU64,
    released: AtomicU64,
}

/// Allocates buckets and counts how many are still live.
#[derive(Debug, Clone, Default)]
pub struct BucketFactory {
    ledger: Arc<Ledger>,
}

impl BucketFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make(&self, data: impl Into<Bytes>) -> Bucket {
        self.ledger.allocated.fetch_add(1, Ordering::Relaxed);
        Bucket {
            data: data.into(),
            ledger: self.ledger.clone(),
        }
    }

    /// Bucket holding `data` zero-padded up to `size` bytes.
    pub fn padded(&self, data: &[u8], size: usize) -> Bucket {
        let mut buf = Vec::with_capacity(size.max(data.len()));
        buf.extend_from_slice(data);
        if buf.len() < size {
            buf.resize(size, 0);
        }
        self.make(buf)
    }

    pub fn allocated(&self) -> u64 {
        self.ledger.allocated.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.ledger.released.load(Ordering::Relaxed)
    }

    /// Buckets made by this factory that have not been dropped yet.
    pub fn live(&self) -> u64 {
        self.allocated().saturating_sub(self.released())
    }
}

/// Memory-backed block buffer.
pub struct Bucket {
    data: Bytes,
    ledger: Arc<Ledger>,
}

impl Bucket {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Shared view of the contents, handed to transports. Does not transfer ownership of the bucket.
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        self.ledger.released.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket").field("len", &self.data.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_releases_once() {
        let factory = BucketFactory::new();
        let a = factory.make(vec![1u8; 10]);
        let b = factory.make(Bytes::from_static(b"xyz"));
        assert_eq!(factory.live(), 2);
        drop(a);
        assert_eq!(factory.live(), 1);
        assert_eq!(b.as_slice(), b"xyz");
        drop(b);
        assert_eq!(factory.allocated(), 2);
        assert_eq!(factory.released(), 2);
        assert_eq!(factory.live(), 0);
    }

    #[test]
    fn padded_zero_fills() {
        let factory = BucketFactory::new();
        let b = factory.padded(b"ab", 5);
        assert_eq!(b.as_slice(), &[b'a', b'b', 0, 0, 0]);
        let c = factory.padded(b"abcdef", 4);
        assert_eq!(c.len(), 6);
    }

    #[test]
    fn shared_view_outlives_bucket_without_leaking() {
        let factory = BucketFactory::new();
        let b = factory.make(vec![7u8; 4]);
        let view = b.bytes();
        drop(b);
        assert_eq!(factory.live(), 0);
        assert_eq!(&view[..], &[7u8; 4]);
    }
}
