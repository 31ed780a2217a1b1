//! Block work items: one queued or in-flight fetch/insert of a single block.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bucket::Bucket;
use crate::key::BlockKey;

/// Which array of its segment a block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockKind {
    Data,
    Check,
    /// The split-file metadata document itself.
    Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockOp {
    Fetch,
    Insert,
}

/// Where a work item points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTarget {
    Key(BlockKey),
    /// Insert whose key is only known once the network accepts the content.
    ComputeOnInsert,
}

impl fmt::Display for BlockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockTarget::Key(key) => write!(f, "{}", key),
            BlockTarget::ComputeOnInsert => f.write_str(crate::key::CHK_PREFIX),
        }
    }
}

/// Why a leaf request did not produce a block.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("route not found")]
    RouteNotFound,
    #[error("data not found")]
    DataNotFound,
    #[error("restarted: {0}")]
    Restarted(String),
    /// Insert target already holds identical content.
    #[error("key collision on {0}")]
    KeyCollision(BlockKey),
    #[error("content address mismatch: expected {expected}, got {actual}")]
    KeyMismatch { expected: BlockKey, actual: BlockKey },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("cancelled")]
    Cancelled,
}

impl FailureReason {
    /// Corruption and cancellation are not fixed by asking again.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FailureReason::KeyMismatch { .. } | FailureReason::Cancelled
        )
    }
}

/// One block operation and its retry state. Owns the block's buffer (inserts) until the
/// item succeeds, at which point the buffer moves to the segment, or until it is dropped.
#[derive(Debug)]
pub struct BlockWorkItem {
    pub(crate) id: u64,
    pub(crate) batch: u64,
    pub op: BlockOp,
    pub target: BlockTarget,
    pub segment: usize,
    pub kind: BlockKind,
    pub position: usize,
    pub retry_count: u32,
    pub htl: u32,
    /// Added to `htl` per retry. Zero for inserts.
    pub htl_increment: u32,
    pub last_failure: Option<FailureReason>,
    bucket: Option<Bucket>,
}

impl BlockWorkItem {
    pub fn fetch(
        key: BlockKey,
        segment: usize,
        kind: BlockKind,
        position: usize,
        htl: u32,
        htl_increment: u32,
    ) -> Self {
        Self {
            id: 0,
            batch: 0,
            op: BlockOp::Fetch,
            target: BlockTarget::Key(key),
            segment,
            kind,
            position,
            retry_count: 0,
            htl,
            htl_increment,
            last_failure: None,
            bucket: None,
        }
    }

    pub fn insert(bucket: Bucket, segment: usize, kind: BlockKind, position: usize, htl: u32) -> Self {
        Self {
            id: 0,
            batch: 0,
            op: BlockOp::Insert,
            target: BlockTarget::ComputeOnInsert,
            segment,
            kind,
            position,
            retry_count: 0,
            htl,
            htl_increment: 0,
            last_failure: None,
            bucket: Some(bucket),
        }
    }

    /// Hops-to-live for the next attempt: `htl + retry_count * htl_increment`.
    pub fn effective_htl(&self) -> u32 {
        self.htl
            .saturating_add(self.retry_count.saturating_mul(self.htl_increment))
    }

    pub fn bucket(&self) -> Option<&Bucket> {
        self.bucket.as_ref()
    }

    pub fn take_bucket(&mut self) -> Option<Bucket> {
        self.bucket.take()
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}
