use crate::block::{BlockKind, FailureReason};
use crate::codec::CodecError;
use crate::manifest::ManifestError;

/// Why a split-file insert or fetch did not reach `Done`.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("{phase}: {failures} block(s) failed, {allowed} allowed (last: {last})")]
    TooManyFailures {
        phase: String,
        failures: usize,
        allowed: usize,
        last: FailureReason,
    },
    #[error("segment {segment}: {kind:?} block {position} failed verification: {reason}")]
    Integrity {
        segment: usize,
        kind: BlockKind,
        position: usize,
        reason: FailureReason,
    },
    #[error("segment {segment}: {kind:?} block {position} is {actual} bytes, expected {expected}")]
    BlockSize {
        segment: usize,
        kind: BlockKind,
        position: usize,
        expected: usize,
        actual: usize,
    },
    #[error("whole-file checksum mismatch")]
    ChecksumMismatch,
    #[error("pipeline stalled in {0}")]
    Stalled(String),
    #[error("background worker failed: {0}")]
    Worker(String),
    #[error("output: {0}")]
    Output(#[from] std::io::Error),
    #[error("cancelled")]
    Cancelled,
}
