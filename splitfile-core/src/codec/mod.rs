//! Forward error correction codecs: segment sizing, check-block encoding, block recovery.
//!
//! Algorithms are looked up by name in a `CodecRegistry` populated at start-up.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod reed_solomon;

pub use reed_solomon::ReedSolomon;

/// Sizing knobs passed to every codec factory. Recorded in the metadata so fetchers rebuild the
/// same layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecParams {
    /// Data block size for full segments. Trailing blocks are zero-padded to their segment's size.
    pub block_size: usize,
    pub max_blocks_per_segment: usize,
    /// Check blocks per segment as a percentage of its data blocks (at least one).
    pub redundancy_percent: u32,
}

impl Default for CodecParams {
    fn default() -> Self {
        Self {
            block_size: 32 * 1024,
            max_blocks_per_segment: 128,
            redundancy_percent: 50,
        }
    }
}

/// FEC algorithm for one file.
///
/// Contract: within a segment all data blocks share one size and all check blocks share one size.
/// Decoding any requested index needs at least `block_count(segment)` supplied blocks.
pub trait FecCodec: Send {
    fn name(&self) -> &str;

    /// Lay out segments for a file of `file_length` bytes.
    fn init(&mut self, file_length: u64) -> Result<(), CodecError>;

    fn segment_count(&self) -> usize;
    fn block_count(&self, segment: usize) -> usize;
    fn check_block_count(&self, segment: usize) -> usize;
    fn block_size(&self, segment: usize) -> usize;
    fn check_block_size(&self, segment: usize) -> usize;

    /// Produce check blocks for `segment` from all of its data blocks. With `requested`, only the
    /// listed check positions are returned, in that order.
    fn encode(
        &self,
        segment: usize,
        data: &[&[u8]],
        requested: Option<&[usize]>,
    ) -> Result<Vec<Bytes>, CodecError>;

    /// Recover blocks of `segment`. `requested` uses segment numbering: data positions first,
    /// then check positions offset by `block_count(segment)`. Returns one block per request.
    fn decode(
        &self,
        segment: usize,
        data: &[Option<&[u8]>],
        check: &[Option<&[u8]>],
        requested: &[usize],
    ) -> Result<Vec<Bytes>, CodecError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unknown FEC algorithm {0:?}")]
    Unknown(String),
    #[error("invalid codec parameters: {0}")]
    InvalidParameters(String),
    #[error("codec not initialised")]
    NotInitialised,
    #[error("segment {0} out of range")]
    Segment(usize),
    #[error("expected {expected} blocks, got {actual}")]
    BlockCount { expected: usize, actual: usize },
    #[error("block size {actual}, expected {expected}")]
    BlockSize { expected: usize, actual: usize },
    #[error("need {need} blocks to decode, have {have}")]
    NotEnoughBlocks { have: usize, need: usize },
    #[error("requested index {0} out of range")]
    Index(usize),
    #[error("FEC backend: {0}")]
    Backend(String),
}

type Factory = dyn Fn(CodecParams) -> Box<dyn FecCodec> + Send + Sync;

/// Name -> factory map of available FEC algorithms.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    factories: HashMap<String, Arc<Factory>>,
}

impl CodecRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every algorithm built into this crate.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(reed_solomon::NAME, |params| {
            Box::new(ReedSolomon::new(params)) as Box<dyn FecCodec>
        });
        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        factory: impl Fn(CodecParams) -> Box<dyn FecCodec> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn create(&self, name: &str, params: CodecParams) -> Result<Box<dyn FecCodec>, CodecError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| CodecError::Unknown(name.to_string()))?;
        Ok(factory(params))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_include_reed_solomon() {
        let registry = CodecRegistry::with_defaults();
        assert_eq!(registry.names(), vec![reed_solomon::NAME]);
        let codec = registry
            .create(reed_solomon::NAME, CodecParams::default())
            .unwrap();
        assert_eq!(codec.name(), reed_solomon::NAME);
    }

    #[test]
    fn unknown_algorithm() {
        let registry = CodecRegistry::with_defaults();
        let err = registry.create("onion", CodecParams::default()).err();
        assert_eq!(err, Some(CodecError::Unknown("onion".into())));
    }

    #[test]
    fn custom_registration_overrides() {
        let mut registry = CodecRegistry::new();
        registry.register("rs-small", |_| {
            Box::new(ReedSolomon::new(CodecParams {
                block_size: 64,
                max_blocks_per_segment: 4,
                redundancy_percent: 50,
            })) as Box<dyn FecCodec>
        });
        let mut codec = registry.create("rs-small", CodecParams::default()).unwrap();
        codec.init(64 * 10).unwrap();
        assert_eq!(codec.segment_count(), 3);
    }
}
