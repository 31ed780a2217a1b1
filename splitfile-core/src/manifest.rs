//! Split-file metadata: segment headers, block maps and checksum.
//! Framing: length-prefix (4 bytes LE) + bincode payload.

use serde::{Deserialize, Serialize};

use crate::codec::CodecParams;
use crate::segment::{BlockMap, SegmentHeader};

/// Current metadata layout version.
pub const MANIFEST_VERSION: u8 = 1;

const LEN_SIZE: usize = 4;
const MAX_MANIFEST_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Everything a fetcher needs to locate and rebuild a split file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitFileManifest {
    pub version: u8,
    /// FEC algorithm name, resolved through the codec registry.
    pub codec: String,
    /// Parameters the codec was created with.
    pub params: CodecParams,
    pub file_length: u64,
    pub headers: Vec<SegmentHeader>,
    pub blocks: Vec<BlockMap>,
    /// SHA-256 of the whole file, when the inserter computed one.
    pub checksum: Option<[u8; 32]>,
}

impl SplitFileManifest {
    pub fn new(
        codec: impl Into<String>,
        params: CodecParams,
        file_length: u64,
        headers: Vec<SegmentHeader>,
        blocks: Vec<BlockMap>,
        checksum: Option<[u8; 32]>,
    ) -> Self {
        Self {
            version: MANIFEST_VERSION,
            codec: codec.into(),
            params,
            file_length,
            headers,
            blocks,
            checksum,
        }
    }

    /// Check headers and block maps describe one consistent file.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.version != MANIFEST_VERSION {
            return Err(ManifestError::Version(self.version));
        }
        if self.headers.is_empty() {
            return Err(ManifestError::Inconsistent("no segments".into()));
        }
        if self.headers.len() != self.blocks.len() {
            return Err(ManifestError::Inconsistent(format!(
                "{} headers but {} block maps",
                self.headers.len(),
                self.blocks.len()
            )));
        }
        let mut offset = 0u64;
        let mut covered = 0u64;
        for (i, (h, map)) in self.headers.iter().zip(&self.blocks).enumerate() {
            if h.index != i || h.segment_count != self.headers.len() {
                return Err(ManifestError::Inconsistent(format!("segment {i} misnumbered")));
            }
            if h.file_length != self.file_length || h.offset != offset {
                return Err(ManifestError::Inconsistent(format!("segment {i} misplaced")));
            }
            if h.block_count == 0 || h.blocks_required == 0 || h.blocks_required > h.total_blocks() {
                return Err(ManifestError::Inconsistent(format!("segment {i} block counts")));
            }
            if map.data.len() != h.block_count || map.check.len() != h.check_block_count {
                return Err(ManifestError::Inconsistent(format!(
                    "segment {i} block map does not match header"
                )));
            }
            offset += (h.block_count * h.block_size) as u64;
            covered += h.length();
        }
        if covered != self.file_length {
            return Err(ManifestError::Inconsistent(format!(
                "segments cover {covered} bytes, file is {}",
                self.file_length
            )));
        }
        Ok(())
    }
}

/// Encode a manifest into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_manifest(manifest: &SplitFileManifest) -> Result<Vec<u8>, ManifestError> {
    let payload = bincode::serialize(manifest).map_err(ManifestError::Encode)?;
    if payload.len() > MAX_MANIFEST_LEN as usize {
        return Err(ManifestError::TooLarge);
    }
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode and validate a manifest frame. The frame must be the whole block.
pub fn decode_manifest(bytes: &[u8]) -> Result<SplitFileManifest, ManifestError> {
    if bytes.len() < LEN_SIZE {
        return Err(ManifestError::Truncated);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_MANIFEST_LEN as usize {
        return Err(ManifestError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(ManifestError::Truncated);
    }
    if bytes.len() > LEN_SIZE + len {
        return Err(ManifestError::TrailingBytes);
    }
    let manifest: SplitFileManifest =
        bincode::deserialize(&bytes[LEN_SIZE..]).map_err(ManifestError::Decode)?;
    manifest.validate()?;
    Ok(manifest)
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("encode error: {0}")]
    Encode(bincode::Error),
    #[error("metadata too large")]
    TooLarge,
    #[error("metadata truncated")]
    Truncated,
    #[error("trailing bytes after metadata")]
    TrailingBytes,
    #[error("decode error: {0}")]
    Decode(bincode::Error),
    #[error("unsupported metadata version {0}")]
    Version(u8),
    #[error("inconsistent metadata: {0}")]
    Inconsistent(String),
}
