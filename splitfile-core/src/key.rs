//! Content-hash keys: per-block SHA-256 addresses, verification, whole-file checksum.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Textual prefix of a content-hash key.
pub const CHK_PREFIX: &str = "CHK@";

/// Address of a block derived from its own content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockKey([u8; 32]);

impl BlockKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        BlockKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Key under which `payload` is stored.
    pub fn for_content(payload: &[u8]) -> Self {
        BlockKey(hash_block(payload))
    }

    /// Lowercase hex without the `CHK@` prefix; used for file names.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(digits: &str) -> Result<Self, KeyParseError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(digits, &mut out).map_err(|e| match e {
            hex::FromHexError::InvalidHexCharacter { .. } => KeyParseError::Digit,
            _ => KeyParseError::Length(digits.len()),
        })?;
        Ok(BlockKey(out))
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", CHK_PREFIX, self.to_hex())
    }
}

impl fmt::Debug for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable.
        write!(f, "{}{}", CHK_PREFIX, &self.to_hex()[..12])
    }
}

impl FromStr for BlockKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix(CHK_PREFIX).ok_or(KeyParseError::Prefix)?;
        BlockKey::from_hex(hex)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyParseError {
    #[error("key must start with {CHK_PREFIX}")]
    Prefix,
    #[error("expected 64 hex digits, got {0}")]
    Length(usize),
    #[error("invalid hex digit")]
    Digit,
}

/// Hash a block payload. Returns 32-byte digest.
pub fn hash_block(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Verify block payload against the key it was requested under.
pub fn verify_block(payload: &[u8], expected: &BlockKey) -> bool {
    hash_block(payload) == expected.0
}

/// Whole-file checksum embedded in split-file metadata.
pub fn checksum(data: &[u8]) -> [u8; 32] {
    let mut hasher = FileHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Incremental whole-file checksum, fed segment by segment in file order.
#[derive(Clone, Default)]
pub struct FileHasher(Sha256);

impl FileHasher {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        self.0.finalize().into()
    }
}
