//! Pipeline settings. Every field has a default so partial TOML files deserialize.

use serde::{Deserialize, Serialize};

use crate::codec::{reed_solomon, CodecParams};

/// FEC algorithm and segment sizing used when inserting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodecConfig {
    /// Registry name of the FEC algorithm (default "reed-solomon").
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Data block size in bytes (default 32 KiB).
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Data blocks per segment (default 128).
    #[serde(default = "default_blocks_per_segment")]
    pub max_blocks_per_segment: usize,
    /// Check blocks as a percentage of data blocks (default 50).
    #[serde(default = "default_redundancy")]
    pub redundancy_percent: u32,
}

fn default_algorithm() -> String {
    reed_solomon::NAME.to_string()
}
fn default_block_size() -> usize {
    32 * 1024
}
fn default_blocks_per_segment() -> usize {
    128
}
fn default_redundancy() -> u32 {
    50
}

impl CodecConfig {
    pub fn params(&self) -> CodecParams {
        CodecParams {
            block_size: self.block_size,
            max_blocks_per_segment: self.max_blocks_per_segment,
            redundancy_percent: self.redundancy_percent,
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            block_size: default_block_size(),
            max_blocks_per_segment: default_blocks_per_segment(),
            redundancy_percent: default_redundancy(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InsertConfig {
    /// Concurrent block inserts (default 10).
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    /// Extra attempts per block after the first (default 3).
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Hops-to-live for every insert attempt (default 15).
    #[serde(default = "default_insert_htl")]
    pub htl: u32,
    /// Compute and embed a whole-file checksum (default true).
    #[serde(default = "default_true")]
    pub checksum: bool,
    #[serde(default)]
    pub codec: CodecConfig,
}

fn default_max_threads() -> usize {
    10
}
fn default_retries() -> u32 {
    3
}
fn default_insert_htl() -> u32 {
    15
}
fn default_true() -> bool {
    true
}

impl Default for InsertConfig {
    fn default() -> Self {
        Self {
            max_threads: default_max_threads(),
            retries: default_retries(),
            htl: default_insert_htl(),
            checksum: true,
            codec: CodecConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestConfig {
    /// Concurrent block fetches (default 10).
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    /// Extra attempts per block after the first (default 3).
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Hops-to-live of the first attempt (default 10).
    #[serde(default = "default_request_htl")]
    pub htl: u32,
    /// HTL added per retry (default 5).
    #[serde(default = "default_htl_increment")]
    pub htl_increment: u32,
    /// HTL for healing inserts (default 5).
    #[serde(default = "default_heal_htl")]
    pub heal_htl: u32,
    /// Share of unfetchable blocks to re-insert, in percent (default 100).
    #[serde(default = "default_heal_percentage")]
    pub heal_percentage: u32,
    /// Fetch segments in random order; output is still written in file order (default false).
    #[serde(default)]
    pub random_segs: bool,
    /// Re-verify every fetched and decoded block against its key (default false).
    #[serde(default)]
    pub paranoid: bool,
}

fn default_request_htl() -> u32 {
    10
}
fn default_htl_increment() -> u32 {
    5
}
fn default_heal_htl() -> u32 {
    5
}
fn default_heal_percentage() -> u32 {
    100
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_threads: default_max_threads(),
            retries: default_retries(),
            htl: default_request_htl(),
            htl_increment: default_htl_increment(),
            heal_htl: default_heal_htl(),
            heal_percentage: default_heal_percentage(),
            random_segs: false,
            paranoid: false,
        }
    }
}

/// Background healing inserter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealerConfig {
    /// Concurrent heal inserts (default 4).
    #[serde(default = "default_healer_threads")]
    pub max_threads: usize,
    /// Extra attempts per heal insert (default 1).
    #[serde(default = "default_healer_retries")]
    pub retries: u32,
    /// Oldest queued heal inserts beyond this are dropped (default 1024).
    #[serde(default = "default_healer_queue")]
    pub max_queue: usize,
}

fn default_healer_threads() -> usize {
    4
}
fn default_healer_retries() -> u32 {
    1
}
fn default_healer_queue() -> usize {
    1024
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            max_threads: default_healer_threads(),
            retries: default_healer_retries(),
            max_queue: default_healer_queue(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Document {
        #[serde(default)]
        insert: InsertConfig,
        #[serde(default)]
        request: RequestConfig,
        #[serde(default)]
        healer: HealerConfig,
    }

    #[test]
    fn partial_document_fills_defaults() {
        let doc: Document = toml::from_str(
            r#"
            [insert]
            retries = 1
            [insert.codec]
            block_size = 4096
            [request]
            paranoid = true
            "#,
        )
        .unwrap();
        assert_eq!(doc.insert.retries, 1);
        assert_eq!(doc.insert.max_threads, 10);
        assert_eq!(doc.insert.codec.block_size, 4096);
        assert_eq!(doc.insert.codec.algorithm, "reed-solomon");
        assert!(doc.request.paranoid);
        assert_eq!(doc.request.heal_percentage, 100);
        assert_eq!(doc.healer, HealerConfig::default());
    }

    #[test]
    fn unknown_field_rejected() {
        let res: Result<Document, _> = toml::from_str("[request]\nhtl_step = 3\n");
        assert!(res.is_err());
    }

    #[test]
    fn codec_params_follow_config() {
        let params = CodecConfig::default().params();
        assert_eq!(params, CodecParams::default());
    }
}
