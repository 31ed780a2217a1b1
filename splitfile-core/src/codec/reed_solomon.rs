//! Reed-Solomon codec over GF(2^16) via `reed-solomon-simd`.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;

use super::{CodecError, CodecParams, FecCodec};

pub const NAME: &str = "reed-solomon";

/// Block sizes are kept a multiple of this so every backend shard length is valid.
const ALIGN: usize = 64;
const MAX_BLOCKS_PER_SEGMENT: usize = 1024;
const MAX_REDUNDANCY_PERCENT: u32 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    blocks: usize,
    checks: usize,
    block_size: usize,
}

/// Systematic Reed-Solomon: data blocks are stored as-is, check blocks are recovery shards.
/// Any `k` of a segment's `k + m` blocks reconstruct it.
#[derive(Debug, Clone)]
pub struct ReedSolomon {
    params: CodecParams,
    layout: Option<Vec<Layout>>,
}

impl ReedSolomon {
    pub fn new(params: CodecParams) -> Self {
        Self {
            params,
            layout: None,
        }
    }

    fn validate(&self) -> Result<(), CodecError> {
        let p = &self.params;
        if p.block_size == 0 || p.block_size % ALIGN != 0 {
            return Err(CodecError::InvalidParameters(format!(
                "block size {} must be a non-zero multiple of {ALIGN}",
                p.block_size
            )));
        }
        if p.max_blocks_per_segment == 0 || p.max_blocks_per_segment > MAX_BLOCKS_PER_SEGMENT {
            return Err(CodecError::InvalidParameters(format!(
                "blocks per segment must be within 1..={MAX_BLOCKS_PER_SEGMENT}"
            )));
        }
        if p.redundancy_percent > MAX_REDUNDANCY_PERCENT {
            return Err(CodecError::InvalidParameters(format!(
                "redundancy above {MAX_REDUNDANCY_PERCENT}%"
            )));
        }
        Ok(())
    }

    fn layout(&self, segment: usize) -> Result<&Layout, CodecError> {
        self.layout
            .as_ref()
            .ok_or(CodecError::NotInitialised)?
            .get(segment)
            .ok_or(CodecError::Segment(segment))
    }

    fn field<F: Fn(&Layout) -> usize>(&self, segment: usize, f: F) -> usize {
        self.layout(segment).map(f).unwrap_or(0)
    }
}

fn check_count(blocks: usize, percent: u32) -> usize {
    ((blocks * percent as usize + 99) / 100).max(1)
}

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

fn backend(err: reed_solomon_simd::Error) -> CodecError {
    CodecError::Backend(err.to_string())
}

impl FecCodec for ReedSolomon {
    fn name(&self) -> &str {
        NAME
    }

    fn init(&mut self, file_length: u64) -> Result<(), CodecError> {
        self.validate()?;
        let block_size = self.params.block_size as u64;
        let per_segment = self.params.max_blocks_per_segment;
        let total_blocks = ((file_length + block_size - 1) / block_size).max(1) as usize;
        let segments = (total_blocks + per_segment - 1) / per_segment;

        let mut layout = Vec::with_capacity(segments);
        for s in 0..segments {
            let blocks = per_segment.min(total_blocks - s * per_segment);
            // The last segment shrinks its block size to what its tail needs.
            let size = if s + 1 == segments {
                let start = (s * per_segment) as u64 * block_size;
                let remaining = file_length.saturating_sub(start) as usize;
                round_up((remaining + blocks - 1) / blocks, ALIGN).clamp(ALIGN, self.params.block_size)
            } else {
                self.params.block_size
            };
            layout.push(Layout {
                blocks,
                checks: check_count(blocks, self.params.redundancy_percent),
                block_size: size,
            });
        }
        self.layout = Some(layout);
        Ok(())
    }

    fn segment_count(&self) -> usize {
        self.layout.as_ref().map(Vec::len).unwrap_or(0)
    }

    fn block_count(&self, segment: usize) -> usize {
        self.field(segment, |l| l.blocks)
    }

    fn check_block_count(&self, segment: usize) -> usize {
        self.field(segment, |l| l.checks)
    }

    fn block_size(&self, segment: usize) -> usize {
        self.field(segment, |l| l.block_size)
    }

    fn check_block_size(&self, segment: usize) -> usize {
        self.field(segment, |l| l.block_size)
    }

    fn encode(
        &self,
        segment: usize,
        data: &[&[u8]],
        requested: Option<&[usize]>,
    ) -> Result<Vec<Bytes>, CodecError> {
        let layout = *self.layout(segment)?;
        if data.len() != layout.blocks {
            return Err(CodecError::BlockCount {
                expected: layout.blocks,
                actual: data.len(),
            });
        }
        if let Some(bad) = data.iter().find(|d| d.len() != layout.block_size) {
            return Err(CodecError::BlockSize {
                expected: layout.block_size,
                actual: bad.len(),
            });
        }
        let recovery =
            reed_solomon_simd::encode(layout.blocks, layout.checks, data.iter().copied())
                .map_err(backend)?;

        match requested {
            None => Ok(recovery.into_iter().map(Bytes::from).collect()),
            // FIXME: subset selection maps each requested position straight to its recovery
            // shard. Only decode's check-block reconstruction calls this, always with sorted,
            // distinct positions; results for unsorted or repeated positions are unverified.
            Some(positions) => positions
                .iter()
                .map(|&p| {
                    recovery
                        .get(p)
                        .map(|shard| Bytes::copy_from_slice(shard))
                        .ok_or(CodecError::Index(layout.blocks + p))
                })
                .collect(),
        }
    }

    fn decode(
        &self,
        segment: usize,
        data: &[Option<&[u8]>],
        check: &[Option<&[u8]>],
        requested: &[usize],
    ) -> Result<Vec<Bytes>, CodecError> {
        let layout = *self.layout(segment)?;
        let k = layout.blocks;
        if data.len() != k {
            return Err(CodecError::BlockCount {
                expected: k,
                actual: data.len(),
            });
        }
        if check.len() != layout.checks {
            return Err(CodecError::BlockCount {
                expected: layout.checks,
                actual: check.len(),
            });
        }
        if let Some(bad) = data.iter().chain(check).flatten().find(|b| b.len() != layout.block_size) {
            return Err(CodecError::BlockSize {
                expected: layout.block_size,
                actual: bad.len(),
            });
        }
        if let Some(&bad) = requested.iter().find(|&&i| i >= k + layout.checks) {
            return Err(CodecError::Index(bad));
        }
        let have = data.iter().chain(check).filter(|b| b.is_some()).count();
        if have < k {
            return Err(CodecError::NotEnoughBlocks { have, need: k });
        }

        let mut restored: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
        if data.iter().any(Option::is_none) {
            let originals = data.iter().enumerate().filter_map(|(i, b)| b.map(|b| (i, b)));
            let recoveries = check.iter().enumerate().filter_map(|(i, b)| b.map(|b| (i, b)));
            restored = reed_solomon_simd::decode(k, layout.checks, originals, recoveries)
                .map_err(backend)?;
        }
        let mut full: Vec<Bytes> = Vec::with_capacity(k);
        for (i, block) in data.iter().enumerate() {
            let block = match block {
                Some(b) => Bytes::copy_from_slice(b),
                None => restored
                    .remove(&i)
                    .map(Bytes::from)
                    .ok_or_else(|| CodecError::Backend(format!("data block {i} not restored")))?,
            };
            full.push(block);
        }

        let mut missing_checks: Vec<usize> = requested
            .iter()
            .filter(|&&i| i >= k && check[i - k].is_none())
            .map(|&i| i - k)
            .collect();
        missing_checks.sort_unstable();
        missing_checks.dedup();
        let mut rebuilt: HashMap<usize, Bytes> = HashMap::new();
        if !missing_checks.is_empty() {
            let refs: Vec<&[u8]> = full.iter().map(|b| b.as_ref()).collect();
            let encoded = self.encode(segment, &refs, Some(&missing_checks))?;
            rebuilt.extend(missing_checks.into_iter().zip(encoded));
        }

        let mut out = Vec::with_capacity(requested.len());
        for &i in requested {
            let block = if i < k {
                full[i].clone()
            } else {
                match check[i - k] {
                    Some(b) => Bytes::copy_from_slice(b),
                    None => rebuilt
                        .get(&(i - k))
                        .cloned()
                        .ok_or(CodecError::Index(i))?,
                }
            };
            out.push(block);
        }
        Ok(out)
    }
}
