//! Segments: split a file into independently FEC-coded runs of blocks, track their blocks, reassemble.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::block::BlockKind;
use crate::bucket::Bucket;
use crate::codec::FecCodec;
use crate::key::BlockKey;

/// Immutable description of one segment of a split file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHeader {
    pub index: usize,
    pub segment_count: usize,
    pub file_length: u64,
    /// Byte offset of this segment's first data block in the file.
    pub offset: u64,
    /// Blocks needed to reconstruct the segment.
    pub blocks_required: usize,
    pub block_count: usize,
    pub block_size: usize,
    pub check_block_count: usize,
    pub check_block_size: usize,
    /// Index of this segment's first data block in whole-file numbering.
    pub data_block_offset: usize,
    /// Index of this segment's first check block in whole-file numbering.
    pub check_block_offset: usize,
}

impl SegmentHeader {
    pub fn total_blocks(&self) -> usize {
        self.block_count + self.check_block_count
    }

    /// Failed fetches the segment can absorb and still decode.
    pub fn failures_allowed(&self) -> usize {
        self.total_blocks().saturating_sub(self.blocks_required)
    }

    /// File bytes covered by this segment (excludes zero padding).
    pub fn length(&self) -> u64 {
        let span = (self.block_count * self.block_size) as u64;
        span.min(self.file_length.saturating_sub(self.offset))
    }

    pub fn block_len(&self, kind: BlockKind) -> usize {
        match kind {
            BlockKind::Check => self.check_block_size,
            _ => self.block_size,
        }
    }

    pub fn count(&self, kind: BlockKind) -> usize {
        match kind {
            BlockKind::Data => self.block_count,
            BlockKind::Check => self.check_block_count,
            BlockKind::Metadata => 0,
        }
    }
}

/// Derive every segment header from an initialised codec.
pub fn segment_headers(codec: &dyn FecCodec, file_length: u64) -> Vec<SegmentHeader> {
    let count = codec.segment_count();
    let mut out = Vec::with_capacity(count);
    let mut offset = 0u64;
    let mut data_block_offset = 0usize;
    let mut check_block_offset = 0usize;
    for index in 0..count {
        let header = SegmentHeader {
            index,
            segment_count: count,
            file_length,
            offset,
            blocks_required: codec.block_count(index),
            block_count: codec.block_count(index),
            block_size: codec.block_size(index),
            check_block_count: codec.check_block_count(index),
            check_block_size: codec.check_block_size(index),
            data_block_offset,
            check_block_offset,
        };
        offset += (header.block_count * header.block_size) as u64;
        data_block_offset += header.block_count;
        check_block_offset += header.check_block_count;
        out.push(header);
    }
    out
}

/// Content addresses of one segment's blocks, in position order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMap {
    pub data: Vec<BlockKey>,
    pub check: Vec<BlockKey>,
}

impl BlockMap {
    pub fn key(&self, kind: BlockKind, position: usize) -> Option<&BlockKey> {
        match kind {
            BlockKind::Data => self.data.get(position),
            BlockKind::Check => self.check.get(position),
            BlockKind::Metadata => None,
        }
    }

    /// Data keys then check keys, each tagged with kind and position.
    pub fn entries(&self) -> impl Iterator<Item = (BlockKind, usize, &BlockKey)> {
        self.data
            .iter()
            .enumerate()
            .map(|(i, k)| (BlockKind::Data, i, k))
            .chain(
                self.check
                    .iter()
                    .enumerate()
                    .map(|(i, k)| (BlockKind::Check, i, k)),
            )
    }
}

/// Per-segment working set: data and check positions, `None` meaning not yet available.
#[derive(Debug, Default)]
pub struct SegmentBlocks {
    data: Vec<Option<Bucket>>,
    check: Vec<Option<Bucket>>,
}

impl SegmentBlocks {
    pub fn new(header: &SegmentHeader) -> Self {
        Self {
            data: (0..header.block_count).map(|_| None).collect(),
            check: (0..header.check_block_count).map(|_| None).collect(),
        }
    }

    fn slots(&self, kind: BlockKind) -> &[Option<Bucket>] {
        match kind {
            BlockKind::Data => &self.data,
            BlockKind::Check => &self.check,
            BlockKind::Metadata => &[],
        }
    }

    fn slots_mut(&mut self, kind: BlockKind) -> Option<&mut Vec<Option<Bucket>>> {
        match kind {
            BlockKind::Data => Some(&mut self.data),
            BlockKind::Check => Some(&mut self.check),
            BlockKind::Metadata => None,
        }
    }

    /// Store a block. Returns false (and drops `bucket`) if the slot is filled or out of range.
    pub fn put(&mut self, kind: BlockKind, position: usize, bucket: Bucket) -> bool {
        match self.slots_mut(kind).and_then(|s| s.get_mut(position)) {
            Some(slot) if slot.is_none() => {
                *slot = Some(bucket);
                true
            }
            _ => false,
        }
    }

    pub fn take(&mut self, kind: BlockKind, position: usize) -> Option<Bucket> {
        self.slots_mut(kind)
            .and_then(|s| s.get_mut(position))
            .and_then(Option::take)
    }

    pub fn get(&self, kind: BlockKind, position: usize) -> Option<&Bucket> {
        self.slots(kind).get(position).and_then(Option::as_ref)
    }

    pub fn has(&self, kind: BlockKind, position: usize) -> bool {
        self.get(kind, position).is_some()
    }

    /// Number of blocks present, data and check.
    pub fn retrieved(&self) -> usize {
        self.data.iter().chain(&self.check).filter(|b| b.is_some()).count()
    }

    pub fn missing(&self, kind: BlockKind) -> Vec<usize> {
        self.slots(kind)
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_none())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn data_complete(&self) -> bool {
        self.data.iter().all(Option::is_some)
    }

    pub fn data_slices(&self) -> Vec<Option<&[u8]>> {
        self.data.iter().map(|b| b.as_ref().map(Bucket::as_slice)).collect()
    }

    pub fn check_slices(&self) -> Vec<Option<&[u8]>> {
        self.check.iter().map(|b| b.as_ref().map(Bucket::as_slice)).collect()
    }

    /// Concatenate data blocks in order, truncated to `length` file bytes. Call only when
    /// `data_complete()`.
    pub fn reassemble(&self, length: u64) -> Bytes {
        let mut out = BytesMut::with_capacity(length as usize);
        for bucket in self.data.iter().flatten() {
            let room = (length as usize).saturating_sub(out.len());
            if room == 0 {
                break;
            }
            let take = room.min(bucket.len());
            out.extend_from_slice(&bucket.as_slice()[..take]);
        }
        out.freeze()
    }

    /// Drop every buffer held for this segment.
    pub fn release(&mut self) {
        self.data.iter_mut().for_each(|b| *b = None);
        self.check.iter_mut().for_each(|b| *b = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketFactory;
    use crate::codec::{CodecParams, ReedSolomon};

    fn codec(block_size: usize, per_segment: usize, length: u64) -> ReedSolomon {
        let mut rs = ReedSolomon::new(CodecParams {
            block_size,
            max_blocks_per_segment: per_segment,
            redundancy_percent: 50,
        });
        rs.init(length).unwrap();
        rs
    }

    #[test]
    fn headers_carry_offsets() {
        let rs = codec(64, 4, 64 * 10);
        let headers = segment_headers(&rs, 64 * 10);
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[1].offset, 64 * 4);
        assert_eq!(headers[2].offset, 64 * 8);
        assert_eq!(headers[2].data_block_offset, 8);
        assert_eq!(headers[2].check_block_offset, 4);
        assert_eq!(headers[2].length(), 64 * 2);
        assert_eq!(headers[0].failures_allowed(), 2);
        assert!(headers.iter().all(|h| h.segment_count == 3));
    }

    #[test]
    fn last_segment_length_excludes_padding() {
        let rs = codec(64, 4, 64 * 5 + 3);
        let headers = segment_headers(&rs, 64 * 5 + 3);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[1].length(), 64 + 3);
        let total: u64 = headers.iter().map(SegmentHeader::length).sum();
        assert_eq!(total, 64 * 5 + 3);
    }

    #[test]
    fn working_set_put_take_release() {
        let factory = BucketFactory::new();
        let rs = codec(64, 4, 64 * 4);
        let header = &segment_headers(&rs, 64 * 4)[0];
        let mut blocks = SegmentBlocks::new(header);
        assert_eq!(blocks.missing(BlockKind::Data), vec![0, 1, 2, 3]);
        assert!(blocks.put(BlockKind::Data, 1, factory.make(vec![1u8; 64])));
        // Duplicate is rejected and its buffer dropped.
        assert!(!blocks.put(BlockKind::Data, 1, factory.make(vec![2u8; 64])));
        assert!(!blocks.put(BlockKind::Check, 9, factory.make(vec![2u8; 64])));
        assert!(blocks.put(BlockKind::Check, 0, factory.make(vec![3u8; 64])));
        assert_eq!(factory.live(), 2);
        assert_eq!(blocks.retrieved(), 2);
        assert_eq!(blocks.missing(BlockKind::Data), vec![0, 2, 3]);

        let taken = blocks.take(BlockKind::Check, 0).unwrap();
        assert_eq!(taken.as_slice()[0], 3);
        drop(taken);
        blocks.release();
        assert_eq!(factory.live(), 0);
        assert_eq!(blocks.retrieved(), 0);
    }

    #[test]
    fn reassemble_truncates_padding() {
        let factory = BucketFactory::new();
        let rs = codec(64, 4, 150);
        let header = segment_headers(&rs, 150).remove(0);
        let mut blocks = SegmentBlocks::new(&header);
        let source: Vec<u8> = (0..150u32).map(|i| i as u8).collect();
        for i in 0..header.block_count {
            let start = i * header.block_size;
            let end = (start + header.block_size).min(source.len());
            blocks.put(
                BlockKind::Data,
                i,
                factory.padded(&source[start..end], header.block_size),
            );
        }
        assert!(blocks.data_complete());
        assert_eq!(blocks.reassemble(header.length()).as_ref(), source.as_slice());
    }

    #[test]
    fn block_map_entries_order() {
        let map = BlockMap {
            data: vec![BlockKey::for_content(b"a"), BlockKey::for_content(b"b")],
            check: vec![BlockKey::for_content(b"c")],
        };
        let entries: Vec<_> = map.entries().map(|(k, i, _)| (k, i)).collect();
        assert_eq!(
            entries,
            vec![(BlockKind::Data, 0), (BlockKind::Data, 1), (BlockKind::Check, 0)]
        );
        assert_eq!(map.key(BlockKind::Check, 0), Some(&BlockKey::for_content(b"c")));
        assert_eq!(map.key(BlockKind::Metadata, 0), None);
    }
}
