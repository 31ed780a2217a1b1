//! Split-file fetch: metadata, then per segment fetch until decodable, decode, heal, write out,
//! and finally verify the whole-file checksum.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use uuid::Uuid;

use crate::block::{BlockKind, BlockOp, BlockTarget, BlockWorkItem, FailureReason};
use crate::bucket::BucketFactory;
use crate::codec::{CodecError, CodecRegistry, FecCodec};
use crate::config::RequestConfig;
use crate::engine::{
    CancelHandle, PipelineState, RetryEngine, RetryPolicy, RetryableInfo, Step, Verifier,
    WorkQueue,
};
use crate::error::TransferError;
use crate::events::{EventSink, ProgressEvent};
use crate::heal::{select_heal_blocks, Healer};
use crate::key::{verify_block, BlockKey, FileHasher};
use crate::manifest::{decode_manifest, ManifestError, SplitFileManifest};
use crate::segment::{segment_headers, SegmentBlocks, SegmentHeader};
use crate::transport::{BlockOutcome, BlockTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Start,
    RequestingHeaders,
    HasHeaders,
    RequestingBlocks,
    HasBlocks,
    Decoding,
    CheckingDecoded,
    Decoded,
    InsertingMissingBlocks,
    InsertedMissingBlocks,
    VerifyingChecksum,
    Done,
    Failing,
    Failed,
    Canceling,
    Canceled,
}

impl PipelineState for FetchState {
    const FAILING: Self = FetchState::Failing;
    const FAILED: Self = FetchState::Failed;
    const CANCELING: Self = FetchState::Canceling;
    const CANCELED: Self = FetchState::Canceled;
    const DONE: Self = FetchState::Done;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub segments_decoded: usize,
    pub blocks_decoded: usize,
    /// Heal inserts queued, inline or handed to a background healer.
    pub heal_queued: usize,
    /// Inline heal inserts that succeeded.
    pub healed: usize,
    pub heal_failed: usize,
}

/// What a finished fetch produced.
#[derive(Debug)]
pub struct FetchResult<W> {
    pub output: W,
    pub manifest: SplitFileManifest,
    pub stats: FetchStats,
}

/// Segment numbering: data positions first, then check positions offset by the data count.
fn split_index(index: usize, block_count: usize) -> (BlockKind, usize) {
    if index < block_count {
        (BlockKind::Data, index)
    } else {
        (BlockKind::Check, index - block_count)
    }
}

struct SegmentFetch {
    index: usize,
    block_count: usize,
    blocks: SegmentBlocks,
    /// Blocks whose fetch failed for good.
    failed: Vec<usize>,
    decoded: Vec<usize>,
    heal: Vec<usize>,
}

struct FetchPolicy<W> {
    state: FetchState,
    transfer: Uuid,
    address: BlockKey,
    config: RequestConfig,
    registry: CodecRegistry,
    codec: Option<Box<dyn FecCodec>>,
    buckets: BucketFactory,
    events: EventSink,
    rng: StdRng,
    healer: Option<Arc<dyn Healer>>,
    manifest: Option<SplitFileManifest>,
    order: Vec<usize>,
    cursor: usize,
    current: Option<SegmentFetch>,
    // FIXME: with random_segs every decoded segment is kept in memory until the last one
    // completes. Fine for moderate files; very large files would want these spilled to disk.
    held: BTreeMap<usize, Bytes>,
    output: Option<W>,
    hasher: Option<FileHasher>,
    paranoid: bool,
    stats: FetchStats,
}

impl<W: Write + Send> FetchPolicy<W> {
    fn manifest(&self) -> Result<&SplitFileManifest, TransferError> {
        self.manifest
            .as_ref()
            .ok_or_else(|| TransferError::Stalled(format!("{:?} without metadata", self.state)))
    }

    fn header(&self, segment: usize) -> Result<&SegmentHeader, TransferError> {
        self.manifest()?
            .headers
            .get(segment)
            .ok_or(TransferError::Codec(CodecError::Segment(segment)))
    }

    fn run(&mut self) -> Result<&mut SegmentFetch, TransferError> {
        let state = self.state;
        self.current
            .as_mut()
            .ok_or_else(|| TransferError::Stalled(format!("{state:?} without a segment")))
    }

    /// Rebuild the codec from the metadata and check it reproduces the recorded layout.
    fn load_layout(&mut self) -> Result<(), TransferError> {
        let manifest = self.manifest()?;
        let mut codec = self.registry.create(&manifest.codec, manifest.params)?;
        codec.init(manifest.file_length)?;
        if segment_headers(codec.as_ref(), manifest.file_length) != manifest.headers {
            return Err(ManifestError::Inconsistent(format!(
                "segment layout does not match {} with the recorded parameters",
                manifest.codec
            ))
            .into());
        }
        let headers = manifest.headers.clone();
        tracing::info!(
            transfer = %self.transfer,
            address = %self.address,
            bytes = manifest.file_length,
            segments = headers.len(),
            codec = %manifest.codec,
            "fetching split file"
        );
        self.order = (0..headers.len()).collect();
        if self.config.random_segs {
            self.order.shuffle(&mut self.rng);
        }
        self.events.emit(ProgressEvent::SplitFileStarted {
            transfer: self.transfer,
            op: BlockOp::Fetch,
            headers,
        });
        self.codec = Some(codec);
        Ok(())
    }

    /// Open the fetch batch of the next segment, or move past the last one.
    fn next_segment(&mut self, work: &mut WorkQueue<FetchState>) -> Result<(), TransferError> {
        let Some(&index) = self.order.get(self.cursor) else {
            return self.finish_output();
        };
        let manifest = self.manifest()?;
        let header = manifest
            .headers
            .get(index)
            .ok_or(TransferError::Codec(CodecError::Segment(index)))?;
        let map = &manifest.blocks[index];
        self.events.emit(ProgressEvent::SegmentStarted {
            transfer: self.transfer,
            op: BlockOp::Fetch,
            segment: index,
        });
        tracing::debug!(
            transfer = %self.transfer,
            segment = index,
            required = header.blocks_required,
            total = header.total_blocks(),
            "requesting segment"
        );
        work.begin(RetryableInfo::new(
            FetchState::RequestingBlocks,
            FetchState::HasBlocks,
            header.blocks_required,
            header.failures_allowed(),
            self.config.retries,
        ));
        for (kind, position, key) in map.entries() {
            work.queue_request(BlockWorkItem::fetch(
                *key,
                index,
                kind,
                position,
                self.config.htl,
                self.config.htl_increment,
            ));
        }
        let run = SegmentFetch {
            index,
            block_count: header.block_count,
            blocks: SegmentBlocks::new(header),
            failed: Vec::new(),
            decoded: Vec::new(),
            heal: Vec::new(),
        };
        self.current = Some(run);
        Ok(())
    }

    fn decode_segment(&mut self) -> Result<(), TransferError> {
        let percentage = self.config.heal_percentage;
        let transfer = self.transfer;
        let Some(run) = self.current.as_mut() else {
            return Err(TransferError::Stalled("Decoding without a segment".into()));
        };
        let k = run.block_count;
        let heal = select_heal_blocks(&run.failed, percentage, &mut self.rng);
        let mut requested = run.blocks.missing(BlockKind::Data);
        requested.extend(
            heal.iter()
                .copied()
                .filter(|&i| i >= k && !run.blocks.has(BlockKind::Check, i - k)),
        );
        requested.sort_unstable();
        requested.dedup();

        self.events.emit(ProgressEvent::SegmentDecoding {
            transfer,
            segment: run.index,
            requested: requested.len(),
        });
        let codec = self
            .codec
            .as_ref()
            .ok_or(TransferError::Codec(CodecError::NotInitialised))?;
        let decoded = {
            let data = run.blocks.data_slices();
            let check = run.blocks.check_slices();
            codec.decode(run.index, &data, &check, &requested)?
        };
        for (&index, block) in requested.iter().zip(decoded) {
            let (kind, position) = split_index(index, k);
            run.blocks.put(kind, position, self.buckets.make(block));
        }
        tracing::debug!(
            %transfer,
            segment = run.index,
            decoded = requested.len(),
            heal = heal.len(),
            "segment decoded"
        );
        self.stats.segments_decoded += 1;
        self.stats.blocks_decoded += requested.len();
        run.decoded = requested;
        run.heal = heal;
        Ok(())
    }

    /// Decoded blocks must hash to the keys the metadata lists for them.
    fn check_decoded(&self) -> Result<(), TransferError> {
        let run = self
            .current
            .as_ref()
            .ok_or_else(|| TransferError::Stalled("CheckingDecoded without a segment".into()))?;
        let map = &self.manifest()?.blocks[run.index];
        for &index in &run.decoded {
            let (kind, position) = split_index(index, run.block_count);
            let (Some(expected), Some(bucket)) =
                (map.key(kind, position), run.blocks.get(kind, position))
            else {
                continue;
            };
            if !verify_block(bucket.as_slice(), expected) {
                return Err(TransferError::Integrity {
                    segment: run.index,
                    kind,
                    position,
                    reason: FailureReason::KeyMismatch {
                        expected: *expected,
                        actual: BlockKey::for_content(bucket.as_slice()),
                    },
                });
            }
        }
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransferError> {
        if let Some(output) = self.output.as_mut() {
            output.write_all(bytes)?;
        }
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(bytes);
        }
        Ok(())
    }

    fn emit_segment(&mut self) -> Result<(), TransferError> {
        let index = self.run()?.index;
        let length = self.header(index)?.length();
        let bytes = self.run()?.blocks.reassemble(length);
        if self.config.random_segs {
            self.held.insert(index, bytes);
        } else {
            self.write(&bytes)?;
        }
        Ok(())
    }

    /// Queue heal inserts for the current segment. Returns true if they run inline as a batch.
    fn queue_heal(&mut self, work: &mut WorkQueue<FetchState>) -> Result<bool, TransferError> {
        let heal_htl = self.config.heal_htl;
        let retries = self.config.retries;
        let transfer = self.transfer;
        let buckets = self.buckets.clone();
        let run = self.run()?;
        let index = run.index;
        let items: Vec<BlockWorkItem> = run
            .heal
            .iter()
            .filter_map(|&i| {
                let (kind, position) = split_index(i, run.block_count);
                run.blocks.get(kind, position).map(|bucket| {
                    BlockWorkItem::insert(buckets.make(bucket.bytes()), index, kind, position, heal_htl)
                })
            })
            .collect();
        run.blocks.release();
        if items.is_empty() {
            return Ok(false);
        }

        let count = items.len();
        self.stats.heal_queued += count;
        self.events.emit(ProgressEvent::HealingStarted {
            transfer,
            segment: index,
            blocks: count,
        });
        tracing::debug!(%transfer, segment = index, blocks = count, "healing segment");
        match &self.healer {
            Some(healer) => {
                for item in items {
                    healer.queue(item);
                }
                Ok(false)
            }
            None => {
                // Best effort: every heal insert may fail without failing the fetch.
                work.begin(RetryableInfo::new(
                    FetchState::InsertingMissingBlocks,
                    FetchState::InsertedMissingBlocks,
                    count,
                    count,
                    retries,
                ));
                for item in items {
                    work.queue_request(item);
                }
                Ok(true)
            }
        }
    }

    fn finish_segment(&mut self) -> Result<(), TransferError> {
        let Some(mut run) = self.current.take() else {
            return Err(TransferError::Stalled("InsertedMissingBlocks without a segment".into()));
        };
        run.blocks.release();
        self.events.emit(ProgressEvent::SegmentFinished {
            transfer: self.transfer,
            op: BlockOp::Fetch,
            segment: run.index,
        });
        self.cursor += 1;
        Ok(())
    }

    /// All segments done: flush held segments in file order and pick the closing state.
    fn finish_output(&mut self) -> Result<(), TransferError> {
        let held = std::mem::take(&mut self.held);
        for bytes in held.into_values() {
            self.write(&bytes)?;
        }
        if let Some(output) = self.output.as_mut() {
            output.flush()?;
        }
        self.state = if self.manifest()?.checksum.is_some() {
            FetchState::VerifyingChecksum
        } else {
            FetchState::Done
        };
        Ok(())
    }

    fn verify_checksum(&mut self) -> Result<(), TransferError> {
        self.events.emit(ProgressEvent::ChecksumVerifying {
            transfer: self.transfer,
        });
        let expected = self.manifest()?.checksum;
        let actual = self.hasher.take().map(FileHasher::finalize);
        if expected.is_some() && actual != expected {
            return Err(TransferError::ChecksumMismatch);
        }
        Ok(())
    }
}

impl<W: Write + Send> RetryPolicy for FetchPolicy<W> {
    type State = FetchState;

    fn state(&self) -> FetchState {
        self.state
    }

    fn set_state(&mut self, state: FetchState) {
        self.state = state;
    }

    fn advance(&mut self, work: &mut WorkQueue<FetchState>) -> Result<Step, TransferError> {
        match self.state {
            FetchState::Start => {
                work.begin(RetryableInfo::new(
                    FetchState::RequestingHeaders,
                    FetchState::HasHeaders,
                    1,
                    0,
                    self.config.retries,
                ));
                work.queue_request(BlockWorkItem::fetch(
                    self.address,
                    0,
                    BlockKind::Metadata,
                    0,
                    self.config.htl,
                    self.config.htl_increment,
                ));
            }
            FetchState::HasHeaders => {
                self.load_layout()?;
                self.next_segment(work)?;
            }
            FetchState::HasBlocks => {
                self.state = if self.run()?.blocks.data_complete() {
                    FetchState::Decoded
                } else {
                    FetchState::Decoding
                };
            }
            FetchState::Decoding => {
                self.decode_segment()?;
                self.state = if self.paranoid {
                    FetchState::CheckingDecoded
                } else {
                    FetchState::Decoded
                };
            }
            FetchState::CheckingDecoded => {
                self.check_decoded()?;
                self.state = FetchState::Decoded;
            }
            FetchState::Decoded => {
                self.emit_segment()?;
                if !self.queue_heal(work)? {
                    self.state = FetchState::InsertedMissingBlocks;
                }
            }
            FetchState::InsertedMissingBlocks => {
                self.finish_segment()?;
                self.next_segment(work)?;
            }
            FetchState::VerifyingChecksum => {
                self.verify_checksum()?;
                self.state = FetchState::Done;
            }
            other => return Err(TransferError::Stalled(format!("{other:?}"))),
        }
        Ok(Step::Continue)
    }

    fn chain(&mut self, item: &BlockWorkItem, outcome: &BlockOutcome) -> Option<Verifier> {
        if !self.paranoid || item.op != BlockOp::Fetch {
            return None;
        }
        let BlockOutcome::Fetched(block) = outcome else {
            return None;
        };
        if block.metadata.is_some() {
            tracing::warn!(
                transfer = %self.transfer,
                segment = item.segment,
                position = item.position,
                "block carries metadata, disabling content verification"
            );
            self.paranoid = false;
            return None;
        }
        let BlockTarget::Key(expected) = item.target else {
            return None;
        };
        Some(Box::new(move |outcome: BlockOutcome| {
            if let BlockOutcome::Fetched(block) = &outcome {
                let actual = BlockKey::for_content(&block.data);
                if actual != expected {
                    return Err(FailureReason::KeyMismatch { expected, actual });
                }
            }
            Ok(outcome)
        }))
    }

    fn on_success(
        &mut self,
        item: BlockWorkItem,
        outcome: BlockOutcome,
    ) -> Result<(), TransferError> {
        let block = match outcome {
            BlockOutcome::Inserted(_) => {
                self.stats.healed += 1;
                return Ok(());
            }
            BlockOutcome::Fetched(block) => block,
        };
        if block.metadata.is_some() && self.paranoid {
            self.paranoid = false;
        }
        if item.kind == BlockKind::Metadata {
            let manifest = decode_manifest(&block.data)?;
            self.manifest = Some(manifest);
            return Ok(());
        }

        let expected = self.header(item.segment)?.block_len(item.kind);
        if block.data.len() != expected {
            return Err(TransferError::BlockSize {
                segment: item.segment,
                kind: item.kind,
                position: item.position,
                expected,
                actual: block.data.len(),
            });
        }
        let bucket = self.buckets.make(block.data);
        if let Some(run) = self.current.as_mut().filter(|r| r.index == item.segment) {
            run.blocks.put(item.kind, item.position, bucket);
        }
        Ok(())
    }

    fn on_failure(&mut self, item: &BlockWorkItem, _reason: &FailureReason) {
        match item.op {
            BlockOp::Insert => self.stats.heal_failed += 1,
            BlockOp::Fetch => {
                if let Some(run) = self.current.as_mut().filter(|r| r.index == item.segment) {
                    let index = match item.kind {
                        BlockKind::Data => item.position,
                        BlockKind::Check => run.block_count + item.position,
                        BlockKind::Metadata => return,
                    };
                    run.failed.push(index);
                }
            }
        }
    }

    fn on_terminal(&mut self, _state: FetchState) {
        if let Some(mut run) = self.current.take() {
            run.blocks.release();
        }
        self.held.clear();
    }
}

/// Fetches one file into `output`. Build it, optionally grab a cancel handle, then `execute`.
pub struct SplitFileFetcher<W: Write + Send> {
    engine: RetryEngine<FetchPolicy<W>>,
}

impl<W: Write + Send> SplitFileFetcher<W> {
    pub fn new(
        address: BlockKey,
        output: W,
        config: RequestConfig,
        registry: CodecRegistry,
        events: EventSink,
    ) -> Self {
        let transfer = Uuid::new_v4();
        let max_threads = config.max_threads;
        let paranoid = config.paranoid;
        let policy = FetchPolicy {
            state: FetchState::Start,
            transfer,
            address,
            config,
            registry,
            codec: None,
            buckets: BucketFactory::new(),
            events: events.clone(),
            rng: StdRng::from_entropy(),
            healer: None,
            manifest: None,
            order: Vec::new(),
            cursor: 0,
            current: None,
            held: BTreeMap::new(),
            output: Some(output),
            hasher: Some(FileHasher::new()),
            paranoid,
            stats: FetchStats::default(),
        };
        Self {
            engine: RetryEngine::new(policy, max_threads, transfer, events),
        }
    }

    /// Hand heal inserts to `healer` instead of running them inline.
    pub fn with_healer(mut self, healer: Arc<dyn Healer>) -> Self {
        self.engine.policy_mut().healer = Some(healer);
        self
    }

    pub fn with_buckets(mut self, factory: BucketFactory) -> Self {
        self.engine.policy_mut().buckets = factory;
        self
    }

    /// Seed segment ordering and heal selection.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.engine.policy_mut().rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn transfer(&self) -> Uuid {
        self.engine.transfer()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.engine.cancel_handle()
    }

    pub fn state(&self) -> FetchState {
        self.engine.state()
    }

    pub fn execute(mut self, transport: &dyn BlockTransport) -> Result<FetchResult<W>, TransferError> {
        self.engine.execute(transport)?;
        let policy = self.engine.into_policy();
        match (policy.output, policy.manifest) {
            (Some(output), Some(manifest)) => Ok(FetchResult {
                output,
                manifest,
                stats: policy.stats,
            }),
            _ => Err(TransferError::Stalled("fetch finished without output".into())),
        }
    }
}
