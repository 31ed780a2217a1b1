//! Split-file insert: segment the source, FEC-encode each segment, insert every block, then insert
//! the metadata block whose key becomes the file's address.

use std::thread::{self, JoinHandle};

use bytes::Bytes;
use uuid::Uuid;

use crate::block::{BlockKind, BlockOp, BlockWorkItem};
use crate::bucket::BucketFactory;
use crate::codec::{CodecError, CodecRegistry, FecCodec};
use crate::config::InsertConfig;
use crate::engine::{
    CancelHandle, PipelineState, RetryEngine, RetryPolicy, RetryableInfo, Step, WorkQueue,
};
use crate::error::TransferError;
use crate::events::{EventSink, ProgressEvent};
use crate::key::{checksum, BlockKey};
use crate::manifest::{encode_manifest, SplitFileManifest};
use crate::segment::{segment_headers, BlockMap, SegmentBlocks, SegmentHeader};
use crate::transport::{BlockOutcome, BlockTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertState {
    Start,
    RequestingHeaders,
    HasHeaders,
    Encoding,
    Encoded,
    InsertingBlocks,
    InsertedBlocks,
    FinishedInserting,
    MakingMetadata,
    MadeMetadata,
    Done,
    Failing,
    Failed,
    Canceling,
    Canceled,
}

impl PipelineState for InsertState {
    const FAILING: Self = InsertState::Failing;
    const FAILED: Self = InsertState::Failed;
    const CANCELING: Self = InsertState::Canceling;
    const CANCELED: Self = InsertState::Canceled;
    const DONE: Self = InsertState::Done;
}

/// What a finished insert produced.
#[derive(Debug, Clone)]
pub struct InsertResult {
    /// Key of the metadata block; hand this to a fetcher.
    pub address: BlockKey,
    pub manifest: SplitFileManifest,
}

struct SegmentInsert {
    index: usize,
    blocks: SegmentBlocks,
    data_keys: Vec<Option<BlockKey>>,
    check_keys: Vec<Option<BlockKey>>,
}

struct InsertPolicy {
    state: InsertState,
    transfer: Uuid,
    config: InsertConfig,
    source: Bytes,
    codec: Box<dyn FecCodec>,
    buckets: BucketFactory,
    events: EventSink,
    headers: Vec<SegmentHeader>,
    maps: Vec<BlockMap>,
    current: Option<SegmentInsert>,
    next_segment: usize,
    checksum: Option<JoinHandle<[u8; 32]>>,
    manifest: Option<SplitFileManifest>,
    address: Option<BlockKey>,
}

impl InsertPolicy {
    fn header(&self, index: usize) -> Result<&SegmentHeader, TransferError> {
        self.headers
            .get(index)
            .ok_or(TransferError::Codec(CodecError::Segment(index)))
    }

    fn start_segment(&mut self) -> Result<(), TransferError> {
        let index = self.next_segment;
        let header = self.header(index)?.clone();
        self.events.emit(ProgressEvent::SegmentStarted {
            transfer: self.transfer,
            op: BlockOp::Insert,
            segment: index,
        });

        let mut blocks = SegmentBlocks::new(&header);
        let len = self.source.len();
        for position in 0..header.block_count {
            let start = (header.offset as usize + position * header.block_size).min(len);
            let end = (start + header.block_size).min(len);
            let bucket = self.buckets.padded(&self.source[start..end], header.block_size);
            blocks.put(BlockKind::Data, position, bucket);
        }
        tracing::debug!(
            transfer = %self.transfer,
            segment = index,
            blocks = header.block_count,
            block_size = header.block_size,
            "segment allocated"
        );
        self.current = Some(SegmentInsert {
            index,
            blocks,
            data_keys: vec![None; header.block_count],
            check_keys: vec![None; header.check_block_count],
        });
        Ok(())
    }

    fn encode_segment(&mut self) -> Result<(), TransferError> {
        let Some(run) = self.current.as_mut() else {
            return Err(TransferError::Stalled("Encoding without a segment".into()));
        };
        let header = self
            .headers
            .get(run.index)
            .ok_or(TransferError::Codec(CodecError::Segment(run.index)))?;
        self.events.emit(ProgressEvent::SegmentEncoding {
            transfer: self.transfer,
            segment: run.index,
            check_blocks: header.check_block_count,
        });
        let data: Vec<&[u8]> = run.blocks.data_slices().into_iter().flatten().collect();
        let check = self.codec.encode(run.index, &data, None)?;
        drop(data);
        for (position, block) in check.into_iter().enumerate() {
            run.blocks.put(BlockKind::Check, position, self.buckets.make(block));
        }
        Ok(())
    }

    fn queue_segment(&mut self, work: &mut WorkQueue<InsertState>) -> Result<(), TransferError> {
        let Some(run) = self.current.as_mut() else {
            return Err(TransferError::Stalled("Encoded without a segment".into()));
        };
        let total = run.data_keys.len() + run.check_keys.len();
        work.begin(RetryableInfo::new(
            InsertState::InsertingBlocks,
            InsertState::InsertedBlocks,
            total,
            0,
            self.config.retries,
        ));
        for kind in [BlockKind::Data, BlockKind::Check] {
            let count = match kind {
                BlockKind::Data => run.data_keys.len(),
                _ => run.check_keys.len(),
            };
            for position in 0..count {
                if let Some(bucket) = run.blocks.take(kind, position) {
                    work.queue_request(BlockWorkItem::insert(
                        bucket,
                        run.index,
                        kind,
                        position,
                        self.config.htl,
                    ));
                }
            }
        }
        Ok(())
    }

    fn finish_segment(&mut self) -> Result<(), TransferError> {
        let Some(mut run) = self.current.take() else {
            return Err(TransferError::Stalled("InsertedBlocks without a segment".into()));
        };
        run.blocks.release();
        let data: Option<Vec<BlockKey>> = run.data_keys.into_iter().collect();
        let check: Option<Vec<BlockKey>> = run.check_keys.into_iter().collect();
        let (Some(data), Some(check)) = (data, check) else {
            return Err(TransferError::Stalled(format!(
                "segment {} finished with blocks missing keys",
                run.index
            )));
        };
        self.maps.push(BlockMap { data, check });
        self.events.emit(ProgressEvent::SegmentFinished {
            transfer: self.transfer,
            op: BlockOp::Insert,
            segment: run.index,
        });
        self.next_segment += 1;
        Ok(())
    }

    fn queue_metadata(&mut self, work: &mut WorkQueue<InsertState>) -> Result<(), TransferError> {
        let checksum = match self.checksum.take() {
            Some(worker) => Some(
                worker
                    .join()
                    .map_err(|_| TransferError::Worker("checksum thread panicked".into()))?,
            ),
            None => None,
        };
        let manifest = SplitFileManifest::new(
            self.codec.name(),
            self.config.codec.params(),
            self.source.len() as u64,
            self.headers.clone(),
            std::mem::take(&mut self.maps),
            checksum,
        );
        let frame = encode_manifest(&manifest)?;
        tracing::debug!(
            transfer = %self.transfer,
            segments = manifest.headers.len(),
            bytes = frame.len(),
            "metadata assembled"
        );
        self.manifest = Some(manifest);
        work.begin(RetryableInfo::new(
            InsertState::MakingMetadata,
            InsertState::MadeMetadata,
            1,
            0,
            self.config.retries,
        ));
        work.queue_request(BlockWorkItem::insert(
            self.buckets.make(frame),
            0,
            BlockKind::Metadata,
            0,
            self.config.htl,
        ));
        Ok(())
    }
}

impl RetryPolicy for InsertPolicy {
    type State = InsertState;

    fn state(&self) -> InsertState {
        self.state
    }

    fn set_state(&mut self, state: InsertState) {
        self.state = state;
    }

    fn advance(&mut self, work: &mut WorkQueue<InsertState>) -> Result<Step, TransferError> {
        match self.state {
            InsertState::Start => {
                if self.config.checksum {
                    let source = self.source.clone();
                    self.checksum = Some(thread::spawn(move || checksum(&source)));
                }
                self.state = InsertState::RequestingHeaders;
            }
            InsertState::RequestingHeaders => {
                self.codec.init(self.source.len() as u64)?;
                self.headers = segment_headers(self.codec.as_ref(), self.source.len() as u64);
                tracing::info!(
                    transfer = %self.transfer,
                    bytes = self.source.len(),
                    segments = self.headers.len(),
                    codec = self.codec.name(),
                    "inserting split file"
                );
                self.events.emit(ProgressEvent::SplitFileStarted {
                    transfer: self.transfer,
                    op: BlockOp::Insert,
                    headers: self.headers.clone(),
                });
                self.state = InsertState::HasHeaders;
            }
            InsertState::HasHeaders => {
                if self.next_segment < self.headers.len() {
                    self.start_segment()?;
                    self.state = InsertState::Encoding;
                } else {
                    self.state = InsertState::FinishedInserting;
                }
            }
            InsertState::Encoding => {
                self.encode_segment()?;
                self.state = InsertState::Encoded;
            }
            InsertState::Encoded => self.queue_segment(work)?,
            InsertState::InsertedBlocks => {
                self.finish_segment()?;
                self.state = InsertState::HasHeaders;
            }
            InsertState::FinishedInserting => self.queue_metadata(work)?,
            InsertState::MadeMetadata => {
                if self.address.is_none() {
                    return Err(TransferError::Stalled("metadata inserted without a key".into()));
                }
                self.state = InsertState::Done;
            }
            other => return Err(TransferError::Stalled(format!("{other:?}"))),
        }
        Ok(Step::Continue)
    }

    fn on_success(
        &mut self,
        mut item: BlockWorkItem,
        outcome: BlockOutcome,
    ) -> Result<(), TransferError> {
        let BlockOutcome::Inserted(key) = outcome else {
            return Err(TransferError::Worker("insert returned a fetched block".into()));
        };
        if item.kind == BlockKind::Metadata {
            tracing::info!(transfer = %self.transfer, address = %key, "metadata inserted");
            self.address = Some(key);
            return Ok(());
        }
        let Some(run) = self.current.as_mut().filter(|r| r.index == item.segment) else {
            return Ok(());
        };
        let slot = match item.kind {
            BlockKind::Data => run.data_keys.get_mut(item.position),
            _ => run.check_keys.get_mut(item.position),
        };
        if let Some(slot) = slot {
            *slot = Some(key);
        }
        if let Some(bucket) = item.take_bucket() {
            run.blocks.put(item.kind, item.position, bucket);
        }
        Ok(())
    }

    fn on_terminal(&mut self, state: InsertState) {
        if let Some(mut run) = self.current.take() {
            run.blocks.release();
        }
        if state != InsertState::Done {
            // The checksum thread only reads the shared source; let it finish detached.
            self.checksum = None;
        }
    }

    fn message(&self) -> Option<String> {
        self.address.map(|key| key.to_string())
    }
}

/// Inserts one file. Build it, optionally grab a cancel handle, then `execute`.
pub struct SplitFileInserter {
    engine: RetryEngine<InsertPolicy>,
}

impl SplitFileInserter {
    pub fn new(
        source: impl Into<Bytes>,
        config: InsertConfig,
        registry: &CodecRegistry,
        events: EventSink,
    ) -> Result<Self, TransferError> {
        let codec = registry.create(&config.codec.algorithm, config.codec.params())?;
        let transfer = Uuid::new_v4();
        let max_threads = config.max_threads;
        let policy = InsertPolicy {
            state: InsertState::Start,
            transfer,
            config,
            source: source.into(),
            codec,
            buckets: BucketFactory::new(),
            events: events.clone(),
            headers: Vec::new(),
            maps: Vec::new(),
            current: None,
            next_segment: 0,
            checksum: None,
            manifest: None,
            address: None,
        };
        Ok(Self {
            engine: RetryEngine::new(policy, max_threads, transfer, events),
        })
    }

    /// Allocate block buffers from `factory` (lets callers audit buffer release).
    pub fn with_buckets(mut self, factory: BucketFactory) -> Self {
        self.engine.policy_mut().buckets = factory;
        self
    }

    pub fn transfer(&self) -> Uuid {
        self.engine.transfer()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.engine.cancel_handle()
    }

    pub fn state(&self) -> InsertState {
        self.engine.state()
    }

    pub fn execute(mut self, transport: &dyn BlockTransport) -> Result<InsertResult, TransferError> {
        self.engine.execute(transport)?;
        let policy = self.engine.into_policy();
        match (policy.address, policy.manifest) {
            (Some(address), Some(manifest)) => Ok(InsertResult { address, manifest }),
            _ => Err(TransferError::Stalled("insert finished without an address".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::FailureReason;
    use crate::config::CodecConfig;
    use crate::events::TerminalState;
    use crate::key::{self, verify_block};
    use crate::manifest::decode_manifest;
    use crate::memory::MemoryNetwork;
    use std::time::Duration;

    fn small_config() -> InsertConfig {
        InsertConfig {
            max_threads: 4,
            retries: 3,
            htl: 15,
            checksum: true,
            codec: CodecConfig {
                block_size: 64,
                max_blocks_per_segment: 10,
                redundancy_percent: 30,
                ..CodecConfig::default()
            },
        }
    }

    fn inserter(data: Vec<u8>, config: InsertConfig, events: EventSink) -> SplitFileInserter {
        SplitFileInserter::new(data, config, &CodecRegistry::with_defaults(), events).unwrap()
    }

    fn source(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn inserts_every_block_and_metadata() {
        let net = MemoryNetwork::new();
        let data = source(64 * 25 + 7);
        let factory = BucketFactory::new();
        let (sink, rx) = EventSink::channel();
        let result = inserter(data.clone(), small_config(), sink)
            .with_buckets(factory.clone())
            .execute(&net)
            .unwrap();

        let m = &result.manifest;
        assert_eq!(m.headers.len(), 3);
        assert_eq!(m.file_length, data.len() as u64);
        assert_eq!(m.checksum, Some(key::checksum(&data)));
        for (kind, _, k) in m.blocks.iter().flat_map(BlockMap::entries) {
            let block = net.get(k).unwrap();
            assert!(verify_block(&block, k), "{kind:?} block stored under wrong key");
        }
        let stored = net.get(&result.address).unwrap();
        assert_eq!(&decode_manifest(&stored).unwrap(), m);
        assert_eq!(factory.live(), 0);

        let events: Vec<_> = rx.try_iter().collect();
        let finished: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Finished { state, message, .. } => Some((*state, message.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            finished,
            vec![(TerminalState::Done, Some(result.address.to_string()))]
        );
        let encoded = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::SegmentEncoding { .. }))
            .count();
        assert_eq!(encoded, 3);
    }

    #[test]
    fn retried_block_succeeds_with_retry_count() {
        let net = MemoryNetwork::new();
        let data = source(64 * 4);
        let first = BlockKey::for_content(&data[..64]);
        net.fail_next(
            first,
            vec![FailureReason::RouteNotFound, FailureReason::RouteNotFound],
        );
        let (sink, rx) = EventSink::channel();
        inserter(data, small_config(), sink).execute(&net).unwrap();
        assert_eq!(net.started_for(&first), 3);
        let retries: Vec<u32> = rx
            .try_iter()
            .filter_map(|e| match e {
                ProgressEvent::BlockRequeued {
                    kind: BlockKind::Data,
                    position: 0,
                    retry_count,
                    ..
                } => Some(retry_count),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![1, 2]);
    }

    #[test]
    fn exhausted_insert_fails() {
        let net = MemoryNetwork::new();
        let data = source(64 * 4);
        let first = BlockKey::for_content(&data[..64]);
        net.fail_next(first, vec![FailureReason::RouteNotFound; 4]);
        let factory = BucketFactory::new();
        let err = inserter(data, small_config(), EventSink::none())
            .with_buckets(factory.clone())
            .execute(&net)
            .unwrap_err();
        assert!(matches!(err, TransferError::TooManyFailures { allowed: 0, .. }));
        assert_eq!(factory.live(), 0);
    }

    #[test]
    fn duplicate_blocks_collide_and_succeed() {
        let net = MemoryNetwork::new();
        // Every data block identical: all but the first insert collide.
        let data = vec![0xabu8; 64 * 6];
        let result = inserter(data, small_config(), EventSink::none())
            .execute(&net)
            .unwrap();
        let map = &result.manifest.blocks[0];
        assert!(map.data.iter().all(|k| *k == map.data[0]));
    }

    #[test]
    fn zero_length_file() {
        let net = MemoryNetwork::new();
        let result = inserter(Vec::new(), small_config(), EventSink::none())
            .execute(&net)
            .unwrap();
        assert_eq!(result.manifest.file_length, 0);
        assert_eq!(result.manifest.headers.len(), 1);
        assert_eq!(result.manifest.blocks[0].data.len(), 1);
    }

    #[test]
    fn unknown_codec_rejected() {
        let mut config = small_config();
        config.codec.algorithm = "onion".into();
        let registry = CodecRegistry::with_defaults();
        let err = SplitFileInserter::new(Vec::new(), config, &registry, EventSink::none())
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::Codec(CodecError::Unknown(_))));
    }

    #[test]
    fn invalid_codec_parameters_fail_pipeline() {
        let mut config = small_config();
        config.codec.block_size = 100;
        let (sink, rx) = EventSink::channel();
        let err = inserter(source(10), config, sink)
            .execute(&MemoryNetwork::new())
            .unwrap_err();
        assert!(matches!(err, TransferError::Codec(CodecError::InvalidParameters(_))));
        assert!(rx.try_iter().any(|e| matches!(
            e,
            ProgressEvent::Finished {
                state: TerminalState::Failed,
                cause: Some(_),
                ..
            }
        )));
    }

    #[test]
    fn cancel_mid_insert_releases_buffers() {
        let net = MemoryNetwork::new();
        net.hold(true);
        let factory = BucketFactory::new();
        let job = inserter(source(64 * 30), small_config(), EventSink::none())
            .with_buckets(factory.clone());
        let cancel = job.cancel_handle();
        let watcher = {
            let net = net.clone();
            thread::spawn(move || {
                while net.active() < 4 {
                    thread::sleep(Duration::from_millis(2));
                }
                cancel.cancel();
            })
        };
        let err = job.execute(&net).unwrap_err();
        watcher.join().unwrap();
        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(factory.live(), 0);
    }
}
