//! Directory-backed block store: one file per block, named by the key's hex digest.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use splitfile_core::{
    BlockKey, BlockOutcome, BlockRequest, BlockTransport, FailureReason, FetchedBlock, LeafState,
    RequestHandle, RequestListener, TransportEvent,
};

#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: Arc<PathBuf>,
}

impl DirectoryStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root: Arc::new(root),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &BlockKey) -> PathBuf {
        self.root.join(key.to_hex())
    }

    fn fetch(&self, key: &BlockKey, listener: &RequestListener) -> Result<BlockOutcome, FailureReason> {
        match std::fs::read(self.path_for(key)) {
            Ok(data) => {
                listener.event(TransportEvent::Transferred {
                    bytes: data.len() as u64,
                });
                Ok(BlockOutcome::Fetched(FetchedBlock::new(Bytes::from(data))))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                listener.event(TransportEvent::DataNotFound);
                Err(FailureReason::DataNotFound)
            }
            Err(e) => Err(FailureReason::Transport(e.to_string())),
        }
    }

    fn insert(&self, data: &Bytes, listener: &RequestListener) -> Result<BlockOutcome, FailureReason> {
        let key = BlockKey::for_content(data);
        let path = self.path_for(&key);
        if path.exists() {
            listener.event(TransportEvent::KeyCollision(key));
            return Err(FailureReason::KeyCollision(key));
        }
        // Write under a unique temporary name, then rename so readers never see a partial block.
        let tmp = self
            .root
            .join(format!(".{}.{:?}.tmp", key.to_hex(), thread::current().id()));
        let written = std::fs::File::create(&tmp)
            .and_then(|mut f| f.write_all(data).and_then(|_| f.sync_all()))
            .and_then(|_| std::fs::rename(&tmp, &path));
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(FailureReason::Transport(e.to_string()));
        }
        listener.event(TransportEvent::Transferred {
            bytes: data.len() as u64,
        });
        Ok(BlockOutcome::Inserted(key))
    }
}

struct StoreHandle {
    cancelled: Arc<AtomicBool>,
}

impl RequestHandle for StoreHandle {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl BlockTransport for DirectoryStore {
    fn start(&self, request: BlockRequest, listener: RequestListener) -> Box<dyn RequestHandle> {
        listener.state(LeafState::Queued);
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let store = self.clone();
        thread::spawn(move || {
            listener.state(LeafState::Prepared);
            if flag.load(Ordering::SeqCst) {
                listener.finish(Err(FailureReason::Cancelled));
                return;
            }
            listener.state(LeafState::Requesting);
            let result = match &request {
                BlockRequest::Fetch { key, .. } => store.fetch(key, &listener),
                BlockRequest::Insert { data, .. } => store.insert(data, &listener),
            };
            tracing::trace!(htl = request.htl(), ok = result.is_ok(), "block request done");
            listener.finish(result);
        });
        Box::new(StoreHandle { cancelled })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splitfile_core::{
        CodecRegistry, EventSink, InsertConfig, RequestConfig, SplitFileFetcher, SplitFileInserter,
        TransferError,
    };

    fn small_insert() -> InsertConfig {
        let mut config = InsertConfig::default();
        config.codec.block_size = 64;
        config.codec.max_blocks_per_segment = 10;
        config.codec.redundancy_percent = 30;
        config
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn insert_then_fetch_through_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::open(dir.path().join("blocks")).unwrap();
        let registry = CodecRegistry::with_defaults();
        let data = payload(1500);

        let inserted = SplitFileInserter::new(data.clone(), small_insert(), &registry, EventSink::none())
            .unwrap()
            .execute(&store)
            .unwrap();
        assert!(store.path_for(&inserted.address).exists());

        let fetched = SplitFileFetcher::new(
            inserted.address,
            Vec::new(),
            RequestConfig::default(),
            registry,
            EventSink::none(),
        )
        .execute(&store)
        .unwrap();
        assert_eq!(fetched.output, data);
    }

    #[test]
    fn lost_blocks_are_decoded_and_healed() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::open(dir.path()).unwrap();
        let registry = CodecRegistry::with_defaults();
        let data = payload(640);

        let inserted = SplitFileInserter::new(data.clone(), small_insert(), &registry, EventSink::none())
            .unwrap()
            .execute(&store)
            .unwrap();
        let lost = inserted.manifest.blocks[0].data[2];
        std::fs::remove_file(store.path_for(&lost)).unwrap();

        // One at a time, so the lost block has failed before the segment is satisfied.
        let mut config = RequestConfig::default();
        config.retries = 0;
        config.max_threads = 1;
        let fetched = SplitFileFetcher::new(inserted.address, Vec::new(), config, registry, EventSink::none())
            .execute(&store)
            .unwrap();
        assert_eq!(fetched.output, data);
        assert!(store.path_for(&lost).exists());
    }

    #[test]
    fn unknown_address_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::open(dir.path()).unwrap();
        let mut config = RequestConfig::default();
        config.retries = 1;
        let err = SplitFileFetcher::new(
            BlockKey::for_content(b"nothing here"),
            Vec::new(),
            config,
            CodecRegistry::with_defaults(),
            EventSink::none(),
        )
        .execute(&store)
        .unwrap_err();
        assert!(matches!(err, TransferError::TooManyFailures { .. }), "{err:?}");
    }
}
