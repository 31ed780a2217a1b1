//! Split-file transfer engine.
//! Host-driven: no runtime; the caller's thread drives each pipeline and a host-supplied
//! `BlockTransport` runs the single-block requests.

pub mod block;
pub mod bucket;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod heal;
pub mod insert;
pub mod key;
pub mod manifest;
pub mod memory;
pub mod request;
pub mod segment;
pub mod transport;

pub use block::{BlockKind, BlockOp, BlockTarget, BlockWorkItem, FailureReason};
pub use bucket::{Bucket, BucketFactory};
pub use codec::{CodecError, CodecParams, CodecRegistry, FecCodec};
pub use config::{CodecConfig, HealerConfig, InsertConfig, RequestConfig};
pub use engine::{CancelHandle, RetryEngine, RetryPolicy, RetryableInfo, WorkSender};
pub use error::TransferError;
pub use events::{BlockResult, EventSink, ProgressEvent, TerminalState};
pub use heal::{BackgroundHealer, HealStats, Healer};
pub use insert::{InsertResult, InsertState, SplitFileInserter};
pub use key::{BlockKey, KeyParseError, CHK_PREFIX};
pub use manifest::{decode_manifest, encode_manifest, ManifestError, SplitFileManifest};
pub use memory::MemoryNetwork;
pub use request::{FetchResult, FetchState, FetchStats, SplitFileFetcher};
pub use segment::{BlockMap, SegmentHeader};
pub use transport::{
    BlockOutcome, BlockRequest, BlockTransport, FetchedBlock, LeafState, RequestHandle,
    RequestListener, TransportEvent,
};
