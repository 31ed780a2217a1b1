//! Leaf transport contract: how one block fetch or insert is executed and reported back.
//!
//! The engine hands each dispatched request to a `BlockTransport` together with a
//! `RequestListener`. The transport runs the request wherever it likes (thread, task, remote
//! daemon) and reports state changes, events and exactly one final result through the listener.

use std::sync::mpsc::Sender;

use bytes::Bytes;

use crate::block::FailureReason;
use crate::engine::EngineEvent;
use crate::key::BlockKey;

/// A single-block operation as seen by the transport.
#[derive(Debug, Clone)]
pub enum BlockRequest {
    Fetch { key: BlockKey, htl: u32 },
    Insert { data: Bytes, htl: u32 },
}

impl BlockRequest {
    pub fn htl(&self) -> u32 {
        match self {
            BlockRequest::Fetch { htl, .. } | BlockRequest::Insert { htl, .. } => *htl,
        }
    }
}

/// Block content returned by a fetch.
#[derive(Debug, Clone)]
pub struct FetchedBlock {
    pub data: Bytes,
    /// Auxiliary metadata stored alongside the block, if any.
    pub metadata: Option<Bytes>,
}

impl FetchedBlock {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum BlockOutcome {
    Fetched(FetchedBlock),
    Inserted(BlockKey),
}

/// Lifecycle of a leaf request: queued -> prepared -> requesting -> {done|failed|cancelled}.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafState {
    Queued,
    Prepared,
    Requesting,
    Done,
    Failed,
    Cancelled,
}

/// Observational events a transport may emit while a request runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Transferred { bytes: u64 },
    Restarted(String),
    RouteNotFound,
    DataNotFound,
    KeyCollision(BlockKey),
}

/// Executes single-block requests asynchronously.
pub trait BlockTransport: Send + Sync {
    /// Start `request`. Must not block on the network; completion goes through `listener`.
    fn start(&self, request: BlockRequest, listener: RequestListener) -> Box<dyn RequestHandle>;
}

/// Handle to a running leaf request.
pub trait RequestHandle: Send {
    /// Best-effort, asynchronous. The request may still report a late result.
    fn cancel(&self);
}

/// Completion callback for one leaf request. Safe to move to any thread.
pub struct RequestListener {
    id: u64,
    tx: Sender<EngineEvent>,
}

impl RequestListener {
    pub(crate) fn new(id: u64, tx: Sender<EngineEvent>) -> Self {
        Self { id, tx }
    }

    pub fn state(&self, state: LeafState) {
        let _ = self.tx.send(EngineEvent::Leaf { id: self.id, state });
    }

    pub fn event(&self, event: TransportEvent) {
        let _ = self.tx.send(EngineEvent::Transport { id: self.id, event });
    }

    /// Report the final result. Consumes the listener so a request finishes at most once.
    pub fn finish(self, result: Result<BlockOutcome, FailureReason>) {
        let state = match &result {
            Ok(_) => LeafState::Done,
            Err(FailureReason::Cancelled) => LeafState::Cancelled,
            Err(_) => LeafState::Failed,
        };
        self.state(state);
        let _ = self.tx.send(EngineEvent::Finished {
            id: self.id,
            result,
        });
    }
}
