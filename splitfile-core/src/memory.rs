//! In-process block network. Each request runs on its own thread; faults, latency and stalls are
//! scripted per key, and every request is counted so callers can check dispatch behavior.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::block::FailureReason;
use crate::key::BlockKey;
use crate::transport::{
    BlockOutcome, BlockRequest, BlockTransport, FetchedBlock, LeafState, RequestHandle,
    RequestListener, TransportEvent,
};

/// Request counters. Snapshot via `MemoryNetwork::stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub started: usize,
    pub fetches: usize,
    pub inserts: usize,
    /// Requests that observed a cancel before finishing.
    pub cancelled: usize,
    pub peak_active: usize,
}

#[derive(Debug, Clone)]
struct StoredBlock {
    data: Bytes,
    metadata: Option<Bytes>,
}

#[derive(Debug, Default)]
struct State {
    blocks: HashMap<BlockKey, StoredBlock>,
    faults: HashMap<BlockKey, VecDeque<FailureReason>>,
    corrupt: HashSet<BlockKey>,
    started_for: HashMap<BlockKey, usize>,
    latency: Duration,
    hold: bool,
    active: usize,
    stats: NetworkStats,
}

/// Cloneable handle to a shared in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<State>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking request thread must not wedge every later request.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a block under its content key.
    pub fn put(&self, data: impl Into<Bytes>) -> BlockKey {
        let data = data.into();
        let key = BlockKey::for_content(&data);
        self.lock().blocks.insert(
            key,
            StoredBlock {
                data,
                metadata: None,
            },
        );
        key
    }

    /// Store a block that carries auxiliary metadata alongside its content.
    pub fn put_with_metadata(&self, data: impl Into<Bytes>, metadata: impl Into<Bytes>) -> BlockKey {
        let data = data.into();
        let key = BlockKey::for_content(&data);
        self.lock().blocks.insert(
            key,
            StoredBlock {
                data,
                metadata: Some(metadata.into()),
            },
        );
        key
    }

    pub fn get(&self, key: &BlockKey) -> Option<Bytes> {
        self.lock().blocks.get(key).map(|b| b.data.clone())
    }

    pub fn remove(&self, key: &BlockKey) -> bool {
        self.lock().blocks.remove(key).is_some()
    }

    pub fn contains(&self, key: &BlockKey) -> bool {
        self.lock().blocks.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The next requests touching `key` fail with `reasons`, in order.
    pub fn fail_next(&self, key: BlockKey, reasons: Vec<FailureReason>) {
        self.lock().faults.entry(key).or_default().extend(reasons);
    }

    /// Fetches of `key` return content with one byte flipped.
    pub fn corrupt(&self, key: BlockKey) {
        self.lock().corrupt.insert(key);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// While set, newly started requests never complete on their own; only cancel ends them.
    pub fn hold(&self, hold: bool) {
        self.lock().hold = hold;
    }

    /// Requests currently running.
    pub fn active(&self) -> usize {
        self.lock().active
    }

    pub fn stats(&self) -> NetworkStats {
        self.lock().stats
    }

    /// How many requests were started for `key`; inserts count under their content key.
    pub fn started_for(&self, key: &BlockKey) -> usize {
        self.lock().started_for.get(key).copied().unwrap_or(0)
    }

    fn run(&self, request: &BlockRequest, key: BlockKey, listener: &RequestListener) -> Result<BlockOutcome, FailureReason> {
        let mut state = self.lock();
        if let Some(reason) = state.faults.get_mut(&key).and_then(VecDeque::pop_front) {
            drop(state);
            match &reason {
                FailureReason::RouteNotFound => listener.event(TransportEvent::RouteNotFound),
                FailureReason::DataNotFound => listener.event(TransportEvent::DataNotFound),
                FailureReason::Restarted(why) => listener.event(TransportEvent::Restarted(why.clone())),
                _ => {}
            }
            return Err(reason);
        }
        match request {
            BlockRequest::Fetch { .. } => {
                let Some(block) = state.blocks.get(&key).cloned() else {
                    drop(state);
                    listener.event(TransportEvent::DataNotFound);
                    return Err(FailureReason::DataNotFound);
                };
                let data = if state.corrupt.contains(&key) {
                    let mut bytes = block.data.to_vec();
                    if let Some(first) = bytes.first_mut() {
                        *first ^= 0xff;
                    } else {
                        bytes.push(0xff);
                    }
                    Bytes::from(bytes)
                } else {
                    block.data
                };
                drop(state);
                listener.event(TransportEvent::Transferred {
                    bytes: data.len() as u64,
                });
                Ok(BlockOutcome::Fetched(FetchedBlock {
                    data,
                    metadata: block.metadata,
                }))
            }
            BlockRequest::Insert { data, .. } => {
                if state.blocks.contains_key(&key) {
                    drop(state);
                    listener.event(TransportEvent::KeyCollision(key));
                    return Err(FailureReason::KeyCollision(key));
                }
                state.blocks.insert(
                    key,
                    StoredBlock {
                        data: data.clone(),
                        metadata: None,
                    },
                );
                drop(state);
                listener.event(TransportEvent::Transferred {
                    bytes: data.len() as u64,
                });
                Ok(BlockOutcome::Inserted(key))
            }
        }
    }
}

#[derive(Debug, Default)]
struct CancelSignal {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

impl CancelSignal {
    /// Sleep up to `wait` (forever if `None`). Returns true if cancelled meanwhile.
    fn wait(&self, wait: Option<Duration>) -> bool {
        let mut cancelled = self.cancelled.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = wait.map(|w| Instant::now() + w);
        while !*cancelled {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    cancelled = self
                        .cond
                        .wait_timeout(cancelled, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0);
                }
                None => {
                    cancelled = self.cond.wait(cancelled).unwrap_or_else(|e| e.into_inner());
                }
            }
        }
        *cancelled
    }
}

struct MemoryHandle {
    signal: Arc<CancelSignal>,
}

impl RequestHandle for MemoryHandle {
    fn cancel(&self) {
        let mut cancelled = self.signal.cancelled.lock().unwrap_or_else(|e| e.into_inner());
        *cancelled = true;
        self.signal.cond.notify_all();
    }
}

impl BlockTransport for MemoryNetwork {
    fn start(&self, request: BlockRequest, listener: RequestListener) -> Box<dyn RequestHandle> {
        let key = match &request {
            BlockRequest::Fetch { key, .. } => *key,
            BlockRequest::Insert { data, .. } => BlockKey::for_content(data),
        };
        let (latency, hold) = {
            let mut state = self.lock();
            state.stats.started += 1;
            match request {
                BlockRequest::Fetch { .. } => state.stats.fetches += 1,
                BlockRequest::Insert { .. } => state.stats.inserts += 1,
            }
            *state.started_for.entry(key).or_default() += 1;
            state.active += 1;
            state.stats.peak_active = state.stats.peak_active.max(state.active);
            (state.latency, state.hold)
        };
        listener.state(LeafState::Queued);

        let signal = Arc::new(CancelSignal::default());
        let network = self.clone();
        let thread_signal = signal.clone();
        thread::spawn(move || {
            listener.state(LeafState::Prepared);
            listener.state(LeafState::Requesting);
            let wait = if hold { None } else { Some(latency) };
            let cancelled = thread_signal.wait(wait);
            let result = if cancelled {
                network.lock().stats.cancelled += 1;
                Err(FailureReason::Cancelled)
            } else {
                network.run(&request, key, &listener)
            };
            network.lock().active -= 1;
            listener.finish(result);
        });
        Box::new(MemoryHandle { signal })
    }
}
