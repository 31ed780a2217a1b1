//! Retry engine: bounded-concurrency dispatch of block work items with per-batch retry accounting.
//!
//! One coordinator (the thread calling `execute`) owns the queue, the in-flight set and every
//! counter. Leaf completions, verification results, cancellation and external enqueues reach it
//! as `EngineEvent`s over a single channel; nothing else mutates engine state. Pipelines plug in
//! through `RetryPolicy`, which advances their state machine between batches.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use uuid::Uuid;

use crate::block::{BlockOp, BlockTarget, BlockWorkItem, FailureReason};
use crate::error::TransferError;
use crate::events::{BlockResult, EventSink, ProgressEvent, TerminalState};
use crate::transport::{
    BlockOutcome, BlockRequest, BlockTransport, LeafState, RequestHandle, RequestListener,
    TransportEvent,
};

/// Bounded wait between coordinator wake-ups when nothing arrives on the channel.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Everything that can wake the coordinator.
pub(crate) enum EngineEvent {
    Leaf {
        id: u64,
        state: LeafState,
    },
    Transport {
        id: u64,
        event: TransportEvent,
    },
    Finished {
        id: u64,
        result: Result<BlockOutcome, FailureReason>,
    },
    /// Result of a chained verification step started after `Finished`.
    Verified {
        id: u64,
        result: Result<BlockOutcome, FailureReason>,
    },
    Cancel,
    Enqueue {
        item: BlockWorkItem,
        priority: bool,
    },
    Wake,
}

/// Phase enumeration of a pipeline. The five associated states are the ones the engine itself
/// drives; everything else belongs to the policy.
pub trait PipelineState: Copy + Eq + fmt::Debug + Send + 'static {
    const FAILING: Self;
    const FAILED: Self;
    const CANCELING: Self;
    const CANCELED: Self;
    const DONE: Self;

    fn is_terminal(self) -> bool {
        self == Self::DONE || self == Self::FAILED || self == Self::CANCELED
    }

    fn terminal(self) -> Option<TerminalState> {
        if self == Self::DONE {
            Some(TerminalState::Done)
        } else if self == Self::FAILED {
            Some(TerminalState::Failed)
        } else if self == Self::CANCELED {
            Some(TerminalState::Canceled)
        } else {
            None
        }
    }
}

/// Retry accounting for one batch of work items. Items queued while the batch is open belong to
/// it; when it completes the pipeline moves from `working` to `target`.
#[derive(Debug, Clone)]
pub struct RetryableInfo<S> {
    pub working: S,
    pub target: S,
    pub successes: usize,
    pub successes_required: usize,
    pub failures: usize,
    pub failures_allowed: usize,
    /// Extra attempts per item after the first.
    pub retries: u32,
}

impl<S> RetryableInfo<S> {
    pub fn new(
        working: S,
        target: S,
        successes_required: usize,
        failures_allowed: usize,
        retries: u32,
    ) -> Self {
        Self {
            working,
            target,
            successes: 0,
            successes_required,
            failures: 0,
            failures_allowed,
            retries,
        }
    }
}

#[derive(Debug)]
struct Batch<S> {
    id: u64,
    info: RetryableInfo<S>,
    /// Items of this batch that are queued or in flight.
    outstanding: usize,
}

impl<S> Batch<S> {
    fn complete(&self) -> bool {
        self.info.successes >= self.info.successes_required || self.outstanding == 0
    }
}

/// Pending FIFO plus the open batch. Handed to the policy whenever it may queue work.
pub struct WorkQueue<S> {
    queue: VecDeque<BlockWorkItem>,
    batch: Option<Batch<S>>,
    next_batch: u64,
    in_flight: usize,
    cap: Option<usize>,
    transfer: Uuid,
    events: EventSink,
}

impl<S: PipelineState> WorkQueue<S> {
    fn new(transfer: Uuid, events: EventSink) -> Self {
        Self {
            queue: VecDeque::new(),
            batch: None,
            next_batch: 1,
            in_flight: 0,
            cap: None,
            transfer,
            events,
        }
    }

    /// Open a batch. Returns its id. Items queued from now on count towards it.
    pub fn begin(&mut self, info: RetryableInfo<S>) -> u64 {
        debug_assert!(self.batch.is_none(), "batch already open");
        let id = self.next_batch;
        self.next_batch += 1;
        self.batch = Some(Batch {
            id,
            info,
            outstanding: 0,
        });
        id
    }

    /// Accounting of the open batch, if any.
    pub fn batch(&self) -> Option<&RetryableInfo<S>> {
        self.batch.as_ref().map(|b| &b.info)
    }

    pub fn queue_request(&mut self, item: BlockWorkItem) {
        let item = self.adopt(item);
        self.queue.push_back(item);
    }

    pub fn priority_queue_request(&mut self, item: BlockWorkItem) {
        let item = self.adopt(item);
        self.queue.push_front(item);
    }

    fn adopt(&mut self, mut item: BlockWorkItem) -> BlockWorkItem {
        item.batch = match self.batch.as_mut() {
            Some(batch) => {
                batch.outstanding += 1;
                batch.id
            }
            None => 0,
        };
        self.events.emit(ProgressEvent::BlockQueued {
            transfer: self.transfer,
            op: item.op,
            segment: item.segment,
            kind: item.kind,
            position: item.position,
        });
        item
    }

    /// Drop the oldest queued items beyond `max`. Returns how many were dropped.
    pub fn trim_queue(&mut self, max: usize) -> usize {
        let mut dropped = 0;
        while self.queue.len() > max {
            if let Some(item) = self.queue.pop_front() {
                self.forget(&item);
                self.canceled(&item);
                tracing::debug!(
                    segment = item.segment,
                    kind = ?item.kind,
                    position = item.position,
                    "queue over capacity, dropping oldest item"
                );
                dropped += 1;
            }
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Items dispatched and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Queue cap applied after every external enqueue, if set.
    pub fn cap(&self) -> Option<usize> {
        self.cap
    }

    /// An item left the batch without succeeding or failing.
    fn forget(&mut self, item: &BlockWorkItem) {
        if let Some(batch) = self.batch.as_mut() {
            if batch.id == item.batch {
                batch.outstanding = batch.outstanding.saturating_sub(1);
            }
        }
    }

    /// Report an item that leaves without succeeding or failing.
    fn canceled(&self, item: &BlockWorkItem) {
        self.events.emit(ProgressEvent::BlockFinished {
            transfer: self.transfer,
            op: item.op,
            segment: item.segment,
            kind: item.kind,
            position: item.position,
            result: BlockResult::Canceled,
        });
    }

    fn current(&self, item: &BlockWorkItem) -> bool {
        match &self.batch {
            Some(batch) => item.batch == batch.id,
            None => item.batch == 0,
        }
    }

    fn retries_for(&self, item: &BlockWorkItem, free: u32) -> u32 {
        match &self.batch {
            Some(batch) if batch.id == item.batch => batch.info.retries,
            _ => free,
        }
    }
}

/// Result of one `advance` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The policy changed state or opened a batch; call again.
    Continue,
    /// Nothing to do until work arrives from outside.
    Idle,
}

/// Deferred acceptance check for a successful leaf result. Runs off the coordinator thread.
pub type Verifier =
    Box<dyn FnOnce(BlockOutcome) -> Result<BlockOutcome, FailureReason> + Send + 'static>;

/// Pipeline-specific behavior plugged into `RetryEngine`.
pub trait RetryPolicy: Send {
    type State: PipelineState;

    fn state(&self) -> Self::State;
    fn set_state(&mut self, state: Self::State);

    /// Called while no batch is open and the state is not terminal. Either move to a new state,
    /// open a batch, or report `Idle`.
    fn advance(&mut self, work: &mut WorkQueue<Self::State>) -> Result<Step, TransferError>;

    /// Optional verification before a success counts.
    fn chain(&mut self, _item: &BlockWorkItem, _outcome: &BlockOutcome) -> Option<Verifier> {
        None
    }

    /// The item succeeded. Takes ownership so buffers can move into the pipeline.
    fn on_success(
        &mut self,
        item: BlockWorkItem,
        outcome: BlockOutcome,
    ) -> Result<(), TransferError>;

    /// The item failed for good (retries exhausted or not retryable).
    fn on_failure(&mut self, _item: &BlockWorkItem, _reason: &FailureReason) {}

    /// Work handed in through a `WorkSender`.
    fn on_enqueue(
        &mut self,
        work: &mut WorkQueue<Self::State>,
        item: BlockWorkItem,
        priority: bool,
    ) {
        if priority {
            work.priority_queue_request(item);
        } else {
            work.queue_request(item);
        }
        if let Some(cap) = work.cap() {
            work.trim_queue(cap);
        }
    }

    /// The pipeline reached a terminal state. Release anything still held.
    fn on_terminal(&mut self, _state: Self::State) {}

    /// Human-readable message for the terminal event.
    fn message(&self) -> Option<String> {
        None
    }
}

/// Requests cancellation of a running engine from any thread.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Sender<EngineEvent>,
    requested: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(EngineEvent::Cancel);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("requested", &self.is_cancelled())
            .finish()
    }
}

/// Feeds work items into a running engine from other threads.
#[derive(Clone)]
pub struct WorkSender {
    tx: Sender<EngineEvent>,
}

impl WorkSender {
    pub fn queue(&self, item: BlockWorkItem) -> bool {
        self.tx
            .send(EngineEvent::Enqueue {
                item,
                priority: false,
            })
            .is_ok()
    }

    pub fn priority_queue(&self, item: BlockWorkItem) -> bool {
        self.tx
            .send(EngineEvent::Enqueue {
                item,
                priority: true,
            })
            .is_ok()
    }

    pub fn wake(&self) {
        let _ = self.tx.send(EngineEvent::Wake);
    }
}

/// A request ready to hand to a transport.
pub struct Dispatch {
    pub id: u64,
    pub request: BlockRequest,
    pub listener: RequestListener,
}

struct InFlight {
    item: BlockWorkItem,
    handle: Option<Box<dyn RequestHandle>>,
    verifying: bool,
}

pub struct RetryEngine<P: RetryPolicy> {
    policy: P,
    work: WorkQueue<P::State>,
    in_flight: HashMap<u64, InFlight>,
    next_id: u64,
    max_threads: usize,
    /// Retry budget for items queued outside any batch.
    free_retries: u32,
    tx: Sender<EngineEvent>,
    rx: Receiver<EngineEvent>,
    cancel: CancelHandle,
    transfer: Uuid,
    events: EventSink,
    failure: Option<TransferError>,
    posted: bool,
    peak_in_flight: usize,
}

impl<P: RetryPolicy> RetryEngine<P> {
    pub fn new(policy: P, max_threads: usize, transfer: Uuid, events: EventSink) -> Self {
        let (tx, rx) = mpsc::channel();
        let cancel = CancelHandle {
            tx: tx.clone(),
            requested: Arc::new(AtomicBool::new(false)),
        };
        Self {
            policy,
            work: WorkQueue::new(transfer, events.clone()),
            in_flight: HashMap::new(),
            next_id: 1,
            max_threads: max_threads.max(1),
            free_retries: 0,
            tx,
            rx,
            cancel,
            transfer,
            events,
            failure: None,
            posted: false,
            peak_in_flight: 0,
        }
    }

    /// Cap the pending queue; oldest items beyond it are dropped on external enqueue.
    pub fn with_queue_cap(mut self, cap: usize) -> Self {
        self.work.cap = Some(cap);
        self
    }

    pub fn with_free_retries(mut self, retries: u32) -> Self {
        self.free_retries = retries;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn work_sender(&self) -> WorkSender {
        WorkSender {
            tx: self.tx.clone(),
        }
    }

    pub fn transfer(&self) -> Uuid {
        self.transfer
    }

    pub fn state(&self) -> P::State {
        self.policy.state()
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut P {
        &mut self.policy
    }

    pub fn into_policy(self) -> P {
        self.policy
    }

    /// Highest number of simultaneously dispatched items seen so far.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight
    }

    /// Queue non-empty, below the concurrency limit, and still running.
    pub fn can_request(&self) -> bool {
        let state = self.policy.state();
        !self.work.queue.is_empty()
            && self.in_flight.len() < self.max_threads
            && !state.is_terminal()
            && state != P::State::FAILING
            && state != P::State::CANCELING
    }

    /// Wait until an item can be dispatched and dequeue it. `None` once the pipeline is terminal.
    pub fn next_request(&mut self) -> Option<Dispatch> {
        loop {
            while let Ok(event) = self.rx.try_recv() {
                self.handle(event);
            }
            if self.policy.state().is_terminal() {
                self.settle();
                return None;
            }

            if self.work.batch.as_ref().is_some_and(Batch::complete) {
                self.complete_batch();
                continue;
            }

            if self.work.batch.is_none() {
                let before = self.policy.state();
                match self.policy.advance(&mut self.work) {
                    Ok(Step::Continue) => {
                        if let Some(batch) = &self.work.batch {
                            let working = batch.info.working;
                            if self.policy.state() != working {
                                self.policy.set_state(working);
                            }
                            continue;
                        }
                        if self.policy.state() != before {
                            self.settle();
                            continue;
                        }
                        self.fail(TransferError::Stalled(format!("{before:?}")));
                        continue;
                    }
                    Ok(Step::Idle) => {}
                    Err(err) => {
                        self.fail(err);
                        continue;
                    }
                }
            }

            if self.can_request() {
                if let Some(dispatch) = self.dispatch() {
                    return Some(dispatch);
                }
                continue;
            }

            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(event) => self.handle(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.fail(TransferError::Worker("event channel closed".into()));
                }
            }
        }
    }

    /// Drive the pipeline to a terminal state, starting leaf requests on `transport`.
    pub fn execute(&mut self, transport: &dyn BlockTransport) -> Result<(), TransferError> {
        while let Some(dispatch) = self.next_request() {
            let handle = transport.start(dispatch.request, dispatch.listener);
            match self.in_flight.get_mut(&dispatch.id) {
                Some(entry) => entry.handle = Some(handle),
                None => handle.cancel(),
            }
        }
        let state = self.policy.state();
        if state == P::State::DONE {
            Ok(())
        } else if state == P::State::CANCELED {
            Err(TransferError::Cancelled)
        } else {
            Err(self
                .failure
                .take()
                .unwrap_or_else(|| TransferError::Worker(format!("ended in {state:?}"))))
        }
    }

    /// Drop every queued item and cancel every in-flight one. Late results are ignored.
    pub fn cancel_all(&mut self) {
        let queued: Vec<BlockWorkItem> = self.work.queue.drain(..).collect();
        for item in &queued {
            self.work.forget(item);
            self.work.canceled(item);
        }
        let handles: Vec<Box<dyn RequestHandle>> = self
            .in_flight
            .drain()
            .filter_map(|(_, entry)| {
                self.work.forget(&entry.item);
                self.work.canceled(&entry.item);
                entry.handle
            })
            .collect();
        self.work.in_flight = 0;
        tracing::debug!(
            transfer = %self.transfer,
            queued = queued.len(),
            in_flight = handles.len(),
            "cancelling outstanding work"
        );
        drop(queued);
        for handle in handles {
            handle.cancel();
        }
    }

    fn dispatch(&mut self) -> Option<Dispatch> {
        let mut item = self.work.queue.pop_front()?;
        let request = match request_for(&item) {
            Some(request) => request,
            None => {
                self.work.forget(&item);
                self.fail(TransferError::Worker(format!(
                    "segment {} {:?} block {} has nothing to send",
                    item.segment, item.kind, item.position
                )));
                return None;
            }
        };
        let id = self.next_id;
        self.next_id += 1;
        item.id = id;

        self.events.emit(ProgressEvent::BlockStarted {
            transfer: self.transfer,
            op: item.op,
            segment: item.segment,
            kind: item.kind,
            position: item.position,
            htl: request.htl(),
        });
        tracing::trace!(
            transfer = %self.transfer,
            id,
            segment = item.segment,
            kind = ?item.kind,
            position = item.position,
            htl = request.htl(),
            retry = item.retry_count,
            "dispatching block request"
        );
        self.in_flight.insert(
            id,
            InFlight {
                item,
                handle: None,
                verifying: false,
            },
        );
        self.work.in_flight = self.in_flight.len();
        self.peak_in_flight = self.peak_in_flight.max(self.in_flight.len());
        let listener = RequestListener::new(id, self.tx.clone());
        Some(Dispatch {
            id,
            request,
            listener,
        })
    }

    fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Leaf { id, state } => {
                tracing::trace!(transfer = %self.transfer, id, ?state, "leaf state");
            }
            EngineEvent::Transport { id, event } => match event {
                TransportEvent::Transferred { bytes } => {
                    tracing::trace!(transfer = %self.transfer, id, bytes, "transferred");
                }
                other => {
                    tracing::debug!(transfer = %self.transfer, id, event = ?other, "transport event");
                }
            },
            EngineEvent::Finished { id, result } => self.finished(id, result, false),
            EngineEvent::Verified { id, result } => self.finished(id, result, true),
            EngineEvent::Cancel => self.cancel(),
            EngineEvent::Enqueue { item, priority } => {
                let state = self.policy.state();
                if state.is_terminal() || state == P::State::FAILING || state == P::State::CANCELING
                {
                    tracing::debug!(transfer = %self.transfer, "pipeline finished, dropping enqueued item");
                    return;
                }
                self.policy.on_enqueue(&mut self.work, item, priority);
            }
            EngineEvent::Wake => {}
        }
    }

    fn finished(&mut self, id: u64, result: Result<BlockOutcome, FailureReason>, verified: bool) {
        let Some(entry) = self.in_flight.remove(&id) else {
            tracing::debug!(transfer = %self.transfer, id, "late completion ignored");
            return;
        };
        if entry.verifying != verified {
            tracing::debug!(transfer = %self.transfer, id, "unexpected completion ignored");
            self.in_flight.insert(id, entry);
            return;
        }
        self.work.in_flight = self.in_flight.len();
        let mut item = entry.item;

        if !self.work.current(&item) {
            // The batch moved on while this item was out.
            self.work.canceled(&item);
            tracing::debug!(
                transfer = %self.transfer,
                segment = item.segment,
                position = item.position,
                "completion for a finished batch ignored"
            );
            return;
        }

        let result = match result {
            Err(FailureReason::KeyCollision(key)) if item.op == BlockOp::Insert => {
                tracing::debug!(transfer = %self.transfer, %key, "insert collided, content already present");
                Ok(BlockOutcome::Inserted(key))
            }
            other => other,
        };

        match result {
            Ok(outcome) => {
                if !verified {
                    if let Some(verifier) = self.policy.chain(&item, &outcome) {
                        let tx = self.tx.clone();
                        self.in_flight.insert(
                            id,
                            InFlight {
                                item,
                                handle: None,
                                verifying: true,
                            },
                        );
                        self.work.in_flight = self.in_flight.len();
                        thread::spawn(move || {
                            let result = verifier(outcome);
                            let _ = tx.send(EngineEvent::Verified { id, result });
                        });
                        return;
                    }
                }
                self.succeeded(item, outcome);
            }
            Err(reason) => {
                let retries = self.work.retries_for(&item, self.free_retries);
                if reason.is_retryable() && item.retry_count < retries {
                    item.retry_count += 1;
                    item.last_failure = None;
                    self.events.emit(ProgressEvent::BlockRequeued {
                        transfer: self.transfer,
                        op: item.op,
                        segment: item.segment,
                        kind: item.kind,
                        position: item.position,
                        retry_count: item.retry_count,
                        reason: reason.clone(),
                    });
                    tracing::debug!(
                        transfer = %self.transfer,
                        segment = item.segment,
                        kind = ?item.kind,
                        position = item.position,
                        retry = item.retry_count,
                        %reason,
                        "retrying block"
                    );
                    self.work.queue.push_back(item);
                } else {
                    item.last_failure = Some(reason.clone());
                    self.failed(item, reason);
                }
            }
        }
    }

    fn succeeded(&mut self, item: BlockWorkItem, outcome: BlockOutcome) {
        self.events.emit(ProgressEvent::BlockFinished {
            transfer: self.transfer,
            op: item.op,
            segment: item.segment,
            kind: item.kind,
            position: item.position,
            result: BlockResult::Succeeded,
        });
        if let Some(batch) = self.work.batch.as_mut() {
            if batch.id == item.batch {
                batch.info.successes += 1;
                batch.outstanding = batch.outstanding.saturating_sub(1);
            }
        }
        if let Err(err) = self.policy.on_success(item, outcome) {
            self.fail(err);
        }
    }

    fn failed(&mut self, item: BlockWorkItem, reason: FailureReason) {
        self.events.emit(ProgressEvent::BlockFinished {
            transfer: self.transfer,
            op: item.op,
            segment: item.segment,
            kind: item.kind,
            position: item.position,
            result: BlockResult::Failed(reason.clone()),
        });
        tracing::debug!(
            transfer = %self.transfer,
            segment = item.segment,
            kind = ?item.kind,
            position = item.position,
            %reason,
            "block failed"
        );
        self.policy.on_failure(&item, &reason);

        if let FailureReason::KeyMismatch { .. } = reason {
            self.fail(TransferError::Integrity {
                segment: item.segment,
                kind: item.kind,
                position: item.position,
                reason,
            });
            return;
        }

        let exceeded = match self.work.batch.as_mut() {
            Some(batch) if batch.id == item.batch => {
                batch.info.failures += 1;
                batch.outstanding = batch.outstanding.saturating_sub(1);
                (batch.info.failures > batch.info.failures_allowed).then(|| {
                    TransferError::TooManyFailures {
                        phase: format!("{:?}", batch.info.working),
                        failures: batch.info.failures,
                        allowed: batch.info.failures_allowed,
                        last: reason.clone(),
                    }
                })
            }
            _ => None,
        };
        drop(item);
        if let Some(err) = exceeded {
            self.fail(err);
        }
    }

    fn complete_batch(&mut self) {
        let Some(batch) = self.work.batch.take() else {
            return;
        };
        let (leftover, kept): (VecDeque<BlockWorkItem>, VecDeque<BlockWorkItem>) =
            std::mem::take(&mut self.work.queue)
                .into_iter()
                .partition(|item| item.batch == batch.id);
        self.work.queue = kept;
        for item in &leftover {
            self.work.canceled(item);
        }
        let dropped = leftover.len();
        drop(leftover);

        let stale: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.item.batch == batch.id)
            .map(|(id, _)| *id)
            .collect();
        let mut handles = Vec::with_capacity(stale.len());
        for id in &stale {
            if let Some(entry) = self.in_flight.remove(id) {
                self.work.canceled(&entry.item);
                if let Some(handle) = entry.handle {
                    handles.push(handle);
                }
            }
        }
        self.work.in_flight = self.in_flight.len();
        tracing::debug!(
            transfer = %self.transfer,
            phase = ?batch.info.working,
            successes = batch.info.successes,
            failures = batch.info.failures,
            dropped,
            cancelled = stale.len(),
            "batch complete"
        );
        for handle in handles {
            handle.cancel();
        }
        self.policy.set_state(batch.info.target);
        self.settle();
    }

    fn fail(&mut self, err: TransferError) {
        let state = self.policy.state();
        if state.is_terminal() || state == P::State::FAILING || state == P::State::CANCELING {
            tracing::debug!(transfer = %self.transfer, error = %err, "error after pipeline stopped");
            return;
        }
        tracing::warn!(transfer = %self.transfer, phase = ?state, error = %err, "pipeline failing");
        self.policy.set_state(P::State::FAILING);
        self.failure = Some(err);
        self.cancel_all();
        self.work.batch = None;
        self.policy.set_state(P::State::FAILED);
        self.settle();
    }

    fn cancel(&mut self) {
        let state = self.policy.state();
        if state.is_terminal() || state == P::State::FAILING || state == P::State::CANCELING {
            return;
        }
        tracing::info!(transfer = %self.transfer, phase = ?state, "cancelling pipeline");
        self.policy.set_state(P::State::CANCELING);
        self.cancel_all();
        self.work.batch = None;
        self.policy.set_state(P::State::CANCELED);
        self.settle();
    }

    /// Post the terminal event once the pipeline reaches a terminal state.
    fn settle(&mut self) {
        let state = self.policy.state();
        let Some(terminal) = state.terminal() else {
            return;
        };
        if self.posted {
            return;
        }
        self.posted = true;
        if terminal == TerminalState::Done {
            self.cancel_all();
        }
        self.policy.on_terminal(state);
        let cause = self.failure.as_ref().map(ToString::to_string);
        match terminal {
            TerminalState::Done => tracing::info!(transfer = %self.transfer, "pipeline done"),
            TerminalState::Canceled => tracing::info!(transfer = %self.transfer, "pipeline canceled"),
            TerminalState::Failed => {
                tracing::warn!(transfer = %self.transfer, cause = cause.as_deref().unwrap_or(""), "pipeline failed")
            }
        }
        self.events.emit(ProgressEvent::Finished {
            transfer: self.transfer,
            state: terminal,
            message: self.policy.message(),
            cause,
        });
    }
}

/// Leaf request for a work item: fetches need a key, inserts need a buffer.
fn request_for(item: &BlockWorkItem) -> Option<BlockRequest> {
    let htl = item.effective_htl();
    match (item.op, item.target) {
        (BlockOp::Fetch, BlockTarget::Key(key)) => Some(BlockRequest::Fetch { key, htl }),
        (BlockOp::Insert, _) => item.bucket().map(|bucket| BlockRequest::Insert {
            data: bucket.bytes(),
            htl,
        }),
        (BlockOp::Fetch, BlockTarget::ComputeOnInsert) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockKind;
    use crate::bucket::BucketFactory;
    use crate::key::BlockKey;
    use crate::memory::MemoryNetwork;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TestState {
        Start,
        Working,
        Worked,
        Done,
        Failing,
        Failed,
        Canceling,
        Canceled,
    }

    impl PipelineState for TestState {
        const FAILING: Self = TestState::Failing;
        const FAILED: Self = TestState::Failed;
        const CANCELING: Self = TestState::Canceling;
        const CANCELED: Self = TestState::Canceled;
        const DONE: Self = TestState::Done;
    }

    struct TestPolicy {
        state: TestState,
        items: Vec<BlockWorkItem>,
        required: usize,
        allowed: usize,
        retries: u32,
        succeeded: Vec<(usize, u32)>,
        failed: Vec<usize>,
        kept: Vec<crate::bucket::Bucket>,
        terminal: Vec<TestState>,
        /// Queued ahead of `items` once the batch opens.
        urgent: Vec<BlockWorkItem>,
        /// Positions whose success goes through a slow verifier.
        slow_verify: Vec<usize>,
    }

    impl TestPolicy {
        fn new(items: Vec<BlockWorkItem>, required: usize, allowed: usize, retries: u32) -> Self {
            Self {
                state: TestState::Start,
                items,
                required,
                allowed,
                retries,
                succeeded: Vec::new(),
                failed: Vec::new(),
                kept: Vec::new(),
                terminal: Vec::new(),
                urgent: Vec::new(),
                slow_verify: Vec::new(),
            }
        }
    }

    impl RetryPolicy for TestPolicy {
        type State = TestState;

        fn state(&self) -> TestState {
            self.state
        }

        fn set_state(&mut self, state: TestState) {
            self.state = state;
        }

        fn advance(&mut self, work: &mut WorkQueue<TestState>) -> Result<Step, TransferError> {
            match self.state {
                TestState::Start => {
                    work.begin(RetryableInfo::new(
                        TestState::Working,
                        TestState::Worked,
                        self.required,
                        self.allowed,
                        self.retries,
                    ));
                    for item in self.items.drain(..) {
                        work.queue_request(item);
                    }
                    for item in self.urgent.drain(..) {
                        work.priority_queue_request(item);
                    }
                }
                TestState::Worked => self.state = TestState::Done,
                _ => {}
            }
            Ok(Step::Continue)
        }

        fn on_success(
            &mut self,
            mut item: BlockWorkItem,
            _outcome: BlockOutcome,
        ) -> Result<(), TransferError> {
            self.succeeded.push((item.position, item.retry_count));
            if let Some(bucket) = item.take_bucket() {
                self.kept.push(bucket);
            }
            Ok(())
        }

        fn on_failure(&mut self, item: &BlockWorkItem, _reason: &FailureReason) {
            self.failed.push(item.position);
        }

        fn chain(&mut self, item: &BlockWorkItem, _outcome: &BlockOutcome) -> Option<Verifier> {
            if !self.slow_verify.contains(&item.position) {
                return None;
            }
            Some(Box::new(|outcome: BlockOutcome| {
                thread::sleep(Duration::from_millis(300));
                Ok(outcome)
            }))
        }

        fn on_terminal(&mut self, state: TestState) {
            self.terminal.push(state);
            self.kept.clear();
        }
    }

    fn inserts(factory: &BucketFactory, n: usize) -> Vec<BlockWorkItem> {
        (0..n)
            .map(|i| {
                BlockWorkItem::insert(factory.make(vec![i as u8; 64]), 0, BlockKind::Data, i, 10)
            })
            .collect()
    }

    #[test]
    fn retries_then_succeeds() {
        let net = MemoryNetwork::new();
        let factory = BucketFactory::new();
        let items = inserts(&factory, 3);
        let key = BlockKey::for_content(&[1u8; 64]);
        net.fail_next(
            key,
            vec![FailureReason::RouteNotFound, FailureReason::RouteNotFound],
        );
        let (sink, rx) = EventSink::channel();
        let mut engine =
            RetryEngine::new(TestPolicy::new(items, 3, 0, 3), 2, Uuid::new_v4(), sink);
        engine.execute(&net).unwrap();
        assert_eq!(engine.state(), TestState::Done);

        let mut succeeded = engine.policy().succeeded.clone();
        succeeded.sort();
        assert_eq!(succeeded, vec![(0, 0), (1, 2), (2, 0)]);
        assert_eq!(net.started_for(&key), 3);

        let events: Vec<_> = rx.try_iter().collect();
        let requeued = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::BlockRequeued { position: 1, .. }))
            .count();
        assert_eq!(requeued, 2);
        let finished = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Finished { .. }))
            .count();
        assert_eq!(finished, 1);
        drop(engine);
        assert_eq!(factory.live(), 0);
    }

    #[test]
    fn exhausted_block_fails_pipeline() {
        let net = MemoryNetwork::new();
        net.set_latency(Duration::from_millis(20));
        let factory = BucketFactory::new();
        let items = inserts(&factory, 6);
        let key = BlockKey::for_content(&[0u8; 64]);
        net.fail_next(key, vec![FailureReason::RouteNotFound; 3]);
        let mut engine = RetryEngine::new(
            TestPolicy::new(items, 6, 0, 2),
            2,
            Uuid::new_v4(),
            EventSink::none(),
        );
        let err = engine.execute(&net).unwrap_err();
        assert!(matches!(
            err,
            TransferError::TooManyFailures {
                failures: 1,
                allowed: 0,
                last: FailureReason::RouteNotFound,
                ..
            }
        ));
        assert_eq!(engine.state(), TestState::Failed);
        assert_eq!(engine.policy().failed, vec![0]);
        assert_eq!(engine.policy().terminal, vec![TestState::Failed]);
        drop(engine);
        assert_eq!(factory.live(), 0);
    }

    #[test]
    fn cancel_drops_queue_and_cancels_in_flight() {
        let net = MemoryNetwork::new();
        net.hold(true);
        let factory = BucketFactory::new();
        let items = inserts(&factory, 25);
        let (sink, rx) = EventSink::channel();
        let mut engine =
            RetryEngine::new(TestPolicy::new(items, 25, 0, 3), 5, Uuid::new_v4(), sink);
        let cancel = engine.cancel_handle();

        let watcher = {
            let net = net.clone();
            thread::spawn(move || {
                while net.active() < 5 {
                    thread::sleep(Duration::from_millis(5));
                }
                cancel.cancel();
            })
        };
        let err = engine.execute(&net).unwrap_err();
        watcher.join().unwrap();

        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(engine.state(), TestState::Canceled);
        assert_eq!(engine.peak_in_flight(), 5);
        assert_eq!(net.stats().started, 5);
        assert_eq!(factory.live(), 0);

        let events: Vec<_> = rx.try_iter().collect();
        let finished: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Finished { state, .. } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(finished, vec![TerminalState::Canceled]);
        let canceled = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    ProgressEvent::BlockFinished {
                        result: BlockResult::Canceled,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(canceled, 25);

        // Every in-flight request saw the cancel.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while net.stats().cancelled < 5 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(net.stats().cancelled, 5);
    }

    #[test]
    fn cancel_before_execute() {
        let net = MemoryNetwork::new();
        let factory = BucketFactory::new();
        let mut engine = RetryEngine::new(
            TestPolicy::new(inserts(&factory, 2), 2, 0, 0),
            1,
            Uuid::new_v4(),
            EventSink::none(),
        );
        engine.cancel_handle().cancel();
        assert!(matches!(engine.execute(&net), Err(TransferError::Cancelled)));
        assert_eq!(net.stats().started, 0);
    }

    #[test]
    fn concurrency_never_exceeds_max_threads() {
        let net = MemoryNetwork::new();
        net.set_latency(Duration::from_millis(5));
        let factory = BucketFactory::new();
        let mut engine = RetryEngine::new(
            TestPolicy::new(inserts(&factory, 20), 20, 0, 0),
            3,
            Uuid::new_v4(),
            EventSink::none(),
        );
        engine.execute(&net).unwrap();
        assert!(engine.peak_in_flight() <= 3);
        assert!(net.stats().peak_active <= 3);
        assert_eq!(net.stats().inserts, 20);
    }

    #[test]
    fn satisfied_batch_starts_nothing_more() {
        let net = MemoryNetwork::new();
        let factory = BucketFactory::new();
        let mut engine = RetryEngine::new(
            TestPolicy::new(inserts(&factory, 8), 5, 3, 0),
            1,
            Uuid::new_v4(),
            EventSink::none(),
        );
        engine.execute(&net).unwrap();
        assert_eq!(net.stats().started, 5);
        assert_eq!(engine.policy().succeeded.len(), 5);
        drop(engine);
        assert_eq!(factory.live(), 0);
    }

    #[test]
    fn collision_counts_as_success() {
        let net = MemoryNetwork::new();
        let factory = BucketFactory::new();
        net.put(vec![0u8; 64]);
        let mut engine = RetryEngine::new(
            TestPolicy::new(inserts(&factory, 2), 2, 0, 0),
            1,
            Uuid::new_v4(),
            EventSink::none(),
        );
        engine.execute(&net).unwrap();
        assert_eq!(engine.policy().succeeded.len(), 2);
        assert!(engine.policy().failed.is_empty());
    }

    #[test]
    fn stalled_policy_fails() {
        struct Stuck(TestState);
        impl RetryPolicy for Stuck {
            type State = TestState;
            fn state(&self) -> TestState {
                self.0
            }
            fn set_state(&mut self, state: TestState) {
                self.0 = state;
            }
            fn advance(&mut self, _work: &mut WorkQueue<TestState>) -> Result<Step, TransferError> {
                Ok(Step::Continue)
            }
            fn on_success(
                &mut self,
                _item: BlockWorkItem,
                _outcome: BlockOutcome,
            ) -> Result<(), TransferError> {
                Ok(())
            }
        }
        let mut engine = RetryEngine::new(
            Stuck(TestState::Start),
            1,
            Uuid::new_v4(),
            EventSink::none(),
        );
        let err = engine.execute(&MemoryNetwork::new()).unwrap_err();
        assert!(matches!(err, TransferError::Stalled(_)));
        assert_eq!(engine.state(), TestState::Failed);
    }

    fn block_results(rx: &mpsc::Receiver<ProgressEvent>) -> Vec<(usize, BlockResult)> {
        let mut results: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                ProgressEvent::BlockFinished {
                    position, result, ..
                } => Some((position, result)),
                _ => None,
            })
            .collect();
        results.sort_by_key(|(position, _)| *position);
        results
    }

    #[test]
    fn unverified_items_of_satisfied_batch_report_canceled() {
        let net = MemoryNetwork::new();
        let factory = BucketFactory::new();
        let mut policy = TestPolicy::new(inserts(&factory, 3), 1, 2, 0);
        policy.slow_verify = vec![1, 2];
        let (sink, rx) = EventSink::channel();
        let mut engine = RetryEngine::new(policy, 3, Uuid::new_v4(), sink);
        engine.execute(&net).unwrap();

        assert_eq!(engine.policy().succeeded, vec![(0, 0)]);
        assert_eq!(
            block_results(&rx),
            vec![
                (0, BlockResult::Succeeded),
                (1, BlockResult::Canceled),
                (2, BlockResult::Canceled),
            ]
        );
        drop(engine);
        assert_eq!(factory.live(), 0);
    }

    #[test]
    fn leftover_queue_reports_canceled() {
        let net = MemoryNetwork::new();
        let factory = BucketFactory::new();
        let (sink, rx) = EventSink::channel();
        let mut engine = RetryEngine::new(
            TestPolicy::new(inserts(&factory, 4), 2, 2, 0),
            1,
            Uuid::new_v4(),
            sink,
        );
        engine.execute(&net).unwrap();
        assert_eq!(
            block_results(&rx),
            vec![
                (0, BlockResult::Succeeded),
                (1, BlockResult::Succeeded),
                (2, BlockResult::Canceled),
                (3, BlockResult::Canceled),
            ]
        );
    }

    #[test]
    fn priority_item_dispatches_first() {
        let net = MemoryNetwork::new();
        let factory = BucketFactory::new();
        let mut items = inserts(&factory, 3);
        let urgent = items.pop().into_iter().collect();
        let mut policy = TestPolicy::new(items, 3, 0, 0);
        policy.urgent = urgent;
        let (sink, rx) = EventSink::channel();
        let mut engine = RetryEngine::new(policy, 1, Uuid::new_v4(), sink);
        engine.execute(&net).unwrap();

        let started: Vec<usize> = rx
            .try_iter()
            .filter_map(|e| match e {
                ProgressEvent::BlockStarted { position, .. } => Some(position),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec![2, 0, 1]);
    }
}
