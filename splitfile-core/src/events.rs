//! Progress events reported to the caller. Observational only.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::block::{BlockKind, BlockOp, FailureReason};
use crate::segment::SegmentHeader;

/// How a pipeline ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Done,
    Failed,
    Canceled,
}

/// Result of one block work item as reported in `BlockFinished`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockResult {
    Succeeded,
    Failed(FailureReason),
    /// Dropped without an outcome: batch satisfied, pipeline stopping, or queue over capacity.
    Canceled,
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    SplitFileStarted {
        transfer: Uuid,
        op: BlockOp,
        headers: Vec<SegmentHeader>,
    },
    SegmentStarted {
        transfer: Uuid,
        op: BlockOp,
        segment: usize,
    },
    SegmentFinished {
        transfer: Uuid,
        op: BlockOp,
        segment: usize,
    },
    SegmentEncoding {
        transfer: Uuid,
        segment: usize,
        check_blocks: usize,
    },
    SegmentDecoding {
        transfer: Uuid,
        segment: usize,
        requested: usize,
    },
    BlockQueued {
        transfer: Uuid,
        op: BlockOp,
        segment: usize,
        kind: BlockKind,
        position: usize,
    },
    BlockStarted {
        transfer: Uuid,
        op: BlockOp,
        segment: usize,
        kind: BlockKind,
        position: usize,
        htl: u32,
    },
    BlockRequeued {
        transfer: Uuid,
        op: BlockOp,
        segment: usize,
        kind: BlockKind,
        position: usize,
        retry_count: u32,
        reason: FailureReason,
    },
    BlockFinished {
        transfer: Uuid,
        op: BlockOp,
        segment: usize,
        kind: BlockKind,
        position: usize,
        result: BlockResult,
    },
    HealingStarted {
        transfer: Uuid,
        segment: usize,
        blocks: usize,
    },
    ChecksumVerifying {
        transfer: Uuid,
    },
    /// Posted exactly once per pipeline.
    Finished {
        transfer: Uuid,
        state: TerminalState,
        message: Option<String>,
        cause: Option<String>,
    },
}

type Callback = dyn Fn(ProgressEvent) + Send + Sync;

/// Destination for progress events. Cloning shares the destination.
#[derive(Clone, Default)]
pub struct EventSink {
    callback: Option<Arc<Callback>>,
}

impl EventSink {
    pub fn new(callback: impl Fn(ProgressEvent) + Send + Sync + 'static) -> Self {
        Self {
            callback: Some(Arc::new(callback)),
        }
    }

    /// Discard all events.
    pub fn none() -> Self {
        Self::default()
    }

    /// Sink feeding a channel; the receiver sees events in emission order.
    pub fn channel() -> (Self, Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel();
        let tx: Mutex<Sender<ProgressEvent>> = Mutex::new(tx);
        let sink = Self::new(move |event| {
            if let Ok(tx) = tx.lock() {
                let _ = tx.send(event);
            }
        });
        (sink, rx)
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(callback) = &self.callback {
            callback(event);
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("attached", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_preserves_order() {
        let (sink, rx) = EventSink::channel();
        let transfer = Uuid::new_v4();
        sink.emit(ProgressEvent::ChecksumVerifying { transfer });
        sink.clone().emit(ProgressEvent::Finished {
            transfer,
            state: TerminalState::Done,
            message: None,
            cause: None,
        });
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ProgressEvent::ChecksumVerifying { .. }));
        assert!(matches!(
            events[1],
            ProgressEvent::Finished {
                state: TerminalState::Done,
                ..
            }
        ));
    }

    #[test]
    fn none_sink_discards() {
        EventSink::none().emit(ProgressEvent::ChecksumVerifying {
            transfer: Uuid::nil(),
        });
    }
}
