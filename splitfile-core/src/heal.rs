//! Healing: re-inserting blocks that could not be fetched, inline or through a background inserter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use rand::seq::SliceRandom;
use rand::Rng;
use uuid::Uuid;

use crate::block::{BlockOp, BlockWorkItem, FailureReason};
use crate::config::HealerConfig;
use crate::engine::{
    CancelHandle, PipelineState, RetryEngine, RetryPolicy, Step, WorkQueue, WorkSender,
};
use crate::error::TransferError;
use crate::events::EventSink;
use crate::transport::{BlockOutcome, BlockTransport};

/// Blocks to re-insert out of `missing`: none if nothing is missing, otherwise
/// `ceil(missing * percentage / 100)` but at least one and at most `missing`.
pub fn heal_count(missing: usize, percentage: u32) -> usize {
    if missing == 0 {
        return 0;
    }
    let scaled = (missing * percentage as usize + 99) / 100;
    scaled.max(1).min(missing)
}

/// Pick a random `heal_count` subset of `missing`, returned sorted.
pub fn select_heal_blocks<R: Rng + ?Sized>(
    missing: &[usize],
    percentage: u32,
    rng: &mut R,
) -> Vec<usize> {
    let mut picked = missing.to_vec();
    picked.shuffle(rng);
    picked.truncate(heal_count(missing.len(), percentage));
    picked.sort_unstable();
    picked
}

/// Accepts heal inserts and runs them without the caller waiting.
pub trait Healer: Send + Sync {
    fn queue(&self, item: BlockWorkItem);
}

/// Outcome counters of a background healer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealStats {
    pub queued: usize,
    pub inserted: usize,
    pub failed: usize,
    /// Dropped from the queue when it was over capacity.
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HealState {
    Running,
    Done,
    Failing,
    Failed,
    Canceling,
    Canceled,
}

impl PipelineState for HealState {
    const FAILING: Self = HealState::Failing;
    const FAILED: Self = HealState::Failed;
    const CANCELING: Self = HealState::Canceling;
    const CANCELED: Self = HealState::Canceled;
    const DONE: Self = HealState::Done;
}

struct HealPolicy {
    state: HealState,
    closing: Arc<AtomicBool>,
    stats: HealStats,
}

impl RetryPolicy for HealPolicy {
    type State = HealState;

    fn state(&self) -> HealState {
        self.state
    }

    fn set_state(&mut self, state: HealState) {
        self.state = state;
    }

    fn advance(&mut self, work: &mut WorkQueue<HealState>) -> Result<Step, TransferError> {
        if self.closing.load(Ordering::SeqCst) && work.is_empty() && work.in_flight() == 0 {
            self.state = HealState::Done;
            return Ok(Step::Continue);
        }
        Ok(Step::Idle)
    }

    fn on_success(
        &mut self,
        item: BlockWorkItem,
        outcome: BlockOutcome,
    ) -> Result<(), TransferError> {
        if let BlockOutcome::Inserted(key) = outcome {
            tracing::debug!(%key, segment = item.segment, position = item.position, "healed block");
        }
        self.stats.inserted += 1;
        Ok(())
    }

    fn on_failure(&mut self, item: &BlockWorkItem, reason: &FailureReason) {
        tracing::debug!(segment = item.segment, position = item.position, %reason, "heal insert failed");
        self.stats.failed += 1;
    }

    fn on_enqueue(&mut self, work: &mut WorkQueue<HealState>, item: BlockWorkItem, priority: bool) {
        if item.op != BlockOp::Insert {
            tracing::warn!(segment = item.segment, "healer only inserts, dropping fetch");
            return;
        }
        self.stats.queued += 1;
        if priority {
            work.priority_queue_request(item);
        } else {
            work.queue_request(item);
        }
        if let Some(cap) = work.cap() {
            self.stats.dropped += work.trim_queue(cap);
        }
    }
}

/// Fire-and-forget inserter running its own retry engine on a worker thread.
pub struct BackgroundHealer {
    sender: WorkSender,
    cancel: CancelHandle,
    closing: Arc<AtomicBool>,
    worker: Option<JoinHandle<HealStats>>,
}

impl BackgroundHealer {
    pub fn spawn(
        transport: Arc<dyn BlockTransport>,
        config: HealerConfig,
        events: EventSink,
    ) -> Self {
        let closing = Arc::new(AtomicBool::new(false));
        let policy = HealPolicy {
            state: HealState::Running,
            closing: closing.clone(),
            stats: HealStats::default(),
        };
        let mut engine = RetryEngine::new(policy, config.max_threads, Uuid::new_v4(), events)
            .with_queue_cap(config.max_queue)
            .with_free_retries(config.retries);
        let sender = engine.work_sender();
        let cancel = engine.cancel_handle();
        let worker = thread::spawn(move || {
            if let Err(err) = engine.execute(transport.as_ref()) {
                tracing::info!(error = %err, "background healer stopped");
            }
            engine.into_policy().stats
        });
        Self {
            sender,
            cancel,
            closing,
            worker: Some(worker),
        }
    }

    /// Finish queued heal inserts, then stop.
    pub fn shutdown(mut self) -> HealStats {
        self.closing.store(true, Ordering::SeqCst);
        self.sender.wake();
        self.join()
    }

    /// Drop queued heal inserts, cancel running ones, then stop.
    pub fn abort(mut self) -> HealStats {
        self.cancel.cancel();
        self.join()
    }

    fn join(&mut self) -> HealStats {
        match self.worker.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                tracing::error!("background healer panicked");
                HealStats::default()
            }
            None => HealStats::default(),
        }
    }
}

impl Healer for BackgroundHealer {
    fn queue(&self, item: BlockWorkItem) {
        if !self.sender.queue(item) {
            tracing::debug!("background healer gone, heal insert dropped");
        }
    }
}

impl Drop for BackgroundHealer {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.closing.store(true, Ordering::SeqCst);
            self.sender.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockKind;
    use crate::bucket::BucketFactory;
    use crate::key::BlockKey;
    use crate::memory::MemoryNetwork;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;

    #[test]
    fn heal_count_bounds() {
        assert_eq!(heal_count(0, 100), 0);
        assert_eq!(heal_count(3, 100), 3);
        assert_eq!(heal_count(3, 0), 1);
        assert_eq!(heal_count(3, 50), 2);
        assert_eq!(heal_count(10, 25), 3);
        assert_eq!(heal_count(4, 300), 4);
    }

    #[test]
    fn selection_is_sorted_subset() {
        let mut rng = StdRng::seed_from_u64(7);
        let missing = [2, 5, 11, 12, 13];
        let picked = select_heal_blocks(&missing, 50, &mut rng);
        assert_eq!(picked.len(), 3);
        assert!(picked.windows(2).all(|w| w[0] < w[1]));
        assert!(picked.iter().all(|p| missing.contains(p)));
        assert!(select_heal_blocks(&[], 100, &mut rng).is_empty());
    }

    #[test]
    fn background_healer_inserts_and_drains() {
        let net = MemoryNetwork::new();
        net.set_latency(Duration::from_millis(2));
        let factory = BucketFactory::new();
        // Already present: a collision still counts as healed.
        net.put(vec![0u8; 64]);
        let healer = BackgroundHealer::spawn(
            Arc::new(net.clone()),
            HealerConfig::default(),
            EventSink::none(),
        );
        for i in 0..6u8 {
            healer.queue(BlockWorkItem::insert(
                factory.make(vec![i; 64]),
                0,
                BlockKind::Check,
                i as usize,
                5,
            ));
        }
        let stats = healer.shutdown();
        assert_eq!(stats.queued, 6);
        assert_eq!(stats.inserted, 6);
        assert_eq!(stats.failed, 0);
        assert!(net.contains(&BlockKey::for_content(&[5u8; 64])));
        assert_eq!(factory.live(), 0);
    }

    #[test]
    fn queue_cap_drops_oldest() {
        let net = MemoryNetwork::new();
        net.hold(true);
        let factory = BucketFactory::new();
        let healer = BackgroundHealer::spawn(
            Arc::new(net.clone()),
            HealerConfig {
                max_threads: 1,
                retries: 0,
                max_queue: 2,
            },
            EventSink::none(),
        );
        let item = |i: u8| {
            BlockWorkItem::insert(factory.make(vec![i; 64]), 0, BlockKind::Data, i as usize, 5)
        };
        healer.queue(item(0));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while net.active() < 1 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        for i in 1..6u8 {
            healer.queue(item(i));
        }
        let stats = healer.abort();
        assert_eq!(stats.queued, 6);
        // One running, two kept, the rest trimmed.
        assert_eq!(stats.dropped + 3, 6);
        assert_eq!(stats.inserted, 0);
        assert_eq!(factory.live(), 0);
    }
}
