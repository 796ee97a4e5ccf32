//! Shards: one bounded queue and one dedicated worker thread each
//!
//! Producers push with a non-blocking `try_send`; the worker is the only
//! consumer and blocks only while its queue is empty. A shard moves
//! `Running -> Draining -> Stopped` and never back.
//!
//! Replay requests arrive on a separate unbounded channel so they are never
//! shed. The worker runs every pending request before its next tick.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, select, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::backpressure::BackpressureController;
use crate::error::EngineError;
use crate::metrics::FanoutMetrics;
use crate::worker::{QueuedTick, ReplayRequest, TickProcessor};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Stable shard index for a symbol (FNV-1a, independent of process and run).
pub fn shard_index(symbol: &str, shard_count: usize) -> usize {
    let hash = symbol
        .bytes()
        .fold(FNV_OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME));
    (hash % shard_count.max(1) as u64) as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ShardState {
    Running = 0,
    /// Finishing already-queued ticks; no new ticks are admitted.
    Draining = 1,
    Stopped = 2,
}

impl ShardState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// State shared between a shard's worker and the engine.
pub struct ShardStatus {
    index: usize,
    state: AtomicU8,
    failed: AtomicBool,
    processed: AtomicU64,
    symbol_count: AtomicUsize,
    backpressure: BackpressureController,
}

impl ShardStatus {
    pub fn new(index: usize, backpressure: BackpressureController) -> Self {
        Self {
            index,
            state: AtomicU8::new(ShardState::Running as u8),
            failed: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            symbol_count: AtomicUsize::new(0),
            backpressure,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> ShardState {
        ShardState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance the state; a shard never moves backwards.
    pub fn advance(&self, next: ShardState) {
        self.state.fetch_max(next as u8, Ordering::AcqRel);
    }

    /// The worker stopped because of an unexpected panic.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Symbols with running state in this shard.
    pub fn symbol_count(&self) -> usize {
        self.symbol_count.load(Ordering::Relaxed)
    }

    pub fn backpressure(&self) -> &BackpressureController {
        &self.backpressure
    }
}

/// Sends the shard index on `done` when dropped, including on unwind.
struct DoneGuard {
    index: usize,
    status: Arc<ShardStatus>,
    done: Sender<usize>,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.status.advance(ShardState::Stopped);
        // The engine may have stopped listening after a shutdown timeout.
        let _ = self.done.send(self.index);
    }
}

struct ShardWorker {
    status: Arc<ShardStatus>,
    queue: Receiver<QueuedTick>,
    replays: Receiver<ReplayRequest>,
    processor: TickProcessor,
    cancel: watch::Receiver<bool>,
    idle_poll: Duration,
    metrics: Arc<FanoutMetrics>,
}

enum Wake {
    Tick(QueuedTick),
    Replay(ReplayRequest),
    Idle,
    Closed,
}

impl ShardWorker {
    fn run(mut self) {
        let index = self.status.index();
        debug!(shard = index, "Shard worker started");

        loop {
            if *self.cancel.borrow() {
                debug!(shard = index, "Shard worker cancelled");
                break;
            }

            let wake = match self.status.state() {
                ShardState::Running => select! {
                    recv(self.replays) -> request => request.map_or(Wake::Closed, Wake::Replay),
                    recv(self.queue) -> queued => queued.map_or(Wake::Closed, Wake::Tick),
                    default(self.idle_poll) => Wake::Idle,
                },
                ShardState::Draining => match self.queue.try_recv() {
                    Ok(queued) => Wake::Tick(queued),
                    Err(_) => break,
                },
                ShardState::Stopped => break,
            };

            let queued = match wake {
                Wake::Tick(queued) => queued,
                Wake::Replay(request) => {
                    if !self.replay(request) {
                        break;
                    }
                    continue;
                }
                Wake::Idle => continue,
                Wake::Closed => break,
            };

            // A request sent before this tick was queued must run first.
            if !self.drain_replays() {
                break;
            }

            let processor = &mut self.processor;
            match catch_unwind(AssertUnwindSafe(|| processor.process(queued))) {
                Ok(_) => {
                    self.status.processed.fetch_add(1, Ordering::Relaxed);
                    self.status
                        .symbol_count
                        .store(self.processor.symbol_count(), Ordering::Relaxed);
                }
                Err(payload) => {
                    self.fail(payload.as_ref());
                    break;
                }
            }
        }

        info!(
            shard = index,
            processed = self.status.processed(),
            remaining = self.queue.len(),
            failed = self.status.is_failed(),
            "Shard worker stopped"
        );
    }

    /// Run every pending replay request. Returns false if the shard failed.
    fn drain_replays(&mut self) -> bool {
        while let Ok(request) = self.replays.try_recv() {
            if !self.replay(request) {
                return false;
            }
        }
        true
    }

    fn replay(&mut self, request: ReplayRequest) -> bool {
        let processor = &mut self.processor;
        match catch_unwind(AssertUnwindSafe(|| processor.replay(&request))) {
            Ok(replayed) => {
                debug!(
                    shard = self.status.index(),
                    requested = request.pairs.len(),
                    replayed,
                    "Replay request handled"
                );
                true
            }
            Err(payload) => {
                self.fail(payload.as_ref());
                false
            }
        }
    }

    fn fail(&self, payload: &(dyn std::any::Any + Send)) {
        self.status.failed.store(true, Ordering::Release);
        self.metrics.record_shard_failure();
        error!(
            shard = self.status.index(),
            panic = panic_message(payload),
            queued = self.queue.len(),
            "Shard worker failed, shard stopped consuming"
        );
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// A running shard as seen by the engine.
pub struct Shard {
    status: Arc<ShardStatus>,
    sender: Sender<QueuedTick>,
    replays: Sender<ReplayRequest>,
    /// Keeps the queue connected after the worker exits so leftovers stay countable.
    backlog: Receiver<QueuedTick>,
    capacity: usize,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Shard {
    /// Create the shard queue and start its worker thread.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        index: usize,
        capacity: usize,
        backpressure: BackpressureController,
        processor: TickProcessor,
        cancel: watch::Receiver<bool>,
        idle_poll: Duration,
        metrics: Arc<FanoutMetrics>,
        done: Sender<usize>,
    ) -> Result<Self, EngineError> {
        let (sender, queue) = channel::bounded(capacity);
        let (replays, replay_rx) = channel::unbounded();
        let status = Arc::new(ShardStatus::new(index, backpressure));

        let worker = ShardWorker {
            status: status.clone(),
            queue: queue.clone(),
            replays: replay_rx,
            processor,
            cancel,
            idle_poll,
            metrics,
        };
        let guard = DoneGuard {
            index,
            status: status.clone(),
            done,
        };

        let handle = thread::Builder::new()
            .name(format!("tick-shard-{index}"))
            .spawn(move || {
                let _guard = guard;
                worker.run();
            })
            .map_err(|source| EngineError::WorkerSpawn {
                shard: index,
                source,
            })?;

        Ok(Self {
            status,
            sender,
            replays,
            backlog: queue,
            capacity,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn index(&self) -> usize {
        self.status.index()
    }

    pub fn status(&self) -> &Arc<ShardStatus> {
        &self.status
    }

    pub fn queue_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Non-blocking enqueue. Returns false when the queue is full.
    pub fn try_enqueue(&self, queued: QueuedTick) -> bool {
        self.sender.try_send(queued).is_ok()
    }

    /// Ask the worker to replay cached ticks to newly attached subscribers.
    /// Hands the request back when the worker has already exited.
    pub fn request_replay(&self, request: ReplayRequest) -> Result<(), ReplayRequest> {
        self.replays
            .send(request)
            .map_err(|rejected| rejected.into_inner())
    }

    /// Stop taking new ticks and finish the queued ones.
    pub fn begin_drain(&self) {
        self.status.advance(ShardState::Draining);
    }

    /// Join the worker thread if it has finished. Returns whether it was joined.
    pub(crate) fn join_if_finished(&self) -> bool {
        let mut slot = match self.handle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match slot.as_ref() {
            Some(handle) if handle.is_finished() => {}
            Some(_) => return false,
            None => return true,
        }
        if let Some(handle) = slot.take() {
            if handle.join().is_err() {
                error!(shard = self.index(), "Shard worker thread panicked outside processing");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::SymbolPolicy;
    use crate::cache::LastValueCache;
    use crate::callback::{PriceUpdate, SubscriberHandle};
    use crate::config::BackpressureThresholds;
    use crate::registry::{AlwaysResolved, SubscriptionRegistry, SubscriptionSet};
    use crate::shutdown::ShutdownSignal;
    use crate::worker::{AlwaysOpen, SessionCalendar};
    use tokio::sync::broadcast;
    use types::ids::{SubscriberId, Symbol};
    use types::tick::TickRecord;

    fn registry() -> Arc<SubscriptionRegistry> {
        Arc::new(SubscriptionRegistry::new(
            Arc::new(AlwaysResolved),
            Duration::from_secs(30),
        ))
    }

    fn spawn_shard(
        capacity: usize,
        registry: Arc<SubscriptionRegistry>,
        sessions: Arc<dyn SessionCalendar>,
        signal: &ShutdownSignal,
    ) -> (Shard, Arc<FanoutMetrics>, Receiver<usize>) {
        let metrics = Arc::new(FanoutMetrics::default());
        let (observers, _) = broadcast::channel(8);
        let processor = TickProcessor::new(
            0,
            registry,
            Arc::new(LastValueCache::new(100, 90)),
            metrics.clone(),
            sessions,
            observers,
        );
        let backpressure = BackpressureController::new(
            0,
            capacity,
            BackpressureThresholds::default(),
            3,
            SymbolPolicy::default(),
        );
        let (done_tx, done_rx) = channel::unbounded();
        let shard = Shard::spawn(
            0,
            capacity,
            backpressure,
            processor,
            signal.subscribe(),
            Duration::from_millis(10),
            metrics.clone(),
            done_tx,
        )
        .unwrap();
        (shard, metrics, done_rx)
    }

    fn queued(symbol: &str, price: f64, last_qty: i64, volume: i64) -> QueuedTick {
        QueuedTick::new(TickRecord::new(symbol, price, last_qty, volume))
    }

    #[test]
    fn test_shard_index_is_stable() {
        let first = shard_index("RELIANCE", 4);
        for _ in 0..100 {
            assert_eq!(shard_index("RELIANCE", 4), first);
        }
        assert!(first < 4);
        assert_eq!(shard_index("ANYTHING", 1), 0);
    }

    #[test]
    fn test_shard_index_known_value() {
        // FNV-1a("a") = 0xaf63dc4c8601ec8c
        assert_eq!(shard_index("a", 1 << 16), 0xec8c);
    }

    #[test]
    fn test_state_never_moves_backwards() {
        let status = ShardStatus::new(
            0,
            BackpressureController::new(
                0,
                10,
                BackpressureThresholds::default(),
                3,
                SymbolPolicy::default(),
            ),
        );
        status.advance(ShardState::Draining);
        status.advance(ShardState::Running);
        assert_eq!(status.state(), ShardState::Draining);
        status.advance(ShardState::Stopped);
        assert_eq!(status.state(), ShardState::Stopped);
    }

    #[test]
    fn test_drain_processes_queued_ticks() {
        let signal = ShutdownSignal::new();
        let (shard, metrics, done) = spawn_shard(100, registry(), Arc::new(AlwaysOpen), &signal);

        for i in 0..50 {
            assert!(shard.try_enqueue(queued("RELIANCE", 100.0 + i as f64, 1, i + 1)));
        }
        shard.begin_drain();

        assert_eq!(done.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
        assert!(shard.join_if_finished());
        assert_eq!(shard.status().state(), ShardState::Stopped);
        assert_eq!(shard.status().processed(), 50);
        assert_eq!(metrics.ticks_processed.load(Ordering::Relaxed), 50);
        assert_eq!(shard.queue_len(), 0);
    }

    #[test]
    fn test_full_queue_rejects_without_blocking() {
        let signal = ShutdownSignal::new();
        // Cancelled up front so the worker consumes nothing.
        signal.cancel();
        let (shard, _metrics, done) = spawn_shard(2, registry(), Arc::new(AlwaysOpen), &signal);
        done.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(shard.try_enqueue(queued("RELIANCE", 1.0, 1, 1)));
        assert!(shard.try_enqueue(queued("RELIANCE", 1.0, 1, 2)));
        assert!(!shard.try_enqueue(queued("RELIANCE", 1.0, 1, 3)));
        assert_eq!(shard.queue_len(), 2);
    }

    #[test]
    fn test_panic_in_processing_fails_shard() {
        let signal = ShutdownSignal::new();
        let registry = registry();
        let mut set = SubscriptionSet::new();
        set.register_callback(
            "BOOM",
            SubscriberHandle::new(SubscriberId::new()),
            Arc::new(|_: &PriceUpdate| {}),
        );
        registry.update(&set);

        let sessions: Arc<dyn SessionCalendar> = Arc::new(|symbol: &Symbol| {
            if symbol.as_str() == "BOOM" {
                panic!("calendar lookup failed");
            }
            true
        });
        let (shard, metrics, done) = spawn_shard(100, registry, sessions, &signal);

        // No traded volume, so the session calendar decides and panics.
        assert!(shard.try_enqueue(queued("BOOM", 1.0, 0, 0)));
        assert!(shard.try_enqueue(queued("BOOM", 1.0, 0, 0)));
        done.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(shard.status().is_failed());
        assert_eq!(shard.status().state(), ShardState::Stopped);
        assert_eq!(shard.status().processed(), 0);
        assert_eq!(metrics.shard_failures.load(Ordering::Relaxed), 1);
        // The tick behind the failing one is never consumed.
        assert_eq!(shard.queue_len(), 1);
    }

    #[test]
    fn test_replay_request_rejected_after_worker_exit() {
        let signal = ShutdownSignal::new();
        signal.cancel();
        let (shard, _metrics, done) = spawn_shard(4, registry(), Arc::new(AlwaysOpen), &signal);
        done.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(shard.join_if_finished());

        let request = ReplayRequest {
            pairs: vec![(Symbol::new("NIFTY"), SubscriberId::new())],
        };
        assert_eq!(shard.request_replay(request.clone()), Err(request));
    }
}
