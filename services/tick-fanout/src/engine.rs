//! Engine facade
//!
//! `FanoutEngine` is constructed once by the process entry point and shared by
//! handle. It owns the shards, the subscription registry, the last-value cache,
//! the metrics and the health monitor, and exposes the admission, subscription
//! and diagnostics entry points.
//!
//! Replays for newly attached subscribers are handed to the shard that owns
//! the symbol, so a subscriber never sees a cached tick after a live one.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam::channel::{self, Receiver};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use types::ids::{SubscriberId, Symbol};
use types::session::MarketHours;
use types::tick::TickRecord;

use crate::backpressure::{BackpressureController, SymbolPolicy};
use crate::cache::LastValueCache;
use crate::config::FanoutConfig;
use crate::error::EngineError;
use crate::health::{HealthAlert, HealthMonitor};
use crate::metrics::{DropKind, FanoutMetrics, MetricsSnapshot};
use crate::registry::{
    AlwaysResolved, InstrumentResolver, RegistryUpdate, SubscriptionMap, SubscriptionRegistry,
    SubscriptionSet,
};
use crate::shard::{shard_index, Shard, ShardState, ShardStatus};
use crate::shutdown::{ShutdownReport, ShutdownSignal};
use crate::worker::{QueuedTick, ReplayRequest, SessionCalendar, TickProcessor};

/// Log the first dropped tick of a kind and every thousandth after it.
const DROP_LOG_EVERY: u64 = 1_000;

/// Alerts buffered per subscriber before the oldest are lost.
const ALERT_CAPACITY: usize = 256;

/// Builder for a `FanoutEngine` with non-default collaborators.
pub struct FanoutEngineBuilder {
    config: FanoutConfig,
    resolver: Arc<dyn InstrumentResolver>,
    sessions: Arc<dyn SessionCalendar>,
}

impl FanoutEngineBuilder {
    pub fn new(config: FanoutConfig) -> Self {
        Self {
            config,
            resolver: Arc::new(AlwaysResolved),
            sessions: Arc::new(MarketHours::default()),
        }
    }

    /// Decides whether a subscribed symbol's instrument is ready.
    pub fn resolver(mut self, resolver: Arc<dyn InstrumentResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Decides whether a symbol's market session is open.
    pub fn sessions(mut self, sessions: Arc<dyn SessionCalendar>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn build(self) -> Result<FanoutEngine, EngineError> {
        let config = self.config;
        config.validate()?;

        let metrics = Arc::new(FanoutMetrics::new(config.latency_window));
        let registry = Arc::new(SubscriptionRegistry::new(
            self.resolver,
            config.unresolved_grace(),
        ));
        let cache = Arc::new(LastValueCache::new(
            config.cache_capacity,
            config.cache_trim_to,
        ));
        let (observers, _) = broadcast::channel(config.observer_capacity);
        let (alerts, _) = broadcast::channel(ALERT_CAPACITY);
        let shutdown = ShutdownSignal::new();
        let (done_tx, done_rx) = channel::unbounded();
        let policy = SymbolPolicy::new(&config.essential_symbols);

        let mut shards = Vec::with_capacity(config.shard_count);
        for index in 0..config.shard_count {
            let processor = TickProcessor::new(
                index,
                registry.clone(),
                cache.clone(),
                metrics.clone(),
                self.sessions.clone(),
                observers.clone(),
            );
            let backpressure = BackpressureController::new(
                index,
                config.shard_capacity,
                config.backpressure.clone(),
                config.critical_drop_per_ten,
                policy.clone(),
            );
            let shard = match Shard::spawn(
                index,
                config.shard_capacity,
                backpressure,
                processor,
                shutdown.subscribe(),
                config.idle_poll(),
                metrics.clone(),
                done_tx.clone(),
            ) {
                Ok(shard) => shard,
                Err(e) => {
                    // Stop the workers that did start.
                    shutdown.cancel();
                    return Err(e);
                }
            };
            shards.push(shard);
        }

        let health = Arc::new(HealthMonitor::new(
            metrics.clone(),
            shards.iter().map(|s| s.status().clone()).collect(),
            config.health.clone(),
            config.health_interval(),
            alerts.clone(),
            shutdown.clone(),
        ));

        info!(
            shards = config.shard_count,
            shard_capacity = config.shard_capacity,
            headroom = config.backpressure_headroom,
            cache_capacity = config.cache_capacity,
            "Tick fan-out engine started"
        );

        Ok(FanoutEngine {
            config,
            shards,
            registry,
            cache,
            metrics,
            observers,
            alerts,
            health,
            shutdown,
            accepting: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            done: done_rx,
            update_lock: Mutex::new(()),
        })
    }
}

/// Sharded tick ingestion and fan-out engine.
pub struct FanoutEngine {
    config: FanoutConfig,
    shards: Vec<Shard>,
    registry: Arc<SubscriptionRegistry>,
    cache: Arc<LastValueCache>,
    metrics: Arc<FanoutMetrics>,
    observers: broadcast::Sender<TickRecord>,
    alerts: broadcast::Sender<HealthAlert>,
    health: Arc<HealthMonitor>,
    shutdown: ShutdownSignal,
    accepting: AtomicBool,
    /// `queue_tick` calls past the accepting check and not yet finished.
    in_flight: AtomicUsize,
    done: Receiver<usize>,
    /// Serializes registry rebuilds with their replay pass.
    update_lock: Mutex<()>,
}

impl FanoutEngine {
    /// Start an engine with the default resolver and NSE session hours.
    pub fn new(config: FanoutConfig) -> Result<Self, EngineError> {
        FanoutEngineBuilder::new(config).build()
    }

    pub fn builder(config: FanoutConfig) -> FanoutEngineBuilder {
        FanoutEngineBuilder::new(config)
    }

    /// Offer a tick for fan-out. Never blocks.
    ///
    /// Returns false when the tick was dropped: empty symbol, shutdown,
    /// backpressure or a full queue. Drops are counted, never retried.
    pub fn queue_tick(&self, symbol: &str, mut tick: TickRecord) -> bool {
        if symbol.is_empty() {
            let count = self.metrics.record_drop(DropKind::Invalid);
            if count % DROP_LOG_EVERY == 1 {
                warn!(total = count, "Rejected tick with empty symbol");
            }
            return false;
        }
        let _admitting = InFlight::enter(&self.in_flight);
        if !self.accepting.load(Ordering::SeqCst) {
            self.metrics.record_drop(DropKind::ShutDown);
            return false;
        }

        let shard = &self.shards[shard_index(symbol, self.shards.len())];
        let status = shard.status();
        if status.state() != ShardState::Running {
            // Draining, or stopped after a failure.
            self.metrics.record_drop(DropKind::ShutDown);
            return false;
        }

        let depth = shard.queue_len();
        let backpressure = status.backpressure();
        if depth + self.config.backpressure_headroom >= shard.capacity() {
            let admission = backpressure.evaluate(depth, symbol);
            if !admission.admit {
                let count = self.metrics.record_drop(DropKind::Backpressure);
                if count % DROP_LOG_EVERY == 1 {
                    warn!(
                        shard = shard.index(),
                        symbol,
                        level = admission.level.label(),
                        reason = ?admission.reason,
                        queue_depth = depth,
                        total = count,
                        "Tick dropped by backpressure"
                    );
                }
                return false;
            }
        } else {
            backpressure.observe(depth);
        }

        if tick.symbol.as_str() != symbol {
            tick.symbol = Symbol::new(symbol);
        }

        if shard.try_enqueue(QueuedTick::new(tick)) {
            self.metrics.record_queued();
            true
        } else {
            let count = self.metrics.record_drop(DropKind::QueueFull);
            if count % DROP_LOG_EVERY == 1 {
                warn!(
                    shard = shard.index(),
                    symbol,
                    capacity = shard.capacity(),
                    total = count,
                    "Shard queue full, tick dropped"
                );
            }
            false
        }
    }

    /// Install the full desired subscription state. Newly attached subscribers
    /// are held back from live ticks until their owning shard has replayed the
    /// cached tick to them.
    pub fn update_subscriptions(
        &self,
        desired: &SubscriptionSet,
    ) -> Result<RegistryUpdate, EngineError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(EngineError::AlreadyShutDown);
        }
        let _guard = self.lock_updates();

        let update = self
            .registry
            .update_with(desired, |diff| self.cache.hold_for_replay(&diff.added));
        self.cache.forget_replays(&update.removed);
        self.schedule_replays(&update.added);
        Ok(update)
    }

    /// Rebuild from the last desired state while an unresolved instrument is
    /// inside its grace period. Returns None when nothing was retried.
    pub fn retry_unresolved(&self) -> Option<RegistryUpdate> {
        if !self.accepting.load(Ordering::SeqCst) {
            return None;
        }
        let _guard = self.lock_updates();

        let update = self
            .registry
            .retry_pending_with(|diff| self.cache.hold_for_replay(&diff.added))?;
        self.cache.forget_replays(&update.removed);
        self.schedule_replays(&update.added);
        Some(update)
    }

    /// Re-check unresolved instruments every `unresolved_retry_ms` until the
    /// engine shuts down.
    pub async fn run_unresolved_retry(&self) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }

        let mut ticker = tokio::time::interval(self.config.unresolved_retry());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(update) = self.retry_unresolved() {
                        debug!(
                            version = update.version,
                            added = update.added.len(),
                            pending = update.pending.len(),
                            skipped = update.skipped.len(),
                            "Retried unresolved instruments"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn lock_updates(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.update_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Hand each newly attached pair to the shard owning its symbol.
    fn schedule_replays(&self, added: &[(Symbol, SubscriberId)]) {
        let mut per_shard: BTreeMap<usize, Vec<(Symbol, SubscriberId)>> = BTreeMap::new();
        for (symbol, id) in added {
            per_shard
                .entry(shard_index(symbol.as_str(), self.shards.len()))
                .or_default()
                .push((symbol.clone(), *id));
        }

        for (index, pairs) in per_shard {
            if let Err(rejected) = self.shards[index].request_replay(ReplayRequest { pairs }) {
                // Worker is gone; nothing will deliver to these pairs anyway.
                self.cache.release(&rejected.pairs);
                warn!(
                    shard = index,
                    pairs = rejected.pairs.len(),
                    "Shard worker stopped, replay not scheduled"
                );
            }
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn export(&self) -> BTreeMap<String, u64> {
        self.metrics.export()
    }

    /// Multi-line human-readable report for operational tooling.
    pub fn diagnostic_info(&self) -> String {
        let counters = self.metrics.export();
        let counter = |name: &str| counters.get(name).copied().unwrap_or(0);
        let (avg_ms, p99_ms) = match self.metrics.processing_ns.lock() {
            Ok(tracker) => (
                tracker.average().unwrap_or(0) as f64 / 1_000_000.0,
                tracker.percentile(99).unwrap_or(0) as f64 / 1_000_000.0,
            ),
            Err(_) => (0.0, 0.0),
        };
        let map = self.registry.current();

        let mut out = String::new();
        let _ = writeln!(out, "Tick fan-out engine v{}", crate::SERVICE_VERSION);
        let _ = writeln!(
            out,
            "  accepting: {}",
            self.accepting.load(Ordering::Acquire)
        );
        let _ = writeln!(
            out,
            "  ticks: queued={} processed={} fired={} no_subscribers={}",
            counter("ticks_queued"),
            counter("ticks_processed"),
            counter("ticks_fired"),
            counter("no_subscriber_ticks"),
        );
        let _ = writeln!(
            out,
            "  dropped: backpressure={} queue_full={} shutdown={} invalid={}",
            counter("ticks_dropped_backpressure"),
            counter("ticks_dropped_queue_full"),
            counter("ticks_dropped_shutdown"),
            counter("ticks_rejected_invalid"),
        );
        let _ = writeln!(out, "  processing: avg={avg_ms:.3}ms p99={p99_ms:.3}ms");
        let _ = writeln!(
            out,
            "  callbacks: executed={} errors={} slow={} very_slow={} depth_updates={} replays={}",
            counter("callbacks_executed"),
            counter("callback_errors"),
            counter("slow_callbacks"),
            counter("very_slow_callbacks"),
            counter("depth_updates"),
            counter("replays"),
        );
        let _ = writeln!(
            out,
            "  cache: entries={} replayed_pairs={}",
            self.cache.len(),
            self.cache.replayed_count()
        );
        let _ = writeln!(
            out,
            "  registry: version={} symbols={} callbacks={} depth_symbols={}",
            map.version(),
            map.symbol_count(),
            map.callback_count(),
            map.depth_symbol_count()
        );
        for shard in &self.shards {
            let status = shard.status();
            let _ = writeln!(
                out,
                "  shard {}: state={} failed={} queue={}/{} backpressure={} symbols={} processed={}",
                shard.index(),
                status.state().label(),
                status.is_failed(),
                shard.queue_len(),
                shard.capacity(),
                status.backpressure().current_level().label(),
                status.symbol_count(),
                status.processed(),
            );
        }

        let grace = self.config.unresolved_grace();
        for (symbol, waited) in self.registry.pending_instruments() {
            let label = if waited >= grace { "skipped" } else { "pending" };
            let _ = writeln!(
                out,
                "  unresolved: {symbol} {label} ({}s)",
                waited.as_secs()
            );
        }
        out
    }

    /// Receive every valid tick as it is processed.
    pub fn subscribe_ticks(&self) -> broadcast::Receiver<TickRecord> {
        self.observers.subscribe()
    }

    /// Receive typed health alerts.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<HealthAlert> {
        self.alerts.subscribe()
    }

    /// The health monitor; run it with `HealthMonitor::run` on a tokio runtime.
    pub fn health_monitor(&self) -> Arc<HealthMonitor> {
        self.health.clone()
    }

    pub fn last_tick(&self, symbol: &str) -> Option<TickRecord> {
        self.cache.get(symbol)
    }

    /// Shard a symbol routes to.
    pub fn shard_for(&self, symbol: &str) -> usize {
        shard_index(symbol, self.shards.len())
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_status(&self, index: usize) -> Option<&Arc<ShardStatus>> {
        self.shards.get(index).map(Shard::status)
    }

    pub fn subscription_map(&self) -> Arc<SubscriptionMap> {
        self.registry.snapshot()
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Stop admissions, drain the shards within the shutdown timeout, then
    /// cancel everything still running.
    pub fn shutdown(&self) -> Result<ShutdownReport, EngineError> {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return Err(EngineError::AlreadyShutDown);
        }
        // Producers that saw `accepting` still set finish their enqueue first.
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            std::thread::yield_now();
        }

        let started = Instant::now();
        let timeout = self.config.shutdown_timeout();
        info!(
            outstanding = self.metrics.outstanding(),
            timeout_ms = timeout.as_millis() as u64,
            "Shutting down tick fan-out engine"
        );

        for shard in &self.shards {
            shard.begin_drain();
        }

        let deadline = started + timeout;
        let mut finished = HashSet::with_capacity(self.shards.len());
        while finished.len() < self.shards.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.done.recv_timeout(remaining) {
                Ok(index) => {
                    finished.insert(index);
                }
                Err(_) => break,
            }
        }
        let timed_out = finished.len() < self.shards.len();

        self.shutdown.cancel();
        for shard in &self.shards {
            shard.join_if_finished();
        }

        let queued = self.metrics.ticks_queued.load(Ordering::Acquire);
        let processed = self.metrics.ticks_processed.load(Ordering::Acquire);
        let unprocessed = queued.saturating_sub(processed);
        self.metrics.record_unprocessed(unprocessed);
        let failed_shards: Vec<usize> = self
            .shards
            .iter()
            .filter(|s| s.status().is_failed())
            .map(Shard::index)
            .collect();

        let report = ShutdownReport {
            processed,
            unprocessed,
            failed_shards,
            timed_out,
        };

        if report.is_clean() {
            info!(
                processed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Tick fan-out engine stopped"
            );
        } else {
            warn!(
                processed,
                unprocessed,
                failed_shards = ?report.failed_shards,
                timed_out,
                "Tick fan-out engine stopped with leftovers"
            );
        }
        Ok(report)
    }
}

/// Marks one `queue_tick` call in progress for the shutdown handshake.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for FanoutEngine {
    fn drop(&mut self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            // Not shut down explicitly: stop the workers without draining.
            self.shutdown.cancel();
        }
    }
}
