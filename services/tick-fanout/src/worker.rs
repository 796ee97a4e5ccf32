//! Per-shard tick processing
//!
//! A `TickProcessor` is owned by exactly one shard worker thread. All ticks
//! for a symbol hash to the same shard, so the per-symbol running state below
//! is read and written by a single thread and needs no synchronization.
//!
//! Processing sequence for one tick:
//! 1. cache it (price > 0) and publish it to tick-stream observers
//! 2. look up subscribers, stopping early when there are none
//! 3. compute the volume delta and update running state
//! 4. decide whether the tick fires level-1 callbacks
//! 5. fan out level-1 fields
//! 6. fan out depth levels
//! 7. record queue-to-done latency
//!
//! Replays for newly attached subscribers also run here, between ticks, so a
//! subscriber sees the cached tick before any live tick that follows it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::debug;
use types::ids::{SubscriberId, Symbol};
use types::session::MarketHours;
use types::tick::TickRecord;

use crate::cache::LastValueCache;
use crate::dispatch::{dispatch_depth, dispatch_price, dispatch_price_where};
use crate::metrics::FanoutMetrics;
use crate::registry::SubscriptionRegistry;

/// Minimum price move that fires an index symbol without traded volume.
pub const PRICE_EPSILON: f64 = 0.0001;

const NO_SUBSCRIBER_LOG_EVERY: u64 = 1_000;

/// A tick waiting in a shard queue.
#[derive(Debug, Clone)]
pub struct QueuedTick {
    pub tick: TickRecord,
    pub enqueued_at: Instant,
}

impl QueuedTick {
    pub fn new(tick: TickRecord) -> Self {
        Self {
            tick,
            enqueued_at: Instant::now(),
        }
    }
}

/// Newly attached (symbol, subscriber) pairs owned by one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayRequest {
    pub pairs: Vec<(Symbol, SubscriberId)>,
}

/// Running state for one symbol within its shard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShardSymbolState {
    /// Cumulative volume of the last processed tick.
    pub previous_volume: i64,
    pub previous_price: f64,
    pub last_tick_at: Instant,
}

/// Whether a symbol's market session is currently open.
pub trait SessionCalendar: Send + Sync {
    fn is_open(&self, symbol: &Symbol) -> bool;
}

impl SessionCalendar for MarketHours {
    fn is_open(&self, _symbol: &Symbol) -> bool {
        self.is_open_now()
    }
}

/// Calendar for feeds that never close.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOpen;

impl SessionCalendar for AlwaysOpen {
    fn is_open(&self, _symbol: &Symbol) -> bool {
        true
    }
}

impl<F> SessionCalendar for F
where
    F: Fn(&Symbol) -> bool + Send + Sync,
{
    fn is_open(&self, symbol: &Symbol) -> bool {
        self(symbol)
    }
}

/// Incremental traded quantity since the previous tick.
///
/// Falls back to the tick's own trade quantity when no cumulative volume has
/// been seen yet. A cumulative volume that went backwards (reset or
/// out-of-order tick) yields zero.
pub fn volume_delta(previous_volume: i64, current_volume: i64, last_trade_quantity: i64) -> i64 {
    if previous_volume > 0 {
        (current_volume - previous_volume).max(0)
    } else {
        last_trade_quantity.max(0)
    }
}

/// Whether a tick fires level-1 callbacks.
///
/// `market_open` is only consulted when neither volume nor an index price move
/// decides the outcome.
pub fn should_fire(
    volume_delta: i64,
    is_index: bool,
    previous_price: f64,
    price: f64,
    market_open: impl FnOnce() -> bool,
) -> bool {
    if volume_delta > 0 {
        return true;
    }
    if is_index && (price - previous_price).abs() > PRICE_EPSILON {
        return true;
    }
    // Outside the session volume gating is meaningless; always propagate.
    !market_open()
}

/// What happened to one processed tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// The symbol had price or depth subscribers.
    pub subscribed: bool,
    /// Level-1 callbacks were fired.
    pub fired: bool,
    pub volume_delta: i64,
    pub invocations: u64,
    pub faults: u64,
}

/// Processes ticks for one shard.
pub struct TickProcessor {
    shard: usize,
    symbols: HashMap<Symbol, ShardSymbolState>,
    registry: Arc<SubscriptionRegistry>,
    cache: Arc<LastValueCache>,
    metrics: Arc<FanoutMetrics>,
    sessions: Arc<dyn SessionCalendar>,
    observers: broadcast::Sender<TickRecord>,
}

impl TickProcessor {
    pub fn new(
        shard: usize,
        registry: Arc<SubscriptionRegistry>,
        cache: Arc<LastValueCache>,
        metrics: Arc<FanoutMetrics>,
        sessions: Arc<dyn SessionCalendar>,
        observers: broadcast::Sender<TickRecord>,
    ) -> Self {
        Self {
            shard,
            symbols: HashMap::new(),
            registry,
            cache,
            metrics,
            sessions,
            observers,
        }
    }

    pub fn process(&mut self, queued: QueuedTick) -> ProcessOutcome {
        let QueuedTick { tick, enqueued_at } = queued;
        let symbol = tick.symbol.clone();
        let mut outcome = ProcessOutcome::default();

        if tick.last_price > 0.0 {
            self.cache.cache_last_tick(&tick);
            if self.observers.receiver_count() > 0 {
                // Lagging observers lose old ticks; a send error only means
                // every receiver went away in the meantime.
                let _ = self.observers.send(tick.clone());
            }
        }

        let map = self.registry.current();
        let price_subs = map
            .get(symbol.as_str())
            .filter(|subs| !subs.callbacks.is_empty());
        let depth_subs = map.depth(symbol.as_str());

        if price_subs.is_none() && depth_subs.is_empty() {
            let count = self.metrics.record_no_subscribers();
            if count % NO_SUBSCRIBER_LOG_EVERY == 1 {
                debug!(
                    shard = self.shard,
                    symbol = %symbol,
                    total = count,
                    "Tick for symbol without subscribers"
                );
            }
            self.metrics
                .record_processed(enqueued_at.elapsed().as_nanos() as u64);
            return outcome;
        }
        outcome.subscribed = true;

        let now = Instant::now();
        let state = self
            .symbols
            .entry(symbol.clone())
            .or_insert(ShardSymbolState {
                previous_volume: 0,
                previous_price: 0.0,
                last_tick_at: now,
            });
        let delta = volume_delta(state.previous_volume, tick.volume, tick.last_trade_quantity);
        let previous_price = state.previous_price;
        state.previous_volume = tick.volume;
        state.previous_price = tick.last_price;
        state.last_tick_at = now;
        outcome.volume_delta = delta;

        let is_index = price_subs.map_or(false, |subs| subs.is_index);
        let sessions = &self.sessions;
        let fire = should_fire(delta, is_index, previous_price, tick.last_price, || {
            sessions.is_open(&symbol)
        });

        if fire && tick.last_price > 0.0 {
            if let Some(subs) = price_subs {
                let cache = &self.cache;
                let result = if cache.has_held() {
                    dispatch_price_where(&symbol, &subs.callbacks, &tick, delta, &self.metrics, |s| {
                        !cache.is_held(&symbol, s.handle.id)
                    })
                } else {
                    dispatch_price(&symbol, &subs.callbacks, &tick, delta, &self.metrics)
                };
                self.metrics.record_fired();
                outcome.fired = true;
                outcome.invocations += result.invocations;
                outcome.faults += result.faults;
            }
        }

        if tick.has_depth() && !depth_subs.is_empty() {
            let result = dispatch_depth(&symbol, depth_subs, &tick, &self.metrics);
            outcome.invocations += result.invocations;
            outcome.faults += result.faults;
        }

        self.metrics
            .record_processed(enqueued_at.elapsed().as_nanos() as u64);
        outcome
    }

    /// Replay cached ticks to the held subscribers in `request`.
    pub fn replay(&mut self, request: &ReplayRequest) -> usize {
        let map = self.registry.current();
        self.cache.replay_held(&map, &request.pairs, &self.metrics)
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    pub fn symbol_state(&self, symbol: &str) -> Option<&ShardSymbolState> {
        self.symbols.get(symbol)
    }

    /// Symbols with running state in this shard.
    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }
}
