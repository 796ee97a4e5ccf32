//! Last-value cache and replay
//!
//! Keeps an owned copy of the most recent valid tick per symbol so that a
//! subscriber attaching while the market is quiet still receives the current
//! state. Each (symbol, subscriber) attach is replayed at most once; the record
//! is forgotten when the subscriber is removed, so a later re-attach counts as
//! a new event.
//!
//! Replay itself runs on the shard worker that owns the symbol. Between the
//! registry swap and that replay the new subscriber is held back from live
//! ticks, so it never sees a cached tick after a fresher live one.
//!
//! The cache is bounded. On overflow it is trimmed oldest-inserted-first, which
//! is cheaper than true LRU and good enough for a symbol universe that changes
//! slowly.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use dashmap::{DashMap, DashSet};
use tracing::debug;
use types::ids::{SubscriberId, Symbol};
use types::tick::TickRecord;

use crate::callback::PriceSubscriber;
use crate::dispatch::dispatch_price_to;
use crate::metrics::FanoutMetrics;
use crate::registry::SubscriptionMap;

/// A cached tick with its insertion order.
#[derive(Debug, Clone)]
pub struct CachedTick {
    pub tick: TickRecord,
    /// Position in insertion order; kept across updates of the same symbol.
    pub inserted_seq: u64,
    pub updated_at: Instant,
}

pub struct LastValueCache {
    entries: DashMap<Symbol, CachedTick>,
    replayed: DashSet<(Symbol, SubscriberId)>,
    /// Attached pairs whose replay has not run yet.
    held: DashSet<(Symbol, SubscriberId)>,
    capacity: usize,
    trim_to: usize,
    seq: AtomicU64,
    trimming: Mutex<()>,
}

impl LastValueCache {
    pub fn new(capacity: usize, trim_to: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity),
            replayed: DashSet::new(),
            held: DashSet::new(),
            capacity,
            trim_to: trim_to.min(capacity),
            seq: AtomicU64::new(0),
            trimming: Mutex::new(()),
        }
    }

    /// Store a copy of `tick` under its symbol, trimming on overflow.
    pub fn cache_last_tick(&self, tick: &TickRecord) {
        {
            let mut entry = self
                .entries
                .entry(tick.symbol.clone())
                .or_insert_with(|| CachedTick {
                    tick: TickRecord::default(),
                    inserted_seq: self.seq.fetch_add(1, Ordering::Relaxed),
                    updated_at: Instant::now(),
                });
            entry.tick = tick.clone();
            entry.updated_at = Instant::now();
        }

        if self.entries.len() > self.capacity {
            self.trim();
        }
    }

    fn trim(&self) {
        // Concurrent overflows are handled by whichever thread gets here first.
        let Ok(_guard) = self.trimming.try_lock() else {
            return;
        };

        let len = self.entries.len();
        if len <= self.capacity {
            return;
        }

        let mut order: Vec<(u64, Symbol)> = self
            .entries
            .iter()
            .map(|entry| (entry.inserted_seq, entry.key().clone()))
            .collect();
        order.sort_unstable_by_key(|(seq, _)| *seq);

        let excess = len.saturating_sub(self.trim_to);
        for (_, symbol) in order.into_iter().take(excess) {
            self.entries.remove(&symbol);
        }

        debug!(
            evicted = excess,
            remaining = self.entries.len(),
            capacity = self.capacity,
            "Last-value cache trimmed"
        );
    }

    /// Copy of the cached tick for a symbol.
    pub fn get(&self, symbol: &str) -> Option<TickRecord> {
        self.entries.get(symbol).map(|entry| entry.tick.clone())
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.entries.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of (symbol, subscriber) pairs already replayed.
    pub fn replayed_count(&self) -> usize {
        self.replayed.len()
    }

    pub fn has_replayed(&self, symbol: &Symbol, id: SubscriberId) -> bool {
        self.replayed.contains(&(symbol.clone(), id))
    }

    /// Replay `cached` to each callback that has not yet received a replay for
    /// this symbol. Returns the number of callbacks replayed to.
    pub fn try_immediate_replay<'a>(
        &self,
        symbol: &Symbol,
        cached: &TickRecord,
        callbacks: impl IntoIterator<Item = &'a PriceSubscriber>,
        metrics: &FanoutMetrics,
    ) -> usize {
        let mut replayed = 0;
        for subscriber in callbacks {
            // Claim the pair before dispatching so a racing rebuild cannot replay twice.
            if !self.replayed.insert((symbol.clone(), subscriber.handle.id)) {
                continue;
            }
            dispatch_price_to(symbol, subscriber, cached, cached.last_trade_quantity, metrics);
            metrics.record_replay();
            replayed += 1;
        }
        replayed
    }

    /// Mark newly attached pairs as awaiting replay. Live ticks skip a held
    /// subscriber until its shard has replayed the cached tick to it.
    pub fn hold_for_replay(&self, added: &[(Symbol, SubscriberId)]) {
        for pair in added {
            self.held.insert(pair.clone());
        }
    }

    /// Whether any subscriber is awaiting replay.
    pub fn has_held(&self) -> bool {
        !self.held.is_empty()
    }

    pub fn is_held(&self, symbol: &Symbol, id: SubscriberId) -> bool {
        self.held.contains(&(symbol.clone(), id))
    }

    /// Release held pairs without replaying, e.g. when their shard is gone.
    pub fn release(&self, pairs: &[(Symbol, SubscriberId)]) {
        for pair in pairs {
            self.held.remove(pair);
        }
    }

    /// Replay the cached tick to each held pair in `pairs` and release it.
    ///
    /// Must run on the worker that owns the symbols, so the replay is ordered
    /// with live deliveries and carries the newest tick that worker has seen.
    pub fn replay_held(
        &self,
        map: &SubscriptionMap,
        pairs: &[(Symbol, SubscriberId)],
        metrics: &FanoutMetrics,
    ) -> usize {
        let mut by_symbol: BTreeMap<&Symbol, Vec<&PriceSubscriber>> = BTreeMap::new();
        let mut released = Vec::with_capacity(pairs.len());
        for pair in pairs {
            if !self.held.contains(pair) {
                continue;
            }
            released.push(pair.clone());
            let (symbol, id) = pair;
            let Some(subscriptions) = map.get(symbol.as_str()) else {
                continue;
            };
            if let Some(subscriber) = subscriptions.callbacks.iter().find(|s| s.handle.id == *id) {
                by_symbol.entry(symbol).or_default().push(subscriber);
            }
        }

        let mut total = 0;
        for (symbol, subscribers) in by_symbol {
            let Some(cached) = self.get(symbol.as_str()) else {
                continue;
            };
            total += self.try_immediate_replay(symbol, &cached, subscribers, metrics);
        }
        self.release(&released);

        if total > 0 {
            debug!(replayed = total, "Replayed cached ticks to new subscribers");
        }
        total
    }

    /// Drop replay records for detached subscribers.
    pub fn forget_replays(&self, removed: &[(Symbol, SubscriberId)]) {
        for pair in removed {
            self.replayed.remove(pair);
            self.held.remove(pair);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{PriceCallback, PriceKind, PriceUpdate, SubscriberHandle};
    use crate::registry::{AlwaysResolved, SubscriptionRegistry, SubscriptionSet};
    use std::sync::Arc;
    use std::time::Duration;

    fn tick(symbol: &str, price: f64) -> TickRecord {
        TickRecord::new(symbol, price, 5, 1_000)
    }

    fn counting_subscriber() -> (SubscriberHandle, Arc<AtomicU64>, Arc<dyn PriceCallback>) {
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let callback: Arc<dyn PriceCallback> = Arc::new(move |u: &PriceUpdate| {
            if u.kind == PriceKind::Last {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });
        (SubscriberHandle::new(SubscriberId::new()), count, callback)
    }

    #[test]
    fn test_cache_stores_latest() {
        let cache = LastValueCache::new(10, 9);
        cache.cache_last_tick(&tick("NIFTY", 22_000.0));
        cache.cache_last_tick(&tick("NIFTY", 22_010.5));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("NIFTY").unwrap().last_price, 22_010.5);
        assert!(cache.get("BANKNIFTY").is_none());
    }

    #[test]
    fn test_trim_evicts_oldest_inserted() {
        let cache = LastValueCache::new(10, 9);
        for i in 0..10 {
            cache.cache_last_tick(&tick(&format!("SYM{i}"), 100.0 + i as f64));
        }
        // Updating SYM0 does not refresh its insertion position.
        cache.cache_last_tick(&tick("SYM0", 150.0));
        cache.cache_last_tick(&tick("SYM10", 110.0));

        assert_eq!(cache.len(), 9);
        assert!(!cache.contains("SYM0"));
        assert!(!cache.contains("SYM1"));
        assert!(cache.contains("SYM2"));
        assert!(cache.contains("SYM10"));
    }

    #[test]
    fn test_immediate_replay_once_per_subscriber() {
        let cache = LastValueCache::new(10, 9);
        let metrics = FanoutMetrics::default();
        let (handle, count, callback) = counting_subscriber();
        let subscriber = PriceSubscriber { handle, callback };
        let symbol = Symbol::new("RELIANCE");
        let cached = tick("RELIANCE", 2_950.0);

        assert_eq!(cache.try_immediate_replay(&symbol, &cached, [&subscriber], &metrics), 1);
        assert_eq!(cache.try_immediate_replay(&symbol, &cached, [&subscriber], &metrics), 0);
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.replays.load(Ordering::Relaxed), 1);
        assert!(cache.has_replayed(&symbol, handle.id));
    }

    #[test]
    fn test_replay_held_after_rebuild() {
        let cache = LastValueCache::new(10, 9);
        let metrics = FanoutMetrics::default();
        let registry = SubscriptionRegistry::new(Arc::new(AlwaysResolved), Duration::from_secs(30));
        cache.cache_last_tick(&tick("NIFTY", 22_000.0));

        let (a, count_a, cb_a) = counting_subscriber();
        let (b, count_b, cb_b) = counting_subscriber();
        let mut set = SubscriptionSet::new();
        set.register_callback("NIFTY", a, cb_a);
        set.register_callback("NIFTY", b, cb_b);
        set.register_callback("BANKNIFTY", a, Arc::new(|_: &PriceUpdate| {}));

        let update = registry.update(&set);
        cache.hold_for_replay(&update.added);
        assert!(cache.is_held(&Symbol::new("NIFTY"), a.id));

        let replayed = cache.replay_held(&registry.current(), &update.added, &metrics);
        assert_eq!(replayed, 2);
        // BANKNIFTY has nothing cached but is released all the same.
        assert!(!cache.has_held());

        // Replaying the same pairs again delivers nothing.
        assert_eq!(cache.replay_held(&registry.current(), &update.added, &metrics), 0);
        let update = registry.update(&set);
        assert!(update.added.is_empty());

        assert_eq!(count_a.load(Ordering::Relaxed), 1);
        assert_eq!(count_b.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_forget_releases_held_pair() {
        let cache = LastValueCache::new(10, 9);
        let pair = (Symbol::new("INFY"), SubscriberId::new());
        cache.hold_for_replay(std::slice::from_ref(&pair));
        assert!(cache.has_held());

        cache.forget_replays(std::slice::from_ref(&pair));
        assert!(!cache.has_held());
    }

    #[test]
    fn test_reattach_replays_again_after_forget() {
        let cache = LastValueCache::new(10, 9);
        let metrics = FanoutMetrics::default();
        let (handle, count, callback) = counting_subscriber();
        let subscriber = PriceSubscriber { handle, callback };
        let symbol = Symbol::new("NIFTY");
        let cached = tick("NIFTY", 22_000.0);

        cache.try_immediate_replay(&symbol, &cached, [&subscriber], &metrics);
        cache.forget_replays(&[(symbol.clone(), handle.id)]);
        cache.try_immediate_replay(&symbol, &cached, [&subscriber], &metrics);

        assert_eq!(count.load(Ordering::Relaxed), 2);
    }
}
