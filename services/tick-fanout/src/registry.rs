//! Copy-on-write subscription registry
//!
//! Collaborators describe the full desired state in a `SubscriptionSet` and
//! hand it to `SubscriptionRegistry::update`, which builds a brand-new
//! `SubscriptionMap` and swaps it in atomically. Shard workers read the map
//! through `ArcSwap` without locking and always observe either the fully old
//! or the fully new map.
//!
//! Symbols whose instrument is not yet resolved are left out of the new map.
//! `retry_pending` rebuilds from the last desired state while any of them is
//! inside its grace period; after that they are logged once as skipped and
//! stay out until the next full update.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, Guard};
use tracing::{debug, info, warn};
use types::ids::{SubscriberId, Symbol};

use crate::callback::{
    DepthCallback, DepthSubscriber, PriceCallback, PriceSubscriber, SubscriberHandle,
};

/// Decides whether a symbol's platform instrument is ready for fan-out.
pub trait InstrumentResolver: Send + Sync {
    fn is_resolved(&self, symbol: &Symbol) -> bool;
}

/// Resolver that treats every symbol as ready.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysResolved;

impl InstrumentResolver for AlwaysResolved {
    fn is_resolved(&self, _symbol: &Symbol) -> bool {
        true
    }
}

impl<F> InstrumentResolver for F
where
    F: Fn(&Symbol) -> bool + Send + Sync,
{
    fn is_resolved(&self, symbol: &Symbol) -> bool {
        self(symbol)
    }
}

/// Desired subscription state, owned by the collaborator.
///
/// Registration order is preserved per symbol; callbacks fire in that order.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionSet {
    price: BTreeMap<Symbol, Vec<PriceSubscriber>>,
    depth: BTreeMap<Symbol, Vec<DepthSubscriber>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a price callback. An existing registration with the same
    /// subscriber id for this symbol is replaced in place.
    pub fn register_callback(
        &mut self,
        symbol: impl Into<Symbol>,
        handle: SubscriberHandle,
        callback: Arc<dyn PriceCallback>,
    ) {
        let subscribers = self.price.entry(symbol.into()).or_default();
        let subscriber = PriceSubscriber { handle, callback };
        match subscribers.iter_mut().find(|s| s.handle.id == handle.id) {
            Some(existing) => *existing = subscriber,
            None => subscribers.push(subscriber),
        }
    }

    /// Remove a price callback. Returns whether it was registered.
    pub fn unregister_callback(&mut self, symbol: &str, id: SubscriberId) -> bool {
        let Some(subscribers) = self.price.get_mut(symbol) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.handle.id != id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            self.price.remove(symbol);
        }
        removed
    }

    pub fn register_depth(
        &mut self,
        symbol: impl Into<Symbol>,
        id: SubscriberId,
        callback: Arc<dyn DepthCallback>,
    ) {
        let subscribers = self.depth.entry(symbol.into()).or_default();
        let subscriber = DepthSubscriber { id, callback };
        match subscribers.iter_mut().find(|s| s.id == id) {
            Some(existing) => *existing = subscriber,
            None => subscribers.push(subscriber),
        }
    }

    pub fn unregister_depth(&mut self, symbol: &str, id: SubscriberId) -> bool {
        let Some(subscribers) = self.depth.get_mut(symbol) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            self.depth.remove(symbol);
        }
        removed
    }

    /// Number of registered price callbacks across all symbols.
    pub fn callback_count(&self) -> usize {
        self.price.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.price.is_empty() && self.depth.is_empty()
    }
}

/// Price callbacks registered for one symbol.
#[derive(Debug, Clone)]
pub struct SymbolSubscriptions {
    pub callbacks: Vec<PriceSubscriber>,
    /// Any subscriber treats this symbol as an index.
    pub is_index: bool,
}

/// Immutable routing table installed by a registry rebuild.
#[derive(Debug, Default)]
pub struct SubscriptionMap {
    price: HashMap<Symbol, SymbolSubscriptions>,
    depth: HashMap<Symbol, Vec<DepthSubscriber>>,
    version: u64,
}

impl SubscriptionMap {
    pub fn get(&self, symbol: &str) -> Option<&SymbolSubscriptions> {
        self.price.get(symbol)
    }

    pub fn depth(&self, symbol: &str) -> &[DepthSubscriber] {
        self.depth.get(symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Symbol, &SymbolSubscriptions)> {
        self.price.iter()
    }

    pub fn symbol_count(&self) -> usize {
        self.price.len()
    }

    pub fn callback_count(&self) -> usize {
        self.price.values().map(|s| s.callbacks.len()).sum()
    }

    pub fn depth_symbol_count(&self) -> usize {
        self.depth.len()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    fn pairs(&self) -> HashSet<(Symbol, SubscriberId)> {
        self.price
            .iter()
            .flat_map(|(symbol, subs)| {
                subs.callbacks
                    .iter()
                    .map(move |s| (symbol.clone(), s.handle.id))
            })
            .collect()
    }
}

/// Outcome of a registry rebuild.
#[derive(Debug, Clone, Default)]
pub struct RegistryUpdate {
    pub version: u64,
    pub symbols: usize,
    pub callbacks: usize,
    /// (symbol, subscriber) pairs present now but not in the previous map.
    pub added: Vec<(Symbol, SubscriberId)>,
    /// (symbol, subscriber) pairs dropped since the previous map.
    pub removed: Vec<(Symbol, SubscriberId)>,
    /// Unresolved symbols still inside their retry window.
    pub pending: Vec<Symbol>,
    /// Unresolved symbols whose retry window has expired.
    pub skipped: Vec<Symbol>,
}

#[derive(Debug, Default)]
struct RetryState {
    /// First time each unresolved symbol was seen.
    pending: HashMap<Symbol, Instant>,
    /// Symbols already reported as skipped.
    skipped: HashSet<Symbol>,
    /// Last desired state handed to `update`.
    desired: Option<SubscriptionSet>,
}

impl RetryState {
    /// Unresolved symbols still inside their grace period.
    fn waiting(&self) -> bool {
        self.pending.keys().any(|s| !self.skipped.contains(s))
    }
}

/// Holds the current `SubscriptionMap` behind an atomic pointer swap.
pub struct SubscriptionRegistry {
    current: ArcSwap<SubscriptionMap>,
    resolver: Arc<dyn InstrumentResolver>,
    grace: Duration,
    /// Serializes rebuilds; never touched by readers.
    retry: Mutex<RetryState>,
}

impl SubscriptionRegistry {
    pub fn new(resolver: Arc<dyn InstrumentResolver>, grace: Duration) -> Self {
        Self {
            current: ArcSwap::from_pointee(SubscriptionMap::default()),
            resolver,
            grace,
            retry: Mutex::new(RetryState::default()),
        }
    }

    /// Lock-free view of the current map for the hot path.
    pub fn current(&self) -> Guard<Arc<SubscriptionMap>> {
        self.current.load()
    }

    /// Owned handle to the current map.
    pub fn snapshot(&self) -> Arc<SubscriptionMap> {
        self.current.load_full()
    }

    /// Rebuild the map from the full desired state and install it.
    pub fn update(&self, desired: &SubscriptionSet) -> RegistryUpdate {
        self.update_with(desired, |_| {})
    }

    /// Like `update`, running `before_install` on the diff before the new map
    /// becomes visible to readers.
    pub fn update_with(
        &self,
        desired: &SubscriptionSet,
        before_install: impl FnOnce(&RegistryUpdate),
    ) -> RegistryUpdate {
        self.rebuild(desired, Instant::now(), before_install)
    }

    pub(crate) fn update_at(&self, desired: &SubscriptionSet, now: Instant) -> RegistryUpdate {
        self.rebuild(desired, now, |_| {})
    }

    /// Rebuild from the last desired state if an unresolved symbol is still
    /// inside its grace period. Returns None when there is nothing to retry.
    pub fn retry_pending_with(
        &self,
        before_install: impl FnOnce(&RegistryUpdate),
    ) -> Option<RegistryUpdate> {
        self.retry_pending_at(Instant::now(), before_install)
    }

    pub(crate) fn retry_pending_at(
        &self,
        now: Instant,
        before_install: impl FnOnce(&RegistryUpdate),
    ) -> Option<RegistryUpdate> {
        let mut retry = self.lock_retry();
        if !retry.waiting() {
            return None;
        }
        let desired = retry.desired.clone()?;
        Some(self.rebuild_locked(&mut retry, &desired, now, before_install))
    }

    fn lock_retry(&self) -> MutexGuard<'_, RetryState> {
        match self.retry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn rebuild(
        &self,
        desired: &SubscriptionSet,
        now: Instant,
        before_install: impl FnOnce(&RegistryUpdate),
    ) -> RegistryUpdate {
        let mut retry = self.lock_retry();
        retry.desired = Some(desired.clone());
        self.rebuild_locked(&mut retry, desired, now, before_install)
    }

    fn rebuild_locked(
        &self,
        retry: &mut RetryState,
        desired: &SubscriptionSet,
        now: Instant,
        before_install: impl FnOnce(&RegistryUpdate),
    ) -> RegistryUpdate {
        let mut price = HashMap::with_capacity(desired.price.len());
        let mut depth = HashMap::with_capacity(desired.depth.len());
        let mut pending = Vec::new();
        let mut skipped = Vec::new();
        let mut unresolved = HashSet::new();

        let symbols: std::collections::BTreeSet<&Symbol> =
            desired.price.keys().chain(desired.depth.keys()).collect();

        for symbol in symbols {
            if !self.resolver.is_resolved(symbol) {
                unresolved.insert(symbol.clone());
                let since = *retry.pending.entry(symbol.clone()).or_insert(now);
                if now.duration_since(since) >= self.grace {
                    if retry.skipped.insert(symbol.clone()) {
                        warn!(
                            symbol = %symbol,
                            grace_secs = self.grace.as_secs(),
                            "Instrument unresolved after grace period, skipping for this cycle"
                        );
                    }
                    skipped.push(symbol.clone());
                } else {
                    debug!(symbol = %symbol, "Instrument not yet resolved, will retry");
                    pending.push(symbol.clone());
                }
                continue;
            }

            if retry.pending.remove(symbol).is_some() {
                retry.skipped.remove(symbol);
                info!(symbol = %symbol, "Instrument resolved, subscription activated");
            }

            if let Some(callbacks) = desired.price.get(symbol) {
                if !callbacks.is_empty() {
                    let is_index = callbacks.iter().any(|s| s.handle.is_index);
                    price.insert(
                        symbol.clone(),
                        SymbolSubscriptions {
                            callbacks: callbacks.clone(),
                            is_index,
                        },
                    );
                }
            }
            if let Some(subscribers) = desired.depth.get(symbol) {
                if !subscribers.is_empty() {
                    depth.insert(symbol.clone(), subscribers.clone());
                }
            }
        }

        // Forget retry bookkeeping for symbols no longer requested.
        retry.pending.retain(|s, _| unresolved.contains(s));
        retry.skipped.retain(|s| unresolved.contains(s));

        let previous = self.current.load_full();
        let next = SubscriptionMap {
            price,
            depth,
            version: previous.version + 1,
        };

        let before = previous.pairs();
        let after = next.pairs();
        let mut added: Vec<_> = after.difference(&before).cloned().collect();
        let mut removed: Vec<_> = before.difference(&after).cloned().collect();
        added.sort();
        removed.sort();

        let update = RegistryUpdate {
            version: next.version,
            symbols: next.symbol_count(),
            callbacks: next.callback_count(),
            added,
            removed,
            pending,
            skipped,
        };

        before_install(&update);
        self.current.store(Arc::new(next));

        info!(
            version = update.version,
            symbols = update.symbols,
            callbacks = update.callbacks,
            added = update.added.len(),
            removed = update.removed.len(),
            pending = update.pending.len(),
            skipped = update.skipped.len(),
            "Subscription map installed"
        );

        update
    }

    /// Unresolved symbols currently tracked, with how long they have waited.
    pub fn pending_instruments(&self) -> Vec<(Symbol, Duration)> {
        let retry = self.lock_retry();
        let mut pending: Vec<_> = retry
            .pending
            .iter()
            .map(|(s, since)| (s.clone(), since.elapsed()))
            .collect();
        pending.sort_by(|a, b| a.0.cmp(&b.0));
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{DepthUpdate, PriceUpdate};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn noop() -> Arc<dyn PriceCallback> {
        Arc::new(|_: &PriceUpdate| {})
    }

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(Arc::new(AlwaysResolved), Duration::from_secs(30))
    }

    #[test]
    fn test_register_and_install() {
        let reg = registry();
        let mut set = SubscriptionSet::new();
        let a = SubscriberHandle::new(SubscriberId::new());
        let b = SubscriberHandle::new(SubscriberId::new()).index();
        set.register_callback("NIFTY", a, noop());
        set.register_callback("NIFTY", b, noop());
        set.register_callback("RELIANCE", a, noop());

        let update = reg.update(&set);
        assert_eq!(update.version, 1);
        assert_eq!(update.symbols, 2);
        assert_eq!(update.callbacks, 3);
        assert_eq!(update.added.len(), 3);

        let map = reg.current();
        let nifty = map.get("NIFTY").unwrap();
        assert_eq!(nifty.callbacks.len(), 2);
        assert!(nifty.is_index);
        assert_eq!(nifty.callbacks[0].handle.id, a.id);
        assert!(!map.get("RELIANCE").unwrap().is_index);
    }

    #[test]
    fn test_reregister_replaces_in_place() {
        let mut set = SubscriptionSet::new();
        let handle = SubscriberHandle::new(SubscriberId::new());
        set.register_callback("NIFTY", handle, noop());
        set.register_callback("NIFTY", handle.index(), noop());
        assert_eq!(set.callback_count(), 1);
    }

    #[test]
    fn test_unregister_drops_empty_symbol() {
        let mut set = SubscriptionSet::new();
        let handle = SubscriberHandle::new(SubscriberId::new());
        set.register_callback("NIFTY", handle, noop());

        assert!(set.unregister_callback("NIFTY", handle.id));
        assert!(!set.unregister_callback("NIFTY", handle.id));
        assert!(set.is_empty());
    }

    #[test]
    fn test_diff_reports_added_and_removed() {
        let reg = registry();
        let a = SubscriberHandle::new(SubscriberId::new());
        let b = SubscriberHandle::new(SubscriberId::new());

        let mut set = SubscriptionSet::new();
        set.register_callback("NIFTY", a, noop());
        reg.update(&set);

        set.unregister_callback("NIFTY", a.id);
        set.register_callback("NIFTY", b, noop());
        let update = reg.update(&set);

        assert_eq!(update.added, vec![(Symbol::new("NIFTY"), b.id)]);
        assert_eq!(update.removed, vec![(Symbol::new("NIFTY"), a.id)]);
    }

    #[test]
    fn test_readers_keep_old_map_until_they_reload() {
        let reg = registry();
        let mut set = SubscriptionSet::new();
        set.register_callback("NIFTY", SubscriberHandle::new(SubscriberId::new()), noop());
        reg.update(&set);

        let old = reg.snapshot();
        reg.update(&SubscriptionSet::new());

        assert!(old.get("NIFTY").is_some());
        assert!(reg.current().get("NIFTY").is_none());
        assert_eq!(old.version() + 1, reg.current().version());
    }

    #[test]
    fn test_unresolved_symbol_pending_then_skipped() {
        let resolver = |s: &Symbol| s.as_str() != "NEWLISTING";
        let reg = SubscriptionRegistry::new(Arc::new(resolver), Duration::from_secs(30));
        let mut set = SubscriptionSet::new();
        set.register_callback("NEWLISTING", SubscriberHandle::new(SubscriberId::new()), noop());
        set.register_callback("NIFTY", SubscriberHandle::new(SubscriberId::new()), noop());

        let start = Instant::now();
        let first = reg.update_at(&set, start);
        assert_eq!(first.pending, vec![Symbol::new("NEWLISTING")]);
        assert!(first.skipped.is_empty());
        assert!(reg.current().get("NEWLISTING").is_none());
        assert!(reg.current().get("NIFTY").is_some());

        let later = reg.update_at(&set, start + Duration::from_secs(10));
        assert_eq!(later.pending.len(), 1);

        let expired = reg.update_at(&set, start + Duration::from_secs(31));
        assert!(expired.pending.is_empty());
        assert_eq!(expired.skipped, vec![Symbol::new("NEWLISTING")]);
        assert!(reg.current().get("NEWLISTING").is_none());
    }

    #[test]
    fn test_pending_forgotten_when_unrequested() {
        let resolver = |_: &Symbol| false;
        let reg = SubscriptionRegistry::new(Arc::new(resolver), Duration::from_secs(30));
        let mut set = SubscriptionSet::new();
        set.register_callback("ILLIQUID", SubscriberHandle::new(SubscriberId::new()), noop());
        reg.update(&set);
        assert_eq!(reg.pending_instruments().len(), 1);

        reg.update(&SubscriptionSet::new());
        assert!(reg.pending_instruments().is_empty());
    }

    #[test]
    fn test_depth_subscribers_installed() {
        let reg = registry();
        let mut set = SubscriptionSet::new();
        let id = SubscriberId::new();
        set.register_depth("BANKNIFTY", id, Arc::new(|_: &DepthUpdate| {}));
        reg.update(&set);

        let map = reg.current();
        assert_eq!(map.depth("BANKNIFTY").len(), 1);
        assert!(map.depth("NIFTY").is_empty());
        assert_eq!(map.depth_symbol_count(), 1);
    }

    #[test]
    fn test_before_install_runs_ahead_of_swap() {
        let reg = registry();
        let mut set = SubscriptionSet::new();
        set.register_callback("NIFTY", SubscriberHandle::new(SubscriberId::new()), noop());

        let mut visible_version = None;
        let update = reg.update_with(&set, |diff| {
            assert_eq!(diff.added.len(), 1);
            visible_version = Some(reg.current().version());
        });

        assert_eq!(visible_version, Some(0));
        assert_eq!(update.version, 1);
        assert_eq!(reg.current().version(), 1);
    }

    #[test]
    fn test_retry_activates_symbol_resolved_inside_grace() {
        let ready = Arc::new(AtomicBool::new(false));
        let flag = ready.clone();
        let resolver = move |s: &Symbol| s.as_str() != "NEWLISTING" || flag.load(Ordering::Relaxed);
        let reg = SubscriptionRegistry::new(Arc::new(resolver), Duration::from_secs(30));
        let handle = SubscriberHandle::new(SubscriberId::new());
        let mut set = SubscriptionSet::new();
        set.register_callback("NEWLISTING", handle, noop());

        let start = Instant::now();
        reg.update_at(&set, start);
        let still_pending = reg.retry_pending_at(start + Duration::from_secs(1), |_| {}).unwrap();
        assert_eq!(still_pending.pending, vec![Symbol::new("NEWLISTING")]);
        assert!(reg.current().get("NEWLISTING").is_none());

        ready.store(true, Ordering::Relaxed);
        let mut held = Vec::new();
        let resolved = reg
            .retry_pending_at(start + Duration::from_secs(5), |diff| held = diff.added.clone())
            .unwrap();

        assert_eq!(resolved.added, vec![(Symbol::new("NEWLISTING"), handle.id)]);
        assert_eq!(held, resolved.added);
        assert!(reg.current().get("NEWLISTING").is_some());
        assert!(reg.pending_instruments().is_empty());
        assert!(reg.retry_pending_at(start + Duration::from_secs(6), |_| {}).is_none());
    }

    #[test]
    fn test_retry_stops_once_grace_expires() {
        let resolver = |_: &Symbol| false;
        let reg = SubscriptionRegistry::new(Arc::new(resolver), Duration::from_secs(30));
        let mut set = SubscriptionSet::new();
        set.register_callback("ILLIQUID", SubscriberHandle::new(SubscriberId::new()), noop());

        let start = Instant::now();
        reg.update_at(&set, start);
        let expired = reg.retry_pending_at(start + Duration::from_secs(31), |_| {}).unwrap();
        assert_eq!(expired.skipped, vec![Symbol::new("ILLIQUID")]);

        assert!(reg.retry_pending_at(start + Duration::from_secs(32), |_| {}).is_none());
    }

    #[test]
    fn test_retry_without_unresolved_symbols_is_noop() {
        let reg = registry();
        let mut set = SubscriptionSet::new();
        set.register_callback("NIFTY", SubscriberHandle::new(SubscriberId::new()), noop());
        reg.update(&set);

        assert!(reg.retry_pending_with(|_| {}).is_none());
        assert_eq!(reg.current().version(), 1);
    }
}

