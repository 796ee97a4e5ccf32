//! Level-1 and depth fan-out
//!
//! Turns a tick into the ordered sequence of `PriceUpdate`s every price
//! subscriber receives, and into per-level `DepthUpdate`s. Each invocation is
//! timed and guarded; a panicking subscriber is counted and skipped without
//! affecting the others.

use std::time::Instant;

use tracing::warn;
use types::ids::Symbol;
use types::tick::TickRecord;

use crate::callback::{
    invoke_depth, invoke_price, DepthOperation, DepthSide, DepthSubscriber, DepthUpdate,
    PriceKind, PriceSubscriber, PriceUpdate,
};
use crate::metrics::FanoutMetrics;

/// Maximum number of level-1 fields one tick expands into.
const MAX_FIELDS: usize = 9;

/// Log the first callback fault and every thousandth after it.
const FAULT_LOG_EVERY: u64 = 1_000;

/// Result of fanning one tick out to price subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub invocations: u64,
    pub faults: u64,
}

/// Level-1 updates for a tick, in delivery order.
///
/// `Last` always carries at least one unit of size; every other field is
/// only emitted when positive.
pub fn price_updates(tick: &TickRecord, volume_delta: i64, timestamp: i64) -> Vec<PriceUpdate> {
    let mut updates = Vec::with_capacity(MAX_FIELDS);
    let mut push = |kind: PriceKind, value: f64, size: i64| {
        updates.push(PriceUpdate {
            kind,
            value,
            size,
            timestamp,
            extra: 0,
        });
    };

    push(PriceKind::Last, tick.last_price, volume_delta.max(1));
    if tick.bid_price > 0.0 {
        push(PriceKind::Bid, tick.bid_price, tick.bid_quantity);
    }
    if tick.ask_price > 0.0 {
        push(PriceKind::Ask, tick.ask_price, tick.ask_quantity);
    }
    if tick.volume > 0 {
        push(PriceKind::DailyVolume, tick.volume as f64, tick.volume);
    }
    if tick.high > 0.0 {
        push(PriceKind::DailyHigh, tick.high, 0);
    }
    if tick.low > 0.0 {
        push(PriceKind::DailyLow, tick.low, 0);
    }
    if tick.open > 0.0 {
        push(PriceKind::Opening, tick.open, 0);
    }
    if tick.close > 0.0 {
        push(PriceKind::LastClose, tick.close, 0);
    }
    if tick.open_interest > 0 {
        push(PriceKind::OpenInterest, tick.open_interest as f64, tick.open_interest);
    }
    updates
}

/// Depth updates for every populated level, bids first.
pub fn depth_updates(tick: &TickRecord, timestamp: i64) -> Vec<DepthUpdate> {
    let sides = [
        (DepthSide::Bid, &tick.depth.bids),
        (DepthSide::Ask, &tick.depth.asks),
    ];
    sides
        .into_iter()
        .flat_map(|(side, levels)| {
            levels
                .iter()
                .enumerate()
                .filter(|(_, level)| level.is_populated())
                .map(move |(index, level)| DepthUpdate {
                    level: index,
                    side,
                    operation: DepthOperation::Update,
                    price: level.price,
                    quantity: level.quantity,
                    timestamp,
                })
        })
        .collect()
}

/// Timestamp delivered with a tick's updates: the exchange time when known,
/// otherwise local wall-clock time.
pub fn delivery_timestamp(tick: &TickRecord) -> i64 {
    if tick.exchange_timestamp > 0 {
        tick.exchange_timestamp
    } else {
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    }
}

/// Deliver a tick's level-1 fields to each subscriber in registration order.
pub fn dispatch_price(
    symbol: &Symbol,
    subscribers: &[PriceSubscriber],
    tick: &TickRecord,
    volume_delta: i64,
    metrics: &FanoutMetrics,
) -> DispatchOutcome {
    dispatch_price_where(symbol, subscribers, tick, volume_delta, metrics, |_| true)
}

/// Like `dispatch_price`, skipping subscribers `include` rejects.
pub fn dispatch_price_where(
    symbol: &Symbol,
    subscribers: &[PriceSubscriber],
    tick: &TickRecord,
    volume_delta: i64,
    metrics: &FanoutMetrics,
    include: impl Fn(&PriceSubscriber) -> bool,
) -> DispatchOutcome {
    let updates = price_updates(tick, volume_delta, delivery_timestamp(tick));
    let mut outcome = DispatchOutcome::default();
    for subscriber in subscribers.iter().filter(|s| include(s)) {
        deliver(symbol, subscriber, &updates, metrics, &mut outcome);
    }
    outcome
}

/// Deliver a tick's level-1 fields to a single subscriber.
pub fn dispatch_price_to(
    symbol: &Symbol,
    subscriber: &PriceSubscriber,
    tick: &TickRecord,
    volume_delta: i64,
    metrics: &FanoutMetrics,
) -> DispatchOutcome {
    let updates = price_updates(tick, volume_delta, delivery_timestamp(tick));
    let mut outcome = DispatchOutcome::default();
    deliver(symbol, subscriber, &updates, metrics, &mut outcome);
    outcome
}

fn deliver(
    symbol: &Symbol,
    subscriber: &PriceSubscriber,
    updates: &[PriceUpdate],
    metrics: &FanoutMetrics,
    outcome: &mut DispatchOutcome,
) {
    for update in updates {
        let started = Instant::now();
        if invoke_price(subscriber.callback.as_ref(), update) {
            metrics.record_callback(started.elapsed().as_nanos() as u64);
            outcome.invocations += 1;
        } else {
            outcome.faults += 1;
            let faults = metrics.record_callback_error();
            if faults % FAULT_LOG_EVERY == 1 {
                warn!(
                    symbol = %symbol,
                    subscriber = %subscriber.handle.id,
                    kind = ?update.kind,
                    total_faults = faults,
                    "Price callback panicked"
                );
            }
            // The rest of this tick is skipped for a faulting subscriber.
            return;
        }
    }
}

/// Deliver populated depth levels to every depth subscriber.
pub fn dispatch_depth(
    symbol: &Symbol,
    subscribers: &[DepthSubscriber],
    tick: &TickRecord,
    metrics: &FanoutMetrics,
) -> DispatchOutcome {
    let mut outcome = DispatchOutcome::default();
    if subscribers.is_empty() {
        return outcome;
    }

    let updates = depth_updates(tick, delivery_timestamp(tick));
    for subscriber in subscribers {
        for update in &updates {
            let started = Instant::now();
            if invoke_depth(subscriber.callback.as_ref(), update) {
                metrics.record_callback(started.elapsed().as_nanos() as u64);
                metrics.record_depth_update();
                outcome.invocations += 1;
            } else {
                outcome.faults += 1;
                let faults = metrics.record_callback_error();
                if faults % FAULT_LOG_EVERY == 1 {
                    warn!(
                        symbol = %symbol,
                        subscriber = %subscriber.id,
                        level = update.level,
                        total_faults = faults,
                        "Depth callback panicked"
                    );
                }
                break;
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::SubscriberHandle;
    use std::sync::{Arc, Mutex};
    use types::ids::SubscriberId;
    use types::tick::DepthLevel;

    fn full_tick() -> TickRecord {
        let mut tick = TickRecord::new("RELIANCE", 2_950.0, 10, 500_000);
        tick.bid_price = 2_949.5;
        tick.bid_quantity = 120;
        tick.ask_price = 2_950.5;
        tick.ask_quantity = 80;
        tick.open = 2_930.0;
        tick.high = 2_960.0;
        tick.low = 2_925.0;
        tick.close = 2_920.0;
        tick.open_interest = 0;
        tick.exchange_timestamp = 1708123456789000000;
        tick
    }

    fn recorder() -> (PriceSubscriber, Arc<Mutex<Vec<PriceUpdate>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscriber = PriceSubscriber {
            handle: SubscriberHandle::new(SubscriberId::new()),
            callback: Arc::new(move |u: &PriceUpdate| sink.lock().unwrap().push(*u)),
        };
        (subscriber, seen)
    }

    #[test]
    fn test_update_order_and_filtering() {
        let kinds: Vec<PriceKind> = price_updates(&full_tick(), 5, 0)
            .iter()
            .map(|u| u.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                PriceKind::Last,
                PriceKind::Bid,
                PriceKind::Ask,
                PriceKind::DailyVolume,
                PriceKind::DailyHigh,
                PriceKind::DailyLow,
                PriceKind::Opening,
                PriceKind::LastClose,
            ]
        );
    }

    #[test]
    fn test_last_size_at_least_one() {
        let updates = price_updates(&full_tick(), 0, 0);
        assert_eq!(updates[0].kind, PriceKind::Last);
        assert_eq!(updates[0].size, 1);

        let updates = price_updates(&full_tick(), 42, 0);
        assert_eq!(updates[0].size, 42);
    }

    #[test]
    fn test_minimal_tick_only_last() {
        let tick = TickRecord::new("NIFTY", 22_000.0, 0, 0);
        let updates = price_updates(&tick, 0, 7);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].timestamp, 7);
    }

    #[test]
    fn test_dispatch_continues_after_faulting_subscriber() {
        let metrics = FanoutMetrics::default();
        let faulty = PriceSubscriber {
            handle: SubscriberHandle::new(SubscriberId::new()),
            callback: Arc::new(|_: &PriceUpdate| panic!("bad subscriber")),
        };
        let (good, seen) = recorder();

        let outcome = dispatch_price(
            &Symbol::new("RELIANCE"),
            &[faulty, good],
            &full_tick(),
            5,
            &metrics,
        );

        assert_eq!(outcome.faults, 1);
        assert_eq!(outcome.invocations, 8);
        assert_eq!(seen.lock().unwrap().len(), 8);
        assert_eq!(metrics.callback_errors.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn test_exchange_timestamp_forwarded() {
        let metrics = FanoutMetrics::default();
        let (subscriber, seen) = recorder();
        dispatch_price_to(&Symbol::new("RELIANCE"), &subscriber, &full_tick(), 1, &metrics);
        assert!(seen
            .lock()
            .unwrap()
            .iter()
            .all(|u| u.timestamp == 1708123456789000000));
    }

    #[test]
    fn test_depth_updates_skip_empty_levels() {
        let mut tick = full_tick();
        tick.depth.bids[0] = DepthLevel::new(2_949.5, 120);
        tick.depth.bids[1] = DepthLevel::new(2_949.0, 0);
        tick.depth.asks[0] = DepthLevel::new(2_950.5, 80);
        tick.depth.asks[4] = DepthLevel::new(2_952.0, 15);

        let updates = depth_updates(&tick, 0);
        let levels: Vec<(DepthSide, usize)> = updates.iter().map(|u| (u.side, u.level)).collect();
        assert_eq!(
            levels,
            vec![(DepthSide::Bid, 0), (DepthSide::Ask, 0), (DepthSide::Ask, 4)]
        );
    }
}
