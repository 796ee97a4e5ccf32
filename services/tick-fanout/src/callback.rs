//! Subscriber callback contract
//!
//! Subscribers receive level-1 fields as a sequence of `PriceUpdate`s and
//! depth levels as `DepthUpdate`s. Callbacks run inline on a shard worker
//! thread: implementations must not block, and must not panic for expected
//! conditions. An unexpected panic is caught and counted by the dispatcher
//! and never reaches the shard loop.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use types::ids::SubscriberId;

/// Level-1 field carried by a `PriceUpdate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PriceKind {
    Last,
    Bid,
    Ask,
    DailyVolume,
    DailyHigh,
    DailyLow,
    Opening,
    LastClose,
    OpenInterest,
}

/// One level-1 field delivered to a price callback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub kind: PriceKind,
    pub value: f64,
    pub size: i64,
    /// Unix nanoseconds
    pub timestamp: i64,
    pub extra: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DepthSide {
    Bid,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DepthOperation {
    Update,
}

/// One depth level delivered to a depth callback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthUpdate {
    pub level: usize,
    pub side: DepthSide,
    pub operation: DepthOperation,
    pub price: f64,
    pub quantity: i64,
    /// Unix nanoseconds
    pub timestamp: i64,
}

/// Receives level-1 updates for a subscribed symbol.
pub trait PriceCallback: Send + Sync {
    fn on_price(&self, update: &PriceUpdate);
}

impl<F> PriceCallback for F
where
    F: Fn(&PriceUpdate) + Send + Sync,
{
    fn on_price(&self, update: &PriceUpdate) {
        self(update)
    }
}

/// Receives depth updates for a subscribed symbol.
pub trait DepthCallback: Send + Sync {
    fn on_depth(&self, update: &DepthUpdate);
}

impl<F> DepthCallback for F
where
    F: Fn(&DepthUpdate) + Send + Sync,
{
    fn on_depth(&self, update: &DepthUpdate) {
        self(update)
    }
}

/// Identity and fan-out policy flags of one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberHandle {
    pub id: SubscriberId,
    /// Index symbols fire on price changes even without traded volume.
    pub is_index: bool,
}

impl SubscriberHandle {
    pub fn new(id: SubscriberId) -> Self {
        Self {
            id,
            is_index: false,
        }
    }

    pub fn index(mut self) -> Self {
        self.is_index = true;
        self
    }
}

/// A registered price callback.
#[derive(Clone)]
pub struct PriceSubscriber {
    pub handle: SubscriberHandle,
    pub callback: Arc<dyn PriceCallback>,
}

impl std::fmt::Debug for PriceSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceSubscriber")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// A registered depth callback.
#[derive(Clone)]
pub struct DepthSubscriber {
    pub id: SubscriberId,
    pub callback: Arc<dyn DepthCallback>,
}

impl std::fmt::Debug for DepthSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepthSubscriber")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Invoke a price callback, converting a panic into `false`.
pub(crate) fn invoke_price(callback: &dyn PriceCallback, update: &PriceUpdate) -> bool {
    catch_unwind(AssertUnwindSafe(|| callback.on_price(update))).is_ok()
}

/// Invoke a depth callback, converting a panic into `false`.
pub(crate) fn invoke_depth(callback: &dyn DepthCallback, update: &DepthUpdate) -> bool {
    catch_unwind(AssertUnwindSafe(|| callback.on_depth(update))).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn update(kind: PriceKind) -> PriceUpdate {
        PriceUpdate {
            kind,
            value: 101.5,
            size: 10,
            timestamp: 1708123456789000000,
            extra: 0,
        }
    }

    #[test]
    fn test_closure_is_price_callback() {
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        let callback: Arc<dyn PriceCallback> = Arc::new(move |u: &PriceUpdate| {
            assert_eq!(u.kind, PriceKind::Last);
            counter.fetch_add(1, Ordering::Relaxed);
        });

        assert!(invoke_price(callback.as_ref(), &update(PriceKind::Last)));
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let callback = |_: &PriceUpdate| panic!("subscriber bug");
        assert!(!invoke_price(&callback, &update(PriceKind::Bid)));
    }

    #[test]
    fn test_panicking_depth_callback_is_contained() {
        let callback = |_: &DepthUpdate| panic!("depth subscriber bug");
        let update = DepthUpdate {
            level: 0,
            side: DepthSide::Ask,
            operation: DepthOperation::Update,
            price: 100.0,
            quantity: 5,
            timestamp: 0,
        };
        assert!(!invoke_depth(&callback, &update));
    }

    #[test]
    fn test_handle_builders() {
        let id = SubscriberId::new();
        let handle = SubscriberHandle::new(id);
        assert!(!handle.is_index);

        let index = handle.index();
        assert!(index.is_index);
        assert_eq!(index.id, id);
    }
}
