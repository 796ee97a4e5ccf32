//! Tick Fan-out Service
//!
//! Ingests already-parsed market ticks from an upstream decoder and fans each
//! tick out to independently registered subscriber callbacks:
//! - Stable symbol-to-shard routing, one worker thread per shard
//! - Tiered backpressure that sheds non-essential ticks under load
//! - Volume-delta gated level-1 fan-out and depth fan-out
//! - Last-value cache with replay-once for late subscribers
//! - Copy-on-write subscription registry
//! - Periodic health monitoring with typed alerts
//!
//! Per symbol, ticks reach callbacks in arrival order. There is no ordering
//! across symbols.
//!
//! # Architecture
//!
//! ```text
//!   Upstream decoder (any number of producer threads)
//!          │ queue_tick(symbol, tick)
//!     ┌────▼─────┐
//!     │ Facade   │  ← fnv1a(symbol) % N, backpressure near capacity
//!     └────┬─────┘
//!   ┌──────┼───────────┬───────────┐
//! ┌─▼───┐┌─▼───┐    ┌──▼──┐    ┌──▼──┐
//! │Shard││Shard│ .. │Shard│    │Shard│  ← bounded queue + worker thread
//! └─┬───┘└─┬───┘    └──┬──┘    └──┬──┘
//!   └──────┴─────┬─────┴──────────┘
//!                │ per tick
//!   ┌────────────▼─────────────┐      ┌──────────────┐
//!   │ Cache → Registry lookup  │ ←──  │ Subscription │ ← update_subscriptions
//!   │ → volume delta → fire?   │      │ map (ArcSwap)│
//!   └────────────┬─────────────┘      └──────────────┘
//!        ┌───────┴────────┐
//!   ┌────▼─────┐    ┌─────▼────┐
//!   │L1 fan-out│    │  Depth   │  ← subscriber callbacks
//!   └──────────┘    └──────────┘
//! ```

pub mod backpressure;
pub mod cache;
pub mod callback;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod shard;
pub mod shutdown;
pub mod worker;

pub use callback::{
    DepthCallback, DepthSide, DepthUpdate, PriceCallback, PriceKind, PriceUpdate,
    SubscriberHandle,
};
pub use config::FanoutConfig;
pub use engine::{FanoutEngine, FanoutEngineBuilder};
pub use error::EngineError;
pub use registry::SubscriptionSet;

// Service version
pub const SERVICE_VERSION: &str = "0.1.0";
