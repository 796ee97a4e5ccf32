//! Types library for the market tick feed
//!
//! This library provides the data model shared between the upstream decoder,
//! the tick fan-out engine and its subscribers.
//!
//! # Modules
//! - `ids`: Identifiers (Symbol, InstrumentToken, SubscriberId)
//! - `tick`: Tick snapshot and market depth
//! - `session`: Trading session calendars
//! - `errors`: Error taxonomy

pub mod ids;
pub mod tick;
pub mod session;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::tick::*;
    pub use crate::session::*;
    pub use crate::errors::*;
}
