//! Market tick snapshot
//!
//! A `TickRecord` is produced by the upstream decoder for every quote update
//! and is read-only once handed to the fan-out engine. Depth is stored inline
//! as fixed arrays so a tick never allocates beyond its symbol.

use serde::{Deserialize, Serialize};

use crate::errors::TickError;
use crate::ids::{InstrumentToken, Symbol};

/// Number of depth levels carried per side.
pub const DEPTH_LEVELS: usize = 5;

/// One price level of market depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: i64,
    /// Number of orders resting at this level (0 when the feed omits it).
    pub orders: u32,
}

impl DepthLevel {
    pub fn new(price: f64, quantity: i64) -> Self {
        Self {
            price,
            quantity,
            orders: 0,
        }
    }

    /// A level is populated when it carries a positive quantity.
    pub fn is_populated(&self) -> bool {
        self.quantity > 0
    }
}

/// Five levels of bid and ask depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketDepth {
    pub bids: [DepthLevel; DEPTH_LEVELS],
    pub asks: [DepthLevel; DEPTH_LEVELS],
}

impl MarketDepth {
    /// Whether any level on either side is populated.
    pub fn has_depth(&self) -> bool {
        self.bids.iter().chain(self.asks.iter()).any(DepthLevel::is_populated)
    }
}

/// Snapshot of one instrument's market state for a single update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    pub symbol: Symbol,
    pub instrument_token: InstrumentToken,
    pub last_price: f64,
    pub last_trade_quantity: i64,
    /// Cumulative traded quantity for the day.
    pub volume: i64,
    pub bid_price: f64,
    pub bid_quantity: i64,
    pub ask_price: f64,
    pub ask_quantity: i64,
    pub total_buy_quantity: i64,
    pub total_sell_quantity: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Percent change against the previous close.
    pub change: f64,
    pub open_interest: i64,
    pub depth: MarketDepth,
    /// Exchange timestamp (Unix nanoseconds)
    pub exchange_timestamp: i64,
    /// Last trade time (Unix nanoseconds, 0 if unknown)
    pub last_trade_time: i64,
}

impl TickRecord {
    /// Create a tick carrying only symbol, price and volume fields.
    pub fn new(symbol: impl Into<Symbol>, last_price: f64, last_trade_quantity: i64, volume: i64) -> Self {
        Self {
            symbol: symbol.into(),
            last_price,
            last_trade_quantity,
            volume,
            ..Self::default()
        }
    }

    /// Whether this tick carries a tradeable price.
    pub fn has_price(&self) -> bool {
        self.last_price > 0.0
    }

    /// Whether this tick carries any populated depth level.
    pub fn has_depth(&self) -> bool {
        self.depth.has_depth()
    }

    /// Validate the tick as produced by a decoder.
    ///
    /// A zero last price is allowed (pre-open and illiquid instruments emit
    /// them); negative or non-finite values are not.
    pub fn validate(&self) -> Result<(), TickError> {
        if self.symbol.is_empty() {
            return Err(TickError::EmptySymbol);
        }

        let prices = [
            ("last_price", self.last_price),
            ("bid_price", self.bid_price),
            ("ask_price", self.ask_price),
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
        ];
        for (field, value) in prices {
            if !value.is_finite() {
                return Err(TickError::NonFinite { field });
            }
            if value < 0.0 {
                return Err(TickError::NegativePrice { field, value });
            }
        }

        let quantities = [
            ("last_trade_quantity", self.last_trade_quantity),
            ("volume", self.volume),
            ("bid_quantity", self.bid_quantity),
            ("ask_quantity", self.ask_quantity),
            ("open_interest", self.open_interest),
        ];
        for (field, value) in quantities {
            if value < 0 {
                return Err(TickError::NegativeQuantity { field, value });
            }
        }

        for (index, level) in self.depth.bids.iter().chain(self.depth.asks.iter()).enumerate() {
            if !level.price.is_finite() || level.price < 0.0 || level.quantity < 0 {
                return Err(TickError::InvalidDepthLevel {
                    index: index % DEPTH_LEVELS,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_tick() -> TickRecord {
        let mut tick = TickRecord::new("NIFTY", 22_450.5, 75, 1_200_000);
        tick.bid_price = 22_450.0;
        tick.bid_quantity = 150;
        tick.ask_price = 22_451.0;
        tick.ask_quantity = 300;
        tick
    }

    #[test]
    fn test_valid_tick() {
        assert!(sample_tick().validate().is_ok());
    }

    #[test]
    fn test_zero_price_is_valid() {
        let mut tick = sample_tick();
        tick.last_price = 0.0;
        assert!(tick.validate().is_ok());
        assert!(!tick.has_price());
    }

    #[test]
    fn test_empty_symbol_rejected() {
        let tick = TickRecord::new("", 10.0, 1, 1);
        assert_eq!(tick.validate(), Err(TickError::EmptySymbol));
    }

    #[test]
    fn test_non_finite_rejected() {
        let mut tick = sample_tick();
        tick.high = f64::NAN;
        assert_eq!(tick.validate(), Err(TickError::NonFinite { field: "high" }));
    }

    #[test]
    fn test_negative_volume_rejected() {
        let mut tick = sample_tick();
        tick.volume = -1;
        assert!(matches!(
            tick.validate(),
            Err(TickError::NegativeQuantity { field: "volume", .. })
        ));
    }

    #[test]
    fn test_depth_detection() {
        let mut tick = sample_tick();
        assert!(!tick.has_depth());

        tick.depth.asks[2] = DepthLevel::new(22_452.0, 50);
        assert!(tick.has_depth());
    }

    #[test]
    fn test_invalid_depth_level_reports_index() {
        let mut tick = sample_tick();
        tick.depth.asks[3] = DepthLevel::new(-1.0, 10);
        assert_eq!(tick.validate(), Err(TickError::InvalidDepthLevel { index: 3 }));
    }

    #[test]
    fn test_tick_serialization_roundtrip() {
        let tick = sample_tick();
        let json = serde_json::to_string(&tick).unwrap();
        let deserialized: TickRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(tick, deserialized);
    }

    proptest! {
        #[test]
        fn prop_non_negative_finite_ticks_validate(
            price in 0.0f64..1_000_000.0,
            quantity in 0i64..1_000_000,
            volume in 0i64..i64::MAX / 2,
        ) {
            let tick = TickRecord::new("RELIANCE", price, quantity, volume);
            prop_assert!(tick.validate().is_ok());
            prop_assert_eq!(tick.has_price(), price > 0.0);
        }

        #[test]
        fn prop_negative_price_always_rejected(price in -1_000_000.0f64..-0.0001) {
            let tick = TickRecord::new("RELIANCE", price, 1, 1);
            let rejected = matches!(
                tick.validate(),
                Err(TickError::NegativePrice { field: "last_price", .. })
            );
            prop_assert!(rejected);
        }
    }
}
