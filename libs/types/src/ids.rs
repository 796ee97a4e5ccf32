//! Identifier types for instruments and subscribers
//!
//! `Symbol` is the routing key for every tick. It is reference-counted so the
//! registry, the last-value cache and the shard tables can share one
//! allocation per instrument.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Trading symbol of an instrument (e.g. "NIFTY", "RELIANCE", "GIFT NIFTY")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Symbol(Arc<str>);

impl Symbol {
    pub fn new(symbol: impl AsRef<str>) -> Self {
        Self(Arc::from(symbol.as_ref()))
    }

    /// Get the symbol string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for Symbol {
    fn default() -> Self {
        Self::new("")
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl From<Symbol> for String {
    fn from(s: Symbol) -> Self {
        s.0.to_string()
    }
}

impl Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Exchange instrument token as assigned by the upstream broker feed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentToken(pub u32);

impl fmt::Display for InstrumentToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a registered subscriber
///
/// Uses UUID v7 so subscribers sort in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    /// Create a new SubscriberId with current timestamp
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_symbol_borrow_lookup() {
        let mut map = HashMap::new();
        map.insert(Symbol::new("NIFTY"), 1);
        assert_eq!(map.get("NIFTY"), Some(&1));
    }

    #[test]
    fn test_symbol_serialization() {
        let symbol = Symbol::new("GIFT NIFTY");
        let json = serde_json::to_string(&symbol).unwrap();
        assert_eq!(json, "\"GIFT NIFTY\"");
        let deserialized: Symbol = serde_json::from_str(&json).unwrap();
        assert_eq!(symbol, deserialized);
    }

    #[test]
    fn test_symbol_clone_shares_allocation() {
        let a = Symbol::new("RELIANCE");
        let b = a.clone();
        assert!(std::ptr::eq(a.as_str(), b.as_str()));
    }

    #[test]
    fn test_subscriber_id_unique() {
        let id1 = SubscriberId::new();
        let id2 = SubscriberId::new();
        assert_ne!(id1, id2, "SubscriberIds should be unique");
    }

    #[test]
    fn test_instrument_token_display() {
        assert_eq!(InstrumentToken(291849).to_string(), "291849");
    }
}
