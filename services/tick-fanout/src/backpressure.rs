//! Tiered backpressure for shard queues
//!
//! Maps a shard's queue fill ratio to a level and decides, per tick, whether
//! to admit it. Producers never block: a tick that is not admitted is simply
//! dropped and counted.
//!
//! | Level     | Fill      | Admits                                   |
//! |-----------|-----------|------------------------------------------|
//! | Normal    | < 60%     | everything                               |
//! | Warning   | < 80%     | everything except low-priority symbols   |
//! | Critical  | < 90%     | essential; a bounded share of the rest   |
//! | Emergency | < 100%    | essential only                           |
//! | Maximum   | >= 100%   | nothing                                  |
//!
//! Levels are re-derived on every call with no hysteresis.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::BackpressureThresholds;

/// Backpressure level of one shard queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BackpressureLevel {
    Normal = 0,
    Warning = 1,
    Critical = 2,
    Emergency = 3,
    Maximum = 4,
}

impl BackpressureLevel {
    /// Classify a queue depth against the configured cut points.
    pub fn classify(queue_depth: usize, capacity: usize, thresholds: &BackpressureThresholds) -> Self {
        let fill = if capacity == 0 {
            1.0
        } else {
            queue_depth as f64 / capacity as f64
        };

        if fill >= thresholds.maximum {
            Self::Maximum
        } else if fill >= thresholds.emergency {
            Self::Emergency
        } else if fill >= thresholds.critical {
            Self::Critical
        } else if fill >= thresholds.warning {
            Self::Warning
        } else {
            Self::Normal
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Normal,
            1 => Self::Warning,
            2 => Self::Critical,
            3 => Self::Emergency,
            _ => Self::Maximum,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Emergency => "emergency",
            Self::Maximum => "maximum",
        }
    }
}

/// Admission priority of a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolPriority {
    /// Major indices, admitted at every level below maximum.
    Essential,
    Standard,
    /// Empty, test and demo symbols, the first to be shed.
    Low,
}

/// Classifies symbols into admission priorities.
#[derive(Debug, Clone, Default)]
pub struct SymbolPolicy {
    essential: HashSet<String>,
}

impl SymbolPolicy {
    pub fn new<I, S>(essential: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            essential: essential
                .into_iter()
                .map(|s| s.as_ref().trim().to_ascii_uppercase())
                .collect(),
        }
    }

    pub fn classify(&self, symbol: &str) -> SymbolPriority {
        let trimmed = symbol.trim();
        if trimmed.is_empty() {
            return SymbolPriority::Low;
        }
        let upper = trimmed.to_ascii_uppercase();
        if self.essential.contains(&upper) {
            SymbolPriority::Essential
        } else if upper.contains("TEST") || upper.contains("DEMO") {
            SymbolPriority::Low
        } else {
            SymbolPriority::Standard
        }
    }
}

/// Why a tick was shed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    LowPriority,
    CriticalShed,
    NonEssential,
    Saturated,
}

/// Decision for a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub admit: bool,
    pub level: BackpressureLevel,
    pub reason: Option<DropReason>,
}

impl Admission {
    fn admit(level: BackpressureLevel) -> Self {
        Self {
            admit: true,
            level,
            reason: None,
        }
    }

    fn reject(level: BackpressureLevel, reason: DropReason) -> Self {
        Self {
            admit: false,
            level,
            reason: Some(reason),
        }
    }
}

/// Per-shard backpressure controller.
pub struct BackpressureController {
    shard: usize,
    capacity: usize,
    thresholds: BackpressureThresholds,
    /// Non-essential ticks shed out of every ten at the critical level.
    drop_per_ten: u64,
    policy: SymbolPolicy,
    last_level: AtomicU8,
    shed_sequence: AtomicU64,
    warning_events: AtomicU64,
    critical_events: AtomicU64,
    dropped: AtomicU64,
}

impl BackpressureController {
    pub fn new(
        shard: usize,
        capacity: usize,
        thresholds: BackpressureThresholds,
        drop_per_ten: u8,
        policy: SymbolPolicy,
    ) -> Self {
        Self {
            shard,
            capacity,
            thresholds,
            drop_per_ten: u64::from(drop_per_ten.min(10)),
            policy,
            last_level: AtomicU8::new(BackpressureLevel::Normal as u8),
            shed_sequence: AtomicU64::new(0),
            warning_events: AtomicU64::new(0),
            critical_events: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Level for a queue depth, without side effects.
    pub fn level_for(&self, queue_depth: usize) -> BackpressureLevel {
        BackpressureLevel::classify(queue_depth, self.capacity, &self.thresholds)
    }

    /// Decide whether to admit a tick for `symbol` at the given queue depth.
    pub fn evaluate(&self, queue_depth: usize, symbol: &str) -> Admission {
        let level = self.observe(queue_depth);
        let priority = self.policy.classify(symbol);

        let admission = match (level, priority) {
            (BackpressureLevel::Normal, _) => Admission::admit(level),
            (BackpressureLevel::Warning, SymbolPriority::Low) => {
                Admission::reject(level, DropReason::LowPriority)
            }
            (BackpressureLevel::Warning, _) => Admission::admit(level),
            (BackpressureLevel::Critical, SymbolPriority::Essential) => Admission::admit(level),
            (BackpressureLevel::Critical, SymbolPriority::Low) => {
                Admission::reject(level, DropReason::LowPriority)
            }
            (BackpressureLevel::Critical, SymbolPriority::Standard) => {
                // Shed a fixed share of every ten standard ticks.
                let slot = self.shed_sequence.fetch_add(1, Ordering::Relaxed) % 10;
                if slot < self.drop_per_ten {
                    Admission::reject(level, DropReason::CriticalShed)
                } else {
                    Admission::admit(level)
                }
            }
            (BackpressureLevel::Emergency, SymbolPriority::Essential) => Admission::admit(level),
            (BackpressureLevel::Emergency, _) => Admission::reject(level, DropReason::NonEssential),
            (BackpressureLevel::Maximum, _) => Admission::reject(level, DropReason::Saturated),
        };

        if !admission.admit {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        admission
    }

    /// Track the level for a queue depth, logging and counting transitions.
    pub fn observe(&self, queue_depth: usize) -> BackpressureLevel {
        let level = self.level_for(queue_depth);
        let previous = BackpressureLevel::from_u8(self.last_level.swap(level as u8, Ordering::Relaxed));
        if previous != level {
            self.on_transition(previous, level, queue_depth);
        }
        level
    }

    fn on_transition(&self, from: BackpressureLevel, to: BackpressureLevel, queue_depth: usize) {
        match to {
            BackpressureLevel::Warning => {
                self.warning_events.fetch_add(1, Ordering::Relaxed);
            }
            BackpressureLevel::Critical
            | BackpressureLevel::Emergency
            | BackpressureLevel::Maximum => {
                self.critical_events.fetch_add(1, Ordering::Relaxed);
            }
            BackpressureLevel::Normal => {}
        }

        if to > from {
            warn!(
                shard = self.shard,
                from = from.label(),
                to = to.label(),
                queue_depth,
                capacity = self.capacity,
                "Backpressure escalated"
            );
        } else {
            info!(
                shard = self.shard,
                from = from.label(),
                to = to.label(),
                queue_depth,
                capacity = self.capacity,
                "Backpressure eased"
            );
        }
    }

    /// Most recently observed level.
    pub fn current_level(&self) -> BackpressureLevel {
        BackpressureLevel::from_u8(self.last_level.load(Ordering::Relaxed))
    }

    /// Transitions into the warning level since creation.
    pub fn warning_events(&self) -> u64 {
        self.warning_events.load(Ordering::Relaxed)
    }

    /// Transitions into critical or worse since creation.
    pub fn critical_events(&self) -> u64 {
        self.critical_events.load(Ordering::Relaxed)
    }

    /// Ticks rejected by this controller.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(capacity: usize) -> BackpressureController {
        BackpressureController::new(
            0,
            capacity,
            BackpressureThresholds::default(),
            3,
            SymbolPolicy::new(["NIFTY", "BANKNIFTY"]),
        )
    }

    #[test]
    fn test_level_cut_points() {
        let bp = controller(100);
        assert_eq!(bp.level_for(0), BackpressureLevel::Normal);
        assert_eq!(bp.level_for(59), BackpressureLevel::Normal);
        assert_eq!(bp.level_for(60), BackpressureLevel::Warning);
        assert_eq!(bp.level_for(80), BackpressureLevel::Critical);
        assert_eq!(bp.level_for(90), BackpressureLevel::Emergency);
        assert_eq!(bp.level_for(99), BackpressureLevel::Emergency);
        assert_eq!(bp.level_for(100), BackpressureLevel::Maximum);
        assert_eq!(bp.level_for(150), BackpressureLevel::Maximum);
    }

    #[test]
    fn test_symbol_classification() {
        let policy = SymbolPolicy::new(["NIFTY", "gift nifty"]);
        assert_eq!(policy.classify("NIFTY"), SymbolPriority::Essential);
        assert_eq!(policy.classify("GIFT NIFTY"), SymbolPriority::Essential);
        assert_eq!(policy.classify(""), SymbolPriority::Low);
        assert_eq!(policy.classify("TEST-SYM"), SymbolPriority::Low);
        assert_eq!(policy.classify("demo1"), SymbolPriority::Low);
        assert_eq!(policy.classify("RELIANCE"), SymbolPriority::Standard);
    }

    #[test]
    fn test_normal_admits_everything() {
        let bp = controller(100);
        assert!(bp.evaluate(10, "").admit);
        assert!(bp.evaluate(10, "TESTSYM").admit);
        assert!(bp.evaluate(10, "RELIANCE").admit);
    }

    #[test]
    fn test_warning_drops_low_priority_only() {
        let bp = controller(100);
        let low = bp.evaluate(70, "DEMO");
        assert!(!low.admit);
        assert_eq!(low.reason, Some(DropReason::LowPriority));
        assert!(bp.evaluate(70, "RELIANCE").admit);
        assert!(bp.evaluate(70, "NIFTY").admit);
    }

    #[test]
    fn test_critical_sheds_bounded_share() {
        let bp = controller(100);
        let admitted = (0..100).filter(|_| bp.evaluate(85, "RELIANCE").admit).count();
        assert_eq!(admitted, 70);
        assert!((0..100).all(|_| bp.evaluate(85, "NIFTY").admit));
    }

    #[test]
    fn test_emergency_admits_essential_only() {
        let bp = controller(100);
        assert!(bp.evaluate(95, "BANKNIFTY").admit);
        let standard = bp.evaluate(95, "RELIANCE");
        assert!(!standard.admit);
        assert_eq!(standard.reason, Some(DropReason::NonEssential));
    }

    #[test]
    fn test_maximum_drops_everything() {
        let bp = controller(100);
        let essential = bp.evaluate(100, "NIFTY");
        assert!(!essential.admit);
        assert_eq!(essential.reason, Some(DropReason::Saturated));
    }

    #[test]
    fn test_transitions_counted_once() {
        let bp = controller(100);
        for _ in 0..10 {
            bp.evaluate(65, "RELIANCE");
        }
        assert_eq!(bp.warning_events(), 1);
        assert_eq!(bp.current_level(), BackpressureLevel::Warning);

        bp.evaluate(85, "RELIANCE");
        bp.evaluate(95, "RELIANCE");
        bp.evaluate(10, "RELIANCE");
        bp.evaluate(65, "RELIANCE");
        assert_eq!(bp.critical_events(), 2);
        assert_eq!(bp.warning_events(), 2);
        assert_eq!(bp.current_level(), BackpressureLevel::Warning);
    }

    #[test]
    fn test_dropped_counter() {
        let bp = controller(100);
        bp.evaluate(100, "RELIANCE");
        bp.evaluate(100, "NIFTY");
        bp.evaluate(10, "RELIANCE");
        assert_eq!(bp.dropped(), 2);
    }

    #[test]
    fn test_zero_drop_share_admits_all_standard_at_critical() {
        let bp = BackpressureController::new(
            0,
            100,
            BackpressureThresholds::default(),
            0,
            SymbolPolicy::default(),
        );
        assert!((0..20).all(|_| bp.evaluate(85, "RELIANCE").admit));
    }
}
