//! Engine configuration
//!
//! Every tunable of the fan-out engine lives here: shard layout, backpressure
//! cut points, cache bounds, health thresholds and shutdown timing. Values
//! load from JSON with per-field defaults, so a config file only needs the
//! keys it overrides. Durations are expressed in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors loading or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Queue fill ratios at which each backpressure level begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureThresholds {
    pub warning: f64,
    pub critical: f64,
    pub emergency: f64,
    pub maximum: f64,
}

impl Default for BackpressureThresholds {
    fn default() -> Self {
        Self {
            warning: 0.60,
            critical: 0.80,
            emergency: 0.90,
            maximum: 1.00,
        }
    }
}

/// Thresholds the health monitor classifies samples against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    /// Callback success rate below this is a warning.
    pub warning_success_rate: f64,
    /// Callback success rate below this is critical.
    pub critical_success_rate: f64,
    /// Outstanding ticks (queued minus processed) above this is a warning.
    pub warning_queue_depth: u64,
    /// Outstanding ticks above this is critical.
    pub critical_queue_depth: u64,
    /// Processed/queued ratio over an interval below this is a warning.
    pub min_processing_efficiency: f64,
    /// Resident memory growth between samples above this is a warning.
    pub max_memory_growth_bytes: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            warning_success_rate: 0.99,
            critical_success_rate: 0.95,
            warning_queue_depth: 5_000,
            critical_queue_depth: 8_000,
            min_processing_efficiency: 0.90,
            max_memory_growth_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Configuration for the fan-out engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Number of shards (one worker thread each).
    pub shard_count: usize,
    /// Bounded queue capacity per shard.
    pub shard_capacity: usize,
    /// Backpressure is consulted once a queue is within this many slots of capacity.
    pub backpressure_headroom: usize,
    pub backpressure: BackpressureThresholds,
    /// Non-essential ticks dropped out of every ten at the critical level.
    pub critical_drop_per_ten: u8,
    /// Symbols admitted at every level below maximum.
    pub essential_symbols: Vec<String>,
    /// Last-value cache entry cap.
    pub cache_capacity: usize,
    /// Entry count the cache is trimmed back to on overflow.
    pub cache_trim_to: usize,
    /// How long an unresolved instrument is retried before it is skipped.
    pub unresolved_grace_ms: u64,
    /// How often pending instruments are re-checked inside their grace window.
    pub unresolved_retry_ms: u64,
    pub health_interval_ms: u64,
    pub health: HealthThresholds,
    /// Bounded wait for shards to drain on shutdown.
    pub shutdown_timeout_ms: u64,
    /// How often an idle worker wakes to check for cancellation.
    pub idle_poll_ms: u64,
    /// Buffered ticks per tick-stream observer before it lags.
    pub observer_capacity: usize,
    /// Latency samples kept for processing-time statistics.
    pub latency_window: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            shard_count: 4,
            shard_capacity: 2_500,
            backpressure_headroom: 1_000,
            backpressure: BackpressureThresholds::default(),
            critical_drop_per_ten: 3,
            essential_symbols: [
                "NIFTY",
                "BANKNIFTY",
                "FINNIFTY",
                "MIDCPNIFTY",
                "SENSEX",
                "GIFT NIFTY",
                "INDIA VIX",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            cache_capacity: 1_000,
            cache_trim_to: 900,
            unresolved_grace_ms: 30_000,
            unresolved_retry_ms: 1_000,
            health_interval_ms: 30_000,
            health: HealthThresholds::default(),
            shutdown_timeout_ms: 5_000,
            idle_poll_ms: 100,
            observer_capacity: 4_096,
            latency_window: 1_000,
        }
    }
}

impl FanoutConfig {
    /// Parse a JSON document; missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_count == 0 {
            return Err(invalid("shard_count", "must be at least 1"));
        }
        if self.shard_capacity == 0 {
            return Err(invalid("shard_capacity", "must be at least 1"));
        }
        let bp = &self.backpressure;
        let cut_points = [bp.warning, bp.critical, bp.emergency, bp.maximum];
        if cut_points.iter().any(|t| !t.is_finite() || *t <= 0.0) {
            return Err(invalid("backpressure", "thresholds must be positive"));
        }
        if cut_points.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid("backpressure", "thresholds must be strictly increasing"));
        }
        if self.critical_drop_per_ten > 10 {
            return Err(invalid("critical_drop_per_ten", "must be between 0 and 10"));
        }
        if self.cache_capacity == 0 {
            return Err(invalid("cache_capacity", "must be at least 1"));
        }
        if self.cache_trim_to >= self.cache_capacity {
            return Err(invalid(
                "cache_trim_to",
                format!("must be below cache_capacity ({})", self.cache_capacity),
            ));
        }
        if self.unresolved_retry_ms == 0 {
            return Err(invalid("unresolved_retry_ms", "must be positive"));
        }
        if self.health_interval_ms == 0 {
            return Err(invalid("health_interval_ms", "must be positive"));
        }
        if self.idle_poll_ms == 0 {
            return Err(invalid("idle_poll_ms", "must be positive"));
        }
        if self.observer_capacity == 0 {
            return Err(invalid("observer_capacity", "must be at least 1"));
        }
        if self.latency_window == 0 {
            return Err(invalid("latency_window", "must be at least 1"));
        }
        let health = &self.health;
        if health.critical_success_rate > health.warning_success_rate {
            return Err(invalid(
                "health.critical_success_rate",
                "must not exceed warning_success_rate",
            ));
        }
        if health.critical_queue_depth < health.warning_queue_depth {
            return Err(invalid(
                "health.critical_queue_depth",
                "must not be below warning_queue_depth",
            ));
        }
        Ok(())
    }

    pub fn unresolved_grace(&self) -> Duration {
        Duration::from_millis(self.unresolved_grace_ms)
    }

    pub fn unresolved_retry(&self) -> Duration {
        Duration::from_millis(self.unresolved_retry_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
