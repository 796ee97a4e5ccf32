//! Periodic health monitoring
//!
//! Samples queue backlog, callback success rate, processing efficiency,
//! resident memory and per-shard backpressure, classifies the overall status
//! and raises one typed alert per breached condition. Alerts are broadcast so
//! collaborators can route each kind differently.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::backpressure::BackpressureLevel;
use crate::config::HealthThresholds;
use crate::metrics::FanoutMetrics;
use crate::shard::ShardStatus;
use crate::shutdown::ShutdownSignal;

const PAGE_SIZE: u64 = 4096;

/// Overall health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

/// One breached health condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "alert")]
pub enum HealthAlert {
    /// Ticks admitted but not yet processed.
    QueueBacklog { depth: u64, level: AlertLevel },
    CallbackFailures {
        success_rate: f64,
        errors: u64,
        level: AlertLevel,
    },
    /// Processed/queued ratio over the last interval.
    LowEfficiency { efficiency: f64 },
    /// A shard entered critical backpressure or worse since the last sample.
    BackpressureEscalation {
        shard: usize,
        level: BackpressureLevel,
        critical_events: u64,
    },
    MemoryGrowth {
        previous_bytes: u64,
        current_bytes: u64,
    },
    /// A shard worker stopped after an unexpected panic.
    ShardFailure { shard: usize },
}

impl HealthAlert {
    pub fn level(&self) -> AlertLevel {
        match self {
            Self::QueueBacklog { level, .. } | Self::CallbackFailures { level, .. } => *level,
            Self::LowEfficiency { .. } | Self::MemoryGrowth { .. } => AlertLevel::Warning,
            Self::BackpressureEscalation { level, .. } => {
                if *level >= BackpressureLevel::Emergency {
                    AlertLevel::Critical
                } else {
                    AlertLevel::Warning
                }
            }
            Self::ShardFailure { .. } => AlertLevel::Critical,
        }
    }

    /// Name of the metric this alert is about.
    pub fn metric(&self) -> &'static str {
        match self {
            Self::QueueBacklog { .. } => "queue_depth",
            Self::CallbackFailures { .. } => "callback_success_rate",
            Self::LowEfficiency { .. } => "processing_efficiency",
            Self::BackpressureEscalation { .. } => "backpressure_level",
            Self::MemoryGrowth { .. } => "resident_memory_bytes",
            Self::ShardFailure { .. } => "shard_failures",
        }
    }
}

impl fmt::Display for HealthAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueBacklog { depth, .. } => write!(f, "queue backlog of {depth} ticks"),
            Self::CallbackFailures {
                success_rate,
                errors,
                ..
            } => write!(
                f,
                "callback success rate {:.2}% ({errors} errors)",
                success_rate * 100.0
            ),
            Self::LowEfficiency { efficiency } => {
                write!(f, "processing efficiency {:.1}%", efficiency * 100.0)
            }
            Self::BackpressureEscalation {
                shard,
                level,
                critical_events,
            } => write!(
                f,
                "shard {shard} backpressure {} ({critical_events} critical events)",
                level.label()
            ),
            Self::MemoryGrowth {
                previous_bytes,
                current_bytes,
            } => write!(
                f,
                "resident memory grew from {} MiB to {} MiB",
                previous_bytes / (1024 * 1024),
                current_bytes / (1024 * 1024)
            ),
            Self::ShardFailure { shard } => write!(f, "shard {shard} failed and stopped consuming"),
        }
    }
}

/// Result of one health sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub sampled_at: DateTime<Utc>,
    pub queue_depth: u64,
    pub callback_success_rate: f64,
    /// None when nothing was queued during the interval.
    pub processing_efficiency: Option<f64>,
    /// None where process memory cannot be read.
    pub resident_memory_bytes: Option<u64>,
    pub alerts: Vec<HealthAlert>,
}

/// Resident set size of this process, from `/proc/self/statm`.
pub fn read_resident_memory() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * PAGE_SIZE)
}

#[derive(Debug, Default)]
struct PreviousSample {
    queued: u64,
    processed: u64,
    resident: Option<u64>,
    critical_events: HashMap<usize, u64>,
}

pub struct HealthMonitor {
    metrics: Arc<FanoutMetrics>,
    shards: Vec<Arc<ShardStatus>>,
    thresholds: HealthThresholds,
    interval: Duration,
    alerts: broadcast::Sender<HealthAlert>,
    shutdown: ShutdownSignal,
    memory_reader: fn() -> Option<u64>,
    previous: Mutex<Option<PreviousSample>>,
}

impl HealthMonitor {
    pub fn new(
        metrics: Arc<FanoutMetrics>,
        shards: Vec<Arc<ShardStatus>>,
        thresholds: HealthThresholds,
        interval: Duration,
        alerts: broadcast::Sender<HealthAlert>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            metrics,
            shards,
            thresholds,
            interval,
            alerts,
            shutdown,
            memory_reader: read_resident_memory,
            previous: Mutex::new(None),
        }
    }

    /// Replace the resident-memory source.
    pub fn with_memory_reader(mut self, reader: fn() -> Option<u64>) -> Self {
        self.memory_reader = reader;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Take a snapshot and classify it. Rates are relative to the previous
    /// sample.
    pub fn sample(&self) -> HealthReport {
        let queued = self.metrics.ticks_queued.load(std::sync::atomic::Ordering::Relaxed);
        let processed = self
            .metrics
            .ticks_processed
            .load(std::sync::atomic::Ordering::Relaxed);
        let queue_depth = queued.saturating_sub(processed);
        let success_rate = self.metrics.callback_success_rate();
        let errors = self
            .metrics
            .callback_errors
            .load(std::sync::atomic::Ordering::Relaxed);
        let resident = (self.memory_reader)();

        let mut previous_slot = match self.previous.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let previous = previous_slot.take().unwrap_or_default();
        let mut alerts = Vec::new();

        let t = &self.thresholds;
        if queue_depth > t.critical_queue_depth {
            alerts.push(HealthAlert::QueueBacklog {
                depth: queue_depth,
                level: AlertLevel::Critical,
            });
        } else if queue_depth > t.warning_queue_depth {
            alerts.push(HealthAlert::QueueBacklog {
                depth: queue_depth,
                level: AlertLevel::Warning,
            });
        }

        if success_rate < t.critical_success_rate {
            alerts.push(HealthAlert::CallbackFailures {
                success_rate,
                errors,
                level: AlertLevel::Critical,
            });
        } else if success_rate < t.warning_success_rate {
            alerts.push(HealthAlert::CallbackFailures {
                success_rate,
                errors,
                level: AlertLevel::Warning,
            });
        }

        let queued_delta = queued.saturating_sub(previous.queued);
        let processed_delta = processed.saturating_sub(previous.processed);
        let efficiency = if queued_delta == 0 {
            None
        } else {
            Some(processed_delta as f64 / queued_delta as f64)
        };
        if let Some(efficiency) = efficiency {
            if efficiency < t.min_processing_efficiency {
                alerts.push(HealthAlert::LowEfficiency { efficiency });
            }
        }

        if let (Some(before), Some(now)) = (previous.resident, resident) {
            if now.saturating_sub(before) > t.max_memory_growth_bytes {
                alerts.push(HealthAlert::MemoryGrowth {
                    previous_bytes: before,
                    current_bytes: now,
                });
            }
        }

        let mut critical_events = HashMap::with_capacity(self.shards.len());
        for shard in &self.shards {
            let events = shard.backpressure().critical_events();
            let seen = previous.critical_events.get(&shard.index()).copied().unwrap_or(0);
            if events > seen {
                alerts.push(HealthAlert::BackpressureEscalation {
                    shard: shard.index(),
                    level: shard.backpressure().current_level(),
                    critical_events: events,
                });
            }
            critical_events.insert(shard.index(), events);

            if shard.is_failed() {
                alerts.push(HealthAlert::ShardFailure {
                    shard: shard.index(),
                });
            }
        }

        *previous_slot = Some(PreviousSample {
            queued,
            processed,
            resident,
            critical_events,
        });

        let status = classify(&alerts);
        HealthReport {
            status,
            sampled_at: Utc::now(),
            queue_depth,
            callback_success_rate: success_rate,
            processing_efficiency: efficiency,
            resident_memory_bytes: resident,
            alerts,
        }
    }

    /// Log a report and broadcast each of its alerts.
    pub fn publish(&self, report: &HealthReport) {
        info!(
            status = ?report.status,
            queue_depth = report.queue_depth,
            success_rate = report.callback_success_rate,
            efficiency = ?report.processing_efficiency,
            resident_bytes = ?report.resident_memory_bytes,
            alerts = report.alerts.len(),
            "Health check"
        );

        for alert in &report.alerts {
            match alert.level() {
                AlertLevel::Critical => error!(metric = alert.metric(), "{}", alert),
                AlertLevel::Warning => warn!(metric = alert.metric(), "{}", alert),
                AlertLevel::Info => info!(metric = alert.metric(), "{}", alert),
            }
            // No subscribers is fine; alerts are also logged above.
            let _ = self.alerts.send(alert.clone());
        }
    }

    /// Sample every interval until the shutdown signal fires.
    pub async fn run(&self) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(interval_ms = self.interval.as_millis() as u64, "Health monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sample();
                    self.publish(&report);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Health monitor stopped");
    }
}

/// Overall status from the worst alert.
fn classify(alerts: &[HealthAlert]) -> HealthStatus {
    match alerts.iter().map(HealthAlert::level).max() {
        Some(AlertLevel::Critical) => HealthStatus::Critical,
        Some(AlertLevel::Warning) => HealthStatus::Warning,
        Some(AlertLevel::Info) | None => HealthStatus::Healthy,
    }
}
