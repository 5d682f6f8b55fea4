//! Metric emission helpers.
//!
//! Everything goes through the `metrics` facade. The library never installs
//! a recorder; without one every call here is a no-op.
//!
//! Emitted series:
//! - `sla.breaches.live_detected{severity}` (counter)
//! - `sla.breach.live_detection.duration` (histogram, seconds)
//! - `sla.monitoring.active_runs` (gauge)
//! - `sla.approaching.count` (gauge)
//! - `cache.hit{tier}`, `cache.miss{tier}`, `cache.errors{op}` (counters)
//! - `alerts.sent`, `alerts.failed{reason}` (counters)
//! - `runs.started{frequency}`, `runs.completed{status}`, `runs.duplicate{kind}` (counters)

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::model::{Frequency, RunStatus, Severity};

/// Cache tier label for hit/miss counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// Per (calculator, tenant) recent-run list.
    Recent,
    /// Precomputed status responses.
    Response,
    /// Bloom existence pre-filter.
    Existence,
    /// Running-set membership.
    Running,
}

impl CacheTier {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Recent => "recent",
            Self::Response => "response",
            Self::Existence => "existence",
            Self::Running => "running",
        }
    }
}

/// Reason label for failed alert deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertFailure {
    Exhausted,
    CircuitOpen,
    Permanent,
}

impl AlertFailure {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::CircuitOpen => "circuit_open",
            Self::Permanent => "permanent",
        }
    }
}

pub fn record_live_breach(severity: Severity) {
    counter!("sla.breaches.live_detected", "severity" => severity.as_str()).increment(1);
}

/// Wall time of one detection tick.
pub fn record_detection_duration(duration: Duration) {
    histogram!("sla.breach.live_detection.duration").record(duration.as_secs_f64());
}

#[allow(clippy::cast_precision_loss)]
pub fn set_active_runs(count: u64) {
    gauge!("sla.monitoring.active_runs").set(count as f64);
}

#[allow(clippy::cast_precision_loss)]
pub fn set_approaching(count: usize) {
    gauge!("sla.approaching.count").set(count as f64);
}

pub fn record_cache_hit(tier: CacheTier) {
    counter!("cache.hit", "tier" => tier.as_str()).increment(1);
}

pub fn record_cache_miss(tier: CacheTier) {
    counter!("cache.miss", "tier" => tier.as_str()).increment(1);
}

pub fn record_cache_error(op: &'static str) {
    counter!("cache.errors", "op" => op).increment(1);
}

pub fn record_alert_sent() {
    counter!("alerts.sent").increment(1);
}

pub fn record_alert_failed(reason: AlertFailure) {
    counter!("alerts.failed", "reason" => reason.as_str()).increment(1);
}

pub fn record_run_started(frequency: Frequency) {
    counter!("runs.started", "frequency" => frequency.as_str()).increment(1);
}

pub fn record_run_completed(status: RunStatus) {
    counter!("runs.completed", "status" => status.as_str()).increment(1);
}

/// `kind` is `"start"` or `"breach"`.
pub fn record_duplicate(kind: &'static str) {
    counter!("runs.duplicate", "kind" => kind).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_stable() {
        assert_eq!(CacheTier::Response.as_str(), "response");
        assert_eq!(AlertFailure::CircuitOpen.as_str(), "circuit_open");
    }

    #[test]
    fn emitting_without_recorder_is_a_noop() {
        record_live_breach(Severity::High);
        record_cache_error("zadd");
        set_active_runs(3);
        record_detection_duration(Duration::from_millis(12));
    }
}
