//! Heartbeats and a watchdog over the background loops.
//!
//! Every periodic task records a heartbeat on each iteration. The watchdog
//! task compares heartbeat ages with per-component thresholds and logs the
//! components that look stalled.
//!
//! ```text
//! BackgroundHandles
//!   ├── detection tick      ──► heartbeats.record(Component::Detection)
//!   ├── early-warning tick  ──► heartbeats.record(Component::EarlyWarning)
//!   ├── reconciliation      ──► heartbeats.record(Component::Reconciliation)
//!   ├── index refresh       ──► heartbeats.record(Component::IndexRefresh)
//!   └── watchdog            ──► heartbeats.check_health()
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;

/// Monitored background loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Detection,
    EarlyWarning,
    Reconciliation,
    IndexRefresh,
}

impl Component {
    pub const ALL: [Self; 4] = [
        Self::Detection,
        Self::EarlyWarning,
        Self::Reconciliation,
        Self::IndexRefresh,
    ];

    const fn slot(self) -> usize {
        match self {
            Self::Detection => 0,
            Self::EarlyWarning => 1,
            Self::Reconciliation => 2,
            Self::IndexRefresh => 3,
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Detection => write!(f, "detection"),
            Self::EarlyWarning => write!(f, "early_warning"),
            Self::Reconciliation => write!(f, "reconciliation"),
            Self::IndexRefresh => write!(f, "index_refresh"),
        }
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Per-component heartbeat timestamps (epoch milliseconds, 0 = never).
#[derive(Debug)]
pub struct HeartbeatRegistry {
    beats: [AtomicU64; 4],
    /// Epoch ms when the registry was created (for the grace period).
    created_at: u64,
}

impl Default for HeartbeatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            beats: std::array::from_fn(|_| AtomicU64::new(0)),
            created_at: epoch_ms(),
        }
    }

    pub fn record(&self, component: Component) {
        self.beats[component.slot()].store(epoch_ms(), Ordering::SeqCst);
    }

    /// Last heartbeat for `component` (epoch ms), `None` if never recorded.
    #[must_use]
    pub fn last_heartbeat(&self, component: Component) -> Option<u64> {
        match self.beats[component.slot()].load(Ordering::SeqCst) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Check every monitored component and return the overall health.
    #[must_use]
    pub fn check_health(&self, config: &WatchdogConfig) -> HealthReport {
        let now = epoch_ms();
        let uptime_ms = now.saturating_sub(self.created_at);

        let mut components = Vec::with_capacity(config.thresholds.len());
        let mut worst = HealthStatus::Healthy;

        for &(component, threshold_ms) in &config.thresholds {
            let last = self.last_heartbeat(component);
            let age_ms = last.map(|ms| now.saturating_sub(ms));
            let status = match age_ms {
                // Not started yet: fine inside the grace period.
                None if uptime_ms < config.grace_period_ms => HealthStatus::Healthy,
                None => HealthStatus::Degraded,
                Some(age) if age <= threshold_ms => HealthStatus::Healthy,
                Some(age) if age <= threshold_ms.saturating_mul(2) => HealthStatus::Degraded,
                Some(_) => HealthStatus::Critical,
            };
            worst = worst.max(status);
            components.push(ComponentHealth {
                component,
                last_heartbeat_ms: last,
                age_ms,
                threshold_ms,
                status,
            });
        }

        HealthReport {
            timestamp_ms: now,
            overall: worst,
            components,
        }
    }
}

/// Per-component staleness thresholds.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub check_interval: Duration,
    /// Monitored components with their stale-after threshold (ms).
    pub thresholds: Vec<(Component, u64)>,
    /// Grace period after startup before missing heartbeats are flagged.
    pub grace_period_ms: u64,
}

impl WatchdogConfig {
    /// Thresholds at three loop intervals for every enabled loop.
    ///
    /// The grace period covers the longest initial delay plus one interval.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let detection = &config.detection;
        let alerting = &config.alerting;

        let mut thresholds = Vec::new();
        let mut grace_period_ms = 30_000u64;
        if detection.enabled {
            thresholds.push((Component::Detection, detection.interval_ms.saturating_mul(3)));
            thresholds.push((
                Component::EarlyWarning,
                detection.early_warning_interval_ms.saturating_mul(3),
            ));
            grace_period_ms = grace_period_ms
                .max(detection.initial_delay_ms + detection.interval_ms)
                .max(detection.early_warning_initial_delay_ms + detection.early_warning_interval_ms);
        }
        if alerting.reconciliation_enabled {
            thresholds.push((
                Component::Reconciliation,
                alerting.reconciliation_interval_ms.saturating_mul(3),
            ));
        }
        thresholds.push((
            Component::IndexRefresh,
            detection.index_refresh_interval_ms.saturating_mul(3),
        ));

        Self {
            check_interval: Duration::from_secs(30),
            thresholds,
            grace_period_ms,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Health status ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component: Component,
    pub last_heartbeat_ms: Option<u64>,
    pub age_ms: Option<u64>,
    pub threshold_ms: u64,
    pub status: HealthStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub timestamp_ms: u64,
    pub overall: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    #[must_use]
    pub fn unhealthy_components(&self) -> Vec<&ComponentHealth> {
        self.components
            .iter()
            .filter(|c| c.status != HealthStatus::Healthy)
            .collect()
    }
}

/// Handle returned by [`spawn_watchdog`].
pub struct WatchdogHandle {
    task: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

impl WatchdogHandle {
    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Spawn the watchdog monitor task. It only logs; it never restarts a loop.
#[must_use]
pub fn spawn_watchdog(
    heartbeats: Arc<HeartbeatRegistry>,
    config: WatchdogConfig,
    shutdown_flag: Arc<AtomicBool>,
) -> WatchdogHandle {
    let internal_shutdown = Arc::new(AtomicBool::new(false));
    let internal_flag = Arc::clone(&internal_shutdown);
    let check_interval = config.check_interval;

    let task = tokio::spawn(async move {
        let stopped =
            || shutdown_flag.load(Ordering::SeqCst) || internal_flag.load(Ordering::SeqCst);

        loop {
            if crate::tasks::pause_unless(check_interval, &stopped).await {
                info!("Watchdog: shutdown signal received");
                break;
            }

            let report = heartbeats.check_health(&config);
            match report.overall {
                HealthStatus::Healthy => {}
                HealthStatus::Degraded => {
                    for ch in report.unhealthy_components() {
                        warn!(
                            component = %ch.component,
                            status = %ch.status,
                            age_ms = ch.age_ms,
                            threshold_ms = ch.threshold_ms,
                            "Watchdog: component heartbeat is stale"
                        );
                    }
                }
                HealthStatus::Critical => {
                    for ch in report.unhealthy_components() {
                        error!(
                            component = %ch.component,
                            status = %ch.status,
                            age_ms = ch.age_ms,
                            threshold_ms = ch.threshold_ms,
                            "Watchdog: component heartbeat critically stale"
                        );
                    }
                    if let Ok(json) = serde_json::to_string_pretty(&report) {
                        error!(diagnostic = %json, "Watchdog: diagnostic dump");
                    }
                }
            }
        }
    });

    WatchdogHandle {
        task,
        shutdown: internal_shutdown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold_ms: u64, grace_period_ms: u64) -> WatchdogConfig {
        WatchdogConfig {
            check_interval: Duration::from_millis(10),
            thresholds: Component::ALL.iter().map(|c| (*c, threshold_ms)).collect(),
            grace_period_ms,
        }
    }

    #[test]
    fn fresh_registry_is_healthy_within_grace() {
        let registry = HeartbeatRegistry::new();
        let report = registry.check_health(&config(1_000, 60_000));
        assert_eq!(report.overall, HealthStatus::Healthy);
        assert!(report.unhealthy_components().is_empty());
    }

    #[test]
    fn missing_heartbeat_after_grace_is_degraded() {
        let registry = HeartbeatRegistry::new();
        registry.record(Component::Detection);
        let report = registry.check_health(&config(60_000, 0));
        assert_eq!(report.overall, HealthStatus::Degraded);
        let unhealthy: Vec<_> = report
            .unhealthy_components()
            .iter()
            .map(|c| c.component)
            .collect();
        assert!(!unhealthy.contains(&Component::Detection));
        assert!(unhealthy.contains(&Component::Reconciliation));
    }

    #[test]
    fn recorded_heartbeats_are_healthy() {
        let registry = HeartbeatRegistry::new();
        for component in Component::ALL {
            registry.record(component);
        }
        let report = registry.check_health(&config(60_000, 0));
        assert_eq!(report.overall, HealthStatus::Healthy);
        assert!(registry.last_heartbeat(Component::IndexRefresh).is_some());
    }

    #[test]
    fn disabled_loops_are_not_monitored() {
        let mut cfg = Config::default();
        cfg.detection.enabled = false;
        cfg.alerting.reconciliation_enabled = false;
        let watchdog = WatchdogConfig::from_config(&cfg);
        let monitored: Vec<_> = watchdog.thresholds.iter().map(|(c, _)| *c).collect();
        assert_eq!(monitored, vec![Component::IndexRefresh]);
    }

    #[test]
    fn default_thresholds_are_three_intervals() {
        let watchdog = WatchdogConfig::default();
        assert!(watchdog.thresholds.contains(&(Component::Detection, 45_000)));
        assert!(watchdog.grace_period_ms >= 90_000);
    }

    #[tokio::test]
    async fn watchdog_stops_on_shutdown() {
        let handle = spawn_watchdog(
            Arc::new(HeartbeatRegistry::new()),
            config(1_000, 60_000),
            Arc::new(AtomicBool::new(false)),
        );
        handle.signal_shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle.join())
            .await
            .expect("watchdog should stop");
    }
}
