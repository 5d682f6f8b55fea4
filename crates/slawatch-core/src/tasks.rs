//! Periodic background loops: detection, early warning, alert reconciliation,
//! deadline index refresh, and the watchdog watching them.
//!
//! All loops share one shutdown flag and check it at least every
//! [`SHUTDOWN_POLL`], so a long interval never delays shutdown.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::services::Services;
use crate::watchdog::{Component, HeartbeatRegistry, WatchdogConfig, WatchdogHandle, spawn_watchdog};

/// Longest a loop sleeps before re-checking the shutdown flag.
pub const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// Sleep for `duration`, waking early when `stopped` turns true.
/// Returns whether the wait ended because of shutdown.
pub(crate) async fn pause_unless(duration: Duration, stopped: &impl Fn() -> bool) -> bool {
    let mut remaining = duration;
    loop {
        if stopped() {
            return true;
        }
        if remaining.is_zero() {
            return false;
        }
        let step = remaining.min(SHUTDOWN_POLL);
        tokio::time::sleep(step).await;
        remaining -= step;
    }
}

/// Handles of the spawned loops.
pub struct BackgroundHandles {
    shutdown: Arc<AtomicBool>,
    heartbeats: Arc<HeartbeatRegistry>,
    loops: Vec<(Component, JoinHandle<()>)>,
    watchdog: WatchdogHandle,
}

impl std::fmt::Debug for BackgroundHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundHandles")
            .field(
                "loops",
                &self.loops.iter().map(|(c, _)| *c).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl BackgroundHandles {
    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.watchdog.signal_shutdown();
    }

    #[must_use]
    pub fn heartbeats(&self) -> &Arc<HeartbeatRegistry> {
        &self.heartbeats
    }

    #[must_use]
    pub fn components(&self) -> Vec<Component> {
        self.loops.iter().map(|(c, _)| *c).collect()
    }

    /// Wait for every loop to stop. Call after [`Self::signal_shutdown`].
    pub async fn join(self) {
        for (component, handle) in self.loops {
            if let Err(err) = handle.await {
                warn!(component = %component, error = %err, "Background loop ended abnormally");
            }
        }
        self.watchdog.join().await;
        info!("Background tasks stopped");
    }
}

/// Spawn every loop enabled in `config`.
#[must_use]
pub fn spawn_background_tasks(services: &Services, config: &Config) -> BackgroundHandles {
    let shutdown = Arc::new(AtomicBool::new(false));
    let heartbeats = Arc::new(HeartbeatRegistry::new());
    let detection = &config.detection;
    let alerting = &config.alerting;
    let mut loops = Vec::new();

    if detection.enabled {
        let detector = Arc::clone(&services.detector);
        let clock = Arc::clone(&services.clock);
        loops.push((
            Component::Detection,
            spawn_loop(
                Component::Detection,
                Duration::from_millis(detection.initial_delay_ms),
                Duration::from_millis(detection.interval_ms),
                &shutdown,
                &heartbeats,
                move || {
                    let detector = Arc::clone(&detector);
                    let now = clock.now();
                    async move {
                        if let Err(err) = detector.tick(now).await {
                            warn!(error = %err, "Detection tick failed");
                        }
                    }
                },
            ),
        ));

        let detector = Arc::clone(&services.detector);
        let clock = Arc::clone(&services.clock);
        loops.push((
            Component::EarlyWarning,
            spawn_loop(
                Component::EarlyWarning,
                Duration::from_millis(detection.early_warning_initial_delay_ms),
                Duration::from_millis(detection.early_warning_interval_ms),
                &shutdown,
                &heartbeats,
                move || {
                    let detector = Arc::clone(&detector);
                    let now = clock.now();
                    async move {
                        if let Err(err) = detector.early_warning(now).await {
                            warn!(error = %err, "Early warning check failed");
                        }
                    }
                },
            ),
        ));
    }

    if alerting.reconciliation_enabled {
        let alerts = Arc::clone(&services.alerts);
        let batch = alerting.reconciliation_batch;
        let interval = Duration::from_millis(alerting.reconciliation_interval_ms);
        loops.push((
            Component::Reconciliation,
            spawn_loop(
                Component::Reconciliation,
                interval,
                interval,
                &shutdown,
                &heartbeats,
                move || {
                    let alerts = Arc::clone(&alerts);
                    async move {
                        if let Err(err) = alerts.reconcile(batch).await {
                            warn!(error = %err, "Alert reconciliation failed");
                        }
                    }
                },
            ),
        ));
    }

    let index = services.index.clone();
    let refresh = Duration::from_millis(detection.index_refresh_interval_ms);
    loops.push((
        Component::IndexRefresh,
        spawn_loop(
            Component::IndexRefresh,
            refresh,
            refresh,
            &shutdown,
            &heartbeats,
            move || {
                let index = index.clone();
                async move {
                    match index.refresh_safety_expiry().await {
                        Ok(()) => debug!("Deadline index expiry refreshed"),
                        Err(err) => warn!(error = %err, "Deadline index expiry refresh failed"),
                    }
                }
            },
        ),
    ));

    let watchdog = spawn_watchdog(
        Arc::clone(&heartbeats),
        WatchdogConfig::from_config(config),
        Arc::clone(&shutdown),
    );

    info!(loops = loops.len(), "Background tasks started");
    BackgroundHandles {
        shutdown,
        heartbeats,
        loops,
        watchdog,
    }
}

fn spawn_loop<F, Fut>(
    component: Component,
    initial_delay: Duration,
    interval: Duration,
    shutdown: &Arc<AtomicBool>,
    heartbeats: &Arc<HeartbeatRegistry>,
    mut body: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let shutdown = Arc::clone(shutdown);
    let heartbeats = Arc::clone(heartbeats);
    tokio::spawn(async move {
        let stopped = || shutdown.load(Ordering::SeqCst);
        debug!(component = %component, ?initial_delay, ?interval, "Background loop scheduled");
        if pause_unless(initial_delay, &stopped).await {
            return;
        }
        loop {
            heartbeats.record(component);
            body().await;
            if pause_unless(interval, &stopped).await {
                debug!(component = %component, "Background loop stopping");
                return;
            }
        }
    })
}
