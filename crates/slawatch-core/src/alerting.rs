//! Alert delivery pipeline.
//!
//! Records each breach once (the run id is the idempotency key), then
//! delivers it through the configured [`AlertSink`] with retries behind a
//! shared circuit breaker. Delivery state lives on the breach row:
//!
//! ```text
//! PENDING --send--> RETRYING --ok--> SENT
//!                      |
//!                      +--retries exhausted--> FAILED
//!                      +--circuit open-------> PENDING
//! ```
//!
//! FAILED and PENDING rows are picked up again by [`AlertPipeline::reconcile`],
//! as are RETRYING rows untouched for longer than a send can take (the
//! process died mid-delivery).
//! Sink failures never surface to whoever recorded the breach.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::alert_sink::AlertSink;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerStatus};
use crate::clock::Clock;
use crate::config::AlertingConfig;
use crate::error::{AlertError, Error, Result};
use crate::events::{DomainEvent, EventSubscriber};
use crate::metrics::{self, AlertFailure};
use crate::model::{AlertStatus, BreachEvent, JobRun, RunStatus, SlaEvaluation};
use crate::retry::{RetryPolicy, is_retryable, with_retry_and_circuit};
use crate::sla_time;
use crate::store::{BreachStore, CreateOutcome, RunStore};

/// Name of the breaker guarding the alert sink.
pub const ALERT_CIRCUIT: &str = "alert_sink";

/// Result of one delivery attempt sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// The breach as persisted after the attempt.
    pub breach: BreachEvent,
    /// Sink calls made; zero when the circuit was open.
    pub attempts: u32,
}

impl Delivery {
    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.breach.alert_status == AlertStatus::Sent
    }
}

/// Counters from one reconciliation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub examined: usize,
    pub sent: usize,
    pub failed: usize,
    /// Left PENDING because the circuit was open.
    pub deferred: usize,
}

pub struct AlertPipeline {
    breaches: Arc<dyn BreachStore>,
    runs: Arc<dyn RunStore>,
    sink: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    breaker: Mutex<CircuitBreaker>,
    send_timeout: Duration,
    retrying_stale_after: Duration,
}

impl std::fmt::Debug for AlertPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertPipeline")
            .field("sink", &self.sink.name())
            .field("policy", &self.policy)
            .field("send_timeout", &self.send_timeout)
            .finish_non_exhaustive()
    }
}

impl AlertPipeline {
    #[must_use]
    pub fn new(
        breaches: Arc<dyn BreachStore>,
        runs: Arc<dyn RunStore>,
        sink: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        config: &AlertingConfig,
    ) -> Self {
        Self {
            breaches,
            runs,
            sink,
            clock,
            policy: config.retry_policy(),
            breaker: Mutex::new(CircuitBreaker::with_name(ALERT_CIRCUIT, config.circuit_config())),
            send_timeout: config.send_timeout(),
            retrying_stale_after: config.retrying_stale_after(),
        }
    }

    #[must_use]
    pub fn circuit_status(&self) -> CircuitBreakerStatus {
        match self.breaker.lock() {
            Ok(guard) => guard.status(),
            Err(poisoned) => poisoned.into_inner().status(),
        }
    }

    /// Record the breach for `run`. A second call for the same run id
    /// returns the stored row as [`CreateOutcome::AlreadyRecorded`].
    pub async fn create(&self, run: &JobRun, evaluation: &SlaEvaluation) -> Result<CreateOutcome> {
        let breach = BreachEvent::for_run(run, evaluation, self.clock.now());
        let outcome = self.breaches.create(&breach).await?;
        if outcome.is_created() {
            info!(
                run_id = %run.run_id,
                breach_id = ?outcome.event().breach_id,
                severity = %evaluation.severity,
                "Recorded SLA breach"
            );
        } else {
            debug!(run_id = %run.run_id, "Breach already recorded for run");
            metrics::record_duplicate("breach");
        }
        Ok(outcome)
    }

    /// Record then deliver. Returns `None` when the breach already existed.
    pub async fn handle_breach(
        &self,
        run: &JobRun,
        evaluation: &SlaEvaluation,
    ) -> Result<Option<Delivery>> {
        match self.create(run, evaluation).await? {
            CreateOutcome::Created(breach) => Ok(Some(self.send(breach, run).await?)),
            CreateOutcome::AlreadyRecorded(_) => Ok(None),
        }
    }

    /// Deliver one breach and persist the resulting alert state.
    ///
    /// Only store errors are returned; sink failures end up on the row.
    pub async fn send(&self, mut breach: BreachEvent, run: &JobRun) -> Result<Delivery> {
        breach.alert_status = AlertStatus::Retrying;
        breach.updated_at = self.clock.now();
        self.breaches.update_alert_state(&breach).await?;

        let sink = &self.sink;
        let send_timeout = self.send_timeout;
        let attempt_breach = &breach.clone();
        let outcome = with_retry_and_circuit(&self.policy, &self.breaker, move || async move {
            match tokio::time::timeout(send_timeout, sink.send(attempt_breach, run)).await {
                Ok(result) => result.map_err(Error::from),
                Err(_) => Err(AlertError::Timeout(send_timeout.as_millis() as u64).into()),
            }
        })
        .await;

        match outcome.result {
            Ok(()) => {
                breach.alert_status = AlertStatus::Sent;
                breach.alerted = true;
                breach.alerted_at = Some(self.clock.now());
                breach.last_error = None;
                metrics::record_alert_sent();
                info!(
                    run_id = %breach.run_id,
                    breach_id = ?breach.breach_id,
                    attempts = outcome.attempts,
                    "Alert sent"
                );
            }
            Err(err) => {
                let reason = match &err {
                    Error::CircuitOpen { .. } => AlertFailure::CircuitOpen,
                    e if !is_retryable(e) => AlertFailure::Permanent,
                    _ => AlertFailure::Exhausted,
                };
                breach.alert_status = match reason {
                    AlertFailure::CircuitOpen => AlertStatus::Pending,
                    AlertFailure::Exhausted | AlertFailure::Permanent => AlertStatus::Failed,
                };
                breach.retry_count = breach.retry_count.saturating_add(1);
                breach.last_error = Some(err.to_string());
                metrics::record_alert_failed(reason);
                warn!(
                    run_id = %breach.run_id,
                    breach_id = ?breach.breach_id,
                    attempts = outcome.attempts,
                    reason = reason.as_str(),
                    error = %err,
                    "Alert delivery failed"
                );
            }
        }

        breach.updated_at = self.clock.now();
        self.breaches.update_alert_state(&breach).await?;
        Ok(Delivery {
            breach,
            attempts: outcome.attempts,
        })
    }

    /// Retry delivery for up to `limit` unalerted breaches, oldest first.
    pub async fn reconcile(&self, limit: usize) -> Result<ReconcileReport> {
        let stale = chrono::Duration::from_std(self.retrying_stale_after)
            .unwrap_or(chrono::Duration::MAX);
        let retrying_before = self
            .clock
            .now()
            .checked_sub_signed(stale)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        let pending = self.breaches.find_unalerted(limit, retrying_before).await?;
        let mut report = ReconcileReport {
            examined: pending.len(),
            ..ReconcileReport::default()
        };
        if pending.is_empty() {
            debug!("No pending alerts to reconcile");
            return Ok(report);
        }

        info!(count = pending.len(), "Reconciling pending alerts");
        for breach in pending {
            let run_id = breach.run_id.clone();
            let run = match self.runs.get_by_id(&run_id).await {
                Ok(Some(run)) => run,
                Ok(None) => placeholder_run(&breach),
                Err(err) => {
                    warn!(run_id = %run_id, error = %err, "Run lookup failed, alerting from breach record");
                    placeholder_run(&breach)
                }
            };
            match self.send(breach, &run).await {
                Ok(delivery) => match delivery.breach.alert_status {
                    AlertStatus::Sent => report.sent += 1,
                    AlertStatus::Pending => report.deferred += 1,
                    AlertStatus::Failed | AlertStatus::Retrying => report.failed += 1,
                },
                Err(err) => {
                    error!(run_id = %run_id, error = %err, "Failed to persist alert state");
                    report.failed += 1;
                }
            }
        }
        info!(
            sent = report.sent,
            failed = report.failed,
            deferred = report.deferred,
            "Alert reconciliation completed"
        );
        Ok(report)
    }
}

/// Minimal run rebuilt from a breach row whose run is gone from the store.
fn placeholder_run(breach: &BreachEvent) -> JobRun {
    JobRun {
        run_id: breach.run_id.clone(),
        calculator_id: breach.calculator_id.clone(),
        calculator_name: breach.calculator_name.clone(),
        tenant_id: breach.tenant_id.clone(),
        frequency: crate::model::Frequency::Daily,
        reporting_date: sla_time::cet_date(breach.created_at),
        start_time: breach.created_at,
        end_time: None,
        duration_ms: None,
        status: RunStatus::Running,
        sla_deadline: None,
        sla_breached: true,
        sla_breach_reason: breach.reason.clone(),
        expected_duration_ms: None,
        estimated_end_time: None,
        run_parameters: None,
        created_at: breach.created_at,
        updated_at: breach.created_at,
    }
}

#[async_trait]
impl EventSubscriber for AlertPipeline {
    fn name(&self) -> &'static str {
        "alert_pipeline"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        if let DomainEvent::SlaBreached { run, evaluation } = event {
            self.handle_breach(run, evaluation).await?;
        }
        Ok(())
    }
}
