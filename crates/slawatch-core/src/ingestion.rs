//! Run start/complete triggers.
//!
//! The canonical write comes first and its errors fail the call. Cache,
//! deadline index and aggregate updates follow; their failures are logged
//! and never undo the canonical write.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::RunCache;
use crate::clock::Clock;
use crate::deadline_index::DeadlineIndex;
use crate::error::{Error, Result};
use crate::evaluation::evaluate;
use crate::events::{DomainEvent, EventBus};
use crate::metrics;
use crate::model::{Frequency, JobDefinition, JobRun, RunStatus};
use crate::sla_time;
use crate::store::partition::is_end_of_month;
use crate::store::{AggregateStore, JobCatalog, RunStore};

/// Start trigger for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRun {
    pub run_id: String,
    pub calculator_id: String,
    /// Falls back to the catalog name, then to the calculator id.
    pub calculator_name: Option<String>,
    pub tenant_id: String,
    pub frequency: Frequency,
    pub reporting_date: NaiveDate,
    pub start_time: DateTime<Utc>,
    /// CET wall-clock deadline; falls back to the catalog definition.
    pub sla_time_of_day: Option<NaiveTime>,
    pub expected_duration_ms: Option<i64>,
    pub run_parameters: Option<String>,
}

/// Completion trigger for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRun {
    pub run_id: String,
    pub tenant_id: String,
    pub end_time: DateTime<Utc>,
    /// Defaults to SUCCESS.
    pub status: Option<RunStatus>,
}

pub struct RunIngestion {
    runs: Arc<dyn RunStore>,
    catalog: Arc<dyn JobCatalog>,
    aggregates: Arc<dyn AggregateStore>,
    cache: Arc<RunCache>,
    index: DeadlineIndex,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RunIngestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunIngestion")
            .field("cache", &self.cache)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl RunIngestion {
    #[must_use]
    pub fn new(
        runs: Arc<dyn RunStore>,
        catalog: Arc<dyn JobCatalog>,
        aggregates: Arc<dyn AggregateStore>,
        cache: Arc<RunCache>,
        index: DeadlineIndex,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            runs,
            catalog,
            aggregates,
            cache,
            index,
            bus,
            clock,
        }
    }

    /// Record a run start. Resubmitting a known run id returns the stored run
    /// untouched.
    pub async fn start_run(&self, request: StartRun) -> Result<JobRun> {
        let now = self.clock.now();
        if let Some(existing) = self
            .runs
            .find_recent(&request.run_id, self.clock.today())
            .await?
        {
            info!(run_id = %existing.run_id, status = %existing.status, "Run already recorded, ignoring start");
            metrics::record_duplicate("start");
            return Ok(existing);
        }

        let definition = self.definition(&request.calculator_id).await;
        if let Some(def) = &definition {
            if def.frequency != request.frequency {
                warn!(
                    calculator_id = %request.calculator_id,
                    catalog = %def.frequency,
                    requested = %request.frequency,
                    "Run frequency differs from calculator definition"
                );
            }
        }
        if request.frequency == Frequency::Monthly && !is_end_of_month(request.reporting_date) {
            warn!(
                run_id = %request.run_id,
                reporting_date = %request.reporting_date,
                "MONTHLY run with a reporting date that is not month end"
            );
        }

        let calculator_name = request
            .calculator_name
            .clone()
            .or_else(|| definition.as_ref().map(|d| d.name.clone()))
            .unwrap_or_else(|| request.calculator_id.clone());
        let sla_time_of_day = request
            .sla_time_of_day
            .or_else(|| definition.as_ref().and_then(|d| d.sla_time_of_day));
        let expected_duration_ms = request
            .expected_duration_ms
            .or_else(|| definition.as_ref().and_then(|d| d.sla_target_duration_ms));

        let run = JobRun {
            sla_deadline: sla_time_of_day.map(|t| sla_time::sla_deadline(request.start_time, t)),
            estimated_end_time: expected_duration_ms
                .map(|ms| sla_time::estimated_end(request.start_time, ms)),
            run_id: request.run_id,
            calculator_id: request.calculator_id,
            calculator_name,
            tenant_id: request.tenant_id,
            frequency: request.frequency,
            reporting_date: request.reporting_date,
            start_time: request.start_time,
            end_time: None,
            duration_ms: None,
            status: RunStatus::Running,
            sla_breached: false,
            sla_breach_reason: None,
            expected_duration_ms,
            run_parameters: request.run_parameters,
            created_at: now,
            updated_at: now,
        };

        let run = self.runs.upsert(&run).await?;
        self.cache.write_through(&run, now).await;
        match self.index.register(&run).await {
            Ok(true) => {}
            Ok(false) => debug!(run_id = %run.run_id, "Run started without SLA deadline"),
            Err(err) => {
                warn!(run_id = %run.run_id, error = %err, "Failed to register run for live detection");
                metrics::record_cache_error("index_register");
            }
        }

        info!(
            run_id = %run.run_id,
            calculator_id = %run.calculator_id,
            tenant_id = %run.tenant_id,
            sla_deadline = ?run.sla_deadline,
            "Run started"
        );
        metrics::record_run_started(run.frequency);
        self.bus
            .publish(DomainEvent::RunStarted { run: run.clone() })
            .await;
        Ok(run)
    }

    /// Record a run completion and evaluate its SLA.
    pub async fn complete_run(&self, request: CompleteRun) -> Result<JobRun> {
        let now = self.clock.now();
        let existing = self
            .runs
            .find_recent(&request.run_id, self.clock.today())
            .await?
            .ok_or_else(|| Error::RunNotFound(request.run_id.clone()))?;
        if existing.tenant_id != request.tenant_id {
            return Err(Error::TenantAccessDenied {
                run_id: request.run_id,
                tenant_id: request.tenant_id,
            });
        }
        if existing.status.is_terminal() {
            info!(run_id = %existing.run_id, status = %existing.status, "Run already completed, ignoring");
            metrics::record_duplicate("complete");
            return Ok(existing);
        }

        let status = request.status.unwrap_or(RunStatus::Success);
        let mut run = JobRun {
            end_time: Some(request.end_time),
            duration_ms: Some((request.end_time - existing.start_time).num_milliseconds()),
            status,
            updated_at: now,
            ..existing.clone()
        };
        let evaluation = evaluate(&run, now);
        if evaluation.breached {
            run.sla_breached = true;
            run.sla_breach_reason = run.sla_breach_reason.or_else(|| evaluation.reason.clone());
        }

        let run = self.runs.upsert(&run).await?;
        self.cache.write_through(&run, now).await;
        if let Err(err) = self.index.deregister(&run.run_id).await {
            warn!(run_id = %run.run_id, error = %err, "Failed to deregister completed run");
            metrics::record_cache_error("index_deregister");
        }
        if let Err(err) = self.aggregates.upsert_daily(&run, now).await {
            warn!(run_id = %run.run_id, error = %err, "Failed to update daily aggregate");
        }

        info!(
            run_id = %run.run_id,
            calculator_id = %run.calculator_id,
            status = %run.status,
            duration_ms = ?run.duration_ms,
            sla_breached = run.sla_breached,
            "Run completed"
        );
        metrics::record_run_completed(run.status);
        self.bus
            .publish(DomainEvent::RunCompleted { run: run.clone() })
            .await;
        // Live detection may already own this breach.
        if evaluation.breached && !existing.sla_breached {
            self.bus
                .publish(DomainEvent::SlaBreached {
                    run: run.clone(),
                    evaluation,
                })
                .await;
        }
        Ok(run)
    }

    async fn definition(&self, calculator_id: &str) -> Option<JobDefinition> {
        match self.catalog.get_definition(calculator_id).await {
            Ok(definition) => definition,
            Err(err) => {
                warn!(calculator_id, error = %err, "Calculator catalog lookup failed");
                None
            }
        }
    }
}
