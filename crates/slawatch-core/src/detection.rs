//! Live breach detection.
//!
//! The deadline index says which runs *might* be late. Each tick re-reads
//! those runs from the canonical store and marks the still-RUNNING ones
//! breached with a compare-and-set, so a run that completed in the
//! meantime (or that another worker already marked) is simply dropped
//! from the index.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::deadline_index::{DeadlineEntry, DeadlineIndex};
use crate::error::Result;
use crate::evaluation::{delay_minutes, evaluate};
use crate::events::{DomainEvent, EventBus};
use crate::metrics;
use crate::model::JobRun;
use crate::sla_time;
use crate::store::RunStore;

/// Counters from one detection tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    /// Index entries past their deadline.
    pub examined: usize,
    /// Runs this tick marked breached.
    pub breached: usize,
    /// Entries dropped because the run was gone, finished or already breached.
    pub stale: usize,
    /// Entries left in the index after an error.
    pub failed: usize,
}

enum EntryOutcome {
    Breached,
    Stale,
    Pending,
}

pub struct BreachDetector {
    runs: Arc<dyn RunStore>,
    index: DeadlineIndex,
    bus: Arc<EventBus>,
    early_warning_window: chrono::Duration,
}

impl std::fmt::Debug for BreachDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreachDetector")
            .field("early_warning_window", &self.early_warning_window)
            .finish_non_exhaustive()
    }
}

impl BreachDetector {
    #[must_use]
    pub fn new(
        runs: Arc<dyn RunStore>,
        index: DeadlineIndex,
        bus: Arc<EventBus>,
        early_warning_window_minutes: u32,
    ) -> Self {
        Self {
            runs,
            index,
            bus,
            early_warning_window: chrono::Duration::minutes(i64::from(early_warning_window_minutes)),
        }
    }

    #[must_use]
    pub fn index(&self) -> &DeadlineIndex {
        &self.index
    }

    /// Process every index entry whose deadline is at or before `now`.
    ///
    /// Only a failure to read the index itself is returned; per-entry
    /// failures are logged and counted.
    pub async fn tick(&self, now: chrono::DateTime<chrono::Utc>) -> Result<TickReport> {
        let started = Instant::now();
        let due = self.index.breached(now).await?;
        let mut report = TickReport {
            examined: due.len(),
            ..TickReport::default()
        };

        for entry in &due {
            match self.check_entry(entry, now).await {
                Ok(EntryOutcome::Breached) => report.breached += 1,
                Ok(EntryOutcome::Stale) => report.stale += 1,
                Ok(EntryOutcome::Pending) => {}
                Err(err) => {
                    report.failed += 1;
                    warn!(run_id = %entry.run_id, error = %err, "Failed to check overdue run");
                }
            }
        }

        match self.index.count().await {
            Ok(active) => metrics::set_active_runs(active),
            Err(err) => debug!(error = %err, "Could not read monitored run count"),
        }
        metrics::record_detection_duration(started.elapsed());

        if report.breached > 0 || report.failed > 0 {
            info!(
                examined = report.examined,
                breached = report.breached,
                stale = report.stale,
                failed = report.failed,
                "Detection tick completed"
            );
        } else {
            debug!(examined = report.examined, stale = report.stale, "Detection tick completed");
        }
        Ok(report)
    }

    async fn check_entry(
        &self,
        entry: &DeadlineEntry,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<EntryOutcome> {
        let today = sla_time::cet_date(now);
        let Some(run) = self.runs.find_recent(&entry.run_id, today).await? else {
            debug!(run_id = %entry.run_id, "Monitored run not in store");
            self.index.deregister(&entry.run_id).await?;
            return Ok(EntryOutcome::Stale);
        };
        if !run.is_running() || run.sla_breached {
            debug!(
                run_id = %run.run_id,
                status = %run.status,
                sla_breached = run.sla_breached,
                "Monitored run already resolved"
            );
            self.index.deregister(&run.run_id).await?;
            return Ok(EntryOutcome::Stale);
        }

        let evaluation = evaluate(&run, now);
        if !evaluation.breached {
            // Due exactly at `now`; the next tick decides.
            return Ok(EntryOutcome::Pending);
        }
        let reason = evaluation.reason.as_deref().unwrap_or_default();

        let marked = self
            .runs
            .conditional_mark_breached(&run.run_id, run.reporting_date, reason, now)
            .await?;
        if !marked {
            debug!(run_id = %run.run_id, "Run resolved by another writer before marking");
            self.index.deregister(&run.run_id).await?;
            return Ok(EntryOutcome::Stale);
        }

        let breached_run = JobRun {
            sla_breached: true,
            sla_breach_reason: evaluation.reason.clone(),
            updated_at: now,
            ..run
        };
        warn!(
            run_id = %breached_run.run_id,
            calculator_id = %breached_run.calculator_id,
            tenant_id = %breached_run.tenant_id,
            severity = %evaluation.severity,
            delay_minutes = delay_minutes(&breached_run, now),
            "Live SLA breach detected"
        );
        metrics::record_live_breach(evaluation.severity);
        let run_id = breached_run.run_id.clone();
        self.bus
            .publish(DomainEvent::SlaBreached {
                run: breached_run,
                evaluation,
            })
            .await;

        // The flag is set; a failed removal leaves a stale entry for the next tick.
        if let Err(err) = self.index.deregister(&run_id).await {
            warn!(run_id = %run_id, error = %err, "Failed to deregister breached run");
        }
        Ok(EntryOutcome::Breached)
    }

    /// Runs due within the early-warning window. Logs and metrics only.
    pub async fn early_warning(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<DeadlineEntry>> {
        let approaching = self.index.approaching(now, self.early_warning_window).await?;
        metrics::set_approaching(approaching.len());
        for entry in &approaching {
            let minutes_left = (entry.deadline - now).num_minutes();
            match &entry.info {
                Some(info) => warn!(
                    run_id = %entry.run_id,
                    calculator_id = %info.calculator_id,
                    calculator_name = %info.calculator_name,
                    tenant_id = %info.tenant_id,
                    minutes_left,
                    "Run approaching SLA deadline"
                ),
                None => warn!(run_id = %entry.run_id, minutes_left, "Run approaching SLA deadline"),
            }
        }
        Ok(approaching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheBackend;
    use crate::config::DispatchMode;
    use crate::events::EventSubscriber;
    use crate::error::Error;
    use crate::model::{CalculatorKey, Frequency, RunStatus, Severity};
    use crate::store::{SqliteStore, StoreStatsSnapshot};
    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Store whose lookups of one run id time out.
    struct FlakyStore {
        inner: SqliteStore,
        broken_run: &'static str,
    }

    #[async_trait]
    impl RunStore for FlakyStore {
        async fn get_by_id(&self, run_id: &str) -> Result<Option<JobRun>> {
            self.inner.get_by_id(run_id).await
        }

        async fn get_by_id_on(
            &self,
            run_id: &str,
            reporting_date: NaiveDate,
        ) -> Result<Option<JobRun>> {
            self.inner.get_by_id_on(run_id, reporting_date).await
        }

        async fn find_recent(&self, run_id: &str, today: NaiveDate) -> Result<Option<JobRun>> {
            if run_id == self.broken_run {
                return Err(Error::Timeout {
                    operation: "find_recent",
                    timeout_ms: 1,
                });
            }
            self.inner.find_recent(run_id, today).await
        }

        async fn upsert(&self, run: &JobRun) -> Result<JobRun> {
            self.inner.upsert(run).await
        }

        async fn query_recent(
            &self,
            key: &CalculatorKey,
            frequency: Frequency,
            today: NaiveDate,
            limit: usize,
        ) -> Result<Vec<JobRun>> {
            self.inner.query_recent(key, frequency, today, limit).await
        }

        async fn query_batch_recent(
            &self,
            calculator_ids: &[String],
            tenant_id: &str,
            frequency: Frequency,
            today: NaiveDate,
            limit: usize,
        ) -> Result<HashMap<String, Vec<JobRun>>> {
            self.inner
                .query_batch_recent(calculator_ids, tenant_id, frequency, today, limit)
                .await
        }

        async fn conditional_mark_breached(
            &self,
            run_id: &str,
            reporting_date: NaiveDate,
            reason: &str,
            now: DateTime<Utc>,
        ) -> Result<bool> {
            self.inner
                .conditional_mark_breached(run_id, reporting_date, reason, now)
                .await
        }

        async fn count_running(&self, since: NaiveDate) -> Result<u64> {
            self.inner.count_running(since).await
        }

        fn stats(&self) -> StoreStatsSnapshot {
            self.inner.stats()
        }
    }

    #[derive(Default)]
    struct Captured {
        events: Mutex<Vec<DomainEvent>>,
    }

    #[async_trait]
    impl EventSubscriber for Captured {
        fn name(&self) -> &'static str {
            "captured"
        }

        async fn handle(&self, event: &DomainEvent) -> Result<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, h, m, 0).unwrap()
    }

    fn running(run_id: &str, deadline: DateTime<Utc>) -> JobRun {
        JobRun {
            run_id: run_id.into(),
            calculator_id: format!("calc-{run_id}"),
            calculator_name: "FX Rates".into(),
            tenant_id: "t1".into(),
            frequency: Frequency::Daily,
            reporting_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            start_time: at(4, 0),
            end_time: None,
            duration_ms: None,
            status: RunStatus::Running,
            sla_deadline: Some(deadline),
            sla_breached: false,
            sla_breach_reason: None,
            expected_duration_ms: None,
            estimated_end_time: None,
            run_parameters: None,
            created_at: at(4, 0),
            updated_at: at(4, 0),
        }
    }

    struct Fixture {
        store: SqliteStore,
        detector: BreachDetector,
        captured: Arc<Captured>,
    }

    fn fixture() -> Fixture {
        let store = SqliteStore::open_in_memory().unwrap();
        let index = DeadlineIndex::new(Arc::new(MemoryCacheBackend::new()), "test");
        let bus = Arc::new(EventBus::new(DispatchMode::Inline));
        let captured = Arc::new(Captured::default());
        bus.subscribe(captured.clone());
        let detector = BreachDetector::new(Arc::new(store.clone()), index, bus, 10);
        Fixture {
            store,
            detector,
            captured,
        }
    }

    async fn track(fx: &Fixture, run: &JobRun) {
        fx.store.upsert(run).await.unwrap();
        assert!(fx.detector.index().register(run).await.unwrap());
    }

    #[tokio::test]
    async fn overdue_run_is_marked_once() {
        let fx = fixture();
        track(&fx, &running("r1", at(5, 15))).await;

        let report = fx.detector.tick(at(6, 0)).await.unwrap();
        assert_eq!(report, TickReport { examined: 1, breached: 1, stale: 0, failed: 0 });

        let stored = fx.store.get_by_id("r1").await.unwrap().unwrap();
        assert!(stored.sla_breached);
        assert_eq!(
            stored.sla_breach_reason.as_deref(),
            Some("still running 45 minutes past deadline")
        );

        let events = fx.captured.events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        let DomainEvent::SlaBreached { run, evaluation } = &events[0] else {
            panic!("expected SlaBreached, got {events:?}");
        };
        assert!(run.sla_breached);
        assert_eq!(evaluation.severity, Severity::High);

        assert_eq!(fx.detector.index().count().await.unwrap(), 0);
        let again = fx.detector.tick(at(6, 1)).await.unwrap();
        assert_eq!(again.examined, 0);
    }

    #[tokio::test]
    async fn completed_run_is_dropped_as_stale() {
        let fx = fixture();
        let run = running("r1", at(5, 15));
        track(&fx, &run).await;
        fx.store
            .upsert(&JobRun {
                status: RunStatus::Success,
                end_time: Some(at(5, 10)),
                ..run
            })
            .await
            .unwrap();

        let report = fx.detector.tick(at(6, 0)).await.unwrap();
        assert_eq!(report.stale, 1);
        assert_eq!(report.breached, 0);
        assert!(fx.captured.events.lock().unwrap().is_empty());
        assert_eq!(fx.detector.index().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_run_is_dropped_as_stale() {
        let fx = fixture();
        fx.detector
            .index()
            .register(&running("ghost", at(5, 0)))
            .await
            .unwrap();

        let report = fx.detector.tick(at(6, 0)).await.unwrap();
        assert_eq!(report.stale, 1);
        assert_eq!(fx.detector.index().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn future_deadlines_are_left_alone() {
        let fx = fixture();
        track(&fx, &running("due", at(5, 50))).await;
        track(&fx, &running("later", at(6, 5))).await;

        let report = fx.detector.tick(at(6, 0)).await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.breached, 1);
        assert_eq!(fx.detector.index().count().await.unwrap(), 1);

        let warned = fx.detector.early_warning(at(6, 0)).await.unwrap();
        assert_eq!(warned.len(), 1);
        assert_eq!(warned[0].run_id, "later");
    }

    #[tokio::test]
    async fn one_failing_run_does_not_stop_the_tick() {
        let store = SqliteStore::open_in_memory().unwrap();
        let index = DeadlineIndex::new(Arc::new(MemoryCacheBackend::new()), "test");
        let bus = Arc::new(EventBus::new(DispatchMode::Inline));
        let captured = Arc::new(Captured::default());
        bus.subscribe(captured.clone());
        let flaky = FlakyStore {
            inner: store.clone(),
            broken_run: "r-broken",
        };
        let detector = BreachDetector::new(Arc::new(flaky), index, bus, 10);
        for run in [running("r-broken", at(5, 0)), running("r-ok", at(5, 15))] {
            store.upsert(&run).await.unwrap();
            detector.index().register(&run).await.unwrap();
        }

        let report = detector.tick(at(6, 0)).await.unwrap();
        assert_eq!(report, TickReport { examined: 2, breached: 1, stale: 0, failed: 1 });
        assert!(store.get_by_id("r-ok").await.unwrap().unwrap().sla_breached);
        assert!(!store.get_by_id("r-broken").await.unwrap().unwrap().sla_breached);
        assert_eq!(captured.events.lock().unwrap().len(), 1);

        // The failed entry stays for the next tick.
        let left = detector.index().breached(at(6, 0)).await.unwrap();
        assert_eq!(left.iter().map(|e| e.run_id.as_str()).collect::<Vec<_>>(), ["r-broken"]);
    }

    #[tokio::test]
    async fn early_warning_covers_window_after_now() {
        let fx = fixture();
        track(&fx, &running("due-now", at(6, 0))).await;
        track(&fx, &running("inside", at(6, 4))).await;
        track(&fx, &running("at-edge", at(6, 10))).await;
        track(&fx, &running("beyond", at(6, 11))).await;

        let warned = fx.detector.early_warning(at(6, 0)).await.unwrap();
        let ids: Vec<&str> = warned.iter().map(|e| e.run_id.as_str()).collect();
        assert_eq!(ids, ["inside", "at-edge"]);
        assert!(warned.iter().all(|e| e.info.is_some()));
        // Warnings only; nothing is marked or removed.
        assert_eq!(fx.detector.index().count().await.unwrap(), 4);
        assert!(fx.captured.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreadable_index_fails_the_tick() {
        let backend = Arc::new(MemoryCacheBackend::new());
        let store = SqliteStore::open_in_memory().unwrap();
        let detector = BreachDetector::new(
            Arc::new(store),
            DeadlineIndex::new(backend.clone(), "test"),
            Arc::new(EventBus::default()),
            10,
        );
        backend.set_unavailable(true);
        assert!(detector.tick(at(6, 0)).await.is_err());
    }
}
