//! Shared test infrastructure for slawatch-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};

use slawatch_core::Services;
use slawatch_core::alert_sink::AlertSink;
use slawatch_core::cache::MemoryCacheBackend;
use slawatch_core::clock::ManualClock;
use slawatch_core::config::Config;
use slawatch_core::error::AlertError;
use slawatch_core::ingestion::{CompleteRun, StartRun};
use slawatch_core::model::{BreachEvent, Frequency, JobRun, RunStatus};
use slawatch_core::store::SqliteStore;

/// 2024-01-10 (CET winter time) at `h:m` UTC.
pub fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 10, h, m, 0).unwrap()
}

pub fn reporting_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()
}

/// Start trigger for a DAILY run of `calculator_id` at 04:00 UTC with a
/// 06:15 CET deadline (05:15 UTC).
pub fn start(run_id: &str, calculator_id: &str) -> StartRun {
    StartRun {
        run_id: run_id.into(),
        calculator_id: calculator_id.into(),
        calculator_name: Some(format!("Calculator {calculator_id}")),
        tenant_id: "t1".into(),
        frequency: Frequency::Daily,
        reporting_date: reporting_date(),
        start_time: at(4, 0),
        sla_time_of_day: NaiveTime::from_hms_opt(6, 15, 0),
        expected_duration_ms: None,
        run_parameters: None,
    }
}

pub fn complete(run_id: &str, end: DateTime<Utc>) -> CompleteRun {
    CompleteRun {
        run_id: run_id.into(),
        tenant_id: "t1".into(),
        end_time: end,
        status: None,
    }
}

/// Settled run written straight to the store.
pub fn finished_run(run_id: &str, calculator_id: &str) -> JobRun {
    JobRun {
        run_id: run_id.into(),
        calculator_id: calculator_id.into(),
        calculator_name: format!("Calculator {calculator_id}"),
        tenant_id: "t1".into(),
        frequency: Frequency::Daily,
        reporting_date: reporting_date(),
        start_time: at(4, 0),
        end_time: Some(at(5, 0)),
        duration_ms: Some(3_600_000),
        status: RunStatus::Success,
        sla_deadline: Some(at(5, 15)),
        sla_breached: false,
        sla_breach_reason: None,
        expected_duration_ms: None,
        estimated_end_time: None,
        run_parameters: None,
        created_at: at(4, 0),
        updated_at: at(5, 0),
    }
}

/// Sink that records what it was asked to deliver and can be told to fail.
#[derive(Default)]
pub struct RecordingSink {
    pub delivered: Mutex<Vec<BreachEvent>>,
    pub calls: AtomicU32,
    failing: Mutex<Option<u16>>,
}

impl RecordingSink {
    /// Reject every send with `status` until cleared with `None`.
    pub fn fail_with(&self, status: Option<u16>) {
        *self.failing.lock().unwrap() = status;
    }

    pub fn delivered(&self) -> Vec<BreachEvent> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, breach: &BreachEvent, _run: &JobRun) -> Result<(), AlertError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = *self.failing.lock().unwrap() {
            return Err(AlertError::Rejected { status });
        }
        self.delivered.lock().unwrap().push(breach.clone());
        Ok(())
    }
}

pub struct Node {
    pub services: Services,
    pub clock: Arc<ManualClock>,
    pub backend: Arc<MemoryCacheBackend>,
    pub sink: Arc<RecordingSink>,
}

/// Config with fast retries and inline event dispatch.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.alerting.initial_delay_ms = 1;
    config.alerting.max_delay_ms = 2;
    config.alerting.jitter_percent = 0.0;
    config.alerting.max_attempts = 2;
    config
}

/// Fully wired services over an in-memory store and cache at 04:00 UTC.
pub fn node() -> Node {
    node_with(&test_config())
}

pub fn node_with(config: &Config) -> Node {
    let clock = Arc::new(ManualClock::new(at(4, 0)));
    let backend = Arc::new(MemoryCacheBackend::new());
    let sink = Arc::new(RecordingSink::default());
    let services = Services::assemble(
        config,
        SqliteStore::open_in_memory().unwrap(),
        backend.clone(),
        sink.clone(),
        clock.clone(),
    );
    Node {
        services,
        clock,
        backend,
        sink,
    }
}
