//! SQLite-backed canonical store.
//!
//! One connection behind a mutex; every call runs inside
//! `tokio::task::spawn_blocking` and is bounded by the configured command
//! timeout. `calculator_runs` is keyed by `(run_id, reporting_date)` with
//! reporting dates stored as ISO text, so every run query prunes on
//! `reporting_date` the same way a partitioned engine would.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use tracing::debug;

use super::partition::{PartitionWindow, recent_lookup_dates};
use super::{
    AggregateStore, BreachStore, CreateOutcome, JobCatalog, RunStore, StoreStats,
    StoreStatsSnapshot,
};
use crate::error::{Error, Result, StoreError};
use crate::model::{
    BreachEvent, CalculatorKey, DailyAggregate, Frequency, JobDefinition, JobRun, RunStatus,
};
use crate::sla_time;

/// Schema bootstrap, applied on open.
pub const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS calculators (
    calculator_id          TEXT PRIMARY KEY,
    name                   TEXT NOT NULL,
    description            TEXT,
    frequency              TEXT NOT NULL,
    sla_target_duration_ms INTEGER,
    sla_time_of_day        TEXT,
    owner_team             TEXT,
    active                 INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS calculator_runs (
    run_id               TEXT NOT NULL,
    calculator_id        TEXT NOT NULL,
    calculator_name      TEXT NOT NULL,
    tenant_id            TEXT NOT NULL,
    frequency            TEXT NOT NULL,
    reporting_date       TEXT NOT NULL,
    start_time           INTEGER NOT NULL,
    end_time             INTEGER,
    duration_ms          INTEGER,
    status               TEXT NOT NULL,
    sla_deadline         INTEGER,
    sla_breached         INTEGER NOT NULL DEFAULT 0,
    sla_breach_reason    TEXT,
    expected_duration_ms INTEGER,
    estimated_end_time   INTEGER,
    run_parameters       TEXT,
    created_at           INTEGER NOT NULL,
    updated_at           INTEGER NOT NULL,
    PRIMARY KEY (run_id, reporting_date)
);

CREATE INDEX IF NOT EXISTS idx_runs_calculator
    ON calculator_runs (calculator_id, tenant_id, frequency, reporting_date DESC, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_runs_status
    ON calculator_runs (status, reporting_date);

CREATE TABLE IF NOT EXISTS sla_breach_events (
    breach_id       INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id          TEXT NOT NULL UNIQUE,
    calculator_id   TEXT NOT NULL,
    calculator_name TEXT NOT NULL,
    tenant_id       TEXT NOT NULL,
    breach_type     TEXT NOT NULL,
    severity        TEXT NOT NULL,
    expected_value  INTEGER,
    actual_value    INTEGER,
    reason          TEXT,
    alerted         INTEGER NOT NULL DEFAULT 0,
    alerted_at      INTEGER,
    alert_status    TEXT NOT NULL DEFAULT 'PENDING',
    retry_count     INTEGER NOT NULL DEFAULT 0,
    last_error      TEXT,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_breach_alert_status
    ON sla_breach_events (alert_status, created_at);

CREATE TABLE IF NOT EXISTS calculator_sli_daily (
    calculator_id     TEXT NOT NULL,
    tenant_id         TEXT NOT NULL,
    reporting_date    TEXT NOT NULL,
    total_runs        INTEGER NOT NULL,
    success_runs      INTEGER NOT NULL,
    sla_breaches      INTEGER NOT NULL,
    avg_duration_ms   INTEGER NOT NULL,
    avg_start_min_cet INTEGER NOT NULL,
    avg_end_min_cet   INTEGER NOT NULL,
    computed_at       INTEGER NOT NULL,
    PRIMARY KEY (calculator_id, tenant_id, reporting_date)
);
";

const RUN_COLUMNS: &str = "run_id, calculator_id, calculator_name, tenant_id, frequency, \
     reporting_date, start_time, end_time, duration_ms, status, sla_deadline, sla_breached, \
     sla_breach_reason, expected_duration_ms, estimated_end_time, run_parameters, created_at, \
     updated_at";

const BREACH_COLUMNS: &str = "breach_id, run_id, calculator_id, calculator_name, tenant_id, \
     breach_type, severity, expected_value, actual_value, reason, alerted, alerted_at, \
     alert_status, retry_count, last_error, created_at, updated_at";

const DEFINITION_COLUMNS: &str = "calculator_id, name, description, frequency, \
     sla_target_duration_ms, sla_time_of_day, owner_team, active";

/// SQLite implementation of every store contract.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    command_timeout: Duration,
    stats: Arc<StoreStats>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("command_timeout", &self.command_timeout)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl SqliteStore {
    /// Open (or create) the database at `path`; `:memory:` opens an ephemeral store.
    pub fn open(path: &str, command_timeout: Duration) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory().map_err(StoreError::from)?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let conn = Connection::open(path).map_err(StoreError::from)?;
            conn.execute_batch("PRAGMA journal_mode=WAL;")
                .map_err(StoreError::from)?;
            conn
        };
        conn.execute_batch("PRAGMA busy_timeout=5000;")
            .map_err(StoreError::from)?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| StoreError::SchemaFailed(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            command_timeout,
            stats: Arc::new(StoreStats::default()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:", Duration::from_secs(2))
    }

    /// Run `f` against the connection on the blocking pool, bounded by the command timeout.
    ///
    /// The timeout only stops the wait. A blocking task cannot be cancelled,
    /// so `f` still runs to completion and a write may commit after the
    /// caller saw [`Error::Timeout`]. Treat a timed-out write as an unknown
    /// outcome; every write here is keyed and safe to repeat.
    async fn call<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> std::result::Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = match conn.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            f(&mut guard)
        });

        match tokio::time::timeout(self.command_timeout, task).await {
            Ok(Ok(result)) => result.map_err(Error::from),
            Ok(Err(join)) => Err(StoreError::Join(format!("task join: {join}")).into()),
            Err(_) => Err(Error::Timeout {
                operation,
                timeout_ms: self.command_timeout.as_millis() as u64,
            }),
        }
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn date_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: chrono::ParseError| conversion_error(idx, format!("{raw}: {e}")))
}

fn instant_from_ms(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| conversion_error(idx, format!("timestamp out of range: {ms}")))
}

fn instant_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    instant_from_ms(idx, row.get(idx)?)
}

fn opt_instant_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|ms| instant_from_ms(idx, ms))
        .transpose()
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<JobRun> {
    Ok(JobRun {
        run_id: row.get(0)?,
        calculator_id: row.get(1)?,
        calculator_name: row.get(2)?,
        tenant_id: row.get(3)?,
        frequency: parsed(row, 4)?,
        reporting_date: date_at(row, 5)?,
        start_time: instant_at(row, 6)?,
        end_time: opt_instant_at(row, 7)?,
        duration_ms: row.get(8)?,
        status: parsed(row, 9)?,
        sla_deadline: opt_instant_at(row, 10)?,
        sla_breached: row.get(11)?,
        sla_breach_reason: row.get(12)?,
        expected_duration_ms: row.get(13)?,
        estimated_end_time: opt_instant_at(row, 14)?,
        run_parameters: row.get(15)?,
        created_at: instant_at(row, 16)?,
        updated_at: instant_at(row, 17)?,
    })
}

fn breach_from_row(row: &Row<'_>) -> rusqlite::Result<BreachEvent> {
    Ok(BreachEvent {
        breach_id: row.get(0)?,
        run_id: row.get(1)?,
        calculator_id: row.get(2)?,
        calculator_name: row.get(3)?,
        tenant_id: row.get(4)?,
        breach_type: parsed(row, 5)?,
        severity: parsed(row, 6)?,
        expected_value: row.get(7)?,
        actual_value: row.get(8)?,
        reason: row.get(9)?,
        alerted: row.get(10)?,
        alerted_at: opt_instant_at(row, 11)?,
        alert_status: parsed(row, 12)?,
        retry_count: row.get(13)?,
        last_error: row.get(14)?,
        created_at: instant_at(row, 15)?,
        updated_at: instant_at(row, 16)?,
    })
}

fn definition_from_row(row: &Row<'_>) -> rusqlite::Result<JobDefinition> {
    let sla_time_of_day = row
        .get::<_, Option<String>>(5)?
        .map(|raw| {
            NaiveTime::parse_from_str(&raw, "%H:%M:%S")
                .map_err(|e| conversion_error(5, format!("{raw}: {e}")))
        })
        .transpose()?;
    Ok(JobDefinition {
        calculator_id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        frequency: parsed(row, 3)?,
        sla_target_duration_ms: row.get(4)?,
        sla_time_of_day,
        owner_team: row.get(6)?,
        active: row.get(7)?,
    })
}

fn aggregate_from_row(row: &Row<'_>) -> rusqlite::Result<DailyAggregate> {
    Ok(DailyAggregate {
        calculator_id: row.get(0)?,
        tenant_id: row.get(1)?,
        reporting_date: date_at(row, 2)?,
        total_runs: row.get(3)?,
        success_runs: row.get(4)?,
        sla_breaches: row.get(5)?,
        avg_duration_ms: row.get(6)?,
        avg_start_min_cet: row.get(7)?,
        avg_end_min_cet: row.get(8)?,
    })
}

fn ms(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_millis()
}

// =============================================================================
// SQLite operations (sync, run inside spawn_blocking)
// =============================================================================

fn select_run_on(
    conn: &Connection,
    run_id: &str,
    reporting_date: NaiveDate,
) -> rusqlite::Result<Option<JobRun>> {
    conn.query_row(
        &format!(
            "SELECT {RUN_COLUMNS} FROM calculator_runs WHERE run_id = ?1 AND reporting_date = ?2"
        ),
        params![run_id, reporting_date.to_string()],
        run_from_row,
    )
    .optional()
}

fn select_run_any(conn: &Connection, run_id: &str) -> rusqlite::Result<Option<JobRun>> {
    conn.query_row(
        &format!(
            "SELECT {RUN_COLUMNS} FROM calculator_runs WHERE run_id = ?1 \
             ORDER BY reporting_date DESC LIMIT 1"
        ),
        [run_id],
        run_from_row,
    )
    .optional()
}

fn select_run_in(
    conn: &Connection,
    run_id: &str,
    window: &PartitionWindow,
) -> rusqlite::Result<Option<JobRun>> {
    let (window_sql, window_params) = window.to_sql("reporting_date");
    let sql = format!(
        "SELECT {RUN_COLUMNS} FROM calculator_runs WHERE run_id = ? AND {window_sql} \
         ORDER BY reporting_date DESC LIMIT 1"
    );
    let mut values = vec![Value::Text(run_id.to_string())];
    values.extend(window_params.into_iter().map(Value::Text));
    conn.query_row(&sql, params_from_iter(values.iter()), run_from_row)
        .optional()
}

fn upsert_run_sync(conn: &Connection, run: &JobRun) -> std::result::Result<JobRun, StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO calculator_runs ({RUN_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
             ON CONFLICT (run_id, reporting_date) DO UPDATE SET
                 end_time = excluded.end_time,
                 duration_ms = excluded.duration_ms,
                 status = excluded.status,
                 sla_breached = MAX(calculator_runs.sla_breached, excluded.sla_breached),
                 sla_breach_reason = COALESCE(calculator_runs.sla_breach_reason, excluded.sla_breach_reason),
                 estimated_end_time = excluded.estimated_end_time,
                 updated_at = excluded.updated_at
             WHERE calculator_runs.status = 'RUNNING'"
        ),
        params![
            run.run_id,
            run.calculator_id,
            run.calculator_name,
            run.tenant_id,
            run.frequency.as_str(),
            run.reporting_date.to_string(),
            ms(run.start_time),
            run.end_time.map(ms),
            run.duration_ms,
            run.status.as_str(),
            run.sla_deadline.map(ms),
            run.sla_breached,
            run.sla_breach_reason,
            run.expected_duration_ms,
            run.estimated_end_time.map(ms),
            run.run_parameters,
            ms(run.created_at),
            ms(run.updated_at),
        ],
    )?;

    select_run_on(conn, &run.run_id, run.reporting_date)?.ok_or_else(|| {
        StoreError::Database(format!("run {} missing after upsert", run.run_id))
    })
}

fn query_recent_sync(
    conn: &Connection,
    key: &CalculatorKey,
    frequency: Frequency,
    window: &PartitionWindow,
    limit: usize,
) -> rusqlite::Result<Vec<JobRun>> {
    let (window_sql, window_params) = window.to_sql("reporting_date");
    let sql = format!(
        "SELECT {RUN_COLUMNS} FROM calculator_runs
         WHERE calculator_id = ? AND tenant_id = ? AND frequency = ? AND {window_sql}
         ORDER BY reporting_date DESC, created_at DESC
         LIMIT ?"
    );
    let mut values = vec![
        Value::Text(key.calculator_id.clone()),
        Value::Text(key.tenant_id.clone()),
        Value::Text(frequency.as_str().to_string()),
    ];
    values.extend(window_params.into_iter().map(Value::Text));
    values.push(Value::Integer(limit as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), run_from_row)?;
    rows.collect()
}

fn query_batch_sync(
    conn: &Connection,
    calculator_ids: &[String],
    tenant_id: &str,
    frequency: Frequency,
    window: &PartitionWindow,
    limit: usize,
) -> rusqlite::Result<HashMap<String, Vec<JobRun>>> {
    let (window_sql, window_params) = window.to_sql("reporting_date");
    let id_placeholders = vec!["?"; calculator_ids.len()].join(", ");
    let sql = format!(
        "SELECT {RUN_COLUMNS} FROM (
             SELECT {RUN_COLUMNS}, ROW_NUMBER() OVER (
                 PARTITION BY calculator_id
                 ORDER BY reporting_date DESC, created_at DESC
             ) AS rn
             FROM calculator_runs
             WHERE calculator_id IN ({id_placeholders})
               AND tenant_id = ? AND frequency = ? AND {window_sql}
         ) ranked
         WHERE rn <= ?
         ORDER BY calculator_id, rn"
    );
    let mut values: Vec<Value> = calculator_ids
        .iter()
        .map(|id| Value::Text(id.clone()))
        .collect();
    values.push(Value::Text(tenant_id.to_string()));
    values.push(Value::Text(frequency.as_str().to_string()));
    values.extend(window_params.into_iter().map(Value::Text));
    values.push(Value::Integer(limit as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), run_from_row)?;
    let mut grouped: HashMap<String, Vec<JobRun>> = HashMap::new();
    for run in rows {
        let run = run?;
        grouped.entry(run.calculator_id.clone()).or_default().push(run);
    }
    Ok(grouped)
}

fn select_breach(conn: &Connection, run_id: &str) -> rusqlite::Result<Option<BreachEvent>> {
    conn.query_row(
        &format!("SELECT {BREACH_COLUMNS} FROM sla_breach_events WHERE run_id = ?1"),
        [run_id],
        breach_from_row,
    )
    .optional()
}

fn create_breach_sync(
    conn: &Connection,
    breach: &BreachEvent,
) -> std::result::Result<CreateOutcome, StoreError> {
    let inserted = conn.execute(
        "INSERT INTO sla_breach_events (
             run_id, calculator_id, calculator_name, tenant_id, breach_type, severity,
             expected_value, actual_value, reason, alerted, alerted_at, alert_status,
             retry_count, last_error, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
         ON CONFLICT (run_id) DO NOTHING",
        params![
            breach.run_id,
            breach.calculator_id,
            breach.calculator_name,
            breach.tenant_id,
            breach.breach_type.as_str(),
            breach.severity.as_str(),
            breach.expected_value,
            breach.actual_value,
            breach.reason,
            breach.alerted,
            breach.alerted_at.map(ms),
            breach.alert_status.as_str(),
            breach.retry_count,
            breach.last_error,
            ms(breach.created_at),
            ms(breach.updated_at),
        ],
    )?;

    let stored = select_breach(conn, &breach.run_id)?.ok_or_else(|| {
        StoreError::Database(format!("breach for run {} missing after insert", breach.run_id))
    })?;
    if inserted == 1 {
        Ok(CreateOutcome::Created(stored))
    } else {
        Ok(CreateOutcome::AlreadyRecorded(stored))
    }
}

fn record_completion_sync(
    conn: &Connection,
    run: &JobRun,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    let start_min = sla_time::cet_minute_of_day(run.start_time);
    let end_min = run.end_time.map_or(start_min, sla_time::cet_minute_of_day);
    conn.execute(
        "INSERT INTO calculator_sli_daily (
             calculator_id, tenant_id, reporting_date, total_runs, success_runs, sla_breaches,
             avg_duration_ms, avg_start_min_cet, avg_end_min_cet, computed_at)
         VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT (calculator_id, tenant_id, reporting_date) DO UPDATE SET
             total_runs = calculator_sli_daily.total_runs + 1,
             success_runs = calculator_sli_daily.success_runs + excluded.success_runs,
             sla_breaches = calculator_sli_daily.sla_breaches + excluded.sla_breaches,
             avg_duration_ms = (calculator_sli_daily.avg_duration_ms * calculator_sli_daily.total_runs
                                + excluded.avg_duration_ms) / (calculator_sli_daily.total_runs + 1),
             avg_start_min_cet = (calculator_sli_daily.avg_start_min_cet * calculator_sli_daily.total_runs
                                  + excluded.avg_start_min_cet) / (calculator_sli_daily.total_runs + 1),
             avg_end_min_cet = (calculator_sli_daily.avg_end_min_cet * calculator_sli_daily.total_runs
                                + excluded.avg_end_min_cet) / (calculator_sli_daily.total_runs + 1),
             computed_at = excluded.computed_at",
        params![
            run.calculator_id,
            run.tenant_id,
            run.reporting_date.to_string(),
            i64::from(run.status == RunStatus::Success),
            i64::from(run.sla_breached),
            run.duration_ms.unwrap_or(0),
            start_min,
            end_min,
            ms(now),
        ],
    )?;
    Ok(())
}

// =============================================================================
// Trait implementations
// =============================================================================

#[async_trait]
impl RunStore for SqliteStore {
    async fn get_by_id(&self, run_id: &str) -> Result<Option<JobRun>> {
        self.stats.record_lookup();
        let run_id = run_id.to_string();
        self.call("get_by_id", move |conn| Ok(select_run_any(conn, &run_id)?))
            .await
    }

    async fn get_by_id_on(
        &self,
        run_id: &str,
        reporting_date: NaiveDate,
    ) -> Result<Option<JobRun>> {
        self.stats.record_lookup();
        let run_id = run_id.to_string();
        self.call("get_by_id_on", move |conn| {
            Ok(select_run_on(conn, &run_id, reporting_date)?)
        })
        .await
    }

    async fn find_recent(&self, run_id: &str, today: NaiveDate) -> Result<Option<JobRun>> {
        self.stats.record_lookup();
        let run_id = run_id.to_string();
        self.call("find_recent", move |conn| {
            let window = PartitionWindow::Dates(recent_lookup_dates(today));
            if let Some(run) = select_run_in(conn, &run_id, &window)? {
                return Ok(Some(run));
            }
            debug!(run_id = %run_id, "Run not in recent partitions, falling back to full lookup");
            Ok(select_run_any(conn, &run_id)?)
        })
        .await
    }

    async fn upsert(&self, run: &JobRun) -> Result<JobRun> {
        self.stats.record_write();
        let run = run.clone();
        self.call("upsert", move |conn| upsert_run_sync(conn, &run))
            .await
    }

    async fn query_recent(
        &self,
        key: &CalculatorKey,
        frequency: Frequency,
        today: NaiveDate,
        limit: usize,
    ) -> Result<Vec<JobRun>> {
        self.stats.record_recent();
        let key = key.clone();
        self.call("query_recent", move |conn| {
            let window = PartitionWindow::for_frequency(frequency, today);
            Ok(query_recent_sync(conn, &key, frequency, &window, limit)?)
        })
        .await
    }

    async fn query_batch_recent(
        &self,
        calculator_ids: &[String],
        tenant_id: &str,
        frequency: Frequency,
        today: NaiveDate,
        limit: usize,
    ) -> Result<HashMap<String, Vec<JobRun>>> {
        if calculator_ids.is_empty() {
            return Ok(HashMap::new());
        }
        self.stats.record_batch(calculator_ids.len());
        let calculator_ids = calculator_ids.to_vec();
        let tenant_id = tenant_id.to_string();
        self.call("query_batch_recent", move |conn| {
            let window = PartitionWindow::for_frequency(frequency, today);
            Ok(query_batch_sync(
                conn,
                &calculator_ids,
                &tenant_id,
                frequency,
                &window,
                limit,
            )?)
        })
        .await
    }

    async fn conditional_mark_breached(
        &self,
        run_id: &str,
        reporting_date: NaiveDate,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.stats.record_write();
        let run_id = run_id.to_string();
        let reason = reason.to_string();
        self.call("conditional_mark_breached", move |conn| {
            let changed = conn.execute(
                "UPDATE calculator_runs
                 SET sla_breached = 1, sla_breach_reason = ?1, updated_at = ?2
                 WHERE run_id = ?3 AND reporting_date = ?4
                   AND status = 'RUNNING' AND sla_breached = 0",
                params![reason, ms(now), run_id, reporting_date.to_string()],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn count_running(&self, since: NaiveDate) -> Result<u64> {
        self.stats.record_lookup();
        self.call("count_running", move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM calculator_runs
                 WHERE status = 'RUNNING' AND reporting_date >= ?1",
                [since.to_string()],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    fn stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot()
    }
}

#[async_trait]
impl BreachStore for SqliteStore {
    async fn create(&self, breach: &BreachEvent) -> Result<CreateOutcome> {
        let breach = breach.clone();
        self.call("create_breach", move |conn| create_breach_sync(conn, &breach))
            .await
    }

    async fn get_by_run_id(&self, run_id: &str) -> Result<Option<BreachEvent>> {
        let run_id = run_id.to_string();
        self.call("get_breach", move |conn| Ok(select_breach(conn, &run_id)?))
            .await
    }

    async fn find_unalerted(
        &self,
        limit: usize,
        retrying_before: DateTime<Utc>,
    ) -> Result<Vec<BreachEvent>> {
        self.call("find_unalerted", move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BREACH_COLUMNS} FROM sla_breach_events
                 WHERE alert_status IN ('PENDING', 'FAILED')
                    OR (alert_status = 'RETRYING' AND updated_at < ?2)
                 ORDER BY created_at ASC, breach_id ASC
                 LIMIT ?1"
            ))?;
            let rows = stmt.query_map(
                params![limit as i64, ms(retrying_before)],
                breach_from_row,
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn update_alert_state(&self, breach: &BreachEvent) -> Result<()> {
        let Some(breach_id) = breach.breach_id else {
            return Err(StoreError::InvalidValue {
                column: "breach_id",
                value: format!("unset for run {}", breach.run_id),
            }
            .into());
        };
        let breach = breach.clone();
        self.call("update_alert_state", move |conn| {
            conn.execute(
                "UPDATE sla_breach_events
                 SET alerted = ?1, alerted_at = ?2, alert_status = ?3, retry_count = ?4,
                     last_error = ?5, updated_at = ?6
                 WHERE breach_id = ?7",
                params![
                    breach.alerted,
                    breach.alerted_at.map(ms),
                    breach.alert_status.as_str(),
                    breach.retry_count,
                    breach.last_error,
                    ms(breach.updated_at),
                    breach_id,
                ],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl JobCatalog for SqliteStore {
    async fn get_definition(&self, calculator_id: &str) -> Result<Option<JobDefinition>> {
        let calculator_id = calculator_id.to_string();
        self.call("get_definition", move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {DEFINITION_COLUMNS} FROM calculators WHERE calculator_id = ?1"
                    ),
                    [calculator_id],
                    definition_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn save_definition(&self, definition: &JobDefinition) -> Result<()> {
        let definition = definition.clone();
        self.call("save_definition", move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO calculators ({DEFINITION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT (calculator_id) DO UPDATE SET
                         name = excluded.name,
                         description = excluded.description,
                         frequency = excluded.frequency,
                         sla_target_duration_ms = excluded.sla_target_duration_ms,
                         sla_time_of_day = excluded.sla_time_of_day,
                         owner_team = excluded.owner_team,
                         active = excluded.active"
                ),
                params![
                    definition.calculator_id,
                    definition.name,
                    definition.description,
                    definition.frequency.as_str(),
                    definition.sla_target_duration_ms,
                    definition
                        .sla_time_of_day
                        .map(|t| t.format("%H:%M:%S").to_string()),
                    definition.owner_team,
                    definition.active,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_active(&self) -> Result<Vec<JobDefinition>> {
        self.call("list_active", move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DEFINITION_COLUMNS} FROM calculators WHERE active = 1
                 ORDER BY calculator_id"
            ))?;
            let rows = stmt.query_map([], definition_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

#[async_trait]
impl AggregateStore for SqliteStore {
    async fn upsert_daily(&self, run: &JobRun, now: DateTime<Utc>) -> Result<()> {
        let run = run.clone();
        self.call("upsert_daily", move |conn| {
            Ok(record_completion_sync(conn, &run, now)?)
        })
        .await
    }

    async fn recent_aggregates(
        &self,
        key: &CalculatorKey,
        since: NaiveDate,
    ) -> Result<Vec<DailyAggregate>> {
        let key = key.clone();
        self.call("recent_aggregates", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT calculator_id, tenant_id, reporting_date, total_runs, success_runs,
                        sla_breaches, avg_duration_ms, avg_start_min_cet, avg_end_min_cet
                 FROM calculator_sli_daily
                 WHERE calculator_id = ?1 AND tenant_id = ?2 AND reporting_date >= ?3
                 ORDER BY reporting_date DESC",
            )?;
            let rows = stmt.query_map(
                params![key.calculator_id, key.tenant_id, since.to_string()],
                aggregate_from_row,
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}
