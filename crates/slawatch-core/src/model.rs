//! Domain types: job definitions, runs, breach events and the read-side DTOs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sla_time;

macro_rules! db_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Canonical upper-case spelling used in storage and on the wire.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(concat!("invalid ", stringify!($name), ": {}"), other)),
                }
            }
        }
    };
}

db_enum!(
    /// Scheduling cadence of a calculator; also selects the partition pruning rule.
    Frequency { Daily => "DAILY", Monthly => "MONTHLY" }
);

db_enum!(
    RunStatus {
        Running => "RUNNING",
        Success => "SUCCESS",
        Failed => "FAILED",
        Timeout => "TIMEOUT",
        Cancelled => "CANCELLED",
    }
);

impl RunStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

db_enum!(
    BreachType {
        TimeExceeded => "TIME_EXCEEDED",
        DurationExceeded => "DURATION_EXCEEDED",
        Failed => "FAILED",
        Timeout => "TIMEOUT",
        Unknown => "UNKNOWN",
    }
);

db_enum!(
    AlertStatus {
        Pending => "PENDING",
        Sent => "SENT",
        Failed => "FAILED",
        Retrying => "RETRYING",
    }
);

/// Breach severity, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(format!("invalid Severity: {other}")),
        }
    }
}

/// Catalog entry for a calculator. Owned by administrators, read-mostly here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    pub calculator_id: String,
    pub name: String,
    pub description: Option<String>,
    pub frequency: Frequency,
    pub sla_target_duration_ms: Option<i64>,
    /// CET/CEST wall-clock time by which a run should finish.
    pub sla_time_of_day: Option<NaiveTime>,
    pub owner_team: Option<String>,
    pub active: bool,
}

/// One execution of a calculator for a reporting date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRun {
    pub run_id: String,
    pub calculator_id: String,
    pub calculator_name: String,
    pub tenant_id: String,
    pub frequency: Frequency,
    pub reporting_date: NaiveDate,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: RunStatus,
    pub sla_deadline: Option<DateTime<Utc>>,
    pub sla_breached: bool,
    pub sla_breach_reason: Option<String>,
    pub expected_duration_ms: Option<i64>,
    pub estimated_end_time: Option<DateTime<Utc>>,
    pub run_parameters: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRun {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    /// Key of the (calculator, tenant) pair used by every cache tier.
    #[must_use]
    pub fn cache_key(&self) -> CalculatorKey {
        CalculatorKey::new(&self.calculator_id, &self.tenant_id)
    }
}

/// (calculatorId, tenantId) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CalculatorKey {
    pub calculator_id: String,
    pub tenant_id: String,
}

impl CalculatorKey {
    #[must_use]
    pub fn new(calculator_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            calculator_id: calculator_id.into(),
            tenant_id: tenant_id.into(),
        }
    }
}

impl fmt::Display for CalculatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.calculator_id, self.tenant_id)
    }
}

/// Durable record of a breach; `run_id` is unique and acts as the idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreachEvent {
    /// Assigned by the store on insert.
    pub breach_id: Option<i64>,
    pub run_id: String,
    pub calculator_id: String,
    pub calculator_name: String,
    pub tenant_id: String,
    pub breach_type: BreachType,
    pub severity: Severity,
    pub expected_value: Option<i64>,
    pub actual_value: Option<i64>,
    pub reason: Option<String>,
    pub alerted: bool,
    pub alerted_at: Option<DateTime<Utc>>,
    pub alert_status: AlertStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Time of the last alert state change.
    pub updated_at: DateTime<Utc>,
}

impl BreachEvent {
    /// Build a new PENDING breach for a run from its evaluation.
    #[must_use]
    pub fn for_run(run: &JobRun, evaluation: &SlaEvaluation, now: DateTime<Utc>) -> Self {
        let (expected_value, actual_value) = match evaluation.breach_type {
            BreachType::DurationExceeded => (run.expected_duration_ms, run.duration_ms),
            _ => (
                run.sla_deadline.map(|d| d.timestamp()),
                Some(run.end_time.unwrap_or(now).timestamp()),
            ),
        };
        Self {
            breach_id: None,
            run_id: run.run_id.clone(),
            calculator_id: run.calculator_id.clone(),
            calculator_name: run.calculator_name.clone(),
            tenant_id: run.tenant_id.clone(),
            breach_type: evaluation.breach_type,
            severity: evaluation.severity,
            expected_value,
            actual_value,
            reason: evaluation.reason.clone(),
            alerted: false,
            alerted_at: None,
            alert_status: AlertStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome of evaluating a run against its SLA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaEvaluation {
    pub breached: bool,
    /// Triggered reasons joined with `"; "`; `None` when not breached.
    pub reason: Option<String>,
    pub severity: Severity,
    pub breach_type: BreachType,
}

/// Per (calculator, tenant, reporting date) roll-up maintained on completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyAggregate {
    pub calculator_id: String,
    pub tenant_id: String,
    pub reporting_date: NaiveDate,
    pub total_runs: i64,
    pub success_runs: i64,
    pub sla_breaches: i64,
    pub avg_duration_ms: i64,
    /// Average CET start, minutes since midnight.
    pub avg_start_min_cet: i64,
    pub avg_end_min_cet: i64,
}

/// Status of one run as shown to dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatusInfo {
    pub run_id: String,
    pub status: RunStatus,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub estimated_start: Option<DateTime<Utc>>,
    pub estimated_end: Option<DateTime<Utc>>,
    pub sla: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub duration_formatted: Option<String>,
    pub sla_breached: bool,
    pub sla_breach_reason: Option<String>,
}

impl From<&JobRun> for RunStatusInfo {
    fn from(run: &JobRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            status: run.status,
            start: run.start_time,
            end: run.end_time,
            estimated_start: Some(run.start_time),
            estimated_end: run.estimated_end_time,
            sla: run.sla_deadline,
            duration_ms: run.duration_ms,
            duration_formatted: run.duration_ms.map(sla_time::format_duration),
            sla_breached: run.sla_breached,
            sla_breach_reason: run.sla_breach_reason.clone(),
        }
    }
}

/// Precomputed status view for one calculator: latest run plus recent history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculatorStatusResponse {
    pub calculator_id: String,
    pub calculator_name: String,
    pub tenant_id: String,
    /// Time the response was computed from the store.
    pub last_refreshed: DateTime<Utc>,
    pub current: RunStatusInfo,
    pub history: Vec<RunStatusInfo>,
}

impl CalculatorStatusResponse {
    /// Build a response from runs ordered newest first. `None` when `runs` is empty.
    #[must_use]
    pub fn from_runs(runs: &[JobRun], now: DateTime<Utc>) -> Option<Self> {
        let (current, history) = runs.split_first()?;
        Some(Self {
            calculator_id: current.calculator_id.clone(),
            calculator_name: current.calculator_name.clone(),
            tenant_id: current.tenant_id.clone(),
            last_refreshed: now,
            current: RunStatusInfo::from(current),
            history: history.iter().map(RunStatusInfo::from).collect(),
        })
    }

    #[must_use]
    pub fn current_is_running(&self) -> bool {
        self.current.status == RunStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_run(run_id: &str, status: RunStatus) -> JobRun {
        let start = Utc.with_ymd_and_hms(2024, 1, 10, 4, 0, 0).unwrap();
        JobRun {
            run_id: run_id.to_string(),
            calculator_id: "calc-1".into(),
            calculator_name: "FX Rates".into(),
            tenant_id: "t1".into(),
            frequency: Frequency::Daily,
            reporting_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            start_time: start,
            end_time: None,
            duration_ms: Some(65_000),
            status,
            sla_deadline: None,
            sla_breached: false,
            sla_breach_reason: None,
            expected_duration_ms: None,
            estimated_end_time: None,
            run_parameters: None,
            created_at: start,
            updated_at: start,
        }
    }

    #[test]
    fn enums_parse_their_storage_spelling() {
        for status in [
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Failed,
            RunStatus::Timeout,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert_eq!("monthly".parse::<Frequency>().unwrap(), Frequency::Monthly);
        assert_eq!(
            "TIME_EXCEEDED".parse::<BreachType>().unwrap(),
            BreachType::TimeExceeded
        );
        assert!("WEEKLY".parse::<Frequency>().is_err());
    }

    #[test]
    fn severity_orders_by_urgency() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn only_running_is_non_terminal() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_info_formats_duration() {
        let info = RunStatusInfo::from(&sample_run("r1", RunStatus::Success));
        assert_eq!(info.duration_formatted.as_deref(), Some("1m 5s"));
    }

    #[test]
    fn response_splits_current_and_history() {
        let runs = vec![
            sample_run("r3", RunStatus::Running),
            sample_run("r2", RunStatus::Success),
            sample_run("r1", RunStatus::Failed),
        ];
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 5, 0, 0).unwrap();
        let response = CalculatorStatusResponse::from_runs(&runs, now).unwrap();
        assert_eq!(response.current.run_id, "r3");
        assert_eq!(response.history.len(), 2);
        assert!(response.current_is_running());
        assert!(CalculatorStatusResponse::from_runs(&[], now).is_none());
    }

    #[test]
    fn wire_format_uses_camel_case_and_upper_enums() {
        let json = serde_json::to_value(sample_run("r1", RunStatus::Running)).unwrap();
        assert_eq!(json["runId"], "r1");
        assert_eq!(json["status"], "RUNNING");
        assert_eq!(json["frequency"], "DAILY");
    }
}
