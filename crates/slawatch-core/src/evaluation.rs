//! SLA evaluation: pure breach and severity classification.
//!
//! [`evaluate`] is the single source of truth for both the completion path
//! and the live detection loop, so a run is judged by the same rules no
//! matter which path decides its breach.

use chrono::{DateTime, Utc};

use crate::model::{BreachType, JobRun, RunStatus, Severity, SlaEvaluation};

/// A run whose duration exceeds the expected duration by this factor breaches.
pub const DURATION_OVERRUN_FACTOR: f64 = 1.5;

/// Map minutes past deadline to a severity (15/30/60 minute breakpoints).
#[must_use]
pub fn severity_for_delay(delay_minutes: i64) -> Severity {
    if delay_minutes > 60 {
        Severity::Critical
    } else if delay_minutes > 30 {
        Severity::High
    } else if delay_minutes > 15 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Minutes the run is (or was) past its deadline, measured at its end time
/// or at `now` while still running. `None` when the run has no deadline.
#[must_use]
pub fn delay_minutes(run: &JobRun, now: DateTime<Utc>) -> Option<i64> {
    let deadline = run.sla_deadline?;
    let reference = run.end_time.unwrap_or(now);
    Some((reference - deadline).num_minutes())
}

/// Evaluate `run` against its SLA at `now`.
#[must_use]
pub fn evaluate(run: &JobRun, now: DateTime<Utc>) -> SlaEvaluation {
    let mut reasons = Vec::new();
    let mut time_exceeded = false;
    let mut duration_exceeded = false;

    if let Some(deadline) = run.sla_deadline {
        if let Some(end) = run.end_time {
            if end > deadline {
                time_exceeded = true;
                reasons.push(format!(
                    "finished {} minutes late",
                    (end - deadline).num_minutes()
                ));
            }
        } else if run.status == RunStatus::Running && now > deadline {
            time_exceeded = true;
            reasons.push(format!(
                "still running {} minutes past deadline",
                (now - deadline).num_minutes()
            ));
        }
    }

    if let (Some(duration), Some(expected)) = (run.duration_ms, run.expected_duration_ms) {
        if duration as f64 > expected as f64 * DURATION_OVERRUN_FACTOR {
            duration_exceeded = true;
            reasons.push("duration significantly exceeded".to_string());
        }
    }

    if matches!(run.status, RunStatus::Failed | RunStatus::Timeout) {
        reasons.push(format!("run status: {}", run.status));
    }

    let breached = !reasons.is_empty();
    let breach_type = match run.status {
        RunStatus::Failed => BreachType::Failed,
        RunStatus::Timeout => BreachType::Timeout,
        _ if time_exceeded => BreachType::TimeExceeded,
        _ if duration_exceeded => BreachType::DurationExceeded,
        _ => BreachType::Unknown,
    };

    let severity = if !breached {
        Severity::Low
    } else if run.status == RunStatus::Failed {
        Severity::Critical
    } else {
        delay_minutes(run, now).map_or(Severity::Medium, severity_for_delay)
    };

    SlaEvaluation {
        breached,
        reason: breached.then(|| reasons.join("; ")),
        severity,
        breach_type,
    }
}
