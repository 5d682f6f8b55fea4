//! Property-based tests for SLA evaluation, cache TTLs, CET deadline
//! arithmetic and deadline index ordering.

mod common;

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use proptest::prelude::*;

use common::finished_run;
use slawatch_core::cache::MemoryCacheBackend;
use slawatch_core::cache::runs::{
    COMPLETED_TTL, MONTHLY_COMPLETED_TTL, RECENTLY_COMPLETED_TTL, RUNNING_TTL, ttl_for,
};
use slawatch_core::deadline_index::DeadlineIndex;
use slawatch_core::evaluation::{evaluate, severity_for_delay};
use slawatch_core::model::{BreachType, Frequency, JobRun, RunStatus, Severity};
use slawatch_core::sla_time::sla_deadline;

// =========================================================================
// Strategies
// =========================================================================

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 10, 4, 0, 0).unwrap()
}

fn arb_instant() -> impl Strategy<Value = DateTime<Utc>> {
    // 2020-01-01 .. 2030-01-01, whole seconds.
    (1_577_836_800_i64..1_893_456_000).prop_map(|s| Utc.timestamp_opt(s, 0).unwrap())
}

fn arb_time_of_day() -> impl Strategy<Value = NaiveTime> {
    (0_u32..24, 0_u32..60).prop_map(|(h, m)| NaiveTime::from_hms_opt(h, m, 0).unwrap())
}

fn arb_frequency() -> impl Strategy<Value = Frequency> {
    prop_oneof![Just(Frequency::Daily), Just(Frequency::Monthly)]
}

fn running_with_deadline(deadline: DateTime<Utc>) -> JobRun {
    JobRun {
        status: RunStatus::Running,
        end_time: None,
        duration_ms: None,
        sla_deadline: Some(deadline),
        ..finished_run("r1", "c1")
    }
}

// =========================================================================
// Severity table
// =========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Severity never decreases as the delay grows.
    #[test]
    fn prop_severity_is_monotonic(a in -1_000_i64..1_000, b in -1_000_i64..1_000) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(severity_for_delay(lo) <= severity_for_delay(hi));
    }

    /// Each band is exclusive at its lower breakpoint.
    #[test]
    fn prop_severity_bands(delay in -1_000_i64..1_000) {
        let expected = match delay {
            d if d > 60 => Severity::Critical,
            d if d > 30 => Severity::High,
            d if d > 15 => Severity::Medium,
            _ => Severity::Low,
        };
        prop_assert_eq!(severity_for_delay(delay), expected);
    }
}

// =========================================================================
// Evaluation of running runs
// =========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// A run still going past its deadline breaches with the delay's severity.
    #[test]
    fn prop_running_past_deadline_breaches(minutes in 1_i64..600, extra_secs in 0_i64..60) {
        let deadline = base() + Duration::hours(1);
        let now = deadline + Duration::minutes(minutes) + Duration::seconds(extra_secs);
        let evaluation = evaluate(&running_with_deadline(deadline), now);
        prop_assert!(evaluation.breached);
        prop_assert_eq!(evaluation.breach_type, BreachType::TimeExceeded);
        prop_assert_eq!(evaluation.severity, severity_for_delay(minutes));
        let expected_reason = format!("still running {minutes} minutes past deadline");
        prop_assert_eq!(evaluation.reason.as_deref(), Some(expected_reason.as_str()));
    }

    /// Up to and including the deadline nothing is breached.
    #[test]
    fn prop_running_before_deadline_is_clean(secs_before in 0_i64..86_400) {
        let deadline = base() + Duration::hours(1);
        let evaluation = evaluate(&running_with_deadline(deadline), deadline - Duration::seconds(secs_before));
        prop_assert!(!evaluation.breached);
        prop_assert!(evaluation.reason.is_none());
    }
}

// =========================================================================
// Cache TTLs
// =========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Running runs always get the short TTL.
    #[test]
    fn prop_running_ttl(frequency in arb_frequency(), age_minutes in 0_i64..10_000) {
        let run = JobRun { frequency, ..running_with_deadline(base()) };
        prop_assert_eq!(ttl_for(&run, base() + Duration::minutes(age_minutes)), RUNNING_TTL);
    }

    /// Completed runs are short-lived for 30 minutes, then keyed by frequency.
    #[test]
    fn prop_completed_ttl(frequency in arb_frequency(), since_end in 0_i64..10_000) {
        let run = JobRun { frequency, ..finished_run("r1", "c1") };
        let end = run.end_time.unwrap();
        let ttl = ttl_for(&run, end + Duration::minutes(since_end));
        let expected = if since_end < 30 {
            RECENTLY_COMPLETED_TTL
        } else if frequency == Frequency::Monthly {
            MONTHLY_COMPLETED_TTL
        } else {
            COMPLETED_TTL
        };
        prop_assert_eq!(ttl, expected);
    }
}

// =========================================================================
// CET deadlines
// =========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// The deadline is always after the start and at most a day (plus a
    /// DST hour) later.
    #[test]
    fn prop_deadline_follows_start(start in arb_instant(), time in arb_time_of_day()) {
        let deadline = sla_deadline(start, time);
        prop_assert!(deadline > start, "deadline {deadline} not after start {start}");
        prop_assert!(deadline - start <= Duration::hours(25));
    }
}

// =========================================================================
// Deadline index ordering
// =========================================================================

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]

    /// Due entries come back earliest first and never include future ones;
    /// approaching entries are all still in the future.
    #[test]
    fn prop_index_orders_by_deadline(
        offsets in prop::collection::vec(-600_i64..600, 1..30),
        window in 1_i64..120,
    ) {
        let now = base() + Duration::hours(2);
        let (due, upcoming) = block_on(async {
            let index = DeadlineIndex::new(Arc::new(MemoryCacheBackend::new()), "prop");
            for (i, offset) in offsets.iter().enumerate() {
                let run = JobRun {
                    run_id: format!("r{i}"),
                    ..running_with_deadline(now + Duration::minutes(*offset))
                };
                index.register(&run).await.unwrap();
            }
            let due = index.breached(now).await.unwrap();
            let upcoming = index.approaching(now, Duration::minutes(window)).await.unwrap();
            (due, upcoming)
        });

        prop_assert!(due.windows(2).all(|w| w[0].deadline <= w[1].deadline));
        prop_assert!(due.iter().all(|e| e.deadline <= now));
        prop_assert_eq!(due.len(), offsets.iter().filter(|o| **o <= 0).count());

        let horizon = now + Duration::minutes(window);
        prop_assert!(upcoming.iter().all(|e| e.deadline > now && e.deadline <= horizon));
        prop_assert_eq!(
            upcoming.len(),
            offsets.iter().filter(|o| **o > 0 && **o <= window).count()
        );
        prop_assert!(due.iter().chain(&upcoming).all(|e| e.info.is_some()));
    }
}
