//! Business-time helpers: CET/CEST conversion, SLA deadline placement and
//! duration formatting.
//!
//! The business calendar is Central European Time with the EU daylight
//! saving rule: CEST (UTC+2) from the last Sunday of March 01:00 UTC until
//! the last Sunday of October 01:00 UTC, CET (UTC+1) otherwise.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc, Weekday};

const CET_OFFSET_HOURS: i64 = 1;
const CEST_OFFSET_HOURS: i64 = 2;

fn last_sunday(year: i32, month: u32) -> Option<NaiveDate> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let mut day = first_of_next.pred_opt()?;
    while day.weekday() != Weekday::Sun {
        day = day.pred_opt()?;
    }
    Some(day)
}

/// Whether summer time (CEST) is in effect at `instant`.
#[must_use]
pub fn is_summer_time(instant: DateTime<Utc>) -> bool {
    let year = instant.year();
    let (Some(start), Some(end)) = (last_sunday(year, 3), last_sunday(year, 10)) else {
        return false;
    };
    let one_am = NaiveTime::from_hms_opt(1, 0, 0).unwrap_or(NaiveTime::MIN);
    let dst_start = start.and_time(one_am).and_utc();
    let dst_end = end.and_time(one_am).and_utc();
    instant >= dst_start && instant < dst_end
}

/// UTC offset of the business calendar at `instant`, in hours.
#[must_use]
pub fn offset_hours(instant: DateTime<Utc>) -> i64 {
    if is_summer_time(instant) {
        CEST_OFFSET_HOURS
    } else {
        CET_OFFSET_HOURS
    }
}

/// Wall-clock CET/CEST time for an instant.
#[must_use]
pub fn to_cet(instant: DateTime<Utc>) -> NaiveDateTime {
    instant.naive_utc() + Duration::hours(offset_hours(instant))
}

/// Business (CET) calendar date of an instant.
#[must_use]
pub fn cet_date(instant: DateTime<Utc>) -> NaiveDate {
    to_cet(instant).date()
}

/// Minutes since CET midnight, used by the daily aggregates.
#[must_use]
pub fn cet_minute_of_day(instant: DateTime<Utc>) -> i64 {
    let local = to_cet(instant);
    i64::from(local.hour()) * 60 + i64::from(local.minute())
}

/// Resolve a CET/CEST wall-clock time to an instant.
///
/// Ambiguous autumn times resolve to the earlier (summer) instant; times
/// inside the spring gap are shifted forward by the gap length.
#[must_use]
pub fn from_cet(local: NaiveDateTime) -> DateTime<Utc> {
    let summer = (local - Duration::hours(CEST_OFFSET_HOURS)).and_utc();
    if is_summer_time(summer) {
        return summer;
    }
    (local - Duration::hours(CET_OFFSET_HOURS)).and_utc()
}

/// Absolute SLA deadline for a run started at `start` with a CET time-of-day target.
///
/// The target is placed on the CET calendar day of the start. When that
/// wall-clock time is not after the local start time, the deadline rolls to
/// the following day (overnight runs).
#[must_use]
pub fn sla_deadline(start: DateTime<Utc>, sla_time_of_day: NaiveTime) -> DateTime<Utc> {
    let local_start = to_cet(start);
    let same_day = local_start.date().and_time(sla_time_of_day);
    let target = if same_day > local_start {
        same_day
    } else {
        local_start
            .date()
            .succ_opt()
            .map_or(same_day + Duration::days(1), |next| next.and_time(sla_time_of_day))
    };
    let deadline = from_cet(target);
    if deadline > start {
        deadline
    } else {
        // Started in the second pass of the autumn overlap.
        (target - Duration::hours(CET_OFFSET_HOURS)).and_utc()
    }
}

/// `start + expected_duration_ms`, the estimate shown while a run is in flight.
#[must_use]
pub fn estimated_end(start: DateTime<Utc>, expected_duration_ms: i64) -> DateTime<Utc> {
    start + Duration::milliseconds(expected_duration_ms)
}

/// Human-readable duration: `"1h 5m"`, `"3m 12s"` or `"42s"`.
#[must_use]
pub fn format_duration(duration_ms: i64) -> String {
    let duration_ms = duration_ms.max(0);
    let hours = duration_ms / 3_600_000;
    let minutes = (duration_ms % 3_600_000) / 60_000;
    let seconds = (duration_ms % 60_000) / 1000;

    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn winter_deadline_same_day() {
        let deadline = sla_deadline(utc(2024, 1, 10, 4, 0), hm(6, 15));
        assert_eq!(deadline, utc(2024, 1, 10, 5, 15));
    }

    #[test]
    fn summer_deadline_uses_cest_offset() {
        // 2024-07-01 04:00Z is 06:00 CEST; 08:00 CEST is 06:00Z.
        let deadline = sla_deadline(utc(2024, 7, 1, 4, 0), hm(8, 0));
        assert_eq!(deadline, utc(2024, 7, 1, 6, 0));
    }

    #[test]
    fn deadline_rolls_to_next_day_when_not_after_start() {
        // 22:00Z on Jan 10 is 23:00 CET; a 02:00 target belongs to Jan 11.
        let deadline = sla_deadline(utc(2024, 1, 10, 22, 0), hm(2, 0));
        assert_eq!(deadline, utc(2024, 1, 11, 1, 0));

        // Equal to the local start also rolls over.
        let deadline = sla_deadline(utc(2024, 1, 10, 5, 15), hm(6, 15));
        assert_eq!(deadline, utc(2024, 1, 11, 5, 15));
    }

    #[test]
    fn dst_transitions_2024() {
        // Summer time 2024: Mar 31 01:00Z .. Oct 27 01:00Z
        assert!(!is_summer_time(utc(2024, 3, 31, 0, 59)));
        assert!(is_summer_time(utc(2024, 3, 31, 1, 0)));
        assert!(is_summer_time(utc(2024, 10, 27, 0, 59)));
        assert!(!is_summer_time(utc(2024, 10, 27, 1, 0)));
    }

    #[test]
    fn dst_switches_on_last_sundays_across_years() {
        for (year, march, october) in [(2023, 26, 29), (2025, 30, 26), (2026, 29, 25)] {
            assert!(!is_summer_time(utc(year, 3, march, 0, 59)), "{year}");
            assert!(is_summer_time(utc(year, 3, march, 1, 0)), "{year}");
            assert!(is_summer_time(utc(year, 10, october, 0, 59)), "{year}");
            assert!(!is_summer_time(utc(year, 10, october, 1, 0)), "{year}");
        }
    }

    #[test]
    fn spring_gap_shifts_forward() {
        let local = NaiveDate::from_ymd_opt(2024, 3, 31)
            .unwrap()
            .and_time(hm(2, 30));
        // 02:30 does not exist; resolves to 01:30Z (03:30 CEST).
        assert_eq!(from_cet(local), utc(2024, 3, 31, 1, 30));
    }

    #[test]
    fn autumn_overlap_prefers_summer_instant() {
        let local = NaiveDate::from_ymd_opt(2024, 10, 27)
            .unwrap()
            .and_time(hm(2, 30));
        assert_eq!(from_cet(local), utc(2024, 10, 27, 0, 30));
    }

    #[test]
    fn deadline_in_second_overlap_pass_stays_after_start() {
        // 01:10Z is 02:10 CET, after the clocks went back.
        let deadline = sla_deadline(utc(2024, 10, 27, 1, 10), hm(2, 40));
        assert_eq!(deadline, utc(2024, 10, 27, 1, 40));
    }

    #[test]
    fn cet_date_crosses_midnight() {
        assert_eq!(
            cet_date(utc(2024, 1, 10, 23, 30)),
            NaiveDate::from_ymd_opt(2024, 1, 11).unwrap()
        );
        assert_eq!(cet_minute_of_day(utc(2024, 1, 10, 4, 0)), 5 * 60);
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(42_000), "42s");
        assert_eq!(format_duration(192_000), "3m 12s");
        assert_eq!(format_duration(3_900_000), "1h 5m");
        assert_eq!(format_duration(0), "0s");
    }

    #[test]
    fn estimated_end_adds_expected_duration() {
        assert_eq!(
            estimated_end(utc(2024, 1, 10, 4, 0), 90 * 60_000),
            utc(2024, 1, 10, 5, 30)
        );
    }
}
