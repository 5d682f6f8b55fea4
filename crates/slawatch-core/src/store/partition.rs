//! Reporting-date windows that keep run queries inside a bounded partition set.
//!
//! DAILY calculators read `[today-3, today]`; MONTHLY calculators read only
//! end-of-month dates from the last 13 months. Every run query issued by
//! the store goes through [`PartitionWindow`], so a query without a window
//! cannot be expressed.

use chrono::{Datelike, Months, NaiveDate};

use crate::model::Frequency;

/// Days before `today` included in a DAILY read.
pub const DAILY_LOOKBACK_DAYS: u64 = 3;
/// Months of end-of-month reporting dates included in a MONTHLY read.
pub const MONTHLY_LOOKBACK_MONTHS: u32 = 13;
/// Reporting dates probed by partition key when locating a run to complete.
pub const RECENT_LOOKUP_DAYS: u64 = 7;

/// Reporting-date predicate for one run query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionWindow {
    /// Inclusive date range.
    Range { from: NaiveDate, to: NaiveDate },
    /// Explicit set of reporting dates, newest first.
    Dates(Vec<NaiveDate>),
}

impl PartitionWindow {
    #[must_use]
    pub fn for_frequency(frequency: Frequency, today: NaiveDate) -> Self {
        match frequency {
            Frequency::Daily => daily_window(today),
            Frequency::Monthly => Self::Dates(monthly_reporting_dates(today)),
        }
    }

    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        match self {
            Self::Range { from, to } => (*from..=*to).contains(&date),
            Self::Dates(dates) => dates.contains(&date),
        }
    }

    /// SQL fragment over `column` plus its bound values, as ISO dates.
    #[must_use]
    pub fn to_sql(&self, column: &str) -> (String, Vec<String>) {
        match self {
            Self::Range { from, to } => (
                format!("{column} BETWEEN ? AND ?"),
                vec![from.to_string(), to.to_string()],
            ),
            Self::Dates(dates) if dates.is_empty() => ("0 = 1".to_string(), Vec::new()),
            Self::Dates(dates) => {
                let placeholders = vec!["?"; dates.len()].join(", ");
                (
                    format!("{column} IN ({placeholders})"),
                    dates.iter().map(NaiveDate::to_string).collect(),
                )
            }
        }
    }
}

#[must_use]
pub fn daily_window(today: NaiveDate) -> PartitionWindow {
    let from = today
        .checked_sub_days(chrono::Days::new(DAILY_LOOKBACK_DAYS))
        .unwrap_or(today);
    PartitionWindow::Range { from, to: today }
}

/// Last calendar day of the month containing `date`.
#[must_use]
pub fn end_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1)
        .and_then(|first| first.checked_add_months(Months::new(1)))
        .and_then(|next| next.pred_opt())
        .unwrap_or(date)
}

#[must_use]
pub fn is_end_of_month(date: NaiveDate) -> bool {
    end_of_month(date) == date
}

/// End-of-month reporting dates no older than 13 months before `today`, newest first.
#[must_use]
pub fn monthly_reporting_dates(today: NaiveDate) -> Vec<NaiveDate> {
    let cutoff = today
        .checked_sub_months(Months::new(MONTHLY_LOOKBACK_MONTHS))
        .unwrap_or(today);
    (0..=MONTHLY_LOOKBACK_MONTHS)
        .filter_map(|back| today.checked_sub_months(Months::new(back)))
        .map(end_of_month)
        .filter(|eom| *eom >= cutoff)
        .collect()
}

/// Reporting dates probed by key before falling back to a full lookup, newest first.
#[must_use]
pub fn recent_lookup_dates(today: NaiveDate) -> Vec<NaiveDate> {
    (0..RECENT_LOOKUP_DAYS)
        .filter_map(|back| today.checked_sub_days(chrono::Days::new(back)))
        .collect()
}
