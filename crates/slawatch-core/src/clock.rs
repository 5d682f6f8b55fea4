//! Injected wall clock.
//!
//! Every service reads "now" through [`Clock`] so that deadline and TTL
//! decisions can be driven from tests.

use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::sla_time;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// CET business date of [`Clock::now`]; the partition window anchor.
    fn today(&self) -> NaiveDate {
        sla_time::cet_date(self.now())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.guard() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.guard();
        *guard += by;
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        match self.now.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.guard()
    }
}
