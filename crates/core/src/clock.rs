use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::RwLock;

/// Source of "now" for everything that stamps or buckets by time.
///
/// Production code uses [`SystemClock`]; tests drive [`ManualClock`] so
/// event timestamps and UTC day rollovers are deterministic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current UTC calendar day.
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.write() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_advances_across_day_boundary() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 23, 59, 0).unwrap());
        let day_one = clock.today();

        clock.advance(Duration::minutes(2));

        assert_ne!(clock.today(), day_one);
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2025, 3, 2).unwrap());
    }
}
