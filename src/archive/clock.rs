//! Clock Abstraction
//!
//! Partition dates, the "yesterday" upload cut-off and retention ages are all
//! derived from an [`ArchiveClock`], so tests can pin the calendar instead of
//! depending on wall time.
//!
//! - `SystemClock`: real system time in a fixed UTC offset
//! - `ManualClock`: settable virtual time, shared between clones

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate, Offset, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

/// Source of "now" and of the calendar used to name partitions.
pub trait ArchiveClock: Send + Sync + 'static {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;

    /// Offset used to map instants onto calendar dates
    fn offset(&self) -> FixedOffset;

    /// Current calendar date in the clock's offset
    fn today(&self) -> NaiveDate {
        self.now().with_timezone(&self.offset()).date_naive()
    }

    /// The most recent date whose partitions are closed for appends
    fn yesterday(&self) -> NaiveDate {
        self.today().pred_opt().unwrap_or(NaiveDate::MIN)
    }
}

/// Build a `FixedOffset` from minutes east of UTC.
pub fn offset_from_minutes(minutes: i32) -> Option<FixedOffset> {
    minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
}

/// Calendar date of a millisecond timestamp in the given offset.
pub fn date_of_millis(timestamp_ms: i64, offset: FixedOffset) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|ts| ts.with_timezone(&offset).date_naive())
}

/// Production clock using real system time
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    pub fn new(offset: FixedOffset) -> Self {
        SystemClock { offset }
    }

    pub fn utc() -> Self {
        SystemClock {
            offset: Utc.fix(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::utc()
    }
}

impl ArchiveClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}

/// Manually driven clock for deterministic tests
///
/// Time only moves via `set()` or `advance()`. Clones share state.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
    offset: FixedOffset,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        ManualClock {
            now: Arc::new(RwLock::new(now)),
            offset: Utc.fix(),
        }
    }

    /// Clock pinned to noon UTC on the given date
    pub fn at_noon(date: NaiveDate) -> Self {
        let noon = date
            .and_hms_opt(12, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or_else(Utc::now);
        Self::new(noon)
    }

    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write() = now;
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.write();
        *now += by;
    }
}

impl ArchiveClock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_manual_clock_today_and_yesterday() {
        let clock = ManualClock::at_noon(date(2024, 3, 1));
        assert_eq!(clock.today(), date(2024, 3, 1));
        assert_eq!(clock.yesterday(), date(2024, 2, 29));
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::at_noon(date(2024, 1, 1));
        let other = clock.clone();

        clock.advance(ChronoDuration::days(1));
        assert_eq!(other.today(), date(2024, 1, 2));
    }

    #[test]
    fn test_offset_moves_date_boundary() {
        // 23:30 UTC is already the next day at UTC+2
        let instant = date(2024, 1, 1).and_hms_opt(23, 30, 0).unwrap().and_utc();
        let clock = ManualClock::new(instant).with_offset(offset_from_minutes(120).unwrap());
        assert_eq!(clock.today(), date(2024, 1, 2));
    }

    #[test]
    fn test_date_of_millis() {
        let ts = date(2024, 1, 1).and_hms_opt(10, 0, 0).unwrap().and_utc();
        let offset = offset_from_minutes(0).unwrap();
        assert_eq!(
            date_of_millis(ts.timestamp_millis(), offset),
            Some(date(2024, 1, 1))
        );
    }

    #[test]
    fn test_offset_from_minutes_rejects_out_of_range() {
        assert!(offset_from_minutes(24 * 60).is_none());
        assert!(offset_from_minutes(-330).is_some());
    }
}
