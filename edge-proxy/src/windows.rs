//! Reporting windows for the aggregation route.
//!
//! All windows are half-open `[start, end)` and expressed in UTC. "Local" days are
//! defined by a fixed UTC offset; calendar months and years are subtracted in local
//! time and clamped to the last valid day of the target month.

use chrono::{DateTime, FixedOffset, Months, NaiveTime, TimeDelta, Utc};
use serde::Serialize;
use url::form_urlencoded;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn start_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_ms(&self) -> i64 {
        self.end.timestamp_millis()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Windows {
    pub today: TimeWindow,
    pub yesterday: TimeWindow,
    pub trailing_month: TimeWindow,
    pub trailing_year: TimeWindow,
}

/// Caller-supplied replacements for the computed boundaries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WindowOverrides {
    pub now: Option<DateTime<Utc>>,
    pub today_start: Option<DateTime<Utc>>,
    pub yesterday_start: Option<DateTime<Utc>>,
    pub last_month_start: Option<DateTime<Utc>>,
    pub last_year_start: Option<DateTime<Utc>>,
}

impl WindowOverrides {
    /// Reads `now`, `todayStart`, `yesterdayStart`, `lastMonthStart` and
    /// `lastYearStart` (epoch milliseconds) from a query string.
    ///
    /// Missing, non-numeric, zero and negative values are ignored, as are
    /// instants after [`MAX_OVERRIDE_MILLIS`].
    pub fn from_query(query: Option<&str>) -> Self {
        let mut overrides = Self::default();

        for (name, value) in form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
            let slot = match name.as_ref() {
                "now" => &mut overrides.now,
                "todayStart" => &mut overrides.today_start,
                "yesterdayStart" => &mut overrides.yesterday_start,
                "lastMonthStart" => &mut overrides.last_month_start,
                "lastYearStart" => &mut overrides.last_year_start,
                _ => continue,
            };
            if let Some(instant) = parse_epoch_millis(&value) {
                *slot = Some(instant);
            }
        }

        overrides
    }
}

/// 9999-12-31T23:59:59.999Z. Keeps every local-time conversion in range for any
/// fixed offset.
pub const MAX_OVERRIDE_MILLIS: i64 = 253_402_300_799_999;

fn parse_epoch_millis(value: &str) -> Option<DateTime<Utc>> {
    let millis: f64 = value.trim().parse().ok()?;
    if !millis.is_finite() || millis <= 0.0 || millis > MAX_OVERRIDE_MILLIS as f64 {
        return None;
    }
    DateTime::from_timestamp_millis(millis as i64)
}

#[derive(Clone, Copy, Debug)]
pub struct WindowCalculator {
    offset: FixedOffset,
}

impl WindowCalculator {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn compute(&self, now: DateTime<Utc>) -> Windows {
        self.compute_with(now, &WindowOverrides::default())
    }

    pub fn compute_with(&self, now: DateTime<Utc>, overrides: &WindowOverrides) -> Windows {
        let now = overrides.now.unwrap_or(now);
        let midnight = self.local_midnight(now);

        let today_start = overrides.today_start.unwrap_or(midnight);
        let yesterday_start = overrides
            .yesterday_start
            .unwrap_or(midnight - TimeDelta::days(1));
        let last_month_start = overrides
            .last_month_start
            .unwrap_or_else(|| self.months_before(now, 1));
        let last_year_start = overrides
            .last_year_start
            .unwrap_or_else(|| self.months_before(now, 12));

        Windows {
            today: TimeWindow::new(today_start, now),
            yesterday: TimeWindow::new(yesterday_start, today_start),
            trailing_month: TimeWindow::new(last_month_start, now),
            trailing_year: TimeWindow::new(last_year_start, now),
        }
    }

    /// Start of the local day containing `now`. Falls back to the UTC day at the
    /// edges of the representable range.
    fn local_midnight(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let offset = TimeDelta::seconds(i64::from(self.offset.local_minus_utc()));
        now.naive_utc()
            .checked_add_signed(offset)
            .and_then(|local| {
                local
                    .date()
                    .and_time(NaiveTime::MIN)
                    .checked_sub_signed(offset)
            })
            .unwrap_or_else(|| now.date_naive().and_time(NaiveTime::MIN))
            .and_utc()
    }

    fn months_before(&self, now: DateTime<Utc>, months: u32) -> DateTime<Utc> {
        now.with_timezone(&self.offset)
            .checked_sub_months(Months::new(months))
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}
