//! Right-open time windows and bucketing.

#![allow(missing_docs)]

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{EwError, Result};

/// Right-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Build an explicit window. `start` must precede `end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(EwError::InvalidWindow {
                start: format_ts(start),
                end: format_ts(end),
            });
        }
        Ok(Self { start, end })
    }

    /// Window of length `span` ending at `now`.
    pub fn trailing(now: DateTime<Utc>, span: TimeDelta) -> Result<Self> {
        let start = now
            .checked_sub_signed(span)
            .ok_or_else(|| EwError::InvalidWindow {
                start: format!("{} before {}", span, format_ts(now)),
                end: format_ts(now),
            })?;
        Self::new(start, now)
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration().num_milliseconds()
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Whether `[start, end)` shares any instant with this window.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start < self.end && end > self.start
    }

    /// Intersection of `[start, end)` with this window, if non-empty.
    pub fn clip(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let lo = start.max(self.start);
        let hi = end.min(self.end);
        (lo < hi).then_some((lo, hi))
    }

    /// Consecutive buckets of `step` starting at `start`; the last one is clipped to `end`.
    pub fn buckets(&self, step: TimeDelta) -> Vec<Self> {
        let mut out = Vec::new();
        if step <= TimeDelta::zero() {
            return out;
        }
        let mut cursor = self.start;
        while cursor < self.end {
            let next = cursor
                .checked_add_signed(step)
                .map_or(self.end, |n| n.min(self.end));
            out.push(Self {
                start: cursor,
                end: next,
            });
            cursor = next;
        }
        out
    }
}

/// Bucket width for series output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
}

impl Granularity {
    pub fn step(self) -> TimeDelta {
        match self {
            Self::Hour => TimeDelta::hours(1),
            Self::Day => TimeDelta::days(1),
        }
    }

    /// Hourly for short views, daily beyond a week.
    pub fn for_span(span: TimeDelta) -> Self {
        if span <= TimeDelta::days(7) {
            Self::Hour
        } else {
            Self::Day
        }
    }
}

/// RFC 3339 with millisecond precision, as stored in logs.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Milliseconds as seconds for reporting.
#[allow(clippy::cast_precision_loss)]
pub fn ms_to_secs(ms: i64) -> f64 {
    ms as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn reversed_window_rejected() {
        let err = TimeWindow::new(t(10, 0), t(9, 0)).unwrap_err();
        assert_eq!(err.code(), "EW-2002");
        assert!(TimeWindow::new(t(9, 0), t(9, 0)).is_err());
    }

    #[test]
    fn trailing_window_ends_at_now() {
        let w = TimeWindow::trailing(t(12, 0), TimeDelta::days(2)).unwrap();
        assert_eq!(w.end, t(12, 0));
        assert_eq!(w.duration(), TimeDelta::days(2));
    }

    #[test]
    fn clip_is_right_open() {
        let w = TimeWindow::new(t(10, 0), t(11, 0)).unwrap();
        assert_eq!(w.clip(t(9, 0), t(10, 0)), None);
        assert_eq!(w.clip(t(10, 30), t(12, 0)), Some((t(10, 30), t(11, 0))));
        assert!(w.contains(t(10, 0)));
        assert!(!w.contains(t(11, 0)));
    }

    #[test]
    fn buckets_cover_window_and_clip_last() {
        let w = TimeWindow::new(t(10, 0), t(12, 30)).unwrap();
        let buckets = w.buckets(TimeDelta::hours(1));
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].start, t(10, 0));
        assert_eq!(buckets[2].end, t(12, 30));
        let total: i64 = buckets.iter().map(TimeWindow::duration_ms).sum();
        assert_eq!(total, w.duration_ms());
    }

    #[test]
    fn granularity_follows_span() {
        assert_eq!(Granularity::for_span(TimeDelta::days(7)), Granularity::Hour);
        assert_eq!(Granularity::for_span(TimeDelta::days(30)), Granularity::Day);
    }
}
