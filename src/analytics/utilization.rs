//! Coverage-aware utilization for ports and scope rollups.
//!
//! Every ratio is computed over monitored time only. Rollups combine the raw
//! durations of their members before dividing, so a station is never an
//! average of port percentages.

#![allow(missing_docs)]

use serde::Serialize;

use crate::analytics::timeline::{PortTimeline, Session};
use crate::core::errors::{EwError, Result};
use crate::core::window::{Granularity, TimeWindow, ms_to_secs};
use crate::model::{Observed, PortKey, PortStatus, Scope, StatusPolicy};

const DAY_MS: f64 = 86_400_000.0;

// ──────────────────── totals ────────────────────

/// Raw duration sums in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    /// Known-status time.
    pub monitored_ms: i64,
    /// Time covered by intervals whose status is `UNKNOWN`.
    pub unknown_ms: i64,
    pub occupied_ms: i64,
    pub charging_ms: i64,
    pub available_ms: i64,
    pub unavailable_ms: i64,
    pub gap_ms: i64,
    pub sessions: u64,
    /// Ports that contributed at least one monitored interval.
    pub ports_with_data: usize,
}

impl UsageTotals {
    /// Totals of one timeline restricted to `bucket`.
    pub fn of_timeline(timeline: &PortTimeline, bucket: &TimeWindow, policy: StatusPolicy) -> Self {
        let mut totals = Self::default();
        let mut any = false;
        for interval in &timeline.intervals {
            let Some((start, end)) = bucket.clip(interval.start, interval.end) else {
                continue;
            };
            any = true;
            let ms = (end - start).num_milliseconds();
            match interval.status {
                PortStatus::Unknown => {
                    totals.unknown_ms += ms;
                    continue;
                }
                PortStatus::Available => totals.available_ms += ms,
                PortStatus::Charging => totals.charging_ms += ms,
                PortStatus::Unavailable => totals.unavailable_ms += ms,
                PortStatus::InUse => {}
            }
            totals.monitored_ms += ms;
            if policy.is_occupied(interval.status) {
                totals.occupied_ms += ms;
            }
        }
        for gap in &timeline.gaps {
            if let Some((start, end)) = bucket.clip(gap.start, gap.end) {
                totals.gap_ms += (end - start).num_milliseconds();
            }
        }
        totals.sessions = timeline.sessions_starting_in(bucket).count() as u64;
        totals.ports_with_data = usize::from(any);
        totals
    }

    pub fn absorb(&mut self, other: &Self) {
        self.monitored_ms += other.monitored_ms;
        self.unknown_ms += other.unknown_ms;
        self.occupied_ms += other.occupied_ms;
        self.charging_ms += other.charging_ms;
        self.available_ms += other.available_ms;
        self.unavailable_ms += other.unavailable_ms;
        self.gap_ms += other.gap_ms;
        self.sessions += other.sessions;
        self.ports_with_data += other.ports_with_data;
    }

    /// Derived metrics over `window`, or `NoData` when nothing was monitored.
    #[allow(clippy::cast_precision_loss)]
    pub fn summarize(&self, window: &TimeWindow) -> Observed<UtilizationSummary> {
        if self.monitored_ms <= 0 {
            return Observed::NoData;
        }
        let monitored = self.monitored_ms as f64;
        let monitored_days = monitored / DAY_MS;
        let possible = window.duration_ms() as f64 * self.ports_with_data as f64;
        Observed::Value(UtilizationSummary {
            occupation_utilization_pct: 100.0 * self.occupied_ms as f64 / monitored,
            active_charging_utilization_pct: 100.0 * self.charging_ms as f64 / monitored,
            availability_ratio: 1.0 - self.unavailable_ms as f64 / monitored,
            session_count: self.sessions,
            sessions_per_day: self.sessions as f64 / monitored_days,
            monitored_seconds: ms_to_secs(self.monitored_ms),
            monitored_days,
            unknown_seconds: ms_to_secs(self.unknown_ms),
            gap_seconds: ms_to_secs(self.gap_ms),
            coverage_ratio: if possible > 0.0 {
                (monitored / possible).min(1.0)
            } else {
                0.0
            },
            port_count: self.ports_with_data,
        })
    }
}

/// Derived utilization for one port or scope.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UtilizationSummary {
    pub occupation_utilization_pct: f64,
    pub active_charging_utilization_pct: f64,
    pub availability_ratio: f64,
    pub session_count: u64,
    /// Normalized by monitored days, not calendar days.
    pub sessions_per_day: f64,
    pub monitored_seconds: f64,
    pub monitored_days: f64,
    pub unknown_seconds: f64,
    pub gap_seconds: f64,
    pub coverage_ratio: f64,
    pub port_count: usize,
}

// ──────────────────── member accounting ────────────────────

/// A scope member whose data could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberFailure {
    pub port: PortKey,
    pub code: String,
    pub message: String,
}

impl MemberFailure {
    pub fn new(port: PortKey, error: &EwError) -> Self {
        Self {
            port,
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Which members of a scope contributed to a result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemberReport {
    pub total: usize,
    pub with_data: usize,
    pub no_data: usize,
    pub failed: Vec<MemberFailure>,
}

impl MemberReport {
    /// Some member could not be read; the result covers the rest.
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn record_failure(&mut self, port: PortKey, error: &EwError) {
        self.total += 1;
        self.failed.push(MemberFailure::new(port, error));
    }

    pub fn record(&mut self, has_data: bool) {
        self.total += 1;
        if has_data {
            self.with_data += 1;
        } else {
            self.no_data += 1;
        }
    }
}

/// Split member results into readable timelines and a member report.
pub fn partition_members(
    members: Vec<(PortKey, Result<PortTimeline>)>,
) -> (Vec<PortTimeline>, MemberReport) {
    let mut report = MemberReport::default();
    let mut timelines = Vec::with_capacity(members.len());
    for (port, result) in members {
        match result {
            Ok(timeline) => {
                report.record(timeline.has_data());
                timelines.push(timeline);
            }
            Err(err) => {
                eprintln!("[EW-UTIL] skipping {port}: {err}");
                report.record_failure(port, &err);
            }
        }
    }
    (timelines, report)
}

// ──────────────────── summaries ────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeSummary {
    pub scope: Scope,
    pub window: TimeWindow,
    pub summary: Observed<UtilizationSummary>,
    pub totals: UsageTotals,
    pub members: MemberReport,
}

impl ScopeSummary {
    pub fn is_partial(&self) -> bool {
        self.members.is_partial()
    }
}

/// Summarize `window` for `scope` from per-member reconstructions.
pub fn summarize(
    scope: Scope,
    window: TimeWindow,
    members: Vec<(PortKey, Result<PortTimeline>)>,
    policy: StatusPolicy,
) -> ScopeSummary {
    let (timelines, members) = partition_members(members);
    let totals = combine(&timelines, &window, policy);
    ScopeSummary {
        summary: totals.summarize(&window),
        scope,
        window,
        totals,
        members,
    }
}

fn combine(timelines: &[PortTimeline], bucket: &TimeWindow, policy: StatusPolicy) -> UsageTotals {
    let mut totals = UsageTotals::default();
    for timeline in timelines {
        totals.absorb(&UsageTotals::of_timeline(timeline, bucket, policy));
    }
    totals
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub bucket: TimeWindow,
    pub summary: Observed<UtilizationSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesReport {
    pub scope: Scope,
    pub window: TimeWindow,
    pub granularity: Granularity,
    pub points: Vec<SeriesPoint>,
    pub members: MemberReport,
}

/// Per-bucket summaries. Empty buckets carry `NoData`, never zero.
pub fn summarize_series(
    scope: Scope,
    window: TimeWindow,
    granularity: Granularity,
    members: Vec<(PortKey, Result<PortTimeline>)>,
    policy: StatusPolicy,
) -> SeriesReport {
    let (timelines, members) = partition_members(members);
    let points = window
        .buckets(granularity.step())
        .into_iter()
        .map(|bucket| SeriesPoint {
            summary: combine(&timelines, &bucket, policy).summarize(&bucket),
            bucket,
        })
        .collect();
    SeriesReport {
        scope,
        window,
        granularity,
        points,
        members,
    }
}

// ──────────────────── session statistics ────────────────────

/// Session length thresholds for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionThresholds {
    pub short_minutes: u64,
    pub long_minutes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub scope: Scope,
    pub window: TimeWindow,
    /// Sessions that started inside the window.
    pub count: u64,
    pub mean_duration_minutes: Observed<f64>,
    pub median_duration_minutes: Observed<f64>,
    pub short_sessions: u64,
    pub long_sessions: u64,
    /// Still running at the reconstruction horizon.
    pub open_sessions: u64,
    pub members: MemberReport,
}

/// Session counts and duration statistics for sessions starting in `window`.
#[allow(clippy::cast_precision_loss)]
pub fn session_stats(
    scope: Scope,
    window: TimeWindow,
    members: Vec<(PortKey, Result<PortTimeline>)>,
    thresholds: SessionThresholds,
) -> SessionStats {
    let (timelines, members) = partition_members(members);
    let sessions: Vec<&Session> = timelines
        .iter()
        .flat_map(|t| t.sessions_starting_in(&window))
        .collect();

    let mut durations: Vec<f64> = sessions.iter().map(|s| s.duration_minutes()).collect();
    durations.sort_by(f64::total_cmp);
    let mean = (!durations.is_empty())
        .then(|| durations.iter().sum::<f64>() / durations.len() as f64);
    let median = median(&durations);

    SessionStats {
        scope,
        window,
        count: sessions.len() as u64,
        mean_duration_minutes: mean.into(),
        median_duration_minutes: median.into(),
        short_sessions: durations
            .iter()
            .filter(|d| **d < thresholds.short_minutes as f64)
            .count() as u64,
        long_sessions: durations
            .iter()
            .filter(|d| **d >= thresholds.long_minutes as f64)
            .count() as u64,
        open_sessions: sessions.iter().filter(|s| s.open).count() as u64,
        members,
    }
}

fn median(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    match n {
        0 => None,
        _ if n % 2 == 1 => Some(sorted[n / 2]),
        _ => Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0),
    }
}

/// Most recent sessions of one port overlapping a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortSessions {
    pub port: PortKey,
    pub sessions: Vec<Session>,
}

/// Newest-first sessions per port, at most `limit` each.
pub fn recent_sessions(timelines: &[PortTimeline], limit: usize) -> Vec<PortSessions> {
    timelines
        .iter()
        .filter(|t| !t.sessions.is_empty())
        .map(|t| {
            let mut sessions = t.sessions.clone();
            sessions.sort_by(|a, b| b.start.cmp(&a.start));
            sessions.truncate(limit);
            PortSessions {
                port: t.port.clone(),
                sessions,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::timeline::{ReconstructParams, reconstruct};
    use crate::model::{Snapshot, StationKey};
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 5, 0, 0, 0).unwrap()
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        t0() + TimeDelta::minutes(minutes)
    }

    fn params() -> ReconstructParams {
        ReconstructParams {
            max_gap: TimeDelta::minutes(10),
            policy: StatusPolicy::default(),
        }
    }

    /// Snapshots every 5 minutes over `[from, to]` with a fixed status.
    fn steady(from: i64, to: i64, status: PortStatus) -> Vec<Snapshot> {
        (from..=to)
            .step_by(5)
            .map(|m| Snapshot::new(at(m), status))
            .collect()
    }

    fn timeline(port: &str, snaps: &[Snapshot], window: TimeWindow) -> PortTimeline {
        reconstruct(
            PortKey::new("L1", "S1", port),
            snaps,
            window,
            window.end,
            &params(),
        )
    }

    #[test]
    fn utilization_ignores_unmonitored_time() {
        // One day window, only the first 12h observed, charging 3h of them.
        let window = TimeWindow::new(at(0), at(24 * 60)).unwrap();
        let mut snaps = steady(0, 3 * 60 - 5, PortStatus::Charging);
        snaps.extend(steady(3 * 60, 12 * 60 - 10, PortStatus::Available));
        let t = timeline("1", &snaps, window);
        let summary = summarize(
            Scope::Network,
            window,
            vec![(t.port.clone(), Ok(t))],
            StatusPolicy::default(),
        );
        let value = summary.summary.value().unwrap();
        assert!((value.occupation_utilization_pct - 25.0).abs() < 1e-9);
        assert!((value.coverage_ratio - 0.5).abs() < 1e-9);
        assert_eq!(value.session_count, 1);
        // One session over half a monitored day.
        assert!((value.sessions_per_day - 2.0).abs() < 1e-9);
    }

    #[test]
    fn no_data_is_distinct_from_zero() {
        let window = TimeWindow::new(at(0), at(60)).unwrap();
        let empty = timeline("1", &[], window);
        let idle = timeline("2", &steady(0, 60, PortStatus::Available), window);

        let none = summarize(
            Scope::Network,
            window,
            vec![(empty.port.clone(), Ok(empty))],
            StatusPolicy::default(),
        );
        assert!(none.summary.is_no_data());
        assert_eq!(none.members.no_data, 1);

        let zero = summarize(
            Scope::Network,
            window,
            vec![(idle.port.clone(), Ok(idle))],
            StatusPolicy::default(),
        );
        let value = zero.summary.value().unwrap();
        assert!(value.occupation_utilization_pct.abs() < f64::EPSILON);
        assert_eq!(value.session_count, 0);
    }

    #[test]
    fn rollup_weights_by_monitored_time() {
        // Port 1: 60m monitored, 30m charging. Port 2: 20m monitored, 20m charging.
        let window = TimeWindow::new(at(0), at(60)).unwrap();
        let mut p1 = steady(0, 25, PortStatus::Charging);
        p1.extend(steady(30, 60, PortStatus::Available));
        let t1 = timeline("1", &p1, window);
        let t2 = timeline("2", &steady(0, 20, PortStatus::Charging), window);
        // t2 runs 0..20 plus 10m extrapolation = 30m.
        assert_eq!(t2.interval_ms(), 30 * 60_000);

        let rollup = summarize(
            Scope::Station(StationKey::new("L1", "S1")),
            window,
            vec![(t1.port.clone(), Ok(t1)), (t2.port.clone(), Ok(t2))],
            StatusPolicy::default(),
        );
        let value = rollup.summary.value().unwrap();
        // (30 + 30) / (60 + 30) occupied, not the mean of 50% and 100%.
        assert!((value.occupation_utilization_pct - 100.0 * 60.0 / 90.0).abs() < 1e-9);
        assert_eq!(value.port_count, 2);
        assert!((value.coverage_ratio - 0.75).abs() < 1e-9);
    }

    #[test]
    fn unknown_status_excluded_from_monitored() {
        let window = TimeWindow::new(at(0), at(20)).unwrap();
        let mut snaps = steady(0, 5, PortStatus::Charging);
        snaps.extend(steady(10, 20, PortStatus::Unknown));
        let t = timeline("1", &snaps, window);
        let totals = UsageTotals::of_timeline(&t, &window, StatusPolicy::default());
        assert_eq!(totals.monitored_ms, 10 * 60_000);
        assert_eq!(totals.unknown_ms, 10 * 60_000);
        let value = totals.summarize(&window).value().unwrap();
        assert!((value.occupation_utilization_pct - 100.0).abs() < 1e-9);
    }

    #[test]
    fn failed_member_marks_rollup_partial() {
        let window = TimeWindow::new(at(0), at(60)).unwrap();
        let good = timeline("1", &steady(0, 60, PortStatus::Charging), window);
        let broken = PortKey::new("L1", "S1", "2");
        let err = EwError::Runtime {
            details: "disk gone".to_string(),
        };
        let rollup = summarize(
            Scope::Network,
            window,
            vec![(good.port.clone(), Ok(good)), (broken.clone(), Err(err))],
            StatusPolicy::default(),
        );
        assert!(rollup.is_partial());
        assert_eq!(rollup.members.total, 2);
        assert_eq!(rollup.members.failed[0].port, broken);
        assert!(!rollup.summary.is_no_data());
    }

    #[test]
    fn series_marks_unmonitored_buckets() {
        let window = TimeWindow::new(at(0), at(180)).unwrap();
        let t = timeline("1", &steady(0, 50, PortStatus::Charging), window);
        let report = summarize_series(
            Scope::Network,
            window,
            Granularity::Hour,
            vec![(t.port.clone(), Ok(t))],
            StatusPolicy::default(),
        );
        assert_eq!(report.points.len(), 3);
        assert!(!report.points[0].summary.is_no_data());
        assert!(report.points[1].summary.is_no_data());
        assert!(report.points[2].summary.is_no_data());
    }

    #[test]
    fn session_stats_classify_lengths() {
        let window = TimeWindow::new(at(0), at(300)).unwrap();
        let mut snaps = steady(0, 0, PortStatus::Charging);
        snaps.extend(steady(2, 2, PortStatus::Available));
        snaps.extend(steady(10, 130, PortStatus::Charging));
        snaps.extend(steady(135, 200, PortStatus::Available));
        let t = timeline("1", &snaps, window);
        let stats = session_stats(
            Scope::Network,
            window,
            vec![(t.port.clone(), Ok(t))],
            SessionThresholds {
                short_minutes: 3,
                long_minutes: 60,
            },
        );
        assert_eq!(stats.count, 2);
        assert_eq!(stats.short_sessions, 1);
        assert_eq!(stats.long_sessions, 1);
        assert_eq!(stats.open_sessions, 0);
        assert!((stats.median_duration_minutes.value().unwrap() - 63.5).abs() < 1e-9);
    }
}
