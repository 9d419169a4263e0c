//! Outage detection, MTTR and MTBF.
//!
//! An outage opens at the first `UNAVAILABLE` snapshot after a non-outage
//! status and closes at the first snapshot reporting a non-`UNAVAILABLE`,
//! non-`UNKNOWN` status. `UNKNOWN` snapshots neither open nor close one.
//!
//! A station is down only while every port that has reported is unavailable.

#![allow(missing_docs)]

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::analytics::timeline::normalize;
use crate::analytics::utilization::MemberReport;
use crate::core::errors::Result;
use crate::core::window::TimeWindow;
use crate::model::{Observed, PortKey, PortStatus, Scope, Snapshot, StationKey};

/// One closed outage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Outage {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_minutes: f64,
    /// A coverage gap touches the outage, so either bound may be off.
    pub low_confidence: bool,
}

/// An outage still in progress at the last snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OpenOutage {
    pub since: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub low_confidence: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReliabilityStats {
    pub port: PortKey,
    pub window: TimeWindow,
    /// Closed outages overlapping the window, oldest first.
    pub outages: Vec<Outage>,
    pub open_outage: Option<OpenOutage>,
    pub mttr_minutes: Observed<f64>,
    pub mtbf_minutes: Observed<f64>,
    pub low_confidence_count: usize,
    /// Snapshots the analysis saw, including those before the window.
    pub snapshot_count: usize,
}

impl ReliabilityStats {
    pub fn outage_count(&self) -> usize {
        self.outages.len()
    }
}

/// Outage analysis of one port over `window`.
///
/// `snapshots` should reach back before the window so an outage already in
/// progress at its start keeps its true start time.
pub fn analyze(
    port: PortKey,
    snapshots: &[Snapshot],
    window: TimeWindow,
    max_gap: TimeDelta,
) -> ReliabilityStats {
    let ordered = normalize(snapshots);
    let (closed, open) = detect(&ordered, max_gap);
    let snapshot_count = ordered.len();

    let outages: Vec<Outage> = closed
        .into_iter()
        .filter(|o| window.overlaps(o.start, o.end))
        .collect();
    let open_outage = open.filter(|o| o.since < window.end);

    ReliabilityStats {
        port,
        window,
        mttr_minutes: mean(outages.iter().map(|o| o.duration_minutes)).into(),
        mtbf_minutes: mean(
            outages
                .windows(2)
                .map(|pair| minutes(pair[1].start - pair[0].end)),
        )
        .into(),
        low_confidence_count: outages.iter().filter(|o| o.low_confidence).count(),
        outages,
        open_outage,
        snapshot_count,
    }
}

fn detect(ordered: &[Snapshot], max_gap: TimeDelta) -> (Vec<Outage>, Option<OpenOutage>) {
    let times: Vec<DateTime<Utc>> = ordered.iter().map(|s| s.observed_at).collect();
    let mut runs = RunTracker::default();
    for (index, snapshot) in ordered.iter().enumerate() {
        match snapshot.status {
            PortStatus::Unavailable => runs.step(&times, index, true, max_gap),
            PortStatus::Unknown => {}
            _ => runs.step(&times, index, false, max_gap),
        }
    }
    runs.finish(&times, max_gap)
}

/// Opens a run on the first down step and closes it on the next up step.
#[derive(Default)]
struct RunTracker {
    opened_at: Option<usize>,
    closed: Vec<Outage>,
}

impl RunTracker {
    fn step(&mut self, times: &[DateTime<Utc>], index: usize, down: bool, max_gap: TimeDelta) {
        match (self.opened_at, down) {
            (None, true) => self.opened_at = Some(index),
            (Some(first), false) => {
                let start = times[first];
                let end = times[index];
                self.closed.push(Outage {
                    start,
                    end,
                    duration_minutes: minutes(end - start),
                    low_confidence: touches_gap(times, first, index, max_gap),
                });
                self.opened_at = None;
            }
            _ => {}
        }
    }

    fn finish(self, times: &[DateTime<Utc>], max_gap: TimeDelta) -> (Vec<Outage>, Option<OpenOutage>) {
        let open = self.opened_at.and_then(|first| {
            let last = *times.last()?;
            Some(OpenOutage {
                since: times[first],
                last_seen: last,
                low_confidence: touches_gap(times, first, times.len() - 1, max_gap),
            })
        });
        (self.closed, open)
    }
}

/// Whether the run `times[first..=last]`, or the step into it, spans a gap.
///
/// A run opening on the first stored instant has no evidence of when it began.
fn touches_gap(times: &[DateTime<Utc>], first: usize, last: usize, max_gap: TimeDelta) -> bool {
    if first == 0 {
        return true;
    }
    times[first - 1..=last]
        .windows(2)
        .any(|pair| pair[1] - pair[0] > max_gap)
}

#[allow(clippy::cast_precision_loss)]
fn minutes(delta: TimeDelta) -> f64 {
    delta.num_milliseconds() as f64 / 60_000.0
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0_usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

// ──────────────────── stations ────────────────────

/// Station-wide outages: every port that has reported is unavailable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationReliability {
    pub station: StationKey,
    /// Ports with at least one snapshot.
    pub reporting_ports: usize,
    /// Closed station outages overlapping the window, oldest first.
    pub outages: Vec<Outage>,
    pub open_outage: Option<OpenOutage>,
    pub mttr_minutes: Observed<f64>,
}

/// Merge the ports' histories into one station timeline and track when all of
/// them are down together.
///
/// A port counts from its first known status on; `UNKNOWN` keeps the port's
/// previous status. A port that never reported does not hold the station up.
pub fn analyze_station(
    station: StationKey,
    histories: &[Vec<Snapshot>],
    window: TimeWindow,
    max_gap: TimeDelta,
) -> StationReliability {
    let ports: Vec<Vec<Snapshot>> = histories
        .iter()
        .map(|h| normalize(h))
        .filter(|h| !h.is_empty())
        .collect();
    let mut events: Vec<(DateTime<Utc>, usize, PortStatus)> = ports
        .iter()
        .enumerate()
        .flat_map(|(port, h)| h.iter().map(move |s| (s.observed_at, port, s.status)))
        .collect();
    events.sort_by_key(|&(at, port, _)| (at, port));

    let mut latest: Vec<Option<PortStatus>> = vec![None; ports.len()];
    let mut times = Vec::new();
    let mut runs = RunTracker::default();
    let mut index = 0;
    while index < events.len() {
        let at = events[index].0;
        while index < events.len() && events[index].0 == at {
            let (_, port, status) = events[index];
            if status != PortStatus::Unknown {
                latest[port] = Some(status);
            }
            index += 1;
        }
        times.push(at);
        let down = latest.iter().all(|s| *s == Some(PortStatus::Unavailable));
        runs.step(&times, times.len() - 1, down, max_gap);
    }
    let (closed, open) = runs.finish(&times, max_gap);

    let outages: Vec<Outage> = closed
        .into_iter()
        .filter(|o| window.overlaps(o.start, o.end))
        .collect();
    StationReliability {
        station,
        reporting_ports: ports.len(),
        mttr_minutes: mean(outages.iter().map(|o| o.duration_minutes)).into(),
        outages,
        open_outage: open.filter(|o| o.since < window.end),
    }
}

// ──────────────────── rollup ────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReliabilityRollup {
    pub scope: Scope,
    pub window: TimeWindow,
    pub outage_count: usize,
    pub open_outages: usize,
    pub low_confidence_count: usize,
    /// Mean over every closed outage of every member.
    pub mttr_minutes: Observed<f64>,
    pub ports: Vec<ReliabilityStats>,
    /// Stations whose ports were all readable.
    pub stations: Vec<StationReliability>,
    pub members: MemberReport,
}

impl ReliabilityRollup {
    pub fn is_partial(&self) -> bool {
        self.members.is_partial()
    }
}

/// Combine per-port analyses. Failed members are reported, not fatal.
pub fn rollup(
    scope: Scope,
    window: TimeWindow,
    members: Vec<(PortKey, Result<ReliabilityStats>)>,
    stations: Vec<StationReliability>,
) -> ReliabilityRollup {
    let mut report = MemberReport::default();
    let mut ports = Vec::with_capacity(members.len());
    for (port, result) in members {
        match result {
            Ok(stats) => {
                report.record(stats.snapshot_count > 0);
                ports.push(stats);
            }
            Err(err) => {
                eprintln!("[EW-RELY] skipping {port}: {err}");
                report.record_failure(port, &err);
            }
        }
    }

    ReliabilityRollup {
        scope,
        window,
        outage_count: ports.iter().map(ReliabilityStats::outage_count).sum(),
        open_outages: ports.iter().filter(|p| p.open_outage.is_some()).count(),
        low_confidence_count: ports.iter().map(|p| p.low_confidence_count).sum(),
        mttr_minutes: mean(
            ports
                .iter()
                .flat_map(|p| p.outages.iter().map(|o| o.duration_minutes)),
        )
        .into(),
        ports,
        stations,
        members: report,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::EwError;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 3, 8, 0, 0).unwrap()
    }

    fn snap(minutes: i64, status: PortStatus) -> Snapshot {
        Snapshot::new(t0() + TimeDelta::minutes(minutes), status)
    }

    fn whole_day() -> TimeWindow {
        TimeWindow::new(t0() - TimeDelta::hours(1), t0() + TimeDelta::hours(23)).unwrap()
    }

    fn port() -> PortKey {
        PortKey::new("L1", "S1", "1")
    }

    #[test]
    fn two_outages_yield_mttr_and_mtbf() {
        let snaps = [
            snap(0, PortStatus::Available),
            snap(5, PortStatus::Unavailable),
            snap(10, PortStatus::Unavailable),
            snap(15, PortStatus::Available),
            snap(20, PortStatus::Available),
            snap(25, PortStatus::Unavailable),
            snap(30, PortStatus::Unavailable),
            snap(35, PortStatus::Unavailable),
            snap(40, PortStatus::Charging),
        ];
        let stats = analyze(port(), &snaps, whole_day(), TimeDelta::minutes(10));
        assert_eq!(stats.outage_count(), 2);
        assert_eq!(stats.mttr_minutes, Observed::Value(12.5));
        assert_eq!(stats.mtbf_minutes, Observed::Value(10.0));
        assert_eq!(stats.low_confidence_count, 0);
        assert!(stats.open_outage.is_none());
    }

    #[test]
    fn unknown_neither_opens_nor_closes() {
        let snaps = [
            snap(0, PortStatus::Available),
            snap(5, PortStatus::Unknown),
            snap(10, PortStatus::Unavailable),
            snap(15, PortStatus::Unknown),
            snap(20, PortStatus::Unavailable),
            snap(25, PortStatus::Available),
        ];
        let stats = analyze(port(), &snaps, whole_day(), TimeDelta::minutes(10));
        assert_eq!(stats.outage_count(), 1);
        assert!((stats.outages[0].duration_minutes - 15.0).abs() < 1e-9);
        assert_eq!(stats.mtbf_minutes, Observed::NoData);
    }

    #[test]
    fn outage_spanning_a_gap_is_low_confidence() {
        let snaps = [
            snap(0, PortStatus::Available),
            snap(5, PortStatus::Unavailable),
            snap(300, PortStatus::Available),
        ];
        let stats = analyze(port(), &snaps, whole_day(), TimeDelta::minutes(10));
        assert_eq!(stats.outage_count(), 1);
        assert!(stats.outages[0].low_confidence);
        assert_eq!(stats.low_confidence_count, 1);
    }

    #[test]
    fn outage_on_first_snapshot_is_low_confidence() {
        let snaps = [
            snap(0, PortStatus::Unavailable),
            snap(5, PortStatus::Available),
        ];
        let stats = analyze(port(), &snaps, whole_day(), TimeDelta::minutes(10));
        assert!(stats.outages[0].low_confidence);
    }

    #[test]
    fn unresolved_outage_reported_open() {
        let snaps = [
            snap(0, PortStatus::Available),
            snap(5, PortStatus::Unavailable),
            snap(10, PortStatus::Unavailable),
        ];
        let stats = analyze(port(), &snaps, whole_day(), TimeDelta::minutes(10));
        assert_eq!(stats.outage_count(), 0);
        assert_eq!(stats.mttr_minutes, Observed::NoData);
        let open = stats.open_outage.unwrap();
        assert_eq!(open.since, t0() + TimeDelta::minutes(5));
        assert!(!open.low_confidence);
    }

    #[test]
    fn outages_outside_window_are_excluded() {
        let snaps = [
            snap(0, PortStatus::Available),
            snap(5, PortStatus::Unavailable),
            snap(10, PortStatus::Available),
        ];
        let later = TimeWindow::new(t0() + TimeDelta::hours(2), t0() + TimeDelta::hours(3)).unwrap();
        let stats = analyze(port(), &snaps, later, TimeDelta::minutes(10));
        assert_eq!(stats.outage_count(), 0);
    }

    #[test]
    fn rollup_pools_outages_and_isolates_failures() {
        let a = analyze(
            port(),
            &[
                snap(0, PortStatus::Available),
                snap(5, PortStatus::Unavailable),
                snap(15, PortStatus::Available),
            ],
            whole_day(),
            TimeDelta::minutes(10),
        );
        let other = PortKey::new("L1", "S1", "2");
        let b = analyze(
            other.clone(),
            &[
                snap(0, PortStatus::Available),
                snap(5, PortStatus::Unavailable),
                snap(10, PortStatus::Unavailable),
                snap(15, PortStatus::Unavailable),
                snap(20, PortStatus::Unavailable),
                snap(25, PortStatus::Available),
            ],
            whole_day(),
            TimeDelta::minutes(10),
        );
        let broken = PortKey::new("L1", "S1", "3");
        let quiet = PortKey::new("L1", "S1", "4");
        let steady = analyze(
            quiet.clone(),
            &[snap(0, PortStatus::Available), snap(5, PortStatus::Charging)],
            whole_day(),
            TimeDelta::minutes(10),
        );
        let silent = PortKey::new("L1", "S1", "5");
        let empty = analyze(silent.clone(), &[], whole_day(), TimeDelta::minutes(10));
        let result = rollup(
            Scope::Network,
            whole_day(),
            vec![
                (port(), Ok(a)),
                (other, Ok(b)),
                (quiet, Ok(steady)),
                (silent, Ok(empty)),
                (
                    broken,
                    Err(EwError::Runtime {
                        details: "locked".to_string(),
                    }),
                ),
            ],
            Vec::new(),
        );
        assert_eq!(result.outage_count, 2);
        assert_eq!(result.mttr_minutes, Observed::Value(15.0));
        assert!(result.is_partial());
        // Ports with snapshots count as having data, outage or not.
        assert_eq!(result.members.with_data, 3);
        assert_eq!(result.members.no_data, 1);
    }

    fn station() -> StationKey {
        StationKey::new("L1", "S1")
    }

    #[test]
    fn station_is_down_only_while_every_port_is() {
        let first = vec![
            snap(0, PortStatus::Available),
            snap(10, PortStatus::Unavailable),
            snap(40, PortStatus::Unavailable),
            snap(50, PortStatus::Available),
        ];
        let second = vec![
            snap(0, PortStatus::Charging),
            snap(20, PortStatus::Unavailable),
            snap(30, PortStatus::Unavailable),
            snap(60, PortStatus::Available),
        ];
        let stats = analyze_station(
            station(),
            &[first, second],
            whole_day(),
            TimeDelta::minutes(30),
        );
        assert_eq!(stats.reporting_ports, 2);
        assert_eq!(stats.outages.len(), 1);
        assert_eq!(stats.outages[0].start, t0() + TimeDelta::minutes(20));
        assert_eq!(stats.outages[0].end, t0() + TimeDelta::minutes(50));
        assert_eq!(stats.mttr_minutes, Observed::Value(30.0));
        assert!(stats.open_outage.is_none());
    }

    #[test]
    fn station_outage_still_running_is_open() {
        let first = vec![snap(0, PortStatus::Available), snap(10, PortStatus::Unavailable)];
        let second = vec![
            snap(0, PortStatus::Available),
            snap(15, PortStatus::Unavailable),
            snap(20, PortStatus::Unknown),
        ];
        let stats = analyze_station(station(), &[first, second, Vec::new()], whole_day(), TimeDelta::minutes(10));
        assert_eq!(stats.reporting_ports, 2);
        assert!(stats.outages.is_empty());
        assert_eq!(stats.mttr_minutes, Observed::NoData);
        let open = stats.open_outage.unwrap();
        assert_eq!(open.since, t0() + TimeDelta::minutes(15));
        assert_eq!(open.last_seen, t0() + TimeDelta::minutes(20));
    }

    #[test]
    fn one_working_port_keeps_the_station_up() {
        let down = vec![snap(0, PortStatus::Unavailable), snap(30, PortStatus::Unavailable)];
        let up = vec![snap(0, PortStatus::Available), snap(30, PortStatus::Available)];
        let stats = analyze_station(station(), &[down, up], whole_day(), TimeDelta::minutes(10));
        assert!(stats.outages.is_empty());
        assert!(stats.open_outage.is_none());
    }
}
