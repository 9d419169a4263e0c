//! Weekly 7×24 usage fingerprint of a station.
//!
//! Cells are keyed by local weekday and hour under a fixed UTC offset.
//! Intervals crossing an hour boundary are split proportionally at the
//! boundary. A cell with no monitored time reports `NoData`.

#![allow(missing_docs)]

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::analytics::timeline::PortTimeline;
use crate::analytics::utilization::MemberReport;
use crate::core::config::FingerprintConfig;
use crate::core::window::ms_to_secs;
use crate::model::{Observed, PortStatus, StationKey, StatusPolicy};

const HOUR_MS: i64 = 3_600_000;
const WEEKDAYS: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

/// Ranking and local-time settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FingerprintSettings {
    pub utc_offset_minutes: i32,
    /// Cells with less monitored time are left out of rankings.
    pub min_cell_seconds: u64,
    pub min_cell_coverage: f64,
    pub top_cells: usize,
}

impl From<&FingerprintConfig> for FingerprintSettings {
    fn from(config: &FingerprintConfig) -> Self {
        Self {
            utc_offset_minutes: config.utc_offset_minutes,
            min_cell_seconds: config.min_cell_seconds,
            min_cell_coverage: config.min_cell_coverage,
            top_cells: config.top_cells,
        }
    }
}

impl FingerprintSettings {
    fn offset_ms(&self) -> i64 {
        i64::from(self.utc_offset_minutes) * 60_000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CellMetrics {
    pub occupation_utilization_pct: f64,
    pub active_charging_utilization_pct: f64,
    pub availability_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FingerprintCell {
    /// Monday = 0.
    pub weekday: u8,
    pub hour: u8,
    pub label: String,
    pub observed_seconds: f64,
    pub possible_seconds: f64,
    pub coverage_ratio: f64,
    pub metrics: Observed<CellMetrics>,
}

/// Compact view of a ranked cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedCell {
    pub label: String,
    pub weekday: u8,
    pub hour: u8,
    pub occupation_utilization_pct: f64,
    pub coverage_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fingerprint {
    pub station: StationKey,
    pub utc_offset_minutes: i32,
    pub history_start: DateTime<Utc>,
    pub history_end: DateTime<Utc>,
    pub port_count: usize,
    pub cells: [[FingerprintCell; 24]; 7],
    pub busiest: Vec<RankedCell>,
    pub quietest: Vec<RankedCell>,
    pub members: MemberReport,
}

impl Fingerprint {
    pub fn cell(&self, weekday: usize, hour: usize) -> Option<&FingerprintCell> {
        self.cells.get(weekday)?.get(hour)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CellAccumulator {
    monitored_ms: i64,
    occupied_ms: i64,
    charging_ms: i64,
    unavailable_ms: i64,
    possible_ms: i64,
}

/// Walk `[start_ms, end_ms)` in local-hour pieces, calling `visit(weekday, hour, ms)`.
fn split_local_hours(
    start_ms: i64,
    end_ms: i64,
    offset_ms: i64,
    mut visit: impl FnMut(usize, usize, i64),
) {
    let mut cursor = start_ms;
    while cursor < end_ms {
        let hour_index = (cursor + offset_ms).div_euclid(HOUR_MS);
        let next = ((hour_index + 1) * HOUR_MS - offset_ms).min(end_ms);
        let day = hour_index.div_euclid(24);
        // 1970-01-01 was a Thursday.
        let weekday = (day + 3).rem_euclid(7);
        let hour = hour_index.rem_euclid(24);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        visit(weekday as usize, hour as usize, next - cursor);
        cursor = next;
    }
}

/// Build the fingerprint of `station` over `[history_start, history_end)`.
///
/// `timelines` are the station's port reconstructions over that range;
/// `members` accounts for ports that could not be read.
pub fn build(
    station: StationKey,
    history_start: DateTime<Utc>,
    history_end: DateTime<Utc>,
    timelines: &[PortTimeline],
    members: MemberReport,
    policy: StatusPolicy,
    settings: &FingerprintSettings,
) -> Fingerprint {
    let offset_ms = settings.offset_ms();
    let mut acc = [[CellAccumulator::default(); 24]; 7];

    let port_count = i64::try_from(timelines.len()).unwrap_or(i64::MAX);
    split_local_hours(
        history_start.timestamp_millis(),
        history_end.timestamp_millis(),
        offset_ms,
        |day, hour, ms| acc[day][hour].possible_ms += ms * port_count,
    );

    for timeline in timelines {
        for interval in &timeline.intervals {
            if interval.status == PortStatus::Unknown {
                continue;
            }
            let occupied = policy.is_occupied(interval.status);
            split_local_hours(
                interval.start.timestamp_millis(),
                interval.end.timestamp_millis(),
                offset_ms,
                |day, hour, ms| {
                    let cell = &mut acc[day][hour];
                    cell.monitored_ms += ms;
                    if occupied {
                        cell.occupied_ms += ms;
                    }
                    match interval.status {
                        PortStatus::Charging => cell.charging_ms += ms,
                        PortStatus::Unavailable => cell.unavailable_ms += ms,
                        _ => {}
                    }
                },
            );
        }
    }

    let cells: [[FingerprintCell; 24]; 7] =
        std::array::from_fn(|day| std::array::from_fn(|hour| finish_cell(day, hour, &acc[day][hour])));

    let (busiest, quietest) = rank(&cells, settings);
    Fingerprint {
        station,
        utc_offset_minutes: settings.utc_offset_minutes,
        history_start,
        history_end,
        port_count: timelines.len(),
        cells,
        busiest,
        quietest,
        members,
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn finish_cell(day: usize, hour: usize, acc: &CellAccumulator) -> FingerprintCell {
    let metrics = if acc.monitored_ms > 0 {
        let monitored = acc.monitored_ms as f64;
        Observed::Value(CellMetrics {
            occupation_utilization_pct: 100.0 * acc.occupied_ms as f64 / monitored,
            active_charging_utilization_pct: 100.0 * acc.charging_ms as f64 / monitored,
            availability_ratio: 1.0 - acc.unavailable_ms as f64 / monitored,
        })
    } else {
        Observed::NoData
    };
    FingerprintCell {
        weekday: day as u8,
        hour: hour as u8,
        label: format!("{} {hour:02}:00", WEEKDAYS[day]),
        observed_seconds: ms_to_secs(acc.monitored_ms),
        possible_seconds: ms_to_secs(acc.possible_ms),
        coverage_ratio: if acc.possible_ms > 0 {
            (acc.monitored_ms as f64 / acc.possible_ms as f64).min(1.0)
        } else {
            0.0
        },
        metrics,
    }
}

#[allow(clippy::cast_precision_loss)]
fn rank(
    cells: &[[FingerprintCell; 24]; 7],
    settings: &FingerprintSettings,
) -> (Vec<RankedCell>, Vec<RankedCell>) {
    let mut eligible: Vec<RankedCell> = cells
        .iter()
        .flatten()
        .filter(|c| {
            c.observed_seconds >= settings.min_cell_seconds as f64
                && c.coverage_ratio >= settings.min_cell_coverage
        })
        .filter_map(|c| {
            c.metrics.value().map(|m| RankedCell {
                label: c.label.clone(),
                weekday: c.weekday,
                hour: c.hour,
                occupation_utilization_pct: m.occupation_utilization_pct,
                coverage_ratio: c.coverage_ratio,
            })
        })
        .collect();

    eligible.sort_by(|a, b| {
        b.occupation_utilization_pct
            .total_cmp(&a.occupation_utilization_pct)
            .then(b.coverage_ratio.total_cmp(&a.coverage_ratio))
    });
    let busiest: Vec<RankedCell> = eligible.iter().take(settings.top_cells).cloned().collect();

    eligible.sort_by(|a, b| {
        a.occupation_utilization_pct
            .total_cmp(&b.occupation_utilization_pct)
            .then(b.coverage_ratio.total_cmp(&a.coverage_ratio))
    });
    let quietest = eligible.into_iter().take(settings.top_cells).collect();
    (busiest, quietest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::timeline::{ReconstructParams, reconstruct};
    use crate::core::window::TimeWindow;
    use crate::model::{PortKey, Snapshot};
    use chrono::{TimeDelta, TimeZone};

    fn settings() -> FingerprintSettings {
        FingerprintSettings {
            utc_offset_minutes: 0,
            min_cell_seconds: 900,
            min_cell_coverage: 0.25,
            top_cells: 3,
        }
    }

    fn params() -> ReconstructParams {
        ReconstructParams {
            max_gap: TimeDelta::minutes(10),
            policy: StatusPolicy::default(),
        }
    }

    #[test]
    fn epoch_day_is_thursday() {
        let mut seen = Vec::new();
        split_local_hours(0, HOUR_MS, 0, |d, h, ms| seen.push((d, h, ms)));
        assert_eq!(seen, vec![(3, 0, HOUR_MS)]);
        // Monday 2025-03-03.
        let monday = Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap();
        let mut seen = Vec::new();
        split_local_hours(monday.timestamp_millis(), monday.timestamp_millis() + 1, 0, |d, h, _| {
            seen.push((d, h));
        });
        assert_eq!(seen, vec![(0, 10)]);
    }

    #[test]
    fn interval_split_at_hour_boundary() {
        // 10:40..11:20 → 20m in hour 10 and 20m in hour 11.
        let start = Utc.with_ymd_and_hms(2025, 3, 3, 10, 40, 0).unwrap();
        let end = start + TimeDelta::minutes(40);
        let mut seen = Vec::new();
        split_local_hours(start.timestamp_millis(), end.timestamp_millis(), 0, |d, h, ms| {
            seen.push((d, h, ms));
        });
        assert_eq!(seen, vec![(0, 10, 20 * 60_000), (0, 11, 20 * 60_000)]);
    }

    #[test]
    fn offset_shifts_weekday_and_hour() {
        // Sunday 23:30 UTC is Monday 00:30 at +60.
        let ts = Utc.with_ymd_and_hms(2025, 3, 2, 23, 30, 0).unwrap();
        let mut seen = Vec::new();
        split_local_hours(ts.timestamp_millis(), ts.timestamp_millis() + 1, 3_600_000, |d, h, _| {
            seen.push((d, h));
        });
        assert_eq!(seen, vec![(0, 0)]);
    }

    #[test]
    fn one_week_with_two_day_outage_marks_cells_no_data() {
        // Monday 00:00 to the next Monday, polled every 5m, but nothing
        // from Wednesday 00:00 to Friday 00:00. Charging 18:00–19:00 daily.
        let start = Utc.with_ymd_and_hms(2025, 3, 3, 0, 0, 0).unwrap();
        let end = start + TimeDelta::days(7);
        let silence = (start + TimeDelta::days(2), start + TimeDelta::days(4));
        let mut snaps = Vec::new();
        let mut t = start;
        while t < end {
            if t < silence.0 || t >= silence.1 {
                let hour = (t - start).num_hours() % 24;
                let status = if hour == 18 {
                    PortStatus::Charging
                } else {
                    PortStatus::Available
                };
                snaps.push(Snapshot::new(t, status));
            }
            t += TimeDelta::minutes(5);
        }
        let window = TimeWindow::new(start, end).unwrap();
        let timeline = reconstruct(PortKey::new("L1", "S1", "1"), &snaps, window, end, &params());
        let mut members = MemberReport::default();
        members.record(true);
        let fp = build(
            StationKey::new("L1", "S1"),
            start,
            end,
            &[timeline],
            members,
            StatusPolicy::default(),
            &settings(),
        );

        // Wednesday and Thursday hours are unobserved, except Wednesday 00:00
        // which holds the 10-minute extrapolation of Tuesday's last snapshot.
        assert!(fp.cell(2, 5).unwrap().metrics.is_no_data());
        assert!(fp.cell(3, 12).unwrap().metrics.is_no_data());
        assert!(!fp.cell(2, 0).unwrap().metrics.is_no_data());

        let busy = fp.cell(0, 18).unwrap();
        let m = busy.metrics.value().unwrap();
        assert!((m.occupation_utilization_pct - 100.0).abs() < 1e-9);
        assert!((busy.coverage_ratio - 1.0).abs() < 1e-9);
        assert_eq!(busy.label, "Monday 18:00");

        let quiet = fp.cell(4, 3).unwrap().metrics.value().unwrap();
        assert!(quiet.occupation_utilization_pct.abs() < 1e-9);

        assert_eq!(fp.busiest.len(), 3);
        assert!(fp.busiest.iter().all(|c| c.hour == 18));
        assert!(fp.quietest.iter().all(|c| c.occupation_utilization_pct == 0.0));
    }

    #[test]
    fn sparse_cells_are_not_ranked() {
        let start = Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap();
        let snaps = [
            Snapshot::new(start, PortStatus::Charging),
            Snapshot::new(start + TimeDelta::minutes(5), PortStatus::Charging),
        ];
        let end = start + TimeDelta::hours(1);
        let window = TimeWindow::new(start, end).unwrap();
        let timeline = reconstruct(PortKey::new("L1", "S1", "1"), &snaps, window, end, &params());
        let fp = build(
            StationKey::new("L1", "S1"),
            start,
            end,
            &[timeline],
            MemberReport::default(),
            StatusPolicy::default(),
            &settings(),
        );
        // 15 minutes observed meets the floor but coverage is exactly 0.25.
        let cell = fp.cell(0, 9).unwrap();
        assert!((cell.observed_seconds - 900.0).abs() < 1e-9);
        assert_eq!(fp.busiest.len(), 1);

        let strict = FingerprintSettings {
            min_cell_seconds: 1800,
            ..settings()
        };
        let timeline = reconstruct(PortKey::new("L1", "S1", "1"), &snaps, window, end, &params());
        let fp = build(
            StationKey::new("L1", "S1"),
            start,
            end,
            &[timeline],
            MemberReport::default(),
            StatusPolicy::default(),
            &strict,
        );
        assert!(fp.busiest.is_empty());
        assert!(fp.quietest.is_empty());
    }
}
