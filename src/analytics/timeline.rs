//! Session reconstruction: snapshots → monitored intervals, coverage gaps, sessions.
//!
//! Status is assumed to hold from the moment it was observed until the next
//! observation, as long as the two observations are at most `max_gap` apart.
//! Wider separations become coverage gaps and nothing is extrapolated across
//! them. The final snapshot of a sequence is extended to `min(last + max_gap,
//! horizon)`; a lone snapshot carries no duration evidence at all.

#![allow(missing_docs)]

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::core::window::TimeWindow;
use crate::model::{PortKey, PortStatus, Snapshot, StatusPolicy};

/// Reconstruction parameters, fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconstructParams {
    pub max_gap: TimeDelta,
    pub policy: StatusPolicy,
}

/// Half-open range `[start, end)` with one inferred status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MonitoredInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: PortStatus,
    /// Extends past the last snapshot of the sequence.
    pub extrapolated: bool,
}

impl MonitoredInterval {
    pub fn duration_ms(&self) -> i64 {
        (self.end - self.start).num_milliseconds()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GapKind {
    /// Before the first monitored interval of the window.
    Leading,
    /// Between two monitored intervals.
    Internal,
    /// After the last monitored interval of the window.
    Trailing,
    /// The window holds no monitored interval at all.
    Unobserved,
}

/// Range of the window where status cannot be inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoverageGap {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub kind: GapKind,
}

impl CoverageGap {
    pub fn duration_ms(&self) -> i64 {
        (self.end - self.start).num_milliseconds()
    }
}

/// Maximal contiguous occupied period of one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Session {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Still running at the reconstruction horizon.
    pub open: bool,
}

impl Session {
    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn duration_minutes(&self) -> f64 {
        self.duration().num_milliseconds() as f64 / 60_000.0
    }
}

/// Reconstruction of one port over one window.
///
/// `intervals` and `gaps` are clipped to the window and partition it exactly.
/// `sessions` keep their true bounds and include every session overlapping
/// the window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortTimeline {
    pub port: PortKey,
    pub window: TimeWindow,
    pub intervals: Vec<MonitoredInterval>,
    pub gaps: Vec<CoverageGap>,
    pub sessions: Vec<Session>,
}

impl PortTimeline {
    /// Whether any monitored interval (of any status) falls in the window.
    pub fn has_data(&self) -> bool {
        !self.intervals.is_empty()
    }

    pub fn interval_ms(&self) -> i64 {
        self.intervals.iter().map(MonitoredInterval::duration_ms).sum()
    }

    pub fn gap_ms(&self) -> i64 {
        self.gaps.iter().map(CoverageGap::duration_ms).sum()
    }

    /// Sessions whose start falls inside `bucket`.
    pub fn sessions_starting_in<'a>(
        &'a self,
        bucket: &'a TimeWindow,
    ) -> impl Iterator<Item = &'a Session> + 'a {
        self.sessions.iter().filter(|s| bucket.contains(s.start))
    }
}

/// Sort by `observed_at` and collapse equal timestamps, keeping the later record.
pub fn normalize(snapshots: &[Snapshot]) -> Vec<Snapshot> {
    let mut ordered = snapshots.to_vec();
    ordered.sort_by_key(|s| s.observed_at);
    let mut out: Vec<Snapshot> = Vec::with_capacity(ordered.len());
    for snapshot in ordered {
        match out.last_mut() {
            Some(last) if last.observed_at == snapshot.observed_at => *last = snapshot,
            _ => out.push(snapshot),
        }
    }
    out
}

/// Unclipped monitored intervals of an ordered, de-duplicated sequence.
pub fn monitored_intervals(
    ordered: &[Snapshot],
    horizon: DateTime<Utc>,
    max_gap: TimeDelta,
) -> Vec<MonitoredInterval> {
    if ordered.len() < 2 {
        return Vec::new();
    }

    let mut out: Vec<MonitoredInterval> = ordered
        .windows(2)
        .filter(|pair| pair[1].observed_at - pair[0].observed_at <= max_gap)
        .map(|pair| MonitoredInterval {
            start: pair[0].observed_at,
            end: pair[1].observed_at,
            status: pair[0].status,
            extrapolated: false,
        })
        .collect();

    if let Some(last) = ordered.last() {
        let cap = last
            .observed_at
            .checked_add_signed(max_gap)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
            .min(horizon);
        if cap > last.observed_at {
            out.push(MonitoredInterval {
                start: last.observed_at,
                end: cap,
                status: last.status,
                extrapolated: true,
            });
        }
    }
    out
}

/// Merge contiguous occupied intervals into sessions.
pub fn assemble_sessions(
    intervals: &[MonitoredInterval],
    policy: StatusPolicy,
    horizon: DateTime<Utc>,
) -> Vec<Session> {
    let mut sessions = Vec::new();
    let mut current: Option<Session> = None;

    for interval in intervals {
        if !policy.is_occupied(interval.status) {
            sessions.extend(current.take());
            continue;
        }
        let open = interval.extrapolated && interval.end >= horizon;
        match current.as_mut() {
            Some(session) if session.end == interval.start => {
                session.end = interval.end;
                session.open = open;
            }
            _ => {
                sessions.extend(current.take());
                current = Some(Session {
                    start: interval.start,
                    end: interval.end,
                    open,
                });
            }
        }
    }
    sessions.extend(current);
    sessions.retain(|s| s.end > s.start);
    sessions
}

/// Reconstruct one port over `window`.
///
/// `snapshots` may arrive in any order and should include the nearest
/// snapshot on each side of the window so boundary intervals come out the same
/// as they would from the full history.
pub fn reconstruct(
    port: PortKey,
    snapshots: &[Snapshot],
    window: TimeWindow,
    horizon: DateTime<Utc>,
    params: &ReconstructParams,
) -> PortTimeline {
    let ordered = normalize(snapshots);
    let raw = monitored_intervals(&ordered, horizon, params.max_gap);

    let sessions = assemble_sessions(&raw, params.policy, horizon)
        .into_iter()
        .filter(|s| window.overlaps(s.start, s.end))
        .collect();

    let intervals: Vec<MonitoredInterval> = raw
        .iter()
        .filter_map(|interval| {
            window
                .clip(interval.start, interval.end)
                .map(|(start, end)| MonitoredInterval {
                    start,
                    end,
                    ..*interval
                })
        })
        .collect();
    let gaps = complement(&intervals, window);

    PortTimeline {
        port,
        window,
        intervals,
        gaps,
        sessions,
    }
}

fn complement(intervals: &[MonitoredInterval], window: TimeWindow) -> Vec<CoverageGap> {
    if intervals.is_empty() {
        return vec![CoverageGap {
            start: window.start,
            end: window.end,
            kind: GapKind::Unobserved,
        }];
    }

    let mut gaps = Vec::new();
    let mut cursor = window.start;
    for (index, interval) in intervals.iter().enumerate() {
        if interval.start > cursor {
            gaps.push(CoverageGap {
                start: cursor,
                end: interval.start,
                kind: if index == 0 {
                    GapKind::Leading
                } else {
                    GapKind::Internal
                },
            });
        }
        cursor = cursor.max(interval.end);
    }
    if cursor < window.end {
        gaps.push(CoverageGap {
            start: cursor,
            end: window.end,
            kind: GapKind::Trailing,
        });
    }
    gaps
}
