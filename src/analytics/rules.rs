//! Problematic-charger rules evaluated at an explicit instant.
//!
//! * `UNUSED`: no session overlapped the last `unused_days`.
//! * `NO_LONG_SESSION`: no session of at least `long_session_min_minutes`
//!   overlapped the last `long_session_days`.
//! * `UNAVAILABLE_TOO_LONG`: the port is currently unavailable and has been,
//!   without interruption, for at least `unavailable_hours`.
//!
//! A rule never fires for a port whose history is shorter than its window.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::analytics::timeline::{Session, assemble_sessions, monitored_intervals, normalize};
use crate::analytics::utilization::MemberReport;
use crate::core::config::{MAX_RULE_DAYS, RulesConfig, check_day_bound};
use crate::core::errors::Result;
use crate::model::{PortKey, PortStatus, Snapshot, StationKey, StatusPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuleThresholds {
    pub unused_days: u64,
    pub long_session_days: u64,
    pub long_session_min_minutes: u64,
    pub unavailable_hours: u64,
}

impl From<&RulesConfig> for RuleThresholds {
    fn from(config: &RulesConfig) -> Self {
        Self {
            unused_days: config.unused_days,
            long_session_days: config.long_session_days,
            long_session_min_minutes: config.long_session_min_minutes,
            unavailable_hours: config.unavailable_hours,
        }
    }
}

impl RuleThresholds {
    pub fn validate(&self) -> Result<()> {
        RulesConfig {
            unused_days: self.unused_days,
            long_session_days: self.long_session_days,
            long_session_min_minutes: self.long_session_min_minutes,
            unavailable_hours: self.unavailable_hours,
        }
        .validate("")
    }

    /// How much history evaluation needs before `now`.
    pub fn lookback(&self) -> TimeDelta {
        days(self.unused_days)
            .max(days(self.long_session_days))
            .max(hours(self.unavailable_hours))
    }
}

fn days(n: u64) -> TimeDelta {
    TimeDelta::try_days(i64::try_from(n).unwrap_or(i64::MAX)).unwrap_or(TimeDelta::MAX)
}

fn hours(n: u64) -> TimeDelta {
    TimeDelta::try_hours(i64::try_from(n).unwrap_or(i64::MAX)).unwrap_or(TimeDelta::MAX)
}

fn minutes(n: u64) -> TimeDelta {
    TimeDelta::try_minutes(i64::try_from(n).unwrap_or(i64::MAX)).unwrap_or(TimeDelta::MAX)
}

/// `now - span`, saturating at the earliest representable instant.
fn before(now: DateTime<Utc>, span: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Trailing day windows for [`unused_counts`] must each be in `1..=MAX_RULE_DAYS`.
pub fn validate_day_windows(day_windows: &[u64]) -> Result<()> {
    day_windows
        .iter()
        .try_for_each(|&d| check_day_bound("unused window", d, MAX_RULE_DAYS))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlagReason {
    Unused,
    NoLongSession,
    UnavailableTooLong,
}

/// What one port's history says about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEvidence {
    pub port: PortKey,
    /// Earliest snapshot still stored for the port.
    pub first_seen: DateTime<Utc>,
    /// Snapshots covering at least the lookback, plus the one just before it.
    pub history: Vec<Snapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortEvaluation {
    pub port: PortKey,
    pub flags: Vec<FlagReason>,
    pub last_seen: DateTime<Utc>,
    pub current_status: PortStatus,
    /// Last snapshot is older than the gap threshold.
    pub stale: bool,
    pub unavailable_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuleCounts {
    pub unused: usize,
    pub no_long_session: usize,
    pub unavailable_too_long: usize,
    /// Ports with at least one flag.
    pub flagged_ports: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleEvaluation {
    pub evaluated_at: DateTime<Utc>,
    pub thresholds: RuleThresholds,
    /// Every evaluated port; unflagged ports carry an empty `flags`.
    pub ports: Vec<PortEvaluation>,
    pub counts: RuleCounts,
    pub members: MemberReport,
}

impl RuleEvaluation {
    pub fn flagged(&self) -> impl Iterator<Item = &PortEvaluation> {
        self.ports.iter().filter(|p| !p.flags.is_empty())
    }
}

/// Port evidence with its reconstructed sessions.
struct Prepared {
    ordered: Vec<Snapshot>,
    sessions: Vec<Session>,
}

fn prepare(evidence: &PortEvidence, now: DateTime<Utc>, max_gap: TimeDelta, policy: StatusPolicy) -> Prepared {
    let ordered: Vec<Snapshot> = normalize(&evidence.history)
        .into_iter()
        .filter(|s| s.observed_at <= now)
        .collect();
    let intervals = monitored_intervals(&ordered, now, max_gap);
    let sessions = assemble_sessions(&intervals, policy, now);
    Prepared { ordered, sessions }
}

fn used_since(sessions: &[Session], since: DateTime<Utc>, min_length: TimeDelta) -> bool {
    sessions
        .iter()
        .any(|s| s.end > since && s.duration() >= min_length)
}

fn no_session_since(
    evidence: &PortEvidence,
    sessions: &[Session],
    since: DateTime<Utc>,
    min_length: TimeDelta,
) -> bool {
    evidence.first_seen <= since && !used_since(sessions, since, min_length)
}

/// Start of the uninterrupted unavailable run ending at the last snapshot.
fn unavailable_run_start(ordered: &[Snapshot], max_gap: TimeDelta) -> Option<DateTime<Utc>> {
    let last = ordered.last()?;
    if last.status != PortStatus::Unavailable {
        return None;
    }
    let mut index = ordered.len() - 1;
    while index > 0 {
        let prev = &ordered[index - 1];
        if prev.status != PortStatus::Unavailable
            || ordered[index].observed_at - prev.observed_at > max_gap
        {
            break;
        }
        index -= 1;
    }
    Some(ordered[index].observed_at)
}

/// Evaluate one port. `None` when no snapshot precedes `now`.
pub fn evaluate_port(
    evidence: &PortEvidence,
    thresholds: &RuleThresholds,
    now: DateTime<Utc>,
    max_gap: TimeDelta,
    policy: StatusPolicy,
) -> Option<PortEvaluation> {
    let prepared = prepare(evidence, now, max_gap, policy);
    let last = *prepared.ordered.last()?;
    let stale = now - last.observed_at > max_gap;
    let mut flags = Vec::new();

    let unused_since = before(now, days(thresholds.unused_days));
    if no_session_since(evidence, &prepared.sessions, unused_since, TimeDelta::zero()) {
        flags.push(FlagReason::Unused);
    }

    let long_since = before(now, days(thresholds.long_session_days));
    let long_min = minutes(thresholds.long_session_min_minutes);
    if no_session_since(evidence, &prepared.sessions, long_since, long_min) {
        flags.push(FlagReason::NoLongSession);
    }

    let unavailable_since = if stale {
        None
    } else {
        unavailable_run_start(&prepared.ordered, max_gap)
    };
    if let Some(since) = unavailable_since
        && now - since >= hours(thresholds.unavailable_hours)
    {
        flags.push(FlagReason::UnavailableTooLong);
    }

    Some(PortEvaluation {
        port: evidence.port.clone(),
        flags,
        last_seen: last.observed_at,
        current_status: last.status,
        stale,
        unavailable_since,
    })
}

/// Evaluate every member. Unreadable members are reported, not fatal.
pub fn evaluate(
    members: Vec<(PortKey, Result<PortEvidence>)>,
    thresholds: RuleThresholds,
    now: DateTime<Utc>,
    max_gap: TimeDelta,
    policy: StatusPolicy,
) -> RuleEvaluation {
    let mut report = MemberReport::default();
    let mut ports = Vec::new();
    let mut counts = RuleCounts::default();

    for (port, result) in members {
        let evidence = match result {
            Ok(evidence) => evidence,
            Err(err) => {
                eprintln!("[EW-RULE] skipping {port}: {err}");
                report.record_failure(port, &err);
                continue;
            }
        };
        let Some(evaluation) = evaluate_port(&evidence, &thresholds, now, max_gap, policy) else {
            report.record(false);
            continue;
        };
        report.record(true);
        for flag in &evaluation.flags {
            match flag {
                FlagReason::Unused => counts.unused += 1,
                FlagReason::NoLongSession => counts.no_long_session += 1,
                FlagReason::UnavailableTooLong => counts.unavailable_too_long += 1,
            }
        }
        if !evaluation.flags.is_empty() {
            counts.flagged_ports += 1;
        }
        ports.push(evaluation);
    }

    RuleEvaluation {
        evaluated_at: now,
        thresholds,
        ports,
        counts,
        members: report,
    }
}

/// Ports and stations with no session in a trailing window of `days`.
///
/// A station counts when none of its ports had a session and its oldest
/// snapshot predates the window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnusedCount {
    pub days: u64,
    pub ports: usize,
    pub stations: usize,
}

pub fn unused_counts(
    members: &[PortEvidence],
    day_windows: &[u64],
    now: DateTime<Utc>,
    max_gap: TimeDelta,
    policy: StatusPolicy,
) -> Vec<UnusedCount> {
    let prepared: Vec<(&PortEvidence, Prepared)> = members
        .iter()
        .map(|e| (e, prepare(e, now, max_gap, policy)))
        .filter(|(_, p)| !p.ordered.is_empty())
        .collect();
    let mut stations: BTreeMap<StationKey, Vec<&(&PortEvidence, Prepared)>> = BTreeMap::new();
    for member in &prepared {
        stations.entry(member.0.port.station()).or_default().push(member);
    }

    day_windows
        .iter()
        .map(|&d| {
            let since = before(now, days(d));
            UnusedCount {
                days: d,
                ports: prepared
                    .iter()
                    .filter(|(e, p)| no_session_since(e, &p.sessions, since, TimeDelta::zero()))
                    .count(),
                stations: stations
                    .values()
                    .filter(|ports| {
                        ports.iter().map(|(e, _)| e.first_seen).min() <= Some(since)
                            && !ports
                                .iter()
                                .any(|(_, p)| used_since(&p.sessions, since, TimeDelta::zero()))
                    })
                    .count(),
            }
        })
        .collect()
}
