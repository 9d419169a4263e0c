//! Engine facade: one writer connection, one reader connection, pure analytics.
//!
//! Ingestion, pruning and compaction go through the writer. Every query opens
//! a [`ReadView`] on the reader, so a query sees one consistent store snapshot
//! even while a batch commits or a prune runs. Nothing derived is cached.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::analytics::fingerprint::{self, Fingerprint, FingerprintSettings};
use crate::analytics::reliability::{self, ReliabilityRollup, ReliabilityStats};
use crate::analytics::rules::{self, PortEvidence, RuleEvaluation, RuleThresholds, UnusedCount};
use crate::analytics::timeline::{PortTimeline, ReconstructParams, reconstruct};
use crate::analytics::utilization::{
    self, PortSessions, ScopeSummary, SeriesReport, SessionStats, SessionThresholds,
};
use crate::core::config::Config;
use crate::core::errors::{EwError, Result};
use crate::core::window::{Granularity, TimeWindow, format_ts};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::model::{
    IngestBatch, PortKey, PortStatus, Scope, Snapshot, SnapshotRecord, StationKey, StatusPolicy,
};
use crate::store::retention::{CompactReport, PruneReport, RetentionManager};
use crate::store::sqlite::{HighWaterMark, ReadView, SnapshotStore, StoreStats, WriteCounts};

// ──────────────────── settings ────────────────────

/// Immutable parameters derived once from [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub max_gap: TimeDelta,
    pub clock_skew_tolerance: TimeDelta,
    pub policy: StatusPolicy,
    pub rules: RuleThresholds,
    pub sessions: SessionThresholds,
    pub fingerprint: FingerprintSettings,
    pub retention: RetentionManager,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_gap: config.sampling.max_gap(),
            clock_skew_tolerance: config.sampling.clock_skew_tolerance(),
            policy: StatusPolicy {
                in_use_counts_as_occupied: config.occupancy.in_use_counts_as_occupied,
            },
            rules: RuleThresholds::from(&config.rules),
            sessions: SessionThresholds {
                short_minutes: config.sessions.short_session_minutes,
                long_minutes: config.rules.long_session_min_minutes,
            },
            fingerprint: FingerprintSettings::from(&config.fingerprint),
            retention: RetentionManager::from_config(&config.retention),
        }
    }

    fn reconstruct_params(&self) -> ReconstructParams {
        ReconstructParams {
            max_gap: self.max_gap,
            policy: self.policy,
        }
    }
}

// ──────────────────── reports ────────────────────

/// A batch record refused at ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedSnapshot {
    pub port: PortKey,
    pub observed_at: DateTime<Utc>,
    pub code: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub fetched_at: DateTime<Utc>,
    /// SHA-256 of the batch as received.
    pub batch_digest: String,
    pub received: usize,
    /// Records sharing a key with a later record of the same batch.
    pub duplicates_in_batch: usize,
    pub unknown_statuses: usize,
    pub written: WriteCounts,
    pub out_of_order: u64,
    pub rejected: Vec<RejectedSnapshot>,
    pub duration_ms: u64,
}

/// One row of the current-status board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortStatusRow {
    pub port: PortKey,
    pub status: PortStatus,
    pub raw_status: String,
    pub observed_at: DateTime<Utc>,
    pub last_updated: Option<String>,
    /// Newest snapshot is older than the gap threshold.
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub charging: usize,
    pub unavailable: usize,
    pub unknown: usize,
    pub stale: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusBoard {
    pub scope: Scope,
    pub generated_at: DateTime<Utc>,
    pub counts: StatusCounts,
    pub ports: Vec<PortStatusRow>,
}

// ──────────────────── engine ────────────────────

pub struct Engine {
    settings: EngineSettings,
    writer: Mutex<SnapshotStore>,
    reader: Mutex<SnapshotStore>,
    activity: ActivityLoggerHandle,
}

impl Engine {
    /// Open the configured database with two connections.
    pub fn open(config: &Config, activity: ActivityLoggerHandle) -> Result<Self> {
        Self::open_at(
            &config.paths.database,
            EngineSettings::from_config(config),
            activity,
        )
    }

    pub fn open_at(
        path: &Path,
        settings: EngineSettings,
        activity: ActivityLoggerHandle,
    ) -> Result<Self> {
        let writer = SnapshotStore::open(path)?;
        let reader = SnapshotStore::open(path)?;
        Ok(Self {
            settings,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            activity,
        })
    }

    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn activity(&self) -> &ActivityLoggerHandle {
        &self.activity
    }

    // ──────────────────── ingestion ────────────────────

    /// Apply one batch atomically.
    ///
    /// Records further than the skew tolerance ahead of `now` are rejected and
    /// logged; the rest of the batch still commits.
    pub fn ingest(&self, batch: &IngestBatch, now: DateTime<Utc>) -> Result<IngestReport> {
        let started = Instant::now();
        let batch_digest = batch_digest(batch)?;
        let limit = now
            .checked_add_signed(self.settings.clock_skew_tolerance)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut rejected = Vec::new();
        let mut unique: BTreeMap<(PortKey, i64), &SnapshotRecord> = BTreeMap::new();
        let mut accepted = 0_usize;
        for record in &batch.records {
            if record.observed_at > limit {
                let err = EwError::ClockSkew {
                    port: record.port.to_string(),
                    observed_at: format_ts(record.observed_at),
                    now: format_ts(now),
                };
                self.activity.send(ActivityEvent::SnapshotRejected {
                    port: record.port.to_string(),
                    observed_at: format_ts(record.observed_at),
                    code: err.code().to_string(),
                    reason: err.to_string(),
                });
                rejected.push(RejectedSnapshot {
                    port: record.port.clone(),
                    observed_at: record.observed_at,
                    code: err.code().to_string(),
                    reason: err.to_string(),
                });
                continue;
            }
            accepted += 1;
            unique.insert(
                (record.port.clone(), record.observed_at.timestamp_millis()),
                record,
            );
        }

        let records: Vec<SnapshotRecord> = unique.into_values().cloned().collect();
        let written = match self.writer.lock().ingest(&records) {
            Ok(counts) => counts,
            Err(err) => {
                self.activity.send(ActivityEvent::error(&err));
                return Err(err);
            }
        };

        let report = IngestReport {
            fetched_at: batch.fetched_at,
            batch_digest,
            received: batch.records.len(),
            duplicates_in_batch: accepted - records.len(),
            unknown_statuses: records
                .iter()
                .filter(|r| r.status == PortStatus::Unknown)
                .count(),
            written,
            out_of_order: written.out_of_order,
            rejected,
            duration_ms: elapsed_ms(started),
        };

        if report.out_of_order > 0 {
            self.activity.send(ActivityEvent::OutOfOrderAccepted {
                digest: report.batch_digest.clone(),
                count: report.out_of_order,
            });
        }
        self.activity.send(ActivityEvent::BatchIngested {
            digest: report.batch_digest.clone(),
            received: report.received as u64,
            inserted: written.inserted,
            replaced: written.replaced,
            rejected: report.rejected.len() as u64,
            duration_ms: report.duration_ms,
        });
        Ok(report)
    }

    // ──────────────────── utilization ────────────────────

    pub fn summarize(
        &self,
        scope: &Scope,
        window: TimeWindow,
        now: DateTime<Utc>,
    ) -> Result<ScopeSummary> {
        let mut reader = self.reader.lock();
        let view = reader.read_view()?;
        let members = self.timelines(&view, scope, window, now)?;
        Ok(utilization::summarize(
            scope.clone(),
            window,
            members,
            self.settings.policy,
        ))
    }

    pub fn summarize_series(
        &self,
        scope: &Scope,
        window: TimeWindow,
        granularity: Granularity,
        now: DateTime<Utc>,
    ) -> Result<SeriesReport> {
        let mut reader = self.reader.lock();
        let view = reader.read_view()?;
        let members = self.timelines(&view, scope, window, now)?;
        Ok(utilization::summarize_series(
            scope.clone(),
            window,
            granularity,
            members,
            self.settings.policy,
        ))
    }

    pub fn session_stats(
        &self,
        scope: &Scope,
        window: TimeWindow,
        now: DateTime<Utc>,
    ) -> Result<SessionStats> {
        let mut reader = self.reader.lock();
        let view = reader.read_view()?;
        let members = self.timelines(&view, scope, window, now)?;
        Ok(utilization::session_stats(
            scope.clone(),
            window,
            members,
            self.settings.sessions,
        ))
    }

    /// Newest-first sessions per port overlapping `window`.
    pub fn recent_sessions(
        &self,
        scope: &Scope,
        window: TimeWindow,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<PortSessions>> {
        let mut reader = self.reader.lock();
        let view = reader.read_view()?;
        let members = self.timelines(&view, scope, window, now)?;
        let (timelines, _) = utilization::partition_members(members);
        Ok(utilization::recent_sessions(&timelines, limit))
    }

    /// Reconstruct every port in `scope`. Listing ports is the only fatal read.
    fn timelines(
        &self,
        view: &ReadView<'_>,
        scope: &Scope,
        window: TimeWindow,
        now: DateTime<Utc>,
    ) -> Result<Vec<(PortKey, Result<PortTimeline>)>> {
        let params = self.settings.reconstruct_params();
        Ok(view
            .ports(scope)?
            .into_iter()
            .map(|port| {
                let timeline = view
                    .port_history(&port, window.start, window.end)
                    .map(|history| reconstruct(port.clone(), &history, window, now, &params));
                (port, timeline)
            })
            .collect())
    }

    // ──────────────────── reliability ────────────────────

    pub fn reliability(
        &self,
        port: &PortKey,
        window: TimeWindow,
    ) -> Result<ReliabilityStats> {
        let mut reader = self.reader.lock();
        let view = reader.read_view()?;
        let history = Self::reliability_history(&view, port, window)?;
        Ok(reliability::analyze(
            port.clone(),
            &history,
            window,
            self.settings.max_gap,
        ))
    }

    /// Per-port outages plus, above port scope, station-wide outages.
    ///
    /// A station with an unreadable port is left out of `stations`.
    pub fn reliability_rollup(
        &self,
        scope: &Scope,
        window: TimeWindow,
    ) -> Result<ReliabilityRollup> {
        let mut reader = self.reader.lock();
        let view = reader.read_view()?;
        let mut members = Vec::new();
        let mut by_station: BTreeMap<StationKey, Option<Vec<Vec<Snapshot>>>> = BTreeMap::new();
        for port in view.ports(scope)? {
            let histories = by_station
                .entry(port.station())
                .or_insert_with(|| Some(Vec::new()));
            match Self::reliability_history(&view, &port, window) {
                Ok(history) => {
                    let stats =
                        reliability::analyze(port.clone(), &history, window, self.settings.max_gap);
                    if let Some(histories) = histories {
                        histories.push(history);
                    }
                    members.push((port, Ok(stats)));
                }
                Err(err) => {
                    *histories = None;
                    members.push((port, Err(err)));
                }
            }
        }

        let stations = if matches!(scope, Scope::Port(_)) {
            Vec::new()
        } else {
            by_station
                .into_iter()
                .filter_map(|(station, histories)| {
                    histories.map(|h| {
                        reliability::analyze_station(station, &h, window, self.settings.max_gap)
                    })
                })
                .collect()
        };
        Ok(reliability::rollup(scope.clone(), window, members, stations))
    }

    /// The port's stored history up to the window end, so an outage already
    /// running at the window start keeps its true start.
    fn reliability_history(
        view: &ReadView<'_>,
        port: &PortKey,
        window: TimeWindow,
    ) -> Result<Vec<Snapshot>> {
        let from = view
            .first_observed(&Scope::Port(port.clone()))?
            .map_or(window.start, |first| first.min(window.start));
        view.port_history(port, from, window.end)
    }

    // ──────────────────── fingerprint ────────────────────

    /// Weekly fingerprint over the station's whole stored history.
    /// `None` for a station with no stored snapshot before `now`.
    pub fn fingerprint(
        &self,
        station: &StationKey,
        now: DateTime<Utc>,
    ) -> Result<Option<Fingerprint>> {
        let scope = Scope::Station(station.clone());
        let mut reader = self.reader.lock();
        let view = reader.read_view()?;
        let Some(first) = view.first_observed(&scope)? else {
            return Ok(None);
        };
        let Ok(window) = TimeWindow::new(first, now) else {
            return Ok(None);
        };

        let (timelines, members) =
            utilization::partition_members(self.timelines(&view, &scope, window, now)?);
        Ok(Some(fingerprint::build(
            station.clone(),
            window.start,
            window.end,
            &timelines,
            members,
            self.settings.policy,
            &self.settings.fingerprint,
        )))
    }

    // ──────────────────── rules ────────────────────

    pub fn evaluate_rules(
        &self,
        thresholds: RuleThresholds,
        now: DateTime<Utc>,
    ) -> Result<RuleEvaluation> {
        let members = self.rule_evidence(thresholds.lookback(), now)?;
        let evaluation = rules::evaluate(
            members,
            thresholds,
            now,
            self.settings.max_gap,
            self.settings.policy,
        );
        self.activity.send(ActivityEvent::RulesEvaluated {
            flagged_ports: evaluation.counts.flagged_ports as u64,
            details: format!(
                "unused={} no_long_session={} unavailable_too_long={}",
                evaluation.counts.unused,
                evaluation.counts.no_long_session,
                evaluation.counts.unavailable_too_long
            ),
        });
        Ok(evaluation)
    }

    /// Ports with no session in each trailing window of `days`.
    pub fn unused_counts(&self, days: &[u64], now: DateTime<Utc>) -> Result<Vec<UnusedCount>> {
        let longest = days.iter().copied().max().unwrap_or(0);
        let lookback = TimeDelta::try_days(i64::try_from(longest).unwrap_or(i64::MAX))
            .unwrap_or(TimeDelta::MAX);
        let evidence: Vec<PortEvidence> = self
            .rule_evidence(lookback, now)?
            .into_iter()
            .filter_map(|(port, result)| match result {
                Ok(evidence) => Some(evidence),
                Err(err) => {
                    eprintln!("[EW-RULE] skipping {port}: {err}");
                    None
                }
            })
            .collect();
        Ok(rules::unused_counts(
            &evidence,
            days,
            now,
            self.settings.max_gap,
            self.settings.policy,
        ))
    }

    fn rule_evidence(
        &self,
        lookback: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<Vec<(PortKey, Result<PortEvidence>)>> {
        let since = now
            .checked_sub_signed(lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut reader = self.reader.lock();
        let view = reader.read_view()?;
        Ok(view
            .ports(&Scope::Network)?
            .into_iter()
            .map(|port| {
                let evidence = Self::port_evidence(&view, &port, since, now);
                (port, evidence)
            })
            .collect())
    }

    fn port_evidence(
        view: &ReadView<'_>,
        port: &PortKey,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PortEvidence> {
        let first_seen = view
            .first_observed(&Scope::Port(port.clone()))?
            .unwrap_or(now);
        let history = if since < now {
            view.port_history(port, since, now)?
        } else {
            Vec::new()
        };
        Ok(PortEvidence {
            port: port.clone(),
            first_seen,
            history,
        })
    }

    // ──────────────────── status ────────────────────

    /// Newest snapshot of every port in `scope`.
    pub fn current_status(&self, scope: &Scope, now: DateTime<Utc>) -> Result<StatusBoard> {
        let mut reader = self.reader.lock();
        let view = reader.read_view()?;
        let mut counts = StatusCounts::default();
        let ports: Vec<PortStatusRow> = view
            .latest_per_port(scope)?
            .into_iter()
            .map(|latest| {
                let stale = now - latest.snapshot.observed_at > self.settings.max_gap;
                counts.total += 1;
                counts.stale += usize::from(stale);
                match latest.snapshot.status {
                    PortStatus::Available => counts.available += 1,
                    PortStatus::InUse => counts.in_use += 1,
                    PortStatus::Charging => counts.charging += 1,
                    PortStatus::Unavailable => counts.unavailable += 1,
                    PortStatus::Unknown => counts.unknown += 1,
                }
                PortStatusRow {
                    port: latest.port,
                    status: latest.snapshot.status,
                    raw_status: latest.raw_status,
                    observed_at: latest.snapshot.observed_at,
                    last_updated: latest.last_updated,
                    stale,
                }
            })
            .collect();
        Ok(StatusBoard {
            scope: scope.clone(),
            generated_at: now,
            counts,
            ports,
        })
    }

    // ──────────────────── maintenance ────────────────────

    pub fn prune(&self, now: DateTime<Utc>) -> Result<PruneReport> {
        let result = self.settings.retention.prune(&mut self.writer.lock(), now);
        match &result {
            Ok(report) => self.activity.send(ActivityEvent::RetentionPruned {
                cutoff: format_ts(report.cutoff),
                deleted: report.deleted,
                duration_ms: report.duration_ms,
            }),
            Err(err) => self.activity.send(ActivityEvent::error(err)),
        }
        result
    }

    pub fn compact(&self) -> Result<CompactReport> {
        let result = self.settings.retention.compact(&self.writer.lock());
        match &result {
            Ok(report) => self.activity.send(ActivityEvent::Compacted {
                reclaimed_bytes: report.reclaimed_bytes,
                duration_ms: report.duration_ms,
            }),
            Err(err) => self.activity.send(ActivityEvent::error(err)),
        }
        result
    }

    pub fn store_stats(&self) -> Result<StoreStats> {
        self.settings.retention.stats(&self.reader.lock())
    }

    /// Changes whenever an effective write lands.
    pub fn high_water_mark(&self) -> Result<HighWaterMark> {
        let mut reader = self.reader.lock();
        let view = reader.read_view()?;
        view.high_water_mark()
    }
}

/// Lowercase hex SHA-256 of the batch's JSON form.
fn batch_digest(batch: &IngestBatch) -> Result<String> {
    let bytes = serde_json::to_vec(batch)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::rules::FlagReason;
    use crate::model::Observed;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap()
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        t0() + TimeDelta::minutes(minutes)
    }

    fn engine(dir: &Path) -> Engine {
        let mut config = Config::default();
        config.sampling.expected_poll_interval_secs = 300;
        Engine::open_at(
            &dir.join("snapshots.sqlite3"),
            EngineSettings::from_config(&config),
            ActivityLoggerHandle::detached(),
        )
        .unwrap()
    }

    fn batch(port: &str, minutes: std::ops::Range<i64>, status: &str) -> IngestBatch {
        IngestBatch {
            fetched_at: at(minutes.end),
            records: minutes
                .step_by(5)
                .map(|m| SnapshotRecord::new(PortKey::new("L1", "S1", port), status, at(m)))
                .collect(),
        }
    }

    #[test]
    fn ingest_rejects_future_records_and_commits_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let mut b = batch("1", 0..30, "AVAILABLE");
        b.records.push(SnapshotRecord::new(
            PortKey::new("L1", "S1", "1"),
            "CHARGING",
            at(30) + TimeDelta::hours(1),
        ));
        let report = engine.ingest(&b, at(30)).unwrap();
        assert_eq!(report.received, 7);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].code, "EW-2001");
        assert_eq!(report.written.inserted, 6);
        assert_eq!(report.batch_digest.len(), 64);
    }

    #[test]
    fn ingest_collapses_duplicates_within_batch() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let port = PortKey::new("L1", "S1", "1");
        let b = IngestBatch {
            fetched_at: at(0),
            records: vec![
                SnapshotRecord::new(port.clone(), "AVAILABLE", at(0)),
                SnapshotRecord::new(port.clone(), "CHARGING", at(0)),
            ],
        };
        let report = engine.ingest(&b, at(0)).unwrap();
        assert_eq!(report.duplicates_in_batch, 1);
        assert_eq!(report.written.inserted, 1);
        let board = engine.current_status(&Scope::Network, at(0)).unwrap();
        assert_eq!(board.ports[0].status, PortStatus::Charging);
    }

    #[test]
    fn reingesting_a_batch_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let b = batch("1", 0..120, "CHARGING");
        let window = TimeWindow::new(at(0), at(120)).unwrap();

        engine.ingest(&b, at(120)).unwrap();
        let first = engine.summarize(&Scope::Network, window, at(120)).unwrap();
        let mark = engine.high_water_mark().unwrap();
        let again = engine.ingest(&b, at(120)).unwrap();
        assert_eq!(again.written.inserted, 0);
        assert_eq!(again.written.unchanged, 24);

        let second = engine.summarize(&Scope::Network, window, at(120)).unwrap();
        assert_eq!(first, second);
        assert_eq!(mark, engine.high_water_mark().unwrap());
    }

    #[test]
    fn status_board_marks_stale_ports() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.ingest(&batch("1", 0..60, "CHARGING"), at(60)).unwrap();
        engine.ingest(&batch("2", 0..10, "UNAVAILABLE"), at(60)).unwrap();

        let board = engine.current_status(&Scope::Network, at(60)).unwrap();
        assert_eq!(board.counts.total, 2);
        assert_eq!(board.counts.charging, 1);
        assert_eq!(board.counts.unavailable, 1);
        assert_eq!(board.counts.stale, 1);
        assert!(board.ports[1].stale);
    }

    #[test]
    fn reliability_sees_outage_started_before_window() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.ingest(&batch("1", 0..30, "AVAILABLE"), at(30)).unwrap();
        engine.ingest(&batch("1", 30..240, "UNAVAILABLE"), at(240)).unwrap();
        engine.ingest(&batch("1", 240..260, "AVAILABLE"), at(260)).unwrap();

        let window = TimeWindow::new(at(200), at(260)).unwrap();
        let stats = engine
            .reliability(&PortKey::new("L1", "S1", "1"), window)
            .unwrap();
        assert_eq!(stats.outage_count(), 1);
        assert_eq!(stats.outages[0].start, at(30));
        assert_eq!(stats.mttr_minutes, Observed::Value(210.0));
        assert!(!stats.outages[0].low_confidence);
    }

    #[test]
    fn fingerprint_unknown_station_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.ingest(&batch("1", 0..60, "CHARGING"), at(60)).unwrap();
        assert!(
            engine
                .fingerprint(&StationKey::new("L9", "S9"), at(60))
                .unwrap()
                .is_none()
        );
        let fp = engine
            .fingerprint(&StationKey::new("L1", "S1"), at(60))
            .unwrap()
            .unwrap();
        assert_eq!(fp.port_count, 1);
        // 2025-09-01 is a Monday.
        assert!(!fp.cell(0, 0).unwrap().metrics.is_no_data());
    }

    #[test]
    fn rules_flag_long_outage() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine
            .ingest(&batch("1", 0..(30 * 60 + 5), "UNAVAILABLE"), at(30 * 60))
            .unwrap();
        let eval = engine
            .evaluate_rules(engine.settings().rules, at(30 * 60))
            .unwrap();
        assert_eq!(eval.counts.unavailable_too_long, 1);
        assert!(eval.ports[0].flags.contains(&FlagReason::UnavailableTooLong));
    }

    #[test]
    fn prune_is_logged_and_keeps_latest() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.ingest(&batch("1", 0..60, "AVAILABLE"), at(60)).unwrap();
        let report = engine.prune(at(60) + TimeDelta::days(60)).unwrap();
        assert_eq!(report.deleted, 11);
        assert_eq!(engine.store_stats().unwrap().rows, 1);
        engine.compact().unwrap();
    }
}
