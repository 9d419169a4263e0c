//! Retention: horizon-based pruning, compaction, and size diagnostics.

#![allow(missing_docs)]

use std::time::Instant;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::core::config::RetentionConfig;
use crate::core::errors::Result;
use crate::store::sqlite::{SnapshotStore, StoreStats};

/// Retention policy applied to a [`SnapshotStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionManager {
    horizon: TimeDelta,
    grace: TimeDelta,
}

/// Result of one prune pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub cutoff: DateTime<Utc>,
    pub deleted: u64,
    pub duration_ms: u64,
}

/// Result of one compaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactReport {
    pub size_before: u64,
    pub size_after: u64,
    pub reclaimed_bytes: u64,
    pub duration_ms: u64,
}

impl RetentionManager {
    pub const fn new(horizon: TimeDelta, grace: TimeDelta) -> Self {
        Self { horizon, grace }
    }

    pub fn from_config(config: &RetentionConfig) -> Self {
        Self::new(config.horizon(), config.grace())
    }

    /// Oldest instant that survives a prune at `now`.
    ///
    /// Never later than `now - grace`, whatever the horizon says.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let by_horizon = now.checked_sub_signed(self.horizon);
        let by_grace = now.checked_sub_signed(self.grace);
        match (by_horizon, by_grace) {
            (Some(h), Some(g)) => h.min(g),
            (Some(only), None) | (None, Some(only)) => only,
            (None, None) => DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn prune(&self, store: &mut SnapshotStore, now: DateTime<Utc>) -> Result<PruneReport> {
        let started = Instant::now();
        let cutoff = self.cutoff(now);
        let deleted = store.prune_before(cutoff)?;
        Ok(PruneReport {
            cutoff,
            deleted: u64::try_from(deleted).unwrap_or(u64::MAX),
            duration_ms: elapsed_ms(started),
        })
    }

    pub fn compact(&self, store: &SnapshotStore) -> Result<CompactReport> {
        let started = Instant::now();
        let size_before = store.stats()?.size_bytes;
        store.compact()?;
        let size_after = store.stats()?.size_bytes;
        Ok(CompactReport {
            size_before,
            size_after,
            reclaimed_bytes: size_before.saturating_sub(size_after),
            duration_ms: elapsed_ms(started),
        })
    }

    pub fn stats(&self, store: &SnapshotStore) -> Result<StoreStats> {
        store.stats()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PortKey, SnapshotRecord};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 30, 12, 0, 0).unwrap()
    }

    fn rec(port: &str, days_ago: i64) -> SnapshotRecord {
        SnapshotRecord::new(
            PortKey::new("L1", "S1", port),
            "AVAILABLE",
            now() - TimeDelta::days(days_ago),
        )
    }

    #[test]
    fn cutoff_respects_horizon_and_grace() {
        let manager = RetentionManager::new(TimeDelta::days(28), TimeDelta::minutes(5));
        assert_eq!(manager.cutoff(now()), now() - TimeDelta::days(28));

        let tiny = RetentionManager::new(TimeDelta::zero(), TimeDelta::minutes(5));
        assert_eq!(tiny.cutoff(now()), now() - TimeDelta::minutes(5));
    }

    #[test]
    fn prune_removes_only_rows_past_horizon() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SnapshotStore::open(&dir.path().join("db.sqlite3")).unwrap();
        store
            .ingest(&[rec("1", 40), rec("1", 30), rec("1", 1), rec("2", 60)])
            .unwrap();

        let manager = RetentionManager::from_config(&RetentionConfig::default());
        let report = manager.prune(&mut store, now()).unwrap();
        assert_eq!(report.deleted, 2);
        assert_eq!(report.cutoff, now() - TimeDelta::days(28));

        // Port 2 keeps its only (stale) row so "last seen" stays answerable.
        let stats = manager.stats(&store).unwrap();
        assert_eq!(stats.rows, 2);
        assert_eq!(stats.ports, 2);
    }

    #[test]
    fn compact_reports_reclaimed_space() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SnapshotStore::open(&dir.path().join("db.sqlite3")).unwrap();
        let batch: Vec<_> = (0..2_000)
            .map(|i| {
                SnapshotRecord::new(
                    PortKey::new("L1", "S1", format!("{}", i % 20)),
                    "CHARGING",
                    now() - TimeDelta::days(60) + TimeDelta::minutes(i),
                )
            })
            .collect();
        store.ingest(&batch).unwrap();

        let manager = RetentionManager::new(TimeDelta::days(1), TimeDelta::zero());
        manager.prune(&mut store, now()).unwrap();
        let report = manager.compact(&store).unwrap();
        assert!(report.size_after <= report.size_before);
        assert_eq!(
            report.reclaimed_bytes,
            report.size_before - report.size_after
        );
    }
}
