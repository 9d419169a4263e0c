//! SQLite snapshot store: WAL-mode append-mostly log of port observations.
//!
//! Writers apply each ingestion batch in a single `IMMEDIATE` transaction.
//! Readers go through [`ReadView`], a deferred transaction that pins one WAL
//! snapshot for its whole lifetime, so analytics never observe a half-applied
//! batch or a concurrent prune.

#![allow(missing_docs)]

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{
    Connection, OpenFlags, OptionalExtension, Row, Transaction, TransactionBehavior, params,
    params_from_iter,
};
use serde::Serialize;

use crate::core::errors::{EwError, Result};
use crate::model::{PortKey, PortStatus, Scope, Snapshot, SnapshotRecord};

/// Layout version this build reads and writes.
pub const SCHEMA_VERSION: i64 = 1;

/// Snapshot log backed by one SQLite connection.
pub struct SnapshotStore {
    conn: Connection,
}

impl SnapshotStore {
    /// Open (or create) the database at `path`, applying schema and PRAGMAs.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| EwError::io(parent, source))?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        apply_pragmas(&conn)?;
        apply_schema(&conn)?;
        check_schema_version(&conn)?;

        Ok(Self { conn })
    }

    pub fn is_wal_mode(&self) -> bool {
        self.conn
            .query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
            .is_ok_and(|mode| mode.eq_ignore_ascii_case("wal"))
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        read_schema_version(&self.conn)
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    // ──────────────────── writes ────────────────────

    /// Upsert all records in one transaction; the latest write for a
    /// `(port, observed_at)` key wins.
    pub fn ingest(&mut self, records: &[SnapshotRecord]) -> Result<WriteCounts> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut counts = WriteCounts::default();
        {
            let mut latest = tx.prepare_cached(
                "SELECT MAX(observed_at) FROM snapshots
                 WHERE location_id = ?1 AND station_id = ?2 AND port_id = ?3",
            )?;
            let mut insert = tx.prepare_cached(
                "INSERT INTO snapshots (
                    location_id, station_id, port_id, observed_at,
                    status, raw_status, last_updated
                ) VALUES (?1,?2,?3,?4,?5,?6,?7)
                ON CONFLICT(location_id, station_id, port_id, observed_at) DO NOTHING",
            )?;
            let mut update = tx.prepare_cached(
                "UPDATE snapshots SET status = ?5, raw_status = ?6, last_updated = ?7
                 WHERE location_id = ?1 AND station_id = ?2 AND port_id = ?3
                   AND observed_at = ?4
                   AND (status <> ?5 OR raw_status <> ?6 OR last_updated IS NOT ?7)",
            )?;

            for record in records {
                let key = &record.port;
                let observed_ms = record.observed_at.timestamp_millis();
                let latest_ms: Option<i64> = latest.query_row(
                    params![key.location_id, key.station_id, key.port_id],
                    |row| row.get(0),
                )?;
                let status = record.status.as_str();
                let values = params![
                    key.location_id,
                    key.station_id,
                    key.port_id,
                    observed_ms,
                    status,
                    record.raw_status,
                    record.last_updated,
                ];

                if insert.execute(values)? == 1 {
                    counts.inserted += 1;
                    if latest_ms.is_some_and(|ms| observed_ms < ms) {
                        counts.out_of_order += 1;
                    }
                } else if update.execute(values)? == 1 {
                    counts.replaced += 1;
                } else {
                    counts.unchanged += 1;
                }
            }
        }
        tx.commit()?;
        Ok(counts)
    }

    /// Delete rows older than `cutoff`, always keeping each port's newest row.
    pub fn prune_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let deleted = tx.execute(
            "DELETE FROM snapshots
             WHERE observed_at < ?1
               AND observed_at < (
                   SELECT MAX(newest.observed_at) FROM snapshots AS newest
                   WHERE newest.location_id = snapshots.location_id
                     AND newest.station_id = snapshots.station_id
                     AND newest.port_id = snapshots.port_id
               )",
            params![cutoff.timestamp_millis()],
        )?;
        tx.commit()?;
        Ok(deleted)
    }

    /// Checkpoint the WAL and rebuild the file to reclaim free pages.
    pub fn compact(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE); VACUUM;")?;
        Ok(())
    }

    // ──────────────────── diagnostics ────────────────────

    pub fn stats(&self) -> Result<StoreStats> {
        let pragma = |name: &str| -> Result<i64> {
            Ok(self
                .conn
                .query_row(&format!("PRAGMA {name}"), [], |row| row.get(0))?)
        };
        let page_size = pragma("page_size")?;
        let page_count = pragma("page_count")?;
        let freelist_count = pragma("freelist_count")?;

        let (rows, oldest, newest): (i64, Option<i64>, Option<i64>) = self.conn.query_row(
            "SELECT COUNT(*), MIN(observed_at), MAX(observed_at) FROM snapshots",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let ports: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM (
                SELECT DISTINCT location_id, station_id, port_id FROM snapshots
            )",
            [],
            |row| row.get(0),
        )?;

        Ok(StoreStats {
            rows: non_negative(rows),
            ports: non_negative(ports),
            page_size: non_negative(page_size),
            page_count: non_negative(page_count),
            freelist_count: non_negative(freelist_count),
            size_bytes: non_negative(page_size.saturating_mul(page_count)),
            free_bytes: non_negative(page_size.saturating_mul(freelist_count)),
            oldest_observed_at: oldest.and_then(DateTime::from_timestamp_millis),
            newest_observed_at: newest.and_then(DateTime::from_timestamp_millis),
            schema_version: self.schema_version()?,
        })
    }

    // ──────────────────── reads ────────────────────

    /// Begin a consistent read. Every query on the view sees the same data.
    pub fn read_view(&mut self) -> Result<ReadView<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Deferred)?;
        Ok(ReadView { tx })
    }
}

// ──────────────────── read view ────────────────────

/// Snapshot-isolated read transaction. Dropping it ends the read.
pub struct ReadView<'a> {
    tx: Transaction<'a>,
}

impl ReadView<'_> {
    /// Ports with at least one stored snapshot in `scope`, in key order.
    pub fn ports(&self, scope: &Scope) -> Result<Vec<PortKey>> {
        let (filter, args) = scope_filter(scope);
        let sql = format!(
            "SELECT DISTINCT location_id, station_id, port_id FROM snapshots
             WHERE {filter} ORDER BY location_id, station_id, port_id"
        );
        let mut stmt = self.tx.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok(PortKey::new(
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Snapshots of `port` in `[start, end)` plus the nearest one on each side.
    pub fn port_history(
        &self,
        port: &PortKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>> {
        let (loc, station, id) = (&port.location_id, &port.station_id, &port.port_id);
        let start_ms = start.timestamp_millis();
        let end_ms = end.timestamp_millis();
        let mut out = Vec::new();

        let mut lead_in = self.tx.prepare_cached(
            "SELECT observed_at, status FROM snapshots
             WHERE location_id = ?1 AND station_id = ?2 AND port_id = ?3 AND observed_at < ?4
             ORDER BY observed_at DESC LIMIT 1",
        )?;
        if let Some(snapshot) = lead_in
            .query_row(params![loc, station, id, start_ms], snapshot_from_row)
            .optional()?
        {
            out.push(snapshot);
        }

        let mut body = self.tx.prepare_cached(
            "SELECT observed_at, status FROM snapshots
             WHERE location_id = ?1 AND station_id = ?2 AND port_id = ?3
               AND observed_at >= ?4 AND observed_at < ?5
             ORDER BY observed_at",
        )?;
        let rows = body
            .query_map(params![loc, station, id, start_ms, end_ms], snapshot_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        out.extend(rows);

        let mut lead_out = self.tx.prepare_cached(
            "SELECT observed_at, status FROM snapshots
             WHERE location_id = ?1 AND station_id = ?2 AND port_id = ?3 AND observed_at >= ?4
             ORDER BY observed_at ASC LIMIT 1",
        )?;
        if let Some(snapshot) = lead_out
            .query_row(params![loc, station, id, end_ms], snapshot_from_row)
            .optional()?
        {
            out.push(snapshot);
        }

        Ok(out)
    }

    /// Earliest observation in `scope`.
    pub fn first_observed(&self, scope: &Scope) -> Result<Option<DateTime<Utc>>> {
        let (filter, args) = scope_filter(scope);
        let sql = format!("SELECT MIN(observed_at) FROM snapshots WHERE {filter}");
        let ms: Option<i64> =
            self.tx
                .query_row(&sql, params_from_iter(args.iter()), |row| row.get(0))?;
        Ok(ms.and_then(DateTime::from_timestamp_millis))
    }

    /// Newest snapshot of every port in `scope`, derived from the log.
    pub fn latest_per_port(&self, scope: &Scope) -> Result<Vec<LatestSnapshot>> {
        let (filter, args) = scope_filter(scope);
        let sql = format!(
            "SELECT s.location_id, s.station_id, s.port_id, s.observed_at, s.status,
                    s.raw_status, s.last_updated
             FROM snapshots s
             JOIN (
                 SELECT location_id, station_id, port_id, MAX(observed_at) AS newest
                 FROM snapshots WHERE {filter}
                 GROUP BY location_id, station_id, port_id
             ) m ON s.location_id = m.location_id
                AND s.station_id = m.station_id
                AND s.port_id = m.port_id
                AND s.observed_at = m.newest
             ORDER BY s.location_id, s.station_id, s.port_id"
        );
        let mut stmt = self.tx.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                let observed_ms: i64 = row.get(3)?;
                let status: String = row.get(4)?;
                Ok(LatestSnapshot {
                    port: PortKey::new(
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ),
                    snapshot: Snapshot::new(
                        millis_to_utc(3, observed_ms)?,
                        PortStatus::from_stored(&status),
                    ),
                    raw_status: row.get(5)?,
                    last_updated: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Newest observation and row count; changes on every effective write.
    pub fn high_water_mark(&self) -> Result<HighWaterMark> {
        let (newest, rows): (Option<i64>, i64) = self.tx.query_row(
            "SELECT MAX(observed_at), COUNT(*) FROM snapshots",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(HighWaterMark {
            newest_observed_at: newest.and_then(DateTime::from_timestamp_millis),
            rows: non_negative(rows),
        })
    }
}

// ──────────────────── row types ────────────────────

/// Outcome of one `ingest` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteCounts {
    pub inserted: u64,
    /// Existing key rewritten with a different status.
    pub replaced: u64,
    /// Existing key with identical content.
    pub unchanged: u64,
    /// Inserted rows older than the port's newest stored row.
    pub out_of_order: u64,
}

/// Current-status row derived from the newest snapshot of a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LatestSnapshot {
    pub port: PortKey,
    pub snapshot: Snapshot,
    pub raw_status: String,
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HighWaterMark {
    pub newest_observed_at: Option<DateTime<Utc>>,
    pub rows: u64,
}

/// Size and shape of the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub rows: u64,
    pub ports: u64,
    pub page_size: u64,
    pub page_count: u64,
    pub freelist_count: u64,
    pub size_bytes: u64,
    pub free_bytes: u64,
    pub oldest_observed_at: Option<DateTime<Utc>>,
    pub newest_observed_at: Option<DateTime<Utc>>,
    pub schema_version: Option<i64>,
}

// ──────────────────── helpers ────────────────────

fn scope_filter(scope: &Scope) -> (&'static str, Vec<String>) {
    match scope {
        Scope::Port(key) => (
            "location_id = ?1 AND station_id = ?2 AND port_id = ?3",
            vec![
                key.location_id.clone(),
                key.station_id.clone(),
                key.port_id.clone(),
            ],
        ),
        Scope::Station(key) => (
            "location_id = ?1 AND station_id = ?2",
            vec![key.location_id.clone(), key.station_id.clone()],
        ),
        Scope::Location { location_id } => ("location_id = ?1", vec![location_id.clone()]),
        Scope::Network => ("1 = 1", Vec::new()),
    }
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<Snapshot> {
    let observed_ms: i64 = row.get(0)?;
    let status: String = row.get(1)?;
    Ok(Snapshot::new(
        millis_to_utc(0, observed_ms)?,
        PortStatus::from_stored(&status),
    ))
}

fn millis_to_utc(column: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(column, ms))
}

fn non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

// ──────────────────── schema & pragmas ────────────────────

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -8000;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = 5000;",
    )?;
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        eprintln!("[EW-SQLITE] WARNING: requested WAL mode but got '{mode}'");
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS snapshots (
            location_id TEXT NOT NULL,
            station_id TEXT NOT NULL,
            port_id TEXT NOT NULL,
            observed_at INTEGER NOT NULL,
            status TEXT NOT NULL,
            raw_status TEXT NOT NULL,
            last_updated TEXT,
            PRIMARY KEY (location_id, station_id, port_id, observed_at)
        ) WITHOUT ROWID;

        CREATE INDEX IF NOT EXISTS idx_snapshots_observed_at ON snapshots(observed_at);",
    )?;
    Ok(())
}

fn read_schema_version(conn: &Connection) -> Result<Option<i64>> {
    Ok(conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i64>>(0)
        })?)
}

fn check_schema_version(conn: &Connection) -> Result<()> {
    match read_schema_version(conn)? {
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
            Ok(())
        }
        Some(found) if found == SCHEMA_VERSION => Ok(()),
        Some(found) => Err(EwError::SchemaMismatch {
            found,
            expected: SCHEMA_VERSION,
        }),
    }
}

// ──────────────────── tests ────────────────────
