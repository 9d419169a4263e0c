//! Activity logging thread.
//!
//! A dedicated thread owns the [`JsonlWriter`]. Everything else sends
//! [`ActivityEvent`]s through a bounded crossbeam channel with `try_send`,
//! so ingestion and queries never wait on the log.

#![allow(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{EwError, Result};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};

const CHANNEL_CAPACITY: usize = 1024;

// ──────────────────── events ────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ActivityEvent {
    EngineStarted {
        version: String,
        config_hash: String,
    },
    EngineStopped {
        reason: String,
        uptime_secs: u64,
    },
    BatchIngested {
        digest: String,
        received: u64,
        inserted: u64,
        replaced: u64,
        rejected: u64,
        duration_ms: u64,
    },
    SnapshotRejected {
        port: String,
        observed_at: String,
        code: String,
        reason: String,
    },
    OutOfOrderAccepted {
        digest: String,
        count: u64,
    },
    RetentionPruned {
        cutoff: String,
        deleted: u64,
        duration_ms: u64,
    },
    Compacted {
        reclaimed_bytes: u64,
        duration_ms: u64,
    },
    RulesEvaluated {
        flagged_ports: u64,
        details: String,
    },
    /// A failed operation. Retryable failures are logged as warnings.
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
    /// Stops the logger thread after everything queued before it.
    Shutdown,
}

impl ActivityEvent {
    pub fn error(err: &EwError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

// ──────────────────── handle ────────────────────

/// Cloneable, non-blocking sender for activity events.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Queue an event. A full channel drops it and bumps the drop counter.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the logger thread to flush and exit.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }

    /// Handle with no logger thread behind it; every event is discarded.
    pub fn detached() -> Self {
        let (tx, _) = bounded(1);
        Self {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }
}

// ──────────────────── spawn ────────────────────

pub struct LoggerConfig {
    pub jsonl: JsonlConfig,
    pub channel_capacity: usize,
}

impl LoggerConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            jsonl: JsonlConfig::at(path),
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Start the logger thread.
pub fn spawn_logger(config: LoggerConfig) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(config.channel_capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let handle = ActivityLoggerHandle {
        tx,
        dropped_events: Arc::clone(&dropped),
    };

    let jsonl = config.jsonl;
    let join = thread::Builder::new()
        .name("endolla-logger".to_string())
        .spawn(move || logger_main(&rx, jsonl, &dropped))
        .map_err(|e| EwError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

fn logger_main(rx: &Receiver<ActivityEvent>, config: JsonlConfig, dropped: &AtomicU64) {
    let mut jsonl = JsonlWriter::open(config);

    while let Ok(event) = rx.recv() {
        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.count = Some(lost);
            warn.details = Some("activity events dropped under back-pressure".to_string());
            jsonl.write_entry(&warn);
        }
        if event == ActivityEvent::Shutdown {
            break;
        }
        jsonl.write_entry(&to_log_entry(&event));
        if matches!(jsonl.state(), "fallback" | "stderr") {
            jsonl.try_recover();
        }
    }

    jsonl.fsync();
}

// ──────────────────── conversion ────────────────────

fn to_log_entry(event: &ActivityEvent) -> LogEntry {
    match event {
        ActivityEvent::EngineStarted {
            version,
            config_hash,
        } => {
            let mut e = LogEntry::new(EventType::EngineStart, Severity::Info);
            e.details = Some(format!("version={version} config_hash={config_hash}"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::EngineStopped {
            reason,
            uptime_secs,
        } => {
            let mut e = LogEntry::new(EventType::EngineStop, Severity::Info);
            e.details = Some(format!("reason={reason} uptime={uptime_secs}s"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::BatchIngested {
            digest,
            received,
            inserted,
            replaced,
            rejected,
            duration_ms,
        } => {
            let severity = if *rejected > 0 {
                Severity::Warning
            } else {
                Severity::Info
            };
            let mut e = LogEntry::new(EventType::BatchIngest, severity);
            e.digest = Some(digest.clone());
            e.count = Some(*received);
            e.inserted = Some(*inserted);
            e.replaced = Some(*replaced);
            e.rejected = Some(*rejected);
            e.duration_ms = Some(*duration_ms);
            e.ok = Some(true);
            e
        }
        ActivityEvent::SnapshotRejected {
            port,
            observed_at,
            code,
            reason,
        } => {
            let mut e = LogEntry::new(EventType::SnapshotRejected, Severity::Warning);
            e.port = Some(port.clone());
            e.observed_at = Some(observed_at.clone());
            e.error_code = Some(code.clone());
            e.error_message = Some(reason.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::OutOfOrderAccepted { digest, count } => {
            let mut e = LogEntry::new(EventType::OutOfOrder, Severity::Info);
            e.digest = Some(digest.clone());
            e.count = Some(*count);
            e
        }
        ActivityEvent::RetentionPruned {
            cutoff,
            deleted,
            duration_ms,
        } => {
            let mut e = LogEntry::new(EventType::RetentionPrune, Severity::Info);
            e.count = Some(*deleted);
            e.duration_ms = Some(*duration_ms);
            e.details = Some(format!("cutoff={cutoff}"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::Compacted {
            reclaimed_bytes,
            duration_ms,
        } => {
            let mut e = LogEntry::new(EventType::Compaction, Severity::Info);
            e.bytes = Some(*reclaimed_bytes);
            e.duration_ms = Some(*duration_ms);
            e.ok = Some(true);
            e
        }
        ActivityEvent::RulesEvaluated {
            flagged_ports,
            details,
        } => {
            let mut e = LogEntry::new(EventType::RulesEvaluated, Severity::Info);
            e.count = Some(*flagged_ports);
            e.details = Some(details.clone());
            e
        }
        ActivityEvent::Error {
            code,
            message,
            retryable,
        } => {
            let severity = if *retryable {
                Severity::Warning
            } else {
                Severity::Error
            };
            let mut e = LogEntry::new(EventType::Error, severity);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::Shutdown => LogEntry::new(EventType::EngineStop, Severity::Info),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path, capacity: usize) -> LoggerConfig {
        LoggerConfig {
            jsonl: JsonlConfig {
                path: dir.join("activity.jsonl"),
                fallback_path: None,
                max_size_bytes: 1024 * 1024,
                max_rotated_files: 2,
                fsync_interval_secs: 60,
            },
            channel_capacity: capacity,
        }
    }

    fn read_lines(dir: &std::path::Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(dir.join("activity.jsonl"))
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn events_reach_the_file_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(config(dir.path(), 64)).unwrap();

        handle.send(ActivityEvent::EngineStarted {
            version: "0.3.0".to_string(),
            config_hash: "abc".to_string(),
        });
        handle.send(ActivityEvent::BatchIngested {
            digest: "d1".to_string(),
            received: 10,
            inserted: 9,
            replaced: 0,
            rejected: 1,
            duration_ms: 3,
        });
        handle.send(ActivityEvent::SnapshotRejected {
            port: "L1/S1/1".to_string(),
            observed_at: "2030-01-01T00:00:00.000Z".to_string(),
            code: "EW-2001".to_string(),
            reason: "future".to_string(),
        });
        handle.send(ActivityEvent::error(&EwError::Runtime {
            details: "feed unreachable".to_string(),
        }));
        handle.send(ActivityEvent::error(&EwError::SchemaMismatch {
            found: 7,
            expected: 1,
        }));
        handle.shutdown();
        join.join().unwrap();

        let lines = read_lines(dir.path());
        let events: Vec<&str> = lines.iter().map(|l| l["event"].as_str().unwrap()).collect();
        assert_eq!(
            events,
            vec!["engine_start", "batch_ingest", "snapshot_rejected", "error", "error"]
        );
        assert_eq!(lines[1]["severity"], "warning");
        assert_eq!(lines[1]["rejected"], 1);
        assert_eq!(lines[2]["port"], "L1/S1/1");
        assert_eq!(lines[3]["error_code"], "EW-3900");
        assert_eq!(lines[3]["severity"], "warning");
        assert_eq!(lines[4]["error_code"], "EW-1101");
        assert_eq!(lines[4]["severity"], "error");
    }

    #[test]
    fn handle_is_cloneable_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(config(dir.path(), 64)).unwrap();
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let h = handle.clone();
                thread::spawn(move || {
                    h.send(ActivityEvent::OutOfOrderAccepted {
                        digest: format!("d{i}"),
                        count: 1,
                    });
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        handle.shutdown();
        join.join().unwrap();
        assert_eq!(read_lines(dir.path()).len(), 4);
    }

    #[test]
    fn full_channel_counts_drops() {
        // No thread drains this channel.
        let (tx, _rx) = bounded(1);
        let handle = ActivityLoggerHandle {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
        };
        for _ in 0..5 {
            handle.send(ActivityEvent::Compacted {
                reclaimed_bytes: 0,
                duration_ms: 0,
            });
        }
        assert_eq!(handle.dropped_events(), 4);
    }

    #[test]
    fn detached_handle_discards_silently() {
        let handle = ActivityLoggerHandle::detached();
        handle.send(ActivityEvent::Shutdown);
        handle.shutdown();
        assert_eq!(handle.dropped_events(), 0);
    }
}
