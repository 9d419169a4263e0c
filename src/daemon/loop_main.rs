//! Ingest loop: fetch, ingest, evaluate rules, repeat.
//!
//! Threads:
//! - **Main**: one fetch cycle every `ingest.fetch_interval_secs`.
//! - **Retention** (`endolla-retention`): prunes every
//!   `retention.prune_interval_minutes`, or immediately on request.
//! - **Logger** (`endolla-logger`): owns the activity log.
//!
//! A failed cycle is logged with its code and the loop carries on.

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

use crate::core::config::Config;
use crate::core::errors::{EwError, Result};
use crate::daemon::signals::SignalHandler;
use crate::engine::Engine;
use crate::feed::BatchSource;
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};

/// Longest the main loop sleeps before re-checking signals.
const TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetentionCommand {
    RunNow,
    Stop,
}

/// Summary of a finished run, for the CLI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub cycles: u64,
    pub failed_cycles: u64,
}

pub struct IngestDaemon<S: BatchSource> {
    engine: Arc<Engine>,
    source: S,
    signals: SignalHandler,
    logger: ActivityLoggerHandle,
    fetch_interval: Duration,
    prune_interval: Duration,
    config_hash: String,
    started: Instant,
}

impl<S: BatchSource> IngestDaemon<S> {
    pub fn new(config: &Config, engine: Arc<Engine>, source: S, signals: SignalHandler) -> Self {
        Self {
            logger: engine.activity().clone(),
            engine,
            source,
            signals,
            fetch_interval: Duration::from_secs(config.ingest.fetch_interval_secs.max(1)),
            prune_interval: Duration::from_secs(
                config.retention.prune_interval_minutes.max(1).saturating_mul(60),
            ),
            config_hash: config.stable_hash().unwrap_or_default(),
            started: Instant::now(),
        }
    }

    /// Run until shutdown is requested. `max_cycles` bounds the run for tests
    /// and one-shot use.
    pub fn run(&mut self, max_cycles: Option<u64>) -> Result<RunStats> {
        self.logger.send(ActivityEvent::EngineStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash: self.config_hash.clone(),
        });
        eprintln!(
            "[EW-DAEMON] ingesting from {} every {}s",
            self.source.describe(),
            self.fetch_interval.as_secs()
        );

        let (retention_tx, retention_rx) = bounded::<RetentionCommand>(4);
        let retention_join =
            spawn_retention_worker(Arc::clone(&self.engine), retention_rx, self.prune_interval)?;

        let mut stats = RunStats::default();
        let mut next_fetch = Instant::now();
        loop {
            if self.signals.should_shutdown() {
                eprintln!("[EW-DAEMON] shutdown requested");
                break;
            }
            if max_cycles.is_some_and(|max| stats.cycles >= max) {
                break;
            }

            let forced = self.signals.should_trigger();
            if forced {
                request_prune(&retention_tx);
            }
            if forced || Instant::now() >= next_fetch {
                stats.cycles += 1;
                if let Err(err) = self.run_cycle() {
                    stats.failed_cycles += 1;
                    eprintln!("[EW-DAEMON] cycle failed: {err}");
                    self.logger.send(ActivityEvent::error(&err));
                }
                next_fetch = Instant::now() + self.fetch_interval;
                continue;
            }

            thread::sleep(TICK.min(next_fetch.saturating_duration_since(Instant::now())));
        }

        let _ = retention_tx.send(RetentionCommand::Stop);
        if retention_join.join().is_err() {
            eprintln!("[EW-DAEMON] retention thread panicked");
        }

        let uptime_secs = self.started.elapsed().as_secs();
        self.logger.send(ActivityEvent::EngineStopped {
            reason: "clean shutdown".to_string(),
            uptime_secs,
        });
        Ok(stats)
    }

    /// Fetch and ingest one batch, then evaluate rules at the same instant.
    fn run_cycle(&mut self) -> Result<()> {
        let now = Utc::now();
        let batch = self.source.next_batch(now)?;
        let report = self.engine.ingest(&batch, now)?;
        if !report.rejected.is_empty() {
            eprintln!(
                "[EW-DAEMON] {} snapshot(s) rejected for clock skew",
                report.rejected.len()
            );
        }
        let thresholds = self.engine.settings().rules;
        self.engine.evaluate_rules(thresholds, now)?;
        Ok(())
    }
}

fn request_prune(tx: &Sender<RetentionCommand>) {
    if let Err(TrySendError::Full(_)) = tx.try_send(RetentionCommand::RunNow) {
        eprintln!("[EW-DAEMON] retention already queued");
    }
}

fn spawn_retention_worker(
    engine: Arc<Engine>,
    rx: Receiver<RetentionCommand>,
    interval: Duration,
) -> Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("endolla-retention".to_string())
        .spawn(move || retention_main(&engine, &rx, interval))
        .map_err(|e| EwError::Runtime {
            details: format!("failed to spawn retention thread: {e}"),
        })
}

fn retention_main(engine: &Engine, rx: &Receiver<RetentionCommand>, interval: Duration) {
    loop {
        match rx.recv_timeout(interval) {
            Ok(RetentionCommand::RunNow) | Err(RecvTimeoutError::Timeout) => {
                // Failures are logged by the engine.
                if let Err(err) = engine.prune(Utc::now()) {
                    eprintln!("[EW-RETENTION] prune failed: {err}");
                }
            }
            Ok(RetentionCommand::Stop) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IngestBatch, PortKey, Scope, SnapshotRecord};

    struct ScriptedSource {
        fail_every: u64,
        calls: u64,
    }

    impl BatchSource for ScriptedSource {
        fn next_batch(&mut self, now: chrono::DateTime<Utc>) -> Result<IngestBatch> {
            self.calls += 1;
            if self.calls % self.fail_every == 0 {
                return Err(EwError::FeedFormat {
                    details: "truncated document".to_string(),
                });
            }
            Ok(IngestBatch {
                fetched_at: now,
                records: vec![SnapshotRecord::new(
                    PortKey::new("L1", "S1", "1"),
                    "AVAILABLE",
                    now,
                )],
            })
        }

        fn describe(&self) -> String {
            "script".to_string()
        }
    }

    fn setup(dir: &std::path::Path) -> (Config, Arc<Engine>) {
        let mut config = Config::default();
        config.paths.database = dir.join("snapshots.sqlite3");
        config.ingest.fetch_interval_secs = 1;
        let engine = Engine::open(&config, ActivityLoggerHandle::detached()).unwrap();
        (config, Arc::new(engine))
    }

    #[test]
    fn failed_cycle_does_not_stop_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (config, engine) = setup(dir.path());
        let signals = SignalHandler::unregistered();
        let source = ScriptedSource {
            fail_every: 2,
            calls: 0,
        };
        let mut daemon = IngestDaemon::new(&config, Arc::clone(&engine), source, signals.clone());
        // Trigger every cycle immediately instead of waiting a full interval.
        signals.request_trigger();
        let watcher = {
            let signals = signals.clone();
            thread::spawn(move || {
                for _ in 0..40 {
                    signals.request_trigger();
                    thread::sleep(Duration::from_millis(20));
                }
            })
        };
        let stats = daemon.run(Some(3)).unwrap();
        watcher.join().unwrap();

        assert_eq!(stats.cycles, 3);
        assert_eq!(stats.failed_cycles, 1);
        let board = engine
            .current_status(&Scope::Network, Utc::now())
            .unwrap();
        assert_eq!(board.counts.total, 1);
    }

    #[test]
    fn shutdown_flag_ends_run() {
        let dir = tempfile::tempdir().unwrap();
        let (config, engine) = setup(dir.path());
        let signals = SignalHandler::unregistered();
        signals.request_shutdown();
        let source = ScriptedSource {
            fail_every: u64::MAX,
            calls: 0,
        };
        let mut daemon = IngestDaemon::new(&config, engine, source, signals);
        let stats = daemon.run(None).unwrap();
        assert_eq!(stats.cycles, 0);
    }
}
