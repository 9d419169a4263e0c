//! Configuration system: TOML file + env var overrides + smart defaults.
//!
//! Configuration is loaded once at startup and treated as immutable for the
//! lifetime of the process.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::core::errors::{EwError, Result};

/// Env var prefix for overrides.
pub const ENV_PREFIX: &str = "ENDOLLA_";

/// Full engine configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub sampling: SamplingConfig,
    pub occupancy: OccupancyConfig,
    pub retention: RetentionConfig,
    pub rules: RulesConfig,
    pub sessions: SessionsConfig,
    pub fingerprint: FingerprintConfig,
    pub ingest: IngestConfig,
    pub paths: PathsConfig,
}

/// Polling cadence and the tolerances derived from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SamplingConfig {
    /// How often the upstream feed is expected to be polled.
    pub expected_poll_interval_secs: u64,
    /// `max_gap = expected_poll_interval × gap_multiplier`. Must be ≥ 1.
    pub gap_multiplier: f64,
    /// Snapshots further than this into the future are rejected.
    pub clock_skew_tolerance_secs: u64,
}

/// Which statuses count as "occupied".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OccupancyConfig {
    /// When false, only CHARGING counts toward occupation and sessions.
    pub in_use_counts_as_occupied: bool,
}

/// Snapshot retention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionConfig {
    pub horizon_days: u64,
    pub prune_interval_minutes: u64,
    /// Rows newer than `now - grace_secs` are never pruned.
    pub grace_secs: u64,
}

/// Default thresholds for the problematic-port rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RulesConfig {
    pub unused_days: u64,
    pub long_session_days: u64,
    pub long_session_min_minutes: u64,
    pub unavailable_hours: u64,
}

/// Longest rule window accepted, in days.
pub const MAX_RULE_DAYS: u64 = 36_500;

impl RulesConfig {
    /// Every threshold must be positive and no longer than [`MAX_RULE_DAYS`].
    /// `prefix` is prepended to field names in the error.
    pub fn validate(&self, prefix: &str) -> Result<()> {
        for (name, value, max) in [
            ("unused_days", self.unused_days, MAX_RULE_DAYS),
            ("long_session_days", self.long_session_days, MAX_RULE_DAYS),
            (
                "long_session_min_minutes",
                self.long_session_min_minutes,
                MAX_RULE_DAYS * 24 * 60,
            ),
            ("unavailable_hours", self.unavailable_hours, MAX_RULE_DAYS * 24),
        ] {
            check_day_bound(&format!("{prefix}{name}"), value, max)?;
        }
        Ok(())
    }
}

/// `value` must lie in `1..=max`.
pub fn check_day_bound(name: &str, value: u64, max: u64) -> Result<()> {
    if value == 0 || value > max {
        return Err(EwError::InvalidConfig {
            details: format!("{name} must be between 1 and {max}, got {value}"),
        });
    }
    Ok(())
}

/// Session classification knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionsConfig {
    pub short_session_minutes: u64,
}

/// Weekly fingerprint settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Fixed offset used to derive local weekday/hour.
    pub utc_offset_minutes: i32,
    /// Cells below this observed time are not ranked as busiest/quietest.
    pub min_cell_seconds: u64,
    /// Cells below this coverage are not ranked as busiest/quietest.
    pub min_cell_coverage: f64,
    pub top_cells: usize,
}

/// Daemon ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IngestConfig {
    /// Feed document re-read every cycle. `None` disables the ingestion loop.
    pub feed_file: Option<PathBuf>,
    pub fetch_interval_secs: u64,
}

/// Filesystem paths used by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub database: PathBuf,
    pub activity_log: PathBuf,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            expected_poll_interval_secs: 60,
            gap_multiplier: 2.0,
            clock_skew_tolerance_secs: 120,
        }
    }
}

impl Default for OccupancyConfig {
    fn default() -> Self {
        Self {
            in_use_counts_as_occupied: true,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            horizon_days: 28,
            prune_interval_minutes: 60,
            grace_secs: 300,
        }
    }
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            unused_days: 4,
            long_session_days: 2,
            long_session_min_minutes: 5,
            unavailable_hours: 24,
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            short_session_minutes: 3,
        }
    }
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            min_cell_seconds: 900,
            min_cell_coverage: 0.25,
            top_cells: 5,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            feed_file: None,
            fetch_interval_secs: 60,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!("[EW-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths");
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("endolla").join("config.toml");
        let data = home_dir.join(".local").join("share").join("endolla");
        Self {
            config_file: cfg,
            database: data.join("snapshots.sqlite3"),
            activity_log: data.join("activity.jsonl"),
        }
    }
}

impl SamplingConfig {
    /// Largest separation between two snapshots still bridged by an interval.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn max_gap(&self) -> TimeDelta {
        let millis = self.expected_poll_interval_secs as f64 * 1000.0 * self.gap_multiplier;
        TimeDelta::milliseconds(millis.round() as i64)
    }

    #[must_use]
    pub fn clock_skew_tolerance(&self) -> TimeDelta {
        secs(self.clock_skew_tolerance_secs)
    }
}

impl RetentionConfig {
    #[must_use]
    pub fn horizon(&self) -> TimeDelta {
        TimeDelta::try_days(saturating_i64(self.horizon_days)).unwrap_or(TimeDelta::MAX)
    }

    #[must_use]
    pub fn grace(&self) -> TimeDelta {
        secs(self.grace_secs)
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| EwError::io(&path_buf, source))?;
            toml::from_str::<Self>(&raw)?
        } else if is_explicit_path {
            return Err(EwError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for startup logging.
    ///
    /// FNV-1a over canonical JSON, stable across processes and toolchains.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut env = |suffix: &str| {
            let name = format!("{ENV_PREFIX}{suffix}");
            lookup(&name).map(|raw| (name, raw))
        };

        // sampling
        if let Some((name, raw)) = env("SAMPLING_EXPECTED_POLL_INTERVAL_SECS") {
            self.sampling.expected_poll_interval_secs = parse_env(&name, &raw)?;
        }
        if let Some((name, raw)) = env("SAMPLING_GAP_MULTIPLIER") {
            self.sampling.gap_multiplier = parse_env(&name, &raw)?;
        }
        if let Some((name, raw)) = env("SAMPLING_CLOCK_SKEW_TOLERANCE_SECS") {
            self.sampling.clock_skew_tolerance_secs = parse_env(&name, &raw)?;
        }

        // occupancy
        if let Some((name, raw)) = env("OCCUPANCY_IN_USE_COUNTS_AS_OCCUPIED") {
            self.occupancy.in_use_counts_as_occupied = parse_env(&name, &raw)?;
        }

        // retention
        if let Some((name, raw)) = env("RETENTION_HORIZON_DAYS") {
            self.retention.horizon_days = parse_env(&name, &raw)?;
        }
        if let Some((name, raw)) = env("RETENTION_PRUNE_INTERVAL_MINUTES") {
            self.retention.prune_interval_minutes = parse_env(&name, &raw)?;
        }
        if let Some((name, raw)) = env("RETENTION_GRACE_SECS") {
            self.retention.grace_secs = parse_env(&name, &raw)?;
        }

        // rules
        if let Some((name, raw)) = env("RULES_UNUSED_DAYS") {
            self.rules.unused_days = parse_env(&name, &raw)?;
        }
        if let Some((name, raw)) = env("RULES_LONG_SESSION_DAYS") {
            self.rules.long_session_days = parse_env(&name, &raw)?;
        }
        if let Some((name, raw)) = env("RULES_LONG_SESSION_MIN_MINUTES") {
            self.rules.long_session_min_minutes = parse_env(&name, &raw)?;
        }
        if let Some((name, raw)) = env("RULES_UNAVAILABLE_HOURS") {
            self.rules.unavailable_hours = parse_env(&name, &raw)?;
        }

        // fingerprint
        if let Some((name, raw)) = env("FINGERPRINT_UTC_OFFSET_MINUTES") {
            self.fingerprint.utc_offset_minutes = parse_env(&name, &raw)?;
        }

        // ingest + paths
        if let Some((_, raw)) = env("INGEST_FEED_FILE") {
            self.ingest.feed_file = Some(PathBuf::from(raw));
        }
        if let Some((name, raw)) = env("INGEST_FETCH_INTERVAL_SECS") {
            self.ingest.fetch_interval_secs = parse_env(&name, &raw)?;
        }
        if let Some((_, raw)) = env("DATABASE") {
            self.paths.database = PathBuf::from(raw);
        }
        if let Some((_, raw)) = env("ACTIVITY_LOG") {
            self.paths.activity_log = PathBuf::from(raw);
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            (
                "sampling.expected_poll_interval_secs",
                self.sampling.expected_poll_interval_secs,
            ),
            ("retention.horizon_days", self.retention.horizon_days),
            (
                "retention.prune_interval_minutes",
                self.retention.prune_interval_minutes,
            ),
            ("ingest.fetch_interval_secs", self.ingest.fetch_interval_secs),
        ] {
            if value == 0 {
                return Err(EwError::InvalidConfig {
                    details: format!("{name} must be a positive duration"),
                });
            }
        }

        self.rules.validate("rules.")?;

        let multiplier = self.sampling.gap_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(EwError::InvalidConfig {
                details: format!("sampling.gap_multiplier must be >= 1, got {multiplier}"),
            });
        }

        let coverage = self.fingerprint.min_cell_coverage;
        if !(0.0..=1.0).contains(&coverage) {
            return Err(EwError::InvalidConfig {
                details: format!("fingerprint.min_cell_coverage must be in [0,1], got {coverage}"),
            });
        }

        if self.fingerprint.utc_offset_minutes.abs() > 14 * 60 {
            return Err(EwError::InvalidConfig {
                details: format!(
                    "fingerprint.utc_offset_minutes must be within ±840, got {}",
                    self.fingerprint.utc_offset_minutes
                ),
            });
        }

        if self.paths.database.as_os_str().is_empty() {
            return Err(EwError::InvalidConfig {
                details: "paths.database must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|error| EwError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Whole seconds as a `TimeDelta`, saturating instead of panicking.
pub(crate) fn secs(value: u64) -> TimeDelta {
    TimeDelta::try_seconds(saturating_i64(value)).unwrap_or(TimeDelta::MAX)
}
