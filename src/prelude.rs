//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use endolla_watcher::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{EwError, Result};
pub use crate::core::window::{Granularity, TimeWindow};

// Model
pub use crate::model::{
    IngestBatch, Observed, PortKey, PortStatus, Scope, Snapshot, SnapshotRecord, StationKey,
    StatusPolicy,
};

// Engine
pub use crate::engine::{Engine, EngineSettings, IngestReport, StatusBoard};
pub use crate::feed::{BatchSource, FileSource, parse_feed};

// Analytics
pub use crate::analytics::fingerprint::Fingerprint;
pub use crate::analytics::reliability::{ReliabilityRollup, ReliabilityStats, StationReliability};
pub use crate::analytics::rules::{FlagReason, RuleEvaluation, RuleThresholds, UnusedCount};
pub use crate::analytics::timeline::{PortTimeline, Session};
pub use crate::analytics::utilization::{ScopeSummary, UtilizationSummary};

// Logging
pub use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle, spawn_logger};
