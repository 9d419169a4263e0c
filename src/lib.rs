#![forbid(unsafe_code)]

//! Endolla Watcher: telemetry analytics for public EV charging ports.
//!
//! The engine stores point-in-time status snapshots and derives everything
//! else from them on demand:
//! 1. **Timelines**: monitored intervals, coverage gaps and sessions per port
//! 2. **Utilization**: occupation, charging and availability with coverage
//! 3. **Reliability**: outages, MTTR and MTBF with confidence flags
//! 4. **Fingerprints**: weekly hour-of-week profiles per station
//! 5. **Rules**: unused, no-long-session and unavailable-too-long ports
//!
//! # Library usage
//!
//! ```rust,no_run
//! use endolla_watcher::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use endolla_watcher::core::config::Config;
//! use endolla_watcher::analytics::timeline::reconstruct;
//! ```

pub mod prelude;

pub mod analytics;
pub mod core;
#[cfg(feature = "daemon")]
pub mod daemon;
pub mod engine;
pub mod feed;
pub mod logger;
pub mod model;
pub mod store;
