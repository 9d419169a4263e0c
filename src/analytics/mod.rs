//! Derived metrics over stored snapshots.
//!
//! Everything here is pure: callers hand in snapshots and explicit instants,
//! nothing reads the clock or the store.

pub mod fingerprint;
pub mod reliability;
pub mod rules;
pub mod timeline;
pub mod utilization;
