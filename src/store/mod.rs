//! Snapshot persistence and retention.

pub mod retention;
pub mod sqlite;
