//! Activity logging: a JSONL file fed by a background thread.

pub mod activity;
pub mod jsonl;
