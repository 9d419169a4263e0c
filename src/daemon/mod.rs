//! Long-running ingestion: the fetch loop and its signal handling.

pub mod loop_main;
pub mod signals;
