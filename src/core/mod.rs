//! Core types: errors, configuration, time windows.

pub mod config;
pub mod errors;
pub mod window;
