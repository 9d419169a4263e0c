//! EW-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, EwError>;

/// Top-level error type for the telemetry engine.
#[derive(Debug, Error)]
pub enum EwError {
    #[error("[EW-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[EW-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[EW-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[EW-1101] snapshot store schema version {found} does not match expected {expected}")]
    SchemaMismatch { found: i64, expected: i64 },

    #[error("[EW-2001] snapshot for {port} observed at {observed_at} is ahead of {now} beyond tolerance")]
    ClockSkew {
        port: String,
        observed_at: String,
        now: String,
    },

    #[error("[EW-2002] invalid time window: start {start} must precede end {end}")]
    InvalidWindow { start: String, end: String },

    #[error("[EW-2003] malformed feed document: {details}")]
    FeedFormat { details: String },

    #[error("[EW-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[EW-2102] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[EW-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[EW-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl EwError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "EW-1001",
            Self::MissingConfig { .. } => "EW-1002",
            Self::ConfigParse { .. } => "EW-1003",
            Self::SchemaMismatch { .. } => "EW-1101",
            Self::ClockSkew { .. } => "EW-2001",
            Self::InvalidWindow { .. } => "EW-2002",
            Self::FeedFormat { .. } => "EW-2003",
            Self::Serialization { .. } => "EW-2101",
            Self::Sql { .. } => "EW-2102",
            Self::Io { .. } => "EW-3002",
            Self::Runtime { .. } => "EW-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    ///
    /// Feed errors are retryable: the next fetch cycle usually brings a
    /// well-formed document.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::FeedFormat { .. }
                | Self::Sql { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<rusqlite::Error> for EwError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for EwError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for EwError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

impl From<toml::ser::Error> for EwError {
    fn from(value: toml::ser::Error) -> Self {
        Self::Serialization {
            context: "toml",
            details: value.to_string(),
        }
    }
}

impl From<chrono::ParseError> for EwError {
    fn from(value: chrono::ParseError) -> Self {
        Self::FeedFormat {
            details: format!("timestamp: {value}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<EwError> {
        vec![
            EwError::InvalidConfig {
                details: String::new(),
            },
            EwError::MissingConfig {
                path: PathBuf::new(),
            },
            EwError::ConfigParse {
                context: "",
                details: String::new(),
            },
            EwError::SchemaMismatch {
                found: 0,
                expected: 1,
            },
            EwError::ClockSkew {
                port: String::new(),
                observed_at: String::new(),
                now: String::new(),
            },
            EwError::InvalidWindow {
                start: String::new(),
                end: String::new(),
            },
            EwError::FeedFormat {
                details: String::new(),
            },
            EwError::Serialization {
                context: "",
                details: String::new(),
            },
            EwError::Sql {
                context: "",
                details: String::new(),
            },
            EwError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other("test"),
            },
            EwError::Runtime {
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let errors = all_variants();
        let codes: Vec<&str> = errors.iter().map(EwError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
    }

    #[test]
    fn display_carries_the_code() {
        for err in all_variants() {
            assert!(err.code().starts_with("EW-"));
            assert!(
                err.to_string().contains(err.code()),
                "display should contain {}: {err}",
                err.code()
            );
        }
    }

    #[test]
    fn retryable_errors_are_correct() {
        assert!(
            EwError::Runtime {
                details: "busy".to_string()
            }
            .is_retryable()
        );
        assert!(
            EwError::FeedFormat {
                details: "truncated".to_string()
            }
            .is_retryable()
        );
        assert!(
            !EwError::InvalidConfig {
                details: String::new()
            }
            .is_retryable()
        );
        assert!(
            !EwError::ClockSkew {
                port: "L1/S1/1".to_string(),
                observed_at: String::new(),
                now: String::new(),
            }
            .is_retryable()
        );
        assert!(
            !EwError::SchemaMismatch {
                found: 7,
                expected: 1
            }
            .is_retryable()
        );
    }

    #[test]
    fn io_convenience_constructor() {
        let err = EwError::io(
            "/tmp/feed.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.code(), "EW-3002");
        assert!(err.to_string().contains("/tmp/feed.json"));
    }

    #[test]
    fn from_rusqlite_error() {
        let sql_err =
            rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(1), Some("test".to_string()));
        let err: EwError = sql_err.into();
        assert_eq!(err.code(), "EW-2102");
    }

    #[test]
    fn from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let err: EwError = toml_err.into();
        assert_eq!(err.code(), "EW-1003");
    }

    #[test]
    fn from_chrono_parse_error() {
        let parse_err = chrono::DateTime::parse_from_rfc3339("yesterday").unwrap_err();
        let err: EwError = parse_err.into();
        assert_eq!(err.code(), "EW-2003");
    }
}
