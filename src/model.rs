//! Domain vocabulary shared by the store and the analytics layer.

#![allow(missing_docs)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ──────────────────── identity ────────────────────

/// Fully-qualified port identity. Station ids are only unique within a location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortKey {
    pub location_id: String,
    pub station_id: String,
    pub port_id: String,
}

impl PortKey {
    pub fn new(
        location_id: impl Into<String>,
        station_id: impl Into<String>,
        port_id: impl Into<String>,
    ) -> Self {
        Self {
            location_id: location_id.into(),
            station_id: station_id.into(),
            port_id: port_id.into(),
        }
    }

    pub fn station(&self) -> StationKey {
        StationKey {
            location_id: self.location_id.clone(),
            station_id: self.station_id.clone(),
        }
    }
}

impl fmt::Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.location_id, self.station_id, self.port_id)
    }
}

/// Station identity within a location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StationKey {
    pub location_id: String,
    pub station_id: String,
}

impl StationKey {
    pub fn new(location_id: impl Into<String>, station_id: impl Into<String>) -> Self {
        Self {
            location_id: location_id.into(),
            station_id: station_id.into(),
        }
    }
}

impl fmt::Display for StationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.location_id, self.station_id)
    }
}

/// Aggregation scope for summaries and rollups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scope {
    Port(PortKey),
    Station(StationKey),
    Location { location_id: String },
    Network,
}

impl Scope {
    pub fn location(location_id: impl Into<String>) -> Self {
        Self::Location {
            location_id: location_id.into(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port(key) => write!(f, "port {key}"),
            Self::Station(key) => write!(f, "station {key}"),
            Self::Location { location_id } => write!(f, "location {location_id}"),
            Self::Network => f.write_str("network"),
        }
    }
}

// ──────────────────── status ────────────────────

/// Closed status vocabulary. Feed strings that do not map land in `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortStatus {
    Available,
    /// Occupied but not delivering power (plugged in, finished, reserved).
    InUse,
    Charging,
    Unavailable,
    Unknown,
}

impl PortStatus {
    pub const ALL: [Self; 5] = [
        Self::Available,
        Self::InUse,
        Self::Charging,
        Self::Unavailable,
        Self::Unknown,
    ];

    /// Map a raw feed status. Case-insensitive; spaces and hyphens read as `_`.
    pub fn from_feed(raw: &str) -> Self {
        let normalized: String = raw
            .trim()
            .chars()
            .map(|c| match c {
                ' ' | '-' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect();
        match normalized.as_str() {
            "AVAILABLE" | "FREE" => Self::Available,
            "IN_USE" | "OCCUPIED" | "FINISHED" | "COMPLETED" | "RESERVED" => Self::InUse,
            "CHARGING" => Self::Charging,
            "UNAVAILABLE" | "OUT_OF_ORDER" | "OUT_OF_SERVICE" | "BLOCKED" | "INOPERATIVE"
            | "FAULTED" => Self::Unavailable,
            _ => Self::Unknown,
        }
    }

    /// Canonical stored label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::InUse => "IN_USE",
            Self::Charging => "CHARGING",
            Self::Unavailable => "UNAVAILABLE",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Parse a canonical stored label. Anything else is `Unknown`.
    pub fn from_stored(label: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == label)
            .unwrap_or(Self::Unknown)
    }
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides which statuses count as occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPolicy {
    pub in_use_counts_as_occupied: bool,
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self {
            in_use_counts_as_occupied: true,
        }
    }
}

impl StatusPolicy {
    pub const fn is_occupied(self, status: PortStatus) -> bool {
        match status {
            PortStatus::Charging => true,
            PortStatus::InUse => self.in_use_counts_as_occupied,
            _ => false,
        }
    }
}

// ──────────────────── snapshots ────────────────────

/// A stored observation of one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub observed_at: DateTime<Utc>,
    pub status: PortStatus,
}

impl Snapshot {
    pub const fn new(observed_at: DateTime<Utc>, status: PortStatus) -> Self {
        Self {
            observed_at,
            status,
        }
    }
}

/// One record of an ingestion batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub port: PortKey,
    pub status: PortStatus,
    /// Feed status as delivered, kept for audit.
    pub raw_status: String,
    pub observed_at: DateTime<Utc>,
    /// Upstream `last_updated`, if the feed supplied one.
    pub last_updated: Option<String>,
}

impl SnapshotRecord {
    pub fn new(port: PortKey, raw_status: &str, observed_at: DateTime<Utc>) -> Self {
        Self {
            port,
            status: PortStatus::from_feed(raw_status),
            raw_status: raw_status.to_string(),
            observed_at,
            last_updated: None,
        }
    }
}

/// Everything one fetch cycle delivered. Applied atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestBatch {
    pub fetched_at: DateTime<Utc>,
    pub records: Vec<SnapshotRecord>,
}

/// A derived value or an explicit absence of evidence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Observed<T> {
    Value(T),
    NoData,
}

impl<T> Observed<T> {
    pub const fn is_no_data(&self) -> bool {
        matches!(self, Self::NoData)
    }

    pub fn value(self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v),
            Self::NoData => None,
        }
    }
}

impl<T> From<Option<T>> for Observed<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::NoData, Self::Value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_statuses_map_to_closed_vocabulary() {
        assert_eq!(PortStatus::from_feed("AVAILABLE"), PortStatus::Available);
        assert_eq!(PortStatus::from_feed("in use"), PortStatus::InUse);
        assert_eq!(PortStatus::from_feed("Finished"), PortStatus::InUse);
        assert_eq!(PortStatus::from_feed("CHARGING"), PortStatus::Charging);
        assert_eq!(PortStatus::from_feed("out-of-order"), PortStatus::Unavailable);
        assert_eq!(PortStatus::from_feed("OUT_OF_SERVICE"), PortStatus::Unavailable);
        assert_eq!(PortStatus::from_feed("MAINTENANCE_WINDOW"), PortStatus::Unknown);
        assert_eq!(PortStatus::from_feed(""), PortStatus::Unknown);
    }

    #[test]
    fn stored_labels_round_trip() {
        for status in PortStatus::ALL {
            assert_eq!(PortStatus::from_stored(status.as_str()), status);
        }
        assert_eq!(PortStatus::from_stored("garbage"), PortStatus::Unknown);
    }

    #[test]
    fn policy_controls_in_use() {
        let strict = StatusPolicy {
            in_use_counts_as_occupied: false,
        };
        assert!(StatusPolicy::default().is_occupied(PortStatus::InUse));
        assert!(!strict.is_occupied(PortStatus::InUse));
        assert!(strict.is_occupied(PortStatus::Charging));
        assert!(!strict.is_occupied(PortStatus::Unknown));
    }

    #[test]
    fn observed_serializes_with_explicit_marker() {
        let none: Observed<f64> = Observed::NoData;
        let json = serde_json::to_string(&none).unwrap();
        assert_eq!(json, r#"{"kind":"no_data"}"#);
        let some = Observed::Value(1.5);
        assert_eq!(
            serde_json::to_string(&some).unwrap(),
            r#"{"kind":"value","value":1.5}"#
        );
    }
}
