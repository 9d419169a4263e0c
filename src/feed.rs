//! Upstream open-data feed: `locations[].stations[].ports[]`.
//!
//! Every port becomes one [`SnapshotRecord`] observed at the fetch time. The
//! status is `ports[].port_status[0].status`; a port without one is recorded
//! as `UNKNOWN` rather than dropped, so its presence still counts. An entry
//! without an id is skipped with a warning; the rest of the document is kept.

#![allow(missing_docs)]

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::core::errors::{EwError, Result};
use crate::model::{IngestBatch, PortKey, SnapshotRecord};

#[derive(Debug, Deserialize)]
struct FeedDocument {
    #[serde(default)]
    locations: Vec<FeedLocation>,
}

#[derive(Debug, Deserialize)]
struct FeedLocation {
    #[serde(default)]
    id: Option<FeedId>,
    #[serde(default)]
    stations: Vec<FeedStation>,
}

#[derive(Debug, Deserialize)]
struct FeedStation {
    #[serde(default)]
    id: Option<FeedId>,
    #[serde(default)]
    ports: Vec<FeedPort>,
}

#[derive(Debug, Deserialize)]
struct FeedPort {
    #[serde(default)]
    id: Option<FeedId>,
    #[serde(default)]
    port_status: Vec<FeedPortStatus>,
    #[serde(default)]
    last_updated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeedPortStatus {
    #[serde(default)]
    status: Option<String>,
}

/// Identifiers arrive as strings or bare numbers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedId {
    Text(String),
    Number(serde_json::Number),
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// Parse one feed document fetched at `fetched_at`.
pub fn parse_feed(json: &str, fetched_at: DateTime<Utc>) -> Result<IngestBatch> {
    let document: FeedDocument = serde_json::from_str(json).map_err(|e| EwError::FeedFormat {
        details: e.to_string(),
    })?;

    let mut records = Vec::new();
    for location in &document.locations {
        let Some(location_id) = &location.id else {
            eprintln!(
                "[EW-FEED] skipping location without id ({} stations)",
                location.stations.len()
            );
            continue;
        };
        for station in &location.stations {
            let Some(station_id) = &station.id else {
                eprintln!("[EW-FEED] skipping station without id in location {location_id}");
                continue;
            };
            for port in &station.ports {
                let Some(port_id) = &port.id else {
                    eprintln!(
                        "[EW-FEED] skipping port without id in station {location_id}/{station_id}"
                    );
                    continue;
                };
                let raw = port
                    .port_status
                    .first()
                    .and_then(|s| s.status.as_deref())
                    .unwrap_or("");
                let key = PortKey::new(
                    location_id.to_string(),
                    station_id.to_string(),
                    port_id.to_string(),
                );
                let mut record = SnapshotRecord::new(key, raw, fetched_at);
                record.last_updated.clone_from(&port.last_updated);
                records.push(record);
            }
        }
    }
    Ok(IngestBatch {
        fetched_at,
        records,
    })
}

/// Where the ingest loop gets its batches.
pub trait BatchSource: Send {
    fn next_batch(&mut self, now: DateTime<Utc>) -> Result<IngestBatch>;

    fn describe(&self) -> String;
}

/// Re-reads a JSON feed file on every cycle.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BatchSource for FileSource {
    fn next_batch(&mut self, now: DateTime<Utc>) -> Result<IngestBatch> {
        let json =
            std::fs::read_to_string(&self.path).map_err(|source| EwError::io(&self.path, source))?;
        parse_feed(&json, now)
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}
