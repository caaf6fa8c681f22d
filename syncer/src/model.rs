use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A physical sensor unit known to the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// When the vendor first saw the unit. Used as a lower bound for unseen devices.
    #[serde(default)]
    pub first_seen_at: Option<DateTime<Utc>>,
}

impl Device {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            first_seen_at: None,
        }
    }
}

/// Committed progress for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncState {
    pub last_synced_at: DateTime<Utc>,
}

impl SyncState {
    pub fn new(last_synced_at: DateTime<Utc>) -> Self {
        Self { last_synced_at }
    }

    /// Moves the mark forward to `committed`. Never moves it back.
    pub fn advance(&mut self, committed: DateTime<Utc>) {
        if committed > self.last_synced_at {
            self.last_synced_at = committed;
        }
    }
}

/// Sync state for every device ever committed, keyed by device id.
pub type SyncStateMap = BTreeMap<String, SyncState>;

/// Timestamp as the source delivered it, before validation.
#[derive(Debug, Clone, PartialEq)]
pub enum RawTimestamp {
    /// Unix seconds.
    Unix(i64),
    /// RFC 3339 / ISO 8601 text.
    Text(String),
}

impl From<DateTime<Utc>> for RawTimestamp {
    fn from(ts: DateTime<Utc>) -> Self {
        RawTimestamp::Text(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }
}

/// One raw sample pulled from the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device_id: String,
    pub timestamp: Option<RawTimestamp>,
    /// Metric name to value. `None` marks a metric the source listed without a value.
    pub values: BTreeMap<String, Option<f64>>,
}

impl Reading {
    pub fn at(device_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: Some(timestamp.into()),
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, metric: impl Into<String>, value: f64) -> Self {
        self.values.insert(metric.into(), Some(value));
        self
    }
}

/// Sink-ready sample: the device is a tag, the metrics are fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
}

/// One page of readings plus the continuation token, if more data exists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub readings: Vec<Reading>,
    pub next_page_token: Option<String>,
}
