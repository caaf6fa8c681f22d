use crate::errors::ValidationError;
use crate::model::{Point, RawTimestamp, Reading};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Parses a raw source timestamp into UTC.
pub fn parse_timestamp(raw: &RawTimestamp) -> Result<DateTime<Utc>, ValidationError> {
    match raw {
        RawTimestamp::Unix(secs) => DateTime::from_timestamp(*secs, 0)
            .ok_or_else(|| ValidationError::BadTimestamp(secs.to_string())),
        RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(text.trim())
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|_| ValidationError::BadTimestamp(text.clone())),
    }
}

/// Validates a reading fetched for `device_id` and maps it to a point.
///
/// Metrics listed without a value are dropped. A single non-finite value rejects the
/// whole reading, since it usually means the sample itself is broken.
pub fn map_reading(reading: Reading, device_id: &str) -> Result<Point, ValidationError> {
    if reading.device_id.is_empty() {
        return Err(ValidationError::EmptyDeviceId);
    }
    if reading.device_id != device_id {
        return Err(ValidationError::DeviceMismatch {
            expected: device_id.to_string(),
            found: reading.device_id,
        });
    }

    let timestamp = match &reading.timestamp {
        Some(raw) => parse_timestamp(raw)?,
        None => return Err(ValidationError::MissingTimestamp),
    };

    let mut values = BTreeMap::new();
    for (metric, value) in reading.values {
        let Some(value) = value else { continue };
        if !value.is_finite() {
            return Err(ValidationError::NonFinite { metric, value });
        }
        values.insert(metric, value);
    }

    if values.is_empty() {
        return Err(ValidationError::NoValues);
    }

    Ok(Point {
        device_id: reading.device_id,
        timestamp,
        values,
    })
}
