use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// A reading as the vendor API serializes it.
#[derive(Debug, Clone, Serialize)]
pub struct WireReading {
    pub timestamp: Value,
    pub values: BTreeMap<String, Value>,
}

/// Deterministic reading schedule for a fleet of simulated devices.
#[derive(Debug, Clone)]
pub struct Fleet {
    pub device_ids: Vec<String>,
    pub first_reading_at: DateTime<Utc>,
    pub interval: Duration,
    pub invalid_ratio: f64,
}

impl Fleet {
    pub fn device_index(&self, device_id: &str) -> Option<usize> {
        self.device_ids.iter().position(|d| d == device_id)
    }

    /// Index of the first reading strictly after `since`.
    pub fn first_index_after(&self, since: DateTime<Utc>) -> u64 {
        if since < self.first_reading_at {
            return 0;
        }
        let elapsed = (since - self.first_reading_at).num_milliseconds();
        (elapsed / self.interval.num_milliseconds()) as u64 + 1
    }

    /// Number of readings that exist up to `now`.
    pub fn available(&self, now: DateTime<Utc>) -> u64 {
        self.first_index_after(now)
    }

    pub fn timestamp_of(&self, index: u64) -> DateTime<Utc> {
        self.first_reading_at + self.interval * index as i32
    }

    /// The reading with the given index. The same (device, index) always yields the
    /// same values.
    pub fn reading(&self, device: usize, index: u64) -> WireReading {
        let mut rng = StdRng::seed_from_u64(((device as u64) << 40) ^ index);
        let ts = self.timestamp_of(index);
        let mut reading = generate_reading(&mut rng, ts);
        if rng.gen_bool(self.invalid_ratio) {
            corrupt(&mut rng, &mut reading);
        }
        reading
    }

    /// Up to `page_size` readings starting at index `start`, plus the index to continue
    /// from if more readings exist at `now`.
    pub fn page(
        &self,
        device: usize,
        start: u64,
        page_size: usize,
        now: DateTime<Utc>,
    ) -> (Vec<WireReading>, Option<u64>) {
        let available = self.available(now);
        let end = start.saturating_add(page_size as u64).min(available);
        let readings = (start..end).map(|i| self.reading(device, i)).collect();
        (readings, (end < available).then_some(end))
    }
}

fn generate_reading(rng: &mut impl Rng, ts: DateTime<Utc>) -> WireReading {
    let temperature = if rng.gen_bool(0.05) {
        rng.gen_range(-50.0..100.0) // 5% outliers
    } else {
        rng.gen_range(15.0..35.0) // Normal range
    };

    let humidity = if rng.gen_bool(0.05) {
        rng.gen_range(0.0..100.0) // 5% outliers
    } else {
        rng.gen_range(30.0..80.0) // Normal range
    };

    let battery = if rng.gen_bool(0.02) {
        rng.gen_range(0.0..20.0) // 2% low battery
    } else {
        rng.gen_range(20.0..100.0) // Normal range
    };

    let mut values = BTreeMap::new();
    values.insert("temperature".to_string(), json!(temperature));
    values.insert("humidity".to_string(), json!(humidity));
    values.insert("battery".to_string(), json!(battery));
    values.insert("pressure".to_string(), json!(rng.gen_range(980.0..1040.0)));
    values.insert("sound_level".to_string(), json!(rng.gen_range(25.0..70.0)));

    // The real API mixes epoch seconds and ISO strings.
    let timestamp = if rng.gen_bool(0.5) {
        json!(ts.timestamp())
    } else {
        json!(ts.to_rfc3339())
    };

    WireReading { timestamp, values }
}

fn corrupt(rng: &mut impl Rng, reading: &mut WireReading) {
    match rng.gen_range(0..3) {
        0 => reading.timestamp = Value::Null,
        1 => {
            for value in reading.values.values_mut() {
                *value = Value::Null;
            }
        }
        _ => {
            reading
                .values
                .insert("temperature".to_string(), json!("NaN"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fleet() -> Fleet {
        Fleet {
            device_ids: vec!["sim-0".into(), "sim-1".into()],
            first_reading_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            interval: Duration::minutes(5),
            invalid_ratio: 0.0,
        }
    }

    #[test]
    fn test_first_index_after_is_exclusive() {
        let f = fleet();
        assert_eq!(f.first_index_after(f.first_reading_at - Duration::days(1)), 0);
        assert_eq!(f.first_index_after(f.first_reading_at), 1);
        assert_eq!(f.first_index_after(f.timestamp_of(3)), 4);
        assert_eq!(
            f.first_index_after(f.timestamp_of(3) + Duration::seconds(1)),
            4
        );
    }

    #[test]
    fn test_readings_are_deterministic() {
        let f = fleet();
        assert_eq!(
            serde_json::to_string(&f.reading(1, 42)).unwrap(),
            serde_json::to_string(&f.reading(1, 42)).unwrap()
        );
    }

    #[test]
    fn test_valid_readings_carry_all_metrics() {
        let reading = fleet().reading(0, 7);
        assert!(!reading.timestamp.is_null());
        assert_eq!(reading.values.len(), 5);
    }

    #[test]
    fn test_page_continues_until_available() {
        let f = fleet();
        let now = f.timestamp_of(4);
        let (first, next) = f.page(0, 0, 3, now);
        assert_eq!(first.len(), 3);
        assert_eq!(next, Some(3));
        let (rest, next) = f.page(0, 3, 3, now);
        assert_eq!(rest.len(), 2);
        assert_eq!(next, None);
    }

    #[test]
    fn test_page_with_huge_start_is_empty() {
        let f = fleet();
        let (readings, next) = f.page(0, u64::MAX, 1000, f.timestamp_of(10));
        assert!(readings.is_empty());
        assert_eq!(next, None);
    }
}
