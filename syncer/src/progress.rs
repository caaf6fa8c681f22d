use chrono::{DateTime, Utc};
use tracing::info;

/// Tracks how far one device has come through its sync window.
///
/// The window runs from the resume point to the end bound (or the run start time).
/// The source does not say how many readings it holds, so the time covered by the last
/// committed point is the best estimate of completion.
#[derive(Debug, Clone)]
pub struct Progress {
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    points: u64,
}

impl Progress {
    pub fn new(window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> Self {
        Self {
            window_start,
            window_end,
            points: 0,
        }
    }

    /// Fraction of the window covered once `committed` is synced, clamped to `[0, 1]`.
    pub fn fraction(&self, committed: DateTime<Utc>) -> f64 {
        let total = (self.window_end - self.window_start).num_milliseconds();
        if total <= 0 {
            return 1.0;
        }
        let done = (committed - self.window_start).num_milliseconds();
        (done as f64 / total as f64).clamp(0.0, 1.0)
    }

    /// Records a committed batch and emits a progress line.
    pub fn record(&mut self, device_id: &str, batch_points: usize, committed: DateTime<Utc>) {
        self.points += batch_points as u64;
        info!(
            device = device_id,
            points = self.points,
            synced_to = %committed,
            "Uploading... ({:.0}%)",
            self.fraction(committed) * 100.0
        );
    }

    pub fn points(&self) -> u64 {
        self.points
    }
}
