//! Incremental sync of every device from the reading source into the sink.
//!
//! Per device the loop is strictly sequential:
//!
//! ```text
//! resume point -> fetch page -> map/filter readings -> batch -> write -> save state
//!                     ^                                                     |
//!                     +------------------- next page token -----------------+
//! ```
//!
//! State for a device moves only after the sink acknowledged the batch that contains
//! the new mark, and is saved before the next batch is started. A crash in between costs
//! at most one batch of re-fetching; re-fetched readings fall at or below the saved mark
//! and are dropped as stale.

use crate::errors::{Error, Result, SourceError};
use crate::metrics::{
    DEVICES_FAILED, FLUSH_LATENCY_SECONDS, POINTS_WRITTEN_TOTAL, READINGS_FETCHED_TOTAL,
    READINGS_SKIPPED_TOTAL, READINGS_STALE_TOTAL,
};
use crate::model::{Device, Page, Point, SyncState, SyncStateMap};
use crate::progress::Progress;
use crate::retry::{with_retry, RetryPolicy};
use crate::sink::TimeSeriesSink;
use crate::source::ReadingSource;
use crate::state::StateStore;
use crate::validate::map_reading;
use chrono::{DateTime, Duration, Utc};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Points per sink write.
    pub batch_size: usize,
    /// Resume point for devices with no saved state.
    pub epoch: DateTime<Utc>,
    /// Fetch from here regardless of saved state. State still never moves back.
    pub start_time: Option<DateTime<Utc>>,
    /// Readings after this instant are left for a later run.
    pub end_time: Option<DateTime<Utc>>,
    pub source_retry: RetryPolicy,
    /// Devices synced at once. Each device stays sequential internally.
    pub concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            epoch: DateTime::<Utc>::UNIX_EPOCH,
            start_time: None,
            end_time: None,
            source_retry: RetryPolicy::default(),
            concurrency: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    SinkWriteFailed,
    SourceUnavailable,
    SourceProtocol,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOutcome {
    Completed,
    /// Stopped early on a shutdown request. Everything committed so far is saved.
    Cancelled,
    Failed { kind: FailureKind, message: String },
}

/// What happened to one device during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    pub device_id: String,
    pub resumed_from: DateTime<Utc>,
    /// Mark saved for the device at the end of its sync, if any exists.
    pub last_synced_at: Option<DateTime<Utc>>,
    pub pages: u64,
    pub fetched: u64,
    pub written: u64,
    pub batches: u64,
    /// Rejected by validation.
    pub skipped: u64,
    /// At or below the high-water mark.
    pub stale: u64,
    pub outcome: DeviceOutcome,
}

impl DeviceReport {
    fn new(device_id: &str, resumed_from: DateTime<Utc>, saved: Option<DateTime<Utc>>) -> Self {
        Self {
            device_id: device_id.to_string(),
            resumed_from,
            last_synced_at: saved,
            pages: 0,
            fetched: 0,
            written: 0,
            batches: 0,
            skipped: 0,
            stale: 0,
            outcome: DeviceOutcome::Completed,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, DeviceOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub devices: Vec<DeviceReport>,
}

impl RunSummary {
    pub fn failed(&self) -> impl Iterator<Item = &DeviceReport> {
        self.devices.iter().filter(|d| d.is_failed())
    }

    pub fn failure_count(&self) -> usize {
        self.failed().count()
    }

    pub fn points_written(&self) -> u64 {
        self.devices.iter().map(|d| d.written).sum()
    }

    pub fn cancelled(&self) -> bool {
        self.devices
            .iter()
            .any(|d| d.outcome == DeviceOutcome::Cancelled)
    }

    fn log(&self, elapsed: std::time::Duration) {
        let skipped: u64 = self.devices.iter().map(|d| d.skipped).sum();
        let stale: u64 = self.devices.iter().map(|d| d.stale).sum();

        for report in self.failed() {
            if let DeviceOutcome::Failed { kind, message } = &report.outcome {
                error!(
                    device = %report.device_id,
                    kind = ?kind,
                    written = report.written,
                    "Device sync failed: {}",
                    message
                );
            }
        }

        info!(
            devices = self.devices.len(),
            failed = self.failure_count(),
            points = self.points_written(),
            skipped,
            stale,
            elapsed_ms = elapsed.as_millis() as u64,
            "Sync run finished"
        );
    }
}

/// Final state plus what happened, returned by [`SyncEngine::run`].
#[derive(Debug)]
pub struct RunOutcome {
    pub state: SyncStateMap,
    pub summary: RunSummary,
}

pub struct SyncEngine<'a> {
    source: &'a dyn ReadingSource,
    sink: &'a dyn TimeSeriesSink,
    store: &'a dyn StateStore,
    config: EngineConfig,
    shutdown: Arc<AtomicBool>,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        source: &'a dyn ReadingSource,
        sink: &'a dyn TimeSeriesSink,
        store: &'a dyn StateStore,
        config: EngineConfig,
    ) -> Self {
        Self {
            source,
            sink,
            store,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that, once set, stops every device at its next page or batch boundary.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Syncs every device, starting from `state`.
    ///
    /// Per-device failures are recorded in the summary. Only fatal errors (state
    /// corruption or write failure, source authentication) are returned as `Err`.
    pub async fn run(&self, devices: &[Device], state: SyncStateMap) -> Result<RunOutcome> {
        let started = Instant::now();
        let devices = dedupe(devices);
        info!(
            devices = devices.len(),
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            "Starting sync run"
        );

        let state = Mutex::new(state);
        let state_ref = &state;
        let reports: Vec<DeviceReport> = stream::iter(devices)
            .map(move |device| self.sync_device(device, state_ref))
            .buffered(self.config.concurrency.max(1))
            .try_collect()
            .await?;

        let summary = RunSummary { devices: reports };
        DEVICES_FAILED.set(summary.failure_count() as f64);
        summary.log(started.elapsed());

        Ok(RunOutcome {
            state: state.into_inner(),
            summary,
        })
    }

    fn resume_point(&self, device: &Device, saved: Option<DateTime<Utc>>) -> DateTime<Utc> {
        if let Some(start) = self.config.start_time {
            return start;
        }
        match (saved, device.first_seen_at) {
            (Some(saved), _) => saved,
            // The lower bound is exclusive; step back so a reading at first_seen_at counts.
            (None, Some(first_seen)) => (first_seen - Duration::seconds(1)).max(self.config.epoch),
            (None, None) => self.config.epoch,
        }
    }

    async fn sync_device(
        &self,
        device: &Device,
        state: &Mutex<SyncStateMap>,
    ) -> Result<DeviceReport> {
        let saved = state
            .lock()
            .await
            .get(&device.id)
            .map(|s| s.last_synced_at);
        let since = self.resume_point(device, saved);
        let mut report = DeviceReport::new(&device.id, since, saved);

        info!(device = %device.id, since = %since, "Syncing device");

        match self.pull_device(device, since, state, &mut report).await {
            Ok(true) => {
                info!(
                    device = %device.id,
                    written = report.written,
                    skipped = report.skipped,
                    stale = report.stale,
                    "Device sync complete"
                );
            }
            Ok(false) => {
                warn!(device = %device.id, written = report.written, "Device sync interrupted");
                report.outcome = DeviceOutcome::Cancelled;
            }
            Err(e) if e.is_fatal() => {
                error!(device = %device.id, "Fatal error, aborting run: {}", e);
                return Err(e);
            }
            Err(e) => {
                let kind = match &e {
                    Error::Sink(_) => FailureKind::SinkWriteFailed,
                    Error::Source(SourceError::Unavailable(_)) => FailureKind::SourceUnavailable,
                    _ => FailureKind::SourceProtocol,
                };
                warn!(device = %device.id, kind = ?kind, "Giving up on device for this run: {}", e);
                report.outcome = DeviceOutcome::Failed {
                    kind,
                    message: e.to_string(),
                };
            }
        }

        READINGS_SKIPPED_TOTAL.inc_by(report.skipped as f64);
        READINGS_STALE_TOTAL.inc_by(report.stale as f64);
        Ok(report)
    }

    /// The fetch-map-write-save loop for one device. `Ok(false)` means interrupted.
    async fn pull_device(
        &self,
        device: &Device,
        since: DateTime<Utc>,
        state: &Mutex<SyncStateMap>,
        report: &mut DeviceReport,
    ) -> Result<bool> {
        let window_end = self.config.end_time.unwrap_or_else(Utc::now);
        let mut progress = Progress::new(since, window_end);
        let batch_size = self.config.batch_size.max(1);
        let mut batch: Vec<Point> = Vec::with_capacity(batch_size);
        // Highest timestamp accepted so far, committed or batched.
        let mut high_water = since;
        let mut page_token: Option<String> = None;

        loop {
            if self.shutdown_requested() {
                return Ok(false);
            }

            let page = self
                .fetch_page(&device.id, since, page_token.as_deref())
                .await?;
            report.pages += 1;
            debug!(
                device = %device.id,
                readings = page.readings.len(),
                more = page.next_page_token.is_some(),
                "Fetched page"
            );

            let mut past_end = false;
            for reading in page.readings {
                report.fetched += 1;
                READINGS_FETCHED_TOTAL.inc();

                let point = match map_reading(reading, &device.id) {
                    Ok(point) => point,
                    Err(e) => {
                        report.skipped += 1;
                        debug!(device = %device.id, "Skipping invalid reading: {}", e);
                        continue;
                    }
                };

                if point.timestamp <= high_water {
                    report.stale += 1;
                    continue;
                }

                if self.config.end_time.is_some_and(|end| point.timestamp > end) {
                    past_end = true;
                    break;
                }

                high_water = point.timestamp;
                batch.push(point);

                if batch.len() >= batch_size {
                    if self.shutdown_requested() {
                        return Ok(false);
                    }
                    self.flush(&device.id, &mut batch, state, report, &mut progress)
                        .await?;
                }
            }

            if past_end {
                break;
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        if self.shutdown_requested() {
            return Ok(false);
        }
        self.flush(&device.id, &mut batch, state, report, &mut progress)
            .await?;
        Ok(true)
    }

    async fn fetch_page(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
        page_token: Option<&str>,
    ) -> Result<Page> {
        let page = with_retry(
            &self.config.source_retry,
            "fetch_page",
            SourceError::is_retryable,
            || self.source.fetch_page(device_id, since, page_token),
        )
        .await?;
        Ok(page)
    }

    /// Writes the batch, then advances and saves the device's state.
    async fn flush(
        &self,
        device_id: &str,
        batch: &mut Vec<Point>,
        state: &Mutex<SyncStateMap>,
        report: &mut DeviceReport,
        progress: &mut Progress,
    ) -> Result<()> {
        let Some(committed) = batch.last().map(|p| p.timestamp) else {
            return Ok(());
        };
        let started = Instant::now();

        self.sink.write_batch(batch).await?;

        let saved_mark = {
            // Held across the save so concurrent devices never interleave snapshots.
            let mut state = state.lock().await;
            let entry = state
                .entry(device_id.to_string())
                .and_modify(|s| s.advance(committed))
                .or_insert_with(|| SyncState::new(committed));
            let mark = entry.last_synced_at;
            self.store.save(&state).await?;
            mark
        };

        FLUSH_LATENCY_SECONDS.observe(started.elapsed().as_secs_f64());
        POINTS_WRITTEN_TOTAL.inc_by(batch.len() as f64);
        report.written += batch.len() as u64;
        report.batches += 1;
        report.last_synced_at = Some(saved_mark);
        progress.record(device_id, batch.len(), committed);

        batch.clear();
        Ok(())
    }
}

/// Drops repeated device ids, keeping the first occurrence.
fn dedupe(devices: &[Device]) -> Vec<&Device> {
    let mut seen = HashSet::new();
    devices
        .iter()
        .filter(|d| seen.insert(d.id.as_str()))
        .collect()
}
