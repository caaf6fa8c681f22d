//! In-memory collaborators for engine tests.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use syncer::errors::{SinkError, SourceError, StateError};
use syncer::model::{Device, Page, Point, Reading, SyncStateMap};
use syncer::retry::RetryPolicy;
use syncer::sink::TimeSeriesSink;
use syncer::source::ReadingSource;
use syncer::state::{MemoryStateStore, StateStore};
use syncer::validate::parse_timestamp;
use syncer::{BoxFuture, EngineConfig};

/// A fixed instant plus `secs`.
pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 9, 13, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

pub fn reading(device: &str, secs: i64) -> Reading {
    Reading::at(device, ts(secs))
        .with_value("temperature", 20.0 + secs as f64 / 100.0)
        .with_value("humidity", 45.0)
}

pub fn devices(ids: &[&str]) -> Vec<Device> {
    ids.iter().map(|id| Device::new(*id)).collect()
}

pub fn test_config(batch_size: usize) -> EngineConfig {
    EngineConfig {
        batch_size,
        epoch: ts(-1_000_000),
        source_retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: std::time::Duration::ZERO,
            max_backoff: std::time::Duration::ZERO,
        },
        ..EngineConfig::default()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchCall {
    pub device_id: String,
    pub since: DateTime<Utc>,
    pub page_token: Option<String>,
}

/// Behaves like the vendor API: filters by `since`, paginates with offset tokens.
pub struct VendorSource {
    data: Mutex<BTreeMap<String, Vec<Reading>>>,
    page_size: usize,
    /// Return readings at exactly `since` too, as a sloppy API might.
    inclusive: bool,
    failures: Mutex<HashMap<String, VecDeque<SourceError>>>,
    calls: Mutex<Vec<FetchCall>>,
    device_list: Vec<Device>,
}

impl VendorSource {
    pub fn new(page_size: usize) -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
            page_size,
            inclusive: false,
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            device_list: Vec::new(),
        }
    }

    pub fn inclusive(mut self) -> Self {
        self.inclusive = true;
        self
    }

    pub fn with_devices(mut self, devices: Vec<Device>) -> Self {
        self.device_list = devices;
        self
    }

    /// Appends readings; they must have parseable timestamps.
    pub fn push(&self, readings: impl IntoIterator<Item = Reading>) {
        let mut data = lock(&self.data);
        for r in readings {
            data.entry(r.device_id.clone()).or_default().push(r);
        }
        for list in data.values_mut() {
            list.sort_by_key(sort_key);
        }
    }

    pub fn fail_next(&self, device_id: &str, error: SourceError) {
        lock(&self.failures)
            .entry(device_id.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        lock(&self.calls).clone()
    }
}

fn sort_key(r: &Reading) -> DateTime<Utc> {
    r.timestamp
        .as_ref()
        .and_then(|t| parse_timestamp(t).ok())
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl ReadingSource for VendorSource {
    fn list_devices(&self) -> BoxFuture<'_, Vec<Device>, SourceError> {
        let devices = self.device_list.clone();
        Box::pin(async move { Ok(devices) })
    }

    fn fetch_page<'a>(
        &'a self,
        device_id: &'a str,
        since: DateTime<Utc>,
        page_token: Option<&'a str>,
    ) -> BoxFuture<'a, Page, SourceError> {
        Box::pin(async move {
            lock(&self.calls).push(FetchCall {
                device_id: device_id.to_string(),
                since,
                page_token: page_token.map(str::to_string),
            });

            if let Some(err) = lock(&self.failures)
                .get_mut(device_id)
                .and_then(|q| q.pop_front())
            {
                return Err(err);
            }

            let data = lock(&self.data);
            let eligible: Vec<Reading> = data
                .get(device_id)
                .map(|list| {
                    list.iter()
                        .filter(|r| {
                            let key = sort_key(r);
                            key > since || (self.inclusive && key == since)
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();

            let offset: usize = match page_token {
                Some(token) => token
                    .parse()
                    .map_err(|_| SourceError::Protocol(format!("bad token {}", token)))?,
                None => 0,
            };
            let end = (offset + self.page_size).min(eligible.len());
            let readings = eligible.get(offset..end).unwrap_or_default().to_vec();
            let next_page_token = (end < eligible.len()).then(|| end.to_string());

            Ok(Page {
                readings,
                next_page_token,
            })
        })
    }
}

/// Replays pre-built pages per device, ignoring `since`. Once drained, returns an
/// empty final page.
#[derive(Default)]
pub struct ScriptedSource {
    pages: Mutex<HashMap<String, VecDeque<Result<Page, SourceError>>>>,
    fetches: Mutex<usize>,
}

impl ScriptedSource {
    pub fn page(&self, device_id: &str, readings: Vec<Reading>, next: Option<&str>) {
        self.script(
            device_id,
            Ok(Page {
                readings,
                next_page_token: next.map(str::to_string),
            }),
        );
    }

    pub fn error(&self, device_id: &str, error: SourceError) {
        self.script(device_id, Err(error));
    }

    fn script(&self, device_id: &str, entry: Result<Page, SourceError>) {
        lock(&self.pages)
            .entry(device_id.to_string())
            .or_default()
            .push_back(entry);
    }

    pub fn fetches(&self) -> usize {
        *lock(&self.fetches)
    }
}

impl ReadingSource for ScriptedSource {
    fn list_devices(&self) -> BoxFuture<'_, Vec<Device>, SourceError> {
        let ids: Vec<Device> = lock(&self.pages).keys().map(Device::new).collect();
        Box::pin(async move { Ok(ids) })
    }

    fn fetch_page<'a>(
        &'a self,
        device_id: &'a str,
        _since: DateTime<Utc>,
        _page_token: Option<&'a str>,
    ) -> BoxFuture<'a, Page, SourceError> {
        Box::pin(async move {
            *lock(&self.fetches) += 1;
            lock(&self.pages)
                .get_mut(device_id)
                .and_then(|q| q.pop_front())
                .unwrap_or_else(|| Ok(Page::default()))
        })
    }
}

/// Records committed batches. Can be told to reject writes.
#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Vec<Point>>>,
    failing_devices: Mutex<HashSet<String>>,
    /// Reject every write once this many batches have been committed.
    fail_after: Mutex<Option<usize>>,
    /// Raise this flag once the given number of batches has been committed.
    stop_after: Mutex<Option<(usize, Arc<AtomicBool>)>>,
    attempts: Mutex<usize>,
}

impl MemorySink {
    pub fn fail_device(&self, device_id: &str) {
        lock(&self.failing_devices).insert(device_id.to_string());
    }

    pub fn fail_after(&self, batches: usize) {
        *lock(&self.fail_after) = Some(batches);
    }

    pub fn stop_after(&self, batches: usize, flag: Arc<AtomicBool>) {
        *lock(&self.stop_after) = Some((batches, flag));
    }

    pub fn heal(&self) {
        lock(&self.failing_devices).clear();
        *lock(&self.fail_after) = None;
    }

    pub fn batches(&self) -> Vec<Vec<Point>> {
        lock(&self.batches).clone()
    }

    pub fn points(&self) -> Vec<Point> {
        self.batches().into_iter().flatten().collect()
    }

    pub fn points_for(&self, device_id: &str) -> Vec<Point> {
        self.points()
            .into_iter()
            .filter(|p| p.device_id == device_id)
            .collect()
    }

    pub fn attempts(&self) -> usize {
        *lock(&self.attempts)
    }
}

impl TimeSeriesSink for MemorySink {
    fn write_batch<'a>(&'a self, batch: &'a [Point]) -> BoxFuture<'a, (), SinkError> {
        Box::pin(async move {
            *lock(&self.attempts) += 1;
            let failing = lock(&self.failing_devices);
            if batch.iter().any(|p| failing.contains(&p.device_id)) {
                return Err(SinkError::WriteFailed("injected device failure".into()));
            }
            drop(failing);

            let mut batches = lock(&self.batches);
            if lock(&self.fail_after).is_some_and(|n| batches.len() >= n) {
                return Err(SinkError::WriteFailed("injected outage".into()));
            }
            batches.push(batch.to_vec());
            if let Some((n, flag)) = lock(&self.stop_after).as_ref() {
                if batches.len() >= *n {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            Ok(())
        })
    }
}

/// State store that fails the save after `ok_saves` successful ones, as if the
/// process died between a sink write and the state save.
pub struct CrashingStore {
    inner: MemoryStateStore,
    ok_saves: usize,
}

impl CrashingStore {
    pub fn new(state: SyncStateMap, ok_saves: usize) -> Self {
        Self {
            inner: MemoryStateStore::new(state),
            ok_saves,
        }
    }

    pub fn snapshot(&self) -> SyncStateMap {
        self.inner.snapshot()
    }
}

impl StateStore for CrashingStore {
    fn load(&self) -> BoxFuture<'_, SyncStateMap, StateError> {
        self.inner.load()
    }

    fn save<'a>(&'a self, state: &'a SyncStateMap) -> BoxFuture<'a, (), StateError> {
        if self.inner.save_count() >= self.ok_saves {
            self.inner.fail_saves(true);
        }
        self.inner.save(state)
    }
}
