//! Incremental sync of sensor readings from a vendor API into a time-series store.
//!
//! Each run resumes every device from its saved `last_synced_at`, pages through new
//! readings, writes them in bounded batches and saves progress after every committed
//! batch. See [`engine`] for the loop itself.

pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod metrics;
pub mod model;
pub mod progress;
pub mod retry;
pub mod sink;
pub mod source;
pub mod state;
pub mod validate;

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by the collaborator traits.
pub type BoxFuture<'a, T, E> =
    Pin<Box<dyn Future<Output = std::result::Result<T, E>> + Send + 'a>>;

pub use engine::{EngineConfig, RunOutcome, RunSummary, SyncEngine};
pub use errors::{Error, Result};
pub use model::{Device, Point, Reading, SyncState, SyncStateMap};
