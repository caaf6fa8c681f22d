use crate::errors::SinkError;
use crate::model::Point;
use crate::BoxFuture;

/// The push side: where points are committed.
///
/// A call either makes every point in `batch` durably visible or none of them. The
/// engine advances sync state only after `Ok`.
pub trait TimeSeriesSink: Send + Sync {
    fn write_batch<'a>(&'a self, batch: &'a [Point]) -> BoxFuture<'a, (), SinkError>;
}
