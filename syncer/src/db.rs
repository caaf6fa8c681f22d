use crate::errors::{Error, Result, SinkError};
use crate::metrics::SINK_FAILURES_TOTAL;
use crate::model::Point;
use crate::retry::{with_retry, RetryPolicy};
use crate::sink::TimeSeriesSink;
use crate::BoxFuture;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{error, info};

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(Error::Migration)?;
    info!("Migrations completed");

    Ok(pool)
}

/// Writes points to a Postgres `readings` table, one row per metric.
#[derive(Debug, Clone)]
pub struct PostgresSink {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PostgresSink {
    pub fn new(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    pub async fn insert_batch(&self, batch: &[Point]) -> std::result::Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }

        with_retry(&self.retry, "insert_batch", is_transient_error, || {
            insert_batch_inner(&self.pool, batch)
        })
        .await
        .map_err(|e| {
            error!(points = batch.len(), "Database insert failed permanently: {}", e);
            SINK_FAILURES_TOTAL.inc();
            SinkError::WriteFailed(e.to_string())
        })
    }
}

impl TimeSeriesSink for PostgresSink {
    fn write_batch<'a>(&'a self, batch: &'a [Point]) -> BoxFuture<'a, (), SinkError> {
        Box::pin(self.insert_batch(batch))
    }
}

/// Column vectors for one `UNNEST` insert.
#[derive(Debug, Default, PartialEq)]
struct Rows<'a> {
    device_ids: Vec<&'a str>,
    timestamps: Vec<chrono::DateTime<chrono::Utc>>,
    metrics: Vec<&'a str>,
    values: Vec<f64>,
}

fn flatten(batch: &[Point]) -> Rows<'_> {
    let mut rows = Rows::default();
    for point in batch {
        for (metric, value) in &point.values {
            rows.device_ids.push(point.device_id.as_str());
            rows.timestamps.push(point.timestamp);
            rows.metrics.push(metric.as_str());
            rows.values.push(*value);
        }
    }
    rows
}

// A single statement, so the batch commits or fails as a unit.
async fn insert_batch_inner(pool: &PgPool, batch: &[Point]) -> std::result::Result<(), sqlx::Error> {
    let rows = flatten(batch);

    let query = r#"
        INSERT INTO readings (device_id, ts, metric, value)
        SELECT * FROM UNNEST($1::text[], $2::timestamptz[], $3::text[], $4::float8[])
        ON CONFLICT (device_id, metric, ts) DO NOTHING
        "#;

    sqlx::query(query)
        .bind(&rows.device_ids)
        .bind(&rows.timestamps)
        .bind(&rows.metrics)
        .bind(&rows.values)
        .execute(pool)
        .await?;

    Ok(())
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" || // too_many_connections
                code == "40001" // serialization_failure
            })
        }
        _ => false,
    }
}
