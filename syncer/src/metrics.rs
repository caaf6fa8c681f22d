use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use std::path::Path;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref READINGS_FETCHED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "syncer_readings_fetched_total",
        "Total readings received from the source"
    ))
    .unwrap();
    pub static ref POINTS_WRITTEN_TOTAL: Counter = Counter::with_opts(Opts::new(
        "syncer_points_written_total",
        "Total points committed to the sink"
    ))
    .unwrap();
    pub static ref READINGS_SKIPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "syncer_readings_skipped_total",
        "Total readings rejected by validation"
    ))
    .unwrap();
    pub static ref READINGS_STALE_TOTAL: Counter = Counter::with_opts(Opts::new(
        "syncer_readings_stale_total",
        "Total readings dropped as already synced"
    ))
    .unwrap();
    pub static ref SINK_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "syncer_sink_failures_total",
        "Total batch writes that failed permanently"
    ))
    .unwrap();
    pub static ref RETRIES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "syncer_retries_total",
        "Total retried source or sink operations"
    ))
    .unwrap();
    pub static ref DEVICES_FAILED: Gauge = Gauge::with_opts(Opts::new(
        "syncer_devices_failed",
        "Devices that failed during the last run"
    ))
    .unwrap();
    pub static ref FLUSH_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "syncer_flush_latency_seconds",
            "Time taken to write one batch and persist state"
        )
        .buckets(vec![
            0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0
        ])
    )
    .unwrap();
    pub static ref LAST_RUN_TIMESTAMP_SECONDS: Gauge = Gauge::with_opts(Opts::new(
        "syncer_last_run_timestamp_seconds",
        "Unix time at which the last run finished"
    ))
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(READINGS_FETCHED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(POINTS_WRITTEN_TOTAL.clone()))?;
    REGISTRY.register(Box::new(READINGS_SKIPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(READINGS_STALE_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SINK_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RETRIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DEVICES_FAILED.clone()))?;
    REGISTRY.register(Box::new(FLUSH_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(LAST_RUN_TIMESTAMP_SECONDS.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Writes the text exposition to `path`, for the node-exporter textfile collector.
pub fn write_metrics_file(path: &Path) -> std::io::Result<()> {
    let text = gather_metrics()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_registered_metrics() {
        // Registration is global; tolerate another test having done it already.
        let _ = init_metrics();
        POINTS_WRITTEN_TOTAL.inc();
        let text = gather_metrics().unwrap();
        assert!(text.contains("syncer_points_written_total"));
    }
}
