/*!
Observability infrastructure for Stash.

- Structured logging through `tracing` with an `EnvFilter` honouring `RUST_LOG`
- Prometheus metrics for object store traffic and archive sizes (feature `metrics`)

Without the `metrics` feature the recording helpers compile to no-ops, so call
sites do not need their own `cfg` guards.
*/

use crate::{Result, StashError};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "metrics")]
pub use metrics::{gather_metrics, StashMetrics};

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence; otherwise the level is `debug` when
/// `verbose` is set and `info` if not. `json` switches to one JSON object
/// per event.
pub fn init_tracing(verbose: bool, json: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let installed = if json {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.try_init()
    };

    installed
        .map_err(|e| StashError::config(format!("Failed to set global tracing subscriber: {e}")))
}

/// Times one store operation and records its outcome.
pub struct MetricsTimer {
    #[cfg(feature = "metrics")]
    start: std::time::Instant,
    #[cfg(feature = "metrics")]
    operation: &'static str,
}

impl MetricsTimer {
    /// Start timing `operation` and count the request
    pub fn start(operation: &'static str) -> Self {
        #[cfg(feature = "metrics")]
        {
            if let Some(metrics) = StashMetrics::global() {
                metrics.store_requests_total.with_label_values(&[operation]).inc();
            }
            Self {
                start: std::time::Instant::now(),
                operation,
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            let _ = operation;
            Self {}
        }
    }

    /// Complete the timer, recording success latency
    pub fn finish(self) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = StashMetrics::global() {
            metrics
                .store_latency_seconds
                .with_label_values(&[self.operation])
                .observe(self.start.elapsed().as_secs_f64());
        }
    }

    /// Complete the timer with an error, recording both latency and error
    pub fn finish_with_error(self) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = StashMetrics::global() {
            metrics.store_errors_total.with_label_values(&[self.operation]).inc();
            metrics
                .store_latency_seconds
                .with_label_values(&[self.operation])
                .observe(self.start.elapsed().as_secs_f64());
        }
    }

    /// Record a retry for this operation
    pub fn record_retry(&self) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = StashMetrics::global() {
            metrics.store_retries_total.with_label_values(&[self.operation]).inc();
        }
    }
}

/// Record the size of an uploaded archive
pub fn record_archive_size(bytes: u64) {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = StashMetrics::global() {
        metrics.archive_size_bytes.observe(bytes as f64);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = bytes;
}

#[cfg(feature = "metrics")]
mod metrics {
    use crate::{Result, StashError};
    use prometheus::{
        Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
    };
    use std::sync::OnceLock;

    /// Global metrics instance; `None` if registration failed
    static METRICS: OnceLock<Option<StashMetrics>> = OnceLock::new();

    /// Metrics collection for Stash operations
    #[derive(Debug)]
    pub struct StashMetrics {
        pub store_requests_total: IntCounterVec,
        pub store_errors_total: IntCounterVec,
        pub store_retries_total: IntCounterVec,
        pub store_latency_seconds: HistogramVec,
        pub archive_size_bytes: Histogram,
        registry: Registry,
    }

    impl StashMetrics {
        fn new() -> Result<Self> {
            let registry = Registry::new();

            let store_requests_total = IntCounterVec::new(
                Opts::new(
                    "stash_store_requests_total",
                    "Total object store requests made by Stash",
                ),
                &["operation"],
            )
            .map_err(metric_error("create store_requests_total"))?;

            let store_errors_total = IntCounterVec::new(
                Opts::new("stash_store_errors_total", "Total object store request errors in Stash"),
                &["operation"],
            )
            .map_err(metric_error("create store_errors_total"))?;

            let store_retries_total = IntCounterVec::new(
                Opts::new(
                    "stash_store_retries_total",
                    "Total object store retry attempts in Stash",
                ),
                &["operation"],
            )
            .map_err(metric_error("create store_retries_total"))?;

            let store_latency_seconds = HistogramVec::new(
                HistogramOpts::new(
                    "stash_store_latency_seconds",
                    "Duration of object store operations in seconds",
                ),
                &["operation"],
            )
            .map_err(metric_error("create store_latency_seconds"))?;

            let archive_size_bytes = Histogram::with_opts(
                HistogramOpts::new("stash_archive_size_bytes", "Size of uploaded archives in bytes")
                    .buckets(prometheus::exponential_buckets(1024.0, 4.0, 12).unwrap_or_default()),
            )
            .map_err(metric_error("create archive_size_bytes"))?;

            registry
                .register(Box::new(store_requests_total.clone()))
                .map_err(metric_error("register store_requests_total"))?;
            registry
                .register(Box::new(store_errors_total.clone()))
                .map_err(metric_error("register store_errors_total"))?;
            registry
                .register(Box::new(store_retries_total.clone()))
                .map_err(metric_error("register store_retries_total"))?;
            registry
                .register(Box::new(store_latency_seconds.clone()))
                .map_err(metric_error("register store_latency_seconds"))?;
            registry
                .register(Box::new(archive_size_bytes.clone()))
                .map_err(metric_error("register archive_size_bytes"))?;

            Ok(Self {
                store_requests_total,
                store_errors_total,
                store_retries_total,
                store_latency_seconds,
                archive_size_bytes,
                registry,
            })
        }

        /// Get or initialize the global metrics instance
        pub fn global() -> Option<&'static StashMetrics> {
            METRICS
                .get_or_init(|| match Self::new() {
                    Ok(metrics) => Some(metrics),
                    Err(err) => {
                        tracing::warn!(error = %err, "Metrics disabled");
                        None
                    }
                })
                .as_ref()
        }

        /// Gather metrics in Prometheus text format
        pub fn gather(&self) -> Result<String> {
            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();

            encoder
                .encode(&self.registry.gather(), &mut buffer)
                .map_err(|e| StashError::storage(format!("Failed to encode metrics: {e}")))?;

            String::from_utf8(buffer).map_err(|e| {
                StashError::storage(format!("Failed to convert metrics to string: {e}"))
            })
        }
    }

    fn metric_error(action: &'static str) -> impl FnOnce(prometheus::Error) -> StashError {
        move |e| StashError::storage(format!("Failed to {action}: {e}"))
    }

    /// Render the global registry in Prometheus text exposition format.
    pub fn gather_metrics() -> Result<String> {
        StashMetrics::global()
            .ok_or_else(|| StashError::storage("Metrics registry unavailable"))?
            .gather()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_lifecycle() {
        let timer = MetricsTimer::start("put_object");
        timer.record_retry();
        timer.finish();

        MetricsTimer::start("get_object").finish_with_error();
        record_archive_size(4096);
    }

    #[test]
    fn test_init_tracing_twice_fails() {
        // The first call may race with another test; the second always fails
        let _ = init_tracing(false, false);
        assert!(init_tracing(true, true).is_err());
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics_gathering() {
        MetricsTimer::start("list_objects").finish_with_error();
        record_archive_size(2048);

        let text = gather_metrics().unwrap();
        assert!(text.contains("stash_store_requests_total"));
        assert!(text.contains("operation=\"list_objects\""));
        assert!(text.contains("stash_archive_size_bytes"));
    }
}
