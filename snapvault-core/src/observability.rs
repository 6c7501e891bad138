/*!
Logging and metrics setup.

Logging goes through `tracing`; binaries call [`init_observability`] once at
startup. With the `metrics` feature a process-wide Prometheus registry counts
remote store traffic and retention decisions.
*/

use std::fmt;
use std::str::FromStr;

#[cfg(feature = "metrics")]
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(feature = "metrics")]
use std::time::Instant;
use serde::{Deserialize, Serialize};
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{Result, SnapvaultError};

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Console,
    /// One JSON object per event
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Console => f.write_str("console"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = SnapvaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "console" | "text" => Ok(LogFormat::Console),
            "json" => Ok(LogFormat::Json),
            other => Err(SnapvaultError::validation(format!(
                "Unknown log format '{other}' (expected console or json)"
            ))),
        }
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `level` when set. Fails if a subscriber
/// is already installed or the filter does not parse.
pub fn init_observability(format: LogFormat, level: &str) -> Result<()> {
    #[cfg(feature = "metrics")]
    SnapvaultMetrics::global();

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|e| {
            SnapvaultError::validation(format!("Invalid log level '{level}': {e}"))
        })?,
    };

    let installed = match format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(false)
                .with_current_span(false);
            set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
        }
        LogFormat::Console => {
            let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
            set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
        }
    };
    installed.map_err(|e| {
        SnapvaultError::validation(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!(format = %format, "Observability initialized");
    Ok(())
}

/// Console output at `info`
pub fn init_default_observability() -> Result<()> {
    init_observability(LogFormat::Console, "info")
}

#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<SnapvaultMetrics>> = OnceLock::new();

/// Prometheus metrics for snapvault operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct SnapvaultMetrics {
    pub remote_requests_total: CounterVec,
    pub remote_errors_total: CounterVec,
    pub remote_retries_total: CounterVec,
    pub remote_latency_seconds: HistogramVec,
    pub retention_kept_total: IntCounter,
    pub retention_deleted_total: IntCounter,
    pub gap_uploads_total: IntCounter,
    registry: Registry,
}

#[cfg(feature = "metrics")]
impl SnapvaultMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();
        let metric_error =
            |name: &str, e: prometheus::Error| SnapvaultError::validation(format!("Failed to create {name}: {e}"));

        let remote_requests_total = CounterVec::new(
            Opts::new("snapvault_remote_requests_total", "Requests sent to the remote store"),
            &["operation"],
        )
        .map_err(|e| metric_error("remote_requests_total", e))?;

        let remote_errors_total = CounterVec::new(
            Opts::new("snapvault_remote_errors_total", "Remote store requests that failed"),
            &["operation"],
        )
        .map_err(|e| metric_error("remote_errors_total", e))?;

        let remote_retries_total = CounterVec::new(
            Opts::new("snapvault_remote_retries_total", "Remote store retry attempts"),
            &["operation"],
        )
        .map_err(|e| metric_error("remote_retries_total", e))?;

        let remote_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "snapvault_remote_latency_seconds",
                "Duration of remote store operations in seconds",
            ),
            &["operation"],
        )
        .map_err(|e| metric_error("remote_latency_seconds", e))?;

        let retention_kept_total = IntCounter::new(
            "snapvault_retention_kept_total",
            "Snapshot names marked keep by retention evaluation",
        )
        .map_err(|e| metric_error("retention_kept_total", e))?;

        let retention_deleted_total = IntCounter::new(
            "snapvault_retention_deleted_total",
            "Snapshot names marked delete by retention evaluation",
        )
        .map_err(|e| metric_error("retention_deleted_total", e))?;

        let gap_uploads_total = IntCounter::new(
            "snapvault_gap_uploads_total",
            "Snapshots uploaded to fill replication gaps",
        )
        .map_err(|e| metric_error("gap_uploads_total", e))?;

        registry
            .register(Box::new(remote_requests_total.clone()))
            .and_then(|_| registry.register(Box::new(remote_errors_total.clone())))
            .and_then(|_| registry.register(Box::new(remote_retries_total.clone())))
            .and_then(|_| registry.register(Box::new(remote_latency_seconds.clone())))
            .and_then(|_| registry.register(Box::new(retention_kept_total.clone())))
            .and_then(|_| registry.register(Box::new(retention_deleted_total.clone())))
            .and_then(|_| registry.register(Box::new(gap_uploads_total.clone())))
            .map_err(|e| metric_error("registry", e))?;

        Ok(Self {
            remote_requests_total,
            remote_errors_total,
            remote_retries_total,
            remote_latency_seconds,
            retention_kept_total,
            retention_deleted_total,
            gap_uploads_total,
            registry,
        })
    }

    /// Process-wide metrics, or `None` if the registry could not be built
    pub fn global() -> Option<&'static SnapvaultMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::error!(error = %e, "Metrics disabled");
                    None
                }
            })
            .as_ref()
    }

    pub fn record_remote_request(&self, operation: &str) {
        self.remote_requests_total.with_label_values(&[operation]).inc();
    }

    pub fn record_remote_error(&self, operation: &str) {
        self.remote_errors_total.with_label_values(&[operation]).inc();
    }

    pub fn record_remote_retry(&self, operation: &str) {
        self.remote_retries_total.with_label_values(&[operation]).inc();
    }

    pub fn record_remote_latency(&self, operation: &str, duration: std::time::Duration) {
        self.remote_latency_seconds
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }

    pub fn record_retention(&self, kept: usize, deleted: usize) {
        self.retention_kept_total.inc_by(kept as u64);
        self.retention_deleted_total.inc_by(deleted as u64);
    }

    pub fn record_gap_uploads(&self, count: usize) {
        self.gap_uploads_total.inc_by(count as u64);
    }

    /// Render the registry in the Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| SnapvaultError::validation(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| SnapvaultError::validation(format!("Metrics are not valid UTF-8: {e}")))
    }
}

/// Render the global registry, empty when metrics are unavailable
#[cfg(feature = "metrics")]
pub fn gather_metrics() -> Result<String> {
    match SnapvaultMetrics::global() {
        Some(metrics) => metrics.gather_metrics(),
        None => Ok(String::new()),
    }
}

/// Measures one remote operation
#[cfg(feature = "metrics")]
pub struct MetricsTimer {
    start: Instant,
    operation: &'static str,
}

#[cfg(feature = "metrics")]
impl MetricsTimer {
    /// Count a request for `operation` and start timing it
    pub fn start(operation: &'static str) -> Self {
        if let Some(metrics) = SnapvaultMetrics::global() {
            metrics.record_remote_request(operation);
        }
        Self {
            start: Instant::now(),
            operation,
        }
    }

    pub fn record_retry(&self) {
        if let Some(metrics) = SnapvaultMetrics::global() {
            metrics.record_remote_retry(self.operation);
        }
    }

    /// Record latency, and an error if `ok` is false
    pub fn finish(self, ok: bool) {
        if let Some(metrics) = SnapvaultMetrics::global() {
            metrics.record_remote_latency(self.operation, self.start.elapsed());
            if !ok {
                metrics.record_remote_error(self.operation);
            }
        }
    }
}

/// Count retention decisions; no-op without the `metrics` feature
pub(crate) fn record_retention(_kept: usize, _deleted: usize) {
    #[cfg(feature = "metrics")]
    {
        if let Some(metrics) = SnapvaultMetrics::global() {
            metrics.record_retention(_kept, _deleted);
        }
    }
}

/// Count gap uploads; no-op without the `metrics` feature
pub(crate) fn record_gap_uploads(_count: usize) {
    #[cfg(feature = "metrics")]
    {
        if let Some(metrics) = SnapvaultMetrics::global() {
            metrics.record_gap_uploads(_count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" Console ".parse::<LogFormat>().unwrap(), LogFormat::Console);
        assert!("yaml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::default().to_string(), "console");
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        std::env::remove_var("RUST_LOG");
        let result = init_observability(LogFormat::Console, "snapvault=loud");
        assert!(matches!(result, Err(SnapvaultError::Validation(_))));
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics_are_recorded_and_rendered() {
        let metrics = SnapvaultMetrics::global().unwrap();
        metrics.record_remote_request("list_objects_v2");
        metrics.record_retention(3, 2);

        let timer = MetricsTimer::start("head_object");
        timer.record_retry();
        timer.finish(false);

        let text = gather_metrics().unwrap();
        assert!(text.contains("snapvault_remote_requests_total"));
        assert!(text.contains("snapvault_retention_deleted_total"));
        assert!(text.contains("operation=\"head_object\""));
    }
}
