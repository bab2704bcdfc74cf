//! Metrics collection and export module

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::time::Instant;

/// Global metrics registry
pub struct Metrics {
    registry: Registry,

    // Transaction lifecycle counters
    pub transactions_begun: IntCounter,
    pub commits_succeeded: IntCounter,
    pub commits_failed: IntCounter,
    pub rollbacks_total: IntCounter,
    pub operations_queued: IntCounter,

    // Remote-call counters
    pub api_calls_issued: IntCounter,
    pub api_calls_saved: IntCounter,
    pub remote_attempts: IntCounter,
    pub retries_total: IntCounter,
    pub rate_limit_signals: IntCounter,
    pub snapshot_failures: IntCounter,
    pub restore_failures: IntCounter,

    // Gauges
    pub admission_current_limit: IntGauge,
    pub admission_in_flight: IntGauge,
    pub admission_queue_depth: IntGauge,
    pub active_transactions: IntGauge,

    // Histograms
    pub commit_duration_seconds: Histogram,
    pub call_duration_seconds: Histogram,
    pub permit_wait_seconds: Histogram,
    pub backoff_seconds: Histogram,
}

impl Metrics {
    /// Create new metrics instance
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let transactions_begun = IntCounter::with_opts(Opts::new(
            "transactions_begun_total",
            "Transactions created by begin",
        ))?;

        let commits_succeeded = IntCounter::with_opts(Opts::new(
            "commits_succeeded_total",
            "Commits that applied every operation",
        ))?;

        let commits_failed = IntCounter::with_opts(Opts::new(
            "commits_failed_total",
            "Commits stopped by an operation failure",
        ))?;

        let rollbacks_total = IntCounter::with_opts(Opts::new(
            "rollbacks_total",
            "Transactions moved to rolled_back",
        ))?;

        let operations_queued = IntCounter::with_opts(Opts::new(
            "operations_queued_total",
            "Operations appended to transactions",
        ))?;

        let api_calls_issued = IntCounter::with_opts(Opts::new(
            "api_calls_issued_total",
            "Planned remote calls dispatched during commits",
        ))?;

        let api_calls_saved = IntCounter::with_opts(Opts::new(
            "api_calls_saved_total",
            "Remote calls avoided by batching",
        ))?;

        let remote_attempts = IntCounter::with_opts(Opts::new(
            "remote_attempts_total",
            "Remote call attempts including retries",
        ))?;

        let retries_total = IntCounter::with_opts(Opts::new(
            "remote_retries_total",
            "Remote call retries after a retryable failure",
        ))?;

        let rate_limit_signals = IntCounter::with_opts(Opts::new(
            "rate_limit_signals_total",
            "Rate-limit responses reported to the admission controller",
        ))?;

        let snapshot_failures = IntCounter::with_opts(Opts::new(
            "snapshot_capture_failures_total",
            "Snapshot captures that failed before a commit",
        ))?;

        let restore_failures = IntCounter::with_opts(Opts::new(
            "snapshot_restore_failures_total",
            "Snapshot restores that failed during rollback",
        ))?;

        let admission_current_limit = IntGauge::with_opts(Opts::new(
            "admission_current_limit",
            "Current concurrent remote call limit",
        ))?;

        let admission_in_flight = IntGauge::with_opts(Opts::new(
            "admission_in_flight",
            "Remote calls currently holding a permit",
        ))?;

        let admission_queue_depth = IntGauge::with_opts(Opts::new(
            "admission_queue_depth",
            "Remote calls waiting for a permit",
        ))?;

        let active_transactions = IntGauge::with_opts(Opts::new(
            "active_transactions",
            "Transactions pending, queued or executing",
        ))?;

        let commit_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("commit_duration_seconds", "Commit wall-clock duration")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        )?;

        let call_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("remote_call_duration_seconds", "Single remote call attempt latency")
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;

        let permit_wait_seconds = Histogram::with_opts(
            HistogramOpts::new("admission_wait_seconds", "Time spent waiting for a permit")
                .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        let backoff_seconds = Histogram::with_opts(
            HistogramOpts::new("retry_backoff_seconds", "Scheduled retry backoff delays")
                .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 15.0, 45.0]),
        )?;

        // Register all metrics
        registry.register(Box::new(transactions_begun.clone()))?;
        registry.register(Box::new(commits_succeeded.clone()))?;
        registry.register(Box::new(commits_failed.clone()))?;
        registry.register(Box::new(rollbacks_total.clone()))?;
        registry.register(Box::new(operations_queued.clone()))?;
        registry.register(Box::new(api_calls_issued.clone()))?;
        registry.register(Box::new(api_calls_saved.clone()))?;
        registry.register(Box::new(remote_attempts.clone()))?;
        registry.register(Box::new(retries_total.clone()))?;
        registry.register(Box::new(rate_limit_signals.clone()))?;
        registry.register(Box::new(snapshot_failures.clone()))?;
        registry.register(Box::new(restore_failures.clone()))?;
        registry.register(Box::new(admission_current_limit.clone()))?;
        registry.register(Box::new(admission_in_flight.clone()))?;
        registry.register(Box::new(admission_queue_depth.clone()))?;
        registry.register(Box::new(active_transactions.clone()))?;
        registry.register(Box::new(commit_duration_seconds.clone()))?;
        registry.register(Box::new(call_duration_seconds.clone()))?;
        registry.register(Box::new(permit_wait_seconds.clone()))?;
        registry.register(Box::new(backoff_seconds.clone()))?;

        Ok(Self {
            registry,
            transactions_begun,
            commits_succeeded,
            commits_failed,
            rollbacks_total,
            operations_queued,
            api_calls_issued,
            api_calls_saved,
            remote_attempts,
            retries_total,
            rate_limit_signals,
            snapshot_failures,
            restore_failures,
            admission_current_limit,
            admission_in_flight,
            admission_queue_depth,
            active_transactions,
            commit_duration_seconds,
            call_duration_seconds,
            permit_wait_seconds,
            backoff_seconds,
        })
    }

    /// Get the registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every registered metric
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}

/// Global metrics instance
pub fn metrics() -> &'static Metrics {
    static METRICS: once_cell::sync::Lazy<Metrics> =
        once_cell::sync::Lazy::new(|| Metrics::new().expect("Failed to initialize metrics"));
    &METRICS
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration(&self, histogram: &Histogram) {
        histogram.observe(self.elapsed_secs());
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_coordinator_metrics() {
        let metrics = metrics();
        metrics.api_calls_saved.inc_by(2);

        let text = metrics.encode().unwrap();
        assert!(text.contains("api_calls_saved_total"));
        assert!(text.contains("admission_current_limit"));
        assert!(text.contains("commit_duration_seconds"));
    }

    #[test]
    fn test_timer_observes() {
        let histogram = Histogram::with_opts(HistogramOpts::new("test_timer", "test")).unwrap();
        let timer = Timer::new();
        timer.observe_duration(&histogram);
        assert_eq!(histogram.get_sample_count(), 1);
    }
}
