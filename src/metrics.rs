//! Metrics collection and export module

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Instant;

/// Bundle guard metrics
pub struct Metrics {
    registry: Registry,

    // Bundle outcomes
    pub bundles_validated: IntCounter,
    pub bundles_simulated: IntCounter,
    pub bundles_failed: IntCounter,
    pub bundles_executed: IntCounter,
    pub bundles_rejected: IntCounter,

    // Per-transaction
    pub transactions_evaluated: IntCounter,
    pub rule_rejections: IntCounterVec,
    pub malicious_detected: IntCounter,
    pub validity_refreshes: IntCounter,
    pub assertions_built: IntCounter,
    pub assertions_empty: IntCounter,

    pub persistence_errors: IntCounter,

    // Gauges
    pub active_passes: IntGauge,

    // Histograms
    pub validation_latency: Histogram,
    pub simulation_latency: Histogram,
    pub submission_latency: Histogram,
}

impl Metrics {
    /// Create new metrics instance
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let bundles_validated = IntCounter::with_opts(Opts::new(
            "bundle_guard_bundles_validated_total",
            "Bundles that entered an orchestration pass",
        ))?;

        let bundles_simulated = IntCounter::with_opts(Opts::new(
            "bundle_guard_bundles_simulated_total",
            "Bundles where every transaction passed simulation",
        ))?;

        let bundles_failed = IntCounter::with_opts(Opts::new(
            "bundle_guard_bundles_failed_total",
            "Bundles whose record ended in failed",
        ))?;

        let bundles_executed = IntCounter::with_opts(Opts::new(
            "bundle_guard_bundles_executed_total",
            "Bundles accepted by the transport",
        ))?;

        let bundles_rejected = IntCounter::with_opts(Opts::new(
            "bundle_guard_bundles_rejected_total",
            "Bundles rejected on size or shape before any network call",
        ))?;

        let transactions_evaluated = IntCounter::with_opts(Opts::new(
            "bundle_guard_transactions_evaluated_total",
            "Transactions run through the rule battery",
        ))?;

        let rule_rejections = IntCounterVec::new(
            Opts::new(
                "bundle_guard_rule_rejections_total",
                "Failed rule verdicts by rule and severity",
            ),
            &["rule", "severity"],
        )?;

        let malicious_detected = IntCounter::with_opts(Opts::new(
            "bundle_guard_malicious_detected_total",
            "Transactions classified as malicious",
        ))?;

        let validity_refreshes = IntCounter::with_opts(Opts::new(
            "bundle_guard_validity_refreshes_total",
            "Validity tokens refreshed by the freshness rule or bundle resync",
        ))?;

        let assertions_built = IntCounter::with_opts(Opts::new(
            "bundle_guard_assertions_built_total",
            "Assertion companion transactions built",
        ))?;

        let assertions_empty = IntCounter::with_opts(Opts::new(
            "bundle_guard_assertions_empty_total",
            "Transactions left without assertions because no account resolved",
        ))?;

        let persistence_errors = IntCounter::with_opts(Opts::new(
            "bundle_guard_persistence_errors_total",
            "Best-effort persistence calls that failed or timed out",
        ))?;

        let active_passes = IntGauge::with_opts(Opts::new(
            "bundle_guard_active_passes",
            "Orchestration passes currently running",
        ))?;

        let validation_latency = Histogram::with_opts(
            HistogramOpts::new(
                "bundle_guard_validation_latency_seconds",
                "End-to-end validate_bundle latency",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 15.0]),
        )?;

        let simulation_latency = Histogram::with_opts(
            HistogramOpts::new(
                "bundle_guard_simulation_latency_seconds",
                "Single simulate_transaction latency",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        let submission_latency = Histogram::with_opts(
            HistogramOpts::new(
                "bundle_guard_submission_latency_seconds",
                "Gateway submission latency",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 10.0]),
        )?;

        registry.register(Box::new(bundles_validated.clone()))?;
        registry.register(Box::new(bundles_simulated.clone()))?;
        registry.register(Box::new(bundles_failed.clone()))?;
        registry.register(Box::new(bundles_executed.clone()))?;
        registry.register(Box::new(bundles_rejected.clone()))?;
        registry.register(Box::new(transactions_evaluated.clone()))?;
        registry.register(Box::new(rule_rejections.clone()))?;
        registry.register(Box::new(malicious_detected.clone()))?;
        registry.register(Box::new(validity_refreshes.clone()))?;
        registry.register(Box::new(assertions_built.clone()))?;
        registry.register(Box::new(assertions_empty.clone()))?;
        registry.register(Box::new(persistence_errors.clone()))?;
        registry.register(Box::new(active_passes.clone()))?;
        registry.register(Box::new(validation_latency.clone()))?;
        registry.register(Box::new(simulation_latency.clone()))?;
        registry.register(Box::new(submission_latency.clone()))?;

        Ok(Self {
            registry,
            bundles_validated,
            bundles_simulated,
            bundles_failed,
            bundles_executed,
            bundles_rejected,
            transactions_evaluated,
            rule_rejections,
            malicious_detected,
            validity_refreshes,
            assertions_built,
            assertions_empty,
            persistence_errors,
            active_passes,
            validation_latency,
            simulation_latency,
            submission_latency,
        })
    }

    /// Get the registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_rule_rejection(&self, rule: &str, severity: &str) {
        self.rule_rejections.with_label_values(&[rule, severity]).inc();
    }

    /// Prometheus text exposition of every registered metric
    pub fn encode_text(&self) -> anyhow::Result<String> {
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
    pub fn start() -> Self {
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().expect("Failed to create metrics");
        metrics.bundles_validated.inc();
        assert_eq!(metrics.bundles_validated.get(), 1);
    }

    #[test]
    fn test_rule_rejection_labels() {
        let metrics = Metrics::new().unwrap();
        metrics.record_rule_rejection("rate_limit", "medium");
        metrics.record_rule_rejection("rate_limit", "medium");
        assert_eq!(
            metrics
                .rule_rejections
                .with_label_values(&["rate_limit", "medium"])
                .get(),
            2
        );
    }

    #[test]
    fn test_encode_text() {
        let metrics = Metrics::new().unwrap();
        metrics.bundles_executed.inc();
        metrics.record_rule_rejection("compute_budget", "high");
        let text = metrics.encode_text().unwrap();
        assert!(text.contains("bundle_guard_bundles_executed_total 1"));
        assert!(text.contains("rule=\"compute_budget\""));
    }

    #[test]
    fn test_timer() {
        let metrics = Metrics::new().unwrap();
        let timer = Timer::start();
        timer.observe_duration(&metrics.simulation_latency);
        assert_eq!(metrics.simulation_latency.get_sample_count(), 1);
    }
}
