//! Observability infrastructure
//!
//! Prometheus metrics for the incident pipeline, exposed by the API server's
//! `/metrics` endpoint. A single global registry is initialized on first use;
//! handles are cheap clones.

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;

/// Histogram buckets for inference latency (seconds)
const INFERENCE_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

static GLOBAL_METRICS: OnceLock<MetricsInner> = OnceLock::new();

struct MetricsInner {
    events_published: IntCounter,
    events_dropped: IntCounter,
    log_lines: IntCounter,
    classifier_calls: IntCounter,
    classifier_failures: IntCounter,
    classifier_latency: Histogram,
    analyzer_calls: IntCounter,
    analyzer_failures: IntCounter,
    analyzer_latency: Histogram,
    incidents_opened: IntCounter,
    incidents_open: IntGauge,
    actions_executed: IntCounter,
    action_failures: IntCounter,
    containers_monitored: IntGauge,
}

impl MetricsInner {
    fn new() -> Self {
        Self {
            events_published: register_int_counter!(
                "sentinel_events_published_total",
                "Total events published on the bus"
            )
            .expect("register events_published_total"),
            events_dropped: register_int_counter!(
                "sentinel_events_dropped_total",
                "Events discarded from lossy subscriber queues"
            )
            .expect("register events_dropped_total"),
            log_lines: register_int_counter!(
                "sentinel_log_lines_total",
                "Log lines ingested across all containers"
            )
            .expect("register log_lines_total"),
            classifier_calls: register_int_counter!(
                "sentinel_classifier_calls_total",
                "Fast classifier invocations"
            )
            .expect("register classifier_calls_total"),
            classifier_failures: register_int_counter!(
                "sentinel_classifier_failures_total",
                "Fast classifier invocations that failed or timed out"
            )
            .expect("register classifier_failures_total"),
            classifier_latency: register_histogram!(
                "sentinel_classifier_latency_seconds",
                "Fast classifier round-trip latency",
                INFERENCE_BUCKETS.to_vec()
            )
            .expect("register classifier_latency_seconds"),
            analyzer_calls: register_int_counter!(
                "sentinel_analyzer_calls_total",
                "Deep analyzer invocations"
            )
            .expect("register analyzer_calls_total"),
            analyzer_failures: register_int_counter!(
                "sentinel_analyzer_failures_total",
                "Deep analyzer invocations that failed or timed out"
            )
            .expect("register analyzer_failures_total"),
            analyzer_latency: register_histogram!(
                "sentinel_analyzer_latency_seconds",
                "Deep analyzer round-trip latency",
                INFERENCE_BUCKETS.to_vec()
            )
            .expect("register analyzer_latency_seconds"),
            incidents_opened: register_int_counter!(
                "sentinel_incidents_total",
                "Incidents opened since startup"
            )
            .expect("register incidents_total"),
            incidents_open: register_int_gauge!(
                "sentinel_incidents_open",
                "Incidents currently in a non-terminal state"
            )
            .expect("register incidents_open"),
            actions_executed: register_int_counter!(
                "sentinel_actions_executed_total",
                "Remediation actions executed"
            )
            .expect("register actions_executed_total"),
            action_failures: register_int_counter!(
                "sentinel_action_failures_total",
                "Remediation actions that failed"
            )
            .expect("register action_failures_total"),
            containers_monitored: register_int_gauge!(
                "sentinel_containers_monitored",
                "Containers currently monitored"
            )
            .expect("register containers_monitored"),
        }
    }
}

/// Lightweight handle to the global metrics instance
#[derive(Clone)]
pub struct SentinelMetrics {
    _private: (),
}

impl Default for SentinelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SentinelMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(MetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &MetricsInner {
        GLOBAL_METRICS.get().expect("metrics not initialized")
    }

    pub fn inc_events_published(&self) {
        self.inner().events_published.inc();
    }

    pub fn inc_events_dropped(&self) {
        self.inner().events_dropped.inc();
    }

    pub fn inc_log_lines(&self) {
        self.inner().log_lines.inc();
    }

    pub fn observe_classifier(&self, latency_secs: f64, failed: bool) {
        let inner = self.inner();
        inner.classifier_calls.inc();
        inner.classifier_latency.observe(latency_secs);
        if failed {
            inner.classifier_failures.inc();
        }
    }

    pub fn observe_analyzer(&self, latency_secs: f64, failed: bool) {
        let inner = self.inner();
        inner.analyzer_calls.inc();
        inner.analyzer_latency.observe(latency_secs);
        if failed {
            inner.analyzer_failures.inc();
        }
    }

    pub fn incident_opened(&self) {
        self.inner().incidents_opened.inc();
        self.inner().incidents_open.inc();
    }

    pub fn incident_closed(&self) {
        self.inner().incidents_open.dec();
    }

    pub fn action_executed(&self, success: bool) {
        self.inner().actions_executed.inc();
        if !success {
            self.inner().action_failures.inc();
        }
    }

    pub fn set_containers_monitored(&self, count: i64) {
        self.inner().containers_monitored.set(count);
    }
}
