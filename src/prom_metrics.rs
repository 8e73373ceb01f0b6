//! # Prometheus Metrics — Exposition for Container Orchestration
//!
//! Exposes orchestrator operational metrics in the Prometheus text
//! exposition format for scraping at `GET /metrics`.
//!
//! ## Metrics Exposed
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `edgeorchestra_heartbeats_total` | Counter | — | Heartbeat requests processed |
//! | `edgeorchestra_submissions_total` | Counter | `outcome` | Gradient submissions by outcome |
//! | `edgeorchestra_rounds_total` | Counter | `outcome` | Rounds closed/aborted |
//! | `edgeorchestra_devices_connected` | Gauge | — | Devices currently live |
//! | `edgeorchestra_devices_training` | Gauge | — | Devices assigned to open rounds |
//! | `edgeorchestra_jobs_active` | Gauge | — | Jobs in `running` state |
//! | `edgeorchestra_cpu_usage_percent` | Gauge | — | Orchestrator CPU usage |
//! | `edgeorchestra_memory_usage_percent` | Gauge | — | Orchestrator memory usage |
//!
//! Gauges are refreshed by the server's 30-second background loop; counters
//! are bumped inline by the handlers that own the events.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicU64;

/// Label set for per-outcome counters (`accepted`, `rejected`, ...).
#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct OutcomeLabel {
    pub outcome: String,
}

impl OutcomeLabel {
    pub fn of(outcome: &str) -> Self {
        OutcomeLabel {
            outcome: outcome.to_string(),
        }
    }
}

/// Thread-safe metrics registry for the orchestrator.
///
/// All fields use atomic types and are safe to update from any task.
pub struct Metrics {
    pub registry: Registry,
    pub heartbeats: Counter,
    pub submissions: Family<OutcomeLabel, Counter>,
    pub rounds: Family<OutcomeLabel, Counter>,
    pub devices_connected: Gauge,
    pub devices_training: Gauge,
    pub jobs_active: Gauge,
    pub cpu_usage_percent: Gauge<f64, AtomicU64>,
    pub memory_usage_percent: Gauge<f64, AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let heartbeats = Counter::default();
        registry.register(
            "edgeorchestra_heartbeats",
            "Heartbeat requests processed",
            heartbeats.clone(),
        );

        let submissions = Family::<OutcomeLabel, Counter>::default();
        registry.register(
            "edgeorchestra_submissions",
            "Gradient submissions by outcome",
            submissions.clone(),
        );

        let rounds = Family::<OutcomeLabel, Counter>::default();
        registry.register(
            "edgeorchestra_rounds",
            "Training rounds by terminal outcome",
            rounds.clone(),
        );

        let devices_connected = Gauge::default();
        registry.register(
            "edgeorchestra_devices_connected",
            "Devices with a live heartbeat",
            devices_connected.clone(),
        );

        let devices_training = Gauge::default();
        registry.register(
            "edgeorchestra_devices_training",
            "Devices assigned to an open round",
            devices_training.clone(),
        );

        let jobs_active = Gauge::default();
        registry.register(
            "edgeorchestra_jobs_active",
            "Training jobs in running state",
            jobs_active.clone(),
        );

        let cpu_usage_percent = Gauge::<f64, AtomicU64>::default();
        registry.register(
            "edgeorchestra_cpu_usage_percent",
            "Orchestrator CPU usage percentage",
            cpu_usage_percent.clone(),
        );

        let memory_usage_percent = Gauge::<f64, AtomicU64>::default();
        registry.register(
            "edgeorchestra_memory_usage_percent",
            "Orchestrator memory usage percentage",
            memory_usage_percent.clone(),
        );

        Self {
            registry,
            heartbeats,
            submissions,
            rounds,
            devices_connected,
            devices_training,
            jobs_active,
            cpu_usage_percent,
            memory_usage_percent,
        }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        encode(&mut buf, &self.registry).expect("encoding metrics should not fail");
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_encode_returns_valid_text() {
        let m = Metrics::new();
        m.devices_connected.set(5);
        m.cpu_usage_percent.set(42.5);
        m.submissions.get_or_create(&OutcomeLabel::of("accepted")).inc();

        let output = m.encode();
        assert!(output.contains("edgeorchestra_devices_connected"));
        assert!(output.contains("edgeorchestra_cpu_usage_percent"));
        assert!(output.contains("edgeorchestra_submissions"));
        assert!(output.contains("accepted"));
    }

    #[test]
    fn metrics_default_values_are_zero() {
        let m = Metrics::new();
        let output = m.encode();
        assert!(output.contains("edgeorchestra_devices_connected"));
        assert!(output.contains("edgeorchestra_jobs_active"));
    }

    #[test]
    fn per_outcome_counters_independent() {
        let m = Metrics::new();
        m.rounds.get_or_create(&OutcomeLabel::of("closed")).inc_by(3);
        m.rounds.get_or_create(&OutcomeLabel::of("aborted")).inc_by(7);

        let output = m.encode();
        assert!(output.contains("closed"));
        assert!(output.contains("aborted"));
    }
}
