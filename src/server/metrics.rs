//! Prometheus metrics describing the controller itself.
//!
//! Experiment-level analytics live in the external analytics service;
//! these gauges and counters only cover the control loop.

use std::sync::Arc;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::crd::experiment::TrafficSplit;

/// Cheaply cloneable handle shared by the reconcile loop and the
/// /metrics endpoint
#[derive(Clone)]
pub struct SharedMetrics {
    inner: Arc<Metrics>,
}

struct Metrics {
    registry: Registry,
    reconciles: IntCounterVec,
    reconcile_errors: IntCounter,
    reconcile_duration: HistogramVec,
    traffic_split: IntGaugeVec,
}

/// Build and register the controller metrics
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    let registry = Registry::new();

    let reconciles = IntCounterVec::new(
        Opts::new("koe_reconciles_total", "Completed reconciles per API family"),
        &["family"],
    )?;
    let reconcile_errors = IntCounter::new(
        "koe_reconcile_errors_total",
        "Reconciles that returned an error to the dispatcher",
    )?;
    let reconcile_duration = HistogramVec::new(
        HistogramOpts::new(
            "koe_reconcile_duration_seconds",
            "Wall-clock duration of successful reconciles",
        ),
        &["family"],
    )?;
    let traffic_split = IntGaugeVec::new(
        Opts::new(
            "koe_traffic_split_percent",
            "Current traffic percentage per experiment version",
        ),
        &["namespace", "experiment", "version"],
    )?;

    registry.register(Box::new(reconciles.clone()))?;
    registry.register(Box::new(reconcile_errors.clone()))?;
    registry.register(Box::new(reconcile_duration.clone()))?;
    registry.register(Box::new(traffic_split.clone()))?;

    Ok(SharedMetrics {
        inner: Arc::new(Metrics {
            registry,
            reconciles,
            reconcile_errors,
            reconcile_duration,
            traffic_split,
        }),
    })
}

impl SharedMetrics {
    pub fn record_reconcile_success(&self, family: &str, duration_secs: f64) {
        self.inner.reconciles.with_label_values(&[family]).inc();
        self.inner
            .reconcile_duration
            .with_label_values(&[family])
            .observe(duration_secs);
    }

    pub fn record_reconcile_error(&self) {
        self.inner.reconcile_errors.inc();
    }

    pub fn set_traffic_split(&self, namespace: &str, experiment: &str, split: TrafficSplit) {
        self.inner
            .traffic_split
            .with_label_values(&[namespace, experiment, "baseline"])
            .set(i64::from(split.baseline));
        self.inner
            .traffic_split
            .with_label_values(&[namespace, experiment, "candidate"])
            .set(i64::from(split.candidate));
    }

    /// Render the registry in Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| prometheus::Error::Msg(format!("metrics not utf-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_record_and_encode() {
        let metrics = create_metrics().unwrap();
        metrics.record_reconcile_success("core-service", 0.05);
        metrics.record_reconcile_error();
        metrics.set_traffic_split("default", "reviews-exp", TrafficSplit::new(75, 25));

        let text = metrics.encode().unwrap();
        assert!(text.contains("koe_reconciles_total"));
        assert!(text.contains("koe_reconcile_errors_total 1"));
        assert!(text.contains("koe_traffic_split_percent"));
        assert!(text.contains(r#"version="candidate""#));
    }
}
