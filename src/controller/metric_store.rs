//! Metric-definition loading.
//!
//! Success criteria name metrics by reference; the definitions (query
//! templates) live outside the experiment record and are synced into
//! `spec.metrics` once per experiment.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use thiserror::Error;

use crate::crd::experiment::MetricDefinition;

#[derive(Debug, Error)]
pub enum MetricStoreError {
    #[error("metric store unavailable: {0}")]
    Api(#[from] kube::Error),

    #[error("metric {0} is not defined in the metric store")]
    Missing(String),

    #[error("metric {0} is malformed: {1}")]
    Malformed(String, String),
}

/// Loads metric definitions by name. Production reads a ConfigMap; tests
/// use [`MockMetricStore`].
#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn load(
        &self,
        names: &[String],
    ) -> Result<BTreeMap<String, MetricDefinition>, MetricStoreError>;
}

/// Pick and decode the requested definitions out of raw config data.
/// Each value is the JSON encoding of one [`MetricDefinition`].
pub fn parse_definitions(
    data: &BTreeMap<String, String>,
    names: &[String],
) -> Result<BTreeMap<String, MetricDefinition>, MetricStoreError> {
    let mut definitions = BTreeMap::new();
    for name in names {
        let raw = data
            .get(name)
            .ok_or_else(|| MetricStoreError::Missing(name.clone()))?;
        let definition: MetricDefinition = serde_json::from_str(raw)
            .map_err(|e| MetricStoreError::Malformed(name.clone(), e.to_string()))?;
        definitions.insert(name.clone(), definition);
    }
    Ok(definitions)
}

/// Production store backed by a ConfigMap in the controller namespace.
///
/// Configuration from environment variables:
/// - KOE_METRICS_CONFIGMAP: ConfigMap holding the definitions (default: koe-metrics)
/// - KOE_NAMESPACE: namespace of that ConfigMap (default: koe-system)
pub struct ConfigMapMetricStore {
    client: kube::Client,
    namespace: String,
    name: String,
}

impl ConfigMapMetricStore {
    pub fn new(client: kube::Client, namespace: String, name: String) -> Self {
        Self {
            client,
            namespace,
            name,
        }
    }

    pub fn from_env(client: kube::Client) -> Self {
        let namespace =
            std::env::var("KOE_NAMESPACE").unwrap_or_else(|_| "koe-system".to_string());
        let name =
            std::env::var("KOE_METRICS_CONFIGMAP").unwrap_or_else(|_| "koe-metrics".to_string());
        Self::new(client, namespace, name)
    }
}

#[async_trait]
impl MetricStore for ConfigMapMetricStore {
    async fn load(
        &self,
        names: &[String],
    ) -> Result<BTreeMap<String, MetricDefinition>, MetricStoreError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let configmap = api.get(&self.name).await?;
        let data = configmap.data.unwrap_or_default();
        parse_definitions(&data, names)
    }
}

/// Mock store serving definitions from memory
#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub struct MockMetricStore {
    data: BTreeMap<String, String>,
    fail: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockMetricStore {
    pub fn new() -> Self {
        Self {
            data: BTreeMap::new(),
            fail: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn with_metric(mut self, name: &str) -> Self {
        self.data.insert(
            name.to_string(),
            serde_json::json!({
                "metricType": "Correctness",
                "queryTemplate": format!("sum(rate({}[1m]))", name),
                "sampleSizeTemplate": "sum(rate(requests[1m]))"
            })
            .to_string(),
        );
        self
    }

    pub fn fail_next(&self) {
        self.fail.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl MetricStore for MockMetricStore {
    async fn load(
        &self,
        names: &[String],
    ) -> Result<BTreeMap<String, MetricDefinition>, MetricStoreError> {
        if self.fail.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return Err(MetricStoreError::Api(kube::Error::Api(
                kube::core::ErrorResponse {
                    status: "Failure".to_string(),
                    message: "injected".to_string(),
                    reason: "ServiceUnavailable".to_string(),
                    code: 503,
                },
            )));
        }
        parse_definitions(&self.data, names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_definitions_picks_requested() {
        let mut data = BTreeMap::new();
        data.insert(
            "error_rate".to_string(),
            r#"{"queryTemplate": "q", "sampleSizeTemplate": "s"}"#.to_string(),
        );
        data.insert(
            "latency_p99".to_string(),
            r#"{"queryTemplate": "q2", "sampleSizeTemplate": "s2"}"#.to_string(),
        );

        let defs = parse_definitions(&data, &["error_rate".to_string()]).unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs["error_rate"].query_template, "q");
    }

    #[test]
    fn test_parse_definitions_missing_metric() {
        let data = BTreeMap::new();
        let err = parse_definitions(&data, &["error_rate".to_string()]).unwrap_err();
        assert!(matches!(err, MetricStoreError::Missing(name) if name == "error_rate"));
    }

    #[test]
    fn test_parse_definitions_malformed_payload() {
        let mut data = BTreeMap::new();
        data.insert("error_rate".to_string(), "not json".to_string());
        let err = parse_definitions(&data, &["error_rate".to_string()]).unwrap_err();
        assert!(matches!(err, MetricStoreError::Malformed(name, _) if name == "error_rate"));
    }

    #[tokio::test]
    async fn test_mock_store_round_trip() {
        let store = MockMetricStore::new().with_metric("error_rate");
        let defs = store.load(&["error_rate".to_string()]).await.unwrap();
        assert_eq!(
            defs["error_rate"].metric_type,
            crate::crd::experiment::MetricType::Correctness
        );
    }
}
