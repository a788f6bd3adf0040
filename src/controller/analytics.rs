//! Client for the external check-and-increment analytics service.
//!
//! The client is stateless: all session continuity lives in the opaque
//! `lastState` blob the service returns and the next request echoes back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::crd::experiment::{SuccessCriterion, TrafficSplit};

/// Wire path of the check-and-increment endpoint. Kept verbatim for
/// compatibility with deployed analytics services.
pub const CHECK_AND_INCREMENT_PATH: &str = "/api/v1/analytics/canary/check_and_increment";

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("analytics service unreachable: {0}")]
    Unreachable(String),

    #[error("analytics protocol error: {0}")]
    Protocol(String),
}

/// Descriptor of one workload version in the request
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct VersionDescriptor {
    pub name: String,
    pub namespace: String,

    #[serde(rename = "metricQueries", skip_serializing_if = "Vec::is_empty")]
    pub metric_queries: Vec<MetricQuery>,
}

/// Metric query material built from the synced metric definitions
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct MetricQuery {
    pub metric: String,

    #[serde(rename = "queryTemplate")]
    pub query_template: String,

    #[serde(rename = "sampleSizeTemplate")]
    pub sample_size_template: String,
}

#[derive(Serialize, Clone, Debug)]
pub struct AnalyticsRequest {
    pub name: String,
    pub namespace: String,

    /// Iteration the controller is about to apply
    pub iteration: i32,

    pub baseline: VersionDescriptor,
    pub candidate: VersionDescriptor,

    #[serde(rename = "successCriteria")]
    pub success_criteria: Vec<SuccessCriterion>,

    /// Session state from the previous response; absent on the first call
    #[serde(rename = "lastState", skip_serializing_if = "Option::is_none")]
    pub last_state: Option<Value>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct AnalyticsResponse {
    /// Split the service wants applied next
    #[serde(rename = "newTrafficSplit")]
    pub new_traffic_split: TrafficSplit,

    /// Opaque assessment payload, stashed into the experiment status
    #[serde(default)]
    pub assessment: Value,

    /// Opaque session state for the next request
    #[serde(rename = "lastState", default)]
    pub last_state: Value,

    /// Whether the success criteria currently hold
    #[serde(default)]
    pub success: bool,

    /// The service asks the experiment to stop (a stop-on-failure
    /// criterion fired, or it has seen enough)
    #[serde(default)]
    pub stop: bool,

    #[serde(default)]
    pub message: String,
}

/// Check-and-increment invocation. Production uses [`HttpAnalyticsClient`];
/// tests use [`MockAnalyticsClient`] with queued responses.
#[async_trait]
pub trait AnalyticsService: Send + Sync {
    /// One round trip to the analytics service. Transport failures map to
    /// `Unreachable`; a malformed body after a successful POST maps to
    /// `Protocol` and is treated as transient by the caller (no state
    /// advancement, retry at the next interval).
    async fn check_and_increment(
        &self,
        endpoint: &str,
        request: &AnalyticsRequest,
    ) -> Result<AnalyticsResponse, AnalyticsError>;
}

/// Production client speaking JSON over HTTP POST
pub struct HttpAnalyticsClient;

impl HttpAnalyticsClient {
    pub fn new() -> Self {
        HttpAnalyticsClient
    }

    fn url(endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            format!("{}{}", endpoint.trim_end_matches('/'), CHECK_AND_INCREMENT_PATH)
        } else {
            format!("http://{}{}", endpoint.trim_end_matches('/'), CHECK_AND_INCREMENT_PATH)
        }
    }
}

impl Default for HttpAnalyticsClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AnalyticsService for HttpAnalyticsClient {
    async fn check_and_increment(
        &self,
        endpoint: &str,
        request: &AnalyticsRequest,
    ) -> Result<AnalyticsResponse, AnalyticsError> {
        let client = reqwest::Client::new();

        let response = client
            .post(Self::url(endpoint))
            .json(request)
            .send()
            .await
            .map_err(|e| AnalyticsError::Unreachable(format!("POST failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AnalyticsError::Unreachable(format!(
                "analytics returned HTTP {}",
                status
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AnalyticsError::Protocol(format!("failed to read body: {}", e)))?;

        serde_json::from_str(&body)
            .map_err(|e| AnalyticsError::Protocol(format!("invalid response: {}", e)))
    }
}

/// Mock analytics client for tests.
///
/// Responses are queued FIFO; every request is recorded for assertions.
#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub struct MockAnalyticsClient {
    responses: std::sync::Mutex<Vec<Result<AnalyticsResponse, AnalyticsError>>>,
    requests: std::sync::Mutex<Vec<AnalyticsRequest>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockAnalyticsClient {
    pub fn new() -> Self {
        Self {
            responses: std::sync::Mutex::new(Vec::new()),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn enqueue(&self, response: AnalyticsResponse) {
        self.responses.lock().unwrap().push(Ok(response));
    }

    pub fn enqueue_error(&self, error: AnalyticsError) {
        self.responses.lock().unwrap().push(Err(error));
    }

    pub fn recorded_requests(&self) -> Vec<AnalyticsRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Convenience: a response carrying the given split
    pub fn response(baseline: i32, candidate: i32, success: bool, stop: bool) -> AnalyticsResponse {
        AnalyticsResponse {
            new_traffic_split: TrafficSplit::new(baseline, candidate),
            assessment: serde_json::json!({"criteria": []}),
            last_state: serde_json::json!({"round": candidate}),
            success,
            stop,
            message: String::new(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl AnalyticsService for MockAnalyticsClient {
    async fn check_and_increment(
        &self,
        _endpoint: &str,
        request: &AnalyticsRequest,
    ) -> Result<AnalyticsResponse, AnalyticsError> {
        self.requests.lock().unwrap().push(request.clone());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(AnalyticsError::Unreachable("no mock response queued".to_string()));
        }
        responses.remove(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::experiment::ToleranceType;

    fn request(last_state: Option<Value>) -> AnalyticsRequest {
        AnalyticsRequest {
            name: "reviews-experiment".to_string(),
            namespace: "default".to_string(),
            iteration: 0,
            baseline: VersionDescriptor {
                name: "reviews-v1".to_string(),
                namespace: "default".to_string(),
                metric_queries: vec![MetricQuery {
                    metric: "error_rate".to_string(),
                    query_template: "sum(rate(errors[1m]))".to_string(),
                    sample_size_template: "sum(rate(requests[1m]))".to_string(),
                }],
            },
            candidate: VersionDescriptor {
                name: "reviews-v2".to_string(),
                namespace: "default".to_string(),
                metric_queries: vec![],
            },
            success_criteria: vec![SuccessCriterion {
                metric_name: "error_rate".to_string(),
                tolerance_type: ToleranceType::Threshold,
                tolerance: 0.02,
                sample_size: 10,
                stop_on_failure: true,
            }],
            last_state,
        }
    }

    #[test]
    fn test_request_wire_names() {
        let json = serde_json::to_value(request(None)).unwrap();
        assert_eq!(json["name"], "reviews-experiment");
        assert_eq!(json["iteration"], 0);
        assert_eq!(json["baseline"]["metricQueries"][0]["queryTemplate"],
            "sum(rate(errors[1m]))");
        assert_eq!(json["successCriteria"][0]["metricName"], "error_rate");
        assert_eq!(json["successCriteria"][0]["toleranceType"], "threshold");
        assert_eq!(json["successCriteria"][0]["stopOnFailure"], true);
        // lastState is absent on the first call, not null.
        assert!(json.get("lastState").is_none());
    }

    #[test]
    fn test_request_echoes_last_state() {
        let state = serde_json::json!({"beta": [1.2, 3.4]});
        let json = serde_json::to_value(request(Some(state.clone()))).unwrap();
        assert_eq!(json["lastState"], state);
    }

    #[test]
    fn test_response_parses_with_defaults() {
        let response: AnalyticsResponse = serde_json::from_str(
            r#"{"newTrafficSplit": {"baseline": 75, "candidate": 25}}"#,
        )
        .unwrap();
        assert_eq!(response.new_traffic_split, TrafficSplit::new(75, 25));
        assert!(!response.success);
        assert!(!response.stop);
        assert!(response.assessment.is_null());
        assert!(response.message.is_empty());
    }

    #[test]
    fn test_response_full_payload() {
        let response: AnalyticsResponse = serde_json::from_str(
            r#"{
                "newTrafficSplit": {"baseline": 50, "candidate": 50},
                "assessment": {"summary": "all criteria met"},
                "lastState": {"round": 2},
                "success": true,
                "stop": false,
                "message": "ok"
            }"#,
        )
        .unwrap();
        assert!(response.success);
        assert_eq!(response.last_state["round"], 2);
        assert_eq!(response.message, "ok");
    }

    #[test]
    fn test_endpoint_url_building() {
        assert_eq!(
            HttpAnalyticsClient::url("analytics.koe-system:8080"),
            "http://analytics.koe-system:8080/api/v1/analytics/canary/check_and_increment"
        );
        assert_eq!(
            HttpAnalyticsClient::url("https://analytics.example.com/"),
            "https://analytics.example.com/api/v1/analytics/canary/check_and_increment"
        );
    }

    #[tokio::test]
    async fn test_mock_queue_is_fifo() {
        let mock = MockAnalyticsClient::new();
        mock.enqueue(MockAnalyticsClient::response(75, 25, true, false));
        mock.enqueue_error(AnalyticsError::Unreachable("503".to_string()));

        let first = mock
            .check_and_increment("analytics:8080", &request(None))
            .await
            .unwrap();
        assert_eq!(first.new_traffic_split.candidate, 25);

        let second = mock.check_and_increment("analytics:8080", &request(None)).await;
        assert!(matches!(second, Err(AnalyticsError::Unreachable(_))));

        assert_eq!(mock.recorded_requests().len(), 2);
    }
}
