use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// API version of a core Kubernetes target service (Deployment-backed).
pub const CORE_SERVICE_API: &str = "v1";

/// API version of a serverless target service (revision-backed).
pub const SERVERLESS_SERVICE_API: &str = "serving.knative.dev/v1alpha1";

/// Finalizer token owned by this controller. Stable across versions: the
/// token on an in-flight experiment must survive controller upgrades.
pub const FINALIZER: &str = "finalizer.koe.io";

/// Experiment is a Custom Resource describing one progressive-delivery
/// experiment: a baseline and a candidate workload behind a front-end
/// service, a traffic-control schedule, and the success criteria an
/// external analytics service evaluates each iteration.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "koe.io",
    version = "v1alpha1",
    kind = "Experiment",
    namespaced,
    status = "ExperimentStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Baseline", "type":"integer", "jsonPath":".status.trafficSplit.baseline"}"#,
    printcolumn = r#"{"name":"Candidate", "type":"integer", "jsonPath":".status.trafficSplit.candidate"}"#,
    printcolumn = r#"{"name":"Iteration", "type":"integer", "jsonPath":".status.currentIteration"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ExperimentSpec {
    /// The front-end service under experiment and its two workload versions
    #[serde(rename = "targetService")]
    pub target_service: TargetService,

    /// Schedule controlling how traffic shifts between versions
    #[serde(rename = "trafficControl", default)]
    pub traffic_control: TrafficControl,

    /// Analytics endpoint and the criteria it evaluates
    pub analysis: Analysis,

    /// What happens to the losing workload at completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupPolicy>,

    /// One-shot operator override. Consumed terminate actions are never
    /// cleared by the controller; the event filter rejects reversion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ExperimentAction>,

    /// Metric definitions synced from the metric store by the controller.
    /// Empty until the first successful sync.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, MetricDefinition>,
}

/// Reference to the service under experiment
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct TargetService {
    /// API family of the target: "v1" for core services backed by
    /// Deployments, "serving.knative.dev/v1alpha1" for serverless services
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Name of the front-end service
    pub name: String,

    /// Name of the baseline workload
    pub baseline: String,

    /// Name of the candidate workload
    pub candidate: String,
}

/// Supported workload API families
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiFamily {
    CoreService,
    ServerlessService,
}

impl ApiFamily {
    /// Map a targetService.apiVersion to its family, None if unsupported
    pub fn from_api_version(api_version: &str) -> Option<Self> {
        match api_version {
            CORE_SERVICE_API => Some(ApiFamily::CoreService),
            SERVERLESS_SERVICE_API => Some(ApiFamily::ServerlessService),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ApiFamily::CoreService => "core-service",
            ApiFamily::ServerlessService => "serverless-service",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct TrafficControl {
    /// Analytics strategy driving the traffic decisions
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Maximum number of analytics iterations before completion
    #[serde(rename = "maxIterations", default = "default_max_iterations")]
    pub max_iterations: i32,

    /// Wall-clock interval between iterations (e.g. "30s", "1m")
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Largest allowed change of the candidate percentage per iteration
    #[serde(rename = "trafficStepSize", default = "default_step_size")]
    pub traffic_step_size: f64,
}

fn default_strategy() -> String {
    "check_and_increment".to_string()
}

fn default_max_iterations() -> i32 {
    100
}

fn default_interval() -> String {
    "1m".to_string()
}

fn default_step_size() -> f64 {
    2.0
}

impl Default for TrafficControl {
    fn default() -> Self {
        TrafficControl {
            strategy: default_strategy(),
            max_iterations: default_max_iterations(),
            interval: default_interval(),
            traffic_step_size: default_step_size(),
        }
    }
}

impl TrafficControl {
    /// Parsed iteration interval, falling back to the default on a spec
    /// that slipped past validation
    pub fn interval_duration(&self) -> std::time::Duration {
        crate::controller::experiment::parse_duration(&self.interval)
            .unwrap_or(std::time::Duration::from_secs(60))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct Analysis {
    /// Endpoint of the check-and-increment analytics service
    #[serde(rename = "analyticsService")]
    pub analytics_service: String,

    /// Ordered criteria the analytics service evaluates each iteration
    #[serde(rename = "successCriteria", default)]
    pub success_criteria: Vec<SuccessCriterion>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct SuccessCriterion {
    /// Name of a metric definition from the metric store
    #[serde(rename = "metricName")]
    pub metric_name: String,

    /// How the tolerance is interpreted
    #[serde(rename = "toleranceType")]
    pub tolerance_type: ToleranceType,

    /// Tolerance value; a threshold bound or a relative delta
    pub tolerance: f64,

    /// Minimum sample size before the criterion is assessed
    #[serde(rename = "sampleSize", default = "default_sample_size")]
    pub sample_size: i32,

    /// Abort the experiment when this criterion fails
    #[serde(rename = "stopOnFailure", default)]
    pub stop_on_failure: bool,
}

fn default_sample_size() -> i32 {
    10
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub enum ToleranceType {
    #[serde(rename = "threshold")]
    Threshold,
    #[serde(rename = "delta")]
    Delta,
}

/// What happens to the losing workload when the experiment completes
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub enum CleanupPolicy {
    #[serde(rename = "delete")]
    Delete,
}

/// One-shot operator override written into spec.action
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ExperimentAction {
    /// Suspend progression without terminating
    #[serde(rename = "pause")]
    Pause,
    /// Resume a paused experiment
    #[serde(rename = "resume")]
    Resume,
    /// Terminate, declaring the baseline the winner
    #[serde(rename = "terminateSuccessWithBaseline")]
    TerminateSuccessWithBaseline,
    /// Terminate, declaring the candidate the winner
    #[serde(rename = "terminateSuccessWithCandidate")]
    TerminateSuccessWithCandidate,
    /// Abort; traffic returns to the baseline
    #[serde(rename = "terminateAbort")]
    TerminateAbort,
    /// Forced failure, used on finalization of a running experiment
    #[serde(rename = "terminateOverrideFailure")]
    TerminateOverrideFailure,
}

impl ExperimentAction {
    /// True for the terminate variants
    pub fn is_terminate(&self) -> bool {
        matches!(
            self,
            ExperimentAction::TerminateSuccessWithBaseline
                | ExperimentAction::TerminateSuccessWithCandidate
                | ExperimentAction::TerminateAbort
                | ExperimentAction::TerminateOverrideFailure
        )
    }
}

/// Metric definition synced from the metric store
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct MetricDefinition {
    /// Kind of signal this metric carries
    #[serde(rename = "metricType", default)]
    pub metric_type: MetricType,

    /// Query template evaluated by the analytics backend
    #[serde(rename = "queryTemplate")]
    pub query_template: String,

    /// Query template producing the metric's sample size
    #[serde(rename = "sampleSizeTemplate")]
    pub sample_size_template: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum MetricType {
    #[default]
    Performance,
    Correctness,
}

/// Lifecycle phase of an experiment
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ExperimentPhase {
    /// Waiting for targets and routing rules
    #[default]
    Initializing,
    /// Iterating: analytics calls and traffic shifts
    Progressing,
    /// Terminal; no further routing updates or analytics calls
    Completed,
}

/// Condition kinds tracked on the experiment status
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionKind {
    TargetsProvided,
    MetricsSynced,
    AnalyticsServiceNormal,
    RoutingRulesReady,
    ExperimentSucceeded,
    ExperimentCompleted,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ExperimentCondition {
    /// Which aspect of the experiment this condition reports
    pub kind: ConditionKind,

    pub status: ConditionStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Moves only when `status` changes, not on reason/message refreshes
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Percentage of ingress traffic per version; sums to 100 once routing
/// rules are installed, 0/0 before
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct TrafficSplit {
    #[serde(default)]
    pub baseline: i32,
    #[serde(default)]
    pub candidate: i32,
}

impl TrafficSplit {
    pub fn new(baseline: i32, candidate: i32) -> Self {
        TrafficSplit {
            baseline,
            candidate,
        }
    }

    pub fn sum(&self) -> i32 {
        self.baseline + self.candidate
    }
}

/// Digest of the most recent analytics response
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Assessment {
    /// Opaque assessment payload returned by the analytics service
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub summary: serde_json::Value,

    /// Whether the success criteria held at the last assessment
    #[serde(default)]
    pub success: bool,

    /// Whether the analytics service asked to stop the experiment
    #[serde(default)]
    pub stop: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Opaque session state echoed back on the next analytics request
    #[serde(rename = "lastState", skip_serializing_if = "Option::is_none")]
    pub last_state: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ExperimentStatus {
    #[serde(default)]
    pub phase: ExperimentPhase,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ExperimentCondition>,

    #[serde(rename = "trafficSplit", default)]
    pub traffic_split: TrafficSplit,

    /// Number of analytics responses applied so far
    #[serde(rename = "currentIteration", default)]
    pub current_iteration: i32,

    /// When the last iteration was applied (RFC3339); absent before the
    /// first progression so the first iteration runs immediately
    #[serde(rename = "lastIncrementTime", skip_serializing_if = "Option::is_none")]
    pub last_increment_time: Option<String>,

    /// Epoch seconds of first observation; 0 means never initialized
    #[serde(rename = "createTimestamp", default)]
    pub create_timestamp: i64,

    #[serde(rename = "endTimestamp", skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assessment: Option<Assessment>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExperimentStatus {
    /// First-sight initialization: Initializing phase, zero split, empty
    /// conditions, iteration 0
    pub fn init(&mut self, now: DateTime<Utc>) {
        self.phase = ExperimentPhase::Initializing;
        self.conditions.clear();
        self.traffic_split = TrafficSplit::default();
        self.current_iteration = 0;
        self.last_increment_time = None;
        self.create_timestamp = now.timestamp();
        self.end_timestamp = None;
        self.assessment = None;
        self.message = None;
    }

    pub fn condition(&self, kind: ConditionKind) -> Option<&ExperimentCondition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    pub fn condition_status(&self, kind: ConditionKind) -> ConditionStatus {
        self.condition(kind)
            .map(|c| c.status)
            .unwrap_or(ConditionStatus::Unknown)
    }

    pub fn condition_true(&self, kind: ConditionKind) -> bool {
        self.condition_status(kind) == ConditionStatus::True
    }

    /// Upsert a condition. The transition time only moves when the status
    /// value actually changes.
    pub fn set_condition(
        &mut self,
        kind: ConditionKind,
        status: ConditionStatus,
        reason: Option<&str>,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let reason = reason.map(str::to_string);
        let message = message.map(str::to_string);
        match self.conditions.iter_mut().find(|c| c.kind == kind) {
            Some(existing) => {
                if existing.status != status {
                    existing.status = status;
                    existing.last_transition_time = Some(now.to_rfc3339());
                }
                existing.reason = reason;
                existing.message = message;
            }
            None => self.conditions.push(ExperimentCondition {
                kind,
                status,
                reason,
                message,
                last_transition_time: Some(now.to_rfc3339()),
            }),
        }
    }

    /// Terminal check: once ExperimentCompleted=True no transitions occur
    pub fn is_complete(&self) -> bool {
        self.condition_true(ConditionKind::ExperimentCompleted)
    }

    pub fn succeeded(&self) -> bool {
        self.condition_true(ConditionKind::ExperimentSucceeded)
    }

    /// Parsed lastIncrementTime, None before the first progression
    pub fn last_increment(&self) -> Option<DateTime<Utc>> {
        self.last_increment_time
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

impl Experiment {
    /// True when the operator (or finalization) requested termination
    pub fn is_terminating(&self) -> bool {
        self.spec
            .action
            .map(|a| a.is_terminate())
            .unwrap_or(false)
    }

    pub fn is_paused(&self) -> bool {
        self.spec.action == Some(ExperimentAction::Pause)
    }

    /// Status, defaulting to an uninitialized one on first sight
    pub fn status_or_default(&self) -> ExperimentStatus {
        self.status.clone().unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "experiment_test.rs"]
mod tests;
