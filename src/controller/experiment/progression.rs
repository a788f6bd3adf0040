//! The progression engine: interval gating, analytics iterations,
//! completion and stable-target selection.
//!
//! Everything here operates on in-memory status plus the injected
//! collaborator traits; persistence stays with the reconcile loop so each
//! step is safe to repeat.

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use thiserror::Error;
use tracing::warn;

use crate::controller::analytics::{
    AnalyticsError, AnalyticsRequest, AnalyticsResponse, AnalyticsService, MetricQuery,
    VersionDescriptor,
};
use crate::controller::notification::{ExperimentEvent, NotificationSink};
use crate::controller::routing::{RoutingAdapter, RoutingError};
use crate::controller::targets::{TargetError, TargetObserver};
use crate::crd::experiment::{
    ApiFamily, Assessment, CleanupPolicy, Experiment, ExperimentAction, ExperimentStatus,
    TrafficSplit,
};

use super::status::{
    mark_analytics_normal, mark_completed, mark_iteration_verdict, mark_routing_ready,
    mark_succeeded_override,
};

/// Why an experiment reached completion
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionReason {
    OperatorAction(ExperimentAction),
    MaxIterationsReached,
    AnalyticsStop,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionReason::OperatorAction(_) => "OperatorAction",
            CompletionReason::MaxIterationsReached => "MaxIterationsReached",
            CompletionReason::AnalyticsStop => "AnalyticsStop",
        }
    }
}

/// The workload receiving 100% of traffic at completion
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StableTarget {
    Baseline,
    Candidate,
}

impl StableTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            StableTarget::Baseline => "baseline",
            StableTarget::Candidate => "candidate",
        }
    }

    pub fn final_split(&self) -> TrafficSplit {
        match self {
            StableTarget::Baseline => TrafficSplit::new(100, 0),
            StableTarget::Candidate => TrafficSplit::new(0, 100),
        }
    }

    /// Workload name of the stable side
    pub fn workload<'a>(&self, experiment: &'a Experiment) -> &'a str {
        match self {
            StableTarget::Baseline => &experiment.spec.target_service.baseline,
            StableTarget::Candidate => &experiment.spec.target_service.candidate,
        }
    }

    /// Workload name of the losing side
    pub fn other_workload<'a>(&self, experiment: &'a Experiment) -> &'a str {
        match self {
            StableTarget::Baseline => &experiment.spec.target_service.candidate,
            StableTarget::Candidate => &experiment.spec.target_service.baseline,
        }
    }
}

/// Outcome of one applied analytics response
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IterationOutcome {
    pub new_split: TrafficSplit,
    pub success: bool,
    pub stop: bool,
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Target(#[from] TargetError),
}

/// Progress gate: a terminate action skips straight to completion, pause
/// suspends, otherwise one iteration runs per interval. The first
/// iteration (no lastIncrementTime yet) runs immediately.
pub fn should_progress(
    experiment: &Experiment,
    status: &ExperimentStatus,
    now: DateTime<Utc>,
) -> bool {
    if experiment.is_terminating() || experiment.is_paused() {
        return false;
    }
    match status.last_increment() {
        None => true,
        Some(last) => {
            let interval = chrono::Duration::from_std(
                experiment.spec.traffic_control.interval_duration(),
            )
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
            now >= last + interval
        }
    }
}

/// Bound a requested split so the candidate share moves at most
/// `trafficStepSize` points from the current split. Splits are integral;
/// a fractional step size bounds by its floor.
pub fn clamp_split(current: TrafficSplit, requested: TrafficSplit, step_size: f64) -> TrafficSplit {
    let step = step_size.max(0.0).floor() as i32;
    let delta = (requested.candidate - current.candidate).clamp(-step, step);
    let candidate = (current.candidate + delta).clamp(0, 100);
    TrafficSplit::new(100 - candidate, candidate)
}

/// Build the check-and-increment request for the next iteration. Metric
/// queries come from the synced definitions; lastState is echoed from the
/// previous assessment and absent on the first call.
pub fn build_analytics_request(
    experiment: &Experiment,
    status: &ExperimentStatus,
) -> AnalyticsRequest {
    let namespace = experiment.namespace().unwrap_or_default();
    let target = &experiment.spec.target_service;

    let queries: Vec<MetricQuery> = experiment
        .spec
        .analysis
        .success_criteria
        .iter()
        .filter_map(|criterion| {
            experiment
                .spec
                .metrics
                .get(&criterion.metric_name)
                .map(|definition| MetricQuery {
                    metric: criterion.metric_name.clone(),
                    query_template: definition.query_template.clone(),
                    sample_size_template: definition.sample_size_template.clone(),
                })
        })
        .collect();

    AnalyticsRequest {
        name: experiment.name_any(),
        namespace: namespace.clone(),
        iteration: status.current_iteration,
        baseline: VersionDescriptor {
            name: target.baseline.clone(),
            namespace: namespace.clone(),
            metric_queries: queries.clone(),
        },
        candidate: VersionDescriptor {
            name: target.candidate.clone(),
            namespace,
            metric_queries: queries,
        },
        success_criteria: experiment.spec.analysis.success_criteria.clone(),
        last_state: status
            .assessment
            .as_ref()
            .and_then(|a| a.last_state.clone()),
    }
}

/// Fold one analytics response into the status: clamped split, iteration
/// +1, increment timestamp, stashed assessment and verdict.
pub fn apply_response(
    experiment: &Experiment,
    status: &mut ExperimentStatus,
    response: &AnalyticsResponse,
    now: DateTime<Utc>,
) -> IterationOutcome {
    let new_split = clamp_split(
        status.traffic_split,
        response.new_traffic_split,
        experiment.spec.traffic_control.traffic_step_size,
    );

    status.traffic_split = new_split;
    status.current_iteration += 1;
    status.last_increment_time = Some(now.to_rfc3339());
    status.assessment = Some(Assessment {
        summary: response.assessment.clone(),
        success: response.success,
        stop: response.stop,
        message: (!response.message.is_empty()).then(|| response.message.clone()),
        last_state: (!response.last_state.is_null()).then(|| response.last_state.clone()),
    });

    mark_analytics_normal(status, now);
    mark_iteration_verdict(status, response.success, response.stop, now);

    IterationOutcome {
        new_split,
        success: response.success,
        stop: response.stop,
    }
}

/// One analytics round trip plus response application. The caller has
/// already checked the progress gate; errors leave the status untouched
/// apart from the caller marking the analytics condition.
pub async fn run_iteration(
    experiment: &Experiment,
    status: &mut ExperimentStatus,
    analytics: &dyn AnalyticsService,
    now: DateTime<Utc>,
) -> Result<IterationOutcome, AnalyticsError> {
    let request = build_analytics_request(experiment, status);
    let response = analytics
        .check_and_increment(&experiment.spec.analysis.analytics_service, &request)
        .await?;
    Ok(apply_response(experiment, status, &response, now))
}

/// Ensure routing rules exist and match the recorded split.
///
/// Creation installs the recorded split (baseline=100 before the first
/// iteration); an installed split that disagrees with the status (a
/// restart between the status write and the routing write) is re-applied
/// without advancing the iteration.
pub async fn ensure_routing(
    experiment: &Experiment,
    status: &mut ExperimentStatus,
    routing: &dyn RoutingAdapter,
    now: DateTime<Utc>,
) -> Result<(), RoutingError> {
    let desired = if status.traffic_split.sum() == 100 {
        status.traffic_split
    } else {
        TrafficSplit::new(100, 0)
    };

    let check = routing.ensure_rules(experiment, desired).await?;
    if check.created {
        status.traffic_split = desired;
    } else if check.observed != desired {
        routing.apply_split(experiment, desired).await?;
        status.traffic_split = desired;
    }

    mark_routing_ready(status, now);
    Ok(())
}

/// Completion test, in precedence order: operator terminate action,
/// iteration limit reached, analytics stop signal.
pub fn completion_reason(
    experiment: &Experiment,
    status: &ExperimentStatus,
) -> Option<CompletionReason> {
    if let Some(action) = experiment.spec.action {
        if action.is_terminate() {
            return Some(CompletionReason::OperatorAction(action));
        }
    }
    if status.current_iteration >= experiment.spec.traffic_control.max_iterations {
        return Some(CompletionReason::MaxIterationsReached);
    }
    if status.assessment.as_ref().map(|a| a.stop).unwrap_or(false) {
        return Some(CompletionReason::AnalyticsStop);
    }
    None
}

/// Pick the workload that takes 100% of traffic at completion
pub fn stable_target(experiment: &Experiment, status: &ExperimentStatus) -> StableTarget {
    match experiment.spec.action {
        Some(ExperimentAction::TerminateSuccessWithBaseline) => StableTarget::Baseline,
        Some(ExperimentAction::TerminateSuccessWithCandidate) => StableTarget::Candidate,
        Some(ExperimentAction::TerminateAbort)
        | Some(ExperimentAction::TerminateOverrideFailure) => StableTarget::Baseline,
        _ => {
            if status.succeeded() {
                StableTarget::Candidate
            } else {
                StableTarget::Baseline
            }
        }
    }
}

/// Terminate the experiment.
///
/// The final routing update is attempted before ExperimentCompleted ever
/// turns True; a failure leaves the condition for the caller to mark
/// Unknown and the next reconcile retries the whole step. Cleanup deletes
/// the losing workload (not-found is success) and tears the routing rules
/// down; the stable workload is never touched.
pub async fn complete_experiment(
    experiment: &Experiment,
    status: &mut ExperimentStatus,
    reason: CompletionReason,
    family: ApiFamily,
    routing: &dyn RoutingAdapter,
    targets: &dyn TargetObserver,
    notifier: &dyn NotificationSink,
    now: DateTime<Utc>,
) -> Result<StableTarget, CompletionError> {
    let stable = stable_target(experiment, status);
    let final_split = stable.final_split();

    routing.apply_split(experiment, final_split).await?;
    status.traffic_split = final_split;

    if experiment.spec.cleanup == Some(CleanupPolicy::Delete) {
        targets
            .delete_workload(experiment, family, stable.other_workload(experiment))
            .await?;
        routing.teardown(experiment).await?;
    }

    // Operator verdicts override whatever the iterations recorded.
    let succeeded = match reason {
        CompletionReason::OperatorAction(ExperimentAction::TerminateSuccessWithBaseline)
        | CompletionReason::OperatorAction(ExperimentAction::TerminateSuccessWithCandidate) => {
            mark_succeeded_override(status, true, now);
            true
        }
        CompletionReason::OperatorAction(_) => {
            mark_succeeded_override(status, false, now);
            false
        }
        _ => status.succeeded(),
    };

    let message = format!("stable target is {}", stable.as_str());
    mark_completed(status, reason.as_str(), &message, now);

    let aborted = matches!(
        reason,
        CompletionReason::OperatorAction(ExperimentAction::TerminateAbort)
            | CompletionReason::OperatorAction(ExperimentAction::TerminateOverrideFailure)
    );
    let event = if aborted {
        ExperimentEvent::aborted(experiment, stable.as_str(), now)
    } else {
        ExperimentEvent::completed(experiment, stable.as_str(), succeeded, now)
    };
    if let Err(e) = notifier.publish(&event).await {
        warn!(experiment = ?experiment.name_any(), error = %e, "Failed to publish completion event (non-fatal)");
    }

    Ok(stable)
}
