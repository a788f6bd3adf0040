//! Condition marking and requeue computation.
//!
//! Every user-visible outcome of a reconcile lands in a condition on the
//! experiment status; these helpers keep the reasons consistent.

use chrono::{DateTime, Utc};

use crate::crd::experiment::{
    ConditionKind, ConditionStatus, Experiment, ExperimentPhase, ExperimentStatus,
};

/// All three targets observed; an Initializing experiment starts
/// progressing.
pub fn mark_targets_provided(status: &mut ExperimentStatus, now: DateTime<Utc>) {
    status.set_condition(
        ConditionKind::TargetsProvided,
        ConditionStatus::True,
        None,
        None,
        now,
    );
    if status.phase == ExperimentPhase::Initializing {
        status.phase = ExperimentPhase::Progressing;
    }
}

/// TargetsProvided=False with a reason naming the missing key; the
/// experiment waits for a cluster event, not a requeue.
pub fn mark_targets_missing(status: &mut ExperimentStatus, missing: &str, now: DateTime<Utc>) {
    status.set_condition(
        ConditionKind::TargetsProvided,
        ConditionStatus::False,
        Some("TargetsNotFound"),
        Some(&format!("missing {}", missing)),
        now,
    );
}

/// Terminal: the spec can never reconcile as written
pub fn mark_spec_invalid(status: &mut ExperimentStatus, message: &str, now: DateTime<Utc>) {
    status.set_condition(
        ConditionKind::TargetsProvided,
        ConditionStatus::False,
        Some("SpecInvalid"),
        Some(message),
        now,
    );
    status.message = Some(message.to_string());
}

pub fn mark_metrics_synced(status: &mut ExperimentStatus, now: DateTime<Utc>) {
    status.set_condition(
        ConditionKind::MetricsSynced,
        ConditionStatus::True,
        None,
        None,
        now,
    );
}

pub fn mark_metrics_sync_error(status: &mut ExperimentStatus, error: &str, now: DateTime<Utc>) {
    status.set_condition(
        ConditionKind::MetricsSynced,
        ConditionStatus::False,
        Some("SyncFailed"),
        Some(error),
        now,
    );
}

pub fn mark_analytics_normal(status: &mut ExperimentStatus, now: DateTime<Utc>) {
    status.set_condition(
        ConditionKind::AnalyticsServiceNormal,
        ConditionStatus::True,
        None,
        None,
        now,
    );
}

/// No state advancement this tick; the interval requeue retries
pub fn mark_analytics_degraded(status: &mut ExperimentStatus, error: &str, now: DateTime<Utc>) {
    status.set_condition(
        ConditionKind::AnalyticsServiceNormal,
        ConditionStatus::False,
        Some("AnalyticsUnavailable"),
        Some(error),
        now,
    );
}

pub fn mark_routing_ready(status: &mut ExperimentStatus, now: DateTime<Utc>) {
    status.set_condition(
        ConditionKind::RoutingRulesReady,
        ConditionStatus::True,
        None,
        None,
        now,
    );
}

pub fn mark_routing_failed(status: &mut ExperimentStatus, error: &str, now: DateTime<Utc>) {
    status.set_condition(
        ConditionKind::RoutingRulesReady,
        ConditionStatus::False,
        Some("RoutingApplyFailure"),
        Some(error),
        now,
    );
}

/// Succeeded verdict carried along each applied iteration
pub fn mark_iteration_verdict(
    status: &mut ExperimentStatus,
    success: bool,
    stop: bool,
    now: DateTime<Utc>,
) {
    let verdict = if success {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    };
    let reason = if stop { "AnalyticsStop" } else { "IterationUpdate" };
    status.set_condition(
        ConditionKind::ExperimentSucceeded,
        verdict,
        Some(reason),
        None,
        now,
    );
}

/// Operator-declared verdict at termination, overriding whatever the
/// iterations recorded
pub fn mark_succeeded_override(status: &mut ExperimentStatus, success: bool, now: DateTime<Utc>) {
    let verdict = if success {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    };
    status.set_condition(
        ConditionKind::ExperimentSucceeded,
        verdict,
        Some("OperatorOverride"),
        None,
        now,
    );
}

/// The final routing update was attempted but failed; completion stays
/// Unknown and the next reconcile retries.
pub fn mark_completion_pending(status: &mut ExperimentStatus, error: &str, now: DateTime<Utc>) {
    status.set_condition(
        ConditionKind::ExperimentCompleted,
        ConditionStatus::Unknown,
        Some("RoutingUpdatePending"),
        Some(error),
        now,
    );
}

/// Terminal transition: phase=Completed, end timestamp recorded. After
/// this no routing updates or analytics calls happen for the experiment.
pub fn mark_completed(
    status: &mut ExperimentStatus,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    status.set_condition(
        ConditionKind::ExperimentCompleted,
        ConditionStatus::True,
        Some(reason),
        Some(message),
        now,
    );
    status.phase = ExperimentPhase::Completed;
    status.end_timestamp = Some(now.to_rfc3339());
    status.message = Some(message.to_string());
}

/// Requeue interval for an experiment that just progressed
pub fn requeue_after(experiment: &Experiment) -> std::time::Duration {
    experiment.spec.traffic_control.interval_duration()
}
