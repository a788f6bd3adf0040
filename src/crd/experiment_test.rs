use super::*;
use chrono::TimeZone;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

#[test]
fn test_traffic_control_defaults() {
    let tc: TrafficControl = serde_json::from_str("{}").unwrap();
    assert_eq!(tc.strategy, "check_and_increment");
    assert_eq!(tc.max_iterations, 100);
    assert_eq!(tc.interval, "1m");
    assert_eq!(tc.traffic_step_size, 2.0);
    assert_eq!(tc.interval_duration(), std::time::Duration::from_secs(60));
}

#[test]
fn test_api_family_mapping() {
    assert_eq!(
        ApiFamily::from_api_version("v1"),
        Some(ApiFamily::CoreService)
    );
    assert_eq!(
        ApiFamily::from_api_version("serving.knative.dev/v1alpha1"),
        Some(ApiFamily::ServerlessService)
    );
    assert_eq!(ApiFamily::from_api_version("apps/v1"), None);
    assert_eq!(ApiFamily::from_api_version(""), None);
}

#[test]
fn test_action_terminate_variants() {
    assert!(!ExperimentAction::Pause.is_terminate());
    assert!(!ExperimentAction::Resume.is_terminate());
    assert!(ExperimentAction::TerminateSuccessWithBaseline.is_terminate());
    assert!(ExperimentAction::TerminateSuccessWithCandidate.is_terminate());
    assert!(ExperimentAction::TerminateAbort.is_terminate());
    assert!(ExperimentAction::TerminateOverrideFailure.is_terminate());
}

#[test]
fn test_action_wire_names() {
    // The action field is the operator surface; its wire names are stable.
    let action: ExperimentAction = serde_json::from_str(r#""terminateAbort""#).unwrap();
    assert_eq!(action, ExperimentAction::TerminateAbort);
    assert_eq!(
        serde_json::to_string(&ExperimentAction::Pause).unwrap(),
        r#""pause""#
    );
}

#[test]
fn test_status_init_resets_everything() {
    let mut status = ExperimentStatus {
        phase: ExperimentPhase::Progressing,
        traffic_split: TrafficSplit::new(60, 40),
        current_iteration: 4,
        last_increment_time: Some(now().to_rfc3339()),
        ..Default::default()
    };
    status.set_condition(
        ConditionKind::TargetsProvided,
        ConditionStatus::True,
        None,
        None,
        now(),
    );

    status.init(now());

    assert_eq!(status.phase, ExperimentPhase::Initializing);
    assert_eq!(status.traffic_split, TrafficSplit::default());
    assert_eq!(status.current_iteration, 0);
    assert!(status.conditions.is_empty());
    assert!(status.last_increment_time.is_none());
    assert_eq!(status.create_timestamp, now().timestamp());
}

#[test]
fn test_condition_transition_time_only_moves_on_status_change() {
    let mut status = ExperimentStatus::default();
    let t0 = now();
    let t1 = t0 + chrono::Duration::seconds(30);
    let t2 = t1 + chrono::Duration::seconds(30);

    status.set_condition(
        ConditionKind::TargetsProvided,
        ConditionStatus::False,
        Some("BaselineMissing"),
        None,
        t0,
    );
    let first = status
        .condition(ConditionKind::TargetsProvided)
        .unwrap()
        .last_transition_time
        .clone();

    // Same status, fresher reason: transition time must not move.
    status.set_condition(
        ConditionKind::TargetsProvided,
        ConditionStatus::False,
        Some("CandidateMissing"),
        None,
        t1,
    );
    let cond = status.condition(ConditionKind::TargetsProvided).unwrap();
    assert_eq!(cond.last_transition_time, first);
    assert_eq!(cond.reason.as_deref(), Some("CandidateMissing"));

    // Status flips: transition time moves.
    status.set_condition(
        ConditionKind::TargetsProvided,
        ConditionStatus::True,
        None,
        None,
        t2,
    );
    let cond = status.condition(ConditionKind::TargetsProvided).unwrap();
    assert_eq!(cond.last_transition_time, Some(t2.to_rfc3339()));
}

#[test]
fn test_unset_condition_reads_unknown() {
    let status = ExperimentStatus::default();
    assert_eq!(
        status.condition_status(ConditionKind::ExperimentCompleted),
        ConditionStatus::Unknown
    );
    assert!(!status.is_complete());
    assert!(!status.succeeded());
}

#[test]
fn test_spec_parses_with_defaults() {
    let spec: ExperimentSpec = serde_json::from_value(serde_json::json!({
        "targetService": {
            "apiVersion": "v1",
            "name": "reviews",
            "baseline": "reviews-v1",
            "candidate": "reviews-v2"
        },
        "analysis": {
            "analyticsService": "analytics.koe-system:8080",
            "successCriteria": [{
                "metricName": "error_rate",
                "toleranceType": "threshold",
                "tolerance": 0.02
            }]
        }
    }))
    .unwrap();

    assert_eq!(spec.traffic_control.max_iterations, 100);
    assert!(spec.cleanup.is_none());
    assert!(spec.action.is_none());
    assert!(spec.metrics.is_empty());
    let criterion = &spec.analysis.success_criteria[0];
    assert_eq!(criterion.sample_size, 10);
    assert!(!criterion.stop_on_failure);
}
