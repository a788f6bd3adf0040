use crate::crd::experiment::{ApiFamily, Experiment};
use std::time::Duration;

/// Validate an Experiment spec beyond what the CRD schema enforces.
///
/// A failure here is terminal for the experiment: the condition carries
/// the message and the record is never requeued.
///
/// # Validation Rules
/// - `targetService.apiVersion` must name a supported family
/// - `targetService` names cannot be empty, and baseline ≠ candidate
/// - `trafficControl.maxIterations` must be ≥ 1
/// - `trafficControl.interval` must parse to a positive duration
/// - `trafficControl.trafficStepSize` must be in (0, 100]
/// - `analysis.analyticsService` cannot be empty
/// - every success criterion needs a metric name and sampleSize ≥ 1
pub fn validate_experiment(experiment: &Experiment) -> Result<(), String> {
    let target = &experiment.spec.target_service;
    if ApiFamily::from_api_version(&target.api_version).is_none() {
        return Err(format!(
            "spec.targetService.apiVersion '{}' is not a supported API family",
            target.api_version
        ));
    }
    if target.name.is_empty() {
        return Err("spec.targetService.name cannot be empty".to_string());
    }
    if target.baseline.is_empty() {
        return Err("spec.targetService.baseline cannot be empty".to_string());
    }
    if target.candidate.is_empty() {
        return Err("spec.targetService.candidate cannot be empty".to_string());
    }
    if target.baseline == target.candidate {
        return Err(format!(
            "spec.targetService baseline and candidate are both '{}'",
            target.baseline
        ));
    }

    let traffic = &experiment.spec.traffic_control;
    if traffic.max_iterations < 1 {
        return Err(format!(
            "spec.trafficControl.maxIterations must be >= 1, got {}",
            traffic.max_iterations
        ));
    }
    if parse_duration(&traffic.interval).is_none() {
        return Err(format!(
            "spec.trafficControl.interval invalid: {}",
            traffic.interval
        ));
    }
    if !(traffic.traffic_step_size > 0.0 && traffic.traffic_step_size <= 100.0) {
        return Err(format!(
            "spec.trafficControl.trafficStepSize must be in (0, 100], got {}",
            traffic.traffic_step_size
        ));
    }

    if experiment.spec.analysis.analytics_service.is_empty() {
        return Err("spec.analysis.analyticsService cannot be empty".to_string());
    }
    for (i, criterion) in experiment.spec.analysis.success_criteria.iter().enumerate() {
        if criterion.metric_name.is_empty() {
            return Err(format!("successCriteria[{}].metricName is required", i));
        }
        if criterion.sample_size < 1 {
            return Err(format!(
                "successCriteria[{}].sampleSize must be >= 1, got {}",
                i, criterion.sample_size
            ));
        }
    }

    Ok(())
}

/// Parse a duration string like "30s", "5m", "2h".
///
/// Zero durations are rejected, as are values that only make sense as a
/// typo (seconds or minutes beyond 24h, hours beyond a week).
pub fn parse_duration(duration_str: &str) -> Option<Duration> {
    let duration_str = duration_str.trim();
    if duration_str.is_empty() {
        return None;
    }

    let unit = duration_str.chars().last()?;
    let number_str = &duration_str[..duration_str.len() - 1];
    let number: u64 = number_str.parse().ok()?;
    if number == 0 {
        return None;
    }

    match unit {
        's' if number <= 86400 => Some(Duration::from_secs(number)),
        'm' if number <= 1440 => number.checked_mul(60).map(Duration::from_secs),
        'h' if number <= 168 => number.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}
