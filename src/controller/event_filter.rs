//! Admission predicates for cluster events.
//!
//! The dispatcher only wakes for events that can change the outcome of a
//! reconcile. Workload events go through the IndexCache mark functions,
//! which double as presence-transition dedup; experiment updates are
//! compared against the previously observed version so that the
//! controller's own writes (finalizer addition, metric sync) and operator
//! action reversion do not produce wake-ups.

use std::collections::HashMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Event;
use kube::ResourceExt;
use tracing::debug;

use crate::controller::index_cache::{IndexCache, ObjectKey};
use crate::crd::experiment::Experiment;

/// The fields whose transitions decide admission
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExperimentSnapshot {
    pub generation: Option<i64>,
    pub finalizer_count: usize,
    pub has_action: bool,
    pub metrics_count: usize,
    pub deleting: bool,
}

impl ExperimentSnapshot {
    pub fn of(experiment: &Experiment) -> Self {
        ExperimentSnapshot {
            generation: experiment.metadata.generation,
            finalizer_count: experiment
                .metadata
                .finalizers
                .as_ref()
                .map(Vec::len)
                .unwrap_or(0),
            has_action: experiment.spec.action.is_some(),
            metrics_count: experiment.spec.metrics.len(),
            deleting: experiment.metadata.deletion_timestamp.is_some(),
        }
    }
}

/// Pure admission rule for an experiment update.
///
/// Rejected: finalizer addition from none, operator action cleared,
/// first-time metrics population, and status-only changes (no generation
/// move). Deletion always admits; any other generation change admits.
pub fn admit_update(prev: &ExperimentSnapshot, next: &ExperimentSnapshot) -> bool {
    if next.deleting && !prev.deleting {
        return true;
    }
    if prev.finalizer_count == 0 && next.finalizer_count > 0 {
        debug!("experiment update rejected: finalizer added");
        return false;
    }
    if prev.has_action && !next.has_action {
        // One-shot action consumption; a reversion must not re-trigger.
        debug!("experiment update rejected: action reverted");
        return false;
    }
    if prev.metrics_count == 0 && next.metrics_count > 0 {
        debug!("experiment update rejected: metrics synced");
        return false;
    }
    prev.generation != next.generation
}

/// Stateful wrapper remembering the last admitted-or-not snapshot per
/// experiment; drives the watch stream
#[derive(Default)]
pub struct ExperimentEventFilter {
    seen: HashMap<ObjectKey, ExperimentSnapshot>,
}

impl ExperimentEventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit or suppress one observed experiment version. First sight
    /// always admits.
    pub fn admit(&mut self, experiment: &Experiment) -> bool {
        let Some(namespace) = experiment.namespace() else {
            return false;
        };
        let key = ObjectKey::new(experiment.name_any(), namespace);
        let next = ExperimentSnapshot::of(experiment);
        match self.seen.insert(key, next.clone()) {
            None => true,
            Some(prev) => admit_update(&prev, &next),
        }
    }

    /// Drop tracking state once the record is gone from the cluster
    pub fn forget(&mut self, experiment: &Experiment) {
        if let Some(namespace) = experiment.namespace() {
            self.seen
                .remove(&ObjectKey::new(experiment.name_any(), namespace));
        }
    }
}

fn experiment_ref(id: ObjectKey) -> ObjectRef<Experiment> {
    ObjectRef::new(&id.name).within(&id.namespace)
}

/// Map a workload watch event to the experiment to wake. Applies on an
/// already-present key are update noise and produce nothing.
pub fn deployment_trigger(
    cache: &IndexCache,
    event: &Event<Deployment>,
) -> Option<ObjectRef<Experiment>> {
    let (object, found) = match event {
        Event::Apply(d) | Event::InitApply(d) => (d, true),
        Event::Delete(d) => (d, false),
        _ => return None,
    };
    let name = object.name_any();
    let namespace = object.namespace()?;

    let interesting = if found {
        cache.mark_target_deployment_found(&name, &namespace)
    } else {
        cache.mark_target_deployment_missing(&name, &namespace)
    };
    if !interesting {
        return None;
    }

    debug!(
        deployment = ?name,
        namespace = ?namespace,
        found = found,
        "Target workload transition"
    );
    cache
        .deployment_to_experiment(&name, &namespace)
        .map(experiment_ref)
}

/// Service counterpart of [`deployment_trigger`]
pub fn service_trigger(
    cache: &IndexCache,
    event: &Event<Service>,
) -> Option<ObjectRef<Experiment>> {
    let (object, found) = match event {
        Event::Apply(s) | Event::InitApply(s) => (s, true),
        Event::Delete(s) => (s, false),
        _ => return None,
    };
    let name = object.name_any();
    let namespace = object.namespace()?;

    let interesting = if found {
        cache.mark_target_service_found(&name, &namespace)
    } else {
        cache.mark_target_service_missing(&name, &namespace)
    };
    if !interesting {
        return None;
    }

    debug!(
        service = ?name,
        namespace = ?namespace,
        found = found,
        "Target service transition"
    );
    cache
        .service_to_experiment(&name, &namespace)
        .map(experiment_ref)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::experiment::{
        Analysis, ExperimentAction, ExperimentSpec, MetricDefinition, TargetService,
        TrafficControl,
    };
    use kube::api::ObjectMeta;

    fn experiment() -> Experiment {
        Experiment {
            metadata: ObjectMeta {
                name: Some("exp-1".to_string()),
                namespace: Some("default".to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: ExperimentSpec {
                target_service: TargetService {
                    api_version: "v1".to_string(),
                    name: "reviews".to_string(),
                    baseline: "reviews-v1".to_string(),
                    candidate: "reviews-v2".to_string(),
                },
                traffic_control: TrafficControl::default(),
                analysis: Analysis {
                    analytics_service: "analytics:8080".to_string(),
                    success_criteria: vec![],
                },
                cleanup: None,
                action: None,
                metrics: Default::default(),
            },
            status: None,
        }
    }

    fn deployment(name: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_first_sight_admits() {
        let mut filter = ExperimentEventFilter::new();
        assert!(filter.admit(&experiment()));
    }

    #[test]
    fn test_status_only_update_rejected() {
        let mut filter = ExperimentEventFilter::new();
        let exp = experiment();
        assert!(filter.admit(&exp));
        // Same generation: whatever changed was status-only.
        assert!(!filter.admit(&exp));
    }

    #[test]
    fn test_finalizer_addition_rejected() {
        let mut filter = ExperimentEventFilter::new();
        let mut exp = experiment();
        assert!(filter.admit(&exp));
        exp.metadata.finalizers = Some(vec!["finalizer.koe.io".to_string()]);
        assert!(!filter.admit(&exp));
    }

    #[test]
    fn test_action_set_admits_but_reversion_rejected() {
        let mut filter = ExperimentEventFilter::new();
        let mut exp = experiment();
        assert!(filter.admit(&exp));

        // Operator sets a terminate action (generation bumps).
        exp.spec.action = Some(ExperimentAction::TerminateAbort);
        exp.metadata.generation = Some(2);
        assert!(filter.admit(&exp));

        // Action cleared afterwards: one-shot consumption, no wake-up.
        exp.spec.action = None;
        exp.metadata.generation = Some(3);
        assert!(!filter.admit(&exp));
    }

    #[test]
    fn test_metrics_population_rejected() {
        let mut filter = ExperimentEventFilter::new();
        let mut exp = experiment();
        assert!(filter.admit(&exp));

        exp.spec.metrics.insert(
            "error_rate".to_string(),
            MetricDefinition {
                metric_type: Default::default(),
                query_template: "q".to_string(),
                sample_size_template: "s".to_string(),
            },
        );
        exp.metadata.generation = Some(2);
        assert!(!filter.admit(&exp));
    }

    #[test]
    fn test_spec_change_admits() {
        let mut filter = ExperimentEventFilter::new();
        let mut exp = experiment();
        assert!(filter.admit(&exp));
        exp.spec.traffic_control.max_iterations = 5;
        exp.metadata.generation = Some(2);
        assert!(filter.admit(&exp));
    }

    #[test]
    fn test_deletion_always_admits() {
        let mut filter = ExperimentEventFilter::new();
        let mut exp = experiment();
        assert!(filter.admit(&exp));
        exp.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            ));
        // Deletion admits even though the generation did not move.
        assert!(filter.admit(&exp));
    }

    #[test]
    fn test_deployment_create_wakes_referencing_experiment() {
        let cache = IndexCache::new();
        cache.register_experiment(&experiment()).unwrap();

        let trigger = deployment_trigger(&cache, &Event::Apply(deployment("reviews-v1")));
        let expected = ObjectRef::<Experiment>::new("exp-1").within("default");
        assert_eq!(trigger, Some(expected));
    }

    #[test]
    fn test_deployment_update_is_noise() {
        let cache = IndexCache::new();
        cache.register_experiment(&experiment()).unwrap();

        assert!(deployment_trigger(&cache, &Event::Apply(deployment("reviews-v1"))).is_some());
        // Second apply on the same key: presence already known.
        assert!(deployment_trigger(&cache, &Event::Apply(deployment("reviews-v1"))).is_none());
        // Delete transitions back and wakes again.
        assert!(deployment_trigger(&cache, &Event::Delete(deployment("reviews-v1"))).is_some());
    }

    #[test]
    fn test_unreferenced_deployment_ignored() {
        let cache = IndexCache::new();
        cache.register_experiment(&experiment()).unwrap();
        assert!(deployment_trigger(&cache, &Event::Apply(deployment("unrelated"))).is_none());
    }

    #[test]
    fn test_service_trigger_uses_service_index() {
        let cache = IndexCache::new();
        cache.register_experiment(&experiment()).unwrap();

        let service = Service {
            metadata: ObjectMeta {
                name: Some("reviews".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(service_trigger(&cache, &Event::Apply(service)).is_some());
    }
}
