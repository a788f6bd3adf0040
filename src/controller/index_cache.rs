//! Bidirectional index between watched target objects and experiments.
//!
//! Cluster events arrive keyed by workload or service name; the control
//! loop's unit of work is an experiment. This cache absorbs that
//! asymmetry: each target key maps to the experiments referencing it
//! (with a presence mark), and each experiment maps back to its three
//! expected target keys. The mark functions double as event dedup: a
//! mark that does not transition presence reports the event as
//! uninteresting.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::RwLock;

use kube::ResourceExt;

use crate::crd::experiment::Experiment;

/// (name, namespace) key of a cluster object or an experiment
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ObjectKey {
    pub name: String,
    pub namespace: String,
}

impl ObjectKey {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        ObjectKey {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.namespace)
    }
}

/// The three target keys an experiment expects to observe
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetKeys {
    pub service: ObjectKey,
    pub baseline: ObjectKey,
    pub candidate: ObjectKey,
}

impl TargetKeys {
    fn from_experiment(experiment: &Experiment) -> Option<Self> {
        let namespace = experiment.namespace()?;
        let target = &experiment.spec.target_service;
        Some(TargetKeys {
            service: ObjectKey::new(&target.name, &namespace),
            baseline: ObjectKey::new(&target.baseline, &namespace),
            candidate: ObjectKey::new(&target.candidate, &namespace),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Presence {
    #[default]
    Unknown,
    Present,
    Missing,
}

#[derive(Default)]
struct TargetEntry {
    experiments: HashSet<ObjectKey>,
    presence: Presence,
}

#[derive(Default)]
struct Inner {
    deployments: HashMap<ObjectKey, TargetEntry>,
    services: HashMap<ObjectKey, TargetEntry>,
    experiments: HashMap<ObjectKey, TargetKeys>,
}

impl Inner {
    fn unlink(&mut self, experiment: &ObjectKey, keys: &TargetKeys) {
        Self::unlink_one(&mut self.services, experiment, &keys.service);
        Self::unlink_one(&mut self.deployments, experiment, &keys.baseline);
        Self::unlink_one(&mut self.deployments, experiment, &keys.candidate);
    }

    fn unlink_one(
        map: &mut HashMap<ObjectKey, TargetEntry>,
        experiment: &ObjectKey,
        key: &ObjectKey,
    ) {
        if let Some(entry) = map.get_mut(key) {
            entry.experiments.remove(experiment);
            if entry.experiments.is_empty() {
                map.remove(key);
            }
        }
    }
}

/// Shared index; mark helpers may fire from watch-stream tasks while
/// reconciles run, so all mutation happens under one writer lock.
#[derive(Default)]
pub struct IndexCache {
    inner: RwLock<Inner>,
}

/// Lock poisoning only happens if a holder panicked; the maps are still
/// structurally sound, so keep serving the recovered data.
macro_rules! write_lock {
    ($cache:expr) => {
        $cache.inner.write().unwrap_or_else(|e| e.into_inner())
    };
}

macro_rules! read_lock {
    ($cache:expr) => {
        $cache.inner.read().unwrap_or_else(|e| e.into_inner())
    };
}

impl IndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the experiment's expected target keys. Idempotent; a spec
    /// whose target names changed has its old edges dropped first.
    /// Presence of a target already tracked for another experiment is
    /// preserved. Returns the registered keys.
    pub fn register_experiment(&self, experiment: &Experiment) -> Option<TargetKeys> {
        let keys = TargetKeys::from_experiment(experiment)?;
        let id = ObjectKey::new(experiment.name_any(), experiment.namespace()?);

        let mut inner = write_lock!(self);
        if let Some(previous) = inner.experiments.get(&id).cloned() {
            if previous == keys {
                return Some(keys);
            }
            inner.unlink(&id, &previous);
        }

        inner
            .services
            .entry(keys.service.clone())
            .or_default()
            .experiments
            .insert(id.clone());
        for key in [&keys.baseline, &keys.candidate] {
            inner
                .deployments
                .entry(key.clone())
                .or_default()
                .experiments
                .insert(id.clone());
        }
        inner.experiments.insert(id, keys.clone());
        Some(keys)
    }

    /// Erase every edge for the experiment. Safe to call for an
    /// experiment that was never registered.
    pub fn remove_experiment(&self, experiment: &Experiment) {
        let Some(namespace) = experiment.namespace() else {
            return;
        };
        let id = ObjectKey::new(experiment.name_any(), namespace);
        let mut inner = write_lock!(self);
        if let Some(keys) = inner.experiments.remove(&id) {
            inner.unlink(&id, &keys);
        }
    }

    /// A workload with this key appeared. True iff some experiment
    /// references the key and the mark actually transitioned it to
    /// present; false means the event is uninteresting.
    pub fn mark_target_deployment_found(&self, name: &str, namespace: &str) -> bool {
        Self::mark(
            &mut write_lock!(self).deployments,
            &ObjectKey::new(name, namespace),
            Presence::Present,
        )
    }

    /// A workload with this key disappeared; symmetric to found.
    pub fn mark_target_deployment_missing(&self, name: &str, namespace: &str) -> bool {
        Self::mark(
            &mut write_lock!(self).deployments,
            &ObjectKey::new(name, namespace),
            Presence::Missing,
        )
    }

    pub fn mark_target_service_found(&self, name: &str, namespace: &str) -> bool {
        Self::mark(
            &mut write_lock!(self).services,
            &ObjectKey::new(name, namespace),
            Presence::Present,
        )
    }

    pub fn mark_target_service_missing(&self, name: &str, namespace: &str) -> bool {
        Self::mark(
            &mut write_lock!(self).services,
            &ObjectKey::new(name, namespace),
            Presence::Missing,
        )
    }

    fn mark(map: &mut HashMap<ObjectKey, TargetEntry>, key: &ObjectKey, to: Presence) -> bool {
        match map.get_mut(key) {
            Some(entry) if !entry.experiments.is_empty() => {
                if entry.presence == to {
                    return false;
                }
                entry.presence = to;
                true
            }
            _ => false,
        }
    }

    /// Reverse lookup for workload events. When several experiments share
    /// the key any one of them is returned; the rest wake through their
    /// own events or requeue timers.
    pub fn deployment_to_experiment(&self, name: &str, namespace: &str) -> Option<ObjectKey> {
        read_lock!(self)
            .deployments
            .get(&ObjectKey::new(name, namespace))
            .and_then(|entry| entry.experiments.iter().next().cloned())
    }

    pub fn service_to_experiment(&self, name: &str, namespace: &str) -> Option<ObjectKey> {
        read_lock!(self)
            .services
            .get(&ObjectKey::new(name, namespace))
            .and_then(|entry| entry.experiments.iter().next().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::experiment::{Analysis, ExperimentSpec, TargetService, TrafficControl};
    use kube::api::ObjectMeta;

    fn experiment(name: &str, namespace: &str, target: &str) -> Experiment {
        Experiment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: ExperimentSpec {
                target_service: TargetService {
                    api_version: "v1".to_string(),
                    name: target.to_string(),
                    baseline: format!("{}-base", target),
                    candidate: format!("{}-cand", target),
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

    #[test]
    fn test_register_creates_both_directions() {
        let cache = IndexCache::new();
        let exp = experiment("exp-1", "default", "reviews");
        cache.register_experiment(&exp).unwrap();

        let id = cache.deployment_to_experiment("reviews-base", "default").unwrap();
        assert_eq!(id, ObjectKey::new("exp-1", "default"));
        let id = cache.deployment_to_experiment("reviews-cand", "default").unwrap();
        assert_eq!(id, ObjectKey::new("exp-1", "default"));
        let id = cache.service_to_experiment("reviews", "default").unwrap();
        assert_eq!(id, ObjectKey::new("exp-1", "default"));
    }

    #[test]
    fn test_register_is_idempotent() {
        let cache = IndexCache::new();
        let exp = experiment("exp-1", "default", "reviews");
        let first = cache.register_experiment(&exp).unwrap();
        let second = cache.register_experiment(&exp).unwrap();
        assert_eq!(first, second);
        assert!(cache.mark_target_deployment_found("reviews-base", "default"));
        // Re-registration must not reset presence back to unknown.
        cache.register_experiment(&exp).unwrap();
        assert!(!cache.mark_target_deployment_found("reviews-base", "default"));
    }

    #[test]
    fn test_register_relinks_changed_targets() {
        let cache = IndexCache::new();
        let exp = experiment("exp-1", "default", "reviews");
        cache.register_experiment(&exp).unwrap();

        let mut changed = exp.clone();
        changed.spec.target_service.candidate = "reviews-v3".to_string();
        cache.register_experiment(&changed).unwrap();

        assert!(cache.deployment_to_experiment("reviews-cand", "default").is_none());
        assert!(cache.deployment_to_experiment("reviews-v3", "default").is_some());
    }

    #[test]
    fn test_mark_found_only_fires_on_transition() {
        let cache = IndexCache::new();
        cache
            .register_experiment(&experiment("exp-1", "default", "reviews"))
            .unwrap();

        // unknown -> present: interesting
        assert!(cache.mark_target_deployment_found("reviews-base", "default"));
        // present -> present: update noise, suppressed
        assert!(!cache.mark_target_deployment_found("reviews-base", "default"));
        // present -> missing: interesting
        assert!(cache.mark_target_deployment_missing("reviews-base", "default"));
        assert!(!cache.mark_target_deployment_missing("reviews-base", "default"));
        // missing -> present again
        assert!(cache.mark_target_deployment_found("reviews-base", "default"));
    }

    #[test]
    fn test_mark_unreferenced_key_is_uninteresting() {
        let cache = IndexCache::new();
        cache
            .register_experiment(&experiment("exp-1", "default", "reviews"))
            .unwrap();
        assert!(!cache.mark_target_deployment_found("unrelated", "default"));
        assert!(!cache.mark_target_service_found("reviews", "other-ns"));
    }

    #[test]
    fn test_service_marks_are_tracked_separately() {
        let cache = IndexCache::new();
        cache
            .register_experiment(&experiment("exp-1", "default", "reviews"))
            .unwrap();
        assert!(cache.mark_target_service_found("reviews", "default"));
        // The service name is not a deployment key.
        assert!(!cache.mark_target_deployment_found("reviews", "default"));
    }

    #[test]
    fn test_remove_erases_all_edges() {
        let cache = IndexCache::new();
        let exp = experiment("exp-1", "default", "reviews");
        cache.register_experiment(&exp).unwrap();
        cache.remove_experiment(&exp);

        assert!(cache.deployment_to_experiment("reviews-base", "default").is_none());
        assert!(cache.deployment_to_experiment("reviews-cand", "default").is_none());
        assert!(cache.service_to_experiment("reviews", "default").is_none());
        assert!(!cache.mark_target_deployment_found("reviews-base", "default"));
    }

    #[test]
    fn test_shared_target_survives_one_removal() {
        let cache = IndexCache::new();
        let a = experiment("exp-a", "default", "reviews");
        let mut b = experiment("exp-b", "default", "ratings");
        // Both experiments reference the same baseline deployment.
        b.spec.target_service.baseline = "reviews-base".to_string();
        cache.register_experiment(&a).unwrap();
        cache.register_experiment(&b).unwrap();

        cache.remove_experiment(&a);

        let id = cache.deployment_to_experiment("reviews-base", "default").unwrap();
        assert_eq!(id, ObjectKey::new("exp-b", "default"));
    }
}
