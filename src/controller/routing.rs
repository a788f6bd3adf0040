//! Traffic-routing dataplane adapter.
//!
//! The state machine only ever talks to the [`RoutingAdapter`] trait; the
//! production implementation writes Istio-family VirtualService and
//! DestinationRule objects through dynamically-typed API calls.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use thiserror::Error;
use tracing::{info, warn};

use crate::crd::experiment::{Experiment, TrafficSplit};
use kube::ResourceExt;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("routing API error: {0}")]
    Api(#[from] kube::Error),

    #[error("experiment missing namespace")]
    MissingNamespace,
}

impl RoutingError {
    /// Conflicts, throttling and server faults retry; schema rejections
    /// are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            RoutingError::Api(kube::Error::Api(e)) => {
                e.code == 409 || e.code == 429 || e.code >= 500
            }
            RoutingError::Api(_) => true,
            RoutingError::MissingNamespace => false,
        }
    }
}

/// Result of a routing-rules existence check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoutingCheck {
    /// This call created the rules
    pub created: bool,

    /// Split currently installed in the dataplane
    pub observed: TrafficSplit,
}

/// Installs, updates and deletes the traffic rules for an experiment.
/// Production uses [`IstioRoutingAdapter`]; tests use
/// [`MockRoutingAdapter`].
#[async_trait]
pub trait RoutingAdapter: Send + Sync {
    /// Ensure the experiment's rules exist, creating them with `initial`
    /// when absent, and report the split the dataplane currently holds.
    async fn ensure_rules(
        &self,
        experiment: &Experiment,
        initial: TrafficSplit,
    ) -> Result<RoutingCheck, RoutingError>;

    /// Write a split to the dataplane. The caller pairs every
    /// status.trafficSplit change with this call in the same reconcile.
    async fn apply_split(
        &self,
        experiment: &Experiment,
        split: TrafficSplit,
    ) -> Result<(), RoutingError>;

    /// Remove the experiment's rules; already-absent rules are success.
    async fn teardown(&self, experiment: &Experiment) -> Result<(), RoutingError>;
}

fn virtual_service_resource() -> ApiResource {
    ApiResource {
        group: "networking.istio.io".to_string(),
        version: "v1alpha3".to_string(),
        api_version: "networking.istio.io/v1alpha3".to_string(),
        kind: "VirtualService".to_string(),
        plural: "virtualservices".to_string(),
    }
}

fn destination_rule_resource() -> ApiResource {
    ApiResource {
        group: "networking.istio.io".to_string(),
        version: "v1alpha3".to_string(),
        api_version: "networking.istio.io/v1alpha3".to_string(),
        kind: "DestinationRule".to_string(),
        plural: "destinationrules".to_string(),
    }
}

/// Name of the VirtualService owned by an experiment
pub fn virtual_service_name(experiment_name: &str) -> String {
    format!("{}.koe-experiment", experiment_name)
}

/// Name of the DestinationRule owned by an experiment
pub fn destination_rule_name(experiment_name: &str) -> String {
    format!("{}.koe-experiment", experiment_name)
}

/// Route spec with one weighted destination per version subset
pub fn build_virtual_service(
    experiment: &Experiment,
    namespace: &str,
    split: TrafficSplit,
) -> serde_json::Value {
    let service = &experiment.spec.target_service.name;
    serde_json::json!({
        "apiVersion": "networking.istio.io/v1alpha3",
        "kind": "VirtualService",
        "metadata": {
            "name": virtual_service_name(&experiment.name_any()),
            "namespace": namespace,
            "labels": { "koe.io/experiment": experiment.name_any() }
        },
        "spec": {
            "hosts": [service],
            "http": [{
                "route": [
                    {
                        "destination": { "host": service, "subset": "baseline" },
                        "weight": split.baseline
                    },
                    {
                        "destination": { "host": service, "subset": "candidate" },
                        "weight": split.candidate
                    }
                ]
            }]
        }
    })
}

/// Subsets selecting the baseline and candidate workloads by version label
pub fn build_destination_rule(experiment: &Experiment, namespace: &str) -> serde_json::Value {
    let target = &experiment.spec.target_service;
    serde_json::json!({
        "apiVersion": "networking.istio.io/v1alpha3",
        "kind": "DestinationRule",
        "metadata": {
            "name": destination_rule_name(&experiment.name_any()),
            "namespace": namespace,
            "labels": { "koe.io/experiment": experiment.name_any() }
        },
        "spec": {
            "host": target.name,
            "subsets": [
                { "name": "baseline", "labels": { "koe.io/version": target.baseline } },
                { "name": "candidate", "labels": { "koe.io/version": target.candidate } }
            ]
        }
    })
}

/// Read the installed split back out of a VirtualService object.
/// An unparseable spec reads as 0/0, which forces a re-apply.
pub fn extract_split(virtual_service: &serde_json::Value) -> TrafficSplit {
    let mut split = TrafficSplit::default();
    let routes = virtual_service
        .pointer("/spec/http/0/route")
        .and_then(|r| r.as_array());
    let Some(routes) = routes else {
        return split;
    };
    for route in routes {
        let weight = route.get("weight").and_then(|w| w.as_i64()).unwrap_or(0) as i32;
        match route.pointer("/destination/subset").and_then(|s| s.as_str()) {
            Some("baseline") => split.baseline = weight,
            Some("candidate") => split.candidate = weight,
            _ => {}
        }
    }
    split
}

/// Production adapter writing Istio-family routing objects
pub struct IstioRoutingAdapter {
    client: kube::Client,
}

impl IstioRoutingAdapter {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn virtual_services(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &virtual_service_resource())
    }

    fn destination_rules(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &destination_rule_resource())
    }

    fn namespace(experiment: &Experiment) -> Result<String, RoutingError> {
        experiment.namespace().ok_or(RoutingError::MissingNamespace)
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

#[async_trait]
impl RoutingAdapter for IstioRoutingAdapter {
    async fn ensure_rules(
        &self,
        experiment: &Experiment,
        initial: TrafficSplit,
    ) -> Result<RoutingCheck, RoutingError> {
        let namespace = Self::namespace(experiment)?;
        let name = experiment.name_any();
        let vs_api = self.virtual_services(&namespace);

        match vs_api.get(&virtual_service_name(&name)).await {
            Ok(existing) => {
                let value = serde_json::to_value(&existing)
                    .unwrap_or(serde_json::Value::Null);
                Ok(RoutingCheck {
                    created: false,
                    observed: extract_split(&value),
                })
            }
            Err(e) if is_not_found(&e) => {
                let dr: DynamicObject = serde_json::from_value(build_destination_rule(
                    experiment, &namespace,
                ))
                .map_err(|e| {
                    RoutingError::Api(kube::Error::SerdeError(e))
                })?;
                self.destination_rules(&namespace)
                    .create(&PostParams::default(), &dr)
                    .await?;

                let vs: DynamicObject = serde_json::from_value(build_virtual_service(
                    experiment, &namespace, initial,
                ))
                .map_err(|e| {
                    RoutingError::Api(kube::Error::SerdeError(e))
                })?;
                vs_api.create(&PostParams::default(), &vs).await?;

                info!(
                    experiment = ?name,
                    namespace = ?namespace,
                    baseline = initial.baseline,
                    candidate = initial.candidate,
                    "Routing rules created"
                );
                Ok(RoutingCheck {
                    created: true,
                    observed: initial,
                })
            }
            Err(e) => Err(RoutingError::Api(e)),
        }
    }

    async fn apply_split(
        &self,
        experiment: &Experiment,
        split: TrafficSplit,
    ) -> Result<(), RoutingError> {
        let namespace = Self::namespace(experiment)?;
        let name = experiment.name_any();
        let patch = build_virtual_service(experiment, &namespace, split);

        self.virtual_services(&namespace)
            .patch(
                &virtual_service_name(&name),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;

        info!(
            experiment = ?name,
            baseline = split.baseline,
            candidate = split.candidate,
            "Traffic split applied"
        );
        Ok(())
    }

    async fn teardown(&self, experiment: &Experiment) -> Result<(), RoutingError> {
        let namespace = Self::namespace(experiment)?;
        let name = experiment.name_any();

        for (api, rule_name) in [
            (self.virtual_services(&namespace), virtual_service_name(&name)),
            (self.destination_rules(&namespace), destination_rule_name(&name)),
        ] {
            match api.delete(&rule_name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(e) if is_not_found(&e) => {
                    warn!(experiment = ?name, rule = ?rule_name, "Routing rule already gone");
                }
                Err(e) => return Err(RoutingError::Api(e)),
            }
        }
        Ok(())
    }
}

/// Mock adapter recording every dataplane interaction
#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub struct MockRoutingAdapter {
    installed: std::sync::Mutex<Option<TrafficSplit>>,
    applied: std::sync::Mutex<Vec<TrafficSplit>>,
    torn_down: std::sync::atomic::AtomicBool,
    fail_apply: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockRoutingAdapter {
    pub fn new() -> Self {
        Self {
            installed: std::sync::Mutex::new(None),
            applied: std::sync::Mutex::new(Vec::new()),
            torn_down: std::sync::atomic::AtomicBool::new(false),
            fail_apply: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Pretend the dataplane already holds this split
    pub fn with_installed(split: TrafficSplit) -> Self {
        let mock = Self::new();
        *mock.installed.lock().unwrap() = Some(split);
        mock
    }

    pub fn fail_next_apply(&self) {
        self.fail_apply.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn installed(&self) -> Option<TrafficSplit> {
        *self.installed.lock().unwrap()
    }

    pub fn applied_splits(&self) -> Vec<TrafficSplit> {
        self.applied.lock().unwrap().clone()
    }

    pub fn was_torn_down(&self) -> bool {
        self.torn_down.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl RoutingAdapter for MockRoutingAdapter {
    async fn ensure_rules(
        &self,
        _experiment: &Experiment,
        initial: TrafficSplit,
    ) -> Result<RoutingCheck, RoutingError> {
        let mut installed = self.installed.lock().unwrap();
        match *installed {
            Some(observed) => Ok(RoutingCheck {
                created: false,
                observed,
            }),
            None => {
                *installed = Some(initial);
                Ok(RoutingCheck {
                    created: true,
                    observed: initial,
                })
            }
        }
    }

    async fn apply_split(
        &self,
        _experiment: &Experiment,
        split: TrafficSplit,
    ) -> Result<(), RoutingError> {
        if self.fail_apply.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return Err(RoutingError::Api(kube::Error::Api(
                kube::core::ErrorResponse {
                    status: "Failure".to_string(),
                    message: "injected".to_string(),
                    reason: "ServiceUnavailable".to_string(),
                    code: 503,
                },
            )));
        }
        *self.installed.lock().unwrap() = Some(split);
        self.applied.lock().unwrap().push(split);
        Ok(())
    }

    async fn teardown(&self, _experiment: &Experiment) -> Result<(), RoutingError> {
        self.torn_down.store(true, std::sync::atomic::Ordering::SeqCst);
        *self.installed.lock().unwrap() = None;
        Ok(())
    }
}
