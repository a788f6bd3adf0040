//! Target observation.
//!
//! Each reconcile re-reads the three named objects (front-end service,
//! baseline workload, candidate workload) for the experiment's API
//! family. The resolver is purely observational: it never creates
//! workloads, and the only deletion it performs is the completion-time
//! cleanup of the non-stable workload.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, DeleteParams};
use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use std::sync::Arc;
use thiserror::Error;

use crate::controller::index_cache::IndexCache;
use crate::crd::experiment::{ApiFamily, Experiment};

#[derive(Debug, Error)]
pub enum TargetError {
    /// Transient cluster fault; the reconcile surfaces this as retryable
    #[error("cluster read failed: {0}")]
    Api(#[from] kube::Error),

    #[error("experiment missing namespace")]
    MissingNamespace,
}

/// Minimal snapshot of an observed object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectSnapshot {
    pub name: String,
    pub namespace: String,
    pub uid: Option<String>,
}

/// A named target, either observed in the cluster or known missing
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetRef {
    Present(ObjectSnapshot),
    Missing { name: String },
}

impl TargetRef {
    pub fn is_present(&self) -> bool {
        matches!(self, TargetRef::Present(_))
    }

    pub fn name(&self) -> &str {
        match self {
            TargetRef::Present(snapshot) => &snapshot.name,
            TargetRef::Missing { name } => name,
        }
    }
}

/// The three references an experiment resolves from the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetBundle {
    pub service: TargetRef,
    pub baseline: TargetRef,
    pub candidate: TargetRef,
}

impl TargetBundle {
    pub fn all_present(&self) -> bool {
        self.service.is_present() && self.baseline.is_present() && self.candidate.is_present()
    }

    /// Name of the first missing target, labelled by role, for condition
    /// reasons
    pub fn first_missing(&self) -> Option<String> {
        for (role, target) in [
            ("service", &self.service),
            ("baseline", &self.baseline),
            ("candidate", &self.candidate),
        ] {
            if !target.is_present() {
                return Some(format!("{} {}", role, target.name()));
            }
        }
        None
    }
}

/// Resolves targets and deletes the losing workload at cleanup.
/// Production uses [`ClusterTargetObserver`]; tests use
/// [`MockTargetObserver`].
#[async_trait]
pub trait TargetObserver: Send + Sync {
    async fn resolve(
        &self,
        experiment: &Experiment,
        family: ApiFamily,
    ) -> Result<TargetBundle, TargetError>;

    /// Delete one workload of the experiment; not-found is success
    async fn delete_workload(
        &self,
        experiment: &Experiment,
        family: ApiFamily,
        name: &str,
    ) -> Result<(), TargetError>;
}

fn serverless_service_resource() -> ApiResource {
    ApiResource {
        group: "serving.knative.dev".to_string(),
        version: "v1alpha1".to_string(),
        api_version: "serving.knative.dev/v1alpha1".to_string(),
        kind: "Service".to_string(),
        plural: "services".to_string(),
    }
}

fn serverless_revision_resource() -> ApiResource {
    ApiResource {
        group: "serving.knative.dev".to_string(),
        version: "v1alpha1".to_string(),
        api_version: "serving.knative.dev/v1alpha1".to_string(),
        kind: "Revision".to_string(),
        plural: "revisions".to_string(),
    }
}

/// Production observer reading typed and dynamic APIs, refreshing the
/// IndexCache presence marks as a side effect
pub struct ClusterTargetObserver {
    client: kube::Client,
    cache: Arc<IndexCache>,
}

impl ClusterTargetObserver {
    pub fn new(client: kube::Client, cache: Arc<IndexCache>) -> Self {
        Self { client, cache }
    }

    async fn get_ref<K>(api: &Api<K>, name: &str, namespace: &str) -> Result<TargetRef, TargetError>
    where
        K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        match api.get(name).await {
            Ok(object) => Ok(TargetRef::Present(ObjectSnapshot {
                name: name.to_string(),
                namespace: namespace.to_string(),
                uid: object.meta().uid.clone(),
            })),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(TargetRef::Missing {
                name: name.to_string(),
            }),
            Err(e) => Err(TargetError::Api(e)),
        }
    }

    fn refresh_marks(&self, namespace: &str, bundle: &TargetBundle) {
        let cache = &self.cache;
        match &bundle.service {
            TargetRef::Present(s) => cache.mark_target_service_found(&s.name, namespace),
            TargetRef::Missing { name } => cache.mark_target_service_missing(name, namespace),
        };
        for target in [&bundle.baseline, &bundle.candidate] {
            match target {
                TargetRef::Present(s) => cache.mark_target_deployment_found(&s.name, namespace),
                TargetRef::Missing { name } => {
                    cache.mark_target_deployment_missing(name, namespace)
                }
            };
        }
    }
}

#[async_trait]
impl TargetObserver for ClusterTargetObserver {
    async fn resolve(
        &self,
        experiment: &Experiment,
        family: ApiFamily,
    ) -> Result<TargetBundle, TargetError> {
        let namespace = experiment
            .namespace()
            .ok_or(TargetError::MissingNamespace)?;
        let target = &experiment.spec.target_service;

        let bundle = match family {
            ApiFamily::CoreService => {
                let services: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
                let deployments: Api<Deployment> =
                    Api::namespaced(self.client.clone(), &namespace);
                TargetBundle {
                    service: Self::get_ref(&services, &target.name, &namespace).await?,
                    baseline: Self::get_ref(&deployments, &target.baseline, &namespace).await?,
                    candidate: Self::get_ref(&deployments, &target.candidate, &namespace).await?,
                }
            }
            ApiFamily::ServerlessService => {
                let services: Api<DynamicObject> = Api::namespaced_with(
                    self.client.clone(),
                    &namespace,
                    &serverless_service_resource(),
                );
                let revisions: Api<DynamicObject> = Api::namespaced_with(
                    self.client.clone(),
                    &namespace,
                    &serverless_revision_resource(),
                );
                TargetBundle {
                    service: Self::get_ref(&services, &target.name, &namespace).await?,
                    baseline: Self::get_ref(&revisions, &target.baseline, &namespace).await?,
                    candidate: Self::get_ref(&revisions, &target.candidate, &namespace).await?,
                }
            }
        };

        self.refresh_marks(&namespace, &bundle);
        Ok(bundle)
    }

    async fn delete_workload(
        &self,
        experiment: &Experiment,
        family: ApiFamily,
        name: &str,
    ) -> Result<(), TargetError> {
        let namespace = experiment
            .namespace()
            .ok_or(TargetError::MissingNamespace)?;

        let result = match family {
            ApiFamily::CoreService => {
                let deployments: Api<Deployment> =
                    Api::namespaced(self.client.clone(), &namespace);
                deployments.delete(name, &DeleteParams::default()).await.map(|_| ())
            }
            ApiFamily::ServerlessService => {
                let revisions: Api<DynamicObject> = Api::namespaced_with(
                    self.client.clone(),
                    &namespace,
                    &serverless_revision_resource(),
                );
                revisions.delete(name, &DeleteParams::default()).await.map(|_| ())
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(TargetError::Api(e)),
        }
    }
}

/// Mock observer with scripted presence, recording deletions
#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub struct MockTargetObserver {
    present: std::sync::Mutex<std::collections::HashSet<String>>,
    deleted: std::sync::Mutex<Vec<String>>,
    fail: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockTargetObserver {
    /// Observer that sees every named target
    pub fn all_present() -> Self {
        let mock = Self::none_present();
        mock.present.lock().unwrap().insert("*".to_string());
        mock
    }

    pub fn none_present() -> Self {
        Self {
            present: std::sync::Mutex::new(Default::default()),
            deleted: std::sync::Mutex::new(Vec::new()),
            fail: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_present(&self, name: &str) {
        self.present.lock().unwrap().insert(name.to_string());
    }

    pub fn fail_next(&self) {
        self.fail.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn deleted_workloads(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    fn make_ref(&self, name: &str, namespace: &str) -> TargetRef {
        let present = self.present.lock().unwrap();
        if present.contains("*") || present.contains(name) {
            TargetRef::Present(ObjectSnapshot {
                name: name.to_string(),
                namespace: namespace.to_string(),
                uid: None,
            })
        } else {
            TargetRef::Missing {
                name: name.to_string(),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl TargetObserver for MockTargetObserver {
    async fn resolve(
        &self,
        experiment: &Experiment,
        _family: ApiFamily,
    ) -> Result<TargetBundle, TargetError> {
        if self.fail.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return Err(TargetError::Api(kube::Error::Api(
                kube::core::ErrorResponse {
                    status: "Failure".to_string(),
                    message: "injected".to_string(),
                    reason: "Timeout".to_string(),
                    code: 504,
                },
            )));
        }
        let namespace = experiment.namespace().unwrap_or_default();
        let target = &experiment.spec.target_service;
        Ok(TargetBundle {
            service: self.make_ref(&target.name, &namespace),
            baseline: self.make_ref(&target.baseline, &namespace),
            candidate: self.make_ref(&target.candidate, &namespace),
        })
    }

    async fn delete_workload(
        &self,
        _experiment: &Experiment,
        _family: ApiFamily,
        name: &str,
    ) -> Result<(), TargetError> {
        self.deleted.lock().unwrap().push(name.to_string());
        Ok(())
    }
}
