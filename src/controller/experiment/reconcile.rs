use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::controller::analytics::AnalyticsService;
use crate::controller::clock::Clock;
use crate::controller::index_cache::IndexCache;
use crate::controller::metric_store::MetricStore;
use crate::controller::notification::{ExperimentEvent, NotificationSink};
use crate::controller::routing::{RoutingAdapter, RoutingError};
use crate::controller::targets::{TargetError, TargetObserver};
use crate::crd::experiment::{
    ApiFamily, ConditionKind, Experiment, ExperimentAction, ExperimentStatus, FINALIZER,
};

use super::progression::{
    complete_experiment, completion_reason, ensure_routing, run_iteration, should_progress,
    CompletionError,
};
use super::status::{
    mark_analytics_degraded, mark_completion_pending, mark_metrics_sync_error,
    mark_metrics_synced, mark_routing_failed, mark_spec_invalid, mark_targets_missing,
    mark_targets_provided, requeue_after,
};
use super::validation::validate_experiment;

/// Base delay of the dispatcher's exponential backoff
const BACKOFF_BASE_SECS: u64 = 1;

/// Backoff ceiling; attempts beyond this stop doubling
const BACKOFF_MAX_SECS: u64 = 256;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("experiment missing namespace")]
    MissingNamespace,

    #[error("target resolution failed: {0}")]
    Target(#[from] TargetError),

    #[error("routing failure: {0}")]
    Routing(#[from] RoutingError),
}

/// Everything a reconcile needs: the cluster client, the shared index
/// cache, and the external collaborators behind their traits.
pub struct Context {
    pub client: kube::Client,
    pub cache: Arc<IndexCache>,
    pub analytics: Arc<dyn AnalyticsService>,
    pub routing: Arc<dyn RoutingAdapter>,
    pub notifier: Arc<dyn NotificationSink>,
    pub metric_store: Arc<dyn MetricStore>,
    pub targets: Arc<dyn TargetObserver>,
    pub clock: Arc<dyn Clock>,
    /// Controller metrics; None disables recording
    pub metrics: Option<crate::server::SharedMetrics>,
    backoffs: Mutex<HashMap<String, u32>>,
}

impl Context {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: kube::Client,
        cache: Arc<IndexCache>,
        analytics: impl AnalyticsService + 'static,
        routing: impl RoutingAdapter + 'static,
        notifier: impl NotificationSink + 'static,
        metric_store: impl MetricStore + 'static,
        targets: impl TargetObserver + 'static,
        clock: Arc<dyn Clock>,
        metrics: Option<crate::server::SharedMetrics>,
    ) -> Self {
        Context {
            client,
            cache,
            analytics: Arc::new(analytics),
            routing: Arc::new(routing),
            notifier: Arc::new(notifier),
            metric_store: Arc::new(metric_store),
            targets: Arc::new(targets),
            clock,
            metrics,
            backoffs: Mutex::new(HashMap::new()),
        }
    }

    /// Next backoff delay for a key, doubling per consecutive failure
    pub fn next_backoff(&self, key: &str) -> Duration {
        let mut backoffs = self.backoffs.lock().unwrap_or_else(|e| e.into_inner());
        let attempts = backoffs.entry(key.to_string()).or_insert(0);
        let delay = (BACKOFF_BASE_SECS << (*attempts).min(8)).min(BACKOFF_MAX_SECS);
        *attempts += 1;
        Duration::from_secs(delay)
    }

    /// Reset the failure streak after a successful reconcile
    pub fn clear_backoff(&self, key: &str) {
        self.backoffs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Mock context for unit tests: a client pointed at nothing plus the
    /// mock collaborators. Tests that persist status never run against it.
    #[cfg(test)]
    #[allow(clippy::unwrap_used)]
    pub fn new_mock() -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut config = kube::Config::new("https://localhost:8080".parse().unwrap());
        config.default_namespace = "default".to_string();
        config.accept_invalid_certs = true;
        let client = kube::Client::try_from(config).unwrap();

        Context::new(
            client,
            Arc::new(IndexCache::new()),
            crate::controller::analytics::MockAnalyticsClient::new(),
            crate::controller::routing::MockRoutingAdapter::new(),
            crate::controller::notification::MockNotificationSink::new(),
            crate::controller::metric_store::MockMetricStore::new(),
            crate::controller::targets::MockTargetObserver::all_present(),
            Arc::new(crate::controller::clock::SystemClock),
            None,
        )
    }
}

fn is_benign_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409)
}

fn experiment_key(experiment: &Experiment) -> String {
    format!(
        "{}/{}",
        experiment.namespace().unwrap_or_default(),
        experiment.name_any()
    )
}

/// Write the status subresource. An optimistic-concurrency conflict is
/// benign: the lost update resurfaces through the event that caused it.
async fn persist_status(
    ctx: &Context,
    namespace: &str,
    name: &str,
    status: &ExperimentStatus,
) -> Result<(), ReconcileError> {
    let api: Api<Experiment> = Api::namespaced(ctx.client.clone(), namespace);
    match api
        .patch_status(
            name,
            &PatchParams::default(),
            &Patch::Merge(&serde_json::json!({ "status": status })),
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if is_benign_conflict(&e) => {
            info!(experiment = ?name, "Status update conflicted; relying on next event");
            Ok(())
        }
        Err(e) => Err(ReconcileError::Kube(e)),
    }
}

/// Append the finalizer on first observation. A conflict is recoverable:
/// whoever won the write produces the event that re-runs us.
async fn ensure_finalizer(ctx: &Context, experiment: &Experiment) -> Result<(), ReconcileError> {
    let finalizers = experiment.finalizers();
    if finalizers.iter().any(|f| f == FINALIZER) {
        return Ok(());
    }

    let namespace = experiment
        .namespace()
        .ok_or(ReconcileError::MissingNamespace)?;
    let name = experiment.name_any();
    let mut updated: Vec<String> = finalizers.to_vec();
    updated.push(FINALIZER.to_string());

    let api: Api<Experiment> = Api::namespaced(ctx.client.clone(), &namespace);
    match api
        .patch(
            &name,
            &PatchParams::default(),
            &Patch::Merge(&serde_json::json!({ "metadata": { "finalizers": updated } })),
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if is_benign_conflict(&e) => {
            info!(experiment = ?name, "Finalizer update conflicted (retrying on next event)");
            Ok(())
        }
        Err(e) => Err(ReconcileError::Kube(e)),
    }
}

/// Remove the finalizer: the commit point after which the controller no
/// longer owns the record.
async fn remove_finalizer(ctx: &Context, experiment: &Experiment) -> Result<(), ReconcileError> {
    let namespace = experiment
        .namespace()
        .ok_or(ReconcileError::MissingNamespace)?;
    let name = experiment.name_any();
    let remaining: Vec<String> = experiment
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();

    let api: Api<Experiment> = Api::namespaced(ctx.client.clone(), &namespace);
    match api
        .patch(
            &name,
            &PatchParams::default(),
            &Patch::Merge(&serde_json::json!({ "metadata": { "finalizers": remaining } })),
        )
        .await
    {
        Ok(_) => {
            info!(experiment = ?name, "Finalizer removed");
            Ok(())
        }
        Err(e) if is_benign_conflict(&e) => {
            info!(experiment = ?name, "Finalizer removal conflicted (retrying on next event)");
            Ok(())
        }
        Err(e) => Err(ReconcileError::Kube(e)),
    }
}

enum Flow {
    Continue,
    Halt,
}

/// Load metric definitions into spec.metrics once per experiment.
/// Skipped with no success criteria; a load failure halts the reconcile
/// with the error on the MetricsSynced condition.
async fn sync_metrics(
    ctx: &Context,
    experiment: &Experiment,
    status: &mut ExperimentStatus,
) -> Result<Flow, ReconcileError> {
    if experiment.spec.analysis.success_criteria.is_empty()
        || status.condition_true(ConditionKind::MetricsSynced)
    {
        return Ok(Flow::Continue);
    }

    let names: Vec<String> = experiment
        .spec
        .analysis
        .success_criteria
        .iter()
        .map(|c| c.metric_name.clone())
        .collect();

    match ctx.metric_store.load(&names).await {
        Ok(definitions) => {
            let namespace = experiment
                .namespace()
                .ok_or(ReconcileError::MissingNamespace)?;
            let api: Api<Experiment> = Api::namespaced(ctx.client.clone(), &namespace);
            match api
                .patch(
                    &experiment.name_any(),
                    &PatchParams::default(),
                    &Patch::Merge(&serde_json::json!({ "spec": { "metrics": definitions } })),
                )
                .await
            {
                Ok(_) => {}
                Err(e) if is_benign_conflict(&e) => {
                    info!("Metric sync conflicted; relying on next event");
                    return Ok(Flow::Halt);
                }
                Err(e) => return Err(ReconcileError::Kube(e)),
            }
            mark_metrics_synced(status, ctx.clock.now());
            Ok(Flow::Continue)
        }
        Err(e) => {
            warn!(experiment = ?experiment.name_any(), error = %e, "Metric sync failed");
            mark_metrics_sync_error(status, &e.to_string(), ctx.clock.now());
            Ok(Flow::Halt)
        }
    }
}

/// Reconcile one Experiment.
///
/// Level-triggered: every step is safe to repeat. The order is
/// finalizer ensure → deletion path → completion gate → status init →
/// metric sync → validation → family sync.
pub async fn reconcile(
    experiment: Arc<Experiment>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let start = std::time::Instant::now();
    let namespace = experiment
        .namespace()
        .ok_or(ReconcileError::MissingNamespace)?;
    let name = experiment.name_any();
    let key = experiment_key(&experiment);

    info!(experiment = ?name, namespace = ?namespace, "Reconciling experiment");

    ctx.cache.register_experiment(&experiment);

    ensure_finalizer(&ctx, &experiment).await?;

    if experiment.metadata.deletion_timestamp.is_some() {
        let action = finalize(&ctx, &experiment).await?;
        ctx.clear_backoff(&key);
        return Ok(action);
    }

    let mut status = experiment.status_or_default();

    if status.is_complete() {
        debug!(experiment = ?name, "Experiment already completed; nothing to do");
        ctx.clear_backoff(&key);
        return Ok(Action::await_change());
    }

    if status.create_timestamp == 0 {
        status.init(ctx.clock.now());
        persist_status(&ctx, &namespace, &name, &status).await?;

        let event = ExperimentEvent::created(&experiment, ctx.clock.now());
        if let Err(e) = ctx.notifier.publish(&event).await {
            warn!(experiment = ?name, error = %e, "Failed to publish creation event (non-fatal)");
        }
    }

    if let Flow::Halt = sync_metrics(&ctx, &experiment, &mut status).await? {
        persist_status(&ctx, &namespace, &name, &status).await?;
        return Ok(Action::await_change());
    }

    if let Err(message) = validate_experiment(&experiment) {
        error!(experiment = ?name, error = %message, "Experiment spec validation failed");
        mark_spec_invalid(&mut status, &message, ctx.clock.now());
        persist_status(&ctx, &namespace, &name, &status).await?;
        if let Some(metrics) = &ctx.metrics {
            metrics.record_reconcile_error();
        }
        return Ok(Action::await_change());
    }

    // Validation guarantees the family is supported.
    let Some(family) = ApiFamily::from_api_version(&experiment.spec.target_service.api_version)
    else {
        return Ok(Action::await_change());
    };

    let action = sync_experiment(&ctx, &experiment, family, &mut status, &key).await?;
    ctx.clear_backoff(&key);

    if let Some(metrics) = &ctx.metrics {
        metrics.record_reconcile_success(family.name(), start.elapsed().as_secs_f64());
        metrics.set_traffic_split(&namespace, &name, status.traffic_split);
    }

    Ok(action)
}

/// The shared family handler: routing init, target detection, interval
/// progression, completion. Only target resolution and cleanup differ by
/// family, and those go through the observer trait.
async fn sync_experiment(
    ctx: &Context,
    experiment: &Experiment,
    family: ApiFamily,
    status: &mut ExperimentStatus,
    _key: &str,
) -> Result<Action, ReconcileError> {
    let now = ctx.clock.now();
    let namespace = experiment
        .namespace()
        .ok_or(ReconcileError::MissingNamespace)?;
    let name = experiment.name_any();

    // RoutingInit
    match ensure_routing(experiment, status, ctx.routing.as_ref(), now).await {
        Ok(()) => {}
        Err(e) if e.is_retryable() => return Err(ReconcileError::Routing(e)),
        Err(e) => {
            error!(experiment = ?name, error = %e, "Routing install failed terminally");
            mark_routing_failed(status, &e.to_string(), now);
            persist_status(ctx, &namespace, &name, status).await?;
            return Ok(Action::await_change());
        }
    }

    // TargetDetect. Skipped when terminating: targets may already be gone
    // and must not block the final routing update.
    if !status.condition_true(ConditionKind::TargetsProvided) && !experiment.is_terminating() {
        let bundle = ctx.targets.resolve(experiment, family).await?;
        if bundle.all_present() {
            info!(experiment = ?name, "All targets detected");
            mark_targets_provided(status, now);
        } else {
            let missing = bundle.first_missing().unwrap_or_default();
            info!(experiment = ?name, missing = %missing, "Waiting for targets");
            mark_targets_missing(status, &missing, now);
            persist_status(ctx, &namespace, &name, status).await?;
            // No requeue: the cluster event for the missing object wakes us.
            return Ok(Action::await_change());
        }
    }

    // Progression
    let mut progressed = false;
    if should_progress(experiment, status, now) {
        match run_iteration(experiment, status, ctx.analytics.as_ref(), now).await {
            Ok(outcome) => {
                // Status first, dataplane second: a crash in between is
                // repaired by ensure_routing on the next reconcile.
                persist_status(ctx, &namespace, &name, status).await?;

                match ctx.routing.apply_split(experiment, outcome.new_split).await {
                    Ok(()) => {}
                    Err(e) if e.is_retryable() => return Err(ReconcileError::Routing(e)),
                    Err(e) => {
                        error!(experiment = ?name, error = %e, "Split update failed terminally");
                        mark_routing_failed(status, &e.to_string(), now);
                        persist_status(ctx, &namespace, &name, status).await?;
                        return Ok(Action::await_change());
                    }
                }

                info!(
                    experiment = ?name,
                    iteration = status.current_iteration,
                    baseline = outcome.new_split.baseline,
                    candidate = outcome.new_split.candidate,
                    "Iteration applied"
                );

                let assessment = status
                    .assessment
                    .as_ref()
                    .map(|a| a.summary.clone())
                    .unwrap_or_default();
                let event = ExperimentEvent::iteration_complete(
                    experiment,
                    status.current_iteration,
                    assessment,
                    now,
                );
                if let Err(e) = ctx.notifier.publish(&event).await {
                    warn!(experiment = ?name, error = %e, "Failed to publish iteration event (non-fatal)");
                }

                progressed = true;
            }
            Err(e) => {
                warn!(experiment = ?name, error = %e, "Analytics unavailable; deferring to next interval");
                mark_analytics_degraded(status, &e.to_string(), now);
                persist_status(ctx, &namespace, &name, status).await?;
                return Ok(Action::requeue(requeue_after(experiment)));
            }
        }
    }

    // Completion
    if let Some(reason) = completion_reason(experiment, status) {
        match complete_experiment(
            experiment,
            status,
            reason,
            family,
            ctx.routing.as_ref(),
            ctx.targets.as_ref(),
            ctx.notifier.as_ref(),
            now,
        )
        .await
        {
            Ok(stable) => {
                info!(
                    experiment = ?name,
                    reason = reason.as_str(),
                    stable = stable.as_str(),
                    "Experiment completed"
                );
                persist_status(ctx, &namespace, &name, status).await?;
                return Ok(Action::await_change());
            }
            Err(e) => {
                warn!(experiment = ?name, error = %e, "Final routing update failed; completion deferred");
                mark_completion_pending(status, &e.to_string(), now);
                persist_status(ctx, &namespace, &name, status).await?;
                return match e {
                    CompletionError::Routing(r) if !r.is_retryable() => Ok(Action::await_change()),
                    CompletionError::Routing(r) => Err(ReconcileError::Routing(r)),
                    CompletionError::Target(t) => Err(ReconcileError::Target(t)),
                };
            }
        }
    }

    persist_status(ctx, &namespace, &name, status).await?;

    if progressed {
        info!(experiment = ?name, "Requeue for next iteration");
        Ok(Action::requeue(requeue_after(experiment)))
    } else {
        debug!(experiment = ?name, "Request not processed");
        Ok(Action::await_change())
    }
}

/// Finalization: a not-yet-completed experiment is force-terminated with
/// an override failure so the stable routing lands, then the cache entry
/// and the finalizer go. Finalizer removal is the commit point.
async fn finalize(ctx: &Context, experiment: &Experiment) -> Result<Action, ReconcileError> {
    let name = experiment.name_any();
    info!(experiment = ?name, "Finalizing");

    let mut status = experiment.status_or_default();
    if !status.is_complete() {
        let mut forced = experiment.clone();
        forced.spec.action = Some(ExperimentAction::TerminateOverrideFailure);

        if let Some(family) =
            ApiFamily::from_api_version(&forced.spec.target_service.api_version)
        {
            let key = experiment_key(&forced);
            if let Err(e) = sync_experiment(ctx, &forced, family, &mut status, &key).await {
                // Best effort: the record is going away either way.
                warn!(experiment = ?name, error = %e, "Finalize sync pass failed");
            }
        }
    }

    ctx.cache.remove_experiment(experiment);
    remove_finalizer(ctx, experiment).await?;
    Ok(Action::await_change())
}

/// Dispatcher error policy: exponential per-key backoff, reset on the
/// next successful reconcile.
pub fn error_policy(
    experiment: Arc<Experiment>,
    error: &ReconcileError,
    ctx: Arc<Context>,
) -> Action {
    let key = experiment_key(&experiment);
    let delay = ctx.next_backoff(&key);
    warn!(
        experiment = ?experiment.name_any(),
        error = %error,
        delay_secs = delay.as_secs(),
        "Reconcile error (will retry)"
    );
    if let Some(metrics) = &ctx.metrics {
        metrics.record_reconcile_error();
    }
    Action::requeue(delay)
}
