use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::Api;
use kube::runtime::controller::Controller;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::Client;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use koe::controller::analytics::HttpAnalyticsClient;
use koe::controller::clock::SystemClock;
use koe::controller::event_filter::{self, ExperimentEventFilter};
use koe::controller::index_cache::IndexCache;
use koe::controller::metric_store::ConfigMapMetricStore;
use koe::controller::notification::HttpNotificationSink;
use koe::controller::routing::IstioRoutingAdapter;
use koe::controller::targets::ClusterTargetObserver;
use koe::controller::{error_policy, reconcile, Context};
use koe::crd::experiment::Experiment;
use koe::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_signal, ReadinessState,
};

/// Default port for the health/metrics endpoints
const HEALTH_PORT: u16 = 8080;

/// Health port from KOE_HEALTH_PORT, falling back to the default
fn health_port() -> u16 {
    health_port_from(std::env::var("KOE_HEALTH_PORT").ok())
}

fn health_port_from(value: Option<String>) -> u16 {
    value
        .and_then(|v| v.parse().ok())
        .unwrap_or(HEALTH_PORT)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting KOE experiment controller");

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();

    let metrics = create_metrics().expect("Failed to create metrics registry");
    info!("Metrics registry initialized");

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let cache = Arc::new(IndexCache::new());

    let ctx = Arc::new(Context::new(
        client.clone(),
        cache.clone(),
        HttpAnalyticsClient::new(),
        IstioRoutingAdapter::new(client.clone()),
        HttpNotificationSink::from_env(),
        ConfigMapMetricStore::from_env(client.clone()),
        ClusterTargetObserver::new(client.clone(), cache.clone()),
        Arc::new(SystemClock),
        Some(metrics.clone()),
    ));

    // Primary watch: experiments, reflector-backed, with the event filter
    // suppressing wake-ups that cannot change a reconcile's outcome.
    let experiments: Api<Experiment> = Api::all(client.clone());
    let (reader, writer) = reflector::store::<Experiment>();
    let filter = Arc::new(Mutex::new(ExperimentEventFilter::new()));
    let experiment_stream = watcher(experiments, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .filter(move |result| {
            let admit = match result {
                Ok(experiment) => filter
                    .lock()
                    .map(|mut f| f.admit(experiment))
                    .unwrap_or(true),
                // Watch errors pass through so the controller can log them.
                Err(_) => true,
            };
            futures::future::ready(admit)
        });

    // Secondary watches: target workloads and services, mapped to the
    // owning experiment through the index cache.
    let deployments: Api<Deployment> = Api::all(client.clone());
    let deployment_cache = cache.clone();
    let deployment_triggers = watcher(deployments, watcher::Config::default())
        .default_backoff()
        .filter_map(move |event| {
            futures::future::ready(
                event
                    .ok()
                    .and_then(|e| event_filter::deployment_trigger(&deployment_cache, &e)),
            )
        });

    let services: Api<Service> = Api::all(client.clone());
    let service_cache = cache.clone();
    let service_triggers = watcher(services, watcher::Config::default())
        .default_backoff()
        .filter_map(move |event| {
            futures::future::ready(
                event
                    .ok()
                    .and_then(|e| event_filter::service_trigger(&service_cache, &e)),
            )
        });

    let workload_triggers = futures::stream::select(deployment_triggers, service_triggers);

    // Health/metrics server in the background
    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let port = health_port();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = run_health_server(port, health_readiness, health_metrics).await {
            warn!(error = %e, "Health server failed");
        }
    });
    info!(port = port, "Health server task spawned");

    readiness.set_ready();
    info!("Controller ready, starting reconciliation loop");

    let mut drain = shutdown_signal.clone();
    let controller = Controller::for_stream(experiment_stream, reader)
        .reconcile_on(workload_triggers)
        .graceful_shutdown_on(async move { drain.wait().await })
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            if let Ok(object) = result {
                info!("Reconciled: {:?}", object);
            }
            // Errors already logged by error_policy.
        });
    tokio::pin!(controller);

    tokio::select! {
        _ = &mut controller => {
            info!("Controller stream ended");
        }
        signal = wait_for_signal() => {
            info!(signal = signal, "Initiating graceful shutdown");
            // Stop advertising readiness so traffic drains first.
            readiness.set_not_ready();
            shutdown_controller.shutdown();
            // Let in-flight reconciles finish.
            controller.await;
        }
    }

    health_handle.abort();
    info!("KOE controller shut down gracefully");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
