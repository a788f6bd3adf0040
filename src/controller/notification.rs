//! Lifecycle event publication.
//!
//! Delivery is best-effort: a failed publish is logged and never blocks a
//! state transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::crd::experiment::Experiment;
use kube::ResourceExt;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification publish failed: {0}")]
    Publish(String),
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    #[serde(rename = "experiment-created")]
    ExperimentCreated,
    #[serde(rename = "iteration-complete")]
    IterationComplete,
    #[serde(rename = "experiment-completed")]
    ExperimentCompleted,
    #[serde(rename = "experiment-aborted")]
    ExperimentAborted,
}

/// One lifecycle event as published to the configured channels
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ExperimentEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,

    pub experiment: String,
    pub namespace: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<i32>,

    /// Assessment summary from the triggering analytics response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assessment: Option<Value>,

    /// Winner at completion: "baseline" or "candidate"
    #[serde(rename = "stableTarget", skip_serializing_if = "Option::is_none")]
    pub stable_target: Option<String>,

    pub message: String,
    pub timestamp: String,
}

impl ExperimentEvent {
    fn base(kind: EventKind, experiment: &Experiment, now: DateTime<Utc>) -> Self {
        ExperimentEvent {
            kind,
            experiment: experiment.name_any(),
            namespace: experiment.namespace().unwrap_or_default(),
            iteration: None,
            assessment: None,
            stable_target: None,
            message: String::new(),
            timestamp: now.to_rfc3339(),
        }
    }

    pub fn created(experiment: &Experiment, now: DateTime<Utc>) -> Self {
        let mut event = Self::base(EventKind::ExperimentCreated, experiment, now);
        event.message = "experiment accepted".to_string();
        event
    }

    pub fn iteration_complete(
        experiment: &Experiment,
        iteration: i32,
        assessment: Value,
        now: DateTime<Utc>,
    ) -> Self {
        let mut event = Self::base(EventKind::IterationComplete, experiment, now);
        event.iteration = Some(iteration);
        event.assessment = Some(assessment);
        event.message = format!("iteration {} applied", iteration);
        event
    }

    pub fn completed(
        experiment: &Experiment,
        stable_target: &str,
        succeeded: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let mut event = Self::base(EventKind::ExperimentCompleted, experiment, now);
        event.stable_target = Some(stable_target.to_string());
        event.message = if succeeded {
            format!("experiment succeeded; {} is stable", stable_target)
        } else {
            format!("experiment failed; {} is stable", stable_target)
        };
        event
    }

    pub fn aborted(experiment: &Experiment, stable_target: &str, now: DateTime<Utc>) -> Self {
        let mut event = Self::base(EventKind::ExperimentAborted, experiment, now);
        event.stable_target = Some(stable_target.to_string());
        event.message = format!("experiment aborted; {} is stable", stable_target);
        event
    }
}

/// Publishes lifecycle events. Production uses [`HttpNotificationSink`];
/// tests use [`MockNotificationSink`].
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, event: &ExperimentEvent) -> Result<(), NotificationError>;
}

/// Production sink posting events as JSON.
///
/// Configuration from environment variables:
/// - KOE_NOTIFY_ENABLED: "true" to enable publication (default: false)
/// - KOE_NOTIFY_URL: HTTP endpoint receiving the events
pub struct HttpNotificationSink {
    enabled: bool,
    url: Option<String>,
}

impl HttpNotificationSink {
    pub fn from_env() -> Self {
        let enabled = std::env::var("KOE_NOTIFY_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let url = std::env::var("KOE_NOTIFY_URL").ok();
        HttpNotificationSink { enabled, url }
    }
}

#[async_trait]
impl NotificationSink for HttpNotificationSink {
    async fn publish(&self, event: &ExperimentEvent) -> Result<(), NotificationError> {
        if !self.enabled {
            return Ok(());
        }
        let Some(url) = &self.url else {
            return Ok(());
        };

        let client = reqwest::Client::new();
        client
            .post(url)
            .json(event)
            .send()
            .await
            .map_err(|e| NotificationError::Publish(format!("HTTP POST failed: {}", e)))?;

        Ok(())
    }
}

/// Mock sink storing published events for assertions
#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub struct MockNotificationSink {
    events: std::sync::Mutex<Vec<ExperimentEvent>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockNotificationSink {
    pub fn new() -> Self {
        Self {
            events: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn published(&self) -> Vec<ExperimentEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn published_kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl NotificationSink for MockNotificationSink {
    async fn publish(&self, event: &ExperimentEvent) -> Result<(), NotificationError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
