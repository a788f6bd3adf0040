pub mod analytics;
pub mod clock;
pub mod event_filter;
pub mod experiment;
pub mod index_cache;
pub mod metric_store;
pub mod notification;
pub mod routing;
pub mod targets;

pub use experiment::{error_policy, reconcile, Context, ReconcileError};
