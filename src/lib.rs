//! KOE drives progressive-delivery experiments on Kubernetes: it watches
//! Experiment resources, installs traffic-routing rules for the target
//! service, consults an external check-and-increment analytics service
//! each interval, and terminates every experiment on a chosen stable
//! winner.

pub mod controller;
pub mod crd;
pub mod server;
