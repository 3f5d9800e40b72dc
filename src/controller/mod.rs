//! Controller module for `LoadBalancer` Service reconciliation
//! This module contains the control loop, the desired-state extraction from
//! Service annotations and the load balancer reconciliation steps.

mod lb_config;
mod lb_ops;
mod load_balancers;
#[cfg(feature = "metrics")]
pub mod metrics;
mod reconciler;
pub mod retry;
pub mod selector;
mod service_opts;
#[cfg(test)]
mod service_opts_test;
pub mod targets;

pub use lb_config::{default_name, load_balancer_name, sanitize_name, LoadBalancerConfig};
pub use lb_ops::LoadBalancerOps;
pub use load_balancers::{ingress, LoadBalancers};
pub use reconciler::{run_controller, ControllerState, LOAD_BALANCER_FINALIZER};
pub use selector::LabelSelector;
pub use service_opts::ServiceOptsBuilder;
