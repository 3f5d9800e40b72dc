//! Hetzner Cloud backend: domain model, ports and the HTTP implementation

pub mod action;
pub mod client;
pub mod http;
pub mod types;

#[cfg(test)]
pub(crate) mod fake;

pub use action::ActionWaiter;
pub use client::{
    resolve_network, ActionClient, CertificateClient, LoadBalancerClient, NetworkClient,
};
pub use http::HcloudClient;
