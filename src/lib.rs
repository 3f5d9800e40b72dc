//! hcloud-lb-controller: Hetzner Cloud Load Balancers for Kubernetes Services
//!
//! This crate reconciles Hetzner Cloud Load Balancers from Services of type
//! `LoadBalancer`, driven by `load-balancer.hetzner.cloud/*` annotations.

pub mod annotations;
pub mod cloud;
pub mod config;
pub mod controller;
pub mod error;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
