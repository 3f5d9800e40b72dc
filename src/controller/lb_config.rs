//! Load-balancer-level desired state of a Service
//!
//! Everything that is not per listen port: name, placement, shape, network
//! attachment, public interface and ingress preferences. Annotations override
//! the controller-wide [`LoadBalancerDefaults`].

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;

use super::selector::LabelSelector;
use crate::annotations::{Annotation, LABEL_SERVICE_UID};
use crate::cloud::types::{Algorithm, CreateOpts, DEFAULT_LOAD_BALANCER_TYPE};
use crate::config::LoadBalancerDefaults;
use crate::error::{Error, Result};

/// Longest name the backend accepts
pub const MAX_NAME_LENGTH: usize = 63;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancerConfig {
    pub name: String,
    /// Only set when annotated; an unannotated type is never changed
    pub load_balancer_type: Option<String>,
    /// Only set when annotated; an unannotated algorithm is never changed
    pub algorithm: Option<Algorithm>,
    pub location: Option<String>,
    pub network_zone: Option<String>,
    pub use_private_ip: bool,
    pub private_ipv4: Option<Ipv4Addr>,
    /// Explicit public interface state; `None` leaves the current state alone
    pub public_interface: Option<bool>,
    /// Public interface state for newly created load balancers
    pub create_public_interface: bool,
    pub disable_private_ingress: bool,
    pub disable_ipv6: bool,
    pub hostname: Option<String>,
    pub node_selector: LabelSelector,
}

/// Lowercase, restricted to `[a-z0-9-]` and at most [`MAX_NAME_LENGTH`] long
pub fn sanitize_name(raw: &str) -> String {
    let name: String = raw
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .take(MAX_NAME_LENGTH)
        .collect();
    name.trim_end_matches('-').to_string()
}

/// Name used when the Service does not carry a name annotation
pub fn default_name(svc: &Service, prefix: Option<&str>) -> String {
    let namespace = svc.namespace().unwrap_or_else(|| "default".to_string());
    let raw = match prefix {
        Some(prefix) => format!("{prefix}-{namespace}-{}", svc.name_any()),
        None => format!("{namespace}-{}", svc.name_any()),
    };
    sanitize_name(&raw)
}

/// The backend name of the load balancer for `svc`
pub fn load_balancer_name(svc: &Service, defaults: &LoadBalancerDefaults) -> Result<String> {
    Ok(match Annotation::NAME.string(svc)? {
        Some(name) if !name.is_empty() => name,
        _ => default_name(svc, defaults.name_prefix.as_deref()),
    })
}

impl LoadBalancerConfig {
    /// Parse the load-balancer-level annotations, stopping at the first malformed one
    pub fn from_service(svc: &Service, defaults: &LoadBalancerDefaults) -> Result<Self> {
        let name = load_balancer_name(svc, defaults)?;
        let location = Annotation::LOCATION
            .string(svc)?
            .or_else(|| defaults.location.clone());
        let network_zone = Annotation::NETWORK_ZONE
            .string(svc)?
            .or_else(|| defaults.network_zone.clone());
        let load_balancer_type = Annotation::TYPE.string(svc)?;
        let algorithm = Annotation::ALGORITHM.algorithm(svc)?;
        let use_private_ip = Annotation::USE_PRIVATE_IP
            .bool(svc)?
            .unwrap_or(defaults.use_private_ip);
        let private_ipv4 = Annotation::PRIVATE_IPV4.ipv4(svc)?;
        let disable_public = Annotation::DISABLE_PUBLIC_NETWORK.bool(svc)?;
        let disable_private_ingress = Annotation::DISABLE_PRIVATE_INGRESS
            .bool(svc)?
            .unwrap_or(defaults.disable_private_ingress);
        let disable_ipv6 = Annotation::IPV6_DISABLED
            .bool(svc)?
            .unwrap_or(defaults.disable_ipv6);
        let hostname = Annotation::HOSTNAME.string(svc)?.filter(|h| !h.is_empty());
        let node_selector = match Annotation::NODE_SELECTOR.string(svc)? {
            Some(sel) => sel
                .parse::<LabelSelector>()
                .map_err(|e| Error::annotation(Annotation::NODE_SELECTOR.key(), e.to_string()))?,
            None => LabelSelector::default(),
        };

        Ok(Self {
            name,
            load_balancer_type,
            algorithm,
            location,
            network_zone,
            use_private_ip,
            private_ipv4,
            public_interface: disable_public.map(|d| !d),
            create_public_interface: !disable_public.unwrap_or(defaults.disable_public_network),
            disable_private_ingress,
            disable_ipv6,
            hostname,
            node_selector,
        })
    }

    /// Options for creating the load balancer of the Service with `uid`
    ///
    /// Placement is mandatory: location takes precedence over network zone
    /// when both are set.
    pub fn create_opts(&self, uid: &str, network: Option<i64>) -> Result<CreateOpts> {
        let (location, network_zone) = match (&self.location, &self.network_zone) {
            (Some(location), _) => (Some(location.clone()), None),
            (None, Some(zone)) => (None, Some(zone.clone())),
            (None, None) => {
                return Err(Error::ConfigError(format!(
                    "load balancer {}: neither {} nor {} is set",
                    self.name,
                    Annotation::LOCATION,
                    Annotation::NETWORK_ZONE
                )))
            }
        };

        Ok(CreateOpts {
            name: self.name.clone(),
            load_balancer_type: self
                .load_balancer_type
                .clone()
                .unwrap_or_else(|| DEFAULT_LOAD_BALANCER_TYPE.to_string()),
            algorithm: self.algorithm.unwrap_or_default(),
            location,
            network_zone,
            labels: BTreeMap::from([(LABEL_SERVICE_UID.to_string(), uid.to_string())]),
            network,
            public_interface: self.create_public_interface,
        })
    }
}
