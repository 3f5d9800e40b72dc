//! Domain model of the Hetzner Cloud resources the controller manipulates
//!
//! These are deliberately independent of the REST wire format; `cloud::http`
//! converts between the two.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::time::Duration;

/// Protocol of a load balancer service or health check
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[default]
    Tcp,
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    pub fn is_http(&self) -> bool {
        matches!(self, Protocol::Http | Protocol::Https)
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            other => Err(format!("unsupported protocol: {other}")),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traffic distribution algorithm of a load balancer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Algorithm {
    #[default]
    RoundRobin,
    LeastConnections,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::LeastConnections => "least_connections",
        }
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Algorithm::RoundRobin),
            "least_connections" => Ok(Algorithm::LeastConnections),
            other => Err(format!("unsupported algorithm: {other}")),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Smallest load balancer type, used when no type annotation is present
pub const DEFAULT_LOAD_BALANCER_TYPE: &str = "lb11";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublicNet {
    pub enabled: bool,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrivateNet {
    pub network_id: i64,
    pub ip: Ipv4Addr,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HealthCheckHttp {
    pub domain: String,
    pub path: String,
    pub response: String,
    pub status_codes: Vec<String>,
    pub tls: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthCheck {
    pub protocol: Protocol,
    pub port: u16,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub http: Option<HealthCheckHttp>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceHttp {
    pub cookie_name: String,
    pub cookie_lifetime: Duration,
    pub certificates: Vec<i64>,
    pub redirect_http: bool,
    pub sticky_sessions: bool,
}

/// A listen port exposed by a load balancer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancerService {
    pub protocol: Protocol,
    pub listen_port: u16,
    pub destination_port: u16,
    pub proxyprotocol: bool,
    pub http: Option<ServiceHttp>,
    pub health_check: HealthCheck,
}

/// A server registered as load balancer target
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub server_id: i64,
    pub use_private_ip: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancer {
    pub id: i64,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub algorithm: Algorithm,
    pub load_balancer_type: String,
    pub location: String,
    pub network_zone: String,
    pub public_net: PublicNet,
    pub private_net: Vec<PrivateNet>,
    pub services: Vec<LoadBalancerService>,
    pub targets: Vec<Target>,
    pub delete_protection: bool,
}

impl LoadBalancer {
    pub fn service(&self, listen_port: u16) -> Option<&LoadBalancerService> {
        self.services.iter().find(|s| s.listen_port == listen_port)
    }

    pub fn is_attached_to(&self, network_id: i64) -> bool {
        self.private_net.iter().any(|n| n.network_id == network_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionStatus {
    Running,
    Success,
    Error,
}

/// Handle to an asynchronous state transition on a backend resource
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Action {
    pub id: i64,
    pub command: String,
    pub status: ActionStatus,
    pub progress: u8,
    pub error: Option<ActionError>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionError {
    pub code: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    pub id: i64,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Network {
    pub id: i64,
    pub name: String,
}

/// Options for creating a load balancer; exactly one of `location` and `network_zone` is set
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateOpts {
    pub name: String,
    pub load_balancer_type: String,
    pub algorithm: Algorithm,
    pub location: Option<String>,
    pub network_zone: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub network: Option<i64>,
    pub public_interface: bool,
}

/// Options for the combined name/labels update
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateOpts {
    pub name: Option<String>,
    pub labels: Option<BTreeMap<String, String>>,
}

/// HTTP options of a service; `None` fields are left to the backend
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceHttpOpts {
    pub cookie_name: Option<String>,
    pub cookie_lifetime: Option<Duration>,
    pub certificates: Option<Vec<i64>>,
    pub redirect_http: Option<bool>,
    pub sticky_sessions: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HealthCheckHttpOpts {
    pub domain: Option<String>,
    pub path: Option<String>,
    pub status_codes: Option<Vec<String>>,
    pub tls: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HealthCheckOpts {
    pub protocol: Option<Protocol>,
    pub port: Option<u16>,
    pub interval: Option<Duration>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub http: Option<HealthCheckHttpOpts>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddServiceOpts {
    pub protocol: Protocol,
    pub listen_port: u16,
    pub destination_port: u16,
    pub proxyprotocol: bool,
    pub http: Option<ServiceHttpOpts>,
    /// `None` lets the backend apply its default TCP check on the destination port
    pub health_check: Option<HealthCheckOpts>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateServiceOpts {
    pub protocol: Option<Protocol>,
    pub destination_port: Option<u16>,
    pub proxyprotocol: Option<bool>,
    pub http: Option<ServiceHttpOpts>,
    pub health_check: Option<HealthCheckOpts>,
}

fn differs<T: PartialEq>(want: &Option<T>, have: &T) -> bool {
    want.as_ref().is_some_and(|w| w != have)
}

fn sorted<T: Ord + Clone>(items: &[T]) -> Vec<T> {
    let mut v = items.to_vec();
    v.sort();
    v
}

impl ServiceHttpOpts {
    fn differs_from(&self, current: Option<&ServiceHttp>) -> bool {
        let default = ServiceHttp::default();
        let current = current.unwrap_or(&default);
        differs(&self.cookie_name, &current.cookie_name)
            || differs(&self.cookie_lifetime, &current.cookie_lifetime)
            || self
                .certificates
                .as_ref()
                .is_some_and(|c| sorted(c) != sorted(&current.certificates))
            || differs(&self.redirect_http, &current.redirect_http)
            || differs(&self.sticky_sessions, &current.sticky_sessions)
    }
}

impl HealthCheckOpts {
    fn differs_from(&self, current: &HealthCheck) -> bool {
        let default = HealthCheckHttp::default();
        let http_differs = match &self.http {
            None => false,
            Some(want) => {
                let have = current.http.as_ref().unwrap_or(&default);
                differs(&want.domain, &have.domain)
                    || differs(&want.path, &have.path)
                    || want
                        .status_codes
                        .as_ref()
                        .is_some_and(|c| sorted(c) != sorted(&have.status_codes))
                    || differs(&want.tls, &have.tls)
            }
        };
        differs(&self.protocol, &current.protocol)
            || differs(&self.port, &current.port)
            || differs(&self.interval, &current.interval)
            || differs(&self.timeout, &current.timeout)
            || differs(&self.retries, &current.retries)
            || http_differs
    }
}

impl UpdateServiceOpts {
    /// Whether applying these options would change `current`
    ///
    /// Only fields that are set are compared: an implicit backend default
    /// health check never counts as a difference.
    pub fn differs_from(&self, current: &LoadBalancerService) -> bool {
        differs(&self.protocol, &current.protocol)
            || differs(&self.destination_port, &current.destination_port)
            || differs(&self.proxyprotocol, &current.proxyprotocol)
            || self
                .http
                .as_ref()
                .is_some_and(|h| h.differs_from(current.http.as_ref()))
            || self
                .health_check
                .as_ref()
                .is_some_and(|hc| hc.differs_from(&current.health_check))
    }
}
