//! Controller configuration loaded from the environment
//!
//! Unlike annotation parsing, loading collects every problem before failing so
//! an operator sees all misconfigured variables at once.

use std::fmt;
use std::time::Duration;

use crate::annotations::{parse_bool, parse_duration};
use crate::cloud::action::DEFAULT_POLL_INTERVAL;
use crate::cloud::http::DEFAULT_ENDPOINT;
use crate::controller::retry::DEFAULT_RETRY_DELAY;
use crate::error::{Error, Result};

pub const ENV_TOKEN: &str = "HCLOUD_TOKEN";
pub const ENV_ENDPOINT: &str = "HCLOUD_ENDPOINT";
pub const ENV_NETWORK: &str = "HCLOUD_NETWORK";
pub const ENV_ACTION_POLL_INTERVAL: &str = "HCLOUD_ACTION_POLL_INTERVAL";
pub const ENV_LB_ENABLED: &str = "HCLOUD_LOAD_BALANCERS_ENABLED";
pub const ENV_LB_LOCATION: &str = "HCLOUD_LOAD_BALANCERS_LOCATION";
pub const ENV_LB_NETWORK_ZONE: &str = "HCLOUD_LOAD_BALANCERS_NETWORK_ZONE";
pub const ENV_LB_USE_PRIVATE_IP: &str = "HCLOUD_LOAD_BALANCERS_USE_PRIVATE_IP";
pub const ENV_LB_DISABLE_PRIVATE_INGRESS: &str = "HCLOUD_LOAD_BALANCERS_DISABLE_PRIVATE_INGRESS";
pub const ENV_LB_DISABLE_PUBLIC_NETWORK: &str = "HCLOUD_LOAD_BALANCERS_DISABLE_PUBLIC_NETWORK";
pub const ENV_LB_DISABLE_IPV6: &str = "HCLOUD_LOAD_BALANCERS_DISABLE_IPV6";
pub const ENV_LB_ATTACH_RETRY_DELAY: &str = "HCLOUD_LOAD_BALANCERS_ATTACH_RETRY_DELAY";
pub const ENV_LB_NAME_PREFIX: &str = "HCLOUD_LOAD_BALANCERS_NAME_PREFIX";

const TOKEN_LENGTH: usize = 64;

/// Defaults applied to every load balancer unless a Service annotation overrides them
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadBalancerDefaults {
    pub location: Option<String>,
    pub network_zone: Option<String>,
    pub use_private_ip: bool,
    pub disable_private_ingress: bool,
    pub disable_public_network: bool,
    pub disable_ipv6: bool,
    /// Prepended to generated load balancer names, usually the cluster name
    pub name_prefix: Option<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub token: String,
    pub endpoint: String,
    /// Target private network, by ID or name
    pub network: Option<String>,
    pub enabled: bool,
    pub action_poll_interval: Duration,
    pub attach_retry_delay: Duration,
    pub load_balancer: LoadBalancerDefaults,
}

impl fmt::Debug for ControllerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerConfig")
            .field("token", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("network", &self.network)
            .field("enabled", &self.enabled)
            .field("action_poll_interval", &self.action_poll_interval)
            .field("attach_retry_delay", &self.attach_retry_delay)
            .field("load_balancer", &self.load_balancer)
            .finish()
    }
}

/// Collects parse failures instead of stopping at the first one
struct Loader<F> {
    lookup: F,
    errors: Vec<String>,
}

impl<F: Fn(&str) -> Option<String>> Loader<F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T>(
        &mut self,
        key: &str,
        default: T,
        parse: fn(&str) -> std::result::Result<T, String>,
    ) -> T {
        match self.string(key) {
            None => default,
            Some(v) => parse(&v).unwrap_or_else(|reason| {
                self.errors.push(format!("{key}: {reason}"));
                default
            }),
        }
    }

    fn bool(&mut self, key: &str, default: bool) -> bool {
        self.parsed(key, default, parse_bool)
    }

    fn duration(&mut self, key: &str, default: Duration) -> Duration {
        self.parsed(key, default, parse_duration)
    }
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut env = Loader {
            lookup,
            errors: Vec::new(),
        };

        let token = env.string(ENV_TOKEN).unwrap_or_default();
        if token.is_empty() {
            env.errors.push(format!("{ENV_TOKEN}: required"));
        } else if token.len() != TOKEN_LENGTH {
            env.errors
                .push(format!("{ENV_TOKEN}: must be {TOKEN_LENGTH} characters"));
        }

        let config = ControllerConfig {
            token,
            endpoint: env
                .string(ENV_ENDPOINT)
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            network: env.string(ENV_NETWORK),
            enabled: env.bool(ENV_LB_ENABLED, true),
            action_poll_interval: env.duration(ENV_ACTION_POLL_INTERVAL, DEFAULT_POLL_INTERVAL),
            attach_retry_delay: env.duration(ENV_LB_ATTACH_RETRY_DELAY, DEFAULT_RETRY_DELAY),
            load_balancer: LoadBalancerDefaults {
                location: env.string(ENV_LB_LOCATION),
                network_zone: env.string(ENV_LB_NETWORK_ZONE),
                use_private_ip: env.bool(ENV_LB_USE_PRIVATE_IP, false),
                disable_private_ingress: env.bool(ENV_LB_DISABLE_PRIVATE_INGRESS, false),
                disable_public_network: env.bool(ENV_LB_DISABLE_PUBLIC_NETWORK, false),
                disable_ipv6: env.bool(ENV_LB_DISABLE_IPV6, false),
                name_prefix: env.string(ENV_LB_NAME_PREFIX),
            },
        };

        if config.action_poll_interval.is_zero() {
            env.errors
                .push(format!("{ENV_ACTION_POLL_INTERVAL}: must be greater than zero"));
        }
        if config.load_balancer.use_private_ip && config.network.is_none() {
            env.errors.push(format!(
                "{ENV_LB_USE_PRIVATE_IP}: requires {ENV_NETWORK} to be set"
            ));
        }

        if env.errors.is_empty() {
            Ok(config)
        } else {
            Err(Error::ConfigError(env.errors.join("; ")))
        }
    }
}
