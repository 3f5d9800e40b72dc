//! Service annotations understood by the controller
//!
//! The annotation set is the declarative configuration surface of a
//! `LoadBalancer` Service. Every accessor returns `Ok(None)` when the
//! annotation is absent and an [`Error::Annotation`] when it is present but
//! malformed.

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use k8s_openapi::api::core::v1::Service;

use crate::cloud::types::{Algorithm, Protocol};
use crate::error::{Error, Result};

/// Label on the backend load balancer carrying the Service UID
pub const LABEL_SERVICE_UID: &str = "hcloud-ccm/service-uid";

/// A typed Service annotation key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Annotation(&'static str);

impl Annotation {
    // Identity and placement
    pub const NAME: Annotation = Annotation("load-balancer.hetzner.cloud/name");
    pub const LOCATION: Annotation = Annotation("load-balancer.hetzner.cloud/location");
    pub const NETWORK_ZONE: Annotation = Annotation("load-balancer.hetzner.cloud/network-zone");
    pub const HOSTNAME: Annotation = Annotation("load-balancer.hetzner.cloud/hostname");

    // Shape
    pub const TYPE: Annotation = Annotation("load-balancer.hetzner.cloud/type");
    pub const ALGORITHM: Annotation = Annotation("load-balancer.hetzner.cloud/algorithm-type");

    // Networking
    pub const USE_PRIVATE_IP: Annotation = Annotation("load-balancer.hetzner.cloud/use-private-ip");
    pub const PRIVATE_IPV4: Annotation = Annotation("load-balancer.hetzner.cloud/private-ipv4");
    pub const DISABLE_PUBLIC_NETWORK: Annotation =
        Annotation("load-balancer.hetzner.cloud/disable-public-network");
    pub const DISABLE_PRIVATE_INGRESS: Annotation =
        Annotation("load-balancer.hetzner.cloud/disable-private-ingress");
    pub const IPV6_DISABLED: Annotation = Annotation("load-balancer.hetzner.cloud/ipv6-disabled");

    // Per-port service
    pub const PROTOCOL: Annotation = Annotation("load-balancer.hetzner.cloud/protocol");
    pub const USES_PROXYPROTOCOL: Annotation =
        Annotation("load-balancer.hetzner.cloud/uses-proxyprotocol");
    pub const HTTP_COOKIE_NAME: Annotation = Annotation("load-balancer.hetzner.cloud/http-cookie-name");
    pub const HTTP_COOKIE_LIFETIME: Annotation =
        Annotation("load-balancer.hetzner.cloud/http-cookie-lifetime");
    pub const HTTP_CERTIFICATES: Annotation =
        Annotation("load-balancer.hetzner.cloud/http-certificates");
    pub const HTTP_REDIRECT_HTTP: Annotation =
        Annotation("load-balancer.hetzner.cloud/http-redirect-http");
    pub const HTTP_STICKY_SESSIONS: Annotation =
        Annotation("load-balancer.hetzner.cloud/http-sticky-sessions");

    // Health check
    pub const HEALTH_CHECK_PROTOCOL: Annotation =
        Annotation("load-balancer.hetzner.cloud/health-check-protocol");
    pub const HEALTH_CHECK_PORT: Annotation = Annotation("load-balancer.hetzner.cloud/health-check-port");
    pub const HEALTH_CHECK_INTERVAL: Annotation =
        Annotation("load-balancer.hetzner.cloud/health-check-interval");
    pub const HEALTH_CHECK_TIMEOUT: Annotation =
        Annotation("load-balancer.hetzner.cloud/health-check-timeout");
    pub const HEALTH_CHECK_RETRIES: Annotation =
        Annotation("load-balancer.hetzner.cloud/health-check-retries");
    pub const HEALTH_CHECK_HTTP_DOMAIN: Annotation =
        Annotation("load-balancer.hetzner.cloud/health-check-http-domain");
    pub const HEALTH_CHECK_HTTP_PATH: Annotation =
        Annotation("load-balancer.hetzner.cloud/health-check-http-path");
    pub const HEALTH_CHECK_HTTP_VALIDATE_CERTIFICATE: Annotation =
        Annotation("load-balancer.hetzner.cloud/health-check-http-validate-certificate");
    pub const HEALTH_CHECK_HTTP_STATUS_CODES: Annotation =
        Annotation("load-balancer.hetzner.cloud/health-check-http-status-codes");

    // Targeting
    pub const NODE_SELECTOR: Annotation = Annotation("load-balancer.hetzner.cloud/node-selector");

    /// Annotations that make the health check an explicit override
    pub const HEALTH_CHECK: [Annotation; 9] = [
        Self::HEALTH_CHECK_PROTOCOL,
        Self::HEALTH_CHECK_PORT,
        Self::HEALTH_CHECK_INTERVAL,
        Self::HEALTH_CHECK_TIMEOUT,
        Self::HEALTH_CHECK_RETRIES,
        Self::HEALTH_CHECK_HTTP_DOMAIN,
        Self::HEALTH_CHECK_HTTP_PATH,
        Self::HEALTH_CHECK_HTTP_VALIDATE_CERTIFICATE,
        Self::HEALTH_CHECK_HTTP_STATUS_CODES,
    ];

    pub const fn key(&self) -> &'static str {
        self.0
    }

    /// Raw annotation value
    pub fn raw<'a>(&self, svc: &'a Service) -> Option<&'a str> {
        svc.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(self.0))
            .map(String::as_str)
    }

    pub fn is_set(&self, svc: &Service) -> bool {
        self.raw(svc).is_some()
    }

    fn parse_with<T>(
        &self,
        svc: &Service,
        parse: impl FnOnce(&str) -> std::result::Result<T, String>,
    ) -> Result<Option<T>> {
        self.raw(svc)
            .map(|v| parse(v.trim()).map_err(|reason| Error::annotation(self.0, reason)))
            .transpose()
    }

    pub fn string(&self, svc: &Service) -> Result<Option<String>> {
        self.parse_with(svc, |v| Ok(v.to_string()))
    }

    pub fn bool(&self, svc: &Service) -> Result<Option<bool>> {
        self.parse_with(svc, parse_bool)
    }

    pub fn int<T: FromStr>(&self, svc: &Service) -> Result<Option<T>> {
        self.parse_with(svc, |v| {
            v.parse::<T>()
                .map_err(|_| format!("invalid integer {v:?}"))
        })
    }

    /// Duration truncated to whole seconds, the precision the backend keeps
    pub fn seconds(&self, svc: &Service) -> Result<Option<Duration>> {
        self.parse_with(svc, |v| {
            parse_duration(v).map(|d| Duration::from_secs(d.as_secs()))
        })
    }

    /// Comma separated list; empty items are dropped
    pub fn string_list(&self, svc: &Service) -> Result<Option<Vec<String>>> {
        self.parse_with(svc, |v| Ok(split_list(v)))
    }

    pub fn protocol(&self, svc: &Service) -> Result<Option<Protocol>> {
        self.parse_with(svc, |v| v.to_ascii_lowercase().parse::<Protocol>())
    }

    pub fn algorithm(&self, svc: &Service) -> Result<Option<Algorithm>> {
        self.parse_with(svc, |v| v.to_ascii_lowercase().parse::<Algorithm>())
    }

    pub fn ipv4(&self, svc: &Service) -> Result<Option<Ipv4Addr>> {
        self.parse_with(svc, |v| {
            v.parse::<Ipv4Addr>()
                .map_err(|_| format!("invalid IPv4 address {v:?}"))
        })
    }
}

impl std::fmt::Display for Annotation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

pub fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Accepts `1`, `t`, `true`, `0`, `f`, `false` in any common casing
pub fn parse_bool(v: &str) -> std::result::Result<bool, String> {
    match v {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        other => Err(format!("invalid boolean {other:?}")),
    }
}

/// Parse durations like `300ms`, `15s`, `1m30s` or `1.5h`
pub fn parse_duration(v: &str) -> std::result::Result<Duration, String> {
    if v == "0" {
        return Ok(Duration::ZERO);
    }
    if v.is_empty() {
        return Err("empty duration".to_string());
    }

    let invalid = || format!("invalid duration {v:?}");
    let mut nanos: u128 = 0;
    let mut rest = v;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(invalid());
        }
        let (whole, frac) = rest[..num_len].split_once('.').unwrap_or((&rest[..num_len], ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit: u128 = match &rest[..unit_len] {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            "" => return Err(format!("missing unit in duration {v:?}")),
            unit => return Err(format!("unknown unit {unit:?} in duration {v:?}")),
        };
        rest = &rest[unit_len..];

        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let mut part = whole.checked_mul(unit).ok_or_else(invalid)?;
        if !frac.is_empty() {
            let digits: u128 = frac.parse().map_err(|_| invalid())?;
            let scale = 10u128
                .checked_pow(frac.len() as u32)
                .ok_or_else(invalid)?;
            part += digits.checked_mul(unit).ok_or_else(invalid)? / scale;
        }
        nanos = nanos.checked_add(part).ok_or_else(invalid)?;
    }

    u64::try_from(nanos)
        .map(Duration::from_nanos)
        .map_err(|_| format!("duration {v:?} out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn service(annotations: &[(&Annotation, &str)]) -> Service {
        Service {
            metadata: ObjectMeta {
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.key().to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_absent_annotation_is_none() {
        let svc = Service::default();
        assert_eq!(Annotation::USE_PRIVATE_IP.bool(&svc).unwrap(), None);
        assert_eq!(Annotation::HEALTH_CHECK_INTERVAL.seconds(&svc).unwrap(), None);
        assert!(!Annotation::NAME.is_set(&svc));
    }

    #[test]
    fn test_typed_values() {
        let svc = service(&[
            (&Annotation::USE_PRIVATE_IP, "True"),
            (&Annotation::HEALTH_CHECK_PORT, "8080"),
            (&Annotation::HEALTH_CHECK_INTERVAL, "1m30s"),
            (&Annotation::HTTP_CERTIFICATES, "a, b,,c"),
            (&Annotation::PROTOCOL, "HTTPS"),
            (&Annotation::ALGORITHM, "least_connections"),
            (&Annotation::PRIVATE_IPV4, "10.0.0.5"),
        ]);
        assert_eq!(Annotation::USE_PRIVATE_IP.bool(&svc).unwrap(), Some(true));
        assert_eq!(Annotation::HEALTH_CHECK_PORT.int::<u16>(&svc).unwrap(), Some(8080));
        assert_eq!(
            Annotation::HEALTH_CHECK_INTERVAL.seconds(&svc).unwrap(),
            Some(Duration::from_secs(90))
        );
        assert_eq!(
            Annotation::HTTP_CERTIFICATES.string_list(&svc).unwrap(),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert_eq!(Annotation::PROTOCOL.protocol(&svc).unwrap(), Some(Protocol::Https));
        assert_eq!(
            Annotation::ALGORITHM.algorithm(&svc).unwrap(),
            Some(Algorithm::LeastConnections)
        );
        assert_eq!(
            Annotation::PRIVATE_IPV4.ipv4(&svc).unwrap(),
            Some(Ipv4Addr::new(10, 0, 0, 5))
        );
    }

    #[test]
    fn test_malformed_value_names_key() {
        let svc = service(&[(&Annotation::HEALTH_CHECK_RETRIES, "three")]);
        let err = Annotation::HEALTH_CHECK_RETRIES.int::<u32>(&svc).unwrap_err();
        assert!(err
            .to_string()
            .contains("load-balancer.hetzner.cloud/health-check-retries"));
        assert_eq!(err.kind(), "annotation");
    }

    #[test]
    fn test_seconds_drop_fraction() {
        let svc = service(&[
            (&Annotation::HEALTH_CHECK_INTERVAL, "1500ms"),
            (&Annotation::HTTP_COOKIE_LIFETIME, "90.5s"),
            (&Annotation::HEALTH_CHECK_TIMEOUT, "900ms"),
        ]);
        assert_eq!(
            Annotation::HEALTH_CHECK_INTERVAL.seconds(&svc).unwrap(),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            Annotation::HTTP_COOKIE_LIFETIME.seconds(&svc).unwrap(),
            Some(Duration::from_secs(90))
        );
        assert_eq!(
            Annotation::HEALTH_CHECK_TIMEOUT.seconds(&svc).unwrap(),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(7200)));
        assert_eq!(parse_duration("1.5s"), Ok(Duration::from_millis(1500)));
        assert_eq!(parse_duration("0"), Ok(Duration::ZERO));
        assert!(parse_duration("15").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("1"), Ok(true));
        assert_eq!(parse_bool("f"), Ok(false));
        assert!(parse_bool("yes").is_err());
    }
}
