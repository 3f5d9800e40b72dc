//! Desired configuration of one load balancer service (listen port)
//!
//! [`ServiceOptsBuilder`] parses the Service annotations once per port and
//! serves the result both as options for adding a new backend service and as
//! options for updating an existing one. Parsing stops at the first malformed
//! annotation.

use std::time::Duration;

use k8s_openapi::api::core::v1::{Service, ServicePort};
use tracing::debug;

use crate::annotations::Annotation;
use crate::cloud::client::CertificateClient;
use crate::cloud::types::{
    AddServiceOpts, HealthCheckHttpOpts, HealthCheckOpts, Protocol, ServiceHttpOpts,
    UpdateServiceOpts,
};
use crate::error::{Error, Result, ResultExt};

/// Upper bound for resolving one certificate name
pub const CERTIFICATE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
struct Extracted {
    destination_port: u16,
    protocol: Protocol,
    proxyprotocol: bool,
    http: Option<ServiceHttpOpts>,
    health_check: Option<HealthCheckOpts>,
}

enum Extraction {
    Pending,
    Done(Extracted),
    Failed(String),
}

pub struct ServiceOptsBuilder<'a> {
    service: &'a Service,
    port: &'a ServicePort,
    listen_port: u16,
    certificates: &'a dyn CertificateClient,
    state: Extraction,
}

fn to_port(value: i32, what: &str) -> Result<u16> {
    u16::try_from(value)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| Error::ValidationError(format!("invalid {what} {value}")))
}

impl<'a> ServiceOptsBuilder<'a> {
    pub fn new(
        service: &'a Service,
        port: &'a ServicePort,
        certificates: &'a dyn CertificateClient,
    ) -> Result<Self> {
        Ok(Self {
            service,
            port,
            listen_port: to_port(port.port, "port")?,
            certificates,
            state: Extraction::Pending,
        })
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Parse the annotations if that has not happened yet
    pub async fn extract(&mut self) -> Result<()> {
        match &self.state {
            Extraction::Done(_) => return Ok(()),
            Extraction::Failed(reason) => {
                return Err(Error::ValidationError(format!(
                    "port {}: {reason}",
                    self.listen_port
                )))
            }
            Extraction::Pending => {}
        }

        match self.parse().await {
            Ok(extracted) => {
                debug!(port = self.listen_port, ?extracted, "Extracted service options");
                self.state = Extraction::Done(extracted);
                Ok(())
            }
            Err(e) => {
                self.state = Extraction::Failed(e.to_string());
                Err(e)
            }
        }
    }

    fn extracted(&self) -> Result<&Extracted> {
        match &self.state {
            Extraction::Done(e) => Ok(e),
            _ => Err(Error::ValidationError(format!(
                "port {}: options not extracted",
                self.listen_port
            ))),
        }
    }

    pub async fn add_opts(&mut self) -> Result<AddServiceOpts> {
        self.extract().await?;
        let e = self.extracted()?;
        Ok(AddServiceOpts {
            protocol: e.protocol,
            listen_port: self.listen_port,
            destination_port: e.destination_port,
            proxyprotocol: e.proxyprotocol,
            http: e.http.clone(),
            health_check: e.health_check.clone(),
        })
    }

    pub async fn update_opts(&mut self) -> Result<UpdateServiceOpts> {
        self.extract().await?;
        let e = self.extracted()?;
        Ok(UpdateServiceOpts {
            protocol: Some(e.protocol),
            destination_port: Some(e.destination_port),
            proxyprotocol: Some(e.proxyprotocol),
            http: e.http.clone(),
            health_check: e.health_check.clone(),
        })
    }

    async fn parse(&self) -> Result<Extracted> {
        let svc = self.service;
        let destination_port = match self.port.node_port {
            Some(p) => to_port(p, "node port")?,
            None => {
                return Err(Error::ValidationError(format!(
                    "port {} has no node port",
                    self.listen_port
                )))
            }
        };

        let proxyprotocol = Annotation::USES_PROXYPROTOCOL.bool(svc)?.unwrap_or(false);
        let protocol = Annotation::PROTOCOL.protocol(svc)?.unwrap_or_default();

        let cookie_name = Annotation::HTTP_COOKIE_NAME.string(svc)?;
        let cookie_lifetime = Annotation::HTTP_COOKIE_LIFETIME.seconds(svc)?;
        let certificates = match Annotation::HTTP_CERTIFICATES.string_list(svc)? {
            Some(refs) => Some(
                self.resolve_certificates(&refs)
                    .await
                    .op("service_opts::resolve_certificates")?,
            ),
            None => None,
        };
        let redirect_http = Annotation::HTTP_REDIRECT_HTTP.bool(svc)?;
        let sticky_sessions = Annotation::HTTP_STICKY_SESSIONS.bool(svc)?;

        let http = ServiceHttpOpts {
            cookie_name,
            cookie_lifetime,
            certificates,
            redirect_http,
            sticky_sessions,
        };
        let http = (http != ServiceHttpOpts::default()).then_some(http);

        let health_check = self.parse_health_check(protocol, destination_port)?;

        Ok(Extracted {
            destination_port,
            protocol,
            proxyprotocol,
            http,
            health_check,
        })
    }

    /// Explicit health check, only if at least one health check annotation is set
    fn parse_health_check(
        &self,
        protocol: Protocol,
        destination_port: u16,
    ) -> Result<Option<HealthCheckOpts>> {
        let svc = self.service;
        if !Annotation::HEALTH_CHECK.iter().any(|a| a.is_set(svc)) {
            return Ok(None);
        }

        let hc_protocol = Annotation::HEALTH_CHECK_PROTOCOL
            .protocol(svc)?
            .unwrap_or(protocol);
        let port = Annotation::HEALTH_CHECK_PORT
            .int::<u16>(svc)?
            .unwrap_or(destination_port);
        let interval = Annotation::HEALTH_CHECK_INTERVAL.seconds(svc)?;
        let timeout = Annotation::HEALTH_CHECK_TIMEOUT.seconds(svc)?;
        let retries = Annotation::HEALTH_CHECK_RETRIES.int::<u32>(svc)?;

        let http = HealthCheckHttpOpts {
            domain: Annotation::HEALTH_CHECK_HTTP_DOMAIN.string(svc)?,
            path: Annotation::HEALTH_CHECK_HTTP_PATH.string(svc)?,
            tls: Annotation::HEALTH_CHECK_HTTP_VALIDATE_CERTIFICATE.bool(svc)?,
            status_codes: Annotation::HEALTH_CHECK_HTTP_STATUS_CODES.string_list(svc)?,
        };
        let http = (hc_protocol.is_http() && http != HealthCheckHttpOpts::default()).then_some(http);

        Ok(Some(HealthCheckOpts {
            protocol: Some(hc_protocol),
            port: Some(port),
            interval,
            timeout,
            retries,
            http,
        }))
    }

    /// Certificate IDs for references given either as ID or as name
    async fn resolve_certificates(&self, refs: &[String]) -> Result<Vec<i64>> {
        let mut ids = Vec::with_capacity(refs.len());
        for r in refs {
            if let Ok(id) = r.parse::<i64>() {
                ids.push(id);
                continue;
            }
            let cert = tokio::time::timeout(
                CERTIFICATE_LOOKUP_TIMEOUT,
                self.certificates.get_by_name(r),
            )
            .await
            .map_err(|_| Error::Timeout(format!("resolving certificate {r:?}")))??;
            match cert {
                Some(cert) => ids.push(cert.id),
                None => return Err(Error::NotFound(format!("certificate {r:?}"))),
            }
        }
        Ok(ids)
    }
}
