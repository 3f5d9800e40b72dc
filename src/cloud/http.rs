//! Hetzner Cloud REST API client
//!
//! Implements every port in [`super::client`] over HTTPS/JSON. Wire structs are
//! private to this module and converted into the domain model in
//! [`super::types`].

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::client::{ActionClient, CertificateClient, LoadBalancerClient, NetworkClient};
use super::types::{
    Action, ActionError, ActionStatus, AddServiceOpts, Algorithm, Certificate, CreateOpts,
    HealthCheck, HealthCheckHttp, HealthCheckOpts, LoadBalancer, LoadBalancerService, Network,
    PrivateNet, Protocol, PublicNet, ServiceHttp, ServiceHttpOpts, Target, UpdateOpts,
    UpdateServiceOpts,
};
use crate::error::{Error, ErrorCode, Result};

pub const DEFAULT_ENDPOINT: &str = "https://api.hetzner.cloud/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the Hetzner Cloud API
#[derive(Clone)]
pub struct HcloudClient {
    http: Client,
    endpoint: String,
    token: String,
}

impl HcloudClient {
    pub fn new(endpoint: &str, token: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent(concat!("hcloud-lb-controller/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(Error::HttpError)?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        #[cfg(feature = "metrics")]
        crate::controller::metrics::inc_cloud_api_call(&format!("{method} {}", route_of(path)));

        self.http
            .request(method, format!("{}{}", self.endpoint, path))
            .bearer_auth(&self.token)
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = req.send().await?;
        let resp = check_status(resp).await?;
        Ok(resp.json::<T>().await?)
    }

    /// GET a single object; a 404 is reported as `None`
    async fn get_opt<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let resp = self.request(Method::GET, path).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status(resp).await?;
        Ok(Some(resp.json::<T>().await?))
    }

    async fn action(&self, lb_id: i64, command: &str, body: Value) -> Result<Action> {
        debug!(load_balancer = lb_id, command, "Issuing load balancer action");
        let path = format!("/load_balancers/{lb_id}/actions/{command}");
        let resp: ActionEnvelope = self
            .send(self.request(Method::POST, &path).json(&body))
            .await?;
        Ok(resp.action.into())
    }
}

/// Collapse numeric path segments so metric labels stay bounded
#[cfg_attr(not(feature = "metrics"), allow(dead_code))]
fn route_of(path: &str) -> String {
    path.split('?')
        .next()
        .unwrap_or_default()
        .split('/')
        .map(|seg| {
            if !seg.is_empty() && seg.chars().all(|c| c.is_ascii_digit()) {
                "{id}"
            } else {
                seg
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

async fn check_status(resp: Response) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(env) => Err(Error::CloudApi {
            code: ErrorCode::parse(&env.error.code),
            message: env.error.message,
        }),
        Err(_) => Err(Error::CloudApi {
            code: ErrorCode::Other(status.as_u16().to_string()),
            message: format!("HTTP {status}: {body}"),
        }),
    }
}

// ── wire format ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: WireError,
}

#[derive(Deserialize)]
struct WireError {
    code: String,
    message: String,
}

#[derive(Deserialize)]
struct ActionEnvelope {
    action: WireAction,
}

#[derive(Deserialize)]
struct WireAction {
    id: i64,
    command: String,
    status: String,
    progress: u8,
    error: Option<WireActionError>,
}

#[derive(Deserialize)]
struct WireActionError {
    code: String,
    message: String,
}

impl From<WireAction> for Action {
    fn from(a: WireAction) -> Self {
        let status = match a.status.as_str() {
            "success" => ActionStatus::Success,
            "error" => ActionStatus::Error,
            _ => ActionStatus::Running,
        };
        Action {
            id: a.id,
            command: a.command,
            status,
            progress: a.progress,
            error: a.error.map(|e| ActionError {
                code: e.code,
                message: e.message,
            }),
        }
    }
}

#[derive(Deserialize)]
struct LoadBalancerEnvelope {
    load_balancer: WireLoadBalancer,
}

#[derive(Deserialize)]
struct CreateLoadBalancerEnvelope {
    load_balancer: WireLoadBalancer,
    action: WireAction,
}

#[derive(Deserialize)]
struct LoadBalancerList {
    load_balancers: Vec<WireLoadBalancer>,
}

#[derive(Deserialize)]
struct WireNamed {
    name: String,
}

#[derive(Deserialize)]
struct WireLocation {
    name: String,
    network_zone: String,
}

#[derive(Deserialize)]
struct WireAlgorithm {
    #[serde(rename = "type")]
    type_: String,
}

#[derive(Deserialize)]
struct WireIp<T> {
    ip: T,
}

#[derive(Deserialize)]
struct WirePublicNet {
    enabled: bool,
    ipv4: Option<WireIp<Option<Ipv4Addr>>>,
    ipv6: Option<WireIp<Option<Ipv6Addr>>>,
}

#[derive(Deserialize)]
struct WirePrivateNet {
    network: i64,
    ip: Ipv4Addr,
}

#[derive(Deserialize)]
struct WireProtection {
    delete: bool,
}

#[derive(Deserialize)]
struct WireServiceHttp {
    #[serde(default)]
    cookie_name: String,
    #[serde(default)]
    cookie_lifetime: u64,
    #[serde(default)]
    certificates: Vec<i64>,
    #[serde(default)]
    redirect_http: bool,
    #[serde(default)]
    sticky_sessions: bool,
}

#[derive(Deserialize)]
struct WireHealthCheckHttp {
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    path: String,
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    status_codes: Vec<String>,
    #[serde(default)]
    tls: bool,
}

#[derive(Deserialize)]
struct WireHealthCheck {
    protocol: String,
    port: u16,
    interval: u64,
    timeout: u64,
    retries: u32,
    http: Option<WireHealthCheckHttp>,
}

#[derive(Deserialize)]
struct WireService {
    protocol: String,
    listen_port: u16,
    destination_port: u16,
    proxyprotocol: bool,
    http: Option<WireServiceHttp>,
    health_check: WireHealthCheck,
}

#[derive(Deserialize)]
struct WireServerRef {
    id: i64,
}

#[derive(Deserialize)]
struct WireTarget {
    #[serde(rename = "type")]
    type_: String,
    server: Option<WireServerRef>,
    #[serde(default)]
    use_private_ip: bool,
}

#[derive(Deserialize)]
struct WireLoadBalancer {
    id: i64,
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    algorithm: WireAlgorithm,
    load_balancer_type: WireNamed,
    location: WireLocation,
    public_net: WirePublicNet,
    #[serde(default)]
    private_net: Vec<WirePrivateNet>,
    #[serde(default)]
    services: Vec<WireService>,
    #[serde(default)]
    targets: Vec<WireTarget>,
    protection: WireProtection,
}

fn parse_protocol(p: &str) -> Result<Protocol> {
    p.parse::<Protocol>().map_err(Error::ValidationError)
}

impl TryFrom<WireHealthCheck> for HealthCheck {
    type Error = Error;

    fn try_from(hc: WireHealthCheck) -> Result<Self> {
        Ok(HealthCheck {
            protocol: parse_protocol(&hc.protocol)?,
            port: hc.port,
            interval: Duration::from_secs(hc.interval),
            timeout: Duration::from_secs(hc.timeout),
            retries: hc.retries,
            http: hc.http.map(|h| HealthCheckHttp {
                domain: h.domain.unwrap_or_default(),
                path: h.path,
                response: h.response.unwrap_or_default(),
                status_codes: h.status_codes,
                tls: h.tls,
            }),
        })
    }
}

impl TryFrom<WireService> for LoadBalancerService {
    type Error = Error;

    fn try_from(s: WireService) -> Result<Self> {
        Ok(LoadBalancerService {
            protocol: parse_protocol(&s.protocol)?,
            listen_port: s.listen_port,
            destination_port: s.destination_port,
            proxyprotocol: s.proxyprotocol,
            http: s.http.map(|h| ServiceHttp {
                cookie_name: h.cookie_name,
                cookie_lifetime: Duration::from_secs(h.cookie_lifetime),
                certificates: h.certificates,
                redirect_http: h.redirect_http,
                sticky_sessions: h.sticky_sessions,
            }),
            health_check: s.health_check.try_into()?,
        })
    }
}

impl TryFrom<WireLoadBalancer> for LoadBalancer {
    type Error = Error;

    fn try_from(lb: WireLoadBalancer) -> Result<Self> {
        let algorithm = lb
            .algorithm
            .type_
            .parse::<Algorithm>()
            .map_err(Error::ValidationError)?;
        let services = lb
            .services
            .into_iter()
            .map(LoadBalancerService::try_from)
            .collect::<Result<Vec<_>>>()?;
        // Label selector and IP targets are not managed by this controller
        let targets = lb
            .targets
            .into_iter()
            .filter(|t| t.type_ == "server")
            .filter_map(|t| {
                t.server.map(|s| Target {
                    server_id: s.id,
                    use_private_ip: t.use_private_ip,
                })
            })
            .collect();

        Ok(LoadBalancer {
            id: lb.id,
            name: lb.name,
            labels: lb.labels,
            algorithm,
            load_balancer_type: lb.load_balancer_type.name,
            location: lb.location.name,
            network_zone: lb.location.network_zone,
            public_net: PublicNet {
                enabled: lb.public_net.enabled,
                ipv4: lb.public_net.ipv4.and_then(|a| a.ip),
                ipv6: lb.public_net.ipv6.and_then(|a| a.ip),
            },
            private_net: lb
                .private_net
                .into_iter()
                .map(|n| PrivateNet {
                    network_id: n.network,
                    ip: n.ip,
                })
                .collect(),
            services,
            targets,
            delete_protection: lb.protection.delete,
        })
    }
}

#[derive(Deserialize)]
struct CertificateList {
    certificates: Vec<WireNamedObject>,
}

#[derive(Deserialize)]
struct NetworkList {
    networks: Vec<WireNamedObject>,
}

#[derive(Deserialize)]
struct NetworkEnvelope {
    network: WireNamedObject,
}

#[derive(Deserialize)]
struct WireNamedObject {
    id: i64,
    name: String,
}

#[derive(Serialize)]
struct WireServiceHttpOpts<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    cookie_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cookie_lifetime: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    certificates: Option<&'a [i64]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    redirect_http: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sticky_sessions: Option<bool>,
}

impl<'a> From<&'a ServiceHttpOpts> for WireServiceHttpOpts<'a> {
    fn from(o: &'a ServiceHttpOpts) -> Self {
        Self {
            cookie_name: o.cookie_name.as_deref(),
            cookie_lifetime: o.cookie_lifetime.map(|d| d.as_secs()),
            certificates: o.certificates.as_deref(),
            redirect_http: o.redirect_http,
            sticky_sessions: o.sticky_sessions,
        }
    }
}

#[derive(Serialize)]
struct WireHealthCheckHttpOpts<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    domain: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_codes: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls: Option<bool>,
}

#[derive(Serialize)]
struct WireHealthCheckOpts<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    protocol: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    http: Option<WireHealthCheckHttpOpts<'a>>,
}

impl<'a> From<&'a HealthCheckOpts> for WireHealthCheckOpts<'a> {
    fn from(o: &'a HealthCheckOpts) -> Self {
        Self {
            protocol: o.protocol.map(|p| p.as_str()),
            port: o.port,
            interval: o.interval.map(|d| d.as_secs()),
            timeout: o.timeout.map(|d| d.as_secs()),
            retries: o.retries,
            http: o.http.as_ref().map(|h| WireHealthCheckHttpOpts {
                domain: h.domain.as_deref(),
                path: h.path.as_deref(),
                status_codes: h.status_codes.as_deref(),
                tls: h.tls,
            }),
        }
    }
}

#[derive(Serialize)]
struct WireServiceOpts<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    protocol: Option<&'static str>,
    listen_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    destination_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxyprotocol: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    http: Option<WireServiceHttpOpts<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    health_check: Option<WireHealthCheckOpts<'a>>,
}

// ── ports ───────────────────────────────────────────────────────────────────

#[async_trait]
impl LoadBalancerClient for HcloudClient {
    async fn get_by_id(&self, id: i64) -> Result<Option<LoadBalancer>> {
        self.get_opt::<LoadBalancerEnvelope>(&format!("/load_balancers/{id}"))
            .await?
            .map(|env| LoadBalancer::try_from(env.load_balancer))
            .transpose()
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<LoadBalancer>> {
        let list: LoadBalancerList = self
            .send(
                self.request(Method::GET, "/load_balancers")
                    .query(&[("name", name)]),
            )
            .await?;
        list.load_balancers
            .into_iter()
            .next()
            .map(LoadBalancer::try_from)
            .transpose()
    }

    async fn list_by_label(&self, selector: &str) -> Result<Vec<LoadBalancer>> {
        let list: LoadBalancerList = self
            .send(
                self.request(Method::GET, "/load_balancers")
                    .query(&[("label_selector", selector)]),
            )
            .await?;
        list.load_balancers
            .into_iter()
            .map(LoadBalancer::try_from)
            .collect()
    }

    async fn create(&self, opts: &CreateOpts) -> Result<(LoadBalancer, Action)> {
        let mut body = json!({
            "name": opts.name,
            "load_balancer_type": opts.load_balancer_type,
            "algorithm": { "type": opts.algorithm.as_str() },
            "labels": opts.labels,
            "public_interface": opts.public_interface,
        });
        if let Some(location) = &opts.location {
            body["location"] = json!(location);
        } else if let Some(zone) = &opts.network_zone {
            body["network_zone"] = json!(zone);
        }
        if let Some(network) = opts.network {
            body["network"] = json!(network);
        }

        let resp = self
            .request(Method::POST, "/load_balancers")
            .json(&body)
            .send()
            .await?;
        let resp = check_status(resp).await.map_err(|e| {
            if e.has_code(&[ErrorCode::UniquenessError]) {
                Error::AlreadyExists(format!("load balancer {}", opts.name))
            } else {
                e
            }
        })?;
        let env: CreateLoadBalancerEnvelope = resp.json().await?;
        Ok((env.load_balancer.try_into()?, env.action.into()))
    }

    async fn update(&self, id: i64, opts: &UpdateOpts) -> Result<LoadBalancer> {
        let mut body = json!({});
        if let Some(name) = &opts.name {
            body["name"] = json!(name);
        }
        if let Some(labels) = &opts.labels {
            body["labels"] = json!(labels);
        }
        let env: LoadBalancerEnvelope = self
            .send(
                self.request(Method::PUT, &format!("/load_balancers/{id}"))
                    .json(&body),
            )
            .await?;
        env.load_balancer.try_into()
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let resp = self
            .request(Method::DELETE, &format!("/load_balancers/{id}"))
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }

    async fn change_algorithm(&self, id: i64, algorithm: Algorithm) -> Result<Action> {
        self.action(id, "change_algorithm", json!({ "type": algorithm.as_str() }))
            .await
    }

    async fn change_type(&self, id: i64, load_balancer_type: &str) -> Result<Action> {
        self.action(
            id,
            "change_type",
            json!({ "load_balancer_type": load_balancer_type }),
        )
        .await
    }

    async fn attach_to_network(
        &self,
        id: i64,
        network_id: i64,
        ip: Option<Ipv4Addr>,
    ) -> Result<Action> {
        let mut body = json!({ "network": network_id });
        if let Some(ip) = ip {
            body["ip"] = json!(ip.to_string());
        }
        self.action(id, "attach_to_network", body).await
    }

    async fn detach_from_network(&self, id: i64, network_id: i64) -> Result<Action> {
        self.action(id, "detach_from_network", json!({ "network": network_id }))
            .await
    }

    async fn enable_public_interface(&self, id: i64) -> Result<Action> {
        self.action(id, "enable_public_interface", json!({})).await
    }

    async fn disable_public_interface(&self, id: i64) -> Result<Action> {
        self.action(id, "disable_public_interface", json!({})).await
    }

    async fn add_server_target(
        &self,
        id: i64,
        server_id: i64,
        use_private_ip: bool,
    ) -> Result<Action> {
        self.action(
            id,
            "add_target",
            json!({
                "type": "server",
                "server": { "id": server_id },
                "use_private_ip": use_private_ip,
            }),
        )
        .await
    }

    async fn remove_server_target(&self, id: i64, server_id: i64) -> Result<Action> {
        self.action(
            id,
            "remove_target",
            json!({ "type": "server", "server": { "id": server_id } }),
        )
        .await
    }

    async fn add_service(&self, id: i64, opts: &AddServiceOpts) -> Result<Action> {
        let body = WireServiceOpts {
            protocol: Some(opts.protocol.as_str()),
            listen_port: opts.listen_port,
            destination_port: Some(opts.destination_port),
            proxyprotocol: Some(opts.proxyprotocol),
            http: opts.http.as_ref().map(Into::into),
            health_check: opts.health_check.as_ref().map(Into::into),
        };
        self.action(id, "add_service", serde_json::to_value(&body)?)
            .await
    }

    async fn update_service(
        &self,
        id: i64,
        listen_port: u16,
        opts: &UpdateServiceOpts,
    ) -> Result<Action> {
        let body = WireServiceOpts {
            protocol: opts.protocol.map(|p| p.as_str()),
            listen_port,
            destination_port: opts.destination_port,
            proxyprotocol: opts.proxyprotocol,
            http: opts.http.as_ref().map(Into::into),
            health_check: opts.health_check.as_ref().map(Into::into),
        };
        self.action(id, "update_service", serde_json::to_value(&body)?)
            .await
    }

    async fn delete_service(&self, id: i64, listen_port: u16) -> Result<Action> {
        self.action(id, "delete_service", json!({ "listen_port": listen_port }))
            .await
    }
}

#[async_trait]
impl CertificateClient for HcloudClient {
    async fn get_by_name(&self, name: &str) -> Result<Option<Certificate>> {
        let list: CertificateList = self
            .send(
                self.request(Method::GET, "/certificates")
                    .query(&[("name", name)]),
            )
            .await?;
        Ok(list.certificates.into_iter().next().map(|c| Certificate {
            id: c.id,
            name: c.name,
        }))
    }
}

#[async_trait]
impl NetworkClient for HcloudClient {
    async fn get_by_id(&self, id: i64) -> Result<Option<Network>> {
        Ok(self
            .get_opt::<NetworkEnvelope>(&format!("/networks/{id}"))
            .await?
            .map(|env| Network {
                id: env.network.id,
                name: env.network.name,
            }))
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Network>> {
        let list: NetworkList = self
            .send(self.request(Method::GET, "/networks").query(&[("name", name)]))
            .await?;
        Ok(list.networks.into_iter().next().map(|n| Network {
            id: n.id,
            name: n.name,
        }))
    }
}

#[async_trait]
impl ActionClient for HcloudClient {
    async fn get_by_id(&self, id: i64) -> Result<Action> {
        let env: ActionEnvelope = self
            .send(self.request(Method::GET, &format!("/actions/{id}")))
            .await?;
        Ok(env.action.into())
    }
}
