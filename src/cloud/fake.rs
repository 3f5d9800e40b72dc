//! In-memory cloud backend for tests
//!
//! Applies every mutation to its own state and records each call so tests can
//! assert the exact sequence the controller issued.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::client::{ActionClient, CertificateClient, LoadBalancerClient, NetworkClient};
use super::types::*;
use crate::error::{Error, ErrorCode, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    GetById(i64),
    GetByName(String),
    ListByLabel(String),
    Create(CreateOpts),
    Update(i64, UpdateOpts),
    Delete(i64),
    ChangeAlgorithm(i64, Algorithm),
    ChangeType(i64, String),
    AttachToNetwork(i64, i64),
    DetachFromNetwork(i64, i64),
    EnablePublicInterface(i64),
    DisablePublicInterface(i64),
    AddTarget {
        lb: i64,
        server: i64,
        use_private_ip: bool,
    },
    RemoveTarget {
        lb: i64,
        server: i64,
    },
    AddService {
        lb: i64,
        listen_port: u16,
        destination_port: u16,
    },
    UpdateService {
        lb: i64,
        listen_port: u16,
    },
    DeleteService {
        lb: i64,
        listen_port: u16,
    },
    GetCertificate(String),
    GetNetwork(String),
    GetAction(i64),
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::GetById(_) => "get_by_id",
            Call::GetByName(_) => "get_by_name",
            Call::ListByLabel(_) => "list_by_label",
            Call::Create(_) => "create",
            Call::Update(..) => "update",
            Call::Delete(_) => "delete",
            Call::ChangeAlgorithm(..) => "change_algorithm",
            Call::ChangeType(..) => "change_type",
            Call::AttachToNetwork(..) => "attach_to_network",
            Call::DetachFromNetwork(..) => "detach_from_network",
            Call::EnablePublicInterface(_) => "enable_public_interface",
            Call::DisablePublicInterface(_) => "disable_public_interface",
            Call::AddTarget { .. } => "add_target",
            Call::RemoveTarget { .. } => "remove_target",
            Call::AddService { .. } => "add_service",
            Call::UpdateService { .. } => "update_service",
            Call::DeleteService { .. } => "delete_service",
            Call::GetCertificate(_) => "get_certificate",
            Call::GetNetwork(_) => "get_network",
            Call::GetAction(_) => "get_action",
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            Call::GetById(_)
                | Call::GetByName(_)
                | Call::ListByLabel(_)
                | Call::GetCertificate(_)
                | Call::GetNetwork(_)
                | Call::GetAction(_)
        )
    }
}

#[derive(Default)]
struct State {
    load_balancers: BTreeMap<i64, LoadBalancer>,
    certificates: Vec<Certificate>,
    networks: Vec<Network>,
    next_id: i64,
    calls: Vec<Call>,
    failures: Vec<(&'static str, ErrorCode)>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    /// Record `call` and return an injected failure for it, if any
    fn record(&mut self, call: Call) -> Result<()> {
        let name = call.name();
        self.calls.push(call);
        match self.failures.iter().position(|(n, _)| *n == name) {
            Some(idx) => {
                let (_, code) = self.failures.remove(idx);
                Err(Error::CloudApi {
                    message: format!("injected {code} on {name}"),
                    code,
                })
            }
            None => Ok(()),
        }
    }

    fn lb_mut(&mut self, id: i64) -> Result<&mut LoadBalancer> {
        self.load_balancers.get_mut(&id).ok_or_else(|| Error::CloudApi {
            code: ErrorCode::NotFound,
            message: format!("load balancer {id} not found"),
        })
    }

    fn action(&mut self, command: &str) -> Action {
        Action {
            id: self.next_id(),
            command: command.to_string(),
            status: ActionStatus::Success,
            progress: 100,
            error: None,
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeCloud {
    state: Arc<Mutex<State>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Seed a load balancer; its ID is taken as-is
    pub fn insert(&self, lb: LoadBalancer) {
        let mut state = self.state();
        state.next_id = state.next_id.max(lb.id);
        state.load_balancers.insert(lb.id, lb);
    }

    pub fn add_certificate(&self, id: i64, name: &str) {
        self.state().certificates.push(Certificate {
            id,
            name: name.to_string(),
        });
    }

    pub fn add_network(&self, id: i64, name: &str) {
        self.state().networks.push(Network {
            id,
            name: name.to_string(),
        });
    }

    /// Make the next call named `call` fail with a cloud API error carrying `code`
    pub fn fail_next(&self, call: &'static str, code: ErrorCode) {
        self.state().failures.push((call, code));
    }

    pub fn get(&self, id: i64) -> Option<LoadBalancer> {
        self.state().load_balancers.get(&id).cloned()
    }

    pub fn load_balancers(&self) -> Vec<LoadBalancer> {
        self.state().load_balancers.values().cloned().collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn mutating_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| c.name() == name).count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }
}

/// A load balancer in `nbg1` with public IPs derived from its ID
pub fn load_balancer(id: i64, name: &str) -> LoadBalancer {
    LoadBalancer {
        id,
        name: name.to_string(),
        labels: BTreeMap::new(),
        algorithm: Algorithm::RoundRobin,
        load_balancer_type: DEFAULT_LOAD_BALANCER_TYPE.to_string(),
        location: "nbg1".to_string(),
        network_zone: "eu-central".to_string(),
        public_net: PublicNet {
            enabled: true,
            ipv4: Some(Ipv4Addr::new(203, 0, 113, (id % 250) as u8)),
            ipv6: Some(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, id as u16)),
        },
        private_net: vec![],
        services: vec![],
        targets: vec![],
        delete_protection: false,
    }
}

fn default_health_check(port: u16) -> HealthCheck {
    HealthCheck {
        protocol: Protocol::Tcp,
        port,
        interval: Duration::from_secs(15),
        timeout: Duration::from_secs(10),
        retries: 3,
        http: None,
    }
}

fn apply_http(current: &mut Option<ServiceHttp>, opts: &ServiceHttpOpts) {
    let http = current.get_or_insert_with(ServiceHttp::default);
    if let Some(v) = &opts.cookie_name {
        http.cookie_name = v.clone();
    }
    if let Some(v) = opts.cookie_lifetime {
        http.cookie_lifetime = v;
    }
    if let Some(v) = &opts.certificates {
        http.certificates = v.clone();
    }
    if let Some(v) = opts.redirect_http {
        http.redirect_http = v;
    }
    if let Some(v) = opts.sticky_sessions {
        http.sticky_sessions = v;
    }
}

fn apply_health_check(hc: &mut HealthCheck, opts: &HealthCheckOpts) {
    if let Some(v) = opts.protocol {
        hc.protocol = v;
    }
    if let Some(v) = opts.port {
        hc.port = v;
    }
    if let Some(v) = opts.interval {
        hc.interval = v;
    }
    if let Some(v) = opts.timeout {
        hc.timeout = v;
    }
    if let Some(v) = opts.retries {
        hc.retries = v;
    }
    if let Some(h) = &opts.http {
        let http = hc.http.get_or_insert_with(HealthCheckHttp::default);
        if let Some(v) = &h.domain {
            http.domain = v.clone();
        }
        if let Some(v) = &h.path {
            http.path = v.clone();
        }
        if let Some(v) = &h.status_codes {
            http.status_codes = v.clone();
        }
        if let Some(v) = h.tls {
            http.tls = v;
        }
    }
}

#[async_trait]
impl LoadBalancerClient for FakeCloud {
    async fn get_by_id(&self, id: i64) -> Result<Option<LoadBalancer>> {
        let mut state = self.state();
        state.record(Call::GetById(id))?;
        Ok(state.load_balancers.get(&id).cloned())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<LoadBalancer>> {
        let mut state = self.state();
        state.record(Call::GetByName(name.to_string()))?;
        Ok(state
            .load_balancers
            .values()
            .find(|lb| lb.name == name)
            .cloned())
    }

    async fn list_by_label(&self, selector: &str) -> Result<Vec<LoadBalancer>> {
        let mut state = self.state();
        state.record(Call::ListByLabel(selector.to_string()))?;
        let (key, value) = selector.split_once('=').unwrap_or((selector, ""));
        Ok(state
            .load_balancers
            .values()
            .filter(|lb| lb.labels.get(key).map(String::as_str) == Some(value))
            .cloned()
            .collect())
    }

    async fn create(&self, opts: &CreateOpts) -> Result<(LoadBalancer, Action)> {
        let mut state = self.state();
        state.record(Call::Create(opts.clone()))?;
        if state.load_balancers.values().any(|lb| lb.name == opts.name) {
            return Err(Error::AlreadyExists(format!("load balancer {}", opts.name)));
        }

        let id = state.next_id();
        let mut lb = load_balancer(id, &opts.name);
        lb.labels = opts.labels.clone();
        lb.algorithm = opts.algorithm;
        lb.load_balancer_type = opts.load_balancer_type.clone();
        lb.location = opts.location.clone().unwrap_or_default();
        lb.network_zone = opts.network_zone.clone().unwrap_or_else(|| "eu-central".to_string());
        lb.public_net.enabled = opts.public_interface;
        if let Some(network_id) = opts.network {
            lb.private_net.push(PrivateNet {
                network_id,
                ip: Ipv4Addr::new(10, 0, 0, (id % 250) as u8 + 2),
            });
        }
        state.load_balancers.insert(id, lb.clone());

        let mut action = state.action("create_load_balancer");
        action.status = ActionStatus::Running;
        action.progress = 0;
        Ok((lb, action))
    }

    async fn update(&self, id: i64, opts: &UpdateOpts) -> Result<LoadBalancer> {
        let mut state = self.state();
        state.record(Call::Update(id, opts.clone()))?;
        let lb = state.lb_mut(id)?;
        if let Some(name) = &opts.name {
            lb.name = name.clone();
        }
        if let Some(labels) = &opts.labels {
            lb.labels = labels.clone();
        }
        Ok(lb.clone())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let mut state = self.state();
        state.record(Call::Delete(id))?;
        state.lb_mut(id)?;
        state.load_balancers.remove(&id);
        Ok(())
    }

    async fn change_algorithm(&self, id: i64, algorithm: Algorithm) -> Result<Action> {
        let mut state = self.state();
        state.record(Call::ChangeAlgorithm(id, algorithm))?;
        state.lb_mut(id)?.algorithm = algorithm;
        Ok(state.action("change_algorithm"))
    }

    async fn change_type(&self, id: i64, load_balancer_type: &str) -> Result<Action> {
        let mut state = self.state();
        state.record(Call::ChangeType(id, load_balancer_type.to_string()))?;
        state.lb_mut(id)?.load_balancer_type = load_balancer_type.to_string();
        Ok(state.action("change_type"))
    }

    async fn attach_to_network(
        &self,
        id: i64,
        network_id: i64,
        ip: Option<Ipv4Addr>,
    ) -> Result<Action> {
        let mut state = self.state();
        state.record(Call::AttachToNetwork(id, network_id))?;
        let lb = state.lb_mut(id)?;
        let ip = ip.unwrap_or(Ipv4Addr::new(10, 0, 0, (id % 250) as u8 + 2));
        lb.private_net.push(PrivateNet { network_id, ip });
        Ok(state.action("attach_to_network"))
    }

    async fn detach_from_network(&self, id: i64, network_id: i64) -> Result<Action> {
        let mut state = self.state();
        state.record(Call::DetachFromNetwork(id, network_id))?;
        state
            .lb_mut(id)?
            .private_net
            .retain(|n| n.network_id != network_id);
        Ok(state.action("detach_from_network"))
    }

    async fn enable_public_interface(&self, id: i64) -> Result<Action> {
        let mut state = self.state();
        state.record(Call::EnablePublicInterface(id))?;
        state.lb_mut(id)?.public_net.enabled = true;
        Ok(state.action("enable_public_interface"))
    }

    async fn disable_public_interface(&self, id: i64) -> Result<Action> {
        let mut state = self.state();
        state.record(Call::DisablePublicInterface(id))?;
        state.lb_mut(id)?.public_net.enabled = false;
        Ok(state.action("disable_public_interface"))
    }

    async fn add_server_target(
        &self,
        id: i64,
        server_id: i64,
        use_private_ip: bool,
    ) -> Result<Action> {
        let mut state = self.state();
        state.record(Call::AddTarget {
            lb: id,
            server: server_id,
            use_private_ip,
        })?;
        let lb = state.lb_mut(id)?;
        if lb.targets.iter().any(|t| t.server_id == server_id) {
            return Err(Error::CloudApi {
                code: ErrorCode::Other("target_already_defined".to_string()),
                message: format!("server {server_id} is already a target"),
            });
        }
        lb.targets.push(Target {
            server_id,
            use_private_ip,
        });
        Ok(state.action("add_target"))
    }

    async fn remove_server_target(&self, id: i64, server_id: i64) -> Result<Action> {
        let mut state = self.state();
        state.record(Call::RemoveTarget {
            lb: id,
            server: server_id,
        })?;
        state
            .lb_mut(id)?
            .targets
            .retain(|t| t.server_id != server_id);
        Ok(state.action("remove_target"))
    }

    async fn add_service(&self, id: i64, opts: &AddServiceOpts) -> Result<Action> {
        let mut state = self.state();
        state.record(Call::AddService {
            lb: id,
            listen_port: opts.listen_port,
            destination_port: opts.destination_port,
        })?;
        let lb = state.lb_mut(id)?;
        if lb.service(opts.listen_port).is_some() {
            return Err(Error::CloudApi {
                code: ErrorCode::Other("source_port_already_used".to_string()),
                message: format!("port {} is already used", opts.listen_port),
            });
        }

        let mut service = LoadBalancerService {
            protocol: opts.protocol,
            listen_port: opts.listen_port,
            destination_port: opts.destination_port,
            proxyprotocol: opts.proxyprotocol,
            http: None,
            health_check: default_health_check(opts.destination_port),
        };
        if let Some(http) = &opts.http {
            apply_http(&mut service.http, http);
        }
        if let Some(hc) = &opts.health_check {
            apply_health_check(&mut service.health_check, hc);
        }
        lb.services.push(service);
        Ok(state.action("add_service"))
    }

    async fn update_service(
        &self,
        id: i64,
        listen_port: u16,
        opts: &UpdateServiceOpts,
    ) -> Result<Action> {
        let mut state = self.state();
        state.record(Call::UpdateService {
            lb: id,
            listen_port,
        })?;
        let lb = state.lb_mut(id)?;
        let Some(service) = lb.services.iter_mut().find(|s| s.listen_port == listen_port) else {
            return Err(Error::CloudApi {
                code: ErrorCode::NotFound,
                message: format!("service on port {listen_port} not found"),
            });
        };
        if let Some(v) = opts.protocol {
            service.protocol = v;
        }
        if let Some(v) = opts.destination_port {
            service.destination_port = v;
        }
        if let Some(v) = opts.proxyprotocol {
            service.proxyprotocol = v;
        }
        if let Some(http) = &opts.http {
            apply_http(&mut service.http, http);
        }
        if let Some(hc) = &opts.health_check {
            apply_health_check(&mut service.health_check, hc);
        }
        Ok(state.action("update_service"))
    }

    async fn delete_service(&self, id: i64, listen_port: u16) -> Result<Action> {
        let mut state = self.state();
        state.record(Call::DeleteService {
            lb: id,
            listen_port,
        })?;
        state
            .lb_mut(id)?
            .services
            .retain(|s| s.listen_port != listen_port);
        Ok(state.action("delete_service"))
    }
}

#[async_trait]
impl CertificateClient for FakeCloud {
    async fn get_by_name(&self, name: &str) -> Result<Option<Certificate>> {
        let mut state = self.state();
        state.record(Call::GetCertificate(name.to_string()))?;
        Ok(state.certificates.iter().find(|c| c.name == name).cloned())
    }
}

#[async_trait]
impl NetworkClient for FakeCloud {
    async fn get_by_id(&self, id: i64) -> Result<Option<Network>> {
        let mut state = self.state();
        state.record(Call::GetNetwork(id.to_string()))?;
        Ok(state.networks.iter().find(|n| n.id == id).cloned())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Network>> {
        let mut state = self.state();
        state.record(Call::GetNetwork(name.to_string()))?;
        Ok(state.networks.iter().find(|n| n.name == name).cloned())
    }
}

#[async_trait]
impl ActionClient for FakeCloud {
    async fn get_by_id(&self, id: i64) -> Result<Action> {
        self.state().record(Call::GetAction(id))?;
        Ok(Action {
            id,
            command: "poll".to_string(),
            status: ActionStatus::Success,
            progress: 100,
            error: None,
        })
    }
}
