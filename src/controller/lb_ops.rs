//! Operations on one backend load balancer
//!
//! Identity resolution (Service UID label, then name) and the fixed-order
//! reconcile steps. Every step compares the desired state against the
//! snapshot it is given, issues only the calls needed to converge, waits for
//! each resulting action and reports whether it changed anything.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Service};
use kube::ResourceExt;
use tracing::{debug, info};

use super::lb_config::LoadBalancerConfig;
use super::retry::retry_once;
use super::service_opts::ServiceOptsBuilder;
use super::targets::desired_server_ids;
use crate::annotations::{Annotation, LABEL_SERVICE_UID};
use crate::cloud::action::ActionWaiter;
use crate::cloud::client::{CertificateClient, LoadBalancerClient};
use crate::cloud::types::{Action, LoadBalancer, UpdateOpts};
use crate::config::LoadBalancerDefaults;
use crate::error::{Error, Result, ResultExt};

#[derive(Clone)]
pub struct LoadBalancerOps {
    pub lb_client: Arc<dyn LoadBalancerClient>,
    pub cert_client: Arc<dyn CertificateClient>,
    pub waiter: ActionWaiter,
    /// Private network every load balancer is attached to
    pub network_id: Option<i64>,
    pub defaults: LoadBalancerDefaults,
    /// Delay before the single retry of a busy network attach
    pub retry_delay: Duration,
}

fn service_uid(svc: &Service) -> Result<&str> {
    svc.metadata
        .uid
        .as_deref()
        .ok_or_else(|| Error::ValidationError(format!("service {} has no UID", svc.name_any())))
}

impl LoadBalancerOps {
    async fn wait(&self, action: Action) -> Result<()> {
        self.waiter.wait(&action).await
    }

    /// The load balancer labelled with the Service UID
    ///
    /// No match is `NotFound`; more than one match is `NonUniqueResult`.
    pub async fn get_by_k8s_service_uid(&self, svc: &Service) -> Result<LoadBalancer> {
        let uid = service_uid(svc).op("lb_ops::get_by_k8s_service_uid")?;
        let selector = format!("{LABEL_SERVICE_UID}={uid}");
        let mut found = self
            .lb_client
            .list_by_label(&selector)
            .await
            .op("lb_ops::get_by_k8s_service_uid")?;

        match found.len() {
            0 => Err(Error::op(
                "lb_ops::get_by_k8s_service_uid",
                Error::NotFound(format!("load balancer with label {selector}")),
            )),
            1 => Ok(found.remove(0)),
            n => Err(Error::op(
                "lb_ops::get_by_k8s_service_uid",
                Error::NonUniqueResult(format!("{n} load balancers with label {selector}")),
            )),
        }
    }

    pub async fn get_by_name(&self, name: &str) -> Result<LoadBalancer> {
        match self.lb_client.get_by_name(name).await {
            Ok(Some(lb)) => Ok(lb),
            Ok(None) => Err(Error::NotFound(format!("load balancer {name}"))),
            Err(e) => Err(e),
        }
        .op("lb_ops::get_by_name")
    }

    pub async fn get_by_id(&self, id: i64) -> Result<LoadBalancer> {
        match self.lb_client.get_by_id(id).await {
            Ok(Some(lb)) => Ok(lb),
            Ok(None) => Err(Error::NotFound(format!("load balancer {id}"))),
            Err(e) => Err(e),
        }
        .op("lb_ops::get_by_id")
    }

    /// Look up by Service UID, falling back to the load balancer name
    pub async fn find(&self, svc: &Service, name: &str) -> Result<LoadBalancer> {
        match self.get_by_k8s_service_uid(svc).await {
            Err(e) if e.is_not_found() => {
                debug!(name, "No load balancer labelled with service UID, trying name");
                self.get_by_name(name).await
            }
            other => other,
        }
    }

    pub async fn create(&self, svc: &Service, config: &LoadBalancerConfig) -> Result<LoadBalancer> {
        let uid = service_uid(svc).op("lb_ops::create")?;
        // A requested private IP can only be honoured by the attach step
        let network = self.network_id.filter(|_| config.private_ipv4.is_none());
        let opts = config.create_opts(uid, network).op("lb_ops::create")?;

        info!(
            name = %opts.name,
            location = ?opts.location,
            network_zone = ?opts.network_zone,
            "Creating load balancer"
        );
        let (lb, action) = self.lb_client.create(&opts).await.op("lb_ops::create")?;
        self.wait(action).await.op("lb_ops::create")?;
        Ok(lb)
    }

    /// Run every reconcile step in order against the snapshot `lb`
    pub async fn reconcile(
        &self,
        lb: &LoadBalancer,
        svc: &Service,
        config: &LoadBalancerConfig,
        nodes: &[Node],
    ) -> Result<bool> {
        let mut changed = self.reconcile_info(lb, svc).await?;
        changed |= self.reconcile_algorithm(lb, config).await?;
        changed |= self.reconcile_type(lb, config).await?;
        changed |= self.reconcile_network_detach(lb).await?;
        changed |= self.reconcile_network_attach(lb, config).await?;
        changed |= self.reconcile_public_interface(lb, config).await?;
        changed |= self.reconcile_targets(lb, config, nodes).await?;
        changed |= self.reconcile_services(lb, svc).await?;
        Ok(changed)
    }

    /// Identity label and name override, in one update call
    pub async fn reconcile_info(&self, lb: &LoadBalancer, svc: &Service) -> Result<bool> {
        let uid = service_uid(svc).op("lb_ops::reconcile_info")?;
        let name_override = Annotation::NAME
            .string(svc)
            .op("lb_ops::reconcile_info")?
            .filter(|n| !n.is_empty());

        let mut opts = UpdateOpts::default();
        if let Some(name) = name_override.filter(|n| *n != lb.name) {
            opts.name = Some(name);
        }
        if lb.labels.get(LABEL_SERVICE_UID).map(String::as_str) != Some(uid) {
            let mut labels = lb.labels.clone();
            labels.insert(LABEL_SERVICE_UID.to_string(), uid.to_string());
            opts.labels = Some(labels);
        }

        if opts == UpdateOpts::default() {
            return Ok(false);
        }
        info!(load_balancer = lb.id, name = ?opts.name, "Updating load balancer name and labels");
        self.lb_client
            .update(lb.id, &opts)
            .await
            .op("lb_ops::reconcile_info")?;
        Ok(true)
    }

    pub async fn reconcile_algorithm(&self, lb: &LoadBalancer, config: &LoadBalancerConfig) -> Result<bool> {
        let Some(algorithm) = config.algorithm.filter(|a| *a != lb.algorithm) else {
            return Ok(false);
        };
        info!(load_balancer = lb.id, from = %lb.algorithm, to = %algorithm, "Changing algorithm");
        let action = self
            .lb_client
            .change_algorithm(lb.id, algorithm)
            .await
            .op("lb_ops::reconcile_algorithm")?;
        self.wait(action).await.op("lb_ops::reconcile_algorithm")?;
        Ok(true)
    }

    pub async fn reconcile_type(&self, lb: &LoadBalancer, config: &LoadBalancerConfig) -> Result<bool> {
        let Some(lb_type) = config
            .load_balancer_type
            .as_deref()
            .filter(|t| *t != lb.load_balancer_type)
        else {
            return Ok(false);
        };
        info!(load_balancer = lb.id, from = %lb.load_balancer_type, to = lb_type, "Changing type");
        let action = self
            .lb_client
            .change_type(lb.id, lb_type)
            .await
            .op("lb_ops::reconcile_type")?;
        self.wait(action).await.op("lb_ops::reconcile_type")?;
        Ok(true)
    }

    /// Detach every private network other than the configured one
    pub async fn reconcile_network_detach(&self, lb: &LoadBalancer) -> Result<bool> {
        let mut changed = false;
        for net in &lb.private_net {
            if Some(net.network_id) == self.network_id {
                continue;
            }
            info!(load_balancer = lb.id, network = net.network_id, "Detaching from network");
            let action = self
                .lb_client
                .detach_from_network(lb.id, net.network_id)
                .await
                .op("lb_ops::reconcile_network_detach")?;
            self.wait(action).await.op("lb_ops::reconcile_network_detach")?;
            changed = true;
        }
        Ok(changed)
    }

    /// Attach the configured network, retrying once if the load balancer is busy
    pub async fn reconcile_network_attach(
        &self,
        lb: &LoadBalancer,
        config: &LoadBalancerConfig,
    ) -> Result<bool> {
        let Some(network_id) = self.network_id.filter(|id| !lb.is_attached_to(*id)) else {
            return Ok(false);
        };

        info!(load_balancer = lb.id, network = network_id, ip = ?config.private_ipv4, "Attaching to network");
        let client: &dyn LoadBalancerClient = self.lb_client.as_ref();
        let (lb_id, ip) = (lb.id, config.private_ipv4);
        let action = retry_once("attach_to_network", self.retry_delay, move || {
            client.attach_to_network(lb_id, network_id, ip)
        })
        .await
        .op("lb_ops::reconcile_network_attach")?;
        self.wait(action).await.op("lb_ops::reconcile_network_attach")?;
        Ok(true)
    }

    /// Toggle the public interface, only if explicitly configured
    pub async fn reconcile_public_interface(
        &self,
        lb: &LoadBalancer,
        config: &LoadBalancerConfig,
    ) -> Result<bool> {
        let action = match config.public_interface {
            Some(true) if !lb.public_net.enabled => {
                info!(load_balancer = lb.id, "Enabling public interface");
                self.lb_client.enable_public_interface(lb.id).await
            }
            Some(false) if lb.public_net.enabled => {
                info!(load_balancer = lb.id, "Disabling public interface");
                self.lb_client.disable_public_interface(lb.id).await
            }
            _ => return Ok(false),
        }
        .op("lb_ops::reconcile_public_interface")?;
        self.wait(action).await.op("lb_ops::reconcile_public_interface")?;
        Ok(true)
    }

    /// Make the server targets match the selected nodes
    ///
    /// A target whose private IP flag is wrong is removed and added again;
    /// the backend cannot change the flag in place.
    pub async fn reconcile_targets(
        &self,
        lb: &LoadBalancer,
        config: &LoadBalancerConfig,
        nodes: &[Node],
    ) -> Result<bool> {
        if config.use_private_ip && self.network_id.is_none() {
            return Err(Error::op(
                "lb_ops::reconcile_targets",
                Error::ConfigError(format!(
                    "{} requires a configured network",
                    Annotation::USE_PRIVATE_IP
                )),
            ));
        }
        let desired =
            desired_server_ids(nodes, &config.node_selector).op("lb_ops::reconcile_targets")?;
        let use_private_ip = config.use_private_ip;

        let mut changed = false;
        let mut in_place = BTreeSet::new();
        for target in &lb.targets {
            if desired.contains(&target.server_id) && target.use_private_ip == use_private_ip {
                in_place.insert(target.server_id);
                continue;
            }
            info!(load_balancer = lb.id, server = target.server_id, "Removing target");
            let action = self
                .lb_client
                .remove_server_target(lb.id, target.server_id)
                .await
                .op("lb_ops::reconcile_targets")?;
            self.wait(action).await.op("lb_ops::reconcile_targets")?;
            changed = true;
        }

        for server_id in desired.difference(&in_place) {
            info!(load_balancer = lb.id, server = server_id, use_private_ip, "Adding target");
            let action = self
                .lb_client
                .add_server_target(lb.id, *server_id, use_private_ip)
                .await
                .op("lb_ops::reconcile_targets")?;
            self.wait(action).await.op("lb_ops::reconcile_targets")?;
            changed = true;
        }
        Ok(changed)
    }

    /// Make the backend services match the Service ports, keyed by listen port
    pub async fn reconcile_services(&self, lb: &LoadBalancer, svc: &Service) -> Result<bool> {
        let ports = svc
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_deref())
            .unwrap_or_default();

        let mut changed = false;
        let mut wanted = BTreeSet::new();
        for port in ports {
            let mut builder = ServiceOptsBuilder::new(svc, port, self.cert_client.as_ref())
                .op("lb_ops::reconcile_services")?;
            let listen_port = builder.listen_port();
            if !wanted.insert(listen_port) {
                debug!(port = listen_port, "Listen port already handled");
                continue;
            }

            let action = match lb.service(listen_port) {
                Some(current) => {
                    let opts = builder.update_opts().await.op("lb_ops::reconcile_services")?;
                    if !opts.differs_from(current) {
                        debug!(load_balancer = lb.id, port = listen_port, "Service up to date");
                        continue;
                    }
                    info!(load_balancer = lb.id, port = listen_port, "Updating service");
                    self.lb_client.update_service(lb.id, listen_port, &opts).await
                }
                None => {
                    let opts = builder.add_opts().await.op("lb_ops::reconcile_services")?;
                    info!(
                        load_balancer = lb.id,
                        port = listen_port,
                        destination_port = opts.destination_port,
                        protocol = %opts.protocol,
                        "Adding service"
                    );
                    self.lb_client.add_service(lb.id, &opts).await
                }
            }
            .op("lb_ops::reconcile_services")?;
            self.wait(action).await.op("lb_ops::reconcile_services")?;
            changed = true;
        }

        for service in &lb.services {
            if wanted.contains(&service.listen_port) {
                continue;
            }
            info!(load_balancer = lb.id, port = service.listen_port, "Deleting service");
            let action = self
                .lb_client
                .delete_service(lb.id, service.listen_port)
                .await
                .op("lb_ops::reconcile_services")?;
            self.wait(action).await.op("lb_ops::reconcile_services")?;
            changed = true;
        }
        Ok(changed)
    }
}
