//! Public load balancer operations for `LoadBalancer` Services
//!
//! `ensure`, `update`, `ensure_deleted` and `get_status` are what the control
//! loop calls once per Service and pass. Each call runs its steps
//! sequentially; a failed step aborts the call and leaves earlier steps
//! applied, which the next pass converges.

use k8s_openapi::api::core::v1::{LoadBalancerIngress, Node, Service};
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::lb_config::{load_balancer_name, LoadBalancerConfig};
use super::lb_ops::LoadBalancerOps;
use crate::cloud::types::LoadBalancer;
use crate::error::{Error, Result, ResultExt};

#[derive(Clone)]
pub struct LoadBalancers {
    ops: LoadBalancerOps,
}

impl LoadBalancers {
    pub fn new(ops: LoadBalancerOps) -> Self {
        Self { ops }
    }

    pub fn ops(&self) -> &LoadBalancerOps {
        &self.ops
    }

    /// Backend name of the load balancer for `svc`
    pub fn get_load_balancer_name(&self, svc: &Service) -> Result<String> {
        load_balancer_name(svc, &self.ops.defaults).op("load_balancers::get_load_balancer_name")
    }

    /// Create or converge the load balancer of `svc` and return its ingress
    #[instrument(skip(self, svc, nodes), fields(namespace = ?svc.namespace(), name = %svc.name_any(), uid = ?svc.uid()))]
    pub async fn ensure(&self, svc: &Service, nodes: &[Node]) -> Result<Vec<LoadBalancerIngress>> {
        let config = LoadBalancerConfig::from_service(svc, &self.ops.defaults)
            .op("load_balancers::ensure")?;

        let lb = match self.ops.find(svc, &config.name).await {
            Ok(lb) => lb,
            Err(e) if e.is_not_found() => self
                .ops
                .create(svc, &config)
                .await
                .op("load_balancers::ensure")?,
            Err(e) => return Err(Error::op("load_balancers::ensure", e)),
        };

        let lb = self.reconcile(lb, svc, &config, nodes).await.op("load_balancers::ensure")?;
        Ok(ingress(&lb, &config))
    }

    /// Converge an existing load balancer; a missing one is left alone
    #[instrument(skip(self, svc, nodes), fields(namespace = ?svc.namespace(), name = %svc.name_any(), uid = ?svc.uid()))]
    pub async fn update(&self, svc: &Service, nodes: &[Node]) -> Result<()> {
        let config = LoadBalancerConfig::from_service(svc, &self.ops.defaults)
            .op("load_balancers::update")?;

        let lb = match self.ops.find(svc, &config.name).await {
            Ok(lb) => lb,
            Err(e) if e.is_not_found() => {
                debug!(name = %config.name, "No load balancer to update");
                return Ok(());
            }
            Err(e) => return Err(Error::op("load_balancers::update", e)),
        };

        self.reconcile(lb, svc, &config, nodes)
            .await
            .op("load_balancers::update")?;
        Ok(())
    }

    /// Delete the load balancer of `svc` unless it is protected
    #[instrument(skip(self, svc), fields(namespace = ?svc.namespace(), name = %svc.name_any(), uid = ?svc.uid()))]
    pub async fn ensure_deleted(&self, svc: &Service) -> Result<()> {
        let name = self.get_load_balancer_name(svc).op("load_balancers::ensure_deleted")?;

        let lb = match self.ops.find(svc, &name).await {
            Ok(lb) => lb,
            Err(e) if e.is_not_found() => {
                debug!(%name, "Load balancer already gone");
                return Ok(());
            }
            Err(e) => return Err(Error::op("load_balancers::ensure_deleted", e)),
        };

        if lb.delete_protection {
            warn!(load_balancer = lb.id, name = %lb.name, "Load balancer is protected against deletion, leaving it in place");
            return Ok(());
        }

        info!(load_balancer = lb.id, name = %lb.name, "Deleting load balancer");
        match self.ops.lb_client.delete(lb.id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(load_balancer = lb.id, "Load balancer deleted concurrently");
                Ok(())
            }
            Err(e) => Err(Error::op("load_balancers::ensure_deleted", e)),
        }
    }

    /// Ingress of the existing load balancer and whether it exists at all
    pub async fn get_status(&self, svc: &Service) -> Result<(Vec<LoadBalancerIngress>, bool)> {
        let config = LoadBalancerConfig::from_service(svc, &self.ops.defaults)
            .op("load_balancers::get_status")?;
        match self.ops.find(svc, &config.name).await {
            Ok(lb) => Ok((ingress(&lb, &config), true)),
            Err(e) if e.is_not_found() => Ok((vec![], false)),
            Err(e) => Err(Error::op("load_balancers::get_status", e)),
        }
    }

    /// Run all steps and reload once if any of them changed the load balancer
    async fn reconcile(
        &self,
        lb: LoadBalancer,
        svc: &Service,
        config: &LoadBalancerConfig,
        nodes: &[Node],
    ) -> Result<LoadBalancer> {
        if !self.ops.reconcile(&lb, svc, config, nodes).await? {
            debug!(load_balancer = lb.id, "Load balancer up to date");
            return Ok(lb);
        }
        self.ops.get_by_id(lb.id).await
    }
}

/// Addresses to publish in the Service status
///
/// A hostname annotation replaces all IP based ingress.
pub fn ingress(lb: &LoadBalancer, config: &LoadBalancerConfig) -> Vec<LoadBalancerIngress> {
    if let Some(hostname) = &config.hostname {
        return vec![LoadBalancerIngress {
            hostname: Some(hostname.clone()),
            ..Default::default()
        }];
    }

    let mut ips = Vec::new();
    if lb.public_net.enabled {
        ips.extend(lb.public_net.ipv4.map(|ip| ip.to_string()));
        if !config.disable_ipv6 {
            ips.extend(lb.public_net.ipv6.map(|ip| ip.to_string()));
        }
    }
    if !config.disable_private_ingress {
        ips.extend(lb.private_net.iter().map(|n| n.ip.to_string()));
    }

    ips.into_iter()
        .map(|ip| LoadBalancerIngress {
            ip: Some(ip),
            ..Default::default()
        })
        .collect()
}
