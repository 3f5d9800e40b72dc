//! Ports onto the cloud backend
//!
//! One narrow trait per resource family, so each can be substituted
//! independently. `HcloudClient` implements all of them; tests use the
//! in-memory fake.

use std::net::Ipv4Addr;

use async_trait::async_trait;

use super::types::{
    Action, AddServiceOpts, Algorithm, Certificate, CreateOpts, LoadBalancer, Network,
    UpdateOpts, UpdateServiceOpts,
};
use crate::error::Result;

#[async_trait]
pub trait LoadBalancerClient: Send + Sync {
    /// `Ok(None)` if no load balancer has this ID
    async fn get_by_id(&self, id: i64) -> Result<Option<LoadBalancer>>;

    /// `Ok(None)` if no load balancer has this name
    async fn get_by_name(&self, name: &str) -> Result<Option<LoadBalancer>>;

    /// All load balancers matching a label selector such as `key=value`
    async fn list_by_label(&self, selector: &str) -> Result<Vec<LoadBalancer>>;

    async fn create(&self, opts: &CreateOpts) -> Result<(LoadBalancer, Action)>;

    async fn update(&self, id: i64, opts: &UpdateOpts) -> Result<LoadBalancer>;

    async fn delete(&self, id: i64) -> Result<()>;

    async fn change_algorithm(&self, id: i64, algorithm: Algorithm) -> Result<Action>;

    async fn change_type(&self, id: i64, load_balancer_type: &str) -> Result<Action>;

    async fn attach_to_network(
        &self,
        id: i64,
        network_id: i64,
        ip: Option<Ipv4Addr>,
    ) -> Result<Action>;

    async fn detach_from_network(&self, id: i64, network_id: i64) -> Result<Action>;

    async fn enable_public_interface(&self, id: i64) -> Result<Action>;

    async fn disable_public_interface(&self, id: i64) -> Result<Action>;

    async fn add_server_target(
        &self,
        id: i64,
        server_id: i64,
        use_private_ip: bool,
    ) -> Result<Action>;

    async fn remove_server_target(&self, id: i64, server_id: i64) -> Result<Action>;

    async fn add_service(&self, id: i64, opts: &AddServiceOpts) -> Result<Action>;

    async fn update_service(
        &self,
        id: i64,
        listen_port: u16,
        opts: &UpdateServiceOpts,
    ) -> Result<Action>;

    async fn delete_service(&self, id: i64, listen_port: u16) -> Result<Action>;
}

#[async_trait]
pub trait CertificateClient: Send + Sync {
    async fn get_by_name(&self, name: &str) -> Result<Option<Certificate>>;
}

#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn get_by_id(&self, id: i64) -> Result<Option<Network>>;

    async fn get_by_name(&self, name: &str) -> Result<Option<Network>>;
}

#[async_trait]
pub trait ActionClient: Send + Sync {
    async fn get_by_id(&self, id: i64) -> Result<Action>;
}

/// Resolve a network given either its numeric ID or its name
pub async fn resolve_network(client: &dyn NetworkClient, id_or_name: &str) -> Result<Option<Network>> {
    match id_or_name.parse::<i64>() {
        Ok(id) => client.get_by_id(id).await,
        Err(_) => client.get_by_name(id_or_name).await,
    }
}
