//! Control loop for `LoadBalancer` Services
//!
//! Watches Services in all namespaces plus Nodes. A Node change that can
//! alter target selection requeues all `LoadBalancer` Services, status only
//! updates such as heartbeats are dropped.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{future, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Event, LoadBalancerIngress, Node, Service};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    client::Client,
    runtime::{
        controller::{self, Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        reflector::ObjectRef,
        watcher::{self, Config, Event as WatchEvent},
        WatchStreamExt,
    },
    Resource, ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use super::load_balancers::LoadBalancers;
use crate::error::{Error, Result};

/// Finalizer guarding the cloud load balancer of a Service
pub const LOAD_BALANCER_FINALIZER: &str = "service.kubernetes.io/load-balancer-cleanup";

/// Periodic resync of converged Services
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

const NON_LEADER_REQUEUE: Duration = Duration::from_secs(15);
const NODE_DEBOUNCE: Duration = Duration::from_secs(1);
const FIELD_MANAGER: &str = "hcloud-lb-controller";

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub load_balancers: LoadBalancers,
    /// When false no Service is reconciled
    pub enabled: bool,
    pub is_leader: Arc<AtomicBool>,
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    if !state.enabled {
        info!("Load balancer support disabled, controller not started");
        return Ok(());
    }

    let client = state.client.clone();
    let services: Api<Service> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());

    info!("Starting load balancer controller");

    let controller = Controller::new(services, Config::default())
        .with_config(controller::Config::default().debounce(NODE_DEBOUNCE));
    let store = controller.store();

    let mut node_changes = NodeChanges::default();
    let node_events = watcher::watcher(nodes, Config::default())
        .default_backoff()
        .try_filter_map(move |event| {
            future::ready(Ok::<_, watcher::Error>(node_changes.admit(event)))
        });

    controller
        .watches_stream(node_events, move |_node: Node| {
            store
                .state()
                .into_iter()
                .filter(|svc| is_load_balancer(svc))
                .map(|svc| ObjectRef::from_obj(&*svc))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled: {}", obj),
                Err(e) => debug!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// Fingerprint of the Node fields target selection reads
pub fn targeting_fingerprint(node: &Node) -> u64 {
    let mut hasher = DefaultHasher::new();
    node.labels().hash(&mut hasher);
    node.spec
        .as_ref()
        .and_then(|spec| spec.provider_id.as_deref())
        .hash(&mut hasher);
    node.meta().deletion_timestamp.is_some().hash(&mut hasher);
    hasher.finish()
}

/// Last fingerprint seen per Node name
#[derive(Default)]
pub struct NodeChanges {
    seen: HashMap<String, u64>,
}

impl NodeChanges {
    /// The Node if the event can change load balancer targets
    pub fn admit(&mut self, event: WatchEvent<Node>) -> Option<Node> {
        match event {
            WatchEvent::Apply(node) | WatchEvent::InitApply(node) => {
                let fingerprint = targeting_fingerprint(&node);
                match self.seen.insert(node.name_any(), fingerprint) {
                    Some(previous) if previous == fingerprint => None,
                    _ => Some(node),
                }
            }
            WatchEvent::Delete(node) => {
                self.seen.remove(&node.name_any());
                Some(node)
            }
            WatchEvent::Init | WatchEvent::InitDone => None,
        }
    }
}

/// Whether the Service asks for a cloud load balancer
pub fn is_load_balancer(svc: &Service) -> bool {
    svc.spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref())
        == Some("LoadBalancer")
}

pub fn has_finalizer(svc: &Service) -> bool {
    svc.finalizers().iter().any(|f| f == LOAD_BALANCER_FINALIZER)
}

/// Ingress currently published in the Service status
pub fn current_ingress(svc: &Service) -> Vec<LoadBalancerIngress> {
    svc.status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.clone())
        .unwrap_or_default()
}

/// Requeue delay after a failed pass
pub fn retry_delay(error: &Error) -> Duration {
    if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    }
}

/// The main reconciliation function
///
/// This function is called whenever:
/// - A Service is created, updated, or deleted
/// - A Node's labels, provider ID or deletion state change (for every
///   `LoadBalancer` Service)
/// - The requeue timer expires
#[instrument(skip(svc, ctx), fields(name = %svc.name_any(), namespace = svc.namespace()))]
async fn reconcile(svc: Arc<Service>, ctx: Arc<ControllerState>) -> Result<Action> {
    if !ctx.is_leader.load(Ordering::Relaxed) {
        debug!("Not the leader, skipping reconcile");
        return Ok(Action::requeue(NON_LEADER_REQUEUE));
    }

    let namespace = svc.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);

    if !is_load_balancer(&svc) {
        // Type changed away from LoadBalancer, or deleted after such a change
        if has_finalizer(&svc) {
            info!("Service is no longer of type LoadBalancer, releasing its load balancer");
            cleanup_load_balancer(&ctx, &svc).await?;
            remove_finalizer(&api, &svc).await?;
        }
        return Ok(Action::await_change());
    }

    finalizer(&api, LOAD_BALANCER_FINALIZER, svc, |event| async {
        match event {
            FinalizerEvent::Apply(svc) => apply_load_balancer(&ctx, &svc).await,
            FinalizerEvent::Cleanup(svc) => cleanup_load_balancer(&ctx, &svc).await,
        }
    })
    .await
    .map_err(Error::from)
}

/// Ensure the load balancer and publish its ingress
#[instrument(skip(ctx, svc), fields(name = %svc.name_any(), namespace = svc.namespace()))]
async fn apply_load_balancer(ctx: &ControllerState, svc: &Service) -> Result<Action> {
    let client = &ctx.client;
    let published = current_ingress(svc);
    if published.is_empty() {
        record(client, svc, "Normal", "EnsuringLoadBalancer", "Ensuring load balancer").await;
    }

    let nodes = Api::<Node>::all(client.clone())
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?
        .items;

    #[cfg(feature = "metrics")]
    let started = std::time::Instant::now();
    let result = ctx.load_balancers.ensure(svc, &nodes).await;
    #[cfg(feature = "metrics")]
    super::metrics::observe_reconcile_duration_seconds("ensure", started.elapsed().as_secs_f64());

    let ingress = match result {
        Ok(ingress) => ingress,
        Err(e) => {
            #[cfg(feature = "metrics")]
            super::metrics::inc_reconcile_error("ensure", e.kind());
            record(client, svc, "Warning", "SyncLoadBalancerFailed", &format!("Error syncing load balancer: {e}")).await;
            return Err(e);
        }
    };

    if ingress != published {
        patch_ingress(client, svc, Some(&ingress)).await?;
        record(client, svc, "Normal", "EnsuredLoadBalancer", "Ensured load balancer").await;
    }

    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Delete the load balancer and clear the published ingress
#[instrument(skip(ctx, svc), fields(name = %svc.name_any(), namespace = svc.namespace()))]
async fn cleanup_load_balancer(ctx: &ControllerState, svc: &Service) -> Result<Action> {
    let client = &ctx.client;
    record(client, svc, "Normal", "DeletingLoadBalancer", "Deleting load balancer").await;

    #[cfg(feature = "metrics")]
    let started = std::time::Instant::now();
    let result = ctx.load_balancers.ensure_deleted(svc).await;
    #[cfg(feature = "metrics")]
    super::metrics::observe_reconcile_duration_seconds(
        "ensure_deleted",
        started.elapsed().as_secs_f64(),
    );

    if let Err(e) = result {
        #[cfg(feature = "metrics")]
        super::metrics::inc_reconcile_error("ensure_deleted", e.kind());
        record(client, svc, "Warning", "SyncLoadBalancerFailed", &format!("Error deleting load balancer: {e}")).await;
        return Err(e);
    }

    // A deleted Service has no status left to clear
    if svc.meta().deletion_timestamp.is_none() && !current_ingress(svc).is_empty() {
        patch_ingress(client, svc, None).await?;
    }
    record(client, svc, "Normal", "DeletedLoadBalancer", "Deleted load balancer").await;

    Ok(Action::await_change())
}

/// Replace `status.loadBalancer.ingress`; `None` clears it
async fn patch_ingress(
    client: &Client,
    svc: &Service,
    ingress: Option<&[LoadBalancerIngress]>,
) -> Result<()> {
    let namespace = svc.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Service> = Api::namespaced(client.clone(), &namespace);

    let patch = serde_json::json!({
        "status": {
            "loadBalancer": {
                "ingress": ingress
            }
        }
    });
    api.patch_status(
        &svc.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;

    Ok(())
}

async fn remove_finalizer(api: &Api<Service>, svc: &Service) -> Result<()> {
    let finalizers: Vec<&String> = svc
        .finalizers()
        .iter()
        .filter(|f| *f != LOAD_BALANCER_FINALIZER)
        .collect();

    // resourceVersion turns the merge patch into a conditional update
    let patch = serde_json::json!({
        "metadata": {
            "resourceVersion": svc.resource_version(),
            "finalizers": finalizers,
        }
    });
    api.patch(
        &svc.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;

    Ok(())
}

/// Emit an Event on the Service; failures are only logged
async fn record(client: &Client, svc: &Service, event_type: &str, reason: &str, message: &str) {
    if let Err(e) = emit_event(client, svc, event_type, reason, message).await {
        warn!("Failed to emit {} event: {:?}", reason, e);
    }
}

/// Helper to emit a Kubernetes Event
async fn emit_event(
    client: &Client,
    svc: &Service,
    event_type: &str,
    reason: &str,
    message: &str,
) -> Result<()> {
    let namespace = svc.namespace().unwrap_or_else(|| "default".to_string());
    let events: Api<Event> = Api::namespaced(client.clone(), &namespace);

    let time = chrono::Utc::now();
    let event = Event {
        metadata: kube::api::ObjectMeta {
            generate_name: Some(format!("{}-", svc.name_any())),
            ..Default::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: svc.object_ref(&()),
        first_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        last_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        count: Some(1),
        ..Default::default()
    };

    events
        .create(&PostParams::default(), &event)
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(svc: Arc<Service>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {}", svc.name_any(), error);
    Action::requeue(retry_delay(error))
}
