use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use hcloud_lb_controller::cloud::{resolve_network, ActionWaiter, HcloudClient};
use hcloud_lb_controller::config::ControllerConfig;
use hcloud_lb_controller::controller::{self, LoadBalancerOps, LoadBalancers};
use hcloud_lb_controller::Error;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller
    Run(RunArgs),
    /// Show version and build information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace holding the leader election lease
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "kube-system")]
    namespace: String,

    /// Listen address of the health and metrics endpoints
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:8233")]
    bind_address: SocketAddr,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("hcloud-lb-controller v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => run_controller(run_args).await,
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

async fn run_controller(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_json);

    info!(
        "Starting hcloud-lb-controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = ControllerConfig::from_env()?;
    info!("Loaded configuration: {:?}", config);

    let hcloud = Arc::new(HcloudClient::new(&config.endpoint, &config.token)?);

    let network_id = match &config.network {
        Some(id_or_name) => {
            let network = resolve_network(&*hcloud, id_or_name)
                .await?
                .ok_or_else(|| Error::ConfigError(format!("network {id_or_name} not found")))?;
            info!("Using private network {} ({})", network.name, network.id);
            Some(network.id)
        }
        None => None,
    };

    let load_balancers = LoadBalancers::new(LoadBalancerOps {
        lb_client: hcloud.clone(),
        cert_client: hcloud.clone(),
        waiter: ActionWaiter::new(hcloud, config.action_poll_interval),
        network_id,
        defaults: config.load_balancer.clone(),
        retry_delay: config.attach_retry_delay,
    });

    // Initialize Kubernetes client
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    // Leader election configuration
    let leader_namespace =
        std::env::var("POD_NAMESPACE").unwrap_or_else(|_| args.namespace.clone());
    let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    });

    info!("Leader election using holder ID: {}", holder_identity);

    let is_leader = Arc::new(AtomicBool::new(false));

    {
        let lease_client = client.clone();
        let lease_ns = leader_namespace.clone();
        let identity = holder_identity.clone();
        let is_leader_bg = Arc::clone(&is_leader);

        tokio::spawn(async move {
            run_leader_election(lease_client, &lease_ns, &identity, is_leader_bg).await;
        });
    }

    let state = Arc::new(controller::ControllerState {
        client: client.clone(),
        load_balancers,
        enabled: config.enabled,
        is_leader: Arc::clone(&is_leader),
    });

    #[cfg(feature = "rest-api")]
    {
        let api_state = state.clone();
        let addr = args.bind_address;
        tokio::spawn(async move {
            if let Err(e) = hcloud_lb_controller::rest_api::run_server(api_state, addr).await {
                tracing::error!("REST API server error: {:?}", e);
            }
        });
    }

    controller::run_controller(state).await
}

const LEASE_NAME: &str = "hcloud-lb-controller-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);
const RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

async fn run_leader_election(
    client: kube::Client,
    namespace: &str,
    identity: &str,
    is_leader: Arc<AtomicBool>,
) {
    let leases: Api<Lease> = Api::namespaced(client, namespace);

    loop {
        match try_acquire_or_renew(&leases, namespace, identity).await {
            Ok(true) => {
                if !is_leader.load(Ordering::Relaxed) {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(true, Ordering::Relaxed);
                tokio::time::sleep(RENEW_INTERVAL).await;
            }
            Ok(false) => {
                if is_leader.load(Ordering::Relaxed) {
                    warn!("Lost leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    match leases.get(LEASE_NAME).await {
        Ok(existing) => {
            let spec = existing.spec.as_ref();
            let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

            if current_holder == Some(identity) {
                let patch = serde_json::json!({
                    "spec": {
                        "renewTime": MicroTime(now),
                        "leaseDurationSeconds": LEASE_DURATION_SECS,
                    }
                });
                leases
                    .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                return Ok(true);
            }

            let expired = spec
                .and_then(|s| s.renew_time.as_ref())
                .map(|renew| {
                    let duration = spec
                        .and_then(|s| s.lease_duration_seconds)
                        .unwrap_or(LEASE_DURATION_SECS);
                    now > renew.0 + chrono::Duration::seconds(duration as i64)
                })
                .unwrap_or(true);

            if !expired {
                return Ok(false);
            }

            info!("Lease held by {:?} has expired, taking over", current_holder);
            // resourceVersion guards against two replicas taking over at once
            let patch = serde_json::json!({
                "metadata": {
                    "resourceVersion": existing.metadata.resource_version,
                },
                "spec": {
                    "holderIdentity": identity,
                    "acquireTime": MicroTime(now),
                    "renewTime": MicroTime(now),
                    "leaseDurationSeconds": LEASE_DURATION_SECS,
                }
            });
            match leases
                .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
                Err(e) => Err(e),
            }
        }
        Err(kube::Error::Api(err)) if err.code == 404 => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: Some(k8s_openapi::api::coordination::v1::LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            leases.create(&PostParams::default(), &lease).await?;
            info!("Created lease {} with holder {}", LEASE_NAME, identity);
            Ok(true)
        }
        Err(e) => Err(e),
    }
}
