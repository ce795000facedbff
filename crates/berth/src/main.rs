mod host;

use berth_core::{
    from_yaml, to_yaml, Cluster, Namespace, Node, Resource, ResourceKey, DEFAULT_NAMESPACE,
};
use berth_scheduler::{MockProvisioner, PodController, PodControllerConfig};
use berth_state::{CidrIpam, ClusterState, ClusterStateConfig};
use berth_storage::{RedbBackend, Registry, RevisionedStore, StoreConfig};
use clap::{Parser, Subcommand, ValueEnum};
use host::Reservation;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "berth", about = "Berth cluster state and pod placement")]
struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text", env = "BERTH_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cluster state and the pod controller
    Run {
        /// Path to the redb database file
        #[arg(long, default_value = "./berth.redb", env = "BERTH_DATA_DIR")]
        data_dir: String,
        /// Name of the cluster record created on first start
        #[arg(long, default_value = "berth", env = "BERTH_CLUSTER_NAME")]
        cluster_name: String,
        /// Pod address range used on first start
        #[arg(long, default_value = "10.88.0.0/16", env = "BERTH_POD_CIDR")]
        pod_cidr: String,
        /// YAML cluster record to use on first start instead of the flags above
        #[arg(long, env = "BERTH_CLUSTER_MANIFEST")]
        cluster_manifest: Option<String>,
        /// Start in standby and leave pods unplaced until resumed with SIGUSR1
        /// (SIGUSR2 pauses again)
        #[arg(long, env = "BERTH_STANDBY")]
        standby: bool,
        /// How long a pod lease waits for the coordinator (0 disables)
        #[arg(long, default_value_t = 30, env = "BERTH_LEASE_TIMEOUT_SECS")]
        lease_timeout_secs: u64,
        /// Register this host as a node under the given name
        #[arg(long, env = "BERTH_REGISTER_NODE")]
        register_node: Option<String>,
        /// CPU held back from the registered node, in millicores
        #[arg(long, default_value_t = 0)]
        reserve_cpu: i64,
        /// Memory held back from the registered node, in bytes
        #[arg(long, default_value_t = 0)]
        reserve_memory: i64,
        /// Label for the registered node, as key=value (repeatable)
        #[arg(long = "node-label")]
        node_labels: Vec<String>,
    },
    /// Print the stored nodes as YAML
    Nodes {
        /// Path to the redb database file
        #[arg(long, default_value = "./berth.redb", env = "BERTH_DATA_DIR")]
        data_dir: String,
    },
}

/// Everything `run` needs, collected from the command line
struct RunOptions {
    data_dir: String,
    cluster_name: String,
    pod_cidr: String,
    cluster_manifest: Option<String>,
    standby: bool,
    lease_timeout: Option<Duration>,
    register_node: Option<String>,
    reservation: Reservation,
    node_labels: Vec<String>,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_format);

    match cli.command {
        Commands::Run {
            data_dir,
            cluster_name,
            pod_cidr,
            cluster_manifest,
            standby,
            lease_timeout_secs,
            register_node,
            reserve_cpu,
            reserve_memory,
            node_labels,
        } => {
            run(RunOptions {
                data_dir,
                cluster_name,
                pod_cidr,
                cluster_manifest,
                standby,
                lease_timeout: (lease_timeout_secs > 0)
                    .then(|| Duration::from_secs(lease_timeout_secs)),
                register_node,
                reservation: Reservation {
                    cpu_millicores: reserve_cpu,
                    memory_bytes: reserve_memory,
                    storage_bytes: 0,
                },
                node_labels,
            })
            .await
        }
        Commands::Nodes { data_dir } => print_nodes(&data_dir),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

async fn run(options: RunOptions) -> miette::Result<()> {
    info!("Starting berth with data at {}", options.data_dir);

    let store = open_store(&options.data_dir)?;
    let registry = Registry::new(store.clone());

    let cluster = bootstrap_cluster(&registry, &options)?;
    bootstrap_default_namespace(&registry)?;

    if let Some(name) = &options.register_node {
        register_host(&registry, name, &options)?;
    }

    let ipam = Arc::new(
        CidrIpam::new(store, &cluster.spec.pod_cidr)
            .map_err(|e| miette::miette!("Failed to set up IPAM: {}", e))?,
    );

    let token = CancellationToken::new();

    let state_config = ClusterStateConfig {
        lease_timeout: options.lease_timeout,
        ..Default::default()
    };
    let (state, mut handles) =
        ClusterState::start(registry.clone(), ipam, state_config, token.clone())
            .map_err(|e| miette::miette!("Failed to start cluster state: {}", e))?;

    // No runtime integration yet, so placement records calls only
    let provisioner = Arc::new(MockProvisioner::new());
    let controller = Arc::new(PodController::new(
        state,
        registry,
        provisioner,
        PodControllerConfig {
            start_active: !options.standby,
            ..Default::default()
        },
    ));

    handles.push(watch_placement_signals(controller.clone(), token.clone())?);

    let controller_token = token.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = controller.run(controller_token).await {
            error!("Pod controller error: {}", e);
        }
    }));

    info!(
        "All components started for cluster {} ({})",
        cluster.display_name(),
        if options.standby { "standby" } else { "active" }
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;

    info!("Shutting down gracefully...");
    token.cancel();

    let shutdown_timeout = Duration::from_secs(5);
    if tokio::time::timeout(shutdown_timeout, async {
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await
    .is_err()
    {
        error!("Tasks did not stop within {:?}", shutdown_timeout);
    }

    info!("Shutdown complete");

    Ok(())
}

/// Operator requests that switch pod placement on or off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlacementCommand {
    Resume,
    Pause,
}

async fn apply_placement(controller: &PodController, command: PlacementCommand) {
    match command {
        PlacementCommand::Resume => {
            let queued = controller.resume().await;
            info!("Placement resumed, {} waiting pods queued", queued);
        }
        PlacementCommand::Pause => controller.pause(),
    }
}

/// SIGUSR1 resumes placement and SIGUSR2 pauses it
#[cfg(unix)]
fn watch_placement_signals(
    controller: Arc<PodController>,
    token: CancellationToken,
) -> miette::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut resume = signal(SignalKind::user_defined1())
        .map_err(|e| miette::miette!("Failed to listen for SIGUSR1: {}", e))?;
    let mut pause = signal(SignalKind::user_defined2())
        .map_err(|e| miette::miette!("Failed to listen for SIGUSR2: {}", e))?;

    Ok(tokio::spawn(async move {
        loop {
            let command = tokio::select! {
                _ = token.cancelled() => break,
                Some(()) = resume.recv() => PlacementCommand::Resume,
                Some(()) = pause.recv() => PlacementCommand::Pause,
            };
            apply_placement(&controller, command).await;
        }
    }))
}

#[cfg(not(unix))]
fn watch_placement_signals(
    controller: Arc<PodController>,
    token: CancellationToken,
) -> miette::Result<JoinHandle<()>> {
    tracing::warn!("Placement signals are unavailable on this platform");
    drop(controller);
    Ok(tokio::spawn(async move { token.cancelled().await }))
}

fn print_nodes(data_dir: &str) -> miette::Result<()> {
    let registry = Registry::new(open_store(data_dir)?);
    let (nodes, _) = registry
        .list::<Node>()
        .map_err(|e| miette::miette!("Failed to list nodes: {}", e))?;

    let docs = nodes
        .iter()
        .map(|node| to_yaml(node).map_err(|e| miette::miette!("{}", e)))
        .collect::<miette::Result<Vec<_>>>()?;
    print!("{}", docs.join("---\n"));

    Ok(())
}

fn open_store(data_dir: &str) -> miette::Result<Arc<RevisionedStore>> {
    let kv = Arc::new(
        RedbBackend::new(std::path::Path::new(data_dir))
            .map_err(|e| miette::miette!("Failed to open storage at '{}': {}", data_dir, e))?,
    );

    let store = RevisionedStore::new(kv, StoreConfig::default())
        .map_err(|e| miette::miette!("Failed to open revisioned store: {}", e))?;

    Ok(Arc::new(store))
}

/// Return the stored cluster record, creating it on first start
fn bootstrap_cluster(registry: &Registry, options: &RunOptions) -> miette::Result<Cluster> {
    let (existing, _) = registry
        .list::<Cluster>()
        .map_err(|e| miette::miette!("Failed to read cluster record: {}", e))?;
    if let Some(cluster) = existing.into_iter().next() {
        return Ok(cluster);
    }

    let cluster = match &options.cluster_manifest {
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .map_err(|e| miette::miette!("Failed to read '{}': {}", path, e))?;
            from_yaml::<Cluster>(&data).map_err(|e| miette::miette!("{}", e))?
        }
        None => Cluster::new(&options.cluster_name, &options.pod_cidr),
    };

    let cluster = registry
        .put(cluster)
        .map_err(|e| miette::miette!("Failed to create cluster record: {}", e))?;
    info!("Created cluster {}", cluster.display_name());

    Ok(cluster)
}

/// Bootstrap the "default" namespace if it doesn't already exist
fn bootstrap_default_namespace(registry: &Registry) -> miette::Result<()> {
    let key = ResourceKey::cluster_scoped(Namespace::gvk(), DEFAULT_NAMESPACE);
    let existing = registry
        .get::<Namespace>(&key)
        .map_err(|e| miette::miette!("Failed to read default namespace: {}", e))?;
    if existing.is_some() {
        return Ok(());
    }

    let mut ns = Namespace::default();
    ns.metadata.name = Some(DEFAULT_NAMESPACE.to_string());
    registry
        .put(ns)
        .map_err(|e| miette::miette!("Failed to bootstrap default namespace: {}", e))?;
    info!("Created default namespace");

    Ok(())
}

/// Write this host's node record. Any allocation already stored is kept.
fn register_host(registry: &Registry, name: &str, options: &RunOptions) -> miette::Result<()> {
    let mut node = host::host_node(name, &options.reservation, &options.node_labels)?;

    let key = ResourceKey::cluster_scoped(Node::gvk(), name);
    if let Some(existing) = registry
        .get::<Node>(&key)
        .map_err(|e| miette::miette!("Failed to read node '{}': {}", name, e))?
    {
        node.status.allocated = existing.status.allocated;
        node.spec = existing.spec;
    }

    let node = registry
        .put(node)
        .map_err(|e| miette::miette!("Failed to register node '{}': {}", name, e))?;
    info!("Registered node {} with {}", node.name(), node.status.capacity);

    Ok(())
}
