//! idnet daemon: runs a node, or a worker process for a coordinator node.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use idnet_crypto::{generate_keypair, keypair_from_private};
use idnet_network::{TcpTransport, TokioClock};
use idnet_node::{
    init_logging, register_logging_handlers, CallbackRegistry, IdentityNode, LocalExecutor,
    LogFormat, NodeConfig, NodeDeps, StaticDirectory,
};
use idnet_rpc::{JobExecutor, WorkerClient};
use idnet_store_lmdb::{environment::DEFAULT_MAP_SIZE, LmdbBackend};
use idnet_types::{KeyPair, PrivateKey, WorkerId};
use tokio::sync::broadcast;

const KEY_FILE_NAME: &str = "node.key";
const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "idnet-daemon", about = "idnet identity node daemon")]
struct Cli {
    /// Log level, e.g. "info" or "info,idnet_network=debug".
    #[arg(long, env = "IDNET_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format: "human" or "json".
    #[arg(long, env = "IDNET_LOG_FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Node operations.
    #[command(name = "node")]
    Node {
        #[command(subcommand)]
        action: NodeAction,
    },
    /// Worker process operations.
    #[command(name = "worker")]
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },
}

#[derive(clap::Subcommand)]
enum NodeAction {
    /// Run the node until SIGINT or SIGTERM.
    Run {
        /// Path to a TOML configuration file. Defaults apply when omitted.
        #[arg(long, env = "IDNET_CONFIG")]
        config: Option<PathBuf>,

        /// Overrides `data_dir` from the config file.
        #[arg(long, env = "IDNET_DATA_DIR")]
        data_dir: Option<PathBuf>,

        /// Overrides `listen_addr` from the config file.
        #[arg(long, env = "IDNET_LISTEN_ADDR")]
        listen_addr: Option<String>,

        /// Latest ledger height known at startup.
        #[arg(long, default_value_t = 0, env = "IDNET_INITIAL_HEIGHT")]
        initial_height: u64,
    },
}

#[derive(clap::Subcommand)]
enum WorkerAction {
    /// Connect to a coordinator and execute delegated tasks.
    Run {
        /// Coordinator worker endpoint, e.g. ws://10.0.0.5:7801/workers.
        #[arg(long, env = "IDNET_COORDINATOR_URL")]
        coordinator_url: String,

        #[arg(long, env = "IDNET_WORKER_ID")]
        worker_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Node { action } => match action {
            NodeAction::Run {
                config,
                data_dir,
                listen_addr,
                initial_height,
            } => {
                let mut config = match config {
                    Some(path) => NodeConfig::from_toml_file(&path.to_string_lossy())
                        .with_context(|| format!("loading {}", path.display()))?,
                    None => NodeConfig::default(),
                };
                if let Some(data_dir) = data_dir {
                    config.data_dir = data_dir;
                }
                if let Some(listen_addr) = listen_addr {
                    config.listen_addr = listen_addr;
                }
                if let Some(level) = cli.log_level {
                    config.log_level = level;
                }
                if let Some(format) = cli.log_format {
                    config.log_format = format;
                }
                init_logging(config.log_format.parse()?, &config.log_level);
                run_node(config, initial_height).await
            }
        },
        Command::Worker { action } => match action {
            WorkerAction::Run {
                coordinator_url,
                worker_id,
            } => {
                let format: LogFormat = cli.log_format.as_deref().unwrap_or("human").parse()?;
                init_logging(format, cli.log_level.as_deref().unwrap_or("info"));
                run_worker(WorkerId::new(worker_id), coordinator_url).await
            }
        },
    }
}

async fn run_node(config: NodeConfig, initial_height: u64) -> anyhow::Result<()> {
    config.validate()?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;

    let key_path = config
        .key_file
        .clone()
        .unwrap_or_else(|| config.data_dir.join(KEY_FILE_NAME));
    let keys = load_or_create_keys(&key_path)?;
    tracing::info!(
        node_id = %config.node_id,
        public_key = %hex::encode(keys.public.0),
        "node key loaded"
    );

    let backend = LmdbBackend::open(&config.data_dir.join("store"), DEFAULT_MAP_SIZE)?;
    let directory = StaticDirectory::from_peers(&config.peers)?;
    tracing::info!(peers = directory.len(), "peer directory loaded");

    let mut registry = CallbackRegistry::new();
    register_logging_handlers(&mut registry);

    let node = IdentityNode::new(
        config,
        registry,
        NodeDeps {
            keys: Arc::new(keys),
            represented: Vec::new(),
            backend: Arc::new(backend),
            directory: Arc::new(directory),
            transport: Arc::new(TcpTransport::default()),
            clock: Arc::new(TokioClock::new()),
            initial_height,
        },
    )?;
    let bound = node.start().await?;
    tracing::info!(?bound, "idnet node running");

    node.shutdown_controller().wait_for_signal().await;
    tracing::info!("shutdown signal received, stopping node");
    node.stop().await?;
    tracing::info!("idnet daemon exited cleanly");
    Ok(())
}

/// Serve jobs from the coordinator, reconnecting with backoff until
/// SIGINT or SIGTERM.
async fn run_worker(worker_id: WorkerId, coordinator_url: String) -> anyhow::Result<()> {
    let mut registry = CallbackRegistry::new();
    register_logging_handlers(&mut registry);
    let executor: Arc<dyn JobExecutor> = Arc::new(LocalExecutor::new(Arc::new(registry)));
    let client = WorkerClient::new(worker_id.clone(), coordinator_url);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = signal_tx.send(());
    });

    let mut shutdown = shutdown_tx.subscribe();
    let mut backoff = RECONNECT_INITIAL;
    loop {
        match client.run(executor.clone(), shutdown_tx.subscribe()).await {
            Ok(()) => {
                tracing::info!(%worker_id, "coordinator connection closed");
                backoff = RECONNECT_INITIAL;
            }
            Err(e) => {
                tracing::warn!(%worker_id, error = %e, retry_in = ?backoff, "worker connection failed");
            }
        }
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
    tracing::info!(%worker_id, "worker exited cleanly");
    Ok(())
}

/// Read the hex-encoded key seed at `path`, or create one.
fn load_or_create_keys(path: &Path) -> anyhow::Result<KeyPair> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading key file {}", path.display()))?;
        let bytes = hex::decode(text.trim())
            .with_context(|| format!("key file {} is not hex", path.display()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("key file {} must hold 32 bytes", path.display()))?;
        return Ok(keypair_from_private(PrivateKey(seed)));
    }

    let keys = generate_keypair();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, hex::encode(keys.private.0))
        .with_context(|| format!("writing key file {}", path.display()))?;
    tracing::info!(path = %path.display(), "generated new node key");
    Ok(keys)
}
