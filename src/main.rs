use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use fleet_control_plane::{
    Collaborators, ConfigStore, ControlPlane, FuncRegistry, HostDetails, LocalBus,
    LocalRpcClient, MemoryQueueStore, PeerLoadTable, ProcessReloader,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fleet-node", version, about = "Gateway fleet control-plane node")]
struct Cli {
    /// Configuration file candidates; pushed configuration is written to the first
    #[arg(long = "conf", env = "FLEET_CONF", value_delimiter = ',', default_value = "tyk.conf")]
    conf: Vec<PathBuf>,

    /// Hostname announced to the fleet (defaults to the system hostname)
    #[arg(long, env = "FLEET_HOSTNAME")]
    hostname: Option<String>,

    /// Node id assigned on registration (a random one is generated when absent)
    #[arg(long, env = "FLEET_NODE_ID")]
    node_id: Option<String>,

    /// Directory configuration backups are written to
    #[arg(long, env = "FLEET_BACKUP_DIR", default_value = ".")]
    backup_dir: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

fn system_hostname() -> String {
    fs::read_to_string("/etc/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(unix)]
async fn reload_on_signal(
    plane: Arc<ControlPlane>,
    mut reload: tokio::signal::unix::Signal,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = reload.recv() => {
                info!("Reload signal received");
                if let Err(e) = plane.reload_config() {
                    error!("Configuration reload failed: {}", e);
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = Arc::new(
        ConfigStore::load(cli.conf.clone(), cli.backup_dir.clone())
            .context("failed to load gateway configuration")?,
    );
    let hostname = cli.hostname.unwrap_or_else(system_hostname);
    let node_id = cli
        .node_id
        .unwrap_or_else(|| format!("solo-{}", uuid::Uuid::new_v4()));
    let identity = Arc::new(HostDetails::with_node_id(hostname, std::process::id(), node_id));
    info!(
        hostname = %identity.hostname(),
        node_id = %identity.node_id(),
        pid = identity.pid(),
        "Starting fleet node"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Install the reload handler before anything can send SIGUSR2 to us.
    #[cfg(unix)]
    let reload = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::user_defined2()).context("failed to install reload signal handler")?
    };

    let table = Arc::new(PeerLoadTable::new(identity.server_id(), config.get().tag_hash()));
    table.mark_ready();

    let bus = LocalBus::default();
    let rpc_funcs = Arc::new(FuncRegistry::new());
    let plane = Arc::new(ControlPlane::new(Collaborators {
        identity,
        config,
        notifier: Arc::new(bus.clone()),
        aggregator: table,
        rpc_client: Arc::new(LocalRpcClient::new(rpc_funcs.clone())),
        rpc_funcs,
        queue: Arc::new(MemoryQueueStore::new()),
        reloader: Arc::new(ProcessReloader),
    }));

    #[cfg(unix)]
    let reload_task = tokio::spawn(reload_on_signal(plane.clone(), reload, shutdown_rx.clone()));

    let handles = plane.spawn(shutdown_rx, Some(bus.subscribe()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down fleet node");
    // Receivers may already be gone if every task exited early.
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Background task failed: {}", e);
        }
    }
    #[cfg(unix)]
    {
        if let Err(e) = reload_task.await {
            error!("Reload task failed: {}", e);
        }
    }

    Ok(())
}
