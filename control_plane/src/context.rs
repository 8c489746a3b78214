//! Process-scoped context that owns the collaborators and wires the handlers
//! and background tasks together.

use std::sync::Arc;

use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    bus::{Command, Notification, Notifier},
    config::ConfigStore,
    config_sync::{ConfigSyncApplier, ConfigSyncResponder},
    drl::RateLimitAggregator,
    error::ConfigError,
    identity::HostDetails,
    load::{LoadConsumer, LoadReporter},
    purger::Purger,
    queue::QueueStore,
    reload::ReloadSignaller,
    rpc::{FuncRegistry, RpcClient},
};

/// External collaborators the control plane drives.
pub struct Collaborators {
    pub identity: Arc<HostDetails>,
    pub config: Arc<ConfigStore>,
    pub notifier: Arc<dyn Notifier>,
    pub aggregator: Arc<dyn RateLimitAggregator>,
    pub rpc_client: Arc<dyn RpcClient>,
    pub rpc_funcs: Arc<FuncRegistry>,
    pub queue: Arc<dyn QueueStore>,
    pub reloader: Arc<dyn ReloadSignaller>,
}

pub struct ControlPlane {
    deps: Collaborators,
    load_consumer: LoadConsumer,
    applier: Arc<ConfigSyncApplier>,
    responder: ConfigSyncResponder,
}

impl ControlPlane {
    pub fn new(deps: Collaborators) -> Self {
        let load_consumer = LoadConsumer::new(deps.aggregator.clone());
        let applier = Arc::new(ConfigSyncApplier::new(
            deps.identity.clone(),
            deps.config.clone(),
            deps.reloader.clone(),
        ));
        let responder = ConfigSyncResponder::new(
            deps.identity.clone(),
            deps.config.clone(),
            deps.notifier.clone(),
        );
        Self {
            deps,
            load_consumer,
            applier,
            responder,
        }
    }

    pub fn identity(&self) -> &Arc<HostDetails> {
        &self.deps.identity
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.deps.config
    }

    /// Re-read the configuration from disk and move the rate limiter to the
    /// segment the reloaded tags describe.
    pub fn reload_config(&self) -> Result<(), ConfigError> {
        self.deps.config.reload()?;
        let segment = self.deps.config.get().tag_hash();
        info!(segment = %segment, "Configuration reloaded");
        self.deps.aggregator.set_segment(segment);
        Ok(())
    }

    pub fn load_reporter(&self) -> LoadReporter {
        LoadReporter::new(
            self.deps.identity.clone(),
            self.deps.config.clone(),
            self.deps.aggregator.clone(),
            self.deps.notifier.clone(),
        )
    }

    pub fn purger(&self) -> Purger {
        Purger::new(self.deps.queue.clone(), self.deps.rpc_client.clone())
    }

    /// Route one inbound notification to its handler.
    pub async fn dispatch(&self, notification: &Notification) {
        match notification.kind() {
            Some(Command::DrlNotification) => {
                self.load_consumer.handle(&notification.payload);
            }
            Some(Command::ConfigUpdate) => {
                // Backup and rewrite touch the filesystem; keep them off the
                // runtime workers.
                let applier = self.applier.clone();
                let payload = notification.payload.clone();
                match tokio::task::spawn_blocking(move || applier.apply(&payload)).await {
                    Ok(outcome) => debug!(?outcome, "Handled configuration push"),
                    Err(e) => error!("Configuration push task failed: {}", e),
                }
            }
            Some(Command::ConfigRequest) => {
                let outcome = self.responder.respond(&notification.payload).await;
                debug!(?outcome, "Handled configuration request");
            }
            Some(Command::ConfigResponse) => {
                debug!("Ignoring configuration response addressed to the dashboard");
            }
            None => {
                debug!(command = %notification.command, "Ignoring unknown notification");
            }
        }
    }

    /// Deliver inbound notifications one at a time until shutdown or until
    /// the bus closes.
    pub async fn run_dispatcher(
        self: Arc<Self>,
        mut inbound: broadcast::Receiver<Notification>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Starting notification dispatcher");
        loop {
            tokio::select! {
                received = inbound.recv() => match received {
                    Ok(notification) => self.dispatch(&notification).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Notification dispatcher lagged, {} messages skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Notification bus closed");
                        break;
                    }
                },
                _ = shutdown_rx.changed() => {
                    info!("Notification dispatcher received shutdown signal");
                    break;
                }
            }
        }
        info!("Notification dispatcher stopped");
    }

    /// Spawn the load reporter, the purge loop and, when given an inbound
    /// stream, the dispatcher. All of them stop when `shutdown_rx` changes.
    pub fn spawn(
        self: Arc<Self>,
        shutdown_rx: watch::Receiver<bool>,
        inbound: Option<broadcast::Receiver<Notification>>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(3);

        handles.push(tokio::spawn(self.load_reporter().run(shutdown_rx.clone())));

        let purger = self.purger();
        purger.connect(&self.deps.rpc_funcs);
        let period = self.deps.config.get().purge_interval();
        handles.push(tokio::spawn(purger.purge_loop(period, shutdown_rx.clone())));

        if let Some(inbound) = inbound {
            handles.push(tokio::spawn(self.run_dispatcher(inbound, shutdown_rx)));
        }

        handles
    }
}
