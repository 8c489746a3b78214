//! Periodic load broadcast and the handler that consumes peer reports.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    bus::{Command, Notification, Notifier},
    config::ConfigStore,
    drl::{LoadReport, RateLimitAggregator},
    identity::HostDetails,
};

/// Broadcasts this node's load on a fixed interval.
pub struct LoadReporter {
    identity: Arc<HostDetails>,
    config: Arc<ConfigStore>,
    aggregator: Arc<dyn RateLimitAggregator>,
    notifier: Arc<dyn Notifier>,
}

impl LoadReporter {
    pub fn new(
        identity: Arc<HostDetails>,
        config: Arc<ConfigStore>,
        aggregator: Arc<dyn RateLimitAggregator>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            identity,
            config,
            aggregator,
            notifier,
        }
    }

    /// Build the report for the current tick. A live node never advertises
    /// zero load.
    pub fn build_report(&self) -> LoadReport {
        let rate = match self.aggregator.current_rate() {
            0 => 1,
            rate => rate,
        };

        LoadReport {
            hostname: self.identity.hostname().to_string(),
            node_id: self.identity.node_id(),
            load_per_sec: rate,
            tag_hash: self.config.get().tag_hash(),
        }
    }

    /// Publish one report. Returns whether a report went out.
    pub async fn notify_current_status(&self) -> bool {
        if !self.aggregator.ready() {
            debug!("DRL not ready, skipping load notification");
            return false;
        }

        let report = self.build_report();
        let payload = match serde_json::to_string(&report) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode payload: {}", e);
                return false;
            }
        };

        match self
            .notifier
            .notify(Notification::new(Command::DrlNotification, payload))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to publish load notification: {}", e);
                false
            }
        }
    }

    async fn tick(&self) {
        if self.identity.is_registered() {
            self.notify_current_status().await;
        } else {
            warn!("Node not registered yet, skipping DRL notification");
        }
    }

    /// Run until `shutdown_rx` changes.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let period = self.config.get().drl_notification_interval();
        self.run_every(period, &mut shutdown_rx).await;
    }

    async fn run_every(&self, period: Duration, shutdown_rx: &mut watch::Receiver<bool>) {
        let mut interval_timer = interval(period);
        // A slow publish pushes the next report back instead of bunching them.
        interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Starting gateway rate limiter notifications every {}s",
            period.as_secs()
        );

        loop {
            tokio::select! {
                _ = interval_timer.tick() => {
                    self.tick().await;
                }
                _ = shutdown_rx.changed() => {
                    info!("Rate limiter notifications received shutdown signal");
                    break;
                }
            }
        }

        info!("Rate limiter notifications stopped");
    }
}

/// What happened to an inbound load report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportDisposition {
    Accepted,
    NotReady,
    Malformed,
    Rejected,
}

/// Feeds peer reports from the bus into the aggregator.
pub struct LoadConsumer {
    aggregator: Arc<dyn RateLimitAggregator>,
}

impl LoadConsumer {
    pub fn new(aggregator: Arc<dyn RateLimitAggregator>) -> Self {
        Self { aggregator }
    }

    pub fn handle(&self, payload: &str) -> ReportDisposition {
        if !self.aggregator.ready() {
            warn!("DRL not ready, skipping this notification");
            return ReportDisposition::NotReady;
        }

        let report: LoadReport = match serde_json::from_str(payload) {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, payload = %payload, "DRL: Failed to unmarshal server data");
                return ReportDisposition::Malformed;
            }
        };

        let server_id = report.server_id();
        if let Err(e) = self.aggregator.add_or_update_server(report) {
            // Several segmented groups sharing one bus end up here routinely.
            debug!(
                error = %e,
                server = %server_id,
                "AddOrUpdateServer error, multiple segmented gateway groups may share this bus"
            );
            return ReportDisposition::Rejected;
        }

        ReportDisposition::Accepted
    }
}
