//! Analytics purge pipeline.
//!
//! Drains the local analytics buckets and forwards them to the collector over
//! RPC. The drain happens before the forward, so a failed forward loses that
//! bucket's batch. A failed preflight ping leaves every bucket untouched.

use std::{sync::Arc, time::Duration};

use serde_json::Value;
use tokio::{
    sync::watch,
    time::{interval, MissedTickBehavior},
};
use tracing as log;

use crate::{
    analytics::{AnalyticsBucket, AnalyticsRecord},
    error::RpcError,
    queue::QueueStore,
    rpc::{FuncRegistry, RpcClient},
};

pub const PING_METHOD: &str = "Ping";
pub const PURGE_METHOD: &str = "PurgeAnalyticsData";

/// Counters for one purge cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub buckets_drained: usize,
    pub records_forwarded: usize,
    pub failed_records: usize,
    pub forward_failures: usize,
}

/// Decode each element on its own; malformed elements are counted and dropped.
pub fn process_analytics_values(values: Vec<Vec<u8>>) -> (Vec<AnalyticsRecord>, usize) {
    let mut records = Vec::with_capacity(values.len());
    let mut failed_records = 0;

    for value in values {
        match AnalyticsRecord::decode(&value) {
            Ok(record) => {
                log::trace!(?record, "Decoded record");
                records.push(record);
            }
            Err(e) => {
                failed_records += 1;
                log::error!("Couldn't unmarshal analytics data: {}", e);
            }
        }
    }

    (records, failed_records)
}

pub struct Purger {
    store: Arc<dyn QueueStore>,
    client: Arc<dyn RpcClient>,
}

impl Purger {
    pub fn new(store: Arc<dyn QueueStore>, client: Arc<dyn RpcClient>) -> Self {
        Self { store, client }
    }

    /// Register the stub handlers the collector expects to find on this side.
    /// Safe to call repeatedly; each handler is added once per registry.
    pub fn connect(&self, registry: &FuncRegistry) {
        if !self.client.is_connected() {
            log::error!("RPC client is not connected, use connect method first");
        }

        registry.add_func_once(PING_METHOD, |_| Ok(Value::Bool(false)));
        registry.add_func_once(PURGE_METHOD, |_| Ok(Value::Null));

        log::info!("RPC analytics client connected");
    }

    /// Run one purge cycle. Errors only when the preflight ping fails.
    pub async fn purge_cache(&self) -> Result<PurgeReport, RpcError> {
        if !self.client.is_connected() {
            log::error!("RPC client is not connected, use connect method first");
        }

        if let Err(e) = self.client.call(PING_METHOD, None).await {
            log::error!("Can't purge cache, failed to ping RPC: {}", e);
            return Err(e);
        }

        let mut report = PurgeReport::default();
        for bucket in AnalyticsBucket::all() {
            let values = self.store.get_and_delete_set(&bucket.key()).await;
            if values.is_empty() {
                continue;
            }
            report.buckets_drained += 1;

            let (records, failed_records) = process_analytics_values(values);
            report.failed_records += failed_records;
            if failed_records > 0 {
                log::debug!("could not decode {} records", failed_records);
            }

            let data = match serde_json::to_string(&records) {
                Ok(data) => data,
                Err(e) => {
                    log::error!("Failed to marshal analytics data: {}", e);
                    return Ok(report);
                }
            };

            match self.client.call(PURGE_METHOD, Some(data)).await {
                Ok(_) => report.records_forwarded += records.len(),
                Err(e) => {
                    self.client.emit_error_event(PURGE_METHOD, &e);
                    log::warn!(
                        "Failed to call purge, {} records from {} dropped: {}",
                        records.len(),
                        bucket.key(),
                        e
                    );
                    report.forward_failures += 1;
                }
            }
        }

        Ok(report)
    }

    /// Run a purge cycle per tick until `shutdown_rx` changes.
    ///
    /// Ticks missed while a slow cycle runs are skipped rather than replayed.
    pub async fn purge_loop(self, period: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        log::info!("Starting analytics purge loop every {}s", period.as_secs());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Ok(report) = self.purge_cache().await {
                        log::debug!(?report, "Analytics purge cycle complete");
                    }
                }
                _ = shutdown_rx.changed() => {
                    log::info!("Analytics purge loop received shutdown signal");
                    break;
                }
            }
        }

        log::info!("Analytics purge loop stopped");
    }
}
