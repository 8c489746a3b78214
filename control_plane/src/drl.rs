//! Distributed rate limiter seam.
//!
//! Nodes share their current request rate with the fleet so each one can size
//! its slice of a global limit. The limit arithmetic itself lives behind
//! [`RateLimitAggregator`]; [`PeerLoadTable`] is the bookkeeping-only
//! implementation this crate ships.

use std::{
    sync::atomic::{AtomicBool, AtomicI64, Ordering},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AggregatorError;

/// How long a peer's report counts after it was received.
pub const DEFAULT_SERVER_EXPIRY: Duration = Duration::from_secs(10);

/// Load report broadcast by every registered node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LoadReport {
    #[serde(rename = "HostName", default)]
    pub hostname: String,
    #[serde(rename = "ID", default)]
    pub node_id: String,
    #[serde(rename = "LoadPerSec", default)]
    pub load_per_sec: i64,
    #[serde(rename = "TagHash", default)]
    pub tag_hash: String,
}

impl LoadReport {
    /// Key a peer is tracked under: `<nodeID>|<hostname>`.
    pub fn server_id(&self) -> String {
        format!("{}|{}", self.node_id, self.hostname)
    }
}

/// Consumer of peer load reports.
pub trait RateLimitAggregator: Send + Sync {
    /// False until the limiter has finished initialising.
    fn ready(&self) -> bool;

    /// Record or refresh a peer's report.
    fn add_or_update_server(&self, report: LoadReport) -> Result<(), AggregatorError>;

    /// This node's measured request rate.
    fn current_rate(&self) -> i64;

    /// Switch to a new segment fingerprint after the node's tags changed.
    fn set_segment(&self, tag_hash: String);
}

#[derive(Debug, Clone)]
struct PeerEntry {
    report: LoadReport,
    seen_at: Instant,
}

/// Table of peer reports for one fleet segment.
#[derive(Debug)]
pub struct PeerLoadTable {
    this_server_id: String,
    tag_hash: RwLock<String>,
    expiry: Duration,
    ready: AtomicBool,
    rate: AtomicI64,
    servers: DashMap<String, PeerEntry>,
}

impl PeerLoadTable {
    pub fn new(this_server_id: impl Into<String>, tag_hash: impl Into<String>) -> Self {
        Self::with_expiry(this_server_id, tag_hash, DEFAULT_SERVER_EXPIRY)
    }

    pub fn with_expiry(
        this_server_id: impl Into<String>,
        tag_hash: impl Into<String>,
        expiry: Duration,
    ) -> Self {
        let this_server_id = this_server_id.into();
        debug!("DRL: Setting node ID: {}", this_server_id);
        Self {
            this_server_id,
            tag_hash: RwLock::new(tag_hash.into()),
            expiry,
            ready: AtomicBool::new(false),
            rate: AtomicI64::new(0),
            servers: DashMap::new(),
        }
    }

    pub fn this_server_id(&self) -> &str {
        &self.this_server_id
    }

    pub fn segment(&self) -> String {
        self.tag_hash.read().clone()
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Store the rate measured by the request path.
    pub fn record_rate(&self, rate: i64) {
        self.rate.store(rate.max(0), Ordering::Relaxed);
    }

    /// Reports that have not expired yet.
    pub fn peers(&self) -> Vec<LoadReport> {
        self.servers
            .iter()
            .filter(|entry| entry.seen_at.elapsed() < self.expiry)
            .map(|entry| entry.report.clone())
            .collect()
    }

    /// Drop expired peers, returning how many were removed.
    pub fn prune_expired(&self) -> usize {
        let before = self.servers.len();
        self.servers
            .retain(|_, entry| entry.seen_at.elapsed() < self.expiry);
        before.saturating_sub(self.servers.len())
    }
}

impl RateLimitAggregator for PeerLoadTable {
    fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn add_or_update_server(&self, report: LoadReport) -> Result<(), AggregatorError> {
        if !self.ready() {
            return Err(AggregatorError::NotReady);
        }
        {
            let segment = self.tag_hash.read();
            if report.tag_hash != *segment {
                return Err(AggregatorError::SegmentMismatch {
                    expected: segment.clone(),
                    got: report.tag_hash,
                });
            }
        }
        if report.node_id.is_empty() && report.hostname.is_empty() {
            return Err(AggregatorError::Inconsistent(
                "report carries no node identity".to_string(),
            ));
        }
        if report.load_per_sec < 1 {
            return Err(AggregatorError::Inconsistent(format!(
                "non-positive load {} from {}",
                report.load_per_sec,
                report.server_id()
            )));
        }

        let pruned = self.prune_expired();
        if pruned > 0 {
            debug!("DRL: Dropped {} expired peers", pruned);
        }
        self.servers.insert(
            report.server_id(),
            PeerEntry {
                report,
                seen_at: Instant::now(),
            },
        );
        Ok(())
    }

    fn current_rate(&self) -> i64 {
        self.rate.load(Ordering::Relaxed)
    }

    fn set_segment(&self, tag_hash: String) {
        let mut segment = self.tag_hash.write();
        if *segment != tag_hash {
            debug!("DRL: Segment changed from {:?} to {:?}", *segment, tag_hash);
            // Peers from the old segment no longer count towards this one.
            self.servers.clear();
            *segment = tag_hash;
        }
    }
}
