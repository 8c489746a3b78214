//! Gateway Fleet Control Plane
//!
//! Background protocols that let gateway nodes coordinate without a central
//! coordinator:
//! - Load reporting and consumption for the distributed rate limiter
//! - Configuration push/pull with backup and in-process reload
//! - Draining buffered analytics into a remote collector

pub mod analytics;
pub mod bus;
pub mod config;
pub mod config_sync;
pub mod context;
pub mod drl;
pub mod error;
pub mod identity;
pub mod load;
pub mod purger;
pub mod queue;
pub mod reload;
pub mod rpc;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use analytics::{AnalyticsBucket, AnalyticsRecord, ANALYTICS_KEYNAME};
pub use bus::{Command, LocalBus, Notification, Notifier};
pub use config::{ConfigStore, GatewayConfig};
pub use config_sync::{
    sanitize_config, ApplyOutcome, ConfigPullRequest, ConfigPullResponse, ConfigPushPayload,
    ConfigSyncApplier, ConfigSyncResponder, RespondOutcome,
};
pub use context::{Collaborators, ControlPlane};
pub use drl::{LoadReport, PeerLoadTable, RateLimitAggregator};
pub use error::{AggregatorError, BusError, ConfigError, RpcError};
pub use identity::HostDetails;
pub use load::{LoadConsumer, LoadReporter, ReportDisposition};
pub use purger::{PurgeReport, Purger};
pub use queue::{MemoryQueueStore, QueueStore};
pub use reload::{ProcessReloader, ReloadSignaller};
pub use rpc::{FuncRegistry, LocalRpcClient, RpcClient};
