//! Message bus seam.
//!
//! Nodes talk to each other only through named notifications carrying a JSON
//! payload. The transport itself lives outside this crate behind [`Notifier`];
//! [`LocalBus`] is an in-process broadcast implementation used by the
//! standalone node and by tests.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::BusError;

/// Commands exchanged on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Periodic per-node load report.
    DrlNotification,
    /// Configuration pushed to one node.
    ConfigUpdate,
    /// Request for a node's sanitized configuration.
    ConfigRequest,
    /// Answer to [`Command::ConfigRequest`].
    ConfigResponse,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::DrlNotification => "gateway-drl-notification",
            Command::ConfigUpdate => "gateway-config-update",
            Command::ConfigRequest => "gateway-config-request",
            Command::ConfigResponse => "gateway-config-response",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "gateway-drl-notification" => Some(Command::DrlNotification),
            "gateway-config-update" => Some(Command::ConfigUpdate),
            "gateway-config-request" => Some(Command::ConfigRequest),
            "gateway-config-response" => Some(Command::ConfigResponse),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named message with a JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub command: String,
    pub payload: String,
}

impl Notification {
    pub fn new(command: Command, payload: impl Into<String>) -> Self {
        Self {
            command: command.as_str().to_string(),
            payload: payload.into(),
        }
    }

    /// The known command, or `None` for commands this node does not handle.
    pub fn kind(&self) -> Option<Command> {
        Command::parse(&self.command)
    }
}

/// Publishing side of the bus.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), BusError>;
}

/// In-process broadcast bus.
///
/// Every subscriber sees every notification, including the ones its own node
/// published.
#[derive(Debug, Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<Notification>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Notifier for LocalBus {
    async fn notify(&self, notification: Notification) -> Result<(), BusError> {
        let command = notification.command.clone();
        match self.sender.send(notification) {
            Ok(receivers) => {
                trace!(command = %command, receivers, "Published notification");
                Ok(())
            }
            Err(_) => Err(BusError::NoSubscribers(command)),
        }
    }
}
