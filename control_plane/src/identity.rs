//! Node identity: hostname, process id and the node id handed out on registration.

use parking_lot::RwLock;

/// Identity details for this gateway process.
///
/// Hostname and pid are fixed at construction. The node id stays empty until
/// the node registers with the fleet; periodic tasks check
/// [`HostDetails::is_registered`] before announcing themselves.
#[derive(Debug)]
pub struct HostDetails {
    hostname: String,
    pid: u32,
    node_id: RwLock<String>,
}

impl HostDetails {
    pub fn new(hostname: impl Into<String>, pid: u32) -> Self {
        Self {
            hostname: hostname.into(),
            pid,
            node_id: RwLock::new(String::new()),
        }
    }

    /// Identity of the running process with an already-known node id.
    pub fn with_node_id(hostname: impl Into<String>, pid: u32, node_id: impl Into<String>) -> Self {
        let details = Self::new(hostname, pid);
        details.set_node_id(node_id);
        details
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Process id, `0` when unknown.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn node_id(&self) -> String {
        self.node_id.read().clone()
    }

    pub fn set_node_id(&self, node_id: impl Into<String>) {
        *self.node_id.write() = node_id.into();
    }

    pub fn is_registered(&self) -> bool {
        !self.node_id.read().is_empty()
    }

    /// Server id used by the rate limiter: `<nodeID>|<hostname>`.
    pub fn server_id(&self) -> String {
        format!("{}|{}", self.node_id(), self.hostname)
    }

    /// True when either the hostname or the node id matches.
    ///
    /// A message is ignored only when both fields differ.
    pub fn is_addressed_by(&self, hostname: &str, node_id: &str) -> bool {
        hostname == self.hostname || node_id == *self.node_id.read()
    }
}
