//! Configuration push/pull between fleet nodes.
//!
//! A push carries a full configuration addressed to one node by hostname or
//! node id. The addressed node backs up what it runs, writes the new document
//! to its primary path and signals itself to reload. A pull asks a node for
//! its on-disk configuration with credentials stripped.

use std::{fmt::Display, fs, path::PathBuf, sync::Arc};

use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing as log;

use crate::{
    bus::{Command, Notification, Notifier},
    config::{merge_json, to_pretty_json, ConfigStore, GatewayConfig},
    error::ConfigError,
    identity::HostDetails,
    reload::ReloadSignaller,
};

/// Suffix of configuration backups.
pub const BACKUP_EXTENSION: &str = ".tyk.conf";
/// `<Weekday>-<Month>-<Day>-<Hour24>-<Minute>-<Second>-<Year>`, day space-padded.
pub const BACKUP_TIME_FORMAT: &str = "%a-%b-%e-%H-%M-%S-%Y";
/// Top-level keys never exposed to peers.
pub const SENSITIVE_KEYS: [&str; 5] = [
    "secret",
    "node_secret",
    "storage",
    "slave_options",
    "auth_override",
];

/// Configuration pushed to a single node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigPushPayload {
    #[serde(rename = "Configuration", default)]
    pub configuration: GatewayConfig,
    #[serde(rename = "ForHostname", default)]
    pub for_hostname: String,
    #[serde(rename = "ForNodeID", default)]
    pub for_node_id: String,
    #[serde(rename = "TimeStamp", default)]
    pub timestamp: i64,
}

/// Request for a node's sanitized configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigPullRequest {
    #[serde(rename = "FromHostname", default)]
    pub from_hostname: String,
    #[serde(rename = "FromNodeID", default)]
    pub from_node_id: String,
    #[serde(rename = "TimeStamp", default)]
    pub timestamp: i64,
}

/// A node's sanitized configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigPullResponse {
    #[serde(rename = "FromHostname")]
    pub from_hostname: String,
    #[serde(rename = "FromNodeID")]
    pub from_node_id: String,
    #[serde(rename = "Configuration")]
    pub configuration: Map<String, Value>,
    #[serde(rename = "TimeStamp")]
    pub timestamp: i64,
}

/// Remove credentials and upstream settings. Only top-level keys are touched.
pub fn sanitize_config(mut config: Map<String, Value>) -> Map<String, Value> {
    config.retain(|key, _| !SENSITIVE_KEYS.contains(&key.as_str()));
    config
}

pub fn backup_file_name<Tz>(now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    format!("{}{}", now.format(BACKUP_TIME_FORMAT), BACKUP_EXTENSION)
}

/// Step at which a configuration push stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Malformed,
    NotAddressed,
    RemoteConfigDisabled,
    BackupFailed,
    WriteFailed,
    NoProcessId,
    SignalFailed { backup: PathBuf },
    Reloaded { backup: PathBuf, pid: u32 },
}

/// Applies configuration pushed to this node.
pub struct ConfigSyncApplier {
    identity: Arc<HostDetails>,
    config: Arc<ConfigStore>,
    reloader: Arc<dyn ReloadSignaller>,
}

impl ConfigSyncApplier {
    pub fn new(
        identity: Arc<HostDetails>,
        config: Arc<ConfigStore>,
        reloader: Arc<dyn ReloadSignaller>,
    ) -> Self {
        Self {
            identity,
            config,
            reloader,
        }
    }

    /// Decode a push on top of the on-disk configuration so that keys the
    /// payload omits keep their current values.
    pub fn decode_payload(&self, payload: &str) -> Result<ConfigPushPayload, ConfigError> {
        let base = match self.config.read_on_disk() {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Merging pushed configuration over defaults: {}", e);
                GatewayConfig::default()
            }
        };

        let mut envelope: Value = serde_json::from_str(payload)?;
        let fields = envelope.as_object_mut().ok_or(ConfigError::NotAnObject)?;
        let mut merged = serde_json::to_value(base)?;
        if let Some(patch) = fields.remove("Configuration") {
            merge_json(&mut merged, patch);
        }
        fields.insert("Configuration".to_string(), merged);

        Ok(serde_json::from_value(envelope)?)
    }

    /// Write the running configuration to a timestamped backup file.
    pub fn backup_configuration(&self) -> Result<PathBuf, ConfigError> {
        let snapshot = to_pretty_json(&self.config.get())?;
        let path = self
            .config
            .backup_dir()
            .join(backup_file_name(&Local::now()));
        fs::write(&path, snapshot).map_err(|source| ConfigError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Overwrite the primary configuration file.
    pub fn write_new_configuration(&self, config: &GatewayConfig) -> Result<PathBuf, ConfigError> {
        let document = to_pretty_json(config)?;
        let path = self.config.primary_path()?.to_path_buf();
        fs::write(&path, document).map_err(|source| ConfigError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    pub fn apply(&self, payload: &str) -> ApplyOutcome {
        let push = match self.decode_payload(payload) {
            Ok(push) => push,
            Err(e) => {
                log::error!("Failed to decode configuration payload: {}", e);
                return ApplyOutcome::Malformed;
            }
        };

        if !self
            .identity
            .is_addressed_by(&push.for_hostname, &push.for_node_id)
        {
            log::info!("Configuration update received, no NodeID/Hostname match found");
            return ApplyOutcome::NotAddressed;
        }

        if !self.config.get().allow_remote_config {
            log::warn!("Ignoring new config: Remote configuration is not allowed for this node.");
            return ApplyOutcome::RemoteConfigDisabled;
        }

        let backup = match self.backup_configuration() {
            Ok(path) => path,
            Err(e) => {
                log::error!("Failed to backup existing configuration: {}", e);
                return ApplyOutcome::BackupFailed;
            }
        };
        log::debug!("Backed up configuration to {}", backup.display());

        if let Err(e) = self.write_new_configuration(&push.configuration) {
            log::error!("Failed to write new configuration: {}", e);
            return ApplyOutcome::WriteFailed;
        }

        log::info!("Initiating configuration reload");

        let pid = self.identity.pid();
        if pid == 0 {
            log::error!("No PID found, cannot reload");
            return ApplyOutcome::NoProcessId;
        }

        log::info!("Sending reload signal to PID: {}", pid);
        if let Err(e) = self.reloader.send_reload(pid) {
            log::error!("Process reload failed: {}", e);
            return ApplyOutcome::SignalFailed { backup };
        }

        ApplyOutcome::Reloaded { backup, pid }
    }
}

/// What happened to a configuration pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespondOutcome {
    Malformed,
    NotAddressed,
    ReadFailed,
    EncodeFailed,
    PublishFailed,
    Sent,
}

/// Answers pull requests with this node's sanitized configuration.
pub struct ConfigSyncResponder {
    identity: Arc<HostDetails>,
    config: Arc<ConfigStore>,
    notifier: Arc<dyn Notifier>,
}

impl ConfigSyncResponder {
    pub fn new(
        identity: Arc<HostDetails>,
        config: Arc<ConfigStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            identity,
            config,
            notifier,
        }
    }

    /// The on-disk configuration with sensitive keys removed.
    pub fn existing_config(&self) -> Result<Map<String, Value>, ConfigError> {
        Ok(sanitize_config(self.config.read_document()?))
    }

    pub async fn respond(&self, payload: &str) -> RespondOutcome {
        let request: ConfigPullRequest = match serde_json::from_str(payload) {
            Ok(request) => request,
            Err(e) => {
                log::error!("Failed unmarshal request: {}", e);
                return RespondOutcome::Malformed;
            }
        };

        if !self
            .identity
            .is_addressed_by(&request.from_hostname, &request.from_node_id)
        {
            log::debug!("Configuration request received, no NodeID/Hostname match found, ignoring");
            return RespondOutcome::NotAddressed;
        }

        let configuration = match self.existing_config() {
            Ok(config) => config,
            Err(e) => {
                log::error!("Failed to get existing configuration: {}", e);
                return RespondOutcome::ReadFailed;
            }
        };

        let response = ConfigPullResponse {
            from_hostname: self.identity.hostname().to_string(),
            from_node_id: self.identity.node_id(),
            configuration,
            timestamp: Utc::now().timestamp(),
        };

        let payload = match serde_json::to_string(&response) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Failed to marshal configuration: {}", e);
                return RespondOutcome::EncodeFailed;
            }
        };

        if let Err(e) = self
            .notifier
            .notify(Notification::new(Command::ConfigResponse, payload))
            .await
        {
            log::warn!("Failed to publish configuration response: {}", e);
            return RespondOutcome::PublishFailed;
        }

        log::debug!("Configuration request responded.");
        RespondOutcome::Sent
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        path::Path,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::error::BusError;

    #[derive(Default)]
    struct RecordingReloader {
        pids: Mutex<Vec<u32>>,
    }

    impl ReloadSignaller for RecordingReloader {
        fn send_reload(&self, pid: u32) -> io::Result<()> {
            self.pids.lock().push(pid);
            Ok(())
        }
    }

    struct BrokenReloader {
        calls: AtomicUsize,
    }

    impl ReloadSignaller for BrokenReloader {
        fn send_reload(&self, _pid: u32) -> io::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::from_raw_os_error(libc::ESRCH))
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: Notification) -> Result<(), BusError> {
            self.sent.lock().push(notification);
            Ok(())
        }
    }

    const ORIGINAL: &str = r#"{
    "listen_port": 8080,
    "secret": "s3cr3t",
    "allow_remote_config": true,
    "storage": {"host": "localhost", "port": 6379},
    "hash_keys": true
}"#;

    struct Node {
        dir: TempDir,
        conf: PathBuf,
        identity: Arc<HostDetails>,
        config: Arc<ConfigStore>,
    }

    impl Node {
        fn new(hostname: &str, node_id: &str, pid: u32) -> Self {
            Self::with_document(hostname, node_id, pid, ORIGINAL)
        }

        fn with_document(hostname: &str, node_id: &str, pid: u32, document: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let conf = dir.path().join("tyk.conf");
            fs::write(&conf, document).unwrap();
            let backups = dir.path().join("backups");
            let config = Arc::new(ConfigStore::load(vec![conf.clone()], backups).unwrap());
            fs::create_dir_all(config.backup_dir()).unwrap();
            Self {
                dir,
                conf,
                identity: Arc::new(HostDetails::with_node_id(hostname, pid, node_id)),
                config,
            }
        }

        fn applier(&self, reloader: Arc<dyn ReloadSignaller>) -> ConfigSyncApplier {
            ConfigSyncApplier::new(self.identity.clone(), self.config.clone(), reloader)
        }

        fn backups(&self) -> Vec<PathBuf> {
            match fs::read_dir(self.config.backup_dir()) {
                Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
                Err(_) => Vec::new(),
            }
        }
    }

    fn push(hostname: &str, node_id: &str, configuration: Value) -> String {
        json!({
            "Configuration": configuration,
            "ForHostname": hostname,
            "ForNodeID": node_id,
            "TimeStamp": 1_700_000_000
        })
        .to_string()
    }

    fn read_json(path: &Path) -> Value {
        serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
    }

    #[test]
    fn test_sanitize_config() {
        let map = json!({"secret": "x", "storage": {}, "port": 8080});
        let Value::Object(map) = map else { unreachable!() };
        assert_eq!(Value::Object(sanitize_config(map)), json!({"port": 8080}));
    }

    #[test]
    fn test_sanitize_strips_only_top_level() {
        let map = json!({
            "node_secret": "n",
            "slave_options": {"rpc_key": "k"},
            "auth_override": {},
            "nested": {"secret": "stays"}
        });
        let Value::Object(map) = map else { unreachable!() };
        assert_eq!(
            Value::Object(sanitize_config(map)),
            json!({"nested": {"secret": "stays"}})
        );
    }

    #[test]
    fn test_backup_file_name_format() {
        let at = Utc.with_ymd_and_hms(2006, 1, 2, 15, 4, 5).unwrap();
        assert_eq!(backup_file_name(&at), "Mon-Jan- 2-15-04-05-2006.tyk.conf");
        let at = Utc.with_ymd_and_hms(2024, 11, 23, 9, 30, 0).unwrap();
        assert_eq!(backup_file_name(&at), "Sat-Nov-23-09-30-00-2024.tyk.conf");
    }

    #[test]
    fn test_apply_by_hostname_regardless_of_node_id() {
        let node = Node::new("h1", "some-node", 4242);
        let reloader = Arc::new(RecordingReloader::default());
        let outcome = node
            .applier(reloader.clone())
            .apply(&push("h1", "", json!({"listen_port": 9090})));

        assert!(matches!(outcome, ApplyOutcome::Reloaded { pid: 4242, .. }));
        assert_eq!(*reloader.pids.lock(), vec![4242]);
        assert_eq!(read_json(&node.conf)["listen_port"], json!(9090));
    }

    #[test]
    fn test_apply_by_node_id_alone() {
        let node = Node::new("h1", "n1", 4242);
        let reloader = Arc::new(RecordingReloader::default());
        let outcome = node
            .applier(reloader)
            .apply(&push("elsewhere", "n1", json!({})));
        assert!(matches!(outcome, ApplyOutcome::Reloaded { .. }));
    }

    #[test]
    fn test_ignored_when_both_fields_differ() {
        let node = Node::new("h2", "n2", 4242);
        let reloader = Arc::new(RecordingReloader::default());
        let before = fs::read(&node.conf).unwrap();

        let outcome = node
            .applier(reloader.clone())
            .apply(&push("h1", "", json!({"listen_port": 9090})));

        assert_eq!(outcome, ApplyOutcome::NotAddressed);
        assert!(reloader.pids.lock().is_empty());
        assert!(node.backups().is_empty());
        assert_eq!(fs::read(&node.conf).unwrap(), before);
    }

    #[test]
    fn test_remote_config_disabled() {
        let node = Node::with_document("h1", "n1", 4242, r#"{"allow_remote_config": false}"#);
        let reloader = Arc::new(RecordingReloader::default());
        let outcome = node.applier(reloader.clone()).apply(&push("h1", "n1", json!({})));
        assert_eq!(outcome, ApplyOutcome::RemoteConfigDisabled);
        assert!(node.backups().is_empty());
        assert!(reloader.pids.lock().is_empty());
    }

    #[test]
    fn test_malformed_payload() {
        let node = Node::new("h1", "n1", 4242);
        let applier = node.applier(Arc::new(RecordingReloader::default()));
        assert_eq!(applier.apply("{truncated"), ApplyOutcome::Malformed);
        assert_eq!(applier.apply("[1, 2]"), ApplyOutcome::Malformed);
        assert_eq!(
            applier.apply(&push("h1", "n1", json!({"listen_port": "not a port"}))),
            ApplyOutcome::Malformed
        );
    }

    #[test]
    fn test_push_merges_over_on_disk_configuration() {
        let node = Node::new("h1", "n1", 4242);
        let applier = node.applier(Arc::new(RecordingReloader::default()));
        let outcome = applier.apply(&push(
            "h1",
            "n1",
            json!({"listen_port": 9191, "storage": {"host": "redis.internal"}}),
        ));
        assert!(matches!(outcome, ApplyOutcome::Reloaded { .. }));

        let written = read_json(&node.conf);
        assert_eq!(written["listen_port"], json!(9191));
        assert_eq!(written["secret"], json!("s3cr3t"));
        assert_eq!(written["hash_keys"], json!(true));
        assert_eq!(written["storage"]["host"], json!("redis.internal"));
        assert_eq!(written["storage"]["port"], json!(6379));
    }

    #[test]
    fn test_backup_holds_running_configuration() {
        let node = Node::new("h1", "n1", 4242);
        let applier = node.applier(Arc::new(RecordingReloader::default()));
        let ApplyOutcome::Reloaded { backup, .. } =
            applier.apply(&push("h1", "n1", json!({"listen_port": 9191})))
        else {
            panic!("push was not applied");
        };

        assert!(backup.starts_with(node.config.backup_dir()));
        assert!(backup.to_string_lossy().ends_with(".tyk.conf"));
        let saved = fs::read_to_string(&backup).unwrap();
        assert!(saved.contains("\n    \"listen_port\": 8080"));
        assert_eq!(read_json(&backup)["secret"], json!("s3cr3t"));
    }

    #[test]
    fn test_backup_failure_leaves_primary_untouched() {
        let node = Node::new("h1", "n1", 4242);
        // Backup directory nested under a regular file cannot be written to.
        let blocker = node.dir.path().join("blocker");
        fs::write(&blocker, "").unwrap();
        let config = Arc::new(ConfigStore::new(
            vec![node.conf.clone()],
            blocker.join("backups"),
            node.config.get(),
        ));
        let reloader = Arc::new(RecordingReloader::default());
        let applier = ConfigSyncApplier::new(node.identity.clone(), config, reloader.clone());
        let before = fs::read(&node.conf).unwrap();

        let outcome = applier.apply(&push("h1", "n1", json!({"listen_port": 9191})));

        assert_eq!(outcome, ApplyOutcome::BackupFailed);
        assert_eq!(fs::read(&node.conf).unwrap(), before);
        assert!(reloader.pids.lock().is_empty());
    }

    #[test]
    fn test_write_failure_skips_reload() {
        let node = Node::new("h1", "n1", 4242);
        let config = Arc::new(ConfigStore::new(
            vec![node.dir.path().join("missing-dir").join("tyk.conf")],
            node.config.backup_dir(),
            node.config.get(),
        ));
        let reloader = Arc::new(RecordingReloader::default());
        let applier = ConfigSyncApplier::new(node.identity.clone(), config, reloader.clone());

        let outcome = applier.apply(&push("h1", "n1", json!({})));
        assert_eq!(outcome, ApplyOutcome::WriteFailed);
        assert_eq!(node.backups().len(), 1);
        assert!(reloader.pids.lock().is_empty());
    }

    #[test]
    fn test_no_reload_without_pid() {
        let node = Node::new("h1", "n1", 0);
        let reloader = Arc::new(RecordingReloader::default());
        let outcome = node
            .applier(reloader.clone())
            .apply(&push("h1", "n1", json!({"listen_port": 9191})));

        assert_eq!(outcome, ApplyOutcome::NoProcessId);
        assert!(reloader.pids.lock().is_empty());
        // The new configuration is still on disk for the next restart.
        assert_eq!(read_json(&node.conf)["listen_port"], json!(9191));
    }

    #[test]
    fn test_signal_failure_is_reported() {
        let node = Node::new("h1", "n1", 31337);
        let reloader = Arc::new(BrokenReloader {
            calls: AtomicUsize::new(0),
        });
        let outcome = node.applier(reloader.clone()).apply(&push("h1", "n1", json!({})));
        assert!(matches!(outcome, ApplyOutcome::SignalFailed { .. }));
        assert_eq!(reloader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_responder_sends_sanitized_configuration() {
        let node = Node::new("h1", "n1", 1);
        let notifier = Arc::new(RecordingNotifier::default());
        let responder =
            ConfigSyncResponder::new(node.identity.clone(), node.config.clone(), notifier.clone());

        let request = json!({"FromHostname": "h1", "FromNodeID": "", "TimeStamp": 1}).to_string();
        assert_eq!(responder.respond(&request).await, RespondOutcome::Sent);

        let sent = notifier.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind(), Some(Command::ConfigResponse));
        let response: ConfigPullResponse = serde_json::from_str(&sent[0].payload).unwrap();
        assert_eq!(response.from_hostname, "h1");
        assert_eq!(response.from_node_id, "n1");
        assert!(response.timestamp > 0);
        assert_eq!(
            Value::Object(response.configuration),
            json!({"listen_port": 8080, "allow_remote_config": true, "hash_keys": true})
        );
    }

    #[tokio::test]
    async fn test_responder_ignores_other_nodes() {
        let node = Node::new("h1", "n1", 1);
        let notifier = Arc::new(RecordingNotifier::default());
        let responder =
            ConfigSyncResponder::new(node.identity.clone(), node.config.clone(), notifier.clone());

        let request = json!({"FromHostname": "h9", "FromNodeID": "n9"}).to_string();
        assert_eq!(responder.respond(&request).await, RespondOutcome::NotAddressed);
        assert_eq!(responder.respond("garbage").await, RespondOutcome::Malformed);
        assert!(notifier.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_responder_drops_request_when_file_unreadable() {
        let node = Node::new("h1", "n1", 1);
        fs::remove_file(&node.conf).unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let responder =
            ConfigSyncResponder::new(node.identity.clone(), node.config.clone(), notifier.clone());

        let request = json!({"FromHostname": "h1", "FromNodeID": "n1"}).to_string();
        assert_eq!(responder.respond(&request).await, RespondOutcome::ReadFailed);
        assert!(notifier.sent.lock().is_empty());
    }

    #[test]
    fn test_pull_response_round_trip() {
        let mut configuration = Map::new();
        configuration.insert("listen_port".to_string(), json!(8080));
        configuration.insert("tags".to_string(), json!(["a", "b"]));
        let response = ConfigPullResponse {
            from_hostname: "h1".to_string(),
            from_node_id: "n1".to_string(),
            configuration,
            timestamp: 1_700_000_000,
        };

        let encoded = serde_json::to_string(&response).unwrap();
        assert!(encoded.contains("\"FromNodeID\":\"n1\""));
        let decoded: ConfigPullResponse = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, response);
    }
}
