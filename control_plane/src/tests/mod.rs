//! Multi-node tests over a shared in-process bus.


use std::{
    fs, io,
    path::PathBuf,
    sync::{Arc, Once},
};

use parking_lot::Mutex;
use tempfile::TempDir;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::{
    bus::LocalBus,
    config::ConfigStore,
    context::{Collaborators, ControlPlane},
    drl::PeerLoadTable,
    identity::HostDetails,
    queue::MemoryQueueStore,
    reload::ReloadSignaller,
    rpc::{FuncRegistry, LocalRpcClient},
};

static INIT: Once = Once::new();

/// Initialize test logging infrastructure
fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .try_init();
    });
}

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

/// One gateway node with its own config directory, wired to `bus`.
struct TestNode {
    _dir: TempDir,
    conf: PathBuf,
    plane: Arc<ControlPlane>,
    table: Arc<PeerLoadTable>,
    queue: MemoryQueueStore,
    reloader: Arc<RecordingReloader>,
}

impl TestNode {
    fn new(bus: &LocalBus, hostname: &str, node_id: &str, document: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("tyk.conf");
        fs::write(&conf, document).unwrap();
        let config = Arc::new(ConfigStore::load(vec![conf.clone()], dir.path()).unwrap());

        let identity = Arc::new(HostDetails::with_node_id(hostname, 1000, node_id));
        let table = Arc::new(PeerLoadTable::new(identity.server_id(), config.get().tag_hash()));
        table.mark_ready();

        let rpc_funcs = Arc::new(FuncRegistry::new());
        let queue = MemoryQueueStore::new();
        let reloader = Arc::new(RecordingReloader::default());

        let plane = Arc::new(ControlPlane::new(Collaborators {
            identity,
            config,
            notifier: Arc::new(bus.clone()),
            aggregator: table.clone(),
            rpc_client: Arc::new(LocalRpcClient::new(rpc_funcs.clone())),
            rpc_funcs,
            queue: Arc::new(queue.clone()),
            reloader: reloader.clone(),
        }));

        Self {
            _dir: dir,
            conf,
            plane,
            table,
            queue,
            reloader,
        }
    }

    fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.table.peers().into_iter().map(|r| r.node_id).collect();
        ids.sort();
        ids
    }
}
