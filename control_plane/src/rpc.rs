//! Remote-call seam used to reach the central collector.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::RpcError;

/// Client side of the remote-call connection.
#[async_trait]
pub trait RpcClient: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn call(&self, method: &str, arg: Option<String>) -> Result<Value, RpcError>;

    /// Report a failed call to whatever tracks connection health.
    fn emit_error_event(&self, method: &str, error: &RpcError) {
        warn!(method = %method, error = %error, "RPC call error event");
    }
}

pub type RpcFunc = Arc<dyn Fn(Option<String>) -> Result<Value, RpcError> + Send + Sync>;

/// Functions this process exposes to the remote side, by name.
#[derive(Default)]
pub struct FuncRegistry {
    funcs: DashMap<String, RpcFunc>,
}

impl FuncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `func` unless `name` is already taken. Returns whether it was added.
    pub fn add_func_once<F>(&self, name: &str, func: F) -> bool
    where
        F: Fn(Option<String>) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        match self.funcs.entry(name.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(func));
                debug!("Registered RPC function {}", name);
                true
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.funcs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    pub fn invoke(&self, name: &str, arg: Option<String>) -> Result<Value, RpcError> {
        // Clone out of the map so the shard lock is not held during the call.
        let func = self
            .funcs
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RpcError::FunctionNotFound(name.to_string()))?;
        func(arg)
    }
}

impl std::fmt::Debug for FuncRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.funcs.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("FuncRegistry").field("funcs", &names).finish()
    }
}

/// Client that dispatches calls into this process's own [`FuncRegistry`].
#[derive(Debug)]
pub struct LocalRpcClient {
    registry: Arc<FuncRegistry>,
    connected: AtomicBool,
}

impl LocalRpcClient {
    pub fn new(registry: Arc<FuncRegistry>) -> Self {
        Self {
            registry,
            connected: AtomicBool::new(true),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

#[async_trait]
impl RpcClient for LocalRpcClient {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn call(&self, method: &str, arg: Option<String>) -> Result<Value, RpcError> {
        if !self.is_connected() {
            return Err(RpcError::NotConnected);
        }
        self.registry.invoke(method, arg)
    }
}
