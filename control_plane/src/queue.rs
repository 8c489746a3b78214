//! Local queue store the analytics pipeline drains.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

/// A keyed list store with an atomic drain.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Fetch and remove every element queued under `key` in one step.
    async fn get_and_delete_set(&self, key: &str) -> Vec<Vec<u8>>;
}

/// In-memory list store backed by DashMap.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueueStore {
    lists: Arc<DashMap<String, Vec<Vec<u8>>>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an element to the list under `key`.
    pub fn push(&self, key: &str, element: Vec<u8>) {
        self.lists.entry(key.to_string()).or_default().push(element);
    }

    pub fn len(&self, key: &str) -> usize {
        self.lists.get(key).map(|list| list.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn get_and_delete_set(&self, key: &str) -> Vec<Vec<u8>> {
        self.lists
            .remove(key)
            .map(|(_, list)| list)
            .unwrap_or_default()
    }
}
