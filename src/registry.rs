//! In-memory registry of running containers.
//!
//! The registry is the operator's view of "what is running now". Every
//! mutation takes the same lock, and the lock is only held for the map
//! operation itself, never across an engine call.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::types::ContainerRecord;

#[derive(Default)]
pub struct Registry {
    containers: Mutex<HashMap<String, ContainerRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole content with `records`.
    pub async fn replace_all(&self, records: Vec<ContainerRecord>) {
        let mut map = self.containers.lock().await;
        map.clear();
        map.extend(records.into_iter().map(|r| (r.id.clone(), r)));
    }

    pub async fn upsert(&self, record: ContainerRecord) {
        self.containers.lock().await.insert(record.id.clone(), record);
    }

    pub async fn remove(&self, id: &str) -> Option<ContainerRecord> {
        self.containers.lock().await.remove(id)
    }

    #[cfg(test)]
    pub async fn get(&self, id: &str) -> Option<ContainerRecord> {
        self.containers.lock().await.get(id).cloned()
    }

    /// Snapshot of all records, ordered by id.
    pub async fn snapshot(&self) -> Vec<ContainerRecord> {
        let mut records: Vec<ContainerRecord> =
            self.containers.lock().await.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub async fn len(&self) -> usize {
        self.containers.lock().await.len()
    }
}
