use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::models::Snapshot;
use crate::{Error, Result, SnapshotStore};

/// Process-local [`SnapshotStore`], used when no database is configured.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<String, Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn get_snapshot_for_machine(
        &self,
        workspace_id: &str,
        env_name: &str,
        machine_name: &str,
    ) -> Result<Snapshot> {
        self.snapshots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| {
                s.workspace_id == workspace_id
                    && s.env_name == env_name
                    && s.machine_name == machine_name
            })
            .max_by_key(|s| s.created_at)
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "Snapshot for machine '{machine_name}' of environment '{env_name}' in workspace '{workspace_id}' not found"
                ))
            })
    }

    async fn get_snapshot(&self, id: &str) -> Result<Snapshot> {
        self.snapshots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Snapshot with id '{id}' not found")))
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.snapshots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn remove_snapshot(&self, id: &str) -> Result<()> {
        self.snapshots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("Snapshot with id '{id}' not found")))
    }

    async fn find_snapshots(&self, owner: &str, workspace_id: &str) -> Result<Vec<Snapshot>> {
        let mut found: Vec<Snapshot> = self
            .snapshots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| s.owner == owner && s.workspace_id == workspace_id)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.created_at);
        Ok(found)
    }
}
