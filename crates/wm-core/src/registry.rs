use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use wm_infra::instance::Instance;
use wm_infra::types::MachineState;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Machine {0} not found")]
    NotFound(String),

    #[error("Machine {0} is not running yet")]
    NotReady(String),

    #[error("Machine with id {0} is already registered")]
    DuplicateId(String),

    #[error("Machine with name {name} already exists")]
    DuplicateName { workspace_id: String, name: String },
}

struct Entry {
    state: MachineState,
    instance: Option<Arc<dyn Instance>>,
}

impl Entry {
    /// The instance's view once it exists, the registered state before.
    fn current_state(&self) -> MachineState {
        match &self.instance {
            Some(instance) => instance.state(),
            None => self.state.clone(),
        }
    }
}

/// Authoritative map of live machines.
///
/// Every mutation happens under one write lock, so the id and
/// workspace+name uniqueness checks in [`add`](Self::add) are atomic with
/// the insertion.
#[derive(Default)]
pub struct MachineRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a machine that has no instance yet.
    pub fn add(&self, state: MachineState) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        if entries.contains_key(&state.id) {
            return Err(RegistryError::DuplicateId(state.id));
        }
        if entries.values().any(|entry| {
            entry.state.workspace_id == state.workspace_id && entry.state.name == state.name
        }) {
            return Err(RegistryError::DuplicateName {
                workspace_id: state.workspace_id,
                name: state.name,
            });
        }

        entries.insert(
            state.id.clone(),
            Entry {
                state,
                instance: None,
            },
        );
        Ok(())
    }

    /// Attaches (or replaces) the instance of a registered machine.
    pub fn update(&self, instance: Arc<dyn Instance>) -> Result<(), RegistryError> {
        let id = instance.id();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))?;

        entry.state = instance.state();
        entry.instance = Some(instance);
        Ok(())
    }

    /// Removes a machine, returning its last known state.
    pub fn remove(&self, id: &str) -> Result<MachineState, RegistryError> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .map(|entry| entry.current_state())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Instance>, RegistryError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        entry
            .instance
            .clone()
            .ok_or_else(|| RegistryError::NotReady(id.to_string()))
    }

    pub fn get_state(&self, id: &str) -> Result<MachineState, RegistryError> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(Entry::current_state)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Point-in-time copy of every registered state.
    pub fn get_states(&self) -> Vec<MachineState> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(Entry::current_state)
            .collect()
    }

    /// Point-in-time copy of every machine that has an instance.
    pub fn get_machines(&self) -> Vec<Arc<dyn Instance>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter_map(|entry| entry.instance.clone())
            .collect()
    }

    /// The running dev machine of a workspace.
    pub fn get_dev_machine(&self, workspace_id: &str) -> Result<Arc<dyn Instance>, RegistryError> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|entry| entry.state.dev && entry.state.workspace_id == workspace_id)
            .find_map(|entry| entry.instance.clone())
            .ok_or_else(|| RegistryError::NotFound(format!("dev machine of workspace {workspace_id}")))
    }

    /// Whether `workspace_id` already has a machine called `name`.
    pub fn contains_name(&self, workspace_id: &str, name: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|entry| entry.state.workspace_id == workspace_id && entry.state.name == name)
    }
}
