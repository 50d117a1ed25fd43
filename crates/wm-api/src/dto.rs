use std::sync::Arc;

use serde::{Deserialize, Serialize};
use wm_infra::instance::InstanceProcess;
use wm_infra::types::{Command, MachineConfig};

// ── Requests ───────────────────────────────────────────────────────

fn default_env() -> String {
    "default".into()
}

#[derive(Debug, Deserialize)]
pub struct CreateMachineRequest {
    pub config: MachineConfig,
    pub workspace_id: String,
    #[serde(default = "default_env")]
    pub env_name: String,
    /// Build in the background and answer with the `CREATING` state.
    #[serde(default, rename = "async")]
    pub run_async: bool,
}

#[derive(Debug, Deserialize)]
pub struct RecoverMachineRequest {
    pub config: MachineConfig,
    pub workspace_id: String,
    #[serde(default = "default_env")]
    pub env_name: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub command: Option<Command>,
    pub output_channel: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SaveSnapshotRequest {
    pub description: Option<String>,
    #[serde(default)]
    pub sync: bool,
}

#[derive(Debug, Deserialize)]
pub struct WorkspaceQuery {
    pub workspace: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DestroyQuery {
    #[serde(default, rename = "async")]
    pub run_async: bool,
}

// ── Responses ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub pid: u32,
    pub command: Command,
    pub alive: bool,
    pub finished: bool,
}

impl From<&Arc<dyn InstanceProcess>> for ProcessResponse {
    fn from(process: &Arc<dyn InstanceProcess>) -> Self {
        Self {
            pid: process.pid(),
            command: process.command().clone(),
            alive: process.is_alive(),
            finished: process.is_finished(),
        }
    }
}
