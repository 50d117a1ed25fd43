use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The only machine source kind machines can be built from.
pub const RECIPE_SOURCE_TYPE: &str = "Recipe";

/// Where a machine is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub location: String,
}

/// Resource limits. A `ram_mb` of 0 means "use the configured default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub ram_mb: u32,
}

/// Caller-supplied description of a machine to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub machine_type: String,
    pub source: MachineSource,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub dev: bool,
}

/// Lifecycle status of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineStatus {
    Creating,
    Running,
    Destroying,
    Destroyed,
    Error,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "CREATING",
            Self::Running => "RUNNING",
            Self::Destroying => "DESTROYING",
            Self::Destroyed => "DESTROYED",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pub/sub channel names of a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channels {
    pub output: String,
    pub status: String,
}

impl Channels {
    pub fn for_machine(workspace_id: &str, env_name: &str, machine_name: &str) -> Self {
        Self {
            output: format!("{workspace_id}:{env_name}:{machine_name}"),
            status: Self::status_channel(workspace_id, machine_name),
        }
    }

    /// Status channel name; does not depend on the environment.
    pub fn status_channel(workspace_id: &str, machine_name: &str) -> String {
        format!("machine:status:{workspace_id}:{machine_name}")
    }
}

/// Lifecycle metadata of a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineState {
    pub id: String,
    pub workspace_id: String,
    pub env_name: String,
    pub owner: String,
    pub name: String,
    #[serde(rename = "type")]
    pub machine_type: String,
    pub source: MachineSource,
    pub limits: Limits,
    pub channels: Channels,
    pub status: MachineStatus,
    pub dev: bool,
}

impl MachineState {
    /// Builds the state of a machine that is about to be created.
    pub fn creating(
        id: String,
        config: &MachineConfig,
        workspace_id: &str,
        env_name: &str,
        owner: &str,
    ) -> Self {
        Self {
            id,
            workspace_id: workspace_id.to_string(),
            env_name: env_name.to_string(),
            owner: owner.to_string(),
            name: config.name.clone(),
            machine_type: config.machine_type.clone(),
            source: config.source.clone(),
            limits: config.limits,
            channels: Channels::for_machine(workspace_id, env_name, &config.name),
            status: MachineStatus::Creating,
            dev: config.dev,
        }
    }
}

/// Materialized view of a live machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    #[serde(flatten)]
    pub state: MachineState,
    pub metadata: BTreeMap<String, String>,
}

/// Build script a machine is provisioned from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(rename = "type")]
    pub recipe_type: String,
    pub script: String,
}

impl Recipe {
    pub fn dockerfile(script: impl Into<String>) -> Self {
        Self {
            recipe_type: "Dockerfile".into(),
            script: script.into(),
        }
    }
}

/// Opaque provider-produced handle to restorable instance state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceKey(pub serde_json::Value);

/// A command to run inside a machine.
///
/// Fields are optional because they come straight from callers; the
/// orchestrator rejects commands with missing parts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub name: Option<String>,
    pub command_line: Option<String>,
    #[serde(rename = "type")]
    pub command_type: Option<String>,
}

impl Command {
    pub fn new(
        name: impl Into<String>,
        command_line: impl Into<String>,
        command_type: impl Into<String>,
    ) -> Self {
        Self {
            name: Some(name.into()),
            command_line: Some(command_line.into()),
            command_type: Some(command_type.into()),
        }
    }
}
