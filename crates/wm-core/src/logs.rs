use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};
use wm_infra::logs::{CompositeLineConsumer, FileLineConsumer, LineConsumer};
use wm_infra::types::MachineState;

use crate::error::{Error, Result};
use crate::events::{ChannelLineConsumer, EventBus};

pub const MACHINE_LOG_FILE: &str = "machine.logs";

/// On-disk log layout: `<root>/<machine_id>/machine.logs` plus one file per pid.
pub struct MachineLogs {
    root: PathBuf,
    bus: EventBus,
}

impl MachineLogs {
    pub fn new(root: impl Into<PathBuf>, bus: EventBus) -> Self {
        Self {
            root: root.into(),
            bus,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn create_root(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    fn machine_dir(&self, machine_id: &str) -> PathBuf {
        self.root.join(machine_id)
    }

    /// Creates the directory of a new machine. Fails if it already exists.
    pub fn create_machine_dir(&self, machine_id: &str) -> Result<()> {
        let created = self
            .create_root()
            .and_then(|()| std::fs::create_dir(self.machine_dir(machine_id)));
        created.map_err(|e| {
            debug!(machine_id, error = %e, "creating machine logs dir failed");
            Error::Machine("Can't create folder for the logs of machine".into())
        })
    }

    /// Machine log file teed to the machine's output channel.
    pub fn machine_logger(&self, state: &MachineState) -> Result<Arc<dyn LineConsumer>> {
        let file = FileLineConsumer::open(self.machine_dir(&state.id).join(MACHINE_LOG_FILE))
            .map_err(|e| Error::Machine(format!("Can't open logs of machine {}. {e}", state.id)))?;
        Ok(Arc::new(CompositeLineConsumer::new(vec![
            Arc::new(file),
            Arc::new(ChannelLineConsumer::new(
                self.bus.clone(),
                state.channels.output.clone(),
            )),
        ])))
    }

    /// Per-process log file, optionally teed to `output_channel`.
    pub fn process_logger(
        &self,
        machine_id: &str,
        pid: u32,
        output_channel: Option<&str>,
    ) -> Result<Arc<dyn LineConsumer>> {
        let file = FileLineConsumer::open(self.machine_dir(machine_id).join(pid.to_string()))
            .map_err(|e| {
                Error::Machine(format!(
                    "Can't open logs of process {pid} in machine {machine_id}. {e}"
                ))
            })?;

        Ok(match output_channel {
            Some(channel) => Arc::new(CompositeLineConsumer::new(vec![
                Arc::new(file),
                Arc::new(ChannelLineConsumer::new(self.bus.clone(), channel)),
            ])),
            None => Arc::new(file),
        })
    }

    pub async fn read_machine_log(&self, machine_id: &str) -> Result<String> {
        let path = self.machine_dir(machine_id).join(MACHINE_LOG_FILE);
        read_log(&path)
            .await
            .ok_or_else(|| Error::NotFound(format!("Logs for machine '{machine_id}' are not available")))
    }

    pub async fn read_process_log(&self, machine_id: &str, pid: u32) -> Result<String> {
        let path = self.machine_dir(machine_id).join(pid.to_string());
        read_log(&path).await.ok_or_else(|| {
            Error::NotFound(format!(
                "Logs for process '{pid}' of machine '{machine_id}' are not available"
            ))
        })
    }

    /// Deletes the whole logs tree. Failures are logged and skipped.
    pub fn purge(&self) {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "can't list machine logs");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let removed = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(e) = removed {
                warn!(path = %path.display(), error = %e, "can't remove machine logs");
            }
        }

        if let Err(e) = std::fs::remove_dir(&self.root) {
            warn!(root = %self.root.display(), error = %e, "can't remove logs root");
        }
    }
}

async fn read_log(path: &Path) -> Option<String> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "log not readable");
            None
        }
    }
}
