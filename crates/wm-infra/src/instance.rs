use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::logs::LineConsumer;
use crate::types::{Command, InstanceKey, Machine, MachineState, MachineStatus};
use crate::{Error, Result};

/// A command running (or that ran) inside a machine.
#[async_trait]
pub trait InstanceProcess: Send + Sync {
    fn pid(&self) -> u32;

    fn command(&self) -> &Command;

    fn is_alive(&self) -> bool;

    /// True once `start` has returned. A process that was created but not
    /// started yet is neither alive nor finished.
    fn is_finished(&self) -> bool;

    /// Runs the process to completion, writing its output to `logger`.
    async fn start(&self, logger: Arc<dyn LineConsumer>) -> Result<()>;

    /// Stops the process. Killing it before `start` makes `start` return
    /// without running anything.
    async fn kill(&self) -> Result<()>;
}

/// Live runtime handle of a machine, produced by an [`InstanceProvider`](crate::InstanceProvider).
///
/// Identity, status, logger and the process table live in an
/// [`InstanceBase`]; implementors only supply the backend operations.
#[async_trait]
pub trait Instance: Send + Sync {
    fn base(&self) -> &InstanceBase;

    /// Provider-specific details shown alongside the machine.
    fn metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    async fn create_process(
        &self,
        command: &Command,
        output_channel: Option<&str>,
    ) -> Result<Arc<dyn InstanceProcess>>;

    async fn destroy(&self) -> Result<()>;

    async fn save_to_snapshot(&self, owner: &str) -> Result<InstanceKey>;

    fn id(&self) -> String {
        self.base().state().id
    }

    fn state(&self) -> MachineState {
        self.base().state()
    }

    fn status(&self) -> MachineStatus {
        self.base().status()
    }

    fn set_status(&self, status: MachineStatus) {
        self.base().set_status(status)
    }

    fn logger(&self) -> Arc<dyn LineConsumer> {
        self.base().logger()
    }

    fn processes(&self) -> Vec<Arc<dyn InstanceProcess>> {
        self.base().processes()
    }

    fn process(&self, pid: u32) -> Result<Arc<dyn InstanceProcess>> {
        self.base().process(pid)
    }

    fn to_machine(&self) -> Machine {
        Machine {
            state: self.state(),
            metadata: self.metadata(),
        }
    }
}

/// Shared bookkeeping every instance carries.
pub struct InstanceBase {
    state: RwLock<MachineState>,
    logger: Arc<dyn LineConsumer>,
    processes: RwLock<BTreeMap<u32, Arc<dyn InstanceProcess>>>,
    next_pid: AtomicU32,
}

impl InstanceBase {
    pub fn new(state: MachineState, logger: Arc<dyn LineConsumer>) -> Self {
        Self {
            state: RwLock::new(state),
            logger,
            processes: RwLock::new(BTreeMap::new()),
            next_pid: AtomicU32::new(1),
        }
    }

    pub fn state(&self) -> MachineState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn status(&self) -> MachineStatus {
        self.state.read().unwrap_or_else(|e| e.into_inner()).status
    }

    pub fn set_status(&self, status: MachineStatus) {
        self.state.write().unwrap_or_else(|e| e.into_inner()).status = status;
    }

    pub fn logger(&self) -> Arc<dyn LineConsumer> {
        self.logger.clone()
    }

    /// Allocates the next process id, starting at 1.
    pub fn next_pid(&self) -> u32 {
        self.next_pid.fetch_add(1, Ordering::SeqCst)
    }

    pub fn add_process(&self, process: Arc<dyn InstanceProcess>) {
        self.processes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(process.pid(), process);
    }

    pub fn processes(&self) -> Vec<Arc<dyn InstanceProcess>> {
        self.processes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn process(&self, pid: u32) -> Result<Arc<dyn InstanceProcess>> {
        self.processes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pid)
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "Process with pid {pid} not found in machine {}",
                    self.state().id
                ))
            })
    }
}
