//! In-memory provider, instance and process fakes shared by the unit tests.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use wm_infra::instance::{Instance, InstanceBase, InstanceProcess};
use wm_infra::logs::LineConsumer;
use wm_infra::types::{
    Command, InstanceKey, Limits, MachineConfig, MachineSource, MachineState, RECIPE_SOURCE_TYPE,
    Recipe,
};
use wm_infra::{Error, InstanceProvider, Result};

pub const RECIPE_LOCATION: &str = "http://localhost:8080/api/recipe/recipe1/script";

pub fn machine_config(name: &str, machine_type: &str) -> MachineConfig {
    MachineConfig {
        name: name.to_string(),
        machine_type: machine_type.to_string(),
        source: MachineSource {
            source_type: RECIPE_SOURCE_TYPE.to_string(),
            location: RECIPE_LOCATION.to_string(),
        },
        limits: Limits::default(),
        dev: false,
    }
}

pub fn machine_state(id: &str, workspace_id: &str, name: &str) -> MachineState {
    MachineState::creating(
        id.to_string(),
        &machine_config(name, "docker"),
        workspace_id,
        "default",
        "owner1",
    )
}

/// Line sink that keeps everything in memory.
#[derive(Default)]
pub struct MemoryLineConsumer {
    lines: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl LineConsumer for MemoryLineConsumer {
    fn write_line(&self, line: &str) -> io::Result<()> {
        self.lines.lock().unwrap().push(line.to_string());
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Process whose behaviour is picked by its command line:
/// `sleep` runs until killed, `fail` errors out, anything else echoes itself.
pub struct FakeProcess {
    pid: u32,
    command: Command,
    alive: AtomicBool,
    finished: AtomicBool,
    killed: AtomicBool,
    kill: Notify,
}

#[async_trait]
impl InstanceProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn command(&self) -> &Command {
        &self.command
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    async fn start(&self, logger: Arc<dyn LineConsumer>) -> Result<()> {
        if self.killed.load(Ordering::SeqCst) {
            self.finished.store(true, Ordering::SeqCst);
            return Ok(());
        }
        self.alive.store(true, Ordering::SeqCst);
        let line = self.command.command_line.clone().unwrap_or_default();
        let result = match line.as_str() {
            "sleep" => {
                self.kill.notified().await;
                Ok(())
            }
            "fail" => Err(Error::Provision("process crashed".into())),
            other => logger.write_line(other).map_err(Error::from),
        };
        self.finished.store(true, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        result
    }

    async fn kill(&self) -> Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        self.kill.notify_one();
        Ok(())
    }
}

pub struct FakeInstance {
    base: InstanceBase,
    destroyed: AtomicUsize,
    fail_destroy: AtomicBool,
    fail_processes: AtomicBool,
}

impl FakeInstance {
    pub fn new(state: MachineState) -> Arc<Self> {
        Self::with_logger(state, Arc::new(MemoryLineConsumer::default()))
    }

    pub fn with_logger(state: MachineState, logger: Arc<dyn LineConsumer>) -> Arc<Self> {
        Arc::new(Self {
            base: InstanceBase::new(state, logger),
            destroyed: AtomicUsize::new(0),
            fail_destroy: AtomicBool::new(false),
            fail_processes: AtomicBool::new(false),
        })
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Instance for FakeInstance {
    fn base(&self) -> &InstanceBase {
        &self.base
    }

    async fn create_process(
        &self,
        command: &Command,
        _output_channel: Option<&str>,
    ) -> Result<Arc<dyn InstanceProcess>> {
        if self.fail_processes.load(Ordering::SeqCst) {
            return Err(Error::Provision("no process slots left".into()));
        }
        let process = Arc::new(FakeProcess {
            pid: self.base.next_pid(),
            command: command.clone(),
            alive: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            kill: Notify::new(),
        });
        self.base.add_process(process.clone());
        let process: Arc<dyn InstanceProcess> = process;
        Ok(process)
    }

    async fn destroy(&self) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(Error::Provision("backend refused to destroy".into()));
        }
        Ok(())
    }

    async fn save_to_snapshot(&self, owner: &str) -> Result<InstanceKey> {
        Ok(InstanceKey(serde_json::json!({
            "instance": self.id(),
            "owner": owner,
        })))
    }
}

/// Provider that hands out [`FakeInstance`]s and records every call.
#[derive(Default)]
pub struct FakeProvider {
    pub fail_create: AtomicBool,
    /// Instances created from now on refuse to start processes.
    pub fail_exec: AtomicBool,
    pub recipes: Mutex<Vec<Recipe>>,
    pub restored: Mutex<Vec<InstanceKey>>,
    pub removed_snapshots: Mutex<Vec<InstanceKey>>,
    pub instances: Mutex<Vec<Arc<FakeInstance>>>,
}

impl FakeProvider {
    pub fn instance(&self, id: &str) -> Option<Arc<FakeInstance>> {
        self.instances
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.id() == id)
            .cloned()
    }

    pub fn fail_next_destroy(&self, id: &str) {
        if let Some(instance) = self.instance(id) {
            instance.fail_destroy.store(true, Ordering::SeqCst);
        }
    }

    fn spawn_instance(&self, state: &MachineState, logger: Arc<dyn LineConsumer>) -> Result<Arc<dyn Instance>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Provision("backend is out of capacity".into()));
        }
        let instance = FakeInstance::with_logger(state.clone(), logger);
        instance
            .fail_processes
            .store(self.fail_exec.load(Ordering::SeqCst), Ordering::SeqCst);
        self.instances.lock().unwrap().push(instance.clone());
        let instance: Arc<dyn Instance> = instance;
        Ok(instance)
    }
}

#[async_trait]
impl InstanceProvider for FakeProvider {
    async fn create_instance(
        &self,
        recipe: &Recipe,
        state: &MachineState,
        logger: Arc<dyn LineConsumer>,
    ) -> Result<Arc<dyn Instance>> {
        self.recipes.lock().unwrap().push(recipe.clone());
        self.spawn_instance(state, logger)
    }

    async fn create_instance_from_snapshot(
        &self,
        key: &InstanceKey,
        state: &MachineState,
        logger: Arc<dyn LineConsumer>,
    ) -> Result<Arc<dyn Instance>> {
        self.restored.lock().unwrap().push(key.clone());
        self.spawn_instance(state, logger)
    }

    async fn remove_instance_snapshot(&self, key: &InstanceKey) -> Result<()> {
        self.removed_snapshots.lock().unwrap().push(key.clone());
        Ok(())
    }
}
