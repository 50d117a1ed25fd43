use std::path::PathBuf;
use std::sync::{Arc, LazyLock, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wm_db::SnapshotStore;
use wm_db::models::Snapshot;
use wm_infra::instance::{Instance, InstanceProcess};
use wm_infra::logs::LineConsumer;
use wm_infra::types::{
    Command, InstanceKey, Machine, MachineConfig, MachineState, MachineStatus, RECIPE_SOURCE_TYPE,
};
use wm_infra::{InstanceProvider, ProviderRegistry, names};

use crate::context;
use crate::error::{Error, Result};
use crate::events::{
    EventBus, InstanceStateEvent, InstanceStateKind, MachineEventType, MachineProcessEvent,
    MachineStatusEvent, ProcessEventType,
};
use crate::executor::TaskExecutor;
use crate::logs::MachineLogs;
use crate::recipe::RecipeLoader;
use crate::registry::{MachineRegistry, RegistryError};

static MACHINE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/?[a-zA-Z0-9_-]+$").expect("machine name pattern compiles"));

const MACHINE_ID_PREFIX: &str = "machine";
const SNAPSHOT_ID_PREFIX: &str = "snapshot";
const ID_SUFFIX_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Root of the per-machine log directories.
    pub logs_dir: PathBuf,
    /// RAM given to machines whose config asks for 0 MB.
    pub default_ram_mb: u32,
    /// Budget of each of the two executor shutdown phases.
    pub shutdown_timeout: Duration,
    /// Workspace agent started on every dev machine, if set.
    pub agent_command: Option<String>,
}

impl ManagerConfig {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            default_ram_mb: 1024,
            shutdown_timeout: Duration::from_secs(10),
            agent_command: None,
        }
    }
}

/// How the provider step of a creation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstanceCreator {
    /// Awaited by the caller; failures propagate.
    Inline,
    /// Handed to the executor; failures only show up as events.
    Submitted,
}

/// What a new instance is built from.
enum Origin {
    Recipe,
    Snapshot(InstanceKey),
}

/// Orchestrates machine creation, recovery, process execution, snapshots
/// and teardown on top of the registered instance providers.
///
/// Cheap to clone; all clones share the same registry and executor.
#[derive(Clone)]
pub struct MachineManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ManagerConfig,
    providers: ProviderRegistry,
    registry: MachineRegistry,
    snapshots: Arc<dyn SnapshotStore>,
    recipes: Arc<dyn RecipeLoader>,
    bus: EventBus,
    logs: MachineLogs,
    executor: TaskExecutor,
    cleaner: Mutex<Option<JoinHandle<()>>>,
}

impl MachineManager {
    pub fn new(
        config: ManagerConfig,
        providers: ProviderRegistry,
        snapshots: Arc<dyn SnapshotStore>,
        recipes: Arc<dyn RecipeLoader>,
        bus: EventBus,
    ) -> Self {
        let logs = MachineLogs::new(config.logs_dir.clone(), bus.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                providers,
                registry: MachineRegistry::new(),
                snapshots,
                recipes,
                bus,
                logs,
                executor: TaskExecutor::new("machine-manager"),
                cleaner: Mutex::new(None),
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Prepares the logs root and subscribes the OOM/DIE cleaner.
    pub fn start(&self) -> Result<()> {
        self.inner.logs.create_root().map_err(|e| {
            Error::Machine(format!(
                "Can't create logs folder {}. {e}",
                self.inner.logs.root().display()
            ))
        })?;

        let mut cleaner = self.inner.cleaner.lock().unwrap_or_else(|e| e.into_inner());
        if cleaner.is_none() {
            *cleaner = Some(spawn_cleaner(Arc::downgrade(&self.inner), &self.inner.bus));
        }
        info!(logs_dir = %self.inner.logs.root().display(), "machine manager started");
        Ok(())
    }

    // ── Creation ─────────────────────────────────────────────────────

    /// Creates a machine from its recipe and waits until it runs.
    pub async fn create_machine_sync(
        &self,
        config: MachineConfig,
        workspace_id: &str,
        env_name: &str,
    ) -> Result<Machine> {
        let state = self
            .create_machine(config, workspace_id, env_name, InstanceCreator::Inline, Origin::Recipe)
            .await?;
        self.get_machine(&state.id)
    }

    /// Registers a machine and builds it in the background.
    ///
    /// Returns the `CREATING` state; progress and failure are reported on the bus.
    pub async fn create_machine_async(
        &self,
        config: MachineConfig,
        workspace_id: &str,
        env_name: &str,
    ) -> Result<MachineState> {
        self.create_machine(config, workspace_id, env_name, InstanceCreator::Submitted, Origin::Recipe)
            .await
    }

    /// Restores a machine from the newest snapshot saved for its name.
    pub async fn recover_machine(
        &self,
        config: MachineConfig,
        workspace_id: &str,
        env_name: &str,
    ) -> Result<Machine> {
        self.validate(&config, workspace_id)?;
        let snapshot = self
            .inner
            .snapshots
            .get_snapshot_for_machine(workspace_id, env_name, &config.name)
            .await?;

        let origin = Origin::Snapshot(InstanceKey(snapshot.instance_key));
        let state = self
            .create_machine(config, workspace_id, env_name, InstanceCreator::Inline, origin)
            .await?;
        self.get_machine(&state.id)
    }

    fn validate(&self, config: &MachineConfig, workspace_id: &str) -> Result<()> {
        if !config.source.source_type.eq_ignore_ascii_case(RECIPE_SOURCE_TYPE) {
            return Err(Error::BadRequest(format!(
                "Source type is unsupported {}",
                config.source.source_type
            )));
        }
        if !MACHINE_NAME.is_match(&config.name) {
            return Err(Error::BadRequest(format!("Invalid machine name {}", config.name)));
        }
        if self.inner.registry.contains_name(workspace_id, &config.name) {
            return Err(Error::Conflict(format!(
                "Machine with name {} already exists",
                config.name
            )));
        }
        Ok(())
    }

    async fn create_machine(
        &self,
        mut config: MachineConfig,
        workspace_id: &str,
        env_name: &str,
        creator: InstanceCreator,
        origin: Origin,
    ) -> Result<MachineState> {
        self.validate(&config, workspace_id)?;
        let provider = self.inner.providers.get(&config.machine_type)?.clone();

        if config.limits.ram_mb == 0 {
            config.limits.ram_mb = self.inner.config.default_ram_mb;
        }

        let id = names::generate(MACHINE_ID_PREFIX, ID_SUFFIX_LEN);
        let owner = context::current().id;
        let state = MachineState::creating(id, &config, workspace_id, env_name, &owner);

        self.inner.logs.create_machine_dir(&state.id)?;
        let logger = self.inner.logs.machine_logger(&state)?;

        if let Err(e) = self.inner.registry.add(state.clone()) {
            let _ = logger.close();
            return Err(match e {
                RegistryError::DuplicateId(_) => Error::Machine(e.to_string()),
                other => other.into(),
            });
        }
        info!(machine_id = %state.id, workspace = workspace_id, name = %state.name, "machine registered");

        match creator {
            InstanceCreator::Inline => {
                self.provision(provider, state.clone(), logger, origin).await?;
            }
            InstanceCreator::Submitted => {
                let this = self.clone();
                let task_state = state.clone();
                let task_logger = logger.clone();
                let submitted = self.inner.executor.spawn(async move {
                    let machine_id = task_state.id.clone();
                    if let Err(e) = this.provision(provider, task_state, task_logger, origin).await {
                        error!(machine_id = %machine_id, error = %e, "machine creation failed");
                    }
                });
                if let Err(e) = submitted {
                    let _ = logger.close();
                    let _ = self.inner.registry.remove(&state.id);
                    return Err(e);
                }
            }
        }

        Ok(self.inner.registry.get_state(&state.id).unwrap_or(state))
    }

    /// Builds the instance of a registered machine and brings it to `RUNNING`.
    ///
    /// On failure the partial instance is destroyed, the machine is
    /// unregistered and an `ERROR` event is published.
    async fn provision(
        &self,
        provider: Arc<dyn InstanceProvider>,
        state: MachineState,
        logger: Arc<dyn LineConsumer>,
        origin: Origin,
    ) -> Result<()> {
        self.inner
            .bus
            .publish(MachineStatusEvent::new(MachineEventType::Creating, &state));

        let Err(e) = self.launch(provider.as_ref(), &state, &logger, origin).await else {
            return Ok(());
        };

        let message = e.to_string();
        let mut failed = state;
        failed.status = MachineStatus::Error;
        self.inner.bus.publish(
            MachineStatusEvent::new(MachineEventType::Error, &failed).with_error(message.clone()),
        );

        let _ = logger.write_line(&format!("[ERROR] {message}"));
        if let Err(e) = logger.close() {
            debug!(machine_id = %failed.id, error = %e, "closing machine logger failed");
        }
        let _ = self.inner.registry.remove(&failed.id);

        Err(match e {
            Error::Machine(_) => e,
            _ => Error::Machine(message),
        })
    }

    async fn launch(
        &self,
        provider: &dyn InstanceProvider,
        state: &MachineState,
        logger: &Arc<dyn LineConsumer>,
        origin: Origin,
    ) -> Result<()> {
        let instance = match origin {
            Origin::Recipe => {
                let config = MachineConfig {
                    name: state.name.clone(),
                    machine_type: state.machine_type.clone(),
                    source: state.source.clone(),
                    limits: state.limits,
                    dev: state.dev,
                };
                let recipe = self.inner.recipes.load(&config).await?;
                provider.create_instance(&recipe, state, logger.clone()).await?
            }
            Origin::Snapshot(key) => {
                provider
                    .create_instance_from_snapshot(&key, state, logger.clone())
                    .await?
            }
        };

        if let Err(e) = self.activate(&instance).await {
            instance.set_status(MachineStatus::Error);
            if let Err(destroy_err) = instance.destroy().await {
                warn!(machine_id = %state.id, error = %destroy_err, "destroying failed machine failed");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn activate(&self, instance: &Arc<dyn Instance>) -> Result<()> {
        instance.set_status(MachineStatus::Running);
        self.inner.registry.update(instance.clone())?;

        let state = instance.state();
        self.inner
            .bus
            .publish(MachineStatusEvent::new(MachineEventType::Running, &state));
        info!(machine_id = %state.id, provider_type = %state.machine_type, "machine running");

        if state.dev
            && let Some(agent) = &self.inner.config.agent_command
        {
            self.exec(&state.id, Some(Command::new("ws-agent", agent, "agent")), None)
                .await
                .map_err(|e| Error::Machine(format!("Can't start workspace agent. {e}")))?;
        }
        Ok(())
    }

    // ── Processes ────────────────────────────────────────────────────

    /// Starts `command` in a machine and returns as soon as it is submitted.
    pub async fn exec(
        &self,
        machine_id: &str,
        command: Option<Command>,
        output_channel: Option<String>,
    ) -> Result<Arc<dyn InstanceProcess>> {
        if machine_id.is_empty() {
            return Err(Error::BadRequest("Machine ID is required".into()));
        }
        let command = command.ok_or_else(|| Error::BadRequest("Command is required".into()))?;
        if command.command_line.is_none() {
            return Err(Error::BadRequest("Command line is required".into()));
        }
        if command.name.is_none() {
            return Err(Error::BadRequest("Command name is required".into()));
        }
        if command.command_type.is_none() {
            return Err(Error::BadRequest("Command type is required".into()));
        }

        let instance = self.inner.registry.get(machine_id)?;
        let process = instance
            .create_process(&command, output_channel.as_deref())
            .await?;
        let pid = process.pid();
        let logger = self
            .inner
            .logs
            .process_logger(machine_id, pid, output_channel.as_deref())?;

        let this = self.clone();
        let machine_id = machine_id.to_string();
        let task_process = process.clone();
        self.inner
            .executor
            .spawn(async move { this.run_process(&machine_id, task_process, logger).await })?;

        debug!(pid, "process submitted");
        Ok(process)
    }

    async fn run_process(
        &self,
        machine_id: &str,
        process: Arc<dyn InstanceProcess>,
        logger: Arc<dyn LineConsumer>,
    ) {
        let pid = process.pid();
        self.inner.bus.publish(MachineProcessEvent::new(
            ProcessEventType::Started,
            machine_id,
            pid,
        ));

        match process.start(logger.clone()).await {
            Ok(()) => self.inner.bus.publish(MachineProcessEvent::new(
                ProcessEventType::Stopped,
                machine_id,
                pid,
            )),
            Err(e) => {
                let message = e.to_string();
                let _ = logger.write_line(&format!("[ERROR] {message}"));
                self.inner.bus.publish(
                    MachineProcessEvent::new(ProcessEventType::Error, machine_id, pid)
                        .with_error(message),
                );
            }
        }

        if let Err(e) = logger.close() {
            debug!(machine_id, pid, error = %e, "closing process logger failed");
        }
    }

    pub async fn stop_process(&self, machine_id: &str, pid: u32) -> Result<()> {
        let instance = self.inner.registry.get(machine_id)?;
        let process = instance.process(pid)?;
        if process.is_finished() {
            return Err(Error::Forbidden("Process finished already".into()));
        }

        process.kill().await?;
        self.inner.bus.publish(MachineProcessEvent::new(
            ProcessEventType::Stopped,
            machine_id,
            pid,
        ));
        Ok(())
    }

    pub fn get_processes(&self, machine_id: &str) -> Result<Vec<Arc<dyn InstanceProcess>>> {
        Ok(self.inner.registry.get(machine_id)?.processes())
    }

    pub fn get_process(&self, machine_id: &str, pid: u32) -> Result<Arc<dyn InstanceProcess>> {
        Ok(self.inner.registry.get(machine_id)?.process(pid)?)
    }

    // ── Destruction ──────────────────────────────────────────────────

    /// Tears a machine down, inline or on the executor.
    pub async fn destroy(&self, machine_id: &str, run_async: bool) -> Result<()> {
        let instance = self.inner.registry.get(machine_id)?;

        instance.set_status(MachineStatus::Destroying);
        self.inner.bus.publish(MachineStatusEvent::new(
            MachineEventType::Destroying,
            &instance.state(),
        ));

        if !run_async {
            return self.do_destroy(instance).await;
        }

        let this = self.clone();
        self.inner.executor.spawn(async move {
            let machine_id = instance.id();
            if let Err(e) = this.do_destroy(instance).await {
                error!(machine_id = %machine_id, error = %e, "machine destruction failed");
            }
        })
    }

    async fn do_destroy(&self, instance: Arc<dyn Instance>) -> Result<()> {
        instance.destroy().await?;

        let machine_id = instance.id();
        match self.cleanup_on_destroy(&machine_id, None) {
            Err(Error::NotFound(msg)) => {
                debug!(machine_id = %machine_id, "machine already cleaned up: {msg}");
                Ok(())
            }
            other => other,
        }
    }

    /// Closes the machine's logger, unregisters it and publishes `DESTROYED`.
    fn cleanup_on_destroy(&self, machine_id: &str, message: Option<&str>) -> Result<()> {
        let instance = self.inner.registry.get(machine_id)?;
        let logger = instance.logger();
        if let Some(message) = message {
            let _ = logger.write_line(message);
        }
        if let Err(e) = logger.close() {
            debug!(machine_id, error = %e, "closing machine logger failed");
        }

        instance.set_status(MachineStatus::Destroyed);
        let state = self.inner.registry.remove(machine_id)?;
        self.inner
            .bus
            .publish(MachineStatusEvent::new(MachineEventType::Destroyed, &state));
        info!(machine_id, "machine destroyed");
        Ok(())
    }

    fn on_instance_state(&self, event: InstanceStateEvent) {
        let Ok(state) = self.inner.registry.get_state(&event.machine_id) else {
            return;
        };

        let mut message = String::from("Machine is destroyed. ");
        if event.kind == InstanceStateKind::Oom {
            message.push_str(&format!(
                "The processes in this machine need more RAM. This machine started with {}MB. \
                 Create a new machine configuration that allocates additional RAM or increase \
                 the workspace RAM limit in the user dashboard.",
                state.limits.ram_mb
            ));
        }

        if let Err(e) = self.cleanup_on_destroy(&event.machine_id, Some(message.trim_end())) {
            debug!(machine_id = %event.machine_id, error = %e, "cleanup after {:?} failed", event.kind);
        }
    }

    // ── Snapshots ────────────────────────────────────────────────────

    /// Snapshots a machine in the background.
    ///
    /// The returned record has a `null` instance key; the stored one gets the
    /// provider's key once saving finishes.
    pub async fn save(&self, machine_id: &str, owner: &str, description: Option<String>) -> Result<Snapshot> {
        let instance = self.inner.registry.get(machine_id)?;
        let snapshot = new_snapshot(&instance.state(), owner, description);

        let this = self.clone();
        let pending = snapshot.clone();
        self.inner.executor.spawn(async move {
            if let Err(e) = this.store_snapshot(instance, pending).await {
                error!(error = %e, "saving snapshot failed");
            }
        })?;
        Ok(snapshot)
    }

    /// Snapshots a machine and waits for the record to be stored.
    pub async fn save_sync(
        &self,
        machine_id: &str,
        owner: &str,
        description: Option<String>,
    ) -> Result<Snapshot> {
        let instance = self.inner.registry.get(machine_id)?;
        let snapshot = new_snapshot(&instance.state(), owner, description);
        self.store_snapshot(instance, snapshot).await
    }

    async fn store_snapshot(&self, instance: Arc<dyn Instance>, mut snapshot: Snapshot) -> Result<Snapshot> {
        let stored: Result<()> = async {
            let key = instance.save_to_snapshot(&snapshot.owner).await?;
            snapshot.instance_key = key.0;
            self.replace_snapshot(&snapshot).await
        }
        .await;

        match stored {
            Ok(()) => {
                info!(snapshot_id = %snapshot.id, machine_id = %instance.id(), "snapshot saved");
                Ok(snapshot)
            }
            Err(e) => {
                let _ = instance
                    .logger()
                    .write_line(&format!("Snapshot storing failed. {e}"));
                Err(e)
            }
        }
    }

    /// Stores `snapshot` as the only one of its machine.
    async fn replace_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        match self
            .inner
            .snapshots
            .get_snapshot_for_machine(&snapshot.workspace_id, &snapshot.env_name, &snapshot.machine_name)
            .await
        {
            Ok(old) => {
                if let Err(e) = self.remove_snapshot(&old.id).await {
                    warn!(snapshot_id = %old.id, error = %e, "removing replaced snapshot failed");
                }
            }
            Err(wm_db::Error::NotFound(_)) => {}
            Err(e) => warn!(error = %e, "looking up previous snapshot failed"),
        }

        self.inner
            .snapshots
            .save_snapshot(snapshot)
            .await
            .map_err(|e| match e {
                wm_db::Error::NotFound(msg) => Error::NotFound(msg),
                other => Error::Snapshot(format!("Snapshot storing failed. {other}")),
            })
    }

    pub async fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        Ok(self.inner.snapshots.get_snapshot(snapshot_id).await?)
    }

    pub async fn get_snapshots(&self, owner: &str, workspace_id: &str) -> Result<Vec<Snapshot>> {
        Ok(self.inner.snapshots.find_snapshots(owner, workspace_id).await?)
    }

    /// Drops the provider data of a snapshot, then its record.
    pub async fn remove_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let snapshot = self.inner.snapshots.get_snapshot(snapshot_id).await?;
        if !snapshot.instance_key.is_null() {
            let provider = self.inner.providers.get(&snapshot.machine_type)?;
            provider
                .remove_instance_snapshot(&InstanceKey(snapshot.instance_key))
                .await?;
        }
        self.inner.snapshots.remove_snapshot(snapshot_id).await?;
        Ok(())
    }

    /// Removes every snapshot of `owner` in a workspace.
    pub async fn remove_snapshots(&self, owner: &str, workspace_id: &str) -> Result<()> {
        for snapshot in self.inner.snapshots.find_snapshots(owner, workspace_id).await? {
            match self.remove_snapshot(&snapshot.id).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => warn!(snapshot_id = %snapshot.id, error = %e, "removing snapshot failed"),
            }
        }
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn get_machine(&self, machine_id: &str) -> Result<Machine> {
        Ok(self.inner.registry.get(machine_id)?.to_machine())
    }

    pub fn get_machine_state(&self, machine_id: &str) -> Result<MachineState> {
        Ok(self.inner.registry.get_state(machine_id)?)
    }

    /// Running machines of `owner`, optionally limited to one workspace.
    pub fn get_machines(&self, owner: &str, workspace_id: Option<&str>) -> Result<Vec<Machine>> {
        require_owner(owner)?;
        Ok(self
            .inner
            .registry
            .get_machines()
            .into_iter()
            .map(|instance| instance.to_machine())
            .filter(|m| owned_by(&m.state, owner, workspace_id))
            .collect())
    }

    /// Like [`get_machines`](Self::get_machines) but includes machines still being created.
    pub fn get_machines_states(&self, owner: &str, workspace_id: Option<&str>) -> Result<Vec<MachineState>> {
        require_owner(owner)?;
        Ok(self
            .inner
            .registry
            .get_states()
            .into_iter()
            .filter(|state| owned_by(state, owner, workspace_id))
            .collect())
    }

    pub fn get_all_machine_states(&self) -> Vec<MachineState> {
        self.inner.registry.get_states()
    }

    pub fn get_dev_machine(&self, workspace_id: &str) -> Result<Machine> {
        Ok(self.inner.registry.get_dev_machine(workspace_id)?.to_machine())
    }

    pub async fn machine_logs(&self, machine_id: &str) -> Result<String> {
        self.inner.logs.read_machine_log(machine_id).await
    }

    pub async fn process_logs(&self, machine_id: &str, pid: u32) -> Result<String> {
        self.inner.logs.read_process_log(machine_id, pid).await
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Stops background work, destroys every machine and removes the logs.
    ///
    /// Returns whether the executor drained within its timeout.
    pub async fn shutdown(&self) -> bool {
        let cleaner = self
            .inner
            .cleaner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(cleaner) = cleaner {
            cleaner.abort();
        }

        let terminated = self
            .inner
            .executor
            .shutdown(self.inner.config.shutdown_timeout)
            .await;

        for state in self.inner.registry.get_states() {
            if let Err(e) = self.destroy(&state.id, false).await {
                warn!(machine_id = %state.id, error = %e, "destroying machine on shutdown failed");
            }
        }

        self.inner.logs.purge();
        info!(terminated, "machine manager stopped");
        terminated
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.executor.is_terminated()
    }
}

fn require_owner(owner: &str) -> Result<()> {
    if owner.is_empty() {
        return Err(Error::BadRequest("Owner required".into()));
    }
    Ok(())
}

fn owned_by(state: &MachineState, owner: &str, workspace_id: Option<&str>) -> bool {
    state.owner == owner && workspace_id.is_none_or(|ws| state.workspace_id == ws)
}

fn new_snapshot(state: &MachineState, owner: &str, description: Option<String>) -> Snapshot {
    Snapshot {
        id: names::generate(SNAPSHOT_ID_PREFIX, ID_SUFFIX_LEN),
        owner: owner.to_string(),
        workspace_id: state.workspace_id.clone(),
        env_name: state.env_name.clone(),
        machine_name: state.name.clone(),
        machine_type: state.machine_type.clone(),
        description,
        dev: state.dev,
        created_at: Utc::now(),
        instance_key: serde_json::Value::Null,
    }
}

/// Subscribes to instance state events and cleans up machines the backend
/// terminated on its own. Holds only a weak reference to the manager.
fn spawn_cleaner(manager: Weak<Inner>, bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe_instance_states();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Some(inner) = manager.upgrade() else {
                        break;
                    };
                    MachineManager { inner }.on_instance_state(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "machine cleaner missed instance state events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
