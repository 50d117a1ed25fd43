use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::instance::{Instance, InstanceBase, InstanceProcess};
use crate::logs::LineConsumer;
use crate::types::{Command, InstanceKey, MachineState, Recipe};
use crate::{Error, InstanceProvider, Result};

const RECIPE_FILE: &str = "Dockerfile";
const SNAPSHOTS_DIR: &str = "snapshots";
/// How long output readers may outlive the shell they were attached to.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Machine types served by the local provider, from `LOCAL_MACHINE_TYPES`.
pub fn machine_types_from_env() -> Vec<String> {
    env::var("LOCAL_MACHINE_TYPES")
        .unwrap_or_else(|_| "local".into())
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// Runs machines as directories on the host.
///
/// A recipe's `RUN` instructions are executed with `sh -c` inside the
/// machine directory; snapshots are directory copies.
pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    /// Create from env var `LOCAL_MACHINES_DIR` (default `/tmp/wm/machines`).
    pub fn from_env() -> Result<Self> {
        let root = env::var("LOCAL_MACHINES_DIR").unwrap_or_else(|_| "/tmp/wm/machines".into());
        std::fs::create_dir_all(&root)?;
        Ok(Self::new(root))
    }

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn machine_dir(&self, state: &MachineState) -> PathBuf {
        self.root.join(&state.id)
    }

    fn instance(&self, dir: PathBuf, state: &MachineState, logger: Arc<dyn LineConsumer>) -> Arc<dyn Instance> {
        Arc::new(LocalInstance {
            base: InstanceBase::new(state.clone(), logger),
            dir,
            snapshots_dir: self.root.join(SNAPSHOTS_DIR),
        })
    }

    async fn build(&self, dir: &Path, recipe: &Recipe, logger: &Arc<dyn LineConsumer>) -> Result<()> {
        tokio::fs::write(dir.join(RECIPE_FILE), &recipe.script).await?;

        for instruction in run_instructions(&recipe.script) {
            let _ = logger.write_line(&format!("RUN {instruction}"));

            let mut child = shell(&instruction, dir).spawn()?;
            let readers = pipe_output(&mut child, logger);
            let status = child.wait().await;
            drain(readers).await;

            let status = status?;
            if !status.success() {
                return Err(Error::Provision(format!(
                    "instruction {instruction:?} failed (exit {})",
                    status.code().unwrap_or(-1)
                )));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl InstanceProvider for LocalProvider {
    async fn create_instance(
        &self,
        recipe: &Recipe,
        state: &MachineState,
        logger: Arc<dyn LineConsumer>,
    ) -> Result<Arc<dyn Instance>> {
        let dir = self.machine_dir(state);
        tokio::fs::create_dir_all(&dir).await?;

        // On any failure, clean up the machine directory
        if let Err(e) = self.build(&dir, recipe, &logger).await {
            tracing::error!(machine_id = %state.id, error = %e, "local: build failed, cleaning up");
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(e);
        }

        info!(machine_id = %state.id, dir = %dir.display(), "local: machine created");
        Ok(self.instance(dir, state, logger))
    }

    async fn create_instance_from_snapshot(
        &self,
        key: &InstanceKey,
        state: &MachineState,
        logger: Arc<dyn LineConsumer>,
    ) -> Result<Arc<dyn Instance>> {
        let source = snapshot_path(key)?;
        if !tokio::fs::try_exists(&source).await? {
            return Err(Error::NotFound(format!(
                "snapshot data {} does not exist",
                source.display()
            )));
        }

        let dir = self.machine_dir(state);
        copy_dir_blocking(source, dir.clone()).await?;

        info!(machine_id = %state.id, dir = %dir.display(), "local: machine restored");
        Ok(self.instance(dir, state, logger))
    }

    async fn remove_instance_snapshot(&self, key: &InstanceKey) -> Result<()> {
        let path = snapshot_path(key)?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                info!(path = %path.display(), "local: snapshot removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

struct LocalInstance {
    base: InstanceBase,
    dir: PathBuf,
    snapshots_dir: PathBuf,
}

#[async_trait]
impl Instance for LocalInstance {
    fn base(&self) -> &InstanceBase {
        &self.base
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("dir".to_string(), self.dir.display().to_string())])
    }

    async fn create_process(
        &self,
        command: &Command,
        _output_channel: Option<&str>,
    ) -> Result<Arc<dyn InstanceProcess>> {
        let process = Arc::new(LocalProcess::new(
            self.base.next_pid(),
            command.clone(),
            self.dir.clone(),
        ));
        self.base.add_process(process.clone());
        Ok(process)
    }

    async fn destroy(&self) -> Result<()> {
        for process in self.base.processes() {
            if !process.is_finished() {
                process.kill().await?;
            }
        }

        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!(machine_id = %self.id(), "local: machine destroyed");
        Ok(())
    }

    async fn save_to_snapshot(&self, owner: &str) -> Result<InstanceKey> {
        let target = self.snapshots_dir.join(uuid::Uuid::new_v4().to_string());
        copy_dir_blocking(self.dir.clone(), target.clone()).await?;

        info!(machine_id = %self.id(), path = %target.display(), "local: snapshot saved");
        Ok(InstanceKey(serde_json::json!({
            "snapshot": target.display().to_string(),
            "owner": owner,
        })))
    }
}

/// A `sh -c` child process of a local machine.
///
/// The shell leads its own process group, so a kill reaches everything it
/// spawned.
pub struct LocalProcess {
    pid: u32,
    command: Command,
    workdir: PathBuf,
    started: AtomicBool,
    alive: AtomicBool,
    finished: AtomicBool,
    killed: AtomicBool,
    kill: Notify,
}

impl LocalProcess {
    fn new(pid: u32, command: Command, workdir: PathBuf) -> Self {
        Self {
            pid,
            command,
            workdir,
            started: AtomicBool::new(false),
            alive: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            kill: Notify::new(),
        }
    }

    async fn run(&self, logger: Arc<dyn LineConsumer>) -> Result<()> {
        if self.killed.load(Ordering::SeqCst) {
            debug!(pid = self.pid, "local: process killed before it started");
            return Ok(());
        }

        let line = self
            .command
            .command_line
            .as_deref()
            .ok_or_else(|| Error::Provision("command line is missing".into()))?;

        let mut child = shell(line, &self.workdir).spawn()?;
        self.alive.store(true, Ordering::SeqCst);
        let readers = pipe_output(&mut child, &logger);

        // A kill that raced the spawn left a permit, so this fires at once.
        let status = tokio::select! {
            status = child.wait() => status,
            _ = self.kill.notified() => {
                debug!(pid = self.pid, "local: killing process group");
                kill_group(&mut child);
                child.wait().await
            }
        };
        drain(readers).await;

        let status = status?;
        debug!(pid = self.pid, code = ?status.code(), "local: process exited");
        Ok(())
    }
}

#[async_trait]
impl InstanceProcess for LocalProcess {
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
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Conflict(format!(
                "Process {} has already been started",
                self.pid
            )));
        }

        let result = self.run(logger).await;
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

/// `sh -c <line>` in `dir`, as the leader of a new process group.
fn shell(line: &str, dir: &Path) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c")
        .arg(line)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    cmd
}

fn kill_group(child: &mut Child) {
    let Some(id) = child.id() else {
        return;
    };
    match signal::killpg(Pid::from_raw(id as i32), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => {
            warn!(pid = id, error = %e, "local: killing process group failed");
            let _ = child.start_kill();
        }
    }
}

fn pipe_output(child: &mut Child, logger: &Arc<dyn LineConsumer>) -> Vec<JoinHandle<()>> {
    let mut readers = Vec::new();
    if let Some(out) = child.stdout.take() {
        readers.push(tokio::spawn(pipe_lines(out, logger.clone())));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(tokio::spawn(pipe_lines(err, logger.clone())));
    }
    readers
}

/// Waits for the output readers, giving up on ones whose pipe is held
/// open by a process outside the group.
async fn drain(readers: Vec<JoinHandle<()>>) {
    for mut reader in readers {
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut reader)
            .await
            .is_err()
        {
            debug!("local: output still open after exit, detaching reader");
            reader.abort();
        }
    }
}

async fn pipe_lines<R: AsyncRead + Unpin>(reader: R, logger: Arc<dyn LineConsumer>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if logger.write_line(&line).is_err() {
            break;
        }
    }
}

/// `RUN` instructions of a Dockerfile-like script, with `\` continuations joined.
fn run_instructions(script: &str) -> Vec<String> {
    let mut logical = Vec::new();
    let mut current = String::new();
    for raw in script.lines() {
        let line = raw.trim();
        if current.is_empty() && (line.is_empty() || line.starts_with('#')) {
            continue;
        }
        match line.strip_suffix('\\') {
            Some(head) => {
                current.push_str(head.trim_end());
                current.push(' ');
            }
            None => {
                current.push_str(line);
                logical.push(std::mem::take(&mut current));
            }
        }
    }
    if !current.trim().is_empty() {
        logical.push(current);
    }

    logical
        .into_iter()
        .filter_map(|line| {
            let (keyword, rest) = line.split_once(char::is_whitespace)?;
            keyword
                .eq_ignore_ascii_case("RUN")
                .then(|| rest.trim().to_string())
        })
        .filter(|cmd| !cmd.is_empty())
        .collect()
}

fn snapshot_path(key: &InstanceKey) -> Result<PathBuf> {
    key.0
        .get("snapshot")
        .and_then(serde_json::Value::as_str)
        .map(PathBuf::from)
        .ok_or_else(|| Error::InvalidKey(key.0.to_string()))
}

async fn copy_dir_blocking(from: PathBuf, to: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || copy_dir(&from, &to))
        .await
        .map_err(|e| Error::Provision(format!("copy task failed: {e}")))?
        .map_err(Error::from)
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::logs::FileLineConsumer;
    use crate::types::{MachineConfig, MachineSource};

    fn state(id: &str) -> MachineState {
        let config = MachineConfig {
            name: "dev".into(),
            machine_type: "local".into(),
            source: MachineSource {
                source_type: "Recipe".into(),
                location: "http://localhost/recipe".into(),
            },
            limits: Default::default(),
            dev: false,
        };
        MachineState::creating(id.into(), &config, "ws1", "default", "user1")
    }

    fn logger(dir: &Path, name: &str) -> Arc<FileLineConsumer> {
        Arc::new(FileLineConsumer::open(dir.join(name)).unwrap())
    }

    #[test]
    fn run_instructions_skip_other_keywords_and_join_continuations() {
        let script = "FROM ubuntu\n# comment\nRUN echo one\nrun echo \\\n  two\nENV A=b\nRUN   \n";
        assert_eq!(run_instructions(script), vec!["echo one", "echo two"]);
    }

    #[tokio::test]
    async fn create_runs_recipe_and_destroy_removes_dir() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(root.path());
        let machine_log = logger(logs.path(), "machine");

        let recipe = Recipe::dockerfile("FROM scratch\nRUN echo built > marker\nRUN echo hello");
        let instance = provider
            .create_instance(&recipe, &state("machine1"), machine_log.clone())
            .await
            .unwrap();

        let dir = root.path().join("machine1");
        assert_eq!(
            std::fs::read_to_string(dir.join("marker")).unwrap(),
            "built\n"
        );
        assert!(dir.join(RECIPE_FILE).is_file());
        let log = std::fs::read_to_string(logs.path().join("machine")).unwrap();
        assert!(log.contains("hello"));

        instance.destroy().await.unwrap();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn failing_recipe_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(root.path());

        let err = provider
            .create_instance(
                &Recipe::dockerfile("RUN exit 3"),
                &state("machine2"),
                logger(logs.path(), "machine"),
            )
            .await
            .err()
            .unwrap();

        assert!(matches!(err, Error::Provision(_)));
        assert!(!root.path().join("machine2").exists());
    }

    #[tokio::test]
    async fn snapshot_restores_files_into_new_machine() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(root.path());

        let instance = provider
            .create_instance(
                &Recipe::dockerfile("RUN echo saved > data"),
                &state("machine3"),
                logger(logs.path(), "a"),
            )
            .await
            .unwrap();
        let key = instance.save_to_snapshot("user1").await.unwrap();

        let restored = provider
            .create_instance_from_snapshot(&key, &state("machine4"), logger(logs.path(), "b"))
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(root.path().join("machine4").join("data")).unwrap(),
            "saved\n"
        );
        assert_eq!(restored.id(), "machine4");

        provider.remove_instance_snapshot(&key).await.unwrap();
        assert!(!snapshot_path(&key).unwrap().exists());
        // removing again is fine
        provider.remove_instance_snapshot(&key).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_snapshot_key_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(root.path());
        let err = provider
            .remove_instance_snapshot(&InstanceKey(serde_json::json!({"image": "x"})))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidKey(_)));
    }

    #[tokio::test]
    async fn process_output_goes_to_logger_and_kill_stops_it() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(root.path());
        let instance = provider
            .create_instance(&Recipe::dockerfile(""), &state("machine5"), logger(logs.path(), "m"))
            .await
            .unwrap();

        let echo = instance
            .create_process(&Command::new("echo", "echo from-process", "custom"), None)
            .await
            .unwrap();
        assert_eq!(echo.pid(), 1);
        let echo_log = logger(logs.path(), "1");
        assert!(!echo.is_finished());
        echo.start(echo_log.clone()).await.unwrap();
        assert!(!echo.is_alive());
        assert!(echo.is_finished());
        assert_eq!(
            std::fs::read_to_string(logs.path().join("1")).unwrap(),
            "from-process\n"
        );
        assert!(echo.start(echo_log).await.is_err());

        let sleeper = instance
            .create_process(&Command::new("sleep", "sleep 30", "custom"), None)
            .await
            .unwrap();
        assert_eq!(sleeper.pid(), 2);
        let running = {
            let sleeper = sleeper.clone();
            let log = logger(logs.path(), "2");
            tokio::spawn(async move { sleeper.start(log).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sleeper.is_alive());

        sleeper.kill().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!sleeper.is_alive());
        assert_eq!(instance.processes().len(), 2);
        assert!(instance.process(3).is_err());
    }

    #[tokio::test]
    async fn kill_stops_everything_the_shell_spawned() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(root.path());
        let instance = provider
            .create_instance(&Recipe::dockerfile(""), &state("machine6"), logger(logs.path(), "m"))
            .await
            .unwrap();

        // the subshell holds the output pipes and outlives a killed `sh`
        let process = instance
            .create_process(
                &Command::new("bg", "(sleep 1; touch marker) & wait", "custom"),
                None,
            )
            .await
            .unwrap();
        let running = {
            let process = process.clone();
            let log = logger(logs.path(), "1");
            tokio::spawn(async move { process.start(log).await })
        };
        for _ in 0..100 {
            if process.is_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(process.is_alive());

        process.kill().await.unwrap();
        tokio::time::timeout(Duration::from_secs(3), running)
            .await
            .expect("start returns after kill")
            .unwrap()
            .unwrap();
        assert!(!process.is_alive());
        assert!(process.is_finished());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!root.path().join("machine6").join("marker").exists());
    }

    #[tokio::test]
    async fn kill_before_start_skips_the_command() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(root.path());
        let instance = provider
            .create_instance(&Recipe::dockerfile(""), &state("machine7"), logger(logs.path(), "m"))
            .await
            .unwrap();

        let process = instance
            .create_process(&Command::new("touch", "touch marker", "custom"), None)
            .await
            .unwrap();
        assert!(!process.is_alive());
        assert!(!process.is_finished());

        process.kill().await.unwrap();
        process.start(logger(logs.path(), "1")).await.unwrap();

        assert!(process.is_finished());
        assert!(!root.path().join("machine7").join("marker").exists());
    }

    #[tokio::test]
    async fn recipe_output_is_streamed_while_the_instruction_runs() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let provider = Arc::new(LocalProvider::new(root.path()));
        let log_path = logs.path().join("machine");

        let building = {
            let provider = provider.clone();
            let log = logger(logs.path(), "machine");
            tokio::spawn(async move {
                provider
                    .create_instance(
                        &Recipe::dockerfile("RUN echo first; sleep 2; echo second"),
                        &state("machine8"),
                        log,
                    )
                    .await
                    .map(|_| ())
            })
        };

        let mut seen_early = false;
        for _ in 0..150 {
            let log = std::fs::read_to_string(&log_path).unwrap_or_default();
            if log.contains("first") {
                seen_early = !log.contains("second");
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen_early);

        building.await.unwrap().unwrap();
        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.ends_with("first\nsecond\n"));
    }
}
