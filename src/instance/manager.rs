//! Instance table and the supervisor operations over it.
//!
//! Every instance carries one async lifecycle lock. Whoever holds it is the
//! only writer of that instance's status, and a status only ever leaves
//! `running` once: the first terminal transition wins.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::log_reader::{self, LogFormat};
use super::monitor;
use super::protocol::{self, FollowupMessage};
use super::worker::{
    ExecutionProfile, ExitClass, WorkerCommand, WorkerExit, WorkerLauncher, WorkerProcess,
};
use crate::error::OverwatchError;
use crate::prompt_generator::PromptGenerator;
use crate::router::{Specialist, TaskRouter};

/// Knobs the manager needs from the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerSettings {
    pub session_dir: PathBuf,
    pub worker_binary: String,
    pub worker_subcommand: Option<String>,
    pub subagent_model: Option<String>,
    /// How long to wait for a worker to die after SIGKILL.
    pub kill_grace: Duration,
    pub poll_interval: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            session_dir: PathBuf::from("session"),
            worker_binary: "codex".into(),
            worker_subcommand: Some("exec".into()),
            subagent_model: None,
            kill_grace: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Running,
    Completed,
    Failed,
    Terminated,
    Timeout,
    Error,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        self != InstanceStatus::Running
    }

    /// Terminal status implied by how the worker exited.
    pub fn from_exit(exit: WorkerExit) -> Self {
        match exit.class() {
            ExitClass::Success => InstanceStatus::Completed,
            ExitClass::Killed => InstanceStatus::Terminated,
            ExitClass::Failed => InstanceStatus::Failed,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Terminated => "terminated",
            InstanceStatus::Timeout => "timeout",
            InstanceStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Everything needed to start one instance.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub id: String,
    pub task: String,
    /// Only the final path component is used; it names the workspace under
    /// `<session>/workspaces/`.
    pub workspace_dir: String,
    pub duration: Duration,
    /// `Generalist` means "let the router decide".
    pub specialist: Specialist,
}

impl SpawnRequest {
    pub fn new(
        id: impl Into<String>,
        task: impl Into<String>,
        workspace_dir: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            workspace_dir: workspace_dir.into(),
            duration,
            specialist: Specialist::Generalist,
        }
    }

    pub fn with_specialist(mut self, specialist: Specialist) -> Self {
        self.specialist = specialist;
        self
    }
}

/// Read-only view of one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSummary {
    pub task: String,
    pub started_at: DateTime<Utc>,
    pub status: InstanceStatus,
    pub workspace: String,
    /// Last value the worker reported in `status.json`.
    pub worker_status: Option<String>,
}

/// What [`InstanceManager::wait_for_instance`] returns on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    /// A pending response or the end of the instance, whichever comes first.
    Response,
    /// Only the end of the instance.
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Response(String),
    Finished(InstanceStatus),
    TimedOut,
    NotFound,
}

pub(super) struct LifecycleState {
    pub(super) status: InstanceStatus,
    pub(super) worker_status: Option<String>,
}

impl LifecycleState {
    /// Move to a terminal status if still running. Returns whether it applied.
    pub(super) fn settle(&mut self, status: InstanceStatus) -> bool {
        if self.status == InstanceStatus::Running && status.is_terminal() {
            self.status = status;
            true
        } else {
            false
        }
    }
}

pub(super) struct Instance {
    pub(super) id: String,
    task: String,
    workspace_name: String,
    log_dir: PathBuf,
    started_at: DateTime<Utc>,
    pub(super) duration: Duration,
    pub(super) worker: Arc<dyn WorkerProcess>,
    pub(super) lifecycle: Mutex<LifecycleState>,
}

impl Instance {
    fn summary(&self, state: &LifecycleState) -> InstanceSummary {
        InstanceSummary {
            task: self.task.clone(),
            started_at: self.started_at,
            status: state.status,
            workspace: self.workspace_name.clone(),
            worker_status: state.worker_status.clone(),
        }
    }

    /// Last assistant message, if the worker is paused waiting for a followup.
    async fn pending_response(
        &self,
        state: &mut LifecycleState,
    ) -> Result<Option<String>, OverwatchError> {
        let Some(status) = protocol::read_status(&self.log_dir).await? else {
            return Ok(None);
        };
        let waiting = status.is_waiting_for_followup();
        state.worker_status = Some(status.status);
        if !waiting {
            return Ok(None);
        }

        let Some(result) = protocol::read_final_result(&self.log_dir).await? else {
            return Ok(None);
        };
        Ok(result.last_assistant_message().map(str::to_owned))
    }
}

pub(super) struct ManagerInner {
    pub(super) settings: ManagerSettings,
    launcher: Arc<dyn WorkerLauncher>,
    router: TaskRouter,
    prompt_generator: Option<Arc<dyn PromptGenerator>>,
    instances: RwLock<HashMap<String, Arc<Instance>>>,
    /// Ids with a spawn in flight. Only touched while holding the table's
    /// write lock, except for the release in [`Reservation::drop`].
    reserved: StdMutex<HashSet<String>>,
}

impl ManagerInner {
    fn get(&self, id: &str) -> Option<Arc<Instance>> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Claim `id` for a spawn. `None` if it is registered or already claimed.
    fn reserve<'a>(&'a self, id: &str) -> Option<Reservation<'a>> {
        let table = self
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        if table.contains_key(id) || !reserved.insert(id.to_owned()) {
            return None;
        }
        Some(Reservation {
            inner: self,
            id: id.to_owned(),
        })
    }

    fn snapshot(&self) -> Vec<Arc<Instance>> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Kill the worker if it is alive, give it the grace period to die, then
    /// settle `status`. All of it happens under the lifecycle lock, so no
    /// other transition can interleave.
    pub(super) async fn kill_and_settle(
        &self,
        instance: &Instance,
        status: InstanceStatus,
    ) -> Result<()> {
        let mut state = instance.lifecycle.lock().await;

        if instance.worker.is_alive() {
            info!(instance_id = %instance.id, pid = ?instance.worker.pid(), "force killing instance");
            instance.worker.kill()?;
            match instance.worker.wait(self.settings.kill_grace).await {
                Ok(Some(_)) => {}
                Ok(None) => warn!(
                    instance_id = %instance.id,
                    grace_ms = self.settings.kill_grace.as_millis() as u64,
                    "instance still alive after SIGKILL"
                ),
                Err(e) => warn!(instance_id = %instance.id, error = %e, "lost track of instance after kill"),
            }
        }

        if state.settle(status) {
            debug!(instance_id = %instance.id, %status, "instance settled");
        }
        Ok(())
    }
}

/// Holds an id between the duplicate check and registration.
struct Reservation<'a> {
    inner: &'a ManagerInner,
    id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.inner
            .reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Owns every instance spawned during the session. Cheap to clone.
#[derive(Clone)]
pub struct InstanceManager {
    inner: Arc<ManagerInner>,
}

impl InstanceManager {
    /// `settings.session_dir` is made absolute against the current directory.
    pub fn new(
        mut settings: ManagerSettings,
        launcher: Arc<dyn WorkerLauncher>,
        router: TaskRouter,
        prompt_generator: Option<Arc<dyn PromptGenerator>>,
    ) -> Result<Self> {
        settings.session_dir = std::path::absolute(&settings.session_dir)
            .with_context(|| format!("resolve session dir {}", settings.session_dir.display()))?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                settings,
                launcher,
                router,
                prompt_generator,
                instances: RwLock::new(HashMap::new()),
                reserved: StdMutex::new(HashSet::new()),
            }),
        })
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    /// Start a worker for `request`. Returns `false` when the id is taken or
    /// the launch fails; the table is unchanged in both cases. The id is
    /// claimed before any I/O, so a concurrent duplicate never launches.
    pub async fn spawn(&self, request: SpawnRequest) -> bool {
        let Some(_claim) = self.inner.reserve(&request.id) else {
            warn!(instance_id = %request.id, "instance already exists");
            return false;
        };

        match self.try_spawn(&request).await {
            Ok(()) => true,
            Err(e) => {
                error!(instance_id = %request.id, error = %format!("{e:#}"), "failed to spawn instance");
                false
            }
        }
    }

    async fn try_spawn(&self, request: &SpawnRequest) -> Result<()> {
        let workspace_name = workspace_name(&request.workspace_dir)?;
        let workspace = self
            .inner
            .settings
            .session_dir
            .join("workspaces")
            .join(&workspace_name);
        tokio::fs::create_dir_all(&workspace)
            .await
            .with_context(|| format!("create workspace {}", workspace.display()))?;

        let profile = self.select_profile(request, &workspace).await;
        let command = WorkerCommand::build(
            &self.inner.settings,
            &request.id,
            &request.task,
            &workspace,
            &profile,
        );
        let worker = self.inner.launcher.launch(&command)?;

        let instance = Arc::new(Instance {
            id: request.id.clone(),
            task: request.task.clone(),
            workspace_name,
            log_dir: workspace,
            started_at: Utc::now(),
            duration: request.duration,
            worker: worker.clone(),
            lifecycle: Mutex::new(LifecycleState {
                status: InstanceStatus::Running,
                worker_status: None,
            }),
        });

        self.inner
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request.id.clone(), instance.clone());

        info!(
            instance_id = %request.id,
            pid = ?worker.pid(),
            budget_secs = request.duration.as_secs(),
            profile = ?profile,
            "spawned instance"
        );
        tokio::spawn(monitor::watch(self.inner.clone(), instance));
        Ok(())
    }

    async fn select_profile(&self, request: &SpawnRequest, workspace: &Path) -> ExecutionProfile {
        if let Some(generator) = &self.inner.prompt_generator {
            match generator.generate(&request.task).await {
                Some(text) => {
                    let prompt_file = protocol::custom_prompt_path(workspace, &request.id);
                    match tokio::fs::write(&prompt_file, text).await {
                        Ok(()) => {
                            info!(instance_id = %request.id, path = %prompt_file.display(), "using generated instructions");
                            return ExecutionProfile::Instructions { prompt_file };
                        }
                        Err(e) => error!(
                            path = %prompt_file.display(),
                            error = %e,
                            "failed to save generated instructions, routing instead"
                        ),
                    }
                }
                None => warn!(instance_id = %request.id, "instruction generation failed, routing instead"),
            }
        }

        if request.specialist == Specialist::Generalist {
            ExecutionProfile::Specialist(self.inner.router.route(&request.task).await.specialist)
        } else {
            ExecutionProfile::Specialist(request.specialist)
        }
    }

    /// Force-kill an instance and mark it terminated. Returns `false` only
    /// for unknown ids or a failed kill; a worker that is already gone counts
    /// as success and keeps its terminal status.
    pub async fn terminate(&self, id: &str) -> bool {
        let Some(instance) = self.inner.get(id) else {
            warn!(instance_id = %id, "instance not found");
            return false;
        };

        match self
            .inner
            .kill_and_settle(&instance, InstanceStatus::Terminated)
            .await
        {
            Ok(()) => {
                info!(instance_id = %id, "terminated instance");
                true
            }
            Err(e) => {
                error!(instance_id = %id, error = %format!("{e:#}"), "failed to terminate instance");
                false
            }
        }
    }

    /// Instances still running after reconciling any worker that has already
    /// exited but not yet been settled by its monitor.
    ///
    /// Reconciliation uses [`InstanceStatus::from_exit`]: exit 0 is
    /// `completed`, SIGKILL is `terminated`, anything else is `failed`.
    pub async fn list_active(&self) -> BTreeMap<String, InstanceSummary> {
        let mut active = BTreeMap::new();
        for instance in self.inner.snapshot() {
            let mut state = instance.lifecycle.lock().await;
            if state.status != InstanceStatus::Running {
                continue;
            }
            if let Some(exit) = instance.worker.exit_status() {
                state.settle(InstanceStatus::from_exit(exit));
                continue;
            }
            active.insert(instance.id.clone(), instance.summary(&state));
        }
        active
    }

    /// Every instance known to this session, terminal ones included.
    pub async fn list_all(&self) -> BTreeMap<String, InstanceSummary> {
        let mut all = BTreeMap::new();
        for instance in self.inner.snapshot() {
            let state = instance.lifecycle.lock().await;
            all.insert(instance.id.clone(), instance.summary(&state));
        }
        all
    }

    pub async fn status(&self, id: &str) -> Option<InstanceStatus> {
        let instance = self.inner.get(id)?;
        let status = instance.lifecycle.lock().await.status;
        Some(status)
    }

    pub fn log_dir(&self, id: &str) -> Option<PathBuf> {
        self.inner.get(id).map(|i| i.log_dir.clone())
    }

    /// Drop a followup into a running instance's log directory.
    pub async fn send_followup(&self, id: &str, message: &str) -> bool {
        let Some(instance) = self.inner.get(id) else {
            warn!(instance_id = %id, "instance not found");
            return false;
        };

        let state = instance.lifecycle.lock().await;
        if state.status != InstanceStatus::Running {
            warn!(instance_id = %id, status = %state.status, "instance is not running");
            return false;
        }

        match protocol::write_followup(&instance.log_dir, &FollowupMessage::now(message)).await {
            Ok(path) => {
                info!(instance_id = %id, path = %path.display(), "sent followup");
                true
            }
            Err(e) => {
                error!(instance_id = %id, error = %e, "failed to write followup");
                false
            }
        }
    }

    /// Latest assistant message of every running instance that is waiting
    /// for a followup. Per-instance read errors are logged and skipped.
    pub async fn check_for_responses(&self) -> BTreeMap<String, String> {
        let mut responses = BTreeMap::new();
        for instance in self.inner.snapshot() {
            let mut state = instance.lifecycle.lock().await;
            if state.status != InstanceStatus::Running {
                continue;
            }
            match instance.pending_response(&mut state).await {
                Ok(Some(text)) => {
                    responses.insert(instance.id.clone(), text);
                }
                Ok(None) => {}
                Err(e) => error!(instance_id = %instance.id, error = %e, "failed to check for response"),
            }
        }
        responses
    }

    /// Poll one instance until it has a pending response (for
    /// [`WaitTarget::Response`]), finishes, or `timeout` elapses.
    pub async fn wait_for_instance(
        &self,
        id: &str,
        timeout: Duration,
        target: WaitTarget,
    ) -> WaitOutcome {
        let Some(instance) = self.inner.get(id) else {
            return WaitOutcome::NotFound;
        };
        // Budgets too large to represent never expire.
        let deadline = tokio::time::Instant::now().checked_add(timeout);

        loop {
            {
                let mut state = instance.lifecycle.lock().await;
                if state.status.is_terminal() {
                    return WaitOutcome::Finished(state.status);
                }
                if target == WaitTarget::Response {
                    match instance.pending_response(&mut state).await {
                        Ok(Some(text)) => return WaitOutcome::Response(text),
                        Ok(None) => {}
                        Err(e) => debug!(instance_id = %id, error = %e, "response not readable yet"),
                    }
                }
            }

            let mut pause = self.inner.settings.poll_interval;
            if let Some(deadline) = deadline {
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    return WaitOutcome::TimedOut;
                }
                pause = pause.min(deadline - now);
            }
            tokio::time::sleep(pause).await;
        }
    }

    /// Human-readable log of an instance. `None` for unknown ids or when the
    /// worker has written nothing readable yet.
    pub async fn read_logs(
        &self,
        id: &str,
        format: LogFormat,
        tail_lines: Option<usize>,
    ) -> Option<String> {
        let instance = self.inner.get(id)?;
        match log_reader::read_logs(&instance.log_dir, format, tail_lines).await {
            Ok(text) => text,
            Err(e) => {
                error!(instance_id = %id, error = %e, "failed to read instance logs");
                None
            }
        }
    }
}

fn workspace_name(workspace_dir: &str) -> Result<String> {
    Path::new(workspace_dir)
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("workspace dir {workspace_dir:?} has no usable final component"))
}
