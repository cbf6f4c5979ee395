//! Worker process capability: launch, liveness, bounded wait, kill.
//!
//! The manager only talks to [`WorkerLauncher`] and [`WorkerProcess`]; the
//! tokio-backed [`ProcessLauncher`] is the production implementation.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use super::manager::ManagerSettings;
use crate::router::Specialist;

/// Signal number the platform reports for a hard kill.
pub const KILL_SIGNAL: i32 = 9;

const OUTPUT_LIMIT_BYTES: usize = 256 * 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Coarse classification of a [`WorkerExit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    Killed,
    Failed,
}

impl WorkerExit {
    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn killed() -> Self {
        Self {
            code: None,
            signal: Some(KILL_SIGNAL),
        }
    }

    pub fn class(&self) -> ExitClass {
        match (self.code, self.signal) {
            (Some(0), _) => ExitClass::Success,
            (_, Some(KILL_SIGNAL)) => ExitClass::Killed,
            _ => ExitClass::Failed,
        }
    }
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Captured worker output.
#[derive(Debug, Default, Clone)]
pub struct WorkerOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A launched worker.
#[async_trait]
pub trait WorkerProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Exit observed so far, if any.
    fn exit_status(&self) -> Option<WorkerExit>;

    fn is_alive(&self) -> bool;

    /// Wait up to `timeout` for the process to exit. `Ok(None)` means it is still running.
    async fn wait(&self, timeout: Duration) -> Result<Option<WorkerExit>>;

    /// Hard-kill the worker and everything in its process group. A worker
    /// that is already gone is not an error.
    fn kill(&self) -> Result<()>;

    /// Collect whatever the worker wrote to stdout/stderr. Best effort.
    async fn drain_output(&self) -> Result<WorkerOutput>;
}

/// Starts workers from a [`WorkerCommand`].
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, command: &WorkerCommand) -> Result<Arc<dyn WorkerProcess>>;
}

/// How the worker is told what to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionProfile {
    /// Generated instructions on disk; the worker runs in generalist mode.
    Instructions { prompt_file: PathBuf },
    Specialist(Specialist),
}

/// Fully resolved worker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl WorkerCommand {
    /// Build the invocation the worker binary expects. `workspace` must be absolute.
    pub fn build(
        settings: &ManagerSettings,
        instance_id: &str,
        task: &str,
        workspace: &Path,
        profile: &ExecutionProfile,
    ) -> Self {
        let workspace_arg = workspace.display().to_string();
        let mut args: Vec<String> = Vec::new();

        if let Some(sub) = settings.worker_subcommand.as_deref().filter(|s| !s.is_empty()) {
            args.push(sub.to_string());
        }
        args.extend([
            "--dangerously-bypass-approvals-and-sandbox".to_string(),
            "--skip-git-repo-check".to_string(),
            "--log-session-dir".to_string(),
            workspace_arg.clone(),
            "--instance-id".to_string(),
            instance_id.to_string(),
            "--wait-for-followup".to_string(),
            "-C".to_string(),
            workspace_arg,
        ]);

        if let Some(model) = settings.subagent_model.as_deref().filter(|m| !m.is_empty()) {
            args.extend(["--model".to_string(), model.to_string()]);
        }

        match profile {
            ExecutionProfile::Instructions { prompt_file } => {
                args.extend([
                    "-c".to_string(),
                    format!("experimental_instructions_file={}", prompt_file.display()),
                    "--mode".to_string(),
                    Specialist::Generalist.id().to_string(),
                ]);
            }
            ExecutionProfile::Specialist(specialist) => {
                args.extend(["--mode".to_string(), specialist.id().to_string()]);
            }
        }

        args.push(task.to_string());

        Self {
            program: settings.worker_binary.clone(),
            args,
            cwd: workspace.to_path_buf(),
        }
    }
}

/// Launches workers as real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, command: &WorkerCommand) -> Result<Arc<dyn WorkerProcess>> {
        Ok(Arc::new(ChildWorker::spawn(command)?))
    }
}

#[derive(Debug, Clone)]
enum WaitState {
    Running,
    Exited(WorkerExit),
    Lost(String),
}

type OutputReaders = (JoinHandle<Result<String>>, JoinHandle<Result<String>>);

/// A child process in its own process group.
///
/// A reaper task owns the `Child` and publishes its exit on a watch channel;
/// stdout/stderr are read concurrently so a paused worker never blocks on a
/// full pipe.
pub struct ChildWorker {
    pid: Option<u32>,
    exit_rx: watch::Receiver<WaitState>,
    kill_request: Arc<Notify>,
    readers: Mutex<Option<OutputReaders>>,
}

impl ChildWorker {
    #[instrument(skip_all, fields(program = %command.program))]
    pub fn spawn(command: &WorkerCommand) -> Result<Self> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        debug!("spawning worker process");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn worker {}", command.program))?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;
        let readers = (
            tokio::spawn(read_limited(stdout, OUTPUT_LIMIT_BYTES)),
            tokio::spawn(read_limited(stderr, OUTPUT_LIMIT_BYTES)),
        );

        let (exit_tx, exit_rx) = watch::channel(WaitState::Running);
        let kill_request = Arc::new(Notify::new());
        let kill_notified = kill_request.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_notified.notified() => {
                    if let Err(e) = child.start_kill() {
                        debug!(error = %e, "start_kill on worker failed");
                    }
                    child.wait().await
                }
            };
            let state = match status {
                Ok(status) => WaitState::Exited(status.into()),
                Err(e) => {
                    error!(pid = ?pid, error = %e, "failed waiting on worker");
                    WaitState::Lost(e.to_string())
                }
            };
            let _ = exit_tx.send(state);
        });

        Ok(Self {
            pid,
            exit_rx,
            kill_request,
            readers: Mutex::new(Some(readers)),
        })
    }
}

#[async_trait]
impl WorkerProcess for ChildWorker {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn exit_status(&self) -> Option<WorkerExit> {
        match &*self.exit_rx.borrow() {
            WaitState::Exited(exit) => Some(*exit),
            _ => None,
        }
    }

    fn is_alive(&self) -> bool {
        matches!(*self.exit_rx.borrow(), WaitState::Running)
    }

    async fn wait(&self, timeout: Duration) -> Result<Option<WorkerExit>> {
        let mut rx = self.exit_rx.clone();
        let settled = tokio::time::timeout(timeout, async move {
            rx.wait_for(|s| !matches!(s, WaitState::Running))
                .await
                .map(|state| state.clone())
        })
        .await;

        match settled {
            Err(_) => Ok(None),
            Ok(Err(_)) => Err(anyhow!("worker reaper stopped without reporting an exit")),
            Ok(Ok(WaitState::Exited(exit))) => Ok(Some(exit)),
            Ok(Ok(WaitState::Lost(msg))) => Err(anyhow!("lost track of worker: {msg}")),
            Ok(Ok(WaitState::Running)) => Ok(None),
        }
    }

    fn kill(&self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            if let Some(pid) = self.pid {
                let pgid = i32::try_from(pid).context("pid out of range")?;
                match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => return Ok(()),
                    Err(e) => {
                        warn!(pid, error = %e, "process group kill failed, killing worker only");
                    }
                }
            }
        }

        self.kill_request.notify_one();
        Ok(())
    }

    async fn drain_output(&self) -> Result<WorkerOutput> {
        let readers = self
            .readers
            .lock()
            .map_err(|_| anyhow!("output reader lock poisoned"))?
            .take();
        let Some((stdout, stderr)) = readers else {
            return Ok(WorkerOutput::default());
        };

        let (stdout, stderr) = tokio::time::timeout(DRAIN_TIMEOUT, async {
            (stdout.await, stderr.await)
        })
        .await
        .context("timed out draining worker output")?;

        Ok(WorkerOutput {
            stdout: stdout.context("stdout reader panicked")??,
            stderr: stderr.context("stderr reader panicked")??,
        })
    }
}

async fn read_limited<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> Result<String> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await.context("read worker output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    if truncated > 0 {
        debug!(truncated, "worker output truncated");
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ManagerSettings {
        ManagerSettings {
            session_dir: PathBuf::from("/srv/session"),
            worker_binary: "/usr/local/bin/codex".into(),
            ..Default::default()
        }
    }

    #[test]
    fn specialist_command_follows_argument_contract() {
        let ws = Path::new("/srv/session/workspaces/sqli");
        let cmd = WorkerCommand::build(
            &settings(),
            "sqli-login",
            "Test the login form",
            ws,
            &ExecutionProfile::Specialist(Specialist::Web),
        );

        assert_eq!(cmd.program, "/usr/local/bin/codex");
        assert_eq!(cmd.cwd, ws);
        assert_eq!(
            cmd.args,
            vec![
                "exec",
                "--dangerously-bypass-approvals-and-sandbox",
                "--skip-git-repo-check",
                "--log-session-dir",
                "/srv/session/workspaces/sqli",
                "--instance-id",
                "sqli-login",
                "--wait-for-followup",
                "-C",
                "/srv/session/workspaces/sqli",
                "--mode",
                "web",
                "Test the login form",
            ]
        );
    }

    #[test]
    fn instructions_profile_uses_config_override_and_generalist_mode() {
        let settings = ManagerSettings {
            subagent_model: Some("gpt-5-codex".into()),
            worker_subcommand: None,
            ..settings()
        };
        let ws = Path::new("/srv/session/workspaces/ad");
        let prompt = ws.join("custom_prompt_ad-1.md");
        let cmd = WorkerCommand::build(
            &settings,
            "ad-1",
            "Map the domain",
            ws,
            &ExecutionProfile::Instructions {
                prompt_file: prompt.clone(),
            },
        );

        assert_eq!(cmd.args[0], "--dangerously-bypass-approvals-and-sandbox");
        let tail: Vec<&str> = cmd.args[8..].iter().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec![
                "/srv/session/workspaces/ad",
                "--model",
                "gpt-5-codex",
                "-c",
                "experimental_instructions_file=/srv/session/workspaces/ad/custom_prompt_ad-1.md",
                "--mode",
                "generalist",
                "Map the domain",
            ]
        );
    }

    #[test]
    fn exit_classification() {
        assert_eq!(WorkerExit::with_code(0).class(), ExitClass::Success);
        assert_eq!(WorkerExit::with_code(2).class(), ExitClass::Failed);
        assert_eq!(WorkerExit::killed().class(), ExitClass::Killed);
        let terminated = WorkerExit {
            code: None,
            signal: Some(15),
        };
        assert_eq!(terminated.class(), ExitClass::Failed);
    }

    #[cfg(unix)]
    fn shell(script: &str) -> WorkerCommand {
        WorkerCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            cwd: std::env::temp_dir(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_process_success_is_observed() {
        let worker = ProcessLauncher.launch(&shell("echo hello")).unwrap();
        let exit = worker.wait(Duration::from_secs(10)).await.unwrap().unwrap();
        assert_eq!(exit.class(), ExitClass::Success);
        assert!(!worker.is_alive());
        assert_eq!(worker.drain_output().await.unwrap().stdout, "hello\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_process_failure_keeps_stderr() {
        let worker = ProcessLauncher.launch(&shell("echo boom >&2; exit 3")).unwrap();
        let exit = worker.wait(Duration::from_secs(10)).await.unwrap().unwrap();
        assert_eq!(exit, WorkerExit::with_code(3));
        assert_eq!(exit.class(), ExitClass::Failed);
        assert_eq!(worker.drain_output().await.unwrap().stderr, "boom\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_takes_down_the_process_group() {
        let worker = ProcessLauncher.launch(&shell("sleep 30 & wait")).unwrap();
        assert!(worker.wait(Duration::from_millis(100)).await.unwrap().is_none());
        assert!(worker.is_alive());

        worker.kill().unwrap();
        let exit = worker.wait(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(exit.class(), ExitClass::Killed);
        assert!(!worker.is_alive());
        // The background sleep held the pipes; draining only finishes if it died too.
        assert!(worker.drain_output().await.is_ok());
        // Killing again is harmless.
        worker.kill().unwrap();
    }

    #[test]
    fn launch_failure_is_an_error() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();
        let cmd = WorkerCommand {
            program: "/nonexistent/worker-binary".into(),
            args: vec![],
            cwd: std::env::temp_dir(),
        };
        assert!(ProcessLauncher.launch(&cmd).is_err());
    }
}
