//! Worker process launch and lifecycle.
//!
//! [`launch`] spawns the worker with piped output streams. Three background
//! tasks run per worker:
//!
//! - two line readers that log each line under the `alex::worker::output`
//!   target and append it to an [`OutputBuffer`];
//! - a reaper that owns the [`Child`], publishes the exit status through a
//!   `watch` channel as soon as it is collected, and services kill requests.
//!
//! On unix the worker leads its own process group and signals go to the
//! whole group, so helpers it forked die with it. The resulting
//! [`WorkerProcess`] kills the child when dropped.

use super::output::OutputBuffer;
use crate::config::WorkerConfig;
use crate::error::{BridgeError, Result};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Tracing target for captured worker output.
pub const OUTPUT_TARGET: &str = "alex::worker::output";

/// How long the reaper waits for the readers to drain after exit.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Lifecycle states.
///
/// ```text
/// Starting → Running → Stopped
///     ↓         ↓
///   Failed    Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, not yet ready.
    Starting,
    /// Printed its readiness sentinel.
    Running,
    /// Exited or was killed before or while serving.
    Failed,
    /// Intentionally stopped.
    Stopped,
}

impl WorkerState {
    /// Returns `true` if the worker is in a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }

    /// Returns `true` if a transition from `self` to `target` is valid.
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Starting, Self::Running)
                | (Self::Starting, Self::Failed)
                | (Self::Starting, Self::Stopped)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Stopped)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code, `None` when killed by a signal or unknown.
    pub code: Option<i32>,
    /// Terminating signal (unix only).
    pub signal: Option<i32>,
}

impl WorkerExit {
    /// Exit status could not be collected.
    pub const UNKNOWN: Self = Self {
        code: None,
        signal: None,
    };

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Everything needed to spawn a worker.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Name used in log fields.
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
    /// Extra environment; the parent environment is inherited.
    pub env: Vec<(OsString, OsString)>,
    pub stdout_capacity: usize,
    pub stderr_capacity: usize,
}

impl LaunchConfig {
    /// A config with no arguments and default buffer sizes.
    pub fn new(name: &str, program: impl Into<PathBuf>) -> Self {
        let defaults = WorkerConfig::default();
        Self {
            name: name.to_owned(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            stdout_capacity: defaults.stdout_capacity,
            stderr_capacity: defaults.stderr_capacity,
        }
    }

    /// The standard Python worker launch: `<python> <script>` in the backend
    /// directory with the provisioned packages on `PYTHONPATH` and unbuffered
    /// UTF-8 output.
    pub fn python_worker(python: &Path, worker: &WorkerConfig) -> Self {
        // The child runs inside the backend dir, so relative paths must be
        // resolved against ours first.
        let absolute = |p: PathBuf| std::path::absolute(&p).unwrap_or(p);
        let mut config = Self::new("python-worker", python)
            .arg(absolute(worker.script_path()))
            .current_dir(absolute(worker.backend_dir.clone()))
            .env("PYTHONPATH", absolute(worker.site_packages_dir()))
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONUNBUFFERED", "1");
        config.stdout_capacity = worker.stdout_capacity;
        config.stderr_capacity = worker.stderr_capacity;
        config
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Finds a Python interpreter.
///
/// Probes in order: `explicit`, `<backend_dir>/python(.exe)`, then `PATH`
/// lookups for `python3` and `python`.
///
/// # Errors
///
/// [`BridgeError::LaunchFailed`] naming every location searched.
pub fn discover_python(explicit: Option<&Path>, backend_dir: &Path) -> Result<PathBuf> {
    let candidates = python_candidates(explicit, backend_dir);
    if let Some(found) = candidates.iter().find(|p| p.is_file()) {
        return Ok(found.clone());
    }
    Err(BridgeError::LaunchFailed {
        program: "python".to_owned(),
        source: std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!(
                "searched {} location(s): {}",
                candidates.len(),
                candidates
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        ),
    })
}

fn python_candidates(explicit: Option<&Path>, backend_dir: &Path) -> Vec<PathBuf> {
    let mut candidates = Vec::with_capacity(4);
    if let Some(p) = explicit {
        candidates.push(p.to_path_buf());
    }
    let bundled = if cfg!(windows) { "python.exe" } else { "python" };
    candidates.push(backend_dir.join(bundled));
    for name in ["python3", "python"] {
        if let Ok(found) = which::which(name) {
            candidates.push(found);
        }
    }
    candidates
}

/// A running (or exited) worker process.
pub struct WorkerProcess {
    name: String,
    pid: Option<u32>,
    state: Mutex<WorkerState>,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    exit_rx: watch::Receiver<Option<WorkerExit>>,
    drained_rx: watch::Receiver<bool>,
    kill_tx: mpsc::UnboundedSender<()>,
    reaper: JoinHandle<()>,
}

/// Spawns a worker.
///
/// # Errors
///
/// [`BridgeError::LaunchFailed`] if the process cannot be created.
pub fn launch(config: &LaunchConfig) -> Result<WorkerProcess> {
    let mut child = config
        .command()
        .spawn()
        .map_err(|source| BridgeError::LaunchFailed {
            program: config.program.display().to_string(),
            source,
        })?;

    let pid = child.id();
    let stdout = OutputBuffer::new(config.stdout_capacity);
    let stderr = OutputBuffer::new(config.stderr_capacity);

    let mut readers = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        readers.push(tokio::spawn(read_lines(
            out,
            stdout.clone(),
            config.name.clone(),
            "stdout",
        )));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(tokio::spawn(read_lines(
            err,
            stderr.clone(),
            config.name.clone(),
            "stderr",
        )));
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    let (drained_tx, drained_rx) = watch::channel(false);
    let (kill_tx, kill_rx) = mpsc::unbounded_channel();
    let reaper = tokio::spawn(reap(
        child,
        kill_rx,
        Published { exit_tx, drained_tx },
        readers,
        config.name.clone(),
    ));

    tracing::info!(
        worker = %config.name,
        program = %config.program.display(),
        pid = ?pid,
        "worker launched"
    );

    Ok(WorkerProcess {
        name: config.name.clone(),
        pid,
        state: Mutex::new(WorkerState::Starting),
        stdout,
        stderr,
        exit_rx,
        drained_rx,
        kill_tx,
        reaper,
    })
}

async fn read_lines<R>(stream: R, buffer: OutputBuffer, worker: String, stream_name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim_end_matches(['\r', '\n']);
                tracing::info!(target: OUTPUT_TARGET, worker = %worker, stream = stream_name, "{line}");
                buffer.push(line);
            }
            Err(e) => {
                tracing::debug!(worker = %worker, stream = stream_name, error = %e, "output read failed");
                break;
            }
        }
    }
}

/// What the reaper reports, in order: the exit, then end of output.
struct Published {
    exit_tx: watch::Sender<Option<WorkerExit>>,
    drained_tx: watch::Sender<bool>,
}

async fn reap(
    mut child: Child,
    mut kill_rx: mpsc::UnboundedReceiver<()>,
    published: Published,
    readers: Vec<JoinHandle<()>>,
    worker: String,
) {
    let exit = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) => WorkerExit::from(status),
                    Err(e) => {
                        tracing::warn!(worker = %worker, error = %e, "failed to collect worker exit status");
                        WorkerExit::UNKNOWN
                    }
                };
            }
            Some(()) = kill_rx.recv() => {
                if let Err(e) = child.start_kill() {
                    tracing::debug!(worker = %worker, error = %e, "kill request failed");
                }
            }
        }
    };

    tracing::info!(worker = %worker, exit = %exit, "worker exited");
    published.exit_tx.send_replace(Some(exit));

    // Grandchildren may keep the pipes open; do not wait on them forever.
    for reader in readers {
        if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
            tracing::debug!(worker = %worker, "output reader still open after exit");
        }
    }
    published.drained_tx.send_replace(true);
}

impl WorkerProcess {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS process id, if the child reported one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Moves to `target` if the transition is valid. Returns whether it
    /// happened.
    pub fn transition(&self, target: WorkerState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let current = *state;
        if !current.can_transition_to(target) {
            tracing::debug!(worker = %self.name, from = %current, to = %target, "ignored state transition");
            return false;
        }
        tracing::debug!(worker = %self.name, from = %current, to = %target, "worker state transition");
        *state = target;
        true
    }

    pub fn stdout(&self) -> &OutputBuffer {
        &self.stdout
    }

    pub fn stderr(&self) -> &OutputBuffer {
        &self.stderr
    }

    /// Last `n` stderr lines.
    pub fn stderr_tail(&self, n: usize) -> Vec<String> {
        self.stderr.tail(n)
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Exit status, if the process has exited.
    pub fn exit(&self) -> Option<WorkerExit> {
        *self.exit_rx.borrow()
    }

    /// Waits for the process to exit. Safe to call repeatedly and from
    /// several tasks at once.
    pub async fn wait_exit(&self) -> WorkerExit {
        let mut rx = self.exit_rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or(WorkerExit::UNKNOWN),
            // Reaper gone without publishing: the child was dropped with it.
            Err(_) => WorkerExit::UNKNOWN,
        }
    }

    /// Waits until the output readers have finished after exit, or gave up
    /// on a pipe still held open. Returns immediately once that happened.
    pub async fn wait_output_drained(&self) {
        let mut rx = self.drained_rx.clone();
        let _ = rx.wait_for(|drained| *drained).await;
    }

    /// [`wait_exit`](Self::wait_exit) bounded by `limit`.
    pub async fn wait_exit_timeout(&self, limit: Duration) -> Option<WorkerExit> {
        tokio::time::timeout(limit, self.wait_exit()).await.ok()
    }

    /// Sends `signal` to the worker's process group. Returns whether the
    /// group received it.
    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) -> bool {
        let Some(pgid) = self.pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
            return false;
        };
        // SAFETY: signal delivery to the group led by a child we spawned with
        // `process_group(0)`; the group id is its pid.
        let rc = unsafe { libc::kill(-pgid, signal) };
        if rc != 0 {
            tracing::debug!(
                worker = %self.name,
                pgid,
                signal,
                error = %std::io::Error::last_os_error(),
                "group signal failed"
            );
        }
        rc == 0
    }

    /// Asks the process to stop: SIGTERM to its group on unix, a forced kill
    /// elsewhere.
    pub fn request_termination(&self) {
        if self.has_exited() {
            return;
        }
        #[cfg(unix)]
        if self.signal_group(libc::SIGTERM) {
            return;
        }
        self.force_kill();
    }

    /// Kills the process (and on unix its whole group) without waiting.
    pub fn force_kill(&self) {
        #[cfg(unix)]
        self.signal_group(libc::SIGKILL);
        if self.kill_tx.send(()).is_err() {
            tracing::debug!(worker = %self.name, "reaper already finished");
        }
    }

    /// Polite termination followed by a forced kill after `grace`.
    ///
    /// Returns the exit once confirmed, or `None` if the process still had
    /// not exited `grace` after the forced kill.
    pub async fn terminate(&self, grace: Duration) -> Option<WorkerExit> {
        if let Some(exit) = self.exit() {
            return Some(exit);
        }
        self.request_termination();
        if let Some(exit) = self.wait_exit_timeout(grace).await {
            return Some(exit);
        }
        tracing::warn!(worker = %self.name, grace_ms = grace.as_millis() as u64, "worker ignored termination, killing");
        self.force_kill();
        self.wait_exit_timeout(grace.max(Duration::from_millis(500))).await
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if !self.has_exited() {
            self.force_kill();
            tracing::debug!(worker = %self.name, "killed worker on drop");
        }
        if self.kill_tx.is_closed() {
            self.reaper.abort();
        }
    }
}

impl fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .field("exit", &self.exit())
            .finish()
    }
}

/// Take-once home for the process-wide worker.
///
/// Startup puts the worker in; shutdown takes it out. Readers borrow it
/// through [`with`](Self::with).
#[derive(Debug, Default)]
pub struct WorkerSlot {
    inner: tokio::sync::Mutex<Option<Arc<WorkerProcess>>>,
}

impl WorkerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `worker`, returning any previous occupant.
    pub async fn put(&self, worker: Arc<WorkerProcess>) -> Option<Arc<WorkerProcess>> {
        self.inner.lock().await.replace(worker)
    }

    /// Removes the worker, leaving the slot empty.
    pub async fn take(&self) -> Option<Arc<WorkerProcess>> {
        self.inner.lock().await.take()
    }

    /// A shared handle to the current worker, if any.
    pub async fn get(&self) -> Option<Arc<WorkerProcess>> {
        self.inner.lock().await.clone()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}
