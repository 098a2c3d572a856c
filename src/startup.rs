//! Startup orchestration: provision, launch, wait for readiness, connect.
//!
//! [`Supervisor`] owns every process-wide piece of the bridge (worker slot,
//! control channel, host, cancellation token) and enforces the ordering
//! rules: nothing is spawned before provisioning succeeds and nothing is
//! called on the worker before it reports ready.

use crate::config::BridgeConfig;
use crate::control::{ControlChannel, ControlPlaneHost, HostServices, UiDispatcher};
use crate::error::{BridgeError, Result};
use crate::shutdown::{HostSlot, ShutdownOutcome, ShutdownSequencer};
use crate::worker::{
    CommandRunner, DependencyProvisioner, LaunchConfig, ListenerProbe, PortAllocator, PortFile, PortReclaimer,
    ProvisionReport, ReadinessMonitor, SystemCommandRunner, SystemListenerProbe, SystemPortReclaimer, WorkerProcess,
    WorkerSlot, WorkerState, discover_python, discover_worker_port, launch,
};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// User-facing startup stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStage {
    InstallingDependencies,
    LaunchingWorker,
    Connecting,
}

impl StartupStage {
    pub fn message(self) -> &'static str {
        match self {
            Self::InstallingDependencies => "installing dependencies",
            Self::LaunchingWorker => "launching worker",
            Self::Connecting => "connecting",
        }
    }
}

impl fmt::Display for StartupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Receives startup progress, typically a splash screen.
///
/// [`finished`](Self::finished) is called exactly once per
/// [`Supervisor::start`] call, whatever the outcome.
pub trait StartupObserver: Send + Sync {
    fn stage(&self, stage: StartupStage) {
        let _ = stage;
    }

    /// A non-fatal problem the user should know about.
    fn warning(&self, message: &str) {
        let _ = message;
    }

    /// Startup failed; `message` is suitable for display.
    fn failed(&self, message: &str) {
        let _ = message;
    }

    fn finished(&self) {}
}

/// Observer that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl StartupObserver for LoggingObserver {
    fn stage(&self, stage: StartupStage) {
        tracing::info!(%stage, "startup stage");
    }

    fn warning(&self, message: &str) {
        tracing::warn!("{message}");
    }

    fn failed(&self, message: &str) {
        tracing::error!("{message}");
    }
}

struct FinishGuard<'a>(&'a dyn StartupObserver);

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.0.finished();
    }
}

/// How the activation handshake went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// Disabled, or no microphone configured.
    Skipped,
    Activated,
    Failed(String),
}

/// What a successful startup produced.
#[derive(Debug)]
pub struct StartupReport {
    pub provision: ProvisionReport,
    pub worker_pid: Option<u32>,
    /// Port the worker announced on its readiness line.
    pub announced_port: Option<u16>,
    /// Port the control-plane host bound, if it started.
    pub host_port: Option<u16>,
    pub handshake: Handshake,
}

/// Replaceable system collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub runner: Arc<dyn CommandRunner>,
    pub reclaimer: Arc<dyn PortReclaimer>,
    pub probe: Arc<dyn ListenerProbe>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            runner: Arc::new(SystemCommandRunner),
            reclaimer: Arc::new(SystemPortReclaimer),
            probe: Arc::new(SystemListenerProbe),
        }
    }
}

/// Owns and sequences the worker, the control channel and the host.
pub struct Supervisor {
    config: BridgeConfig,
    cancel: CancellationToken,
    worker: Arc<WorkerSlot>,
    channel: Arc<ControlChannel>,
    host: HostSlot,
    announced_port: Arc<OnceLock<u16>>,
    services: Arc<dyn HostServices>,
    ui: UiDispatcher,
    collaborators: Collaborators,
    sequencer: ShutdownSequencer,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("channel", &self.channel)
            .field("announced_port", &self.announced_port.get())
            .field("sequencer", &self.sequencer)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// A supervisor using the real system collaborators.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Config`] if `config` is invalid.
    pub fn new(config: BridgeConfig, services: Arc<dyn HostServices>, ui: UiDispatcher) -> Result<Self> {
        Self::with_collaborators(config, services, ui, Collaborators::default())
    }

    /// # Errors
    ///
    /// [`BridgeError::Config`] if `config` is invalid.
    pub fn with_collaborators(
        config: BridgeConfig,
        services: Arc<dyn HostServices>,
        ui: UiDispatcher,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;

        let announced_port: Arc<OnceLock<u16>> = Arc::default();
        let channel = {
            let port_file = PortFile::new(config.worker.port_file_path());
            let announced = Arc::clone(&announced_port);
            let probe = Arc::clone(&collaborators.probe);
            let default_port = config.worker.default_port;
            let span = config.worker.port_scan_span;
            Arc::new(ControlChannel::new(move || {
                if let Some(port) = port_file.read() {
                    return port;
                }
                if let Some(&port) = announced.get() {
                    tracing::debug!(port, "worker port from readiness line");
                    return port;
                }
                discover_worker_port(&port_file, default_port, span, probe.as_ref())
            })?)
        };

        let cancel = CancellationToken::new();
        let worker = Arc::new(WorkerSlot::new());
        let host = HostSlot::default();
        let sequencer = ShutdownSequencer::new(
            config.shutdown.clone(),
            cancel.clone(),
            Arc::clone(&channel),
            Arc::clone(&host),
            Arc::clone(&worker),
            Arc::clone(&collaborators.reclaimer),
        );

        Ok(Self {
            config,
            cancel,
            worker,
            channel,
            host,
            announced_port,
            services,
            ui,
            collaborators,
            sequencer,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn channel(&self) -> &Arc<ControlChannel> {
        &self.channel
    }

    /// Cancelled when shutdown begins.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn worker(&self) -> Option<Arc<WorkerProcess>> {
        self.worker.get().await
    }

    pub fn host_port(&self) -> Option<u16> {
        self.host
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(ControlPlaneHost::port)
    }

    /// Runs `fut` unless shutdown begins first.
    async fn cancellable<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(BridgeError::Cancelled),
            result = fut => result,
        }
    }

    /// Brings the worker up and connects to it.
    ///
    /// The observer sees each stage, any warnings, a single failure message
    /// on error, and always [`StartupObserver::finished`].
    ///
    /// # Errors
    ///
    /// Any fatal provisioning, launch or readiness error, or
    /// [`BridgeError::Cancelled`] if shutdown began meanwhile. Host start and
    /// handshake failures are warnings only.
    pub async fn start(&self, observer: &dyn StartupObserver) -> Result<StartupReport> {
        let _finish = FinishGuard(observer);
        match self.start_inner(observer).await {
            Ok(report) => {
                tracing::info!(
                    worker_pid = ?report.worker_pid,
                    host_port = ?report.host_port,
                    handshake = ?report.handshake,
                    "startup complete"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!(error = %e, "startup failed");
                if !matches!(e, BridgeError::Cancelled) {
                    observer.failed(&format!("Could not start the assistant backend: {e}"));
                }
                Err(e)
            }
        }
    }

    async fn start_inner(&self, observer: &dyn StartupObserver) -> Result<StartupReport> {
        if self.cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        let worker_config = &self.config.worker;
        let python = discover_python(worker_config.python.as_deref(), &worker_config.backend_dir)?;
        tracing::info!(python = %python.display(), "using python interpreter");

        observer.stage(StartupStage::InstallingDependencies);
        let provisioner = DependencyProvisioner::with_runner(
            python.clone(),
            worker_config.backend_dir.clone(),
            self.config.provisioning.clone(),
            Arc::clone(&self.collaborators.runner),
        );
        let manifest = worker_config.backend_dir.join(&self.config.provisioning.manifest);
        let target = worker_config.site_packages_dir();
        let provision = self
            .cancellable(provisioner.ensure_installed(&manifest, &target))
            .await?;
        for warning in provision.warnings() {
            observer.warning(&warning);
        }

        self.ensure_not_cancelled()?;
        let host_port = self.start_host(observer).await?;

        self.ensure_not_cancelled()?;
        observer.stage(StartupStage::LaunchingWorker);
        // A stale advertisement from a previous run would point at a dead port.
        PortFile::new(worker_config.port_file_path()).remove();
        let worker = Arc::new(launch(&LaunchConfig::python_worker(&python, worker_config))?);
        if let Some(previous) = self.worker.put(Arc::clone(&worker)).await {
            tracing::warn!(pid = ?previous.pid(), "replaced an existing worker");
        }
        // The sequencer may have emptied the slot before the put above.
        if self.cancel.is_cancelled() {
            tracing::info!(pid = ?worker.pid(), "shutdown began during launch, terminating worker");
            worker.terminate(self.config.readiness.terminate_grace()).await;
            worker.transition(WorkerState::Stopped);
            return Err(BridgeError::Cancelled);
        }

        let monitor = ReadinessMonitor::new(&self.config.readiness);
        let announced_port = monitor.wait(&worker, &self.cancel).await.into_result().map_err(|e| {
            if self.cancel.is_cancelled() {
                BridgeError::Cancelled
            } else {
                e
            }
        })?;
        if let Some(port) = announced_port {
            let _ = self.announced_port.set(port);
        }

        observer.stage(StartupStage::Connecting);
        let handshake = self.handshake(observer).await;

        Ok(StartupReport {
            provision,
            worker_pid: worker.pid(),
            announced_port,
            host_port,
            handshake,
        })
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        Ok(())
    }

    /// Starts the host and parks it in the shared slot.
    ///
    /// The slot is only filled while shutdown has not begun; the sequencer
    /// cancels before it empties the slot, so a host stored here is always
    /// seen by it. A host that loses the race is stopped on the spot.
    async fn start_host(&self, observer: &dyn StartupObserver) -> Result<Option<u16>> {
        let allocator = PortAllocator::new(Arc::clone(&self.collaborators.probe));
        match ControlPlaneHost::start(Arc::clone(&self.services), self.ui.clone(), &self.config.control, &allocator)
            .await
        {
            Ok(host) => {
                let port = host.port();
                let mut slot = self.host.lock().unwrap_or_else(|e| e.into_inner());
                if self.cancel.is_cancelled() {
                    drop(slot);
                    tracing::info!(port, "shutdown began while the host was starting, stopping it");
                    host.stop();
                    return Err(BridgeError::Cancelled);
                }
                *slot = Some(host);
                Ok(Some(port))
            }
            Err(e) => {
                tracing::warn!(error = %e, "control-plane host did not start");
                observer.warning(&format!("Assistant callbacks are unavailable: {e}"));
                Ok(None)
            }
        }
    }

    async fn handshake(&self, observer: &dyn StartupObserver) -> Handshake {
        let control = &self.config.control;
        let Some(microphone) = control.microphone.as_deref().filter(|_| control.handshake_enabled) else {
            tracing::debug!("activation handshake skipped");
            return Handshake::Skipped;
        };
        let result = self
            .cancellable(self.channel.activate(microphone, control.call_timeout(), &control.handshake_retry))
            .await;
        match result {
            Ok(reply) if reply.success => {
                tracing::info!(microphone, "worker activated");
                Handshake::Activated
            }
            Ok(reply) => {
                observer.warning(&format!("The assistant did not start listening: {}", reply.message));
                Handshake::Failed(reply.message)
            }
            Err(e) => {
                observer.warning(&format!("Could not reach the assistant backend: {e}"));
                Handshake::Failed(e.to_string())
            }
        }
    }

    /// Tears everything down. Only the first call does any work.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        self.sequencer.shutdown().await
    }
}
