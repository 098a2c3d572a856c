//! Ordered, idempotent teardown of the worker and the control plane.
//!
//! The sequence runs at most once per process. Every step is isolated: a
//! failing step is logged and recorded, and the next one still runs.

use crate::config::ShutdownConfig;
use crate::control::{ControlChannel, ControlPlaneHost};
use crate::worker::{PortReclaimer, ReclaimReport, WorkerSlot, WorkerState};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Shared home of the running control-plane host.
pub type HostSlot = Arc<Mutex<Option<ControlPlaneHost>>>;

/// Teardown steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    /// Cancel in-flight startup and background work.
    Cancel,
    /// Tell the worker to stop listening.
    NotifyWorker,
    /// Give the worker time to wind down.
    GraceDelay,
    /// Dispose the channel and stop the host.
    CloseControlPlane,
    /// Wait for the worker, then force kill it.
    StopWorker,
    /// Drop the process handle.
    ReleaseWorker,
    /// Kill stray listeners on worker ports.
    ReclaimPorts,
}

impl fmt::Display for ShutdownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Cancel => "cancel",
            Self::NotifyWorker => "notify worker",
            Self::GraceDelay => "grace delay",
            Self::CloseControlPlane => "close control plane",
            Self::StopWorker => "stop worker",
            Self::ReleaseWorker => "release worker",
            Self::ReclaimPorts => "reclaim ports",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    Skipped(&'static str),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub step: ShutdownStep,
    pub outcome: StepOutcome,
}

/// Per-step results of one shutdown run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub steps: Vec<StepRecord>,
    /// Listeners killed during port reclamation.
    pub reclaimed: ReclaimReport,
}

impl ShutdownReport {
    pub fn outcome(&self, step: ShutdownStep) -> Option<&StepOutcome> {
        self.steps.iter().find(|r| r.step == step).map(|r| &r.outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps
            .iter()
            .filter(|r| matches!(r.outcome, StepOutcome::Failed(_)))
    }

    fn record(&mut self, step: ShutdownStep, outcome: StepOutcome) {
        match &outcome {
            StepOutcome::Done => tracing::debug!(%step, "shutdown step done"),
            StepOutcome::Skipped(why) => tracing::debug!(%step, reason = why, "shutdown step skipped"),
            StepOutcome::Failed(e) => tracing::warn!(%step, error = %e, "shutdown step failed"),
        }
        self.steps.push(StepRecord { step, outcome });
    }
}

#[derive(Debug)]
pub enum ShutdownOutcome {
    /// This call ran the sequence.
    Completed(ShutdownReport),
    /// Shutdown had already been requested; nothing was done.
    AlreadyRequested,
}

impl ShutdownOutcome {
    pub fn report(&self) -> Option<&ShutdownReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::AlreadyRequested => None,
        }
    }
}

/// Runs the teardown once.
pub struct ShutdownSequencer {
    config: ShutdownConfig,
    requested: AtomicBool,
    cancel: CancellationToken,
    channel: Arc<ControlChannel>,
    host: HostSlot,
    worker: Arc<WorkerSlot>,
    reclaimer: Arc<dyn PortReclaimer>,
}

impl fmt::Debug for ShutdownSequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownSequencer")
            .field("config", &self.config)
            .field("requested", &self.is_requested())
            .finish_non_exhaustive()
    }
}

impl ShutdownSequencer {
    pub fn new(
        config: ShutdownConfig,
        cancel: CancellationToken,
        channel: Arc<ControlChannel>,
        host: HostSlot,
        worker: Arc<WorkerSlot>,
        reclaimer: Arc<dyn PortReclaimer>,
    ) -> Self {
        Self {
            config,
            requested: AtomicBool::new(false),
            cancel,
            channel,
            host,
            worker,
            reclaimer,
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Runs the teardown. Only the first call, concurrent or not, does any
    /// work; later calls return [`ShutdownOutcome::AlreadyRequested`].
    pub async fn shutdown(&self) -> ShutdownOutcome {
        if self.requested.swap(true, Ordering::SeqCst) {
            tracing::debug!("shutdown already requested");
            return ShutdownOutcome::AlreadyRequested;
        }
        tracing::info!("shutdown started");
        let mut report = ShutdownReport::default();

        self.cancel.cancel();
        report.record(ShutdownStep::Cancel, StepOutcome::Done);

        let notified = self.notify_worker().await;
        let grace = match &notified {
            StepOutcome::Skipped(_) => StepOutcome::Skipped("worker was not notified"),
            _ => {
                tokio::time::sleep(self.config.grace_delay()).await;
                StepOutcome::Done
            }
        };
        report.record(ShutdownStep::NotifyWorker, notified);
        report.record(ShutdownStep::GraceDelay, grace);

        report.record(ShutdownStep::CloseControlPlane, self.close_control_plane());

        let worker = self.worker.take().await;
        report.record(ShutdownStep::StopWorker, self.stop_worker(worker.as_deref()).await);
        let released = if worker.is_some() {
            StepOutcome::Done
        } else {
            StepOutcome::Skipped("no worker")
        };
        drop(worker);
        report.record(ShutdownStep::ReleaseWorker, released);

        let reclaimed = if self.config.reclaim_ports {
            let sweep = self
                .reclaimer
                .reclaim(self.config.reclaim_port_start, self.config.reclaim_port_end)
                .await;
            let outcome = if sweep.is_clean() {
                StepOutcome::Done
            } else {
                StepOutcome::Failed(sweep.errors.join("; "))
            };
            report.reclaimed = sweep;
            outcome
        } else {
            StepOutcome::Skipped("disabled")
        };
        report.record(ShutdownStep::ReclaimPorts, reclaimed);

        tracing::info!(
            failed_steps = report.failures().count(),
            reclaimed = report.reclaimed.killed.len(),
            "shutdown complete"
        );
        ShutdownOutcome::Completed(report)
    }

    async fn notify_worker(&self) -> StepOutcome {
        if self.channel.is_disposed() {
            return StepOutcome::Skipped("channel disposed");
        }
        let running = match self.worker.get().await {
            Some(worker) => !worker.has_exited(),
            None => false,
        };
        if !running {
            return StepOutcome::Skipped("no running worker");
        }
        let timeout = self.config.notify_timeout();
        let call = self.channel.set_active(false, None, timeout);
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(reply)) if reply.success => StepOutcome::Done,
            Ok(Ok(reply)) => StepOutcome::Failed(format!("worker declined: {}", reply.message)),
            Ok(Err(e)) => StepOutcome::Failed(e.to_string()),
            Err(_) => StepOutcome::Failed(format!("no reply within {}ms", timeout.as_millis())),
        }
    }

    fn close_control_plane(&self) -> StepOutcome {
        self.channel.dispose();
        let host = self.host.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(host) = host {
            host.stop();
        }
        StepOutcome::Done
    }

    async fn stop_worker(&self, worker: Option<&crate::worker::WorkerProcess>) -> StepOutcome {
        let Some(worker) = worker else {
            return StepOutcome::Skipped("no worker");
        };
        if worker.wait_exit_timeout(self.config.exit_wait()).await.is_none() {
            tracing::info!(worker = worker.name(), pid = ?worker.pid(), "worker still running, killing");
            worker.force_kill();
            if worker.wait_exit_timeout(self.config.kill_wait()).await.is_none() {
                return StepOutcome::Failed(format!("worker {} did not exit after kill", worker.name()));
            }
        }
        if !worker.state().is_terminal() {
            worker.transition(WorkerState::Stopped);
        }
        StepOutcome::Done
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::worker::reclaim::tests::FakeReclaimer;
    use crate::worker::{LaunchConfig, launch};
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    fn fast_config() -> ShutdownConfig {
        ShutdownConfig {
            notify_timeout_ms: 300,
            grace_delay_ms: 10,
            exit_wait_ms: 100,
            kill_wait_ms: 2_000,
            ..ShutdownConfig::default()
        }
    }

    fn refused_port() -> u16 {
        let l = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        l.local_addr().unwrap().port()
    }

    fn sequencer(
        config: ShutdownConfig,
        worker: Arc<WorkerSlot>,
        reclaimer: Arc<FakeReclaimer>,
    ) -> (ShutdownSequencer, CancellationToken, Arc<ControlChannel>) {
        let cancel = CancellationToken::new();
        let channel = Arc::new(ControlChannel::with_port(refused_port()).unwrap());
        let seq = ShutdownSequencer::new(
            config,
            cancel.clone(),
            Arc::clone(&channel),
            HostSlot::default(),
            worker,
            reclaimer,
        );
        (seq, cancel, channel)
    }

    #[tokio::test]
    async fn concurrent_second_call_is_a_noop() {
        let reclaimer = Arc::new(FakeReclaimer {
            table: HashMap::from([(50052, vec![4_000_001])]),
            ..FakeReclaimer::default()
        });
        let (seq, cancel, _) = sequencer(fast_config(), Arc::new(WorkerSlot::new()), Arc::clone(&reclaimer));

        let (a, b) = tokio::join!(seq.shutdown(), seq.shutdown());
        let completed = [&a, &b]
            .iter()
            .filter(|o| matches!(o, ShutdownOutcome::Completed(_)))
            .count();
        assert_eq!(completed, 1);
        assert!(cancel.is_cancelled());
        assert!(matches!(seq.shutdown().await, ShutdownOutcome::AlreadyRequested));
        // Reclamation ran exactly once.
        assert_eq!(*reclaimer.killed.lock().unwrap(), vec![4_000_001]);
    }

    #[tokio::test]
    async fn without_worker_steps_are_skipped() {
        let config = ShutdownConfig {
            reclaim_ports: false,
            ..fast_config()
        };
        let (seq, _, channel) = sequencer(config, Arc::new(WorkerSlot::new()), Arc::default());
        let outcome = seq.shutdown().await;
        let report = outcome.report().unwrap();
        assert_eq!(report.steps.len(), 7);
        assert_eq!(report.outcome(ShutdownStep::NotifyWorker), Some(&StepOutcome::Skipped("no running worker")));
        assert!(matches!(report.outcome(ShutdownStep::GraceDelay), Some(StepOutcome::Skipped(_))));
        assert_eq!(report.outcome(ShutdownStep::CloseControlPlane), Some(&StepOutcome::Done));
        assert!(matches!(report.outcome(ShutdownStep::StopWorker), Some(StepOutcome::Skipped(_))));
        assert_eq!(report.outcome(ShutdownStep::ReclaimPorts), Some(&StepOutcome::Skipped("disabled")));
        assert!(channel.is_disposed());
    }

    #[tokio::test]
    async fn failing_notify_does_not_stop_the_sequence() {
        let worker = Arc::new(launch(&LaunchConfig::new("stubborn", "sh").args(["-c", "sleep 30"])).unwrap());
        let slot = Arc::new(WorkerSlot::new());
        slot.put(Arc::clone(&worker)).await;
        let (seq, _, channel) = sequencer(fast_config(), Arc::clone(&slot), Arc::default());

        let started = Instant::now();
        let outcome = seq.shutdown().await;
        let report = outcome.report().unwrap();

        assert!(matches!(report.outcome(ShutdownStep::NotifyWorker), Some(StepOutcome::Failed(_))));
        assert_eq!(report.outcome(ShutdownStep::GraceDelay), Some(&StepOutcome::Done));
        assert_eq!(report.outcome(ShutdownStep::StopWorker), Some(&StepOutcome::Done));
        assert_eq!(report.outcome(ShutdownStep::ReleaseWorker), Some(&StepOutcome::Done));
        let order: Vec<_> = report.steps.iter().map(|r| r.step).collect();
        assert_eq!(
            order,
            vec![
                ShutdownStep::Cancel,
                ShutdownStep::NotifyWorker,
                ShutdownStep::GraceDelay,
                ShutdownStep::CloseControlPlane,
                ShutdownStep::StopWorker,
                ShutdownStep::ReleaseWorker,
                ShutdownStep::ReclaimPorts,
            ]
        );

        assert!(worker.has_exited());
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(slot.is_empty().await);
        assert!(channel.is_disposed());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn worker_that_exits_on_its_own_is_not_killed() {
        let worker = Arc::new(launch(&LaunchConfig::new("polite", "sh").args(["-c", "exit 0"])).unwrap());
        worker.wait_exit().await;
        let slot = Arc::new(WorkerSlot::new());
        slot.put(Arc::clone(&worker)).await;
        let (seq, _, _) = sequencer(fast_config(), slot, Arc::default());

        let outcome = seq.shutdown().await;
        let report = outcome.report().unwrap();
        assert_eq!(report.outcome(ShutdownStep::NotifyWorker), Some(&StepOutcome::Skipped("no running worker")));
        assert_eq!(report.outcome(ShutdownStep::StopWorker), Some(&StepOutcome::Done));
        assert_eq!(worker.exit().map(|e| e.code), Some(Some(0)));
    }
}
