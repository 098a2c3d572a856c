//! Readiness detection for a freshly launched worker.
//!
//! The worker prints a fixed line once its RPC server is listening. The
//! monitor races four things and the first to finish decides the outcome:
//!
//! - the sentinel scan of newly captured stdout, every poll tick;
//! - the worker exiting;
//! - the readiness deadline;
//! - the shared cancellation token.
//!
//! A worker that misses the deadline or is cancelled is terminated before
//! the outcome is returned, so it is never left running unobserved.

use super::STDERR_TAIL_LINES;
use super::process::{WorkerExit, WorkerProcess, WorkerState};
use crate::config::ReadinessConfig;
use crate::error::{BridgeError, Result};
use crate::retry::RetryPolicy;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Monitor states.
///
/// ```text
/// Starting → Ready | Failed | TimedOut
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    Starting,
    Ready,
    Failed,
    TimedOut,
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::TimedOut => "timed out",
        };
        f.write_str(label)
    }
}

/// Why a worker failed to become ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The process exited on its own.
    Exited,
    /// Startup was cancelled; the worker was terminated.
    Cancelled,
}

/// Terminal result of [`ReadinessMonitor::wait`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    Ready {
        /// The stdout line containing the sentinel.
        line: String,
        /// Port parsed from the end of the sentinel line, if any.
        announced_port: Option<u16>,
        elapsed: Duration,
    },
    Failed {
        reason: FailureReason,
        exit: Option<WorkerExit>,
        stderr_tail: Vec<String>,
    },
    TimedOut {
        timeout: Duration,
        /// Exit observed after terminating the worker; `None` if the kill
        /// could not be confirmed.
        exit: Option<WorkerExit>,
    },
}

impl ReadinessOutcome {
    pub fn state(&self) -> ReadinessState {
        match self {
            Self::Ready { .. } => ReadinessState::Ready,
            Self::Failed { .. } => ReadinessState::Failed,
            Self::TimedOut { .. } => ReadinessState::TimedOut,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    /// Maps non-ready outcomes onto [`BridgeError`].
    ///
    /// # Errors
    ///
    /// [`BridgeError::ReadinessProcessExited`] for `Failed`,
    /// [`BridgeError::ReadinessTimeout`] for `TimedOut`.
    pub fn into_result(self) -> Result<Option<u16>> {
        match self {
            Self::Ready { announced_port, .. } => Ok(announced_port),
            Self::Failed { exit, stderr_tail, .. } => Err(BridgeError::ReadinessProcessExited {
                exit_code: exit.and_then(|e| e.code),
                stderr_tail,
            }),
            Self::TimedOut { timeout, .. } => Err(BridgeError::ReadinessTimeout { timeout }),
        }
    }
}

/// Waits for a worker to announce readiness.
#[derive(Debug)]
pub struct ReadinessMonitor {
    sentinel: String,
    timeout: Duration,
    poll_interval: Duration,
    terminate_grace: Duration,
    state: Mutex<ReadinessState>,
}

impl ReadinessMonitor {
    pub fn new(config: &ReadinessConfig) -> Self {
        Self {
            sentinel: config.sentinel.clone(),
            timeout: config.timeout(),
            poll_interval: config.poll_interval(),
            terminate_grace: config.terminate_grace(),
            state: Mutex::new(ReadinessState::Starting),
        }
    }

    pub fn state(&self) -> ReadinessState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ReadinessState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Sentinel scans are a fixed-delay retry loop bounded by the deadline.
    fn poll_policy(&self) -> RetryPolicy {
        let ticks = self.timeout.as_millis() / self.poll_interval.as_millis().max(1);
        let attempts = u32::try_from(ticks).unwrap_or(u32::MAX).saturating_add(2);
        RetryPolicy::fixed(attempts, self.poll_interval)
    }

    /// Races sentinel, exit, deadline and cancellation.
    pub async fn wait(&self, worker: &WorkerProcess, cancel: &CancellationToken) -> ReadinessOutcome {
        let started = Instant::now();
        self.set_state(ReadinessState::Starting);
        tracing::info!(
            worker = %worker.name(),
            timeout_secs = self.timeout.as_secs(),
            "waiting for worker readiness"
        );

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::info!(worker = %worker.name(), "readiness wait cancelled, terminating worker");
                let exit = worker.terminate(self.terminate_grace).await;
                ReadinessOutcome::Failed {
                    reason: FailureReason::Cancelled,
                    exit,
                    stderr_tail: worker.stderr_tail(STDERR_TAIL_LINES),
                }
            }
            Some(line) = self.scan_for_sentinel(worker) => ReadinessOutcome::Ready {
                announced_port: parse_announced_port(&line),
                line,
                elapsed: started.elapsed(),
            },
            exit = worker.wait_exit() => {
                // The exit is published before the readers finish.
                worker.wait_output_drained().await;
                ReadinessOutcome::Failed {
                    reason: FailureReason::Exited,
                    exit: Some(exit),
                    stderr_tail: worker.stderr_tail(STDERR_TAIL_LINES),
                }
            }
            () = tokio::time::sleep(self.timeout) => {
                tracing::warn!(worker = %worker.name(), timeout_secs = self.timeout.as_secs(), "worker missed readiness deadline, terminating");
                let exit = worker.terminate(self.terminate_grace).await;
                if exit.is_none() {
                    tracing::error!(worker = %worker.name(), "could not confirm worker exit after timeout");
                }
                ReadinessOutcome::TimedOut { timeout: self.timeout, exit }
            }
        };

        match &outcome {
            ReadinessOutcome::Ready { elapsed, .. } => {
                worker.transition(WorkerState::Running);
                tracing::info!(worker = %worker.name(), elapsed_ms = elapsed.as_millis() as u64, "worker ready");
            }
            ReadinessOutcome::Failed { reason, exit, stderr_tail } => {
                worker.transition(WorkerState::Failed);
                tracing::error!(
                    worker = %worker.name(),
                    reason = ?reason,
                    exit = ?exit,
                    "worker failed before becoming ready"
                );
                for line in stderr_tail {
                    tracing::error!(worker = %worker.name(), "stderr: {line}");
                }
            }
            ReadinessOutcome::TimedOut { .. } => {
                worker.transition(WorkerState::Failed);
            }
        }
        self.set_state(outcome.state());
        outcome
    }

    /// Resolves with the first stdout line containing the sentinel. Pends
    /// forever (letting another branch win) once the poll budget is spent.
    async fn scan_for_sentinel(&self, worker: &WorkerProcess) -> Option<String> {
        let stdout = worker.stdout();
        let cursor = std::sync::atomic::AtomicU64::new(0);
        let found = self
            .poll_policy()
            .run(
                |_| {
                    let (lines, next) = stdout.lines_since(cursor.load(std::sync::atomic::Ordering::Relaxed));
                    cursor.store(next, std::sync::atomic::Ordering::Relaxed);
                    let hit = lines.into_iter().find(|l| l.contains(&self.sentinel));
                    std::future::ready(hit.ok_or(()))
                },
                |_| true,
            )
            .await;
        match found {
            Ok(line) => Some(line),
            Err(()) => std::future::pending().await,
        }
    }
}

/// Trailing port number on a line like `gRPC server started on port 50051`.
pub fn parse_announced_port(line: &str) -> Option<u16> {
    line.split_whitespace()
        .last()
        .map(|tok| tok.trim_matches(|c: char| !c.is_ascii_digit()))
        .and_then(|digits| digits.parse().ok())
        .filter(|&port| port != 0)
}
