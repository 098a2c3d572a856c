//! Error types for the worker supervisor and control plane.

use std::time::Duration;

/// Top-level error type for provisioning, launch, readiness and RPC.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The worker process could not be created at all.
    #[error("failed to launch worker `{program}`: {source}")]
    LaunchFailed {
        /// Program that was being spawned.
        program: String,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The package manager was absent and could not be bootstrapped.
    #[error("package manager bootstrap failed: {reason}")]
    BootstrapFailed {
        /// Why the bootstrap step failed.
        reason: String,
    },

    /// The requirements manifest could not be read.
    #[error("cannot read requirements manifest {path}: {reason}")]
    ManifestUnreadable {
        /// Manifest path.
        path: String,
        /// Read error detail.
        reason: String,
    },

    /// The essential package tier failed to install.
    #[error("essential package install failed: {reason}")]
    EssentialInstallFailed {
        /// Summary of the failed install, including recent stderr.
        reason: String,
    },

    /// The optional package tier failed after every retry.
    ///
    /// Never returned from provisioning; carried in the report as a warning.
    #[error("optional package install failed after {attempts} attempt(s)")]
    OptionalInstallFailed {
        /// Number of attempts made.
        attempts: u32,
    },

    /// The worker did not print its readiness sentinel in time.
    #[error("worker did not become ready within {}s", .timeout.as_secs())]
    ReadinessTimeout {
        /// The readiness window that elapsed.
        timeout: Duration,
    },

    /// The worker exited (or was cancelled) before becoming ready.
    #[error("worker exited before becoming ready (exit code: {exit_code:?}){}", format_tail(.stderr_tail))]
    ReadinessProcessExited {
        /// Exit code, if the process reported one.
        exit_code: Option<i32>,
        /// Last captured stderr lines.
        stderr_tail: Vec<String>,
    },

    /// The RPC endpoint could not be reached.
    #[error("control endpoint unavailable ({method}): {reason}")]
    RpcUnavailable {
        /// Method being called.
        method: String,
        /// Transport detail.
        reason: String,
    },

    /// The RPC did not complete before its deadline.
    #[error("control call `{method}` exceeded its {}ms deadline", .deadline.as_millis())]
    RpcDeadlineExceeded {
        /// Method being called.
        method: String,
        /// The per-call deadline.
        deadline: Duration,
    },

    /// The RPC endpoint answered with a non-success status.
    #[error("control call `{method}` failed with status {status}: {message}")]
    RpcFailed {
        /// Method being called.
        method: String,
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The RPC response could not be decoded.
    #[error("control call `{method}` returned a malformed response: {reason}")]
    RpcProtocol {
        /// Method being called.
        method: String,
        /// Decode error detail.
        reason: String,
    },

    /// A call was attempted on a channel that has been disposed.
    #[error("control channel has been disposed")]
    ChannelDisposed,

    /// No free port was found in the requested range.
    #[error("no available ports found in range {start}-{end}")]
    ExhaustedRange {
        /// First port tried.
        start: u16,
        /// Last port tried.
        end: u16,
    },

    /// Startup was abandoned because shutdown was requested.
    #[error("startup cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Returns `true` for transient connectivity failures that a bounded
    /// retry may recover from.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RpcUnavailable { .. } | Self::RpcDeadlineExceeded { .. }
        )
    }

    /// Returns `true` for errors that abort the startup sequence.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::LaunchFailed { .. }
                | Self::BootstrapFailed { .. }
                | Self::ManifestUnreadable { .. }
                | Self::EssentialInstallFailed { .. }
                | Self::ReadinessTimeout { .. }
                | Self::ReadinessProcessExited { .. }
                | Self::ExhaustedRange { .. }
                | Self::Config(_)
        )
    }
}

fn format_tail(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!("\nlast stderr lines:\n{}", lines.join("\n"))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, BridgeError>;
