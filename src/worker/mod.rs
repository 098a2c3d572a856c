//! Worker process supervision.
//!
//! - [`provision`]: idempotent package installation before first launch.
//! - [`process`]: spawning, output capture and termination.
//! - [`readiness`]: waiting for the worker's "server started" line.
//! - [`ports`]: loopback port allocation, advertisement and discovery.
//! - [`reclaim`]: killing stray listeners left on worker ports.

pub mod command;
pub mod output;
pub mod ports;
pub mod process;
pub mod provision;
pub mod readiness;
pub mod reclaim;

/// Stderr lines kept for diagnostics when a worker or command fails.
pub const STDERR_TAIL_LINES: usize = 15;

pub use command::{CommandOutcome, CommandRunner, CommandSpec, SystemCommandRunner};
pub use output::OutputBuffer;
pub use ports::{ListenerProbe, PortAllocator, PortFile, SystemListenerProbe, discover_worker_port};
pub use process::{LaunchConfig, WorkerExit, WorkerProcess, WorkerSlot, WorkerState, discover_python, launch};
pub use provision::{DependencyProvisioner, InstallSummary, ProvisionReport, RequirementSplit, split_requirements};
pub use readiness::{ReadinessMonitor, ReadinessOutcome, ReadinessState};
pub use reclaim::{PortReclaimer, ReclaimReport, SystemPortReclaimer};
