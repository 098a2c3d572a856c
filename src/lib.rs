//! Alex: worker supervisor and control-plane bridge.
//!
//! The desktop assistant's speech and language work runs in a separately
//! versioned Python worker. This crate keeps that worker alive and talking:
//!
//! - **Provisioning**: installs the worker's packages once, in two tiers
//! - **Launch**: spawns the worker and captures its output line by line
//! - **Readiness**: waits for the worker's "server started" line, its exit,
//!   a deadline, or cancellation, whichever comes first
//! - **Control plane**: JSON over loopback HTTP in both directions
//! - **Shutdown**: a fixed, idempotent teardown sequence
//!
//! [`Supervisor`] wires these together.

pub mod alex_dirs;
pub mod config;
pub mod control;
pub mod error;
pub mod logging;
pub mod retry;
pub mod shutdown;
pub mod startup;
pub mod worker;

pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use retry::RetryPolicy;
pub use shutdown::{ShutdownOutcome, ShutdownReport, ShutdownSequencer};
pub use startup::{LoggingObserver, StartupObserver, StartupReport, StartupStage, Supervisor};
