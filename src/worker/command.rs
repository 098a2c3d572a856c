//! Bounded external commands.
//!
//! Provisioning shells out to the package manager through [`CommandRunner`]
//! so tests can substitute a scripted runner.

use super::STDERR_TAIL_LINES;
use super::process::{LaunchConfig, WorkerExit, launch};
use crate::error::Result;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

/// Time allowed for a killed command to be reaped.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// A command to run to completion with a deadline.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Short name for logs ("pip check", "essential install", ...).
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
    /// Extra environment; the parent environment is inherited.
    pub env: Vec<(OsString, OsString)>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(label: &str, program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            label: label.to_owned(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout,
        }
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

    /// Arguments rendered for logs.
    pub fn display_args(&self) -> String {
        self.args
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a finished (or abandoned) command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Exit code; `None` if killed or timed out.
    pub exit_code: Option<i32>,
    /// The deadline elapsed and the command was killed.
    pub timed_out: bool,
    /// Last stderr lines, oldest first.
    pub stderr_tail: Vec<String>,
}

impl CommandOutcome {
    /// A clean zero exit.
    pub fn succeeded() -> Self {
        Self {
            exit_code: Some(0),
            timed_out: false,
            stderr_tail: Vec::new(),
        }
    }

    /// A non-zero exit with the given stderr.
    pub fn failed(exit_code: i32, stderr_tail: Vec<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            timed_out: false,
            stderr_tail,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            exit_code: None,
            timed_out: true,
            stderr_tail: Vec::new(),
        }
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// One-line description for logs and error messages.
    pub fn describe(&self) -> String {
        let status = if self.timed_out {
            "timed out".to_owned()
        } else {
            match self.exit_code {
                Some(code) => format!("exit code {code}"),
                None => "terminated".to_owned(),
            }
        };
        match self.stderr_tail.last() {
            Some(last) => format!("{status}: {last}"),
            None => status,
        }
    }
}

/// Runs external commands to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `spec`. A non-zero exit or timeout is reported in the outcome;
    /// only failure to start the command is an error.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome>;
}

/// Runs commands as real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome> {
        let mut config = LaunchConfig::new(&spec.label, &spec.program).args(spec.args.iter().cloned());
        if let Some(dir) = &spec.working_dir {
            config = config.current_dir(dir);
        }
        for (key, value) in &spec.env {
            config = config.env(key, value);
        }

        tracing::debug!(
            label = %spec.label,
            program = %spec.program.display(),
            args = %spec.display_args(),
            timeout_secs = spec.timeout.as_secs(),
            "running command"
        );
        let process = launch(&config)?;

        let (exit, timed_out) = match process.wait_exit_timeout(spec.timeout).await {
            Some(exit) => (exit, false),
            None => {
                tracing::warn!(label = %spec.label, timeout_secs = spec.timeout.as_secs(), "command timed out, killing");
                process.force_kill();
                let exit = process
                    .wait_exit_timeout(KILL_REAP_TIMEOUT)
                    .await
                    .unwrap_or(WorkerExit::UNKNOWN);
                (exit, true)
            }
        };

        process.wait_output_drained().await;
        let outcome = CommandOutcome {
            exit_code: if timed_out { None } else { exit.code },
            timed_out,
            stderr_tail: process.stderr_tail(STDERR_TAIL_LINES),
        };
        if !outcome.success() {
            for line in &outcome.stderr_tail {
                tracing::warn!(label = %spec.label, "stderr: {line}");
            }
        }
        Ok(outcome)
    }
}
