//! Forced cleanup of processes still listening on worker ports.
//!
//! A worker that crashed or ignored shutdown can leave an orphaned listener
//! behind, which would make the next launch fail to bind. Shutdown sweeps
//! the worker port range and kills whatever still holds it, never this
//! process.

use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::time::Duration;

/// Bound on each listing or kill command.
const TOOL_TIMEOUT: Duration = Duration::from_secs(5);

/// What a sweep killed and what went wrong.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReclaimReport {
    /// `(port, pid)` pairs that were killed.
    pub killed: Vec<(u16, u32)>,
    /// Per-port or per-pid failures.
    pub errors: Vec<String>,
}

impl ReclaimReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Finds and kills listeners on loopback ports.
#[async_trait]
pub trait PortReclaimer: Send + Sync {
    /// Pids holding a listening socket on `port`.
    async fn listener_pids(&self, port: u16) -> Result<Vec<u32>>;

    /// Forcibly terminates `pid`.
    async fn kill_pid(&self, pid: u32) -> Result<()>;

    /// Kills every listener on `start..=end` except the current process.
    async fn reclaim(&self, start: u16, end: u16) -> ReclaimReport {
        let own_pid = std::process::id();
        let mut report = ReclaimReport::default();
        for port in start..=end {
            let pids = match self.listener_pids(port).await {
                Ok(pids) => pids,
                Err(e) => {
                    report.errors.push(format!("port {port}: {e}"));
                    continue;
                }
            };
            for pid in pids.into_iter().filter(|&p| p != own_pid && p != 0) {
                tracing::info!(port, pid, "killing stray listener");
                match self.kill_pid(pid).await {
                    Ok(()) => report.killed.push((port, pid)),
                    Err(e) => report.errors.push(format!("pid {pid} on port {port}: {e}")),
                }
            }
        }
        report
    }
}

/// Uses `lsof` and `kill(2)` on unix, `netstat` and `taskkill` on Windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortReclaimer;

#[async_trait]
impl PortReclaimer for SystemPortReclaimer {
    async fn listener_pids(&self, port: u16) -> Result<Vec<u32>> {
        if cfg!(windows) {
            let out = run_tool("netstat", &["-ano", "-p", "TCP"]).await?;
            Ok(parse_netstat_pids(&out, port))
        } else {
            let port_arg = format!("-iTCP:{port}");
            let out = run_tool("lsof", &["-nP", "-t", &port_arg, "-sTCP:LISTEN"]).await?;
            Ok(parse_lsof_pids(&out))
        }
    }

    async fn kill_pid(&self, pid: u32) -> Result<()> {
        force_kill_pid(pid).await
    }
}

#[cfg(unix)]
async fn force_kill_pid(pid: u32) -> Result<()> {
    let raw = libc::pid_t::try_from(pid)
        .map_err(|_| BridgeError::Io(std::io::Error::other(format!("pid {pid} out of range"))))?;
    // SAFETY: signal delivery only; no memory is shared with the target.
    if unsafe { libc::kill(raw, libc::SIGKILL) } != 0 {
        return Err(BridgeError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
async fn force_kill_pid(pid: u32) -> Result<()> {
    run_tool("taskkill", &["/F", "/PID", &pid.to_string()]).await?;
    Ok(())
}

async fn run_tool(program: &str, args: &[&str]) -> Result<String> {
    let output = tokio::time::timeout(
        TOOL_TIMEOUT,
        tokio::process::Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| BridgeError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, format!("{program} timed out"))))?
    .map_err(|source| BridgeError::LaunchFailed {
        program: program.to_owned(),
        source,
    })?;
    // lsof exits 1 when nothing matches; only the output matters.
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parses `lsof -t` output: one pid per line.
pub fn parse_lsof_pids(output: &str) -> Vec<u32> {
    let pids: BTreeSet<u32> = output
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect();
    pids.into_iter().collect()
}

/// Parses `netstat -ano` output for sockets listening on `port`.
pub fn parse_netstat_pids(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{port}");
    let pids: BTreeSet<u32> = output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            // Proto  Local  Foreign  State  PID
            if cols.len() < 5 || !cols[3].eq_ignore_ascii_case("LISTENING") {
                return None;
            }
            if !cols[1].ends_with(&suffix) {
                return None;
            }
            cols[4].parse().ok()
        })
        .collect();
    pids.into_iter().collect()
}
