//! Configuration types for the worker supervisor and control plane.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Worker launch settings.
    pub worker: WorkerConfig,
    /// Dependency provisioning settings.
    pub provisioning: ProvisioningConfig,
    /// Readiness detection settings.
    pub readiness: ReadinessConfig,
    /// Control-plane (RPC) settings.
    pub control: ControlConfig,
    /// Shutdown sequencing settings.
    pub shutdown: ShutdownConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Worker process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Directory holding the worker script, its manifest and port file.
    pub backend_dir: PathBuf,
    /// Worker entry script, relative to `backend_dir`.
    pub script: String,
    /// Explicit Python interpreter. Discovered when unset.
    pub python: Option<PathBuf>,
    /// Package target directory. Defaults to `backend_dir/site-packages`.
    pub site_packages: Option<PathBuf>,
    /// Name of the file the worker writes its port into.
    pub port_file: String,
    /// Port assumed when the worker never advertises one.
    pub default_port: u16,
    /// Number of ports (from `default_port`) scanned for a listener when the
    /// port file is missing.
    pub port_scan_span: u16,
    /// Stdout lines retained in memory.
    pub stdout_capacity: usize,
    /// Stderr lines retained in memory.
    pub stderr_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            backend_dir: PathBuf::from("backend"),
            script: "main.py".to_owned(),
            python: None,
            site_packages: None,
            port_file: "server_port.txt".to_owned(),
            default_port: 50051,
            port_scan_span: 10,
            stdout_capacity: 500,
            stderr_capacity: 200,
        }
    }
}

impl WorkerConfig {
    /// Resolved package target directory.
    pub fn site_packages_dir(&self) -> PathBuf {
        self.site_packages
            .clone()
            .unwrap_or_else(|| self.backend_dir.join("site-packages"))
    }

    /// Full path of the worker's port advertisement file.
    pub fn port_file_path(&self) -> PathBuf {
        self.backend_dir.join(&self.port_file)
    }

    /// Full path of the worker entry script.
    pub fn script_path(&self) -> PathBuf {
        self.backend_dir.join(&self.script)
    }
}

/// Dependency provisioning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Requirements manifest, relative to the backend directory.
    pub manifest: String,
    /// Package-name prefixes routed to the optional tier.
    pub heavy_prefixes: Vec<String>,
    /// Extra index used for the optional tier.
    pub torch_index_url: String,
    /// Where to download the pip bootstrap script from.
    pub get_pip_url: String,
    /// Timeout for `pip --version`.
    pub check_timeout_secs: u64,
    /// Timeout for the pip bootstrap and pip self-upgrade.
    pub bootstrap_timeout_secs: u64,
    /// Timeout for each tier install.
    pub install_timeout_secs: u64,
    /// Retry policy for the optional tier.
    pub optional_retry: RetryPolicy,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            manifest: "requirements.txt".to_owned(),
            heavy_prefixes: ["torch", "torchvision", "torchaudio", "whisper", "openai-whisper"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            torch_index_url: "https://download.pytorch.org/whl/cu118".to_owned(),
            get_pip_url: "https://bootstrap.pypa.io/get-pip.py".to_owned(),
            check_timeout_secs: 15,
            bootstrap_timeout_secs: 600,
            install_timeout_secs: 1800,
            optional_retry: RetryPolicy::fixed(3, Duration::from_secs(5)),
        }
    }
}

impl ProvisioningConfig {
    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }
}

/// Readiness detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Stdout substring that marks the worker ready.
    pub sentinel: String,
    /// Overall readiness window.
    pub timeout_secs: u64,
    /// Interval between sentinel scans.
    pub poll_interval_ms: u64,
    /// Grace period between polite and forced termination of a worker
    /// that missed its window.
    pub terminate_grace_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            sentinel: "gRPC server started on port".to_owned(),
            timeout_secs: 60,
            poll_interval_ms: 500,
            terminate_grace_ms: 2_000,
        }
    }
}

impl ReadinessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

/// Control-plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// First port tried for the host endpoint.
    pub host_port_start: u16,
    /// Last port tried for the host endpoint.
    pub host_port_end: u16,
    /// Where the host advertises its port. Defaults to the data dir.
    pub host_port_file: Option<PathBuf>,
    /// Per-call deadline for controller-to-worker calls.
    pub call_timeout_secs: u64,
    /// Whether to send the activation handshake after readiness.
    pub handshake_enabled: bool,
    /// Microphone identifier passed in the activation handshake. The
    /// handshake is skipped when unset.
    pub microphone: Option<String>,
    /// Retry policy for the activation handshake.
    pub handshake_retry: RetryPolicy,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            host_port_start: 60051,
            host_port_end: 61000,
            host_port_file: None,
            call_timeout_secs: 10,
            handshake_enabled: true,
            microphone: None,
            handshake_retry: RetryPolicy::linear(3, Duration::from_millis(2_000)),
        }
    }
}

impl ControlConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Resolved host port advertisement file.
    pub fn host_port_file_path(&self) -> PathBuf {
        self.host_port_file
            .clone()
            .unwrap_or_else(crate::alex_dirs::host_port_file)
    }
}

/// Shutdown sequencing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Bound on the deactivation notice sent to the worker.
    pub notify_timeout_ms: u64,
    /// Pause after the notice so the worker can wind down.
    pub grace_delay_ms: u64,
    /// How long to wait for the worker to exit on its own.
    pub exit_wait_ms: u64,
    /// How long to wait after a forced kill.
    pub kill_wait_ms: u64,
    /// Whether to kill stray listeners in the worker port range.
    pub reclaim_ports: bool,
    /// First port of the reclaim range.
    pub reclaim_port_start: u16,
    /// Last port of the reclaim range (inclusive).
    pub reclaim_port_end: u16,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            notify_timeout_ms: 5_000,
            grace_delay_ms: 1_500,
            exit_wait_ms: 2_000,
            kill_wait_ms: 1_000,
            reclaim_ports: true,
            reclaim_port_start: 50051,
            reclaim_port_end: 50060,
        }
    }
}

impl ShutdownConfig {
    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }

    pub fn grace_delay(&self) -> Duration {
        Duration::from_millis(self.grace_delay_ms)
    }

    pub fn exit_wait(&self) -> Duration {
        Duration::from_millis(self.exit_wait_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub filter: String,
    /// Also write a daily rolling log file.
    pub file_enabled: bool,
    /// Log directory. Defaults to `alex_dirs::logs_dir()`.
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "alex=info".to_owned(),
            file_enabled: true,
            log_dir: None,
        }
    }
}

impl LoggingConfig {
    pub fn log_dir_path(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(crate::alex_dirs::logs_dir)
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::BridgeError::Config(e.to_string()))
    }

    /// Load from `path` if it exists, otherwise return defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &std::path::Path) -> crate::error::Result<Self> {
        if path.is_file() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::BridgeError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `config_dir()/config.toml`.
    pub fn default_config_path() -> PathBuf {
        crate::alex_dirs::config_dir().join("config.toml")
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`](crate::error::BridgeError::Config)
    /// naming the first invalid field.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::BridgeError;
        if self.control.host_port_start > self.control.host_port_end {
            return Err(BridgeError::Config(format!(
                "control.host_port_start ({}) is above control.host_port_end ({})",
                self.control.host_port_start, self.control.host_port_end
            )));
        }
        if self.shutdown.reclaim_port_start > self.shutdown.reclaim_port_end {
            return Err(BridgeError::Config(format!(
                "shutdown.reclaim_port_start ({}) is above shutdown.reclaim_port_end ({})",
                self.shutdown.reclaim_port_start, self.shutdown.reclaim_port_end
            )));
        }
        if self.readiness.sentinel.trim().is_empty() {
            return Err(BridgeError::Config(
                "readiness.sentinel must not be empty".to_owned(),
            ));
        }
        for (field, policy) in [
            ("provisioning.optional_retry", &self.provisioning.optional_retry),
            ("control.handshake_retry", &self.control.handshake_retry),
        ] {
            if policy.base_delay_ms == 0 {
                return Err(BridgeError::Config(format!(
                    "{field}.base_delay_ms must be positive"
                )));
            }
        }
        if self.worker.stderr_capacity < crate::worker::STDERR_TAIL_LINES {
            return Err(BridgeError::Config(format!(
                "worker.stderr_capacity must be at least {}",
                crate::worker::STDERR_TAIL_LINES
            )));
        }
        Ok(())
    }
}
