//! Idempotent installation of the worker's Python packages.
//!
//! The pipeline is:
//!
//! 1. skip everything if the marker file is present;
//! 2. read and split the requirements manifest into an essential tier and an
//!    optional tier of heavy packages;
//! 3. make sure `pip` exists, bootstrapping it from `get-pip.py` if not;
//! 4. upgrade `pip` (best effort);
//! 5. install the essential tier (failure is fatal);
//! 6. install the optional tier with retries (failure is a warning);
//! 7. write the marker.
//!
//! Packages are installed with `--target` into the site-packages directory
//! that the worker later gets on `PYTHONPATH`.

use super::command::{CommandOutcome, CommandRunner, CommandSpec, SystemCommandRunner};
use crate::config::ProvisioningConfig;
use crate::error::{BridgeError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Presence-only marker written after a successful install.
pub const MARKER_FILE: &str = ".dependencies_installed";

const GET_PIP_FILE: &str = "get-pip.py";
const ESSENTIAL_TEMP_FILE: &str = "essential_requirements_temp.txt";
const OPTIONAL_TEMP_FILE: &str = "optional_requirements_temp.txt";

/// Manifest entries partitioned by install tier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequirementSplit {
    /// Packages the worker cannot run without.
    pub essential: Vec<String>,
    /// Heavy packages whose absence only degrades features.
    pub optional: Vec<String>,
}

/// Splits a requirements manifest into tiers.
///
/// Blank lines and `#` comments are skipped. An entry goes to the optional
/// tier when it starts with one of `heavy_prefixes`.
///
/// The prefix match ignores ASCII case, since pip treats distribution names
/// that way: `Torch==2.1` and `torch==2.1` name the same package and land in
/// the same tier.
pub fn split_requirements(manifest: &str, heavy_prefixes: &[String]) -> RequirementSplit {
    let mut split = RequirementSplit::default();
    for line in manifest.lines() {
        let entry = line.trim();
        if entry.is_empty() || entry.starts_with('#') {
            continue;
        }
        let lower = entry.to_ascii_lowercase();
        let heavy = heavy_prefixes
            .iter()
            .any(|prefix| lower.starts_with(&prefix.to_ascii_lowercase()));
        if heavy {
            split.optional.push(entry.to_owned());
        } else {
            split.essential.push(entry.to_owned());
        }
    }
    split
}

/// What a provisioning run did.
#[derive(Debug)]
pub enum ProvisionReport {
    /// The marker was present; nothing ran.
    AlreadyInstalled,
    /// The pipeline ran to completion.
    Installed(InstallSummary),
}

/// Details of a completed install.
#[derive(Debug, Default)]
pub struct InstallSummary {
    /// `pip` had to be bootstrapped first.
    pub bootstrapped_pip: bool,
    /// Number of essential entries installed.
    pub essential: usize,
    /// Number of optional entries requested.
    pub optional: usize,
    /// Set when the optional tier failed every attempt.
    pub optional_failure: Option<BridgeError>,
    /// Whether the marker could be written.
    pub marker_written: bool,
}

impl ProvisionReport {
    pub fn already_installed(&self) -> bool {
        matches!(self, Self::AlreadyInstalled)
    }

    /// Non-fatal problems worth showing to the user.
    pub fn warnings(&self) -> Vec<String> {
        let Self::Installed(summary) = self else {
            return Vec::new();
        };
        let mut warnings = Vec::new();
        if let Some(err) = &summary.optional_failure {
            warnings.push(format!(
                "{err}; features depending on optional packages (like PyTorch/Whisper) may be limited"
            ));
        }
        if !summary.marker_written {
            warnings.push("could not record the completed install; packages will be checked again next launch".to_owned());
        }
        warnings
    }
}

/// Installs the worker's runtime packages.
pub struct DependencyProvisioner {
    python: PathBuf,
    working_dir: PathBuf,
    config: ProvisioningConfig,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for DependencyProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyProvisioner")
            .field("python", &self.python)
            .field("working_dir", &self.working_dir)
            .finish_non_exhaustive()
    }
}

impl DependencyProvisioner {
    /// A provisioner running real commands with `python` from `working_dir`.
    pub fn new(python: PathBuf, working_dir: PathBuf, config: ProvisioningConfig) -> Self {
        Self::with_runner(python, working_dir, config, Arc::new(SystemCommandRunner))
    }

    pub fn with_runner(
        python: PathBuf,
        working_dir: PathBuf,
        config: ProvisioningConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            python,
            working_dir,
            config,
            runner,
        }
    }

    /// Returns `true` if `target_dir` carries the install marker.
    pub fn is_installed(target_dir: &Path) -> bool {
        target_dir.join(MARKER_FILE).is_file()
    }

    /// Ensures every package in `manifest` is installed into `target_dir`.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::ManifestUnreadable`] if the manifest cannot be read.
    /// - [`BridgeError::BootstrapFailed`] if `pip` is missing and cannot be
    ///   bootstrapped.
    /// - [`BridgeError::EssentialInstallFailed`] if the essential tier fails.
    ///
    /// Optional-tier failure is reported in the returned summary.
    pub async fn ensure_installed(&self, manifest: &Path, target_dir: &Path) -> Result<ProvisionReport> {
        if Self::is_installed(target_dir) {
            tracing::info!(target_dir = %target_dir.display(), "dependency marker found, skipping install");
            return Ok(ProvisionReport::AlreadyInstalled);
        }
        tracing::info!(target_dir = %target_dir.display(), "dependency marker not found, installing packages");

        let text = tokio::fs::read_to_string(manifest)
            .await
            .map_err(|e| BridgeError::ManifestUnreadable {
                path: manifest.display().to_string(),
                reason: e.to_string(),
            })?;
        let split = split_requirements(&text, &self.config.heavy_prefixes);
        tracing::info!(
            essential = split.essential.len(),
            optional = split.optional.len(),
            "split requirements"
        );

        tokio::fs::create_dir_all(target_dir).await?;

        let mut summary = InstallSummary {
            essential: split.essential.len(),
            optional: split.optional.len(),
            ..InstallSummary::default()
        };

        if !self.pip_available(target_dir).await {
            tracing::info!("pip not found, bootstrapping from get-pip.py");
            self.bootstrap_pip(target_dir).await?;
            summary.bootstrapped_pip = true;
        }

        self.upgrade_pip(target_dir).await;

        if !split.essential.is_empty() {
            self.install_essential(&split.essential, target_dir).await?;
        }

        if !split.optional.is_empty() {
            summary.optional_failure = self.install_optional(&split.optional, target_dir).await.err();
        }

        summary.marker_written = match tokio::fs::write(target_dir.join(MARKER_FILE), b"").await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "failed to write dependency marker");
                false
            }
        };

        tracing::info!(
            bootstrapped_pip = summary.bootstrapped_pip,
            optional_failed = summary.optional_failure.is_some(),
            marker_written = summary.marker_written,
            "dependency install finished"
        );
        Ok(ProvisionReport::Installed(summary))
    }

    fn pip_command(&self, label: &str, target_dir: &Path, timeout: std::time::Duration) -> CommandSpec {
        // A bootstrapped pip lives in the target dir, so it must be importable.
        CommandSpec::new(label, &self.python, timeout)
            .current_dir(&self.working_dir)
            .env("PYTHONPATH", target_dir)
            .args(["-m", "pip"])
    }

    async fn run_step(&self, spec: &CommandSpec) -> std::result::Result<(), String> {
        match self.runner.run(spec).await {
            Ok(outcome) if outcome.success() => Ok(()),
            Ok(outcome) => Err(outcome.describe()),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn pip_available(&self, target_dir: &Path) -> bool {
        let spec = self
            .pip_command("pip check", target_dir, self.config.check_timeout())
            .arg("--version");
        match self.runner.run(&spec).await {
            Ok(CommandOutcome { exit_code: Some(0), timed_out: false, .. }) => true,
            Ok(outcome) => {
                tracing::debug!(outcome = %outcome.describe(), "pip check failed");
                false
            }
            Err(e) => {
                tracing::debug!(error = %e, "pip check could not run");
                false
            }
        }
    }

    async fn bootstrap_pip(&self, target_dir: &Path) -> Result<()> {
        let script = self.working_dir.join(GET_PIP_FILE);
        self.download_get_pip(&script).await?;

        let spec = CommandSpec::new("pip bootstrap", &self.python, self.config.bootstrap_timeout())
            .current_dir(&self.working_dir)
            .arg(&script)
            .arg(target_arg(target_dir))
            .arg("--no-warn-script-location");
        let result = self.run_step(&spec).await;

        if let Err(e) = tokio::fs::remove_file(&script).await {
            tracing::warn!(path = %script.display(), error = %e, "could not delete get-pip.py");
        }

        result.map_err(|reason| BridgeError::BootstrapFailed { reason })?;
        tracing::info!("pip bootstrapped");
        Ok(())
    }

    async fn download_get_pip(&self, dest: &Path) -> Result<()> {
        let url = &self.config.get_pip_url;
        tracing::info!(%url, "downloading get-pip.py");
        let bootstrap_failed = |e: reqwest::Error| BridgeError::BootstrapFailed {
            reason: format!("download of {url} failed: {e}"),
        };

        let client = reqwest::Client::builder()
            .user_agent(concat!("alex/", env!("CARGO_PKG_VERSION")))
            .timeout(self.config.bootstrap_timeout())
            .build()
            .map_err(bootstrap_failed)?;
        let bytes = client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(bootstrap_failed)?
            .bytes()
            .await
            .map_err(bootstrap_failed)?;

        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| BridgeError::BootstrapFailed {
                reason: format!("cannot save {}: {e}", dest.display()),
            })?;
        tracing::debug!(path = %dest.display(), bytes = bytes.len(), "get-pip.py saved");
        Ok(())
    }

    async fn upgrade_pip(&self, target_dir: &Path) {
        let spec = self
            .pip_command("pip upgrade", target_dir, self.config.bootstrap_timeout())
            .args(["install", "--upgrade", "pip"])
            .arg(target_arg(target_dir))
            .args(["--no-cache-dir", "--no-warn-script-location"]);
        if let Err(reason) = self.run_step(&spec).await {
            tracing::warn!(%reason, "failed to upgrade pip, continuing with the current version");
        }
    }

    async fn install_essential(&self, packages: &[String], target_dir: &Path) -> Result<()> {
        let temp = self.working_dir.join(ESSENTIAL_TEMP_FILE);
        write_requirements(&temp, packages)
            .await
            .map_err(|e| BridgeError::EssentialInstallFailed {
                reason: format!("cannot write {}: {e}", temp.display()),
            })?;

        let spec = self
            .pip_command("essential install", target_dir, self.config.install_timeout())
            .arg("install")
            .arg("-r")
            .arg(&temp)
            .arg(target_arg(target_dir))
            .args(["--no-cache-dir", "--no-warn-script-location"]);
        let result = self.run_step(&spec).await;
        remove_quietly(&temp).await;

        result.map_err(|reason| BridgeError::EssentialInstallFailed { reason })?;
        tracing::info!(count = packages.len(), "essential packages installed");
        Ok(())
    }

    async fn install_optional(&self, packages: &[String], target_dir: &Path) -> Result<()> {
        let policy = self.config.optional_retry;
        let attempts = policy.max_attempts.max(1);
        let temp = self.working_dir.join(OPTIONAL_TEMP_FILE);
        if let Err(e) = write_requirements(&temp, packages).await {
            tracing::warn!(path = %temp.display(), error = %e, "cannot write optional requirements");
            return Err(BridgeError::OptionalInstallFailed { attempts: 0 });
        }

        let spec = self
            .pip_command("optional install", target_dir, self.config.install_timeout())
            .args(["install", "--extra-index-url"])
            .arg(&self.config.torch_index_url)
            .arg("-r")
            .arg(&temp)
            .arg(target_arg(target_dir))
            .args(["--no-cache-dir", "--prefer-binary", "--no-warn-script-location"]);

        let result = policy
            .run(
                |attempt| {
                    let spec = &spec;
                    async move {
                        tracing::info!(attempt, of = attempts, "installing optional packages");
                        let result = self.run_step(spec).await;
                        if let Err(reason) = &result {
                            tracing::warn!(attempt, %reason, "optional package install failed");
                        }
                        result
                    }
                },
                |_| true,
            )
            .await;
        remove_quietly(&temp).await;

        match result {
            Ok(()) => {
                tracing::info!(count = packages.len(), "optional packages installed");
                Ok(())
            }
            Err(_) => {
                tracing::error!(attempts, "optional packages failed on every attempt, functionality may be limited");
                Err(BridgeError::OptionalInstallFailed { attempts })
            }
        }
    }
}

fn target_arg(target_dir: &Path) -> std::ffi::OsString {
    let mut arg = std::ffi::OsString::from("--target=");
    arg.push(target_dir);
    arg
}

async fn write_requirements(path: &Path, packages: &[String]) -> std::io::Result<()> {
    let mut body = packages.join("\n");
    body.push('\n');
    tokio::fs::write(path, body).await
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::debug!(path = %path.display(), error = %e, "could not remove temp requirements file");
    }
}
