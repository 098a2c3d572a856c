//! Dependency provisioning against a scripted interpreter.

use crate::helpers::{fake_python, python_calls};
use alex::config::ProvisioningConfig;
use alex::worker::{DependencyProvisioner, ProvisionReport};
use alex::{BridgeError, RetryPolicy};
use std::path::Path;
use std::time::Duration;

const MANIFEST: &str = "\
# runtime
grpcio==1.62.0
numpy

torch==2.1.0
openai-whisper
";

fn provisioner(dir: &Path, python: &Path) -> DependencyProvisioner {
    let config = ProvisioningConfig {
        optional_retry: RetryPolicy::fixed(3, Duration::from_millis(10)),
        ..ProvisioningConfig::default()
    };
    DependencyProvisioner::new(python.to_path_buf(), dir.to_path_buf(), config)
}

#[tokio::test]
async fn second_run_does_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (python, log) = fake_python(dir.path(), 0);
    let manifest = dir.path().join("requirements.txt");
    std::fs::write(&manifest, MANIFEST).unwrap();
    let target = dir.path().join("site-packages");
    let provisioner = provisioner(dir.path(), &python);

    let first = provisioner.ensure_installed(&manifest, &target).await.unwrap();
    let ProvisionReport::Installed(summary) = first else {
        panic!("first run should install");
    };
    assert_eq!(summary.essential, 2);
    assert_eq!(summary.optional, 2);
    assert!(!summary.bootstrapped_pip);
    assert!(summary.marker_written);
    assert!(summary.optional_failure.is_none());
    assert!(DependencyProvisioner::is_installed(&target));

    let calls = python_calls(&log);
    assert_eq!(calls.len(), 4, "{calls:?}");
    assert_eq!(calls[0], "-m pip --version");
    assert!(calls[1].starts_with("-m pip install --upgrade pip"));
    assert!(calls[2].contains("essential_requirements_temp.txt"));
    assert!(calls[3].contains("--extra-index-url https://download.pytorch.org/whl/cu118"));
    assert!(calls[3].contains("--prefer-binary"));
    assert!(!dir.path().join("essential_requirements_temp.txt").exists());
    assert!(!dir.path().join("optional_requirements_temp.txt").exists());

    let second = provisioner.ensure_installed(&manifest, &target).await.unwrap();
    assert!(second.already_installed());
    assert_eq!(python_calls(&log).len(), 4);
}

#[tokio::test]
async fn essential_failure_skips_optional_tier_and_marker() {
    let dir = tempfile::tempdir().unwrap();
    let (python, log) = fake_python(dir.path(), 1);
    let manifest = dir.path().join("requirements.txt");
    std::fs::write(&manifest, MANIFEST).unwrap();
    let target = dir.path().join("site-packages");

    let err = provisioner(dir.path(), &python)
        .ensure_installed(&manifest, &target)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::EssentialInstallFailed { .. }), "{err}");
    assert!(err.to_string().contains("No matching distribution"), "{err}");
    assert!(err.is_fatal());

    let calls = python_calls(&log);
    assert!(calls.iter().all(|c| !c.contains("--extra-index-url")), "{calls:?}");
    assert!(!DependencyProvisioner::is_installed(&target));
}

#[tokio::test]
async fn unreadable_manifest_runs_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (python, log) = fake_python(dir.path(), 0);
    let err = provisioner(dir.path(), &python)
        .ensure_installed(&dir.path().join("missing.txt"), &dir.path().join("site-packages"))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::ManifestUnreadable { .. }));
    assert!(python_calls(&log).is_empty());
}
