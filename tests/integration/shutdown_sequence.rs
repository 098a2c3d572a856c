//! Full start/stop cycles through the supervisor.

use crate::helpers::shell_backend;
use alex::control::{LoggingSurface, NoopHostServices, UiLoop};
use alex::shutdown::{ShutdownStep, StepOutcome};
use alex::{BridgeError, LoggingObserver, ShutdownOutcome, Supervisor};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn supervisor(config: alex::BridgeConfig) -> Arc<Supervisor> {
    let (ui, _) = UiLoop::spawn(LoggingSurface);
    Arc::new(Supervisor::new(config, Arc::new(NoopHostServices), ui).unwrap())
}

#[tokio::test]
async fn concurrent_shutdowns_run_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = shell_backend(dir.path(), "echo 'gRPC server started on port 1'\nexec sleep 30\n");
    let sup = supervisor(config);
    sup.start(&LoggingObserver).await.unwrap();
    let worker = sup.worker().await.unwrap();

    let a = tokio::spawn({
        let sup = Arc::clone(&sup);
        async move { sup.shutdown().await }
    });
    let b = tokio::spawn({
        let sup = Arc::clone(&sup);
        async move { sup.shutdown().await }
    });
    let outcomes = [a.await.unwrap(), b.await.unwrap()];
    let completed: Vec<_> = outcomes.iter().filter_map(ShutdownOutcome::report).collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(
        outcomes.iter().filter(|o| matches!(o, ShutdownOutcome::AlreadyRequested)).count(),
        1
    );

    let report = completed[0];
    assert_eq!(report.outcome(ShutdownStep::StopWorker), Some(&StepOutcome::Done));
    assert!(worker.has_exited());
    assert!(sup.cancel_token().is_cancelled());
}

#[tokio::test]
async fn calls_after_shutdown_fail_fast() {
    let dir = tempfile::tempdir().unwrap();
    let config = shell_backend(dir.path(), "echo 'gRPC server started on port 1'\nexec sleep 30\n");
    let host_port_file = config.control.host_port_file.clone().unwrap();
    let sup = supervisor(config);
    let report = sup.start(&LoggingObserver).await.unwrap();
    assert!(report.host_port.is_some());
    assert!(host_port_file.is_file());

    sup.shutdown().await;

    let started = Instant::now();
    let err = sup
        .channel()
        .set_active(true, Some("mic"), Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::ChannelDisposed));
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(sup.host_port(), None);
    assert!(!host_port_file.exists(), "host advertisement must be withdrawn");
}

#[tokio::test]
async fn shutdown_during_readiness_cancels_startup() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = shell_backend(dir.path(), "exec sleep 30\n");
    config.readiness.timeout_secs = 30;
    config.readiness.terminate_grace_ms = 300;
    let sup = supervisor(config);

    let starter = tokio::spawn({
        let sup = Arc::clone(&sup);
        async move { sup.start(&LoggingObserver).await }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    sup.shutdown().await;
    let result = tokio::time::timeout(Duration::from_secs(5), starter).await.unwrap().unwrap();
    assert!(matches!(result, Err(BridgeError::Cancelled)), "{result:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
}
