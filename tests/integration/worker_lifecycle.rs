//! Launch and readiness of a scripted worker through the supervisor.

use crate::helpers::shell_backend;
use alex::control::{LoggingSurface, NoopHostServices, UiLoop};
use alex::worker::{LaunchConfig, ReadinessMonitor, ReadinessState, WorkerState, launch};
use alex::{BridgeError, LoggingObserver, Supervisor};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn supervisor(config: alex::BridgeConfig) -> Supervisor {
    let (ui, _) = UiLoop::spawn(LoggingSurface);
    Supervisor::new(config, Arc::new(NoopHostServices), ui).unwrap()
}

#[tokio::test]
async fn worker_sees_python_environment() {
    let dir = tempfile::tempdir().unwrap();
    let config = shell_backend(
        dir.path(),
        "echo \"env $PYTHONUNBUFFERED $PYTHONIOENCODING $PYTHONPATH\"\n\
         echo 'gRPC server started on port 50123'\n\
         exec sleep 30\n",
    );
    let site_packages = config.worker.site_packages_dir();
    let sup = supervisor(config);

    let report = sup.start(&LoggingObserver).await.unwrap();
    assert_eq!(report.announced_port, Some(50123));

    let worker = sup.worker().await.unwrap();
    assert_eq!(worker.state(), WorkerState::Running);
    let expected = format!("env 1 utf-8 {}", site_packages.display());
    assert!(worker.stdout().contains(&expected), "{:?}", worker.stdout().snapshot());

    sup.shutdown().await;
    assert!(worker.has_exited());
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn silent_worker_times_out_and_is_killed() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = shell_backend(dir.path(), "echo loading models\nexec sleep 60\n");
    config.readiness.timeout_secs = 1;
    config.readiness.terminate_grace_ms = 300;
    let sup = supervisor(config);

    let started = Instant::now();
    let err = sup.start(&LoggingObserver).await.unwrap_err();
    assert!(matches!(err, BridgeError::ReadinessTimeout { .. }), "{err}");
    assert!(started.elapsed() < Duration::from_secs(5));

    let worker = sup.worker().await.unwrap();
    assert!(worker.has_exited(), "worker must not outlive its readiness window");
    assert_eq!(worker.state(), WorkerState::Failed);
    sup.shutdown().await;
}

#[tokio::test]
async fn late_sentinel_beats_long_deadline() {
    let worker = launch(
        &LaunchConfig::new("late", "sh").args(["-c", "sleep 1.2; echo 'gRPC server started on port 50051'; sleep 30"]),
    )
    .unwrap();
    let monitor = ReadinessMonitor::new(&alex::config::ReadinessConfig::default());

    let started = Instant::now();
    let outcome = monitor.wait(&worker, &CancellationToken::new()).await;
    assert_eq!(outcome.state(), ReadinessState::Ready);
    // One poll interval past the sentinel, nowhere near the 60 s deadline.
    assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    worker.force_kill();
}

#[tokio::test]
async fn output_buffers_keep_only_recent_lines() {
    let mut config = LaunchConfig::new("chatty", "sh").args(["-c", "i=0; while [ $i -lt 40 ]; do echo line$i; i=$((i+1)); done"]);
    config.stdout_capacity = 10;
    let worker = launch(&config).unwrap();
    worker.wait_exit().await;
    worker.wait_output_drained().await;

    assert_eq!(worker.stdout().total(), 40);
    assert_eq!(worker.stdout().len(), 10);
    assert_eq!(worker.stdout().tail(2), vec!["line38".to_owned(), "line39".to_owned()]);
}
