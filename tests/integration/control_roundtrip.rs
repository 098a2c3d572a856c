//! Both directions of the control plane over real loopback sockets.

use crate::helpers::dead_port;
use alex::config::ControlConfig;
use alex::control::{
    AskReply, AskRequest, ControlChannel, ControlPlaneHost, HostServices, LoggingSurface, Method, SetActiveRequest,
    SetVisibleRequest, StatusReply, UiLoop, WeatherReply, WeatherReport, WeatherRequest,
};
use alex::worker::{PortAllocator, PortFile};
use alex::{BridgeError, RetryPolicy};
use async_trait::async_trait;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const T: Duration = Duration::from_secs(5);

struct Desk;

#[async_trait]
impl HostServices for Desk {
    async fn ask(&self, question: &str) -> anyhow::Result<String> {
        Ok(format!("answer to {question}"))
    }

    async fn weather(&self, city: &str) -> anyhow::Result<WeatherReport> {
        Ok(WeatherReport {
            city: city.to_owned(),
            description: "light rain".to_owned(),
            temperature: 11.5,
        })
    }
}

#[tokio::test]
async fn worker_callbacks_reach_host_services() {
    let dir = tempfile::tempdir().unwrap();
    let (ui, _) = UiLoop::spawn(LoggingSurface);
    let config = ControlConfig {
        host_port_file: Some(dir.path().join("host_port.txt")),
        ..ControlConfig::default()
    };
    let host = match ControlPlaneHost::start(Arc::new(Desk), ui, &config, &PortAllocator::default()).await {
        Ok(host) => host,
        // Every port in the default range is taken on this machine.
        Err(BridgeError::ExhaustedRange { .. }) => return,
        Err(e) => panic!("host did not start: {e}"),
    };
    assert!((60051..=61000).contains(&host.port()));

    // The worker finds the host through the advertisement file.
    let advertised = PortFile::new(dir.path().join("host_port.txt")).read().unwrap();
    let worker_side = ControlChannel::with_port(advertised).unwrap();

    let reply: AskReply = worker_side
        .call(Method::Ask, &AskRequest { question: "life".to_owned() }, T)
        .await
        .unwrap();
    assert_eq!(reply.answer, "answer to life");

    let reply: WeatherReply = worker_side
        .call(Method::Weather, &WeatherRequest { city: "Bergen".to_owned() }, T)
        .await
        .unwrap();
    assert!(reply.success);
    assert_eq!(reply.description, "light rain");
    assert!((reply.temperature - 11.5).abs() < f64::EPSILON);

    let reply: StatusReply = worker_side
        .call(Method::SetVisible, &SetVisibleRequest { visible: true }, T)
        .await
        .unwrap();
    assert_eq!(reply.message, "assistant shown");

    host.stop();
}

#[derive(Clone, Default)]
struct FakeWorker {
    calls: Arc<AtomicU32>,
    /// Calls answered with 503 before the worker starts accepting.
    unavailable_for: u32,
    seen: Arc<Mutex<Vec<SetActiveRequest>>>,
}

async fn set_active(
    State(worker): State<FakeWorker>,
    Json(req): Json<SetActiveRequest>,
) -> Result<Json<StatusReply>, StatusCode> {
    let n = worker.calls.fetch_add(1, Ordering::SeqCst);
    if n < worker.unavailable_for {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    let message = if req.active { "listening" } else { "idle" };
    worker.seen.lock().unwrap().push(req);
    Ok(Json(StatusReply::ok(message)))
}

async fn serve_fake_worker(worker: FakeWorker) -> u16 {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = axum::Router::new()
        .route(&Method::SetActive.path(), post(set_active))
        .with_state(worker);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

#[tokio::test]
async fn handshake_retries_until_worker_accepts() {
    let worker = FakeWorker {
        unavailable_for: 2,
        ..FakeWorker::default()
    };
    let port = serve_fake_worker(worker.clone()).await;
    let channel = ControlChannel::with_port(port).unwrap();

    let reply = channel
        .activate("USB Mic", T, &RetryPolicy::linear(3, Duration::from_millis(20)))
        .await
        .unwrap();
    assert_eq!(reply.message, "listening");
    assert_eq!(worker.calls.load(Ordering::SeqCst), 3);
    let seen = worker.seen.lock().unwrap().clone();
    assert_eq!(seen[0].microphone.as_deref(), Some("USB Mic"));
}

#[tokio::test]
async fn handshake_gives_up_after_three_attempts() {
    let worker = FakeWorker {
        unavailable_for: u32::MAX,
        ..FakeWorker::default()
    };
    let port = serve_fake_worker(worker.clone()).await;
    let channel = ControlChannel::with_port(port).unwrap();

    let err = channel
        .activate("USB Mic", T, &RetryPolicy::linear(3, Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::RpcUnavailable { .. }), "{err}");
    assert_eq!(worker.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn disposed_channel_fails_without_network() {
    let channel = ControlChannel::with_port(dead_port()).unwrap();
    channel.dispose();
    let started = Instant::now();
    let err = channel.set_active(false, None, Duration::from_secs(30)).await.unwrap_err();
    assert!(matches!(err, BridgeError::ChannelDisposed));
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn allocator_reports_exhausted_range() {
    let held = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = held.local_addr().unwrap().port();
    let err = PortAllocator::default().allocate(port, port).unwrap_err();
    assert!(matches!(err, BridgeError::ExhaustedRange { start, end } if start == port && end == port));
}
