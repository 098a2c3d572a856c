//! Worker → controller RPC server.
//!
//! Binds a free loopback port, serves the worker's callbacks over axum, and
//! advertises the bound port for the worker to read. Each call runs on its
//! own task; errors and panics come back as `{ success: false, message }`
//! replies rather than transport failures.

use super::contract::{
    AskReply, AskRequest, CityReply, CityRequest, Method, REQUEST_ID_HEADER, Reply, SetVisibleRequest, StatusReply,
    WeatherReply, WeatherRequest,
};
use super::ui::UiDispatcher;
use crate::config::ControlConfig;
use crate::error::Result;
use crate::worker::ports::{PortAllocator, PortFile};
use async_trait::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A weather lookup result.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherReport {
    pub city: String,
    pub description: String,
    /// Degrees Celsius.
    pub temperature: f64,
}

/// Services the worker can call back into.
///
/// Every method has a default that reports the capability as unavailable,
/// so shells implement only what they offer.
#[async_trait]
pub trait HostServices: Send + Sync + 'static {
    /// Answers a free-form question.
    async fn ask(&self, question: &str) -> anyhow::Result<String> {
        let _ = question;
        anyhow::bail!("question answering is not available")
    }

    /// Resolves a city name to its canonical form, `None` when unknown.
    async fn lookup_city(&self, city: &str) -> anyhow::Result<Option<String>> {
        let _ = city;
        anyhow::bail!("city lookup is not available")
    }

    /// Current weather for `city`.
    async fn weather(&self, city: &str) -> anyhow::Result<WeatherReport> {
        let _ = city;
        anyhow::bail!("weather lookup is not available")
    }
}

/// Host services with every capability switched off.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHostServices;

impl HostServices for NoopHostServices {}

#[derive(Clone)]
struct AppState {
    services: Arc<dyn HostServices>,
    ui: UiDispatcher,
}

/// The running control-plane server.
pub struct ControlPlaneHost {
    addr: SocketAddr,
    port_file: PortFile,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for ControlPlaneHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneHost")
            .field("addr", &self.addr)
            .field("port_file", &self.port_file)
            .field("stopped", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl ControlPlaneHost {
    /// Binds, advertises and starts serving.
    ///
    /// The port is advertised only after the listener is bound.
    ///
    /// # Errors
    ///
    /// [`BridgeError::ExhaustedRange`](crate::error::BridgeError::ExhaustedRange)
    /// if no port in the configured range can be bound, or an I/O error if
    /// the port cannot be advertised.
    pub async fn start(
        services: Arc<dyn HostServices>,
        ui: UiDispatcher,
        config: &ControlConfig,
        allocator: &PortAllocator,
    ) -> Result<Self> {
        let listener = allocator
            .bind_with_fallback(config.host_port_start, config.host_port_end)
            .await?;
        let addr = listener.local_addr()?;

        let port_file = PortFile::new(config.host_port_file_path());
        port_file.advertise(addr.port())?;

        let app = router(AppState { services, ui });
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone().cancelled_owned();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(signal).await {
                tracing::error!(error = %e, "control-plane host error");
            }
        });

        tracing::info!(%addr, "control-plane host listening");
        Ok(Self {
            addr,
            port_file,
            shutdown,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stops accepting calls and withdraws the advertisement. Idempotent;
    /// returns `false` if already stopped.
    pub fn stop(&self) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        self.shutdown.cancel();
        self.port_file.remove();
        tracing::info!(port = self.port(), "control-plane host stopped");
        true
    }
}

impl Drop for ControlPlaneHost {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.handle.abort();
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route(&Method::Ask.path(), post(handle_ask))
        .route(&Method::City.path(), post(handle_city))
        .route(&Method::Weather.path(), post(handle_weather))
        .route(&Method::SetVisible.path(), post(handle_set_visible))
        .with_state(state)
}

fn request_id(headers: &HeaderMap) -> &str {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
}

/// Runs `work` on its own task and folds every failure into the reply.
async fn isolated<R, Fut>(method: Method, request_id: &str, work: Fut) -> Json<R>
where
    R: Reply,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    let reply = match tokio::spawn(work).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            tracing::warn!(%method, %request_id, error = %e, "control handler failed");
            R::failure(format!("{e:#}"))
        }
        Err(join) => {
            tracing::error!(%method, %request_id, panicked = join.is_panic(), "control handler aborted");
            R::failure(format!("internal error while handling {method}"))
        }
    };
    tracing::debug!(%method, %request_id, success = reply.is_success(), "control call handled");
    Json(reply)
}

fn rejected<R: Reply>(method: Method, request_id: &str, rejection: &JsonRejection) -> Json<R> {
    tracing::warn!(%method, %request_id, error = %rejection, "malformed control request");
    Json(R::failure(format!("malformed request: {rejection}")))
}

async fn handle_ask(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<AskRequest>, JsonRejection>,
) -> Json<AskReply> {
    let id = request_id(&headers);
    let Json(req) = match payload {
        Ok(p) => p,
        Err(e) => return rejected(Method::Ask, id, &e),
    };
    isolated(Method::Ask, id, async move {
        let question = req.question.trim();
        if question.is_empty() {
            anyhow::bail!("question is empty");
        }
        let answer = state.services.ask(question).await?;
        Ok(AskReply::answered(answer))
    })
    .await
}

async fn handle_city(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<CityRequest>, JsonRejection>,
) -> Json<CityReply> {
    let id = request_id(&headers);
    let Json(req) = match payload {
        Ok(p) => p,
        Err(e) => return rejected(Method::City, id, &e),
    };
    isolated(Method::City, id, async move {
        match state.services.lookup_city(req.city.trim()).await? {
            Some(full_name) => Ok(CityReply::found(full_name)),
            None => Ok(CityReply::failure(format!("city '{}' not found", req.city.trim()))),
        }
    })
    .await
}

async fn handle_weather(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<WeatherRequest>, JsonRejection>,
) -> Json<WeatherReply> {
    let id = request_id(&headers);
    let Json(req) = match payload {
        Ok(p) => p,
        Err(e) => return rejected(Method::Weather, id, &e),
    };
    isolated(Method::Weather, id, async move {
        let report = state.services.weather(req.city.trim()).await?;
        Ok(WeatherReply::report(report.city, report.description, report.temperature))
    })
    .await
}

async fn handle_set_visible(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<SetVisibleRequest>, JsonRejection>,
) -> Json<StatusReply> {
    let id = request_id(&headers);
    let Json(req) = match payload {
        Ok(p) => p,
        Err(e) => return rejected(Method::SetVisible, id, &e),
    };
    isolated(Method::SetVisible, id, async move {
        let visible = req.visible;
        let message = state
            .ui
            .invoke(move |ctx| ctx.set_assistant_visible(visible))
            .await??;
        Ok(StatusReply::ok(message))
    })
    .await
}
