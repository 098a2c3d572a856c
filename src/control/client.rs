//! Controller → worker RPC channel.
//!
//! The channel resolves the worker's address on first use and keeps one
//! HTTP client for the life of the process. Once disposed it refuses every
//! call without touching the network.

use super::contract::{Method, REQUEST_ID_HEADER, SetActiveRequest, StatusReply};
use crate::error::{BridgeError, Result};
use crate::retry::RetryPolicy;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Longest error body quoted in an [`BridgeError::RpcFailed`] message.
const MAX_ERROR_BODY: usize = 512;

type PortResolver = Box<dyn Fn() -> u16 + Send + Sync>;

#[derive(Debug)]
struct Endpoint {
    port: u16,
    base_url: String,
}

#[derive(Debug)]
enum ChannelSlot {
    Uninit,
    Ready(Arc<Endpoint>),
    Disposed,
}

/// Lazily connected, disposable RPC channel to the worker.
pub struct ControlChannel {
    http: reqwest::Client,
    resolve_port: PortResolver,
    slot: Mutex<ChannelSlot>,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("slot", &*self.lock())
            .finish_non_exhaustive()
    }
}

impl ControlChannel {
    /// A channel that asks `resolve_port` for the worker port on first use.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Config`] if the HTTP client cannot be built.
    pub fn new(resolve_port: impl Fn() -> u16 + Send + Sync + 'static) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("alex/", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .build()
            .map_err(|e| BridgeError::Config(format!("cannot build control client: {e}")))?;
        Ok(Self {
            http,
            resolve_port: Box::new(resolve_port),
            slot: Mutex::new(ChannelSlot::Uninit),
        })
    }

    /// A channel to a known port.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn with_port(port: u16) -> Result<Self> {
        Self::new(move || port)
    }

    fn lock(&self) -> MutexGuard<'_, ChannelSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The current endpoint, resolving it on first use.
    ///
    /// Resolution reads files and probes ports, so it runs unlocked; the
    /// first endpoint stored wins and a dispose in between is honoured.
    fn endpoint(&self) -> Result<Arc<Endpoint>> {
        match &*self.lock() {
            ChannelSlot::Ready(endpoint) => return Ok(Arc::clone(endpoint)),
            ChannelSlot::Disposed => return Err(BridgeError::ChannelDisposed),
            ChannelSlot::Uninit => {}
        }

        let port = (self.resolve_port)();

        let mut slot = self.lock();
        match &*slot {
            ChannelSlot::Ready(endpoint) => Ok(Arc::clone(endpoint)),
            ChannelSlot::Disposed => Err(BridgeError::ChannelDisposed),
            ChannelSlot::Uninit => {
                let endpoint = Arc::new(Endpoint {
                    port,
                    base_url: format!("http://127.0.0.1:{port}"),
                });
                tracing::info!(port, "control channel created");
                *slot = ChannelSlot::Ready(Arc::clone(&endpoint));
                Ok(endpoint)
            }
        }
    }

    /// Worker port, once resolved.
    pub fn port(&self) -> Option<u16> {
        match &*self.lock() {
            ChannelSlot::Ready(endpoint) => Some(endpoint.port),
            _ => None,
        }
    }

    pub fn is_disposed(&self) -> bool {
        matches!(*self.lock(), ChannelSlot::Disposed)
    }

    /// Closes the channel. Returns `false` if it was already disposed.
    pub fn dispose(&self) -> bool {
        let mut slot = self.lock();
        if matches!(*slot, ChannelSlot::Disposed) {
            return false;
        }
        *slot = ChannelSlot::Disposed;
        tracing::info!("control channel disposed");
        true
    }

    /// Performs one call with a deadline.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::ChannelDisposed`] after [`dispose`](Self::dispose).
    /// - [`BridgeError::RpcUnavailable`] when the worker cannot be reached or
    ///   answers 503.
    /// - [`BridgeError::RpcDeadlineExceeded`] when `timeout` elapses.
    /// - [`BridgeError::RpcFailed`] for any other non-success status.
    /// - [`BridgeError::RpcProtocol`] for an undecodable reply.
    pub async fn call<Req, Resp>(&self, method: Method, request: &Req, timeout: Duration) -> Result<Resp>
    where
        Req: Serialize + Sync + ?Sized,
        Resp: DeserializeOwned,
    {
        let endpoint = self.endpoint()?;
        let url = format!("{}{}", endpoint.base_url, method.path());
        let request_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(%method, %request_id, port = endpoint.port, "control call");

        let transport = |e: reqwest::Error| {
            if e.is_timeout() {
                BridgeError::RpcDeadlineExceeded {
                    method: method.to_string(),
                    deadline: timeout,
                }
            } else {
                BridgeError::RpcUnavailable {
                    method: method.to_string(),
                    reason: e.to_string(),
                }
            }
        };

        let response = self
            .http
            .post(&url)
            .header(REQUEST_ID_HEADER, &request_id)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        let body = response.bytes().await.map_err(transport)?;

        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(BridgeError::RpcUnavailable {
                method: method.to_string(),
                reason: "service unavailable".to_owned(),
            });
        }
        if !status.is_success() {
            let mut message = String::from_utf8_lossy(&body).into_owned();
            if message.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !message.is_char_boundary(cut) {
                    cut -= 1;
                }
                message.truncate(cut);
            }
            return Err(BridgeError::RpcFailed {
                method: method.to_string(),
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_slice(&body).map_err(|e| BridgeError::RpcProtocol {
            method: method.to_string(),
            reason: e.to_string(),
        })
    }

    /// [`call`](Self::call) with retries on transient failures only.
    ///
    /// # Errors
    ///
    /// The last error once attempts are exhausted, or the first
    /// non-transient error.
    pub async fn call_with_retry<Req, Resp>(
        &self,
        method: Method,
        request: &Req,
        timeout: Duration,
        policy: &RetryPolicy,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync + ?Sized,
        Resp: DeserializeOwned,
    {
        policy
            .run(
                |attempt| async move {
                    let result = self.call(method, request, timeout).await;
                    if let Err(e) = &result {
                        tracing::warn!(
                            %method,
                            attempt,
                            of = policy.max_attempts,
                            transient = e.is_transient(),
                            error = %e,
                            "control call failed"
                        );
                    }
                    result
                },
                BridgeError::is_transient,
            )
            .await
    }

    /// Tells the worker to start or stop listening.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn set_active(&self, active: bool, microphone: Option<&str>, timeout: Duration) -> Result<StatusReply> {
        let request = SetActiveRequest {
            active,
            microphone: microphone.map(str::to_owned),
        };
        self.call(Method::SetActive, &request, timeout).await
    }

    /// The startup activation handshake: `set_active(true)` with retries.
    ///
    /// # Errors
    ///
    /// See [`call_with_retry`](Self::call_with_retry).
    pub async fn activate(&self, microphone: &str, timeout: Duration, policy: &RetryPolicy) -> Result<StatusReply> {
        let request = SetActiveRequest {
            active: true,
            microphone: Some(microphone.to_owned()),
        };
        self.call_with_retry(Method::SetActive, &request, timeout, policy).await
    }
}
