//! Marshalling of UI work onto the single UI-owning context.
//!
//! RPC handlers run on arbitrary runtime threads, but UI objects belong to
//! one context. Handlers send closures through a [`UiDispatcher`]; the
//! [`UiLoop`] owning the [`UiSurface`] runs them one at a time and sends the
//! result back. A panicking job is reported as a failure and the loop keeps
//! running.

use std::panic::AssertUnwindSafe;
use tokio::sync::{mpsc, oneshot};

/// Queue depth between handlers and the UI loop.
const UI_QUEUE_DEPTH: usize = 64;

/// The assistant window, implemented by the desktop shell.
pub trait UiSurface: Send + 'static {
    /// Builds the assistant surface. Called at most once.
    fn create_assistant(&mut self) -> anyhow::Result<()>;
    fn show_assistant(&mut self) -> anyhow::Result<()>;
    fn hide_assistant(&mut self) -> anyhow::Result<()>;
}

/// Surface that only logs; for headless runs.
#[derive(Debug, Default)]
pub struct LoggingSurface;

impl UiSurface for LoggingSurface {
    fn create_assistant(&mut self) -> anyhow::Result<()> {
        tracing::info!("assistant surface created");
        Ok(())
    }

    fn show_assistant(&mut self) -> anyhow::Result<()> {
        tracing::info!("assistant surface shown");
        Ok(())
    }

    fn hide_assistant(&mut self) -> anyhow::Result<()> {
        tracing::info!("assistant surface hidden");
        Ok(())
    }
}

/// State owned by the UI loop and lent to each job.
pub struct UiContext {
    surface: Box<dyn UiSurface>,
    assistant_created: bool,
}

impl UiContext {
    pub fn assistant_created(&self) -> bool {
        self.assistant_created
    }

    pub fn surface(&mut self) -> &mut dyn UiSurface {
        self.surface.as_mut()
    }

    /// Shows (creating on first use) or hides the assistant.
    ///
    /// Returns the status message for the caller.
    ///
    /// # Errors
    ///
    /// Whatever the surface reports.
    pub fn set_assistant_visible(&mut self, visible: bool) -> anyhow::Result<&'static str> {
        if visible {
            if !self.assistant_created {
                self.surface.create_assistant()?;
                self.assistant_created = true;
            }
            self.surface.show_assistant()?;
            Ok("assistant shown")
        } else if self.assistant_created {
            self.surface.hide_assistant()?;
            Ok("assistant hidden")
        } else {
            Ok("assistant already hidden")
        }
    }
}

type UiJob = Box<dyn FnOnce(&mut UiContext) + Send>;

/// Why a dispatched job produced no result.
#[derive(Debug, thiserror::Error)]
pub enum UiError {
    #[error("UI loop is not running")]
    LoopStopped,
    #[error("UI job panicked: {0}")]
    Panicked(String),
}

/// Cloneable handle for running work on the UI loop.
#[derive(Debug, Clone)]
pub struct UiDispatcher {
    tx: mpsc::Sender<UiJob>,
}

impl UiDispatcher {
    /// Runs `job` on the UI loop and waits for its result.
    ///
    /// # Errors
    ///
    /// [`UiError::LoopStopped`] if the loop is gone, [`UiError::Panicked`]
    /// if the job panicked.
    pub async fn invoke<R, F>(&self, job: F) -> Result<R, UiError>
    where
        F: FnOnce(&mut UiContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let wrapped: UiJob = Box::new(move |ctx: &mut UiContext| {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| job(ctx))).map_err(|payload| {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                UiError::Panicked(msg)
            });
            let _ = reply_tx.send(result);
        });
        self.tx.send(wrapped).await.map_err(|_| UiError::LoopStopped)?;
        reply_rx.await.map_err(|_| UiError::LoopStopped)?
    }
}

/// Owns the UI surface and runs dispatched jobs in order.
pub struct UiLoop {
    rx: mpsc::Receiver<UiJob>,
    ctx: UiContext,
}

impl UiLoop {
    pub fn new(surface: impl UiSurface) -> (Self, UiDispatcher) {
        let (tx, rx) = mpsc::channel(UI_QUEUE_DEPTH);
        let ui_loop = Self {
            rx,
            ctx: UiContext {
                surface: Box::new(surface),
                assistant_created: false,
            },
        };
        (ui_loop, UiDispatcher { tx })
    }

    /// Spawns the loop as a runtime task.
    pub fn spawn(surface: impl UiSurface) -> (UiDispatcher, tokio::task::JoinHandle<()>) {
        let (ui_loop, dispatcher) = Self::new(surface);
        (dispatcher, tokio::spawn(ui_loop.run()))
    }

    /// Runs until every dispatcher is dropped.
    pub async fn run(mut self) {
        tracing::debug!("UI loop started");
        while let Some(job) = self.rx.recv().await {
            job(&mut self.ctx);
        }
        tracing::debug!("UI loop stopped");
    }

    /// Runs on the calling (non-async) thread, e.g. a toolkit's main thread.
    pub fn run_blocking(mut self) {
        while let Some(job) = self.rx.blocking_recv() {
            job(&mut self.ctx);
        }
    }
}
