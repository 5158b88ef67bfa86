//! Cross-context dispatch.
//!
//! The network context is a single-threaded Tokio runtime on its own thread;
//! all platform I/O runs there. The control context never touches the
//! platform directly: it submits work through a [`DispatchBridge`], gets a
//! [`DispatchHandle`] back and waits on it with a timeout. Waiting blocks
//! only the caller.

use crate::channels::{DirectMessenger, MessengerError};
use crate::relay::types::CorrespondentId;
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The work did not finish in time. It was not cancelled and may still
    /// take effect, so a retry can duplicate it.
    #[error("no result within {0:?}; the operation may still complete")]
    Timeout(Duration),
    #[error(transparent)]
    Messenger(#[from] MessengerError),
    /// The network context shut down or the work was cancelled.
    #[error("network context is not running")]
    Closed,
}

impl DispatchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Owns the network thread and its runtime.
pub struct NetworkContext {
    handle: Handle,
    shutdown: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl NetworkContext {
    pub fn start() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name("dmrelay-network")
            .build()
            .context("Failed to build network runtime")?;
        let handle = runtime.handle().clone();
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let thread = std::thread::Builder::new()
            .name("dmrelay-network".into())
            .spawn(move || {
                runtime.block_on(token.cancelled());
                tracing::debug!("Network context stopping");
            })
            .context("Failed to spawn network thread")?;

        Ok(Self {
            handle,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn bridge(&self) -> DispatchBridge {
        DispatchBridge::new(self.handle.clone())
    }

    /// Cancellation token that fires when the context stops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the runtime; tasks still running on it are dropped.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for NetworkContext {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Network thread panicked during shutdown");
            }
        }
    }
}

#[derive(Clone)]
pub struct DispatchBridge {
    handle: Handle,
}

impl DispatchBridge {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Run `work` as a task on the network context.
    pub fn submit<F, T>(&self, work: F) -> DispatchHandle<T>
    where
        F: Future<Output = Result<T, MessengerError>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task = self.handle.spawn(async move {
            // The receiver is gone when the caller stopped waiting.
            let _ = tx.send(work.await);
        });
        DispatchHandle {
            rx,
            abort: task.abort_handle(),
            handle: self.handle.clone(),
        }
    }

    pub fn send_message(
        &self,
        messenger: Arc<dyn DirectMessenger>,
        to: CorrespondentId,
        text: String,
    ) -> DispatchHandle<()> {
        self.submit(async move { messenger.send_message(to, &text).await })
    }

    /// Drive `future` to completion from a thread outside the network
    /// context. Timers and I/O inside it are serviced by the network thread.
    ///
    /// Panics if called from within an async context.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }
}

/// The pending result of work submitted through a [`DispatchBridge`].
pub struct DispatchHandle<T> {
    rx: oneshot::Receiver<Result<T, MessengerError>>,
    abort: AbortHandle,
    handle: Handle,
}

impl<T> DispatchHandle<T> {
    /// Handle that cancels the underlying task at its next await point.
    pub fn canceller(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Wait for the result without a deadline.
    pub async fn result(self) -> Result<T, DispatchError> {
        match self.rx.await {
            Ok(outcome) => outcome.map_err(DispatchError::from),
            Err(_) => Err(DispatchError::Closed),
        }
    }

    /// Wait up to `timeout`. On timeout the work keeps running.
    pub async fn join(self, timeout: Duration) -> Result<T, DispatchError> {
        match tokio::time::timeout(timeout, self.result()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DispatchError::Timeout(timeout)),
        }
    }

    /// Blocking [`join`](Self::join) for the control thread.
    ///
    /// Panics if called from within an async context.
    pub fn wait(self, timeout: Duration) -> Result<T, DispatchError> {
        let handle = self.handle.clone();
        handle.block_on(self.join(timeout))
    }
}
