//! Session-wide cleanup on completion and on termination signals

use std::io;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use kstrace_k8s::CleanupError;
use parking_lot::Mutex;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Exit status after an interrupted session (128 + SIGINT)
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

type CleanupFn = Box<dyn Fn() -> BoxFuture<'static, Result<(), CleanupError>> + Send + Sync>;

/// Ordered registry of cleanup callbacks plus the session's cancellation token.
///
/// Callbacks must be idempotent: they run once on the interrupt path and may
/// run again on the normal path of a worker that was still unwinding.
pub struct CleanupCoordinator {
    token: CancellationToken,
    callbacks: Mutex<Vec<(String, CleanupFn)>>,
}

impl CleanupCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Token observed by every worker of the session
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn register<F, Fut>(&self, label: impl Into<String>, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CleanupError>> + Send + 'static,
    {
        let label = label.into();
        tracing::debug!(cleanup = %label, "Registered cleanup");
        let boxed: CleanupFn = Box::new(move || callback().boxed());
        self.callbacks.lock().push((label, boxed));
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every callback in registration order. Failures are logged and
    /// collected; they never stop the remaining callbacks.
    pub async fn run_all(&self) -> Vec<CleanupError> {
        let pending: Vec<_> = self
            .callbacks
            .lock()
            .iter()
            .map(|(label, callback)| (label.clone(), callback()))
            .collect();

        let mut failures = Vec::new();
        for (label, cleanup) in pending {
            if let Err(e) = cleanup.await {
                tracing::warn!(cleanup = %label, "{e}");
                failures.push(e);
            }
        }
        failures
    }

    /// Cancel all workers, run every cleanup and return the exit status to use
    pub async fn handle_interrupt(&self) -> i32 {
        tracing::info!("Cleanup signal received");
        self.token.cancel();

        let failures = self.run_all().await;
        if !failures.is_empty() {
            tracing::warn!(leaked = failures.len(), "Some resources require manual deletion");
        }

        tracing::info!("Closing...");
        INTERRUPTED_EXIT_CODE
    }

    /// Watch for SIGINT and SIGTERM. On either, cancels the session and
    /// runs every cleanup; [`SignalGuard::finish`] waits for that to end.
    pub fn install_signal_handler(self: &Arc<Self>) -> io::Result<SignalGuard> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        Ok(self.on_interrupt(async move {
            tokio::select! {
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT");
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM");
                }
            }
        }))
    }

    /// Run [`Self::handle_interrupt`] once `trigger` resolves
    pub fn on_interrupt<F>(self: &Arc<Self>, trigger: F) -> SignalGuard
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            trigger.await;
            coordinator.handle_interrupt().await
        });

        SignalGuard {
            token: self.token(),
            handle: Some(handle),
        }
    }
}

impl Default for CleanupCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the interrupt handler task; stops listening when dropped
pub struct SignalGuard {
    token: CancellationToken,
    handle: Option<JoinHandle<i32>>,
}

impl SignalGuard {
    /// Stop listening, or, if an interrupt already started cleaning up, wait
    /// for it to finish and return its exit status.
    ///
    /// The handler cancels the token before its first await, so an
    /// uncancelled token means no cleanup is in flight.
    pub async fn finish(mut self) -> Option<i32> {
        let handle = self.handle.take()?;
        if !self.token.is_cancelled() {
            handle.abort();
            return None;
        }

        match handle.await {
            Ok(code) => Some(code),
            Err(e) => {
                tracing::warn!("Interrupt cleanup did not complete: {e}");
                Some(INTERRUPTED_EXIT_CODE)
            }
        }
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
