//! Operation context for a bootstrap attempt.
//!
//! Carries cancellation, an optional deadline and the sink that receives
//! human-readable progress messages.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::remote::RemoteError;

/// Destination for progress messages shown to the operator.
pub trait ProgressSink: Send + Sync {
    fn message(&self, msg: &str);
}

/// Writes progress to standard error.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn message(&self, msg: &str) {
        eprintln!("{msg}");
    }
}

/// Collects progress messages in memory.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    messages: Mutex<Vec<String>>,
}

impl RecordingProgress {
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

impl ProgressSink for RecordingProgress {
    fn message(&self, msg: &str) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(msg.to_string());
        }
    }
}

/// Cancellation, deadline and progress for one bootstrap attempt.
#[derive(Clone)]
pub struct BootstrapContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    progress: Arc<dyn ProgressSink>,
}

impl Default for BootstrapContext {
    fn default() -> Self {
        Self::new(Arc::new(StderrProgress))
    }
}

impl std::fmt::Debug for BootstrapContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl BootstrapContext {
    #[must_use]
    pub fn new(progress: Arc<dyn ProgressSink>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            progress,
        }
    }

    /// Use an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Fail remote calls still running `timeout` from now.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Send a progress message to the operator.
    pub fn progress(&self, msg: impl AsRef<str>) {
        self.progress.message(msg.as_ref());
    }

    /// Run a remote call, racing it against cancellation and the deadline.
    ///
    /// The future is dropped when either fires, which releases any session
    /// it holds.
    ///
    /// # Errors
    /// Returns [`RemoteError::Cancelled`] or [`RemoteError::Timeout`], or the
    /// call's own error.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, RemoteError>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(RemoteError::Cancelled);
        }
        let deadline = self.deadline;
        let timed = async move {
            match deadline {
                Some(at) => tokio::time::timeout_at(at, fut)
                    .await
                    .unwrap_or(Err(RemoteError::Timeout)),
                None => fut.await,
            }
        };
        tokio::select! {
            () = self.cancel.cancelled() => Err(RemoteError::Cancelled),
            res = timed => res,
        }
    }
}
