//! Cancellation and deadlines for probe operations.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errorx::BoxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellable, deadline-bearing context handed to every network operation.
///
/// Cloning shares the cancellation signal. Children derived with
/// [`ProbeContext::child`] or [`ProbeContext::with_timeout`] are cancelled
/// along with their parent but can be cancelled on their own too.
#[derive(Debug, Clone)]
pub struct ProbeContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    dial_id: Option<u64>,
}

impl Default for ProbeContext {
    fn default() -> Self {
        Self::background()
    }
}

impl ProbeContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            dial_id: None,
        }
    }

    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            dial_id: self.dial_id,
        }
    }

    /// Child context whose deadline is the earlier of the parent's and
    /// `now + timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        let mut child = self.child();
        child.deadline = Some(match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        });
        child
    }

    /// Same context tagged with the id of the logical dial it belongs to.
    pub fn with_dial_id(&self, dial_id: u64) -> Self {
        Self {
            token: self.token.clone(),
            deadline: self.deadline,
            dial_id: Some(dial_id),
        }
    }

    pub fn dial_id(&self) -> Option<u64> {
        self.dial_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// `None` while the context is live.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => ContextError::Canceled,
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ContextError::Canceled
            }
        }
    }

    /// Drives `fut` unless the context ends first, in which case `fut` is
    /// dropped and the context error is returned.
    pub async fn run<F, T, E>(&self, fut: F) -> Result<T, BoxError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        if let Some(err) = self.err() {
            return Err(err.into());
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err.into()),
            result = fut => result.map_err(Into::into),
        }
    }
}
