// ── Cooperative cancellation and timeouts ──
//
// Connect sequences poll a `CancellationToken` at fixed checkpoints and
// abort with the name of the last completed step. `run_with_timeout`
// bounds a whole operation without rolling back what it already did.

use std::future::Future;
use std::time::Duration;

use strum::{Display, IntoStaticStr};
use tracing::debug;

use crate::error::CoreError;

/// Checkpoints of the connect sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum ConnectStep {
    PreProvisioning,
    PostProvisioning,
    PostTransportInit,
    PostConnect,
    PostSubscribe,
    PostTwinFetch,
}

/// One-way abort signal shared between a caller and an operation.
///
/// Cheaply cloneable; every clone observes the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: tokio_util::sync::CancellationToken,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Fail with [`CoreError::Cancelled`] if the token has fired.
    pub fn check(&self, step: ConnectStep) -> Result<(), CoreError> {
        if self.is_cancelled() {
            debug!(%step, "connect sequence cancelled");
            return Err(CoreError::Cancelled {
                step: step.to_string(),
            });
        }
        Ok(())
    }

    /// A token cancelled together with this one, but cancellable on its own.
    pub fn child_token(&self) -> Self {
        Self {
            inner: self.inner.child_token(),
        }
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }
}

impl From<tokio_util::sync::CancellationToken> for CancellationToken {
    fn from(inner: tokio_util::sync::CancellationToken) -> Self {
        Self { inner }
    }
}

/// Race `operation` against a timer.
///
/// The operation runs as its own task. If the timer wins the caller gets
/// [`CoreError::Timeout`] and the task is left running to completion.
pub async fn run_with_timeout<F, T>(operation: F, duration: Duration) -> Result<T, CoreError>
where
    F: Future<Output = Result<T, CoreError>> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::spawn(operation);
    match tokio::time::timeout(duration, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(CoreError::Internal(format!("task failed: {join_err}"))),
        Err(_) => Err(CoreError::Timeout {
            timeout_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}
