//! Deadlines and cancellation for calls.

use proxyrpc_common::protocol::error::{Result, RpcError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Carries a caller's deadline and cancellation signal through a call.
///
/// Every blocking step of the runtime (discovery, dial, send, backoff sleeps) is raced
/// against the context through [`Context::run`]. Expiry of the deadline surfaces as
/// [`RpcError::Timeout`], cancellation as [`RpcError::Cancelled`].
///
/// Contexts are cheap to clone. Clones share the cancellation signal.
///
/// # Example
///
/// ```
/// use proxyrpc_client::Context;
/// use std::time::Duration;
///
/// let ctx = Context::background().with_timeout(Duration::from_secs(5));
/// assert!(ctx.deadline().is_some());
/// ```
#[derive(Debug, Clone)]
pub struct Context {
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl Context {
    /// A context without deadline that is never cancelled.
    pub fn background() -> Self {
        Self {
            deadline: None,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Bounds the context by `timeout` from now. An earlier existing deadline wins.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        match self.deadline {
            Some(existing) if existing <= deadline => self.clone(),
            _ => Self {
                deadline: Some(deadline),
                timeout: Some(timeout),
                cancel: self.cancel.clone(),
            },
        }
    }

    /// Replaces the cancellation signal.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            deadline: self.deadline,
            timeout: self.timeout,
            cancel: token,
        }
    }

    /// A context cancelled together with this one, that can also be cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            timeout: self.timeout,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The error the context resolves to, if it is already done.
    pub fn err(&self) -> Option<RpcError> {
        if self.cancel.is_cancelled() {
            return Some(RpcError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(self.timeout_error()),
            _ => None,
        }
    }

    fn timeout_error(&self) -> RpcError {
        RpcError::Timeout(self.timeout.map(|t| t.as_millis() as u64).unwrap_or(0))
    }

    /// Runs `fut` until it completes, the deadline passes or the context is cancelled.
    ///
    /// A future cut short is dropped.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(RpcError::Cancelled),
                    _ = tokio::time::sleep_until(deadline) => Err(self.timeout_error()),
                    result = fut => result,
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(RpcError::Cancelled),
                    result = fut => result,
                }
            }
        }
    }

    /// Sleeps for `duration` unless the context ends first.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
