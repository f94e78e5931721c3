use async_trait::async_trait;
use proxyrpc_common::protocol::error::{Result, RpcError};
use proxyrpc_common::protocol::MethodKind;

use super::{left_to_bouncer, Interceptor, Next};
use crate::call::{Call, Reply};
use crate::context::Context;

/// Retries read calls on retryable errors with exponential backoff.
///
/// Network errors and server errors classified as retryable are retried until the call's
/// backoff budget is spent, at which point the call fails with
/// [`RpcError::RetriesExhausted`]. Permanent errors are surfaced at once. A dial failure
/// of an unpinned call goes to the bouncer first.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadRetrier;

#[async_trait]
impl Interceptor for ReadRetrier {
    async fn intercept(&self, ctx: &Context, call: &mut Call, next: Next<'_>) -> Result<Reply> {
        if call.kind() != MethodKind::Read {
            return next.run(ctx, call).await;
        }

        loop {
            let err = match next.run(ctx, call).await {
                Ok(reply) => return Ok(reply),
                Err(err) => err,
            };
            if !err.is_retryable() || left_to_bouncer(call, &err) {
                return Err(err);
            }

            match call.backoff.next_backoff() {
                Some(delay) => {
                    tracing::warn!(
                        method = %call.method,
                        call_id = call.call_id,
                        attempt = call.attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying read"
                    );
                    ctx.sleep(delay).await?;
                }
                None => {
                    return Err(RpcError::RetriesExhausted {
                        attempts: call.attempts,
                        elapsed_ms: call.backoff.elapsed().as_millis() as u64,
                        source: Box::new(err),
                    });
                }
            }
        }
    }
}
