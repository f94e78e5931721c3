use async_trait::async_trait;
use proxyrpc_common::protocol::error::Result;
use proxyrpc_common::protocol::{MethodKind, MutationId};

use super::{left_to_bouncer, Interceptor, Next};
use crate::call::{Call, Reply};
use crate::context::Context;

/// Retries mutations whose failure is safe to retry.
///
/// Every mutation carries a mutation id, the same across all attempts; re-sent attempts
/// are flagged as retries. The backend recognizes a retried mutation it has already
/// applied by its id and does not apply it again.
///
/// Retries stop once the call's backoff budget is spent; the last error is surfaced.
#[derive(Debug, Default, Clone, Copy)]
pub struct MutationRetrier;

#[async_trait]
impl Interceptor for MutationRetrier {
    async fn intercept(&self, ctx: &Context, call: &mut Call, next: Next<'_>) -> Result<Reply> {
        if call.kind() != MethodKind::Mutation {
            return next.run(ctx, call).await;
        }
        if call.mutation_id.is_none() {
            call.mutation_id = Some(MutationId::new());
        }

        loop {
            let err = match next.run(ctx, call).await {
                Ok(reply) => return Ok(reply),
                Err(err) => err,
            };
            if !err.is_safe_to_retry_mutation() || left_to_bouncer(call, &err) {
                return Err(err);
            }
            let Some(delay) = call.backoff.next_backoff() else {
                return Err(err);
            };

            tracing::warn!(
                method = %call.method,
                call_id = call.call_id,
                mutation_id = ?call.mutation_id,
                attempt = call.attempts,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "retrying mutation"
            );
            ctx.sleep(delay).await?;
            // A refused dial never delivered the mutation
            if !err.is_dial() {
                call.retry = true;
            }
        }
    }
}
