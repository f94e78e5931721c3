use async_trait::async_trait;
use proxyrpc_common::protocol::error::Result;
use tokio::time::Instant;

use super::{Interceptor, Next};
use crate::call::{Call, Reply};
use crate::context::Context;

/// Logs the start and outcome of every call. Never alters the result.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInterceptor;

#[async_trait]
impl Interceptor for LoggingInterceptor {
    async fn intercept(&self, ctx: &Context, call: &mut Call, next: Next<'_>) -> Result<Reply> {
        let start = Instant::now();
        tracing::debug!(
            method = %call.method,
            call_id = call.call_id,
            requested_proxy = call.requested_proxy.as_deref().unwrap_or(""),
            "call started"
        );

        let result = next.run(ctx, call).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => tracing::debug!(
                method = %call.method,
                call_id = call.call_id,
                address = %call.address(),
                attempts = call.attempts,
                elapsed_ms,
                "call finished"
            ),
            Err(err) => tracing::warn!(
                method = %call.method,
                call_id = call.call_id,
                address = %call.address(),
                attempts = call.attempts,
                elapsed_ms,
                error = %err,
                "call failed"
            ),
        }

        result
    }
}
