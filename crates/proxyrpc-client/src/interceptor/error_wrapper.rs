use async_trait::async_trait;
use proxyrpc_common::protocol::error::{Result, RpcError};

use super::{Interceptor, Next};
use crate::call::{Call, Reply};
use crate::context::Context;

/// Attaches call context (method, proxy, attempt) to errors.
///
/// Errors already carrying context are left as they are.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorWrapper;

#[async_trait]
impl Interceptor for ErrorWrapper {
    async fn intercept(&self, ctx: &Context, call: &mut Call, next: Next<'_>) -> Result<Reply> {
        match next.run(ctx, call).await {
            Ok(reply) => Ok(reply),
            Err(err @ RpcError::Call { .. }) => Err(err),
            Err(err) => Err(RpcError::Call {
                method: call.method.to_string(),
                address: call.address().to_string(),
                attempt: call.attempts,
                source: Box::new(err),
            }),
        }
    }
}
