use async_trait::async_trait;
use proxyrpc_common::protocol::error::Result;
use std::sync::Arc;

use super::{Interceptor, Next};
use crate::call::{Call, Reply};
use crate::context::Context;
use crate::pool::ConnectionPool;
use crate::proxy_set::ProxySet;

/// Moves a call to another proxy when the selected one cannot serve it.
///
/// On a dial failure or a `WrongProxy` response the failed proxy is banned, its pooled
/// connection discarded, and the call is retried once against a different proxy. With no
/// other proxy left, a refused dial is retried on the same proxy, pinned so the retriers
/// back off there. Calls pinned to a proxy by the caller are never bounced.
pub struct ProxyBouncer {
    proxy_set: Arc<ProxySet>,
    pool: Arc<ConnectionPool>,
}

impl ProxyBouncer {
    pub fn new(proxy_set: Arc<ProxySet>, pool: Arc<ConnectionPool>) -> Self {
        Self { proxy_set, pool }
    }
}

#[async_trait]
impl Interceptor for ProxyBouncer {
    async fn intercept(&self, ctx: &Context, call: &mut Call, next: Next<'_>) -> Result<Reply> {
        if call.requested_proxy.is_some() {
            return next.run(ctx, call).await;
        }

        let err = match next.run(ctx, call).await {
            Ok(reply) => return Ok(reply),
            Err(err) => err,
        };
        if !err.should_bounce() {
            return Err(err);
        }
        let Some(failed) = call.selected_proxy.clone() else {
            return Err(err);
        };

        self.proxy_set.ban(&failed);
        self.pool.discard(&failed).await;

        let target = match self.proxy_set.pick_proxy_excluding(ctx, &[failed.as_str()]).await {
            Ok(target) => target,
            Err(pick_err) if err.is_retryable() => {
                tracing::warn!(
                    method = %call.method,
                    call_id = call.call_id,
                    address = %failed,
                    error = %pick_err,
                    "no other proxy, retrying in place"
                );
                failed.clone()
            }
            Err(pick_err) => {
                tracing::warn!(
                    method = %call.method,
                    call_id = call.call_id,
                    address = %failed,
                    error = %pick_err,
                    "no proxy to bounce call to"
                );
                return Err(err);
            }
        };

        tracing::warn!(
            method = %call.method,
            call_id = call.call_id,
            from = %failed,
            to = %target,
            error = %err,
            "bouncing call to another proxy"
        );

        call.requested_proxy = Some(target);
        let result = next.run(ctx, call).await;
        call.requested_proxy = None;
        result
    }
}
