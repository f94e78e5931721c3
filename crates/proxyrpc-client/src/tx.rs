//! Ambient and caller-owned tablet transactions.

use proxyrpc_common::protocol::error::{Result, RpcError};
use proxyrpc_common::protocol::{ErrorCode, TxId, TxStage};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::encoder::{Encoder, TabletTx};
use crate::options::{StartTxOptions, TransactionOptions, TransactionalOptions};

/// Runs `op` inside a transaction.
///
/// When `opts` already names a transaction the call is forwarded untouched and the caller
/// owns commit and abort. Otherwise an ambient transaction is started, `op` runs inside
/// it, and the transaction is committed once `op` succeeded. Every other exit path
/// (an error from `op`, a failed commit, the returned future being dropped) aborts it.
///
/// # Arguments
///
/// * `encoder` - Sends the transaction lifecycle calls
/// * `ctx` - Context of the start, the operation and the commit
/// * `abort_timeout` - Budget of the abort, which runs under a fresh context
/// * `opts` - Options of the wrapped operation
/// * `op` - The operation, called with the options bound to the transaction
pub(crate) async fn with_ambient_tx<O, F, Fut, T>(
    encoder: &Encoder,
    ctx: &Context,
    abort_timeout: Duration,
    mut opts: O,
    op: F,
) -> Result<T>
where
    O: TransactionalOptions,
    F: FnOnce(O) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if opts.transaction().transaction_id.is_some() {
        return op(opts).await;
    }

    let tx = encoder
        .start_tablet_tx(ctx, &StartTxOptions::default())
        .await
        .map_err(|e| RpcError::Transaction {
            stage: TxStage::Start,
            source: Box::new(e),
        })?;
    tracing::debug!(tx_id = %tx.id, proxy = ?tx.proxy, "started ambient transaction");

    let tx_opts = tx.options();
    *opts.transaction_mut() = tx_opts.clone();
    let guard = AbortGuard::new(encoder.clone(), tx, abort_timeout);

    let value = match op(opts).await {
        Ok(value) => value,
        Err(err) => {
            guard.abort().await;
            return Err(err);
        }
    };

    match encoder.commit_tx(ctx, &tx_opts).await {
        Ok(()) => {
            guard.disarm();
            Ok(value)
        }
        Err(err) => {
            guard.abort().await;
            Err(RpcError::Transaction {
                stage: TxStage::Commit,
                source: Box::new(err),
            })
        }
    }
}

/// Aborts a transaction on every exit path that did not commit it.
struct AbortGuard {
    tx: Option<TabletTx>,
    encoder: Encoder,
    timeout: Duration,
}

impl AbortGuard {
    fn new(encoder: Encoder, tx: TabletTx, timeout: Duration) -> Self {
        Self {
            tx: Some(tx),
            encoder,
            timeout,
        }
    }

    fn disarm(mut self) {
        self.tx = None;
    }

    async fn abort(mut self) {
        if let Some(tx) = self.tx.take() {
            abort_detached(&self.encoder, &tx, self.timeout).await;
        }
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        spawn_abort(self.encoder.clone(), tx, self.timeout);
    }
}

/// Aborts under a fresh context; the caller's may already be cancelled.
async fn abort_detached(encoder: &Encoder, tx: &TabletTx, timeout: Duration) {
    let ctx = Context::background().with_timeout(timeout);
    match encoder.abort_tx(&ctx, &tx.options()).await {
        Ok(()) => tracing::debug!(tx_id = %tx.id, "aborted transaction"),
        Err(e) => tracing::warn!(tx_id = %tx.id, error = %e, "failed to abort transaction"),
    }
}

fn spawn_abort(encoder: Encoder, tx: TabletTx, timeout: Duration) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                abort_detached(&encoder, &tx, timeout).await;
            });
        }
        Err(_) => {
            tracing::warn!(tx_id = %tx.id, "no runtime to abort transaction, leaving it to expire");
        }
    }
}

/// A caller-owned tablet transaction.
///
/// The transaction is kept alive by a background task pinging it every ping period until
/// it is committed, aborted or dropped. Dropping an unfinished transaction aborts it.
///
/// # Example
///
/// ```no_run
/// # use proxyrpc_client::{Client, ClientConfig, Context, InsertRowsOptions};
/// # async fn example(client: Client, rows: Vec<proxyrpc_client::Row>) -> proxyrpc_client::Result<()> {
/// let ctx = Context::background();
/// let tx = client.begin_tablet_tx(&ctx).await?;
///
/// let opts = InsertRowsOptions {
///     transaction: tx.options(),
///     ..Default::default()
/// };
/// client.insert_rows(&ctx, "//home/table", &rows, Some(opts)).await?;
/// tx.commit(&ctx).await?;
/// # Ok(())
/// # }
/// ```
pub struct TabletTransaction {
    tx: TabletTx,
    encoder: Encoder,
    pinger: CancellationToken,
    abort_timeout: Duration,
    finished: bool,
}

impl TabletTransaction {
    /// Takes ownership of a started transaction and starts pinging it.
    ///
    /// # Arguments
    ///
    /// * `encoder` - Sends pings, commit and abort
    /// * `tx` - The started transaction
    /// * `ping_period` - Interval between pings
    /// * `stop` - Parent signal; cancelling it stops the pinger
    /// * `abort_timeout` - Budget of pings and of the abort on drop
    pub(crate) fn start(
        encoder: Encoder,
        tx: TabletTx,
        ping_period: Duration,
        stop: &CancellationToken,
        abort_timeout: Duration,
    ) -> Self {
        let pinger = stop.child_token();
        tokio::spawn(ping_loop(
            encoder.clone(),
            tx.clone(),
            ping_period,
            pinger.clone(),
            abort_timeout,
        ));

        Self {
            tx,
            encoder,
            pinger,
            abort_timeout,
            finished: false,
        }
    }

    pub fn id(&self) -> TxId {
        self.tx.id
    }

    /// Proxy the transaction is pinned to.
    pub fn proxy(&self) -> Option<&str> {
        self.tx.proxy.as_deref()
    }

    /// Options running a call inside this transaction.
    pub fn options(&self) -> TransactionOptions {
        self.tx.options()
    }

    pub async fn ping(&self, ctx: &Context) -> Result<()> {
        self.encoder.ping_tx(ctx, &self.tx.options()).await
    }

    /// Commits the transaction. On failure the transaction is aborted on drop.
    pub async fn commit(mut self, ctx: &Context) -> Result<()> {
        self.pinger.cancel();
        let result = self.encoder.commit_tx(ctx, &self.tx.options()).await;
        if result.is_ok() {
            self.finished = true;
        }
        result
    }

    pub async fn abort(mut self, ctx: &Context) -> Result<()> {
        self.pinger.cancel();
        self.finished = true;
        self.encoder.abort_tx(ctx, &self.tx.options()).await
    }
}

impl Drop for TabletTransaction {
    fn drop(&mut self) {
        self.pinger.cancel();
        if !self.finished {
            spawn_abort(self.encoder.clone(), self.tx.clone(), self.abort_timeout);
        }
    }
}

async fn ping_loop(
    encoder: Encoder,
    tx: TabletTx,
    period: Duration,
    stop: CancellationToken,
    timeout: Duration,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let opts = tx.options();

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {}
        }

        let ctx = Context::background()
            .with_cancellation(stop.clone())
            .with_timeout(timeout);
        match encoder.ping_tx(&ctx, &opts).await {
            Ok(()) => tracing::trace!(tx_id = %tx.id, "pinged transaction"),
            Err(e) if e.is_server_code(ErrorCode::NoSuchTransaction) => {
                tracing::warn!(tx_id = %tx.id, "transaction expired, stopping pings");
                break;
            }
            Err(e) if e.is_cancellation() && stop.is_cancelled() => break,
            Err(e) => tracing::warn!(tx_id = %tx.id, error = %e, "failed to ping transaction"),
        }
    }
}
