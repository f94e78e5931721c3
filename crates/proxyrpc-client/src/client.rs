use async_trait::async_trait;
use proxyrpc_common::protocol::error::Result;
use proxyrpc_common::protocol::{Method, Row, RowReader};
use proxyrpc_common::transport::{Dialer, TcpDialer};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::call::{Call, Reply};
use crate::config::ClientConfig;
use crate::context::Context;
use crate::discovery::{HttpDiscovery, ProxyDiscovery, StaticDiscovery};
use crate::encoder::{Encoder, TabletTx};
use crate::interceptor::{
    ErrorWrapper, Invoker, LoggingInterceptor, MutationRetrier, Pipeline, ProxyBouncer, ReadRetrier,
};
use crate::options::*;
use crate::pool::ConnectionPool;
use crate::proxy_set::{ProxySet, ProxySetConfig};
use crate::tx::{with_ambient_tx, TabletTransaction};

/// Sends one attempt of a call: selects the proxy, takes a pooled connection and
/// exchanges the request.
struct BaseInvoker {
    proxy_set: Arc<ProxySet>,
    pool: Arc<ConnectionPool>,
    token: Option<String>,
}

#[async_trait]
impl Invoker for BaseInvoker {
    async fn invoke(&self, ctx: &Context, call: &mut Call) -> Result<Reply> {
        let address = match &call.requested_proxy {
            Some(proxy) => proxy.clone(),
            None => self.proxy_set.pick_proxy(ctx).await?,
        };
        call.selected_proxy = Some(address.clone());
        call.attempts += 1;

        let conn = self.pool.conn(ctx, &address).await?;
        let request = call.to_request(self.token.as_deref());
        let response = ctx.run(conn.send(request)).await?;

        Ok(response.into_result()?.into())
    }
}

struct ClientInner {
    config: ClientConfig,
    proxy_set: Arc<ProxySet>,
    pool: Arc<ConnectionPool>,
    encoder: Encoder,
    stop: CancellationToken,
}

/// RPC client for a cluster fronted by RPC proxies.
///
/// Calls are spread over the discovered proxies, sent over pooled connections, retried
/// with backoff and moved to another proxy when the selected one refuses them. Row
/// mutations run inside an ambient transaction unless the caller supplies one.
///
/// The client is cheap to clone; clones share the pool and the proxy set.
///
/// # Example
///
/// ```no_run
/// use proxyrpc_client::{Client, ClientConfig, Context};
/// use serde_json::json;
///
/// # async fn example() -> proxyrpc_client::Result<()> {
/// let client = Client::new(ClientConfig::default().with_proxy("localhost:8080"))?;
/// let ctx = Context::background();
///
/// let rows = vec![json!({"key": 1, "value": "a"}).as_object().cloned().unwrap_or_default()];
/// client.insert_rows(&ctx, "//home/table", &rows, None).await?;
///
/// client.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Creates a client talking TCP to proxies found through the configured proxy.
    ///
    /// With `rpc_proxy` set, discovery is skipped and every call goes to that proxy.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let discovery: Arc<dyn ProxyDiscovery> = match config.get_rpc_proxy() {
            Some(rpc_proxy) => Arc::new(StaticDiscovery::new([rpc_proxy])),
            None => Arc::new(
                HttpDiscovery::new(config.get_proxy()?, config.get_token())?
                    .with_tls(config.get_use_tls()),
            ),
        };
        Ok(Self::with_transport(config, discovery, Arc::new(TcpDialer::new())))
    }

    /// Creates a client over a custom discovery and transport.
    pub fn with_transport(
        config: ClientConfig,
        discovery: Arc<dyn ProxyDiscovery>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let proxy_set = Arc::new(ProxySet::new(
            discovery,
            ProxySetConfig {
                refresh_interval: config.proxy_refresh_interval,
                max_staleness: config.proxy_max_staleness,
                ban_duration: config.proxy_ban_duration,
            },
        ));
        let pool = Arc::new(ConnectionPool::new(dialer, config.conn_pool_size));

        let base = BaseInvoker {
            proxy_set: proxy_set.clone(),
            pool: pool.clone(),
            token: config.get_token(),
        };
        let pipeline = Pipeline::builder(Arc::new(base))
            .with(ProxyBouncer::new(proxy_set.clone(), pool.clone()))
            .with(LoggingInterceptor)
            .with(MutationRetrier)
            .with(ReadRetrier)
            .with(ErrorWrapper)
            .build();
        let encoder = Encoder::new(
            Arc::new(pipeline),
            config.backoff.clone(),
            config.light_request_budget(),
        );

        Self {
            inner: Arc::new(ClientInner {
                config,
                proxy_set,
                pool,
                encoder,
                stop: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn proxy_set(&self) -> &Arc<ProxySet> {
        &self.inner.proxy_set
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }

    pub fn encoder(&self) -> &Encoder {
        &self.inner.encoder
    }

    /// Creates a call with backoff bounded by the light request timeout.
    pub fn start_call(&self, method: Method, req: Value) -> Call {
        self.inner.encoder.start_call(method, req)
    }

    /// Runs a call through the interceptor chain.
    pub async fn invoke(&self, ctx: &Context, call: &mut Call) -> Result<Reply> {
        self.inner.encoder.invoke(ctx, call).await
    }

    /// Runs a call and decodes the row set carried by its reply.
    pub async fn invoke_read_row(&self, ctx: &Context, call: &mut Call) -> Result<RowReader> {
        self.inner.encoder.invoke_read_row(ctx, call).await
    }

    fn abort_timeout(&self) -> std::time::Duration {
        self.inner
            .config
            .light_request_budget()
            .unwrap_or(self.inner.config.tx_timeout)
    }

    /// Writes rows, inside an ambient transaction unless `opts` names one.
    pub async fn insert_rows(
        &self,
        ctx: &Context,
        path: &str,
        rows: &[Row],
        opts: Option<InsertRowsOptions>,
    ) -> Result<()> {
        let encoder = &self.inner.encoder;
        with_ambient_tx(encoder, ctx, self.abort_timeout(), opts.unwrap_or_default(), |opts| async move {
            encoder.insert_rows(ctx, path, rows, &opts).await
        })
        .await
    }

    /// Deletes rows by key, inside an ambient transaction unless `opts` names one.
    pub async fn delete_rows(
        &self,
        ctx: &Context,
        path: &str,
        keys: &[Row],
        opts: Option<DeleteRowsOptions>,
    ) -> Result<()> {
        let encoder = &self.inner.encoder;
        with_ambient_tx(encoder, ctx, self.abort_timeout(), opts.unwrap_or_default(), |opts| async move {
            encoder.delete_rows(ctx, path, keys, &opts).await
        })
        .await
    }

    /// Locks rows by key, inside an ambient transaction unless `opts` names one.
    pub async fn lock_rows(
        &self,
        ctx: &Context,
        path: &str,
        locks: &[String],
        lock_type: LockType,
        keys: &[Row],
        opts: Option<LockRowsOptions>,
    ) -> Result<()> {
        let encoder = &self.inner.encoder;
        with_ambient_tx(encoder, ctx, self.abort_timeout(), opts.unwrap_or_default(), |opts| async move {
            encoder.lock_rows(ctx, path, locks, lock_type, keys, &opts).await
        })
        .await
    }

    /// Starts a caller-owned transaction that is pinged until committed, aborted or
    /// dropped.
    pub async fn begin_tablet_tx(&self, ctx: &Context) -> Result<TabletTransaction> {
        let opts = StartTxOptions {
            timeout: Some(self.inner.config.tx_timeout),
        };
        let tx = self.inner.encoder.start_tablet_tx(ctx, &opts).await?;
        Ok(TabletTransaction::start(
            self.inner.encoder.clone(),
            tx,
            self.inner.config.tx_ping_period,
            &self.inner.stop,
            self.abort_timeout(),
        ))
    }

    pub async fn start_tablet_tx(&self, ctx: &Context, opts: &StartTxOptions) -> Result<TabletTx> {
        self.inner.encoder.start_tablet_tx(ctx, opts).await
    }

    pub async fn ping_tx(&self, ctx: &Context, tx: &TransactionOptions) -> Result<()> {
        self.inner.encoder.ping_tx(ctx, tx).await
    }

    pub async fn commit_tx(&self, ctx: &Context, tx: &TransactionOptions) -> Result<()> {
        self.inner.encoder.commit_tx(ctx, tx).await
    }

    pub async fn abort_tx(&self, ctx: &Context, tx: &TransactionOptions) -> Result<()> {
        self.inner.encoder.abort_tx(ctx, tx).await
    }

    pub async fn lookup_rows(
        &self,
        ctx: &Context,
        path: &str,
        keys: &[Row],
        opts: &LookupRowsOptions,
    ) -> Result<RowReader> {
        self.inner.encoder.lookup_rows(ctx, path, keys, opts).await
    }

    pub async fn select_rows(&self, ctx: &Context, query: &str, opts: &SelectRowsOptions) -> Result<RowReader> {
        self.inner.encoder.select_rows(ctx, query, opts).await
    }

    pub async fn get_node(&self, ctx: &Context, path: &str, opts: &GetNodeOptions) -> Result<Value> {
        self.inner.encoder.get_node(ctx, path, opts).await
    }

    pub async fn set_node(&self, ctx: &Context, path: &str, value: &Value, opts: &SetNodeOptions) -> Result<()> {
        self.inner.encoder.set_node(ctx, path, value, opts).await
    }

    pub async fn exists_node(&self, ctx: &Context, path: &str, opts: &ExistsNodeOptions) -> Result<bool> {
        self.inner.encoder.exists_node(ctx, path, opts).await
    }

    pub async fn list_node(&self, ctx: &Context, path: &str, opts: &ListNodeOptions) -> Result<Value> {
        self.inner.encoder.list_node(ctx, path, opts).await
    }

    pub async fn create_node(
        &self,
        ctx: &Context,
        path: &str,
        node_type: NodeType,
        opts: &CreateNodeOptions,
    ) -> Result<String> {
        self.inner.encoder.create_node(ctx, path, node_type, opts).await
    }

    pub async fn remove_node(&self, ctx: &Context, path: &str, opts: &RemoveNodeOptions) -> Result<()> {
        self.inner.encoder.remove_node(ctx, path, opts).await
    }

    /// Stops transaction pingers and closes the pool. Later calls fail with
    /// [`PoolClosed`](proxyrpc_common::RpcError::PoolClosed).
    pub async fn stop(&self) {
        self.inner.stop.cancel();
        self.inner.pool.close().await;
    }
}
