use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use proxyrpc_common::protocol::error::{Result, RpcError};
use proxyrpc_common::protocol::{RpcRequest, RpcResponse};
use proxyrpc_common::transport::{Connection, Dialer};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::context::Context;

/// Handle to a pooled connection.
///
/// Handles are cheap to clone. The underlying connection is closed once the pool has let
/// go of it (eviction, discard) and the last handle is dropped, so a call in flight never
/// sees its connection closed under it by the pool.
#[derive(Clone)]
pub struct PooledConnection {
    entry: Arc<PoolEntry>,
}

struct PoolEntry {
    conn: Arc<dyn Connection>,
}

impl Drop for PoolEntry {
    fn drop(&mut self) {
        if self.conn.is_closed() {
            return;
        }
        let conn = self.conn.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    conn.close().await;
                });
            }
            Err(_) => {
                tracing::debug!(address = %conn.address(), "no runtime to close released connection on");
            }
        }
    }
}

impl PooledConnection {
    fn new(conn: Arc<dyn Connection>) -> Self {
        Self {
            entry: Arc::new(PoolEntry { conn }),
        }
    }

    pub fn address(&self) -> &str {
        self.entry.conn.address()
    }

    pub async fn send(&self, request: RpcRequest) -> Result<RpcResponse> {
        self.entry.conn.send(request).await
    }

    pub fn is_closed(&self) -> bool {
        self.entry.conn.is_closed()
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.entry.conn
    }

    /// Whether both handles refer to the same pool entry.
    pub fn ptr_eq(&self, other: &PooledConnection) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("address", &self.address())
            .field("closed", &self.is_closed())
            .finish()
    }
}

type DialFuture = Shared<BoxFuture<'static, Result<PooledConnection>>>;

struct PendingDial {
    id: u64,
    fut: DialFuture,
}

/// Bounded LRU pool of connections, one per address.
///
/// # Architecture
///
/// - At most one live connection per address; concurrent calls share it
/// - At most `capacity` entries; adding one more evicts the least recently used entry
/// - Concurrent requests for an address with no entry share a single dial and all observe
///   its outcome; failed dials are not cached
/// - Entries whose connection reports itself closed are replaced on the next request
///
/// # Example
///
/// ```rust,no_run
/// use proxyrpc_client::{ConnectionPool, Context};
/// use proxyrpc_common::transport::TcpDialer;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = ConnectionPool::new(Arc::new(TcpDialer::new()), 100);
/// let conn = pool.conn(&Context::background(), "127.0.0.1:9013").await?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool {
    dialer: Arc<dyn Dialer>,
    inner: Mutex<PoolInner>,
    next_dial_id: AtomicU64,
}

struct PoolInner {
    conns: LruCache<String, PooledConnection>,
    dialing: HashMap<String, PendingDial>,
    closed: bool,
}

impl ConnectionPool {
    /// Creates a pool holding up to `capacity` connections (at least one).
    ///
    /// # Arguments
    ///
    /// * `dialer` - Factory for new connections
    /// * `capacity` - Maximum number of pooled connections
    pub fn new(dialer: Arc<dyn Dialer>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            dialer,
            inner: Mutex::new(PoolInner {
                conns: LruCache::new(capacity),
                dialing: HashMap::new(),
                closed: false,
            }),
            next_dial_id: AtomicU64::new(0),
        }
    }

    /// Returns the live connection to `address`, dialing it if needed.
    ///
    /// # Errors
    ///
    /// - [`RpcError::PoolClosed`] once [`close`](Self::close) was called
    /// - the dial error when establishing the connection fails
    /// - [`RpcError::Timeout`] / [`RpcError::Cancelled`] when `ctx` ends first; the dial
    ///   itself keeps going for the other waiters
    pub async fn conn(&self, ctx: &Context, address: &str) -> Result<PooledConnection> {
        let (id, fut) = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(RpcError::PoolClosed);
            }

            if let Some(conn) = inner.conns.get(address) {
                if !conn.is_closed() {
                    return Ok(conn.clone());
                }
                tracing::debug!(address = %address, "replacing closed connection");
                inner.conns.pop(address);
            }

            match inner.dialing.get(address) {
                Some(pending) => (pending.id, pending.fut.clone()),
                None => {
                    let id = self.next_dial_id.fetch_add(1, Ordering::Relaxed);
                    let fut = self.dial(address);
                    inner.dialing.insert(
                        address.to_string(),
                        PendingDial {
                            id,
                            fut: fut.clone(),
                        },
                    );
                    (id, fut)
                }
            }
        };

        let result = ctx.run(fut).await;
        if result.as_ref().is_err_and(|e| e.is_cancellation()) {
            // A dial nobody waits for any more is dropped, so the next request dials afresh
            let mut inner = self.inner.lock().await;
            let abandoned = inner.dialing.get(address).is_some_and(|pending| {
                pending.id == id && pending.fut.strong_count().unwrap_or(0) <= 1
            });
            if abandoned {
                inner.dialing.remove(address);
            }
            return result;
        }

        // The first waiter to observe the outcome publishes it
        let evicted = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(RpcError::PoolClosed);
            }
            let owner = inner
                .dialing
                .get(address)
                .is_some_and(|pending| pending.id == id);
            if !owner {
                None
            } else {
                inner.dialing.remove(address);
                match &result {
                    Ok(conn) => inner.conns.push(address.to_string(), conn.clone()),
                    Err(_) => None,
                }
            }
        };

        if let Some((evicted_address, _)) = evicted {
            if evicted_address != address {
                tracing::debug!(address = %evicted_address, "evicted least recently used connection");
            }
        }

        result
    }

    fn dial(&self, address: &str) -> DialFuture {
        let dialer = self.dialer.clone();
        let address = address.to_string();
        async move {
            tracing::debug!(address = %address, "dialing");
            match dialer.dial(&address).await {
                Ok(conn) => Ok(PooledConnection::new(conn)),
                Err(e) => {
                    tracing::debug!(address = %address, error = %e, "dial failed");
                    Err(e)
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Drops the entry for `address`. The connection closes once no call uses it.
    pub async fn discard(&self, address: &str) {
        let removed = self.inner.lock().await.conns.pop(address);
        if removed.is_some() {
            tracing::debug!(address = %address, "discarded pooled connection");
        }
    }

    /// Closes every pooled connection. Later [`conn`](Self::conn) calls fail with
    /// [`RpcError::PoolClosed`]. Idempotent.
    pub async fn close(&self) {
        let conns: Vec<PooledConnection> = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.dialing.clear();
            let mut conns = Vec::with_capacity(inner.conns.len());
            while let Some((_, conn)) = inner.conns.pop_lru() {
                conns.push(conn);
            }
            conns
        };

        let count = conns.len();
        futures::future::join_all(conns.iter().map(|c| c.connection().close())).await;
        tracing::info!(connections = count, "connection pool closed");
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.conns.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    pub async fn contains(&self, address: &str) -> bool {
        self.inner.lock().await.conns.contains(address)
    }
}
