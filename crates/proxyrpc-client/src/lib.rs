//! Client runtime for RPC clusters fronted by a fleet of proxies.
//!
//! Calls flow through an immutable interceptor chain (proxy bouncing, logging, mutation
//! and read retries, error context) into a base invoker that picks a proxy from the
//! [`ProxySet`] and sends over a pooled connection from the [`ConnectionPool`].

pub mod backoff;
pub mod call;
pub mod client;
pub mod config;
pub mod context;
pub mod discovery;
pub mod encoder;
pub mod interceptor;
pub mod options;
pub mod pool;
pub mod proxy_set;
pub mod tx;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use call::{Call, Reply};
pub use client::Client;
pub use config::ClientConfig;
pub use context::Context;
pub use discovery::{HttpDiscovery, ProxyDiscovery, StaticDiscovery};
pub use encoder::{Encoder, TabletTx};
pub use interceptor::{Interceptor, Invoker, Next, Pipeline};
pub use options::*;
pub use pool::{ConnectionPool, PooledConnection};
pub use proxy_set::{ProxySet, ProxySetConfig};
pub use tx::TabletTransaction;

pub use proxyrpc_common::protocol::{
    ErrorCode, ErrorKind, Method, MethodKind, MutationId, Result, Row, RowReader, RpcError,
    ServerError, TxId, TxStage,
};
