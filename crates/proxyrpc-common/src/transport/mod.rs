//! ProxyRPC Transport Layer
//!
//! This module defines the point-to-point connection abstraction the client runtime is
//! built on, and a TCP implementation of it.
//!
//! # Architecture
//!
//! - **[`Dialer`]**: opens a [`Connection`] to an address
//! - **[`Connection`]**: sends one request and waits for its response
//! - **[`FrameCodec`]**: encodes requests/responses plus attachments into frames
//! - **Wire Format**: `[4-byte length prefix as u32 big-endian] + [frame body]`
//!
//! Connections are not multiplexed: a connection carries one exchange at a time, and
//! concurrent callers sharing it are serialized.
//!
//! # Message Size Limits
//!
//! Frames are limited to 100 MB to prevent memory exhaustion.
//!
//! # Example
//!
//! ```no_run
//! use proxyrpc_common::transport::{Dialer, TcpDialer};
//! use proxyrpc_common::protocol::{Method, RpcRequest};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dialer = TcpDialer::new();
//! let conn = dialer.dial("127.0.0.1:9013").await?;
//!
//! let request = RpcRequest::new(Method::GetNode, json!({"path": "//home"}));
//! let response = conn.send(request).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod tcp;

pub use codec::{FrameCodec, MAX_FRAME_SIZE};
pub use tcp::{read_frame, write_frame, TcpConnection, TcpDialer};

use async_trait::async_trait;
use std::sync::Arc;

use crate::protocol::error::Result;
use crate::protocol::{RpcRequest, RpcResponse};

/// Opens connections to backend addresses.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Establishes a new connection.
    ///
    /// Failures are reported as [`RpcError::Dial`](crate::protocol::RpcError::Dial): the
    /// request never left the client.
    async fn dial(&self, address: &str) -> Result<Arc<dyn Connection>>;
}

/// A live point-to-point channel to one backend address.
#[async_trait]
pub trait Connection: Send + Sync {
    fn address(&self) -> &str;

    /// Sends a request and waits for the matching response.
    async fn send(&self, request: RpcRequest) -> Result<RpcResponse>;

    /// Whether the connection is unusable. A closed connection is never reopened.
    fn is_closed(&self) -> bool;

    /// Closes the connection. Idempotent.
    async fn close(&self);
}

#[cfg(test)]
mod tests;
