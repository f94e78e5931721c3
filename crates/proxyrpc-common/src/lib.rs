//! ProxyRPC Common Types and Transport
//!
//! This crate provides the wire protocol definitions and the transport abstraction
//! shared by the ProxyRPC client runtime and its tools.
//!
//! # Overview
//!
//! A ProxyRPC client talks to a cluster through a fleet of RPC proxies. This crate
//! contains everything that describes a single exchange with one proxy:
//!
//! - **Protocol Layer**: methods, requests, responses, transaction and mutation ids,
//!   the error taxonomy and the row-set attachment format
//! - **Transport Layer**: the [`Dialer`](transport::Dialer) /
//!   [`Connection`](transport::Connection) traits and their TCP implementation
//!
//! # Architecture
//!
//! - **Transport**: TCP, one exchange in flight per connection
//! - **Serialization**: JSON header plus raw attachments
//! - **Message Format**: `[4-byte length prefix as u32 big-endian] + [frame body]`
//! - **Max Message Size**: 100 MB
//!
//! # Example
//!
//! ```
//! use proxyrpc_common::{Method, RpcRequest, RpcResponse};
//! use serde_json::json;
//!
//! let request = RpcRequest::new(Method::GetNode, json!({"path": "//home"}));
//! let response = RpcResponse::success(request.request_id, json!({"value": 1}));
//! assert_eq!(response.request_id, request.request_id);
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;
