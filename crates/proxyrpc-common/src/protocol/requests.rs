use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use uuid::Uuid;

use super::error::RpcError;

pub type RequestId = u64;

/// Service every API method is addressed to.
pub const API_SERVICE: &str = "ApiService";

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generates a request id that is unique within the process.
pub fn generate_request_id() -> RequestId {
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let counter = REQUEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst);

    // Upper 32 bits from the clock, lower 32 bits from the counter
    (timestamp & 0xFFFFFFFF00000000) | (counter & 0xFFFFFFFF)
}

/// Idempotence token of a mutation. A retried mutation carrying the same id is
/// recognized by the backend as already applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(pub Uuid);

impl MutationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a server-side transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(pub Uuid);

impl TxId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TxId {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(TxId)
            .map_err(|e| RpcError::InvalidRequest(format!("invalid transaction id '{}': {}", s, e)))
    }
}

/// Whether a method only reads state or changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// Idempotent; retried freely on transient failures.
    Read,
    /// Non-idempotent; retried only with a mutation id.
    Mutation,
}

/// API methods understood by the RPC proxies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    StartTransaction,
    PingTransaction,
    CommitTransaction,
    AbortTransaction,
    ModifyRows,
    LockRows,
    LookupRows,
    SelectRows,
    GetNode,
    SetNode,
    ExistsNode,
    ListNode,
    CreateNode,
    RemoveNode,
}

impl Method {
    pub const ALL: [Method; 14] = [
        Method::StartTransaction,
        Method::PingTransaction,
        Method::CommitTransaction,
        Method::AbortTransaction,
        Method::ModifyRows,
        Method::LockRows,
        Method::LookupRows,
        Method::SelectRows,
        Method::GetNode,
        Method::SetNode,
        Method::ExistsNode,
        Method::ListNode,
        Method::CreateNode,
        Method::RemoveNode,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Method::StartTransaction => "StartTransaction",
            Method::PingTransaction => "PingTransaction",
            Method::CommitTransaction => "CommitTransaction",
            Method::AbortTransaction => "AbortTransaction",
            Method::ModifyRows => "ModifyRows",
            Method::LockRows => "LockRows",
            Method::LookupRows => "LookupRows",
            Method::SelectRows => "SelectRows",
            Method::GetNode => "GetNode",
            Method::SetNode => "SetNode",
            Method::ExistsNode => "ExistsNode",
            Method::ListNode => "ListNode",
            Method::CreateNode => "CreateNode",
            Method::RemoveNode => "RemoveNode",
        }
    }

    pub fn kind(&self) -> MethodKind {
        match self {
            Method::PingTransaction
            | Method::LookupRows
            | Method::SelectRows
            | Method::GetNode
            | Method::ExistsNode
            | Method::ListNode => MethodKind::Read,
            Method::StartTransaction
            | Method::CommitTransaction
            | Method::AbortTransaction
            | Method::ModifyRows
            | Method::LockRows
            | Method::SetNode
            | Method::CreateNode
            | Method::RemoveNode => MethodKind::Mutation,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Method {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .iter()
            .find(|m| m.name().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| RpcError::InvalidRequest(format!("unknown method '{}'", s)))
    }
}

/// A request as it travels over the wire.
///
/// The structured part (`body` plus metadata) is carried in the frame header; row data
/// travels separately in `attachments`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub request_id: RequestId,
    pub service: String,
    pub method: Method,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_id: Option<MutationId>,
    /// Set when re-sending a mutation, so the backend checks `mutation_id` for a previous apply.
    #[serde(default)]
    pub retry: bool,
    pub body: serde_json::Value,
    #[serde(skip)]
    pub attachments: Vec<Bytes>,
}

impl RpcRequest {
    pub fn new(method: Method, body: serde_json::Value) -> Self {
        RpcRequest {
            request_id: generate_request_id(),
            service: API_SERVICE.to_string(),
            method,
            token: None,
            mutation_id: None,
            retry: false,
            body,
            attachments: Vec::new(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Bytes>) -> Self {
        self.attachments = attachments;
        self
    }
}
