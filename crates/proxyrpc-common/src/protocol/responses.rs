//! ProxyRPC Response Types
//!
//! This module defines the response message a proxy sends back for every request.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::ServerError;
use super::RequestId;

/// A response returned by a proxy.
///
/// # Fields
///
/// - `request_id`: The id of the request this response answers
/// - `body`: Structured result (present on success, `null` otherwise)
/// - `error`: Structured failure (present on failure)
/// - `attachments`: Raw payloads carried next to the body, e.g. row sets
///
/// # Example
///
/// ```
/// use proxyrpc_common::protocol::{ErrorCode, RpcResponse, ServerError};
/// use serde_json::json;
///
/// let ok = RpcResponse::success(7, json!({"value": 42}));
/// assert!(ok.error.is_none());
///
/// let failed = RpcResponse::error(7, ServerError::new(ErrorCode::RetryLater, "busy"));
/// assert!(failed.error.is_some());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub request_id: RequestId,
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ServerError>,
    #[serde(skip)]
    pub attachments: Vec<Bytes>,
}

impl RpcResponse {
    pub fn success(request_id: RequestId, body: serde_json::Value) -> Self {
        RpcResponse {
            request_id,
            body,
            error: None,
            attachments: Vec::new(),
        }
    }

    pub fn error(request_id: RequestId, error: ServerError) -> Self {
        RpcResponse {
            request_id,
            body: serde_json::Value::Null,
            error: Some(error),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Bytes>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Converts a structured failure into an error, leaving successful responses intact.
    pub fn into_result(self) -> Result<Self, ServerError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}
