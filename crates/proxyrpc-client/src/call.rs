use bytes::Bytes;
use proxyrpc_common::protocol::{
    generate_request_id, Method, MethodKind, MutationId, RequestId, RpcRequest, RpcResponse,
    RowsetDescriptor,
};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::backoff::ExponentialBackoff;

/// One logical RPC operation.
///
/// A call is created once per operation and retried in place: its backoff state, attempt
/// counter and mutation id persist across attempts.
#[derive(Debug, Clone)]
pub struct Call {
    pub method: Method,
    pub req: Value,
    pub attachments: Vec<Bytes>,
    /// Stays the same across attempts.
    pub call_id: RequestId,
    /// Caller-pinned proxy. When set, the call goes there unconditionally.
    pub requested_proxy: Option<String>,
    /// Proxy used by the latest attempt.
    pub selected_proxy: Option<String>,
    pub backoff: ExponentialBackoff,
    /// Number of sends so far.
    pub attempts: u32,
    pub mutation_id: Option<MutationId>,
    /// Set once a mutation is re-sent.
    pub retry: bool,
}

impl Call {
    pub fn new(method: Method, req: Value, backoff: ExponentialBackoff) -> Self {
        Self {
            method,
            req,
            attachments: Vec::new(),
            call_id: generate_request_id(),
            requested_proxy: None,
            selected_proxy: None,
            backoff,
            attempts: 0,
            mutation_id: None,
            retry: false,
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Bytes>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_requested_proxy(mut self, proxy: Option<String>) -> Self {
        self.requested_proxy = proxy;
        self
    }

    pub fn with_mutation_id(mut self, mutation_id: Option<MutationId>) -> Self {
        self.mutation_id = mutation_id;
        self
    }

    pub fn kind(&self) -> MethodKind {
        self.method.kind()
    }

    /// Address for log and error context.
    pub fn address(&self) -> &str {
        self.selected_proxy
            .as_deref()
            .or(self.requested_proxy.as_deref())
            .unwrap_or("<none>")
    }

    /// Builds the wire request of the current attempt.
    pub fn to_request(&self, token: Option<&str>) -> RpcRequest {
        let mut request = RpcRequest::new(self.method, self.req.clone())
            .with_attachments(self.attachments.clone());
        request.request_id = self.call_id;
        request.token = token.map(str::to_string);
        request.mutation_id = self.mutation_id;
        request.retry = self.retry;
        request
    }
}

/// Successful result of a call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub body: Value,
    pub attachments: Vec<Bytes>,
}

impl Reply {
    /// Deserializes the body into a typed response.
    pub fn decode<T: DeserializeOwned>(&self) -> proxyrpc_common::Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// Column layout of a row set response, empty when the body carries none.
    pub fn rowset_descriptor(&self) -> proxyrpc_common::Result<RowsetDescriptor> {
        match self.body.get("rowset_descriptor") {
            Some(Value::Null) | None => Ok(RowsetDescriptor::default()),
            Some(value) => Ok(serde_json::from_value(value.clone())?),
        }
    }
}

impl From<RpcResponse> for Reply {
    fn from(response: RpcResponse) -> Self {
        Self {
            body: response.body,
            attachments: response.attachments,
        }
    }
}
