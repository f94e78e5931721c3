//! Typed verbs on top of the invocation pipeline.
//!
//! The [`Encoder`] turns a verb and its options into a [`Call`], runs it through an
//! [`Invoker`] and decodes the reply. It performs no transaction management; the
//! [`Client`](crate::Client) wraps the row mutation verbs into ambient transactions and
//! delegates everything else here unchanged.

use proxyrpc_common::protocol::error::{Result, RpcError};
use proxyrpc_common::protocol::{encode_to_wire, decode_from_wire, Method, Row, RowReader, TxId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::{BackoffConfig, ExponentialBackoff};
use crate::call::{Call, Reply};
use crate::context::Context;
use crate::interceptor::Invoker;
use crate::options::*;

/// A transaction started on the server, with the proxy that started it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabletTx {
    pub id: TxId,
    pub proxy: Option<String>,
}

impl TabletTx {
    /// Options that run a call inside this transaction, on the proxy that owns it.
    pub fn options(&self) -> TransactionOptions {
        TransactionOptions::new(self.id).with_sticky_proxy(self.proxy.clone())
    }
}

#[derive(Deserialize)]
struct StartTxResponse {
    id: TxId,
}

#[derive(Deserialize)]
struct ValueResponse {
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize)]
struct ExistsResponse {
    exists: bool,
}

#[derive(Deserialize)]
struct CreateNodeResponse {
    node_id: String,
}

#[derive(Serialize)]
struct PathRequest<'a, O> {
    path: &'a str,
    #[serde(flatten)]
    options: &'a O,
}

#[derive(Clone)]
pub struct Encoder {
    invoker: Arc<dyn Invoker>,
    backoff: BackoffConfig,
    budget: Option<Duration>,
}

impl Encoder {
    /// # Arguments
    ///
    /// * `invoker` - Pipeline every call is sent through
    /// * `backoff` - Retry delays of every call
    /// * `budget` - Time budget of one call, retries included; `None` for unbounded
    pub fn new(invoker: Arc<dyn Invoker>, backoff: BackoffConfig, budget: Option<Duration>) -> Self {
        Self {
            invoker,
            backoff,
            budget,
        }
    }

    /// Creates a call with fresh backoff state bounded by the call budget.
    pub fn start_call(&self, method: Method, req: Value) -> Call {
        Call::new(method, req, ExponentialBackoff::new(self.backoff.clone(), self.budget))
    }

    /// Runs a call through the pipeline.
    ///
    /// The context is additionally bounded by the call budget, so a single hanging
    /// attempt cannot outlive it.
    pub async fn invoke(&self, ctx: &Context, call: &mut Call) -> Result<Reply> {
        let ctx = match self.budget {
            Some(budget) => ctx.with_timeout(budget),
            None => ctx.clone(),
        };
        self.invoker.invoke(&ctx, call).await
    }

    /// Runs a call and decodes the row set carried in the reply attachments.
    ///
    /// A reply that cannot be decoded fails the call as a whole; no rows are returned.
    pub async fn invoke_read_row(&self, ctx: &Context, call: &mut Call) -> Result<RowReader> {
        let reply = self.invoke(ctx, call).await?;

        let decoded = reply
            .rowset_descriptor()
            .and_then(|descriptor| Ok((descriptor, decode_from_wire(&reply.attachments)?)))
            .and_then(|(descriptor, rows)| RowReader::new(descriptor, rows));

        decoded.map_err(|err| RpcError::Call {
            method: call.method.to_string(),
            address: call.address().to_string(),
            attempt: call.attempts,
            source: Box::new(RpcError::Protocol(format!(
                "unable to decode response from wire format: {}",
                err
            ))),
        })
    }

    fn prepare<B: Serialize>(
        &self,
        method: Method,
        body: &B,
        transaction: &TransactionOptions,
        mutating: Option<&MutatingOptions>,
    ) -> Result<Call> {
        let req = serde_json::to_value(body)
            .map_err(|e| RpcError::InvalidRequest(format!("failed to encode {} request: {}", method, e)))?;

        Ok(self
            .start_call(method, req)
            .with_requested_proxy(transaction.sticky_proxy.clone())
            .with_mutation_id(mutating.and_then(|m| m.mutation_id)))
    }

    fn require_tx(method: Method, transaction: &TransactionOptions) -> Result<TxId> {
        transaction
            .transaction_id
            .ok_or_else(|| RpcError::InvalidRequest(format!("{} requires a transaction id", method)))
    }

    /// Starts a tablet transaction.
    ///
    /// # Returns
    ///
    /// The transaction id and the proxy that started it. Calls inside the transaction
    /// should be pinned to that proxy through [`TabletTx::options`].
    pub async fn start_tablet_tx(&self, ctx: &Context, opts: &StartTxOptions) -> Result<TabletTx> {
        let mut body = json!({ "type": "tablet" });
        if let Some(timeout) = opts.timeout {
            body["timeout_ms"] = json!(timeout.as_millis() as u64);
        }

        let mut call = self.start_call(Method::StartTransaction, body);
        let reply = self.invoke(ctx, &mut call).await?;
        let response: StartTxResponse = reply.decode()?;

        Ok(TabletTx {
            id: response.id,
            proxy: call.selected_proxy,
        })
    }

    pub async fn ping_tx(&self, ctx: &Context, tx: &TransactionOptions) -> Result<()> {
        self.finish_tx(ctx, Method::PingTransaction, tx).await
    }

    pub async fn commit_tx(&self, ctx: &Context, tx: &TransactionOptions) -> Result<()> {
        self.finish_tx(ctx, Method::CommitTransaction, tx).await
    }

    pub async fn abort_tx(&self, ctx: &Context, tx: &TransactionOptions) -> Result<()> {
        self.finish_tx(ctx, Method::AbortTransaction, tx).await
    }

    async fn finish_tx(&self, ctx: &Context, method: Method, tx: &TransactionOptions) -> Result<()> {
        let id = Self::require_tx(method, tx)?;
        let mut call = self.prepare(method, &json!({ "transaction_id": id }), tx, None)?;
        self.invoke(ctx, &mut call).await?;
        Ok(())
    }

    /// Writes rows into a dynamic table.
    pub async fn insert_rows(
        &self,
        ctx: &Context,
        path: &str,
        rows: &[Row],
        opts: &InsertRowsOptions,
    ) -> Result<()> {
        self.modify_rows(ctx, path, "write", rows, opts, &opts.transaction, &opts.mutating)
            .await
    }

    /// Deletes the rows with the given keys.
    pub async fn delete_rows(
        &self,
        ctx: &Context,
        path: &str,
        keys: &[Row],
        opts: &DeleteRowsOptions,
    ) -> Result<()> {
        self.modify_rows(ctx, path, "delete", keys, opts, &opts.transaction, &opts.mutating)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn modify_rows<O: Serialize>(
        &self,
        ctx: &Context,
        path: &str,
        modification: &str,
        rows: &[Row],
        opts: &O,
        transaction: &TransactionOptions,
        mutating: &MutatingOptions,
    ) -> Result<()> {
        let mut body = serde_json::to_value(PathRequest { path, options: opts })?;
        body["modification_type"] = json!(modification);

        let mut call = self
            .prepare(Method::ModifyRows, &body, transaction, Some(mutating))?
            .with_attachments(encode_to_wire(rows)?);
        self.invoke(ctx, &mut call).await?;
        Ok(())
    }

    /// Takes row locks on the rows with the given keys.
    pub async fn lock_rows(
        &self,
        ctx: &Context,
        path: &str,
        locks: &[String],
        lock_type: LockType,
        keys: &[Row],
        opts: &LockRowsOptions,
    ) -> Result<()> {
        let mut body = serde_json::to_value(PathRequest { path, options: opts })?;
        body["locks"] = json!(locks);
        body["lock_type"] = json!(lock_type);

        let mut call = self
            .prepare(Method::LockRows, &body, &opts.transaction, Some(&opts.mutating))?
            .with_attachments(encode_to_wire(keys)?);
        self.invoke(ctx, &mut call).await?;
        Ok(())
    }

    /// Reads the rows with the given keys.
    pub async fn lookup_rows(
        &self,
        ctx: &Context,
        path: &str,
        keys: &[Row],
        opts: &LookupRowsOptions,
    ) -> Result<RowReader> {
        let body = PathRequest { path, options: opts };
        let mut call = self
            .prepare(Method::LookupRows, &body, &opts.transaction, None)?
            .with_attachments(encode_to_wire(keys)?);
        self.invoke_read_row(ctx, &mut call).await
    }

    /// Runs a query over dynamic tables.
    pub async fn select_rows(
        &self,
        ctx: &Context,
        query: &str,
        opts: &SelectRowsOptions,
    ) -> Result<RowReader> {
        let mut body = serde_json::to_value(opts)?;
        body["query"] = json!(query);

        let mut call = self.prepare(Method::SelectRows, &body, &opts.transaction, None)?;
        self.invoke_read_row(ctx, &mut call).await
    }

    pub async fn get_node(&self, ctx: &Context, path: &str, opts: &GetNodeOptions) -> Result<Value> {
        let body = PathRequest { path, options: opts };
        let mut call = self.prepare(Method::GetNode, &body, &opts.transaction, None)?;
        let response: ValueResponse = self.invoke(ctx, &mut call).await?.decode()?;
        Ok(response.value)
    }

    pub async fn set_node(
        &self,
        ctx: &Context,
        path: &str,
        value: &Value,
        opts: &SetNodeOptions,
    ) -> Result<()> {
        let mut body = serde_json::to_value(PathRequest { path, options: opts })?;
        body["value"] = value.clone();

        let mut call = self.prepare(Method::SetNode, &body, &opts.transaction, Some(&opts.mutating))?;
        self.invoke(ctx, &mut call).await?;
        Ok(())
    }

    pub async fn exists_node(&self, ctx: &Context, path: &str, opts: &ExistsNodeOptions) -> Result<bool> {
        let body = PathRequest { path, options: opts };
        let mut call = self.prepare(Method::ExistsNode, &body, &opts.transaction, None)?;
        let response: ExistsResponse = self.invoke(ctx, &mut call).await?.decode()?;
        Ok(response.exists)
    }

    /// Lists the children of a map node.
    pub async fn list_node(&self, ctx: &Context, path: &str, opts: &ListNodeOptions) -> Result<Value> {
        let body = PathRequest { path, options: opts };
        let mut call = self.prepare(Method::ListNode, &body, &opts.transaction, None)?;
        let response: ValueResponse = self.invoke(ctx, &mut call).await?.decode()?;
        Ok(response.value)
    }

    /// Creates a node and returns its id.
    pub async fn create_node(
        &self,
        ctx: &Context,
        path: &str,
        node_type: NodeType,
        opts: &CreateNodeOptions,
    ) -> Result<String> {
        let mut body = serde_json::to_value(PathRequest { path, options: opts })?;
        body["type"] = json!(node_type);

        let mut call =
            self.prepare(Method::CreateNode, &body, &opts.transaction, Some(&opts.mutating))?;
        let response: CreateNodeResponse = self.invoke(ctx, &mut call).await?.decode()?;
        Ok(response.node_id)
    }

    pub async fn remove_node(&self, ctx: &Context, path: &str, opts: &RemoveNodeOptions) -> Result<()> {
        let body = PathRequest { path, options: opts };
        let mut call =
            self.prepare(Method::RemoveNode, &body, &opts.transaction, Some(&opts.mutating))?;
        self.invoke(ctx, &mut call).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use proxyrpc_common::protocol::error::ErrorKind;
    use std::sync::Mutex;

    /// Records calls and answers each with a fixed reply.
    struct Recorder {
        reply: Reply,
        calls: Mutex<Vec<Call>>,
    }

    impl Recorder {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn last(&self) -> Call {
            self.calls.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl Invoker for Recorder {
        async fn invoke(&self, _ctx: &Context, call: &mut Call) -> Result<Reply> {
            call.attempts += 1;
            call.selected_proxy = Some(
                call.requested_proxy
                    .clone()
                    .unwrap_or_else(|| "proxy-1:9013".to_string()),
            );
            self.calls.lock().unwrap().push(call.clone());
            Ok(self.reply.clone())
        }
    }

    fn encoder(recorder: Arc<Recorder>) -> Encoder {
        Encoder::new(recorder, BackoffConfig::default(), Some(Duration::from_secs(5)))
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_start_tablet_tx_remembers_proxy() {
        let id = TxId::new();
        let recorder = Recorder::new(Reply {
            body: json!({ "id": id }),
            attachments: Vec::new(),
        });
        let tx = encoder(recorder.clone())
            .start_tablet_tx(&Context::background(), &StartTxOptions::default())
            .await
            .unwrap();

        assert_eq!(tx.id, id);
        assert_eq!(tx.proxy.as_deref(), Some("proxy-1:9013"));
        assert_eq!(tx.options().sticky_proxy.as_deref(), Some("proxy-1:9013"));
        assert_eq!(recorder.last().method, Method::StartTransaction);
    }

    #[tokio::test]
    async fn test_tx_calls_are_pinned() {
        let recorder = Recorder::new(Reply::default());
        let tx = TabletTx {
            id: TxId::new(),
            proxy: Some("proxy-7:9013".into()),
        };
        encoder(recorder.clone())
            .commit_tx(&Context::background(), &tx.options())
            .await
            .unwrap();

        let call = recorder.last();
        assert_eq!(call.method, Method::CommitTransaction);
        assert_eq!(call.requested_proxy.as_deref(), Some("proxy-7:9013"));
        assert_eq!(call.req["transaction_id"], json!(tx.id));
    }

    #[tokio::test]
    async fn test_commit_without_transaction_is_rejected() {
        let recorder = Recorder::new(Reply::default());
        let err = encoder(recorder.clone())
            .commit_tx(&Context::background(), &TransactionOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Client);
        assert!(recorder.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_rows_carries_rows_as_attachments() {
        let recorder = Recorder::new(Reply::default());
        let rows = vec![row(json!({"a": 1})), row(json!({"a": 2}))];
        let opts = InsertRowsOptions {
            update: true,
            ..Default::default()
        };
        encoder(recorder.clone())
            .insert_rows(&Context::background(), "//t", &rows, &opts)
            .await
            .unwrap();

        let call = recorder.last();
        assert_eq!(call.method, Method::ModifyRows);
        assert_eq!(call.req["path"], json!("//t"));
        assert_eq!(call.req["modification_type"], json!("write"));
        assert_eq!(call.req["update"], json!(true));
        assert_eq!(decode_from_wire(&call.attachments).unwrap(), rows);
    }

    #[tokio::test]
    async fn test_lookup_rows_decodes_reply() {
        let rows = vec![row(json!({"k": 1, "v": "x"}))];
        let recorder = Recorder::new(Reply {
            body: json!({"rowset_descriptor": {"columns": [{"name": "k"}, {"name": "v"}]}}),
            attachments: encode_to_wire(&rows).unwrap(),
        });
        let mut reader = encoder(recorder)
            .lookup_rows(&Context::background(), "//t", &[row(json!({"k": 1}))], &Default::default())
            .await
            .unwrap();

        assert_eq!(reader.len(), 1);
        assert_eq!(reader.next_row().unwrap()["v"], json!("x"));
    }

    #[tokio::test]
    async fn test_undecodable_reply_is_a_protocol_error() {
        let recorder = Recorder::new(Reply {
            body: json!({}),
            attachments: vec![Bytes::from_static(b"\x00\x00\x00\x09{\"a\"")],
        });
        let err = encoder(recorder)
            .select_rows(&Context::background(), "* from [//t]", &Default::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("unable to decode response from wire format"));
        assert!(matches!(err, RpcError::Call { .. }));
    }

    #[tokio::test]
    async fn test_rows_violating_descriptor_are_rejected() {
        let recorder = Recorder::new(Reply {
            body: json!({"rowset_descriptor": {"columns": [{"name": "k", "required": true}]}}),
            attachments: encode_to_wire(&[row(json!({"other": 1}))]).unwrap(),
        });
        let err = encoder(recorder)
            .select_rows(&Context::background(), "* from [//t]", &Default::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_node_verbs() {
        let recorder = Recorder::new(Reply {
            body: json!({"value": {"x": 1}, "exists": true, "node_id": "1-2-3-4"}),
            attachments: Vec::new(),
        });
        let enc = encoder(recorder.clone());
        let ctx = Context::background();

        assert_eq!(enc.get_node(&ctx, "//a", &Default::default()).await.unwrap(), json!({"x": 1}));
        assert!(enc.exists_node(&ctx, "//a", &Default::default()).await.unwrap());
        let id = enc
            .create_node(&ctx, "//b", NodeType::Table, &Default::default())
            .await
            .unwrap();
        assert_eq!(id, "1-2-3-4");
        assert_eq!(recorder.last().req["type"], json!("table"));
    }
}
