//! Scripted in-memory backend for client integration tests.
//!
//! The backend implements [`Dialer`] and hands out connections that answer requests from
//! a shared state machine:
//!
//! - transactions go through `active -> committed | aborted`; rows written inside a
//!   transaction become visible on commit
//! - mutations are deduplicated by mutation id: a retried mutation whose id was already
//!   applied succeeds without being applied again
//! - faults can be queued per method, and addresses can be made to refuse dials, for
//!   good or a given number of times

#![allow(dead_code)]

use async_trait::async_trait;
use proxyrpc_client::{Client, ClientConfig, StaticDiscovery};
use proxyrpc_client::{BackoffConfig, ErrorCode, Method, MutationId, Row, ServerError, TxId};
use proxyrpc_common::protocol::{decode_from_wire, encode_to_wire, RpcRequest, RpcResponse};
use proxyrpc_common::transport::{Connection, Dialer};
use proxyrpc_common::RpcError;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the backend does with a request instead of answering it normally.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Answer with a structured error; nothing is applied.
    Server(ServerError),
    /// Fail the exchange before the request is applied.
    Transport,
    /// Apply the request, then lose the response.
    ApplyThenDrop,
    /// Never answer.
    Hang,
}

/// One request as received by the backend.
#[derive(Debug, Clone)]
pub struct Received {
    pub address: String,
    pub method: Method,
    pub transaction_id: Option<TxId>,
    pub mutation_id: Option<MutationId>,
    pub retry: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    Aborted,
}

#[derive(Default)]
struct State {
    received: Vec<Received>,
    faults: HashMap<Method, VecDeque<Fault>>,
    sticky_faults: HashMap<Method, Fault>,
    refuse_dial: HashSet<String>,
    refuse_next_dials: HashMap<String, usize>,
    applied_mutations: HashSet<MutationId>,
    applied_writes: usize,
    txs: HashMap<TxId, TxState>,
    pending: HashMap<TxId, Vec<Row>>,
    rows: Vec<Row>,
    read_reply: Option<(Value, Vec<bytes::Bytes>)>,
}

impl State {
    fn is_active(&self, tx: TxId) -> bool {
        self.txs.get(&tx) == Some(&TxState::Active)
    }
}

#[derive(Default)]
pub struct MockBackend {
    state: Mutex<State>,
    dials: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Queues a fault for the next request of `method`.
    pub fn fail_next(&self, method: Method, fault: Fault) {
        self.state().faults.entry(method).or_default().push_back(fault);
    }

    /// Applies `fault` to every request of `method`.
    pub fn fail_always(&self, method: Method, fault: Fault) {
        self.state().sticky_faults.insert(method, fault);
    }

    pub fn refuse_dial(&self, address: &str) {
        self.state().refuse_dial.insert(address.to_string());
    }

    /// Refuses the next `count` dials to `address`, then accepts again.
    pub fn refuse_next_dials(&self, address: &str, count: usize) {
        self.state().refuse_next_dials.insert(address.to_string(), count);
    }

    /// Replaces the reply of row reads.
    pub fn set_read_reply(&self, body: Value, attachments: Vec<bytes::Bytes>) {
        self.state().read_reply = Some((body, attachments));
    }

    pub fn received(&self) -> Vec<Received> {
        self.state().received.clone()
    }

    pub fn methods(&self) -> Vec<Method> {
        self.received().into_iter().map(|r| r.method).collect()
    }

    pub fn count(&self, method: Method) -> usize {
        self.received().iter().filter(|r| r.method == method).count()
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Number of row writes that took effect.
    pub fn applied_writes(&self) -> usize {
        self.state().applied_writes
    }

    /// Rows visible outside any transaction.
    pub fn rows(&self) -> Vec<Row> {
        self.state().rows.clone()
    }

    pub fn tx_state(&self, id: TxId) -> Option<TxState> {
        self.state().txs.get(&id).copied()
    }

    async fn handle(&self, address: &str, request: RpcRequest) -> proxyrpc_client::Result<RpcResponse> {
        let transaction_id = request
            .body
            .get("transaction_id")
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        let fault = {
            let mut state = self.state();
            state.received.push(Received {
                address: address.to_string(),
                method: request.method,
                transaction_id,
                mutation_id: request.mutation_id,
                retry: request.retry,
            });
            let queued = state
                .faults
                .get_mut(&request.method)
                .and_then(|q| q.pop_front());
            queued.or_else(|| state.sticky_faults.get(&request.method).cloned())
        };

        match fault {
            Some(Fault::Server(err)) => Ok(RpcResponse::error(request.request_id, err)),
            Some(Fault::Transport) => Err(RpcError::Transport("connection reset by peer".into())),
            Some(Fault::ApplyThenDrop) => {
                let _ = self.apply(&request, transaction_id);
                Err(RpcError::Transport("connection reset by peer".into()))
            }
            Some(Fault::Hang) => std::future::pending().await,
            None => Ok(self.apply(&request, transaction_id)),
        }
    }

    fn apply(&self, request: &RpcRequest, transaction_id: Option<TxId>) -> RpcResponse {
        let id = request.request_id;
        let mut state = self.state();

        if let Some(mutation_id) = request.mutation_id {
            if state.applied_mutations.contains(&mutation_id) {
                if request.retry {
                    return RpcResponse::success(id, json!({}));
                }
                return RpcResponse::error(
                    id,
                    ServerError::new(ErrorCode::InvalidRequest, "duplicate mutation id"),
                );
            }
        }

        let tx_error = |tx: TxId| {
            RpcResponse::error(
                id,
                ServerError::new(ErrorCode::NoSuchTransaction, format!("no such transaction {}", tx)),
            )
        };
        let response = match request.method {
            Method::StartTransaction => {
                let tx = TxId::new();
                state.txs.insert(tx, TxState::Active);
                RpcResponse::success(id, json!({ "id": tx }))
            }
            Method::PingTransaction => match transaction_id {
                Some(tx) if state.is_active(tx) => RpcResponse::success(id, json!({})),
                _ => tx_error(transaction_id.unwrap_or_default()),
            },
            Method::CommitTransaction => match transaction_id {
                Some(tx) if state.is_active(tx) => {
                    state.txs.insert(tx, TxState::Committed);
                    let rows = state.pending.remove(&tx).unwrap_or_default();
                    state.rows.extend(rows);
                    RpcResponse::success(id, json!({}))
                }
                _ => tx_error(transaction_id.unwrap_or_default()),
            },
            Method::AbortTransaction => match transaction_id {
                Some(tx) => {
                    if state.is_active(tx) {
                        state.txs.insert(tx, TxState::Aborted);
                        state.pending.remove(&tx);
                    }
                    RpcResponse::success(id, json!({}))
                }
                None => tx_error(TxId::default()),
            },
            Method::ModifyRows | Method::LockRows => {
                let rows = match decode_from_wire(&request.attachments) {
                    Ok(rows) => rows,
                    Err(e) => {
                        return RpcResponse::error(id, ServerError::new(ErrorCode::InvalidRequest, e.to_string()))
                    }
                };
                match transaction_id {
                    Some(tx) if !state.is_active(tx) => tx_error(tx),
                    Some(tx) => {
                        if request.method == Method::ModifyRows {
                            state.pending.entry(tx).or_default().extend(rows);
                            state.applied_writes += 1;
                        }
                        RpcResponse::success(id, json!({}))
                    }
                    None => {
                        if request.method == Method::ModifyRows {
                            state.rows.extend(rows);
                            state.applied_writes += 1;
                        }
                        RpcResponse::success(id, json!({}))
                    }
                }
            }
            Method::LookupRows | Method::SelectRows => match state.read_reply.clone() {
                Some((body, attachments)) => RpcResponse::success(id, body).with_attachments(attachments),
                None => {
                    let attachments = encode_to_wire(&state.rows).unwrap_or_default();
                    RpcResponse::success(id, json!({})).with_attachments(attachments)
                }
            },
            Method::GetNode | Method::ListNode => RpcResponse::success(id, json!({ "value": null })),
            Method::ExistsNode => RpcResponse::success(id, json!({ "exists": false })),
            Method::CreateNode => RpcResponse::success(id, json!({ "node_id": "0-0-0-1" })),
            Method::SetNode | Method::RemoveNode => RpcResponse::success(id, json!({})),
        };

        if let Some(mutation_id) = request.mutation_id {
            if response.error.is_none() {
                state.applied_mutations.insert(mutation_id);
            }
        }
        response
    }
}

/// Dialer handing out connections to a shared [`MockBackend`].
pub struct MockDialer(pub Arc<MockBackend>);

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, address: &str) -> proxyrpc_client::Result<Arc<dyn Connection>> {
        self.0.dials.fetch_add(1, Ordering::SeqCst);
        let refused = {
            let mut state = self.0.state();
            let transient = match state.refuse_next_dials.get_mut(address) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            };
            transient || state.refuse_dial.contains(address)
        };
        if refused {
            return Err(RpcError::Dial {
                address: address.to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(Arc::new(MockConnection {
            backend: self.0.clone(),
            address: address.to_string(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockConnection {
    backend: Arc<MockBackend>,
    address: String,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for MockConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn send(&self, request: RpcRequest) -> proxyrpc_client::Result<RpcResponse> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Transport("connection closed".into()));
        }
        self.backend.handle(&self.address, request).await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Backoff of 100ms doubling up to 1s, without jitter.
pub fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        initial_interval: Duration::from_millis(100),
        multiplier: 2.0,
        max_interval: Duration::from_secs(1),
        randomization_factor: 0.0,
    }
}

pub fn test_config() -> ClientConfig {
    ClientConfig::default()
        .with_light_request_timeout(Duration::from_secs(2))
        .with_backoff(fast_backoff())
}

/// A client over the mock backend with the given proxies.
pub fn client(backend: &Arc<MockBackend>, proxies: &[&str]) -> Client {
    client_with_config(backend, proxies, test_config())
}

pub fn client_with_config(backend: &Arc<MockBackend>, proxies: &[&str], config: ClientConfig) -> Client {
    Client::with_transport(
        config,
        Arc::new(StaticDiscovery::new(proxies.iter().copied())),
        Arc::new(MockDialer(backend.clone())),
    )
}

pub fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap_or_default()
}
