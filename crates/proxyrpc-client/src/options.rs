//! Per-call options of the client verbs.
//!
//! Options serialize into the request body. Fields that travel outside the body (the
//! proxy a transaction is pinned to, the mutation id) are skipped by serde and applied to
//! the [`Call`](crate::call::Call) instead.

use proxyrpc_common::protocol::{MutationId, TxId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transaction a call runs in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TxId>,
    /// Proxy that started the transaction. Calls in the transaction are pinned to it.
    #[serde(skip)]
    pub sticky_proxy: Option<String>,
}

impl TransactionOptions {
    pub fn new(transaction_id: TxId) -> Self {
        Self {
            transaction_id: Some(transaction_id),
            sticky_proxy: None,
        }
    }

    pub fn with_sticky_proxy(mut self, proxy: Option<String>) -> Self {
        self.sticky_proxy = proxy;
        self
    }
}

/// Idempotence token of a mutation. Generated per call when unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutatingOptions {
    pub mutation_id: Option<MutationId>,
}

/// Options of verbs that run inside a transaction.
///
/// The ambient transaction wrapper reads and fills the transaction through this trait.
pub trait TransactionalOptions {
    fn transaction(&self) -> &TransactionOptions;
    fn transaction_mut(&mut self) -> &mut TransactionOptions;
}

macro_rules! impl_transactional {
    ($($ty:ty),* $(,)?) => {
        $(
            impl TransactionalOptions for $ty {
                fn transaction(&self) -> &TransactionOptions {
                    &self.transaction
                }

                fn transaction_mut(&mut self) -> &mut TransactionOptions {
                    &mut self.transaction
                }
            }
        )*
    };
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartTxOptions {
    /// Inactivity timeout of the transaction; the server default applies when unset.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InsertRowsOptions {
    #[serde(flatten)]
    pub transaction: TransactionOptions,
    #[serde(skip)]
    pub mutating: MutatingOptions,
    /// Rewrite only the columns present in each row.
    pub update: bool,
    /// Add to aggregate columns instead of overwriting them.
    pub aggregate: bool,
    pub require_sync_replica: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteRowsOptions {
    #[serde(flatten)]
    pub transaction: TransactionOptions,
    #[serde(skip)]
    pub mutating: MutatingOptions,
    pub require_sync_replica: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    SharedWeak,
    #[default]
    SharedStrong,
    Exclusive,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LockRowsOptions {
    #[serde(flatten)]
    pub transaction: TransactionOptions,
    #[serde(skip)]
    pub mutating: MutatingOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LookupRowsOptions {
    #[serde(flatten)]
    pub transaction: TransactionOptions,
    /// Columns to return; all when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_names: Option<Vec<String>>,
    /// Return an empty row for every key that has no row.
    pub keep_missing_rows: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SelectRowsOptions {
    #[serde(flatten)]
    pub transaction: TransactionOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_row_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_row_limit: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Map,
    Table,
    Document,
    File,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GetNodeOptions {
    #[serde(flatten)]
    pub transaction: TransactionOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SetNodeOptions {
    #[serde(flatten)]
    pub transaction: TransactionOptions,
    #[serde(skip)]
    pub mutating: MutatingOptions,
    pub recursive: bool,
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExistsNodeOptions {
    #[serde(flatten)]
    pub transaction: TransactionOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListNodeOptions {
    #[serde(flatten)]
    pub transaction: TransactionOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CreateNodeOptions {
    #[serde(flatten)]
    pub transaction: TransactionOptions,
    #[serde(skip)]
    pub mutating: MutatingOptions,
    pub recursive: bool,
    pub ignore_existing: bool,
    pub force: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoveNodeOptions {
    #[serde(flatten)]
    pub transaction: TransactionOptions,
    #[serde(skip)]
    pub mutating: MutatingOptions,
    pub recursive: bool,
    pub force: bool,
}

impl_transactional!(
    InsertRowsOptions,
    DeleteRowsOptions,
    LockRowsOptions,
    LookupRowsOptions,
    SelectRowsOptions,
    GetNodeOptions,
    SetNodeOptions,
    ExistsNodeOptions,
    ListNodeOptions,
    CreateNodeOptions,
    RemoveNodeOptions,
);
