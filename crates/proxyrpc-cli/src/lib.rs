//! # ProxyRPC CLI
//!
//! Command-line interface for the proxyrpc client runtime.
//!
//! The binary parses arguments with `argh` and runs one client call per invocation,
//! printing the result as JSON on stdout so it can be piped into other tools.
//!
//! ## Key Commands
//!
//! - `proxyrpc discover`: List the RPC proxies known to discovery
//! - `proxyrpc call`: Send a raw request
//! - `proxyrpc get`: Read a node
//! - `proxyrpc select` / `proxyrpc lookup`: Read rows
//! - `proxyrpc insert` / `proxyrpc delete`: Write rows, inside an ambient transaction
//!   unless `--tx` names one

pub mod rows;
