//! # ProxyRPC CLI Entry Point
//!
//! Runs single client calls against a cluster fronted by RPC proxies and prints the
//! result as JSON.
//!
//! ## Usage
//!
//! ```bash
//! # List the RPC proxies known to discovery
//! proxyrpc --proxy localhost:8080 discover
//!
//! # Read a node
//! proxyrpc --proxy localhost:8080 get //home/table/@schema
//!
//! # Write rows in an ambient transaction
//! proxyrpc --proxy localhost:8080 insert //home/table --rows '[{"key": 1, "value": "a"}]'
//!
//! # Run a query against a single proxy, skipping discovery
//! proxyrpc --rpc-proxy localhost:9013 select '* from [//home/table]'
//!
//! # Send a raw request
//! proxyrpc --proxy localhost:8080 call ExistsNode --args '{"path": "//home"}'
//! ```
//!
//! ## Configuration
//!
//! `--proxy`, `--rpc-proxy`, `--token` and `--tls` override `PROXYRPC_PROXY`,
//! `PROXYRPC_RPC_PROXY`, `PROXYRPC_TOKEN` and `PROXYRPC_USE_TLS`. Without a token the CLI
//! reads `~/.proxyrpc/token`.

use anyhow::{anyhow, Result};
use argh::FromArgs;
use proxyrpc_cli::rows::{parse_rows, rows_to_json};
use proxyrpc_client::{
    Client, ClientConfig, Context, DeleteRowsOptions, GetNodeOptions, InsertRowsOptions,
    LookupRowsOptions, Method, SelectRowsOptions, TransactionOptions, TxId,
};
use serde_json::Value;
use std::time::Duration;

/// Main CLI structure parsed from command-line arguments.
///
/// Connection options are global and precede the subcommand.
#[derive(FromArgs)]
/// ProxyRPC - client for clusters fronted by RPC proxies
struct Cli {
    /// address of the HTTP proxy used for discovery
    #[argh(option)]
    proxy: Option<String>,

    /// address of a single RPC proxy; disables discovery
    #[argh(option, long = "rpc-proxy")]
    rpc_proxy: Option<String>,

    /// auth token
    #[argh(option)]
    token: Option<String>,

    /// run discovery over TLS
    #[argh(switch)]
    tls: bool,

    /// budget of one call in milliseconds, retries included (0 for unbounded)
    #[argh(option, long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// log to stderr (RUST_LOG overrides the default `info` level)
    #[argh(switch, short = 'v')]
    verbose: bool,

    #[argh(subcommand)]
    command: Commands,
}

/// Available CLI subcommands.
#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Discover(DiscoverArgs),
    Call(CallArgs),
    Get(GetArgs),
    Select(SelectArgs),
    Lookup(LookupArgs),
    Insert(InsertArgs),
    Delete(DeleteArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "discover")]
/// list the RPC proxies known to discovery
struct DiscoverArgs {}

/// Arguments for sending a raw request.
///
/// The method name is matched case-insensitively against the API methods, and `args`
/// becomes the request body unchanged.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// send a raw request and print the reply body
struct CallArgs {
    /// API method name
    #[argh(positional)]
    method: String,

    /// JSON request body
    #[argh(option, short = 'a', long = "args", default = "\"{}\".into()")]
    args: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "get")]
/// read a node
struct GetArgs {
    /// node path
    #[argh(positional)]
    path: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "select")]
/// run a query and print the rows
struct SelectArgs {
    /// query text
    #[argh(positional)]
    query: String,

    /// maximum number of rows to return
    #[argh(option, long = "limit")]
    limit: Option<u64>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "lookup")]
/// read rows by key
struct LookupArgs {
    /// table path
    #[argh(positional)]
    path: String,

    /// keys as a JSON object or array of objects
    #[argh(option, short = 'k')]
    keys: String,
}

/// Arguments for writing rows.
///
/// Without `--tx` the rows are written in an ambient transaction that is committed on
/// success and aborted otherwise.
#[derive(FromArgs)]
#[argh(subcommand, name = "insert")]
/// write rows
struct InsertArgs {
    /// table path
    #[argh(positional)]
    path: String,

    /// rows as a JSON object or array of objects
    #[argh(option, short = 'r')]
    rows: String,

    /// id of an existing transaction to write in
    #[argh(option)]
    tx: Option<String>,

    /// rewrite only the columns present in each row
    #[argh(switch)]
    update: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "delete")]
/// delete rows by key
struct DeleteArgs {
    /// table path
    #[argh(positional)]
    path: String,

    /// keys as a JSON object or array of objects
    #[argh(option, short = 'k')]
    keys: String,

    /// id of an existing transaction to delete in
    #[argh(option)]
    tx: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Stdout carries JSON output only, so logging goes to stderr and is opt-in
    if cli.verbose {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = build_config(&cli);
    tracing::debug!(proxy = ?config.proxy, rpc_proxy = ?config.rpc_proxy, "Starting client");
    let client = Client::new(config)?;

    let ctx = Context::background();
    let interrupt = ctx.cancellation_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let result = run(&client, &ctx, cli.command).await;
    client.stop().await;

    let output = result?;
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn build_config(cli: &Cli) -> ClientConfig {
    let mut config = ClientConfig::from_env().with_read_token_from_file(true);
    if let Some(proxy) = &cli.proxy {
        config = config.with_proxy(proxy.clone());
    }
    if let Some(rpc_proxy) = &cli.rpc_proxy {
        config = config.with_rpc_proxy(rpc_proxy.clone());
    }
    if let Some(token) = &cli.token {
        config = config.with_token(token.clone());
    }
    if cli.tls {
        config = config.with_use_tls(true);
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config = config.with_light_request_timeout(Duration::from_millis(timeout_ms));
    }
    config
}

fn transaction(tx: Option<&str>) -> Result<TransactionOptions> {
    match tx {
        Some(id) => Ok(TransactionOptions::new(id.parse::<TxId>()?)),
        None => Ok(TransactionOptions::default()),
    }
}

async fn run(client: &Client, ctx: &Context, command: Commands) -> Result<Value> {
    match command {
        Commands::Discover(_) => {
            let proxies = client.proxy_set().refresh(ctx).await?;
            Ok(serde_json::to_value(&*proxies)?)
        }
        Commands::Call(args) => {
            let method: Method = args.method.parse()?;
            let body: Value = serde_json::from_str(&args.args)
                .map_err(|e| anyhow!("Invalid JSON in args: {}", e))?;

            let mut call = client.start_call(method, body);
            let reply = client.invoke(ctx, &mut call).await?;
            Ok(reply.body)
        }
        Commands::Get(args) => Ok(client
            .get_node(ctx, &args.path, &GetNodeOptions::default())
            .await?),
        Commands::Select(args) => {
            let opts = SelectRowsOptions {
                output_row_limit: args.limit,
                ..Default::default()
            };
            let reader = client.select_rows(ctx, &args.query, &opts).await?;
            Ok(rows_to_json(reader))
        }
        Commands::Lookup(args) => {
            let keys = parse_rows(&args.keys)?;
            let reader = client
                .lookup_rows(ctx, &args.path, &keys, &LookupRowsOptions::default())
                .await?;
            Ok(rows_to_json(reader))
        }
        Commands::Insert(args) => {
            let rows = parse_rows(&args.rows)?;
            let opts = InsertRowsOptions {
                transaction: transaction(args.tx.as_deref())?,
                update: args.update,
                ..Default::default()
            };
            client.insert_rows(ctx, &args.path, &rows, Some(opts)).await?;
            Ok(serde_json::json!({ "inserted": rows.len() }))
        }
        Commands::Delete(args) => {
            let keys = parse_rows(&args.keys)?;
            let opts = DeleteRowsOptions {
                transaction: transaction(args.tx.as_deref())?,
                ..Default::default()
            };
            client.delete_rows(ctx, &args.path, &keys, Some(opts)).await?;
            Ok(serde_json::json!({ "deleted": keys.len() }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_global_options() {
        let args: Cli = Cli::from_args(
            &["proxyrpc"],
            &["--proxy", "localhost:8080", "--timeout-ms", "1500", "-v", "discover"],
        )
        .unwrap();
        assert_eq!(args.proxy.as_deref(), Some("localhost:8080"));
        assert_eq!(args.timeout_ms, Some(1500));
        assert!(args.verbose);
        assert!(matches!(args.command, Commands::Discover(_)));

        let config = build_config(&args);
        assert_eq!(config.light_request_timeout, Duration::from_millis(1500));
        assert_eq!(config.get_proxy().unwrap(), "localhost:8080");
    }

    #[test]
    fn test_cli_parse_tls() {
        let args: Cli =
            Cli::from_args(&["proxyrpc"], &["--proxy", "cluster:443", "--tls", "discover"]).unwrap();
        assert!(args.tls);
        assert!(build_config(&args).get_use_tls());
    }

    #[test]
    fn test_cli_parse_call() {
        let args: Cli = Cli::from_args(
            &["proxyrpc"],
            &["call", "existsnode", "--args", r#"{"path": "//home"}"#],
        )
        .unwrap();
        match args.command {
            Commands::Call(CallArgs { method, args }) => {
                assert_eq!(method.parse::<Method>().unwrap(), Method::ExistsNode);
                assert_eq!(args, r#"{"path": "//home"}"#);
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_call_default_args() {
        let args: Cli = Cli::from_args(&["proxyrpc"], &["call", "GetNode"]).unwrap();
        match args.command {
            Commands::Call(CallArgs { args, .. }) => assert_eq!(args, "{}"),
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_insert() {
        let args: Cli = Cli::from_args(
            &["proxyrpc"],
            &["--rpc-proxy", "localhost:9013", "insert", "//t", "-r", r#"{"k": 1}"#, "--update"],
        )
        .unwrap();
        match args.command {
            Commands::Insert(InsertArgs { path, rows, tx, update }) => {
                assert_eq!(path, "//t");
                assert_eq!(parse_rows(&rows).unwrap().len(), 1);
                assert!(tx.is_none());
                assert!(update);
            }
            _ => panic!("Expected Insert command"),
        }
    }

    #[test]
    fn test_cli_parse_delete_with_tx() {
        let id = TxId::new();
        let args: Cli = Cli::from_args(
            &["proxyrpc"],
            &["delete", "//t", "--keys", r#"[{"k": 1}]"#, "--tx", &id.to_string()],
        )
        .unwrap();
        match args.command {
            Commands::Delete(DeleteArgs { tx, .. }) => {
                let opts = transaction(tx.as_deref()).unwrap();
                assert_eq!(opts.transaction_id, Some(id));
            }
            _ => panic!("Expected Delete command"),
        }
    }

    #[test]
    fn test_invalid_tx_id_is_rejected() {
        assert!(transaction(Some("not-a-uuid")).is_err());
        assert!(transaction(None).unwrap().transaction_id.is_none());
    }

    #[test]
    fn test_missing_subcommand_is_rejected() {
        assert!(Cli::from_args(&["proxyrpc"], &["--proxy", "localhost:8080"]).is_err());
    }
}
