use proxyrpc_common::protocol::error::{Result, RpcError};
use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::BackoffConfig;

/// Environment variable holding the discovery proxy address.
pub const ENV_PROXY: &str = "PROXYRPC_PROXY";
/// Environment variable pinning a single RPC proxy.
pub const ENV_RPC_PROXY: &str = "PROXYRPC_RPC_PROXY";
/// Environment variable holding the auth token.
pub const ENV_TOKEN: &str = "PROXYRPC_TOKEN";
/// Environment variable enabling TLS towards the discovery proxy (`1` or `true`).
pub const ENV_USE_TLS: &str = "PROXYRPC_USE_TLS";

/// Client configuration.
///
/// # Default Configuration
///
/// - `light_request_timeout`: 5 minutes (all retries and backoffs of one call included)
/// - `conn_pool_size`: 1000
/// - `tx_timeout`: 15 seconds
/// - `tx_ping_period`: 3 seconds
/// - `proxy_refresh_interval`: 60 seconds
/// - `proxy_max_staleness`: 5 minutes
/// - `proxy_ban_duration`: 60 seconds
/// - `use_tls`: false (discovery over plain HTTP unless the proxy URL is `https://`)
///
/// # Example
///
/// ```rust
/// use proxyrpc_client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::default()
///     .with_proxy("localhost:8080")
///     .with_token("secret")
///     .with_light_request_timeout(Duration::from_secs(30));
/// assert_eq!(config.get_proxy().unwrap(), "localhost:8080");
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Address of the HTTP proxy serving discovery.
    pub proxy: Option<String>,
    /// Address of a single RPC proxy. When set, discovery is disabled and every call goes
    /// there.
    pub rpc_proxy: Option<String>,
    pub token: Option<String>,
    /// Run discovery over TLS. Implied by an `https://` proxy address.
    pub use_tls: bool,
    /// Fall back to `~/.proxyrpc/token` when no token is configured.
    pub read_token_from_file: bool,
    /// Budget of one call, retries and backoffs included. Zero means unbounded.
    pub light_request_timeout: Duration,
    /// Maximum number of pooled connections.
    pub conn_pool_size: usize,
    /// The server aborts a transaction that was not pinged for this long.
    pub tx_timeout: Duration,
    pub tx_ping_period: Duration,
    /// Age after which the proxy list is refreshed before use.
    pub proxy_refresh_interval: Duration,
    /// Age after which the proxy list is no longer served when refreshing fails.
    pub proxy_max_staleness: Duration,
    /// How long a proxy that refused or failed a call is skipped by selection.
    pub proxy_ban_duration: Duration,
    pub backoff: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let proxy_refresh_interval = Duration::from_secs(60);
        Self {
            proxy: None,
            rpc_proxy: None,
            token: None,
            use_tls: false,
            read_token_from_file: false,
            light_request_timeout: Duration::from_secs(5 * 60),
            conn_pool_size: 1000,
            tx_timeout: Duration::from_secs(15),
            tx_ping_period: Duration::from_secs(3),
            proxy_refresh_interval,
            proxy_max_staleness: proxy_refresh_interval * 5,
            proxy_ban_duration: Duration::from_secs(60),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Default configuration with `proxy`, `rpc_proxy` and `token` taken from the
    /// environment.
    pub fn from_env() -> Self {
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            proxy: env(ENV_PROXY),
            rpc_proxy: env(ENV_RPC_PROXY),
            token: env(ENV_TOKEN),
            use_tls: env(ENV_USE_TLS).is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true")),
            ..Self::default()
        }
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_rpc_proxy(mut self, rpc_proxy: impl Into<String>) -> Self {
        self.rpc_proxy = Some(rpc_proxy.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_use_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn with_read_token_from_file(mut self, read: bool) -> Self {
        self.read_token_from_file = read;
        self
    }

    pub fn with_light_request_timeout(mut self, timeout: Duration) -> Self {
        self.light_request_timeout = timeout;
        self
    }

    pub fn with_conn_pool_size(mut self, size: usize) -> Self {
        self.conn_pool_size = size;
        self
    }

    pub fn with_tx_ping_period(mut self, period: Duration) -> Self {
        self.tx_ping_period = period;
        self
    }

    pub fn with_tx_timeout(mut self, timeout: Duration) -> Self {
        self.tx_timeout = timeout;
        self
    }

    pub fn with_proxy_refresh_interval(mut self, interval: Duration) -> Self {
        self.proxy_refresh_interval = interval;
        self
    }

    pub fn with_proxy_max_staleness(mut self, staleness: Duration) -> Self {
        self.proxy_max_staleness = staleness;
        self
    }

    pub fn with_proxy_ban_duration(mut self, duration: Duration) -> Self {
        self.proxy_ban_duration = duration;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Address of the discovery proxy, or of the pinned RPC proxy if that is all there is.
    pub fn get_proxy(&self) -> Result<String> {
        self.proxy
            .as_deref()
            .or(self.rpc_proxy.as_deref())
            .map(normalize_proxy_url)
            .ok_or_else(|| {
                RpcError::InvalidRequest(format!(
                    "proxy is not set (either proxy, rpc_proxy, {} or {} must be set)",
                    ENV_PROXY, ENV_RPC_PROXY
                ))
            })
    }

    /// Whether discovery runs over TLS.
    pub fn get_use_tls(&self) -> bool {
        self.use_tls
            || self
                .proxy
                .as_deref()
                .is_some_and(|p| p.trim().starts_with("https://"))
    }

    /// The pinned RPC proxy, if any.
    pub fn get_rpc_proxy(&self) -> Option<String> {
        self.rpc_proxy.as_deref().map(normalize_proxy_url)
    }

    /// The auth token, or `None` when none is configured.
    pub fn get_token(&self) -> Option<String> {
        if let Some(token) = self.token.as_ref().filter(|t| !t.is_empty()) {
            return Some(token.clone());
        }

        if self.read_token_from_file {
            let path = token_file_path()?;
            match std::fs::read_to_string(&path) {
                Ok(token) => {
                    let token = token.trim_end_matches(['\n', '\r']).to_string();
                    return (!token.is_empty()).then_some(token);
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "token file not readable");
                }
            }
        }

        None
    }

    /// Backoff budget of one call; `None` when unbounded.
    pub fn light_request_budget(&self) -> Option<Duration> {
        (!self.light_request_timeout.is_zero()).then_some(self.light_request_timeout)
    }
}

fn token_file_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(PathBuf::from(home).join(".proxyrpc").join("token"))
}

/// Strips the scheme and trailing slashes off a proxy address.
pub fn normalize_proxy_url(proxy: &str) -> String {
    proxy
        .trim()
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.light_request_timeout, Duration::from_secs(300));
        assert_eq!(config.conn_pool_size, 1000);
        assert_eq!(config.tx_timeout, Duration::from_secs(15));
        assert_eq!(config.tx_ping_period, Duration::from_secs(3));
        assert_eq!(config.proxy_max_staleness, Duration::from_secs(300));
    }

    #[test]
    fn test_get_proxy_requires_an_address() {
        let err = ClientConfig::default().get_proxy().unwrap_err();
        assert!(matches!(err, RpcError::InvalidRequest(_)));
    }

    #[test]
    fn test_get_proxy_normalizes() {
        let config = ClientConfig::default().with_proxy("http://cluster:80/");
        assert_eq!(config.get_proxy().unwrap(), "cluster:80");

        let config = ClientConfig::default().with_rpc_proxy("rpc-1:9013");
        assert_eq!(config.get_proxy().unwrap(), "rpc-1:9013");
        assert_eq!(config.get_rpc_proxy().as_deref(), Some("rpc-1:9013"));
    }

    #[test]
    fn test_tls_from_flag_or_scheme() {
        assert!(!ClientConfig::default().with_proxy("cluster:80").get_use_tls());
        assert!(ClientConfig::default().with_proxy("cluster:443").with_use_tls(true).get_use_tls());

        let config = ClientConfig::default().with_proxy("https://cluster/");
        assert!(config.get_use_tls());
        assert_eq!(config.get_proxy().unwrap(), "cluster");
    }

    #[test]
    fn test_explicit_token_wins() {
        let config = ClientConfig::default()
            .with_token("abc")
            .with_read_token_from_file(true);
        assert_eq!(config.get_token().as_deref(), Some("abc"));
        assert!(ClientConfig::default().get_token().is_none());
    }

    #[test]
    fn test_zero_timeout_is_unbounded() {
        let config = ClientConfig::default().with_light_request_timeout(Duration::ZERO);
        assert!(config.light_request_budget().is_none());
        assert_eq!(
            ClientConfig::default().light_request_budget(),
            Some(Duration::from_secs(300))
        );
    }
}
