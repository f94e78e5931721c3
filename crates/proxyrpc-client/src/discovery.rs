//! Proxy discovery
//!
//! Discovery produces the list of RPC proxy addresses the client may talk to. The
//! cluster's HTTP proxy serves it at `GET /api/v4/discover_proxies?type=rpc` as
//! `{"proxies": ["host:port", ...]}`, over plain HTTP or TLS.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::Request;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use proxyrpc_common::protocol::error::{Result, RpcError};
use serde::Deserialize;
use std::time::Duration;

use crate::context::Context;

/// Source of RPC proxy addresses.
#[async_trait]
pub trait ProxyDiscovery: Send + Sync {
    async fn list_proxies(&self, ctx: &Context) -> Result<Vec<String>>;
}

/// Discovery through the cluster's HTTP proxy.
pub struct HttpDiscovery {
    proxy: String,
    token: Option<String>,
    use_tls: bool,
    timeout: Duration,
    client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
}

#[derive(Debug, Deserialize)]
struct DiscoverProxiesResponse {
    proxies: Vec<String>,
}

impl HttpDiscovery {
    /// Default timeout of one discovery request (60 seconds)
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// # Arguments
    ///
    /// * `proxy` - Address of the HTTP proxy (e.g. "cluster.example.com:80")
    /// * `token` - Auth token sent along with the request, if any
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Discovery`] if the TLS client cannot be set up.
    pub fn new(proxy: impl Into<String>, token: Option<String>) -> Result<Self> {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .map_err(|e| RpcError::Discovery(format!("failed to set up TLS: {}", e)))?
            .https_or_http()
            .enable_http1()
            .build();

        Ok(Self {
            proxy: proxy.into(),
            token,
            use_tls: false,
            timeout: Self::DEFAULT_TIMEOUT,
            client: Client::builder(TokioExecutor::new()).build(connector),
        })
    }

    /// Talks to the HTTP proxy over TLS, verified against the webpki root certificates.
    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{}://{}/api/v4/discover_proxies?type=rpc", scheme, self.proxy)
    }

    async fn fetch(&self) -> Result<Vec<String>> {
        let mut builder = Request::builder()
            .method("GET")
            .uri(self.url())
            .header("Accept", "application/json");
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", format!("OAuth {}", token));
        }
        let request = builder
            .body(Empty::<Bytes>::new())
            .map_err(|e| RpcError::Discovery(format!("failed to build request: {}", e)))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| {
                RpcError::Discovery(format!(
                    "request to {} timed out after {}ms",
                    self.proxy,
                    self.timeout.as_millis()
                ))
            })?
            .map_err(|e| RpcError::Discovery(format!("request to {} failed: {}", self.proxy, e)))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| RpcError::Discovery(format!("failed to read response: {}", e)))?
            .to_bytes();

        if !status.is_success() {
            return Err(RpcError::Discovery(format!(
                "{} returned {}: {}",
                self.proxy,
                status,
                String::from_utf8_lossy(&body)
            )));
        }

        let parsed: DiscoverProxiesResponse = serde_json::from_slice(&body)
            .map_err(|e| RpcError::Discovery(format!("malformed discovery response: {}", e)))?;
        Ok(parsed.proxies)
    }
}

#[async_trait]
impl ProxyDiscovery for HttpDiscovery {
    async fn list_proxies(&self, ctx: &Context) -> Result<Vec<String>> {
        ctx.run(self.fetch()).await
    }
}

/// A fixed list of proxies.
#[derive(Debug, Clone)]
pub struct StaticDiscovery {
    proxies: Vec<String>,
}

impl StaticDiscovery {
    pub fn new<I, S>(proxies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            proxies: proxies.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ProxyDiscovery for StaticDiscovery {
    async fn list_proxies(&self, _ctx: &Context) -> Result<Vec<String>> {
        Ok(self.proxies.clone())
    }
}
