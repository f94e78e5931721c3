use proxyrpc_common::protocol::error::{Result, RpcError};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::context::Context;
use crate::discovery::ProxyDiscovery;

/// Proxy set configuration.
///
/// # Default Configuration
///
/// - `refresh_interval`: 60 seconds
/// - `max_staleness`: 5 minutes
/// - `ban_duration`: 60 seconds
#[derive(Debug, Clone)]
pub struct ProxySetConfig {
    /// A list younger than this is used without asking discovery.
    pub refresh_interval: Duration,
    /// When discovery fails, a list younger than this is still served.
    pub max_staleness: Duration,
    /// How long a banned proxy is skipped by selection.
    pub ban_duration: Duration,
}

impl Default for ProxySetConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            max_staleness: Duration::from_secs(300),
            ban_duration: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
struct ProxyState {
    proxies: Arc<Vec<String>>,
    updated_at: Option<Instant>,
    /// Bumped by every completed refresh attempt, successful or not.
    generation: u64,
    last_error: Option<RpcError>,
    banned: HashMap<String, Instant>,
}

impl ProxyState {
    fn age(&self) -> Option<Duration> {
        self.updated_at.map(|t| t.elapsed())
    }

    fn is_fresh(&self, config: &ProxySetConfig) -> bool {
        !self.proxies.is_empty() && self.age().is_some_and(|age| age < config.refresh_interval)
    }

    fn is_usable(&self, config: &ProxySetConfig) -> bool {
        !self.proxies.is_empty() && self.age().is_some_and(|age| age < config.max_staleness)
    }
}

/// The known RPC proxies and the policy for choosing one.
///
/// # Refresh
///
/// The list is refreshed lazily: a caller finding it empty or older than
/// `refresh_interval` triggers discovery. Concurrent callers share one refresh; while it
/// runs they wait for its outcome instead of issuing their own.
///
/// If discovery fails, the previous list is served as long as it is younger than
/// `max_staleness`. Older lists are rejected with the discovery error.
///
/// # Selection
///
/// Uniformly random over the known proxies, skipping banned ones. If every proxy is
/// banned the bans are ignored.
pub struct ProxySet {
    discovery: Arc<dyn ProxyDiscovery>,
    config: ProxySetConfig,
    state: RwLock<ProxyState>,
    refresh_lock: Mutex<()>,
}

impl ProxySet {
    pub fn new(discovery: Arc<dyn ProxyDiscovery>, config: ProxySetConfig) -> Self {
        Self {
            discovery,
            config,
            state: RwLock::new(ProxyState::default()),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ProxySetConfig {
        &self.config
    }

    fn read<R>(&self, f: impl FnOnce(&ProxyState) -> R) -> R {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        f(&state)
    }

    fn write<R>(&self, f: impl FnOnce(&mut ProxyState) -> R) -> R {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Picks a proxy for a call.
    pub async fn pick_proxy(&self, ctx: &Context) -> Result<String> {
        self.pick_proxy_excluding(ctx, &[]).await
    }

    /// Picks a proxy other than the ones in `exclude`.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Discovery`] if no list is available, or every known proxy is excluded
    pub async fn pick_proxy_excluding(&self, ctx: &Context, exclude: &[&str]) -> Result<String> {
        let proxies = self.proxies(ctx).await?;
        self.select(&proxies, exclude)
    }

    fn select(&self, proxies: &[String], exclude: &[&str]) -> Result<String> {
        let now = Instant::now();
        let candidates: Vec<&String> = proxies
            .iter()
            .filter(|p| !exclude.contains(&p.as_str()))
            .collect();
        if candidates.is_empty() {
            return Err(RpcError::Discovery(format!(
                "no proxy available besides {}",
                exclude.join(", ")
            )));
        }

        let allowed: Vec<&String> = self.write(|state| {
            state.banned.retain(|_, until| *until > now);
            candidates
                .iter()
                .copied()
                .filter(|p| !state.banned.contains_key(p.as_str()))
                .collect()
        });

        let pool = if allowed.is_empty() { &candidates } else { &allowed };
        pool.choose(&mut rand::thread_rng())
            .map(|p| (*p).clone())
            .ok_or_else(|| RpcError::Discovery("empty proxy list".to_string()))
    }

    /// Skips `address` in selection for the configured ban duration.
    pub fn ban(&self, address: &str) {
        let until = Instant::now() + self.config.ban_duration;
        self.write(|state| {
            state.banned.insert(address.to_string(), until);
        });
        tracing::warn!(address = %address, ban_secs = self.config.ban_duration.as_secs(), "banned proxy");
    }

    pub fn is_banned(&self, address: &str) -> bool {
        let now = Instant::now();
        self.read(|state| state.banned.get(address).is_some_and(|until| *until > now))
    }

    /// Currently known proxies, without triggering a refresh.
    pub fn known_proxies(&self) -> Vec<String> {
        self.read(|state| state.proxies.as_ref().clone())
    }

    /// Returns a usable proxy list, refreshing it first if it is empty or old.
    pub async fn proxies(&self, ctx: &Context) -> Result<Arc<Vec<String>>> {
        let seen = self.read(|state| {
            if state.is_fresh(&self.config) {
                Ok(state.proxies.clone())
            } else {
                Err(state.generation)
            }
        });
        let seen_generation = match seen {
            Ok(proxies) => return Ok(proxies),
            Err(generation) => generation,
        };

        let _guard = ctx.run(async { Ok(self.refresh_lock.lock().await) }).await?;

        // Someone else refreshed while we were waiting: share their outcome
        let shared = self.read(|state| {
            if state.generation == seen_generation {
                return None;
            }
            if state.is_usable(&self.config) {
                return Some(Ok(state.proxies.clone()));
            }
            Some(Err(state
                .last_error
                .clone()
                .unwrap_or_else(|| RpcError::Discovery("no proxies known".to_string()))))
        });
        if let Some(outcome) = shared {
            return outcome;
        }

        self.refresh_locked(ctx).await
    }

    /// Forces a refresh.
    pub async fn refresh(&self, ctx: &Context) -> Result<Arc<Vec<String>>> {
        let _guard = ctx.run(async { Ok(self.refresh_lock.lock().await) }).await?;
        self.refresh_locked(ctx).await
    }

    async fn refresh_locked(&self, ctx: &Context) -> Result<Arc<Vec<String>>> {
        let result = self.discovery.list_proxies(ctx).await;

        let result = match result {
            Err(e) if e.is_cancellation() => return Err(e),
            Err(RpcError::Discovery(message)) => Err(RpcError::Discovery(message)),
            Err(e) => Err(RpcError::Discovery(e.to_string())),
            Ok(mut proxies) => {
                proxies.sort();
                proxies.dedup();
                if proxies.is_empty() {
                    Err(RpcError::Discovery("discovery returned no proxies".to_string()))
                } else {
                    Ok(proxies)
                }
            }
        };

        match result {
            Ok(proxies) => {
                let proxies = Arc::new(proxies);
                self.write(|state| {
                    state.proxies = proxies.clone();
                    state.updated_at = Some(Instant::now());
                    state.generation += 1;
                    state.last_error = None;
                });
                tracing::info!(count = proxies.len(), "discovered rpc proxies");
                Ok(proxies)
            }
            Err(err) => self.write(|state| {
                state.generation += 1;
                state.last_error = Some(err.clone());
                if state.is_usable(&self.config) {
                    tracing::warn!(
                        error = %err,
                        age_secs = state.age().map(|a| a.as_secs()).unwrap_or(0),
                        "proxy discovery failed, using stale list"
                    );
                    Ok(state.proxies.clone())
                } else {
                    tracing::warn!(error = %err, "proxy discovery failed");
                    Err(err)
                }
            }),
        }
    }
}
