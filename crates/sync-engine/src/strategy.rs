//! Caching strategies
//!
//! Both strategies key entries by `"METHOD url"` and only ever store
//! successful (2xx) GET responses. Cache writes are best effort: a failed
//! write is logged and the response is still returned.

use networking::{FetchError, Fetcher, Method, Request, Response};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use storage::{CacheEntry, CacheStore};

use crate::router::StrategyKind;

/// Result type for strategy operations
pub type Result<T> = std::result::Result<T, FetchError>;

/// Shared state for both strategies
#[derive(Clone)]
pub struct Strategies {
    cache: Arc<CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    refreshing: Arc<Mutex<HashSet<String>>>,
}

impl Strategies {
    /// Create strategies over a cache and a fetcher
    pub fn new(cache: Arc<CacheStore>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { cache, fetcher, refreshing: Arc::new(Mutex::new(HashSet::new())) }
    }

    /// Serve with the given strategy
    pub async fn serve(&self, kind: StrategyKind, tier: &str, request: Request) -> Result<Response> {
        match kind {
            StrategyKind::NetworkFirst => self.network_first(tier, request).await,
            StrategyKind::CacheFirst => self.cache_first(tier, request).await,
        }
    }

    /// Network, then a fresh cached copy
    ///
    /// A stale copy is never returned; with no fresh copy the failure is
    /// reported as `FetchError::Offline`.
    pub async fn network_first(&self, tier: &str, request: Request) -> Result<Response> {
        let key = request.cache_key();
        let cacheable = request.method.is_cacheable();

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if cacheable {
                    self.store(tier, &key, &response);
                }
                Ok(response)
            }
            Err(e) if e.is_network_failure() => match self.lookup(tier, &key) {
                Some(entry) if self.cache.is_fresh(&entry, tier) => {
                    tracing::debug!("Network failed for {}, serving cached copy from {}", key, tier);
                    Ok(entry.value)
                }
                Some(_) => Err(FetchError::Offline(format!("{} (cached copy is stale)", key))),
                None => Err(FetchError::Offline(key)),
            },
            Err(e) => Err(e),
        }
    }

    /// Cache, then network
    ///
    /// A stale hit in a tier marked `revalidate_when_stale` is returned at
    /// once and refreshed in the background. In other tiers a stale hit is
    /// refetched, and served as-is only if the network fails.
    pub async fn cache_first(&self, tier: &str, request: Request) -> Result<Response> {
        let key = request.cache_key();

        let Some(entry) = self.lookup(tier, &key) else {
            return self.fetch_and_store(tier, &key, request).await;
        };

        if self.cache.is_fresh(&entry, tier) {
            return Ok(entry.value);
        }

        if self.cache.tier_config(tier).revalidate_when_stale {
            self.spawn_refresh(tier.to_string(), request);
            return Ok(entry.value);
        }

        match self.fetch_and_store(tier, &key, request).await {
            Ok(response) => Ok(response),
            Err(e) if e.is_network_failure() => {
                tracing::debug!("Network failed for {}, serving stale copy from {}", key, tier);
                Ok(entry.value)
            }
            Err(e) => Err(e),
        }
    }

    /// Refetch one request and overwrite its entry
    ///
    /// Returns whether a fresh copy was stored.
    pub async fn refresh(&self, tier: &str, request: Request) -> bool {
        let key = request.cache_key();
        match self.fetcher.fetch(request).await {
            Ok(response) if response.is_success() => self.store(tier, &key, &response),
            Ok(response) => {
                tracing::debug!("Refresh of {} answered {}", key, response.status);
                false
            }
            Err(e) => {
                tracing::debug!("Refresh of {} failed: {}", key, e);
                false
            }
        }
    }

    /// Refetch every GET entry in a tier
    ///
    /// Returns how many entries were refreshed.
    pub async fn refresh_tier(&self, tier: &str) -> usize {
        let keys = match self.cache.keys(tier) {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!("Could not list {} for refresh: {}", tier, e);
                return 0;
            }
        };

        let mut refreshed = 0;
        for key in keys {
            let Some(request) = request_from_key(&key) else {
                continue;
            };
            if self.refresh(tier, request).await {
                refreshed += 1;
            }
        }
        tracing::debug!("Refreshed {} entries in {}", refreshed, tier);
        refreshed
    }

    /// Look up a cached response, treating read failures as misses
    pub fn lookup(&self, tier: &str, key: &str) -> Option<CacheEntry<Response>> {
        match self.cache.get::<Response>(tier, key) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Cache read {} in {} failed: {}", key, tier, e);
                None
            }
        }
    }

    async fn fetch_and_store(&self, tier: &str, key: &str, request: Request) -> Result<Response> {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.store(tier, key, &response);
                Ok(response)
            }
            Err(e) if e.is_network_failure() => Err(FetchError::Offline(key.to_string())),
            Err(e) => Err(e),
        }
    }

    fn spawn_refresh(&self, tier: String, request: Request) {
        let key = request.cache_key();
        if !self.refreshing.lock().insert(key.clone()) {
            return;
        }

        let strategies = self.clone();
        tokio::spawn(async move {
            strategies.refresh(&tier, request).await;
            strategies.refreshing.lock().remove(&key);
        });
    }

    fn store(&self, tier: &str, key: &str, response: &Response) -> bool {
        if !response.is_success() {
            return false;
        }
        match self.cache.put(tier, key, response) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Cache write {} in {} failed: {}", key, tier, e);
                false
            }
        }
    }
}

fn request_from_key(key: &str) -> Option<Request> {
    let (method, url) = key.split_once(' ')?;
    let method: Method = method.parse().ok()?;
    method.is_cacheable().then(|| Request::new(method, url))
}
