//! Request classification
//!
//! Decides, from method and path alone, how an intercepted request is
//! served. Rules are applied in order:
//!
//! 1. non-GET and browser-internal requests pass through untouched
//! 2. API paths use the strategy their path is listed under, network-first
//!    taking precedence and being the default
//! 3. static-asset paths are cache-first against the static tier
//! 4. everything else is a navigation: network-first with a fallback page

use networking::{Method, Request};
use storage::MutationType;

use crate::config::{RouteConfig, TierKind};

/// Caching policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Prefer the network, fall back to a fresh cached copy
    NetworkFirst,
    /// Prefer the cache, go to the network on a miss
    CacheFirst,
}

/// How one request is served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Forward to the network, never cache
    Passthrough,
    /// API call
    Api(StrategyKind),
    /// Static asset
    Static,
    /// HTML navigation
    Navigation,
}

impl Route {
    /// Tier this route reads and writes
    pub fn tier(&self) -> Option<TierKind> {
        match self {
            Route::Passthrough => None,
            Route::Api(_) => Some(TierKind::Api),
            Route::Static => Some(TierKind::Static),
            Route::Navigation => Some(TierKind::Dynamic),
        }
    }

    /// Strategy this route uses
    pub fn strategy(&self) -> Option<StrategyKind> {
        match self {
            Route::Passthrough => None,
            Route::Api(kind) => Some(*kind),
            Route::Static => Some(StrategyKind::CacheFirst),
            Route::Navigation => Some(StrategyKind::NetworkFirst),
        }
    }
}

/// Path-based request classifier
#[derive(Debug, Clone)]
pub struct RequestRouter {
    routes: RouteConfig,
}

impl RequestRouter {
    /// Create a router from classification tables
    pub fn new(routes: RouteConfig) -> Self {
        Self { routes }
    }

    /// Classification tables in use
    pub fn routes(&self) -> &RouteConfig {
        &self.routes
    }

    /// Classify a request
    pub fn classify(&self, request: &Request) -> Route {
        if is_browser_internal(request) || !request.method.is_cacheable() {
            return Route::Passthrough;
        }

        let path = request.path();

        if self.is_api(&path) {
            if self.routes.network_first.iter().any(|p| path_matches(&path, p)) {
                return Route::Api(StrategyKind::NetworkFirst);
            }
            if self.routes.cache_first.iter().any(|p| path_matches(&path, p)) {
                return Route::Api(StrategyKind::CacheFirst);
            }
            return Route::Api(StrategyKind::NetworkFirst);
        }

        if self.is_static(&path) {
            return Route::Static;
        }

        Route::Navigation
    }

    /// Whether the path is in the API namespace
    pub fn is_api(&self, path: &str) -> bool {
        let prefix = self.routes.api_prefix.trim_end_matches('/');
        path_matches(path, prefix)
    }

    /// Whether the path is a static asset
    pub fn is_static(&self, path: &str) -> bool {
        self.routes.static_prefixes.iter().any(|p| path.starts_with(p.as_str()))
            || self
                .routes
                .static_extensions
                .iter()
                .any(|ext| path.ends_with(ext.as_str()))
    }

    /// Queue type for a write that should be kept when offline
    pub fn mutation_type(&self, request: &Request) -> Option<MutationType> {
        if request.method.is_cacheable() || request.method == Method::Head {
            return None;
        }
        let path = request.path();
        self.routes
            .mutation_endpoints
            .iter()
            .find(|(endpoint, _)| path_matches(&path, endpoint))
            .map(|(_, mutation_type)| *mutation_type)
    }
}

fn is_browser_internal(request: &Request) -> bool {
    matches!(request.scheme().as_deref(), Some(scheme) if scheme != "http" && scheme != "https")
}

/// Segment-aware prefix match: `/api/players` matches `/api/players/7`
/// but not `/api/playersearch`
fn path_matches(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}
