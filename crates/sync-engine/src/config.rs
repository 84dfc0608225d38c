//! Engine configuration
//!
//! Every field has a default, so an empty JSON object is a valid config.
//! Durations are given in whole seconds.

use networking::HttpClientConfig;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use storage::{KvConfig, MutationType, TierConfig};
use thiserror::Error;
use url::Url;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON for this schema
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Config parsed but is unusable
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// The three cache tiers every generation owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    /// Static assets (scripts, styles, images)
    Static,
    /// HTML navigations
    Dynamic,
    /// API GET responses
    Api,
}

impl TierKind {
    /// Every tier kind
    pub const ALL: [TierKind; 3] = [TierKind::Static, TierKind::Dynamic, TierKind::Api];

    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            TierKind::Static => "static",
            TierKind::Dynamic => "dynamic",
            TierKind::Api => "api",
        }
    }

    /// Generation-qualified tier name, e.g. `api-v2`
    pub fn tier_name(&self, generation: &str) -> String {
        format!("{}-{}", self.as_str(), generation)
    }
}

/// Limits for one tier, as written in config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Maximum entries (absent = unbounded)
    #[serde(default)]
    pub max_entries: Option<usize>,
    /// Freshness window in seconds
    pub max_age_secs: u64,
    /// Serve stale and refresh in the background
    #[serde(default)]
    pub revalidate_when_stale: bool,
}

impl TierLimits {
    /// Convert to the cache store's representation
    pub fn to_tier_config(&self) -> TierConfig {
        TierConfig {
            max_entries: self.max_entries,
            max_age: Duration::from_secs(self.max_age_secs),
            revalidate_when_stale: self.revalidate_when_stale,
        }
    }
}

impl From<TierConfig> for TierLimits {
    fn from(config: TierConfig) -> Self {
        Self {
            max_entries: config.max_entries,
            max_age_secs: config.max_age.as_secs(),
            revalidate_when_stale: config.revalidate_when_stale,
        }
    }
}

/// Limits for every tier
///
/// In JSON each tier may give only the fields it changes; the rest keep that
/// tier's own defaults. `"max_entries": null` makes a tier unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierSettings {
    /// Static asset tier
    #[serde(rename = "static")]
    pub static_assets: TierLimits,
    /// Navigation tier
    pub dynamic: TierLimits,
    /// API tier
    pub api: TierLimits,
}

impl Default for TierSettings {
    fn default() -> Self {
        Self {
            static_assets: TierConfig::static_assets().into(),
            dynamic: TierConfig::dynamic_pages().into(),
            api: TierConfig::api_responses().into(),
        }
    }
}

#[derive(Default, Deserialize)]
struct TierOverride {
    #[serde(default, deserialize_with = "present")]
    max_entries: Option<Option<usize>>,
    max_age_secs: Option<u64>,
    revalidate_when_stale: Option<bool>,
}

impl TierOverride {
    fn apply(self, mut limits: TierLimits) -> TierLimits {
        if let Some(max_entries) = self.max_entries {
            limits.max_entries = max_entries;
        }
        if let Some(max_age_secs) = self.max_age_secs {
            limits.max_age_secs = max_age_secs;
        }
        if let Some(revalidate) = self.revalidate_when_stale {
            limits.revalidate_when_stale = revalidate;
        }
        limits
    }
}

/// Distinguishes an explicit `null` from an absent field
fn present<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl<'de> Deserialize<'de> for TierSettings {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Default, Deserialize)]
        #[serde(default)]
        struct Overrides {
            #[serde(rename = "static")]
            static_assets: TierOverride,
            dynamic: TierOverride,
            api: TierOverride,
        }

        let overrides = Overrides::deserialize(deserializer)?;
        let defaults = TierSettings::default();
        Ok(Self {
            static_assets: overrides.static_assets.apply(defaults.static_assets),
            dynamic: overrides.dynamic.apply(defaults.dynamic),
            api: overrides.api.apply(defaults.api),
        })
    }
}

impl TierSettings {
    /// Limits for one tier kind
    pub fn limits(&self, kind: TierKind) -> &TierLimits {
        match kind {
            TierKind::Static => &self.static_assets,
            TierKind::Dynamic => &self.dynamic,
            TierKind::Api => &self.api,
        }
    }
}

/// Where durable state lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Database directory; absent means a temporary in-memory store
    pub path: Option<PathBuf>,
    /// Page cache size in bytes
    pub cache_capacity: u64,
    /// Background flush interval in milliseconds
    pub flush_every_ms: Option<u64>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self { path: None, cache_capacity: 64 * 1024 * 1024, flush_every_ms: Some(500) }
    }
}

impl StorageSettings {
    /// Build the KV store config
    pub fn to_kv_config(&self) -> KvConfig {
        let base = match &self.path {
            Some(path) => KvConfig::new(path),
            None => KvConfig::temporary(),
        };
        base.cache_capacity(self.cache_capacity)
            .flush_every_ms(self.flush_every_ms)
    }
}

/// Request classification tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Path prefix of the API namespace
    pub api_prefix: String,
    /// Path prefixes of the static-asset namespace
    pub static_prefixes: Vec<String>,
    /// File extensions that mark a static asset anywhere
    pub static_extensions: Vec<String>,
    /// API paths that always go to the network first
    pub network_first: Vec<String>,
    /// API paths served from cache first
    pub cache_first: Vec<String>,
    /// Mutating endpoints whose failed writes are queued
    pub mutation_endpoints: BTreeMap<String, MutationType>,
    /// Page served when a navigation fails with nothing cached
    pub fallback_document: String,
}

impl Default for RouteConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
        Self {
            api_prefix: "/api/".to_string(),
            static_prefixes: strings(&["/static/", "/assets/", "/icons/"]),
            static_extensions: strings(&[
                ".js", ".css", ".png", ".jpg", ".svg", ".ico", ".woff2", ".webmanifest",
            ]),
            network_first: strings(&[
                "/api/auth",
                "/api/qr/scan",
                "/api/qr/generate",
                "/api/messages/send",
                "/api/notifications/send",
            ]),
            cache_first: strings(&["/api/players", "/api/teams", "/api/training", "/api/matches"]),
            mutation_endpoints: BTreeMap::from([
                ("/api/attendance".to_string(), MutationType::Attendance),
                ("/api/messages/send".to_string(), MutationType::Message),
                ("/api/notifications/send".to_string(), MutationType::Notification),
            ]),
            fallback_document: "/offline.html".to_string(),
        }
    }
}

/// How the engine reaches the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Base URL that path-only requests are resolved against
    pub base_url: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self { base_url: None, timeout_secs: 30 }
    }
}

impl NetworkSettings {
    /// Build the HTTP client config
    pub fn to_client_config(&self) -> HttpClientConfig {
        let base = match &self.base_url {
            Some(url) => HttpClientConfig::new(url),
            None => HttpClientConfig::default(),
        };
        base.with_timeout(Duration::from_secs(self.timeout_secs))
    }
}

/// Liveness probe settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Seconds between probes
    pub interval_secs: u64,
    /// URL of the health endpoint
    pub health_url: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self { interval_secs: 30, health_url: "/api/health".to_string() }
    }
}

impl ProbeConfig {
    /// Probe interval
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Presentation defaults for push notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Title used when a payload has none
    pub default_title: String,
    /// Icon shown on every notification
    pub icon: String,
    /// Monochrome badge
    pub badge: String,
    /// Destination when nothing more specific applies
    pub default_url: String,
    /// Destination per notification type
    pub routes: BTreeMap<String, String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            default_title: "Rosterline".to_string(),
            icon: "/icons/icon-192.png".to_string(),
            badge: "/icons/badge-72.png".to_string(),
            default_url: "/".to_string(),
            routes: BTreeMap::from([
                ("message".to_string(), "/messages".to_string()),
                ("training".to_string(), "/training".to_string()),
                ("match".to_string(), "/matches".to_string()),
                ("attendance".to_string(), "/attendance".to_string()),
                ("scan".to_string(), "/scan".to_string()),
            ]),
        }
    }
}

impl NotificationConfig {
    /// Destination for a notification type
    pub fn route_for(&self, notification_type: &str) -> Option<&str> {
        self.routes.get(notification_type).map(String::as_str)
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Build tag of the generation this engine installs
    pub generation: String,
    /// Durable storage
    pub storage: StorageSettings,
    /// Server access
    pub network: NetworkSettings,
    /// Tier limits
    pub tiers: TierSettings,
    /// Classification tables
    pub routes: RouteConfig,
    /// Critical assets fetched into the static tier on install
    pub precache: Vec<String>,
    /// Liveness probe
    pub probe: ProbeConfig,
    /// Push notification presentation
    pub notifications: NotificationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            generation: "v1".to_string(),
            storage: StorageSettings::default(),
            network: NetworkSettings::default(),
            tiers: TierSettings::default(),
            routes: RouteConfig::default(),
            precache: vec![
                "/".to_string(),
                "/offline.html".to_string(),
                "/static/app.js".to_string(),
                "/static/app.css".to_string(),
                "/manifest.webmanifest".to_string(),
            ],
            probe: ProbeConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a default config for a generation
    pub fn new(generation: impl Into<String>) -> Self {
        Self { generation: generation.into(), ..Default::default() }
    }

    /// Parse from JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Reject configs the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.generation.trim().is_empty() {
            return Err(ConfigError::Invalid("generation must not be empty".into()));
        }
        if self.generation.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "generation {} must not contain '/'",
                self.generation
            )));
        }
        if self.network.timeout_secs == 0 {
            return Err(ConfigError::Invalid("request timeout must be positive".into()));
        }
        if self.probe.interval_secs == 0 {
            return Err(ConfigError::Invalid("probe interval must be positive".into()));
        }
        for kind in TierKind::ALL {
            if self.tiers.limits(kind).max_entries == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "{} tier max_entries must be positive",
                    kind.as_str()
                )));
            }
        }
        Ok(())
    }

    /// Additional checks when requests go through the built-in HTTP client
    ///
    /// Without a base URL every precached asset and the health URL must be
    /// absolute, since nothing else could resolve them.
    pub fn validate_for_http_client(&self) -> Result<()> {
        if let Some(base_url) = &self.network.base_url {
            Url::parse(base_url)
                .map_err(|e| ConfigError::Invalid(format!("base URL {}: {}", base_url, e)))?;
            return Ok(());
        }

        let urls = self
            .precache
            .iter()
            .chain(std::iter::once(&self.probe.health_url));
        for url in urls {
            if Url::parse(url).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "{} is relative and no network.base_url is set",
                    url
                )));
            }
        }
        Ok(())
    }

    /// Generation-qualified name of one tier
    pub fn tier_name(&self, kind: TierKind) -> String {
        kind.tier_name(&self.generation)
    }

    /// Names of every tier owned by this generation
    pub fn generation_tiers(&self) -> Vec<String> {
        TierKind::ALL.iter().map(|kind| self.tier_name(*kind)).collect()
    }

    /// Set the generation tag
    pub fn with_generation(mut self, generation: impl Into<String>) -> Self {
        self.generation = generation.into();
        self
    }

    /// Persist state under a directory
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage.path = Some(path.into());
        self
    }

    /// Replace the install manifest
    pub fn with_precache<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.precache = assets.into_iter().map(Into::into).collect();
        self
    }

    /// Override one tier's limits
    pub fn with_tier(mut self, kind: TierKind, config: TierConfig) -> Self {
        let limits = config.into();
        match kind {
            TierKind::Static => self.tiers.static_assets = limits,
            TierKind::Dynamic => self.tiers.dynamic = limits,
            TierKind::Api => self.tiers.api = limits,
        }
        self
    }

    /// Set the server base URL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.network.base_url = Some(base_url.into());
        self
    }

    /// Set the health endpoint
    pub fn with_probe_health_url(mut self, url: impl Into<String>) -> Self {
        self.probe.health_url = url.into();
        self
    }

    /// Set the probe interval
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe.interval_secs = interval.as_secs();
        self
    }
}
