//! Install and activation lifecycle
//!
//! A generation moves `Installing -> Installed -> Activating -> Active`. When
//! another generation is already active the new one parks in `Waiting` until
//! the application applies the update. A generation whose install fails
//! becomes `Redundant` and the previous one keeps serving.
//!
//! Installing pre-fetches the whole precache manifest before writing any of
//! it, so the static tier is either fully populated or untouched. Activation
//! deletes every tier that does not belong to the new generation and records
//! the generation as active in the KV store so a restart resumes serving it.

use networking::{FetchError, Fetcher, Request, Response};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use storage::{CacheError, CacheStore, KvError, KvStore};
use thiserror::Error;

use crate::config::{EngineConfig, TierKind};
use crate::events::{EngineEvent, EventBus};

const ACTIVE_KEY: &str = "lifecycle:active";

/// Lifecycle error types
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// A precache asset could not be fetched
    #[error("Failed to precache {asset}: {reason}")]
    Precache {
        /// Asset URL
        asset: String,
        /// Why it failed
        reason: String,
    },

    /// Operation not allowed in the current state
    #[error("Invalid lifecycle state: {0}")]
    InvalidState(String),

    /// Cache error
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// KV store error
    #[error("KV store error: {0}")]
    Kv(#[from] KvError),
}

/// Result type for lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Lifecycle state of a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Precache in progress
    Installing,
    /// Precache done
    Installed,
    /// Installed while another generation is serving
    Waiting,
    /// Purging old tiers
    Activating,
    /// Serving requests
    Active,
    /// Install failed or superseded
    Redundant,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Installing => "installing",
            LifecycleState::Installed => "installed",
            LifecycleState::Waiting => "waiting",
            LifecycleState::Activating => "activating",
            LifecycleState::Active => "active",
            LifecycleState::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    generation: String,
    state: LifecycleState,
}

/// Coordinates cache generations
pub struct LifecycleManager {
    kv: KvStore,
    cache: Arc<CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    bus: EventBus,
    active: RwLock<Option<String>>,
    candidate: RwLock<Option<Candidate>>,
}

impl LifecycleManager {
    /// Create a manager, restoring the active generation from storage
    pub fn new(
        kv: KvStore,
        cache: Arc<CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        bus: EventBus,
    ) -> Result<Self> {
        let active: Option<String> = kv.get(ACTIVE_KEY)?;
        if let Some(generation) = &active {
            tracing::debug!("Restored active generation {}", generation);
        }
        Ok(Self {
            kv,
            cache,
            fetcher,
            bus,
            active: RwLock::new(active),
            candidate: RwLock::new(None),
        })
    }

    /// Generation currently serving requests
    pub fn active_generation(&self) -> Option<String> {
        self.active.read().clone()
    }

    /// Generation installed and waiting for activation
    pub fn waiting_generation(&self) -> Option<String> {
        self.candidate
            .read()
            .as_ref()
            .filter(|c| c.state == LifecycleState::Waiting)
            .map(|c| c.generation.clone())
    }

    /// State of the most recent install, or `Active` for a restored generation
    pub fn state(&self) -> Option<LifecycleState> {
        if let Some(candidate) = self.candidate.read().as_ref() {
            return Some(candidate.state);
        }
        self.active.read().as_ref().map(|_| LifecycleState::Active)
    }

    /// Apply the configured tier limits to a generation's tiers
    pub fn configure_tiers(&self, config: &EngineConfig, generation: &str) -> Result<()> {
        for kind in TierKind::ALL {
            self.cache.configure_tier(
                &kind.tier_name(generation),
                config.tiers.limits(kind).to_tier_config(),
            )?;
        }
        Ok(())
    }

    /// Install the configured generation
    ///
    /// Returns the resulting state: `Active` when nothing else was serving
    /// (or the generation was already active), `Waiting` otherwise.
    pub async fn install(&self, config: &EngineConfig) -> Result<LifecycleState> {
        let generation = config.generation.clone();
        self.configure_tiers(config, &generation)?;

        if self.active_generation().as_deref() == Some(generation.as_str()) {
            tracing::debug!("Generation {} already active", generation);
            self.set_candidate(&generation, LifecycleState::Active);
            return Ok(LifecycleState::Active);
        }

        tracing::info!("Installing generation {}", generation);
        self.set_candidate(&generation, LifecycleState::Installing);

        if let Err(e) = self.precache(config).await {
            tracing::error!("Install of generation {} failed: {}", generation, e);
            self.set_candidate(&generation, LifecycleState::Redundant);
            self.bus.publish(EngineEvent::UpdateFailed {
                generation: generation.clone(),
                reason: e.to_string(),
            });
            return Err(e);
        }
        self.set_candidate(&generation, LifecycleState::Installed);

        if self.active_generation().is_some() {
            tracing::info!("Generation {} installed and waiting", generation);
            self.set_candidate(&generation, LifecycleState::Waiting);
            self.bus.publish(EngineEvent::UpdateAvailable { generation });
            return Ok(LifecycleState::Waiting);
        }

        self.activate().await?;
        Ok(LifecycleState::Active)
    }

    /// Activate the installed generation
    ///
    /// Returns the tiers purged.
    pub async fn activate(&self) -> Result<Vec<String>> {
        let generation = match self.candidate.read().as_ref() {
            Some(c) if matches!(c.state, LifecycleState::Installed | LifecycleState::Waiting) => {
                c.generation.clone()
            }
            Some(c) => {
                return Err(LifecycleError::InvalidState(format!(
                    "cannot activate {} while {}",
                    c.generation, c.state
                )))
            }
            None => return Err(LifecycleError::InvalidState("nothing installed".into())),
        };

        self.set_candidate(&generation, LifecycleState::Activating);

        let keep: Vec<String> =
            TierKind::ALL.iter().map(|kind| kind.tier_name(&generation)).collect();
        let purged = self.cache.purge_generations_except(&keep)?;

        self.kv.set(ACTIVE_KEY, &generation)?;
        self.kv.flush()?;
        *self.active.write() = Some(generation.clone());
        self.set_candidate(&generation, LifecycleState::Active);

        tracing::info!("Generation {} active, purged {} tier(s)", generation, purged.len());
        self.bus.publish(EngineEvent::Activated { generation, purged: purged.clone() });
        Ok(purged)
    }

    /// Force-activate a waiting generation
    ///
    /// Returns `false` when nothing is waiting.
    pub async fn skip_waiting(&self) -> Result<bool> {
        let Some(generation) = self.waiting_generation() else {
            return Ok(false);
        };

        self.activate().await?;
        self.bus.publish(EngineEvent::UpdateApplied { generation, reload_required: true });
        Ok(true)
    }

    async fn precache(&self, config: &EngineConfig) -> Result<()> {
        let tier = config.tier_name(TierKind::Static);

        let mut fetched: Vec<(String, Response)> = Vec::with_capacity(config.precache.len());
        for asset in &config.precache {
            let request = Request::get(asset);
            let key = request.cache_key();
            let response = self
                .fetcher
                .fetch(request)
                .await
                .map_err(|e: FetchError| LifecycleError::Precache {
                    asset: asset.clone(),
                    reason: e.to_string(),
                })?;
            if !response.is_success() {
                return Err(LifecycleError::Precache {
                    asset: asset.clone(),
                    reason: format!("status {}", response.status),
                });
            }
            fetched.push((key, response));
        }

        for (key, response) in &fetched {
            if let Err(e) = self.cache.put(&tier, key, response) {
                // Leave no partial tier behind
                if let Err(cleanup) = self.cache.delete_tier(&tier) {
                    tracing::warn!("Could not remove partial tier {}: {}", tier, cleanup);
                }
                return Err(e.into());
            }
        }

        tracing::debug!("Precached {} asset(s) into {}", fetched.len(), tier);
        Ok(())
    }

    fn set_candidate(&self, generation: &str, state: LifecycleState) {
        tracing::debug!("Generation {} -> {}", generation, state);
        *self.candidate.write() = Some(Candidate { generation: generation.to_string(), state });
    }
}
