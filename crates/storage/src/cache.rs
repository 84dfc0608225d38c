//! Tiered response cache
//!
//! Each tier is an independently bounded partition keyed by a canonical
//! request identity. Entries remember when they were captured and the order in
//! which they were inserted; when a tier outgrows its bound the oldest
//! insertions are evicted first, regardless of how recently they were read.
//!
//! Tiers live in sled trees named `cache/{tier}` with a companion
//! `cache/{tier}/order` tree mapping insertion sequence to key, so the whole
//! cache survives restarts and a generation can be purged by dropping trees.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::clock::Clock;
use crate::kv::{KvError, KvStore, KvTree};

const TIER_PREFIX: &str = "cache/";
const ORDER_SUFFIX: &str = "/order";

/// Cache error types
#[derive(Debug, Error)]
pub enum CacheError {
    /// Tier name is empty or contains a path separator
    #[error("Invalid tier name: {0}")]
    InvalidTier(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// KV store error
    #[error("KV store error: {0}")]
    Kv(#[from] KvError),
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Size and age limits for one tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierConfig {
    /// Maximum number of entries (None = unbounded)
    pub max_entries: Option<usize>,
    /// How long an entry counts as fresh after capture
    pub max_age: Duration,
    /// Serve stale hits immediately and refresh them in the background
    pub revalidate_when_stale: bool,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            max_entries: None,
            max_age: Duration::from_secs(24 * 60 * 60),
            revalidate_when_stale: false,
        }
    }
}

impl TierConfig {
    /// Create an unbounded tier with the given freshness window
    pub fn new(max_age: Duration) -> Self {
        Self { max_age, ..Default::default() }
    }

    /// Static assets: unbounded, fresh for 7 days
    pub fn static_assets() -> Self {
        Self::new(Duration::from_secs(7 * 24 * 60 * 60))
    }

    /// Dynamic pages: 50 entries, fresh for 24 hours
    pub fn dynamic_pages() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60)).max_entries(50)
    }

    /// API responses: 100 entries, fresh for 30 minutes, revalidated when stale
    pub fn api_responses() -> Self {
        Self::new(Duration::from_secs(30 * 60))
            .max_entries(100)
            .revalidate_when_stale(true)
    }

    /// Set maximum entries
    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    /// Remove the entry bound
    pub fn unbounded(mut self) -> Self {
        self.max_entries = None;
        self
    }

    /// Set the freshness window
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Enable or disable stale-while-revalidate
    pub fn revalidate_when_stale(mut self, enabled: bool) -> Self {
        self.revalidate_when_stale = enabled;
        self
    }
}

/// What is written to disk for one entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    seq: u64,
    captured_at: DateTime<Utc>,
    checksum: String,
    payload: String,
}

fn checksum(payload: &str) -> String {
    format!("{:x}", md5::compute(payload.as_bytes()))
}

/// A cached value together with its capture time
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    /// Tier the entry was read from
    pub tier: String,
    /// Canonical request key
    pub key: String,
    /// The cached value
    pub value: V,
    /// When the entry was written
    pub captured_at: DateTime<Utc>,
}

#[derive(Clone)]
struct TierTrees {
    entries: KvTree,
    order: KvTree,
}

/// Persistent multi-tier cache
pub struct CacheStore {
    kv: KvStore,
    clock: Arc<dyn Clock>,
    configs: RwLock<HashMap<String, TierConfig>>,
    open: RwLock<HashMap<String, TierTrees>>,
    write_lock: Mutex<()>,
}

impl CacheStore {
    /// Create a cache over an existing store
    pub fn new(kv: KvStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            kv,
            clock,
            configs: RwLock::new(HashMap::new()),
            open: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Register the limits for a tier
    ///
    /// Tiers that were never configured are treated as unbounded with the
    /// default freshness window.
    pub fn configure_tier(&self, tier: &str, config: TierConfig) -> Result<()> {
        validate_tier_name(tier)?;
        self.configs.write().insert(tier.to_string(), config);
        Ok(())
    }

    /// Limits in effect for a tier
    pub fn tier_config(&self, tier: &str) -> TierConfig {
        self.configs.read().get(tier).cloned().unwrap_or_default()
    }

    /// Look up an entry; a miss is `Ok(None)`
    pub fn get<V>(&self, tier: &str, key: &str) -> Result<Option<CacheEntry<V>>>
    where
        V: DeserializeOwned,
    {
        let Some(trees) = self.existing_tier(tier)? else {
            return Ok(None);
        };

        let stored: StoredEntry = match trees.entries.get(key) {
            Ok(Some(stored)) => stored,
            Ok(None) => return Ok(None),
            Err(KvError::Serialization(e)) => {
                tracing::warn!("Dropping unreadable cache entry {} in {}: {}", key, tier, e);
                trees.entries.remove(key)?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if checksum(&stored.payload) != stored.checksum {
            tracing::warn!("Checksum mismatch for cache entry {} in {}, dropping", key, tier);
            self.drop_entry(&trees, key, stored.seq)?;
            return Ok(None);
        }

        match serde_json::from_str::<V>(&stored.payload) {
            Ok(value) => Ok(Some(CacheEntry {
                tier: tier.to_string(),
                key: key.to_string(),
                value,
                captured_at: stored.captured_at,
            })),
            Err(e) => {
                tracing::warn!("Dropping undecodable cache entry {} in {}: {}", key, tier, e);
                self.drop_entry(&trees, key, stored.seq)?;
                Ok(None)
            }
        }
    }

    /// Store a value stamped with the current time
    ///
    /// After the write the tier is trimmed back to its bound by evicting the
    /// oldest insertions. Re-putting an existing key counts as a new insertion.
    pub fn put<V>(&self, tier: &str, key: &str, value: &V) -> Result<()>
    where
        V: Serialize,
    {
        let payload = serde_json::to_string(value)?;
        let config = self.tier_config(tier);

        let _guard = self.write_lock.lock();
        let trees = self.open_tier(tier)?;

        if let Some(previous) = self.readable_entry(&trees, tier, key)? {
            trees.order.remove(previous.seq.to_be_bytes())?;
        }

        let seq = self.kv.generate_id()?;
        let stored = StoredEntry {
            seq,
            captured_at: self.clock.now(),
            checksum: checksum(&payload),
            payload,
        };
        trees.entries.insert(key, &stored)?;
        trees.order.insert(seq.to_be_bytes(), &key.to_string())?;

        if let Some(max) = config.max_entries {
            let evicted = evict_to(&trees, max)?;
            if evicted > 0 {
                tracing::debug!("Evicted {} entries from {} (max {})", evicted, tier, max);
            }
        }

        Ok(())
    }

    /// Whether an entry is still inside its tier's freshness window
    pub fn is_fresh<V>(&self, entry: &CacheEntry<V>, tier: &str) -> bool {
        let max_age = self.tier_config(tier).max_age;
        // An entry stamped in the future (clock moved backwards) counts as age zero
        let age = (self.clock.now() - entry.captured_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        age < max_age
    }

    /// Remove one entry
    pub fn remove(&self, tier: &str, key: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let Some(trees) = self.existing_tier(tier)? else {
            return Ok(false);
        };
        let existed = trees.entries.contains(key)?;
        match self.readable_entry(&trees, tier, key)? {
            Some(stored) => self.drop_entry(&trees, key, stored.seq)?,
            None => {
                trees.entries.remove(key)?;
            }
        }
        Ok(existed)
    }

    /// Number of entries in a tier
    pub fn entry_count(&self, tier: &str) -> Result<usize> {
        Ok(self
            .existing_tier(tier)?
            .map(|trees| trees.entries.len())
            .unwrap_or(0))
    }

    /// Keys of a tier, oldest insertion first
    pub fn keys(&self, tier: &str) -> Result<Vec<String>> {
        let Some(trees) = self.existing_tier(tier)? else {
            return Ok(Vec::new());
        };
        Ok(trees
            .order
            .entries::<String>()?
            .into_iter()
            .map(|(_, key)| key)
            .collect())
    }

    /// Names of every tier currently on disk
    pub fn tier_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .kv
            .tree_names(TIER_PREFIX)
            .into_iter()
            .filter(|name| !name.ends_with(ORDER_SUFFIX))
            .filter_map(|name| name.strip_prefix(TIER_PREFIX).map(str::to_string))
            .collect();
        names.sort();
        names
    }

    /// Whether a tier exists on disk
    pub fn has_tier(&self, tier: &str) -> bool {
        self.tier_names().iter().any(|name| name == tier)
    }

    /// Remove every entry from a tier but keep the tier
    pub fn clear_tier(&self, tier: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        if let Some(trees) = self.existing_tier(tier)? {
            trees.entries.clear()?;
            trees.order.clear()?;
        }
        Ok(())
    }

    /// Delete a tier entirely
    pub fn delete_tier(&self, tier: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        self.open.write().remove(tier);
        let existed = self.kv.drop_tree(&entries_tree(tier))?;
        self.kv.drop_tree(&order_tree(tier))?;
        Ok(existed)
    }

    /// Delete every tier whose name is not in `keep`
    ///
    /// Returns the names of the purged tiers.
    pub fn purge_generations_except<S>(&self, keep: &[S]) -> Result<Vec<String>>
    where
        S: AsRef<str>,
    {
        let mut purged = Vec::new();
        for tier in self.tier_names() {
            if keep.iter().any(|k| k.as_ref() == tier) {
                continue;
            }
            self.delete_tier(&tier)?;
            tracing::info!("Purged stale cache tier {}", tier);
            purged.push(tier);
        }
        Ok(purged)
    }

    /// Drop every entry that has outlived the tier's freshness window
    pub fn purge_expired(&self, tier: &str) -> Result<usize> {
        let max_age = self.tier_config(tier).max_age;
        let now = self.clock.now();

        let _guard = self.write_lock.lock();
        let Some(trees) = self.existing_tier(tier)? else {
            return Ok(0);
        };

        let mut removed = 0;
        for (key, stored) in trees.entries.entries::<StoredEntry>()? {
            let age = (now - stored.captured_at).to_std().unwrap_or(Duration::ZERO);
            if age >= max_age {
                trees.entries.remove(&key)?;
                trees.order.remove(stored.seq.to_be_bytes())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Decode the stored entry for `key`
    ///
    /// An undecodable entry is removed together with every order record that
    /// still points at the key, so a later eviction cannot hit a fresh value.
    fn readable_entry(
        &self,
        trees: &TierTrees,
        tier: &str,
        key: &str,
    ) -> Result<Option<StoredEntry>> {
        match trees.entries.get::<StoredEntry>(key) {
            Ok(stored) => Ok(stored),
            Err(KvError::Serialization(e)) => {
                tracing::warn!("Dropping unreadable cache entry {} in {}: {}", key, tier, e);
                trees.entries.remove(key)?;
                for (seq, recorded) in trees.order.entries::<String>()? {
                    if recorded == key {
                        trees.order.remove(&seq)?;
                    }
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn drop_entry(&self, trees: &TierTrees, key: &str, seq: u64) -> Result<()> {
        trees.entries.remove(key)?;
        trees.order.remove(seq.to_be_bytes())?;
        Ok(())
    }

    fn open_tier(&self, tier: &str) -> Result<TierTrees> {
        validate_tier_name(tier)?;
        if let Some(trees) = self.open.read().get(tier) {
            return Ok(trees.clone());
        }
        let trees = TierTrees {
            entries: self.kv.tree(&entries_tree(tier))?,
            order: self.kv.tree(&order_tree(tier))?,
        };
        self.open.write().insert(tier.to_string(), trees.clone());
        Ok(trees)
    }

    fn existing_tier(&self, tier: &str) -> Result<Option<TierTrees>> {
        validate_tier_name(tier)?;
        if let Some(trees) = self.open.read().get(tier) {
            return Ok(Some(trees.clone()));
        }
        if self.has_tier(tier) {
            return self.open_tier(tier).map(Some);
        }
        Ok(None)
    }
}

fn entries_tree(tier: &str) -> String {
    format!("{}{}", TIER_PREFIX, tier)
}

fn order_tree(tier: &str) -> String {
    format!("{}{}{}", TIER_PREFIX, tier, ORDER_SUFFIX)
}

fn validate_tier_name(tier: &str) -> Result<()> {
    if tier.is_empty() || tier.contains('/') {
        return Err(CacheError::InvalidTier(tier.to_string()));
    }
    Ok(())
}

fn evict_to(trees: &TierTrees, max: usize) -> Result<usize> {
    let mut evicted = 0;
    while trees.entries.len() > max {
        let Some((seq, key)) = trees.order.pop_min::<String>()? else {
            break;
        };
        // An order record left behind by a rewritten key must not evict the new value
        let current = trees.entries.get::<StoredEntry>(&key).ok().flatten();
        if current.is_some_and(|stored| stored.seq.to_be_bytes()[..] != seq[..]) {
            continue;
        }
        if trees.entries.remove(&key)? {
            evicted += 1;
        }
    }
    Ok(evicted)
}
