//! Durable key-value substrate
//!
//! This module wraps sled with JSON-typed accessors. The default tree holds
//! small scoped metadata (e.g. the active cache generation); named trees hold
//! cache tiers and queued mutations so that whole partitions can be listed and
//! dropped in one call.

use serde::{de::DeserializeOwned, Serialize};
use sled::Db;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Key-value store error types
#[derive(Debug, Error)]
pub enum KvError {
    /// Sled database error
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid key
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// Result type for key-value operations
pub type Result<T> = std::result::Result<T, KvError>;

/// Name sled gives the default tree; never exposed as a partition.
const DEFAULT_TREE: &[u8] = b"__sled__default";

/// Key-value store configuration
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// Database path
    pub path: PathBuf,
    /// Cache capacity in bytes
    pub cache_capacity: u64,
    /// Enable compression
    pub use_compression: bool,
    /// Flush interval in milliseconds (None for flush on demand only)
    pub flush_every_ms: Option<u64>,
    /// Open a throwaway database that is deleted on drop
    pub temporary: bool,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("rosterline.db"),
            cache_capacity: 16 * 1024 * 1024, // 16MB
            use_compression: true,
            flush_every_ms: Some(500),
            temporary: false,
        }
    }
}

impl KvConfig {
    /// Create a new configuration with a custom path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), ..Default::default() }
    }

    /// Configuration for a temporary database
    pub fn temporary() -> Self {
        Self { temporary: true, ..Default::default() }
    }

    /// Set cache capacity in bytes
    pub fn cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = bytes;
        self
    }

    /// Enable or disable compression
    pub fn use_compression(mut self, enabled: bool) -> Self {
        self.use_compression = enabled;
        self
    }

    /// Set flush interval in milliseconds
    pub fn flush_every_ms(mut self, ms: Option<u64>) -> Self {
        self.flush_every_ms = ms;
        self
    }
}

/// Key-value store implementation
#[derive(Clone)]
pub struct KvStore {
    db: Arc<Db>,
    separator: &'static str,
}

impl KvStore {
    /// Create a new key-value store with configuration
    pub fn new(config: KvConfig) -> Result<Self> {
        let mut db_config = sled::Config::new()
            .cache_capacity(config.cache_capacity)
            .use_compression(config.use_compression)
            .flush_every_ms(config.flush_every_ms);

        if config.temporary {
            db_config = db_config.temporary(true);
        } else {
            db_config = db_config.path(&config.path);
        }

        let db = db_config.open()?;

        Ok(Self { db: Arc::new(db), separator: ":" })
    }

    /// Create an in-memory key-value store (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::new(KvConfig::temporary())
    }

    /// Get a value by key
    pub fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Get a value by scoped key (e.g., ["lifecycle", "active"])
    pub fn get_scoped<T>(&self, scopes: &[&str]) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let key = scopes.join(self.separator);
        self.get(&key)
    }

    /// Set a value by key
    pub fn set<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        let bytes = serde_json::to_vec(value)?;
        self.db.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    /// Set a value by scoped key
    pub fn set_scoped<T>(&self, scopes: &[&str], value: &T) -> Result<()>
    where
        T: Serialize,
    {
        let key = scopes.join(self.separator);
        self.set(&key, value)
    }

    /// Remove a value by key
    pub fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.db.remove(key.as_bytes())?.is_some())
    }

    /// Remove a value by scoped key
    pub fn remove_scoped(&self, scopes: &[&str]) -> Result<bool> {
        let key = scopes.join(self.separator);
        self.remove(&key)
    }

    /// Check if a key exists
    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.db.contains_key(key.as_bytes())?)
    }

    /// Get all keys with a given prefix
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();

        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            if let Ok(key_str) = String::from_utf8(key.to_vec()) {
                keys.push(key_str);
            }
        }

        Ok(keys)
    }

    /// Generate a monotonically increasing identifier
    ///
    /// Identifiers survive restarts and never repeat, so they double as an
    /// insertion sequence when encoded big-endian.
    pub fn generate_id(&self) -> Result<u64> {
        Ok(self.db.generate_id()?)
    }

    /// Open (creating if needed) a named partition
    pub fn tree(&self, name: &str) -> Result<KvTree> {
        if name.is_empty() || name.as_bytes() == DEFAULT_TREE {
            return Err(KvError::InvalidKey(name.to_string()));
        }
        let tree = self.db.open_tree(name.as_bytes())?;
        Ok(KvTree { tree, name: name.to_string() })
    }

    /// Names of all named partitions with a given prefix
    pub fn tree_names(&self, prefix: &str) -> Vec<String> {
        self.db
            .tree_names()
            .into_iter()
            .filter(|name| &name[..] != DEFAULT_TREE)
            .filter_map(|name| String::from_utf8(name.to_vec()).ok())
            .filter(|name| name.starts_with(prefix))
            .collect()
    }

    /// Drop a named partition and everything in it
    pub fn drop_tree(&self, name: &str) -> Result<bool> {
        Ok(self.db.drop_tree(name.as_bytes())?)
    }

    /// Clear the default partition
    pub fn clear(&self) -> Result<()> {
        self.db.clear()?;
        Ok(())
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the number of keys in the default partition
    pub fn len(&self) -> usize {
        self.db.len()
    }

    /// Check if the default partition is empty
    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}

/// A named partition of the store with JSON-typed values
#[derive(Clone)]
pub struct KvTree {
    tree: sled::Tree,
    name: String,
}

impl KvTree {
    /// Partition name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a value by raw key
    pub fn get<T>(&self, key: impl AsRef<[u8]>) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        match self.tree.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Insert a value under a raw key
    pub fn insert<T>(&self, key: impl AsRef<[u8]>, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        let bytes = serde_json::to_vec(value)?;
        self.tree.insert(key.as_ref(), bytes)?;
        Ok(())
    }

    /// Remove a key, reporting whether it existed
    pub fn remove(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        Ok(self.tree.remove(key)?.is_some())
    }

    /// Check if a key exists
    pub fn contains(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        Ok(self.tree.contains_key(key)?)
    }

    /// Move the raw value under `key` into another partition
    ///
    /// Returns whether there was anything to move.
    pub fn move_to(&self, key: impl AsRef<[u8]>, target: &KvTree) -> Result<bool> {
        let key = key.as_ref();
        match self.tree.get(key)? {
            Some(bytes) => {
                target.tree.insert(key, bytes)?;
                self.tree.remove(key)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// All entries in key order, each decoded on its own
    ///
    /// A value that fails to decode does not hide the others.
    pub fn entries_each<T>(&self) -> Result<Vec<(Vec<u8>, std::result::Result<T, serde_json::Error>)>>
    where
        T: DeserializeOwned,
    {
        let mut entries = Vec::with_capacity(self.tree.len());
        for item in self.tree.iter() {
            let (key, bytes) = item?;
            entries.push((key.to_vec(), serde_json::from_slice(&bytes)));
        }
        Ok(entries)
    }

    /// Remove and return the entry with the smallest key
    pub fn pop_min<T>(&self) -> Result<Option<(Vec<u8>, T)>>
    where
        T: DeserializeOwned,
    {
        match self.tree.pop_min()? {
            Some((key, bytes)) => Ok(Some((key.to_vec(), serde_json::from_slice(&bytes)?))),
            None => Ok(None),
        }
    }

    /// All entries in key order
    pub fn entries<T>(&self) -> Result<Vec<(Vec<u8>, T)>>
    where
        T: DeserializeOwned,
    {
        let mut entries = Vec::with_capacity(self.tree.len());
        for item in self.tree.iter() {
            let (key, bytes) = item?;
            entries.push((key.to_vec(), serde_json::from_slice(&bytes)?));
        }
        Ok(entries)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Check if the partition is empty
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Remove every entry
    pub fn clear(&self) -> Result<()> {
        self.tree.clear()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestData {
        name: String,
        count: i32,
    }

    #[test]
    fn test_kv_store_creation() {
        let kv = KvStore::in_memory().unwrap();
        assert!(kv.is_empty());
    }

    #[test]
    fn test_set_and_get_struct() {
        let kv = KvStore::in_memory().unwrap();

        let data = TestData { name: "Alice".to_string(), count: 42 };
        kv.set("user", &data).unwrap();

        let retrieved: Option<TestData> = kv.get("user").unwrap();
        assert_eq!(retrieved, Some(data));
        let missing: Option<TestData> = kv.get("nobody").unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn test_scoped_operations() {
        let kv = KvStore::in_memory().unwrap();

        kv.set_scoped(&["lifecycle", "active"], &"v2".to_string())
            .unwrap();

        let active: Option<String> = kv.get_scoped(&["lifecycle", "active"]).unwrap();
        assert_eq!(active, Some("v2".to_string()));
        assert!(kv.contains("lifecycle:active").unwrap());

        assert!(kv.remove_scoped(&["lifecycle", "active"]).unwrap());
        assert!(!kv.remove_scoped(&["lifecycle", "active"]).unwrap());
    }

    #[test]
    fn test_keys_with_prefix() {
        let kv = KvStore::in_memory().unwrap();

        kv.set("app:setting1", &"value1".to_string()).unwrap();
        kv.set("app:setting2", &"value2".to_string()).unwrap();
        kv.set("user:name", &"Alice".to_string()).unwrap();

        let keys = kv.keys_with_prefix("app:").unwrap();
        assert_eq!(keys, vec!["app:setting1".to_string(), "app:setting2".to_string()]);
    }

    #[test]
    fn test_generate_id_is_monotonic() {
        let kv = KvStore::in_memory().unwrap();

        let a = kv.generate_id().unwrap();
        let b = kv.generate_id().unwrap();
        let c = kv.generate_id().unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_named_trees() {
        let kv = KvStore::in_memory().unwrap();

        let players = kv.tree("cache/api-v1").unwrap();
        players.insert("GET /api/players", &1).unwrap();
        kv.tree("cache/static-v1").unwrap();
        kv.tree("queue/attendance").unwrap();

        let mut names = kv.tree_names("cache/");
        names.sort();
        assert_eq!(names, vec!["cache/api-v1".to_string(), "cache/static-v1".to_string()]);

        assert!(kv.drop_tree("cache/api-v1").unwrap());
        assert_eq!(kv.tree_names("cache/"), vec!["cache/static-v1".to_string()]);

        // Reopening a dropped tree yields an empty partition
        let reopened = kv.tree("cache/api-v1").unwrap();
        assert!(reopened.is_empty());
    }

    #[test]
    fn test_default_tree_name_is_rejected() {
        let kv = KvStore::in_memory().unwrap();
        assert!(matches!(kv.tree("__sled__default"), Err(KvError::InvalidKey(_))));
        assert!(matches!(kv.tree(""), Err(KvError::InvalidKey(_))));
    }

    #[test]
    fn test_tree_pop_min_follows_key_order() {
        let kv = KvStore::in_memory().unwrap();
        let tree = kv.tree("order").unwrap();

        tree.insert(3u64.to_be_bytes(), &"c".to_string()).unwrap();
        tree.insert(1u64.to_be_bytes(), &"a".to_string()).unwrap();
        tree.insert(2u64.to_be_bytes(), &"b".to_string()).unwrap();

        let (_, first): (Vec<u8>, String) = tree.pop_min().unwrap().unwrap();
        assert_eq!(first, "a");

        let rest: Vec<String> = tree
            .entries::<String>()
            .unwrap()
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        assert_eq!(rest, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_entries_each_isolates_bad_values() {
        let kv = KvStore::in_memory().unwrap();
        let tree = kv.tree("mixed").unwrap();
        let rejected = kv.tree("mixed/rejected").unwrap();

        tree.insert(1u64.to_be_bytes(), &7).unwrap();
        tree.insert(2u64.to_be_bytes(), &"seven").unwrap();
        tree.insert(3u64.to_be_bytes(), &8).unwrap();

        let entries = tree.entries_each::<i32>().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(*entries[0].1.as_ref().unwrap(), 7);
        assert!(entries[1].1.is_err());
        assert_eq!(*entries[2].1.as_ref().unwrap(), 8);

        assert!(tree.move_to(&entries[1].0, &rejected).unwrap());
        assert!(!tree.contains(&entries[1].0).unwrap());
        assert_eq!(rejected.get::<String>(&entries[1].0).unwrap(), Some("seven".to_string()));
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_reopen_persists_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");

        {
            let kv = KvStore::new(KvConfig::new(&path).flush_every_ms(None)).unwrap();
            kv.tree("queue/message").unwrap().insert("k", &7).unwrap();
            kv.flush().unwrap();
        }

        let kv = KvStore::new(KvConfig::new(&path)).unwrap();
        let value: Option<i32> = kv.tree("queue/message").unwrap().get("k").unwrap();
        assert_eq!(value, Some(7));
    }

    #[test]
    fn test_config_builder() {
        let config = KvConfig::new("test.db")
            .cache_capacity(32 * 1024 * 1024)
            .use_compression(false)
            .flush_every_ms(Some(1000));

        assert_eq!(config.path, PathBuf::from("test.db"));
        assert_eq!(config.cache_capacity, 32 * 1024 * 1024);
        assert!(!config.use_compression);
        assert_eq!(config.flush_every_ms, Some(1000));
        assert!(!config.temporary);
        assert!(KvConfig::temporary().temporary);
    }
}
