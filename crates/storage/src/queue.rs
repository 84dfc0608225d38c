//! Offline mutation queue
//!
//! Writes that could not reach the server are parked here until the sync
//! coordinator re-delivers them. Each logical type gets its own partition
//! (`queue/{type}`) keyed by a generated, monotonically increasing id, so a
//! partition scan yields items in enqueue order. Items are only ever created
//! and deleted, never edited.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::clock::Clock;
use crate::kv::{KvError, KvStore, KvTree};

const QUEUE_PREFIX: &str = "queue/";
const REJECTED_SUFFIX: &str = "/rejected";

/// Queue error types
#[derive(Debug, Error)]
pub enum QueueError {
    /// Unknown mutation type name
    #[error("Unknown mutation type: {0}")]
    UnknownType(String),

    /// KV store error
    #[error("KV store error: {0}")]
    Kv(#[from] KvError),
}

/// Result type for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

/// Logical kind of a queued write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationType {
    /// Attendance mark
    Attendance,
    /// Chat message
    Message,
    /// Outbound notification send
    Notification,
}

impl MutationType {
    /// Every queueable type
    pub const ALL: [MutationType; 3] = [
        MutationType::Attendance,
        MutationType::Message,
        MutationType::Notification,
    ];

    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationType::Attendance => "attendance",
            MutationType::Message => "message",
            MutationType::Notification => "notification",
        }
    }

    fn store_name(&self) -> String {
        format!("{}{}", QUEUE_PREFIX, self.as_str())
    }
}

impl fmt::Display for MutationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationType {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "attendance" => Ok(MutationType::Attendance),
            "message" => Ok(MutationType::Message),
            "notification" => Ok(MutationType::Notification),
            other => Err(QueueError::UnknownType(other.to_string())),
        }
    }
}

/// Generated identifier of a queued write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(u64);

impl MutationId {
    /// Raw numeric value
    pub fn value(&self) -> u64 {
        self.0
    }

    fn key(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A write the caller wants delivered later
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
    /// Logical type
    pub mutation_type: MutationType,
    /// HTTP method of the original request
    pub method: String,
    /// URL of the original request
    pub url: String,
    /// Opaque JSON body
    pub payload: serde_json::Value,
}

impl MutationRequest {
    /// A POST of `payload` to `url`
    pub fn post(
        mutation_type: MutationType,
        url: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self { mutation_type, method: "POST".to_string(), url: url.into(), payload }
    }

    /// Override the HTTP method
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }
}

/// One not-yet-delivered write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    /// Generated identifier
    pub id: MutationId,
    /// Logical type
    #[serde(rename = "type")]
    pub mutation_type: MutationType,
    /// HTTP method of the original request
    pub method: String,
    /// URL of the original request
    pub url: String,
    /// Opaque JSON body
    pub payload: serde_json::Value,
    /// When the write was queued
    pub created_at: DateTime<Utc>,
}

/// Durable per-type queue of undelivered writes
pub struct OfflineQueue {
    kv: KvStore,
    clock: Arc<dyn Clock>,
}

impl OfflineQueue {
    /// Create a queue over an existing store
    pub fn new(kv: KvStore, clock: Arc<dyn Clock>) -> Self {
        Self { kv, clock }
    }

    /// Persist a write for later delivery
    pub fn enqueue(&self, request: MutationRequest) -> Result<QueuedMutation> {
        let id = MutationId(self.kv.generate_id()?);
        let mutation = QueuedMutation {
            id,
            mutation_type: request.mutation_type,
            method: request.method,
            url: request.url,
            payload: request.payload,
            created_at: self.clock.now(),
        };

        self.store(mutation.mutation_type)?
            .insert(id.key(), &mutation)?;
        tracing::debug!("Queued {} mutation {} for {}", mutation.mutation_type, id, mutation.url);

        Ok(mutation)
    }

    /// Pending writes of one type, oldest first
    ///
    /// Records that no longer decode are moved to the type's rejected
    /// partition and left out, so they cannot hold up the rest.
    pub fn list(&self, mutation_type: MutationType) -> Result<Vec<QueuedMutation>> {
        let store = self.store(mutation_type)?;
        let mut mutations = Vec::new();

        for (key, decoded) in store.entries_each::<QueuedMutation>()? {
            match decoded {
                Ok(mutation) => mutations.push(mutation),
                Err(e) => {
                    tracing::warn!("Rejecting unreadable {} mutation record: {}", mutation_type, e);
                    store.move_to(&key, &self.rejected_store(mutation_type)?)?;
                }
            }
        }

        Ok(mutations)
    }

    /// Number of records set aside because they could not be decoded
    pub fn rejected_count(&self, mutation_type: MutationType) -> Result<usize> {
        Ok(self.rejected_store(mutation_type)?.len())
    }

    /// Delete a delivered write
    pub fn remove(&self, mutation_type: MutationType, id: MutationId) -> Result<bool> {
        let removed = self.store(mutation_type)?.remove(id.key())?;
        if removed {
            tracing::debug!("Removed {} mutation {}", mutation_type, id);
        }
        Ok(removed)
    }

    /// Number of pending writes of one type
    pub fn pending_count(&self, mutation_type: MutationType) -> Result<usize> {
        Ok(self.store(mutation_type)?.len())
    }

    /// Number of pending writes across all types
    pub fn total_pending(&self) -> Result<usize> {
        let mut total = 0;
        for mutation_type in MutationType::ALL {
            total += self.pending_count(mutation_type)?;
        }
        Ok(total)
    }

    /// Types with at least one pending write
    pub fn pending_types(&self) -> Result<Vec<MutationType>> {
        let mut types = Vec::new();
        for mutation_type in MutationType::ALL {
            if self.pending_count(mutation_type)? > 0 {
                types.push(mutation_type);
            }
        }
        Ok(types)
    }

    /// Drop every pending write of one type
    pub fn clear(&self, mutation_type: MutationType) -> Result<()> {
        self.store(mutation_type)?.clear()?;
        Ok(())
    }

    fn store(&self, mutation_type: MutationType) -> Result<KvTree> {
        Ok(self.kv.tree(&mutation_type.store_name())?)
    }

    fn rejected_store(&self, mutation_type: MutationType) -> Result<KvTree> {
        Ok(self.kv.tree(&format!("{}{}", mutation_type.store_name(), REJECTED_SUFFIX))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::KvConfig;
    use serde_json::json;

    fn queue() -> OfflineQueue {
        OfflineQueue::new(KvStore::in_memory().unwrap(), Arc::new(ManualClock::default()))
    }

    fn attendance(player: &str) -> MutationRequest {
        MutationRequest::post(
            MutationType::Attendance,
            "/api/attendance",
            json!({ "player": player, "present": true }),
        )
    }

    #[test]
    fn test_enqueue_and_list_in_order() {
        let queue = queue();

        let a = queue.enqueue(attendance("ana")).unwrap();
        let b = queue.enqueue(attendance("ben")).unwrap();
        let c = queue.enqueue(attendance("cai")).unwrap();

        let listed = queue.list(MutationType::Attendance).unwrap();
        assert_eq!(listed, vec![a, b, c]);
        assert_eq!(listed[0].payload["player"], "ana");
        assert_eq!(listed[0].method, "POST");
    }

    #[test]
    fn test_types_are_isolated() {
        let queue = queue();

        queue.enqueue(attendance("ana")).unwrap();
        queue
            .enqueue(MutationRequest::post(
                MutationType::Message,
                "/api/messages/send",
                json!({ "text": "hi" }),
            ))
            .unwrap();

        assert_eq!(queue.pending_count(MutationType::Attendance).unwrap(), 1);
        assert_eq!(queue.pending_count(MutationType::Message).unwrap(), 1);
        assert_eq!(queue.pending_count(MutationType::Notification).unwrap(), 0);
        assert_eq!(
            queue.pending_types().unwrap(),
            vec![MutationType::Attendance, MutationType::Message]
        );
        assert_eq!(queue.total_pending().unwrap(), 2);
    }

    #[test]
    fn test_remove_exactly_one() {
        let queue = queue();

        let a = queue.enqueue(attendance("ana")).unwrap();
        queue.enqueue(attendance("ben")).unwrap();

        assert!(queue.remove(MutationType::Attendance, a.id).unwrap());
        assert!(!queue.remove(MutationType::Attendance, a.id).unwrap());
        assert_eq!(queue.pending_count(MutationType::Attendance).unwrap(), 1);
    }

    #[test]
    fn test_empty_queue_operations_are_noops() {
        let queue = queue();

        assert!(queue.list(MutationType::Message).unwrap().is_empty());
        assert!(queue.pending_types().unwrap().is_empty());
        queue.clear(MutationType::Message).unwrap();
        assert_eq!(queue.total_pending().unwrap(), 0);
    }

    #[test]
    fn test_unreadable_record_is_set_aside() {
        let kv = KvStore::in_memory().unwrap();
        let queue = OfflineQueue::new(kv.clone(), Arc::new(ManualClock::default()));

        let a = queue.enqueue(attendance("ana")).unwrap();
        kv.tree("queue/attendance")
            .unwrap()
            .insert(kv.generate_id().unwrap().to_be_bytes(), &"garbage")
            .unwrap();
        let b = queue.enqueue(attendance("ben")).unwrap();

        assert_eq!(queue.list(MutationType::Attendance).unwrap(), vec![a, b]);
        assert_eq!(queue.pending_count(MutationType::Attendance).unwrap(), 2);
        assert_eq!(queue.rejected_count(MutationType::Attendance).unwrap(), 1);

        // Listing again finds nothing new to reject
        queue.list(MutationType::Attendance).unwrap();
        assert_eq!(queue.rejected_count(MutationType::Attendance).unwrap(), 1);
    }

    #[test]
    fn test_queue_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        let queued = {
            let kv = KvStore::new(KvConfig::new(&path)).unwrap();
            let queue = OfflineQueue::new(kv.clone(), Arc::new(ManualClock::default()));
            let queued = queue.enqueue(attendance("ana")).unwrap();
            kv.flush().unwrap();
            queued
        };

        let kv = KvStore::new(KvConfig::new(&path)).unwrap();
        let queue = OfflineQueue::new(kv.clone(), Arc::new(ManualClock::default()));
        assert_eq!(queue.list(MutationType::Attendance).unwrap(), vec![queued.clone()]);

        // Ids keep increasing after a restart
        let next = queue.enqueue(attendance("ben")).unwrap();
        assert!(next.id > queued.id);
    }

    #[test]
    fn test_mutation_type_names() {
        for mutation_type in MutationType::ALL {
            assert_eq!(mutation_type.as_str().parse::<MutationType>().unwrap(), mutation_type);
        }
        assert!(matches!("chat".parse::<MutationType>(), Err(QueueError::UnknownType(_))));
        assert_eq!(
            serde_json::to_value(MutationType::Attendance).unwrap(),
            json!("attendance")
        );
    }
}
