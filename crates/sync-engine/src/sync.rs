//! Sync coordinator
//!
//! Drains the offline queue by re-issuing every pending write. Types drain
//! concurrently; items within a type go out one at a time in enqueue order.
//! An item is deleted only after the server accepted it with a 2xx, so a
//! crash between delivery and deletion re-delivers it once more on the next
//! sync. Each request carries an `idempotency-key` header with the queue id
//! so the server can discard such duplicates.
//!
//! There is no backoff here: syncs are triggered by reconnects and explicit
//! requests only.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use networking::{Fetcher, Method, Request};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use storage::{Clock, MutationType, OfflineQueue, QueueError, QueuedMutation};
use tokio::sync::Mutex;

use crate::events::{EngineEvent, EventBus};

/// Header carrying the queue id on re-delivery
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, QueueError>;

/// What started a sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTrigger {
    /// Connectivity returned
    Reconnect,
    /// The application asked for it
    Manual,
}

/// Outcome of draining one type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeReport {
    /// Items delivered and removed
    pub delivered: usize,
    /// Items left queued
    pub remaining: usize,
}

/// Outcome of one sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    /// What started the sync
    pub trigger: SyncTrigger,
    /// Per-type results, only for types that had pending items
    pub types: BTreeMap<MutationType, TypeReport>,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Finish time
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    /// Items delivered across all types
    pub fn delivered(&self) -> usize {
        self.types.values().map(|t| t.delivered).sum()
    }

    /// Items still queued across all types
    pub fn remaining(&self) -> usize {
        self.types.values().map(|t| t.remaining).sum()
    }

    /// Whether every pending item was delivered
    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }
}

/// Re-delivers queued writes
pub struct SyncCoordinator {
    queue: Arc<OfflineQueue>,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    running: Mutex<()>,
}

impl SyncCoordinator {
    /// Create a coordinator
    pub fn new(
        queue: Arc<OfflineQueue>,
        fetcher: Arc<dyn Fetcher>,
        clock: Arc<dyn Clock>,
        bus: EventBus,
    ) -> Self {
        Self { queue, fetcher, clock, bus, running: Mutex::new(()) }
    }

    /// Drain every type with pending items
    ///
    /// Overlapping calls are serialized; the second waits for the first and
    /// then drains whatever is still pending.
    pub async fn sync(&self, trigger: SyncTrigger) -> Result<SyncReport> {
        let _running = self.running.lock().await;

        let started_at = self.clock.now();
        let pending = self.queue.pending_types()?;
        tracing::info!("Sync ({:?}) started, {} type(s) pending", trigger, pending.len());
        self.bus.publish(EngineEvent::SyncStarted { trigger });

        let drains = pending.iter().map(|mutation_type| self.drain(*mutation_type));
        let results = join_all(drains).await;

        let mut types = BTreeMap::new();
        for (mutation_type, result) in pending.into_iter().zip(results) {
            match result {
                Ok(report) => {
                    types.insert(mutation_type, report);
                }
                Err(e) => {
                    tracing::warn!("Draining {} queue failed: {}", mutation_type, e);
                    let remaining = self.queue.pending_count(mutation_type).unwrap_or(0);
                    types.insert(mutation_type, TypeReport { delivered: 0, remaining });
                }
            }
        }

        let report = SyncReport { trigger, types, started_at, finished_at: self.clock.now() };
        tracing::info!(
            "Sync finished: {} delivered, {} remaining",
            report.delivered(),
            report.remaining()
        );
        self.bus.publish(EngineEvent::SyncCompleted(report.clone()));

        Ok(report)
    }

    async fn drain(&self, mutation_type: MutationType) -> Result<TypeReport> {
        let items = self.queue.list(mutation_type)?;
        let mut report = TypeReport::default();

        for item in items {
            if self.deliver(&item).await {
                match self.queue.remove(mutation_type, item.id) {
                    Ok(_) => report.delivered += 1,
                    Err(e) => {
                        // Delivered but still queued; the next sync re-sends it
                        tracing::warn!("Could not remove delivered mutation {}: {}", item.id, e);
                        report.remaining += 1;
                    }
                }
            } else {
                report.remaining += 1;
            }
        }

        Ok(report)
    }

    async fn deliver(&self, item: &QueuedMutation) -> bool {
        let Some(request) = redelivery_request(item) else {
            return false;
        };

        match self.fetcher.fetch(request).await {
            Ok(response) if response.is_success() => {
                tracing::debug!("Delivered {} mutation {}", item.mutation_type, item.id);
                true
            }
            Ok(response) => {
                tracing::warn!(
                    "Server rejected {} mutation {} with {}, keeping it queued",
                    item.mutation_type,
                    item.id,
                    response.status
                );
                false
            }
            Err(e) => {
                tracing::debug!("Re-delivery of {} failed: {}", item.id, e);
                false
            }
        }
    }
}

fn redelivery_request(item: &QueuedMutation) -> Option<Request> {
    let method: Method = match item.method.parse() {
        Ok(method) => method,
        Err(e) => {
            tracing::warn!("Mutation {} has unusable method: {}", item.id, e);
            return None;
        }
    };

    let request = Request::new(method, &item.url).header(IDEMPOTENCY_HEADER, item.id.to_string());
    match request.json_body(&item.payload) {
        Ok(request) => Some(request),
        Err(e) => {
            tracing::warn!("Mutation {} payload could not be encoded: {}", item.id, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use networking::testing::StubFetcher;
    use networking::{FetchError, MockFetcher, Response};
    use serde_json::json;
    use storage::{KvStore, ManualClock, MutationRequest};

    fn queue() -> Arc<OfflineQueue> {
        Arc::new(OfflineQueue::new(
            KvStore::in_memory().unwrap(),
            Arc::new(ManualClock::default()),
        ))
    }

    fn coordinator(queue: Arc<OfflineQueue>, fetcher: Arc<dyn Fetcher>) -> (SyncCoordinator, EventBus) {
        let bus = EventBus::new();
        let sync = SyncCoordinator::new(queue, fetcher, Arc::new(ManualClock::default()), bus.clone());
        (sync, bus)
    }

    fn attendance(player: &str) -> MutationRequest {
        MutationRequest::post(
            MutationType::Attendance,
            "/api/attendance",
            json!({ "player": player }),
        )
    }

    #[tokio::test]
    async fn test_drains_all_on_success() {
        let queue = queue();
        for player in ["ana", "ben", "cai"] {
            queue.enqueue(attendance(player)).unwrap();
        }
        let stub = Arc::new(StubFetcher::new());
        stub.respond("POST /api/attendance", Response::new(201, ""));
        let (sync, _bus) = coordinator(queue.clone(), stub.clone());

        let report = sync.sync(SyncTrigger::Reconnect).await.unwrap();

        assert_eq!(report.delivered(), 3);
        assert!(report.is_complete());
        assert_eq!(queue.pending_count(MutationType::Attendance).unwrap(), 0);

        // Enqueue order is preserved and every request carries its id
        let sent = stub.requests();
        let players: Vec<String> = sent
            .iter()
            .map(|r| r.json::<serde_json::Value>().unwrap()["player"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(players, vec!["ana", "ben", "cai"]);
        assert!(sent.iter().all(|r| r.headers.contains_key(IDEMPOTENCY_HEADER)));
    }

    #[tokio::test]
    async fn test_failed_item_does_not_block_others() {
        let queue = queue();
        queue.enqueue(attendance("ana")).unwrap();
        queue
            .enqueue(MutationRequest::post(
                MutationType::Attendance,
                "/api/attendance/late",
                json!({ "player": "ben" }),
            ))
            .unwrap();
        queue.enqueue(attendance("cai")).unwrap();

        let stub = Arc::new(StubFetcher::new());
        stub.respond("/api/attendance", Response::ok(""))
            .fail("/api/attendance/late", FetchError::Network("reset".into()));
        let (sync, _bus) = coordinator(queue.clone(), stub);

        let report = sync.sync(SyncTrigger::Manual).await.unwrap();
        assert_eq!(report.delivered(), 2);
        assert_eq!(report.remaining(), 1);

        let left = queue.list(MutationType::Attendance).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].url, "/api/attendance/late");
    }

    #[tokio::test]
    async fn test_unreadable_record_does_not_block_type() {
        let kv = KvStore::in_memory().unwrap();
        let queue = Arc::new(OfflineQueue::new(kv.clone(), Arc::new(ManualClock::default())));
        queue.enqueue(attendance("ana")).unwrap();
        queue.enqueue(attendance("ben")).unwrap();
        kv.tree("queue/attendance")
            .unwrap()
            .insert(kv.generate_id().unwrap().to_be_bytes(), &"not a mutation")
            .unwrap();

        let stub = Arc::new(StubFetcher::new());
        stub.respond("POST /api/attendance", Response::ok(""));
        let (sync, _bus) = coordinator(queue.clone(), stub.clone());

        let report = sync.sync(SyncTrigger::Manual).await.unwrap();

        assert_eq!(report.delivered(), 2);
        assert_eq!(report.remaining(), 0);
        assert_eq!(stub.call_count("/api/attendance"), 2);
        assert_eq!(queue.total_pending().unwrap(), 0);
        assert_eq!(queue.rejected_count(MutationType::Attendance).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_non_success_status_stays_queued() {
        let queue = queue();
        queue.enqueue(attendance("ana")).unwrap();
        let stub = Arc::new(StubFetcher::new());
        stub.respond("/api/attendance", Response::new(500, "oops"));
        let (sync, _bus) = coordinator(queue.clone(), stub);

        let report = sync.sync(SyncTrigger::Manual).await.unwrap();
        assert_eq!(report.types[&MutationType::Attendance], TypeReport { delivered: 0, remaining: 1 });
        assert_eq!(queue.total_pending().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_queue_is_noop() {
        let mut mock = MockFetcher::new();
        mock.expect_fetch().times(0);
        let (sync, _bus) = coordinator(queue(), Arc::new(mock));

        let report = sync.sync(SyncTrigger::Manual).await.unwrap();
        assert!(report.types.is_empty());
        assert_eq!(report.delivered(), 0);
    }

    #[tokio::test]
    async fn test_types_drain_independently() {
        let queue = queue();
        queue.enqueue(attendance("ana")).unwrap();
        queue
            .enqueue(MutationRequest::post(
                MutationType::Message,
                "/api/messages/send",
                json!({ "text": "late" }),
            ))
            .unwrap();

        let stub = Arc::new(StubFetcher::new());
        stub.respond("/api/attendance", Response::ok(""));
        stub.fail("/api/messages/send", FetchError::Timeout("slow".into()));
        let (sync, _bus) = coordinator(queue.clone(), stub);

        let report = sync.sync(SyncTrigger::Reconnect).await.unwrap();
        assert_eq!(report.types[&MutationType::Attendance].delivered, 1);
        assert_eq!(report.types[&MutationType::Message].remaining, 1);
        assert_eq!(queue.pending_types().unwrap(), vec![MutationType::Message]);
    }

    #[tokio::test]
    async fn test_publishes_started_and_completed() {
        let queue = queue();
        queue.enqueue(attendance("ana")).unwrap();
        let stub = Arc::new(StubFetcher::new());
        stub.respond("/api/attendance", Response::ok(""));
        let (sync, bus) = coordinator(queue, stub);
        let mut rx = bus.subscribe();

        sync.sync(SyncTrigger::Manual).await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::SyncStarted { trigger: SyncTrigger::Manual }
        );
        match rx.recv().await.unwrap() {
            EngineEvent::SyncCompleted(report) => assert_eq!(report.delivered(), 1),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_syncs_deliver_once() {
        let queue = queue();
        for player in ["ana", "ben"] {
            queue.enqueue(attendance(player)).unwrap();
        }
        let stub = Arc::new(StubFetcher::new());
        stub.respond("/api/attendance", Response::ok(""));
        let (sync, _bus) = coordinator(queue.clone(), stub.clone());

        let (a, b) = tokio::join!(sync.sync(SyncTrigger::Manual), sync.sync(SyncTrigger::Reconnect));

        assert_eq!(a.unwrap().delivered() + b.unwrap().delivered(), 2);
        assert_eq!(stub.call_count("/api/attendance"), 2);
        assert_eq!(queue.total_pending().unwrap(), 0);
    }

    #[test]
    fn test_redelivery_request_rejects_bad_method() {
        let queue = queue();
        let item = queue.enqueue(attendance("ana").method("BREW")).unwrap();
        assert!(redelivery_request(&item).is_none());

        let item = queue.enqueue(attendance("ben")).unwrap();
        let request = redelivery_request(&item).unwrap();
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.headers[IDEMPOTENCY_HEADER], item.id.to_string());
    }
}
