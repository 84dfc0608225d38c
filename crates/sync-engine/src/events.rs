//! Outward event bus
//!
//! Events reach the hosting application two ways: a tokio broadcast channel
//! for async consumers, and registered handlers for callback-style consumers.
//! Registering a handler returns a [`Subscription`]; the handler stays
//! registered exactly as long as that value is alive.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use storage::{MutationId, MutationType};
use tokio::sync::broadcast;

use crate::connectivity::ConnectivityState;
use crate::sync::{SyncReport, SyncTrigger};

const CHANNEL_CAPACITY: usize = 64;

/// Everything the engine reports to the application
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Connectivity state changed
    ConnectivityChanged {
        /// Previous state
        from: ConnectivityState,
        /// New state
        to: ConnectivityState,
    },

    /// Banner text for the user
    StatusNotice {
        /// State the notice describes
        state: ConnectivityState,
        /// Human readable message
        message: String,
    },

    /// A new generation is installed and waiting for activation
    UpdateAvailable {
        /// Waiting generation
        generation: String,
    },

    /// A waiting generation was force-activated
    UpdateApplied {
        /// Newly active generation
        generation: String,
        /// The page must reload to pick up the new build
        reload_required: bool,
    },

    /// Installing a generation failed; the previous one keeps serving
    UpdateFailed {
        /// Generation that failed to install
        generation: String,
        /// Failure description
        reason: String,
    },

    /// A generation became active
    Activated {
        /// Active generation
        generation: String,
        /// Tiers deleted during activation
        purged: Vec<String>,
    },

    /// Queue drain started
    SyncStarted {
        /// What caused it
        trigger: SyncTrigger,
    },

    /// Queue drain finished
    SyncCompleted(SyncReport),

    /// A write was accepted for later delivery
    MutationQueued {
        /// Queue id
        id: MutationId,
        /// Logical type
        mutation_type: MutationType,
    },
}

type Handler = Arc<dyn Fn(&EngineEvent) + Send + Sync>;
type Registry = RwLock<BTreeMap<u64, Handler>>;

/// Broadcast channel plus handler registry
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    handlers: Arc<Registry>,
    next_id: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            handlers: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Receive every future event
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Deliver an event to every receiver and handler
    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!("Publishing {:?}", event);

        // Handlers run outside the lock so they may register or drop subscriptions
        let handlers: Vec<Handler> = self.handlers.read().values().cloned().collect();
        for handler in handlers {
            handler(&event);
        }

        // No receivers is not an error
        let _ = self.tx.send(event);
    }

    /// Register a handler for every event
    pub fn on_event<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().insert(id, Arc::new(handler));
        Subscription { id, registry: Arc::downgrade(&self.handlers), active: true }
    }

    /// Register a handler for connectivity transitions
    pub fn on_connectivity_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ConnectivityState) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let EngineEvent::ConnectivityChanged { to, .. } = event {
                handler(*to);
            }
        })
    }

    /// Register a handler for finished syncs
    pub fn on_sync_complete<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SyncReport) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let EngineEvent::SyncCompleted(report) = event {
                handler(report);
            }
        })
    }

    /// Register a handler for waiting updates
    pub fn on_update_available<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let EngineEvent::UpdateAvailable { generation } = event {
                handler(generation);
            }
        })
    }

    /// Number of registered handlers
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Drop every registered handler
    pub fn clear_handlers(&self) {
        self.handlers.write().clear();
    }
}

/// Handle to a registered handler
///
/// Dropping it unregisters the handler.
#[must_use = "the handler is unregistered when the subscription is dropped"]
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
    active: bool,
}

impl Subscription {
    /// Unregister the handler now
    pub fn unsubscribe(mut self) {
        self.cancel();
    }

    /// Whether the handler is still registered
    pub fn is_active(&self) -> bool {
        self.active
            && self
                .registry
                .upgrade()
                .is_some_and(|registry| registry.read().contains_key(&self.id))
    }

    fn cancel(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(registry) = self.registry.upgrade() {
            registry.write().remove(&self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}
