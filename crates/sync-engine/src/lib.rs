//! Offline-first caching and sync engine for Rosterline
//!
//! This crate intercepts the application's requests, serves them from a
//! tiered cache according to per-path strategies, queues writes that could
//! not be delivered, and replays them when connectivity returns. It also
//! coordinates cache generations across deployments and turns push payloads
//! into notifications.
//!
//! Start with [`Engine::builder`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connectivity;
pub mod engine;
pub mod events;
pub mod lifecycle;
pub mod notifications;
pub mod router;
pub mod scheduler;
pub mod strategy;
pub mod sync;

pub use config::{ConfigError, EngineConfig, TierKind};
pub use connectivity::{ConnectivityState, HealthProbe, HttpHealthProbe, ProbeOutcome};
pub use engine::{Engine, EngineBuilder, EngineError, EngineStatus};
pub use events::{EngineEvent, EventBus, Subscription};
pub use lifecycle::{LifecycleError, LifecycleState};
pub use notifications::{
    ClickOutcome, Notification, NotificationAction, PushPayload, WindowHost, WindowInfo,
};
pub use router::{Route, StrategyKind};
pub use scheduler::{ManualScheduler, ScheduledTask, Scheduler, TokioScheduler};
pub use sync::{SyncReport, SyncTrigger};
