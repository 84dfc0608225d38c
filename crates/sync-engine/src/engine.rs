//! The engine object
//!
//! `Engine` owns every component and is the only entry point the hosting
//! application needs: it intercepts requests, accepts writes for later
//! delivery, reacts to connectivity changes, and exposes lifecycle and
//! notification controls. Instances are fully isolated from each other.

use futures::FutureExt;
use networking::{FetchError, Fetcher, HttpClient, Request, Response};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::sync::{Arc, Weak};
use storage::{
    CacheError, CacheStore, Clock, KvError, KvStore, MutationRequest, OfflineQueue, QueueError,
    QueuedMutation, SystemClock,
};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::{ConfigError, EngineConfig, TierKind};
use crate::connectivity::{
    ConnectivityMonitor, ConnectivityState, HealthProbe, HttpHealthProbe, Transition,
};
use crate::events::{EngineEvent, EventBus, Subscription};
use crate::lifecycle::{LifecycleError, LifecycleManager, LifecycleState};
use crate::notifications::{
    ClickOutcome, Notification, NotificationDispatcher, NotificationError, WindowHost,
};
use crate::router::{RequestRouter, Route};
use crate::scheduler::{ScheduledTask, Scheduler, Task, TokioScheduler};
use crate::strategy::Strategies;
use crate::sync::{SyncCoordinator, SyncReport, SyncTrigger};

/// Engine error types
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// KV store error
    #[error("KV store error: {0}")]
    Kv(#[from] KvError),

    /// Cache error
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Queue error
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Lifecycle error
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Notification error
    #[error("Notification error: {0}")]
    Notification(#[from] NotificationError),

    /// Network error
    #[error("Network error: {0}")]
    Fetch(#[from] FetchError),

    /// No window host was configured
    #[error("No window host configured")]
    NoWindowHost,

    /// The engine was disposed
    #[error("Engine has been disposed")]
    Disposed,
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Where the engine is in its own lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Built, not yet initialized; requests pass straight through
    Created,
    /// Initialized and intercepting
    Running,
    /// Disposed; requests pass straight through
    Disposed,
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    config: EngineConfig,
    fetcher: Option<Arc<dyn Fetcher>>,
    probe: Option<Arc<dyn HealthProbe>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    clock: Option<Arc<dyn Clock>>,
    windows: Option<Arc<dyn WindowHost>>,
    kv: Option<KvStore>,
    initial_state: ConnectivityState,
}

impl EngineBuilder {
    fn new(config: EngineConfig) -> Self {
        Self {
            config,
            fetcher: None,
            probe: None,
            scheduler: None,
            clock: None,
            windows: None,
            kv: None,
            initial_state: ConnectivityState::Online,
        }
    }

    /// Network access (default: reqwest client from `config.network`)
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Health probe (default: GET `config.probe.health_url`)
    pub fn health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Scheduler for the periodic probe (default: tokio intervals)
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Clock for timestamps (default: system time)
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Window host for notification clicks
    pub fn window_host(mut self, windows: Arc<dyn WindowHost>) -> Self {
        self.windows = Some(windows);
        self
    }

    /// Use an already open store instead of `config.storage`
    pub fn kv_store(mut self, kv: KvStore) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Connectivity assumed before the first signal
    pub fn initial_connectivity(mut self, state: ConnectivityState) -> Self {
        self.initial_state = state;
        self
    }

    /// Open storage and assemble the engine
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;

        let fetcher: Arc<dyn Fetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => {
                self.config.validate_for_http_client()?;
                Arc::new(HttpClient::new(self.config.network.to_client_config())?)
            }
        };
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let scheduler: Arc<dyn Scheduler> =
            self.scheduler.unwrap_or_else(|| Arc::new(TokioScheduler));
        let probe: Arc<dyn HealthProbe> = self.probe.unwrap_or_else(|| {
            Arc::new(HttpHealthProbe::new(fetcher.clone(), self.config.probe.health_url.clone()))
        });
        let kv = match self.kv {
            Some(kv) => kv,
            None => KvStore::new(self.config.storage.to_kv_config())?,
        };

        let bus = EventBus::new();
        let cache = Arc::new(CacheStore::new(kv.clone(), clock.clone()));
        let queue = Arc::new(OfflineQueue::new(kv.clone(), clock.clone()));
        let lifecycle =
            LifecycleManager::new(kv.clone(), cache.clone(), fetcher.clone(), bus.clone())?;
        let sync = SyncCoordinator::new(queue.clone(), fetcher.clone(), clock, bus.clone());

        let inner = Inner {
            router: RequestRouter::new(self.config.routes.clone()),
            notifications: NotificationDispatcher::new(self.config.notifications.clone()),
            strategies: Strategies::new(cache.clone(), fetcher.clone()),
            monitor: ConnectivityMonitor::new(self.initial_state, bus.clone()),
            config: self.config,
            kv,
            cache,
            queue,
            fetcher,
            bus,
            lifecycle,
            sync,
            probe,
            scheduler,
            windows: self.windows,
            status: RwLock::new(EngineStatus::Created),
            init_lock: tokio::sync::Mutex::new(()),
            probe_task: Mutex::new(None),
        };

        Ok(Engine { inner: Arc::new(inner) })
    }
}

struct Inner {
    config: EngineConfig,
    kv: KvStore,
    cache: Arc<CacheStore>,
    queue: Arc<OfflineQueue>,
    fetcher: Arc<dyn Fetcher>,
    bus: EventBus,
    router: RequestRouter,
    strategies: Strategies,
    monitor: ConnectivityMonitor,
    lifecycle: LifecycleManager,
    sync: SyncCoordinator,
    notifications: NotificationDispatcher,
    probe: Arc<dyn HealthProbe>,
    scheduler: Arc<dyn Scheduler>,
    windows: Option<Arc<dyn WindowHost>>,
    status: RwLock<EngineStatus>,
    init_lock: tokio::sync::Mutex<()>,
    probe_task: Mutex<Option<ScheduledTask>>,
}

/// Offline-first caching and sync engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Start building an engine
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Install or resume the configured generation and start probing
    ///
    /// Idempotent. If installing a new generation fails, the engine still
    /// starts and keeps serving the previously active generation; the install
    /// error is returned so the caller can report it.
    pub async fn init(&self) -> Result<()> {
        // Concurrent callers wait here and then see `Running`
        let _initializing = self.inner.init_lock.lock().await;
        match self.status() {
            EngineStatus::Running => return Ok(()),
            EngineStatus::Disposed => return Err(EngineError::Disposed),
            EngineStatus::Created => {}
        }

        let inner = &self.inner;
        if let Some(previous) = inner.lifecycle.active_generation() {
            if previous != inner.config.generation {
                inner.lifecycle.configure_tiers(&inner.config, &previous)?;
            }
        }

        let installed = inner.lifecycle.install(&inner.config).await;

        {
            let mut status = inner.status.write();
            if *status == EngineStatus::Disposed {
                return Err(EngineError::Disposed);
            }
            *inner.probe_task.lock() = Some(
                inner
                    .scheduler
                    .schedule(inner.config.probe.interval(), self.probe_task()),
            );
            *status = EngineStatus::Running;
        }

        match installed {
            Ok(state) => {
                tracing::info!(
                    "Engine running, generation {} {}",
                    inner.config.generation,
                    state
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    "Engine running on previous generation {:?}: {}",
                    inner.lifecycle.active_generation(),
                    e
                );
                Err(e.into())
            }
        }
    }

    /// Stop probing, drop handlers and flush storage
    ///
    /// Idempotent. A disposed engine cannot be re-initialized.
    pub async fn dispose(&self) -> Result<()> {
        {
            let mut status = self.inner.status.write();
            if *status == EngineStatus::Disposed {
                return Ok(());
            }
            *status = EngineStatus::Disposed;
        }

        if let Some(task) = self.inner.probe_task.lock().take() {
            task.cancel();
        }
        self.inner.bus.clear_handlers();
        self.inner.kv.flush()?;
        tracing::info!("Engine disposed");
        Ok(())
    }

    /// Current engine status
    pub fn status(&self) -> EngineStatus {
        *self.inner.status.read()
    }

    /// Configuration in use
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Lifecycle state of the configured generation
    pub fn lifecycle_state(&self) -> Option<LifecycleState> {
        self.inner.lifecycle.state()
    }

    /// Generation currently serving
    pub fn active_generation(&self) -> Option<String> {
        self.inner.lifecycle.active_generation()
    }

    /// Generation waiting for activation
    pub fn waiting_generation(&self) -> Option<String> {
        self.inner.lifecycle.waiting_generation()
    }

    /// Apply a waiting update now
    ///
    /// Returns `false` when nothing is waiting. On success an
    /// `UpdateApplied { reload_required: true }` event is published.
    pub async fn skip_waiting(&self) -> Result<bool> {
        self.ensure_not_disposed()?;
        Ok(self.inner.lifecycle.skip_waiting().await?)
    }

    // =========================================================================
    // Request interception
    // =========================================================================

    /// Serve an intercepted request
    ///
    /// Before `init` or after `dispose` the request goes straight to the
    /// network. Offline API calls are answered with a `503` JSON body carrying
    /// `"offline": true`; offline writes to a queued endpoint are answered
    /// with `202` and `"queued": true`.
    pub async fn handle(&self, request: Request) -> std::result::Result<Response, FetchError> {
        let inner = &self.inner;
        let generation = match self.status() {
            EngineStatus::Running => inner.lifecycle.active_generation(),
            _ => None,
        };
        let Some(generation) = generation else {
            return inner.fetcher.fetch(request).await;
        };

        let route = inner.router.classify(&request);
        let (Some(kind), Some(tier_kind)) = (route.strategy(), route.tier()) else {
            return self.passthrough(request).await;
        };
        let tier = tier_kind.tier_name(&generation);

        match route {
            Route::Api(_) => {
                let url = request.url.clone();
                match inner.strategies.serve(kind, &tier, request).await {
                    Err(e) if e.is_network_failure() => Ok(offline_response(&url, &e)),
                    other => other,
                }
            }
            Route::Navigation => {
                let key = request.cache_key();
                match inner.strategies.serve(kind, &tier, request).await {
                    Err(e) if e.is_network_failure() => {
                        match self.precached_page(&generation, &key) {
                            Some(page) => Ok(page),
                            None => Err(e),
                        }
                    }
                    other => other,
                }
            }
            _ => inner.strategies.serve(kind, &tier, request).await,
        }
    }

    async fn passthrough(&self, request: Request) -> std::result::Result<Response, FetchError> {
        let inner = &self.inner;
        let mutation_type = inner.router.mutation_type(&request);
        let is_api = inner.router.is_api(&request.path());
        let retained = (mutation_type.is_some() || is_api).then(|| request.clone());

        let error = match inner.fetcher.fetch(request).await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_network_failure() => e,
            Err(e) => return Err(e),
        };
        let Some(request) = retained else {
            return Err(error);
        };

        let Some(mutation_type) = mutation_type else {
            return Ok(offline_response(&request.url, &error));
        };

        let payload = match request.json::<serde_json::Value>() {
            Some(value) => value,
            None => request
                .body
                .as_deref()
                .map(|body| serde_json::Value::String(String::from_utf8_lossy(body).into_owned()))
                .unwrap_or(serde_json::Value::Null),
        };
        let mutation = MutationRequest::post(mutation_type, &request.url, payload)
            .method(request.method.as_str());

        match self.enqueue(mutation) {
            Ok(queued) => Ok(queued_response(&queued)),
            Err(e) => {
                tracing::warn!("Could not queue offline write to {}: {}", request.url, e);
                Ok(offline_response(&request.url, &error))
            }
        }
    }

    /// The page itself if it was precached, else the fallback document
    fn precached_page(&self, generation: &str, key: &str) -> Option<Response> {
        let static_tier = TierKind::Static.tier_name(generation);
        let fallback = Request::get(&self.inner.config.routes.fallback_document).cache_key();
        [key, fallback.as_str()]
            .iter()
            .find_map(|key| self.inner.strategies.lookup(&static_tier, key))
            .map(|entry| entry.value)
    }

    // =========================================================================
    // Offline queue and sync
    // =========================================================================

    /// Persist a write for later delivery
    pub fn enqueue(&self, request: MutationRequest) -> Result<QueuedMutation> {
        let queued = self.inner.queue.enqueue(request)?;
        self.inner.bus.publish(EngineEvent::MutationQueued {
            id: queued.id,
            mutation_type: queued.mutation_type,
        });
        Ok(queued)
    }

    /// Drain the offline queue now
    pub async fn sync_now(&self) -> Result<SyncReport> {
        self.ensure_not_disposed()?;
        Ok(self.inner.sync.sync(SyncTrigger::Manual).await?)
    }

    /// Writes waiting for delivery, across all types
    pub fn pending_mutations(&self) -> Result<usize> {
        Ok(self.inner.queue.total_pending()?)
    }

    /// The offline queue
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.inner.queue
    }

    /// The cache store
    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.inner.cache
    }

    // =========================================================================
    // Connectivity
    // =========================================================================

    /// Current connectivity
    pub fn connectivity(&self) -> ConnectivityState {
        self.inner.monitor.state()
    }

    /// Feed a browser online/offline signal
    ///
    /// On reconnect this returns after the queue drain and API refresh.
    pub async fn set_browser_online(&self, online: bool) -> ConnectivityState {
        let transition = self.inner.monitor.browser_signal(online);
        self.react(transition).await;
        self.connectivity()
    }

    /// Run one health probe now
    pub async fn probe_now(&self) -> ConnectivityState {
        let transition = self.inner.monitor.probe_with(self.inner.probe.as_ref()).await;
        self.react(transition).await;
        self.connectivity()
    }

    async fn react(&self, transition: Option<Transition>) {
        let Some(transition) = transition else {
            return;
        };
        if !transition.is_reconnect() || self.status() != EngineStatus::Running {
            return;
        }

        if let Err(e) = self.inner.sync.sync(SyncTrigger::Reconnect).await {
            tracing::warn!("Reconnect sync failed: {}", e);
        }
        if let Some(generation) = self.active_generation() {
            let tier = TierKind::Api.tier_name(&generation);
            self.inner.strategies.refresh_tier(&tier).await;
        }
    }

    fn probe_task(&self) -> Task {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    Engine { inner }.probe_now().await;
                }
            }
            .boxed()
        })
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Build a notification from a raw push payload
    pub fn push(&self, raw_payload: &str) -> Result<Notification> {
        Ok(self.inner.notifications.parse(raw_payload)?)
    }

    /// Handle a notification click or action
    pub async fn notification_click(
        &self,
        notification: &Notification,
        action: Option<&str>,
    ) -> Result<ClickOutcome> {
        let windows = self.inner.windows.as_ref().ok_or(EngineError::NoWindowHost)?;
        Ok(self
            .inner
            .notifications
            .handle_click(windows.as_ref(), notification, action)
            .await?)
    }

    /// Where a notification click would navigate
    pub fn notification_destination(
        &self,
        notification: &Notification,
        action: Option<&str>,
    ) -> Option<String> {
        self.inner.notifications.resolve_destination(notification, action)
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Receive every future event
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.bus.subscribe()
    }

    /// Register a handler for every event
    pub fn on_event<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on_event(handler)
    }

    /// Register a handler for connectivity transitions
    pub fn on_connectivity_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ConnectivityState) + Send + Sync + 'static,
    {
        self.inner.bus.on_connectivity_change(handler)
    }

    /// Register a handler for finished syncs
    pub fn on_sync_complete<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SyncReport) + Send + Sync + 'static,
    {
        self.inner.bus.on_sync_complete(handler)
    }

    /// Register a handler for waiting updates
    pub fn on_update_available<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.bus.on_update_available(handler)
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.status() == EngineStatus::Disposed {
            return Err(EngineError::Disposed);
        }
        Ok(())
    }
}

fn offline_response(url: &str, error: &FetchError) -> Response {
    Response::json(
        503,
        &json!({
            "error": "offline",
            "offline": true,
            "url": url,
            "message": error.to_string(),
        }),
    )
}

fn queued_response(queued: &QueuedMutation) -> Response {
    Response::json(
        202,
        &json!({
            "queued": true,
            "offline": true,
            "id": queued.id.to_string(),
            "type": queued.mutation_type,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::MockHealthProbe;
    use crate::connectivity::ProbeOutcome;
    use crate::scheduler::ManualScheduler;
    use networking::testing::StubFetcher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use storage::{ManualClock, MutationType};

    struct Fixture {
        engine: Engine,
        stub: Arc<StubFetcher>,
        scheduler: ManualScheduler,
    }

    fn stub_with_assets() -> Arc<StubFetcher> {
        let stub = Arc::new(StubFetcher::new());
        stub.respond("/", Response::ok("<html>home</html>"))
            .respond("/offline.html", Response::ok("<html>offline</html>"))
            .respond("/static/app.js", Response::ok("js"))
            .respond("/api/health", Response::ok("ok"));
        stub
    }

    fn config(generation: &str) -> EngineConfig {
        EngineConfig::new(generation).with_precache(["/", "/offline.html", "/static/app.js"])
    }

    fn fixture(generation: &str) -> Fixture {
        let stub = stub_with_assets();
        let scheduler = ManualScheduler::new();
        let engine = Engine::builder(config(generation))
            .fetcher(stub.clone())
            .scheduler(Arc::new(scheduler.clone()))
            .clock(Arc::new(ManualClock::default()))
            .build()
            .unwrap();
        Fixture { engine, stub, scheduler }
    }

    #[tokio::test]
    async fn test_passthrough_before_init() {
        let f = fixture("v1");
        f.stub.respond("/api/players", Response::ok("p"));

        assert_eq!(f.engine.status(), EngineStatus::Created);
        f.engine.handle(Request::get("/api/players")).await.unwrap();
        f.engine.handle(Request::get("/api/players")).await.unwrap();

        assert_eq!(f.stub.call_count("/api/players"), 2);
        assert!(f.engine.cache().tier_names().is_empty());
    }

    #[tokio::test]
    async fn test_init_installs_and_schedules_probe() {
        let f = fixture("v1");
        f.engine.init().await.unwrap();

        assert_eq!(f.engine.status(), EngineStatus::Running);
        assert_eq!(f.engine.active_generation().as_deref(), Some("v1"));
        assert_eq!(f.engine.lifecycle_state(), Some(LifecycleState::Active));
        assert_eq!(f.scheduler.intervals(), vec![std::time::Duration::from_secs(30)]);

        // Second init is a no-op
        f.engine.init().await.unwrap();
        assert_eq!(f.scheduler.task_count(), 1);
    }

    #[tokio::test]
    async fn test_static_assets_served_from_precache() {
        let f = fixture("v1");
        f.engine.init().await.unwrap();
        let before = f.stub.call_count("/static/app.js");

        let response = f.engine.handle(Request::get("/static/app.js")).await.unwrap();
        assert_eq!(response.text(), "js");
        assert_eq!(f.stub.call_count("/static/app.js"), before);
    }

    #[tokio::test]
    async fn test_offline_api_call_gets_structured_response() {
        let f = fixture("v1");
        f.engine.init().await.unwrap();
        f.stub.set_offline(true);

        let response = f.engine.handle(Request::get("/api/stats")).await.unwrap();
        assert_eq!(response.status, 503);
        let body: serde_json::Value = response.json_body().unwrap();
        assert_eq!(body["offline"], true);
        assert_eq!(body["error"], "offline");
    }

    #[tokio::test]
    async fn test_offline_navigation_falls_back() {
        let f = fixture("v1");
        f.engine.init().await.unwrap();
        f.stub.set_offline(true);

        let response = f.engine.handle(Request::get("/teams/7")).await.unwrap();
        assert_eq!(response.text(), "<html>offline</html>");
    }

    #[tokio::test]
    async fn test_offline_write_is_queued() {
        let f = fixture("v1");
        f.engine.init().await.unwrap();
        f.stub.set_offline(true);
        let mut rx = f.engine.subscribe();

        let request = Request::post("/api/attendance")
            .json_body(&json!({ "player": "ana" }))
            .unwrap();
        let response = f.engine.handle(request).await.unwrap();

        assert_eq!(response.status, 202);
        let body: serde_json::Value = response.json_body().unwrap();
        assert_eq!(body["queued"], true);
        assert_eq!(body["type"], "attendance");

        let queued = f.engine.queue().list(MutationType::Attendance).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].payload["player"], "ana");
        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::MutationQueued { .. }));
    }

    #[tokio::test]
    async fn test_unqueued_write_failure_is_offline_response() {
        let f = fixture("v1");
        f.engine.init().await.unwrap();
        f.stub.set_offline(true);

        let response = f.engine.handle(Request::post("/api/players")).await.unwrap();
        assert_eq!(response.status, 503);
        assert_eq!(f.engine.pending_mutations().unwrap(), 0);

        // Non-API writes surface the failure
        assert!(f.engine.handle(Request::post("/login")).await.is_err());
    }

    #[tokio::test]
    async fn test_reconnect_syncs_queue() {
        let f = fixture("v1");
        f.engine.init().await.unwrap();
        f.stub.respond("/api/attendance", Response::ok(""));

        let reports = Arc::new(AtomicUsize::new(0));
        let counter = reports.clone();
        let _sub = f.engine.on_sync_complete(move |report| {
            counter.fetch_add(report.delivered(), Ordering::SeqCst);
        });

        f.engine.set_browser_online(false).await;
        f.engine
            .enqueue(MutationRequest::post(MutationType::Attendance, "/api/attendance", json!({})))
            .unwrap();
        assert_eq!(f.engine.pending_mutations().unwrap(), 1);

        assert_eq!(f.engine.set_browser_online(true).await, ConnectivityState::Online);
        assert_eq!(f.engine.pending_mutations().unwrap(), 0);
        assert_eq!(reports.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scheduled_probe_drives_connectivity() {
        let stub = stub_with_assets();
        let scheduler = ManualScheduler::new();
        let mut probe = MockHealthProbe::new();
        let mut seq = mockall::Sequence::new();
        probe
            .expect_probe()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| ProbeOutcome::Unreachable);
        probe
            .expect_probe()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| ProbeOutcome::Unhealthy);
        probe
            .expect_probe()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| ProbeOutcome::Healthy);

        let engine = Engine::builder(config("v1"))
            .fetcher(stub)
            .scheduler(Arc::new(scheduler.clone()))
            .health_probe(Arc::new(probe))
            .build()
            .unwrap();
        engine.init().await.unwrap();

        scheduler.tick().await;
        assert_eq!(engine.connectivity(), ConnectivityState::Offline);
        scheduler.tick().await;
        assert_eq!(engine.connectivity(), ConnectivityState::Limited);
        scheduler.tick().await;
        assert_eq!(engine.connectivity(), ConnectivityState::Online);
    }

    #[tokio::test]
    async fn test_dispose_stops_everything() {
        let f = fixture("v1");
        f.engine.init().await.unwrap();
        let _sub = f.engine.on_event(|_| {});

        f.engine.dispose().await.unwrap();

        assert_eq!(f.engine.status(), EngineStatus::Disposed);
        assert_eq!(f.scheduler.task_count(), 0);
        assert!(matches!(f.engine.init().await, Err(EngineError::Disposed)));
        assert!(matches!(f.engine.sync_now().await, Err(EngineError::Disposed)));
        f.engine.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_click_without_window_host() {
        let f = fixture("v1");
        let notification = f.engine.push(r#"{"title":"T","body":"B"}"#).unwrap();
        assert!(matches!(
            f.engine.notification_click(&notification, None).await,
            Err(EngineError::NoWindowHost)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_init_installs_once() {
        let f = fixture("v1");
        let (a, b) = tokio::join!(f.engine.init(), f.engine.init());
        a.unwrap();
        b.unwrap();

        assert_eq!(f.stub.call_count("/static/app.js"), 1);
        assert_eq!(f.scheduler.task_count(), 1);
        assert_eq!(f.engine.status(), EngineStatus::Running);
    }

    #[test]
    fn test_default_client_needs_resolvable_urls() {
        let result = Engine::builder(EngineConfig::default()).build();
        assert!(matches!(result, Err(EngineError::Config(ConfigError::Invalid(_)))));

        let engine = Engine::builder(EngineConfig::default().with_base_url("http://127.0.0.1:9"))
            .scheduler(Arc::new(ManualScheduler::new()))
            .build()
            .unwrap();
        assert_eq!(engine.status(), EngineStatus::Created);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Engine::builder(EngineConfig::new(""))
            .fetcher(Arc::new(StubFetcher::new()))
            .build();
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
