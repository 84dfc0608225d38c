//! Engine Lifecycle Tests
//!
//! Restarts, updates and event delivery across engine instances sharing a
//! database directory.

use networking::testing::StubFetcher;
use networking::{FetchError, Request, Response};
use rosterline::storage::MutationType;
use rosterline::sync_engine::{
    Engine, EngineConfig, EngineError, EngineEvent, EngineStatus, LifecycleState,
    ManualScheduler,
};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

fn stub_with_assets() -> Arc<StubFetcher> {
    let stub = Arc::new(StubFetcher::new());
    stub.respond("/", Response::ok("<html>home</html>"))
        .respond("/offline.html", Response::ok("<html>offline</html>"))
        .respond("/static/app.js", Response::ok("js"));
    stub
}

fn config(generation: &str, dir: &Path) -> EngineConfig {
    EngineConfig::new(generation)
        .with_storage_path(dir.join("engine.db"))
        .with_precache(["/", "/offline.html", "/static/app.js"])
}

fn engine(config: EngineConfig, stub: Arc<StubFetcher>) -> Engine {
    Engine::builder(config)
        .fetcher(stub)
        .scheduler(Arc::new(ManualScheduler::new()))
        .build()
        .unwrap()
}

/// Cached assets and queued writes survive a restart with no network
#[tokio::test]
async fn test_restart_offline_keeps_cache_and_queue() {
    let temp_dir = TempDir::new().unwrap();

    // Phase 1: install online, then queue a write while offline
    {
        let stub = stub_with_assets();
        let engine = engine(config("v1", temp_dir.path()), stub.clone());
        engine.init().await.unwrap();

        stub.set_offline(true);
        let request = Request::post("/api/messages/send")
            .json_body(&json!({ "text": "running late" }))
            .unwrap();
        assert_eq!(engine.handle(request).await.unwrap().status, 202);

        engine.dispose().await.unwrap();
    }

    // Phase 2: restart with no network at all
    let stub = Arc::new(StubFetcher::new());
    stub.set_offline(true);
    let engine = engine(config("v1", temp_dir.path()), stub.clone());
    engine.init().await.unwrap();

    assert_eq!(engine.lifecycle_state(), Some(LifecycleState::Active));
    assert_eq!(engine.handle(Request::get("/static/app.js")).await.unwrap().text(), "js");
    assert_eq!(
        engine.handle(Request::get("/")).await.unwrap().text(),
        "<html>home</html>"
    );

    let pending = engine.queue().list(MutationType::Message).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload["text"], "running late");

    // Phase 3: connectivity returns and the message goes out
    stub.set_offline(false);
    stub.respond("POST /api/messages/send", Response::ok(""));
    engine.set_browser_online(false).await;
    engine.set_browser_online(true).await;
    assert_eq!(engine.pending_mutations().unwrap(), 0);
}

/// A failed update leaves the old generation serving
#[tokio::test]
async fn test_failed_update_keeps_serving_previous_generation() {
    let temp_dir = TempDir::new().unwrap();

    {
        let engine = engine(config("v1", temp_dir.path()), stub_with_assets());
        engine.init().await.unwrap();
        engine.dispose().await.unwrap();
    }

    let stub = stub_with_assets();
    stub.fail("/static/app.js", FetchError::Network("reset".into()));
    let engine = engine(config("v2", temp_dir.path()), stub.clone());
    let mut rx = engine.subscribe();

    let result = engine.init().await;

    assert!(matches!(result, Err(EngineError::Lifecycle(_))));
    assert_eq!(engine.status(), EngineStatus::Running);
    assert_eq!(engine.active_generation().as_deref(), Some("v1"));
    assert_eq!(engine.lifecycle_state(), Some(LifecycleState::Redundant));
    assert!(matches!(rx.recv().await.unwrap(), EngineEvent::UpdateFailed { .. }));

    // Still served from the v1 static tier
    stub.set_offline(true);
    assert_eq!(engine.handle(Request::get("/static/app.js")).await.unwrap().text(), "js");
}

/// Update available, then applied with a reload request
#[tokio::test]
async fn test_update_flow_events() {
    let temp_dir = TempDir::new().unwrap();

    {
        let engine = engine(config("v1", temp_dir.path()), stub_with_assets());
        engine.init().await.unwrap();
        engine.dispose().await.unwrap();
    }

    let engine = engine(config("v2", temp_dir.path()), stub_with_assets());
    let offered = Arc::new(AtomicUsize::new(0));
    let counter = offered.clone();
    let subscription = engine.on_update_available(move |generation| {
        assert_eq!(generation, "v2");
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let mut rx = engine.subscribe();

    engine.init().await.unwrap();
    assert_eq!(offered.load(Ordering::SeqCst), 1);
    assert_eq!(engine.waiting_generation().as_deref(), Some("v2"));
    // The old generation serves until the update is applied
    assert_eq!(engine.active_generation().as_deref(), Some("v1"));

    assert!(engine.skip_waiting().await.unwrap());

    let mut applied = None;
    while let Ok(event) = rx.try_recv() {
        if let EngineEvent::UpdateApplied { generation, reload_required } = event {
            applied = Some((generation, reload_required));
        }
    }
    assert_eq!(applied, Some(("v2".to_string(), true)));
    assert_eq!(engine.cache().tier_names(), vec!["static-v2"]);

    subscription.unsubscribe();
    assert!(!engine.skip_waiting().await.unwrap());
}

/// Handlers stop firing once unsubscribed
#[tokio::test]
async fn test_connectivity_subscription_lifetime() {
    let temp_dir = TempDir::new().unwrap();
    let engine = engine(config("v1", temp_dir.path()), stub_with_assets());
    engine.init().await.unwrap();

    let changes = Arc::new(AtomicUsize::new(0));
    let counter = changes.clone();
    let subscription = engine.on_connectivity_change(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    engine.set_browser_online(false).await;
    engine.set_browser_online(true).await;
    subscription.unsubscribe();
    engine.set_browser_online(false).await;

    assert_eq!(changes.load(Ordering::SeqCst), 2);
}

/// Two engines in one process do not share state
#[tokio::test]
async fn test_engines_are_isolated() {
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();
    let a = engine(config("v1", a_dir.path()), stub_with_assets());
    let b = engine(config("v1", b_dir.path()), stub_with_assets());
    a.init().await.unwrap();
    b.init().await.unwrap();

    a.set_browser_online(false).await;
    assert_eq!(b.connectivity(), rosterline::sync_engine::ConnectivityState::Online);

    a.dispose().await.unwrap();
    assert_eq!(b.status(), EngineStatus::Running);
}
