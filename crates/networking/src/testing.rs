//! Scripted fetcher for tests
//!
//! `StubFetcher` answers from a table of canned replies and records every
//! request it sees, so tests can assert on call counts without a server.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::client::{FetchError, Fetcher, Request, Response, Result};

#[derive(Debug, Clone)]
enum Reply {
    Respond(Response),
    Fail(FetchError),
}

/// A `Fetcher` that replays canned responses
///
/// Replies are looked up by `"METHOD url"` first and then by bare URL.
/// Unknown URLs answer `404`. While offline every request fails with
/// `FetchError::Network`.
#[derive(Debug, Default)]
pub struct StubFetcher {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<Request>>,
    offline: AtomicBool,
}

impl StubFetcher {
    /// Create an empty stub
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `target` with `response`
    pub fn respond(&self, target: impl Into<String>, response: Response) -> &Self {
        self.replies.lock().insert(target.into(), Reply::Respond(response));
        self
    }

    /// Answer `target` with a 200 JSON body
    pub fn respond_json(&self, target: impl Into<String>, value: serde_json::Value) -> &Self {
        self.respond(target, Response::json(200, &value))
    }

    /// Fail `target` with `error`
    pub fn fail(&self, target: impl Into<String>, error: FetchError) -> &Self {
        self.replies.lock().insert(target.into(), Reply::Fail(error));
        self
    }

    /// Simulate losing or regaining the network
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of requests issued for `url`, any method
    pub fn call_count(&self, url: &str) -> usize {
        self.calls.lock().iter().filter(|r| r.url == url).count()
    }

    /// Number of requests issued in total
    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// Every request seen so far
    pub fn requests(&self) -> Vec<Request> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, request: Request) -> Result<Response> {
        self.calls.lock().push(request.clone());

        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Network(format!("offline: {}", request.url)));
        }

        let reply = {
            let replies = self.replies.lock();
            replies
                .get(&request.cache_key())
                .or_else(|| replies.get(&request.url))
                .cloned()
        };

        match reply {
            Some(Reply::Respond(response)) => Ok(response),
            Some(Reply::Fail(error)) => Err(error),
            None => Ok(Response::new(404, "not found")),
        }
    }
}
