//! Connectivity monitor
//!
//! Holds the single process-wide [`ConnectivityState`]. Browser online/offline
//! signals flip it immediately; periodic health probes correct it when the
//! browser is wrong. Every change is published on the event bus together with
//! a user-facing status notice. Reacting to a change (syncing, refreshing) is
//! the engine's job; the monitor only reports the [`Transition`].

use async_trait::async_trait;
use networking::{Fetcher, Request};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::events::{EngineEvent, EventBus};

/// Process-wide connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// Network and server reachable
    Online,
    /// No network
    Offline,
    /// Network reachable but the server's health check fails
    Limited,
}

impl ConnectivityState {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityState::Online => "online",
            ConnectivityState::Offline => "offline",
            ConnectivityState::Limited => "limited",
        }
    }

    fn notice(&self) -> &'static str {
        match self {
            ConnectivityState::Online => "Back online. Pending changes are being synced.",
            ConnectivityState::Offline => {
                "You are offline. Changes will be saved and synced when you reconnect."
            }
            ConnectivityState::Limited => "Connected, but the server is not responding.",
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Previous state
    pub from: ConnectivityState,
    /// New state
    pub to: ConnectivityState,
}

impl Transition {
    /// Whether this change brought the engine back online
    pub fn is_reconnect(&self) -> bool {
        self.to == ConnectivityState::Online
    }
}

/// Result of one health check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Server answered 2xx
    Healthy,
    /// Server answered, but not 2xx
    Unhealthy,
    /// Server could not be reached
    Unreachable,
    /// The check itself could not be issued (e.g. an unresolvable URL)
    Inconclusive,
}

impl ProbeOutcome {
    /// State this outcome implies, if any
    pub fn implied_state(&self) -> Option<ConnectivityState> {
        match self {
            ProbeOutcome::Healthy => Some(ConnectivityState::Online),
            ProbeOutcome::Unhealthy => Some(ConnectivityState::Limited),
            ProbeOutcome::Unreachable => Some(ConnectivityState::Offline),
            ProbeOutcome::Inconclusive => None,
        }
    }
}

/// A lightweight liveness check
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Check the server once
    async fn probe(&self) -> ProbeOutcome;
}

/// Probe that GETs a health URL
pub struct HttpHealthProbe {
    fetcher: Arc<dyn Fetcher>,
    url: String,
}

impl HttpHealthProbe {
    /// Create a probe against `url`
    pub fn new(fetcher: Arc<dyn Fetcher>, url: impl Into<String>) -> Self {
        Self { fetcher, url: url.into() }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> ProbeOutcome {
        let request = Request::get(&self.url).header("cache-control", "no-store");
        match self.fetcher.fetch(request).await {
            Ok(response) if response.is_success() => ProbeOutcome::Healthy,
            Ok(response) => {
                tracing::debug!("Health probe {} answered {}", self.url, response.status);
                ProbeOutcome::Unhealthy
            }
            Err(e) if e.is_network_failure() => {
                tracing::debug!("Health probe {} failed: {}", self.url, e);
                ProbeOutcome::Unreachable
            }
            Err(e) => {
                tracing::warn!("Health probe {} could not be sent: {}", self.url, e);
                ProbeOutcome::Inconclusive
            }
        }
    }
}

/// Owner of the connectivity state
pub struct ConnectivityMonitor {
    state: RwLock<ConnectivityState>,
    bus: EventBus,
}

impl ConnectivityMonitor {
    /// Create a monitor starting in `initial`
    pub fn new(initial: ConnectivityState, bus: EventBus) -> Self {
        Self { state: RwLock::new(initial), bus }
    }

    /// Current state
    pub fn state(&self) -> ConnectivityState {
        *self.state.read()
    }

    /// Whether requests can be expected to reach the server
    pub fn is_online(&self) -> bool {
        self.state() == ConnectivityState::Online
    }

    /// Apply a browser online/offline signal
    pub fn browser_signal(&self, online: bool) -> Option<Transition> {
        let next = if online { ConnectivityState::Online } else { ConnectivityState::Offline };
        self.transition_to(next)
    }

    /// Apply a probe result; an inconclusive probe leaves the state alone
    pub fn apply_probe(&self, outcome: ProbeOutcome) -> Option<Transition> {
        self.transition_to(outcome.implied_state()?)
    }

    /// Run a probe and apply its result
    pub async fn probe_with(&self, probe: &dyn HealthProbe) -> Option<Transition> {
        let outcome = probe.probe().await;
        self.apply_probe(outcome)
    }

    fn transition_to(&self, next: ConnectivityState) -> Option<Transition> {
        let transition = {
            let mut state = self.state.write();
            if *state == next {
                return None;
            }
            let transition = Transition { from: *state, to: next };
            *state = next;
            transition
        };

        tracing::info!("Connectivity {} -> {}", transition.from, transition.to);
        self.bus.publish(EngineEvent::ConnectivityChanged {
            from: transition.from,
            to: transition.to,
        });
        self.bus.publish(EngineEvent::StatusNotice {
            state: next,
            message: next.notice().to_string(),
        });

        Some(transition)
    }
}
