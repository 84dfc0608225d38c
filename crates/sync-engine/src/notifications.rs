//! Push notification dispatch
//!
//! Turns push payloads into displayable notifications and resolves clicks to
//! an application window.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::NotificationConfig;

/// Action id that closes a notification without navigating
pub const DISMISS_ACTION: &str = "dismiss";

/// Notification error types
#[derive(Debug, Error)]
pub enum NotificationError {
    /// Payload is not valid JSON
    #[error("Invalid push payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    /// The window host refused to open a window
    #[error("Window error: {0}")]
    Window(String),
}

/// Result type for notification operations
pub type Result<T> = std::result::Result<T, NotificationError>;

/// A button on a notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    /// Action id reported on click
    pub action: String,
    /// Button label
    pub title: String,
}

impl NotificationAction {
    /// Create an action
    pub fn new(action: impl Into<String>, title: impl Into<String>) -> Self {
        Self { action: action.into(), title: title.into() }
    }
}

/// Inbound push payload; only `title` and `body` are expected
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    /// Title
    #[serde(default)]
    pub title: Option<String>,
    /// Body text
    #[serde(default)]
    pub body: Option<String>,
    /// Logical type (`message`, `training`, `match`, ...)
    #[serde(default, rename = "type")]
    pub notification_type: Option<String>,
    /// Deep link
    #[serde(default)]
    pub url: Option<String>,
    /// Explicit actions, replacing the type's defaults
    #[serde(default)]
    pub actions: Option<Vec<NotificationAction>>,
    /// Replacement tag
    #[serde(default)]
    pub tag: Option<String>,
    /// Opaque extra data
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// A notification ready to display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Title
    pub title: String,
    /// Body text
    pub body: String,
    /// Icon URL
    pub icon: String,
    /// Badge URL
    pub badge: String,
    /// Replacement tag
    pub tag: String,
    /// Logical type
    pub notification_type: Option<String>,
    /// Deep link from the payload
    pub url: Option<String>,
    /// Buttons
    pub actions: Vec<NotificationAction>,
    /// Stay on screen until the user acts
    pub require_interaction: bool,
    /// Opaque extra data
    pub data: Option<serde_json::Value>,
}

impl Notification {
    /// Whether the notification carries an action id
    pub fn has_action(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a.action == action)
    }
}

/// An open application window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowInfo {
    /// Host-assigned id
    pub id: String,
    /// Current URL
    pub url: String,
}

/// The application's windows, as seen from the engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WindowHost: Send + Sync {
    /// Currently open windows
    async fn open_windows(&self) -> Vec<WindowInfo>;

    /// Bring a window to the front
    async fn focus(&self, id: &str) -> bool;

    /// Open a new window at `url`
    async fn open(&self, url: &str) -> std::result::Result<WindowInfo, String>;
}

/// What a click did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    /// An existing window was focused
    Focused(WindowInfo),
    /// A new window was opened
    Opened(WindowInfo),
    /// The notification was closed without navigating
    Dismissed,
}

/// Builds notifications and routes clicks
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    config: NotificationConfig,
}

impl NotificationDispatcher {
    /// Create a dispatcher
    pub fn new(config: NotificationConfig) -> Self {
        Self { config }
    }

    /// Parse a raw push payload
    pub fn parse(&self, raw: &str) -> Result<Notification> {
        let payload: PushPayload = serde_json::from_str(raw)?;
        Ok(self.build(payload))
    }

    /// Merge a payload with the presentation defaults
    pub fn build(&self, payload: PushPayload) -> Notification {
        let notification_type = payload.notification_type;
        let actions = payload
            .actions
            .unwrap_or_else(|| default_actions(notification_type.as_deref()));

        Notification {
            title: payload.title.unwrap_or_else(|| self.config.default_title.clone()),
            body: payload.body.unwrap_or_default(),
            icon: self.config.icon.clone(),
            badge: self.config.badge.clone(),
            tag: payload
                .tag
                .or_else(|| notification_type.clone())
                .unwrap_or_else(|| "general".to_string()),
            require_interaction: matches!(notification_type.as_deref(), Some("training" | "match")),
            notification_type,
            url: payload.url,
            actions,
            data: payload.data,
        }
    }

    /// Where a click should navigate; `None` for dismiss
    pub fn resolve_destination(&self, notification: &Notification, action: Option<&str>) -> Option<String> {
        let type_route = || {
            notification
                .notification_type
                .as_deref()
                .and_then(|t| self.config.route_for(t))
                .map(str::to_string)
        };

        match action {
            Some(DISMISS_ACTION) => None,
            Some("view-schedule") => Some(self.route_or_default("training")),
            Some("open-scan") => Some(self.route_or_default("scan")),
            Some("view-message") => Some(
                notification
                    .url
                    .clone()
                    .unwrap_or_else(|| self.route_or_default("message")),
            ),
            Some("view-match") => Some(
                notification
                    .url
                    .clone()
                    .unwrap_or_else(|| self.route_or_default("match")),
            ),
            _ => Some(
                notification
                    .url
                    .clone()
                    .or_else(type_route)
                    .unwrap_or_else(|| self.config.default_url.clone()),
            ),
        }
    }

    /// Handle a click on the notification body or one of its actions
    pub async fn handle_click(
        &self,
        host: &dyn WindowHost,
        notification: &Notification,
        action: Option<&str>,
    ) -> Result<ClickOutcome> {
        let Some(destination) = self.resolve_destination(notification, action) else {
            tracing::debug!("Notification {} dismissed", notification.tag);
            return Ok(ClickOutcome::Dismissed);
        };

        let target = path_of(&destination);
        for window in host.open_windows().await {
            if path_of(&window.url) == target && host.focus(&window.id).await {
                tracing::debug!("Focused window {} for {}", window.id, destination);
                return Ok(ClickOutcome::Focused(window));
            }
        }

        let window = host.open(&destination).await.map_err(NotificationError::Window)?;
        tracing::debug!("Opened window {} at {}", window.id, destination);
        Ok(ClickOutcome::Opened(window))
    }

    fn route_or_default(&self, notification_type: &str) -> String {
        self.config
            .route_for(notification_type)
            .unwrap_or(&self.config.default_url)
            .to_string()
    }
}

fn default_actions(notification_type: Option<&str>) -> Vec<NotificationAction> {
    let mut actions = match notification_type {
        Some("message") => vec![NotificationAction::new("view-message", "View Message")],
        Some("training") => vec![
            NotificationAction::new("view-schedule", "View Schedule"),
            NotificationAction::new("open-scan", "Open Scan Target"),
        ],
        Some("match") => vec![NotificationAction::new("view-match", "View Match")],
        _ => vec![NotificationAction::new("open", "Open")],
    };
    actions.push(NotificationAction::new(DISMISS_ACTION, "Dismiss"));
    actions
}

fn path_of(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    }
}
