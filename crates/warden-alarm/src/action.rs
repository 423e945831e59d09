//! Remediation actions and the registry the loop dispatches through.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ::http::Method;
use serde_json::json;
use thiserror::Error;
use tracing::info;

use warden_state::Alarm;

use crate::http::{self, HttpError, HttpRequest};

/// Errors raised by actions.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("invalid action configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("{0}")]
    Failed(String),
}

/// What an action knows about the alarm that triggered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionContext {
    pub alarm: String,
    pub instance: String,
    pub envs: BTreeMap<String, String>,
}

impl ActionContext {
    pub fn env(&self, key: &str) -> Option<&str> {
        self.envs.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }
}

impl From<&Alarm> for ActionContext {
    fn from(alarm: &Alarm) -> Self {
        Self {
            alarm: alarm.name.clone(),
            instance: alarm.instance.clone(),
            envs: alarm.envs.clone(),
        }
    }
}

/// A remediation the loop can fire.
#[async_trait]
pub trait Action: Send + Sync {
    /// Precheck run before an event is opened. `false` skips the firing
    /// without recording anything.
    async fn ready(&self, _ctx: &ActionContext) -> Result<bool, ActionError> {
        Ok(true)
    }

    /// Perform the remediation.
    async fn run(&self, ctx: &ActionContext) -> Result<(), ActionError>;
}

/// Action name → implementation.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `action` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: &str, action: Arc<dyn Action>) {
        self.actions.insert(name.to_string(), action);
    }

    pub fn with(mut self, name: &str, action: Arc<dyn Action>) -> Self {
        self.register(name, action);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

/// POSTs the alarm context as JSON to a URL.
#[derive(Debug, Clone)]
pub struct WebhookAction {
    url: String,
    token: Option<String>,
    timeout: Duration,
}

impl WebhookAction {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Action for WebhookAction {
    async fn run(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        let payload = json!({
            "alarm": ctx.alarm,
            "instance": ctx.instance,
            "envs": ctx.envs,
        });
        let request = HttpRequest::new(Method::POST, self.url.clone(), self.timeout)
            .body(payload.to_string())
            .bearer_token(self.token.clone());
        http::send(&request).await?;
        info!(alarm = %ctx.alarm, url = %self.url, "webhook delivered");
        Ok(())
    }
}
