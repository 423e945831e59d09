//! Unit-count remediation.
//!
//! `ScaleAction` adds or removes units of an application process through a
//! [`UnitController`]. Bounds come from the alarm envs:
//!
//! | env        | meaning                                 | default |
//! |------------|-----------------------------------------|---------|
//! | `step`     | units added or removed per firing       | 1       |
//! | `process`  | process to scale                        | `web`   |
//! | `minUnits` | scale-down floor                        | 1       |
//! | `maxUnits` | scale-up ceiling, unbounded when absent | none    |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ::http::Method;
use serde_json::Value;
use tracing::{debug, info};

use crate::action::{Action, ActionContext, ActionError};
use crate::http::{self, HttpRequest};

pub const DEFAULT_PROCESS: &str = "web";

/// Reads and changes the number of units of an application process.
#[async_trait]
pub trait UnitController: Send + Sync {
    async fn units(&self, instance: &str, process: &str) -> Result<u32, ActionError>;
    async fn add_units(&self, instance: &str, process: &str, count: u32) -> Result<(), ActionError>;
    async fn remove_units(&self, instance: &str, process: &str, count: u32) -> Result<(), ActionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDirection {
    Up,
    Down,
}

/// Scales an application up or down by the alarm's `step`.
#[derive(Clone)]
pub struct ScaleAction {
    direction: ScaleDirection,
    controller: Arc<dyn UnitController>,
}

/// Bounds and step resolved from an action context.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Plan {
    process: String,
    step: u32,
    min_units: u32,
    max_units: Option<u32>,
}

impl Plan {
    fn from_context(ctx: &ActionContext) -> Result<Self, ActionError> {
        let step = match ctx.env("step") {
            None => 1,
            Some(s) => match s.trim().parse::<u32>() {
                Ok(n) if n > 0 => n,
                _ => return Err(ActionError::Config(format!("step must be a positive integer, got {s:?}"))),
            },
        };
        let min_units = match ctx.env("minUnits") {
            None => 1,
            Some(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| ActionError::Config(format!("minUnits must be an integer, got {s:?}")))?
                .clamp(1, u32::MAX as i64) as u32,
        };
        let max_units = match ctx.env("maxUnits") {
            None => None,
            Some(s) => match s.trim().parse::<u32>() {
                Ok(0) => None,
                Ok(n) => Some(n),
                Err(_) => return Err(ActionError::Config(format!("maxUnits must be an integer, got {s:?}"))),
            },
        };
        Ok(Self {
            process: ctx.env("process").unwrap_or(DEFAULT_PROCESS).to_string(),
            step,
            min_units,
            max_units,
        })
    }

    /// Units to add or remove given the current count, clamped to the bounds.
    fn delta(&self, direction: ScaleDirection, current: u32) -> u32 {
        match direction {
            ScaleDirection::Up => match self.max_units {
                Some(max) => self.step.min(max.saturating_sub(current)),
                None => self.step,
            },
            ScaleDirection::Down => self.step.min(current.saturating_sub(self.min_units)),
        }
    }
}

impl ScaleAction {
    pub fn new(direction: ScaleDirection, controller: Arc<dyn UnitController>) -> Self {
        Self {
            direction,
            controller,
        }
    }

    pub fn up(controller: Arc<dyn UnitController>) -> Self {
        Self::new(ScaleDirection::Up, controller)
    }

    pub fn down(controller: Arc<dyn UnitController>) -> Self {
        Self::new(ScaleDirection::Down, controller)
    }
}

#[async_trait]
impl Action for ScaleAction {
    async fn ready(&self, ctx: &ActionContext) -> Result<bool, ActionError> {
        let plan = Plan::from_context(ctx)?;
        let current = self.controller.units(&ctx.instance, &plan.process).await?;
        let ready = plan.delta(self.direction, current) > 0;
        if !ready {
            debug!(
                alarm = %ctx.alarm,
                instance = %ctx.instance,
                process = %plan.process,
                current,
                direction = ?self.direction,
                "unit bound reached"
            );
        }
        Ok(ready)
    }

    async fn run(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        let plan = Plan::from_context(ctx)?;
        let current = self.controller.units(&ctx.instance, &plan.process).await?;
        let delta = plan.delta(self.direction, current);
        if delta == 0 {
            debug!(alarm = %ctx.alarm, current, "nothing to scale");
            return Ok(());
        }
        match self.direction {
            ScaleDirection::Up => {
                self.controller
                    .add_units(&ctx.instance, &plan.process, delta)
                    .await?
            }
            ScaleDirection::Down => {
                self.controller
                    .remove_units(&ctx.instance, &plan.process, delta)
                    .await?
            }
        }
        info!(
            alarm = %ctx.alarm,
            instance = %ctx.instance,
            process = %plan.process,
            from = current,
            delta,
            direction = ?self.direction,
            "scaled"
        );
        Ok(())
    }
}

/// Unit controller talking to the platform's unit API.
///
/// - `GET    {base}/apps/{instance}/units` lists units (objects with a
///   `ProcessName` field, either as a bare array or under `units`);
/// - `PUT    {base}/apps/{instance}/units?units=N&process=P` adds units;
/// - `DELETE {base}/apps/{instance}/units?units=N&process=P` removes units.
#[derive(Debug, Clone)]
pub struct HttpUnitController {
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpUnitController {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
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

    fn units_url(&self, instance: &str) -> String {
        format!("{}/apps/{instance}/units", self.base_url)
    }

    async fn change(&self, method: Method, instance: &str, process: &str, count: u32) -> Result<(), ActionError> {
        let url = format!("{}?units={count}&process={process}", self.units_url(instance));
        let request = HttpRequest::new(method, url, self.timeout).bearer_token(self.token.clone());
        http::send(&request).await?;
        Ok(())
    }
}

#[async_trait]
impl UnitController for HttpUnitController {
    async fn units(&self, instance: &str, process: &str) -> Result<u32, ActionError> {
        let request = HttpRequest::new(Method::GET, self.units_url(instance), self.timeout)
            .bearer_token(self.token.clone());
        let body = http::send(&request).await?;
        let doc: Value = serde_json::from_slice(&body)
            .map_err(|e| ActionError::Failed(format!("invalid units response: {e}")))?;
        let units = match &doc {
            Value::Array(units) => units,
            Value::Object(map) => match map.get("units") {
                Some(Value::Array(units)) => units,
                _ => return Err(ActionError::Failed("units response has no units list".to_string())),
            },
            Value::Null => return Ok(0),
            _ => return Err(ActionError::Failed("unexpected units response".to_string())),
        };
        Ok(units
            .iter()
            .filter(|u| u.get("ProcessName").and_then(Value::as_str) == Some(process))
            .count() as u32)
    }

    async fn add_units(&self, instance: &str, process: &str, count: u32) -> Result<(), ActionError> {
        self.change(Method::PUT, instance, process, count).await
    }

    async fn remove_units(&self, instance: &str, process: &str, count: u32) -> Result<(), ActionError> {
        self.change(Method::DELETE, instance, process, count).await
    }
}

/// In-memory unit controller for tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct FakeUnits {
        pub units: Mutex<HashMap<(String, String), u32>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeUnits {
        pub fn with(instance: &str, process: &str, n: u32) -> Self {
            let fake = Self::default();
            fake.units
                .lock()
                .unwrap()
                .insert((instance.to_string(), process.to_string()), n);
            fake
        }

        pub fn count(&self, instance: &str, process: &str) -> u32 {
            self.units
                .lock()
                .unwrap()
                .get(&(instance.to_string(), process.to_string()))
                .copied()
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl UnitController for FakeUnits {
        async fn units(&self, instance: &str, process: &str) -> Result<u32, ActionError> {
            Ok(self.count(instance, process))
        }

        async fn add_units(&self, instance: &str, process: &str, count: u32) -> Result<(), ActionError> {
            self.calls.lock().unwrap().push(format!("add {instance}/{process} {count}"));
            *self
                .units
                .lock()
                .unwrap()
                .entry((instance.to_string(), process.to_string()))
                .or_default() += count;
            Ok(())
        }

        async fn remove_units(&self, instance: &str, process: &str, count: u32) -> Result<(), ActionError> {
            self.calls.lock().unwrap().push(format!("remove {instance}/{process} {count}"));
            let mut units = self.units.lock().unwrap();
            let n = units
                .entry((instance.to_string(), process.to_string()))
                .or_default();
            *n = n.saturating_sub(count);
            Ok(())
        }
    }
}
