//! Domain types for the Warden state store.
//!
//! These types represent the persisted alarms, remediation events and
//! autoscale specifications. All types are serializable to/from JSON for
//! storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{StateError, StateResult};

/// Action name used by scale-up alarms.
pub const SCALE_UP: &str = "scale_up";

/// Action name used by scale-down alarms.
pub const SCALE_DOWN: &str = "scale_down";

// ── Alarm ──────────────────────────────────────────────────────────

/// Reference to a datasource plus the metadata needed to fetch it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataSourceInstance {
    pub name: String,
    /// Free-form fetch parameters (url, method, body, ...).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl DataSourceInstance {
    /// A datasource reference with no metadata.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            metadata: BTreeMap::new(),
        }
    }
}

/// A monitoring rule: one expression evaluated against one or more
/// datasources, triggering one or more actions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alarm {
    pub name: String,
    /// Fully resolved boolean expression.
    pub expression: String,
    pub enabled: bool,
    /// Datasources fetched on every check. The first one is the primary
    /// datasource and is also exposed as `data` to the expression.
    pub data_sources: Vec<DataSourceInstance>,
    /// Action names triggered when the alarm fires.
    pub actions: Vec<String>,
    /// Identifier of the scaled target (application name).
    pub instance: String,
    /// Cooldown after the previous event ends, in seconds.
    pub wait_secs: u64,
    /// Auxiliary values passed through to the actions.
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
}

impl Alarm {
    /// Build the key for the alarms table.
    pub fn table_key(&self) -> &str {
        &self.name
    }

    /// Cooldown as a `Duration`.
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }
}

// ── Event ──────────────────────────────────────────────────────────

/// Snapshot of the owning alarm, captured by value when an event is created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlarmRef {
    pub name: String,
    pub instance: String,
    pub actions: Vec<String>,
}

impl From<&Alarm> for AlarmRef {
    fn from(alarm: &Alarm) -> Self {
        Self {
            name: alarm.name.clone(),
            instance: alarm.instance.clone(),
            actions: alarm.actions.clone(),
        }
    }
}

/// Audit record of one remediation attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub id: String,
    pub alarm: AlarmRef,
    /// Action name attempted (e.g. `scale_up`).
    pub kind: String,
    /// Unix timestamp (milliseconds) when the attempt started.
    pub start_time: u64,
    /// Unix timestamp (milliseconds) when the attempt finished; 0 while in flight.
    pub end_time: u64,
    pub successful: bool,
    pub error: String,
}

impl Event {
    /// Open a new in-flight event for `alarm`.
    pub fn open(alarm: &Alarm, kind: &str, now_ms: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            alarm: AlarmRef::from(alarm),
            kind: kind.to_string(),
            start_time: now_ms.max(1),
            end_time: 0,
            successful: false,
            error: String::new(),
        }
    }

    /// Whether the remediation is still running.
    pub fn in_flight(&self) -> bool {
        self.end_time == 0
    }

    /// Record the outcome. An `Err` marks the event failed with its message.
    pub fn finish(&mut self, now_ms: u64, outcome: Result<(), String>) {
        self.end_time = now_ms.max(self.start_time);
        match outcome {
            Ok(()) => {
                self.successful = true;
                self.error.clear();
            }
            Err(msg) => {
                self.successful = false;
                self.error = msg;
            }
        }
    }

    /// Build the composite key for the events table.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}:{}", self.alarm.name, self.start_time, self.id)
    }
}

// ── AutoScale ──────────────────────────────────────────────────────

/// One direction of an autoscale specification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ScaleAction {
    /// Bucket aggregation to compare (defaults to `max`).
    #[serde(default)]
    pub aggregator: String,
    pub metric: String,
    pub operator: String,
    pub value: String,
    /// Units added or removed per firing.
    #[serde(default)]
    pub step: String,
    /// Cooldown in seconds.
    #[serde(default)]
    pub wait: u64,
}

/// High-level autoscale configuration compiled into a pair of alarms.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoScale {
    pub name: String,
    pub scale_up: ScaleAction,
    pub scale_down: ScaleAction,
    #[serde(default)]
    pub min_units: i64,
    /// Upper bound for scale-up; 0 means unbounded.
    #[serde(default)]
    pub max_units: u32,
    /// Process to scale; empty means the default `web` process.
    #[serde(default)]
    pub process: String,
}

impl AutoScale {
    /// Build the key for the autoscales table.
    pub fn table_key(&self) -> &str {
        &self.name
    }
}

/// Reject names that would break composite keys.
pub fn validate_name(name: &str) -> StateResult<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if ok {
        Ok(())
    } else {
        Err(StateError::InvalidName(name.to_string()))
    }
}
