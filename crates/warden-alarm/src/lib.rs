//! warden-alarm — alarm evaluation and remediation for Warden.
//!
//! # Architecture
//!
//! ```text
//! AutoScaler (every interval)
//!   ├── StateStore::list_alarms()
//!   └── per enabled alarm, concurrently
//!       ├── check() ── DataSource::fetch() ── Evaluator::evaluate()
//!       ├── should_wait() ── latest Event + Clock
//!       └── ActionRegistry ── Action::ready() / Action::run()
//!                              ├── ScaleAction ── UnitController
//!                              └── WebhookAction
//! ```
//!
//! Every remediation attempt is recorded as an [`Event`](warden_state::Event)
//! that is opened before the action runs and closed exactly once with the
//! outcome.

pub mod action;
pub mod autoscale;
pub mod check;
pub mod clock;
pub mod cooldown;
pub mod datasource;
pub mod duration;
pub mod http;
pub mod scale;

pub use action::{Action, ActionContext, ActionError, ActionRegistry, WebhookAction};
pub use autoscale::{AlarmOutcome, AutoScaleError, AutoScaler, Phase, TickReport};
pub use check::{CheckError, check};
pub use clock::{Clock, ManualClock, SystemClock};
pub use cooldown::should_wait;
pub use datasource::{DataSource, DataSourceError, HttpDataSource, StaticDataSource};
pub use duration::parse_duration;
pub use scale::{HttpUnitController, ScaleAction, ScaleDirection, UnitController};
