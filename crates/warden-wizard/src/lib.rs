//! warden-wizard — autoscale specifications compiled into alarm pairs.
//!
//! A user describes *what* should scale (`AutoScale`: target name, process,
//! unit bounds, one metric condition per direction) and the wizard derives
//! the two alarms the autoscale loop evaluates:
//!
//! ```text
//! AutoScale "api"
//!   ├── scale_up_api     [cpu]         cpu template
//!   └── scale_down_api   [units, cpu]  units template && cpu template
//! ```
//!
//! Templates come from a [`TemplateCatalog`] and are filled in with a
//! single-pass placeholder substitution; a placeholder left without a value
//! rejects the specification.

pub mod error;
pub mod template;
pub mod wizard;

pub use error::{WizardError, WizardResult};
pub use template::{DEFAULT_TEMPLATE, TemplateCatalog, UNITS_TEMPLATE, substitute};
pub use wizard::{AutoScaleView, Wizard, alarm_names, normalize};
