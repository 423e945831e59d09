//! Wizard error types.

use thiserror::Error;

use warden_expr::ExprError;
use warden_state::StateError;

pub type WizardResult<T> = Result<T, WizardError>;

#[derive(Debug, Error)]
pub enum WizardError {
    /// The autoscale specification cannot be compiled into alarms.
    #[error("invalid autoscale configuration: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("generated expression is invalid: {0}")]
    Expr(#[from] ExprError),

    #[error(transparent)]
    State(#[from] StateError),
}
