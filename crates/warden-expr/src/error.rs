//! Expression error types.

use thiserror::Error;

/// Result type alias for expression operations.
pub type ExprResult<T> = Result<T, ExprError>;

/// Errors produced while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("missing field: {0}")]
    MissingField(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("unknown name: {0}")]
    UnknownName(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("expression evaluated to {0}, expected a boolean")]
    NotBoolean(String),
}

impl ExprError {
    pub(crate) fn syntax(offset: usize, message: impl Into<String>) -> Self {
        ExprError::Syntax {
            offset,
            message: message.into(),
        }
    }
}
