//! warden-expr — boolean alarm expressions over JSON documents.
//!
//! Alarm conditions are written in a small JavaScript-flavoured language
//! and evaluated against the JSON documents returned by datasources:
//!
//! ```text
//! data.id == "ble"
//! cpu.aggregations.range.buckets[0].date.buckets[0].max.value > 80
//! !units.lock.Locked && units.units.filter(u => u.ProcessName == "web").length > 1
//! ```
//!
//! # Pipeline
//!
//! ```text
//! &str ──Lexer──▶ Vec<Token> ──Parser──▶ Expr ──Interpreter(&Value)──▶ Value
//! ```
//!
//! # Failure policy
//!
//! Evaluation never guesses. Accessing a missing field, indexing past the
//! end of an array, or mixing incompatible types is an error, so a
//! misconfigured alarm surfaces in the logs instead of silently reading
//! as "condition false".

pub mod ast;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod parser;

pub use error::{ExprError, ExprResult};
pub use eval::{Evaluator, ExprEngine};
pub use parser::parse;
