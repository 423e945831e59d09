//! warden-state — embedded state store for Warden.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for alarms, remediation events, and autoscale specifications.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Events use the composite key `{alarm}:{start_time:020}:{id}` so the
//! history of one alarm is a contiguous key range that can be scanned
//! newest-first with a reverse range iterator.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
