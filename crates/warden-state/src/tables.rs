//! redb table definitions for the Warden state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Alarms keyed by `{name}`.
pub const ALARMS: TableDefinition<&str, &[u8]> = TableDefinition::new("alarms");

/// Events keyed by `{alarm_name}:{start_time:020}:{id}`.
pub const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");

/// Autoscale specifications keyed by `{name}`.
pub const AUTOSCALES: TableDefinition<&str, &[u8]> = TableDefinition::new("autoscales");
