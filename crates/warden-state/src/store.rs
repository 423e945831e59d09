//! StateStore — redb-backed state persistence for Warden.
//!
//! Provides typed operations over alarms, events and autoscale
//! specifications. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ALARMS).map_err(map_err!(Table))?;
        txn.open_table(EVENTS).map_err(map_err!(Table))?;
        txn.open_table(AUTOSCALES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(
        &self,
        table: JsonTable,
        key: &str,
        value: &T,
        create_only: bool,
    ) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            if create_only && t.get(key).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(key.to_string()));
            }
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, table: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn delete(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Alarms ─────────────────────────────────────────────────────

    /// Insert a new alarm. Fails with `AlreadyExists` if the name is taken.
    pub fn insert_alarm(&self, alarm: &Alarm) -> StateResult<()> {
        validate_name(&alarm.name)?;
        self.put(ALARMS, alarm.table_key(), alarm, true)?;
        debug!(alarm = %alarm.name, "alarm inserted");
        Ok(())
    }

    /// Insert or replace an alarm.
    pub fn put_alarm(&self, alarm: &Alarm) -> StateResult<()> {
        validate_name(&alarm.name)?;
        self.put(ALARMS, alarm.table_key(), alarm, false)?;
        debug!(alarm = %alarm.name, "alarm stored");
        Ok(())
    }

    /// Get an alarm by name.
    pub fn get_alarm(&self, name: &str) -> StateResult<Option<Alarm>> {
        self.get(ALARMS, name)
    }

    /// List all alarms, ordered by name.
    pub fn list_alarms(&self) -> StateResult<Vec<Alarm>> {
        self.list(ALARMS)
    }

    /// Delete an alarm by name. Returns true if it existed.
    ///
    /// Events recorded for the alarm are retained.
    pub fn delete_alarm(&self, name: &str) -> StateResult<bool> {
        let existed = self.delete(ALARMS, name)?;
        debug!(alarm = %name, existed, "alarm deleted");
        Ok(existed)
    }

    /// Flip the enabled flag of an existing alarm.
    pub fn set_alarm_enabled(&self, name: &str, enabled: bool) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(ALARMS).map_err(map_err!(Table))?;
            let mut alarm: Alarm = match t.get(name).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                None => return Err(StateError::NotFound(format!("alarm {name}"))),
            };
            alarm.enabled = enabled;
            let bytes = serde_json::to_vec(&alarm).map_err(map_err!(Serialize))?;
            t.insert(name, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(alarm = %name, enabled, "alarm toggled");
        Ok(())
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Record a new (usually in-flight) event.
    pub fn insert_event(&self, event: &Event) -> StateResult<()> {
        let key = event.table_key();
        self.put(EVENTS, &key, event, true)?;
        debug!(%key, kind = %event.kind, "event opened");
        Ok(())
    }

    /// Persist the outcome of an in-flight event.
    ///
    /// The stored copy must still be in flight; an event is closed exactly once.
    pub fn close_event(&self, event: &Event) -> StateResult<()> {
        let key = event.table_key();
        if event.in_flight() {
            return Err(StateError::Write(format!("event {key} has no end time")));
        }
        let bytes = serde_json::to_vec(event).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            let stored: Event = match t.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                None => return Err(StateError::NotFound(format!("event {key}"))),
            };
            if !stored.in_flight() {
                return Err(StateError::AlreadyClosed(key));
            }
            t.insert(key.as_str(), bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, successful = event.successful, "event closed");
        Ok(())
    }

    /// Events for one alarm, newest first.
    pub fn events_for_alarm(&self, alarm_name: &str, limit: usize) -> StateResult<Vec<Event>> {
        // ':' and ';' are adjacent, so this range covers exactly `{alarm}:*`.
        let start = format!("{alarm_name}:");
        let end = format!("{alarm_name};");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
            .rev()
        {
            if results.len() >= limit {
                break;
            }
            let (_, value) = entry.map_err(map_err!(Read))?;
            let event: Event =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(event);
        }
        Ok(results)
    }

    /// The most recent event for an alarm, if any.
    pub fn latest_event_for_alarm(&self, alarm_name: &str) -> StateResult<Option<Event>> {
        Ok(self.events_for_alarm(alarm_name, 1)?.into_iter().next())
    }

    /// Events whose alarm targeted `instance` with one of `kinds`, newest first.
    pub fn events_for_instance(
        &self,
        instance: &str,
        kinds: &[&str],
        limit: usize,
    ) -> StateResult<Vec<Event>> {
        let mut results: Vec<Event> = self
            .list_events()?
            .into_iter()
            .filter(|e| {
                e.alarm.instance == instance
                    && e.alarm.actions.iter().any(|a| kinds.contains(&a.as_str()))
            })
            .collect();
        results.sort_by(|a, b| b.start_time.cmp(&a.start_time).then_with(|| b.id.cmp(&a.id)));
        results.truncate(limit);
        Ok(results)
    }

    /// List every stored event in key order.
    pub fn list_events(&self) -> StateResult<Vec<Event>> {
        self.list(EVENTS)
    }

    /// Delete the whole history of an alarm. Returns number deleted.
    pub fn purge_events_for_alarm(&self, alarm_name: &str) -> StateResult<u32> {
        let start = format!("{alarm_name}:");
        let end = format!("{alarm_name};");
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            table
                .range(start.as_str()..end.as_str())
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    Some(key.value().to_string())
                })
                .collect()
        };
        // Delete in a write transaction.
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(alarm = %alarm_name, count, "events purged");
        Ok(count)
    }

    // ── Autoscale specifications ───────────────────────────────────

    /// Insert a new autoscale spec. Fails with `AlreadyExists` if the name is taken.
    pub fn insert_autoscale(&self, spec: &AutoScale) -> StateResult<()> {
        validate_name(&spec.name)?;
        self.put(AUTOSCALES, spec.table_key(), spec, true)
    }

    /// Insert or replace an autoscale spec.
    pub fn put_autoscale(&self, spec: &AutoScale) -> StateResult<()> {
        validate_name(&spec.name)?;
        self.put(AUTOSCALES, spec.table_key(), spec, false)
    }

    /// Get an autoscale spec by name.
    pub fn get_autoscale(&self, name: &str) -> StateResult<Option<AutoScale>> {
        self.get(AUTOSCALES, name)
    }

    /// List all autoscale specs.
    pub fn list_autoscales(&self) -> StateResult<Vec<AutoScale>> {
        self.list(AUTOSCALES)
    }

    /// Delete an autoscale spec. Returns true if it existed.
    pub fn delete_autoscale(&self, name: &str) -> StateResult<bool> {
        self.delete(AUTOSCALES, name)
    }
}
