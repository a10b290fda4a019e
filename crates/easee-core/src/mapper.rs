use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::fields::{
    is_writable_config, ChargerCommand, FieldSpec, ValueKind, CONFIG_FIELDS, SECTION_CONFIG,
    SECTION_CONTROL, SECTION_SESSION, SECTION_STATUS, STATUS_CONFIG_FIELDS, STATUS_FIELDS,
};
use crate::model::{year_totals, Charger, ConfigSnapshot, SessionRecord, StatusSnapshot};
use crate::store::{StateDefinition, StateStore, StoreError};

pub const LAST_UPDATE: &str = "lastUpdate";
pub const INFO_CONNECTION: &str = "info.connection";

/// Push payload type codes.
pub const DATA_TYPE_BOOLEAN: u8 = 2;
pub const DATA_TYPE_DOUBLE: u8 = 3;
pub const DATA_TYPE_INTEGER: u8 = 4;
pub const DATA_TYPE_STRING: u8 = 5;

#[derive(Debug, Error, PartialEq)]
pub enum MappingError {
    #[error("unknown field id {0}")]
    UnknownField(u16),
    #[error("unsupported data type {0}")]
    UnsupportedType(u8),
    #[error("cannot read {raw:?} as {expected}")]
    InvalidValue { raw: String, expected: &'static str },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Coerces a push value according to its type code.
pub fn coerce_push_value(data_type: u8, raw: &str) -> Result<Value, MappingError> {
    let invalid = |expected| MappingError::InvalidValue {
        raw: raw.to_string(),
        expected,
    };
    match data_type {
        DATA_TYPE_BOOLEAN => Ok(Value::Bool(raw.trim() == "1")),
        DATA_TYPE_DOUBLE => raw
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| invalid("float")),
        DATA_TYPE_INTEGER => {
            let trimmed = raw.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| {
                    trimmed
                        .parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(|f| f.trunc() as i64)
                })
                .map(Value::from)
                .ok_or_else(|| invalid("integer"))
        }
        DATA_TYPE_STRING => Ok(Value::String(raw.to_string())),
        other => Err(MappingError::UnsupportedType(other)),
    }
}

fn state_path(entity_id: &str, section: &str, key: &str) -> String {
    format!("{entity_id}.{section}.{key}")
}

/// Translates vendor payloads into writes on the state tree.
pub struct StateMapper {
    store: Arc<dyn StateStore>,
    known: Mutex<HashSet<String>>,
    added: broadcast::Sender<String>,
}

impl StateMapper {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        let (added, _) = broadcast::channel(64);
        Self {
            store,
            known: Mutex::new(HashSet::new()),
            added,
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Ids of chargers whose state tree is created from now on.
    pub fn entity_additions(&self) -> broadcast::Receiver<String> {
        self.added.subscribe()
    }

    pub fn known_entities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.known.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn ensure_adapter_states(&self) -> Result<(), StoreError> {
        self.store
            .ensure_definition(
                LAST_UPDATE,
                StateDefinition::read_only("lastUpdate", ValueKind::Text, "indicator"),
            )
            .await?;
        self.store
            .ensure_definition(
                INFO_CONNECTION,
                StateDefinition::read_only(
                    "Connected to the vendor API",
                    ValueKind::Boolean,
                    "indicator.connected",
                ),
            )
            .await?;
        Ok(())
    }

    pub async fn set_connection(&self, connected: bool) {
        if let Err(err) = self
            .store
            .write_value(INFO_CONNECTION, Value::Bool(connected), true)
            .await
        {
            warn!(error = %err, "failed to write connection state");
        }
    }

    pub async fn mark_updated(&self, at: DateTime<Utc>) {
        if let Err(err) = self
            .store
            .write_value(LAST_UPDATE, Value::String(at.to_rfc3339()), true)
            .await
        {
            warn!(error = %err, "failed to write last update marker");
        }
    }

    /// Creates all per-charger state definitions the first time a charger is
    /// seen. Returns `true` only for the call that did the work.
    pub async fn ensure_skeleton(&self, entity_id: &str) -> Result<bool, StoreError> {
        if !self.known.lock().insert(entity_id.to_string()) {
            return Ok(false);
        }

        if let Err(err) = self.create_skeleton(entity_id).await {
            self.known.lock().remove(entity_id);
            return Err(err);
        }
        info!(charger = %entity_id, "created state tree for charger");
        // Nobody listening is fine.
        let _ = self.added.send(entity_id.to_string());
        Ok(true)
    }

    async fn create_skeleton(&self, entity_id: &str) -> Result<(), StoreError> {
        let store = &self.store;

        store
            .ensure_definition(
                &format!("{entity_id}.id"),
                StateDefinition::read_only("id", ValueKind::Text, "info.name"),
            )
            .await?;
        store
            .ensure_definition(
                &format!("{entity_id}.name"),
                StateDefinition::read_only("name", ValueKind::Text, "info.name"),
            )
            .await?;

        for command in ChargerCommand::ALL {
            let path = state_path(entity_id, SECTION_CONTROL, command.state_name());
            store
                .ensure_definition(&path, StateDefinition::button(command.label()))
                .await?;
            store.subscribe(&path).await?;
        }

        for field in STATUS_FIELDS {
            let path = state_path(entity_id, SECTION_STATUS, field.key);
            store
                .ensure_definition(&path, StateDefinition::from_field(field, false))
                .await?;
        }

        for field in STATUS_CONFIG_FIELDS.iter().chain(CONFIG_FIELDS) {
            let path = state_path(entity_id, SECTION_CONFIG, field.key);
            let writable = is_writable_config(field.key);
            store
                .ensure_definition(&path, StateDefinition::from_field(field, writable))
                .await?;
            if writable {
                store.subscribe(&path).await?;
            }
        }

        Ok(())
    }

    pub async fn apply_identity(&self, charger: &Charger) -> Result<(), StoreError> {
        self.store
            .write_value(&format!("{}.id", charger.id), Value::String(charger.id.clone()), true)
            .await?;
        self.store
            .write_value(&format!("{}.name", charger.id), Value::String(charger.name.clone()), true)
            .await
    }

    pub async fn apply_status(&self, entity_id: &str, snapshot: &StatusSnapshot) -> Result<usize, StoreError> {
        let mut written = self
            .write_fields(entity_id, SECTION_STATUS, STATUS_FIELDS, &snapshot.fields)
            .await?;
        written += self
            .write_fields(entity_id, SECTION_CONFIG, STATUS_CONFIG_FIELDS, &snapshot.fields)
            .await?;
        Ok(written)
    }

    pub async fn apply_config(&self, entity_id: &str, snapshot: &ConfigSnapshot) -> Result<usize, StoreError> {
        self.write_fields(entity_id, SECTION_CONFIG, CONFIG_FIELDS, &snapshot.fields)
            .await
    }

    async fn write_fields(
        &self,
        entity_id: &str,
        section: &str,
        fields: &[FieldSpec],
        payload: &BTreeMap<String, Value>,
    ) -> Result<usize, StoreError> {
        let mut written = 0;
        for field in fields {
            let Some(raw) = payload.get(field.key) else {
                continue;
            };
            let Some(value) = field.kind.coerce(raw) else {
                debug!(charger = %entity_id, field = field.key, value = %raw, "payload value has unexpected type, skipped");
                continue;
            };
            self.store
                .write_value(&state_path(entity_id, section, field.key), value, true)
                .await?;
            written += 1;
        }
        Ok(written)
    }

    pub async fn apply_session(&self, entity_id: &str, records: &[SessionRecord]) -> Result<(), StoreError> {
        let mut sorted = records.to_vec();
        sorted.sort_by_key(|r| (r.year, r.month));
        if sorted != records {
            debug!(charger = %entity_id, "session records arrived unsorted, sorted by year and month");
        }

        for record in &sorted {
            let base = format!("{entity_id}.{SECTION_SESSION}.{}.{}", record.year, record.month);
            let entries = [
                (
                    "totalEnergyUsage",
                    StateDefinition::read_only("totalEnergyUsage", ValueKind::Number, "value.power.consumption")
                        .with_unit("kWh"),
                    Value::from(record.total_energy_usage),
                ),
                (
                    "totalCost",
                    StateDefinition::read_only("totalCost", ValueKind::Number, "value"),
                    Value::from(record.total_cost),
                ),
                (
                    "currencyId",
                    StateDefinition::read_only("currencyId", ValueKind::Text, "text"),
                    record.currency_id.clone().map(Value::String).unwrap_or(Value::Null),
                ),
            ];
            for (key, definition, value) in entries {
                let path = format!("{base}.{key}");
                self.store.ensure_definition(&path, definition).await?;
                self.store.write_value(&path, value, true).await?;
            }
        }

        for total in year_totals(&sorted) {
            let path = format!("{entity_id}.{SECTION_SESSION}.{}.totalYear", total.year);
            self.store
                .ensure_definition(
                    &path,
                    StateDefinition::read_only("totalYear", ValueKind::Number, "value.power.consumption")
                        .with_unit("kWh"),
                )
                .await?;
            self.store.write_value(&path, Value::from(total.total), true).await?;
        }
        Ok(())
    }

    /// Single-field update from the push channel. Unknown states are dropped.
    pub async fn apply_field(&self, entity_id: &str, field_path: &str, value: Value) -> Result<bool, MappingError> {
        let path = format!("{entity_id}.{field_path}");
        match self.store.write_value(&path, value, true).await {
            Ok(()) => Ok(true),
            Err(StoreError::UnknownState(_)) => {
                debug!(%path, "no state for pushed field, dropped");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}
