use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::api::{ApiError, ApiGateway};
use crate::debounce::{CircuitDebouncer, CircuitEdit, CircuitKey, EditStamp};
use crate::fields::{ChargerCommand, ConfigField, Phase, SECTION_CONFIG};
use crate::model::Site;
use crate::store::StateChange;

#[derive(Debug, Error, PartialEq)]
pub enum DispatchError {
    #[error("state path {0} is not <charger>.<section>.<field>")]
    InvalidPath(String),
    #[error("unknown command {0}")]
    UnknownCommand(String),
    #[error("config field {0} is not writable")]
    ReadOnlyField(String),
    #[error("value {value} does not fit config field {field}")]
    InvalidValue { field: String, value: Value },
    #[error("charger {0} has no circuit on its site")]
    NoCircuit(String),
    #[error("{operation} failed for charger {charger}: {source}")]
    Api {
        operation: &'static str,
        charger: String,
        #[source]
        source: ApiError,
    },
}

/// A changed state split into its fixed positional segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePath {
    pub entity_id: String,
    pub section: String,
    pub field: String,
}

impl StatePath {
    pub fn parse(path: &str) -> Result<Self, DispatchError> {
        let mut segments = path.split('.');
        match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some(entity), Some(section), Some(field), None)
                if !entity.is_empty() && !section.is_empty() && !field.is_empty() =>
            {
                Ok(Self {
                    entity_id: entity.to_string(),
                    section: section.to_string(),
                    field: field.to_string(),
                })
            }
            _ => Err(DispatchError::InvalidPath(path.to_string())),
        }
    }
}

/// What a user edit turned into upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Ignored,
    Command(ChargerCommand),
    Settings(ConfigField),
    CircuitMax { site_id: i64, circuit_id: i64 },
    Debounced(Phase),
}

/// Turns unacknowledged state changes into vendor API writes.
pub struct CommandDispatcher {
    gateway: ApiGateway,
    debouncer: Arc<CircuitDebouncer>,
    sequence: AtomicU64,
}

impl CommandDispatcher {
    pub fn new(gateway: ApiGateway, debouncer: Arc<CircuitDebouncer>) -> Self {
        Self {
            gateway,
            debouncer,
            sequence: AtomicU64::new(0),
        }
    }

    /// Handles the change on its own task. Failures end in the log.
    /// The edit is stamped here, so its order survives slow lookups.
    pub fn dispatch(self: &Arc<Self>, change: StateChange) {
        if change.ack {
            return;
        }
        let stamp = self.stamp();
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = dispatcher.handle_stamped(&change, stamp).await {
                error!(path = %change.path, error = %err, "state change not dispatched");
            }
        });
    }

    pub async fn handle(&self, change: &StateChange) -> Result<Dispatched, DispatchError> {
        self.handle_stamped(change, self.stamp()).await
    }

    fn stamp(&self) -> EditStamp {
        EditStamp {
            seq: self.sequence.fetch_add(1, Ordering::Relaxed),
            at: Instant::now(),
        }
    }

    async fn handle_stamped(&self, change: &StateChange, stamp: EditStamp) -> Result<Dispatched, DispatchError> {
        if change.ack {
            debug!(path = %change.path, "acknowledged change, nothing to dispatch");
            return Ok(Dispatched::Ignored);
        }

        let path = StatePath::parse(&change.path)?;
        debug!(path = %change.path, value = %change.value, "dispatching user change");

        if path.section == SECTION_CONFIG {
            return self.write_config(&path, &change.value, stamp).await;
        }

        let command = ChargerCommand::from_state_name(&path.field)
            .ok_or_else(|| DispatchError::UnknownCommand(path.field.clone()))?;
        self.gateway
            .send_command(&path.entity_id, command)
            .await
            .map_err(api_error("command", &path.entity_id))?;
        info!(charger = %path.entity_id, command = command.state_name(), "command sent");
        Ok(Dispatched::Command(command))
    }

    async fn write_config(
        &self,
        path: &StatePath,
        raw: &Value,
        stamp: EditStamp,
    ) -> Result<Dispatched, DispatchError> {
        let field = ConfigField::from_state_name(&path.field)
            .ok_or_else(|| DispatchError::ReadOnlyField(path.field.clone()))?;
        let value = field.kind().coerce(raw).ok_or_else(|| DispatchError::InvalidValue {
            field: path.field.clone(),
            value: raw.clone(),
        })?;
        let charger = path.entity_id.as_str();

        match field {
            ConfigField::CircuitMaxCurrent(_) => {
                let circuit = self.circuit_of(charger).await?;
                let mut settings = Map::new();
                for phase in Phase::ALL {
                    settings.insert(
                        ConfigField::CircuitMaxCurrent(phase).upstream_name(),
                        value.clone(),
                    );
                }
                self.gateway
                    .update_circuit(circuit.site_id, circuit.circuit_id, settings)
                    .await
                    .map_err(api_error("circuit max current update", charger))?;
                info!(
                    charger,
                    site = circuit.site_id,
                    circuit = circuit.circuit_id,
                    value = %value,
                    "circuit max current set on all phases"
                );
                Ok(Dispatched::CircuitMax {
                    site_id: circuit.site_id,
                    circuit_id: circuit.circuit_id,
                })
            }
            ConfigField::DynamicCircuitCurrent(phase) => {
                let circuit = self.circuit_of(charger).await?;
                self.debouncer
                    .submit(CircuitEdit {
                        circuit,
                        charger_id: charger.to_string(),
                        phase,
                        value,
                        stamp,
                    })
                    .await;
                Ok(Dispatched::Debounced(phase))
            }
            other => {
                let mut settings = Map::new();
                settings.insert(other.upstream_name(), value.clone());
                self.gateway
                    .update_settings(charger, settings)
                    .await
                    .map_err(api_error("settings update", charger))?;
                info!(charger, field = %other.upstream_name(), value = %value, "charger setting updated");
                Ok(Dispatched::Settings(other))
            }
        }
    }

    /// The first circuit of the charger's site.
    async fn circuit_of(&self, charger: &str) -> Result<CircuitKey, DispatchError> {
        let site: Site = self
            .gateway
            .charger_site(charger)
            .await
            .map_err(api_error("site lookup", charger))?;
        let circuit = site
            .circuits
            .first()
            .ok_or_else(|| DispatchError::NoCircuit(charger.to_string()))?;
        Ok(CircuitKey {
            site_id: site.id,
            circuit_id: circuit.id,
        })
    }
}

fn api_error<'a>(operation: &'static str, charger: &'a str) -> impl FnOnce(ApiError) -> DispatchError + 'a {
    move |source| DispatchError::Api {
        operation,
        charger: charger.to_string(),
        source,
    }
}
