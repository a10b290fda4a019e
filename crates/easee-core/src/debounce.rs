use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::api::ApiGateway;
use crate::fields::{ConfigField, Phase, SECTION_CONFIG};
use crate::store::StateStore;

const EDIT_QUEUE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CircuitKey {
    pub site_id: i64,
    pub circuit_id: i64,
}

/// Order and time of a user edit, taken before any upstream lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditStamp {
    pub seq: u64,
    pub at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitEdit {
    pub circuit: CircuitKey,
    pub charger_id: String,
    pub phase: Phase,
    pub value: Value,
    pub stamp: EditStamp,
}

pub struct CircuitDebouncer {
    gateway: ApiGateway,
    store: Arc<dyn StateStore>,
    window: Duration,
    shutdown: watch::Receiver<bool>,
    workers: Mutex<HashMap<CircuitKey, mpsc::Sender<CircuitEdit>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CircuitDebouncer {
    pub fn new(
        gateway: ApiGateway,
        store: Arc<dyn StateStore>,
        window: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            gateway,
            store,
            window,
            shutdown,
            workers: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Buffers one phase value and restarts the circuit's flush timer.
    /// Returns `false` once the debouncer has shut down.
    pub async fn submit(&self, edit: CircuitEdit) -> bool {
        if *self.shutdown.borrow() {
            debug!(site = edit.circuit.site_id, circuit = edit.circuit.circuit_id, "debouncer stopped, edit dropped");
            return false;
        }

        let sender = self.worker(edit.circuit);
        let circuit = edit.circuit;
        if sender.send(edit).await.is_err() {
            warn!(site = circuit.site_id, circuit = circuit.circuit_id, "circuit worker gone, edit dropped");
            self.workers.lock().remove(&circuit);
            return false;
        }
        true
    }

    /// Waits for every circuit worker to exit after shutdown was signalled.
    pub async fn join(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "circuit worker panicked");
            }
        }
    }

    fn worker(&self, key: CircuitKey) -> mpsc::Sender<CircuitEdit> {
        let mut workers = self.workers.lock();
        if let Some(sender) = workers.get(&key).filter(|s| !s.is_closed()) {
            return sender.clone();
        }

        let (sender, receiver) = mpsc::channel(EDIT_QUEUE);
        let worker = CircuitWorker {
            key,
            gateway: self.gateway.clone(),
            store: self.store.clone(),
            window: self.window,
            pending: [None, None, None],
            newest: [None, None, None],
            charger_id: String::new(),
            deadline: None,
        };
        let handle = tokio::spawn(worker.run(receiver, self.shutdown.clone()));
        self.handles.lock().push(handle);
        workers.insert(key, sender.clone());
        sender
    }
}

struct CircuitWorker {
    key: CircuitKey,
    gateway: ApiGateway,
    store: Arc<dyn StateStore>,
    window: Duration,
    pending: [Option<Value>; 3],
    // Kept across flushes so a late older edit cannot undo a newer one.
    newest: [Option<u64>; 3],
    charger_id: String,
    deadline: Option<Instant>,
}

impl CircuitWorker {
    async fn run(mut self, mut edits: mpsc::Receiver<CircuitEdit>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                edit = edits.recv() => match edit {
                    Some(edit) => self.buffer(edit),
                    None => break,
                },
                _ = wait_for(self.deadline) => self.flush().await,
            }
        }

        if self.deadline.is_some() {
            debug!(site = self.key.site_id, circuit = self.key.circuit_id, "pending circuit edits discarded on shutdown");
        }
    }

    fn buffer(&mut self, edit: CircuitEdit) {
        let slot = edit.phase.index();
        if self.newest[slot].is_some_and(|seq| seq > edit.stamp.seq) {
            debug!(
                site = self.key.site_id,
                circuit = self.key.circuit_id,
                phase = slot + 1,
                seq = edit.stamp.seq,
                "older circuit edit arrived late, skipped"
            );
            return;
        }

        debug!(
            site = self.key.site_id,
            circuit = self.key.circuit_id,
            phase = slot + 1,
            value = %edit.value,
            "buffered circuit edit"
        );
        self.newest[slot] = Some(edit.stamp.seq);
        self.pending[slot] = Some(edit.value);
        self.charger_id = edit.charger_id;
        let due = edit.stamp.at + self.window;
        self.deadline = Some(self.deadline.map_or(due, |current| current.max(due)));
    }

    async fn flush(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        self.deadline = None;

        let mut settings = Map::new();
        for phase in Phase::ALL {
            let field = ConfigField::DynamicCircuitCurrent(phase);
            let value = match &pending[phase.index()] {
                Some(value) => value.clone(),
                None => self.last_known(&field.state_name()).await,
            };
            settings.insert(field.upstream_name(), value);
        }

        let body = Value::Object(settings.clone());
        match self
            .gateway
            .update_circuit(self.key.site_id, self.key.circuit_id, settings)
            .await
        {
            Ok(_) => info!(
                site = self.key.site_id,
                circuit = self.key.circuit_id,
                settings = %body,
                "dynamic circuit current updated"
            ),
            Err(err) => error!(
                site = self.key.site_id,
                circuit = self.key.circuit_id,
                error = %err,
                "dynamic circuit current update failed"
            ),
        }
    }

    async fn last_known(&self, key: &str) -> Value {
        let path = format!("{}.{SECTION_CONFIG}.{key}", self.charger_id);
        match self.store.read_value(&path).await {
            Ok(Some(state)) if !state.value.is_null() => state.value,
            Ok(_) => json!(0),
            Err(err) => {
                warn!(%path, error = %err, "could not read last circuit value, sending 0");
                json!(0)
            }
        }
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
