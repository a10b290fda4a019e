use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::{ApiError, ApiGateway, HttpTransport, Transport};
use crate::auth::{AuthError, CredentialManager, TokenSource};
use crate::config::{AdapterConfig, ConfigError};
use crate::debounce::CircuitDebouncer;
use crate::dispatcher::CommandDispatcher;
use crate::mapper::StateMapper;
use crate::poller::{CycleReport, PollScheduler};
use crate::push::PushListener;
use crate::store::{StateChange, StateStore, StoreError};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration incomplete: {0}")]
    Config(#[from] ConfigError),
    #[error("could not set up adapter states: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Login(#[from] AuthError),
    #[error("could not create http client: {0}")]
    Transport(ApiError),
}

pub struct AdapterSession {
    config: AdapterConfig,
    gateway: ApiGateway,
    mapper: Arc<StateMapper>,
}

impl AdapterSession {
    pub async fn connect_http(config: AdapterConfig, store: Arc<dyn StateStore>) -> Result<Self, StartupError> {
        let transport = HttpTransport::new(config.api_url.clone(), config.request_timeout)
            .map_err(StartupError::Transport)?;
        Self::connect(config, store, Arc::new(transport)).await
    }

    /// Prepares adapter states and logs in. A failed login leaves
    /// `info.connection` at false and nothing else running.
    pub async fn connect(
        config: AdapterConfig,
        store: Arc<dyn StateStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, StartupError> {
        let config = config.normalized();
        let mapper = Arc::new(StateMapper::new(store));
        mapper.ensure_adapter_states().await?;
        mapper.set_connection(false).await;

        let credentials = config.credentials().map_err(|err| {
            error!(error = %err, "credentials missing, not logging in");
            err
        })?;

        let manager = Arc::new(CredentialManager::new(transport.clone(), credentials));
        if let Err(err) = manager.login().await {
            error!(error = %err, "login failed, adapter not started");
            mapper.set_connection(false).await;
            return Err(err.into());
        }
        mapper.set_connection(true).await;

        Ok(Self {
            gateway: ApiGateway::new(transport, manager),
            mapper,
            config,
        })
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn gateway(&self) -> &ApiGateway {
        &self.gateway
    }

    pub fn mapper(&self) -> &Arc<StateMapper> {
        &self.mapper
    }

    pub fn scheduler(&self) -> PollScheduler {
        PollScheduler::new(
            self.gateway.clone(),
            self.mapper.clone(),
            self.config.poll_interval,
            self.config.min_session_interval,
        )
    }

    pub async fn poll_once(&self) -> CycleReport {
        let mut scheduler = self.scheduler();
        scheduler.fetch_sessions_next_cycle();
        scheduler.run_cycle().await
    }

    pub fn start(self) -> RunningAdapter {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let store = self.mapper.store().clone();

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs_f64(),
            session_every_rounds = self.config.session_round_threshold(),
            push = self.config.enable_push,
            "starting adapter"
        );

        let debouncer = Arc::new(CircuitDebouncer::new(
            self.gateway.clone(),
            store.clone(),
            self.config.circuit_debounce,
            shutdown_rx.clone(),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(self.gateway.clone(), debouncer.clone()));

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(forward_changes(
            store.changes(),
            dispatcher,
            shutdown_rx.clone(),
        )));

        let mut scheduler = self.scheduler();
        let poll_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { scheduler.run(poll_shutdown).await }));

        if self.config.enable_push {
            let tokens: Arc<dyn TokenSource> = self.gateway.credentials().clone();
            match PushListener::new(
                &self.config.stream_url,
                tokens,
                self.mapper.clone(),
                self.config.request_timeout,
                self.config.reconnect_delay,
                self.config.max_reconnect_delay,
            ) {
                Ok(listener) => tasks.push(tokio::spawn(listener.run(shutdown_rx.clone()))),
                Err(err) => warn!(error = %err, "push updates disabled"),
            }
        }

        RunningAdapter {
            shutdown: shutdown_tx,
            tasks,
            debouncer,
            mapper: self.mapper,
            gateway: self.gateway,
        }
    }
}

/// Hands every unacknowledged change of a subscribed state to the dispatcher.
async fn forward_changes(
    mut changes: broadcast::Receiver<StateChange>,
    dispatcher: Arc<CommandDispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            change = changes.recv() => match change {
                Ok(change) if !change.ack => dispatcher.dispatch(change),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "state change notifications dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

pub struct RunningAdapter {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    debouncer: Arc<CircuitDebouncer>,
    mapper: Arc<StateMapper>,
    gateway: ApiGateway,
}

impl RunningAdapter {
    pub fn gateway(&self) -> &ApiGateway {
        &self.gateway
    }

    pub fn mapper(&self) -> &Arc<StateMapper> {
        &self.mapper
    }

    pub async fn shutdown(self) {
        info!("stopping adapter");
        // Receivers may already be gone.
        let _ = self.shutdown.send(true);

        for task in self.tasks {
            if let Err(err) = task.await {
                error!(error = %err, "adapter task panicked");
            }
        }
        self.debouncer.join().await;
        self.mapper.set_connection(false).await;
        info!("adapter stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::api::Method;
    use crate::mapper::INFO_CONNECTION;
    use crate::store::MemoryStore;
    use crate::test_support::{token_response, FakeTransport};
    use serde_json::json;

    fn config() -> AdapterConfig {
        AdapterConfig {
            username: "user@example.com".to_string(),
            password: "hunter2".to_string(),
            ..AdapterConfig::default()
        }
    }

    fn script_account(transport: &FakeTransport) {
        transport.respond(Method::Post, "/api/accounts/login", token_response("access-1", 3600.0));
        transport.respond(Method::Get, "/api/chargers", json!([{"id": "EH1", "name": "Garage"}]));
        transport.respond(Method::Get, "/api/chargers/EH1/state", json!({"voltage": 230.0}));
        transport.respond(Method::Get, "/api/chargers/EH1/config", json!({"isEnabled": true}));
        transport.respond(Method::Get, "/api/sessions/charger/EH1/monthly", json!([]));
        transport.respond(Method::Post, "/api/chargers/EH1/commands/start_charging", json!({}));
    }

    #[tokio::test]
    async fn missing_credentials_skip_login() {
        let transport = FakeTransport::new();
        let store = Arc::new(MemoryStore::new());
        let config = AdapterConfig {
            username: "+49".to_string(),
            ..config()
        };

        let result = AdapterSession::connect(config, store.clone(), transport.clone()).await;

        assert!(matches!(result, Err(StartupError::Config(ConfigError::MissingUsername))));
        assert!(transport.calls().is_empty());
        assert_eq!(store.value(INFO_CONNECTION), Some(json!(false)));
    }

    #[tokio::test]
    async fn failed_login_reports_disconnected() {
        let transport = FakeTransport::new();
        transport.fail(Method::Post, "/api/accounts/login", 401);
        let store = Arc::new(MemoryStore::new());

        let result = AdapterSession::connect(config(), store.clone(), transport.clone()).await;

        assert!(matches!(result, Err(StartupError::Login(AuthError::Login(_)))));
        assert_eq!(store.value(INFO_CONNECTION), Some(json!(false)));
        assert_eq!(transport.count(Method::Get, "/api/chargers"), 0);
    }

    #[tokio::test]
    async fn poll_once_includes_sessions() {
        let transport = FakeTransport::new();
        script_account(&transport);
        let store = Arc::new(MemoryStore::new());
        let session = AdapterSession::connect(config(), store.clone(), transport.clone())
            .await
            .expect("connect");

        let report = session.poll_once().await;

        assert!(report.sessions_fetched);
        assert_eq!(report.refreshed, vec!["EH1".to_string()]);
        assert_eq!(store.value("EH1.name"), Some(json!("Garage")));
        assert_eq!(store.value(INFO_CONNECTION), Some(json!(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn user_writes_are_dispatched_until_shutdown() {
        // Arrange
        let transport = FakeTransport::new();
        script_account(&transport);
        let store = Arc::new(MemoryStore::new());
        let session = AdapterSession::connect(config(), store.clone(), transport.clone())
            .await
            .expect("connect");
        let running = session.start();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Act
        store
            .write_value("EH1.control.start", json!(true), false)
            .await
            .expect("user write");
        tokio::time::sleep(Duration::from_millis(10)).await;
        running.shutdown().await;

        // Assert
        assert_eq!(transport.count(Method::Post, "/api/chargers/EH1/commands/start_charging"), 1);
        assert_eq!(store.value(INFO_CONNECTION), Some(json!(false)));
        assert_eq!(transport.count(Method::Get, "/api/chargers"), 1);
    }
}
