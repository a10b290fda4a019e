use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, ApiGateway};
use crate::mapper::StateMapper;
use crate::model::Charger;
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Polling,
    Scheduled,
    Stopped,
}

/// Stops the refresh of one charger for the current cycle.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("{operation} failed for charger {charger}, refresh stopped: {source}")]
    Fetch {
        operation: &'static str,
        charger: String,
        #[source]
        source: ApiError,
    },
    #[error("state update failed for charger {charger}: {source}")]
    Store {
        charger: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub chargers: Vec<String>,
    pub refreshed: Vec<String>,
    pub failed: Vec<String>,
    pub sessions_fetched: bool,
    pub list_failed: bool,
}

pub struct PollScheduler {
    gateway: ApiGateway,
    mapper: Arc<StateMapper>,
    poll_interval: Duration,
    session_threshold: f64,
    round_counter: u32,
    state: SchedulerState,
    last_seen: Vec<String>,
    cycles: u64,
}

impl PollScheduler {
    pub fn new(
        gateway: ApiGateway,
        mapper: Arc<StateMapper>,
        poll_interval: Duration,
        min_session_interval: Duration,
    ) -> Self {
        Self {
            gateway,
            mapper,
            poll_interval,
            session_threshold: min_session_interval.as_secs_f64() / poll_interval.as_secs_f64(),
            round_counter: 0,
            state: SchedulerState::Idle,
            last_seen: Vec::new(),
            cycles: 0,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn round_counter(&self) -> u32 {
        self.round_counter
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Makes the next cycle fetch monthly sessions regardless of the counter.
    pub fn fetch_sessions_next_cycle(&mut self) {
        self.round_counter = (self.session_threshold.floor().max(0.0) as u32).saturating_add(1);
    }

    /// Polls until `shutdown` flips to true. The next cycle starts one full
    /// interval after the previous one finished.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(poll_interval_secs = self.poll_interval.as_secs_f64(), "poll scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            let report = self.run_cycle().await;
            info!(
                chargers = report.chargers.len(),
                refreshed = report.refreshed.len(),
                failed = report.failed.len(),
                sessions = report.sessions_fetched,
                elapsed_ms = %started.elapsed().as_millis(),
                "poll cycle finished"
            );

            self.state = SchedulerState::Scheduled;
            tokio::select! {
                _ = sleep(self.poll_interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.state = SchedulerState::Stopped;
        info!("poll scheduler stopped");
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        self.state = SchedulerState::Polling;
        self.cycles += 1;

        let fetch_sessions = f64::from(self.round_counter) > self.session_threshold;
        let mut report = CycleReport {
            sessions_fetched: fetch_sessions,
            ..Default::default()
        };
        debug!(round = self.round_counter, fetch_sessions, "reading chargers");

        match self.gateway.list_chargers().await {
            Ok(chargers) => {
                self.mapper.set_connection(true).await;
                if chargers.is_empty() {
                    warn!("no chargers found");
                }
                self.report_missing(&chargers);

                for charger in &chargers {
                    report.chargers.push(charger.id.clone());
                    match self.refresh_charger(charger, fetch_sessions).await {
                        Ok(()) => report.refreshed.push(charger.id.clone()),
                        Err(err) => {
                            error!(charger = %charger.id, error = %err, "charger refresh failed");
                            report.failed.push(charger.id.clone());
                        }
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "could not list chargers, skipping this cycle");
                self.mapper.set_connection(false).await;
                report.list_failed = true;
            }
        }

        if fetch_sessions {
            debug!(round = self.round_counter, "session data fetched, resetting round counter");
            self.round_counter = 0;
        }
        self.round_counter += 1;

        self.mapper.mark_updated(Utc::now()).await;
        report
    }

    async fn refresh_charger(&self, charger: &Charger, fetch_sessions: bool) -> Result<(), PollError> {
        let id = charger.id.as_str();
        let store_err = |source: StoreError| PollError::Store {
            charger: id.to_string(),
            source,
        };
        let fetch_err = |operation: &'static str| {
            move |source: ApiError| PollError::Fetch {
                operation,
                charger: id.to_string(),
                source,
            }
        };

        self.mapper.ensure_skeleton(id).await.map_err(store_err)?;
        self.mapper.apply_identity(charger).await.map_err(store_err)?;

        let (status, config) = tokio::join!(
            self.gateway.charger_state(id),
            self.gateway.charger_config(id)
        );
        let status = status.map_err(fetch_err("charger state"))?;
        let config = config.map_err(fetch_err("charger config"))?;

        self.mapper.apply_status(id, &status).await.map_err(store_err)?;
        self.mapper.apply_config(id, &config).await.map_err(store_err)?;

        if fetch_sessions {
            let sessions = self
                .gateway
                .monthly_sessions(id)
                .await
                .map_err(fetch_err("charger sessions"))?;
            self.mapper.apply_session(id, &sessions).await.map_err(store_err)?;
        }
        Ok(())
    }

    fn report_missing(&mut self, chargers: &[Charger]) {
        let current: Vec<String> = chargers.iter().map(|c| c.id.clone()).collect();
        for id in &self.last_seen {
            if !current.contains(id) {
                warn!(charger = %id, "charger no longer reported by the api");
            }
        }
        self.last_seen = current;
    }
}
