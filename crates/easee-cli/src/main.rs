use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use easee_core::config::{DEFAULT_API_URL, DEFAULT_STREAM_URL};
use easee_core::{AdapterConfig, AdapterSession, MemoryStore, StateEntry};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod console;
mod journal;
#[cfg(test)]
mod journal_tests;

#[derive(Debug, Parser)]
#[command(name = "easeed")]
#[command(about = "Easee charger bridge: polls the cloud API and forwards state edits")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, env = "EASEE_USERNAME", default_value = "")]
    username: String,

    #[arg(long, env = "EASEE_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    #[arg(long, default_value_t = 30)]
    poll_interval_secs: u64,

    #[arg(long, default_value_t = 120)]
    session_interval_secs: u64,

    #[arg(long)]
    push: bool,

    #[arg(long, default_value = DEFAULT_API_URL)]
    api_url: String,

    #[arg(long, default_value = DEFAULT_STREAM_URL)]
    stream_url: String,

    #[arg(long, default_value_t = 500)]
    debounce_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    request_timeout_ms: u64,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Log in and list the chargers on the account.
    Chargers,
    /// Run one poll cycle, sessions included, and print the state tree.
    Once {
        #[arg(long, value_enum, default_value = "json")]
        format: OutputFormat,
    },
    /// Run the adapter until ctrl-c, journaling every state write.
    Run {
        #[arg(long, default_value = "./data/states")]
        state_dir: PathBuf,
        #[arg(long, default_value_t = 90)]
        retention_days: u64,
        #[arg(long, default_value_t = 60)]
        snapshot_interval_secs: u64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let config = AdapterConfig {
        username: cli.username,
        password: cli.password,
        poll_interval: Duration::from_secs(cli.poll_interval_secs),
        min_session_interval: Duration::from_secs(cli.session_interval_secs),
        enable_push: cli.push,
        api_url: cli.api_url,
        stream_url: cli.stream_url,
        circuit_debounce: Duration::from_millis(cli.debounce_ms),
        request_timeout: Duration::from_millis(cli.request_timeout_ms),
        ..AdapterConfig::default()
    };

    match cli.command {
        Command::Chargers => {
            let store = Arc::new(MemoryStore::new());
            let session = AdapterSession::connect_http(config, store).await?;
            let chargers = session.gateway().list_chargers().await?;
            println!("{}", serde_json::to_string_pretty(&chargers)?);
        }
        Command::Once { format } => {
            let store = Arc::new(MemoryStore::new());
            let session = AdapterSession::connect_http(config, store.clone()).await?;
            let report = session.poll_once().await;
            info!(
                chargers = report.chargers.len(),
                failed = report.failed.len(),
                "poll cycle finished"
            );
            print_states(&store.snapshot(), format)?;
        }
        Command::Run {
            state_dir,
            retention_days,
            snapshot_interval_secs,
        } => {
            run(config, state_dir, retention_days, Duration::from_secs(snapshot_interval_secs)).await?;
        }
    }

    Ok(())
}

async fn run(config: AdapterConfig, state_dir: PathBuf, retention_days: u64, snapshot_every: Duration) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let restored = journal::restore_latest(&state_dir, &store)?;
    if restored > 0 {
        info!(states = restored, dir = %state_dir.display(), "restored previous state snapshot");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state_journal = journal::StateJournal::open(&state_dir, retention_days)?;
    let journal_task = tokio::spawn(journal::run_journal(
        store.clone(),
        state_journal,
        snapshot_every,
        shutdown_rx.clone(),
    ));
    let console_task = tokio::spawn(console::run_console(
        store.clone(),
        console::spawn_stdin_reader(),
        shutdown_rx,
    ));

    // Without a session the process stays up so the store keeps serving.
    let running = match AdapterSession::connect_http(config, store.clone()).await {
        Ok(session) => Some(session.start()),
        Err(err) => {
            error!(error = %err, "adapter not started, waiting for ctrl-c");
            None
        }
    };

    tokio::signal::ctrl_c().await?;
    warn!("received ctrl-c, stopping");

    if let Some(running) = running {
        running.shutdown().await;
    }
    // Receivers may already be gone.
    let _ = shutdown_tx.send(true);
    console_task.await?;
    journal_task.await??;
    Ok(())
}

fn print_states(states: &BTreeMap<String, StateEntry>, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let values: BTreeMap<&str, &serde_json::Value> = states
                .iter()
                .filter_map(|(path, entry)| entry.state.as_ref().map(|s| (path.as_str(), &s.value)))
                .collect();
            println!("{}", serde_json::to_string_pretty(&values)?);
        }
        OutputFormat::Human => {
            println!("=== Easee States ===");
            for (path, entry) in states {
                let Some(state) = &entry.state else {
                    continue;
                };
                let unit = entry.definition.unit.as_deref().unwrap_or("");
                println!(
                    "{path:<48} {}{}{}",
                    state.value,
                    if unit.is_empty() { "" } else { " " },
                    unit
                );
            }
        }
    }

    Ok(())
}
