use std::io::BufRead;
use std::sync::Arc;

use easee_core::{MemoryStore, StateStore};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Set { path: String, value: Value },
    Get { path: String },
    Dump,
}

/// `set <path> <json-or-text>`, `get <path>` or `dump`. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    match verb {
        "set" => {
            let (path, raw) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| "usage: set <path> <value>".to_string())?;
            let raw = raw.trim();
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            Ok(Some(ConsoleCommand::Set {
                path: path.to_string(),
                value,
            }))
        }
        "get" if !rest.is_empty() => Ok(Some(ConsoleCommand::Get {
            path: rest.to_string(),
        })),
        "get" => Err("usage: get <path>".to_string()),
        "dump" => Ok(Some(ConsoleCommand::Dump)),
        other => Err(format!("unknown command {other:?}, expected set, get or dump")),
    }
}

/// Reads stdin on a plain thread so a pending read never holds up shutdown.
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Applies console lines to the store as unacknowledged user writes.
pub async fn run_console(
    store: Arc<MemoryStore>,
    mut lines: mpsc::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let line = tokio::select! {
            _ = shutdown.changed() => break,
            line = lines.recv() => match line {
                Some(line) => line,
                None => {
                    debug!("stdin closed, console stopped");
                    break;
                }
            },
        };

        match parse_line(&line) {
            Ok(Some(command)) => execute(&store, command).await,
            Ok(None) => {}
            Err(message) => eprintln!("{message}"),
        }
    }
}

async fn execute(store: &MemoryStore, command: ConsoleCommand) {
    match command {
        ConsoleCommand::Set { path, value } => {
            if let Err(err) = store.write_value(&path, value, false).await {
                warn!(%path, error = %err, "console write rejected");
                eprintln!("{err}");
            }
        }
        ConsoleCommand::Get { path } => match store.state(&path) {
            Some(state) => println!("{path} = {} (ack={}, ts={})", state.value, state.ack, state.ts.to_rfc3339()),
            None => println!("{path} has no value"),
        },
        ConsoleCommand::Dump => {
            for (path, entry) in store.snapshot() {
                let value = entry.state.map(|s| s.value).unwrap_or(Value::Null);
                println!("{path} = {value}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_values_are_json_when_they_parse() {
        assert_eq!(
            parse_line("set EH1.config.phaseMode 2"),
            Ok(Some(ConsoleCommand::Set {
                path: "EH1.config.phaseMode".into(),
                value: json!(2)
            }))
        );
        assert_eq!(
            parse_line("set EH1.control.start true"),
            Ok(Some(ConsoleCommand::Set {
                path: "EH1.control.start".into(),
                value: json!(true)
            }))
        );
    }

    #[test]
    fn set_falls_back_to_text() {
        assert_eq!(
            parse_line("  set EH1.config.wiFiSSID my garage  "),
            Ok(Some(ConsoleCommand::Set {
                path: "EH1.config.wiFiSSID".into(),
                value: json!("my garage")
            }))
        );
    }

    #[test]
    fn malformed_lines_are_reported() {
        assert_eq!(parse_line(""), Ok(None));
        assert!(parse_line("set EH1.control.start").is_err());
        assert!(parse_line("get").is_err());
        assert!(parse_line("reboot now").is_err());
        assert_eq!(parse_line("dump"), Ok(Some(ConsoleCommand::Dump)));
    }
}
