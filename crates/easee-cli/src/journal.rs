use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Days, NaiveDate, Utc};
use easee_core::{MemoryStore, StateChange, StateEntry};
use tokio::sync::{broadcast, watch};
use tokio::time::{interval_at, Instant as TokioInstant};
use tracing::{debug, info, warn};

const JOURNAL_PREFIX: &str = "states-";
const JOURNAL_SUFFIX: &str = ".jsonl";
const LATEST_FILE: &str = "latest.json";
const PRUNE_EVERY: Duration = Duration::from_secs(1800);

/// Appends every store write to the daily journal and keeps `latest.json`
/// current until shutdown.
pub async fn run_journal(
    store: Arc<MemoryStore>,
    mut journal: StateJournal,
    snapshot_every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut writes = store.journal();
    let mut snapshots = interval_at(TokioInstant::now() + snapshot_every, snapshot_every);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            change = writes.recv() => match change {
                Ok(change) => journal.record(&change, Utc::now())?,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "journal fell behind, writes not recorded");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = snapshots.tick() => {
                journal.write_latest(&store.snapshot())?;
                journal.maybe_prune()?;
            }
        }
    }

    while let Ok(change) = writes.try_recv() {
        journal.record(&change, Utc::now())?;
    }
    journal.write_latest(&store.snapshot())?;
    info!(dir = %journal.out_dir.display(), "state journal closed");
    Ok(())
}

pub struct StateJournal {
    out_dir: PathBuf,
    retention_days: u64,
    current_day: String,
    writer: BufWriter<File>,
    last_prune: Instant,
}

impl StateJournal {
    pub fn open(out_dir: &Path, retention_days: u64) -> Result<Self> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("creating state directory {}", out_dir.display()))?;
        let day = Utc::now().format("%Y-%m-%d").to_string();
        let writer = Self::open_writer(out_dir, &day)?;

        Ok(Self {
            out_dir: out_dir.to_path_buf(),
            retention_days,
            current_day: day,
            writer,
            last_prune: Instant::now() - PRUNE_EVERY,
        })
    }

    fn open_writer(out_dir: &Path, day: &str) -> Result<BufWriter<File>> {
        let path = out_dir.join(format!("{JOURNAL_PREFIX}{day}{JOURNAL_SUFFIX}"));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(BufWriter::new(file))
    }

    fn rotate_if_needed(&mut self, ts: DateTime<Utc>) -> Result<()> {
        let day = ts.format("%Y-%m-%d").to_string();
        if day != self.current_day {
            self.writer.flush()?;
            self.writer = Self::open_writer(&self.out_dir, &day)?;
            self.current_day = day;
        }
        Ok(())
    }

    pub fn record(&mut self, change: &StateChange, ts: DateTime<Utc>) -> Result<()> {
        self.rotate_if_needed(ts)?;

        let line = serde_json::json!({
            "ts": ts,
            "unix_ms": ts.timestamp_millis(),
            "path": change.path,
            "value": change.value,
            "ack": change.ack,
        });
        serde_json::to_writer(&mut self.writer, &line)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn write_latest(&self, snapshot: &BTreeMap<String, StateEntry>) -> Result<()> {
        let path = self.out_dir.join(LATEST_FILE);
        fs::write(&path, serde_json::to_vec_pretty(snapshot)?)
            .with_context(|| format!("writing {}", path.display()))?;
        debug!(states = snapshot.len(), "state snapshot written");
        Ok(())
    }

    fn maybe_prune(&mut self) -> Result<()> {
        if self.last_prune.elapsed() < PRUNE_EVERY {
            return Ok(());
        }
        self.last_prune = Instant::now();

        prune_old_journal_files(&self.out_dir, self.retention_days, SystemTime::now())
    }
}

/// Loads `latest.json` into the store. Returns the number of states restored.
pub fn restore_latest(out_dir: &Path, store: &MemoryStore) -> Result<usize> {
    let path = out_dir.join(LATEST_FILE);
    if !path.exists() {
        return Ok(0);
    }
    let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    let entries: BTreeMap<String, StateEntry> =
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
    let restored = entries.len();
    store.restore(entries);
    Ok(restored)
}

pub(crate) fn prune_old_journal_files(out_dir: &Path, retention_days: u64, now: SystemTime) -> Result<()> {
    let today = DateTime::<Utc>::from(now).date_naive();
    let cutoff = today
        .checked_sub_days(Days::new(retention_days))
        .unwrap_or(today);

    for entry in fs::read_dir(out_dir)? {
        let path = entry?.path();
        let Some(date_part) = path
            .file_name()
            .and_then(|v| v.to_str())
            .and_then(|n| n.strip_prefix(JOURNAL_PREFIX))
            .and_then(|n| n.strip_suffix(JOURNAL_SUFFIX))
        else {
            continue;
        };

        let Ok(file_date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };

        if file_date < cutoff {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "old journal removed"),
                Err(err) => warn!(path = %path.display(), error = %err, "could not remove old journal"),
            }
        }
    }

    Ok(())
}
