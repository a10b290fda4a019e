use crate::journal::{prune_old_journal_files, restore_latest, StateJournal};
use chrono::{TimeZone, Utc};
use easee_core::{MemoryStore, StateChange, StateDefinition, StateStore};
use easee_core::fields::ValueKind;
use serde_json::json;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

fn make_temp_dir(name: &str) -> PathBuf {
    let mut path = env::temp_dir();
    let uniq = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("unix epoch")
        .as_nanos();
    path.push(format!("easeed-tests-{name}-{uniq}"));
    fs::create_dir_all(&path).expect("create temp dir");
    path
}

fn at(year: i32, month: u32, day: u32) -> SystemTime {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .single()
        .expect("valid date")
        .into()
}

#[test]
fn prune_removes_only_old_journals() {
    // Arrange
    let dir = make_temp_dir("old-vs-fresh");
    let old_journal = dir.join("states-2025-11-16.jsonl");
    let fresh_journal = dir.join("states-2026-02-15.jsonl");
    let latest = dir.join("latest.json");
    fs::write(&old_journal, "old").expect("write old journal");
    fs::write(&fresh_journal, "fresh").expect("write fresh journal");
    fs::write(&latest, "{}").expect("write snapshot");

    // Act
    prune_old_journal_files(&dir, 90, at(2026, 2, 15)).expect("prune");

    // Assert
    assert!(!old_journal.exists(), "old journal should be pruned");
    assert!(fresh_journal.exists(), "fresh journal should be kept");
    assert!(latest.exists(), "snapshot should never be pruned");

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn prune_keeps_boundary_age_journal() {
    // Arrange
    let dir = make_temp_dir("boundary");
    let boundary = dir.join("states-2025-11-17.jsonl");
    fs::write(&boundary, "boundary").expect("write boundary journal");

    // Act
    prune_old_journal_files(&dir, 90, at(2026, 2, 15)).expect("prune");

    // Assert
    assert!(boundary.exists(), "journal exactly on retention boundary should be kept");

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn records_rotate_into_daily_files() {
    // Arrange
    let dir = make_temp_dir("rotate");
    let mut journal = StateJournal::open(&dir, 90).expect("open journal");
    let change = StateChange {
        path: "EH1.status.voltage".to_string(),
        value: json!(230.5),
        ack: true,
    };
    let first = Utc.with_ymd_and_hms(2026, 3, 1, 23, 59, 0).single().expect("date");
    let second = Utc.with_ymd_and_hms(2026, 3, 2, 0, 1, 0).single().expect("date");

    // Act
    journal.record(&change, first).expect("record first");
    journal.record(&change, second).expect("record second");

    // Assert
    let day_two = fs::read_to_string(dir.join("states-2026-03-02.jsonl")).expect("second day journal");
    let line: serde_json::Value = serde_json::from_str(day_two.trim()).expect("ndjson line");
    assert_eq!(line["path"], "EH1.status.voltage");
    assert_eq!(line["value"], json!(230.5));
    assert_eq!(line["ack"], json!(true));
    let day_one = fs::read_to_string(dir.join("states-2026-03-01.jsonl")).expect("first day journal");
    assert_eq!(day_one.lines().count(), 1);

    let _ = fs::remove_dir_all(dir);
}

#[tokio::test]
async fn latest_snapshot_restores_into_a_fresh_store() {
    // Arrange
    let dir = make_temp_dir("restore");
    let store = MemoryStore::new();
    store
        .ensure_definition(
            "EH1.config.phaseMode",
            StateDefinition::read_only("Phase mode", ValueKind::Number, "value"),
        )
        .await
        .expect("definition");
    store
        .write_value("EH1.config.phaseMode", json!(2), true)
        .await
        .expect("write");
    let journal = StateJournal::open(&dir, 90).expect("open journal");
    journal.write_latest(&store.snapshot()).expect("write latest");

    // Act
    let restored_store = MemoryStore::new();
    let restored = restore_latest(&dir, &restored_store).expect("restore");

    // Assert
    assert_eq!(restored, 1);
    assert_eq!(restored_store.value("EH1.config.phaseMode"), Some(json!(2)));
    assert_eq!(restore_latest(&make_temp_dir("empty"), &MemoryStore::new()).expect("no snapshot"), 0);

    let _ = fs::remove_dir_all(dir);
}
