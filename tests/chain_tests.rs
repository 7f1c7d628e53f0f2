//! Tests for backup-chain derivation from the on-disk layout: set
//! classification, status handling, backup-type decisions and ancestor
//! snapshot lookup.

use std::fs;
use std::path::Path;
use tempfile::TempDir;
use test_case::test_case;

use rbd_backup::chain::{load_chain, BackupChain};
use rbd_backup::types::{ExportKind, SetKind, SetStatus, SnapshotEntry};

const FOLDER: &str = "test-instance_9e107d9d";

/// Create one dated backup-set directory with the given files and an
/// optional status marker content.
fn make_set(root: &Path, date: &str, files: &[&str], status: Option<&str>) {
    let dir = root.join(FOLDER).join(date);
    fs::create_dir_all(&dir).unwrap();
    for file in files {
        fs::write(dir.join(file), b"image data").unwrap();
    }
    if let Some(status) = status {
        fs::write(dir.join("status"), status).unwrap();
    }
}

fn snaps(names: &[&str]) -> Vec<SnapshotEntry> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| SnapshotEntry {
            id: i as u64 + 1,
            name: name.to_string(),
        })
        .collect()
}

#[test]
fn classifies_full_set() {
    let root = TempDir::new().unwrap();
    make_set(root.path(), "2024-01-01-03-00", &["full_abc_disk"], Some("0\n"));

    let chain = load_chain(root.path(), FOLDER).unwrap();
    assert_eq!(chain.sets.len(), 1);
    assert_eq!(chain.sets[0].kind, SetKind::Full);
    assert_eq!(chain.sets[0].status, SetStatus::Ok);
}

#[test]
fn classifies_incremental_set() {
    let root = TempDir::new().unwrap();
    make_set(
        root.path(),
        "2024-01-02-03-00",
        &["inc_abc_disk", "inc_volume-11aa"],
        Some("0\n"),
    );

    let chain = load_chain(root.path(), FOLDER).unwrap();
    assert_eq!(chain.sets[0].kind, SetKind::Incremental);
    assert_eq!(chain.sets[0].files.len(), 2);
}

#[test]
fn set_with_both_kinds_is_flagged_invalid() {
    let root = TempDir::new().unwrap();
    make_set(
        root.path(),
        "2024-01-01-03-00",
        &["full_abc_disk", "inc_abc_disk"],
        Some("0\n"),
    );

    let chain = load_chain(root.path(), FOLDER).unwrap();
    assert_eq!(chain.sets[0].kind, SetKind::Mixed);
    // An incoherent set must never count as a usable full base.
    assert!(!chain.full_backup_exists());
}

#[test]
fn dated_dir_without_image_files_is_empty() {
    let root = TempDir::new().unwrap();
    make_set(root.path(), "2024-01-01-03-00", &[], Some("1\n"));

    let chain = load_chain(root.path(), FOLDER).unwrap();
    assert_eq!(chain.sets[0].kind, SetKind::Empty);
    assert_eq!(chain.sets[0].status, SetStatus::Error);
}

#[test_case(Some("0\n"), SetStatus::Ok ; "zero means ok")]
#[test_case(Some("2\n"), SetStatus::Error ; "failure count means error")]
#[test_case(None, SetStatus::Error ; "missing marker means error")]
fn status_marker_parsing(status: Option<&str>, expected: SetStatus) {
    let root = TempDir::new().unwrap();
    make_set(root.path(), "2024-01-01-03-00", &["full_abc_disk"], status);

    let chain = load_chain(root.path(), FOLDER).unwrap();
    assert_eq!(chain.sets[0].status, expected);
}

#[test]
fn non_date_directories_are_ignored() {
    let root = TempDir::new().unwrap();
    make_set(root.path(), "2024-01-01-03-00", &["full_abc_disk"], Some("0\n"));
    fs::create_dir_all(root.path().join(FOLDER).join("scratch")).unwrap();

    let chain = load_chain(root.path(), FOLDER).unwrap();
    assert_eq!(chain.sets.len(), 1);
}

#[test]
fn missing_folder_yields_empty_chain() {
    let root = TempDir::new().unwrap();
    let chain = load_chain(root.path(), FOLDER).unwrap();
    assert!(chain.sets.is_empty());
}

#[test]
fn sets_are_ordered_by_date() {
    let root = TempDir::new().unwrap();
    make_set(root.path(), "2024-01-03-03-00", &["inc_abc_disk"], Some("0\n"));
    make_set(root.path(), "2024-01-01-03-00", &["full_abc_disk"], Some("0\n"));
    make_set(root.path(), "2024-01-02-03-00", &["inc_abc_disk"], Some("0\n"));

    let chain = load_chain(root.path(), FOLDER).unwrap();
    let dates: Vec<&str> = chain.sets.iter().map(|s| s.date.as_str()).collect();
    assert_eq!(
        dates,
        vec!["2024-01-01-03-00", "2024-01-02-03-00", "2024-01-03-03-00"]
    );
}

#[test]
fn failed_full_does_not_count_as_base() {
    let root = TempDir::new().unwrap();
    make_set(root.path(), "2024-01-01-03-00", &["full_abc_disk"], Some("1\n"));

    let chain = load_chain(root.path(), FOLDER).unwrap();
    assert!(!chain.full_backup_exists());
    // And a requested incremental is promoted accordingly.
    assert_eq!(
        chain.decide_export_kind(ExportKind::Incremental, "test-instance"),
        ExportKind::Full
    );
}

#[test]
fn incremental_request_without_full_promotes_to_full() {
    let chain = BackupChain::default();
    assert_eq!(
        chain.decide_export_kind(ExportKind::Incremental, "test-instance"),
        ExportKind::Full
    );
    assert_eq!(
        chain.decide_export_kind(ExportKind::Full, "test-instance"),
        ExportKind::Full
    );
}

#[test]
fn incremental_request_with_full_base_is_honored() {
    let root = TempDir::new().unwrap();
    make_set(root.path(), "2024-01-01-03-00", &["full_abc_disk"], Some("0\n"));

    let chain = load_chain(root.path(), FOLDER).unwrap();
    assert_eq!(
        chain.decide_export_kind(ExportKind::Incremental, "test-instance"),
        ExportKind::Incremental
    );
}

#[test]
fn ancestor_is_nearest_prior_snapshot_with_backup() {
    let root = TempDir::new().unwrap();
    make_set(root.path(), "2024-01-01-03-00", &["full_abc_disk"], Some("0\n"));
    make_set(root.path(), "2024-01-02-03-00", &["inc_abc_disk"], Some("0\n"));
    let chain = load_chain(root.path(), FOLDER).unwrap();

    let snapshots = snaps(&["2024-01-01-03-00", "2024-01-02-03-00", "2024-01-03-03-00"]);
    // The second-newest snapshot has a captured backup, so the walk must
    // stop there and not fall through to the older full.
    assert_eq!(
        chain.find_ancestor_snapshot("abc_disk", &snapshots),
        Some("2024-01-02-03-00".to_string())
    );
}

#[test]
fn ancestor_walks_past_uncaptured_snapshots() {
    let root = TempDir::new().unwrap();
    make_set(root.path(), "2024-01-01-03-00", &["full_abc_disk"], Some("0\n"));
    let chain = load_chain(root.path(), FOLDER).unwrap();

    // 2024-01-02 was snapshotted but never exported by any round.
    let snapshots = snaps(&["2024-01-01-03-00", "2024-01-02-03-00", "2024-01-03-03-00"]);
    assert_eq!(
        chain.find_ancestor_snapshot("abc_disk", &snapshots),
        Some("2024-01-01-03-00".to_string())
    );
}

#[test]
fn ancestor_skips_failed_backup_sets() {
    let root = TempDir::new().unwrap();
    make_set(root.path(), "2024-01-01-03-00", &["full_abc_disk"], Some("0\n"));
    make_set(root.path(), "2024-01-02-03-00", &["inc_abc_disk"], Some("1\n"));
    let chain = load_chain(root.path(), FOLDER).unwrap();

    let snapshots = snaps(&["2024-01-01-03-00", "2024-01-02-03-00", "2024-01-03-03-00"]);
    // The nearer candidate recorded a failure and must not become a diff
    // base; the walk continues to the older good set.
    assert_eq!(
        chain.find_ancestor_snapshot("abc_disk", &snapshots),
        Some("2024-01-01-03-00".to_string())
    );
}

#[test]
fn ancestor_requires_matching_image_file() {
    let root = TempDir::new().unwrap();
    make_set(
        root.path(),
        "2024-01-01-03-00",
        &["full_volume-11aa"],
        Some("0\n"),
    );
    let chain = load_chain(root.path(), FOLDER).unwrap();

    let snapshots = snaps(&["2024-01-01-03-00", "2024-01-02-03-00"]);
    // The set exists but covers a different image.
    assert_eq!(chain.find_ancestor_snapshot("abc_disk", &snapshots), None);
}

#[test]
fn ancestor_not_found_reports_broken_chain() {
    let chain = BackupChain::default();
    let snapshots = snaps(&["2024-01-01-03-00", "2024-01-02-03-00"]);
    assert_eq!(chain.find_ancestor_snapshot("abc_disk", &snapshots), None);
}

#[test]
fn ancestor_needs_two_snapshots() {
    let root = TempDir::new().unwrap();
    make_set(root.path(), "2024-01-01-03-00", &["full_abc_disk"], Some("0\n"));
    let chain = load_chain(root.path(), FOLDER).unwrap();

    let snapshots = snaps(&["2024-01-01-03-00"]);
    assert_eq!(chain.find_ancestor_snapshot("abc_disk", &snapshots), None);
}

#[test]
fn ancestor_ignores_incoherent_sets() {
    let root = TempDir::new().unwrap();
    make_set(root.path(), "2024-01-01-03-00", &["full_abc_disk"], Some("0\n"));
    make_set(
        root.path(),
        "2024-01-02-03-00",
        &["full_abc_disk", "inc_abc_disk"],
        Some("0\n"),
    );
    let chain = load_chain(root.path(), FOLDER).unwrap();

    let snapshots = snaps(&["2024-01-01-03-00", "2024-01-02-03-00", "2024-01-03-03-00"]);
    assert_eq!(
        chain.find_ancestor_snapshot("abc_disk", &snapshots),
        Some("2024-01-01-03-00".to_string())
    );
}
