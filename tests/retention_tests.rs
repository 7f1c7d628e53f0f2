//! Tests for the retention horizon: when a chain collapses, exactly which
//! backup sets are pruned and which survive.

use std::fs;
use std::path::Path;
use tempfile::TempDir;

use rbd_backup::chain::load_chain;
use rbd_backup::operations::pruning::{apply_retention, reclaim_empty_dirs};
use rbd_backup::types::BackupTarget;

const FOLDER: &str = "test-instance_9e107d9d";

fn make_set(root: &Path, date: &str, files: &[&str]) {
    let dir = root.join(FOLDER).join(date);
    fs::create_dir_all(&dir).unwrap();
    for file in files {
        fs::write(dir.join(file), b"image data").unwrap();
    }
    fs::write(dir.join("status"), "0\n").unwrap();
}

fn target() -> BackupTarget {
    BackupTarget {
        folder: FOLDER.to_string(),
        name: "test-instance".to_string(),
        tenant: "acme".to_string(),
        domain: None,
        images: vec!["abc_disk".to_string()],
    }
}

/// Full backups at D1 < D2 < D3 with incrementals in between; ten entries
/// total so a zero-week horizon (limit 7) is exceeded.
fn populate_three_spans(root: &Path) -> Vec<String> {
    let dates = vec![
        ("2024-01-01-03-00", "full_abc_disk"),
        ("2024-01-02-03-00", "inc_abc_disk"),
        ("2024-01-03-03-00", "inc_abc_disk"),
        ("2024-01-04-03-00", "full_abc_disk"),
        ("2024-01-05-03-00", "inc_abc_disk"),
        ("2024-01-06-03-00", "inc_abc_disk"),
        ("2024-01-07-03-00", "full_abc_disk"),
        ("2024-01-08-03-00", "inc_abc_disk"),
        ("2024-01-09-03-00", "inc_abc_disk"),
        ("2024-01-10-03-00", "inc_abc_disk"),
    ];
    for (date, file) in &dates {
        make_set(root, date, &[file]);
    }
    dates.iter().map(|(d, _)| d.to_string()).collect()
}

#[test]
fn no_window_while_chain_fits_horizon() {
    let root = TempDir::new().unwrap();
    make_set(root.path(), "2024-01-01-03-00", &["full_abc_disk"]);
    make_set(root.path(), "2024-01-02-03-00", &["inc_abc_disk"]);
    make_set(root.path(), "2024-01-03-03-00", &["full_abc_disk"]);

    let chain = load_chain(root.path(), FOLDER).unwrap();
    // Three entries, limit 7*(0+1): nothing to prune yet.
    assert_eq!(chain.prune_window(0), None);
}

#[test]
fn no_window_without_second_full() {
    let root = TempDir::new().unwrap();
    make_set(root.path(), "2024-01-01-03-00", &["full_abc_disk"]);
    for day in 2..=9 {
        make_set(
            root.path(),
            &format!("2024-01-{:02}-03-00", day),
            &["inc_abc_disk"],
        );
    }

    let chain = load_chain(root.path(), FOLDER).unwrap();
    assert_eq!(chain.sets.len(), 9);
    // Over budget but only one full: no safe collapse point.
    assert_eq!(chain.prune_window(0), None);
}

#[test]
fn window_spans_two_oldest_fulls() {
    let root = TempDir::new().unwrap();
    populate_three_spans(root.path());

    let chain = load_chain(root.path(), FOLDER).unwrap();
    assert_eq!(
        chain.prune_window(0),
        Some(("2024-01-01-03-00".to_string(), "2024-01-04-03-00".to_string()))
    );
}

#[tokio::test]
async fn retention_removes_exactly_the_oldest_span() {
    let root = TempDir::new().unwrap();
    let dates = populate_three_spans(root.path());

    let chain = load_chain(root.path(), FOLDER).unwrap();
    apply_retention(root.path(), &target(), &chain, 0)
        .await
        .unwrap();

    let target_dir = root.path().join(FOLDER);
    // [D1, D2) is gone: the oldest full and its trailing incrementals.
    for gone in &dates[..3] {
        assert!(!target_dir.join(gone).exists(), "{} should be pruned", gone);
    }
    // D2 is the new base; it and everything after survive.
    for kept in &dates[3..] {
        assert!(target_dir.join(kept).exists(), "{} should survive", kept);
    }
}

#[tokio::test]
async fn retention_is_a_noop_within_horizon() {
    let root = TempDir::new().unwrap();
    let dates = populate_three_spans(root.path());

    let chain = load_chain(root.path(), FOLDER).unwrap();
    // Ten entries fit a one-week horizon (limit 14).
    apply_retention(root.path(), &target(), &chain, 1)
        .await
        .unwrap();

    let target_dir = root.path().join(FOLDER);
    for date in &dates {
        assert!(target_dir.join(date).exists());
    }
}

#[tokio::test]
async fn empty_directories_are_reclaimed() {
    let root = TempDir::new().unwrap();
    let target_dir = root.path().join(FOLDER);
    fs::create_dir_all(target_dir.join("2024-01-01-03-00")).unwrap();
    make_set(root.path(), "2024-01-02-03-00", &["full_abc_disk"]);

    reclaim_empty_dirs(&target_dir).await;

    assert!(!target_dir.join("2024-01-01-03-00").exists());
    assert!(target_dir.join("2024-01-02-03-00").exists());
}
