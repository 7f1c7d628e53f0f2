//! Backup-chain state, re-derived from the on-disk layout on every run.
//!
//! The backup directory tree is the only durable store: one folder per
//! target, one dated subdirectory per round, `full_*`/`inc_*` image files
//! plus a `status` marker. Nothing here is cached between invocations.

use anyhow::{anyhow, Result};
use glob::glob;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::constants::naming;
use crate::types::{parse_stamp, ExportKind, SetKind, SetStatus, SnapshotEntry};

/// One dated backup-set directory, classified at load time.
#[derive(Debug, Clone)]
pub struct BackupSet {
    pub date: String,
    pub kind: SetKind,
    pub files: Vec<PathBuf>,
    pub status: SetStatus,
}

impl BackupSet {
    /// Whether this set contains an export of the given image.
    pub fn covers_image(&self, image: &str) -> bool {
        self.files.iter().any(|file| {
            file_image_name(file).map_or(false, |name| name == image)
        })
    }
}

/// All backup sets of one target, ordered by date ascending.
#[derive(Debug, Clone, Default)]
pub struct BackupChain {
    pub sets: Vec<BackupSet>,
}

/// Image file name without its `full_`/`inc_` prefix.
fn file_image_name(file: &Path) -> Option<&str> {
    let name = file.file_name()?.to_str()?;
    name.strip_prefix(naming::FULL_PREFIX)
        .or_else(|| name.strip_prefix(naming::INC_PREFIX))
}

fn glob_family(dir: &Path, pattern: &str) -> Vec<PathBuf> {
    let full_pattern = format!("{}/{}", dir.display(), pattern);
    match glob(&full_pattern) {
        Ok(entries) => entries.filter_map(|e| e.ok()).collect(),
        Err(_) => Vec::new(),
    }
}

fn read_status(dir: &Path) -> SetStatus {
    let status_path = dir.join(naming::STATUS_FILE);
    match fs::read_to_string(&status_path) {
        Ok(content) if content.trim() == "0" => SetStatus::Ok,
        _ => SetStatus::Error,
    }
}

/// Classify one dated directory by which glob families matched.
fn classify_set(dir: &Path, date: &str) -> BackupSet {
    let full_files: Vec<PathBuf> = [
        glob_family(dir, "full_*_disk"),
        glob_family(dir, "full_volume-*"),
    ]
    .concat();
    let inc_files: Vec<PathBuf> = [
        glob_family(dir, "inc_*_disk"),
        glob_family(dir, "inc_volume-*"),
    ]
    .concat();

    let status = read_status(dir);

    let (kind, files) = match (full_files.is_empty(), inc_files.is_empty()) {
        (false, true) => (SetKind::Full, full_files),
        (true, false) => (SetKind::Incremental, inc_files),
        (false, false) => {
            warn!(
                "Backup set {} contains both full and incremental files and cannot be trusted",
                dir.display()
            );
            (SetKind::Mixed, [full_files, inc_files].concat())
        }
        (true, true) => (SetKind::Empty, Vec::new()),
    };

    BackupSet {
        date: date.to_string(),
        kind,
        files,
        status,
    }
}

/// Derive the chain of one target from its folder under the backup root.
///
/// A missing folder is an empty chain, not an error: the first round of a
/// new target creates it.
pub fn load_chain(backup_root: &Path, folder: &str) -> Result<BackupChain> {
    let target_dir = backup_root.join(folder);
    let mut sets = Vec::new();

    if target_dir.is_dir() {
        for entry in fs::read_dir(&target_dir)
            .map_err(|e| anyhow!("Cannot read backup folder {}: {}", target_dir.display(), e))?
        {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if parse_stamp(&name).is_none() {
                continue;
            }
            sets.push(classify_set(&entry.path(), &name));
        }
    }

    // The timestamp format sorts lexicographically in date order.
    sets.sort_by(|a, b| a.date.cmp(&b.date));
    Ok(BackupChain { sets })
}

impl BackupChain {
    pub fn set_for_date(&self, date: &str) -> Option<&BackupSet> {
        self.sets.iter().find(|set| set.date == date)
    }

    /// Dates of full backup sets, ascending.
    pub fn full_dates(&self) -> Vec<&str> {
        self.sets
            .iter()
            .filter(|set| set.kind == SetKind::Full)
            .map(|set| set.date.as_str())
            .collect()
    }

    /// A usable full backup exists: kind full and recorded as successful.
    pub fn full_backup_exists(&self) -> bool {
        self.sets
            .iter()
            .any(|set| set.kind == SetKind::Full && set.status == SetStatus::Ok)
    }

    /// Honor the requested backup type, except that an incremental without
    /// any usable full base is meaningless and silently promotes to full.
    pub fn decide_export_kind(&self, requested: ExportKind, target_name: &str) -> ExportKind {
        match requested {
            ExportKind::Full => ExportKind::Full,
            ExportKind::Incremental => {
                if self.full_backup_exists() {
                    ExportKind::Incremental
                } else {
                    info!(
                        "No previous full backup found for {}, taking full backup instead of incremental",
                        target_name
                    );
                    ExportKind::Full
                }
            }
        }
    }

    /// Locate the diff base for an incremental export of `image`.
    ///
    /// Walks backward from the second-newest snapshot and returns the first
    /// one some completed round actually captured. A set whose status
    /// marker records a failure is not trusted as a base; it is skipped
    /// with a warning and the walk continues to an older snapshot.
    pub fn find_ancestor_snapshot(
        &self,
        image: &str,
        snapshots: &[SnapshotEntry],
    ) -> Option<String> {
        if snapshots.len() < 2 {
            return None;
        }
        for snap in snapshots[..snapshots.len() - 1].iter().rev() {
            match self.set_for_date(&snap.name) {
                Some(set) if set.kind == SetKind::Mixed => {
                    warn!(
                        "Skipping ancestor candidate {} for {}: backup set is incoherent",
                        snap.name, image
                    );
                }
                Some(set) if set.covers_image(image) => {
                    if set.status == SetStatus::Ok {
                        return Some(snap.name.clone());
                    }
                    warn!(
                        "Skipping ancestor candidate {} for {}: backup set recorded a failure",
                        snap.name, image
                    );
                }
                _ => {}
            }
        }
        None
    }

    /// Prune window once the chain outgrows the retention horizon: the
    /// half-open span between the two oldest full backups. `None` while the
    /// chain is still within budget or lacks a second full base.
    pub fn prune_window(&self, retention_weeks: u32) -> Option<(String, String)> {
        let limit = 7 * (retention_weeks as usize + 1);
        if self.sets.len() <= limit {
            return None;
        }
        let fulls = self.full_dates();
        if fulls.len() < 2 {
            return None;
        }
        Some((fulls[0].to_string(), fulls[1].to_string()))
    }
}

/// One replay step of a restore: all files of one backup set resolved to
/// their target images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreStep {
    pub date: String,
    pub kind: ExportKind,
    pub items: Vec<RestoreItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreItem {
    pub image: String,
    pub file: PathBuf,
}

/// Derive the ordered replay sequence for restoring `images` to
/// `target_date`: every set up to and including the target, ascending,
/// with per-file image resolution restricted to the requested images.
pub fn build_restore_plan(
    chain: &BackupChain,
    target_date: &str,
    images: &[String],
) -> Result<Vec<RestoreStep>> {
    if chain.set_for_date(target_date).is_none() {
        return Err(anyhow!("Invalid restore date was specified: {}", target_date));
    }

    let mut plan = Vec::new();
    for set in &chain.sets {
        if set.date.as_str() > target_date {
            continue;
        }
        let kind = match set.kind {
            SetKind::Full => ExportKind::Full,
            SetKind::Incremental => ExportKind::Incremental,
            SetKind::Mixed => {
                warn!(
                    "Restore skips incoherent backup set {} (mixed full and incremental files)",
                    set.date
                );
                continue;
            }
            SetKind::Empty => continue,
        };
        let items: Vec<RestoreItem> = set
            .files
            .iter()
            .filter_map(|file| {
                let name = file_image_name(file)?;
                images
                    .iter()
                    .find(|image| image.as_str() == name)
                    .map(|image| RestoreItem {
                        image: image.clone(),
                        file: file.clone(),
                    })
            })
            .collect();
        if !items.is_empty() {
            plan.push(RestoreStep {
                date: set.date.clone(),
                kind,
                items,
            });
        }
    }
    Ok(plan)
}
