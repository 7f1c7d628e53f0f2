//! Full and incremental export of a target's images into one dated
//! backup-set directory, plus the inverse import primitives.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{error, info, warn};

use crate::chain::BackupChain;
use crate::constants::naming;
use crate::operations::pruning;
use crate::services::rbd::RbdClient;
use crate::types::{BackupTarget, ExportKind, ExportReport};

async fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Cannot create backup directory {}", dir.display()))
}

/// Persist the aggregate per-image failure count. This marker is the sole
/// success indicator later runs read back.
async fn write_status(dir: &Path, failures: u32) -> Result<()> {
    let path = dir.join(naming::STATUS_FILE);
    fs::write(&path, format!("{}\n", failures))
        .await
        .with_context(|| format!("Cannot write status marker {}", path.display()))
}

/// Export every image of the target at its newest snapshot.
///
/// Failures are per-image: counted, logged and skipped past, never
/// aborting the round. On a successful transfer all snapshots older than
/// the newest are deleted; the newest stays as the next diff anchor. On a
/// failed transfer snapshots are left untouched and the destination file
/// is kept for diagnosis.
pub async fn export_round(
    rbd: &RbdClient,
    backup_root: &Path,
    target: &BackupTarget,
    chain: &BackupChain,
    kind: ExportKind,
    stamp: &str,
) -> Result<ExportReport> {
    let target_dir = backup_root.join(&target.folder);
    let mut report = ExportReport::default();
    let mut round_dir: Option<PathBuf> = None;

    for image in &target.images {
        let snaps = match rbd.snapshots_sorted(image).await {
            Ok(snaps) => snaps,
            Err(e) => {
                error!("Cannot list snapshots of {}: {}", image, e);
                report.failures += 1;
                continue;
            }
        };

        if snaps.is_empty() {
            error!(
                "No proper snapshots found for image {}! Backup is not possible!",
                image
            );
            let dir = target_dir.join(stamp);
            ensure_dir(&dir).await?;
            round_dir = Some(dir);
            report.failures += 1;
            continue;
        }

        let newest = &snaps[snaps.len() - 1];
        let dir = target_dir.join(&newest.name);
        ensure_dir(&dir).await?;
        round_dir = Some(dir.clone());

        if let Ok(true) = rbd.is_clone(image).await {
            warn!(
                "Image {} is a clone; the export covers the child layer only",
                image
            );
        }

        let result = match kind {
            ExportKind::Full => {
                info!("Export RBD image {}", image);
                let dest = dir.join(format!("{}{}", naming::FULL_PREFIX, image));
                let dest_str = dest.to_string_lossy().to_string();
                rbd.export(image, &newest.name, &dest_str).await.map(|_| dest)
            }
            ExportKind::Incremental => {
                if snaps.len() == 1 {
                    error!(
                        "Only one snapshot found for image {}! Incremental backup is not possible!",
                        image
                    );
                    report.failures += 1;
                    continue;
                }
                let Some(from_snap) = chain.find_ancestor_snapshot(image, &snaps) else {
                    error!(
                        "DANGER! No previous backups found for current snapshots of {}! Backup chain is likely broken",
                        image
                    );
                    report.failures += 1;
                    continue;
                };
                info!("Export-diff RBD image {} ({} -> {})", image, from_snap, newest.name);
                let dest = dir.join(format!("{}{}", naming::INC_PREFIX, image));
                let dest_str = dest.to_string_lossy().to_string();
                rbd.export_diff(image, &from_snap, &newest.name, &dest_str)
                    .await
                    .map(|_| dest)
            }
        };

        match result {
            Ok(dest) => {
                info!(
                    "{} backup of {} successfully finished",
                    kind.as_str(),
                    image
                );
                report.files_written.push(dest);
                for snap in &snaps[..snaps.len() - 1] {
                    if let Err(e) = rbd.snap_remove(image, &snap.name).await {
                        warn!("Cannot remove old snapshot {}@{}: {}", image, snap.name, e);
                    }
                }
            }
            Err(e) => {
                error!("RBD export of {} failed: {}", image, e);
                report.failures += 1;
            }
        }
    }

    if let Some(dir) = &round_dir {
        write_status(dir, report.failures).await?;
    }
    pruning::reclaim_empty_dirs(&target_dir).await;

    Ok(report)
}

/// Replay a full export into an image. Used by the restore sequencer; a
/// non-zero exit status surfaces so the caller can abort the sequence.
pub async fn import_full(rbd: &RbdClient, image: &str, file: &Path) -> Result<()> {
    info!("Importing {} into {}", file.display(), image);
    rbd.import(image, &file.to_string_lossy()).await
}

/// Replay a diff export on top of an already-restored image.
pub async fn import_diff(rbd: &RbdClient, image: &str, file: &Path) -> Result<()> {
    info!("Importing diff {} into {}", file.display(), image);
    rbd.import_diff(image, &file.to_string_lossy()).await
}
