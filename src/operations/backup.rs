//! Per-target backup sequence: snapshot round, export, retention.

use anyhow::Result;
use std::path::Path;
use tracing::{info, warn};

use crate::chain;
use crate::operations::{export, pruning, snapshots};
use crate::services::guest::GuestClient;
use crate::services::rbd::RbdClient;
use crate::types::{BackupTarget, ExportKind, RoundConsistency};

/// Run one backup round for a target and return the per-image failure
/// count (zero means the round is fully usable).
pub async fn backup_target(
    rbd: &RbdClient,
    guest: &GuestClient,
    backup_root: &Path,
    target: &BackupTarget,
    requested: ExportKind,
    retention_weeks: u32,
) -> Result<u32> {
    info!("================================================================================");
    let loaded = chain::load_chain(backup_root, &target.folder)?;
    let kind = loaded.decide_export_kind(requested, &target.name);

    if requested == ExportKind::Full {
        // An explicitly requested full round starts a fresh anchor: prior
        // snapshots are dropped before the new one is taken. A promoted
        // full keeps them, matching the incremental the operator asked for.
        info!("Taking full backup of instance {}", target.name);
        for image in &target.images {
            if let Err(e) = rbd.remove_all_snapshots(image).await {
                warn!("Cannot clear old snapshots of {}: {}", image, e);
            }
        }
    } else {
        info!(
            "Taking {} backup of instance {}",
            kind.as_str(),
            target.name
        );
    }

    let stamp = snapshots::round_stamp();
    let round = snapshots::take_snapshot_round(rbd, guest, target, &stamp).await;
    if let RoundConsistency::Failed(reason) = &round.consistency {
        warn!("Snapshot round for {} failed: {}", target.name, reason);
    }

    let report = export::export_round(rbd, backup_root, target, &loaded, kind, &stamp).await?;

    if report.failures == 0 {
        info!("Done");
        if kind == ExportKind::Full {
            // Retention only moves forward on a proven-good full round.
            let refreshed = chain::load_chain(backup_root, &target.folder)?;
            pruning::apply_retention(backup_root, target, &refreshed, retention_weeks).await?;
        }
    }

    info!("================================================================================");
    Ok(report.failures)
}
