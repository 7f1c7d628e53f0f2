//! One consistency round: a shared-timestamp snapshot of every image
//! belonging to a target, quiesced when the guest allows it.

use chrono::Local;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::constants::{naming, pacing};
use crate::services::guest::GuestClient;
use crate::services::rbd::RbdClient;
use crate::types::{BackupTarget, RoundConsistency, SnapshotEntry, SnapshotRoundReport};

/// Timestamp shared by all snapshots of one round. Computed once so the
/// images form a single consistency group even though physical creation is
/// not atomic across images.
pub fn round_stamp() -> String {
    Local::now().format(naming::TIME_FORMAT).to_string()
}

/// A second invocation within the same timestamp bucket finds the round's
/// snapshot already present and must not create a duplicate.
pub fn already_snapshotted(snapshots: &[SnapshotEntry], stamp: &str) -> bool {
    snapshots.iter().any(|s| s.name == stamp)
}

/// Create the round's snapshot on one image, skipping work already done.
async fn snapshot_image(rbd: &RbdClient, image: &str, stamp: &str) -> anyhow::Result<()> {
    let snapshots = rbd.snapshots_sorted(image).await?;
    if already_snapshotted(&snapshots, stamp) {
        info!("-- Snapshot {} already exists on {}, skipping", stamp, image);
        return Ok(());
    }
    info!("-- Snapshotting {}", image);
    rbd.snap_create(image, stamp).await
}

async fn snapshot_all(
    rbd: &RbdClient,
    images: &[String],
    stamp: &str,
    gap: std::time::Duration,
) -> Vec<String> {
    let mut failed = Vec::new();
    for image in images {
        sleep(gap).await;
        if let Err(e) = snapshot_image(rbd, image, stamp).await {
            error!("Snapshot of {} failed: {}", image, e);
            failed.push(image.clone());
        }
    }
    failed
}

/// Run one snapshot round for a target.
///
/// Quiesces through the guest agent when the domain is running and the
/// agent answers; a freeze failure degrades the whole round to
/// crash-consistent snapshots instead of leaving images unattempted. Thaw
/// always runs once freeze succeeded, whatever the per-image outcomes.
pub async fn take_snapshot_round(
    rbd: &RbdClient,
    guest: &GuestClient,
    target: &BackupTarget,
    stamp: &str,
) -> SnapshotRoundReport {
    info!("Taking RBD snapshots of {}", target.name);

    let quiesce_domain = match &target.domain {
        Some(domain) => {
            let active = match guest.is_active(domain).await {
                Ok(active) => active,
                Err(e) => {
                    warn!("Cannot query state of {}: {}", domain, e);
                    false
                }
            };
            if !active {
                info!("Instance {} is powered off, quiescing not needed", target.name);
                None
            } else if !guest.agent_available(domain).await {
                warn!(
                    "Guest agent not available on {}, quiescing disabled, snapshots will be crash-consistent",
                    target.name
                );
                None
            } else {
                Some(domain.as_str())
            }
        }
        None => {
            info!(
                "{} has no guest domain, taking crash-consistent snapshots",
                target.name
            );
            None
        }
    };

    let (consistency, failed_images) = match quiesce_domain {
        Some(domain) => match guest.freeze(domain).await {
            Ok(()) => {
                info!("Froze filesystems of {}", target.name);
                sleep(pacing::AFTER_FREEZE).await;
                let failed =
                    snapshot_all(rbd, &target.images, stamp, pacing::QUIESCED_IMAGE_GAP).await;
                if let Err(e) = guest.thaw(domain).await {
                    // The guest stays frozen until the agent's own timeout
                    // kicks in; nothing more we can do from here.
                    error!("Thawing {} failed: {}", target.name, e);
                } else {
                    info!("Thawed filesystems of {}", target.name);
                }
                (RoundConsistency::Quiesced, failed)
            }
            Err(e) => {
                warn!("Error occurred while freezing {}: {}", target.name, e);
                warn!("Falling back to non-quiesced snapshots!");
                let failed = snapshot_all(rbd, &target.images, stamp, pacing::IMAGE_GAP).await;
                (RoundConsistency::CrashConsistent, failed)
            }
        },
        None => {
            let failed = snapshot_all(rbd, &target.images, stamp, pacing::IMAGE_GAP).await;
            (RoundConsistency::CrashConsistent, failed)
        }
    };

    info!("Snapshots finished for {}", target.name);

    if !failed_images.is_empty() && failed_images.len() == target.images.len() {
        return SnapshotRoundReport {
            consistency: RoundConsistency::Failed(format!(
                "No image of {} could be snapshotted",
                target.name
            )),
            failed_images,
        };
    }

    SnapshotRoundReport {
        consistency,
        failed_images,
    }
}
