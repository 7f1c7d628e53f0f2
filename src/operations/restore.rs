//! In-place restore: replay a chain prefix onto renamed-aside images, then
//! re-anchor the chain so future incrementals have a valid base.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{error, info, warn};

use crate::chain::{self, RestoreStep};
use crate::constants::naming;
use crate::operations::export;
use crate::services::guest::GuestClient;
use crate::services::rbd::RbdClient;
use crate::types::{BackupTarget, ExportKind};

fn bak_name(image: &str) -> String {
    format!("{}{}", image, naming::BAK_SUFFIX)
}

/// Delete an image together with all its snapshots.
async fn delete_image_fully(rbd: &RbdClient, image: &str) -> Result<()> {
    rbd.remove_all_snapshots(image).await?;
    rbd.remove_image(image).await
}

async fn replay(rbd: &RbdClient, plan: &[RestoreStep]) -> Result<()> {
    for step in plan {
        match step.kind {
            ExportKind::Full => {
                for item in &step.items {
                    let bak = bak_name(&item.image);
                    if rbd.image_exists(&bak).await? {
                        // Leftover safety copy from an earlier restore.
                        delete_image_fully(rbd, &bak).await?;
                    }
                    info!("Moving live image {} aside as {}", item.image, bak);
                    rbd.rename(&item.image, &bak).await?;
                    export::import_full(rbd, &item.image, &item.file)
                        .await
                        .with_context(|| format!("Full import of {} failed", item.image))?;
                    // Recreate the snapshot this backup was taken from, so
                    // the restored image rejoins the chain as a diff base.
                    rbd.snap_create(&item.image, &step.date).await?;
                }
            }
            ExportKind::Incremental => {
                for item in &step.items {
                    export::import_diff(rbd, &item.image, &item.file)
                        .await
                        .with_context(|| format!("Diff import of {} failed", item.image))?;
                }
            }
        }
    }
    Ok(())
}

/// Restore one target to an exact backup date.
///
/// The instance is powered off for the replay and powered back on whatever
/// the outcome; leaving it off after a failed restore would be a second
/// failure on top of the first.
pub async fn restore_target_inplace(
    rbd: &RbdClient,
    guest: &GuestClient,
    backup_root: &Path,
    target: &BackupTarget,
    restore_date: &str,
) -> Result<()> {
    info!(
        "Performing inplace restore of {} to date {}",
        target.name, restore_date
    );

    let loaded = chain::load_chain(backup_root, &target.folder)?;
    let plan = chain::build_restore_plan(&loaded, restore_date, &target.images)?;

    if let Some(domain) = &target.domain {
        guest.power_off(domain).await?;
    }

    let result = replay(rbd, &plan).await;

    if let Some(domain) = &target.domain {
        info!("Starting instance after the restore");
        if let Err(e) = guest.power_on(domain).await {
            match &result {
                // The replay error is the primary failure; report the
                // power-on problem without masking it.
                Err(_) => error!("Could not restart {} after failed restore: {}", domain, e),
                Ok(()) => return Err(e),
            }
        }
    }

    result
}

/// Every `.bak` image left in the pools is a stale restore placeholder;
/// remove them with their snapshots. Runs at the end of every invocation.
pub async fn sweep_stale_bak_images(rbd: &RbdClient) {
    let stale = match rbd.stale_bak_images().await {
        Ok(stale) => stale,
        Err(e) => {
            warn!("Cannot list pools for stale image cleanup: {}", e);
            return;
        }
    };

    for image in stale {
        info!("Cleaning up stale restore placeholder {}", image);
        if let Err(e) = delete_image_fully(rbd, &image).await {
            warn!("Cleanup of {} failed: {}", image, e);
        }
    }
}
