//! Retention-driven collapse of the oldest full-plus-incrementals span
//! once a chain outgrows its horizon.

use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

use crate::chain::BackupChain;
use crate::types::BackupTarget;

/// Remove directly-empty subdirectories left behind by pruning or by
/// error-path round directories. Best effort; a failed removal is not
/// worth failing the run over.
pub async fn reclaim_empty_dirs(dir: &Path) {
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let empty = match fs::read_dir(&path).await {
            Ok(mut sub) => matches!(sub.next_entry().await, Ok(None)),
            Err(_) => false,
        };
        if empty {
            debug!("Removing empty backup directory {}", path.display());
            let _ = fs::remove_dir(&path).await;
        }
    }
}

/// Collapse `[oldest_full, second_oldest_full)` when the chain holds more
/// entries than the retention horizon allows. The newer full becomes the
/// new chain base; nothing at or after it is ever touched.
pub async fn apply_retention(
    backup_root: &Path,
    target: &BackupTarget,
    chain: &BackupChain,
    retention_weeks: u32,
) -> Result<()> {
    let Some((start, end)) = chain.prune_window(retention_weeks) else {
        return Ok(());
    };

    info!(
        "Chain of {} exceeds the {}-week retention horizon, pruning backup sets in [{}, {})",
        target.name, retention_weeks, start, end
    );

    let target_dir = backup_root.join(&target.folder);
    for set in &chain.sets {
        if set.date.as_str() >= start.as_str() && set.date.as_str() < end.as_str() {
            let dir = target_dir.join(&set.date);
            info!("Pruning expired backup set {}", dir.display());
            fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("Cannot prune backup set {}", dir.display()))?;
        }
    }

    reclaim_empty_dirs(&target_dir).await;
    Ok(())
}
