//! Thin adapter over the `rbd` CLI.
//!
//! All cluster interaction goes through this client; commands are judged by
//! exit status and `--format json` output only.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::ClusterConfig;
use crate::constants::{naming, timeouts};
use crate::services::commands;
use crate::types::{parse_stamp, SnapshotEntry};

const RBD: &str = "rbd";

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    id: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawImageInfo {
    #[serde(default)]
    parent: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct RbdClient {
    vms_pool: String,
    volumes_pool: String,
}

impl RbdClient {
    pub fn new(cluster: &ClusterConfig) -> Self {
        Self {
            vms_pool: cluster.vms_pool.clone(),
            volumes_pool: cluster.volumes_pool.clone(),
        }
    }

    /// Map an image name to its pool via the naming convention.
    ///
    /// `<id>_disk` and `<id>_disk.bak` live in the instance pool,
    /// `volume-<id>` (with or without `.bak`) in the volume pool.
    pub fn pool_for(&self, image: &str) -> Result<&str> {
        if image.ends_with(naming::DISK_SUFFIX)
            || image.ends_with(&format!("{}{}", naming::DISK_SUFFIX, naming::BAK_SUFFIX))
        {
            Ok(&self.vms_pool)
        } else if image.starts_with(naming::VOLUME_PREFIX) {
            Ok(&self.volumes_pool)
        } else {
            Err(anyhow!("Image name {} matches no known pool convention", image))
        }
    }

    /// `pool/image` spec passed to the CLI.
    pub fn spec(&self, image: &str) -> Result<String> {
        Ok(format!("{}/{}", self.pool_for(image)?, image))
    }

    /// Timestamp-named snapshots of an image, oldest first.
    ///
    /// Name order is the authority; a divergence from the cluster-assigned
    /// id order means clock skew or out-of-band snapshots and is flagged.
    pub async fn snapshots_sorted(&self, image: &str) -> Result<Vec<SnapshotEntry>> {
        let spec = self.spec(image)?;
        let output = commands::run(RBD, &["snap", "ls", &spec, "--format", "json"]).await?;

        let raw: Vec<RawSnapshot> = serde_json::from_str(&output)
            .with_context(|| format!("Unparseable snapshot listing for {}", spec))?;

        let mut snaps: Vec<SnapshotEntry> = raw
            .into_iter()
            .filter(|s| parse_stamp(&s.name).is_some())
            .map(|s| SnapshotEntry { id: s.id, name: s.name })
            .collect();

        let mut by_id = snaps.clone();
        by_id.sort_by_key(|s| s.id);
        snaps.sort_by_key(|s| parse_stamp(&s.name));

        if snaps.iter().map(|s| &s.name).ne(by_id.iter().map(|s| &s.name)) {
            warn!(
                "Snapshot list of {} is not ordered correctly (name order disagrees with id order), please check!",
                image
            );
        }

        Ok(snaps)
    }

    /// Create a snapshot under a hard time budget; a stuck request is
    /// killed rather than waited on so one image cannot wedge the round.
    pub async fn snap_create(&self, image: &str, snap: &str) -> Result<()> {
        let spec = self.spec(image)?;
        commands::run_with_timeout(
            RBD,
            &["snap", "create", &spec, "--snap", snap],
            timeouts::SNAP_CREATE,
        )
        .await?;
        Ok(())
    }

    pub async fn snap_remove(&self, image: &str, snap: &str) -> Result<()> {
        let spec = self.spec(image)?;
        commands::run(RBD, &["snap", "rm", "--no-progress", &spec, "--snap", snap]).await?;
        Ok(())
    }

    /// Remove every timestamp-named snapshot of an image, newest first.
    pub async fn remove_all_snapshots(&self, image: &str) -> Result<()> {
        info!("Removing all snapshots from {}", image);
        let snaps = self.snapshots_sorted(image).await?;
        for snap in snaps.iter().rev() {
            self.snap_remove(image, &snap.name).await?;
        }
        Ok(())
    }

    pub async fn export(&self, image: &str, snap: &str, dest: &str) -> Result<()> {
        let spec = self.spec(image)?;
        commands::run(
            RBD,
            &["export", "--no-progress", &spec, "--snap", snap, dest],
        )
        .await?;
        Ok(())
    }

    pub async fn export_diff(
        &self,
        image: &str,
        from_snap: &str,
        snap: &str,
        dest: &str,
    ) -> Result<()> {
        let spec = self.spec(image)?;
        commands::run(
            RBD,
            &[
                "export-diff",
                "--no-progress",
                &spec,
                "--snap",
                snap,
                "--from-snap",
                from_snap,
                dest,
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn import(&self, image: &str, path: &str) -> Result<()> {
        let spec = self.spec(image)?;
        commands::run(RBD, &["import", "--no-progress", path, &spec]).await?;
        Ok(())
    }

    pub async fn import_diff(&self, image: &str, path: &str) -> Result<()> {
        let spec = self.spec(image)?;
        commands::run(RBD, &["import-diff", "--no-progress", path, &spec]).await?;
        Ok(())
    }

    /// Rename within the image's pool (both names must map to the same
    /// pool, which holds for the `.bak` convention).
    pub async fn rename(&self, image: &str, new_name: &str) -> Result<()> {
        let spec = self.spec(image)?;
        let new_spec = self.spec(new_name)?;
        commands::run(RBD, &["rename", &spec, &new_spec]).await?;
        Ok(())
    }

    pub async fn remove_image(&self, image: &str) -> Result<()> {
        info!("Deleting image {}", image);
        let spec = self.spec(image)?;
        commands::run(RBD, &["rm", "--no-progress", &spec]).await?;
        Ok(())
    }

    pub async fn list_images(&self, pool: &str) -> Result<Vec<String>> {
        let output = commands::run(RBD, &["ls", pool, "--format", "json"]).await?;
        let images: Vec<String> = serde_json::from_str(&output)
            .with_context(|| format!("Unparseable image listing for pool {}", pool))?;
        Ok(images)
    }

    pub async fn image_exists(&self, image: &str) -> Result<bool> {
        let pool = self.pool_for(image)?;
        let images = self.list_images(pool).await?;
        Ok(images.iter().any(|name| name == image))
    }

    /// Images in both pools left behind by interrupted restores.
    pub async fn stale_bak_images(&self) -> Result<Vec<String>> {
        let mut stale = Vec::new();
        for pool in [&self.vms_pool, &self.volumes_pool] {
            for image in self.list_images(pool).await? {
                if image.ends_with(naming::BAK_SUFFIX) {
                    stale.push(image);
                }
            }
        }
        Ok(stale)
    }

    /// Whether the image is a clone (has a parent). Exports of clones only
    /// cover the child layer, which is worth a warning.
    pub async fn is_clone(&self, image: &str) -> Result<bool> {
        let spec = self.spec(image)?;
        let output = commands::run(RBD, &["info", &spec, "--format", "json"]).await?;
        let info: RawImageInfo = serde_json::from_str(&output)
            .with_context(|| format!("Unparseable image info for {}", spec))?;
        Ok(info.parent.is_some())
    }
}
