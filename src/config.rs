use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tokio::fs;
use tracing::info;

use crate::types::BackupTarget;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub backup: BackupConfig,
    pub guest: GuestConfig,
    #[serde(default)]
    pub instances: Vec<InstanceTarget>,
    #[serde(default)]
    pub volumes: Vec<VolumeTarget>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Pool holding instance root disks (`<id>_disk` images).
    pub vms_pool: String,
    /// Pool holding cinder volumes (`volume-<id>` images).
    pub volumes_pool: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    /// Top-level directory receiving one subdirectory per target.
    pub root_dir: String,
    #[serde(default = "default_retention_weeks")]
    pub retention_weeks: u32,
}

fn default_retention_weeks() -> u32 {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuestConfig {
    /// Libvirt connection URI used for quiesce and power control.
    #[serde(default = "default_libvirt_uri")]
    pub libvirt_uri: String,
}

fn default_libvirt_uri() -> String {
    "qemu:///system".to_string()
}

/// An instance declared for protection, already resolved to identifiers.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceTarget {
    pub id: String,
    pub name: String,
    pub tenant: String,
    /// Libvirt domain name; omitted when the instance is not defined on
    /// this hypervisor (its disks are still snapshotted, crash-consistent).
    pub domain: Option<String>,
    /// Back up the `<id>_disk` root image as well.
    #[serde(default)]
    pub root_disk: bool,
    /// Attached volume ids, backed up together with the instance.
    #[serde(default)]
    pub volumes: Vec<String>,
}

/// A detached volume declared for protection.
#[derive(Debug, Clone, Deserialize)]
pub struct VolumeTarget {
    pub id: String,
    /// Display name used for the backup folder; defaults to "volume".
    pub name: Option<String>,
    pub tenant: String,
}

impl Config {
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path))?;

        let config: Config =
            toml::from_str(&content).with_context(|| format!("Failed to parse config {}", path))?;

        config.validate()?;

        info!(
            "Loaded config: {} instances, {} detached volumes, retention {} weeks",
            config.instances.len(),
            config.volumes.len(),
            config.backup.retention_weeks
        );

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.cluster.vms_pool.is_empty() || self.cluster.volumes_pool.is_empty() {
            return Err(anyhow!("Both cluster pool names must be set"));
        }
        if self.backup.root_dir.is_empty() {
            return Err(anyhow!("backup.root_dir must be set"));
        }
        for instance in &self.instances {
            if !instance.root_disk && instance.volumes.is_empty() {
                return Err(anyhow!(
                    "Instance {} has neither root disk nor volumes selected, nothing to back up",
                    instance.name
                ));
            }
        }
        Ok(())
    }

    /// Resolve declared targets into backup units, sorted by tenant so one
    /// run walks tenants in a stable order.
    pub fn backup_targets(&self) -> Vec<BackupTarget> {
        let mut targets = Vec::new();

        for instance in &self.instances {
            let mut images = Vec::new();
            if instance.root_disk {
                images.push(format!("{}_disk", instance.id));
            }
            for volume_id in &instance.volumes {
                images.push(format!("volume-{}", volume_id));
            }
            targets.push(BackupTarget {
                folder: BackupTarget::folder_name(&instance.name, &instance.id),
                name: instance.name.clone(),
                tenant: instance.tenant.clone(),
                domain: instance.domain.clone(),
                images,
            });
        }

        for volume in &self.volumes {
            let image = format!("volume-{}", volume.id);
            let display = volume.name.clone().unwrap_or_else(|| "volume".to_string());
            targets.push(BackupTarget {
                folder: BackupTarget::folder_name(&display, &volume.id),
                name: display,
                tenant: volume.tenant.clone(),
                domain: None,
                images: vec![image],
            });
        }

        targets.sort_by(|a, b| a.tenant.cmp(&b.tenant));
        targets
    }
}
