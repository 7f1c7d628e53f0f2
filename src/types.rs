use std::path::PathBuf;

use crate::constants::naming;

/// Parse a snapshot or backup-set name in the canonical timestamp format.
pub fn parse_stamp(name: &str) -> Option<chrono::NaiveDateTime> {
    chrono::NaiveDateTime::parse_from_str(name, naming::TIME_FORMAT).ok()
}

/// One snapshot of an RBD image as reported by the cluster.
///
/// `id` is assigned by the cluster and grows monotonically; `name` is our
/// timestamp. For a healthy image both orders agree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub id: u64,
    pub name: String,
}

/// Backup type chosen for an export round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Full,
    Incremental,
}

impl ExportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportKind::Full => "full",
            ExportKind::Incremental => "incremental",
        }
    }
}

/// What one dated backup-set directory turned out to contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetKind {
    Full,
    Incremental,
    /// Both full and incremental files present: the directory is incoherent
    /// and must not be trusted as either kind.
    Mixed,
    /// No image files at all (e.g. a round where every export failed).
    Empty,
}

/// Persisted result of an export round, read back from the status marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetStatus {
    Ok,
    Error,
}

/// Consistency level actually achieved by one snapshot round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundConsistency {
    /// Guest filesystems were frozen around every snapshot request.
    Quiesced,
    /// Snapshots were taken without quiescing (inactive guest, no agent,
    /// detached volume, or freeze failure fallback).
    CrashConsistent,
    /// The round itself could not run.
    Failed(String),
}

/// Outcome of one snapshot round across all images of a target.
#[derive(Debug)]
pub struct SnapshotRoundReport {
    pub consistency: RoundConsistency,
    /// Images whose snapshot attempt failed (timeout or cluster error).
    pub failed_images: Vec<String>,
}

/// Outcome of one export round.
#[derive(Debug, Default)]
pub struct ExportReport {
    /// Number of images that could not be exported.
    pub failures: u32,
    pub files_written: Vec<PathBuf>,
}

/// One protection target: an instance with its disks, or a detached volume.
///
/// Inventory resolution is external to the engine; targets arrive from the
/// config already mapped to image names.
#[derive(Debug, Clone)]
pub struct BackupTarget {
    /// Directory name under the backup root: `<sanitized-name>_<id>`.
    pub folder: String,
    pub name: String,
    pub tenant: String,
    /// Libvirt domain name, when the target is a defined instance.
    /// Detached volumes have none.
    pub domain: Option<String>,
    /// RBD image names to protect this round.
    pub images: Vec<String>,
}

impl BackupTarget {
    pub fn folder_name(name: &str, id: &str) -> String {
        let sanitized = name.replace(' ', "_").replace('/', "");
        format!("{}_{}", sanitized, id)
    }
}
