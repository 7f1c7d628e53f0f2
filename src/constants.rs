//! Application-wide constants for time formats, timeouts and layout names

#![allow(dead_code)]

use std::time::Duration;

/// Naming of snapshots and backup-set directories
pub mod naming {
    /// Timestamp format shared by snapshot names and backup-set directories
    pub const TIME_FORMAT: &str = "%Y-%m-%d-%H-%M";

    /// Operator-facing date format accepted on the command line for restores
    pub const USER_TIME_FORMAT: &str = "%d-%m-%Y %H:%M";

    /// Per-round status marker file inside a backup-set directory
    pub const STATUS_FILE: &str = "status";

    /// Suffix of root-disk images
    pub const DISK_SUFFIX: &str = "_disk";

    /// Prefix of volume images
    pub const VOLUME_PREFIX: &str = "volume-";

    /// Suffix given to a live image moved aside during an in-place restore
    pub const BAK_SUFFIX: &str = ".bak";

    /// File prefixes distinguishing full from incremental exports
    pub const FULL_PREFIX: &str = "full_";
    pub const INC_PREFIX: &str = "inc_";
}

/// Timeout constants for cluster and guest operations
pub mod timeouts {
    use super::Duration;

    /// Budget for a single `rbd snap create`; a stuck image is killed, not waited on
    pub const SNAP_CREATE: Duration = Duration::from_secs(60);

    /// Guest-agent ping timeout (seconds, passed to virsh)
    pub const AGENT_PING_SECS: u64 = 30;

    /// Interval between power-state polls while shutting an instance down
    pub const POWER_OFF_POLL: Duration = Duration::from_secs(2);

    /// Maximum number of power-state polls before giving up on a shutdown
    pub const POWER_OFF_POLL_LIMIT: u32 = 150;
}

/// Pacing delays between cluster calls within one snapshot round
pub mod pacing {
    use super::Duration;

    /// Pause after freezing a guest, before the first snapshot request
    pub const AFTER_FREEZE: Duration = Duration::from_secs(2);

    /// Pause between per-image snapshot requests while the guest is frozen
    pub const QUIESCED_IMAGE_GAP: Duration = Duration::from_secs(2);

    /// Pause between per-image snapshot requests on the best-effort path
    pub const IMAGE_GAP: Duration = Duration::from_secs(5);
}
