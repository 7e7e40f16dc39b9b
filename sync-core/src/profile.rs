//! Folder policies: sync profiles, permissions, scan schedules and
//! mass-deletion protection.

use serde::{Deserialize, Serialize};

/// Policy bundle controlling how a folder reacts to local and remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncProfile {
    /// Nothing happens automatically.
    Manual,
    /// Detect, download and delete automatically.
    #[default]
    Automatic,
    /// Publish local changes; never take remote changes.
    BackupSource,
    /// Take remote changes including deletions; never publish local ones.
    BackupTarget,
    /// Publish local files; remote deletions are not applied.
    HostFiles,
}

impl SyncProfile {
    /// Whether local changes are detected by scheduled scans.
    pub fn auto_detect_local_changes(&self) -> bool {
        matches!(self, Self::Automatic | Self::BackupSource | Self::HostFiles)
    }

    /// Whether newer remote files are downloaded automatically.
    pub fn auto_download(&self) -> bool {
        matches!(self, Self::Automatic | Self::BackupTarget)
    }

    /// Whether remote deletions are applied locally.
    pub fn sync_deletion(&self) -> bool {
        matches!(self, Self::Automatic | Self::BackupTarget)
    }

    /// Profile a folder falls back to when remote mass deletion is detected.
    pub fn non_destructive(&self) -> Self {
        if self.sync_deletion() {
            Self::HostFiles
        } else {
            *self
        }
    }
}

impl std::fmt::Display for SyncProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Manual => "manual",
            Self::Automatic => "automatic",
            Self::BackupSource => "backup-source",
            Self::BackupTarget => "backup-target",
            Self::HostFiles => "host-files",
        };
        f.write_str(name)
    }
}

/// Access a node has to a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    /// No access at all.
    None,
    /// May receive the folder's files.
    Read,
    /// May also propagate changes and deletions.
    #[default]
    ReadWrite,
}

impl Permission {
    /// Whether the folder may be shared with the holder.
    pub fn can_read(&self) -> bool {
        *self >= Self::Read
    }

    /// Whether the holder's changes and deletions are accepted.
    pub fn can_write(&self) -> bool {
        *self >= Self::ReadWrite
    }
}

const MILLIS_PER_HOUR: i64 = 3_600_000;
const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;

/// When scheduled scans run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ScanSchedule {
    /// Only explicit scans.
    Disabled,
    /// Scan every `secs` seconds.
    Interval {
        /// Seconds between scans.
        secs: u64,
    },
    /// Scan once a day at `hour` (UTC).
    Daily {
        /// Hour of day, 0-23.
        hour: u8,
    },
}

impl Default for ScanSchedule {
    fn default() -> Self {
        Self::Interval { secs: 60 }
    }
}

impl ScanSchedule {
    /// Whether a scan is due, given the last scan time (ms since epoch, 0 if
    /// never) and the current time.
    pub fn is_due(&self, last_scan_ms: i64, now_ms: i64) -> bool {
        match *self {
            Self::Disabled => false,
            Self::Interval { secs } => {
                let interval = i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX);
                now_ms.saturating_sub(last_scan_ms) >= interval
            }
            Self::Daily { hour } => {
                let day_start = now_ms - now_ms.rem_euclid(MILLIS_PER_DAY);
                let mark = day_start + i64::from(hour.min(23)) * MILLIS_PER_HOUR;
                now_ms >= mark && last_scan_ms < mark
            }
        }
    }
}

/// Thresholds for mass-deletion protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MassDeletePolicy {
    /// Whether remote mass-delete protection is active.
    pub enabled: bool,
    /// Percentage of known files a remote delta may delete.
    pub threshold_percent: u8,
    /// Folders with fewer known files are never protected.
    pub min_files: usize,
}

impl Default for MassDeletePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_percent: 80,
            min_files: 10,
        }
    }
}

impl MassDeletePolicy {
    /// Whether a remote change deleting `deleted` of `known` local files
    /// exceeds the threshold.
    pub fn remote_delta_exceeds(&self, deleted: usize, known: usize) -> bool {
        if !self.enabled || known == 0 || known < self.min_files {
            return false;
        }
        (deleted as u128) * 100 > u128::from(self.threshold_percent) * (known as u128)
    }

    /// Whether a local scan looks like an unmounted or wiped volume: every
    /// known file would be deleted and nothing at all was found on disk.
    pub fn local_scan_is_mass_delete(&self, known: usize, deleted: usize, found: usize) -> bool {
        known > 0 && deleted >= known && found == 0
    }
}
