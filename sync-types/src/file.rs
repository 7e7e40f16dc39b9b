//! Versioned file records.
//!
//! A [`FileRecord`] describes one file or directory inside a shared folder.
//! Records are never destroyed: a deletion is a tombstone record with
//! `deleted = true` and a higher version.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{FolderId, NodeId};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Natural key of a file record: folder plus relative path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileKey {
    /// Folder the path belongs to.
    pub folder: FolderId,
    /// Relative, `/`-separated path.
    pub path: String,
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", &self.folder.to_string()[..8], self.path)
    }
}

/// Versioned metadata entry for one path in a folder's index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Folder this record belongs to.
    pub folder: FolderId,
    /// Relative, `/`-separated path with case preserved.
    pub path: String,
    /// Size in bytes (0 for directories and tombstones of directories).
    pub size: u64,
    /// Modification time in milliseconds since the Unix epoch.
    pub modified_ms: i64,
    /// Monotonic version, bumped on every change.
    pub version: u32,
    /// Tombstone flag.
    pub deleted: bool,
    /// Deletion time in milliseconds since the Unix epoch, 0 unless deleted.
    #[serde(default)]
    pub deleted_ms: i64,
    /// Whether the record describes a directory.
    pub directory: bool,
    /// Node that produced this version.
    pub modified_by: NodeId,
}

impl FileRecord {
    /// Create the initial (version 0) record for a file.
    pub fn new_file(
        folder: FolderId,
        path: impl Into<String>,
        size: u64,
        modified_ms: i64,
        modified_by: NodeId,
    ) -> Self {
        Self {
            folder,
            path: path.into(),
            size,
            modified_ms,
            version: 0,
            deleted: false,
            deleted_ms: 0,
            directory: false,
            modified_by,
        }
    }

    /// Create the initial (version 0) record for a directory.
    pub fn new_directory(
        folder: FolderId,
        path: impl Into<String>,
        modified_ms: i64,
        modified_by: NodeId,
    ) -> Self {
        Self {
            folder,
            path: path.into(),
            size: 0,
            modified_ms,
            version: 0,
            deleted: false,
            deleted_ms: 0,
            directory: true,
            modified_by,
        }
    }

    /// The natural key of this record.
    pub fn key(&self) -> FileKey {
        FileKey {
            folder: self.folder,
            path: self.path.clone(),
        }
    }

    /// Final path component.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Lowercased path, used for case-insensitive matching.
    pub fn lower_path(&self) -> String {
        self.path.to_lowercase()
    }

    /// Compare two versions of the same path.
    ///
    /// Higher version wins; equal versions are ordered by modification time.
    pub fn compare_version(&self, other: &FileRecord) -> Ordering {
        self.version
            .cmp(&other.version)
            .then(self.modified_ms.cmp(&other.modified_ms))
    }

    /// Whether this record supersedes `other`.
    pub fn is_newer_than(&self, other: &FileRecord) -> bool {
        self.compare_version(other) == Ordering::Greater
    }

    /// Whether both records describe the same version of the same path.
    pub fn is_same_version(&self, other: &FileRecord) -> bool {
        self.path == other.path && self.compare_version(other) == Ordering::Equal
    }

    /// Successor record describing changed content.
    pub fn changed(&self, size: u64, modified_ms: i64, by: NodeId) -> Self {
        Self {
            size,
            modified_ms,
            version: self.version.saturating_add(1),
            deleted: false,
            deleted_ms: 0,
            modified_by: by,
            ..self.clone()
        }
    }

    /// Successor tombstone for this record, deleted at `deleted_at_ms`.
    ///
    /// The last known size and modification time are kept.
    pub fn tombstone(&self, deleted_at_ms: i64, by: NodeId) -> Self {
        Self {
            version: self.version.saturating_add(1),
            deleted: true,
            deleted_ms: deleted_at_ms,
            modified_by: by,
            ..self.clone()
        }
    }
}

impl fmt::Display for FileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} v{}{}",
            self.path,
            self.version,
            if self.deleted { " (deleted)" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: u32, modified_ms: i64) -> FileRecord {
        FileRecord {
            version,
            ..FileRecord::new_file(
                FolderId::from_key(b"f"),
                "docs/a.txt",
                10,
                modified_ms,
                NodeId::random(),
            )
        }
    }

    #[test]
    fn higher_version_is_newer() {
        assert!(record(2, 100).is_newer_than(&record(1, 500)));
        assert!(!record(1, 500).is_newer_than(&record(2, 100)));
    }

    #[test]
    fn equal_version_tie_breaks_on_modification_time() {
        assert!(record(3, 200).is_newer_than(&record(3, 100)));
        assert!(!record(3, 100).is_newer_than(&record(3, 200)));
    }

    #[test]
    fn identical_versions_are_not_newer() {
        let a = record(3, 100);
        let b = record(3, 100);
        assert!(!a.is_newer_than(&b));
        assert!(!b.is_newer_than(&a));
        assert!(a.is_same_version(&b));
    }

    #[test]
    fn tombstone_bumps_version() {
        let by = NodeId::random();
        let dead = record(4, 100).tombstone(900, by);
        assert!(dead.deleted);
        assert_eq!(dead.version, 5);
        assert_eq!(dead.deleted_ms, 900);
        assert_eq!(dead.modified_ms, 100);
        assert_eq!(dead.size, 10);
        assert_eq!(dead.modified_by, by);
    }

    #[test]
    fn changed_clears_deleted_flag() {
        let by = NodeId::random();
        let restored = record(1, 100).tombstone(200, by).changed(42, 300, by);
        assert!(!restored.deleted);
        assert_eq!(restored.deleted_ms, 0);
        assert_eq!(restored.version, 3);
        assert_eq!(restored.size, 42);
    }

    #[test]
    fn file_name_is_last_component() {
        assert_eq!(record(0, 0).file_name(), "a.txt");
    }
}
