//! FileRecord store.
//!
//! Per-folder index of file records, partitioned into domains: the local
//! domain (`None`) holds the authoritative records of this node, and every
//! member has a domain with the records it last announced.
//!
//! A record only replaces an existing one for the same path if the existing
//! record is not newer, so versions never move backwards.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use sync_types::{FileRecord, NodeId};

/// Owner of a partition: `None` for the local node.
pub type Domain = Option<NodeId>;

type Partition = HashMap<String, FileRecord>;

/// Versioned file index of one folder.
#[derive(Debug, Default)]
pub struct FileRecordStore {
    domains: RwLock<HashMap<Domain, Partition>>,
}

impl FileRecordStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Domain, Partition>> {
        self.domains
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Domain, Partition>> {
        self.domains
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record stored for `path` in `domain`.
    pub fn find(&self, path: &str, domain: Domain) -> Option<FileRecord> {
        self.read()
            .get(&domain)
            .and_then(|partition| partition.get(path))
            .cloned()
    }

    /// Store records, skipping any whose stored counterpart is newer.
    ///
    /// Returns the records that were accepted.
    pub fn store<I>(&self, domain: Domain, records: I) -> Vec<FileRecord>
    where
        I: IntoIterator<Item = FileRecord>,
    {
        let mut domains = self.write();
        let partition = domains.entry(domain).or_default();
        let mut accepted = Vec::new();

        for record in records {
            let keep_existing = partition
                .get(&record.path)
                .is_some_and(|existing| existing.is_newer_than(&record));
            if keep_existing {
                continue;
            }
            partition.insert(record.path.clone(), record.clone());
            accepted.push(record);
        }
        accepted
    }

    /// Replace a domain with a full list.
    ///
    /// Paths missing from `records` are dropped; paths present go through the
    /// same acceptance rule as [`store`](Self::store).
    pub fn replace_domain<I>(&self, domain: Domain, records: I) -> Vec<FileRecord>
    where
        I: IntoIterator<Item = FileRecord>,
    {
        let mut domains = self.write();
        let old = domains.remove(&domain).unwrap_or_default();
        let mut fresh: Partition = HashMap::new();
        let mut accepted = Vec::new();

        for record in records {
            let keep_existing = old
                .get(&record.path)
                .is_some_and(|existing| existing.is_newer_than(&record));
            if keep_existing {
                if let Some(existing) = old.get(&record.path) {
                    fresh.insert(record.path.clone(), existing.clone());
                }
                continue;
            }
            fresh.insert(record.path.clone(), record.clone());
            accepted.push(record);
        }
        domains.insert(domain, fresh);
        accepted
    }

    /// Remove one record.
    pub fn delete(&self, domain: Domain, path: &str) -> Option<FileRecord> {
        self.write()
            .get_mut(&domain)
            .and_then(|partition| partition.remove(path))
    }

    /// Remove a whole domain.
    pub fn delete_domain(&self, domain: Domain) -> usize {
        self.write()
            .remove(&domain)
            .map(|partition| partition.len())
            .unwrap_or(0)
    }

    /// All records of a domain.
    pub fn find_all(&self, domain: Domain) -> Vec<FileRecord> {
        self.read()
            .get(&domain)
            .map(|partition| partition.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of records in a domain, tombstones included.
    pub fn count(&self, domain: Domain) -> usize {
        self.read().get(&domain).map(|p| p.len()).unwrap_or(0)
    }

    /// Number of non-deleted records in a domain.
    pub fn count_live(&self, domain: Domain) -> usize {
        self.read()
            .get(&domain)
            .map(|p| p.values().filter(|r| !r.deleted).count())
            .unwrap_or(0)
    }

    /// Member domains currently present.
    pub fn member_domains(&self) -> Vec<NodeId> {
        self.read().keys().filter_map(|domain| *domain).collect()
    }

    /// Drop tombstones deleted before `cutoff_ms` from every domain.
    pub fn purge_tombstones(&self, cutoff_ms: i64) -> usize {
        let mut domains = self.write();
        let mut purged = 0;
        for partition in domains.values_mut() {
            let before = partition.len();
            partition.retain(|_, record| !(record.deleted && record.deleted_ms < cutoff_ms));
            purged += before - partition.len();
        }
        purged
    }

    /// Remove every domain.
    pub fn clear(&self) {
        self.write().clear();
    }
}
