//! Shared folder.
//!
//! A [`Folder`] owns the record store of one shared directory, commits local
//! scan results, applies file lists received from members, reconciles remote
//! deletions and persists its index.
//!
//! Locking:
//! - the scan lock serializes scanner runs and every disk mutation,
//! - the store's own lock serializes record reads and writes,
//! - the join lock serializes membership changes.
//!
//! No lock is held while a message is sent.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use dashmap::DashMap;
use filetime::FileTime;
use serde::{Deserialize, Serialize};

use sync_core::{FilenameProblem, Permission, ScanSchedule, SyncProfile};
use sync_types::{
    now_millis, FileList, FileRecord, FolderFilesChanged, FolderId, FolderInfo, Message, NodeId,
    NodeInfo,
};

use crate::context::EngineContext;
use crate::error::{FolderError, FolderResult, PersistError};
use crate::events::FolderEvent;
use crate::member::Member;
use crate::node::SyncNode;
use crate::persist::{self, FileKind, RecordReader, RecordWriter};
use crate::scanner::{
    is_system_path, modified_millis, FolderScanner, ScanInput, ScanResult, ScanState, SYSTEM_DIR,
};
use crate::store::FileRecordStore;

/// Index file name inside the system directory.
pub const INDEX_FILE: &str = "index.fsi";

/// Settings a folder is created with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderSettings {
    /// Folder identity.
    pub info: FolderInfo,
    /// Local base directory.
    pub base_dir: PathBuf,
    /// Sync profile.
    #[serde(default)]
    pub profile: SyncProfile,
    /// When to scan for local changes.
    #[serde(default)]
    pub schedule: ScanSchedule,
    /// Permission of members without an override.
    #[serde(default)]
    pub default_permission: Permission,
    /// Per-member permission overrides.
    #[serde(default)]
    pub permissions: HashMap<NodeId, Permission>,
    /// Paths never downloaded; entries ending in `/` match a subtree.
    #[serde(default)]
    pub blacklist: Vec<String>,
}

impl FolderSettings {
    /// Settings with default policy.
    pub fn new(info: FolderInfo, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            info,
            base_dir: base_dir.into(),
            profile: SyncProfile::default(),
            schedule: ScanSchedule::default(),
            default_permission: Permission::default(),
            permissions: HashMap::new(),
            blacklist: Vec::new(),
        }
    }
}

/// A file list received from a member.
#[derive(Debug, Clone)]
pub enum RemoteFileList {
    /// Complete list; replaces the member's domain.
    Full(Vec<FileRecord>),
    /// Changes to the member's domain.
    Delta {
        /// New or updated records.
        added: Vec<FileRecord>,
        /// Tombstones.
        removed: Vec<FileRecord>,
    },
}

/// How a record relates to the file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskState {
    /// Nothing on disk.
    Missing,
    /// Size, mtime and kind match the record.
    InSync,
    /// The file on disk differs.
    Differs,
}

#[derive(Debug)]
struct Policy {
    profile: SyncProfile,
    schedule: ScanSchedule,
    default_permission: Permission,
    permissions: HashMap<NodeId, Permission>,
    blacklist: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexHeader {
    folder: FolderInfo,
    last_scan_ms: i64,
    last_synced_ms: i64,
    default_permission: Permission,
    members: Vec<NodeInfo>,
}

/// One shared folder.
#[derive(Debug)]
pub struct Folder {
    ctx: Arc<EngineContext>,
    node: Weak<SyncNode>,
    info: FolderInfo,
    base: PathBuf,
    store: FileRecordStore,
    scanner: Arc<FolderScanner>,
    policy: RwLock<Policy>,
    members: DashMap<NodeId, NodeInfo>,
    problems: Mutex<Vec<FilenameProblem>>,
    scan_lock: tokio::sync::Mutex<()>,
    join_lock: tokio::sync::Mutex<()>,
    dirty: AtomicBool,
    device_disconnected: AtomicBool,
    has_own_database: AtomicBool,
    known_files: AtomicUsize,
    last_scan_ms: AtomicI64,
    last_synced_ms: AtomicI64,
    deletion_sync_requested: AtomicBool,
    deletion_sync_running: AtomicBool,
}

impl Folder {
    /// Create a folder and load its persisted index.
    pub fn new(
        ctx: Arc<EngineContext>,
        node: Weak<SyncNode>,
        settings: FolderSettings,
    ) -> crate::Result<Arc<Self>> {
        let scanner = Arc::new(FolderScanner::new(&ctx.config.scanner)?);
        let folder = Arc::new(Self {
            ctx,
            node,
            info: settings.info,
            base: settings.base_dir,
            store: FileRecordStore::new(),
            scanner,
            policy: RwLock::new(Policy {
                profile: settings.profile,
                schedule: settings.schedule,
                default_permission: settings.default_permission,
                permissions: settings.permissions,
                blacklist: settings.blacklist,
            }),
            members: DashMap::new(),
            problems: Mutex::new(Vec::new()),
            scan_lock: tokio::sync::Mutex::new(()),
            join_lock: tokio::sync::Mutex::new(()),
            dirty: AtomicBool::new(false),
            device_disconnected: AtomicBool::new(false),
            has_own_database: AtomicBool::new(false),
            known_files: AtomicUsize::new(0),
            last_scan_ms: AtomicI64::new(0),
            last_synced_ms: AtomicI64::new(0),
            deletion_sync_requested: AtomicBool::new(false),
            deletion_sync_running: AtomicBool::new(false),
        });

        if !folder.base.is_dir() {
            tracing::warn!(
                "Folder {} base directory {} unavailable",
                folder.info.name,
                folder.base.display()
            );
            folder.device_disconnected.store(true, Ordering::SeqCst);
        }
        match folder.load_index() {
            Ok(true) => tracing::info!(
                "Loaded index of {} ({} files)",
                folder.info.name,
                folder.file_count()
            ),
            Ok(false) => tracing::debug!("No index for {} yet", folder.info.name),
            Err(e) => tracing::warn!("Failed to load index of {}: {}", folder.info.name, e),
        }
        Ok(folder)
    }

    /// Folder id.
    pub fn id(&self) -> FolderId {
        self.info.id
    }

    /// Folder description.
    pub fn info(&self) -> &FolderInfo {
        &self.info
    }

    /// Local base directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// The record store.
    pub fn store(&self) -> &FileRecordStore {
        &self.store
    }

    /// Absolute path of a relative record path.
    pub fn local_path(&self, path: &str) -> PathBuf {
        path.split('/')
            .filter(|c| !c.is_empty())
            .fold(self.base.clone(), |acc, c| acc.join(c))
    }

    fn index_path(&self) -> PathBuf {
        self.base.join(SYSTEM_DIR).join(INDEX_FILE)
    }

    fn policy(&self) -> std::sync::RwLockReadGuard<'_, Policy> {
        self.policy
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn policy_mut(&self) -> std::sync::RwLockWriteGuard<'_, Policy> {
        self.policy
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current sync profile.
    pub fn profile(&self) -> SyncProfile {
        self.policy().profile
    }

    /// Change the sync profile.
    pub fn set_profile(&self, profile: SyncProfile) {
        let old = std::mem::replace(&mut self.policy_mut().profile, profile);
        if old != profile {
            tracing::info!("Folder {} profile {} -> {}", self.info.name, old, profile);
            self.ctx.events.folder(FolderEvent::ProfileChanged {
                folder: self.info.id,
                profile,
            });
        }
    }

    /// Scan schedule.
    pub fn schedule(&self) -> ScanSchedule {
        self.policy().schedule
    }

    /// Change the scan schedule.
    pub fn set_schedule(&self, schedule: ScanSchedule) {
        self.policy_mut().schedule = schedule;
    }

    /// Permission of `node` on this folder.
    pub fn permission_for(&self, node: &NodeId) -> Permission {
        let policy = self.policy();
        policy
            .permissions
            .get(node)
            .copied()
            .unwrap_or(policy.default_permission)
    }

    /// Override the permission of one member.
    pub fn set_permission(&self, node: NodeId, permission: Permission) {
        self.policy_mut().permissions.insert(node, permission);
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Exclude a path or `prefix/` subtree from downloads.
    pub fn add_to_blacklist(&self, pattern: impl Into<String>) {
        let pattern = pattern.into();
        {
            let mut policy = self.policy_mut();
            if policy.blacklist.contains(&pattern) {
                return;
            }
            policy.blacklist.push(pattern);
        }
        if let Some(node) = self.node.upgrade() {
            node.transfers().trigger_maintenance();
        }
    }

    /// Remove a blacklist entry.
    pub fn remove_from_blacklist(&self, pattern: &str) -> bool {
        let mut policy = self.policy_mut();
        let before = policy.blacklist.len();
        policy.blacklist.retain(|p| p != pattern);
        before != policy.blacklist.len()
    }

    /// Whether downloads of `path` are excluded.
    pub fn is_blacklisted(&self, path: &str) -> bool {
        self.policy().blacklist.iter().any(|pattern| {
            if pattern.ends_with('/') {
                path.starts_with(pattern.as_str()) || format!("{}/", path) == *pattern
            } else {
                path == pattern
            }
        })
    }

    /// Live records in the local domain.
    pub fn file_count(&self) -> usize {
        self.known_files.load(Ordering::SeqCst)
    }

    /// Whether the local domain was populated by a scan or a loaded index.
    pub fn has_own_database(&self) -> bool {
        self.has_own_database.load(Ordering::SeqCst)
    }

    /// Whether the base directory is currently unavailable.
    pub fn is_device_disconnected(&self) -> bool {
        self.device_disconnected.load(Ordering::SeqCst)
    }

    /// Whether the index has unsaved changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Time of the last committed scan.
    pub fn last_scan_ms(&self) -> i64 {
        self.last_scan_ms.load(Ordering::SeqCst)
    }

    /// Time the folder was last seen without incoming files.
    pub fn last_synced_ms(&self) -> i64 {
        self.last_synced_ms.load(Ordering::SeqCst)
    }

    /// Record that nothing is left to download.
    pub fn mark_synced(&self) {
        self.last_synced_ms.store(now_millis(), Ordering::SeqCst);
    }

    /// Filename problems found by the last committed scan.
    pub fn problems(&self) -> Vec<FilenameProblem> {
        self.problems
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Local record for `path`.
    pub fn find_local(&self, path: &str) -> Option<FileRecord> {
        self.store.find(path, None)
    }

    fn refresh_file_count(&self) {
        self.known_files
            .store(self.store.count_live(None), Ordering::SeqCst);
    }

    // ---- Device availability ----

    /// Check that the base directory is reachable.
    ///
    /// A directory that reappears gets its index reloaded from disk.
    pub fn check_device(&self) -> bool {
        if !self.base.is_dir() {
            if !self.device_disconnected.swap(true, Ordering::SeqCst) {
                tracing::warn!(
                    "Folder {} disconnected: {} unavailable",
                    self.info.name,
                    self.base.display()
                );
                self.ctx.events.folder(FolderEvent::DeviceDisconnected {
                    folder: self.info.id,
                });
            }
            return false;
        }

        if self.device_disconnected.swap(false, Ordering::SeqCst) {
            tracing::info!("Folder {} reconnected", self.info.name);
            if !self.is_dirty() {
                if let Err(e) = self.load_index() {
                    tracing::warn!("Failed to reload index of {}: {}", self.info.name, e);
                }
            }
            self.ctx.events.folder(FolderEvent::DeviceReconnected {
                folder: self.info.id,
            });
        }
        true
    }

    // ---- Local scanning ----

    /// Whether a scheduled scan is due.
    pub fn scan_due(&self, now_ms: i64) -> bool {
        let policy = self.policy();
        policy.profile.auto_detect_local_changes()
            && policy.schedule.is_due(self.last_scan_ms(), now_ms)
    }

    /// Abort a running scan.
    pub fn abort_scan(&self) {
        self.scanner.abort();
    }

    /// Scan the base directory and commit the changes.
    ///
    /// Returns `true` if the scan completed and was committed. A scan that
    /// would delete every known file while finding nothing on disk is not
    /// committed unless `ignore_mass_deletion` is set.
    pub async fn scan_local_files(&self, ignore_mass_deletion: bool) -> bool {
        if !self.check_device() {
            return false;
        }
        let Ok(guard) = self.scan_lock.try_lock() else {
            tracing::debug!("Scan of {} already running", self.info.name);
            self.emit_scan(ScanState::Busy, 0);
            return false;
        };

        let known = self.store.find_all(None);
        let known_live = known.iter().filter(|r| !r.deleted).count();
        let input = ScanInput {
            folder: self.info.id,
            base: self.base.clone(),
            known,
            local: self.ctx.local.id,
        };
        let result = match self.run_scanner(input).await {
            Some(result) => result,
            None => return false,
        };

        if result.state != ScanState::Scanned {
            drop(guard);
            if result.state == ScanState::HardwareFailure {
                self.check_device();
            }
            self.emit_scan(result.state, 0);
            return false;
        }

        let policy = self.ctx.config.mass_delete_policy();
        if !ignore_mass_deletion
            && policy.local_scan_is_mass_delete(
                known_live,
                result.deleted_files.len(),
                result.total_files,
            )
        {
            drop(guard);
            tracing::warn!(
                "Scan of {} would delete all {} files, not committing",
                self.info.name,
                known_live
            );
            self.ctx.events.folder(FolderEvent::LocalMassDeletion {
                folder: self.info.id,
                known: known_live,
            });
            return false;
        }

        let (added, removed) = self.commit_scan(&result);
        drop(guard);

        let changes = added.len() + removed.len();
        if changes > 0 {
            tracing::info!(
                "Scan of {}: {} new, {} changed, {} deleted, {} restored",
                self.info.name,
                result.new_files.len(),
                result.changed_files.len(),
                result.deleted_files.len(),
                result.restored_files.len()
            );
            self.ctx.events.folder(FolderEvent::FilesChanged {
                folder: self.info.id,
                from: None,
                added: added.len(),
                removed: removed.len(),
            });
            self.broadcast_changes(added, removed).await;
        }
        self.emit_scan(ScanState::Scanned, changes);
        true
    }

    async fn run_scanner(&self, input: ScanInput) -> Option<ScanResult> {
        let scanner = Arc::clone(&self.scanner);
        match tokio::task::spawn_blocking(move || scanner.scan(input)).await {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::error!("Scan task of {} failed: {}", self.info.name, e);
                None
            }
        }
    }

    fn commit_scan(&self, result: &ScanResult) -> (Vec<FileRecord>, Vec<FileRecord>) {
        let updates = result
            .new_files
            .iter()
            .chain(&result.changed_files)
            .chain(&result.restored_files)
            .cloned();
        let added = self.store.store(None, updates);
        let removed = self.store.store(None, result.deleted_files.iter().cloned());

        self.last_scan_ms.store(now_millis(), Ordering::SeqCst);
        self.has_own_database.store(true, Ordering::SeqCst);
        self.refresh_file_count();
        if !added.is_empty() || !removed.is_empty() {
            self.dirty.store(true, Ordering::SeqCst);
        }

        let mut problems = self
            .problems
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *problems = result.problems.clone();
        if !problems.is_empty() {
            tracing::info!("{} filename problems in {}", problems.len(), self.info.name);
            self.ctx.events.folder(FolderEvent::FilenameProblems {
                folder: self.info.id,
                problems: problems.clone(),
            });
        }
        (added, removed)
    }

    fn emit_scan(&self, state: ScanState, changes: usize) {
        self.ctx.events.folder(FolderEvent::ScanCompleted {
            folder: self.info.id,
            state,
            changes,
        });
    }

    /// Run a scan on the I/O pool.
    pub fn trigger_scan(self: &Arc<Self>) {
        let folder = Arc::clone(self);
        self.ctx.io.spawn("folder-scan", async move {
            folder.scan_local_files(false).await;
        });
    }

    // ---- Remote file lists ----

    /// Apply a file list received from `from`.
    ///
    /// Returns the records that were accepted into the member's domain.
    pub fn file_list_changed(self: &Arc<Self>, from: NodeId, list: RemoteFileList) -> Vec<FileRecord> {
        let domain = Some(from);
        let (accepted, removed_count) = match list {
            RemoteFileList::Full(files) => {
                self.check_remote_mass_deletion(from, &files);
                let count = self.store.count(domain);
                let accepted = self.store.replace_domain(domain, files);
                let removed = count.saturating_sub(self.store.count(domain));
                (accepted, removed)
            }
            RemoteFileList::Delta { added, removed } => {
                let tombstones: Vec<FileRecord> = added
                    .iter()
                    .chain(&removed)
                    .filter(|r| r.deleted)
                    .cloned()
                    .collect();
                self.check_remote_mass_deletion(from, &tombstones);
                let mut accepted = self.store.store(domain, added);
                accepted.extend(self.store.store(domain, removed));
                (accepted, 0)
            }
        };

        let deleted = accepted.iter().filter(|r| r.deleted).count();
        tracing::debug!(
            "Folder {}: {} records from {:?} ({} tombstones)",
            self.info.name,
            accepted.len(),
            from,
            deleted
        );
        if !accepted.is_empty() || removed_count > 0 {
            self.ctx.events.folder(FolderEvent::FilesChanged {
                folder: self.info.id,
                from: Some(from),
                added: accepted.len() - deleted,
                removed: deleted + removed_count,
            });
        }
        if deleted > 0 && self.profile().sync_deletion() {
            self.trigger_sync_remote_deleted_files();
        }
        accepted
    }

    fn check_remote_mass_deletion(&self, from: NodeId, records: &[FileRecord]) {
        let profile = self.profile();
        if !profile.sync_deletion() {
            return;
        }
        let deleted = records
            .iter()
            .filter(|r| r.deleted)
            .filter(|r| {
                self.store
                    .find(&r.path, None)
                    .is_some_and(|local| !local.deleted && r.is_newer_than(&local))
            })
            .count();
        let known = self.store.count_live(None);
        let policy = self.ctx.config.mass_delete_policy();
        if !policy.remote_delta_exceeds(deleted, known) {
            return;
        }

        let downgraded = profile.non_destructive();
        tracing::warn!(
            "Member {:?} deletes {} of {} files in {}, switching to {}",
            from,
            deleted,
            known,
            self.info.name,
            downgraded
        );
        self.set_profile(downgraded);
        self.ctx.events.folder(FolderEvent::RemoteMassDeletion {
            folder: self.info.id,
            from,
            deleted,
            known,
            profile: downgraded,
        });
    }

    // ---- Membership ----

    /// Whether `node` is a member.
    pub fn is_member(&self, node: &NodeId) -> bool {
        self.members.contains_key(node)
    }

    /// Known members.
    pub fn members(&self) -> Vec<NodeInfo> {
        self.members.iter().map(|m| m.value().clone()).collect()
    }

    /// Add `member` and send it our file list.
    ///
    /// Without read permission the member gets a null list instead and is
    /// not added. Returns whether the member was joined.
    pub async fn join(&self, member: &Arc<Member>) -> bool {
        let id = member.id();
        let guard = self.join_lock.lock().await;
        if !self.permission_for(&id).can_read() {
            drop(guard);
            tracing::debug!("Member {:?} may not read {}", id, self.info.name);
            if let Err(e) = member
                .send_message(Message::FileList(FileList::null(self.info.id)))
                .await
            {
                tracing::debug!("Failed to send null list to {:?}: {}", id, e);
            }
            return false;
        }
        let newly_joined = self.members.insert(id, member.info()).is_none();
        drop(guard);

        if newly_joined {
            tracing::info!("Member {} joined {}", member.info().nickname, self.info.name);
            self.dirty.store(true, Ordering::SeqCst);
            self.ctx.events.folder(FolderEvent::MemberJoined {
                folder: self.info.id,
                node: id,
            });
        }

        // A running scan finishes before the list is taken
        let records = {
            let _scan = self.scan_lock.lock().await;
            self.store.find_all(None)
        };
        let (list, deltas) = FileList::split(
            self.info.id,
            records,
            self.ctx.config.folders.file_list_batch_size,
        );
        let messages = std::iter::once(Message::FileList(list))
            .chain(deltas.into_iter().map(Message::FolderFilesChanged));
        for message in messages {
            if let Err(e) = member.send_message(message).await {
                tracing::debug!("Failed to send file list to {:?}: {}", id, e);
                break;
            }
        }
        true
    }

    /// Remove a member and purge its domain.
    pub async fn remove(&self, node: &NodeId) -> bool {
        let _guard = self.join_lock.lock().await;
        let removed = self.members.remove(node).is_some();
        let purged = self.store.delete_domain(Some(*node));
        if removed {
            tracing::info!("Member {:?} left {} ({} records purged)", node, self.info.name, purged);
            self.dirty.store(true, Ordering::SeqCst);
            self.ctx.events.folder(FolderEvent::MemberLeft {
                folder: self.info.id,
                node: *node,
            });
        }
        removed
    }

    /// Join connected members that hold this folder; drop those that left.
    pub async fn synchronize_memberships(&self) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        for member in node.members() {
            if !member.is_completely_connected() {
                continue;
            }
            let Some(remote) = member.remote_folders() else {
                continue;
            };
            let id = member.id();
            match (remote.contains(&self.info.id), self.is_member(&id)) {
                (true, false) => {
                    self.join(&member).await;
                }
                (false, true) => {
                    self.remove(&id).await;
                }
                _ => {}
            }
        }
    }

    // ---- Remote deletions ----

    /// Apply deletions announced by members with write permission.
    ///
    /// A local file is only deleted if it still matches the local record, so
    /// changes not yet scanned are never lost. Returns the number of applied
    /// deletions.
    pub async fn sync_remote_deleted_files(&self, force: bool) -> usize {
        if !force && !self.profile().sync_deletion() {
            return 0;
        }
        if !self.check_device() {
            return 0;
        }

        let guard = self.scan_lock.lock().await;
        let mut candidates: HashMap<String, FileRecord> = HashMap::new();
        for node in self.store.member_domains() {
            if !self.permission_for(&node).can_write() {
                continue;
            }
            for remote in self.store.find_all(Some(node)).into_iter().filter(|r| r.deleted) {
                let Some(local) = self.store.find(&remote.path, None) else {
                    continue;
                };
                if local.deleted || !remote.is_newer_than(&local) || self.is_blacklisted(&remote.path)
                {
                    continue;
                }
                let newer = candidates
                    .get(&remote.path)
                    .map_or(true, |seen| remote.is_newer_than(seen));
                if newer {
                    candidates.insert(remote.path.clone(), remote);
                }
            }
        }

        let mut ordered: Vec<FileRecord> = candidates.into_values().collect();
        // Children before their directories
        ordered.sort_by(|a, b| {
            let depth = |r: &FileRecord| r.path.matches('/').count();
            depth(b).cmp(&depth(a)).then_with(|| a.path.cmp(&b.path))
        });

        let mut removed = Vec::new();
        for remote in ordered {
            let Some(local) = self.store.find(&remote.path, None) else {
                continue;
            };
            let applied = match self.disk_state(&local) {
                DiskState::Missing => true,
                DiskState::Differs => {
                    tracing::debug!("Not deleting {}: changed on disk", local.path);
                    false
                }
                DiskState::InSync => match self.delete_from_disk(&local) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!("Failed to delete {}: {}", local.path, e);
                        false
                    }
                },
            };
            if applied {
                removed.extend(self.store.store(None, [remote]));
            }
        }
        drop(guard);

        if removed.is_empty() {
            return 0;
        }
        self.refresh_file_count();
        self.dirty.store(true, Ordering::SeqCst);
        tracing::info!("Applied {} remote deletions in {}", removed.len(), self.info.name);
        self.ctx.events.folder(FolderEvent::RemoteDeletionsApplied {
            folder: self.info.id,
            count: removed.len(),
        });
        self.ctx.events.folder(FolderEvent::FilesChanged {
            folder: self.info.id,
            from: None,
            added: 0,
            removed: removed.len(),
        });
        let count = removed.len();
        self.broadcast_changes(Vec::new(), removed).await;
        count
    }

    /// Apply remote deletions on the I/O pool.
    pub fn trigger_sync_remote_deleted_files(self: &Arc<Self>) {
        self.deletion_sync_requested.store(true, Ordering::SeqCst);
        if self.deletion_sync_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let folder = Arc::clone(self);
        self.ctx.io.spawn("remote-deletions", async move {
            loop {
                while folder.deletion_sync_requested.swap(false, Ordering::SeqCst) {
                    folder.sync_remote_deleted_files(false).await;
                }
                folder.deletion_sync_running.store(false, Ordering::SeqCst);
                if !folder.deletion_sync_requested.load(Ordering::SeqCst)
                    || folder.deletion_sync_running.swap(true, Ordering::SeqCst)
                {
                    break;
                }
            }
        });
    }

    /// Compare a record with the file on disk.
    pub fn disk_state(&self, record: &FileRecord) -> DiskState {
        match fs::symlink_metadata(self.local_path(&record.path)) {
            Ok(metadata) => {
                if metadata.is_dir() != record.directory {
                    DiskState::Differs
                } else if record.directory
                    || (metadata.len() == record.size
                        && modified_millis(&metadata) == record.modified_ms)
                {
                    DiskState::InSync
                } else {
                    DiskState::Differs
                }
            }
            Err(_) => DiskState::Missing,
        }
    }

    fn delete_from_disk(&self, record: &FileRecord) -> io::Result<()> {
        let path = self.local_path(&record.path);
        let result = if record.directory {
            fs::remove_dir(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    // ---- Incoming files ----

    /// Newest version of `path` announced by a member with write permission.
    pub fn newest_remote_version(&self, path: &str) -> Option<FileRecord> {
        self.store
            .member_domains()
            .into_iter()
            .filter(|node| self.permission_for(node).can_write())
            .filter_map(|node| self.store.find(path, Some(node)))
            .reduce(|a, b| if b.is_newer_than(&a) { b } else { a })
    }

    /// Files that members have in a newer version than we do.
    ///
    /// Sorted by path, so directories come before their contents.
    pub fn incoming_files(&self) -> Vec<FileRecord> {
        let mut newest: HashMap<String, FileRecord> = HashMap::new();
        for node in self.store.member_domains() {
            if !self.permission_for(&node).can_write() {
                continue;
            }
            for record in self.store.find_all(Some(node)) {
                match newest.get(&record.path) {
                    Some(seen) if !record.is_newer_than(seen) => {}
                    _ => {
                        newest.insert(record.path.clone(), record);
                    }
                }
            }
        }

        let mut incoming: Vec<FileRecord> = newest
            .into_values()
            .filter(|r| !r.deleted && !is_system_path(&r.path) && !self.is_blacklisted(&r.path))
            .filter(|r| match self.store.find(&r.path, None) {
                Some(local) => r.is_newer_than(&local),
                None => true,
            })
            .collect();
        incoming.sort_by(|a, b| a.path.cmp(&b.path));
        incoming
    }

    /// Members whose domain holds exactly `record`.
    pub fn sources_for(&self, record: &FileRecord) -> Vec<NodeId> {
        self.store
            .member_domains()
            .into_iter()
            .filter(|node| self.permission_for(node).can_write())
            .filter(|node| {
                self.store
                    .find(&record.path, Some(*node))
                    .is_some_and(|r| !r.deleted && r.is_same_version(record))
            })
            .collect()
    }

    /// Create an incoming directory and record it.
    pub async fn apply_incoming_directory(&self, record: FileRecord) -> bool {
        {
            let _scan = self.scan_lock.lock().await;
            if let Err(e) = fs::create_dir_all(self.local_path(&record.path)) {
                tracing::warn!("Failed to create directory {}: {}", record.path, e);
                return false;
            }
        }
        self.file_downloaded(record).await
    }

    /// Move a completed download into place.
    ///
    /// Fails with [`io::ErrorKind::AlreadyExists`] if the target changed on
    /// disk since it was last scanned.
    pub async fn install_file(&self, temp: &Path, record: &FileRecord) -> io::Result<()> {
        let _scan = self.scan_lock.lock().await;
        let target = self.local_path(&record.path);
        let unchanged = match self.find_local(&record.path) {
            Some(local) if !local.deleted => self.disk_state(&local) != DiskState::Differs,
            _ => fs::symlink_metadata(&target).is_err(),
        };
        if !unchanged {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} changed locally", record.path),
            ));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mtime = FileTime::from_unix_time(
            record.modified_ms.div_euclid(1000),
            (record.modified_ms.rem_euclid(1000) * 1_000_000) as u32,
        );
        filetime::set_file_mtime(temp, mtime)?;
        fs::rename(temp, &target)
    }

    /// Record a completed download and announce it.
    pub async fn file_downloaded(&self, record: FileRecord) -> bool {
        let accepted = self.store.store(None, [record]);
        if accepted.is_empty() {
            return false;
        }
        self.refresh_file_count();
        self.dirty.store(true, Ordering::SeqCst);
        self.ctx.events.folder(FolderEvent::FilesChanged {
            folder: self.info.id,
            from: None,
            added: accepted.len(),
            removed: 0,
        });
        self.broadcast_changes(accepted, Vec::new()).await;
        true
    }

    // ---- Broadcasting ----

    fn connected_members(&self) -> Vec<Arc<Member>> {
        let Some(node) = self.node.upgrade() else {
            return Vec::new();
        };
        self.members
            .iter()
            .filter_map(|entry| node.member(entry.key()))
            .filter(|member| member.is_completely_connected())
            .collect()
    }

    /// Send one message to every completely connected member.
    pub async fn broadcast(&self, message: Message) {
        for member in self.connected_members() {
            if let Err(e) = member.send_message(message.clone()).await {
                tracing::debug!("Broadcast to {:?} failed: {}", member.id(), e);
            }
        }
    }

    async fn broadcast_changes(&self, added: Vec<FileRecord>, removed: Vec<FileRecord>) {
        for delta in self.change_messages(added, removed) {
            self.broadcast(Message::FolderFilesChanged(delta)).await;
        }
    }

    fn change_messages(
        &self,
        added: Vec<FileRecord>,
        removed: Vec<FileRecord>,
    ) -> Vec<FolderFilesChanged> {
        let batch = self.ctx.config.folders.file_list_batch_size.max(1);
        if added.len() + removed.len() <= batch {
            return vec![FolderFilesChanged {
                folder: self.info.id,
                added,
                removed,
            }];
        }
        let folder = self.info.id;
        added
            .chunks(batch)
            .map(|chunk| FolderFilesChanged {
                folder,
                added: chunk.to_vec(),
                removed: Vec::new(),
            })
            .chain(removed.chunks(batch).map(|chunk| FolderFilesChanged {
                folder,
                added: Vec::new(),
                removed: chunk.to_vec(),
            }))
            .collect()
    }

    // ---- Persistence and maintenance ----

    /// Write the index if it changed.
    pub fn persist(&self) -> FolderResult<bool> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        match self.save_index() {
            Ok(()) => Ok(true),
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn save_index(&self) -> FolderResult<()> {
        if !self.base.is_dir() {
            return Err(FolderError::DeviceDisconnected {
                path: self.base.clone(),
            });
        }
        let header = IndexHeader {
            folder: self.info.clone(),
            last_scan_ms: self.last_scan_ms(),
            last_synced_ms: self.last_synced_ms(),
            default_permission: self.policy().default_permission,
            members: self.members(),
        };
        let mut writer = RecordWriter::new(FileKind::FolderIndex);
        writer.push(&header)?;
        let mut records = self.store.find_all(None);
        records.sort_by(|a, b| a.path.cmp(&b.path));
        for record in &records {
            writer.push(record)?;
        }
        persist::write_atomic(&self.index_path(), &writer.finish())?;
        tracing::debug!("Saved index of {} ({} records)", self.info.name, records.len());
        Ok(())
    }

    /// Replace the local domain with the persisted index.
    ///
    /// Returns `false` if there is no index yet.
    pub fn load_index(&self) -> FolderResult<bool> {
        let bytes = match fs::read(self.index_path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let mut reader = RecordReader::new(&bytes, FileKind::FolderIndex)?;
        let header: IndexHeader = reader.next()?.ok_or(PersistError::Truncated)?;
        if header.folder.id != self.info.id {
            tracing::warn!(
                "Index in {} belongs to another folder, ignoring",
                self.base.display()
            );
            return Ok(false);
        }
        let records: Vec<FileRecord> = reader.collect_all()?;

        self.store.replace_domain(None, records);
        self.last_scan_ms.store(header.last_scan_ms, Ordering::SeqCst);
        self.last_synced_ms
            .store(header.last_synced_ms, Ordering::SeqCst);
        self.policy_mut().default_permission = header.default_permission;
        for member in header.members {
            self.members.insert(member.id, member);
        }
        self.has_own_database.store(true, Ordering::SeqCst);
        self.refresh_file_count();
        Ok(true)
    }

    /// Purge expired tombstones.
    pub fn maintain(&self) -> usize {
        let retention_ms = i64::try_from(self.ctx.config.folders.tombstone_retention_days)
            .unwrap_or(i64::MAX / 86_400_000)
            .saturating_mul(86_400_000);
        let cutoff = now_millis().saturating_sub(retention_ms);
        let purged = self.store.purge_tombstones(cutoff);
        if purged > 0 {
            tracing::info!("Purged {} expired tombstones from {}", purged, self.info.name);
            self.dirty.store(true, Ordering::SeqCst);
        }
        purged
    }
}
