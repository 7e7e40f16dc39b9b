//! Multi-source download of one file version.
//!
//! A [`DownloadManager`] owns the temp file and the received ranges of one
//! target version. Each source partner has a [`Download`] with its own queue
//! of outstanding part requests; the manager hands out ranges nobody else has
//! requested, so parts are fetched in parallel from every active source.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use sync_core::{
    FileProgress, PartRange, PartRequestQueue, RangeSet, TransferEvent as StateEvent,
    TransferProblem, TransferState,
};
use sync_types::{FileRecord, NodeId};

use crate::config::TransfersConfig;
use crate::folder::Folder;
use crate::scanner::{SYSTEM_DIR, TEMP_SUFFIX};

const INCOMPLETE_DIR: &str = "incomplete";

/// One source of a download.
#[derive(Debug)]
pub struct Download {
    partner: NodeId,
    is_lan: bool,
    state: TransferState,
    requests: PartRequestQueue,
    last_activity: Instant,
    awaiting_first_part: bool,
}

impl Download {
    fn new(partner: NodeId, is_lan: bool, max_pending: usize) -> Self {
        Self {
            partner,
            is_lan,
            state: TransferState::Pending,
            requests: PartRequestQueue::new(max_pending.max(1)),
            last_activity: Instant::now(),
            awaiting_first_part: true,
        }
    }

    /// Source partner.
    pub fn partner(&self) -> NodeId {
        self.partner
    }

    /// Whether the partner is on the local network.
    pub fn is_lan(&self) -> bool {
        self.is_lan
    }

    /// Current state.
    pub fn state(&self) -> &TransferState {
        &self.state
    }

    fn timeout_problem(&self, config: &TransfersConfig) -> Option<TransferProblem> {
        let idle = self.last_activity.elapsed();
        match self.state {
            TransferState::Pending
                if idle.as_secs() >= config.queue_ack_timeout_secs =>
            {
                Some(TransferProblem::NotAcknowledged)
            }
            TransferState::Active if idle >= config.part_timeout(self.awaiting_first_part) => {
                Some(TransferProblem::Timeout)
            }
            _ => None,
        }
    }
}

#[derive(Debug)]
struct ManagerInner {
    sources: HashMap<NodeId, Download>,
    progress: FileProgress,
    problem: Option<TransferProblem>,
}

/// Download of one file version from one or more sources.
#[derive(Debug)]
pub struct DownloadManager {
    file: FileRecord,
    folder: Arc<Folder>,
    automatic: bool,
    temp_path: PathBuf,
    inner: Mutex<ManagerInner>,
    done: AtomicBool,
    file_lock: tokio::sync::Mutex<()>,
}

impl DownloadManager {
    /// Create a manager, resuming from `received` if given.
    pub fn new(
        folder: Arc<Folder>,
        file: FileRecord,
        automatic: bool,
        received: Option<RangeSet>,
    ) -> Self {
        let temp_path = temp_path(folder.base(), &file.path);
        let progress = match received {
            Some(ranges) if temp_path.is_file() => FileProgress::resume(file.size, ranges),
            _ => FileProgress::new(file.size),
        };
        Self {
            file,
            folder,
            automatic,
            temp_path,
            inner: Mutex::new(ManagerInner {
                sources: HashMap::new(),
                progress,
                problem: None,
            }),
            done: AtomicBool::new(false),
            file_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Target version.
    pub fn file(&self) -> &FileRecord {
        &self.file
    }

    /// Folder the file belongs to.
    pub fn folder(&self) -> &Arc<Folder> {
        &self.folder
    }

    /// Whether the download was started by the automatic check.
    pub fn is_automatic(&self) -> bool {
        self.automatic
    }

    /// Temp file receiving the content.
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Add a source. Returns `false` if it is already a source.
    pub fn add_source(&self, partner: NodeId, is_lan: bool, max_pending: usize) -> bool {
        let mut inner = self.inner();
        if inner.sources.contains_key(&partner) {
            return false;
        }
        inner
            .sources
            .insert(partner, Download::new(partner, is_lan, max_pending));
        true
    }

    /// Whether `partner` is a source.
    pub fn has_source(&self, partner: &NodeId) -> bool {
        self.inner().sources.contains_key(partner)
    }

    /// Current sources.
    pub fn sources(&self) -> Vec<NodeId> {
        self.inner().sources.keys().copied().collect()
    }

    /// Number of sources.
    pub fn source_count(&self) -> usize {
        self.inner().sources.len()
    }

    /// Whether any source is sending.
    pub fn is_active(&self) -> bool {
        self.inner()
            .sources
            .values()
            .any(|source| source.state.is_active())
    }

    /// Whether `partner` is an active source.
    pub fn is_source_active(&self, partner: &NodeId) -> bool {
        self.inner()
            .sources
            .get(partner)
            .is_some_and(|source| source.state.is_active())
    }

    /// The source queued the request.
    pub fn source_queued(&self, partner: &NodeId) -> bool {
        self.transition(partner, StateEvent::Queued, TransferState::Queued)
    }

    /// The source started sending.
    pub fn source_started(&self, partner: &NodeId) -> bool {
        self.transition(partner, StateEvent::Started, TransferState::Active)
    }

    fn transition(&self, partner: &NodeId, event: StateEvent, expected: TransferState) -> bool {
        let mut inner = self.inner();
        let Some(source) = inner.sources.get_mut(partner) else {
            return false;
        };
        let next = source.state.clone().on_event(event);
        if next != expected || source.state == expected {
            return false;
        }
        source.state = next;
        source.last_activity = Instant::now();
        true
    }

    /// Reserve ranges for `partner` until its request queue is full.
    pub fn fill_requests(&self, partner: &NodeId, chunk_size: u32) -> Vec<PartRange> {
        let mut guard = self.inner();
        let ManagerInner {
            sources, progress, ..
        } = &mut *guard;
        let Some(source) = sources.get_mut(partner) else {
            return Vec::new();
        };
        if !source.state.is_active() {
            return Vec::new();
        }

        let mut requested = Vec::new();
        for _ in 0..source.requests.free_slots() {
            let Some(range) = progress.next_request(u64::from(chunk_size.max(1))) else {
                break;
            };
            if source.requests.push(range).is_err() {
                progress.release(&[range]);
                break;
            }
            requested.push(range);
        }
        requested
    }

    /// Whether `partner` has an outstanding request covering `range`.
    pub fn is_requested(&self, partner: &NodeId, range: PartRange) -> bool {
        self.inner()
            .sources
            .get(partner)
            .is_some_and(|source| source.requests.is_requested(&range))
    }

    /// Whether the bytes of `range` are already on disk.
    pub fn is_received(&self, range: PartRange) -> bool {
        self.inner().progress.is_received(range)
    }

    /// Record a written chunk. Returns whether the file is complete.
    pub fn chunk_written(&self, partner: &NodeId, range: PartRange) -> bool {
        let mut inner = self.inner();
        inner.progress.mark_received(range);
        if let Some(source) = inner.sources.get_mut(partner) {
            source.requests.chunk_received(range);
            source.last_activity = Instant::now();
            source.awaiting_first_part = false;
        }
        inner.progress.is_complete()
    }

    /// Whether every byte arrived.
    pub fn is_complete(&self) -> bool {
        self.inner().progress.is_complete()
    }

    /// Drop a source and hand its outstanding ranges back.
    ///
    /// Returns `None` if `partner` was not a source, otherwise whether no
    /// source is left.
    pub fn remove_source(&self, partner: &NodeId) -> Option<bool> {
        let mut inner = self.inner();
        let mut source = inner.sources.remove(partner)?;
        let outstanding = source.requests.drain();
        inner.progress.release(&outstanding);
        Some(inner.sources.is_empty())
    }

    /// Remove every source.
    pub fn drain_sources(&self) -> Vec<NodeId> {
        let mut inner = self.inner();
        let partners: Vec<NodeId> = inner.sources.keys().copied().collect();
        let outstanding: Vec<PartRange> = inner
            .sources
            .values_mut()
            .flat_map(|source| source.requests.drain())
            .collect();
        inner.sources.clear();
        inner.progress.release(&outstanding);
        partners
    }

    /// Sources that exceeded their timeout.
    pub fn timed_out_sources(&self, config: &TransfersConfig) -> Vec<(NodeId, TransferProblem)> {
        self.inner()
            .sources
            .values()
            .filter_map(|source| source.timeout_problem(config).map(|p| (source.partner, p)))
            .collect()
    }

    /// Finish the manager. Only the first call returns `true`.
    pub fn mark_done(&self, problem: Option<TransferProblem>) -> bool {
        if self
            .done
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.inner().problem = problem;
        true
    }

    /// Whether the manager completed or broke.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Break reason, once broken.
    pub fn problem(&self) -> Option<TransferProblem> {
        self.inner().problem.clone()
    }

    /// Received ranges.
    pub fn received(&self) -> RangeSet {
        self.inner().progress.received().clone()
    }

    /// Received bytes.
    pub fn received_bytes(&self) -> u64 {
        self.inner().progress.received_bytes()
    }

    /// Length of the contiguous prefix already received.
    pub fn start_offset(&self) -> u64 {
        let inner = self.inner();
        inner
            .progress
            .received()
            .first_gap(self.file.size)
            .map_or(self.file.size, |(start, _)| start)
    }

    /// Write chunk content into the temp file.
    pub async fn write_chunk(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let _guard = self.file_lock.lock().await;
        if let Some(parent) = self.temp_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.temp_path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await
    }

    /// Make sure the temp file exists with the target length.
    pub async fn prepare_for_install(&self) -> std::io::Result<()> {
        let _guard = self.file_lock.lock().await;
        if let Some(parent) = self.temp_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.temp_path)
            .await?;
        file.set_len(self.file.size).await?;
        file.sync_all().await
    }

    /// Delete the temp file.
    pub async fn discard_temp(&self) {
        let _guard = self.file_lock.lock().await;
        match tokio::fs::remove_file(&self.temp_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::debug!("Failed to remove {}: {}", self.temp_path.display(), e),
        }
    }
}

/// Temp file of a download of `path` inside `base`.
pub fn temp_path(base: &Path, path: &str) -> PathBuf {
    let name = format!("{}{}", hex::encode(blake3::hash(path.as_bytes()).as_bytes()), TEMP_SUFFIX);
    base.join(SYSTEM_DIR).join(INCOMPLETE_DIR).join(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::context::EngineContext;
    use crate::folder::FolderSettings;
    use std::sync::Weak;
    use sync_types::{FolderId, FolderInfo, NodeInfo};

    fn manager(dir: &Path, size: u64) -> DownloadManager {
        let ctx = EngineContext::new(
            EngineConfig::default(),
            NodeInfo::new(NodeId::random(), "local"),
        );
        let info = FolderInfo::new(FolderId::from_key(b"f"), "f");
        let folder = Folder::new(ctx, Weak::new(), FolderSettings::new(info, dir)).unwrap();
        let file = FileRecord::new_file(folder.id(), "big.bin", size, 1_000, NodeId::random());
        DownloadManager::new(folder, file, true, None)
    }

    #[test]
    fn sources_share_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 100);
        let (a, b) = (NodeId::random(), NodeId::random());
        assert!(mgr.add_source(a, true, 2));
        assert!(mgr.add_source(b, false, 2));
        assert!(!mgr.add_source(a, true, 2));

        // Not active yet
        assert!(mgr.fill_requests(&a, 10).is_empty());

        assert!(mgr.source_queued(&a));
        assert!(mgr.source_started(&a));
        assert!(mgr.source_started(&b));
        let from_a = mgr.fill_requests(&a, 10);
        let from_b = mgr.fill_requests(&b, 10);
        assert_eq!(from_a, vec![PartRange::new(0, 10), PartRange::new(10, 10)]);
        assert_eq!(from_b, vec![PartRange::new(20, 10), PartRange::new(30, 10)]);
    }

    #[test]
    fn removed_source_releases_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 30);
        let (a, b) = (NodeId::random(), NodeId::random());
        mgr.add_source(a, true, 5);
        mgr.add_source(b, true, 5);
        mgr.source_started(&a);
        mgr.source_started(&b);

        assert_eq!(mgr.fill_requests(&a, 10).len(), 3);
        assert!(mgr.fill_requests(&b, 10).is_empty());

        assert_eq!(mgr.remove_source(&a), Some(false));
        assert_eq!(mgr.fill_requests(&b, 10).len(), 3);
        assert_eq!(mgr.remove_source(&b), Some(true));
        assert_eq!(mgr.remove_source(&b), None);
    }

    #[tokio::test]
    async fn chunks_complete_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 20);
        let a = NodeId::random();
        mgr.add_source(a, true, 5);
        mgr.source_started(&a);
        let ranges = mgr.fill_requests(&a, 10);

        mgr.write_chunk(10, &[2u8; 10]).await.unwrap();
        assert!(!mgr.chunk_written(&a, ranges[1]));
        assert_eq!(mgr.start_offset(), 0);

        mgr.write_chunk(0, &[1u8; 10]).await.unwrap();
        assert!(mgr.chunk_written(&a, ranges[0]));
        assert_eq!(mgr.start_offset(), 20);

        let content = std::fs::read(mgr.temp_path()).unwrap();
        assert_eq!(&content[..10], &[1u8; 10]);
        assert_eq!(&content[10..], &[2u8; 10]);
    }

    #[test]
    fn done_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 1);
        assert!(mgr.mark_done(Some(TransferProblem::Timeout)));
        assert!(!mgr.mark_done(None));
        assert_eq!(mgr.problem(), Some(TransferProblem::Timeout));
    }

    #[test]
    fn unacknowledged_source_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 1);
        let a = NodeId::random();
        mgr.add_source(a, true, 5);
        let config = TransfersConfig {
            queue_ack_timeout_secs: 0,
            ..TransfersConfig::default()
        };
        assert_eq!(
            mgr.timed_out_sources(&config),
            vec![(a, TransferProblem::NotAcknowledged)]
        );

        // Queued sources wait for a slot without a timeout
        mgr.source_queued(&a);
        assert!(mgr.timed_out_sources(&config).is_empty());
    }

    #[test]
    fn first_part_has_its_own_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 20);
        let a = NodeId::random();
        mgr.add_source(a, true, 5);
        mgr.source_started(&a);
        let waiting_for_first = TransfersConfig {
            first_part_timeout_secs: 0,
            part_timeout_secs: 3_600,
            ..TransfersConfig::default()
        };
        let waiting_for_next = TransfersConfig {
            first_part_timeout_secs: 3_600,
            part_timeout_secs: 0,
            ..TransfersConfig::default()
        };
        assert_eq!(
            mgr.timed_out_sources(&waiting_for_first),
            vec![(a, TransferProblem::Timeout)]
        );
        assert!(mgr.timed_out_sources(&waiting_for_next).is_empty());

        let ranges = mgr.fill_requests(&a, 10);
        mgr.chunk_written(&a, ranges[0]);
        assert!(mgr.timed_out_sources(&waiting_for_first).is_empty());
        assert_eq!(
            mgr.timed_out_sources(&waiting_for_next),
            vec![(a, TransferProblem::Timeout)]
        );
    }

    #[test]
    fn only_outstanding_ranges_are_requested() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 100);
        let (a, b) = (NodeId::random(), NodeId::random());
        mgr.add_source(a, true, 3);
        mgr.add_source(b, true, 3);
        mgr.source_started(&a);
        mgr.source_started(&b);

        assert_eq!(mgr.fill_requests(&a, 10).len(), 3);
        assert!(mgr.is_requested(&a, PartRange::new(10, 10)));
        assert!(mgr.is_requested(&a, PartRange::new(12, 5)));
        assert!(!mgr.is_requested(&b, PartRange::new(10, 10)));
        assert!(!mgr.is_requested(&a, PartRange::new(30, 10)));

        mgr.chunk_written(&a, PartRange::new(0, 10));
        assert!(!mgr.is_requested(&a, PartRange::new(0, 10)));
        assert_eq!(mgr.fill_requests(&a, 10), vec![PartRange::new(30, 10)]);
        assert!(mgr.fill_requests(&a, 10).is_empty());
    }

    #[test]
    fn temp_files_live_in_system_dir() {
        let path = temp_path(Path::new("/base"), "a/b.txt");
        assert!(path.starts_with("/base/.foldsync/incomplete"));
        assert!(path.to_string_lossy().ends_with(".fsdownload"));
        assert_ne!(path, temp_path(Path::new("/base"), "a/c.txt"));
    }
}
