//! Transfer manager.
//!
//! Schedules uploads to and downloads from members:
//! - downloads fetch one file version from every member holding it, with a
//!   bounded queue of part requests per source,
//! - uploads are queued per partner and started under a slot policy,
//! - a maintenance loop breaks stalled transfers, retries pending downloads
//!   and triggers automatic downloads.
//!
//! Every transfer breaks exactly once, with a typed [`TransferProblem`].

pub mod bandwidth;
mod download;
mod upload;

use std::collections::{HashMap, HashSet};
use std::io::{self, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use sync_core::{PartRange, RangeSet, TransferProblem};
use sync_types::{
    now_millis, DownloadQueued, FileChunk, FileKey, FileRecord, Message, NodeId, RequestDownload,
    RequestPart, TransferFile, TransferStatus,
};

use crate::context::EngineContext;
use crate::error::PersistResult;
use crate::events::TransferEvent;
use crate::folder::{DiskState, Folder};
use crate::member::Member;
use crate::node::SyncNode;
use crate::persist::{self, FileKind, RecordReader, RecordWriter};
use crate::scanner::is_system_path;

pub use bandwidth::{BandwidthLimiter, BandwidthLimits, Direction, LimitSettings};
pub use download::{temp_path, Download, DownloadManager};
pub use upload::Upload;

/// Entry of the transfers file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedDownload {
    file: FileRecord,
    automatic: bool,
    received: Option<RangeSet>,
}

/// Coordinates all uploads and downloads of a node.
#[derive(Debug)]
pub struct TransferManager {
    ctx: Arc<EngineContext>,
    node: Weak<SyncNode>,
    downloads: Mutex<HashMap<FileKey, Arc<DownloadManager>>>,
    pending: Mutex<HashMap<FileKey, FileRecord>>,
    uploads: Mutex<Vec<Arc<Upload>>>,
    resume: Mutex<HashMap<FileKey, (FileRecord, RangeSet)>>,
    bandwidth: BandwidthLimits,
    wake: Notify,
    dirty: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TransferManager {
    /// Create a manager for `node`.
    pub fn new(ctx: Arc<EngineContext>, node: Weak<SyncNode>) -> Self {
        let bandwidth = BandwidthLimits::from_config(&ctx.config.transfers);
        Self {
            ctx,
            node,
            downloads: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            uploads: Mutex::new(Vec::new()),
            resume: Mutex::new(HashMap::new()),
            bandwidth,
            wake: Notify::new(),
            dirty: AtomicBool::new(false),
        }
    }

    /// Shared bandwidth limiters.
    pub fn bandwidth(&self) -> &BandwidthLimits {
        &self.bandwidth
    }

    /// Running download of `key`.
    pub fn download(&self, key: &FileKey) -> Option<Arc<DownloadManager>> {
        lock(&self.downloads).get(key).cloned()
    }

    /// All running downloads.
    pub fn active_downloads(&self) -> Vec<Arc<DownloadManager>> {
        lock(&self.downloads).values().cloned().collect()
    }

    /// Requested downloads waiting for a source.
    pub fn pending_downloads(&self) -> Vec<FileRecord> {
        lock(&self.pending).values().cloned().collect()
    }

    /// Queued and active uploads.
    pub fn uploads(&self) -> Vec<Arc<Upload>> {
        lock(&self.uploads).clone()
    }

    /// Summary counters.
    pub fn status(&self) -> TransferStatus {
        let uploads = self.uploads();
        let count = |n: usize| u32::try_from(n).unwrap_or(u32::MAX);
        TransferStatus {
            active_uploads: count(uploads.iter().filter(|u| u.is_active()).count()),
            queued_uploads: count(uploads.iter().filter(|u| u.is_queued()).count()),
            active_downloads: count(
                self.active_downloads()
                    .iter()
                    .filter(|d| d.is_active())
                    .count(),
            ),
            pending_downloads: count(lock(&self.pending).len()),
        }
    }

    fn member(&self, id: &NodeId) -> Option<Arc<Member>> {
        self.node.upgrade().and_then(|node| node.member(id))
    }

    async fn send_to(&self, partner: &NodeId, message: Message) -> bool {
        let Some(member) = self.member(partner) else {
            return false;
        };
        match member.send_message(message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Transfer message to {:?} failed: {}", partner, e);
                false
            }
        }
    }

    fn is_lan(&self, partner: &NodeId) -> bool {
        self.member(partner).is_some_and(|m| m.is_lan())
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    // ---- Downloads ----

    fn downloads_from(&self, partner: &NodeId) -> usize {
        lock(&self.downloads)
            .values()
            .filter(|d| d.has_source(partner))
            .count()
    }

    fn usable_sources(&self, folder: &Folder, file: &FileRecord) -> Vec<Arc<Member>> {
        let Some(node) = self.node.upgrade() else {
            return Vec::new();
        };
        let config = &self.ctx.config.transfers;
        folder
            .sources_for(file)
            .into_iter()
            .filter_map(|id| node.member(&id))
            .filter(|member| member.is_completely_connected())
            .filter(|member| {
                let cap = if member.is_lan() {
                    config.max_downloads_per_lan_partner
                } else {
                    config.max_downloads_per_wan_partner
                };
                self.downloads_from(&member.id()) < cap
            })
            .collect()
    }

    /// Download the newest announced version of `file` from every member
    /// holding exactly that version.
    ///
    /// A running download of an older version is aborted and replaced. With
    /// no usable source a manual request is parked until one appears, an
    /// automatic one is dropped.
    pub async fn download_newest_version(
        &self,
        folder: &Arc<Folder>,
        file: FileRecord,
        automatic: bool,
    ) -> Option<Arc<DownloadManager>> {
        let file = match folder.newest_remote_version(&file.path) {
            Some(newest) if newest.is_newer_than(&file) => newest,
            _ => file,
        };
        if file.deleted || is_system_path(&file.path) || folder.is_blacklisted(&file.path) {
            return None;
        }
        if file.directory {
            folder.apply_incoming_directory(file).await;
            return None;
        }

        let key = file.key();
        if let Some(existing) = self.download(&key) {
            if !file.is_newer_than(existing.file()) {
                self.add_sources(&existing).await;
                return Some(existing);
            }
            tracing::info!("Newer version of {} available, restarting download", key);
            self.break_download(&existing, TransferProblem::NewerVersionAvailable)
                .await;
        }

        let sources = self.usable_sources(folder, &file);
        if sources.is_empty() {
            if !automatic {
                tracing::info!("No source for {}, download pending", key);
                lock(&self.pending).insert(key, file.clone());
                self.mark_dirty();
                self.ctx
                    .events
                    .transfer(TransferEvent::DownloadPending { file });
            }
            return None;
        }

        let resume = lock(&self.resume)
            .get(&key)
            .filter(|(record, _)| record.is_same_version(&file))
            .map(|(_, ranges)| ranges.clone());
        let manager = Arc::new(DownloadManager::new(
            Arc::clone(folder),
            file.clone(),
            automatic,
            resume,
        ));
        {
            let mut downloads = lock(&self.downloads);
            if let Some(raced) = downloads.get(&key) {
                if !file.is_newer_than(raced.file()) {
                    return Some(Arc::clone(raced));
                }
            }
            downloads.insert(key.clone(), Arc::clone(&manager));
        }
        lock(&self.pending).remove(&key);
        self.mark_dirty();

        let asked = self.request_from(&manager, sources).await;
        if asked.is_empty() {
            self.break_download(&manager, TransferProblem::PartnerDisconnected)
                .await;
            return None;
        }
        tracing::info!("Downloading {} from {} source(s)", key, asked.len());
        self.ctx.events.transfer(TransferEvent::DownloadRequested {
            file,
            sources: asked,
            automatic,
        });
        Some(manager)
    }

    async fn add_sources(&self, manager: &Arc<DownloadManager>) {
        let sources = self.usable_sources(manager.folder(), manager.file());
        let fresh: Vec<Arc<Member>> = sources
            .into_iter()
            .filter(|m| !manager.has_source(&m.id()))
            .collect();
        if !fresh.is_empty() {
            self.request_from(manager, fresh).await;
        }
    }

    async fn request_from(
        &self,
        manager: &Arc<DownloadManager>,
        sources: Vec<Arc<Member>>,
    ) -> Vec<NodeId> {
        let max_pending = self.ctx.config.transfers.max_pending_part_requests;
        let request = Message::RequestDownload(RequestDownload {
            file: manager.file().clone(),
            start_offset: manager.start_offset(),
        });
        let mut asked = Vec::new();
        for member in sources {
            let id = member.id();
            if !manager.add_source(id, member.is_lan(), max_pending) {
                continue;
            }
            match member.send_message(request.clone()).await {
                Ok(()) => asked.push(id),
                Err(e) => {
                    tracing::debug!("Download request to {:?} failed: {}", id, e);
                    manager.remove_source(&id);
                }
            }
        }
        asked
    }

    /// Abort a download on user request.
    pub async fn abort_download(&self, key: &FileKey) -> bool {
        let removed_pending = lock(&self.pending).remove(key).is_some();
        match self.download(key) {
            Some(manager) => {
                self.break_download(&manager, TransferProblem::AbortedLocally)
                    .await;
                true
            }
            None => removed_pending,
        }
    }

    async fn break_source(
        &self,
        manager: &Arc<DownloadManager>,
        partner: NodeId,
        problem: TransferProblem,
    ) {
        let Some(last) = manager.remove_source(&partner) else {
            return;
        };
        tracing::debug!(
            "Source {:?} of {} broke: {}",
            partner,
            manager.file().key(),
            problem
        );
        if tell_partner(&problem) {
            let abort = TransferFile::with_reason(manager.file().clone(), problem.to_string());
            self.send_to(&partner, Message::AbortDownload(abort)).await;
        }
        if last {
            self.break_download(manager, problem).await;
        } else {
            // Released ranges go to the remaining sources
            self.trigger_maintenance();
        }
    }

    async fn break_download(&self, manager: &Arc<DownloadManager>, problem: TransferProblem) {
        if !manager.mark_done(Some(problem.clone())) {
            return;
        }
        self.finish_broken(manager, problem).await;
    }

    async fn finish_broken(&self, manager: &Arc<DownloadManager>, problem: TransferProblem) {
        let file = manager.file().clone();
        let key = file.key();
        self.remove_manager(manager);

        for partner in manager.drain_sources() {
            if tell_partner(&problem) {
                let abort = TransferFile::with_reason(file.clone(), problem.to_string());
                self.send_to(&partner, Message::AbortDownload(abort)).await;
            }
        }

        if keeps_partial_content(&problem) && manager.received_bytes() > 0 {
            lock(&self.resume).insert(key.clone(), (file.clone(), manager.received()));
        } else {
            lock(&self.resume).remove(&key);
            manager.discard_temp().await;
        }
        if !manager.is_automatic() && is_retryable(&problem) {
            lock(&self.pending).insert(key.clone(), file.clone());
        }
        self.mark_dirty();

        tracing::info!("Download of {} broken: {}", key, problem);
        self.ctx
            .events
            .transfer(TransferEvent::DownloadBroken { file, problem });
    }

    fn remove_manager(&self, manager: &Arc<DownloadManager>) {
        let key = manager.file().key();
        let mut downloads = lock(&self.downloads);
        if downloads
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, manager))
        {
            downloads.remove(&key);
        }
    }

    async fn request_parts(&self, manager: &Arc<DownloadManager>, partner: &NodeId) {
        let chunk_size = self.ctx.config.transfers.chunk_size;
        for range in manager.fill_requests(partner, chunk_size) {
            let request = Message::RequestPart(RequestPart {
                file: manager.file().clone(),
                offset: range.offset,
                length: u32::try_from(range.length).unwrap_or(chunk_size),
            });
            if !self.send_to(partner, request).await {
                self.break_source(manager, *partner, TransferProblem::PartnerDisconnected)
                    .await;
                return;
            }
        }
    }

    async fn complete_download(&self, manager: &Arc<DownloadManager>) {
        if !manager.mark_done(None) {
            return;
        }
        let file = manager.file().clone();
        let folder = Arc::clone(manager.folder());

        let installed = match manager.prepare_for_install().await {
            Ok(()) => folder.install_file(manager.temp_path(), &file).await,
            Err(e) => Err(e),
        };
        if let Err(e) = installed {
            let problem = if e.kind() == io::ErrorKind::AlreadyExists {
                folder.trigger_scan();
                TransferProblem::FileChanged
            } else {
                TransferProblem::Io(e.to_string())
            };
            self.finish_broken(manager, problem).await;
            return;
        }

        self.remove_manager(manager);
        lock(&self.resume).remove(&file.key());
        self.mark_dirty();
        for partner in manager.drain_sources() {
            self.send_to(&partner, Message::StopUpload(TransferFile::new(file.clone())))
                .await;
        }
        tracing::info!("Downloaded {} ({} bytes)", file.key(), file.size);
        folder.file_downloaded(file.clone()).await;
        self.ctx
            .events
            .transfer(TransferEvent::DownloadCompleted { file });
    }

    /// A source queued our request.
    pub async fn on_download_queued(&self, from: NodeId, queued: DownloadQueued) {
        let Some(manager) = self.download(&queued.file.key()) else {
            return;
        };
        if manager.file().is_same_version(&queued.file) && manager.source_queued(&from) {
            self.ctx.events.transfer(TransferEvent::DownloadQueued {
                file: queued.file,
                from,
            });
        }
    }

    /// A source started sending.
    pub async fn on_start_upload(&self, from: NodeId, start: TransferFile) {
        let Some(manager) = self.download(&start.file.key()) else {
            tracing::debug!("StartUpload for unknown download {}", start.file.key());
            return;
        };
        if !manager.file().is_same_version(&start.file) || !manager.source_started(&from) {
            return;
        }
        self.ctx.events.transfer(TransferEvent::DownloadStarted {
            file: start.file,
            from,
        });
        if manager.is_complete() {
            self.complete_download(&manager).await;
        } else {
            self.request_parts(&manager, &from).await;
        }
    }

    /// File content arrived.
    pub async fn on_chunk(&self, from: NodeId, chunk: FileChunk) {
        let Some(manager) = self.download(&chunk.file.key()) else {
            tracing::debug!("Chunk for unknown download {}", chunk.file.key());
            return;
        };
        if !manager.file().is_same_version(&chunk.file) || !manager.is_source_active(&from) {
            return;
        }

        let range = PartRange::new(chunk.offset, chunk.data.len() as u64);
        if !chunk.data.is_empty() && !manager.is_requested(&from, range) {
            tracing::debug!(
                "Ignoring unrequested chunk of {} at {} from {:?}",
                chunk.file.key(),
                chunk.offset,
                from
            );
            return;
        }
        let valid = !chunk.data.is_empty()
            && range.end() <= manager.file().size
            && blake3::hash(&chunk.data).as_bytes() == &chunk.checksum;
        if !valid {
            tracing::warn!(
                "Invalid chunk of {} at {} from {:?}",
                chunk.file.key(),
                chunk.offset,
                from
            );
            self.break_source(&manager, from, TransferProblem::InvalidChunk)
                .await;
            return;
        }

        if !manager.is_received(range) {
            self.bandwidth
                .acquire(Direction::Download, self.is_lan(&from), chunk.data.len())
                .await;
            if let Err(e) = manager.write_chunk(chunk.offset, &chunk.data).await {
                tracing::warn!("Failed to write {}: {}", chunk.file.key(), e);
                self.break_download(&manager, TransferProblem::Io(e.to_string()))
                    .await;
                return;
            }
        }

        if manager.chunk_written(&from, range) {
            self.complete_download(&manager).await;
        } else {
            self.request_parts(&manager, &from).await;
        }
    }

    /// A source aborted our download.
    pub async fn on_abort_upload(&self, from: NodeId, abort: TransferFile) {
        let Some(manager) = self.download(&abort.file.key()) else {
            return;
        };
        if !manager.file().is_same_version(&abort.file) {
            return;
        }
        let problem = match abort.reason {
            Some(reason) => TransferProblem::Rejected(reason),
            None => TransferProblem::AbortedByPartner,
        };
        self.break_source(&manager, from, problem).await;
    }

    // ---- Uploads ----

    async fn reject_upload(&self, to: &NodeId, file: FileRecord, reason: &str) {
        tracing::debug!("Rejecting upload of {} to {:?}: {}", file.key(), to, reason);
        self.send_to(to, Message::AbortUpload(TransferFile::with_reason(file, reason)))
            .await;
    }

    /// A member asks for a file.
    pub async fn queue_upload(&self, from: NodeId, request: RequestDownload) {
        let file = request.file;
        let Some(node) = self.node.upgrade() else {
            return;
        };
        let Some(member) = node.member(&from) else {
            return;
        };
        if is_system_path(&file.path) || file.directory || file.deleted {
            self.reject_upload(&from, file, "not a transferable file").await;
            return;
        }
        let Some(folder) = node.folder(&file.folder) else {
            self.reject_upload(&from, file, "unknown folder").await;
            return;
        };
        if !folder.is_member(&from) || !folder.permission_for(&from).can_read() {
            self.reject_upload(&from, file, "not a member of the folder").await;
            return;
        }
        let local = match folder.find_local(&file.path) {
            Some(local) if !local.deleted && local.is_same_version(&file) => local,
            _ => {
                self.reject_upload(&from, file, "version not available").await;
                return;
            }
        };
        if folder.disk_state(&local) != DiskState::InSync {
            folder.trigger_scan();
            self.reject_upload(&from, file, "file changed on disk").await;
            return;
        }

        let key = local.key();
        let replaced: Vec<Arc<Upload>> = {
            let mut uploads = lock(&self.uploads);
            let (old, keep): (Vec<_>, Vec<_>) = uploads
                .drain(..)
                .partition(|u| u.matches(&from, &key));
            *uploads = keep;
            old
        };
        for old in replaced {
            old.break_with(TransferProblem::AbortedByPartner);
        }

        let upload = Arc::new(Upload::new(local.clone(), from, member.is_lan()));
        lock(&self.uploads).push(upload);
        tracing::debug!("Upload of {} to {:?} queued", key, from);
        if !self
            .send_to(&from, Message::DownloadQueued(DownloadQueued { file: local.clone() }))
            .await
        {
            self.drop_uploads_to(&from, TransferProblem::PartnerDisconnected, false)
                .await;
            return;
        }
        self.ctx.events.transfer(TransferEvent::UploadQueued {
            file: local,
            to: from,
        });
        self.start_uploads().await;
    }

    /// Start queued uploads that fit the slot policy.
    ///
    /// LAN partners are always served. At most `max_uploads` distinct WAN
    /// partners are served at once, and a partner with more than
    /// `max_upload_bytes_in_flight` remaining gets no further upload.
    pub async fn start_uploads(&self) {
        for upload in self.admit_uploads() {
            let file = upload.file().clone();
            let partner = upload.partner();
            if self
                .send_to(&partner, Message::StartUpload(TransferFile::new(file.clone())))
                .await
            {
                tracing::debug!("Upload of {} to {:?} started", file.key(), partner);
                self.ctx
                    .events
                    .transfer(TransferEvent::UploadStarted { file, to: partner });
            } else {
                self.break_upload(&upload, TransferProblem::PartnerDisconnected, false)
                    .await;
            }
        }
    }

    /// Move the queued uploads that fit into the active state.
    ///
    /// Counting and starting happen under one lock of the upload list, so
    /// concurrent callers never admit more partners than the policy allows.
    fn admit_uploads(&self) -> Vec<Arc<Upload>> {
        let config = &self.ctx.config.transfers;
        let uploads = lock(&self.uploads);
        let mut wan_partners: HashSet<NodeId> = uploads
            .iter()
            .filter(|u| u.is_active() && !u.is_lan())
            .map(|u| u.partner())
            .collect();
        let mut in_flight: HashMap<NodeId, u64> = HashMap::new();
        for upload in uploads.iter().filter(|u| u.is_active()) {
            *in_flight.entry(upload.partner()).or_default() += upload.remaining_bytes();
        }

        let mut started = Vec::new();
        for upload in uploads.iter().filter(|u| u.is_queued()) {
            let partner = upload.partner();
            if !upload.is_lan()
                && !wan_partners.contains(&partner)
                && wan_partners.len() >= config.max_uploads
            {
                continue;
            }
            let busy = in_flight.get(&partner).copied().unwrap_or(0);
            if busy > 0 && busy >= config.max_upload_bytes_in_flight {
                continue;
            }
            if !upload.start() {
                continue;
            }
            if !upload.is_lan() {
                wan_partners.insert(partner);
            }
            *in_flight.entry(partner).or_default() += upload.remaining_bytes();
            started.push(Arc::clone(upload));
        }
        started
    }

    fn find_upload(&self, partner: &NodeId, file: &FileRecord) -> Option<Arc<Upload>> {
        let key = file.key();
        lock(&self.uploads)
            .iter()
            .find(|u| u.matches(partner, &key) && u.file().is_same_version(file))
            .cloned()
    }

    fn remove_upload(&self, upload: &Arc<Upload>) {
        lock(&self.uploads).retain(|u| !Arc::ptr_eq(u, upload));
    }

    async fn break_upload(&self, upload: &Arc<Upload>, problem: TransferProblem, notify: bool) {
        self.remove_upload(upload);
        if !upload.break_with(problem.clone()) {
            return;
        }
        let file = upload.file().clone();
        let partner = upload.partner();
        if notify {
            let abort = TransferFile::with_reason(file.clone(), problem.to_string());
            self.send_to(&partner, Message::AbortUpload(abort)).await;
        }
        tracing::debug!("Upload of {} to {:?} broken: {}", file.key(), partner, problem);
        self.ctx.events.transfer(TransferEvent::UploadBroken {
            file,
            to: partner,
            problem,
        });
    }

    async fn drop_uploads_to(&self, partner: &NodeId, problem: TransferProblem, notify: bool) {
        let affected: Vec<Arc<Upload>> = self
            .uploads()
            .into_iter()
            .filter(|u| u.partner() == *partner)
            .collect();
        for upload in affected {
            self.break_upload(&upload, problem.clone(), notify).await;
        }
    }

    /// A partner asks for a byte range of an active upload.
    pub async fn part_requested(&self, from: NodeId, request: RequestPart) {
        let Some(upload) = self.find_upload(&from, &request.file) else {
            tracing::debug!("Part request for unknown upload {}", request.file.key());
            return;
        };
        if !upload.is_active() {
            return;
        }
        let Some(folder) = self
            .node
            .upgrade()
            .and_then(|node| node.folder(&request.file.folder))
        else {
            return;
        };
        let file = upload.file().clone();
        if folder.disk_state(&file) != DiskState::InSync {
            folder.trigger_scan();
            self.break_upload(&upload, TransferProblem::FileChanged, true)
                .await;
            return;
        }
        if request.offset >= file.size {
            self.break_upload(
                &upload,
                TransferProblem::Rejected("part out of range".into()),
                true,
            )
            .await;
            return;
        }

        let length = u64::from(request.length.min(self.ctx.config.transfers.chunk_size))
            .min(file.size - request.offset);
        if length == 0 {
            return;
        }
        self.bandwidth
            .acquire(Direction::Upload, upload.is_lan(), length as usize)
            .await;
        let data = match read_part(&folder.local_path(&file.path), request.offset, length).await {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", file.key(), e);
                folder.trigger_scan();
                self.break_upload(&upload, TransferProblem::Io(e.to_string()), true)
                    .await;
                return;
            }
        };
        let checksum = *blake3::hash(&data).as_bytes();
        let chunk = Message::FileChunk(FileChunk {
            file,
            offset: request.offset,
            data,
            checksum,
        });
        if self.send_to(&from, chunk).await {
            upload.record_sent(length);
        } else {
            self.break_upload(&upload, TransferProblem::PartnerDisconnected, false)
                .await;
        }
    }

    /// The partner aborted its download from us.
    pub async fn on_abort_download(&self, from: NodeId, abort: TransferFile) {
        if let Some(upload) = self.find_upload(&from, &abort.file) {
            self.break_upload(&upload, TransferProblem::AbortedByPartner, false)
                .await;
            self.start_uploads().await;
        }
    }

    /// The partner has the whole file.
    pub async fn on_stop_upload(&self, from: NodeId, stop: TransferFile) {
        let Some(upload) = self.find_upload(&from, &stop.file) else {
            return;
        };
        self.remove_upload(&upload);
        if upload.complete() {
            tracing::debug!("Upload of {} to {:?} completed", stop.file.key(), from);
            self.ctx.events.transfer(TransferEvent::UploadCompleted {
                file: upload.file().clone(),
                to: from,
            });
        }
        self.start_uploads().await;
    }

    // ---- Members ----

    /// Break every transfer with a disconnected partner.
    pub async fn member_disconnected(&self, partner: &NodeId) {
        for manager in self.active_downloads() {
            if manager.has_source(partner) {
                self.break_source(&manager, *partner, TransferProblem::PartnerDisconnected)
                    .await;
            }
        }
        self.drop_uploads_to(partner, TransferProblem::PartnerDisconnected, false)
            .await;
        self.start_uploads().await;
    }

    /// A member finished its handshake: look for work.
    pub fn member_handshaked(&self, partner: &NodeId) {
        tracing::debug!("Checking transfers after handshake with {:?}", partner);
        self.trigger_maintenance();
    }

    // ---- Maintenance ----

    /// Wake the maintenance loop.
    pub fn trigger_maintenance(&self) {
        self.wake.notify_one();
    }

    /// Check a folder for files to download on the I/O pool.
    pub fn trigger_download_check(self: &Arc<Self>, folder: &Arc<Folder>) {
        if !folder.profile().auto_download() {
            return;
        }
        let manager = Arc::clone(self);
        let folder = Arc::clone(folder);
        self.ctx.io.spawn("download-check", async move {
            manager.check_downloads(&folder).await;
        });
    }

    /// Start automatic downloads of every newer remote file.
    pub async fn check_downloads(&self, folder: &Arc<Folder>) {
        let incoming = folder.incoming_files();
        if incoming.is_empty() {
            let busy = self
                .active_downloads()
                .iter()
                .any(|d| d.file().folder == folder.id());
            if !busy {
                folder.mark_synced();
            }
            return;
        }
        for file in incoming {
            if let Some(existing) = self.download(&file.key()) {
                if !file.is_newer_than(existing.file()) {
                    continue;
                }
            }
            self.download_newest_version(folder, file, true).await;
        }
    }

    async fn retry_pending(&self) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        for file in self.pending_downloads() {
            let key = file.key();
            let Some(folder) = node.folder(&file.folder) else {
                lock(&self.pending).remove(&key);
                continue;
            };
            let target = match folder.newest_remote_version(&file.path) {
                Some(newest) if !newest.deleted && newest.is_newer_than(&file) => newest,
                _ => file,
            };
            let satisfied = folder
                .find_local(&target.path)
                .is_some_and(|local| !target.is_newer_than(&local));
            if satisfied {
                lock(&self.pending).remove(&key);
                self.mark_dirty();
                continue;
            }
            if self.usable_sources(&folder, &target).is_empty() {
                continue;
            }
            self.download_newest_version(&folder, target, false).await;
        }
    }

    /// One maintenance pass.
    pub async fn maintain(&self) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        let config = &self.ctx.config.transfers;

        for manager in self.active_downloads() {
            let file = manager.file().clone();
            if manager.source_count() == 0 {
                tracing::error!("Download of {} has no sources, removing", file.key());
                self.break_download(&manager, TransferProblem::PartnerDisconnected)
                    .await;
                continue;
            }
            if manager.folder().is_blacklisted(&file.path) {
                self.break_download(&manager, TransferProblem::Blacklisted)
                    .await;
                continue;
            }
            if manager.is_automatic() {
                let newer = manager
                    .folder()
                    .newest_remote_version(&file.path)
                    .is_some_and(|newest| newest.is_newer_than(&file));
                if newer {
                    self.break_download(&manager, TransferProblem::NewerVersionAvailable)
                        .await;
                    continue;
                }
            }
            for partner in manager.sources() {
                let connected = node
                    .member(&partner)
                    .is_some_and(|m| m.is_completely_connected());
                if !connected {
                    self.break_source(&manager, partner, TransferProblem::PartnerDisconnected)
                        .await;
                }
            }
            for (partner, problem) in manager.timed_out_sources(config) {
                self.break_source(&manager, partner, problem).await;
            }
            for partner in manager.sources() {
                if manager.is_source_active(&partner) {
                    self.request_parts(&manager, &partner).await;
                }
            }
        }

        let upload_timeout = Duration::from_secs(config.upload_timeout_secs);
        for upload in self.uploads() {
            let connected = node
                .member(&upload.partner())
                .is_some_and(|m| m.is_completely_connected());
            if !connected {
                self.break_upload(&upload, TransferProblem::PartnerDisconnected, false)
                    .await;
            } else if upload.is_active() && upload.idle_for() >= upload_timeout {
                self.break_upload(&upload, TransferProblem::Timeout, true)
                    .await;
            }
        }

        self.retry_pending().await;
        self.start_uploads().await;
        for folder in node.folders() {
            if folder.profile().auto_download() {
                self.check_downloads(&folder).await;
            }
        }
    }

    /// Run maintenance every interval, or earlier when triggered.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let period = Duration::from_secs(self.ctx.config.transfers.maintenance_interval_secs.max(1));
        tokio::spawn(async move {
            tracing::debug!("Transfer maintenance started (interval: {:?})", period);
            loop {
                let Some(current) = manager.upgrade() else {
                    break;
                };
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = current.wake.notified() => {}
                }
                current.maintain().await;
            }
        })
    }

    // ---- Persistence ----

    /// Whether pending or in-flight downloads changed since the last save.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Save pending and in-flight downloads.
    pub fn persist(&self) -> PersistResult<usize> {
        self.dirty.store(false, Ordering::SeqCst);
        let mut entries: Vec<PersistedDownload> = self
            .pending_downloads()
            .into_iter()
            .map(|file| PersistedDownload {
                file,
                automatic: false,
                received: None,
            })
            .collect();
        entries.extend(self.active_downloads().iter().map(|d| PersistedDownload {
            file: d.file().clone(),
            automatic: d.is_automatic(),
            received: Some(d.received()),
        }));
        entries.extend(
            lock(&self.resume)
                .values()
                .filter(|(file, _)| self.download(&file.key()).is_none())
                .map(|(file, ranges)| PersistedDownload {
                    file: file.clone(),
                    automatic: true,
                    received: Some(ranges.clone()),
                }),
        );

        let mut writer = RecordWriter::new(FileKind::Transfers);
        for entry in &entries {
            writer.push(entry)?;
        }
        let result = persist::write_with_backup(
            &self.ctx.config.transfers_path(),
            &writer.finish(),
            now_millis(),
        );
        if let Err(e) = result {
            self.mark_dirty();
            return Err(e);
        }
        tracing::debug!("Saved {} transfers", entries.len());
        Ok(entries.len())
    }

    /// Restore pending downloads and resumable ranges.
    pub fn load(&self) -> PersistResult<usize> {
        let entries = persist::read_with_backup(&self.ctx.config.transfers_path(), |bytes| {
            RecordReader::new(bytes, FileKind::Transfers)?.collect_all::<PersistedDownload>()
        })?
        .unwrap_or_default();

        for entry in &entries {
            let key = entry.file.key();
            if let Some(ranges) = &entry.received {
                lock(&self.resume).insert(key.clone(), (entry.file.clone(), ranges.clone()));
            }
            if !entry.automatic {
                lock(&self.pending).insert(key, entry.file.clone());
            }
        }
        if !entries.is_empty() {
            tracing::info!("Restored {} transfers", entries.len());
        }
        Ok(entries.len())
    }
}

// Partners that went away or aborted themselves are not told again.
fn tell_partner(problem: &TransferProblem) -> bool {
    !matches!(
        problem,
        TransferProblem::PartnerDisconnected
            | TransferProblem::AbortedByPartner
            | TransferProblem::Rejected(_)
    )
}

fn keeps_partial_content(problem: &TransferProblem) -> bool {
    !matches!(
        problem,
        TransferProblem::NewerVersionAvailable
            | TransferProblem::Blacklisted
            | TransferProblem::AbortedLocally
            | TransferProblem::InvalidChunk
            | TransferProblem::FileChanged
    )
}

fn is_retryable(problem: &TransferProblem) -> bool {
    matches!(
        problem,
        TransferProblem::PartnerDisconnected
            | TransferProblem::Timeout
            | TransferProblem::NotAcknowledged
            | TransferProblem::AbortedByPartner
            | TransferProblem::InvalidChunk
            | TransferProblem::Io(_)
    )
}

async fn read_part(path: &Path, offset: u64, length: u64) -> io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; length as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}
