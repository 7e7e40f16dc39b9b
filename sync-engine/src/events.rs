//! Application-facing events.
//!
//! Each event family has its own broadcast channel. Subscribers get their
//! own receiver; a slow subscriber lags instead of blocking the publisher.

use tokio::sync::broadcast;

use sync_core::{FilenameProblem, SyncProfile, TransferProblem};
use sync_types::{FileRecord, FolderId, NodeId};

use crate::scanner::ScanState;

const EVENT_CAPACITY: usize = 256;

/// Folder-level events.
#[derive(Debug, Clone)]
pub enum FolderEvent {
    /// A scan finished.
    ScanCompleted {
        /// Folder.
        folder: FolderId,
        /// Outcome.
        state: ScanState,
        /// Number of committed changes.
        changes: usize,
    },
    /// A local scan looked like a wiped volume and was not committed.
    LocalMassDeletion {
        /// Folder.
        folder: FolderId,
        /// Known live files before the scan.
        known: usize,
    },
    /// A remote change would delete too much; the profile was downgraded.
    RemoteMassDeletion {
        /// Folder.
        folder: FolderId,
        /// Member that sent the change.
        from: NodeId,
        /// Deletions carried by the change.
        deleted: usize,
        /// Known live files.
        known: usize,
        /// Profile now in effect.
        profile: SyncProfile,
    },
    /// Records changed in some domain of the folder.
    FilesChanged {
        /// Folder.
        folder: FolderId,
        /// Member domain, `None` for local changes.
        from: Option<NodeId>,
        /// Added or updated records.
        added: usize,
        /// Removed records.
        removed: usize,
    },
    /// Remote deletions were applied to disk.
    RemoteDeletionsApplied {
        /// Folder.
        folder: FolderId,
        /// Deleted paths.
        count: usize,
    },
    /// A member joined the folder.
    MemberJoined {
        /// Folder.
        folder: FolderId,
        /// Member.
        node: NodeId,
    },
    /// A member left the folder.
    MemberLeft {
        /// Folder.
        folder: FolderId,
        /// Member.
        node: NodeId,
    },
    /// The base directory vanished.
    DeviceDisconnected {
        /// Folder.
        folder: FolderId,
    },
    /// The base directory is reachable again.
    DeviceReconnected {
        /// Folder.
        folder: FolderId,
    },
    /// A scan found names that do not work on every platform.
    FilenameProblems {
        /// Folder.
        folder: FolderId,
        /// The problems.
        problems: Vec<FilenameProblem>,
    },
    /// The folder's sync profile changed.
    ProfileChanged {
        /// Folder.
        folder: FolderId,
        /// New profile.
        profile: SyncProfile,
    },
}

/// Member connection events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    /// Outgoing connection attempt started.
    Connecting {
        /// Member.
        node: NodeId,
    },
    /// Handshake completed.
    Handshaked {
        /// Member.
        node: NodeId,
    },
    /// Handshake failed.
    HandshakeFailed {
        /// Member.
        node: NodeId,
        /// Tagged reason.
        reason: String,
    },
    /// A completely connected member went away.
    Disconnected {
        /// Member.
        node: NodeId,
        /// Reason.
        reason: String,
    },
    /// Too many failed reconnects while the network was up.
    UnreachableFromNetwork {
        /// Member.
        node: NodeId,
    },
}

/// Transfer lifecycle events.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A download was requested from at least one source.
    DownloadRequested {
        /// Target file.
        file: FileRecord,
        /// Sources asked.
        sources: Vec<NodeId>,
        /// Automatic or user request.
        automatic: bool,
    },
    /// A download without a source was parked for retry.
    DownloadPending {
        /// Target file.
        file: FileRecord,
    },
    /// A source queued the download.
    DownloadQueued {
        /// Target file.
        file: FileRecord,
        /// Source.
        from: NodeId,
    },
    /// A source started sending.
    DownloadStarted {
        /// Target file.
        file: FileRecord,
        /// Source.
        from: NodeId,
    },
    /// The file was completely downloaded and moved into place.
    DownloadCompleted {
        /// Target file.
        file: FileRecord,
    },
    /// The download failed.
    DownloadBroken {
        /// Target file.
        file: FileRecord,
        /// Reason.
        problem: TransferProblem,
    },
    /// An upload was queued.
    UploadQueued {
        /// File.
        file: FileRecord,
        /// Downloading partner.
        to: NodeId,
    },
    /// An upload started.
    UploadStarted {
        /// File.
        file: FileRecord,
        /// Downloading partner.
        to: NodeId,
    },
    /// An upload finished.
    UploadCompleted {
        /// File.
        file: FileRecord,
        /// Downloading partner.
        to: NodeId,
    },
    /// An upload failed or was aborted.
    UploadBroken {
        /// File.
        file: FileRecord,
        /// Downloading partner.
        to: NodeId,
        /// Reason.
        problem: TransferProblem,
    },
}

/// Broadcast channels for every event family.
#[derive(Debug, Clone)]
pub struct EventBus {
    folder: broadcast::Sender<FolderEvent>,
    member: broadcast::Sender<MemberEvent>,
    transfer: broadcast::Sender<TransferEvent>,
}

impl EventBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        let (folder, _) = broadcast::channel(EVENT_CAPACITY);
        let (member, _) = broadcast::channel(EVENT_CAPACITY);
        let (transfer, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            folder,
            member,
            transfer,
        }
    }

    /// Subscribe to folder events.
    pub fn subscribe_folders(&self) -> broadcast::Receiver<FolderEvent> {
        self.folder.subscribe()
    }

    /// Subscribe to member events.
    pub fn subscribe_members(&self) -> broadcast::Receiver<MemberEvent> {
        self.member.subscribe()
    }

    /// Subscribe to transfer events.
    pub fn subscribe_transfers(&self) -> broadcast::Receiver<TransferEvent> {
        self.transfer.subscribe()
    }

    /// Publish a folder event. Having no subscriber is not an error.
    pub fn folder(&self, event: FolderEvent) {
        let _ = self.folder.send(event);
    }

    /// Publish a member event.
    pub fn member(&self, event: MemberEvent) {
        let _ = self.member.send(event);
    }

    /// Publish a transfer event.
    pub fn transfer(&self, event: TransferEvent) {
        let _ = self.transfer.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_members();
        let node = NodeId::random();

        bus.member(MemberEvent::Handshaked { node });

        assert_eq!(rx.recv().await.unwrap(), MemberEvent::Handshaked { node });
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.folder(FolderEvent::DeviceDisconnected {
            folder: FolderId::random(),
        });
    }

    #[tokio::test]
    async fn each_subscriber_gets_a_copy() {
        let bus = EventBus::new();
        let mut a = bus.subscribe_folders();
        let mut b = bus.subscribe_folders();
        let folder = FolderId::random();

        bus.folder(FolderEvent::DeviceReconnected { folder });

        assert!(matches!(a.recv().await.unwrap(), FolderEvent::DeviceReconnected { .. }));
        assert!(matches!(b.recv().await.unwrap(), FolderEvent::DeviceReconnected { .. }));
    }
}
