//! Protocol messages for foldsync.
//!
//! Members exchange these typed messages over an ordered, reliable,
//! already-authenticated channel. The byte layout is MessagePack with named
//! fields so that older readers tolerate added fields.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{FileRecord, FolderId, FolderInfo, NetworkId, NodeInfo, SyncError};

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u8 = 1;

/// All possible protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Identity announcement of the sending node
    Identity(Identity),
    /// Acceptance or rejection of a received identity
    IdentityReply(IdentityReply),
    /// Folders the sender holds
    FolderList(FolderList),
    /// Full file list of one folder (first batch)
    FileList(FileList),
    /// Delta of one folder's file list
    FolderFilesChanged(FolderFilesChanged),
    /// Downloader asks the uploader for a file
    RequestDownload(RequestDownload),
    /// Uploader confirms the request was queued
    DownloadQueued(DownloadQueued),
    /// A piece of file content
    FileChunk(FileChunk),
    /// Downloader asks for a byte range
    RequestPart(RequestPart),
    /// Downloader no longer wants the file
    AbortDownload(TransferFile),
    /// Uploader stops serving the file
    AbortUpload(TransferFile),
    /// Uploader starts serving the file
    StartUpload(TransferFile),
    /// Downloader has everything it needs
    StopUpload(TransferFile),
    /// Sender finished its part of the handshake
    HandshakeCompleted,
    /// Problem report
    Problem(Problem),
    /// Ask the receiver to rescan a folder
    ScanCommand {
        /// Folder to scan.
        folder: FolderId,
    },
    /// Keep-alive request
    Ping {
        /// Echoed back in the Pong.
        id: u64,
    },
    /// Keep-alive response
    Pong {
        /// Id of the answered Ping.
        id: u64,
    },
    /// Summary of the sender's transfer activity
    TransferStatus(TransferStatus),
    /// Ask for known nodes
    RequestNodeList,
    /// Known nodes
    NodeList(NodeList),
}

impl Message {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec_named(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        if bytes.is_empty() {
            return Err(SyncError::InvalidData("empty message".into()));
        }
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }

    /// Discriminator used for logging and dispatch statistics.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Identity(_) => MessageKind::Identity,
            Message::IdentityReply(_) => MessageKind::IdentityReply,
            Message::FolderList(_) => MessageKind::FolderList,
            Message::FileList(_) => MessageKind::FileList,
            Message::FolderFilesChanged(_) => MessageKind::FolderFilesChanged,
            Message::RequestDownload(_) => MessageKind::RequestDownload,
            Message::DownloadQueued(_) => MessageKind::DownloadQueued,
            Message::FileChunk(_) => MessageKind::FileChunk,
            Message::RequestPart(_) => MessageKind::RequestPart,
            Message::AbortDownload(_) => MessageKind::AbortDownload,
            Message::AbortUpload(_) => MessageKind::AbortUpload,
            Message::StartUpload(_) => MessageKind::StartUpload,
            Message::StopUpload(_) => MessageKind::StopUpload,
            Message::HandshakeCompleted => MessageKind::HandshakeCompleted,
            Message::Problem(_) => MessageKind::Problem,
            Message::ScanCommand { .. } => MessageKind::ScanCommand,
            Message::Ping { .. } => MessageKind::Ping,
            Message::Pong { .. } => MessageKind::Pong,
            Message::TransferStatus(_) => MessageKind::TransferStatus,
            Message::RequestNodeList => MessageKind::RequestNodeList,
            Message::NodeList(_) => MessageKind::NodeList,
        }
    }
}

/// Message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// [`Message::Identity`]
    Identity = 1,
    /// [`Message::IdentityReply`]
    IdentityReply = 2,
    /// [`Message::FolderList`]
    FolderList = 3,
    /// [`Message::FileList`]
    FileList = 4,
    /// [`Message::FolderFilesChanged`]
    FolderFilesChanged = 5,
    /// [`Message::RequestDownload`]
    RequestDownload = 6,
    /// [`Message::DownloadQueued`]
    DownloadQueued = 7,
    /// [`Message::FileChunk`]
    FileChunk = 8,
    /// [`Message::RequestPart`]
    RequestPart = 9,
    /// [`Message::AbortDownload`]
    AbortDownload = 10,
    /// [`Message::AbortUpload`]
    AbortUpload = 11,
    /// [`Message::StartUpload`]
    StartUpload = 12,
    /// [`Message::StopUpload`]
    StopUpload = 13,
    /// [`Message::HandshakeCompleted`]
    HandshakeCompleted = 14,
    /// [`Message::Problem`]
    Problem = 15,
    /// [`Message::ScanCommand`]
    ScanCommand = 16,
    /// [`Message::Ping`]
    Ping = 17,
    /// [`Message::Pong`]
    Pong = 18,
    /// [`Message::TransferStatus`]
    TransferStatus = 19,
    /// [`Message::RequestNodeList`]
    RequestNodeList = 20,
    /// [`Message::NodeList`]
    NodeList = 21,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Identity announcement exchanged by the connection layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// The announcing node.
    pub node: NodeInfo,
    /// Network the node belongs to.
    pub network_id: NetworkId,
    /// Protocol version spoken by the node.
    pub protocol_version: u8,
    /// Whether the node accepts incoming connections (false behind NAT/firewall).
    pub accepts_incoming: bool,
    /// Whether the node expects a HandshakeCompleted acknowledgement.
    pub requires_handshake_ack: bool,
}

impl Identity {
    /// Fail unless the node speaks [`PROTOCOL_VERSION`].
    pub fn check_version(&self) -> Result<(), SyncError> {
        if self.protocol_version == PROTOCOL_VERSION {
            Ok(())
        } else {
            Err(SyncError::UnsupportedVersion(self.protocol_version))
        }
    }
}

/// Response to an identity announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityReply {
    /// Whether the identity was accepted.
    pub accepted: bool,
    /// Rejection reason, if any.
    pub reason: Option<String>,
}

impl IdentityReply {
    /// An accepting reply.
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    /// A rejecting reply.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// Folders held by the sender.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FolderList {
    /// Folders the sender holds.
    pub folders: Vec<FolderInfo>,
}

impl FolderList {
    /// Whether the list contains the folder.
    pub fn contains(&self, folder: &FolderId) -> bool {
        self.folders.iter().any(|f| &f.id == folder)
    }
}

/// First batch of a folder's full file list.
///
/// `following_deltas` [`FolderFilesChanged`] messages carry the rest. A
/// rejected ("null") list tells the receiver no list will follow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileList {
    /// Folder the list describes.
    pub folder: FolderId,
    /// First batch of records.
    pub files: Vec<FileRecord>,
    /// Number of delta messages that complete the list.
    pub following_deltas: u32,
    /// Null list: the sender will not share this folder with the receiver.
    pub rejected: bool,
}

impl FileList {
    /// A null list, sent when the folder is not shared with the receiver.
    pub fn null(folder: FolderId) -> Self {
        Self {
            folder,
            files: Vec::new(),
            following_deltas: 0,
            rejected: true,
        }
    }

    /// Split a full record set into a FileList plus trailing deltas.
    ///
    /// Every message carries at most `batch_size` records.
    pub fn split(
        folder: FolderId,
        mut records: Vec<FileRecord>,
        batch_size: usize,
    ) -> (FileList, Vec<FolderFilesChanged>) {
        let batch_size = batch_size.max(1);
        let rest = if records.len() > batch_size {
            records.split_off(batch_size)
        } else {
            Vec::new()
        };

        let deltas: Vec<FolderFilesChanged> = rest
            .chunks(batch_size)
            .map(|chunk| FolderFilesChanged {
                folder,
                added: chunk.to_vec(),
                removed: Vec::new(),
            })
            .collect();

        let list = FileList {
            folder,
            files: records,
            following_deltas: deltas.len() as u32,
            rejected: false,
        };
        (list, deltas)
    }
}

/// Delta of a folder's file list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderFilesChanged {
    /// Folder the delta applies to.
    pub folder: FolderId,
    /// New or updated records.
    pub added: Vec<FileRecord>,
    /// Tombstones of removed records.
    pub removed: Vec<FileRecord>,
}

impl FolderFilesChanged {
    /// Whether the delta carries no records.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Request to download a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDownload {
    /// Version of the file being requested.
    pub file: FileRecord,
    /// Offset the downloader already has.
    pub start_offset: u64,
}

/// Confirmation that a download request was queued by the uploader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadQueued {
    /// The queued file.
    pub file: FileRecord,
}

/// A piece of file content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    /// File the chunk belongs to.
    pub file: FileRecord,
    /// Offset of the first byte.
    pub offset: u64,
    /// Chunk content.
    pub data: Vec<u8>,
    /// BLAKE3 hash of `data`.
    pub checksum: [u8; 32],
}

/// Request for a byte range of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPart {
    /// File being downloaded.
    pub file: FileRecord,
    /// First byte requested.
    pub offset: u64,
    /// Number of bytes requested.
    pub length: u32,
}

impl RequestPart {
    /// One past the last requested byte.
    pub fn end(&self) -> u64 {
        self.offset + self.length as u64
    }
}

/// Transfer control message naming a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFile {
    /// File the control message refers to.
    pub file: FileRecord,
    /// Optional human-readable reason.
    pub reason: Option<String>,
}

impl TransferFile {
    /// Control message without a reason.
    pub fn new(file: FileRecord) -> Self {
        Self { file, reason: None }
    }

    /// Control message with a reason.
    pub fn with_reason(file: FileRecord, reason: impl Into<String>) -> Self {
        Self {
            file,
            reason: Some(reason.into()),
        }
    }
}

/// Category of a reported problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProblemCode {
    /// Remote identity did not match the expected node.
    WrongIdentity,
    /// Remote node belongs to another network.
    WrongNetwork,
    /// Connection is not interesting to the sender.
    NotInteresting,
    /// Message sequence violated the protocol.
    ProtocolViolation,
    /// Remote speaks an incompatible protocol version.
    UnsupportedVersion,
    /// Anything else.
    Generic,
}

/// Problem report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    /// Problem category.
    pub code: ProblemCode,
    /// Human-readable description.
    pub message: String,
    /// Whether the sender is closing the connection.
    pub fatal: bool,
}

impl Problem {
    /// Create a problem report.
    pub fn new(code: ProblemCode, message: impl Into<String>, fatal: bool) -> Self {
        Self {
            code,
            message: message.into(),
            fatal,
        }
    }
}

/// Summary of transfer activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransferStatus {
    /// Uploads currently sending data.
    pub active_uploads: u32,
    /// Uploads waiting for a slot.
    pub queued_uploads: u32,
    /// Downloads currently receiving data.
    pub active_downloads: u32,
    /// Downloads waiting for a source.
    pub pending_downloads: u32,
}

/// Known nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeList {
    /// Nodes known to the sender.
    pub nodes: Vec<NodeInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeId;

    fn record(path: &str) -> FileRecord {
        FileRecord::new_file(FolderId::from_key(b"f"), path, 3, 1000, NodeId::random())
    }

    #[test]
    fn file_list_roundtrip() {
        let msg = Message::FileList(FileList {
            folder: FolderId::from_key(b"f"),
            files: vec![record("a.txt"), record("b/c.txt")],
            following_deltas: 0,
            rejected: false,
        });

        let bytes = msg.to_bytes().unwrap();
        let restored = Message::from_bytes(&bytes).unwrap();
        assert_eq!(msg, restored);
    }

    #[test]
    fn unit_variants_roundtrip() {
        for msg in [Message::HandshakeCompleted, Message::RequestNodeList] {
            let bytes = msg.to_bytes().unwrap();
            assert_eq!(Message::from_bytes(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn chunk_roundtrip_keeps_data() {
        let msg = Message::FileChunk(FileChunk {
            file: record("big.bin"),
            offset: 32768,
            data: vec![7u8; 64],
            checksum: [1u8; 32],
        });
        let restored = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        match restored {
            Message::FileChunk(chunk) => {
                assert_eq!(chunk.offset, 32768);
                assert_eq!(chunk.data.len(), 64);
            }
            other => panic!("Expected FileChunk, got {:?}", other.kind()),
        }
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(
            Message::from_bytes(&[0xc1, 0x00, 0x13]),
            Err(SyncError::Deserialization(_))
        ));
        assert!(matches!(
            Message::from_bytes(&[]),
            Err(SyncError::InvalidData(_))
        ));
    }

    #[test]
    fn identity_version_must_match() {
        let mut identity = Identity {
            node: NodeInfo::new(NodeId::random(), "peer"),
            network_id: NetworkId::new("foldsync"),
            protocol_version: PROTOCOL_VERSION,
            accepts_incoming: true,
            requires_handshake_ack: false,
        };
        assert!(identity.check_version().is_ok());

        identity.protocol_version = PROTOCOL_VERSION + 1;
        let err = identity.check_version().unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedVersion(v) if v == PROTOCOL_VERSION + 1));
    }

    #[test]
    fn split_small_list_has_no_deltas() {
        let folder = FolderId::from_key(b"f");
        let (list, deltas) = FileList::split(folder, vec![record("a"), record("b")], 10);
        assert_eq!(list.files.len(), 2);
        assert_eq!(list.following_deltas, 0);
        assert!(deltas.is_empty());
    }

    #[test]
    fn split_large_list_announces_deltas() {
        let folder = FolderId::from_key(b"f");
        let records: Vec<_> = (0..25).map(|i| record(&format!("f{i}"))).collect();
        let (list, deltas) = FileList::split(folder, records, 10);

        assert_eq!(list.files.len(), 10);
        assert_eq!(list.following_deltas, 2);
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].added.len(), 10);
        assert_eq!(deltas[1].added.len(), 5);
        assert!(deltas.iter().all(|d| d.removed.is_empty()));
    }

    #[test]
    fn null_list_is_rejected_and_complete() {
        let list = FileList::null(FolderId::random());
        assert!(list.rejected);
        assert_eq!(list.following_deltas, 0);
        assert!(list.files.is_empty());
    }

    #[test]
    fn kind_display() {
        assert_eq!(Message::HandshakeCompleted.kind().to_string(), "HandshakeCompleted");
        assert_eq!(Message::Ping { id: 1 }.kind() as u8, 17);
    }
}
