//! # sync-types
//!
//! Foundational types shared by every foldsync crate:
//! - [`NodeId`], [`FolderId`], [`NetworkId`] - identity types
//! - [`FileRecord`] - versioned metadata for one path in a folder
//! - [`Message`] - typed protocol messages exchanged between members
//! - [`SyncError`] - wire-level error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod file;
mod ids;
mod messages;

pub use error::SyncError;
pub use file::{now_millis, FileKey, FileRecord};
pub use ids::{FolderId, FolderInfo, NetworkId, NodeId, NodeInfo};
pub use messages::{
    DownloadQueued, FileChunk, FileList, FolderFilesChanged, FolderList, Identity, IdentityReply,
    Message, MessageKind, NodeList, Problem, ProblemCode, RequestDownload, RequestPart,
    TransferFile, TransferStatus, PROTOCOL_VERSION,
};
