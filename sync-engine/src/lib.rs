//! # sync-engine
//!
//! Peer-to-peer folder synchronization engine for foldsync.
//!
//! - [`FileRecordStore`] - versioned records of one folder, per member domain
//! - [`FolderScanner`] - diffs a directory tree against the known records
//! - [`Folder`] - commits scans, applies remote file lists, reconciles deletions
//! - [`Member`] - connection and handshake with one remote node
//! - [`TransferManager`] - chunked downloads and uploads between members
//! - [`SyncNode`] - owns all of the above and runs the periodic tasks
//!
//! ## Data flow
//!
//! ```text
//! FolderScanner → Folder → FileRecordStore
//!                   │  ↑
//!    change lists   ↓  │ remote lists
//!                 Member ←──→ PeerChannel ←──→ remote node
//!                   │  ↑
//!         requests  ↓  │ chunks
//!              TransferManager → Folder::file_downloaded → rescan
//! ```
//!
//! The engine never opens sockets itself: callers hand it [`PeerChannel`]s
//! through [`SyncNode::accept`], and a [`Connector`] for reconnects.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod folder;
pub mod member;
pub mod node;
pub mod persist;
pub mod scanner;
pub mod store;
pub mod transfer;

pub use channel::{ChannelError, Connector, MockChannel, MockConnector, PeerChannel};
pub use config::{EngineConfig, NetworkingMode};
pub use context::{EngineContext, IoPool};
pub use error::{
    ConnectFailure, EngineError, FolderError, FolderResult, PersistError, PersistResult, Result,
};
pub use events::{EventBus, FolderEvent, MemberEvent, TransferEvent};
pub use folder::{DiskState, Folder, FolderSettings, RemoteFileList};
pub use member::Member;
pub use node::SyncNode;
pub use scanner::{FolderScanner, ScanResult, ScanState};
pub use store::FileRecordStore;
pub use transfer::{BandwidthLimits, Direction, DownloadManager, LimitSettings, TransferManager, Upload};
