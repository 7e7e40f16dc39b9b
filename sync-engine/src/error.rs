//! Error types for sync-engine.

use std::path::PathBuf;

use crate::channel::ChannelError;

/// Main error type for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Folder error.
    #[error("folder error: {0}")]
    Folder(#[from] FolderError),

    /// Persistence error.
    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    /// Channel error.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Handshake failed.
    #[error("connect failed: {0}")]
    Connect(#[from] ConnectFailure),

    /// Worker pool could not be built.
    #[error("scanner pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Folder layer errors.
#[derive(Debug, thiserror::Error)]
pub enum FolderError {
    /// Base directory is not reachable.
    #[error("folder base directory unavailable: {path}")]
    DeviceDisconnected {
        /// The base directory.
        path: PathBuf,
    },

    /// A folder with this id already exists.
    #[error("folder already exists: {0:?}")]
    AlreadyExists(sync_types::FolderId),

    /// Index persistence failed.
    #[error("index error: {0}")]
    Persist(#[from] PersistError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reading or writing persisted record files.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file does not start with the expected magic bytes.
    #[error("not a foldsync record file")]
    BadMagic,

    /// The file was written by an unknown format version.
    #[error("unsupported record format version: {0}")]
    UnsupportedVersion(u16),

    /// The file holds a different kind of records.
    #[error("wrong record file kind: expected {expected}, found {actual}")]
    WrongKind {
        /// Expected kind tag.
        expected: u8,
        /// Kind tag found in the file.
        actual: u8,
    },

    /// The file ends in the middle of a record.
    #[error("record file truncated")]
    Truncated,

    /// Record serialization failed.
    #[error("record serialization failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Record deserialization failed.
    #[error("record deserialization failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// A blocking persistence task panicked or was cancelled.
    #[error("persistence task failed: {0}")]
    Task(String),
}

/// Tagged reasons a connection or handshake failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectFailure {
    /// The channel carries no remote identity.
    #[error("remote identity unknown")]
    NoIdentity,

    /// Remote identity does not match the expected node.
    #[error("wrong identity: expected {expected}, got {actual}")]
    WrongIdentity {
        /// Expected node id.
        expected: String,
        /// Announced node id.
        actual: String,
    },

    /// Remote node belongs to another network.
    #[error("wrong network: {0}")]
    WrongNetwork(String),

    /// Remote speaks an incompatible protocol version.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Remote rejected the connection.
    #[error("rejected by remote: {0}")]
    Rejected(String),

    /// Local policy found the remote not interesting.
    #[error("remote node is not interesting")]
    NotInteresting,

    /// A handshake step timed out.
    #[error("timeout waiting for {0}")]
    Timeout(&'static str),

    /// Connection was lost during the handshake.
    #[error("disconnected during handshake")]
    Disconnected,

    /// No address is known to reconnect to.
    #[error("no reconnect address")]
    NoAddress,

    /// Member is flagged as do-not-connect.
    #[error("connecting to this node is disabled")]
    DontConnect,

    /// Address resolution failed.
    #[error("resolve failed: {0}")]
    Resolve(String),

    /// Low-level connect or send failed.
    #[error("channel failure: {0}")]
    Channel(String),

    /// The local node is shutting down.
    #[error("node is shutting down")]
    Shutdown,
}

impl From<ChannelError> for ConnectFailure {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Closed => ConnectFailure::Disconnected,
            other => ConnectFailure::Channel(other.to_string()),
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Result type alias for folder operations.
pub type FolderResult<T> = std::result::Result<T, FolderError>;

/// Result type alias for persistence operations.
pub type PersistResult<T> = std::result::Result<T, PersistError>;
