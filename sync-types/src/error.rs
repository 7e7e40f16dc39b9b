//! Error types for foldsync wire types.

use thiserror::Error;

/// Errors that can occur while encoding or validating protocol data.
#[derive(Debug, Error)]
pub enum SyncError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Invalid protocol version
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}
