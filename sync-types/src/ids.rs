//! Identity types for foldsync.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A stable identifier for a node (member) in the sync network.
///
/// 32 bytes of random data, displayed as URL-safe base64.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Create a new random NodeId.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }

    /// Create a NodeId from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == 32 {
            let mut arr = [0u8; 32];
            arr.copy_from_slice(bytes);
            Some(Self(arr))
        } else {
            None
        }
    }

    /// Parse a NodeId from its base64 display form.
    pub fn parse(text: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(text).ok()?;
        Self::from_bytes(&bytes)
    }

    /// Get the raw bytes of this NodeId.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_string()[..8])
    }
}

/// A unique identifier for a shared folder.
///
/// Every replica of the same folder carries the same id, derived from the
/// folder's shared key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FolderId([u8; 32]);

impl FolderId {
    /// Derive a FolderId from the folder's shared key.
    pub fn from_key(key: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(b"foldsync-folder-id-v1");
        hasher.update(key);
        let result = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&result);
        Self(bytes)
    }

    /// Create a random FolderId.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }

    /// Create a FolderId from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == 32 {
            let mut arr = [0u8; 32];
            arr.copy_from_slice(bytes);
            Some(Self(arr))
        } else {
            None
        }
    }

    /// Get the raw bytes of this FolderId.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FolderId({})", &self.to_string()[..8])
    }
}

/// Identifier of the sync network a node belongs to.
///
/// Nodes only peer with nodes on the same network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkId(String);

impl NetworkId {
    /// Create a NetworkId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the network id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NetworkId {
    fn default() -> Self {
        Self("foldsync".to_string())
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable description of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Stable node identifier.
    pub id: NodeId,
    /// Human-readable name.
    pub nickname: String,
    /// Whether the node acts as a supernode (relays node lists, always on).
    pub supernode: bool,
}

impl NodeInfo {
    /// Create a node description.
    pub fn new(id: NodeId, nickname: impl Into<String>) -> Self {
        Self {
            id,
            nickname: nickname.into(),
            supernode: false,
        }
    }

    /// Mark the node as a supernode.
    pub fn with_supernode(mut self, supernode: bool) -> Self {
        self.supernode = supernode;
        self
    }
}

/// Stable description of a shared folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FolderInfo {
    /// Folder identifier, identical on every replica.
    pub id: FolderId,
    /// Display name.
    pub name: String,
}

impl FolderInfo {
    /// Create a folder description.
    pub fn new(id: FolderId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_roundtrip() {
        let original = NodeId::random();
        let restored = NodeId::from_bytes(original.as_bytes()).unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn node_id_base64_display() {
        let id = NodeId::random();
        assert_eq!(id.to_string().len(), 43); // 32 bytes = 43 base64 chars (no padding)
    }

    #[test]
    fn node_id_parses_display_form() {
        let id = NodeId::random();
        assert_eq!(NodeId::parse(&id.to_string()), Some(id));
        assert_eq!(NodeId::parse("not base64!"), None);
    }

    #[test]
    fn node_id_from_invalid_length_fails() {
        assert!(NodeId::from_bytes(&[0u8; 16]).is_none());
        assert!(NodeId::from_bytes(&[0u8; 64]).is_none());
    }

    #[test]
    fn folder_id_from_key_is_deterministic() {
        assert_eq!(FolderId::from_key(b"photos"), FolderId::from_key(b"photos"));
        assert_ne!(FolderId::from_key(b"photos"), FolderId::from_key(b"music"));
    }

    #[test]
    fn network_id_default() {
        assert_eq!(NetworkId::default().as_str(), "foldsync");
    }
}
