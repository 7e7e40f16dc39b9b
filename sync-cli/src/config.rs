//! Local state files of the foldsync CLI.
//!
//! - `device.json`: node identity
//! - `folders.json`: shared folders this device holds

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use sync_core::SyncProfile;
use sync_engine::FolderSettings;
use sync_types::{FolderId, FolderInfo, NodeId, NodeInfo};

const DEVICE_FILE: &str = "device.json";
const FOLDERS_FILE: &str = "folders.json";

/// Device configuration stored locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Node identifier in its display form.
    pub node_id: String,
    /// Human-readable nickname announced to peers.
    pub nickname: String,
    /// When the device was initialized.
    pub created_at: u64,
}

impl DeviceConfig {
    /// Create a new device configuration with a random node id.
    pub fn new(nickname: &str) -> Self {
        Self {
            node_id: NodeId::random().to_string(),
            nickname: nickname.to_string(),
            created_at: unix_now(),
        }
    }

    /// The identity the engine runs with.
    pub fn node_info(&self) -> Result<NodeInfo> {
        let id = NodeId::parse(&self.node_id)
            .with_context(|| format!("Invalid node id in {}", DEVICE_FILE))?;
        Ok(NodeInfo::new(id, self.nickname.clone()))
    }

    /// Load device configuration from a directory.
    pub async fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(DEVICE_FILE);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .context("Device not initialized. Run 'foldsync init' first.")?;
        serde_json::from_str(&contents).context("Invalid device configuration")
    }

    /// Save device configuration to a directory.
    pub async fn save(&self, data_dir: &Path) -> Result<()> {
        let path = data_dir.join(DEVICE_FILE);
        let contents = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&path, contents)
            .await
            .context("Failed to save device configuration")?;
        set_file_permissions_0600(&path).await?;
        Ok(())
    }

    /// Check if device is initialized.
    pub async fn exists(data_dir: &Path) -> bool {
        data_dir.join(DEVICE_FILE).exists()
    }
}

/// One shared folder held by this device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderEntry {
    /// Display name.
    pub name: String,
    /// Shared key; every replica of the folder uses the same one.
    pub key: String,
    /// Local base directory.
    pub path: PathBuf,
    /// Sync profile.
    #[serde(default)]
    pub profile: SyncProfile,
}

impl FolderEntry {
    /// Folder id derived from the shared key.
    pub fn folder_id(&self) -> FolderId {
        FolderId::from_key(self.key.as_bytes())
    }

    /// Engine settings for this folder.
    pub fn settings(&self) -> FolderSettings {
        let info = FolderInfo::new(self.folder_id(), self.name.clone());
        let mut settings = FolderSettings::new(info, self.path.clone());
        settings.profile = self.profile;
        settings
    }
}

/// The `folders.json` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FolderBook {
    /// Folders in the order they were added.
    pub folders: Vec<FolderEntry>,
}

impl FolderBook {
    /// Load the folder book; a missing file is an empty book.
    pub async fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(FOLDERS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = tokio::fs::read_to_string(&path)
            .await
            .context("Failed to read folder list")?;
        serde_json::from_str(&contents).context("Invalid folder list")
    }

    /// Save the folder book.
    pub async fn save(&self, data_dir: &Path) -> Result<()> {
        let path = data_dir.join(FOLDERS_FILE);
        let contents = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&path, contents)
            .await
            .context("Failed to save folder list")?;
        set_file_permissions_0600(&path).await?;
        Ok(())
    }

    /// Find a folder by name.
    pub fn find(&self, name: &str) -> Option<&FolderEntry> {
        self.folders.iter().find(|f| f.name == name)
    }

    /// Add a folder. Names and keys must be unique.
    pub fn add(&mut self, entry: FolderEntry) -> Result<()> {
        if self.find(&entry.name).is_some() {
            anyhow::bail!("A folder named '{}' already exists", entry.name);
        }
        if self.folders.iter().any(|f| f.key == entry.key) {
            anyhow::bail!("Folder '{}' uses the same key", entry.name);
        }
        self.folders.push(entry);
        Ok(())
    }
}

/// Parse a profile name such as `automatic` or `backup-target`.
pub fn parse_profile(name: &str) -> Result<SyncProfile, String> {
    serde_json::from_value(serde_json::Value::String(name.to_string())).map_err(|_| {
        format!(
            "unknown profile '{}' (expected manual, automatic, backup-source, backup-target or host-files)",
            name
        )
    })
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Set file permissions to 0600 (owner read/write only) on Unix.
/// No-op on non-Unix platforms.
async fn set_file_permissions_0600(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .context("Failed to set file permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Set directory permissions to 0700 (owner only) on Unix.
/// No-op on non-Unix platforms.
pub async fn set_dir_permissions_0700(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .await
            .context("Failed to set directory permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(name: &str, key: &str) -> FolderEntry {
        FolderEntry {
            name: name.to_string(),
            key: key.to_string(),
            path: PathBuf::from("/tmp").join(name),
            profile: SyncProfile::default(),
        }
    }

    #[tokio::test]
    async fn device_config_roundtrip() {
        let dir = tempdir().unwrap();
        let config = DeviceConfig::new("laptop");
        config.save(dir.path()).await.unwrap();

        let loaded = DeviceConfig::load(dir.path()).await.unwrap();
        assert_eq!(loaded.nickname, "laptop");
        let info = loaded.node_info().unwrap();
        assert_eq!(info.id.to_string(), config.node_id);
    }

    #[tokio::test]
    async fn corrupt_node_id_is_rejected() {
        let dir = tempdir().unwrap();
        let mut config = DeviceConfig::new("laptop");
        config.node_id = "not-an-id".into();
        config.save(dir.path()).await.unwrap();

        let loaded = DeviceConfig::load(dir.path()).await.unwrap();
        assert!(loaded.node_info().is_err());
    }

    #[tokio::test]
    async fn missing_folder_book_is_empty() {
        let dir = tempdir().unwrap();
        let book = FolderBook::load(dir.path()).await.unwrap();
        assert!(book.folders.is_empty());
    }

    #[tokio::test]
    async fn folder_book_roundtrip() {
        let dir = tempdir().unwrap();
        let mut book = FolderBook::default();
        book.add(entry("photos", "k1")).unwrap();
        book.add(entry("music", "k2")).unwrap();
        book.save(dir.path()).await.unwrap();

        let loaded = FolderBook::load(dir.path()).await.unwrap();
        assert_eq!(loaded.folders, book.folders);
        assert_eq!(loaded.find("music").unwrap().key, "k2");
    }

    #[test]
    fn duplicate_names_and_keys_are_refused() {
        let mut book = FolderBook::default();
        book.add(entry("photos", "k1")).unwrap();
        assert!(book.add(entry("photos", "k2")).is_err());
        assert!(book.add(entry("other", "k1")).is_err());
        assert_eq!(book.folders.len(), 1);
    }

    #[test]
    fn same_key_gives_same_folder_id() {
        let a = entry("photos", "shared");
        let b = entry("pictures", "shared");
        assert_eq!(a.folder_id(), b.folder_id());
        assert_eq!(a.settings().info.id, a.folder_id());
    }

    #[test]
    fn profiles_parse_by_name() {
        assert_eq!(parse_profile("manual").unwrap(), SyncProfile::Manual);
        assert_eq!(
            parse_profile("backup-target").unwrap(),
            SyncProfile::BackupTarget
        );
        assert!(parse_profile("sometimes").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn state_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        DeviceConfig::new("laptop").save(dir.path()).await.unwrap();

        let path = dir.path().join(DEVICE_FILE);
        let perms = tokio::fs::metadata(&path).await.unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o600, "file should be 0600");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn data_dir_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("test-data");
        tokio::fs::create_dir_all(&data_dir).await.unwrap();
        set_dir_permissions_0700(&data_dir).await.unwrap();

        let perms = tokio::fs::metadata(&data_dir).await.unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o700, "dir should be 0700");
    }
}
