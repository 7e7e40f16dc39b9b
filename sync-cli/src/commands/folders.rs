//! Add and list shared folders.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use sync_core::SyncProfile;

use crate::config::{DeviceConfig, FolderBook, FolderEntry};

/// Run the add-folder command.
pub async fn add(
    data_dir: &Path,
    name: &str,
    path: &Path,
    key: Option<&str>,
    profile: SyncProfile,
) -> Result<()> {
    DeviceConfig::load(data_dir).await?;

    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let path: PathBuf = tokio::fs::canonicalize(path)
        .await
        .with_context(|| format!("Failed to resolve {}", path.display()))?;

    let mut book = FolderBook::load(data_dir).await?;
    let entry = FolderEntry {
        name: name.to_string(),
        key: key.unwrap_or(name).to_string(),
        path,
        profile,
    };
    let id = entry.folder_id();
    book.add(entry.clone())?;
    book.save(data_dir).await?;

    println!("Folder added:");
    println!("  Name:    {}", entry.name);
    println!("  Path:    {}", entry.path.display());
    println!("  Profile: {}", entry.profile);
    println!("  ID:      {}", id);
    Ok(())
}

/// Run the folders command.
pub async fn list(data_dir: &Path) -> Result<()> {
    let book = FolderBook::load(data_dir).await?;
    if book.folders.is_empty() {
        println!("No folders. Add one with 'foldsync add-folder <name> <path>'.");
        return Ok(());
    }
    for entry in &book.folders {
        println!(
            "{:<20} {:<14} {}",
            entry.name,
            entry.profile.to_string(),
            entry.path.display()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn add_requires_init() {
        let data = tempdir().unwrap();
        let base = tempdir().unwrap();
        let result = add(data.path(), "docs", base.path(), None, SyncProfile::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn add_creates_directory_and_records_entry() {
        let data = tempdir().unwrap();
        let base = tempdir().unwrap();
        DeviceConfig::new("desk").save(data.path()).await.unwrap();
        let target = base.path().join("new-folder");

        add(data.path(), "docs", &target, Some("k"), SyncProfile::HostFiles)
            .await
            .unwrap();
        assert!(target.is_dir());

        let book = FolderBook::load(data.path()).await.unwrap();
        let entry = book.find("docs").unwrap();
        assert_eq!(entry.key, "k");
        assert_eq!(entry.profile, SyncProfile::HostFiles);

        // Same name again
        assert!(add(data.path(), "docs", &target, None, SyncProfile::default())
            .await
            .is_err());
        assert!(list(data.path()).await.is_ok());
    }
}
