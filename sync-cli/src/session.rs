//! Offline engine session shared by the commands that touch folder indexes.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sync_engine::{EngineConfig, EngineContext, Folder, SyncNode};

use crate::config::{DeviceConfig, FolderBook, FolderEntry};

/// A node built from the local state files, without network access.
pub struct Session {
    /// The engine node.
    pub node: Arc<SyncNode>,
    /// Folders paired with their entries, in book order.
    pub folders: Vec<(FolderEntry, Arc<Folder>)>,
}

impl Session {
    /// Build a node from `device.json`, `folders.json` and the engine config.
    pub async fn open(data_dir: &Path, config_path: Option<&Path>) -> Result<Self> {
        let device = DeviceConfig::load(data_dir).await?;
        let book = FolderBook::load(data_dir).await?;
        let config = load_engine_config(data_dir, config_path)?;

        let mut info = device.node_info()?;
        info.supernode = config.node.supernode;
        let node = SyncNode::new(EngineContext::new(config, info), None);

        let mut folders = Vec::with_capacity(book.folders.len());
        for entry in book.folders {
            let folder = node
                .add_folder(entry.settings())
                .with_context(|| format!("Failed to open folder '{}'", entry.name))?;
            folders.push((entry, folder));
        }
        Ok(Self { node, folders })
    }

    /// Folders selected by name, or all of them.
    pub fn select(&self, name: Option<&str>) -> Result<Vec<&(FolderEntry, Arc<Folder>)>> {
        match name {
            Some(name) => {
                let found = self
                    .folders
                    .iter()
                    .find(|(entry, _)| entry.name == name)
                    .with_context(|| format!("No folder named '{}'", name))?;
                Ok(vec![found])
            }
            None => Ok(self.folders.iter().collect()),
        }
    }

    /// Save every index and the transfer list.
    pub async fn close(self) {
        self.node.shutdown().await;
    }
}

/// Engine configuration from `path`, or defaults. The data directory always
/// points at the CLI's own.
pub fn load_engine_config(data_dir: &Path, path: Option<&Path>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    config.node.data_dir = PathBuf::from(data_dir);
    Ok(config)
}
