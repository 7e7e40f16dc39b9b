//! Initialize device identity.

use anyhow::Result;
use std::path::Path;

use crate::config::DeviceConfig;

/// Run the init command.
pub async fn run(data_dir: &Path, name: &str) -> Result<()> {
    if DeviceConfig::exists(data_dir).await {
        anyhow::bail!(
            "Device already initialized. Delete {} to reinitialize.",
            data_dir.join("device.json").display()
        );
    }

    let config = DeviceConfig::new(name);
    config.save(data_dir).await?;

    println!("Device initialized successfully!");
    println!();
    println!("  Node ID:  {}", config.node_id);
    println!("  Name:     {}", config.nickname);
    println!("  Data dir: {}", data_dir.display());
    println!();
    println!("Next steps:");
    println!("  1. Share a folder: foldsync add-folder <name> <path> --key <shared key>");
    println!("  2. Index it:       foldsync scan");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn init_creates_device_config() {
        let dir = tempdir().unwrap();
        run(dir.path(), "Test Device").await.unwrap();

        assert!(dir.path().join("device.json").exists());

        let config = DeviceConfig::load(dir.path()).await.unwrap();
        assert_eq!(config.nickname, "Test Device");
        assert!(config.node_info().is_ok());
    }

    #[tokio::test]
    async fn init_fails_if_already_initialized() {
        let dir = tempdir().unwrap();
        run(dir.path(), "Device 1").await.unwrap();

        let result = run(dir.path(), "Device 2").await;
        assert!(result.is_err());
    }
}
