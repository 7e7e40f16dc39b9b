//! Show device, folder and transfer status.

use anyhow::Result;
use std::path::Path;

use crate::config::{unix_now, DeviceConfig, FolderBook};
use crate::session::Session;

/// Run the status command.
pub async fn run(data_dir: &Path, config: Option<&Path>) -> Result<()> {
    println!("=== foldsync status ===");
    println!();

    match DeviceConfig::load(data_dir).await {
        Ok(device) => {
            println!("Device:");
            println!("  ID:   {}", device.node_id);
            println!("  Name: {}", device.nickname);
            println!("  Init: {}", format_timestamp(device.created_at));
        }
        Err(_) => {
            println!("Device: NOT INITIALIZED");
            println!();
            println!("Run 'foldsync init --name <name>' to initialize.");
            return Ok(());
        }
    }
    println!();

    if FolderBook::load(data_dir).await?.folders.is_empty() {
        println!("Folders: none");
        return Ok(());
    }

    let session = Session::open(data_dir, config).await?;
    let now_ms = sync_types::now_millis();
    println!("Folders:");
    for (entry, folder) in &session.folders {
        let last_scan = match folder.last_scan_ms() {
            0 => "never".to_string(),
            ms => format_timestamp(unix_now().saturating_sub(((now_ms - ms).max(0) / 1000) as u64)),
        };
        println!(
            "  {:<20} {:>6} files  {:<14} last scan {}{}",
            entry.name,
            folder.file_count(),
            folder.profile().to_string(),
            last_scan,
            if folder.is_device_disconnected() { "  (unavailable)" } else { "" }
        );
    }
    println!();

    transfers(&session);
    session.close().await;
    Ok(())
}

/// Run the transfers command.
pub async fn run_transfers(data_dir: &Path, config: Option<&Path>) -> Result<()> {
    let session = Session::open(data_dir, config).await?;
    transfers(&session);
    for record in session.node.transfers().pending_downloads() {
        let folder = session
            .folders
            .iter()
            .find(|(_, f)| f.id() == record.folder)
            .map(|(entry, _)| entry.name.as_str())
            .unwrap_or("?");
        println!("  {}/{} v{} ({} bytes)", folder, record.path, record.version, record.size);
    }
    session.close().await;
    Ok(())
}

fn transfers(session: &Session) {
    let manager = session.node.transfers();
    if let Err(e) = manager.load() {
        tracing::warn!("Failed to load transfers: {}", e);
    }
    let status = manager.status();
    println!("Transfers:");
    println!("  Pending downloads: {}", status.pending_downloads);
    println!("  Active downloads:  {}", status.active_downloads);
    println!("  Uploads:           {} active, {} queued", status.active_uploads, status.queued_uploads);
}

/// Format a Unix timestamp as a human-readable string.
fn format_timestamp(ts: u64) -> String {
    let diff = unix_now().saturating_sub(ts);

    if diff < 60 {
        "just now".to_string()
    } else if diff < 3600 {
        format!("{} minutes ago", diff / 60)
    } else if diff < 86400 {
        format!("{} hours ago", diff / 3600)
    } else {
        format!("{} days ago", diff / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn status_without_init() {
        let dir = tempdir().unwrap();
        assert!(run(dir.path(), None).await.is_ok());
    }

    #[tokio::test]
    async fn status_with_device() {
        let dir = tempdir().unwrap();
        DeviceConfig::new("Test Device").save(dir.path()).await.unwrap();
        assert!(run(dir.path(), None).await.is_ok());
    }

    #[tokio::test]
    async fn transfers_with_empty_state() {
        let dir = tempdir().unwrap();
        DeviceConfig::new("Test Device").save(dir.path()).await.unwrap();
        assert!(run_transfers(dir.path(), None).await.is_ok());
    }

    #[test]
    fn format_timestamp_works() {
        let now = unix_now();
        assert_eq!(format_timestamp(now), "just now");
        assert!(format_timestamp(now - 120).contains("minutes"));
        assert!(format_timestamp(now - 7200).contains("hours"));
        assert!(format_timestamp(now - 172800).contains("days"));
    }
}
