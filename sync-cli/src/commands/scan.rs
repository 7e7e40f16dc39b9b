//! Scan shared folders for local changes.

use anyhow::Result;
use std::path::Path;

use sync_engine::{FolderEvent, ScanState};

use crate::session::Session;

/// Run the scan command.
///
/// `force` commits scans that would otherwise be held back as a mass deletion.
pub async fn run(
    data_dir: &Path,
    config: Option<&Path>,
    folder: Option<&str>,
    force: bool,
) -> Result<()> {
    let session = Session::open(data_dir, config).await?;
    let mut events = session.node.context().events.subscribe_folders();

    for (entry, folder) in session.select(folder)? {
        let committed = folder.scan_local_files(force).await;
        if committed {
            println!("{}: {} files", entry.name, folder.file_count());
        } else {
            println!("{}: not committed", entry.name);
        }
    }

    while let Ok(event) = events.try_recv() {
        match event {
            FolderEvent::LocalMassDeletion { known, .. } => {
                println!("  Held back a mass deletion of {} known files. Re-run with --force to apply.", known);
            }
            FolderEvent::ScanCompleted { state, .. } if state != ScanState::Scanned => {
                println!("  Scan ended with {:?}", state);
            }
            _ => {}
        }
    }

    session.close().await;
    Ok(())
}
