//! Print the local index of a folder.

use anyhow::Result;
use std::path::Path;

use crate::session::Session;

/// Run the index command.
pub async fn run(data_dir: &Path, config: Option<&Path>, folder: &str, deleted: bool) -> Result<()> {
    let session = Session::open(data_dir, config).await?;
    for (_, folder) in session.select(Some(folder))? {
        let mut records = folder.store().find_all(None);
        records.retain(|r| deleted || !r.deleted);
        records.sort_by(|a, b| a.path.cmp(&b.path));

        for record in &records {
            let kind = if record.directory { "dir " } else { "file" };
            let state = if record.deleted { " (deleted)" } else { "" };
            println!(
                "{} v{:<4} {:>12}  {}{}",
                kind, record.version, record.size, record.path, state
            );
        }
        println!("{} records", records.len());
    }

    session.close().await;
    Ok(())
}
