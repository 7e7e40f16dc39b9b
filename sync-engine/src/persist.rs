//! Versioned record files.
//!
//! Layout:
//!
//! ```text
//! magic "FSYN" | format version (u16 BE) | kind (u8) | record*
//! record = length (u32 BE) | MessagePack payload
//! ```
//!
//! Writes go to a temp file that is renamed over the target, so a crash never
//! leaves a half-written file behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{PersistError, PersistResult};

const MAGIC: &[u8; 4] = b"FSYN";
const HEADER_LEN: usize = 7;

/// Current format version.
pub const FORMAT_VERSION: u16 = 1;

/// Backups kept next to a file written with [`write_with_backup`].
const MAX_BACKUPS: usize = 3;

/// What a record file contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileKind {
    /// A folder's file index.
    FolderIndex = 1,
    /// Pending and in-flight downloads.
    Transfers = 2,
}

/// Builds a record file in memory.
#[derive(Debug)]
pub struct RecordWriter {
    buf: Vec<u8>,
}

impl RecordWriter {
    /// Start a file of the given kind.
    pub fn new(kind: FileKind) -> Self {
        let mut buf = Vec::with_capacity(4096);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        buf.push(kind as u8);
        Self { buf }
    }

    /// Append one record.
    pub fn push<T: Serialize>(&mut self, record: &T) -> PersistResult<()> {
        let payload = rmp_serde::to_vec_named(record)?;
        let len = u32::try_from(payload.len()).map_err(|_| PersistError::Truncated)?;
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(&payload);
        Ok(())
    }

    /// Finished bytes.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads records from a file's bytes.
#[derive(Debug)]
pub struct RecordReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    /// Validate the header and position at the first record.
    pub fn new(bytes: &'a [u8], kind: FileKind) -> PersistResult<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
            return Err(PersistError::BadMagic);
        }
        let version = u16::from_be_bytes([bytes[4], bytes[5]]);
        if version != FORMAT_VERSION {
            return Err(PersistError::UnsupportedVersion(version));
        }
        if bytes[6] != kind as u8 {
            return Err(PersistError::WrongKind {
                expected: kind as u8,
                actual: bytes[6],
            });
        }
        Ok(Self {
            bytes,
            pos: HEADER_LEN,
        })
    }

    /// Next record, or `None` at the end of the file.
    pub fn next<T: DeserializeOwned>(&mut self) -> PersistResult<Option<T>> {
        if self.pos == self.bytes.len() {
            return Ok(None);
        }
        let len_end = self.pos + 4;
        if len_end > self.bytes.len() {
            return Err(PersistError::Truncated);
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&self.bytes[self.pos..len_end]);
        let end = len_end + u32::from_be_bytes(len) as usize;
        if end > self.bytes.len() {
            return Err(PersistError::Truncated);
        }
        let record = rmp_serde::from_slice(&self.bytes[len_end..end])?;
        self.pos = end;
        Ok(Some(record))
    }

    /// All remaining records.
    pub fn collect_all<T: DeserializeOwned>(&mut self) -> PersistResult<Vec<T>> {
        let mut records = Vec::new();
        while let Some(record) = self.next()? {
            records.push(record);
        }
        Ok(records)
    }
}

/// Write `bytes` to `path` through a temp file and rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> PersistResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Write atomically, then keep a timestamped backup copy.
///
/// Only the newest few backups are kept.
pub fn write_with_backup(path: &Path, bytes: &[u8], now_ms: i64) -> PersistResult<PathBuf> {
    write_atomic(path, bytes)?;
    let backup = backup_path(path, now_ms);
    write_atomic(&backup, bytes)?;

    let mut backups = list_backups(path)?;
    while backups.len() > MAX_BACKUPS {
        let oldest = backups.remove(0);
        if let Err(e) = fs::remove_file(&oldest) {
            tracing::debug!("Failed to remove old backup {}: {}", oldest.display(), e);
        }
    }
    Ok(backup)
}

/// Read and parse `path`, falling back to the newest readable backup.
///
/// Returns `Ok(None)` when neither the file nor a backup exists.
pub fn read_with_backup<T, F>(path: &Path, parse: F) -> PersistResult<Option<T>>
where
    F: Fn(&[u8]) -> PersistResult<T>,
{
    let primary_err = match fs::read(path) {
        Ok(bytes) => match parse(&bytes) {
            Ok(value) => return Ok(Some(value)),
            Err(e) => Some(e),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => Some(PersistError::Io(e)),
    };

    let mut backups = list_backups(path)?;
    while let Some(backup) = backups.pop() {
        match fs::read(&backup).map_err(PersistError::from).and_then(|b| parse(&b)) {
            Ok(value) => {
                tracing::warn!(
                    "Restored {} from backup {}",
                    path.display(),
                    backup.display()
                );
                if let Err(e) = fs::copy(&backup, path) {
                    tracing::warn!("Failed to restore backup over {}: {}", path.display(), e);
                }
                return Ok(Some(value));
            }
            Err(e) => tracing::warn!("Backup {} unreadable: {}", backup.display(), e),
        }
    }

    match primary_err {
        Some(e) => Err(e),
        None => Ok(None),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn backup_path(path: &Path, now_ms: i64) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{:016}.bak", now_ms.max(0)));
    path.with_file_name(name)
}

/// Backups of `path`, oldest first.
fn list_backups(path: &Path) -> PersistResult<Vec<PathBuf>> {
    let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
        return Ok(Vec::new());
    };
    let prefix = format!("{}.", name.to_string_lossy());
    let entries = match fs::read_dir(if dir.as_os_str().is_empty() { Path::new(".") } else { dir }) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut backups: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".bak"))
        })
        .collect();
    // Zero-padded timestamps sort chronologically
    backups.sort();
    Ok(backups)
}
