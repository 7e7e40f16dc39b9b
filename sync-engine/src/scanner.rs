//! Folder scanner.
//!
//! Walks a folder's base directory and diffs it against the known records of
//! the local domain. The root directory is listed on the calling thread; each
//! top-level subdirectory is then walked on a small dedicated rayon pool.
//!
//! The scanner never touches the store. It returns a [`ScanResult`] that the
//! folder commits (or discards) under its own locks.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use filetime::FileTime;
use rayon::prelude::*;
use walkdir::WalkDir;

use sync_core::{check_path, find_case_collisions, FilenameProblem};
use sync_types::{now_millis, FileRecord, FolderId, NodeId};

use crate::config::ScannerConfig;

/// Per-folder system directory. Never scanned, never transferred.
pub const SYSTEM_DIR: &str = ".foldsync";

/// Suffix of incomplete download files.
pub const TEMP_SUFFIX: &str = ".fsdownload";

/// Whether `path` (relative, `/`-separated) belongs to the engine itself.
pub fn is_system_path(path: &str) -> bool {
    path == SYSTEM_DIR
        || path
            .strip_prefix(SYSTEM_DIR)
            .is_some_and(|rest| rest.starts_with('/'))
        || path.ends_with(TEMP_SUFFIX)
}

/// Outcome of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// The walk completed; the result may be committed.
    Scanned,
    /// The scan was aborted.
    UserAbort,
    /// The base directory or a subdirectory could not be read.
    HardwareFailure,
    /// Another scan of the same folder is running.
    Busy,
}

/// Differences between the disk and the known records.
#[derive(Debug, Clone)]
pub struct ScanResult {
    /// Outcome.
    pub state: ScanState,
    /// Paths without any known record.
    pub new_files: Vec<FileRecord>,
    /// Known paths whose size or modification time changed.
    pub changed_files: Vec<FileRecord>,
    /// Tombstones for known paths missing on disk.
    pub deleted_files: Vec<FileRecord>,
    /// Deleted paths that reappeared.
    pub restored_files: Vec<FileRecord>,
    /// Deleted record to new record with identical size and mtime.
    pub moved_files: Vec<(FileRecord, FileRecord)>,
    /// Names that do not work on every platform.
    pub problems: Vec<FilenameProblem>,
    /// Entries found on disk.
    pub total_files: usize,
}

impl ScanResult {
    /// An empty result with the given state.
    pub fn with_state(state: ScanState) -> Self {
        Self {
            state,
            new_files: Vec::new(),
            changed_files: Vec::new(),
            deleted_files: Vec::new(),
            restored_files: Vec::new(),
            moved_files: Vec::new(),
            problems: Vec::new(),
            total_files: 0,
        }
    }

    /// Number of records the result would commit.
    pub fn change_count(&self) -> usize {
        self.new_files.len()
            + self.changed_files.len()
            + self.deleted_files.len()
            + self.restored_files.len()
    }

    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.change_count() == 0
    }
}

/// What a scan compares against.
#[derive(Debug, Clone)]
pub struct ScanInput {
    /// Folder being scanned.
    pub folder: FolderId,
    /// Base directory.
    pub base: PathBuf,
    /// Records of the local domain, tombstones included.
    pub known: Vec<FileRecord>,
    /// Local node, recorded as modifier of new versions.
    pub local: NodeId,
}

#[derive(Debug, Clone)]
struct DiskEntry {
    path: String,
    directory: bool,
    size: u64,
    modified_ms: i64,
}

enum WalkStop {
    Aborted,
    Failed(String),
}

/// Scans folders on a bounded worker pool.
pub struct FolderScanner {
    pool: rayon::ThreadPool,
    abort: AtomicBool,
    detect_moves: bool,
    case_insensitive: bool,
}

impl std::fmt::Debug for FolderScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderScanner")
            .field("workers", &self.pool.current_num_threads())
            .field("detect_moves", &self.detect_moves)
            .field("case_insensitive", &self.case_insensitive)
            .finish()
    }
}

impl FolderScanner {
    /// Build a scanner with its crawler pool.
    pub fn new(config: &ScannerConfig) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers.max(1))
            .thread_name(|i| format!("foldsync-scan-{}", i))
            .build()?;
        Ok(Self {
            pool,
            abort: AtomicBool::new(false),
            detect_moves: config.detect_moves,
            case_insensitive: config.case_insensitive,
        })
    }

    /// Abort the running scan, or the next one if none is running.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Walk `input.base` and diff it against `input.known`.
    ///
    /// Blocks until the walk finishes. Run it on a blocking thread.
    pub fn scan(&self, input: ScanInput) -> ScanResult {
        let started = Instant::now();
        let result = match self.walk(&input.base) {
            Ok(entries) => self.classify(&input, entries),
            Err(WalkStop::Aborted) => {
                tracing::info!("Scan of {} aborted", input.base.display());
                ScanResult::with_state(ScanState::UserAbort)
            }
            Err(WalkStop::Failed(reason)) => {
                tracing::warn!("Scan of {} failed: {}", input.base.display(), reason);
                ScanResult::with_state(ScanState::HardwareFailure)
            }
        };
        self.abort.store(false, Ordering::SeqCst);

        tracing::debug!(
            "Scanned {} in {:?}: {} found, {} new, {} changed, {} deleted, {} restored",
            input.base.display(),
            started.elapsed(),
            result.total_files,
            result.new_files.len(),
            result.changed_files.len(),
            result.deleted_files.len(),
            result.restored_files.len()
        );
        result
    }

    fn walk(&self, base: &Path) -> Result<Vec<DiskEntry>, WalkStop> {
        let listing = fs::read_dir(base)
            .map_err(|e| WalkStop::Failed(format!("cannot list {}: {}", base.display(), e)))?;

        let mut entries = Vec::new();
        let mut subdirs = Vec::new();

        for entry in listing {
            if self.aborted() {
                return Err(WalkStop::Aborted);
            }
            let entry = entry.map_err(|e| WalkStop::Failed(e.to_string()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name == SYSTEM_DIR {
                continue;
            }
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(WalkStop::Failed(e.to_string())),
            };
            if file_type.is_symlink() || (file_type.is_file() && name.ends_with(TEMP_SUFFIX)) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(WalkStop::Failed(e.to_string())),
            };
            entries.push(disk_entry(name, &metadata));
            if file_type.is_dir() {
                subdirs.push(entry.path());
            }
        }

        let walked: Vec<Result<Vec<DiskEntry>, WalkStop>> = self.pool.install(|| {
            subdirs
                .par_iter()
                .map(|dir| self.walk_subtree(base, dir))
                .collect()
        });

        let mut failure = None;
        for subtree in walked {
            match subtree {
                Ok(found) => entries.extend(found),
                Err(WalkStop::Aborted) => return Err(WalkStop::Aborted),
                Err(stop) => failure = Some(stop),
            }
        }
        match failure {
            Some(stop) => Err(stop),
            None => Ok(entries),
        }
    }

    fn walk_subtree(&self, base: &Path, dir: &Path) -> Result<Vec<DiskEntry>, WalkStop> {
        let mut found = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).follow_links(false) {
            if self.aborted() {
                return Err(WalkStop::Aborted);
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if is_not_found(&e) => continue,
                Err(e) => return Err(WalkStop::Failed(e.to_string())),
            };
            let file_type = entry.file_type();
            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_file() && entry.file_name().to_string_lossy().ends_with(TEMP_SUFFIX) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) if is_not_found(&e) => continue,
                Err(e) => return Err(WalkStop::Failed(e.to_string())),
            };
            let Ok(relative) = entry.path().strip_prefix(base) else {
                continue;
            };
            found.push(disk_entry(relative_path(relative), &metadata));
        }
        Ok(found)
    }

    fn classify(&self, input: &ScanInput, mut entries: Vec<DiskEntry>) -> ScanResult {
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let mut remaining: HashMap<String, FileRecord> = input
            .known
            .iter()
            .map(|record| (record.path.clone(), record.clone()))
            .collect();
        let mut lower_index: HashMap<String, Vec<String>> = HashMap::new();
        if self.case_insensitive {
            for path in remaining.keys() {
                lower_index
                    .entry(path.to_lowercase())
                    .or_default()
                    .push(path.clone());
            }
            for paths in lower_index.values_mut() {
                paths.sort();
            }
        }

        let mut result = ScanResult::with_state(ScanState::Scanned);
        result.total_files = entries.len();

        for entry in &entries {
            let existing = match remaining.remove(&entry.path) {
                Some(existing) => Some(existing),
                None if self.case_insensitive => {
                    take_case_insensitive(&mut remaining, &lower_index, &entry.path)
                }
                None => None,
            };

            match existing {
                None => {
                    let record = if entry.directory {
                        FileRecord::new_directory(
                            input.folder,
                            entry.path.clone(),
                            entry.modified_ms,
                            input.local,
                        )
                    } else {
                        FileRecord::new_file(
                            input.folder,
                            entry.path.clone(),
                            entry.size,
                            entry.modified_ms,
                            input.local,
                        )
                    };
                    result.new_files.push(record);
                }
                Some(existing) if existing.deleted => {
                    if differs_from(&existing, entry, true) {
                        result.restored_files.push(successor(&existing, entry, input.local));
                    }
                }
                Some(existing) => {
                    if differs_from(&existing, entry, false) {
                        result.changed_files.push(successor(&existing, entry, input.local));
                    }
                }
            }
        }

        let now = now_millis();
        let mut deleted: Vec<FileRecord> = remaining
            .into_values()
            .filter(|record| !record.deleted)
            .map(|record| record.tombstone(now, input.local))
            .collect();
        deleted.sort_by(|a, b| a.path.cmp(&b.path));

        if self.detect_moves {
            result.moved_files = detect_moves(&input.known, &deleted, &result.new_files);
        }
        result.deleted_files = deleted;
        result.problems = filename_problems(&entries, &result);
        result
    }
}

fn disk_entry(path: String, metadata: &fs::Metadata) -> DiskEntry {
    let directory = metadata.is_dir();
    DiskEntry {
        path,
        directory,
        size: if directory { 0 } else { metadata.len() },
        modified_ms: modified_millis(metadata),
    }
}

/// Modification time of `metadata` in milliseconds since the epoch.
pub fn modified_millis(metadata: &fs::Metadata) -> i64 {
    let mtime = FileTime::from_last_modification_time(metadata);
    mtime.unix_seconds() * 1000 + i64::from(mtime.nanoseconds() / 1_000_000)
}

fn relative_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn is_not_found(error: &walkdir::Error) -> bool {
    error
        .io_error()
        .is_some_and(|e| e.kind() == io::ErrorKind::NotFound)
}

// Smallest matching path wins so every peer picks the same record.
fn take_case_insensitive(
    remaining: &mut HashMap<String, FileRecord>,
    lower_index: &HashMap<String, Vec<String>>,
    path: &str,
) -> Option<FileRecord> {
    let candidates = lower_index.get(&path.to_lowercase())?;
    candidates
        .iter()
        .find(|candidate| remaining.contains_key(*candidate))
        .cloned()
        .and_then(|candidate| remaining.remove(&candidate))
}

fn differs_from(record: &FileRecord, entry: &DiskEntry, tombstone: bool) -> bool {
    if record.directory != entry.directory {
        return true;
    }
    if entry.directory && !tombstone {
        return false;
    }
    record.size != entry.size || record.modified_ms != entry.modified_ms
}

fn successor(existing: &FileRecord, entry: &DiskEntry, by: NodeId) -> FileRecord {
    let mut record = existing.changed(entry.size, entry.modified_ms, by);
    record.directory = entry.directory;
    record
}

fn detect_moves(
    known: &[FileRecord],
    deleted: &[FileRecord],
    new_files: &[FileRecord],
) -> Vec<(FileRecord, FileRecord)> {
    let originals: HashMap<&str, &FileRecord> =
        known.iter().map(|r| (r.path.as_str(), r)).collect();
    let mut used = HashSet::new();
    let mut moves = Vec::new();

    for tombstone in deleted.iter().filter(|r| !r.directory) {
        let Some(original) = originals.get(tombstone.path.as_str()) else {
            continue;
        };
        let target = new_files.iter().find(|candidate| {
            !candidate.directory
                && !used.contains(candidate.path.as_str())
                && candidate.size == original.size
                && candidate.modified_ms == original.modified_ms
        });
        if let Some(target) = target {
            used.insert(target.path.as_str());
            moves.push((tombstone.clone(), target.clone()));
        }
    }
    moves
}

fn filename_problems(entries: &[DiskEntry], result: &ScanResult) -> Vec<FilenameProblem> {
    let touched: HashSet<&str> = result
        .new_files
        .iter()
        .chain(&result.changed_files)
        .chain(&result.restored_files)
        .map(|r| r.path.as_str())
        .collect();

    let mut problems: Vec<FilenameProblem> = touched.iter().flat_map(|p| check_path(p)).collect();
    problems.extend(
        find_case_collisions(entries.iter().map(|e| e.path.as_str())).into_iter().filter(
            |problem| match &problem.kind {
                sync_core::FilenameProblemKind::CaseCollision { other } => {
                    touched.contains(problem.path.as_str()) || touched.contains(other.as_str())
                }
                _ => false,
            },
        ),
    );
    problems.sort_by(|a, b| a.path.cmp(&b.path));
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::set_file_mtime;

    fn scanner(detect_moves: bool, case_insensitive: bool) -> FolderScanner {
        FolderScanner::new(&ScannerConfig {
            workers: 2,
            detect_moves,
            case_insensitive,
        })
        .unwrap()
    }

    fn input(base: &Path, known: Vec<FileRecord>) -> ScanInput {
        ScanInput {
            folder: FolderId::from_key(b"test"),
            base: base.to_path_buf(),
            known,
            local: NodeId::from_bytes(&[7u8; 32]).unwrap(),
        }
    }

    fn write(base: &Path, path: &str, content: &[u8]) {
        let full = base.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(&full, content).unwrap();
        set_file_mtime(&full, FileTime::from_unix_time(1_700_000_000, 0)).unwrap();
    }

    fn paths(records: &[FileRecord]) -> Vec<&str> {
        let mut paths: Vec<&str> = records.iter().map(|r| r.path.as_str()).collect();
        paths.sort();
        paths
    }

    fn apply(mut known: Vec<FileRecord>, result: &ScanResult) -> Vec<FileRecord> {
        let updates = result
            .new_files
            .iter()
            .chain(&result.changed_files)
            .chain(&result.deleted_files)
            .chain(&result.restored_files);
        for update in updates {
            known.retain(|r| r.path != update.path);
            known.push(update.clone());
        }
        known
    }

    #[test]
    fn finds_new_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", b"hello");
        write(dir.path(), "docs/b.txt", b"world!");

        let result = scanner(false, false).scan(input(dir.path(), Vec::new()));

        assert_eq!(result.state, ScanState::Scanned);
        assert_eq!(paths(&result.new_files), vec!["a.txt", "docs", "docs/b.txt"]);
        assert_eq!(result.total_files, 3);
        let b = result.new_files.iter().find(|r| r.path == "docs/b.txt").unwrap();
        assert_eq!(b.size, 6);
        assert_eq!(b.version, 0);
        assert_eq!(b.modified_ms, 1_700_000_000_000);
        assert!(result.new_files.iter().any(|r| r.path == "docs" && r.directory));
    }

    #[test]
    fn rescan_of_unchanged_tree_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", b"hello");
        write(dir.path(), "x/y/z.bin", b"data");
        let scanner = scanner(false, false);

        let first = scanner.scan(input(dir.path(), Vec::new()));
        let known = apply(Vec::new(), &first);
        let second = scanner.scan(input(dir.path(), known));

        assert_eq!(second.state, ScanState::Scanned);
        assert!(second.is_empty());
    }

    #[test]
    fn changed_and_deleted_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", b"hello");
        write(dir.path(), "gone.txt", b"bye");
        let scanner = scanner(false, false);
        let known = apply(Vec::new(), &scanner.scan(input(dir.path(), Vec::new())));

        write(dir.path(), "a.txt", b"hello, world");
        fs::remove_file(dir.path().join("gone.txt")).unwrap();
        let result = scanner.scan(input(dir.path(), known));

        assert_eq!(paths(&result.changed_files), vec!["a.txt"]);
        assert_eq!(result.changed_files[0].version, 1);
        assert_eq!(result.changed_files[0].size, 12);
        assert_eq!(paths(&result.deleted_files), vec!["gone.txt"]);
        assert!(result.deleted_files[0].deleted);
        assert_eq!(result.deleted_files[0].version, 1);
        assert!(result.new_files.is_empty());
    }

    #[test]
    fn reappearing_file_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let folder = FolderId::from_key(b"test");
        let tombstone = FileRecord::new_file(folder, "back.txt", 3, 1_000, NodeId::random())
            .tombstone(2_000, NodeId::random());
        write(dir.path(), "back.txt", b"again");

        let result = scanner(false, false).scan(input(dir.path(), vec![tombstone]));

        assert_eq!(paths(&result.restored_files), vec!["back.txt"]);
        let restored = &result.restored_files[0];
        assert!(!restored.deleted);
        assert_eq!(restored.version, 2);
        assert!(result.new_files.is_empty());
        // Tombstones are not deleted twice
        assert!(result.deleted_files.is_empty());
    }

    #[test]
    fn unchanged_reappearance_matches_tombstone() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "back.txt", b"same");
        let scanner = scanner(false, false);
        let known = apply(Vec::new(), &scanner.scan(input(dir.path(), Vec::new())));

        fs::remove_file(dir.path().join("back.txt")).unwrap();
        let gone = scanner.scan(input(dir.path(), known.clone()));
        assert_eq!(paths(&gone.deleted_files), vec!["back.txt"]);
        assert_eq!(gone.deleted_files[0].modified_ms, 1_700_000_000_000);
        let known = apply(known, &gone);

        write(dir.path(), "back.txt", b"same");
        let result = scanner.scan(input(dir.path(), known));
        assert!(result.restored_files.is_empty());
        assert!(result.changed_files.is_empty());
        assert!(result.new_files.is_empty());
    }

    #[test]
    fn directories_ignore_mtime_changes() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "d/f.txt", b"1");
        let scanner = scanner(false, false);
        let known = apply(Vec::new(), &scanner.scan(input(dir.path(), Vec::new())));

        set_file_mtime(dir.path().join("d"), FileTime::from_unix_time(1_600_000_000, 0)).unwrap();
        assert!(scanner.scan(input(dir.path(), known)).is_empty());
    }

    #[test]
    fn system_dir_and_temp_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ".foldsync/index.fsi", b"index");
        write(dir.path(), "movie.mkv.fsdownload", b"partial");
        write(dir.path(), "sub/part.fsdownload", b"partial");
        write(dir.path(), "real.txt", b"real");

        let result = scanner(false, false).scan(input(dir.path(), Vec::new()));
        assert_eq!(paths(&result.new_files), vec!["real.txt", "sub"]);
    }

    #[test]
    fn missing_base_is_hardware_failure() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("unmounted");

        let result = scanner(false, false).scan(input(&base, Vec::new()));
        assert_eq!(result.state, ScanState::HardwareFailure);
        assert!(result.is_empty());
    }

    #[test]
    fn abort_yields_user_abort_once() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", b"a");
        let scanner = scanner(false, false);

        scanner.abort();
        let aborted = scanner.scan(input(dir.path(), Vec::new()));
        assert_eq!(aborted.state, ScanState::UserAbort);
        assert!(aborted.is_empty());

        let next = scanner.scan(input(dir.path(), Vec::new()));
        assert_eq!(next.state, ScanState::Scanned);
    }

    #[test]
    fn case_insensitive_fallback_matches_renamed_case() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "README.md", b"docs");
        let folder = FolderId::from_key(b"test");
        let known = vec![FileRecord::new_file(
            folder,
            "Readme.md",
            4,
            1_700_000_000_000,
            NodeId::random(),
        )];

        let sensitive = scanner(false, false).scan(input(dir.path(), known.clone()));
        assert_eq!(paths(&sensitive.new_files), vec!["README.md"]);
        assert_eq!(paths(&sensitive.deleted_files), vec!["Readme.md"]);

        let insensitive = scanner(false, true).scan(input(dir.path(), known));
        assert!(insensitive.is_empty());
    }

    #[test]
    fn moves_are_detected_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "old/name.txt", b"moved content");
        let scanner_off = scanner(false, false);
        let known = apply(Vec::new(), &scanner_off.scan(input(dir.path(), Vec::new())));

        fs::create_dir_all(dir.path().join("new")).unwrap();
        fs::rename(dir.path().join("old/name.txt"), dir.path().join("new/name.txt")).unwrap();

        let off = scanner_off.scan(input(dir.path(), known.clone()));
        assert!(off.moved_files.is_empty());

        let on = scanner(true, false).scan(input(dir.path(), known));
        assert_eq!(on.moved_files.len(), 1);
        assert_eq!(on.moved_files[0].0.path, "old/name.txt");
        assert_eq!(on.moved_files[0].1.path, "new/name.txt");
        // Moves are informational
        assert!(on.new_files.iter().any(|r| r.path == "new/name.txt"));
        assert!(on.deleted_files.iter().any(|r| r.path == "old/name.txt"));
    }

    #[test]
    fn problematic_names_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "what?.txt", b"q");
        write(dir.path(), "fine.txt", b"ok");

        let result = scanner(false, false).scan(input(dir.path(), Vec::new()));
        assert_eq!(result.problems.len(), 1);
        assert_eq!(result.problems[0].path, "what?.txt");
    }

    #[test]
    fn system_paths() {
        assert!(is_system_path(".foldsync"));
        assert!(is_system_path(".foldsync/index.fsi"));
        assert!(is_system_path("a/b.iso.fsdownload"));
        assert!(!is_system_path(".foldsyncer/x"));
        assert!(!is_system_path("docs/a.txt"));
    }
}
