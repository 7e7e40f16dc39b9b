//! Configuration loading for sync-engine.
//!
//! Configuration is loaded from a TOML file (default: `foldsync.toml`).
//! Every section and every field is optional and falls back to the defaults
//! below.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sync_core::MassDeletePolicy;

/// Root configuration for the engine.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Local node settings.
    pub node: NodeConfig,
    /// Handshake timeouts.
    pub handshake: HandshakeConfig,
    /// Reconnect policy.
    pub reconnect: ReconnectConfig,
    /// Folder scanner settings.
    pub scanner: ScannerConfig,
    /// Folder maintenance and protection.
    pub folders: FoldersConfig,
    /// Transfer scheduling and bandwidth.
    pub transfers: TransfersConfig,
}

/// Which remote nodes are worth a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkingMode {
    /// Friends, LAN nodes and nodes sharing a folder.
    #[default]
    Private,
    /// Only nodes on the local network.
    LanOnly,
    /// Only supernodes.
    ServerOnly,
}

/// Local node settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Human-readable name announced to peers (default: "foldsync").
    pub nickname: String,
    /// Network this node belongs to (default: "foldsync").
    pub network_id: String,
    /// Whether this node acts as a supernode (default: false).
    pub supernode: bool,
    /// Whether this node accepts incoming connections (default: true).
    pub accepts_incoming: bool,
    /// Directory for node-wide state such as the transfers file.
    pub data_dir: PathBuf,
    /// Which remote nodes are interesting (default: private).
    pub networking_mode: NetworkingMode,
    /// Maximum concurrent supernode connections (default: 3).
    pub max_supernode_connections: usize,
    /// Concurrency of the shared I/O worker pool (default: 8).
    pub io_workers: usize,
}

/// Handshake timeouts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Wait for the remote folder list in seconds (default: 60).
    pub folder_list_timeout_secs: u64,
    /// Longest silence while waiting for file lists in seconds (default: 60).
    pub filelist_idle_timeout_secs: u64,
    /// Hard ceiling for receiving all file lists in seconds (default: 7200).
    pub filelist_max_wait_secs: u64,
    /// Whether completion must be acknowledged by the peer (default: true).
    pub require_ack: bool,
    /// Wait for the acknowledgement in seconds (default: 60).
    pub ack_timeout_secs: u64,
}

/// Reconnect policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Periodically reconnect to known members (default: true).
    pub enabled: bool,
    /// Reconnect sweep interval in seconds (default: 30).
    pub interval_secs: u64,
    /// Consecutive failures before a node is unreachable (default: 15).
    pub max_failures: u32,
}

/// Folder scanner settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Crawler threads per scan (default: 3).
    pub workers: usize,
    /// Record moves between deleted and new files (default: false).
    pub detect_moves: bool,
    /// Match renamed-case files (default: true on Windows and macOS).
    pub case_insensitive: bool,
}

/// Folder maintenance and protection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FoldersConfig {
    /// Protect against remote mass deletion (default: true).
    pub mass_delete_protection: bool,
    /// Percentage of known files a remote change may delete (default: 80).
    pub mass_delete_threshold_percent: u8,
    /// Minimum known files for protection to apply (default: 10).
    pub mass_delete_min_files: usize,
    /// Days a tombstone is kept (default: 90).
    pub tombstone_retention_days: u64,
    /// Index persist interval in seconds (default: 60).
    pub persist_interval_secs: u64,
    /// Tombstone purge interval in seconds (default: 3600).
    pub maintenance_interval_secs: u64,
    /// Scan scheduler tick in seconds (default: 10).
    pub schedule_check_interval_secs: u64,
    /// Records per file-list message (default: 1000).
    pub file_list_batch_size: usize,
}

/// Transfer scheduling and bandwidth.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransfersConfig {
    /// Distinct WAN partners uploaded to at once (default: 5).
    pub max_uploads: usize,
    /// Concurrent downloads from one LAN partner (default: 50).
    pub max_downloads_per_lan_partner: usize,
    /// Concurrent downloads from one WAN partner (default: 10).
    pub max_downloads_per_wan_partner: usize,
    /// Outstanding part requests per download source (default: 15).
    pub max_pending_part_requests: usize,
    /// Bytes per part request (default: 32768).
    pub chunk_size: u32,
    /// Soft cap of bytes in flight to one partner (default: 64 MiB).
    pub max_upload_bytes_in_flight: u64,
    /// WAN upload limit in bytes/s, 0 = unlimited (default: 0).
    pub wan_upload_bytes_per_sec: u64,
    /// WAN download limit in bytes/s, 0 = unlimited (default: 0).
    pub wan_download_bytes_per_sec: u64,
    /// LAN upload limit in bytes/s, 0 = unlimited (default: 0).
    pub lan_upload_bytes_per_sec: u64,
    /// LAN download limit in bytes/s, 0 = unlimited (default: 0).
    pub lan_download_bytes_per_sec: u64,
    /// Start in silent mode (default: false).
    pub silent_mode: bool,
    /// Upload limit percentage kept in silent mode (default: 10).
    pub silent_mode_min_percent: u8,
    /// Silent-mode upload rate when the limit is unlimited (default: 100 KiB/s).
    pub silent_mode_fallback_bytes_per_sec: u64,
    /// Maintenance loop interval in seconds (default: 10).
    pub maintenance_interval_secs: u64,
    /// Inactivity before the first part arrives, in seconds (default: 300).
    pub first_part_timeout_secs: u64,
    /// Inactivity between following parts, in seconds (default: 120).
    pub part_timeout_secs: u64,
    /// Wait for a queued acknowledgement, in seconds (default: 120).
    pub queue_ack_timeout_secs: u64,
    /// Inactivity of an active upload, in seconds (default: 300).
    pub upload_timeout_secs: u64,
    /// Transfers file name inside the data directory.
    pub transfers_file: String,
}

// Default value functions
fn default_nickname() -> String {
    "foldsync".to_string()
}

fn default_network_id() -> String {
    "foldsync".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("foldsync-data")
}

fn default_case_insensitive() -> bool {
    cfg!(any(target_os = "windows", target_os = "macos"))
}

fn default_transfers_file() -> String {
    "transfers.fst".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            nickname: default_nickname(),
            network_id: default_network_id(),
            supernode: false,
            accepts_incoming: true,
            data_dir: default_data_dir(),
            networking_mode: NetworkingMode::default(),
            max_supernode_connections: 3,
            io_workers: 8,
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            folder_list_timeout_secs: 60,
            filelist_idle_timeout_secs: 60,
            filelist_max_wait_secs: 120 * 60,
            require_ack: true,
            ack_timeout_secs: 60,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            max_failures: 15,
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            detect_moves: false,
            case_insensitive: default_case_insensitive(),
        }
    }
}

impl Default for FoldersConfig {
    fn default() -> Self {
        Self {
            mass_delete_protection: true,
            mass_delete_threshold_percent: 80,
            mass_delete_min_files: 10,
            tombstone_retention_days: 90,
            persist_interval_secs: 60,
            maintenance_interval_secs: 3600,
            schedule_check_interval_secs: 10,
            file_list_batch_size: 1000,
        }
    }
}

impl Default for TransfersConfig {
    fn default() -> Self {
        Self {
            max_uploads: 5,
            max_downloads_per_lan_partner: 50,
            max_downloads_per_wan_partner: 10,
            max_pending_part_requests: 15,
            chunk_size: 32 * 1024,
            max_upload_bytes_in_flight: 64 * 1024 * 1024,
            wan_upload_bytes_per_sec: 0,
            wan_download_bytes_per_sec: 0,
            lan_upload_bytes_per_sec: 0,
            lan_download_bytes_per_sec: 0,
            silent_mode: false,
            silent_mode_min_percent: 10,
            silent_mode_fallback_bytes_per_sec: 100 * 1024,
            maintenance_interval_secs: 10,
            first_part_timeout_secs: 300,
            part_timeout_secs: 120,
            queue_ack_timeout_secs: 120,
            upload_timeout_secs: 300,
            transfers_file: default_transfers_file(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Mass-deletion thresholds of the `[folders]` section.
    pub fn mass_delete_policy(&self) -> MassDeletePolicy {
        MassDeletePolicy {
            enabled: self.folders.mass_delete_protection,
            threshold_percent: self.folders.mass_delete_threshold_percent.min(100),
            min_files: self.folders.mass_delete_min_files,
        }
    }

    /// Path of the transfers file.
    pub fn transfers_path(&self) -> PathBuf {
        self.node.data_dir.join(&self.transfers.transfers_file)
    }
}

impl HandshakeConfig {
    /// Folder-list wait.
    pub fn folder_list_timeout(&self) -> Duration {
        Duration::from_secs(self.folder_list_timeout_secs)
    }

    /// File-list idle wait.
    pub fn filelist_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.filelist_idle_timeout_secs)
    }

    /// File-list hard ceiling.
    pub fn filelist_max_wait(&self) -> Duration {
        Duration::from_secs(self.filelist_max_wait_secs)
    }

    /// Acknowledgement wait.
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
}

impl TransfersConfig {
    /// Inactivity timeout for a download source that has or has not received
    /// its first part yet.
    pub fn part_timeout(&self, first_part: bool) -> Duration {
        if first_part {
            Duration::from_secs(self.first_part_timeout_secs)
        } else {
            Duration::from_secs(self.part_timeout_secs)
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.node.network_id, "foldsync");
        assert_eq!(config.handshake.folder_list_timeout_secs, 60);
        assert_eq!(config.handshake.filelist_max_wait_secs, 7200);
        assert_eq!(config.reconnect.max_failures, 15);
        assert_eq!(config.scanner.workers, 3);
        assert_eq!(config.transfers.max_pending_part_requests, 15);
        assert_eq!(config.transfers.chunk_size, 32768);
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[node]
nickname = "laptop"
networking_mode = "lan-only"
data_dir = "/var/lib/foldsync"

[handshake]
require_ack = false

[folders]
mass_delete_threshold_percent = 50

[transfers]
max_uploads = 2
wan_upload_bytes_per_sec = 65536
"#;

        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.node.nickname, "laptop");
        assert_eq!(config.node.networking_mode, NetworkingMode::LanOnly);
        assert!(!config.handshake.require_ack);
        assert_eq!(config.folders.mass_delete_threshold_percent, 50);
        assert_eq!(config.transfers.max_uploads, 2);
        assert_eq!(config.transfers.wan_upload_bytes_per_sec, 65536);
        assert_eq!(
            config.transfers_path(),
            PathBuf::from("/var/lib/foldsync/transfers.fst")
        );
    }

    #[test]
    fn missing_sections_use_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.folders.file_list_batch_size, 1000);
        assert_eq!(config.transfers.part_timeout(true), Duration::from_secs(300));
        assert_eq!(config.transfers.part_timeout(false), Duration::from_secs(120));
    }

    #[test]
    fn mass_delete_policy_from_config() {
        let mut config = EngineConfig::default();
        config.folders.mass_delete_threshold_percent = 150;
        let policy = config.mass_delete_policy();
        assert_eq!(policy.threshold_percent, 100);
        assert_eq!(policy.min_files, 10);
        assert!(policy.enabled);
    }

    #[test]
    fn from_file_reports_missing_file() {
        let err = EngineConfig::from_file(Path::new("/nonexistent/foldsync.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }
}
