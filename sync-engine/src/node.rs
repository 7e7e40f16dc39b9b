//! The local node.
//!
//! [`SyncNode`] owns the shared folders, every known [`Member`] and the
//! [`TransferManager`]. It accepts incoming channels, decides which remote
//! nodes are worth a connection and runs the periodic tasks: index
//! persistence, folder maintenance, scheduled scans and reconnects.
//!
//! ```text
//! channel → SyncNode::accept → Member (handshake, receive loop)
//!                                 ├─→ Folder (file lists, deletions)
//!                                 └─→ TransferManager (chunks, requests)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;

use sync_types::{now_millis, FolderId, FolderInfo, FolderList, Message, NodeId, NodeInfo};

use crate::channel::{Connector, PeerChannel};
use crate::config::NetworkingMode;
use crate::context::{spawn_repeating, EngineContext};
use crate::error::{ConnectFailure, FolderError};
use crate::folder::{Folder, FolderSettings};
use crate::member::Member;
use crate::transfer::TransferManager;

/// The local node and everything it knows about.
pub struct SyncNode {
    ctx: Arc<EngineContext>,
    me: Weak<SyncNode>,
    folders: DashMap<FolderId, Arc<Folder>>,
    members: DashMap<NodeId, Arc<Member>>,
    transfers: Arc<TransferManager>,
    connector: Option<Arc<dyn Connector>>,
    connected_to_network: AtomicBool,
    shutting_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncNode")
            .field("local", &self.ctx.local)
            .field("folders", &self.folders.len())
            .field("members", &self.members.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl SyncNode {
    /// Create a node. `connector` opens outgoing channels for reconnects.
    pub fn new(ctx: Arc<EngineContext>, connector: Option<Arc<dyn Connector>>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            transfers: Arc::new(TransferManager::new(Arc::clone(&ctx), me.clone())),
            ctx,
            me: me.clone(),
            folders: DashMap::new(),
            members: DashMap::new(),
            connector,
            connected_to_network: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runtime context.
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Local node id.
    pub fn local_id(&self) -> NodeId {
        self.ctx.local.id
    }

    /// Transfer manager.
    pub fn transfers(&self) -> &Arc<TransferManager> {
        &self.transfers
    }

    /// Connector for outgoing channels.
    pub fn connector(&self) -> Option<Arc<dyn Connector>> {
        self.connector.clone()
    }

    // ---- Folders ----

    /// Create a folder and announce it to connected members.
    pub fn add_folder(&self, settings: FolderSettings) -> crate::Result<Arc<Folder>> {
        let id = settings.info.id;
        let folder = match self.folders.entry(id) {
            Entry::Occupied(_) => return Err(FolderError::AlreadyExists(id).into()),
            Entry::Vacant(slot) => {
                let folder = Folder::new(Arc::clone(&self.ctx), self.me.clone(), settings)?;
                slot.insert(Arc::clone(&folder));
                folder
            }
        };
        tracing::info!(
            "Added folder {} at {}",
            folder.info().name,
            folder.base().display()
        );
        self.announce_folders(Some(Arc::clone(&folder)));
        Ok(folder)
    }

    /// Remove a folder. Its index stays on disk.
    pub fn remove_folder(&self, id: &FolderId) -> Option<Arc<Folder>> {
        let (_, folder) = self.folders.remove(id)?;
        folder.abort_scan();
        if let Err(e) = folder.persist() {
            tracing::warn!("Failed to save index of {}: {}", folder.info().name, e);
        }
        tracing::info!("Removed folder {}", folder.info().name);
        self.announce_folders(None);
        Some(folder)
    }

    // Connected members learn about the change; a new folder is joined by
    // every member already holding it.
    fn announce_folders(&self, added: Option<Arc<Folder>>) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let members: Vec<_> = self
            .members()
            .into_iter()
            .filter(|m| m.is_completely_connected())
            .collect();
        if members.is_empty() {
            return;
        }
        let list = FolderList {
            folders: self.folder_infos(),
        };
        self.ctx.io.spawn("announce-folders", async move {
            for member in &members {
                if let Err(e) = member.send_message(Message::FolderList(list.clone())).await {
                    tracing::debug!("Folder list to {} failed: {}", member.nickname(), e);
                }
            }
            if let Some(folder) = added {
                folder.synchronize_memberships().await;
            }
        });
    }

    /// Folder by id.
    pub fn folder(&self, id: &FolderId) -> Option<Arc<Folder>> {
        self.folders.get(id).map(|f| Arc::clone(f.value()))
    }

    /// All folders.
    pub fn folders(&self) -> Vec<Arc<Folder>> {
        self.folders.iter().map(|f| Arc::clone(f.value())).collect()
    }

    /// Descriptions of all folders, as announced to members.
    pub fn folder_infos(&self) -> Vec<FolderInfo> {
        self.folders.iter().map(|f| f.info().clone()).collect()
    }

    // ---- Members ----

    /// Member by id.
    pub fn member(&self, id: &NodeId) -> Option<Arc<Member>> {
        self.members.get(id).map(|m| Arc::clone(m.value()))
    }

    /// All known members.
    pub fn members(&self) -> Vec<Arc<Member>> {
        self.members.iter().map(|m| Arc::clone(m.value())).collect()
    }

    /// Existing member for `info.id`, or a new disconnected one.
    pub fn get_or_create_member(&self, info: NodeInfo) -> Arc<Member> {
        let id = info.id;
        Arc::clone(
            self.members
                .entry(id)
                .or_insert_with(|| {
                    tracing::debug!("New member {} ({})", info.nickname, id);
                    Member::new(Arc::clone(&self.ctx), self.me.clone(), info)
                })
                .value(),
        )
    }

    /// Take over an incoming channel and run the handshake.
    pub async fn accept(&self, channel: Arc<dyn PeerChannel>) -> Result<Arc<Member>, ConnectFailure> {
        if self.is_shutting_down() {
            channel.close().await;
            return Err(ConnectFailure::Shutdown);
        }
        let Some(identity) = channel.remote_identity() else {
            channel.close().await;
            return Err(ConnectFailure::NoIdentity);
        };
        if identity.node.id == self.local_id() {
            channel.close().await;
            return Err(ConnectFailure::WrongIdentity {
                expected: "a remote node".into(),
                actual: identity.node.id.to_string(),
            });
        }
        let member = self.get_or_create_member(identity.node);
        member.set_peer(channel).await?;
        member.complete_handshake().await?;
        Ok(member)
    }

    /// Connect to `address` (`host:port`) expecting the node `expected`.
    pub async fn connect(
        &self,
        address: impl Into<String>,
        expected: NodeInfo,
    ) -> Result<Arc<Member>, ConnectFailure> {
        let member = self.get_or_create_member(expected);
        member.set_reconnect_address(address);
        member.reconnect().await?;
        Ok(member)
    }

    /// Whether a connection to `member` is worth keeping.
    pub fn is_interesting(&self, member: &Member) -> bool {
        let info = member.info();
        let config = &self.ctx.config.node;
        match config.networking_mode {
            NetworkingMode::LanOnly => member.is_lan(),
            NetworkingMode::ServerOnly => info.supernode || self.ctx.local.supernode,
            NetworkingMode::Private => {
                if member.is_lan() || member.is_friend() || self.ctx.local.supernode {
                    return true;
                }
                let shares_folder = member
                    .remote_folders()
                    .is_some_and(|list| list.folders.iter().any(|f| self.folders.contains_key(&f.id)));
                if shares_folder {
                    return true;
                }
                info.supernode
                    && self.connected_supernodes(&member.id()) < config.max_supernode_connections
            }
        }
    }

    fn connected_supernodes(&self, except: &NodeId) -> usize {
        self.members
            .iter()
            .filter(|m| m.key() != except)
            .filter(|m| m.info().supernode && m.is_completely_connected())
            .count()
    }

    /// Known nodes, as sent in a node list.
    pub fn known_nodes(&self) -> Vec<NodeInfo> {
        self.members.iter().map(|m| m.info()).collect()
    }

    /// Merge a received node list.
    pub fn learn_nodes(&self, nodes: Vec<NodeInfo>) {
        let mut learned = 0;
        for info in nodes {
            if info.id == self.local_id() {
                continue;
            }
            match self.member(&info.id) {
                Some(member) => member.update_info(&info),
                None => {
                    self.get_or_create_member(info);
                    learned += 1;
                }
            }
        }
        if learned > 0 {
            tracing::debug!("Learned {} nodes", learned);
        }
    }

    /// A member finished its handshake.
    pub fn on_member_handshaked(&self, id: &NodeId) {
        self.transfers.member_handshaked(id);
        for folder in self.folders() {
            if folder.is_member(id) {
                self.transfers.trigger_download_check(&folder);
            }
        }
    }

    /// A member lost its channel.
    pub async fn on_member_disconnected(&self, id: &NodeId) {
        self.transfers.member_disconnected(id).await;
        for folder in self.folders() {
            folder.remove(id).await;
        }
    }

    /// Record whether the local node has network connectivity.
    pub fn set_connected_to_network(&self, connected: bool) {
        self.connected_to_network.store(connected, Ordering::SeqCst);
    }

    /// Whether the local node has network connectivity.
    pub fn is_connected_to_network(&self) -> bool {
        self.connected_to_network.load(Ordering::SeqCst)
    }

    /// Whether [`SyncNode::shutdown`] was called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    // ---- Lifecycle ----

    /// Restore transfers and start the periodic tasks.
    pub fn start(self: &Arc<Self>) {
        match self.transfers.load() {
            Ok(count) => tracing::debug!("Loaded {} transfers", count),
            Err(e) => tracing::warn!("Failed to load transfers: {}", e),
        }

        let config = &self.ctx.config;
        let mut tasks = self.tasks();
        tasks.push(self.transfers.start());

        let node = Arc::downgrade(self);
        tasks.push(spawn_repeating(
            "index-persist",
            Duration::from_secs(config.folders.persist_interval_secs.max(1)),
            move || {
                let node = node.clone();
                async move {
                    if let Some(node) = node.upgrade() {
                        node.persist_all();
                    }
                }
            },
        ));

        let node = Arc::downgrade(self);
        tasks.push(spawn_repeating(
            "folder-maintenance",
            Duration::from_secs(config.folders.maintenance_interval_secs.max(1)),
            move || {
                let node = node.clone();
                async move {
                    if let Some(node) = node.upgrade() {
                        for folder in node.folders() {
                            folder.maintain();
                            folder.trigger_sync_remote_deleted_files();
                        }
                    }
                }
            },
        ));

        let node = Arc::downgrade(self);
        tasks.push(spawn_repeating(
            "scan-schedule",
            Duration::from_secs(config.folders.schedule_check_interval_secs.max(1)),
            move || {
                let node = node.clone();
                async move {
                    let Some(node) = node.upgrade() else {
                        return;
                    };
                    let now = now_millis();
                    for folder in node.folders() {
                        if folder.scan_due(now) {
                            folder.trigger_scan();
                        }
                    }
                }
            },
        ));

        if config.reconnect.enabled {
            let node = Arc::downgrade(self);
            tasks.push(spawn_repeating(
                "reconnect",
                Duration::from_secs(config.reconnect.interval_secs.max(1)),
                move || {
                    let node = node.clone();
                    async move {
                        if let Some(node) = node.upgrade() {
                            node.reconnect_sweep();
                        }
                    }
                },
            ));
        }
        tracing::info!("Node {} started", self.ctx.local.nickname);
    }

    fn reconnect_sweep(&self) {
        if self.is_shutting_down() || !self.is_connected_to_network() {
            return;
        }
        let candidates = self.members().into_iter().filter(|m| {
            !m.is_connected()
                && !m.is_connecting()
                && !m.is_dont_connect()
                && !m.is_unreachable_from_network()
                && m.is_retry_due()
                && m.reconnect_address().is_some()
        });
        for member in candidates {
            self.ctx.io.spawn("reconnect", async move {
                if let Err(e) = member.reconnect().await {
                    tracing::debug!("Reconnect to {} failed: {}", member.nickname(), e);
                }
            });
        }
    }

    /// Save every dirty folder index and the transfer list.
    pub fn persist_all(&self) {
        for folder in self.folders() {
            if let Err(e) = folder.persist() {
                tracing::warn!("Failed to save index of {}: {}", folder.info().name, e);
            }
        }
        if self.transfers.is_dirty() {
            if let Err(e) = self.transfers.persist() {
                tracing::warn!("Failed to save transfers: {}", e);
            }
        }
    }

    /// Stop periodic tasks, save state and disconnect every member.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down node {}", self.ctx.local.nickname);
        for task in self.tasks().drain(..) {
            task.abort();
        }
        for folder in self.folders() {
            folder.abort_scan();
        }
        self.persist_all();
        if let Err(e) = self.transfers.persist() {
            tracing::warn!("Failed to save transfers: {}", e);
        }
        for member in self.members() {
            member.disconnect("shutting down").await;
        }
    }
}
