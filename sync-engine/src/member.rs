//! Connection state of one remote node.
//!
//! A [`Member`] exists for every node this node has heard of. It is never
//! destroyed, only disconnected. While a channel is attached, a receive loop
//! dispatches incoming messages to folders and the transfer manager.
//!
//! # Handshake
//!
//! 1. [`Member::set_peer`] validates the remote identity and attaches the channel
//! 2. [`Member::complete_handshake`] exchanges folder lists, then file lists
//!    of every jointly held folder, then the optional acknowledgement
//!
//! The state transitions themselves live in [`sync_core::HandshakeState`];
//! this module performs the I/O and waits in between.
//!
//! Every attached channel gets a generation number. Waits and the receive
//! loop stop as soon as the generation they were started for is replaced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use tokio::sync::Notify;
use tokio::time::Instant;

use sync_core::{HandshakeAction, HandshakeEvent, HandshakeState, PeerEvent, ReconnectTracker};
use sync_types::{
    FileList, FolderId, FolderList, Identity, IdentityReply, Message, NodeId, NodeInfo, NodeList,
    Problem, ProblemCode, TransferStatus,
};

use crate::channel::{ChannelError, PeerChannel};
use crate::context::EngineContext;
use crate::error::ConnectFailure;
use crate::events::MemberEvent;
use crate::folder::RemoteFileList;
use crate::node::SyncNode;

/// A remote node and its connection.
pub struct Member {
    ctx: Arc<EngineContext>,
    node: Weak<SyncNode>,
    me: Weak<Member>,
    id: NodeId,
    info: RwLock<NodeInfo>,
    friend: AtomicBool,
    inner: Mutex<MemberInner>,
    signal: Notify,
}

struct MemberInner {
    state: HandshakeState,
    channel: Option<Arc<dyn PeerChannel>>,
    generation: u64,
    remote: Option<Identity>,
    is_lan: bool,
    remote_folders: Option<FolderList>,
    /// File lists still expected per folder: 1 before the full list
    /// arrives, then the number of announced deltas.
    expected_lists: HashMap<FolderId, u32>,
    ack_received: bool,
    reconnect_address: Option<String>,
    dont_connect: bool,
    tracker: ReconnectTracker,
    last_activity: Instant,
    remote_status: Option<TransferStatus>,
}

impl std::fmt::Debug for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner();
        f.debug_struct("Member")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .field("is_lan", &inner.is_lan)
            .finish()
    }
}

impl Member {
    /// Create a disconnected member.
    pub fn new(ctx: Arc<EngineContext>, node: Weak<SyncNode>, info: NodeInfo) -> Arc<Self> {
        let max_failures = ctx.config.reconnect.max_failures;
        Arc::new_cyclic(|me| Self {
            ctx,
            node,
            me: me.clone(),
            id: info.id,
            info: RwLock::new(info),
            friend: AtomicBool::new(false),
            inner: Mutex::new(MemberInner {
                state: HandshakeState::new(),
                channel: None,
                generation: 0,
                remote: None,
                is_lan: false,
                remote_folders: None,
                expected_lists: HashMap::new(),
                ack_received: false,
                reconnect_address: None,
                dont_connect: false,
                tracker: ReconnectTracker::new(max_failures),
                last_activity: Instant::now(),
                remote_status: None,
            }),
            signal: Notify::new(),
        })
    }

    fn inner(&self) -> MutexGuard<'_, MemberInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stable node id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Last known node description.
    pub fn info(&self) -> NodeInfo {
        self.info
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Display name.
    pub fn nickname(&self) -> String {
        self.info().nickname
    }

    /// Merge a newer description learned from a node list.
    pub fn update_info(&self, info: &NodeInfo) {
        if info.id != self.id {
            return;
        }
        let mut current = self
            .info
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !info.nickname.is_empty() {
            current.nickname.clone_from(&info.nickname);
        }
        current.supernode = info.supernode;
    }

    /// Whether the current channel runs over the local network.
    pub fn is_lan(&self) -> bool {
        self.inner().is_lan
    }

    /// Whether the handshake finished and a channel is attached.
    pub fn is_completely_connected(&self) -> bool {
        let inner = self.inner();
        inner.state.is_handshaked() && inner.channel.is_some()
    }

    /// Whether a connect or handshake is in progress.
    pub fn is_connecting(&self) -> bool {
        self.inner().state.is_connecting()
    }

    /// Whether any channel is attached.
    pub fn is_connected(&self) -> bool {
        self.inner().channel.is_some()
    }

    /// Current handshake state.
    pub fn state(&self) -> HandshakeState {
        self.inner().state.clone()
    }

    /// Folder list the remote announced on the current channel.
    pub fn remote_folders(&self) -> Option<FolderList> {
        self.inner().remote_folders.clone()
    }

    /// Identity presented on the current channel.
    pub fn remote_identity(&self) -> Option<Identity> {
        self.inner().remote.clone()
    }

    /// Last transfer summary the remote reported.
    pub fn remote_transfer_status(&self) -> Option<TransferStatus> {
        self.inner().remote_status
    }

    /// Whether the user marked this node as a friend.
    pub fn is_friend(&self) -> bool {
        self.friend.load(Ordering::SeqCst)
    }

    /// Mark or unmark as friend.
    pub fn set_friend(&self, friend: bool) {
        self.friend.store(friend, Ordering::SeqCst);
    }

    /// Address used by [`Member::reconnect`], as `host:port`.
    pub fn reconnect_address(&self) -> Option<String> {
        self.inner().reconnect_address.clone()
    }

    /// Set the reconnect address.
    pub fn set_reconnect_address(&self, address: impl Into<String>) {
        self.inner().reconnect_address = Some(address.into());
    }

    /// Forbid or allow outgoing connections.
    pub fn set_dont_connect(&self, dont_connect: bool) {
        self.inner().dont_connect = dont_connect;
    }

    /// Whether outgoing connections are forbidden.
    pub fn is_dont_connect(&self) -> bool {
        self.inner().dont_connect
    }

    /// Consecutive failed reconnects.
    pub fn failures(&self) -> u32 {
        self.inner().tracker.failures()
    }

    /// Whether reconnects kept failing while the network was up.
    pub fn is_unreachable_from_network(&self) -> bool {
        self.inner().tracker.is_unreachable_from_network()
    }

    /// Whether the wait after the last failed reconnect has passed.
    pub fn is_retry_due(&self) -> bool {
        self.inner().tracker.is_retry_due(std::time::Instant::now())
    }

    // ---- Channel ----

    /// Attach a channel after validating the remote identity.
    ///
    /// A mismatching node id or network is reported to the remote and the
    /// channel is closed. On success any previous channel is shut down and
    /// the receive loop starts.
    pub async fn set_peer(&self, channel: Arc<dyn PeerChannel>) -> Result<(), ConnectFailure> {
        let Some(remote) = channel.remote_identity() else {
            channel.close().await;
            return Err(ConnectFailure::NoIdentity);
        };
        if remote.node.id != self.id {
            let failure = ConnectFailure::WrongIdentity {
                expected: self.id.to_string(),
                actual: remote.node.id.to_string(),
            };
            refuse(channel.as_ref(), ProblemCode::WrongIdentity, &failure).await;
            return Err(failure);
        }
        if remote.network_id != self.ctx.network_id {
            let failure = ConnectFailure::WrongNetwork(remote.network_id.to_string());
            refuse(channel.as_ref(), ProblemCode::WrongNetwork, &failure).await;
            return Err(failure);
        }

        if remote.check_version().is_err() {
            let failure = ConnectFailure::UnsupportedVersion(remote.protocol_version);
            refuse(channel.as_ref(), ProblemCode::UnsupportedVersion, &failure).await;
            return Err(failure);
        }

        let lan = channel.is_lan();
        let (generation, previous, was_handshaked) = {
            let mut inner = self.inner();
            let was_handshaked = inner.state.is_handshaked();
            let previous = inner.channel.replace(Arc::clone(&channel));
            inner.generation += 1;
            inner.state = HandshakeState::new()
                .on_event(HandshakeEvent::IdentityAccepted)
                .0;
            inner.is_lan = lan;
            inner.remote_folders = None;
            inner.expected_lists.clear();
            inner.ack_received = false;
            inner.remote_status = None;
            inner.last_activity = Instant::now();
            if let Some(address) = channel.remote_address() {
                // Firewalled nodes connect to us, never the other way round
                inner.reconnect_address = if lan || remote.node.supernode || remote.accepts_incoming {
                    Some(address.to_string())
                } else {
                    None
                };
            }
            inner.remote = Some(remote.clone());
            (inner.generation, previous, was_handshaked)
        };
        {
            let mut info = self
                .info
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *info = remote.node.clone();
        }
        self.signal.notify_waiters();

        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &channel) {
                previous.close().await;
            }
        }
        if was_handshaked {
            self.ctx.events.member(MemberEvent::Disconnected {
                node: self.id,
                reason: "replaced by new connection".into(),
            });
            if let Some(node) = self.node.upgrade() {
                node.on_member_disconnected(&self.id).await;
            }
        }

        tracing::debug!(
            "Attached channel to {} (lan: {}, generation {})",
            remote.node.nickname,
            lan,
            generation
        );
        channel
            .send(Message::IdentityReply(IdentityReply::accepted()))
            .await?;
        self.spawn_receiver(channel, generation);
        Ok(())
    }

    fn spawn_receiver(&self, channel: Arc<dyn PeerChannel>, generation: u64) {
        let member = self.me.clone();
        tokio::spawn(async move {
            loop {
                let received = channel.recv().await;
                let Some(member) = member.upgrade() else {
                    break;
                };
                match received {
                    Ok(message) => {
                        if !member.is_current(generation) {
                            break;
                        }
                        member.handle_message(generation, message).await;
                    }
                    Err(e) => {
                        member
                            .terminate(
                                Some(generation),
                                HandshakeEvent::Disconnected {
                                    reason: e.to_string(),
                                },
                            )
                            .await;
                        break;
                    }
                }
            }
            tracing::trace!("Receive loop {} finished", generation);
        });
    }

    fn is_current(&self, generation: u64) -> bool {
        let inner = self.inner();
        inner.generation == generation && inner.channel.is_some()
    }

    /// Send one message on the current channel.
    ///
    /// A failed send closes the channel; the receive loop then disconnects
    /// the member.
    pub async fn send_message(&self, message: Message) -> Result<(), ChannelError> {
        let channel = self.inner().channel.clone().ok_or(ChannelError::Closed)?;
        if let Err(e) = channel.send(message).await {
            tracing::debug!("Send to {} failed: {}", self.nickname(), e);
            channel.close().await;
            return Err(e);
        }
        Ok(())
    }

    /// Drop the channel.
    pub async fn disconnect(&self, reason: impl Into<String>) {
        self.terminate(
            None,
            HandshakeEvent::Disconnected {
                reason: reason.into(),
            },
        )
        .await;
    }

    /// Apply a failure or disconnect to the state machine and tear down.
    ///
    /// `generation` restricts the teardown to one channel; `None` tears down
    /// whatever is attached.
    async fn terminate(&self, generation: Option<u64>, event: HandshakeEvent) {
        let (actions, channel) = {
            let mut inner = self.inner();
            if generation.is_some_and(|g| g != inner.generation) {
                return;
            }
            if inner.state == HandshakeState::Disconnected && inner.channel.is_none() {
                return;
            }
            let (state, actions) = std::mem::take(&mut inner.state).on_event(event);
            inner.state = state;
            inner.remote_folders = None;
            inner.expected_lists.clear();
            inner.ack_received = false;
            (actions, inner.channel.take())
        };
        self.signal.notify_waiters();

        for action in &actions {
            if let HandshakeAction::CloseChannel { reason } = action {
                tracing::info!("Closing channel to {}: {}", self.nickname(), reason);
            }
        }
        if let Some(channel) = &channel {
            channel.close().await;
        }
        self.emit(actions);

        if channel.is_some() {
            if let Some(node) = self.node.upgrade() {
                node.on_member_disconnected(&self.id).await;
            }
        }
    }

    fn emit(&self, actions: Vec<HandshakeAction>) {
        for action in actions {
            let HandshakeAction::EmitEvent(event) = action else {
                continue;
            };
            let node = self.id;
            self.ctx.events.member(match event {
                PeerEvent::Connecting => MemberEvent::Connecting { node },
                PeerEvent::Handshaked => MemberEvent::Handshaked { node },
                PeerEvent::HandshakeFailed { reason } => MemberEvent::HandshakeFailed { node, reason },
                PeerEvent::Disconnected { reason } => MemberEvent::Disconnected { node, reason },
            });
        }
    }

    // ---- Handshake ----

    /// Run the handshake on the attached channel.
    ///
    /// Blocks until the remote folder list, every file list of a jointly
    /// held folder and, if configured, the acknowledgement arrived. Any
    /// failure disconnects the member.
    pub async fn complete_handshake(self: &Arc<Self>) -> Result<(), ConnectFailure> {
        let generation = {
            let inner = self.inner();
            if inner.channel.is_none() || !inner.state.has_channel() {
                return Err(ConnectFailure::Disconnected);
            }
            inner.generation
        };
        match self.run_handshake(generation).await {
            Ok(()) => Ok(()),
            Err(failure) => {
                tracing::info!("Handshake with {} failed: {}", self.nickname(), failure);
                self.terminate(
                    Some(generation),
                    HandshakeEvent::Failed {
                        reason: failure.to_string(),
                    },
                )
                .await;
                Err(failure)
            }
        }
    }

    async fn run_handshake(self: &Arc<Self>, generation: u64) -> Result<(), ConnectFailure> {
        let node = self.node.upgrade().ok_or(ConnectFailure::Shutdown)?;
        let config = &self.ctx.config.handshake;

        self.send_message(Message::FolderList(FolderList {
            folders: node.folder_infos(),
        }))
        .await?;
        let deadline = Instant::now() + config.folder_list_timeout();
        self.wait_for(
            generation,
            "folder list",
            |inner| inner.remote_folders.is_some(),
            move |_| deadline,
        )
        .await?;
        self.advance(generation, HandshakeEvent::FolderListReceived)?;

        if !node.is_interesting(self) {
            let problem = Problem::new(ProblemCode::NotInteresting, "You are boring", true);
            if let Err(e) = self.send_message(Message::Problem(problem)).await {
                tracing::debug!("Failed to reject {}: {}", self.nickname(), e);
            }
            return Err(ConnectFailure::NotInteresting);
        }

        self.send_message(Message::RequestNodeList).await?;
        self.send_message(Message::TransferStatus(node.transfers().status()))
            .await?;

        let remote = self.remote_folders().unwrap_or_default();
        let joint: Vec<_> = node
            .folders()
            .into_iter()
            .filter(|folder| remote.contains(&folder.id()))
            .collect();
        {
            let mut inner = self.inner();
            for folder in &joint {
                inner.expected_lists.entry(folder.id()).or_insert(1);
            }
        }
        for info in &remote.folders {
            if node.folder(&info.id).is_none() {
                self.send_message(Message::FileList(FileList::null(info.id)))
                    .await?;
            }
        }
        for folder in &joint {
            folder.join(self).await;
        }

        let ceiling = Instant::now() + config.filelist_max_wait();
        let idle = config.filelist_idle_timeout();
        self.wait_for(
            generation,
            "file lists",
            |inner| inner.expected_lists.values().all(|n| *n == 0),
            move |inner| (inner.last_activity + idle).min(ceiling),
        )
        .await?;
        self.advance(generation, HandshakeEvent::FileListsComplete)?;

        let remote_wants_ack = self
            .remote_identity()
            .is_some_and(|identity| identity.requires_handshake_ack);
        if remote_wants_ack {
            self.send_message(Message::HandshakeCompleted).await?;
        }
        if config.require_ack {
            let deadline = Instant::now() + config.ack_timeout();
            self.wait_for(
                generation,
                "handshake acknowledgement",
                |inner| inner.ack_received,
                move |_| deadline,
            )
            .await?;
        }

        let actions = {
            let mut inner = self.inner();
            if inner.generation != generation || inner.channel.is_none() {
                return Err(ConnectFailure::Disconnected);
            }
            let (state, actions) =
                std::mem::take(&mut inner.state).on_event(HandshakeEvent::Acknowledged);
            inner.state = state;
            inner.tracker.record_success();
            actions
        };
        self.emit(actions);
        tracing::info!(
            "Handshake with {} completed ({} joint folders)",
            self.nickname(),
            joint.len()
        );
        node.on_member_handshaked(&self.id);
        Ok(())
    }

    fn advance(&self, generation: u64, event: HandshakeEvent) -> Result<(), ConnectFailure> {
        let mut inner = self.inner();
        if inner.generation != generation || inner.channel.is_none() {
            return Err(ConnectFailure::Disconnected);
        }
        let (state, _) = std::mem::take(&mut inner.state).on_event(event);
        inner.state = state;
        Ok(())
    }

    /// Wait until `ready` holds or the deadline computed by `deadline` passes.
    async fn wait_for<F, D>(
        &self,
        generation: u64,
        what: &'static str,
        ready: F,
        deadline: D,
    ) -> Result<(), ConnectFailure>
    where
        F: Fn(&MemberInner) -> bool,
        D: Fn(&MemberInner) -> Instant,
    {
        loop {
            let notified = self.signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let until = {
                let inner = self.inner();
                if inner.generation != generation || inner.channel.is_none() {
                    return Err(ConnectFailure::Disconnected);
                }
                if ready(&inner) {
                    return Ok(());
                }
                deadline(&inner)
            };
            if Instant::now() >= until {
                return Err(ConnectFailure::Timeout(what));
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(until) => {}
            }
        }
    }

    // ---- Incoming messages ----

    async fn handle_message(&self, generation: u64, message: Message) {
        self.inner().last_activity = Instant::now();
        // Keep-alives extend the file list wait
        self.signal.notify_waiters();
        let Some(node) = self.node.upgrade() else {
            return;
        };
        tracing::trace!("{} <- {:?}", self.nickname(), message.kind());

        match message {
            Message::Identity(_) => {
                tracing::debug!("Ignoring repeated identity from {}", self.nickname());
            }
            Message::IdentityReply(reply) => {
                if !reply.accepted {
                    let reason = reply.reason.unwrap_or_else(|| "no reason".into());
                    self.terminate(
                        Some(generation),
                        HandshakeEvent::Failed {
                            reason: ConnectFailure::Rejected(reason).to_string(),
                        },
                    )
                    .await;
                }
            }
            Message::FolderList(list) => {
                let handshaked = {
                    let mut inner = self.inner();
                    inner.remote_folders = Some(list);
                    inner.state.is_handshaked()
                };
                self.signal.notify_waiters();
                if handshaked {
                    let folders = node.folders();
                    self.ctx.io.spawn("sync-memberships", async move {
                        for folder in folders {
                            folder.synchronize_memberships().await;
                        }
                    });
                }
            }
            Message::FileList(list) => {
                let folder = node.folder(&list.folder);
                let remaining = if list.rejected {
                    tracing::debug!("{} refused its list of {}", self.nickname(), list.folder);
                    0
                } else {
                    list.following_deltas
                };
                let folder_id = list.folder;
                if let (Some(folder), false) = (&folder, list.rejected) {
                    folder.file_list_changed(self.id, RemoteFileList::Full(list.files));
                }
                let handshaked = {
                    let mut inner = self.inner();
                    inner.expected_lists.insert(folder_id, remaining);
                    inner.state.is_handshaked()
                };
                self.signal.notify_waiters();
                if let (Some(folder), true) = (&folder, handshaked && remaining == 0) {
                    node.transfers().trigger_download_check(folder);
                }
            }
            Message::FolderFilesChanged(delta) => {
                let folder = node.folder(&delta.folder);
                if let Some(folder) = &folder {
                    folder.file_list_changed(
                        self.id,
                        RemoteFileList::Delta {
                            added: delta.added,
                            removed: delta.removed,
                        },
                    );
                }
                let (handshaked, remaining) = {
                    let mut inner = self.inner();
                    let remaining = match inner.expected_lists.get_mut(&delta.folder) {
                        Some(n) => {
                            *n = n.saturating_sub(1);
                            *n
                        }
                        None => 0,
                    };
                    (inner.state.is_handshaked(), remaining)
                };
                self.signal.notify_waiters();
                if let (Some(folder), true) = (&folder, handshaked && remaining == 0) {
                    node.transfers().trigger_download_check(folder);
                }
            }
            Message::RequestDownload(request) => {
                let transfers = Arc::clone(node.transfers());
                let from = self.id;
                self.ctx.io.spawn("queue-upload", async move {
                    transfers.queue_upload(from, request).await;
                });
            }
            Message::RequestPart(request) => {
                let transfers = Arc::clone(node.transfers());
                let from = self.id;
                self.ctx.io.spawn("send-part", async move {
                    transfers.part_requested(from, request).await;
                });
            }
            Message::DownloadQueued(queued) => {
                node.transfers().on_download_queued(self.id, queued).await;
            }
            Message::StartUpload(start) => {
                node.transfers().on_start_upload(self.id, start).await;
            }
            Message::FileChunk(chunk) => {
                node.transfers().on_chunk(self.id, chunk).await;
            }
            Message::AbortUpload(abort) => {
                node.transfers().on_abort_upload(self.id, abort).await;
            }
            Message::AbortDownload(abort) => {
                node.transfers().on_abort_download(self.id, abort).await;
            }
            Message::StopUpload(stop) => {
                node.transfers().on_stop_upload(self.id, stop).await;
            }
            Message::HandshakeCompleted => {
                self.inner().ack_received = true;
                self.signal.notify_waiters();
            }
            Message::Problem(problem) => {
                if problem.fatal {
                    tracing::warn!(
                        "Fatal problem from {}: {:?} {}",
                        self.nickname(),
                        problem.code,
                        problem.message
                    );
                    self.terminate(
                        Some(generation),
                        HandshakeEvent::Failed {
                            reason: format!("{:?}: {}", problem.code, problem.message),
                        },
                    )
                    .await;
                } else {
                    tracing::warn!("Problem from {}: {}", self.nickname(), problem.message);
                }
            }
            Message::ScanCommand { folder } => match node.folder(&folder) {
                Some(folder) => folder.trigger_scan(),
                None => tracing::debug!("Scan requested for unknown folder {}", folder),
            },
            Message::Ping { id } => {
                if let Err(e) = self.send_message(Message::Pong { id }).await {
                    tracing::debug!("Pong to {} failed: {}", self.nickname(), e);
                }
            }
            Message::Pong { id } => {
                tracing::trace!("Pong {} from {}", id, self.nickname());
            }
            Message::TransferStatus(status) => {
                self.inner().remote_status = Some(status);
            }
            Message::RequestNodeList => {
                let nodes = node.known_nodes();
                if let Err(e) = self.send_message(Message::NodeList(NodeList { nodes })).await {
                    tracing::debug!("Node list to {} failed: {}", self.nickname(), e);
                }
            }
            Message::NodeList(list) => {
                node.learn_nodes(list.nodes);
            }
        }
    }

    // ---- Reconnect ----

    /// Open a new channel to the reconnect address and run the handshake.
    ///
    /// Consecutive failures while the local node is connected to the
    /// network eventually flag the member unreachable-from-network.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), ConnectFailure> {
        let node = self.node.upgrade().ok_or(ConnectFailure::Shutdown)?;
        if node.is_shutting_down() {
            return Err(ConnectFailure::Shutdown);
        }
        let (address, generation, actions) = {
            let mut inner = self.inner();
            if inner.dont_connect {
                return Err(ConnectFailure::DontConnect);
            }
            if inner.channel.is_some() || inner.state.is_connecting() {
                return Ok(());
            }
            let Some(address) = inner.reconnect_address.clone() else {
                return Err(ConnectFailure::NoAddress);
            };
            let (state, actions) =
                std::mem::take(&mut inner.state).on_event(HandshakeEvent::ConnectRequested);
            inner.state = state;
            (address, inner.generation, actions)
        };
        self.emit(actions);
        tracing::debug!("Reconnecting to {} at {}", self.nickname(), address);

        let result = self.connect_to(&node, &address).await;
        if let Err(failure) = &result {
            self.terminate(
                Some(generation),
                HandshakeEvent::Failed {
                    reason: failure.to_string(),
                },
            )
            .await;
            let unreachable = self
                .inner()
                .tracker
                .record_failure(node.is_connected_to_network());
            if unreachable {
                tracing::warn!(
                    "{} unreachable after {} attempts",
                    self.nickname(),
                    self.failures()
                );
                self.ctx
                    .events
                    .member(MemberEvent::UnreachableFromNetwork { node: self.id });
            }
        }
        result
    }

    async fn connect_to(self: &Arc<Self>, node: &SyncNode, address: &str) -> Result<(), ConnectFailure> {
        let connector = node
            .connector()
            .ok_or_else(|| ConnectFailure::Channel("no connector configured".into()))?;
        let target = tokio::net::lookup_host(address)
            .await
            .map_err(|e| ConnectFailure::Resolve(e.to_string()))?
            .next()
            .ok_or_else(|| ConnectFailure::Resolve(format!("no address for {}", address)))?;
        let channel = connector.connect(target).await?;
        self.set_peer(channel).await?;
        self.complete_handshake().await
    }
}

async fn refuse(channel: &dyn PeerChannel, code: ProblemCode, failure: &ConnectFailure) {
    tracing::warn!("Refusing connection: {}", failure);
    let reason = failure.to_string();
    let replies = [
        Message::IdentityReply(IdentityReply::rejected(reason.clone())),
        Message::Problem(Problem::new(code, reason, true)),
    ];
    for reply in replies {
        if let Err(e) = channel.send(reply).await {
            tracing::debug!("Failed to send refusal: {}", e);
            break;
        }
    }
    channel.close().await;
}
