//! Channel abstraction between members.
//!
//! The engine talks to a remote node through a [`PeerChannel`]: an ordered,
//! reliable, already-authenticated message pipe. The connection layer below
//! it has already exchanged identities, so the channel knows who is on the
//! other side.
//!
//! # Design
//!
//! - `send()` transmits one typed message
//! - `recv()` waits for the next message
//! - `close()` terminates both directions
//!
//! [`MockChannel`] is an in-memory implementation used by tests. Messages
//! pass through the MessagePack codec so tests exercise the wire encoding.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use sync_types::{Identity, Message, SyncError};

/// Channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Channel closed.
    #[error("channel closed")]
    Closed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] SyncError),

    /// Connection attempt failed.
    #[error("connection failed: {0}")]
    ConnectFailed(String),
}

/// An ordered, reliable message channel to one remote node.
#[async_trait]
pub trait PeerChannel: Send + Sync + std::fmt::Debug {
    /// Identity the remote presented to the connection layer.
    fn remote_identity(&self) -> Option<Identity>;

    /// Whether the remote is on the local network.
    fn is_lan(&self) -> bool;

    /// Remote socket address, if known.
    fn remote_address(&self) -> Option<SocketAddr>;

    /// Send one message.
    async fn send(&self, message: Message) -> Result<(), ChannelError>;

    /// Receive the next message.
    ///
    /// Returns [`ChannelError::Closed`] once the channel is shut down.
    async fn recv(&self) -> Result<Message, ChannelError>;

    /// Close the channel in both directions.
    async fn close(&self);

    /// Check if the channel was closed.
    fn is_closed(&self) -> bool;
}

/// Opens new channels for reconnects.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `address`.
    async fn connect(&self, address: SocketAddr) -> Result<Arc<dyn PeerChannel>, ChannelError>;
}

/// In-memory channel for testing.
///
/// A standalone channel captures sent messages and lets the test inject
/// incoming ones. [`MockChannel::pair`] cross-wires two channels so two
/// engines can talk to each other.
#[derive(Debug, Clone)]
pub struct MockChannel {
    inner: Arc<MockChannelInner>,
}

#[derive(Debug)]
struct MockChannelInner {
    remote: Identity,
    state: Mutex<MockChannelState>,
    incoming_tx: mpsc::UnboundedSender<Vec<u8>>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    peer_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    closed: Arc<watch::Sender<bool>>,
}

#[derive(Debug, Default)]
struct MockChannelState {
    lan: bool,
    address: Option<SocketAddr>,
    sent: Vec<Message>,
    fail_next_send: Option<String>,
}

impl MockChannel {
    /// Create a standalone channel to `remote`.
    pub fn new(remote: Identity) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Self::build(remote, incoming_tx, incoming_rx, None, Arc::new(closed))
    }

    /// Create two connected channels.
    ///
    /// The first is held by `a` and talks to `b`; the second is held by `b`
    /// and talks to `a`. Closing either end closes both.
    pub fn pair(a: Identity, b: Identity) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        let held_by_a = Self::build(b, a_tx.clone(), a_rx, Some(b_tx.clone()), Arc::clone(&closed));
        let held_by_b = Self::build(a, b_tx, b_rx, Some(a_tx), closed);
        (held_by_a, held_by_b)
    }

    fn build(
        remote: Identity,
        incoming_tx: mpsc::UnboundedSender<Vec<u8>>,
        incoming_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        peer_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
        closed: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            inner: Arc::new(MockChannelInner {
                remote,
                state: Mutex::new(MockChannelState::default()),
                incoming_tx,
                incoming_rx: tokio::sync::Mutex::new(incoming_rx),
                peer_tx,
                closed,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockChannelState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark the remote as on the local network.
    pub fn set_lan(&self, lan: bool) {
        self.state().lan = lan;
    }

    /// Set the remote address.
    pub fn set_address(&self, address: SocketAddr) {
        self.state().address = Some(address);
    }

    /// Queue a message to be returned by `recv()`.
    pub fn inject(&self, message: Message) {
        if let Ok(bytes) = message.to_bytes() {
            let _ = self.inner.incoming_tx.send(bytes);
        }
    }

    /// All messages sent so far.
    pub fn sent(&self) -> Vec<Message> {
        self.state().sent.clone()
    }

    /// The last message sent.
    pub fn last_sent(&self) -> Option<Message> {
        self.state().sent.last().cloned()
    }

    /// Forget all captured messages.
    pub fn clear_sent(&self) {
        self.state().sent.clear();
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        self.state().fail_next_send = Some(error.to_string());
    }

    /// Wait until a sent message matches `predicate`.
    pub async fn wait_for_sent<F>(&self, timeout: Duration, predicate: F) -> Option<Message>
    where
        F: Fn(&Message) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(found) = self.state().sent.iter().find(|m| predicate(m)).cloned() {
                return Some(found);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl PeerChannel for MockChannel {
    fn remote_identity(&self) -> Option<Identity> {
        Some(self.inner.remote.clone())
    }

    fn is_lan(&self) -> bool {
        self.state().lan
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.state().address
    }

    async fn send(&self, message: Message) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let bytes = {
            let mut state = self.state();
            // Check for forced failure
            if let Some(error) = state.fail_next_send.take() {
                return Err(ChannelError::SendFailed(error));
            }
            let bytes = message.to_bytes()?;
            state.sent.push(message);
            bytes
        };

        if let Some(peer) = &self.inner.peer_tx {
            peer.send(bytes).map_err(|_| ChannelError::Closed)?;
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Message, ChannelError> {
        let mut incoming = self.inner.incoming_rx.lock().await;
        let mut closed = self.inner.closed.subscribe();

        tokio::select! {
            biased;
            bytes = incoming.recv() => match bytes {
                Some(bytes) => Ok(Message::from_bytes(&bytes)?),
                None => Err(ChannelError::Closed),
            },
            _ = wait_closed(&mut closed) => Err(ChannelError::Closed),
        }
    }

    async fn close(&self) {
        self.inner.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }
}

fn is_set(flag: &mut watch::Receiver<bool>) -> bool {
    *flag.borrow_and_update()
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    while !is_set(closed) {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// Connector handing out prepared channels.
#[derive(Debug, Default)]
pub struct MockConnector {
    inner: Mutex<MockConnectorInner>,
}

#[derive(Debug, Default)]
struct MockConnectorInner {
    results: VecDeque<Result<MockChannel, String>>,
    attempts: Vec<SocketAddr>,
}

impl MockConnector {
    /// Create a connector with no prepared results.
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, MockConnectorInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand out `channel` on the next connect.
    pub fn push_channel(&self, channel: MockChannel) {
        self.inner().results.push_back(Ok(channel));
    }

    /// Fail the next connect with `error`.
    pub fn push_failure(&self, error: &str) {
        self.inner().results.push_back(Err(error.to_string()));
    }

    /// Addresses connected to so far.
    pub fn attempts(&self) -> Vec<SocketAddr> {
        self.inner().attempts.clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, address: SocketAddr) -> Result<Arc<dyn PeerChannel>, ChannelError> {
        let mut inner = self.inner();
        inner.attempts.push(address);
        match inner.results.pop_front() {
            Some(Ok(channel)) => Ok(Arc::new(channel)),
            Some(Err(error)) => Err(ChannelError::ConnectFailed(error)),
            None => Err(ChannelError::ConnectFailed("connection refused".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::{NetworkId, NodeId, NodeInfo, PROTOCOL_VERSION};

    fn identity(name: &str) -> Identity {
        Identity {
            node: NodeInfo::new(NodeId::random(), name),
            network_id: NetworkId::new("test"),
            protocol_version: PROTOCOL_VERSION,
            accepts_incoming: true,
            requires_handshake_ack: true,
        }
    }

    #[tokio::test]
    async fn standalone_captures_and_injects() {
        let channel = MockChannel::new(identity("remote"));

        channel.send(Message::Ping { id: 1 }).await.unwrap();
        channel.inject(Message::Pong { id: 1 });

        assert_eq!(channel.sent(), vec![Message::Ping { id: 1 }]);
        assert_eq!(channel.recv().await.unwrap(), Message::Pong { id: 1 });
    }

    #[tokio::test]
    async fn pair_delivers_both_ways() {
        let a = identity("a");
        let b = identity("b");
        let (held_by_a, held_by_b) = MockChannel::pair(a.clone(), b.clone());

        assert_eq!(held_by_a.remote_identity().unwrap(), b);
        assert_eq!(held_by_b.remote_identity().unwrap(), a);

        held_by_a.send(Message::Ping { id: 7 }).await.unwrap();
        held_by_b.send(Message::Pong { id: 7 }).await.unwrap();

        assert_eq!(held_by_b.recv().await.unwrap(), Message::Ping { id: 7 });
        assert_eq!(held_by_a.recv().await.unwrap(), Message::Pong { id: 7 });
    }

    #[tokio::test]
    async fn close_wakes_receiver_on_both_ends() {
        let (held_by_a, held_by_b) = MockChannel::pair(identity("a"), identity("b"));

        let receiver = tokio::spawn(async move { held_by_b.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        held_by_a.close().await;

        let result = receiver.await.unwrap();
        assert!(matches!(result, Err(ChannelError::Closed)));
        assert!(held_by_a.is_closed());
        assert!(matches!(
            held_by_a.send(Message::Ping { id: 1 }).await,
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn forced_send_failure() {
        let channel = MockChannel::new(identity("remote"));
        channel.fail_next_send("buffer full");

        let result = channel.send(Message::RequestNodeList).await;
        assert!(matches!(result, Err(ChannelError::SendFailed(_))));

        // Next send should work
        channel.send(Message::RequestNodeList).await.unwrap();
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn wait_for_sent_times_out() {
        let channel = MockChannel::new(identity("remote"));
        let found = channel
            .wait_for_sent(Duration::from_millis(30), |m| {
                matches!(m, Message::HandshakeCompleted)
            })
            .await;
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn connector_hands_out_prepared_results() {
        let connector = MockConnector::new();
        connector.push_failure("unreachable");
        connector.push_channel(MockChannel::new(identity("remote")));
        let addr: SocketAddr = "127.0.0.1:7337".parse().unwrap();

        assert!(connector.connect(addr).await.is_err());
        assert!(connector.connect(addr).await.is_ok());
        assert!(connector.connect(addr).await.is_err());
        assert_eq!(connector.attempts().len(), 3);
    }
}
