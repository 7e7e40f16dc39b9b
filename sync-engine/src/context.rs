//! Runtime context shared by every engine component.
//!
//! The context carries the immutable configuration, the local identity, the
//! event bus and the shared I/O worker pool. It is built once at startup and
//! passed to each component's constructor.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use sync_types::{Identity, NetworkId, NodeInfo, PROTOCOL_VERSION};

use crate::config::EngineConfig;
use crate::events::EventBus;

/// Shared runtime context.
#[derive(Debug)]
pub struct EngineContext {
    /// Immutable configuration.
    pub config: Arc<EngineConfig>,
    /// Local node identity.
    pub local: NodeInfo,
    /// Network this node belongs to.
    pub network_id: NetworkId,
    /// Event bus.
    pub events: EventBus,
    /// Worker pool for message-triggered business logic.
    pub io: IoPool,
}

impl EngineContext {
    /// Build a context from configuration and the local identity.
    pub fn new(config: EngineConfig, local: NodeInfo) -> Arc<Self> {
        let network_id = NetworkId::new(config.node.network_id.clone());
        let io = IoPool::new(config.node.io_workers);
        Arc::new(Self {
            config: Arc::new(config),
            local,
            network_id,
            events: EventBus::new(),
            io,
        })
    }

    /// Identity announced to peers.
    pub fn identity(&self) -> Identity {
        Identity {
            node: self.local.clone(),
            network_id: self.network_id.clone(),
            protocol_version: PROTOCOL_VERSION,
            accepts_incoming: self.config.node.accepts_incoming,
            requires_handshake_ack: self.config.handshake.require_ack,
        }
    }
}

/// Bounded pool for off-loaded work.
///
/// Tasks beyond the worker count wait for a permit, so a burst of requests
/// from one member cannot starve the runtime.
#[derive(Debug, Clone)]
pub struct IoPool {
    permits: Arc<Semaphore>,
}

impl IoPool {
    /// Create a pool running at most `workers` tasks at once.
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Run `task` once a worker is free.
    pub fn spawn<F>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::debug!("I/O pool closed, dropping task {}", name);
                    return;
                }
            };
            task.await;
        })
    }

    /// Number of idle workers.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Run `tick` every `period` until the returned handle is aborted.
///
/// The first run happens after one full period.
pub fn spawn_repeating<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        tracing::debug!("{} task started (interval: {:?})", name, period);
        let mut timer = tokio::time::interval(period.max(Duration::from_millis(1)));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately once
        timer.tick().await;

        loop {
            timer.tick().await;
            tick().await;
        }
    })
}
