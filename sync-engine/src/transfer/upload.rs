//! One upload to one partner.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use sync_core::{TransferEvent as StateEvent, TransferProblem, TransferState};
use sync_types::{FileKey, FileRecord, NodeId};

/// A file being served to a downloading partner.
#[derive(Debug)]
pub struct Upload {
    file: FileRecord,
    partner: NodeId,
    is_lan: bool,
    inner: Mutex<UploadInner>,
}

#[derive(Debug)]
struct UploadInner {
    state: TransferState,
    bytes_sent: u64,
    last_activity: Instant,
}

impl Upload {
    /// A queued upload of `file` to `partner`.
    pub fn new(file: FileRecord, partner: NodeId, is_lan: bool) -> Self {
        Self {
            file,
            partner,
            is_lan,
            inner: Mutex::new(UploadInner {
                state: TransferState::Pending.on_event(StateEvent::Queued),
                bytes_sent: 0,
                last_activity: Instant::now(),
            }),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, UploadInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Served version.
    pub fn file(&self) -> &FileRecord {
        &self.file
    }

    /// Downloading partner.
    pub fn partner(&self) -> NodeId {
        self.partner
    }

    /// Whether the partner is on the local network.
    pub fn is_lan(&self) -> bool {
        self.is_lan
    }

    /// Whether this upload serves `key` to `partner`.
    pub fn matches(&self, partner: &NodeId, key: &FileKey) -> bool {
        self.partner == *partner && self.file.folder == key.folder && self.file.path == key.path
    }

    /// Current state.
    pub fn state(&self) -> TransferState {
        self.inner().state.clone()
    }

    /// Whether bytes may be sent.
    pub fn is_active(&self) -> bool {
        self.inner().state.is_active()
    }

    /// Whether the upload waits for a slot.
    pub fn is_queued(&self) -> bool {
        matches!(self.inner().state, TransferState::Queued)
    }

    /// Whether the upload finished or broke.
    pub fn is_done(&self) -> bool {
        self.inner().state.is_done()
    }

    /// Move from queued to active. Returns `false` if not queued.
    pub fn start(&self) -> bool {
        let mut inner = self.inner();
        if !matches!(inner.state, TransferState::Queued) {
            return false;
        }
        inner.state = inner.state.clone().on_event(StateEvent::Started);
        inner.last_activity = Instant::now();
        true
    }

    /// Account for a sent chunk.
    pub fn record_sent(&self, bytes: u64) {
        let mut inner = self.inner();
        inner.bytes_sent += bytes;
        inner.last_activity = Instant::now();
    }

    /// Bytes sent so far.
    pub fn bytes_sent(&self) -> u64 {
        self.inner().bytes_sent
    }

    /// Bytes still to send, assuming the partner has nothing yet.
    pub fn remaining_bytes(&self) -> u64 {
        self.file.size.saturating_sub(self.bytes_sent())
    }

    /// Time since the last chunk or state change.
    pub fn idle_for(&self) -> Duration {
        self.inner().last_activity.elapsed()
    }

    /// Mark completed. Returns `false` if already done.
    pub fn complete(&self) -> bool {
        let mut inner = self.inner();
        if inner.state.is_done() {
            return false;
        }
        // A partner may stop a queued upload once it has the file
        inner.state = TransferState::Completed;
        true
    }

    /// Mark broken. Returns `false` if already done.
    pub fn break_with(&self, problem: TransferProblem) -> bool {
        let mut inner = self.inner();
        if inner.state.is_done() {
            return false;
        }
        inner.state = inner.state.clone().on_event(StateEvent::Broken(problem));
        true
    }
}
