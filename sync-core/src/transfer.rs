//! Transfer lifecycle state machine.
//!
//! Every upload and every download source moves through
//! `Pending -> Queued -> Active -> Completed`, or ends `Broken` with a
//! [`TransferProblem`]. A broken manual download may re-enter `Pending`.

use std::fmt;

/// Why a transfer broke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferProblem {
    /// Partner disconnected.
    PartnerDisconnected,
    /// No part arrived within the inactivity timeout.
    Timeout,
    /// Partner never acknowledged the queued state.
    NotAcknowledged,
    /// File was blacklisted locally.
    Blacklisted,
    /// A newer version of the file became available.
    NewerVersionAvailable,
    /// Partner aborted the transfer.
    AbortedByPartner,
    /// Local abort (user, shutdown, or superseded request).
    AbortedLocally,
    /// Partner rejected the request.
    Rejected(String),
    /// A received chunk failed checksum or range validation.
    InvalidChunk,
    /// Local disk I/O failed.
    Io(String),
    /// The local copy no longer matches the index.
    FileChanged,
}

impl fmt::Display for TransferProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PartnerDisconnected => write!(f, "partner disconnected"),
            Self::Timeout => write!(f, "transfer timed out"),
            Self::NotAcknowledged => write!(f, "partner did not acknowledge queued transfer"),
            Self::Blacklisted => write!(f, "file is blacklisted"),
            Self::NewerVersionAvailable => write!(f, "newer version available"),
            Self::AbortedByPartner => write!(f, "aborted by partner"),
            Self::AbortedLocally => write!(f, "aborted"),
            Self::Rejected(reason) => write!(f, "rejected: {}", reason),
            Self::InvalidChunk => write!(f, "invalid chunk received"),
            Self::Io(err) => write!(f, "I/O error: {}", err),
            Self::FileChanged => write!(f, "local file changed"),
        }
    }
}

impl std::error::Error for TransferProblem {}

/// Lifecycle state of one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransferState {
    /// Requested, not yet acknowledged by the partner.
    #[default]
    Pending,
    /// Partner queued the transfer.
    Queued,
    /// Data is flowing.
    Active,
    /// Transfer finished successfully.
    Completed,
    /// Transfer failed.
    Broken(TransferProblem),
}

/// Events driving a [`TransferState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// Partner acknowledged with a queued message.
    Queued,
    /// Data transfer started.
    Started,
    /// All bytes received or sent.
    Completed,
    /// Transfer failed.
    Broken(TransferProblem),
    /// Manual retry requested after a break.
    Retry,
}

impl TransferState {
    /// Process an event, returning the new state.
    ///
    /// Invalid transitions leave the state unchanged. Terminal states only
    /// leave via `Retry` (from `Broken`).
    pub fn on_event(self, event: TransferEvent) -> Self {
        match (self, event) {
            (Self::Pending, TransferEvent::Queued) => Self::Queued,
            (Self::Pending | Self::Queued, TransferEvent::Started) => Self::Active,
            (Self::Active, TransferEvent::Completed) => Self::Completed,
            (Self::Pending | Self::Queued | Self::Active, TransferEvent::Broken(problem)) => {
                Self::Broken(problem)
            }
            (Self::Broken(_), TransferEvent::Retry) => Self::Pending,
            (state, _) => state,
        }
    }

    /// Whether the transfer has reached a terminal state.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Broken(_))
    }

    /// Whether the transfer is broken.
    pub fn is_broken(&self) -> bool {
        matches!(self, Self::Broken(_))
    }

    /// Whether bytes are flowing.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Break reason, if broken.
    pub fn problem(&self) -> Option<&TransferProblem> {
        match self {
            Self::Broken(problem) => Some(problem),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let state = TransferState::default()
            .on_event(TransferEvent::Queued)
            .on_event(TransferEvent::Started)
            .on_event(TransferEvent::Completed);
        assert_eq!(state, TransferState::Completed);
        assert!(state.is_done());
        assert!(!state.is_broken());
    }

    #[test]
    fn start_without_queue_ack() {
        let state = TransferState::Pending.on_event(TransferEvent::Started);
        assert!(state.is_active());
    }

    #[test]
    fn break_records_problem() {
        let state = TransferState::Active.on_event(TransferEvent::Broken(TransferProblem::Timeout));
        assert!(state.is_broken());
        assert_eq!(state.problem(), Some(&TransferProblem::Timeout));
    }

    #[test]
    fn completed_is_terminal() {
        let state = TransferState::Completed
            .on_event(TransferEvent::Broken(TransferProblem::PartnerDisconnected))
            .on_event(TransferEvent::Retry);
        assert_eq!(state, TransferState::Completed);
    }

    #[test]
    fn broken_can_retry() {
        let state = TransferState::Broken(TransferProblem::PartnerDisconnected)
            .on_event(TransferEvent::Retry);
        assert_eq!(state, TransferState::Pending);
    }

    #[test]
    fn cannot_complete_from_pending() {
        let state = TransferState::Pending.on_event(TransferEvent::Completed);
        assert_eq!(state, TransferState::Pending);
    }

    #[test]
    fn problem_display() {
        assert_eq!(
            TransferProblem::Rejected("not in sync".into()).to_string(),
            "rejected: not in sync"
        );
        assert_eq!(TransferProblem::Timeout.to_string(), "transfer timed out");
    }
}
