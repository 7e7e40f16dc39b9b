//! Handshake state machine for one remote member.
//!
//! This module provides a pure, side-effect-free state machine for the
//! member handshake. It takes events as input and produces a new state plus
//! a list of actions to execute.
//!
//! The actual I/O (sending lists, waiting for replies, closing channels) is
//! performed by sync-engine, not by this module.

/// Handshake state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// No channel to the member.
    #[default]
    Disconnected,
    /// Outgoing connection attempt in progress.
    Connecting,
    /// Channel established and remote identity accepted.
    IdentityExchanged,
    /// Both folder lists exchanged.
    FolderListExchanged,
    /// File lists for every jointly held folder received.
    FileListComplete,
    /// Handshake finished, member is completely connected.
    Handshaked,
}

impl HandshakeState {
    /// Create a new state machine in the Disconnected state.
    pub fn new() -> Self {
        Self::Disconnected
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (sync-engine)
    /// is responsible for executing the returned actions.
    pub fn on_event(self, event: HandshakeEvent) -> (Self, Vec<HandshakeAction>) {
        match (self, event) {
            // From Disconnected
            (Self::Disconnected, HandshakeEvent::ConnectRequested) => {
                (Self::Connecting, vec![HandshakeAction::EmitEvent(PeerEvent::Connecting)])
            }
            (Self::Disconnected | Self::Connecting, HandshakeEvent::IdentityAccepted) => {
                (Self::IdentityExchanged, vec![])
            }

            // Handshake progress
            (Self::IdentityExchanged, HandshakeEvent::FolderListReceived) => {
                (Self::FolderListExchanged, vec![])
            }
            (Self::FolderListExchanged, HandshakeEvent::FileListsComplete) => {
                (Self::FileListComplete, vec![])
            }
            (Self::FileListComplete, HandshakeEvent::Acknowledged) => (
                Self::Handshaked,
                vec![HandshakeAction::EmitEvent(PeerEvent::Handshaked)],
            ),

            // Failures
            (Self::Disconnected, HandshakeEvent::Failed { .. })
            | (Self::Disconnected, HandshakeEvent::Disconnected { .. }) => {
                (Self::Disconnected, vec![])
            }
            (Self::Handshaked, HandshakeEvent::Failed { reason })
            | (Self::Handshaked, HandshakeEvent::Disconnected { reason }) => (
                Self::Disconnected,
                vec![
                    HandshakeAction::CloseChannel {
                        reason: reason.clone(),
                    },
                    HandshakeAction::EmitEvent(PeerEvent::Disconnected { reason }),
                ],
            ),
            (_, HandshakeEvent::Failed { reason }) | (_, HandshakeEvent::Disconnected { reason }) => (
                Self::Disconnected,
                vec![
                    HandshakeAction::CloseChannel {
                        reason: reason.clone(),
                    },
                    HandshakeAction::EmitEvent(PeerEvent::HandshakeFailed { reason }),
                ],
            ),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if the handshake completed.
    pub fn is_handshaked(&self) -> bool {
        matches!(self, Self::Handshaked)
    }

    /// Check if a channel exists (handshake in progress or finished).
    pub fn has_channel(&self) -> bool {
        !matches!(self, Self::Disconnected | Self::Connecting)
    }

    /// Check if a handshake is in progress.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            Self::Connecting
                | Self::IdentityExchanged
                | Self::FolderListExchanged
                | Self::FileListComplete
        )
    }
}

/// Events that can occur during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// Outgoing connection requested.
    ConnectRequested,
    /// Remote identity validated.
    IdentityAccepted,
    /// Remote folder list received.
    FolderListReceived,
    /// File lists of all jointly held folders received.
    FileListsComplete,
    /// Remote acknowledged handshake completion (or no ack is required).
    Acknowledged,
    /// Handshake step failed.
    Failed {
        /// Tagged failure reason.
        reason: String,
    },
    /// Channel was lost.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
    },
}

/// Actions to be executed by sync-engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Shut down the member's channel.
    CloseChannel {
        /// Reason reported to logs and the peer.
        reason: String,
    },
    /// Emit an event to the application.
    EmitEvent(PeerEvent),
}

/// Events emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Outgoing connection attempt started.
    Connecting,
    /// Handshake completed.
    Handshaked,
    /// Handshake aborted before completion.
    HandshakeFailed {
        /// Tagged failure reason.
        reason: String,
    },
    /// A completely connected member went away.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(events: Vec<HandshakeEvent>) -> HandshakeState {
        events
            .into_iter()
            .fold(HandshakeState::new(), |state, event| state.on_event(event).0)
    }

    #[test]
    fn starts_disconnected() {
        assert_eq!(HandshakeState::new(), HandshakeState::Disconnected);
    }

    #[test]
    fn connect_request_transitions_to_connecting() {
        let (state, actions) = HandshakeState::Disconnected.on_event(HandshakeEvent::ConnectRequested);
        assert_eq!(state, HandshakeState::Connecting);
        assert!(actions
            .iter()
            .any(|a| matches!(a, HandshakeAction::EmitEvent(PeerEvent::Connecting))));
    }

    #[test]
    fn incoming_connection_skips_connecting() {
        let (state, _) = HandshakeState::Disconnected.on_event(HandshakeEvent::IdentityAccepted);
        assert_eq!(state, HandshakeState::IdentityExchanged);
    }

    #[test]
    fn full_handshake_flow() {
        let state = drive(vec![
            HandshakeEvent::ConnectRequested,
            HandshakeEvent::IdentityAccepted,
            HandshakeEvent::FolderListReceived,
            HandshakeEvent::FileListsComplete,
        ]);
        assert_eq!(state, HandshakeState::FileListComplete);

        let (state, actions) = state.on_event(HandshakeEvent::Acknowledged);
        assert!(state.is_handshaked());
        assert!(actions
            .iter()
            .any(|a| matches!(a, HandshakeAction::EmitEvent(PeerEvent::Handshaked))));
    }

    #[test]
    fn file_lists_cannot_complete_before_folder_list() {
        let state = drive(vec![
            HandshakeEvent::IdentityAccepted,
            HandshakeEvent::FileListsComplete,
            HandshakeEvent::Acknowledged,
        ]);
        assert_eq!(state, HandshakeState::IdentityExchanged);
        assert!(!state.is_handshaked());
    }

    #[test]
    fn failure_mid_handshake_closes_channel() {
        let state = drive(vec![
            HandshakeEvent::IdentityAccepted,
            HandshakeEvent::FolderListReceived,
        ]);
        let (state, actions) = state.on_event(HandshakeEvent::Failed {
            reason: "timeout waiting for file lists".into(),
        });

        assert_eq!(state, HandshakeState::Disconnected);
        assert!(actions
            .iter()
            .any(|a| matches!(a, HandshakeAction::CloseChannel { .. })));
        assert!(actions.iter().any(|a| matches!(
            a,
            HandshakeAction::EmitEvent(PeerEvent::HandshakeFailed { reason }) if reason.contains("timeout")
        )));
    }

    #[test]
    fn disconnect_after_handshake_emits_disconnected() {
        let state = drive(vec![
            HandshakeEvent::IdentityAccepted,
            HandshakeEvent::FolderListReceived,
            HandshakeEvent::FileListsComplete,
            HandshakeEvent::Acknowledged,
        ]);
        let (state, actions) = state.on_event(HandshakeEvent::Disconnected {
            reason: "connection lost".into(),
        });

        assert_eq!(state, HandshakeState::Disconnected);
        assert!(actions
            .iter()
            .any(|a| matches!(a, HandshakeAction::EmitEvent(PeerEvent::Disconnected { .. }))));
    }

    #[test]
    fn failure_while_disconnected_is_silent() {
        let (state, actions) = HandshakeState::Disconnected.on_event(HandshakeEvent::Failed {
            reason: "late".into(),
        });
        assert_eq!(state, HandshakeState::Disconnected);
        assert!(actions.is_empty());
    }

    #[test]
    fn state_helpers() {
        assert!(!HandshakeState::Disconnected.has_channel());
        assert!(!HandshakeState::Connecting.has_channel());
        assert!(HandshakeState::IdentityExchanged.has_channel());
        assert!(HandshakeState::Handshaked.has_channel());

        assert!(HandshakeState::Connecting.is_connecting());
        assert!(HandshakeState::FileListComplete.is_connecting());
        assert!(!HandshakeState::Handshaked.is_connecting());
    }
}
