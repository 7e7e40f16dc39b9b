//! # sync-core
//!
//! Pure logic for foldsync (no I/O, instant tests).
//!
//! This crate implements the state machines and policies of the sync engine
//! without any network or disk I/O:
//! - [`handshake`] - per-member handshake state machine
//! - [`reconnect`] - reconnect backoff and unreachability tracking
//! - [`transfer`] - transfer lifecycle and break reasons
//! - [`requests`] - bounded queue of outstanding part requests
//! - [`ranges`] - byte-range bookkeeping for multi-source downloads
//! - [`profile`] - sync profiles, scan schedules, mass-deletion policy
//! - [`names`] - cross-platform filename validation
//!
//! The actual I/O is performed by `sync-engine`, which interprets the
//! actions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod handshake;
pub mod names;
pub mod profile;
pub mod ranges;
pub mod reconnect;
pub mod requests;
pub mod transfer;

pub use handshake::{HandshakeAction, HandshakeEvent, HandshakeState, PeerEvent};
pub use names::{check_path, find_case_collisions, FilenameProblem, FilenameProblemKind};
pub use profile::{MassDeletePolicy, Permission, ScanSchedule, SyncProfile};
pub use ranges::{FileProgress, RangeSet};
pub use reconnect::{retry_delay, ReconnectTracker};
pub use requests::{PartRange, PartRequestQueue, QueueError};
pub use transfer::{TransferEvent, TransferProblem, TransferState};
