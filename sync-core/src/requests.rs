//! Bounded queue of outstanding part requests for one download source.
//!
//! Part requests flow through the queue in this order:
//! 1. `push()` - a request was sent to the partner
//! 2. `chunk_received()` - a chunk arrived; every request it fully covers is
//!    removed
//! 3. `drain()` - the source broke; the outstanding ranges are handed back so
//!    another source can request them
//!
//! The cap keeps flow control bounded without buffering on the partner side.

use std::collections::VecDeque;

/// Default cap on outstanding part requests per source.
pub const DEFAULT_MAX_PENDING: usize = 15;

/// Error type for queue operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Queue is at capacity.
    Full {
        /// Queue capacity.
        capacity: usize,
    },
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Full { capacity } => {
                write!(f, "part request queue full (capacity: {})", capacity)
            }
        }
    }
}

impl std::error::Error for QueueError {}

/// A half-open byte range `[offset, offset + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartRange {
    /// First byte.
    pub offset: u64,
    /// Number of bytes.
    pub length: u64,
}

impl PartRange {
    /// Create a new range.
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// One past the last byte.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    /// Whether `other` lies completely inside this range.
    pub fn covers(&self, other: &PartRange) -> bool {
        self.offset <= other.offset && other.end() <= self.end()
    }
}

/// Outstanding part requests of one download source.
#[derive(Debug)]
pub struct PartRequestQueue {
    max_size: usize,
    pending: VecDeque<PartRange>,
}

impl PartRequestQueue {
    /// Create a queue that holds at most `max_size` requests.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            pending: VecDeque::new(),
        }
    }

    /// Record a sent request.
    ///
    /// Returns an error if `max_size` requests are already outstanding.
    pub fn push(&mut self, range: PartRange) -> Result<(), QueueError> {
        if self.is_full() {
            return Err(QueueError::Full {
                capacity: self.max_size,
            });
        }
        self.pending.push_back(range);
        Ok(())
    }

    /// Remove every request the received chunk fully covers.
    ///
    /// Returns the number of satisfied requests.
    pub fn chunk_received(&mut self, chunk: PartRange) -> usize {
        let before = self.pending.len();
        self.pending.retain(|req| !chunk.covers(req));
        before - self.pending.len()
    }

    /// Hand back all outstanding requests, emptying the queue.
    pub fn drain(&mut self) -> Vec<PartRange> {
        self.pending.drain(..).collect()
    }

    /// Whether an outstanding request covers `range`.
    pub fn is_requested(&self, range: &PartRange) -> bool {
        self.pending.iter().any(|req| req.covers(range))
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if no request is outstanding.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Check if another request would exceed the cap.
    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.max_size
    }

    /// Free request slots.
    pub fn free_slots(&self) -> usize {
        self.max_size.saturating_sub(self.pending.len())
    }
}

impl Default for PartRequestQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}
