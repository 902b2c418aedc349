//! Early ICE candidate buffering
//!
//! Candidates can reach a peer link before its remote description is set,
//! and a peer connection rejects them until then. The buffer holds them in
//! arrival order and hands them over exactly once when the remote
//! description lands. After that it is a pass-through: later candidates are
//! applied immediately and never stored.

use crate::types::IceCandidate;
use std::collections::VecDeque;

/// What the caller must do with a candidate offered to the buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Held until the remote description is set
    Queued,
    /// The gate is open: apply the candidate now
    ApplyNow(IceCandidate),
}

/// Per-peer FIFO of candidates waiting for a remote description
#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    queue: VecDeque<IceCandidate>,
    drained: bool,
}

impl IceCandidateBuffer {
    /// Create an empty, closed gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a closed gate pre-filled with candidates that arrived before
    /// the link existed
    pub fn with_pending(pending: impl IntoIterator<Item = IceCandidate>) -> Self {
        Self {
            queue: pending.into_iter().collect(),
            drained: false,
        }
    }

    /// Offer a remote candidate
    pub fn enqueue(&mut self, candidate: IceCandidate) -> Admission {
        if self.drained {
            Admission::ApplyNow(candidate)
        } else {
            self.queue.push_back(candidate);
            Admission::Queued
        }
    }

    /// Open the gate. Returns the queued candidates in arrival order on the
    /// first call and nothing on any later call.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        if self.drained {
            return Vec::new();
        }
        self.drained = true;
        self.queue.drain(..).collect()
    }

    /// Check if the gate has been opened
    pub fn is_drained(&self) -> bool {
        self.drained
    }

    /// Number of held candidates
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if nothing is held
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
