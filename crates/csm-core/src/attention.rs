//! Attention signal with generation-keyed expiry.
//!
//! The signal is raised whenever a session completes and lowers itself a
//! fixed delay after the *latest* raise. Rather than cancelling platform
//! timers, every raise bumps a generation counter; a delayed clear carries
//! the generation it was scheduled for and only takes effect if no newer
//! raise happened in between.
//!
//! The delay itself is scheduled by the owner of the signal (the registry
//! actor); this type only holds the state.

use serde::{Deserialize, Serialize};

/// Process-wide "a session just finished" flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttentionSignal {
    raised: bool,
    generation: u64,
}

impl AttentionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal and returns the generation a delayed clear must
    /// present to [`expire`](Self::expire).
    pub fn trigger(&mut self) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.raised = true;
        self.generation
    }

    /// Clears the signal if `generation` is still the latest raise.
    ///
    /// Returns true if this call lowered the signal.
    pub fn expire(&mut self, generation: u64) -> bool {
        if !self.raised || generation != self.generation {
            return false;
        }
        self.raised = false;
        true
    }

    /// Lowers the signal regardless of pending expiries.
    ///
    /// Returns true if the signal was raised.
    pub fn clear(&mut self) -> bool {
        std::mem::replace(&mut self.raised, false)
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.raised
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}
