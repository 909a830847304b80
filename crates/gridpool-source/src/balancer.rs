//! Round-robin peer rotation.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Hands out, for each acquisition, every peer index once, starting one
/// step further than the previous acquisition did.
#[derive(Debug, Default)]
pub struct RoundRobin {
    start: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indices `0..peers` rotated to the next starting peer. Empty when
    /// there are no peers.
    pub fn rotation(&self, peers: usize) -> impl Iterator<Item = usize> {
        let first = if peers == 0 {
            0
        } else {
            self.start.fetch_add(1, Ordering::Relaxed) % peers
        };
        (0..peers).map(move |step| (first + step) % peers)
    }
}
