//! Generation Counter
//!
//! Every control plane construction bumps the epoch once. Cached state stamped
//! with an older epoch is treated as stale, which invalidates whole caches in
//! O(1) without walking them.

use std::sync::atomic::{AtomicU32, Ordering};

/// Monotonic generation counter shared by the components of one control plane
#[derive(Debug, Default)]
pub struct Epoch(AtomicU32);

impl Epoch {
    /// Create a counter starting at `value`
    pub fn new(value: u32) -> Self {
        Self(AtomicU32::new(value))
    }

    /// Current generation
    pub fn current(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Advance to the next generation and return it
    pub fn bump(&self) -> u32 {
        self.0.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }
}
