//! Publish-time sequence numbers and the monotonic observation clock.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Nanoseconds since the first call in this process. Monotonic; never
/// compared against wall-clock.
pub fn monotonic_ns() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

/// Monotonic counter shared by every producer of one ring. Never rewound:
/// a ring built on an existing sequencer continues where it left off.
#[derive(Debug, Default)]
pub struct Sequencer {
    last: AtomicU64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue after a previously issued sequence number.
    pub fn starting_after(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    /// Single interlocked increment; the first value handed out is 1.
    #[inline]
    pub fn assign_sequence(&self) -> u64 {
        self.last.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn last_assigned(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}
