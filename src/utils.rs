use crate::sync::{spin_loop, yield_now};

/// Bounded exponential spin followed by yielding to the OS scheduler.
///
/// Every blocking point of the crate (full/empty queue, occupied mailbox,
/// round barrier) waits through this type, so swapping it for a parking
/// strategy changes latency only, never results.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    step: u32,
    spin_limit: u32,
}

impl Backoff {
    /// Largest exponent accepted for the spin phase (`2^10` hints per snooze).
    const MAX_SPIN_LIMIT: u32 = 10;

    pub(crate) fn new(spin_limit: u32) -> Self {
        Self {
            step: 0,
            spin_limit: spin_limit.min(Self::MAX_SPIN_LIMIT),
        }
    }

    /// Wait a little longer than the previous call did.
    #[inline]
    pub(crate) fn snooze(&mut self) {
        // Under loom every hint is a scheduling point.
        if cfg!(feature = "loom") {
            yield_now();
            return;
        }
        if self.step < self.spin_limit {
            for _ in 0..1u32 << self.step {
                spin_loop();
            }
            self.step += 1;
        } else {
            yield_now();
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.step = 0;
    }
}
