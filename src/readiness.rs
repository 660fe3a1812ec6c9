use crate::unit::UnitCore;

/// A consumer at version `consumer` has exactly one unconsumed update pending
/// from a producer at version `producer`.
#[inline]
#[must_use]
pub const fn is_pending(producer: usize, consumer: usize) -> bool {
    producer == consumer + 1
}

/// Both sides have processed the same number of updates.
#[inline]
#[must_use]
pub const fn is_caught_up(lhs: usize, rhs: usize) -> bool {
    lhs == rhs
}

/// The unit has produced `cycle` forward outputs and every input carries the
/// update for `cycle`.
#[must_use]
pub fn is_forward_ready<T>(core: &UnitCore<T>, cycle: usize) -> bool {
    is_caught_up(core.forward_output.version(), cycle)
        && !core.forward_input.is_empty()
        && core
            .forward_input
            .values()
            .all(|slot| is_pending(slot.version(), cycle))
}

/// The unit emits gradients to at least one producer.
#[must_use]
pub fn has_valid_backward_unit<T>(core: &UnitCore<T>) -> bool {
    !core.backward_output.is_empty()
}

/// The unit has produced `cycle` gradients and every gradient input carries
/// the update for `cycle`. Units without backward outputs never qualify.
#[must_use]
pub fn is_backward_ready<T>(core: &UnitCore<T>, cycle: usize) -> bool {
    has_valid_backward_unit(core)
        && core
            .backward_output
            .values()
            .all(|slot| is_caught_up(slot.version(), cycle))
        && core
            .backward_input
            .values()
            .all(|slot| is_pending(slot.version(), cycle))
}
