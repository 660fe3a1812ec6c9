use crate::tensor::{Element, Tensor};
use core::sync::atomic::{AtomicUsize, Ordering};

/// Monotonic count of publications on a [`Slot`].
///
/// Loads are `Acquire` and increments `AcqRel`, so observing version `V`
/// from another thread also makes the buffer contents published with `V`
/// visible.
#[derive(Debug, Default)]
pub struct StateCounter(AtomicUsize);

impl StateCounter {
    /// Counter starting at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// Current version.
    #[inline]
    #[must_use]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Advance by exactly one and return the new version.
    #[inline]
    pub fn increment(&self) -> usize {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// One directed edge: a buffer plus the version of its latest publication.
///
/// A slot has exactly one producer and one consumer. Writing goes either
/// through [`Slot::write`]/[`Slot::copy_from`] (replace and publish) or
/// through [`Slot::tensor_mut`] followed by [`Slot::publish`] when a unit
/// computes in place.
#[derive(Debug, Default)]
pub struct Slot<T> {
    tensor: Tensor<T>,
    state: StateCounter,
}

impl<T: Element> Slot<T> {
    /// Slot holding `tensor` at version zero.
    #[must_use]
    pub fn new(tensor: Tensor<T>) -> Self {
        Self {
            tensor,
            state: StateCounter::new(),
        }
    }

    /// Degenerate slot without data. Bumping it is how sources and sinks are
    /// made discoverable at the start of a cycle.
    #[must_use]
    pub fn seed() -> Self {
        Self::default()
    }

    /// Replace the buffer and publish it.
    pub fn write(&mut self, tensor: Tensor<T>) -> usize {
        self.tensor = tensor;
        self.publish()
    }

    /// Duplicate `src` into the buffer and publish it.
    pub fn copy_from(&mut self, src: &Tensor<T>) -> usize {
        self.tensor.copy_from(src);
        self.publish()
    }

    /// Current buffer and version.
    #[must_use]
    pub fn read(&self) -> (&Tensor<T>, usize) {
        (&self.tensor, self.state.get())
    }

    /// Take the buffer out, leaving an empty one and the version untouched.
    pub(crate) fn take_tensor(&mut self) -> Tensor<T> {
        core::mem::take(&mut self.tensor)
    }

    /// Put back a buffer obtained from [`Slot::take_tensor`].
    pub(crate) fn restore_tensor(&mut self, tensor: Tensor<T>) {
        self.tensor = tensor;
    }
}

impl<T> Slot<T> {
    /// Current version.
    #[inline]
    #[must_use]
    pub fn version(&self) -> usize {
        self.state.get()
    }

    /// Mark the current buffer contents as a new version.
    #[inline]
    pub fn publish(&self) -> usize {
        self.state.increment()
    }

    /// Buffer.
    #[must_use]
    pub fn tensor(&self) -> &Tensor<T> {
        &self.tensor
    }

    /// Buffer for in-place computation. Does not change the version.
    #[must_use]
    pub fn tensor_mut(&mut self) -> &mut Tensor<T> {
        &mut self.tensor
    }
}
