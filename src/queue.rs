use crate::{
    handoff::{CountingSync, DEFAULT_SPIN_LIMIT},
    sync::{Arc, AtomicUsize, Ordering, UnsafeCell},
    types::NodeId,
    utils::Backoff,
};
use core::mem::MaybeUninit;
use derive_more::{Debug, Deref, Display};
use std::panic::{AssertUnwindSafe, catch_unwind};

#[derive(Debug, Deref)]
#[repr(align(128))]
struct CachePadded<T>(T);

#[derive(Debug)]
struct Cell<T> {
    /// Position this cell expects next: `pos` when free for the enqueue at
    /// `pos`, `pos + 1` once filled for the dequeue at `pos`.
    sequence: AtomicUsize,
    #[debug(skip)]
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded multi-producer multi-consumer FIFO.
///
/// Every cell carries a sequence number so producers and consumers claim
/// positions with a single compare-exchange on their own cursor and never
/// touch the same cell concurrently. [`TaskQueue::enqueue`] and
/// [`TaskQueue::dequeue`] wait with bounded spinning, then yielding.
#[derive(Debug)]
pub struct TaskQueue<T> {
    buffer: Box<[Cell<T>]>,
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
    spin_limit: u32,
}

// SAFETY: a value is written by the single producer that claimed its position
// and read by the single consumer that claimed the same position afterwards;
// the cell's sequence number orders the two with Release/Acquire.
unsafe impl<T: Send> Send for TaskQueue<T> {}
// SAFETY: see above.
unsafe impl<T: Send> Sync for TaskQueue<T> {}

impl<T> TaskQueue<T> {
    /// Queue holding at most `capacity` items. Zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_spin_limit(capacity, DEFAULT_SPIN_LIMIT)
    }

    /// Queue whose blocking operations spin `spin_limit` backoff steps before
    /// yielding.
    #[must_use]
    pub fn with_spin_limit(capacity: usize, spin_limit: u32) -> Self {
        let buffer = (0..capacity.max(1))
            .map(|pos| Cell {
                sequence: AtomicUsize::new(pos),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            buffer,
            enqueue_pos: CachePadded(AtomicUsize::new(0)),
            dequeue_pos: CachePadded(AtomicUsize::new(0)),
            spin_limit,
        }
    }

    /// Maximum number of queued items.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Approximate number of queued items; exact when no operation is in
    /// flight.
    #[must_use]
    pub fn len(&self) -> usize {
        let tail = self.enqueue_pos.load(Ordering::Acquire);
        let head = self.dequeue_pos.load(Ordering::Acquire);
        tail.wrapping_sub(head).min(self.capacity())
    }

    /// No item is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `value` unless the queue is full.
    ///
    /// # Errors
    /// Returns `value` when the queue is full.
    #[allow(clippy::cast_possible_wrap)]
    pub fn try_enqueue(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[pos % self.capacity()];
            let sequence = cell.sequence.load(Ordering::Acquire);
            let diff = sequence.wrapping_sub(pos) as isize;
            if diff == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the successful exchange makes this thread the
                        // only writer of the cell until `sequence` is bumped.
                        cell.value.with_mut(|ptr| unsafe {
                            (*ptr).write(value);
                        });
                        cell.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                // The consumer of the previous lap has not freed this cell.
                return Err(value);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Remove the oldest item, if any.
    #[allow(clippy::cast_possible_wrap)]
    pub fn try_dequeue(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[pos % self.capacity()];
            let sequence = cell.sequence.load(Ordering::Acquire);
            let diff = sequence.wrapping_sub(pos.wrapping_add(1)) as isize;
            if diff == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the successful exchange makes this thread the
                        // only reader of an initialized cell until `sequence`
                        // is bumped.
                        let value = cell.value.with(|ptr| unsafe { (*ptr).assume_init_read() });
                        cell.sequence
                            .store(pos.wrapping_add(self.capacity()), Ordering::Release);
                        return Some(value);
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Append `value`, waiting while the queue is full.
    pub fn enqueue(&self, mut value: T) {
        let mut backoff = Backoff::new(self.spin_limit);
        loop {
            match self.try_enqueue(value) {
                Ok(()) => return,
                Err(rejected) => {
                    value = rejected;
                    backoff.snooze();
                }
            }
        }
    }

    /// Remove the oldest item, waiting while the queue is empty.
    pub fn dequeue(&self) -> T {
        let mut backoff = Backoff::new(self.spin_limit);
        loop {
            if let Some(value) = self.try_dequeue() {
                return value;
            }
            backoff.snooze();
        }
    }
}

impl<T> Drop for TaskQueue<T> {
    fn drop(&mut self) {
        while self.try_dequeue().is_some() {}
    }
}

/// What a queued task computes.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Forward step of a source.
    #[display("source")]
    ComputeSource,
    /// Forward and backward step of a hidden node.
    #[display("hidden")]
    ComputeHidden,
    /// Step of a sink.
    #[display("sink")]
    ComputeSink,
    /// Handoff along one edge.
    #[display("copy")]
    Copy,
}

/// Item processed by an engine worker.
#[derive(Debug)]
pub enum Task<'a> {
    /// Run the wrapped work.
    Run(TaskWrapper<'a>),
    /// Stop draining and exit.
    Join,
}

/// One node's work for one round plus the barrier it reports to.
#[derive(Debug)]
pub struct TaskWrapper<'a> {
    kind: TaskKind,
    node: NodeId,
    #[debug(skip)]
    work: Box<dyn FnOnce() + Send + 'a>,
    barrier: Arc<CountingSync>,
}

impl<'a> TaskWrapper<'a> {
    /// Wrap `work` for `node`; running it notifies `barrier` exactly once.
    pub fn new(
        kind: TaskKind,
        node: NodeId,
        barrier: Arc<CountingSync>,
        work: impl FnOnce() + Send + 'a,
    ) -> Self {
        Self {
            kind,
            node,
            work: Box::new(work),
            barrier,
        }
    }

    /// Kind of work.
    #[must_use]
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Node the work belongs to.
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Run the work and notify the barrier, even if the work panics.
    ///
    /// # Errors
    /// The panic message when the work panicked.
    pub fn execute(self) -> Result<(), String> {
        let Self {
            work,
            barrier,
            ..
        } = self;
        let result = catch_unwind(AssertUnwindSafe(work)).map_err(|payload| {
            payload
                .downcast_ref::<&str>()
                .map(|message| (*message).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_owned())
        });
        barrier.notify_finish();
        result
    }
}
