use crate::{
    sync::{Arc, AtomicU8, AtomicUsize, Ordering, UnsafeCell},
    utils::Backoff,
};
use core::mem::MaybeUninit;

pub(crate) const DEFAULT_SPIN_LIMIT: u32 = 6;

const EMPTY: u8 = 0;
const BUSY: u8 = 1;
const FULL: u8 = 2;

/// Single-slot mailbox.
///
/// A producer places one value; until the consumer takes it, further puts
/// fail ([`Mailbox::try_put`]) or wait ([`Mailbox::put`]). The value is never
/// reachable from both sides at once: whoever wins the state transition owns
/// the cell until it publishes the next state.
pub struct Mailbox<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: the value is only accessed by the single thread that moved `state`
// into `BUSY`, and ownership of `T` moves between threads, so `T: Send`
// suffices.
unsafe impl<T: Send> Send for Mailbox<T> {}
// SAFETY: see above.
unsafe impl<T: Send> Sync for Mailbox<T> {}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> core::fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mailbox")
            .field("occupied", &self.is_occupied())
            .finish_non_exhaustive()
    }
}

impl<T> Mailbox<T> {
    /// Empty mailbox.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// A value is waiting to be taken.
    #[must_use]
    pub fn is_occupied(&self) -> bool {
        self.state.load(Ordering::Acquire) == FULL
    }

    /// Place `value` if the mailbox is empty, otherwise hand it back.
    ///
    /// # Errors
    /// Returns `value` when the mailbox is occupied or mid-transfer.
    pub fn try_put(&self, value: T) -> Result<(), T> {
        if self
            .state
            .compare_exchange(EMPTY, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(value);
        }
        // SAFETY: winning EMPTY -> BUSY grants exclusive access; the cell holds
        // no initialized value in the EMPTY state.
        self.value.with_mut(|ptr| unsafe {
            (*ptr).write(value);
        });
        self.state.store(FULL, Ordering::Release);
        Ok(())
    }

    /// Take the value if one is present.
    pub fn try_take(&self) -> Option<T> {
        if self
            .state
            .compare_exchange(FULL, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        // SAFETY: winning FULL -> BUSY grants exclusive access to an
        // initialized value, which is moved out before the state returns to
        // EMPTY.
        let value = self.value.with(|ptr| unsafe { (*ptr).assume_init_read() });
        self.state.store(EMPTY, Ordering::Release);
        Some(value)
    }

    /// Place `value`, waiting for the consumer to vacate the mailbox.
    pub fn put(&self, value: T) {
        self.put_with(value, &mut Backoff::new(DEFAULT_SPIN_LIMIT));
    }

    /// Take a value, waiting for the producer to place one.
    pub fn take(&self) -> T {
        self.take_with(&mut Backoff::new(DEFAULT_SPIN_LIMIT))
    }

    pub(crate) fn put_with(&self, mut value: T, backoff: &mut Backoff) {
        loop {
            match self.try_put(value) {
                Ok(()) => return,
                Err(rejected) => {
                    value = rejected;
                    backoff.snooze();
                }
            }
        }
    }

    pub(crate) fn take_with(&self, backoff: &mut Backoff) -> T {
        loop {
            if let Some(value) = self.try_take() {
                return value;
            }
            backoff.snooze();
        }
    }
}

impl<T> Drop for Mailbox<T> {
    fn drop(&mut self) {
        if self.state.load(Ordering::Acquire) == FULL {
            // SAFETY: `&mut self` excludes every other access and FULL means
            // the value is initialized.
            self.value.with_mut(|ptr| unsafe { (*ptr).assume_init_drop() });
        }
    }
}

/// Lock-free count of delivered connections.
///
/// Ready once `expected` deliveries have been notified. Used as the round
/// barrier of the parallel executor: one notification per finished task.
#[derive(Debug)]
pub struct CountingSync {
    delivered: AtomicUsize,
    expected: usize,
}

impl CountingSync {
    /// Barrier waiting for `expected` notifications. Zero is immediately
    /// ready.
    #[must_use]
    pub fn new(expected: usize) -> Self {
        Self {
            delivered: AtomicUsize::new(0),
            expected,
        }
    }

    /// Record one delivery. Returns `true` for the delivery that made the
    /// barrier ready.
    pub fn notify_finish(&self) -> bool {
        self.delivered.fetch_add(1, Ordering::AcqRel) + 1 == self.expected
    }

    /// Every expected connection has delivered.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.delivered.load(Ordering::Acquire) >= self.expected
    }

    /// Deliveries so far.
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Acquire)
    }

    /// Number of deliveries the barrier waits for.
    #[must_use]
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Spin, then yield, until ready.
    pub fn wait_until_ready(&self) {
        self.wait_with(&mut Backoff::new(DEFAULT_SPIN_LIMIT));
    }

    pub(crate) fn wait_with(&self, backoff: &mut Backoff) {
        while !self.is_ready() {
            backoff.snooze();
        }
    }

    /// Re-arm for another round of the same size.
    pub fn reset(&self) {
        self.delivered.store(0, Ordering::Release);
    }
}

/// Result reported through a [`Completion`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The task finished.
    Finished,
    /// The task reported a failure.
    Failed(String),
    /// The completion was dropped without being signalled.
    Abandoned,
}

impl Outcome {
    /// `Ok` for [`Outcome::Finished`], the reason otherwise.
    ///
    /// # Errors
    /// When the task failed or abandoned its completion.
    pub fn into_result(self) -> Result<(), String> {
        match self {
            Self::Finished => Ok(()),
            Self::Failed(reason) => Err(reason),
            Self::Abandoned => Err("completion dropped without being signalled".to_owned()),
        }
    }
}

/// Signalling side of a one-shot completion. Dropping it unsignalled reports
/// [`Outcome::Abandoned`], so a waiter is never left hanging.
#[derive(Debug)]
#[must_use = "dropping a Completion reports the task as abandoned"]
pub struct Completion {
    mailbox: Option<Arc<Mailbox<Outcome>>>,
}

/// Waiting side of a one-shot completion.
#[derive(Debug)]
pub struct CompletionHandle {
    mailbox: Arc<Mailbox<Outcome>>,
}

/// Create a connected completion pair.
pub fn completion() -> (Completion, CompletionHandle) {
    let mailbox = Arc::new(Mailbox::new());
    (
        Completion {
            mailbox: Some(mailbox.clone()),
        },
        CompletionHandle { mailbox },
    )
}

impl Completion {
    /// Signal success.
    pub fn finish(mut self) {
        self.send(Outcome::Finished);
    }

    /// Signal failure.
    pub fn fail(mut self, reason: impl Into<String>) {
        self.send(Outcome::Failed(reason.into()));
    }

    fn send(&mut self, outcome: Outcome) {
        if let Some(mailbox) = self.mailbox.take() {
            // One-shot: the mailbox is empty because this is its only put.
            let _ = mailbox.try_put(outcome);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.send(Outcome::Abandoned);
    }
}

impl CompletionHandle {
    /// The task has signalled.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.mailbox.is_occupied()
    }

    /// Outcome, if already signalled.
    #[must_use]
    pub fn try_wait(&self) -> Option<Outcome> {
        self.mailbox.try_take()
    }

    /// Wait for the outcome.
    #[must_use]
    pub fn wait(self) -> Outcome {
        self.mailbox.take()
    }
}
