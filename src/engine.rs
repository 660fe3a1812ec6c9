mod execute;
mod setup;

use crate::{
    config::EngineConfig,
    handoff::Mailbox,
    readiness,
    slot::Slot,
    sync::{Arc, AtomicBool, AtomicUsize, Ordering},
    tensor::{Element, Shape, Tensor},
    types::{HashMap, NodeId, NodeKind, SyncUnsafeCell},
};
use derive_more::{Debug, Display};

/// Fills a source's output for the given epoch.
pub type Generator<T> = Box<dyn FnMut(usize, &mut Tensor<T>) + Send>;
/// Computes a hidden node's output from its inputs, in predecessor order.
pub type Kernel<T> = Box<dyn FnMut(&[&Tensor<T>], &mut Tensor<T>) + Send>;
/// Receives a sink's inputs, in predecessor order, and the epoch.
pub type Consumer<T> = Box<dyn FnMut(&[&Tensor<T>], usize) + Send>;
/// Receives [`ExecutionEvent`]s, possibly from worker threads.
pub type Observer = Box<dyn Fn(&ExecutionEvent) + Send + Sync>;

/// Which half of a parallel round an event belongs to.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Sources, hidden nodes and sinks.
    #[display("compute")]
    Compute,
    /// Copy nodes.
    #[display("copy")]
    Copy,
}

/// Progress notification delivered to the observer set with
/// [`Engine::set_observer`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExecutionEvent {
    /// A run began.
    Started {
        /// Epoch every node must reach.
        target: usize,
        /// Threads computing nodes; `1` for cooperative runs.
        workers: usize,
    },
    /// One node finished one step.
    TaskFinished {
        /// The node.
        node: NodeId,
        /// Its phase.
        phase: Phase,
    },
    /// Every task of a parallel round phase signalled the barrier.
    RoundFinished {
        /// Zero-based round number.
        round: usize,
        /// Phase that finished.
        phase: Phase,
        /// Tasks the phase waited for.
        tasks: usize,
    },
    /// A run reached its target epoch.
    Finished {
        /// Sweeps (cooperative) or rounds (parallel) performed.
        rounds: usize,
    },
}

/// Summary of a successful run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Epoch reached by every node.
    pub epochs: usize,
    /// Sweeps (cooperative) or rounds (parallel) performed.
    pub rounds: usize,
    /// Compute steps run.
    pub computed: usize,
    /// Copy steps run.
    pub copied: usize,
}

/// Stops the run of the engine it was obtained from.
///
/// Cloneable and usable from any thread, including from inside node
/// callbacks. In-flight steps finish; no further round is issued.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    active: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Request the current run to stop.
    pub fn abort(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// An abort was requested and no run has started since.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        !self.active.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct UnitState {
    epoch: AtomicUsize,
    busy: AtomicBool,
}

impl UnitState {
    fn new() -> Self {
        Self {
            epoch: AtomicUsize::new(0),
            busy: AtomicBool::new(false),
        }
    }

    fn epoch(&self) -> usize {
        self.epoch.load(Ordering::Acquire)
    }

    fn advance(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    fn try_acquire(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct SourceNode<T> {
    id: NodeId,
    state: UnitState,
    output: SyncUnsafeCell<Tensor<T>>,
    #[debug(skip)]
    generator: SyncUnsafeCell<Generator<T>>,
    out_copies: Vec<usize>,
}

#[derive(Debug)]
struct HiddenNode<T> {
    id: NodeId,
    state: UnitState,
    inputs: Vec<SyncUnsafeCell<Slot<T>>>,
    in_copies: Vec<usize>,
    output: SyncUnsafeCell<Tensor<T>>,
    #[debug(skip)]
    kernel: SyncUnsafeCell<Kernel<T>>,
    out_copies: Vec<usize>,
}

#[derive(Debug)]
struct SinkNode<T> {
    id: NodeId,
    state: UnitState,
    inputs: Vec<SyncUnsafeCell<Slot<T>>>,
    in_copies: Vec<usize>,
    #[debug(skip)]
    consumer: SyncUnsafeCell<Consumer<T>>,
}

/// Edge node moving one producer output into one consumer input.
#[derive(Debug)]
struct CopyNode<T> {
    id: NodeId,
    state: UnitState,
    src: NodeId,
    dst: NodeId,
    dst_input: usize,
    mailbox: Mailbox<Tensor<T>>,
}

/// Incrementally declared graph executed for a number of epochs, either on
/// the calling thread or on a worker pool.
///
/// Nodes live in four arenas addressed by [`NodeId`]; every edge between two
/// declared nodes is an auto-inserted copy node. A node's only state is its
/// epoch counter: a producer may run again once each of its copies has
/// caught up, a consumer once each of its copies is one epoch ahead, and a
/// copy once its producer is one epoch ahead and its consumer has caught up.
#[derive(Debug)]
pub struct Engine<T: Element> {
    config: EngineConfig,
    sources: Vec<SourceNode<T>>,
    hidden: Vec<HiddenNode<T>>,
    sinks: Vec<SinkNode<T>>,
    copies: Vec<CopyNode<T>>,
    layouts: HashMap<NodeId, (Shape, usize)>,
    active: Arc<AtomicBool>,
    #[debug(skip)]
    observer: Option<Observer>,
}

impl<T: Element> Default for Engine<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Element> Engine<T> {
    /// Empty engine with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Empty engine with `config`.
    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            sources: Vec::new(),
            hidden: Vec::new(),
            sinks: Vec::new(),
            copies: Vec::new(),
            layouts: HashMap::default(),
            active: Arc::new(AtomicBool::new(true)),
            observer: None,
        }
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handle stopping runs of this engine from any thread.
    #[must_use]
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            active: self.active.clone(),
        }
    }

    /// Receive progress events. Replaces any previous observer.
    pub fn set_observer(&mut self, observer: impl Fn(&ExecutionEvent) + Send + Sync + 'static) {
        self.observer = Some(Box::new(observer));
    }

    /// Number of nodes of `kind`.
    #[must_use]
    pub fn count(&self, kind: NodeKind) -> usize {
        match kind {
            NodeKind::Source => self.sources.len(),
            NodeKind::Hidden => self.hidden.len(),
            NodeKind::Sink => self.sinks.len(),
            NodeKind::Copy => self.copies.len(),
        }
    }

    /// Epochs completed by `id`.
    #[must_use]
    pub fn epoch_of(&self, id: NodeId) -> Option<usize> {
        self.state(id).map(UnitState::epoch)
    }

    /// Output shape and batch size of a source or hidden node.
    #[must_use]
    pub fn layout(&self, id: NodeId) -> Option<(&Shape, usize)> {
        self.layouts.get(&id).map(|(shape, batch)| (shape, *batch))
    }

    /// Copy nodes wired into `id`, in input order.
    #[must_use]
    pub fn in_copies(&self, id: NodeId) -> Option<Vec<NodeId>> {
        let copies = match id.kind() {
            NodeKind::Hidden => &self.hidden_node(id)?.in_copies,
            NodeKind::Sink => &self.sink_node(id)?.in_copies,
            NodeKind::Source | NodeKind::Copy => return None,
        };
        Some(copies.iter().map(|&c| self.copies[c].id).collect())
    }

    /// Producer and consumer of copy node `id`.
    #[must_use]
    pub fn copy_endpoints(&self, id: NodeId) -> Option<(NodeId, NodeId)> {
        let copy = self.copies.get(id.index() as usize).filter(|c| c.id == id)?;
        Some((copy.src, copy.dst))
    }

    /// Version of input `input` of `id`, i.e. the number of updates it has
    /// received.
    #[must_use]
    pub fn input_version(&self, id: NodeId, input: usize) -> Option<usize> {
        self.input(id, input).map(|(_, version)| version)
    }

    /// Contents and version of input `input` of `id`.
    #[must_use]
    pub fn input(&self, id: NodeId, input: usize) -> Option<(&Tensor<T>, usize)> {
        let cell = self.input_slot(id, input)?;
        // SAFETY: runs borrow the engine mutably, so no worker can hold the
        // slot while `&self` is alive.
        let slot = unsafe { &*cell.get() };
        Some(slot.read())
    }

    /// Latest output of a source or hidden node.
    #[must_use]
    pub fn output(&self, id: NodeId) -> Option<&Tensor<T>> {
        let cell = match id.kind() {
            NodeKind::Source => &self.source_node(id)?.output,
            NodeKind::Hidden => &self.hidden_node(id)?.output,
            NodeKind::Sink | NodeKind::Copy => return None,
        };
        // SAFETY: see `Engine::input`.
        Some(unsafe { &*cell.get() })
    }

    fn emit(&self, event: ExecutionEvent) {
        if let Some(observer) = &self.observer {
            observer(&event);
        }
    }

    fn source_node(&self, id: NodeId) -> Option<&SourceNode<T>> {
        self.sources.get(id.index() as usize).filter(|n| n.id == id)
    }

    fn hidden_node(&self, id: NodeId) -> Option<&HiddenNode<T>> {
        self.hidden.get(id.index() as usize).filter(|n| n.id == id)
    }

    fn sink_node(&self, id: NodeId) -> Option<&SinkNode<T>> {
        self.sinks.get(id.index() as usize).filter(|n| n.id == id)
    }

    fn state(&self, id: NodeId) -> Option<&UnitState> {
        match id.kind() {
            NodeKind::Source => self.source_node(id).map(|n| &n.state),
            NodeKind::Hidden => self.hidden_node(id).map(|n| &n.state),
            NodeKind::Sink => self.sink_node(id).map(|n| &n.state),
            NodeKind::Copy => self
                .copies
                .get(id.index() as usize)
                .filter(|n| n.id == id)
                .map(|n| &n.state),
        }
    }

    fn input_slot(&self, id: NodeId, input: usize) -> Option<&SyncUnsafeCell<Slot<T>>> {
        match id.kind() {
            NodeKind::Hidden => self.hidden_node(id)?.inputs.get(input),
            NodeKind::Sink => self.sink_node(id)?.inputs.get(input),
            NodeKind::Source | NodeKind::Copy => None,
        }
    }

    fn epoch(&self, id: NodeId) -> usize {
        self.state(id).expect("Engine::epoch: [1]").epoch()
    }

    fn all_states(&self) -> impl Iterator<Item = &UnitState> {
        self.sources
            .iter()
            .map(|n| &n.state)
            .chain(self.hidden.iter().map(|n| &n.state))
            .chain(self.sinks.iter().map(|n| &n.state))
            .chain(self.copies.iter().map(|n| &n.state))
    }

    fn pending(&self, target: usize) -> usize {
        self.all_states().filter(|s| s.epoch() < target).count()
    }

    fn copies_caught_up(&self, copies: &[usize], epoch: usize) -> bool {
        copies
            .iter()
            .all(|&c| readiness::is_caught_up(self.copies[c].state.epoch(), epoch))
    }

    fn copies_pending(&self, copies: &[usize], epoch: usize) -> bool {
        copies
            .iter()
            .all(|&c| readiness::is_pending(self.copies[c].state.epoch(), epoch))
    }

    fn is_source_ready(&self, idx: usize, target: usize) -> bool {
        let node = &self.sources[idx];
        let epoch = node.state.epoch();
        epoch < target && !node.state.is_busy() && self.copies_caught_up(&node.out_copies, epoch)
    }

    fn is_hidden_ready(&self, idx: usize, target: usize) -> bool {
        let node = &self.hidden[idx];
        let epoch = node.state.epoch();
        epoch < target
            && !node.state.is_busy()
            && self.copies_pending(&node.in_copies, epoch)
            && self.copies_caught_up(&node.out_copies, epoch)
    }

    fn is_sink_ready(&self, idx: usize, target: usize) -> bool {
        let node = &self.sinks[idx];
        let epoch = node.state.epoch();
        epoch < target && !node.state.is_busy() && self.copies_pending(&node.in_copies, epoch)
    }

    fn is_copy_ready(&self, idx: usize, target: usize) -> bool {
        let node = &self.copies[idx];
        let epoch = node.state.epoch();
        epoch < target
            && !node.state.is_busy()
            && readiness::is_pending(self.epoch(node.src), epoch)
            && readiness::is_caught_up(self.epoch(node.dst), epoch)
    }

    fn publish(&self, output: &Tensor<T>, out_copies: &[usize]) {
        for &c in out_copies {
            self.copies[c]
                .mailbox
                .try_put(output.clone())
                .expect("Engine::publish: [1]");
        }
    }

    /// # Safety
    ///
    /// The caller must own source `idx` for this step: it is ready and no
    /// other thread runs it concurrently.
    unsafe fn run_source(&self, idx: usize) {
        let node = &self.sources[idx];
        let epoch = node.state.epoch();
        // SAFETY: exclusive ownership per the contract above.
        let (generator, output) = unsafe { (&mut *node.generator.get(), &mut *node.output.get()) };
        generator(epoch, output);
        self.publish(output, &node.out_copies);
        node.state.advance();
    }

    /// # Safety
    ///
    /// The caller must own hidden node `idx` for this step. Its input slots
    /// are then stable because every in-copy has already delivered.
    unsafe fn run_hidden(&self, idx: usize) {
        let node = &self.hidden[idx];
        // SAFETY: exclusive ownership per the contract above; in-copies only
        // write again after this node advances.
        let (inputs, kernel, output) = unsafe {
            let inputs: Vec<&Tensor<T>> = node
                .inputs
                .iter()
                .map(|cell| (*cell.get()).tensor())
                .collect();
            (inputs, &mut *node.kernel.get(), &mut *node.output.get())
        };
        kernel(&inputs, output);
        self.publish(output, &node.out_copies);
        node.state.advance();
    }

    /// # Safety
    ///
    /// Same contract as [`Engine::run_hidden`].
    unsafe fn run_sink(&self, idx: usize) {
        let node = &self.sinks[idx];
        let epoch = node.state.epoch();
        // SAFETY: see `run_hidden`.
        let (inputs, consumer) = unsafe {
            let inputs: Vec<&Tensor<T>> = node
                .inputs
                .iter()
                .map(|cell| (*cell.get()).tensor())
                .collect();
            (inputs, &mut *node.consumer.get())
        };
        consumer(&inputs, epoch);
        node.state.advance();
    }

    /// # Safety
    ///
    /// The caller must own copy `idx` for this step. Its consumer has caught
    /// up, so the target input slot is not being read.
    unsafe fn run_copy(&self, idx: usize) {
        let node = &self.copies[idx];
        let tensor = node.mailbox.try_take().expect("Engine::run_copy: [1]");
        let cell = self
            .input_slot(node.dst, node.dst_input)
            .expect("Engine::run_copy: [2]");
        // SAFETY: exclusive ownership per the contract above.
        let slot = unsafe { &mut *cell.get() };
        slot.write(tensor);
        node.state.advance();
    }

    /// # Safety
    ///
    /// The caller must own `id` for this step.
    unsafe fn run_node(&self, id: NodeId) {
        let idx = id.index() as usize;
        // SAFETY: forwarded contract.
        unsafe {
            match id.kind() {
                NodeKind::Source => self.run_source(idx),
                NodeKind::Hidden => self.run_hidden(idx),
                NodeKind::Sink => self.run_sink(idx),
                NodeKind::Copy => self.run_copy(idx),
            }
        }
    }
}
