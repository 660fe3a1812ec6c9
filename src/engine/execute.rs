use super::{Engine, ExecutionEvent, ExecutionReport, Phase};
use crate::{
    error::EngineError,
    handoff::{CountingSync, Mailbox},
    queue::{Task, TaskKind, TaskQueue, TaskWrapper},
    sync::{Arc, Ordering},
    tensor::Element,
    types::{NodeId, NodeKind},
    utils::Backoff,
};
use std::thread;
use tracing::{debug, error, info, trace, warn};

impl<T: Element> Engine<T> {
    /// Run on the calling thread until every node has completed `epochs`
    /// epochs. Nodes already at or past `epochs` do not run again.
    ///
    /// Each sweep visits sources, hidden nodes, sinks and copies in that order
    /// and steps every ready node once. Sweeps repeat until one makes no
    /// progress.
    ///
    /// # Errors
    /// - [`EngineError::Aborted`] if an [`AbortHandle`](super::AbortHandle)
    ///   fired during the run.
    /// - [`EngineError::Incomplete`] if the sweep settled before every node
    ///   reached the target epoch.
    pub fn execute(&mut self, epochs: usize) -> Result<ExecutionReport, EngineError> {
        let target = self.begin(epochs, 1);
        let mut report = ExecutionReport {
            epochs: target,
            ..ExecutionReport::default()
        };
        loop {
            if !self.active.load(Ordering::Acquire) {
                info!(sweeps = report.rounds, "execution aborted");
                return Err(EngineError::Aborted {
                    rounds: report.rounds,
                });
            }
            report.rounds += 1;
            let computed = self.sweep(target);
            let copied = self.sweep_copies(target);
            report.computed += computed;
            report.copied += copied;
            if computed == 0 && copied == 0 {
                break;
            }
        }
        self.finish(report)
    }

    /// Run on `workers` threads until every node has completed `epochs`
    /// epochs.
    ///
    /// Each round enqueues one task per ready source, hidden node and sink,
    /// waits for all of them, then does the same for ready copies. Rounds
    /// repeat until every node reaches the target epoch. With
    /// [`EngineConfig::clamp_workers`](crate::config::EngineConfig) set, the
    /// worker count is limited to the available hardware threads.
    ///
    /// # Errors
    /// - [`EngineError::NoWorkers`] if `workers` is zero.
    /// - [`EngineError::Spawn`] if a worker thread could not be started.
    /// - [`EngineError::Aborted`] if an [`AbortHandle`](super::AbortHandle)
    ///   fired during the run.
    /// - [`EngineError::TaskPanicked`] if a node panicked.
    /// - [`EngineError::Stalled`] if a round found nothing to run before the
    ///   target epoch.
    pub fn execute_parallel(
        &mut self,
        workers: usize,
        epochs: usize,
    ) -> Result<ExecutionReport, EngineError> {
        if workers == 0 {
            return Err(EngineError::NoWorkers);
        }
        let workers = self.clamp_workers(workers);
        let target = self.begin(epochs, workers);
        let queue = TaskQueue::with_spin_limit(self.config.queue_capacity, self.config.spin_limit);
        let failure = Mailbox::new();
        let this = &*self;

        let result = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            let mut spawn_error = None;
            for worker in 0..workers {
                let spawned = thread::Builder::new()
                    .name(format!("slotflow-worker-{worker}"))
                    .spawn_scoped(scope, || this.work(&queue, &failure));
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(err) => {
                        spawn_error = Some(EngineError::Spawn(err.to_string()));
                        break;
                    }
                }
            }

            let result = match spawn_error {
                Some(err) => Err(err),
                None => this.coordinate(&queue, &failure, target),
            };

            for _ in 0..handles.len() {
                queue.enqueue(Task::Join);
            }
            let mut join_failures = 0usize;
            for handle in handles {
                if handle.join().is_err() {
                    join_failures += 1;
                }
            }
            if join_failures > 0 {
                error!(join_failures, "worker threads failed to join");
            }
            result
        });

        let report = match result {
            Ok(report) => report,
            Err(err) => {
                info!(%err, "parallel execution stopped");
                return Err(err);
            }
        };
        self.finish(report)
    }

    /// Reset per-run state and announce the run. Returns the target epoch.
    fn begin(&mut self, target: usize, workers: usize) -> usize {
        for state in self.all_states() {
            state.release();
        }
        self.active.store(true, Ordering::Release);
        info!(
            target,
            workers,
            nodes = self.sources.len() + self.hidden.len() + self.sinks.len(),
            copies = self.copies.len(),
            "execution started"
        );
        self.emit(ExecutionEvent::Started { target, workers });
        target
    }

    fn finish(&self, report: ExecutionReport) -> Result<ExecutionReport, EngineError> {
        let pending = self.pending(report.epochs);
        if pending > 0 {
            return Err(EngineError::Incomplete {
                epochs: report.epochs,
                pending,
            });
        }
        info!(?report, "execution finished");
        self.emit(ExecutionEvent::Finished {
            rounds: report.rounds,
        });
        Ok(report)
    }

    fn clamp_workers(&self, workers: usize) -> usize {
        if !self.config.clamp_workers {
            return workers;
        }
        let available = thread::available_parallelism().map_or(1, usize::from);
        if workers > available {
            warn!(
                requested = workers,
                available, "worker count clamped to available parallelism"
            );
            available
        } else {
            workers
        }
    }

    /// One cooperative pass over sources, hidden nodes and sinks.
    fn sweep(&self, target: usize) -> usize {
        let mut computed = 0;
        for idx in 0..self.sources.len() {
            if self.is_source_ready(idx, target) {
                // SAFETY: cooperative runs hold `&mut self`, so this thread is
                // the only one touching any node.
                unsafe { self.run_source(idx) };
                self.stepped(self.sources[idx].id, Phase::Compute);
                computed += 1;
            }
        }
        for idx in 0..self.hidden.len() {
            if self.is_hidden_ready(idx, target) {
                // SAFETY: see above.
                unsafe { self.run_hidden(idx) };
                self.stepped(self.hidden[idx].id, Phase::Compute);
                computed += 1;
            }
        }
        for idx in 0..self.sinks.len() {
            if self.is_sink_ready(idx, target) {
                // SAFETY: see above.
                unsafe { self.run_sink(idx) };
                self.stepped(self.sinks[idx].id, Phase::Compute);
                computed += 1;
            }
        }
        computed
    }

    fn sweep_copies(&self, target: usize) -> usize {
        let mut copied = 0;
        for idx in 0..self.copies.len() {
            if self.is_copy_ready(idx, target) {
                // SAFETY: see `Engine::sweep`.
                unsafe { self.run_copy(idx) };
                self.stepped(self.copies[idx].id, Phase::Copy);
                copied += 1;
            }
        }
        copied
    }

    fn stepped(&self, node: NodeId, phase: Phase) {
        trace!(%node, %phase, "step finished");
        self.emit(ExecutionEvent::TaskFinished { node, phase });
    }

    /// Ready nodes of `phase`, each claimed through its busy flag.
    fn claim_ready(&self, phase: Phase, target: usize) -> Vec<NodeId> {
        let mut claimed = Vec::new();
        let mut claim = |id: NodeId, ready: bool| {
            if ready && self.state(id).expect("Engine::claim_ready: [1]").try_acquire() {
                claimed.push(id);
            }
        };
        match phase {
            Phase::Compute => {
                for (idx, node) in self.sources.iter().enumerate() {
                    claim(node.id, self.is_source_ready(idx, target));
                }
                for (idx, node) in self.hidden.iter().enumerate() {
                    claim(node.id, self.is_hidden_ready(idx, target));
                }
                for (idx, node) in self.sinks.iter().enumerate() {
                    claim(node.id, self.is_sink_ready(idx, target));
                }
            }
            Phase::Copy => {
                for (idx, node) in self.copies.iter().enumerate() {
                    claim(node.id, self.is_copy_ready(idx, target));
                }
            }
        }
        claimed
    }

    fn coordinate<'a>(
        &'a self,
        queue: &TaskQueue<Task<'a>>,
        failure: &Mailbox<(NodeId, String)>,
        target: usize,
    ) -> Result<ExecutionReport, EngineError> {
        let mut report = ExecutionReport {
            epochs: target,
            ..ExecutionReport::default()
        };
        let mut backoff = Backoff::new(self.config.spin_limit);
        loop {
            if self.pending(target) == 0 {
                return Ok(report);
            }
            let round = report.rounds;

            let compute = self.claim_ready(Phase::Compute, target);
            self.run_round(queue, Phase::Compute, &compute, round, &mut backoff);
            self.check_failure(failure, round)?;

            let copies = self.claim_ready(Phase::Copy, target);
            self.run_round(queue, Phase::Copy, &copies, round, &mut backoff);
            self.check_failure(failure, round)?;

            report.rounds += 1;
            report.computed += compute.len();
            report.copied += copies.len();

            if compute.is_empty() && copies.is_empty() {
                let pending = self.pending(target);
                error!(round, pending, "no node became ready");
                return Err(EngineError::Stalled {
                    epochs: target,
                    pending,
                });
            }
        }
    }

    fn check_failure(
        &self,
        failure: &Mailbox<(NodeId, String)>,
        round: usize,
    ) -> Result<(), EngineError> {
        if let Some((node, message)) = failure.try_take() {
            return Err(EngineError::TaskPanicked { node, message });
        }
        if !self.active.load(Ordering::Acquire) {
            return Err(EngineError::Aborted { rounds: round });
        }
        Ok(())
    }

    /// Enqueue one task per claimed node and wait for all of them.
    fn run_round<'a>(
        &'a self,
        queue: &TaskQueue<Task<'a>>,
        phase: Phase,
        nodes: &[NodeId],
        round: usize,
        backoff: &mut Backoff,
    ) {
        if nodes.is_empty() {
            return;
        }
        let barrier = Arc::new(CountingSync::new(nodes.len()));
        for &node in nodes {
            let work = move || {
                // SAFETY: the node was claimed through its busy flag and was
                // ready when claimed; nothing else changes its readiness until
                // this round's barrier.
                unsafe { self.run_node(node) };
                self.state(node).expect("Engine::run_round: [1]").release();
                self.stepped(node, phase);
            };
            let task = TaskWrapper::new(task_kind(node), node, barrier.clone(), work);
            queue.enqueue(Task::Run(task));
        }
        backoff.reset();
        barrier.wait_with(backoff);
        debug!(round, %phase, tasks = nodes.len(), "round phase finished");
        self.emit(ExecutionEvent::RoundFinished {
            round,
            phase,
            tasks: nodes.len(),
        });
    }

    /// Worker loop: drain tasks until a join sentinel arrives.
    fn work<'a>(&'a self, queue: &TaskQueue<Task<'a>>, failure: &Mailbox<(NodeId, String)>) {
        loop {
            match queue.dequeue() {
                Task::Join => break,
                Task::Run(task) => {
                    let node = task.node();
                    let kind = task.kind();
                    trace!(%node, %kind, "task dequeued");
                    if let Err(message) = task.execute() {
                        error!(%node, %kind, %message, "task panicked");
                        // The first failure wins; later ones are only logged.
                        let _ = failure.try_put((node, message));
                        self.active.store(false, Ordering::Release);
                    }
                }
            }
        }
    }
}

fn task_kind(node: NodeId) -> TaskKind {
    match node.kind() {
        NodeKind::Source => TaskKind::ComputeSource,
        NodeKind::Hidden => TaskKind::ComputeHidden,
        NodeKind::Sink => TaskKind::ComputeSink,
        NodeKind::Copy => TaskKind::Copy,
    }
}
