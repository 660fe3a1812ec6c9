use crate::{
    error::GraphError,
    handoff::{Completion, CompletionHandle, Outcome, completion},
    metadata::UnitMetadata,
    readiness,
    slot::Slot,
    tensor::{Element, NumericType, Shape},
    types::{HashMap, IndexMap, IndexSet, NodeId, NodeKind, UnitType},
    unit::{Unit, UnitCore},
    units::{AddUnit, BiasUnit, ConstantUnit, OptimizerKind, Parameter, ReluUnit, SquaredLossUnit},
};
use rustc_hash::FxBuildHasher;
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// Builds a boxed unit from its declaration and the graph's optimizer.
pub type UnitConstructor<T> =
    fn(&UnitMetadata, &OptimizerKind) -> Result<Box<dyn Unit<T>>, GraphError>;

/// Lookup table from [`UnitType`] to constructor, resolved once per
/// compilation.
#[derive(Debug, Clone)]
pub struct UnitRegistry<T> {
    constructors: HashMap<UnitType, UnitConstructor<T>>,
}

impl<T> UnitRegistry<T> {
    /// Registry without any constructor.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::default(),
        }
    }

    /// Register `constructor` for `tag`, replacing any previous one.
    pub fn register(&mut self, tag: UnitType, constructor: UnitConstructor<T>) -> &mut Self {
        self.constructors.insert(tag, constructor);
        self
    }

    /// Constructor registered for `tag`.
    #[must_use]
    pub fn get(&self, tag: UnitType) -> Option<UnitConstructor<T>> {
        self.constructors.get(&tag).copied()
    }
}

impl<T: Element> Default for UnitRegistry<T> {
    /// Registry with the reference units of [`crate::units`].
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register(UnitType::Constant, ConstantUnit::create)
            .register(UnitType::Relu, ReluUnit::create)
            .register(UnitType::Bias, BiasUnit::create)
            .register(UnitType::Add, AddUnit::create)
            .register(UnitType::SquaredLoss, SquaredLossUnit::create);
        registry
    }
}

/// Accumulates declarations for [`GraphBuilder::compile`].
#[must_use]
#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    declarations: IndexMap<NodeId, UnitMetadata>,
}

impl GraphBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a declaration.
    ///
    /// # Errors
    /// [`GraphError::DuplicateUnit`] if the id is already declared.
    pub fn append(&mut self, meta: UnitMetadata) -> Result<&mut Self, GraphError> {
        let id = meta.id();
        if self.declarations.contains_key(&id) {
            return Err(GraphError::DuplicateUnit(id));
        }
        self.declarations.insert(id, meta);
        Ok(self)
    }

    /// Declaration of `id`.
    #[must_use]
    pub fn metadata(&self, id: NodeId) -> Option<&UnitMetadata> {
        self.declarations.get(&id)
    }

    /// Output shape declared for `id`.
    #[must_use]
    pub fn output_shape(&self, id: NodeId) -> Option<&Shape> {
        self.declarations.get(&id).map(UnitMetadata::output_shape)
    }

    /// Validate the declarations and materialize every unit.
    ///
    /// Checks run in order: optimizer name, then per declaration numeric type,
    /// arity, references, shapes and batch sizes, then acyclicity, then
    /// construction. The first failure is returned and nothing is retained.
    ///
    /// # Errors
    /// Any [`GraphError`] describing the first invalid declaration.
    pub fn compile<T: Element>(
        self,
        registry: &UnitRegistry<T>,
        optimizer: &str,
        parameter: &Parameter,
    ) -> Result<Graph<T>, GraphError> {
        let optimizer = OptimizerKind::from_name(optimizer, parameter)?;
        let Self { mut declarations } = self;

        for meta in declarations.values() {
            validate(meta, &declarations, T::NUMERIC_TYPE)?;
        }

        let edges: Vec<(NodeId, NodeId)> = declarations
            .values()
            .flat_map(|meta| meta.input_units().iter().map(|&producer| (producer, meta.id())))
            .collect();
        for (producer, consumer) in edges {
            declarations
                .get_mut(&producer)
                .expect("GraphBuilder::compile: [1]")
                .append_output_unit(consumer);
        }

        let order = topological_order(&declarations)?;

        let mut metadata = IndexMap::with_capacity_and_hasher(order.len(), FxBuildHasher);
        let mut units = Vec::with_capacity(order.len());
        for id in order {
            let meta = declarations
                .swap_remove(&id)
                .expect("GraphBuilder::compile: [2]");
            let constructor = registry
                .get(id.tag())
                .ok_or(GraphError::Unimplemented(id.tag()))?;
            let unit = constructor(&meta, &optimizer)?;
            debug!(
                unit = %id,
                inputs = meta.input_units().len(),
                outputs = meta.output_units().len(),
                "unit compiled"
            );
            metadata.insert(id, meta);
            units.push(unit);
        }
        assert!(declarations.is_empty(), "GraphBuilder::compile: [3]");
        debug!(units = units.len(), ?optimizer, "graph compiled");

        Ok(Graph { metadata, units })
    }
}

fn validate(
    meta: &UnitMetadata,
    declarations: &IndexMap<NodeId, UnitMetadata>,
    expected: NumericType,
) -> Result<(), GraphError> {
    let unit = meta.id();
    if meta.numeric_type != expected {
        return Err(GraphError::NumericTypeMismatch {
            unit,
            declared: meta.numeric_type,
            expected,
        });
    }

    let inputs = meta.input_units().len();
    let arity_ok = match unit.kind() {
        NodeKind::Source => inputs == 0,
        NodeKind::Hidden | NodeKind::Sink => inputs > 0,
        // Edges are implicit in a compiled graph.
        NodeKind::Copy => false,
    };
    if !arity_ok {
        return Err(GraphError::InvalidArity {
            unit,
            kind: unit.kind(),
            inputs,
        });
    }

    let mut seen = IndexSet::with_capacity_and_hasher(inputs, FxBuildHasher);
    for (&producer, shape) in meta.input_units().iter().zip(meta.input_shapes()) {
        if !seen.insert(producer) {
            return Err(GraphError::DuplicateInput { unit, producer });
        }
        let Some(producer_meta) = declarations.get(&producer) else {
            return Err(GraphError::UnknownUnit {
                unit,
                missing: producer,
            });
        };
        if matches!(producer.kind(), NodeKind::Sink | NodeKind::Copy) {
            return Err(GraphError::InvalidProducer { unit, producer });
        }
        if producer_meta.output_shape() != shape {
            return Err(GraphError::ShapeMismatch {
                unit,
                expected: producer_meta.output_shape().clone(),
                found: shape.clone(),
            });
        }
        if producer_meta.batch_size != meta.batch_size {
            return Err(GraphError::BatchSizeMismatch {
                unit,
                producer,
                expected: producer_meta.batch_size,
                found: meta.batch_size,
            });
        }
    }
    Ok(())
}

/// Kahn ordering: roots first in declaration order, then every unit once all
/// of its producers are placed.
fn topological_order(
    declarations: &IndexMap<NodeId, UnitMetadata>,
) -> Result<Vec<NodeId>, GraphError> {
    let mut parents_left: HashMap<NodeId, usize> = declarations
        .values()
        .map(|meta| (meta.id(), meta.input_units().len()))
        .collect();
    let mut pending: VecDeque<NodeId> = declarations
        .values()
        .filter(|meta| meta.input_units().is_empty())
        .map(UnitMetadata::id)
        .collect();

    // Without roots every component is cyclic.
    if pending.is_empty() && !declarations.is_empty() {
        return Err(GraphError::Cycle);
    }

    let mut order = Vec::with_capacity(declarations.len());
    while let Some(id) = pending.pop_front() {
        order.push(id);
        for consumer in declarations[&id].output_units() {
            let left = parents_left
                .get_mut(consumer)
                .expect("topological_order: [1]");
            *left = left.checked_sub(1).expect("topological_order: [2]");
            if *left == 0 {
                pending.push_back(*consumer);
            }
        }
    }

    // Anything not placed sits on a cycle or downstream of one.
    if order.len() != declarations.len() {
        return Err(GraphError::Cycle);
    }
    Ok(order)
}

/// Work done by one call to a scheduling method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sweeps run, including the final one that made no progress.
    pub sweeps: usize,
    /// Units computed.
    pub computed: usize,
    /// Slots written by copy propagation.
    pub copied: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Forward,
    Backward,
}

impl Pass {
    fn is_ready<T: Element>(self, unit: &dyn Unit<T>, cycle: usize) -> bool {
        match self {
            Self::Forward => unit.is_forward_ready(cycle),
            Self::Backward => unit.is_backward_ready(cycle),
        }
    }

    fn compute<T: Element>(self, unit: &mut dyn Unit<T>) {
        match self {
            Self::Forward => unit.forward(),
            Self::Backward => unit.backward(),
        }
    }

    fn update_state<T: Element>(self, unit: &mut dyn Unit<T>) {
        match self {
            Self::Forward => unit.update_forward_state(),
            Self::Backward => unit.update_backward_state(),
        }
    }

    fn dispatch<T: Element>(self, unit: &mut dyn Unit<T>, completion: Completion) {
        match self {
            Self::Forward => unit.async_forward(completion),
            Self::Backward => unit.async_backward(completion),
        }
    }
}

/// A compiled graph and its scheduler.
///
/// Units are stored in topological order and addressed by [`NodeId`]. The
/// structure never changes after compilation; only slot contents and versions
/// do.
#[derive(Debug)]
pub struct Graph<T: Element> {
    metadata: IndexMap<NodeId, UnitMetadata>,
    units: Vec<Box<dyn Unit<T>>>,
}

impl<T: Element> Graph<T> {
    /// Number of units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// The graph has no units.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Unit ids in topological order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.metadata.keys().copied()
    }

    /// Declaration of `id`, with output units linked.
    #[must_use]
    pub fn metadata(&self, id: NodeId) -> Option<&UnitMetadata> {
        self.metadata.get(&id)
    }

    /// Unit `id`.
    #[must_use]
    pub fn unit(&self, id: NodeId) -> Option<&dyn Unit<T>> {
        let idx = self.metadata.get_index_of(&id)?;
        Some(self.units[idx].as_ref())
    }

    /// Mutable unit `id`.
    #[must_use]
    pub fn unit_mut(&mut self, id: NodeId) -> Option<&mut dyn Unit<T>> {
        let idx = self.metadata.get_index_of(&id)?;
        Some(self.units[idx].as_mut())
    }

    /// Run forward cycle `cycle` to its fixed point.
    pub fn forward(&mut self, cycle: usize) -> SweepReport {
        self.run(Pass::Forward, cycle)
    }

    /// Run backward cycle `cycle` to its fixed point.
    pub fn backward(&mut self, cycle: usize) -> SweepReport {
        self.run(Pass::Backward, cycle)
    }

    /// Run forward cycle `cycle`, computing every ready unit of an iteration
    /// concurrently.
    ///
    /// # Errors
    /// [`GraphError::ComputeFailed`] for the first unit, in topological order,
    /// that reports failure or drops its completion. Units of the same batch
    /// that did finish are published, so a retry only reruns the failed ones.
    pub fn async_forward(&mut self, cycle: usize) -> Result<SweepReport, GraphError> {
        self.run_async(Pass::Forward, cycle)
    }

    /// Backward counterpart of [`Graph::async_forward`].
    ///
    /// # Errors
    /// See [`Graph::async_forward`].
    pub fn async_backward(&mut self, cycle: usize) -> Result<SweepReport, GraphError> {
        self.run_async(Pass::Backward, cycle)
    }

    /// Unit `id` has published a forward output that none of its consumers
    /// has received yet.
    #[must_use]
    pub fn is_forward_copy_ready(&self, id: NodeId) -> bool {
        self.metadata
            .get_index_of(&id)
            .is_some_and(|idx| self.forward_copy_ready_at(idx))
    }

    /// Unit `id` has published gradients that none of its producers has
    /// received yet.
    #[must_use]
    pub fn is_backward_copy_ready(&self, id: NodeId) -> bool {
        self.metadata
            .get_index_of(&id)
            .is_some_and(|idx| self.backward_copy_ready_at(idx))
    }

    fn seed(&self, pass: Pass, cycle: usize) {
        let kind = match pass {
            Pass::Forward => NodeKind::Source,
            Pass::Backward => NodeKind::Sink,
        };
        for unit in self.units.iter().filter(|unit| unit.id().kind() == kind) {
            let core = unit.core();
            let id = core.id();
            let seed = match pass {
                Pass::Forward => core.forward_input.get(&id),
                Pass::Backward => core.backward_input.get(&id),
            };
            let Some(seed) = seed else {
                continue;
            };
            if readiness::is_caught_up(seed.version(), cycle) {
                seed.publish();
                trace!(unit = %id, cycle, ?pass, "seeded");
            }
        }
    }

    fn run(&mut self, pass: Pass, cycle: usize) -> SweepReport {
        self.seed(pass, cycle);
        let mut report = SweepReport::default();
        loop {
            report.sweeps += 1;
            let mut progress = false;
            for idx in 0..self.units.len() {
                let unit = self.units[idx].as_mut();
                if pass.is_ready(unit, cycle) {
                    pass.compute(unit);
                    pass.update_state(unit);
                    trace!(unit = %unit.id(), cycle, ?pass, "computed");
                    report.computed += 1;
                    progress = true;
                }
                let copied = self.propagate(pass, idx);
                if copied > 0 {
                    report.copied += copied;
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }
        debug!(cycle, ?pass, ?report, "cycle finished");
        report
    }

    fn run_async(&mut self, pass: Pass, cycle: usize) -> Result<SweepReport, GraphError> {
        self.seed(pass, cycle);
        let mut report = SweepReport::default();
        loop {
            report.sweeps += 1;
            let ready: Vec<bool> = self
                .units
                .iter()
                .map(|unit| pass.is_ready(unit.as_ref(), cycle))
                .collect();

            let handles: Vec<(usize, CompletionHandle)> = rayon::scope(|scope| {
                let mut handles = Vec::new();
                for (idx, unit) in self.units.iter_mut().enumerate() {
                    if !ready[idx] {
                        continue;
                    }
                    let (completion, handle) = completion();
                    scope.spawn(move |_| pass.dispatch(unit.as_mut(), completion));
                    handles.push((idx, handle));
                }
                handles
            });

            // The scope has joined every task, so each completion is either
            // signalled or dropped. Finished units are published even when
            // another unit of the batch failed.
            let mut failure = None;
            for (idx, handle) in &handles {
                let outcome = handle
                    .try_wait()
                    .ok_or_else(|| "completion not signalled".to_owned())
                    .and_then(Outcome::into_result);
                match outcome {
                    Ok(()) => pass.update_state(self.units[*idx].as_mut()),
                    Err(reason) => {
                        let unit = self.units[*idx].id();
                        warn!(%unit, %reason, cycle, ?pass, "async unit failed");
                        failure.get_or_insert(GraphError::ComputeFailed { unit, reason });
                    }
                }
            }
            if let Some(err) = failure {
                return Err(err);
            }
            report.computed += handles.len();

            let mut copied = 0;
            for idx in 0..self.units.len() {
                copied += self.propagate(pass, idx);
            }
            report.copied += copied;

            trace!(cycle, ?pass, computed = handles.len(), copied, "batch finished");
            if handles.is_empty() && copied == 0 {
                break;
            }
        }
        debug!(cycle, ?pass, ?report, "async cycle finished");
        Ok(report)
    }

    fn propagate(&mut self, pass: Pass, idx: usize) -> usize {
        match pass {
            Pass::Forward if self.forward_copy_ready_at(idx) => self.forward_copy(idx),
            Pass::Backward if self.backward_copy_ready_at(idx) => self.backward_copy(idx),
            _ => 0,
        }
    }

    fn forward_copy_ready_at(&self, idx: usize) -> bool {
        let (&id, meta) = self.metadata.get_index(idx).expect("Graph::forward_copy_ready_at: [1]");
        let produced = self.units[idx].core().forward_output.version();
        !meta.output_units().is_empty()
            && meta.output_units().iter().all(|consumer| {
                self.slot_version(*consumer, |core| core.forward_input.get(&id))
                    .is_some_and(|received| readiness::is_pending(produced, received))
            })
    }

    fn backward_copy_ready_at(&self, idx: usize) -> bool {
        let (&id, _) = self.metadata.get_index(idx).expect("Graph::backward_copy_ready_at: [1]");
        let core = self.units[idx].core();
        readiness::has_valid_backward_unit(core)
            && core.backward_output.iter().all(|(producer, slot)| {
                self.slot_version(*producer, |core| core.backward_input.get(&id))
                    .is_some_and(|received| readiness::is_pending(slot.version(), received))
            })
    }

    fn slot_version(
        &self,
        id: NodeId,
        select: impl FnOnce(&UnitCore<T>) -> Option<&Slot<T>>,
    ) -> Option<usize> {
        let idx = self.metadata.get_index_of(&id)?;
        select(self.units[idx].core()).map(Slot::version)
    }

    fn forward_copy(&mut self, idx: usize) -> usize {
        let (&id, meta) = self.metadata.get_index(idx).expect("Graph::forward_copy: [1]");
        let tensor = self.units[idx].core_mut().forward_output.take_tensor();
        for consumer in meta.output_units() {
            let target = self
                .metadata
                .get_index_of(consumer)
                .expect("Graph::forward_copy: [2]");
            let slot = self.units[target]
                .core_mut()
                .forward_input
                .get_mut(&id)
                .expect("Graph::forward_copy: [3]");
            let version = slot.copy_from(&tensor);
            trace!(from = %id, to = %consumer, version, "forward copy");
        }
        self.units[idx].core_mut().forward_output.restore_tensor(tensor);
        meta.output_units().len()
    }

    fn backward_copy(&mut self, idx: usize) -> usize {
        let id = self.units[idx].id();
        let producers: Vec<NodeId> = self.units[idx].core().backward_output.keys().copied().collect();
        for producer in &producers {
            let tensor = self.units[idx]
                .core_mut()
                .backward_output
                .get_mut(producer)
                .expect("Graph::backward_copy: [1]")
                .take_tensor();
            let target = self
                .metadata
                .get_index_of(producer)
                .expect("Graph::backward_copy: [2]");
            let slot = self.units[target]
                .core_mut()
                .backward_input
                .get_mut(&id)
                .expect("Graph::backward_copy: [3]");
            let version = slot.copy_from(&tensor);
            trace!(from = %id, to = %producer, version, "backward copy");
            self.units[idx]
                .core_mut()
                .backward_output
                .get_mut(producer)
                .expect("Graph::backward_copy: [4]")
                .restore_tensor(tensor);
        }
        producers.len()
    }
}
