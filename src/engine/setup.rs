use super::{
    Consumer, CopyNode, Engine, Generator, HiddenNode, Kernel, SinkNode, SourceNode, UnitState,
};
use crate::{
    error::EngineError,
    handoff::Mailbox,
    slot::Slot,
    tensor::{Device, Element, Shape, Tensor},
    types::{NodeId, NodeKind, SyncUnsafeCell, UnitType},
};
use tracing::debug;

fn next_index(len: usize) -> u32 {
    u32::try_from(len).expect("Engine: node index overflows u32")
}

impl<T: Element> Engine<T> {
    /// Declare a source whose output for each epoch is filled by
    /// `generator(epoch, output)`. Zero batch size is raised to one.
    pub fn source(
        &mut self,
        shape: impl Into<Shape>,
        batch_size: usize,
        generator: impl FnMut(usize, &mut Tensor<T>) + Send + 'static,
    ) -> NodeId {
        self.push_source(
            UnitType::Placeholder,
            shape.into(),
            batch_size.max(1),
            Box::new(generator),
        )
    }

    /// Declare a source emitting `value` every epoch.
    pub fn constant(&mut self, value: Tensor<T>) -> NodeId {
        let shape = value.shape().clone();
        let batch_size = value.batch_size();
        self.push_source(
            UnitType::Constant,
            shape,
            batch_size,
            Box::new(move |_: usize, output: &mut Tensor<T>| output.copy_from(&value)),
        )
    }

    /// Declare a hidden node computing `kernel(inputs, output)` over the
    /// outputs of `predecessors`. The output takes `shape` and the batch size
    /// shared by every predecessor.
    ///
    /// # Errors
    /// - [`EngineError::NoPredecessors`] if `predecessors` is empty.
    /// - [`EngineError::UnknownNode`] or [`EngineError::UnsupportedConnection`]
    ///   for an invalid predecessor.
    /// - [`EngineError::BatchSizeMismatch`] if predecessors disagree on batch
    ///   size.
    pub fn hidden(
        &mut self,
        predecessors: &[NodeId],
        shape: impl Into<Shape>,
        kernel: impl FnMut(&[&Tensor<T>], &mut Tensor<T>) + Send + 'static,
    ) -> Result<NodeId, EngineError> {
        self.push_hidden(
            UnitType::Elementwise,
            predecessors,
            shape.into(),
            Box::new(kernel),
        )
    }

    /// Declare the batched matrix product `lhs × rhs`.
    ///
    /// # Errors
    /// - [`EngineError::ShapeMismatch`] unless both operands are non-empty and
    ///   at most two-dimensional with `cols(lhs) == rows(rhs)`.
    /// - [`EngineError::BatchSizeMismatch`] if batch sizes differ.
    /// - Predecessor errors as for [`Engine::hidden`].
    pub fn multiply(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId, EngineError> {
        let id = NodeId::new(UnitType::Multiply, next_index(self.hidden.len()));
        let (lhs_shape, lhs_batch) = self.producer_layout(id, lhs)?;
        let (rhs_shape, rhs_batch) = self.producer_layout(id, rhs)?;
        if lhs_shape.size() == 0
            || rhs_shape.size() == 0
            || lhs_shape.dims().len() > 2
            || rhs_shape.dims().len() > 2
            || lhs_shape.cols() != rhs_shape.rows()
        {
            return Err(EngineError::ShapeMismatch {
                node: id,
                lhs: lhs_shape,
                rhs: rhs_shape,
            });
        }
        if lhs_batch != rhs_batch {
            return Err(EngineError::BatchSizeMismatch {
                node: id,
                lhs: lhs_batch,
                rhs: rhs_batch,
            });
        }
        let (m, k, n) = (lhs_shape.rows(), lhs_shape.cols(), rhs_shape.cols());
        let shape = lhs_shape.matmul(&rhs_shape);
        let kernel = move |inputs: &[&Tensor<T>], output: &mut Tensor<T>| {
            for batch in 0..output.batch_size() {
                let (a, b) = (inputs[0].batch(batch), inputs[1].batch(batch));
                let out = output.batch_mut(batch);
                for i in 0..m {
                    for j in 0..n {
                        out[i * n + j] = (0..k).fold(T::zero(), |acc, kk| {
                            acc + a[i * k + kk] * b[kk * n + j]
                        });
                    }
                }
            }
        };
        self.push_hidden(UnitType::Multiply, &[lhs, rhs], shape, Box::new(kernel))
    }

    /// Declare the elementwise sum `lhs + rhs`.
    ///
    /// # Errors
    /// - [`EngineError::ShapeMismatch`] if the shapes differ.
    /// - [`EngineError::BatchSizeMismatch`] if batch sizes differ.
    /// - Predecessor errors as for [`Engine::hidden`].
    pub fn add(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId, EngineError> {
        let id = NodeId::new(UnitType::Add, next_index(self.hidden.len()));
        let (lhs_shape, lhs_batch) = self.producer_layout(id, lhs)?;
        let (rhs_shape, rhs_batch) = self.producer_layout(id, rhs)?;
        if lhs_shape != rhs_shape {
            return Err(EngineError::ShapeMismatch {
                node: id,
                lhs: lhs_shape,
                rhs: rhs_shape,
            });
        }
        if lhs_batch != rhs_batch {
            return Err(EngineError::BatchSizeMismatch {
                node: id,
                lhs: lhs_batch,
                rhs: rhs_batch,
            });
        }
        let kernel = |inputs: &[&Tensor<T>], output: &mut Tensor<T>| {
            for ((out, &a), &b) in output
                .data_mut()
                .iter_mut()
                .zip(inputs[0].data())
                .zip(inputs[1].data())
            {
                *out = a + b;
            }
        };
        self.push_hidden(UnitType::Add, &[lhs, rhs], lhs_shape, Box::new(kernel))
    }

    /// Declare a sink handing the outputs of `predecessors` and the epoch to
    /// `consumer`.
    ///
    /// # Errors
    /// As for [`Engine::hidden`], except that batch sizes may differ.
    pub fn sink(
        &mut self,
        predecessors: &[NodeId],
        consumer: impl FnMut(&[&Tensor<T>], usize) + Send + 'static,
    ) -> Result<NodeId, EngineError> {
        self.push_sink(UnitType::Collector, predecessors, Box::new(consumer))
    }

    /// Declare a sink running `check(output, epoch)` on the output of
    /// `predecessor`, typically to assert on it.
    ///
    /// # Errors
    /// Predecessor errors as for [`Engine::hidden`].
    pub fn output_test(
        &mut self,
        predecessor: NodeId,
        mut check: impl FnMut(&Tensor<T>, usize) + Send + 'static,
    ) -> Result<NodeId, EngineError> {
        self.push_sink(
            UnitType::OutputTest,
            &[predecessor],
            Box::new(move |inputs: &[&Tensor<T>], epoch: usize| check(inputs[0], epoch)),
        )
    }

    fn push_source(
        &mut self,
        tag: UnitType,
        shape: Shape,
        batch_size: usize,
        generator: Generator<T>,
    ) -> NodeId {
        let id = NodeId::new(tag, next_index(self.sources.len()));
        let output = Tensor::zeros(shape.clone(), batch_size, Device::Cpu);
        self.sources.push(SourceNode {
            id,
            state: UnitState::new(),
            output: SyncUnsafeCell::new(output),
            generator: SyncUnsafeCell::new(generator),
            out_copies: Vec::new(),
        });
        debug!(node = %id, ?shape, batch_size, "source declared");
        self.layouts.insert(id, (shape, batch_size));
        id
    }

    fn push_hidden(
        &mut self,
        tag: UnitType,
        predecessors: &[NodeId],
        shape: Shape,
        kernel: Kernel<T>,
    ) -> Result<NodeId, EngineError> {
        let id = NodeId::new(tag, next_index(self.hidden.len()));
        let inputs = self.input_slots(id, predecessors)?;
        let batch_size = inputs[0].1;
        if let Some(&(_, other)) = inputs.iter().find(|(_, batch)| *batch != batch_size) {
            return Err(EngineError::BatchSizeMismatch {
                node: id,
                lhs: batch_size,
                rhs: other,
            });
        }
        let output = Tensor::zeros(shape.clone(), batch_size, Device::Cpu);
        self.hidden.push(HiddenNode {
            id,
            state: UnitState::new(),
            inputs: inputs.into_iter().map(|(slot, _)| slot).collect(),
            in_copies: Vec::new(),
            output: SyncUnsafeCell::new(output),
            kernel: SyncUnsafeCell::new(kernel),
            out_copies: Vec::new(),
        });
        let in_copies = self.connect_all(id, predecessors);
        self.hidden
            .last_mut()
            .expect("Engine::push_hidden: [1]")
            .in_copies = in_copies;
        debug!(
            node = %id,
            ?shape,
            batch_size,
            inputs = predecessors.len(),
            "hidden declared"
        );
        self.layouts.insert(id, (shape, batch_size));
        Ok(id)
    }

    fn push_sink(
        &mut self,
        tag: UnitType,
        predecessors: &[NodeId],
        consumer: Consumer<T>,
    ) -> Result<NodeId, EngineError> {
        let id = NodeId::new(tag, next_index(self.sinks.len()));
        let inputs = self.input_slots(id, predecessors)?;
        self.sinks.push(SinkNode {
            id,
            state: UnitState::new(),
            inputs: inputs.into_iter().map(|(slot, _)| slot).collect(),
            in_copies: Vec::new(),
            consumer: SyncUnsafeCell::new(consumer),
        });
        let in_copies = self.connect_all(id, predecessors);
        self.sinks
            .last_mut()
            .expect("Engine::push_sink: [1]")
            .in_copies = in_copies;
        debug!(node = %id, inputs = predecessors.len(), "sink declared");
        Ok(id)
    }

    /// Zeroed input slots shaped like each predecessor's output, with the
    /// predecessor's batch size.
    #[allow(clippy::type_complexity)]
    fn input_slots(
        &self,
        consumer: NodeId,
        predecessors: &[NodeId],
    ) -> Result<Vec<(SyncUnsafeCell<Slot<T>>, usize)>, EngineError> {
        if predecessors.is_empty() {
            return Err(EngineError::NoPredecessors(consumer));
        }
        predecessors
            .iter()
            .map(|&producer| {
                let (shape, batch_size) = self.producer_layout(consumer, producer)?;
                let slot = Slot::new(Tensor::zeros(shape, batch_size, Device::Cpu));
                Ok((SyncUnsafeCell::new(slot), batch_size))
            })
            .collect()
    }

    fn producer_layout(
        &self,
        consumer: NodeId,
        producer: NodeId,
    ) -> Result<(Shape, usize), EngineError> {
        if matches!(producer.kind(), NodeKind::Sink | NodeKind::Copy) {
            return Err(EngineError::UnsupportedConnection { consumer, producer });
        }
        self.layouts
            .get(&producer)
            .cloned()
            .ok_or(EngineError::UnknownNode(producer))
    }

    fn connect_all(&mut self, consumer: NodeId, predecessors: &[NodeId]) -> Vec<usize> {
        predecessors
            .iter()
            .enumerate()
            .map(|(input, &producer)| self.connect(producer, consumer, input))
            .collect()
    }

    /// Insert the copy node carrying `producer`'s output into input `input` of
    /// `consumer`.
    fn connect(&mut self, producer: NodeId, consumer: NodeId, input: usize) -> usize {
        let idx = self.copies.len();
        let id = NodeId::new(UnitType::Copy, next_index(idx));
        self.copies.push(CopyNode {
            id,
            state: UnitState::new(),
            src: producer,
            dst: consumer,
            dst_input: input,
            mailbox: Mailbox::new(),
        });
        let producer_idx = producer.index() as usize;
        match producer.kind() {
            NodeKind::Source => self.sources[producer_idx].out_copies.push(idx),
            NodeKind::Hidden => self.hidden[producer_idx].out_copies.push(idx),
            NodeKind::Sink | NodeKind::Copy => unreachable!("Engine::connect"),
        }
        debug!(copy = %id, from = %producer, to = %consumer, input, "edge wired");
        idx
    }
}
