use crate::{
    handoff::Completion,
    metadata::UnitMetadata,
    readiness,
    slot::Slot,
    tensor::{Device, Element, Shape, Tensor},
    types::{IndexMap, NodeId, NodeKind},
};
use core::fmt::Debug;

/// Slots and scratch buffers shared by every unit implementation.
///
/// Forward inputs and backward outputs are keyed by producer; backward inputs
/// are keyed by consumer. Sources own one seed forward input keyed by their
/// own id and sinks one seed backward input keyed by their own id.
#[derive(Debug)]
pub struct UnitCore<T> {
    id: NodeId,
    batch_size: usize,
    device: Device,
    /// Forward inputs, one per producer.
    pub forward_input: IndexMap<NodeId, Slot<T>>,
    /// Forward output, duplicated into every consumer by copy propagation.
    pub forward_output: Slot<T>,
    /// Gradients received, one per consumer.
    pub backward_input: IndexMap<NodeId, Slot<T>>,
    /// Gradients emitted, one per producer.
    pub backward_output: IndexMap<NodeId, Slot<T>>,
    /// Unit-private buffers.
    pub scratch: IndexMap<&'static str, Tensor<T>>,
}

impl<T: Element> UnitCore<T> {
    /// Allocate every slot declared by `meta`. Output units must already be
    /// linked.
    #[must_use]
    pub fn from_metadata(meta: &UnitMetadata) -> Self {
        let id = meta.id();
        let batch_size = meta.batch_size;
        let device = meta.device;
        let zeros = |shape: &Shape| Slot::new(Tensor::zeros(shape.clone(), batch_size, device));

        let mut forward_input = IndexMap::default();
        let mut backward_output = IndexMap::default();
        if id.kind() == NodeKind::Source {
            forward_input.insert(id, Slot::seed());
        } else {
            for (&producer, shape) in meta.input_units().iter().zip(meta.input_shapes()) {
                forward_input.insert(producer, zeros(shape));
                backward_output.insert(producer, zeros(shape));
            }
        }

        let mut backward_input = IndexMap::default();
        if id.kind() == NodeKind::Sink {
            backward_input.insert(id, Slot::seed());
        } else {
            for &consumer in meta.output_units() {
                backward_input.insert(consumer, zeros(meta.output_shape()));
            }
        }

        Self {
            id,
            batch_size,
            device,
            forward_input,
            forward_output: zeros(meta.output_shape()),
            backward_input,
            backward_output,
            scratch: IndexMap::default(),
        }
    }

    /// Sum of every received gradient, shaped like the forward output. Seed
    /// slots carry no data and are skipped.
    #[must_use]
    pub fn gradient_sum(&self) -> Tensor<T> {
        let output = self.forward_output.tensor();
        let mut sum = Tensor::zeros(output.shape().clone(), output.batch_size(), output.device());
        for slot in self.backward_input.values() {
            let (gradient, _) = slot.read();
            if gradient.data().len() != sum.data().len() {
                continue;
            }
            for (acc, &g) in sum.data_mut().iter_mut().zip(gradient.data()) {
                *acc = *acc + g;
            }
        }
        sum
    }
}

impl<T> UnitCore<T> {
    /// Id of the unit.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Batch elements per buffer.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Device tag of the unit's buffers.
    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }
}

/// Uniform contract between the scheduler and a unit implementation.
///
/// Implementations provide the computation; readiness and state updates
/// default to the version protocol over [`UnitCore`] and are rarely
/// overridden. Side effects must stay within the unit's own output and
/// scratch buffers; moving data between units is the scheduler's job.
pub trait Unit<T: Element>: Debug + Send {
    /// Slots and scratch buffers.
    fn core(&self) -> &UnitCore<T>;

    /// Mutable slots and scratch buffers.
    fn core_mut(&mut self) -> &mut UnitCore<T>;

    /// Compute the forward output from the forward inputs.
    fn forward(&mut self);

    /// Compute gradients for every producer from the received gradients.
    fn backward(&mut self);

    /// Id of the unit.
    fn id(&self) -> NodeId {
        self.core().id()
    }

    /// Eligible to run [`Unit::forward`] for `cycle`.
    fn is_forward_ready(&self, cycle: usize) -> bool {
        readiness::is_forward_ready(self.core(), cycle)
    }

    /// Eligible to run [`Unit::backward`] for `cycle`.
    fn is_backward_ready(&self, cycle: usize) -> bool {
        readiness::is_backward_ready(self.core(), cycle)
    }

    /// Publish the forward output computed by the last [`Unit::forward`].
    fn update_forward_state(&mut self) {
        self.core().forward_output.publish();
    }

    /// Publish every gradient computed by the last [`Unit::backward`].
    fn update_backward_state(&mut self) {
        for slot in self.core().backward_output.values() {
            slot.publish();
        }
    }

    /// Same computation as [`Unit::forward`], signalled through `completion`.
    fn async_forward(&mut self, completion: Completion) {
        self.forward();
        completion.finish();
    }

    /// Same computation as [`Unit::backward`], signalled through `completion`.
    fn async_backward(&mut self, completion: Completion) {
        self.backward();
        completion.finish();
    }
}
