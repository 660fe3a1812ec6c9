use crate::{
    tensor::{Device, Element, NumericType, Shape, Tensor},
    types::NodeId,
};

/// How a unit fills a buffer it owns before the first cycle.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Initializer {
    /// All zeros.
    #[default]
    Zeros,
    /// All ones.
    Ones,
    /// All elements equal to the value.
    Fill(f64),
    /// Explicit values for one batch element, repeated over the batch.
    Values(Vec<f64>),
}

impl Initializer {
    /// Build a tensor of `shape` × `batch_size` on `device`.
    #[must_use]
    pub fn tensor<T: Element>(&self, shape: &Shape, batch_size: usize, device: Device) -> Tensor<T> {
        let mut tensor = Tensor::zeros(shape.clone(), batch_size, device);
        match self {
            Self::Zeros => {}
            Self::Ones => tensor.fill(T::from_f64(1.0)),
            Self::Fill(value) => tensor.fill(T::from_f64(*value)),
            Self::Values(values) => {
                for batch in 0..batch_size {
                    for (dst, src) in tensor.batch_mut(batch).iter_mut().zip(values) {
                        *dst = T::from_f64(*src);
                    }
                }
            }
        }
        tensor
    }
}

/// Declaration of one unit: everything needed to construct it, nothing that
/// changes while it runs.
///
/// Output units are not declared; they are derived from the input lists of
/// all declarations when the graph is compiled.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitMetadata {
    id: NodeId,
    input_units: Vec<NodeId>,
    input_shapes: Vec<Shape>,
    output_shape: Shape,
    output_units: Vec<NodeId>,
    /// Element type the unit computes in.
    pub numeric_type: NumericType,
    /// Padding for the innermost dimension. Carried through compile for
    /// custom units; the reference units ignore it.
    pub pad_size: usize,
    /// Device tag for the unit's buffers.
    pub device: Device,
    /// Batch elements per buffer.
    pub batch_size: usize,
    /// Initializer for the unit's parameters or constant data.
    pub initializer: Initializer,
}

impl UnitMetadata {
    /// Start declaring unit `id`.
    #[must_use]
    pub fn builder(id: NodeId) -> UnitMetadataBuilder {
        UnitMetadataBuilder {
            meta: Self {
                id,
                input_units: Vec::new(),
                input_shapes: Vec::new(),
                output_shape: Shape::empty(),
                output_units: Vec::new(),
                numeric_type: NumericType::Float32,
                pad_size: 0,
                device: Device::Cpu,
                batch_size: 1,
                initializer: Initializer::Zeros,
            },
        }
    }

    /// Id of the declared unit.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Producers, in input order.
    #[must_use]
    pub fn input_units(&self) -> &[NodeId] {
        &self.input_units
    }

    /// Expected shape of each input, aligned with [`Self::input_units`].
    #[must_use]
    pub fn input_shapes(&self) -> &[Shape] {
        &self.input_shapes
    }

    /// Shape of the input received from `producer`.
    #[must_use]
    pub fn input_shape(&self, producer: NodeId) -> Option<&Shape> {
        self.input_units
            .iter()
            .position(|&id| id == producer)
            .map(|idx| &self.input_shapes[idx])
    }

    /// Shape of the forward output.
    #[must_use]
    pub fn output_shape(&self) -> &Shape {
        &self.output_shape
    }

    /// Consumers, filled in at compile time.
    #[must_use]
    pub fn output_units(&self) -> &[NodeId] {
        &self.output_units
    }

    pub(crate) fn append_output_unit(&mut self, consumer: NodeId) {
        if !self.output_units.contains(&consumer) {
            self.output_units.push(consumer);
        }
    }
}

/// Builder returned by [`UnitMetadata::builder`].
#[must_use]
#[derive(Debug, Clone)]
pub struct UnitMetadataBuilder {
    meta: UnitMetadata,
}

impl UnitMetadataBuilder {
    /// Append an input received from `producer` with the given shape.
    pub fn input(mut self, producer: NodeId, shape: impl Into<Shape>) -> Self {
        self.meta.input_units.push(producer);
        self.meta.input_shapes.push(shape.into());
        self
    }

    /// Set the forward output shape.
    pub fn output_shape(mut self, shape: impl Into<Shape>) -> Self {
        self.meta.output_shape = shape.into();
        self
    }

    /// Set the numeric type.
    pub fn numeric_type(mut self, numeric_type: NumericType) -> Self {
        self.meta.numeric_type = numeric_type;
        self
    }

    /// Set the padding size.
    pub fn pad_size(mut self, pad_size: usize) -> Self {
        self.meta.pad_size = pad_size;
        self
    }

    /// Set the device tag.
    pub fn device(mut self, device: Device) -> Self {
        self.meta.device = device;
        self
    }

    /// Set the batch size. Zero is raised to one.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.meta.batch_size = batch_size.max(1);
        self
    }

    /// Set the initializer.
    pub fn initializer(mut self, initializer: Initializer) -> Self {
        self.meta.initializer = initializer;
        self
    }

    /// Finish the declaration.
    #[must_use]
    pub fn build(self) -> UnitMetadata {
        self.meta
    }
}
