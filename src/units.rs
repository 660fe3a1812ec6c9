use crate::{
    error::GraphError,
    metadata::UnitMetadata,
    tensor::{Element, Shape, Tensor},
    types::{HashMap, NodeId},
    unit::{Unit, UnitCore},
};
use core::fmt::Debug;

/// Named floating-point hyper-parameters handed to optimizer factories.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameter {
    values: HashMap<String, f64>,
}

impl Parameter {
    /// No parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace `key`.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: f64) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    /// Value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }
}

/// Update rule applied by trainable units to their own parameters.
pub trait Optimizer<T>: Debug + Send {
    /// Apply one step to `parameters` given `gradients` of the same layout.
    fn update(&mut self, parameters: &mut Tensor<T>, gradients: &Tensor<T>);
}

/// Plain gradient descent.
#[derive(Debug, Clone, PartialEq)]
pub struct Sgd<T> {
    learning_rate: T,
}

impl<T: Element> Sgd<T> {
    /// Descent with step `learning_rate`.
    #[must_use]
    pub fn new(learning_rate: T) -> Self {
        Self { learning_rate }
    }
}

impl<T: Element> Optimizer<T> for Sgd<T> {
    fn update(&mut self, parameters: &mut Tensor<T>, gradients: &Tensor<T>) {
        for (p, &g) in parameters.data_mut().iter_mut().zip(gradients.data()) {
            *p = *p - self.learning_rate * g;
        }
    }
}

/// Optimizer selected once per compilation and instantiated per trainable
/// unit.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum OptimizerKind {
    /// [`Sgd`] with the given learning rate.
    Sgd {
        /// Step size.
        learning_rate: f64,
    },
}

impl OptimizerKind {
    /// Resolve an optimizer by name. `"SGD"` reads its learning rate from
    /// parameter `"epsilon"`.
    ///
    /// # Errors
    /// [`GraphError::UnsupportedOptimizer`] for unknown names and
    /// [`GraphError::MissingParameter`] when a required parameter is absent.
    pub fn from_name(name: &str, parameter: &Parameter) -> Result<Self, GraphError> {
        match name {
            "SGD" => {
                let learning_rate =
                    parameter
                        .get("epsilon")
                        .ok_or_else(|| GraphError::MissingParameter {
                            optimizer: name.to_owned(),
                            parameter: "epsilon".to_owned(),
                        })?;
                Ok(Self::Sgd { learning_rate })
            }
            _ => Err(GraphError::UnsupportedOptimizer(name.to_owned())),
        }
    }

    /// Fresh optimizer state for one unit.
    #[must_use]
    pub fn build<T: Element>(&self) -> Box<dyn Optimizer<T>> {
        match *self {
            Self::Sgd { learning_rate } => Box::new(Sgd::new(T::from_f64(learning_rate))),
        }
    }
}

fn check_shape(unit: NodeId, expected: &Shape, found: &Shape) -> Result<(), GraphError> {
    if expected == found {
        Ok(())
    } else {
        Err(GraphError::ShapeMismatch {
            unit,
            expected: expected.clone(),
            found: found.clone(),
        })
    }
}

fn single_input<T>(core: &UnitCore<T>) -> (NodeId, &Tensor<T>) {
    let (&producer, slot) = core
        .forward_input
        .first()
        .expect("single_input: unit has no forward input");
    (producer, slot.tensor())
}

/// Source emitting its initializer's data every cycle.
#[derive(Debug)]
pub struct ConstantUnit<T> {
    core: UnitCore<T>,
    value: Tensor<T>,
}

impl<T: Element> ConstantUnit<T> {
    /// Construct from a declaration.
    ///
    /// # Errors
    /// Never fails; the signature matches the registry.
    pub fn create(meta: &UnitMetadata, _: &OptimizerKind) -> Result<Box<dyn Unit<T>>, GraphError> {
        let value = meta
            .initializer
            .tensor(meta.output_shape(), meta.batch_size, meta.device);
        Ok(Box::new(Self {
            core: UnitCore::from_metadata(meta),
            value,
        }))
    }
}

impl<T: Element> Unit<T> for ConstantUnit<T> {
    fn core(&self) -> &UnitCore<T> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut UnitCore<T> {
        &mut self.core
    }

    fn forward(&mut self) {
        self.core.forward_output.tensor_mut().copy_from(&self.value);
    }

    fn backward(&mut self) {}
}

/// `max(0, x)` with the mask kept in scratch for the backward pass.
#[derive(Debug)]
pub struct ReluUnit<T> {
    core: UnitCore<T>,
}

impl<T: Element> ReluUnit<T> {
    const MASK: &'static str = "mask";

    /// Construct from a declaration with one input shaped like the output.
    ///
    /// # Errors
    /// [`GraphError::ShapeMismatch`] when input and output shapes differ.
    pub fn create(meta: &UnitMetadata, _: &OptimizerKind) -> Result<Box<dyn Unit<T>>, GraphError> {
        for shape in meta.input_shapes() {
            check_shape(meta.id(), meta.output_shape(), shape)?;
        }
        let mut core = UnitCore::from_metadata(meta);
        let mask = Tensor::zeros(meta.output_shape().clone(), meta.batch_size, meta.device);
        core.scratch.insert(Self::MASK, mask);
        Ok(Box::new(Self { core }))
    }
}

impl<T: Element> Unit<T> for ReluUnit<T> {
    fn core(&self) -> &UnitCore<T> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut UnitCore<T> {
        &mut self.core
    }

    fn forward(&mut self) {
        let (_, input) = single_input(&self.core);
        let input = input.clone();
        let zero = T::zero();
        let one = T::from_f64(1.0);
        let mask = self.core.scratch.get_mut(Self::MASK).expect("ReluUnit::forward: [1]");
        for (m, &x) in mask.data_mut().iter_mut().zip(input.data()) {
            *m = if x > zero { one } else { zero };
        }
        let output = self.core.forward_output.tensor_mut();
        for (y, &x) in output.data_mut().iter_mut().zip(input.data()) {
            *y = if x > zero { x } else { zero };
        }
    }

    fn backward(&mut self) {
        let gradient = self.core.gradient_sum();
        let mask = &self.core.scratch[Self::MASK];
        for slot in self.core.backward_output.values_mut() {
            for ((dx, &g), &m) in slot
                .tensor_mut()
                .data_mut()
                .iter_mut()
                .zip(gradient.data())
                .zip(mask.data())
            {
                *dx = g * m;
            }
        }
    }
}

/// Elementwise sum of every producer.
#[derive(Debug)]
pub struct AddUnit<T> {
    core: UnitCore<T>,
}

impl<T: Element> AddUnit<T> {
    /// Construct from a declaration whose inputs all share the output shape.
    ///
    /// # Errors
    /// [`GraphError::ShapeMismatch`] when any input shape differs from the
    /// output shape.
    pub fn create(meta: &UnitMetadata, _: &OptimizerKind) -> Result<Box<dyn Unit<T>>, GraphError> {
        for shape in meta.input_shapes() {
            check_shape(meta.id(), meta.output_shape(), shape)?;
        }
        Ok(Box::new(Self {
            core: UnitCore::from_metadata(meta),
        }))
    }
}

impl<T: Element> Unit<T> for AddUnit<T> {
    fn core(&self) -> &UnitCore<T> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut UnitCore<T> {
        &mut self.core
    }

    fn forward(&mut self) {
        let output = self.core.forward_output.tensor_mut();
        output.fill(T::zero());
        for slot in self.core.forward_input.values() {
            for (y, &x) in output.data_mut().iter_mut().zip(slot.tensor().data()) {
                *y = *y + x;
            }
        }
    }

    fn backward(&mut self) {
        let gradient = self.core.gradient_sum();
        for slot in self.core.backward_output.values_mut() {
            slot.tensor_mut().copy_from(&gradient);
        }
    }
}

/// `x + b` with a trainable bias shared across the batch.
#[derive(Debug)]
pub struct BiasUnit<T> {
    core: UnitCore<T>,
    bias: Tensor<T>,
    optimizer: Box<dyn Optimizer<T>>,
}

impl<T: Element> BiasUnit<T> {
    /// Construct from a declaration with one input shaped like the output.
    /// The bias is filled by the declared initializer.
    ///
    /// # Errors
    /// [`GraphError::ShapeMismatch`] when input and output shapes differ.
    pub fn create(
        meta: &UnitMetadata,
        optimizer: &OptimizerKind,
    ) -> Result<Box<dyn Unit<T>>, GraphError> {
        for shape in meta.input_shapes() {
            check_shape(meta.id(), meta.output_shape(), shape)?;
        }
        Ok(Box::new(Self {
            core: UnitCore::from_metadata(meta),
            bias: meta.initializer.tensor(meta.output_shape(), 1, meta.device),
            optimizer: optimizer.build(),
        }))
    }

    /// Current bias.
    #[must_use]
    pub fn bias(&self) -> &Tensor<T> {
        &self.bias
    }
}

impl<T: Element> Unit<T> for BiasUnit<T> {
    fn core(&self) -> &UnitCore<T> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut UnitCore<T> {
        &mut self.core
    }

    fn forward(&mut self) {
        let (_, input) = single_input(&self.core);
        let input = input.clone();
        let output = self.core.forward_output.tensor_mut();
        for batch in 0..output.batch_size() {
            for ((y, &x), &b) in output
                .batch_mut(batch)
                .iter_mut()
                .zip(input.batch(batch))
                .zip(self.bias.data())
            {
                *y = x + b;
            }
        }
    }

    fn backward(&mut self) {
        let gradient = self.core.gradient_sum();
        for slot in self.core.backward_output.values_mut() {
            slot.tensor_mut().copy_from(&gradient);
        }
        let mut bias_gradient = Tensor::zeros(self.bias.shape().clone(), 1, self.bias.device());
        for batch in 0..gradient.batch_size() {
            for (acc, &g) in bias_gradient.data_mut().iter_mut().zip(gradient.batch(batch)) {
                *acc = *acc + g;
            }
        }
        self.optimizer.update(&mut self.bias, &bias_gradient);
    }
}

/// Sink computing `½Σx²`; its gradient with respect to `x` is `x`.
#[derive(Debug)]
pub struct SquaredLossUnit<T> {
    core: UnitCore<T>,
}

impl<T: Element> SquaredLossUnit<T> {
    /// Construct from a declaration with exactly one input.
    ///
    /// # Errors
    /// [`GraphError::InvalidArity`] unless exactly one input is declared.
    pub fn create(meta: &UnitMetadata, _: &OptimizerKind) -> Result<Box<dyn Unit<T>>, GraphError> {
        if meta.input_units().len() != 1 {
            return Err(GraphError::InvalidArity {
                unit: meta.id(),
                kind: meta.id().kind(),
                inputs: meta.input_units().len(),
            });
        }
        Ok(Box::new(Self {
            core: UnitCore::from_metadata(meta),
        }))
    }

    /// Loss computed by the last forward pass.
    #[must_use]
    pub fn loss(&self) -> Option<T> {
        self.core.forward_output.tensor().data().first().copied()
    }
}

impl<T: Element> Unit<T> for SquaredLossUnit<T> {
    fn core(&self) -> &UnitCore<T> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut UnitCore<T> {
        &mut self.core
    }

    fn forward(&mut self) {
        let (_, input) = single_input(&self.core);
        let half = T::from_f64(0.5);
        let loss = input
            .data()
            .iter()
            .fold(T::zero(), |acc, &x| acc + half * x * x);
        if let Some(out) = self.core.forward_output.tensor_mut().data_mut().first_mut() {
            *out = loss;
        }
    }

    fn backward(&mut self) {
        let (producer, input) = single_input(&self.core);
        let input = input.clone();
        if let Some(slot) = self.core.backward_output.get_mut(&producer) {
            slot.tensor_mut().copy_from(&input);
        }
    }
}
