use derive_more::Display;
use std::{
    fmt::Debug,
    ops::{Add, Mul, Sub},
};

/// Numeric representation of a buffer's elements.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NumericType {
    /// 32-bit IEEE float.
    Float32,
    /// 64-bit IEEE float.
    Float64,
    /// 32-bit signed integer.
    Int32,
}

/// Scalar stored in a [`Tensor`].
pub trait Element:
    Copy
    + Default
    + PartialEq
    + PartialOrd
    + Debug
    + Send
    + Sync
    + 'static
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
{
    /// Tag recorded in unit metadata for this element type.
    const NUMERIC_TYPE: NumericType;

    /// Lossy conversion used by initializers and optimizer hyper-parameters.
    fn from_f64(value: f64) -> Self;

    /// Additive identity.
    #[must_use]
    fn zero() -> Self {
        Self::default()
    }
}

impl Element for f32 {
    const NUMERIC_TYPE: NumericType = NumericType::Float32;

    #[allow(clippy::cast_possible_truncation)]
    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

impl Element for f64 {
    const NUMERIC_TYPE: NumericType = NumericType::Float64;

    fn from_f64(value: f64) -> Self {
        value
    }
}

impl Element for i32 {
    const NUMERIC_TYPE: NumericType = NumericType::Int32;

    #[allow(clippy::cast_possible_truncation)]
    fn from_f64(value: f64) -> Self {
        value as i32
    }
}

/// Where a unit's buffers are meant to live. Only tagged; dispatch belongs to
/// the kernels.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum Device {
    /// Host memory.
    #[default]
    #[display("cpu")]
    Cpu,
    /// Accelerator with the given ordinal.
    #[display("gpu:{_0}")]
    Gpu(u32),
}

/// Dimensions of one batch element, outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Shape with the given dimensions.
    #[must_use]
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    /// Zero-dimensional shape, used by seed slots.
    #[must_use]
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    /// Dimensions.
    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of elements of one batch element. An empty shape holds no data.
    #[must_use]
    pub fn size(&self) -> usize {
        if self.0.is_empty() {
            0
        } else {
            self.0.iter().product()
        }
    }

    /// Second-to-last dimension, `1` for vectors.
    #[must_use]
    pub fn rows(&self) -> usize {
        match self.0.len() {
            0 | 1 => 1,
            len => self.0[len - 2],
        }
    }

    /// Last dimension, `1` for scalars.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.0.last().copied().unwrap_or(1)
    }

    /// Shape of `self × rhs` for matrices: `(.., rows(self), cols(rhs))`.
    #[must_use]
    pub fn matmul(&self, rhs: &Self) -> Self {
        let mut dims = self.0.clone();
        match dims.len() {
            0 | 1 => dims = vec![1, rhs.cols()],
            len => dims[len - 1] = rhs.cols(),
        }
        Self(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self(dims.to_vec())
    }
}

/// Contiguous buffer of `batch_size` elements of `shape`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tensor<T> {
    shape: Shape,
    batch_size: usize,
    device: Device,
    data: Vec<T>,
}

impl<T: Element> Tensor<T> {
    /// Zero-filled tensor.
    #[must_use]
    pub fn zeros(shape: Shape, batch_size: usize, device: Device) -> Self {
        let data = vec![T::zero(); shape.size() * batch_size];
        Self {
            shape,
            batch_size,
            device,
            data,
        }
    }

    /// Tensor owning `data`, which must hold `shape.size() * batch_size`
    /// elements.
    ///
    /// # Panics
    /// If the length of `data` does not match.
    #[must_use]
    pub fn from_vec(shape: Shape, batch_size: usize, data: Vec<T>) -> Self {
        assert_eq!(
            data.len(),
            shape.size() * batch_size,
            "Tensor::from_vec: data length does not match {shape:?} x {batch_size}"
        );
        Self {
            shape,
            batch_size,
            device: Device::Cpu,
            data,
        }
    }

    /// Overwrite every element with `value`.
    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    /// Copy contents from `src`, adopting its layout.
    pub fn copy_from(&mut self, src: &Self) {
        self.shape.clone_from(&src.shape);
        self.batch_size = src.batch_size;
        self.device = src.device;
        self.data.clone_from(&src.data);
    }
}

impl<T> Tensor<T> {
    /// Per-batch-element shape.
    #[must_use]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Number of batch elements.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Device tag.
    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Flat element view.
    #[must_use]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Mutable flat element view.
    #[must_use]
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Elements of batch element `batch`.
    #[must_use]
    pub fn batch(&self, batch: usize) -> &[T] {
        let size = self.shape.size();
        &self.data[batch * size..(batch + 1) * size]
    }

    /// Mutable elements of batch element `batch`.
    #[must_use]
    pub fn batch_mut(&mut self, batch: usize) -> &mut [T] {
        let size = self.shape.size();
        &mut self.data[batch * size..(batch + 1) * size]
    }
}
