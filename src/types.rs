use crate::error::GraphError;
use core::{cell::UnsafeCell, fmt, str::FromStr};
use derive_more::{Deref, DerefMut, Display};
use indexmap::{IndexMap as _IndexMap, IndexSet as _IndexSet};
use rustc_hash::FxBuildHasher;
use std::collections::HashMap as _HashMap;

/// A minimal `UnsafeCell` wrapper that is `Sync` when `T: Send`.
///
/// Used by the engine for kernels, output buffers and input slots. Exclusive
/// access is guaranteed by the version protocol and the busy flag, never by a
/// lock.
#[derive(Debug, Deref, DerefMut)]
#[repr(transparent)]
pub(crate) struct SyncUnsafeCell<T>(UnsafeCell<T>);

// SAFETY: the contents are only reached by the thread that owns the node for
// the current round, so `T` moves between threads but is never shared.
unsafe impl<T: Send> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    pub(crate) const fn new(val: T) -> Self {
        Self(UnsafeCell::new(val))
    }
}

/// Structural role of a node in the graph.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeKind {
    /// Produces data with no upstream producers.
    Source,
    /// Transforms the outputs of its producers.
    Hidden,
    /// Consumes data; terminal in the forward direction.
    Sink,
    /// Moves one producer's output into one consumer's input.
    Copy,
}

/// Closed set of unit types known to the crate.
///
/// Every tag maps to exactly one [`NodeKind`]; constructors for each tag are
/// looked up in a [`UnitRegistry`](crate::graph::UnitRegistry) when a graph is
/// compiled.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
pub enum UnitType {
    /// Source fed by an engine generator closure.
    Placeholder,
    /// Source emitting the same data every cycle.
    Constant,
    /// Source reading from a dataset.
    DataLoader,
    /// Fully connected layer.
    Dense,
    /// Dropout layer.
    Dropout,
    /// Rectified linear activation.
    Relu,
    /// Trainable additive bias.
    Bias,
    /// Elementwise sum of two producers.
    Add,
    /// Batched matrix product of two producers.
    Multiply,
    /// Shape change without data change.
    Reshape,
    /// Hidden node running an engine kernel closure.
    Elementwise,
    /// `½Σx²` loss.
    SquaredLoss,
    /// Sink handing its inputs to an engine callback.
    Collector,
    /// Sink running an assertion callback on a single input.
    OutputTest,
    /// Auto-inserted edge node.
    Copy,
}

impl UnitType {
    /// Structural role implied by this tag.
    #[must_use]
    pub const fn kind(self) -> NodeKind {
        match self {
            Self::Placeholder | Self::Constant | Self::DataLoader => NodeKind::Source,
            Self::Dense
            | Self::Dropout
            | Self::Relu
            | Self::Bias
            | Self::Add
            | Self::Multiply
            | Self::Reshape
            | Self::Elementwise => NodeKind::Hidden,
            Self::SquaredLoss | Self::Collector | Self::OutputTest => NodeKind::Sink,
            Self::Copy => NodeKind::Copy,
        }
    }

    /// Canonical name used by [`FromStr`].
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Placeholder => "Placeholder",
            Self::Constant => "Constant",
            Self::DataLoader => "DataLoader",
            Self::Dense => "Dense",
            Self::Dropout => "Dropout",
            Self::Relu => "ReLU",
            Self::Bias => "Bias",
            Self::Add => "Add",
            Self::Multiply => "Multiply",
            Self::Reshape => "Reshape",
            Self::Elementwise => "Elementwise",
            Self::SquaredLoss => "SquaredLoss",
            Self::Collector => "Collector",
            Self::OutputTest => "OutputTest",
            Self::Copy => "Copy",
        }
    }

    const ALL: [Self; 15] = [
        Self::Placeholder,
        Self::Constant,
        Self::DataLoader,
        Self::Dense,
        Self::Dropout,
        Self::Relu,
        Self::Bias,
        Self::Add,
        Self::Multiply,
        Self::Reshape,
        Self::Elementwise,
        Self::SquaredLoss,
        Self::Collector,
        Self::OutputTest,
        Self::Copy,
    ];
}

impl fmt::Display for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for UnitType {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.name() == s)
            .ok_or_else(|| GraphError::UnknownUnitType(s.to_owned()))
    }
}

/// Stable identity of a node for the lifetime of its graph.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("{tag}#{index}")]
pub struct NodeId {
    kind: NodeKind,
    tag: UnitType,
    index: u32,
}

impl NodeId {
    /// Identify the `index`-th node declared with type `tag`.
    #[must_use]
    pub const fn new(tag: UnitType, index: u32) -> Self {
        Self {
            kind: tag.kind(),
            tag,
            index,
        }
    }

    /// Structural role.
    #[must_use]
    pub const fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Unit type tag.
    #[must_use]
    pub const fn tag(&self) -> UnitType {
        self.tag
    }

    /// Numeric index.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }
}

pub(crate) type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
/// `IndexMap` type with fast hasher.
pub type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
pub(crate) type IndexSet<T> = _IndexSet<T, FxBuildHasher>;
