use crate::{
    tensor::{NumericType, Shape},
    types::{NodeId, NodeKind, UnitType},
};
use thiserror::Error;

/// Error returned while declaring or compiling a [`Graph`](crate::graph::Graph).
///
/// Every variant is fatal for the compilation that produced it; no partially
/// compiled graph is retained.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum GraphError {
    /// A unit type name does not match any [`UnitType`].
    #[error("unrecognized unit type `{0}`")]
    UnknownUnitType(String),
    /// The optimizer name is not supported.
    #[error("unsupported optimizer `{0}`")]
    UnsupportedOptimizer(String),
    /// An optimizer hyper-parameter is missing.
    #[error("optimizer `{optimizer}` requires parameter `{parameter}`")]
    MissingParameter {
        /// Optimizer name.
        optimizer: String,
        /// Missing parameter key.
        parameter: String,
    },
    /// Two declarations share an id.
    #[error("unit {0} is declared twice")]
    DuplicateUnit(NodeId),
    /// A declaration refers to an undeclared unit.
    #[error("unit {unit} refers to undeclared unit {missing}")]
    UnknownUnit {
        /// Declaring unit.
        unit: NodeId,
        /// Undeclared reference.
        missing: NodeId,
    },
    /// A unit lists the same producer more than once.
    #[error("unit {unit} lists producer {producer} more than once")]
    DuplicateInput {
        /// Declaring unit.
        unit: NodeId,
        /// Repeated producer.
        producer: NodeId,
    },
    /// A unit's inputs do not fit its kind.
    #[error("unit {unit} of kind {kind} cannot have {inputs} input(s)")]
    InvalidArity {
        /// Offending unit.
        unit: NodeId,
        /// Its kind.
        kind: NodeKind,
        /// Number of declared inputs.
        inputs: usize,
    },
    /// A unit consumes from a node kind that produces nothing.
    #[error("unit {unit} cannot consume from {producer}")]
    InvalidProducer {
        /// Consuming unit.
        unit: NodeId,
        /// Producer that is a sink or copy.
        producer: NodeId,
    },
    /// Declared numeric type differs from the graph's element type.
    #[error("unit {unit} declares {declared} but the graph computes in {expected}")]
    NumericTypeMismatch {
        /// Offending unit.
        unit: NodeId,
        /// Declared type.
        declared: NumericType,
        /// Element type of the graph.
        expected: NumericType,
    },
    /// Declarations form a cycle.
    #[error("graph contains cycle(s)")]
    Cycle,
    /// Incompatible shapes between connected declarations.
    #[error("shape mismatch at {unit}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        /// Unit under construction.
        unit: NodeId,
        /// Shape required by the unit.
        expected: Shape,
        /// Shape actually declared.
        found: Shape,
    },
    /// A unit's batch size differs from one of its producers'.
    #[error("batch size mismatch at {unit}: {producer} yields {expected}, unit takes {found}")]
    BatchSizeMismatch {
        /// Unit under construction.
        unit: NodeId,
        /// Producer whose batch size disagrees.
        producer: NodeId,
        /// Batch size of the producer's output.
        expected: usize,
        /// Batch size declared by the unit.
        found: usize,
    },
    /// The unit type is declared but has no constructor.
    #[error("unit type {0} is not implemented")]
    Unimplemented(UnitType),
    /// An async unit task failed or dropped its completion.
    #[error("unit {unit} failed: {reason}")]
    ComputeFailed {
        /// Failing unit.
        unit: NodeId,
        /// Reported reason.
        reason: String,
    },
}

/// Error returned by [`Engine`](crate::engine::Engine) declarations and runs.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum EngineError {
    /// A declaration names a node that does not exist.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    /// A declaration consumes from a node that produces nothing.
    #[error("{consumer} cannot consume from {producer}")]
    UnsupportedConnection {
        /// Node being declared.
        consumer: NodeId,
        /// Sink or copy named as predecessor.
        producer: NodeId,
    },
    /// A hidden or sink node was declared without predecessors.
    #[error("{0} needs at least one predecessor")]
    NoPredecessors(NodeId),
    /// Incompatible operand shapes.
    #[error("shape mismatch at {node}: {lhs:?} and {rhs:?}")]
    ShapeMismatch {
        /// Node being declared.
        node: NodeId,
        /// Left operand shape.
        lhs: Shape,
        /// Right operand shape.
        rhs: Shape,
    },
    /// Operands with different batch sizes.
    #[error("batch size mismatch at {node}: {lhs} and {rhs}")]
    BatchSizeMismatch {
        /// Node being declared.
        node: NodeId,
        /// Left operand batch size.
        lhs: usize,
        /// Right operand batch size.
        rhs: usize,
    },
    /// `execute_parallel` was asked for zero workers.
    #[error("at least one worker is required")]
    NoWorkers,
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
    /// The run was aborted before every node reached the target epoch.
    #[error("execution aborted after {rounds} round(s)")]
    Aborted {
        /// Rounds (or sweeps) completed before the abort was observed.
        rounds: usize,
    },
    /// A task panicked; the engine stopped issuing rounds.
    #[error("task for {node} panicked: {message}")]
    TaskPanicked {
        /// Node whose task panicked.
        node: NodeId,
        /// Panic payload, when it was a string.
        message: String,
    },
    /// The cooperative sweep reached a fixed point before the target epoch.
    #[error("{pending} node(s) never reached epoch {epochs}")]
    Incomplete {
        /// Target epoch count.
        epochs: usize,
        /// Nodes below the target.
        pending: usize,
    },
    /// A parallel round found nothing to run before the target epoch.
    #[error("no node became ready; {pending} node(s) below epoch {epochs}")]
    Stalled {
        /// Target epoch count.
        epochs: usize,
        /// Nodes below the target.
        pending: usize,
    },
}
