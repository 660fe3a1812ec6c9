//! Dataflow graph execution driven by versioned slots.
//!
//! Every edge of a graph is a [`Slot`](slot::Slot): a buffer plus a monotonic
//! version counter. A node runs when its input versions are exactly one ahead
//! of its own and its output versions have been consumed; copying a fresh
//! output into a consumer bumps the consumer-side version by one. Nothing
//! else synchronizes producers and consumers, so no update is ever skipped or
//! delivered twice.
//!
//! Two front ends share the protocol:
//! - [`graph`]: declarations ([`UnitMetadata`](metadata::UnitMetadata)) are
//!   compiled into a [`Graph`](graph::Graph) of boxed
//!   [`Unit`](unit::Unit)s, then driven one forward or backward cycle at a
//!   time by fixed-point sweeps, optionally computing each sweep's ready units
//!   on the rayon pool.
//! - [`engine`]: nodes are declared incrementally with closures, every edge
//!   becomes an explicit copy node, and the whole graph runs for a number of
//!   epochs either on the calling thread or on a worker pool fed by a bounded
//!   [`TaskQueue`](queue::TaskQueue) with round barriers.
//!
//! Quick start:
//! 1. Declare a source, hidden nodes and a sink on an
//!    [`Engine`](engine::Engine).
//! 2. Call `execute(epochs)` or `execute_parallel(workers, epochs)`.
//! 3. Inspect epochs and input versions, or assert inside an `output_test`
//!    sink.

/// Runtime tuning of the engine.
pub mod config;
/// Incrementally declared graphs run for many epochs.
///
/// Contains declarations that auto-insert copy nodes (`setup`) and the
/// cooperative and worker-pool run loops (`execute`).
pub mod engine;
/// Errors of graph compilation and engine runs.
pub mod error;
/// Declarative graph front end and the single-process scheduler.
///
/// A `GraphBuilder` collects `UnitMetadata` declarations; compiling it
/// validates them, derives output links and a topological order, and
/// materializes every unit through a `UnitRegistry`. The resulting `Graph`
/// drives forward and backward cycles by repeated sweeps until nothing is left
/// to compute or copy.
pub mod graph;
/// Single-slot primitives for moving values across a thread boundary without
/// a full queue: mailbox, counting barrier and one-shot completions.
pub mod handoff;
/// Per-unit declarations consumed by graph compilation.
pub mod metadata;
/// Bounded MPMC task queue feeding the engine's worker pool, and the tasks
/// workers run.
pub mod queue;
/// Predicates deciding whether a node may run at the current version state.
///
/// Nothing here blocks or mutates: every predicate is a pure comparison of
/// version counters, which is the only synchronization between a producer and
/// its consumers.
pub mod readiness;
/// Versioned buffers forming the edges of a graph.
pub mod slot;
mod sync;
/// Elements, shapes and tensors.
pub mod tensor;
/// Node identity and shared aliases.
///
/// Provides `NodeId`, the closed `UnitType` tag set with its `NodeKind`
/// mapping, and a `SyncUnsafeCell` wrapper used by the engine under its
/// scheduling guarantees.
pub mod types;
/// The unit contract between scheduler and computation.
pub mod unit;
/// Reference units and update strategies.
///
/// The scheduler only sees these through the `Unit` trait; they exist so
/// graphs can be compiled and trained without an external layer library.
pub mod units;
mod utils;
