//! Deferred evaluation for lazy-backed arrays.
//!
//! Operations on a lazy array append nodes to a [`LazyGraph`] instead of computing. Reading an
//! element, evaluating or converting the array materialises the node together with whatever it
//! depends on. Results are resolved against the concrete accessors adopted as leaves, so a lazy
//! factory over Direct storage computes exactly what Direct computes.
mod graph;
mod state;

pub use graph::{EvalMode, LazyGraph, NodeHandle};
pub use state::{GraphStats, NodeId, NodeStatus};
