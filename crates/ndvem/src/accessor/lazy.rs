use std::fmt;
use std::sync::Arc;

use crate::array::{Element, Layout, Opcode, Shape, StorageBuffer};
use crate::error::ArrayResult;
use crate::lazy::{EvalMode, LazyGraph, NodeHandle, NodeId};

use super::{Accessor, AccessorKind, Operand};

/// Accessor standing for one node of a [`LazyGraph`].
///
/// Element reads and `evaluate` materialise the node; `set` materialises it and writes through to
/// the cached result, so every holder of the node observes the write.
pub struct LazyAccessor<T: Element> {
    node: NodeHandle<T>,
}

impl<T: Element> LazyAccessor<T> {
    pub fn new(node: NodeHandle<T>) -> Self {
        LazyAccessor { node }
    }

    pub fn node(&self) -> &NodeHandle<T> {
        &self.node
    }

    pub fn graph(&self) -> &Arc<LazyGraph<T>> {
        self.node.graph()
    }
}

impl<T: Element> Accessor<T> for LazyAccessor<T> {
    fn kind(&self) -> AccessorKind {
        AccessorKind::Lazy
    }

    fn get(&self, layout: &Layout, index: &[usize]) -> ArrayResult<T> {
        self.node.materialize()?.get(layout, index)
    }

    fn set(&self, layout: &Layout, index: &[usize], value: T) -> ArrayResult<()> {
        self.node.materialize()?.set(layout, index, value)
    }

    fn evaluate(&self) -> ArrayResult<Arc<StorageBuffer<T>>> {
        self.node.materialize()?.evaluate()
    }

    fn apply(
        &self,
        op: Opcode,
        shape: &Shape,
        operands: &[Operand<'_, T>],
    ) -> ArrayResult<Arc<dyn Accessor<T>>> {
        let graph = self.node.graph();
        let node = graph.record(op, shape.clone(), operands)?;
        if graph.mode() == EvalMode::Eager {
            node.materialize()?;
        }
        Ok(Arc::new(LazyAccessor::new(node)))
    }

    fn lazy_node(&self) -> Option<(&Arc<LazyGraph<T>>, NodeId)> {
        Some((self.node.graph(), self.node.id()))
    }
}

impl<T: Element> fmt::Debug for LazyAccessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyAccessor")
            .field("node", &self.node)
            .finish()
    }
}
