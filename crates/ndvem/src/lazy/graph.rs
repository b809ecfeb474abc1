use std::collections::{HashMap, HashSet};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use smallvec::SmallVec;

use crate::accessor::{Accessor, Capability, DirectAccessor, Operand, PlanInput, PlanStep};
use crate::array::{Element, KernelError, Layout, Opcode, Shape};
use crate::error::{ArrayError, ArrayResult};

use super::state::{
    GraphInner, GraphStats, NodeId, NodeInput, NodeOp, NodeRecord, NodeState, NodeStatus,
};

static GRAPH_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// When recorded nodes are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// Evaluate when a result is observed.
    Deferred,
    /// Evaluate every node right after it is recorded.
    Eager,
}

impl EvalMode {
    /// `Eager` when `NDVEM_EAGER` is truthy.
    pub fn from_env() -> Self {
        if crate::env::eager_enabled() {
            EvalMode::Eager
        } else {
            EvalMode::Deferred
        }
    }
}

/// Arena of deferred operations shared by every lazy accessor created from one factory.
///
/// Nodes are addressed by [`NodeId`] and may only reference nodes recorded before them, so the
/// graph is acyclic by construction. Materialising a node walks its pending ancestors in
/// dependency order, evaluates each one once and caches the resulting accessor on the node.
/// When the accessor behind the first operand can run the whole walk in one call, it receives
/// the walk as a single plan.
///
/// Collected nodes hand their slot back to the arena, so the arena grows with the number of
/// nodes alive at once rather than with the number ever recorded.
pub struct LazyGraph<T: Element> {
    id: usize,
    mode: EvalMode,
    inner: Mutex<GraphInner<T>>,
}

enum Work<T: Element> {
    Import(Arc<dyn Accessor<T>>),
    Apply(Opcode),
}

impl<T: Element> LazyGraph<T> {
    pub fn new() -> Arc<Self> {
        Self::with_mode(EvalMode::from_env())
    }

    pub fn with_mode(mode: EvalMode) -> Arc<Self> {
        Arc::new(LazyGraph {
            id: GRAPH_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            mode,
            inner: Mutex::new(GraphInner::new()),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn mode(&self) -> EvalMode {
        self.mode
    }

    fn lock(&self) -> MutexGuard<'_, GraphInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adopts a concrete accessor as a ready leaf node.
    ///
    /// Lazy accessors from other graphs become import nodes that are resolved on demand.
    pub fn leaf(self: &Arc<Self>, accessor: Arc<dyn Accessor<T>>, shape: Shape) -> NodeHandle<T> {
        let record = if accessor.supports(Capability::Lazy) {
            NodeRecord {
                op: NodeOp::Import(accessor),
                inputs: SmallVec::new(),
                shape,
                state: NodeState::Pending,
                refs: 1,
            }
        } else {
            NodeRecord {
                op: NodeOp::Leaf,
                inputs: SmallVec::new(),
                shape,
                state: NodeState::Ready(accessor),
                refs: 1,
            }
        };
        let id = self.lock().push(record);
        NodeHandle {
            graph: Arc::clone(self),
            id,
        }
    }

    /// Appends an operation node. Operands that are not nodes of this graph are imported first.
    pub fn record(
        self: &Arc<Self>,
        op: Opcode,
        shape: Shape,
        operands: &[Operand<'_, T>],
    ) -> ArrayResult<NodeHandle<T>> {
        if operands.len() != op.arity() {
            return Err(ArrayError::eager(KernelError::Arity {
                op,
                given: operands.len(),
            }));
        }
        let mut imports: SmallVec<[NodeHandle<T>; 2]> = SmallVec::new();
        let mut inputs: SmallVec<[NodeInput; 2]> = SmallVec::new();
        for operand in operands {
            let node = match operand.accessor.lazy_node() {
                Some((graph, id)) if Arc::ptr_eq(graph, self) => id,
                _ => {
                    let handle = self.leaf(
                        Arc::clone(operand.accessor),
                        operand.layout.shape().clone(),
                    );
                    let id = handle.id();
                    imports.push(handle);
                    id
                }
            };
            inputs.push(NodeInput {
                node,
                layout: operand.layout.clone(),
            });
        }
        let id = self.lock().push(NodeRecord {
            op: NodeOp::Apply(op),
            inputs,
            shape,
            state: NodeState::Pending,
            refs: 1,
        });
        log::trace!("lazy graph {} recorded {} as node {}", self.id, op.name(), id.index());
        // Import handles drop here; the new node keeps the leaves reachable.
        drop(imports);
        Ok(NodeHandle {
            graph: Arc::clone(self),
            id,
        })
    }

    /// Evaluates `id` and every pending ancestor, returning the node's concrete accessor.
    pub fn materialize(&self, id: NodeId) -> ArrayResult<Arc<dyn Accessor<T>>> {
        let order = {
            let inner = self.lock();
            let record = inner.get(id).ok_or_else(|| collected(id))?;
            if let NodeState::Ready(accessor) = &record.state {
                return Ok(Arc::clone(accessor));
            }
            plan(&inner, id)?
        };
        log::debug!(
            "lazy graph {} materialising node {} ({} pending)",
            self.id,
            id.index(),
            order.len()
        );
        if order.len() > 1 {
            if let Some(Err(err)) = self.evaluate_batch(&order) {
                return Err(err);
            }
        }
        // Nodes a plan already completed are skipped here.
        for node in &order {
            self.evaluate_node(*node)?;
        }
        self.collect();
        match self.lock().get(id).map(|record| &record.state) {
            Some(NodeState::Ready(accessor)) => Ok(Arc::clone(accessor)),
            Some(NodeState::Failed(err)) => Err(err.clone()),
            _ => Err(collected(id)),
        }
    }

    /// Offers `order` as one plan to the accessor behind its first operand.
    ///
    /// Returns `None` when the plan contains imports or the accessor declines it.
    fn evaluate_batch(&self, order: &[NodeId]) -> Option<ArrayResult<()>> {
        let steps = {
            let inner = self.lock();
            let position: HashMap<NodeId, usize> = order
                .iter()
                .enumerate()
                .map(|(index, &id)| (id, index))
                .collect();
            let mut steps = Vec::with_capacity(order.len());
            for &id in order {
                let record = inner.get(id)?;
                let NodeOp::Apply(op) = &record.op else {
                    return None;
                };
                let mut inputs = SmallVec::new();
                for input in &record.inputs {
                    let layout = input.layout.clone();
                    let planned = match position.get(&input.node) {
                        Some(&index) => PlanInput::Step { index, layout },
                        None => match &inner.get(input.node)?.state {
                            NodeState::Ready(accessor) => PlanInput::Ready {
                                accessor: Arc::clone(accessor),
                                layout,
                            },
                            _ => return None,
                        },
                    };
                    inputs.push(planned);
                }
                steps.push(PlanStep {
                    op: *op,
                    shape: record.shape.clone(),
                    inputs,
                });
            }
            steps
        };
        let driver = match steps.first()?.inputs.first()? {
            PlanInput::Ready { accessor, .. } => Arc::clone(accessor),
            PlanInput::Step { .. } => return None,
        };
        let outcome = driver.apply_plan(&steps)?;
        log::debug!(
            "lazy graph {} ran {} of {} nodes as one plan",
            self.id,
            outcome.results.len(),
            steps.len()
        );
        drop(steps);

        let mut inner = self.lock();
        for (&id, accessor) in order.iter().zip(outcome.results) {
            complete(&mut inner, id, accessor);
        }
        match outcome.failure {
            Some((step, err)) => {
                let err = match order.get(step) {
                    Some(&id) => fail(&mut inner, id, err),
                    None => err,
                };
                log::debug!("lazy graph {} plan failed: {err}", self.id);
                Some(Err(err))
            }
            None => Some(Ok(())),
        }
    }

    fn evaluate_node(&self, id: NodeId) -> ArrayResult<()> {
        let (work, shape, inputs) = {
            let inner = self.lock();
            let record = inner.get(id).ok_or_else(|| collected(id))?;
            match &record.state {
                NodeState::Pending => {}
                NodeState::Failed(err) => return Err(err.clone()),
                NodeState::Ready(_) => return Ok(()),
            }
            let inputs = record
                .inputs
                .iter()
                .map(|input| match inner.get(input.node).map(|node| &node.state) {
                    Some(NodeState::Ready(accessor)) => {
                        Ok((Arc::clone(accessor), input.layout.clone()))
                    }
                    Some(NodeState::Failed(err)) => Err(err.clone()),
                    _ => Err(collected(input.node)),
                })
                .collect::<ArrayResult<SmallVec<[(Arc<dyn Accessor<T>>, Layout); 2]>>>()?;
            let work = match &record.op {
                NodeOp::Import(accessor) => Work::Import(Arc::clone(accessor)),
                NodeOp::Apply(op) => Work::Apply(*op),
                NodeOp::Leaf => return Ok(()),
            };
            (work, record.shape.clone(), inputs)
        };

        // The graph lock is released while user-visible work runs.
        let result = match work {
            Work::Import(accessor) => accessor
                .evaluate()
                .map(|buffer| Arc::new(DirectAccessor::new(buffer)) as Arc<dyn Accessor<T>>),
            Work::Apply(op) => {
                let operands: SmallVec<[Operand<'_, T>; 2]> = inputs
                    .iter()
                    .map(|(accessor, layout)| Operand::new(layout, accessor))
                    .collect();
                match operands.first() {
                    Some(first) => first.accessor.apply(op, &shape, &operands),
                    None => Err(ArrayError::eager(KernelError::Arity { op, given: 0 })),
                }
            }
        };

        let mut inner = self.lock();
        match result {
            Ok(accessor) => {
                complete(&mut inner, id, accessor);
                Ok(())
            }
            Err(err) => {
                let err = fail(&mut inner, id, err);
                log::debug!("lazy graph {} node {} failed: {err}", self.id, id.index());
                Err(err)
            }
        }
    }

    /// Removes every node unreachable from a referenced pending node and returns how many
    /// were removed.
    ///
    /// Ready and failed nodes keep their own result but no longer pin their inputs. Removed
    /// nodes free their slot for the next recorded node.
    pub fn collect(&self) -> usize {
        let mut released: Vec<NodeRecord<T>> = Vec::new();
        {
            let mut inner = self.lock();
            if !mem::replace(&mut inner.dirty, false) {
                return 0;
            }
            let mut live = vec![false; inner.slot_count()];
            let mut stack: Vec<NodeId> = inner
                .occupied()
                .filter(|(_, record)| record.refs > 0)
                .map(|(id, _)| id)
                .collect();
            while let Some(id) = stack.pop() {
                if mem::replace(&mut live[id.index()], true) {
                    continue;
                }
                if let Some(record) = inner.get(id) {
                    if matches!(record.state, NodeState::Pending) {
                        stack.extend(record.inputs.iter().map(|input| input.node));
                    }
                }
            }
            let dead: Vec<NodeId> = inner
                .occupied()
                .filter(|(id, _)| !live[id.index()])
                .map(|(id, _)| id)
                .collect();
            released.extend(dead.into_iter().filter_map(|id| inner.remove(id)));
        }
        // Imported accessors may belong to other graphs; drop them without holding our lock.
        let count = released.len();
        drop(released);
        if count > 0 {
            log::trace!("lazy graph {} collected {count} nodes", self.id);
        }
        count
    }

    pub fn status(&self, id: NodeId) -> NodeStatus {
        self.lock()
            .get(id)
            .map_or(NodeStatus::Collected, |record| record.state.status())
    }

    /// Recorded result shape, or `None` once the node is collected.
    pub fn shape_of(&self, id: NodeId) -> Option<Shape> {
        self.lock().get(id).map(|record| record.shape.clone())
    }

    pub fn stats(&self) -> GraphStats {
        let inner = self.lock();
        let mut stats = GraphStats {
            slots: inner.slot_count(),
            collected: inner.collected,
            evaluations: inner.evaluations,
            ..GraphStats::default()
        };
        for (_, record) in inner.occupied() {
            stats.nodes += 1;
            match record.state.status() {
                NodeStatus::Pending => stats.pending += 1,
                NodeStatus::Ready => stats.ready += 1,
                NodeStatus::Failed => stats.failed += 1,
                NodeStatus::Collected => {}
            }
        }
        stats
    }

    fn retain(&self, id: NodeId) {
        if let Some(record) = self.lock().get_mut(id) {
            record.refs += 1;
        }
    }

    fn release(&self, id: NodeId) {
        let mut inner = self.lock();
        let Some(record) = inner.get_mut(id) else {
            return;
        };
        record.refs = record.refs.saturating_sub(1);
        if record.refs == 0 {
            inner.dirty = true;
        }
    }
}

impl<T: Element> fmt::Debug for LazyGraph<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyGraph")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Caches `accessor` on a pending node and drops its input edges.
fn complete<T: Element>(inner: &mut GraphInner<T>, id: NodeId, accessor: Arc<dyn Accessor<T>>) {
    let Some(record) = inner.get_mut(id) else {
        return;
    };
    if !matches!(record.state, NodeState::Pending) {
        return;
    }
    record.state = NodeState::Ready(accessor);
    record.inputs.clear();
    inner.evaluations += 1;
    inner.dirty = true;
}

/// Marks a node failed and returns `err` tagged with the node id.
fn fail<T: Element>(inner: &mut GraphInner<T>, id: NodeId, err: ArrayError) -> ArrayError {
    let err = attach_node(err, id);
    if let Some(record) = inner.get_mut(id) {
        record.state = NodeState::Failed(err.clone());
        record.inputs.clear();
        inner.dirty = true;
    }
    err
}

/// Post-order list of the pending nodes `target` depends on, `target` last.
fn plan<T: Element>(inner: &GraphInner<T>, target: NodeId) -> ArrayResult<Vec<NodeId>> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![(target, false)];
    while let Some((id, expanded)) = stack.pop() {
        let record = inner.get(id).ok_or_else(|| collected(id))?;
        match &record.state {
            NodeState::Pending => {}
            NodeState::Ready(_) => continue,
            NodeState::Failed(err) => return Err(err.clone()),
        }
        if expanded {
            order.push(id);
            continue;
        }
        if !visited.insert(id) {
            continue;
        }
        stack.push((id, true));
        for input in record.inputs.iter().rev() {
            if !visited.contains(&input.node) {
                stack.push((input.node, false));
            }
        }
    }
    Ok(order)
}

fn attach_node(err: ArrayError, id: NodeId) -> ArrayError {
    match err {
        ArrayError::Computation { node: None, source } => ArrayError::Computation {
            node: Some(id),
            source,
        },
        other => other,
    }
}

fn collected(id: NodeId) -> ArrayError {
    ArrayError::unsupported(format!("lazy node {} was already collected", id.index()))
}

/// Counted reference to a graph node; the node stays collectable only once every handle drops.
pub struct NodeHandle<T: Element> {
    graph: Arc<LazyGraph<T>>,
    id: NodeId,
}

impl<T: Element> NodeHandle<T> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn graph(&self) -> &Arc<LazyGraph<T>> {
        &self.graph
    }

    pub fn materialize(&self) -> ArrayResult<Arc<dyn Accessor<T>>> {
        self.graph.materialize(self.id)
    }

    pub fn status(&self) -> NodeStatus {
        self.graph.status(self.id)
    }
}

impl<T: Element> Clone for NodeHandle<T> {
    fn clone(&self) -> Self {
        self.graph.retain(self.id);
        NodeHandle {
            graph: Arc::clone(&self.graph),
            id: self.id,
        }
    }
}

impl<T: Element> Drop for NodeHandle<T> {
    fn drop(&mut self) {
        self.graph.release(self.id);
    }
}

impl<T: Element> fmt::Debug for NodeHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("graph", &self.graph.id)
            .field("node", &self.id.index())
            .field("generation", &self.id.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(graph: &Arc<LazyGraph<i32>>, data: Vec<i32>) -> NodeHandle<i32> {
        let shape = Shape::new([data.len()]);
        graph.leaf(Arc::new(DirectAccessor::from_vec(data)), shape)
    }

    fn record(
        graph: &Arc<LazyGraph<i32>>,
        op: Opcode,
        inputs: &[&NodeHandle<i32>],
    ) -> NodeHandle<i32> {
        let accessors: Vec<Arc<dyn Accessor<i32>>> = inputs
            .iter()
            .map(|handle| handle.materialize().unwrap())
            .collect();
        let shape = graph.shape_of(inputs[0].id()).unwrap();
        let layout = Layout::contiguous(shape.clone());
        let operands: Vec<Operand<'_, i32>> =
            accessors.iter().map(|a| Operand::new(&layout, a)).collect();
        graph.record(op, shape, &operands).unwrap()
    }

    #[test]
    fn materialisation_is_memoised() {
        let graph = LazyGraph::<i32>::with_mode(EvalMode::Deferred);
        let a = leaf(&graph, vec![1, 2]);
        let layout = Layout::contiguous(Shape::new([2]));
        let a_acc = a.materialize().unwrap();
        let b = graph
            .record(Opcode::Negate, Shape::new([2]), &[Operand::new(&layout, &a_acc)])
            .unwrap();
        assert_eq!(b.status(), NodeStatus::Pending);
        let out = b.materialize().unwrap();
        assert_eq!(out.evaluate().unwrap().to_vec(), vec![-1, -2]);
        assert_eq!(graph.stats().evaluations, 1);
        b.materialize().unwrap();
        assert_eq!(graph.stats().evaluations, 1);
    }

    #[test]
    fn failures_attach_the_node_id() {
        let graph = LazyGraph::<i32>::with_mode(EvalMode::Deferred);
        let a = leaf(&graph, vec![4, 8]);
        let z = leaf(&graph, vec![2, 0]);
        let q = record(&graph, Opcode::Divide, &[&a, &z]);
        let err = q.materialize().unwrap_err();
        assert_eq!(err.failed_node(), Some(q.id()));
        assert_eq!(q.status(), NodeStatus::Failed);
        assert_eq!(q.materialize().unwrap_err(), err);
    }

    #[test]
    fn dropped_handles_are_collected() {
        let graph = LazyGraph::<i32>::with_mode(EvalMode::Deferred);
        let a = leaf(&graph, vec![1]);
        let id = a.id();
        drop(a);
        assert_eq!(graph.collect(), 1);
        assert_eq!(graph.status(id), NodeStatus::Collected);
        assert_eq!(graph.shape_of(id), None);
        assert_eq!(graph.collect(), 0);
    }

    #[test]
    fn collected_slots_are_reused_under_a_new_generation() {
        let graph = LazyGraph::<i32>::with_mode(EvalMode::Deferred);
        let keep = leaf(&graph, vec![5]);
        let gone = leaf(&graph, vec![1]);
        let stale = gone.id();
        drop(gone);
        assert_eq!(graph.collect(), 1);

        let fresh = leaf(&graph, vec![2, 3]);
        assert_eq!(fresh.id().index(), stale.index());
        assert_ne!(fresh.id(), stale);
        assert_eq!(graph.status(stale), NodeStatus::Collected);
        assert_eq!(fresh.status(), NodeStatus::Ready);
        assert_eq!(graph.shape_of(fresh.id()), Some(Shape::new([2])));
        assert!(graph.materialize(stale).is_err());

        let stats = graph.stats();
        assert_eq!(stats.slots, 2);
        assert_eq!(stats.nodes, 2);
        assert_eq!(stats.collected, 1);
        assert_eq!(keep.status(), NodeStatus::Ready);
    }
}
