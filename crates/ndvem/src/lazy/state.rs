//! Node bookkeeping shared by the lazy graph and its handles.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::accessor::Accessor;
use crate::array::{Element, Layout, Opcode, Shape};
use crate::error::ArrayError;

/// Slot of a node inside its [`LazyGraph`](super::LazyGraph).
///
/// Slots are reused once their node is collected; the generation tells a stale id apart from
/// the node that took its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: usize,
    generation: u64,
}

impl NodeId {
    pub fn index(self) -> usize {
        self.index
    }

    pub fn generation(self) -> u64 {
        self.generation
    }
}

/// Observable materialisation state of a node, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Ready,
    Failed,
    Collected,
}

/// What a node computes.
pub(super) enum NodeOp<T: Element> {
    /// Concrete accessor adopted as-is; born `Ready`.
    Leaf,
    /// Accessor owned by another graph; resolved by evaluating it.
    Import(Arc<dyn Accessor<T>>),
    Apply(Opcode),
}

pub(super) enum NodeState<T: Element> {
    Pending,
    Ready(Arc<dyn Accessor<T>>),
    Failed(ArrayError),
}

impl<T: Element> NodeState<T> {
    pub(super) fn status(&self) -> NodeStatus {
        match self {
            NodeState::Pending => NodeStatus::Pending,
            NodeState::Ready(_) => NodeStatus::Ready,
            NodeState::Failed(_) => NodeStatus::Failed,
        }
    }
}

/// One operand edge: the producing node and the view of its result being read.
#[derive(Clone)]
pub(super) struct NodeInput {
    pub(super) node: NodeId,
    pub(super) layout: Layout,
}

pub(super) struct NodeRecord<T: Element> {
    pub(super) op: NodeOp<T>,
    /// Only pending nodes keep their inputs.
    pub(super) inputs: SmallVec<[NodeInput; 2]>,
    pub(super) shape: Shape,
    pub(super) state: NodeState<T>,
    /// Live [`NodeHandle`](super::NodeHandle)s pointing at this node.
    pub(super) refs: usize,
}

struct Slot<T: Element> {
    generation: u64,
    record: Option<NodeRecord<T>>,
}

/// Arena contents guarded by the graph mutex.
pub(super) struct GraphInner<T: Element> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    pub(super) evaluations: u64,
    pub(super) collected: u64,
    /// Set when a node may have become unreachable since the last collection.
    pub(super) dirty: bool,
}

impl<T: Element> GraphInner<T> {
    pub(super) fn new() -> Self {
        GraphInner {
            slots: Vec::new(),
            free: Vec::new(),
            evaluations: 0,
            collected: 0,
            dirty: false,
        }
    }

    pub(super) fn push(&mut self, record: NodeRecord<T>) -> NodeId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.record = Some(record);
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len();
                self.slots.push(Slot {
                    generation: 0,
                    record: Some(record),
                });
                NodeId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    pub(super) fn get(&self, id: NodeId) -> Option<&NodeRecord<T>> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_ref())
    }

    pub(super) fn get_mut(&mut self, id: NodeId) -> Option<&mut NodeRecord<T>> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_mut())
    }

    /// Live nodes with their ids, in slot order.
    pub(super) fn occupied(&self) -> impl Iterator<Item = (NodeId, &NodeRecord<T>)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.record.as_ref().map(|record| {
                (
                    NodeId {
                        index,
                        generation: slot.generation,
                    },
                    record,
                )
            })
        })
    }

    /// Takes the node out of its slot and queues the slot for reuse under a new generation.
    pub(super) fn remove(&mut self, id: NodeId) -> Option<NodeRecord<T>> {
        let slot = self
            .slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)?;
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.collected += 1;
        Some(record)
    }

    pub(super) fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

/// Counters describing a graph at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphStats {
    /// Nodes currently held by the arena.
    pub nodes: usize,
    /// Arena slots, occupied or waiting for reuse.
    pub slots: usize,
    pub pending: usize,
    pub ready: usize,
    pub failed: usize,
    /// Nodes collected since the graph was created.
    pub collected: u64,
    /// Non-leaf nodes evaluated since the graph was created.
    pub evaluations: u64,
}
