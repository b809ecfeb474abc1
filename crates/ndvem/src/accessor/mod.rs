//! Accessor strategies that mediate element access and evaluation for an array.
//!
//! An [`NdArray`](crate::NdArray) owns only layout metadata; every read, write and operation is
//! forwarded to the `Arc<dyn Accessor<T>>` it holds. Four strategies exist:
//!
//! ```text
//! Direct  -- checked reads/writes on a shared StorageBuffer
//! Unsafe  -- same storage, raw-pointer inner loops for bulk operations
//! Lazy    -- a node in a LazyGraph, materialised on demand
//! Remote  -- an allocation inside the external vector engine
//! ```
//!
//! Callers select behaviour through [`Accessor::supports`], never by downcasting.

mod direct;
mod lazy;
mod raw;
mod remote;

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::array::kernel::{KernelError, KernelInput};
use crate::array::{Element, Layout, Opcode, Shape, StorageBuffer};
use crate::error::{ArrayError, ArrayResult};
use crate::lazy::{LazyGraph, NodeId};
use crate::vem::RemoteBinding;

pub use direct::DirectAccessor;
pub use lazy::LazyAccessor;
pub use raw::{unsafe_supported, UnsafeAccessor};
pub use remote::RemoteAccessor;

/// Concrete strategy behind an accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessorKind {
    Direct,
    Unsafe,
    Lazy,
    Remote,
}

impl AccessorKind {
    pub fn name(self) -> &'static str {
        match self {
            AccessorKind::Direct => "direct",
            AccessorKind::Unsafe => "unsafe",
            AccessorKind::Lazy => "lazy",
            AccessorKind::Remote => "remote",
        }
    }
}

impl fmt::Display for AccessorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Optional behaviours an accessor may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Bulk operations run raw-pointer inner loops.
    Unsafe,
    /// Operations are deferred into a dependency graph.
    Lazy,
    /// Data lives in the external engine's address space.
    Remote,
}

/// One operand of an operation: the accessor plus the view of it being consumed.
#[derive(Clone, Copy)]
pub struct Operand<'a, T: Element> {
    pub layout: &'a Layout,
    pub accessor: &'a Arc<dyn Accessor<T>>,
}

impl<'a, T: Element> Operand<'a, T> {
    pub fn new(layout: &'a Layout, accessor: &'a Arc<dyn Accessor<T>>) -> Self {
        Operand { layout, accessor }
    }
}

/// Operand of one step of a batched plan.
pub enum PlanInput<T: Element> {
    /// An already materialised accessor, read through `layout`.
    Ready {
        accessor: Arc<dyn Accessor<T>>,
        layout: Layout,
    },
    /// The result of an earlier step of the same plan.
    Step { index: usize, layout: Layout },
}

/// One operation of a batched plan, producing a contiguous result of `shape`.
pub struct PlanStep<T: Element> {
    pub op: Opcode,
    pub shape: Shape,
    pub inputs: SmallVec<[PlanInput<T>; 2]>,
}

/// What a batched plan produced.
pub struct PlanOutcome<T: Element> {
    /// Results of the leading steps that completed, in plan order.
    pub results: Vec<Arc<dyn Accessor<T>>>,
    /// The step that failed and why. Steps after it did not run.
    pub failure: Option<(usize, ArrayError)>,
}

/// Strategy object that reads, writes and evaluates the elements of one storage allocation.
///
/// Layouts are supplied by the caller on every call; an accessor may be shared by any number of
/// views with different layouts.
pub trait Accessor<T: Element>: Send + Sync + fmt::Debug {
    /// Returns the strategy implemented by this accessor.
    fn kind(&self) -> AccessorKind;

    /// Returns `true` when the accessor offers `capability`.
    fn supports(&self, capability: Capability) -> bool {
        matches!(
            (self.kind(), capability),
            (AccessorKind::Unsafe, Capability::Unsafe)
                | (AccessorKind::Lazy, Capability::Lazy)
                | (AccessorKind::Remote, Capability::Remote)
        )
    }

    /// Reads the element at `index` of the view described by `layout`.
    fn get(&self, layout: &Layout, index: &[usize]) -> ArrayResult<T>;

    /// Writes the element at `index` of the view described by `layout`.
    fn set(&self, layout: &Layout, index: &[usize], value: T) -> ArrayResult<()>;

    /// Materialises the accessor and returns the host buffer its layouts index into.
    fn evaluate(&self) -> ArrayResult<Arc<StorageBuffer<T>>>;

    /// Runs `op` over `operands`, producing a new contiguous accessor of `shape`.
    ///
    /// `self` is the accessor of the first operand and decides the execution strategy.
    fn apply(
        &self,
        op: Opcode,
        shape: &Shape,
        operands: &[Operand<'_, T>],
    ) -> ArrayResult<Arc<dyn Accessor<T>>>;

    /// Runs a dependency-ordered plan in one call, or returns `None` to have the caller
    /// evaluate it step by step.
    ///
    /// `self` is the accessor of the first operand of the first step.
    fn apply_plan(&self, _steps: &[PlanStep<T>]) -> Option<PlanOutcome<T>> {
        None
    }

    /// Graph membership of a lazy accessor.
    fn lazy_node(&self) -> Option<(&Arc<LazyGraph<T>>, NodeId)> {
        None
    }

    /// Engine-side allocation of a remote accessor that is still bound to its engine.
    fn remote_binding(&self) -> Option<RemoteBinding> {
        None
    }
}

/// Evaluates every operand to a host buffer.
pub(crate) fn operand_buffers<T: Element>(
    operands: &[Operand<'_, T>],
) -> ArrayResult<SmallVec<[Arc<StorageBuffer<T>>; 2]>> {
    operands.iter().map(|op| op.accessor.evaluate()).collect()
}

/// Locks each distinct buffer once and runs `driver` over the operand views.
pub(crate) fn run_kernel<T, F>(
    op: Opcode,
    shape: &Shape,
    buffers: &[Arc<StorageBuffer<T>>],
    layouts: &[&Layout],
    driver: F,
) -> Result<Vec<T>, KernelError>
where
    T: Element,
    F: FnOnce(Opcode, &Shape, &[KernelInput<'_, T>]) -> Result<Vec<T>, KernelError>,
{
    let mut unique: SmallVec<[&Arc<StorageBuffer<T>>; 2]> = SmallVec::new();
    let mut slots: SmallVec<[usize; 2]> = SmallVec::new();
    for buffer in buffers {
        match unique.iter().position(|seen| seen.id() == buffer.id()) {
            Some(slot) => slots.push(slot),
            None => {
                slots.push(unique.len());
                unique.push(buffer);
            }
        }
    }
    let guards: SmallVec<[_; 2]> = unique.iter().map(|buffer| buffer.read()).collect();
    let inputs: SmallVec<[KernelInput<'_, T>; 2]> = slots
        .iter()
        .zip(layouts)
        .map(|(&slot, layout)| KernelInput::new(guards[slot].as_slice(), layout))
        .collect();
    driver(op, shape, &inputs)
}
