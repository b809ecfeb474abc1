use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::accessor::{Accessor, AccessorKind, Capability, DirectAccessor, Operand};
use crate::error::{ArrayError, ArrayResult};
use crate::factory::ArrayContext;

use super::kernel::{KernelError, Opcode};
use super::shape::{for_each_index, Layout, Shape, Strides};
use super::storage::{Element, StorageBuffer};

/// N-dimensional array: a view layout over storage reached through an accessor.
///
/// Views share the accessor of the array they were taken from, so writes through one view are
/// visible through every other view of the same storage. Operations always produce a new
/// contiguous array whose accessor is chosen by the first operand.
pub struct NdArray<T: Element> {
    layout: Layout,
    accessor: Arc<dyn Accessor<T>>,
}

impl<T: Element> NdArray<T> {
    pub fn zeros(ctx: &ArrayContext<T>, shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let accessor = ctx.create(&shape);
        NdArray {
            layout: Layout::contiguous(shape),
            accessor,
        }
    }

    /// Array of `shape` over `data` in row-major order.
    pub fn from_vec(ctx: &ArrayContext<T>, shape: impl Into<Shape>, data: Vec<T>) -> ArrayResult<Self> {
        let shape = shape.into();
        if data.len() != shape.num_elements() {
            return Err(ArrayError::shape(format!(
                "{} values can not fill shape {shape}",
                data.len()
            )));
        }
        let accessor = ctx.wrap(&shape, data);
        Ok(NdArray {
            layout: Layout::contiguous(shape),
            accessor,
        })
    }

    pub fn full(ctx: &ArrayContext<T>, shape: impl Into<Shape>, value: T) -> Self {
        let shape = shape.into();
        let data = vec![value; shape.num_elements()];
        NdArray {
            accessor: ctx.wrap(&shape, data),
            layout: Layout::contiguous(shape),
        }
    }

    /// Fills each element from its index tuple.
    pub fn from_fn(
        ctx: &ArrayContext<T>,
        shape: impl Into<Shape>,
        mut f: impl FnMut(&[usize]) -> T,
    ) -> Self {
        let shape = shape.into();
        let mut data = Vec::with_capacity(shape.num_elements());
        for_each_index(&shape, |index| data.push(f(index)));
        NdArray {
            accessor: ctx.wrap(&shape, data),
            layout: Layout::contiguous(shape),
        }
    }

    /// `0, 1, 2, ...` laid out over `shape`.
    pub fn arange(ctx: &ArrayContext<T>, shape: impl Into<Shape>) -> Self {
        let mut next = 0.0;
        Self::from_fn(ctx, shape, |_| {
            let value = T::from_f64(next);
            next += 1.0;
            value
        })
    }

    /// Wraps an accessor directly. The layout must stay inside the accessor's storage.
    pub fn from_parts(layout: Layout, accessor: Arc<dyn Accessor<T>>) -> Self {
        NdArray { layout, accessor }
    }

    pub fn shape(&self) -> &Shape {
        self.layout.shape()
    }

    pub fn strides(&self) -> &Strides {
        self.layout.strides()
    }

    pub fn offset(&self) -> usize {
        self.layout.offset()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn rank(&self) -> usize {
        self.layout.rank()
    }

    pub fn len(&self) -> usize {
        self.layout.num_elements()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn accessor(&self) -> &Arc<dyn Accessor<T>> {
        &self.accessor
    }

    pub fn kind(&self) -> AccessorKind {
        self.accessor.kind()
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.accessor.supports(capability)
    }

    pub fn get(&self, index: &[usize]) -> ArrayResult<T> {
        self.accessor.get(&self.layout, index)
    }

    pub fn set(&self, index: &[usize], value: T) -> ArrayResult<()> {
        self.accessor.set(&self.layout, index, value)
    }

    fn view(&self, layout: Layout) -> Self {
        NdArray {
            layout,
            accessor: Arc::clone(&self.accessor),
        }
    }

    /// Reverses the axis order.
    pub fn transpose(&self) -> Self {
        self.view(self.layout.transpose())
    }

    pub fn permute(&self, axes: &[usize]) -> ArrayResult<Self> {
        Ok(self.view(self.layout.permute(axes)?))
    }

    /// New shape over the same elements; only contiguous views can be reshaped.
    pub fn reshape(&self, shape: impl Into<Shape>) -> ArrayResult<Self> {
        Ok(self.view(self.layout.reshape(shape.into())?))
    }

    pub fn slice(&self, axis: usize, start: usize, end: usize, step: usize) -> ArrayResult<Self> {
        Ok(self.view(self.layout.slice(axis, start, end, step)?))
    }

    pub fn broadcast_to(&self, shape: impl Into<Shape>) -> ArrayResult<Self> {
        Ok(self.view(self.layout.broadcast_to(&shape.into())?))
    }

    /// Applies `op` to `self` followed by `others`, broadcasting all operands to a common shape.
    pub fn apply(&self, op: Opcode, others: &[&NdArray<T>]) -> ArrayResult<Self> {
        let given = others.len() + 1;
        if given != op.arity() {
            return Err(ArrayError::eager(KernelError::Arity { op, given }));
        }
        let mut shape = self.shape().clone();
        for other in others {
            shape = shape.broadcast_with(other.shape()).ok_or_else(|| {
                ArrayError::shape(format!(
                    "{} operands {} and {} do not broadcast",
                    op.name(),
                    shape,
                    other.shape()
                ))
            })?;
        }
        let mut layouts: SmallVec<[Layout; 2]> = SmallVec::new();
        layouts.push(self.layout.broadcast_to(&shape)?);
        for other in others {
            layouts.push(other.layout.broadcast_to(&shape)?);
        }
        let accessors = std::iter::once(&self.accessor).chain(others.iter().map(|o| &o.accessor));
        let operands: SmallVec<[Operand<'_, T>; 2]> = layouts
            .iter()
            .zip(accessors)
            .map(|(layout, accessor)| Operand::new(layout, accessor))
            .collect();
        let accessor = self.accessor.apply(op, &shape, &operands)?;
        Ok(NdArray {
            layout: Layout::contiguous(shape),
            accessor,
        })
    }

    pub fn add(&self, other: &NdArray<T>) -> ArrayResult<Self> {
        self.apply(Opcode::Add, &[other])
    }

    pub fn sub(&self, other: &NdArray<T>) -> ArrayResult<Self> {
        self.apply(Opcode::Subtract, &[other])
    }

    pub fn mul(&self, other: &NdArray<T>) -> ArrayResult<Self> {
        self.apply(Opcode::Multiply, &[other])
    }

    pub fn div(&self, other: &NdArray<T>) -> ArrayResult<Self> {
        self.apply(Opcode::Divide, &[other])
    }

    pub fn maximum(&self, other: &NdArray<T>) -> ArrayResult<Self> {
        self.apply(Opcode::Maximum, &[other])
    }

    pub fn minimum(&self, other: &NdArray<T>) -> ArrayResult<Self> {
        self.apply(Opcode::Minimum, &[other])
    }

    pub fn neg(&self) -> ArrayResult<Self> {
        self.apply(Opcode::Negate, &[])
    }

    pub fn abs(&self) -> ArrayResult<Self> {
        self.apply(Opcode::Absolute, &[])
    }

    /// Contiguous copy with the same accessor strategy.
    pub fn copy(&self) -> ArrayResult<Self> {
        self.apply(Opcode::Identity, &[])
    }

    /// Materialises the array and returns the buffer its layout indexes into.
    pub fn evaluate(&self) -> ArrayResult<Arc<StorageBuffer<T>>> {
        self.accessor.evaluate()
    }

    /// Elements in logical row-major order.
    pub fn to_vec(&self) -> ArrayResult<Vec<T>> {
        let buffer = self.evaluate()?;
        let data = buffer.read();
        if !self.layout.fits(data.len()) {
            return Err(ArrayError::shape(format!(
                "view {} reaches past a {}-element buffer",
                self.shape(),
                data.len()
            )));
        }
        let mut out = Vec::with_capacity(self.len());
        for_each_index(self.shape(), |index| {
            out.push(data[self.layout.offset_of(index)]);
        });
        Ok(out)
    }

    /// Contiguous Direct-backed copy, detached from any graph or engine.
    pub fn to_direct(&self) -> ArrayResult<Self> {
        let data = self.to_vec()?;
        Ok(NdArray {
            layout: Layout::contiguous(self.shape().clone()),
            accessor: Arc::new(DirectAccessor::from_vec(data)),
        })
    }

    /// `true` when both arrays read from the same storage.
    pub fn shares_storage(&self, other: &NdArray<T>) -> bool {
        if same_accessor(&self.accessor, &other.accessor) {
            return true;
        }
        if self.supports(Capability::Remote) || other.supports(Capability::Remote) {
            return false;
        }
        match (self.evaluate(), other.evaluate()) {
            (Ok(a), Ok(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

fn same_accessor<T: Element>(a: &Arc<dyn Accessor<T>>, b: &Arc<dyn Accessor<T>>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl<T: Element> Clone for NdArray<T> {
    fn clone(&self) -> Self {
        self.view(self.layout.clone())
    }
}

impl<T: Element> fmt::Debug for NdArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NdArray")
            .field("dtype", &T::DTYPE)
            .field("shape", self.shape())
            .field("strides", self.strides())
            .field("offset", &self.offset())
            .field("accessor", &self.accessor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arange_transpose_shares_the_buffer() {
        let ctx = ArrayContext::<f64>::direct();
        let a = NdArray::arange(&ctx, [3, 4]);
        let t = a.transpose();
        assert_eq!(t.shape().dims(), &[4, 3]);
        for i in 0..4 {
            for j in 0..3 {
                assert_eq!(t.get(&[i, j]).unwrap(), a.get(&[j, i]).unwrap());
            }
        }
        assert!(a.shares_storage(&t));
        assert_eq!(a.evaluate().unwrap().id(), t.evaluate().unwrap().id());
    }

    #[test]
    fn writes_through_a_view_are_visible_in_the_base() {
        let ctx = ArrayContext::<i32>::direct();
        let a = NdArray::zeros(&ctx, [2, 3]);
        let column = a.slice(1, 2, 3, 1).unwrap();
        column.set(&[1, 0], 7).unwrap();
        assert_eq!(a.get(&[1, 2]).unwrap(), 7);
        assert_eq!(a.to_vec().unwrap(), vec![0, 0, 0, 0, 0, 7]);
    }

    #[test]
    fn binary_ops_broadcast() {
        let ctx = ArrayContext::<i64>::direct();
        let m = NdArray::arange(&ctx, [2, 3]);
        let row = NdArray::from_vec(&ctx, [3], vec![10, 20, 30]).unwrap();
        let sum = m.add(&row).unwrap();
        assert_eq!(sum.to_vec().unwrap(), vec![10, 21, 32, 13, 24, 35]);
        let bad = NdArray::from_vec(&ctx, [2], vec![1, 2]).unwrap();
        assert!(matches!(m.add(&bad), Err(ArrayError::Shape(_))));
    }

    #[test]
    fn from_vec_checks_length() {
        let ctx = ArrayContext::<f32>::direct();
        assert!(matches!(
            NdArray::from_vec(&ctx, [2, 2], vec![1.0; 3]),
            Err(ArrayError::Shape(_))
        ));
    }

    #[test]
    fn reshape_of_transposed_view_is_rejected() {
        let ctx = ArrayContext::<f32>::direct();
        let a = NdArray::arange(&ctx, [2, 3]);
        assert!(a.reshape([3, 2]).is_ok());
        assert!(matches!(a.transpose().reshape([6]), Err(ArrayError::Shape(_))));
        assert_eq!(a.transpose().copy().unwrap().reshape([6]).unwrap().to_vec().unwrap(), vec![
            0.0, 3.0, 1.0, 4.0, 2.0, 5.0
        ]);
    }
}
