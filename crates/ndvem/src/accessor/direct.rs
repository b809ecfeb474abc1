use std::fmt;
use std::sync::Arc;

use crate::array::kernel::eval_checked;
use crate::array::{Element, Layout, Opcode, Shape, StorageBuffer};
use crate::error::{ArrayError, ArrayResult};

use super::{operand_buffers, run_kernel, Accessor, AccessorKind, Operand};

/// Managed accessor: every read and write is validated against the view and the buffer.
pub struct DirectAccessor<T: Element> {
    buffer: Arc<StorageBuffer<T>>,
}

impl<T: Element> DirectAccessor<T> {
    pub fn new(buffer: Arc<StorageBuffer<T>>) -> Self {
        DirectAccessor { buffer }
    }

    pub fn zeroed(shape: &Shape) -> Self {
        Self::new(Arc::new(StorageBuffer::zeroed(shape.num_elements())))
    }

    pub fn from_vec(data: Vec<T>) -> Self {
        Self::new(Arc::new(StorageBuffer::from_vec(data)))
    }

    pub fn buffer(&self) -> &Arc<StorageBuffer<T>> {
        &self.buffer
    }
}

impl<T: Element> Accessor<T> for DirectAccessor<T> {
    fn kind(&self) -> AccessorKind {
        AccessorKind::Direct
    }

    fn get(&self, layout: &Layout, index: &[usize]) -> ArrayResult<T> {
        let offset = layout.checked_offset(index)?;
        self.buffer
            .get(offset)
            .ok_or_else(|| layout.index_error(index))
    }

    fn set(&self, layout: &Layout, index: &[usize], value: T) -> ArrayResult<()> {
        let offset = layout.checked_offset(index)?;
        if self.buffer.set(offset, value) {
            Ok(())
        } else {
            Err(layout.index_error(index))
        }
    }

    fn evaluate(&self) -> ArrayResult<Arc<StorageBuffer<T>>> {
        Ok(Arc::clone(&self.buffer))
    }

    fn apply(
        &self,
        op: Opcode,
        shape: &Shape,
        operands: &[Operand<'_, T>],
    ) -> ArrayResult<Arc<dyn Accessor<T>>> {
        let buffers = operand_buffers(operands)?;
        let layouts: Vec<&Layout> = operands.iter().map(|o| o.layout).collect();
        let out = run_kernel(op, shape, &buffers, &layouts, eval_checked)
            .map_err(ArrayError::eager)?;
        Ok(Arc::new(DirectAccessor::from_vec(out)))
    }
}

impl<T: Element> fmt::Debug for DirectAccessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectAccessor")
            .field("buffer", &self.buffer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let accessor = DirectAccessor::<i32>::zeroed(&Shape::new([2, 3]));
        let layout = Layout::contiguous(Shape::new([2, 3]));
        accessor.set(&layout, &[1, 2], 42).unwrap();
        assert_eq!(accessor.get(&layout, &[1, 2]).unwrap(), 42);
        assert_eq!(accessor.buffer().to_vec(), vec![0, 0, 0, 0, 0, 42]);
    }

    #[test]
    fn out_of_range_index_is_an_index_error() {
        let accessor = DirectAccessor::<f32>::zeroed(&Shape::new([2, 3]));
        let layout = Layout::contiguous(Shape::new([2, 3]));
        let err = accessor.get(&layout, &[2, 0]).unwrap_err();
        assert_eq!(
            err,
            ArrayError::Index {
                index: vec![2, 0],
                shape: vec![2, 3]
            }
        );
        assert!(accessor.set(&layout, &[0, 3], 1.0).is_err());
    }

    #[test]
    fn layout_past_the_buffer_is_rejected() {
        let accessor = DirectAccessor::<f32>::zeroed(&Shape::new([4]));
        let layout = Layout::contiguous(Shape::new([8]));
        assert!(matches!(
            accessor.get(&layout, &[6]),
            Err(ArrayError::Index { .. })
        ));
    }
}
