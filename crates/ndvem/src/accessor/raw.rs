use std::fmt;
use std::sync::Arc;

use crate::array::kernel::eval_raw;
use crate::array::{Element, Layout, Opcode, Shape, StorageBuffer};
use crate::error::{ArrayError, ArrayResult};
use crate::factory::Settings;

use super::{operand_buffers, run_kernel, Accessor, AccessorKind, Operand};

/// Returns `true` when this build carries the raw-memory accessor.
pub fn unsafe_supported() -> bool {
    cfg!(not(feature = "safe-only"))
}

/// Raw-memory accessor.
///
/// Element reads and writes skip per-coordinate validation; the flat offset is still checked
/// against the buffer so a bad index can not touch memory outside it. Bulk operations run the
/// pointer-walking kernel.
pub struct UnsafeAccessor<T: Element> {
    buffer: Arc<StorageBuffer<T>>,
}

impl<T: Element> UnsafeAccessor<T> {
    /// Fails with [`ArrayError::Unsupported`] when raw access is disabled or compiled out.
    pub fn new(buffer: Arc<StorageBuffer<T>>, settings: &Settings) -> ArrayResult<Self> {
        if !unsafe_supported() {
            return Err(ArrayError::unsupported(
                "raw-memory accessors are not available in safe-only builds",
            ));
        }
        if settings.unsafe_disabled {
            return Err(ArrayError::unsupported("raw-memory accessors are disabled"));
        }
        Ok(UnsafeAccessor { buffer })
    }

    pub fn zeroed(shape: &Shape, settings: &Settings) -> ArrayResult<Self> {
        Self::new(
            Arc::new(StorageBuffer::zeroed(shape.num_elements())),
            settings,
        )
    }

    pub fn buffer(&self) -> &Arc<StorageBuffer<T>> {
        &self.buffer
    }

    fn flat_offset(&self, layout: &Layout, index: &[usize]) -> ArrayResult<usize> {
        layout
            .flat_offset(index)
            .ok_or_else(|| layout.index_error(index))
    }
}

impl<T: Element> Accessor<T> for UnsafeAccessor<T> {
    fn kind(&self) -> AccessorKind {
        AccessorKind::Unsafe
    }

    fn get(&self, layout: &Layout, index: &[usize]) -> ArrayResult<T> {
        let offset = self.flat_offset(layout, index)?;
        self.buffer
            .get(offset)
            .ok_or_else(|| layout.index_error(index))
    }

    fn set(&self, layout: &Layout, index: &[usize], value: T) -> ArrayResult<()> {
        let offset = self.flat_offset(layout, index)?;
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
        let out =
            run_kernel(op, shape, &buffers, &layouts, eval_raw).map_err(ArrayError::eager)?;
        // Results inherit the strategy that produced them; `self` already passed the toggle.
        Ok(Arc::new(UnsafeAccessor {
            buffer: Arc::new(StorageBuffer::from_vec(out)),
        }))
    }
}

impl<T: Element> fmt::Debug for UnsafeAccessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsafeAccessor")
            .field("buffer", &self.buffer)
            .finish()
    }
}

#[cfg(all(test, not(feature = "safe-only")))]
mod tests {
    use super::*;
    use crate::accessor::Capability;

    #[test]
    fn construction_respects_the_toggle() {
        let disabled = Settings {
            unsafe_disabled: true,
        };
        let err = UnsafeAccessor::<f32>::zeroed(&Shape::new([3]), &disabled).unwrap_err();
        assert!(matches!(err, ArrayError::Unsupported(_)));
        let accessor = UnsafeAccessor::<f32>::zeroed(&Shape::new([3]), &Settings::default())
            .unwrap();
        assert!(accessor.supports(Capability::Unsafe));
        assert!(!accessor.supports(Capability::Lazy));
    }

    #[test]
    fn flat_offset_is_still_checked() {
        let accessor =
            UnsafeAccessor::<i64>::zeroed(&Shape::new([2, 2]), &Settings::default()).unwrap();
        let layout = Layout::contiguous(Shape::new([2, 2]));
        accessor.set(&layout, &[1, 1], 9).unwrap();
        assert_eq!(accessor.get(&layout, &[1, 1]).unwrap(), 9);
        // (0, 3) is not a valid coordinate but maps to offset 3, which is inside the buffer.
        assert_eq!(accessor.get(&layout, &[0, 3]).unwrap(), 9);
        assert!(matches!(
            accessor.get(&layout, &[2, 1]),
            Err(ArrayError::Index { .. })
        ));
    }

    #[test]
    fn overflowing_coordinates_are_index_errors() {
        let accessor =
            UnsafeAccessor::<f64>::zeroed(&Shape::new([3, 4]), &Settings::default()).unwrap();
        let layout = Layout::contiguous(Shape::new([3, 4]));
        let huge = [usize::MAX / 2, 0];
        assert_eq!(
            accessor.get(&layout, &huge).unwrap_err(),
            ArrayError::Index {
                index: huge.to_vec(),
                shape: vec![3, 4]
            }
        );
        assert!(matches!(
            accessor.set(&layout, &[0, usize::MAX], 1.0),
            Err(ArrayError::Index { .. })
        ));
    }
}
