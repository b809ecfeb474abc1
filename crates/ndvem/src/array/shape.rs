//! Shapes, strides and the layout descriptor that maps index tuples onto storage offsets.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{ArrayError, ArrayResult};

type Dims = SmallVec<[usize; 4]>;

/// Stores the logical dimensions of an array.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Dims,
}

impl Shape {
    /// Constructs a new shape from the provided dimensions. An empty list describes a scalar.
    pub fn new<D: AsRef<[usize]>>(dims: D) -> Self {
        Shape {
            dims: Dims::from_slice(dims.as_ref()),
        }
    }

    pub fn scalar() -> Self {
        Shape { dims: Dims::new() }
    }

    /// Borrow the raw dimension slice for downstream calculations.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the rank (number of axes) of the shape.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Computes the total number of elements implied by the shape.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Compute row-major (C-contiguous) strides for this shape.
    pub fn contiguous_strides(&self) -> Strides {
        let mut strides = Dims::from_elem(1, self.rank());
        for axis in (0..self.rank().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * self.dims[axis + 1];
        }
        Strides { steps: strides }
    }

    /// Returns the NumPy-style broadcast of two shapes, if they are compatible.
    pub fn broadcast_with(&self, other: &Shape) -> Option<Shape> {
        let rank = self.rank().max(other.rank());
        let mut result = Dims::from_elem(0, rank);
        for (axis, slot) in result.iter_mut().enumerate() {
            let lhs = aligned_dim(self, rank, axis);
            let rhs = aligned_dim(other, rank, axis);
            *slot = if lhs == rhs || rhs == 1 {
                lhs
            } else if lhs == 1 {
                rhs
            } else {
                return None;
            };
        }
        Some(Shape { dims: result })
    }
}

fn aligned_dim(shape: &Shape, rank: usize, axis: usize) -> usize {
    let lead = rank - shape.rank();
    if axis < lead {
        1
    } else {
        shape.dims[axis - lead]
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.dims.as_slice())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        if self.dims.len() == 1 {
            write!(f, ",")?;
        }
        write!(f, ")")
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape::new(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape::new(s)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(s: [usize; N]) -> Self {
        Shape::new(s)
    }
}

/// Per-axis element steps. A zero step repeats the same element along that axis.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Strides {
    steps: Dims,
}

impl Strides {
    pub fn new<S: AsRef<[usize]>>(steps: S) -> Self {
        Strides {
            steps: Dims::from_slice(steps.as_ref()),
        }
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.steps
    }

    /// Compute the flat offset of a multi-dimensional index, ignoring any base offset.
    pub fn index(&self, indices: &[usize]) -> usize {
        debug_assert_eq!(self.steps.len(), indices.len());
        self.steps.iter().zip(indices).map(|(s, i)| s * i).sum()
    }

    /// Like [`Strides::index`], but `None` when the offset does not fit in `usize`.
    pub fn checked_index(&self, indices: &[usize]) -> Option<usize> {
        self.steps
            .iter()
            .zip(indices)
            .try_fold(0usize, |acc, (&s, &i)| acc.checked_add(s.checked_mul(i)?))
    }
}

/// Shape, strides and base offset of an array view over a flat buffer.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Layout {
    shape: Shape,
    strides: Strides,
    offset: usize,
}

impl Layout {
    /// Row-major layout starting at offset zero.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.contiguous_strides();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    pub fn new(shape: Shape, strides: Strides, offset: usize) -> ArrayResult<Self> {
        if shape.rank() != strides.as_slice().len() {
            return Err(ArrayError::shape(format!(
                "shape {shape} has rank {} but {} strides were given",
                shape.rank(),
                strides.as_slice().len()
            )));
        }
        Ok(Layout {
            shape,
            strides,
            offset,
        })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &Strides {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn num_elements(&self) -> usize {
        self.shape.num_elements()
    }

    /// Maps an index tuple to a flat offset without any validation.
    pub fn offset_of(&self, index: &[usize]) -> usize {
        self.offset + self.strides.index(index)
    }

    /// Maps an index tuple of the right rank to a flat offset, without checking coordinates
    /// against the shape. `None` when the rank differs or the offset overflows.
    pub fn flat_offset(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.rank() {
            return None;
        }
        self.strides
            .checked_index(index)
            .and_then(|span| span.checked_add(self.offset))
    }

    /// Validates every coordinate against the shape and returns the flat offset.
    pub fn checked_offset(&self, index: &[usize]) -> ArrayResult<usize> {
        let in_bounds = index.len() == self.rank()
            && index
                .iter()
                .zip(self.shape.dims())
                .all(|(&i, &dim)| i < dim);
        if !in_bounds {
            return Err(self.index_error(index));
        }
        Ok(self.offset_of(index))
    }

    pub(crate) fn index_error(&self, index: &[usize]) -> ArrayError {
        ArrayError::Index {
            index: index.to_vec(),
            shape: self.shape.dims().to_vec(),
        }
    }

    /// Largest offset addressed by this layout, or `None` when it addresses nothing.
    pub fn max_offset(&self) -> Option<usize> {
        if self.num_elements() == 0 {
            return None;
        }
        let span: usize = self
            .shape
            .dims()
            .iter()
            .zip(self.strides.as_slice())
            .map(|(&dim, &stride)| (dim - 1) * stride)
            .sum();
        Some(self.offset + span)
    }

    /// True when every addressable element lies inside a buffer of `len` elements.
    pub fn fits(&self, len: usize) -> bool {
        self.max_offset().map_or(true, |max| max < len)
    }

    /// Row-major with no gaps, so the view is a plain slice of the buffer.
    pub fn is_contiguous(&self) -> bool {
        let expected = self.shape.contiguous_strides();
        self.shape
            .dims()
            .iter()
            .zip(self.strides.as_slice().iter().zip(expected.as_slice()))
            .all(|(&dim, (&actual, &want))| dim <= 1 || actual == want)
    }

    /// Reorders axes; `axes` must be a permutation of `0..rank`.
    pub fn permute(&self, axes: &[usize]) -> ArrayResult<Layout> {
        let rank = self.rank();
        let mut seen = vec![false; rank];
        if axes.len() != rank {
            return Err(ArrayError::shape(format!(
                "permutation {axes:?} does not match rank {rank}"
            )));
        }
        for &axis in axes {
            if axis >= rank || seen[axis] {
                return Err(ArrayError::shape(format!(
                    "{axes:?} is not a permutation of 0..{rank}"
                )));
            }
            seen[axis] = true;
        }
        let dims: Dims = axes.iter().map(|&a| self.shape.dims[a]).collect();
        let steps: Dims = axes.iter().map(|&a| self.strides.steps[a]).collect();
        Ok(Layout {
            shape: Shape { dims },
            strides: Strides { steps },
            offset: self.offset,
        })
    }

    /// Reverses all axes.
    pub fn transpose(&self) -> Layout {
        let mut dims = self.shape.dims.clone();
        let mut steps = self.strides.steps.clone();
        dims.reverse();
        steps.reverse();
        Layout {
            shape: Shape { dims },
            strides: Strides { steps },
            offset: self.offset,
        }
    }

    /// Reinterprets a contiguous view under a new shape with the same element count.
    pub fn reshape(&self, shape: Shape) -> ArrayResult<Layout> {
        if shape.num_elements() != self.num_elements() {
            return Err(ArrayError::shape(format!(
                "cannot reshape {} into {}",
                self.shape, shape
            )));
        }
        if !self.is_contiguous() {
            return Err(ArrayError::shape(format!(
                "cannot reshape non-contiguous view of shape {}",
                self.shape
            )));
        }
        let strides = shape.contiguous_strides();
        Ok(Layout {
            shape,
            strides,
            offset: self.offset,
        })
    }

    /// Restricts one axis to `start..end` taking every `step`-th element.
    pub fn slice(&self, axis: usize, start: usize, end: usize, step: usize) -> ArrayResult<Layout> {
        if axis >= self.rank() {
            return Err(ArrayError::shape(format!(
                "axis {axis} out of range for rank {}",
                self.rank()
            )));
        }
        let dim = self.shape.dims[axis];
        if step == 0 || start > end || end > dim {
            return Err(ArrayError::shape(format!(
                "invalid slice {start}..{end} step {step} on axis {axis} of length {dim}"
            )));
        }
        let stride = self.strides.steps[axis];
        let len = (end - start).div_ceil(step);
        let mut dims = self.shape.dims.clone();
        let mut steps = self.strides.steps.clone();
        dims[axis] = len;
        steps[axis] = stride * step;
        let offset = if len == 0 {
            self.offset
        } else {
            self.offset + start * stride
        };
        Ok(Layout {
            shape: Shape { dims },
            strides: Strides { steps },
            offset,
        })
    }

    /// Expands size-1 and missing leading axes to `target` using zero strides.
    pub fn broadcast_to(&self, target: &Shape) -> ArrayResult<Layout> {
        let rank = target.rank();
        if self.rank() > rank {
            return Err(ArrayError::shape(format!(
                "cannot broadcast {} to lower rank {}",
                self.shape, target
            )));
        }
        let lead = rank - self.rank();
        let mut steps = Dims::from_elem(0, rank);
        for axis in 0..rank {
            if axis < lead {
                continue;
            }
            let src = self.shape.dims[axis - lead];
            let want = target.dims[axis];
            if src == want {
                steps[axis] = self.strides.steps[axis - lead];
            } else if src != 1 {
                return Err(ArrayError::shape(format!(
                    "cannot broadcast {} to {}",
                    self.shape, target
                )));
            }
        }
        Ok(Layout {
            shape: target.clone(),
            strides: Strides { steps },
            offset: self.offset,
        })
    }
}

/// Visits every index tuple of `shape` in row-major order.
pub(crate) fn for_each_index(shape: &Shape, mut f: impl FnMut(&[usize])) {
    if shape.num_elements() == 0 {
        return;
    }
    let rank = shape.rank();
    let mut index: Dims = Dims::from_elem(0, rank);
    loop {
        f(&index);
        let mut axis = rank;
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            index[axis] += 1;
            if index[axis] < shape.dims[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_basics() {
        let s = Shape::new([2, 3, 4]);
        assert_eq!(s.rank(), 3);
        assert_eq!(s.num_elements(), 24);
        assert_eq!(s.contiguous_strides().as_slice(), &[12, 4, 1]);
        assert_eq!(Shape::scalar().num_elements(), 1);
        assert_eq!(format!("{}", Shape::new([5])), "(5,)");
    }

    #[test]
    fn broadcast_rules() {
        let a = Shape::new([1, 4]);
        let b = Shape::new([3, 1]);
        assert_eq!(a.broadcast_with(&b), Some(Shape::new([3, 4])));
        assert_eq!(
            Shape::new([3, 4]).broadcast_with(&Shape::new([2, 3, 4])),
            Some(Shape::new([2, 3, 4]))
        );
        assert_eq!(Shape::new([2, 3]).broadcast_with(&Shape::new([2, 4])), None);
    }

    #[test]
    fn checked_offset_rejects_out_of_range() {
        let layout = Layout::contiguous(Shape::new([3, 4]));
        assert_eq!(layout.checked_offset(&[2, 3]).unwrap(), 11);
        assert!(matches!(
            layout.checked_offset(&[3, 0]),
            Err(ArrayError::Index { .. })
        ));
        assert!(layout.checked_offset(&[1]).is_err());
    }

    #[test]
    fn flat_offset_reports_overflow() {
        let layout = Layout::contiguous(Shape::new([3, 4]));
        assert_eq!(layout.flat_offset(&[0, 7]), Some(7));
        assert_eq!(layout.flat_offset(&[usize::MAX / 2, 0]), None);
        assert_eq!(layout.flat_offset(&[1, usize::MAX]), None);
        assert_eq!(layout.flat_offset(&[1]), None);
    }

    #[test]
    fn transpose_and_slice_adjust_metadata() {
        let layout = Layout::contiguous(Shape::new([3, 4]));
        let t = layout.transpose();
        assert_eq!(t.shape().dims(), &[4, 3]);
        assert_eq!(t.strides().as_slice(), &[1, 4]);
        assert!(!t.is_contiguous());

        let s = layout.slice(1, 1, 4, 2).unwrap();
        assert_eq!(s.shape().dims(), &[3, 2]);
        assert_eq!(s.offset(), 1);
        assert_eq!(s.offset_of(&[2, 1]), 1 + 2 * 4 + 2);
        assert_eq!(s.max_offset(), Some(11));
    }

    #[test]
    fn reshape_requires_contiguous_view() {
        let layout = Layout::contiguous(Shape::new([3, 4]));
        assert!(layout.reshape(Shape::new([2, 6])).is_ok());
        assert!(layout.transpose().reshape(Shape::new([12])).is_err());
        assert!(layout.reshape(Shape::new([5])).is_err());
    }

    #[test]
    fn broadcast_uses_zero_strides() {
        let layout = Layout::contiguous(Shape::new([4]));
        let b = layout.broadcast_to(&Shape::new([3, 4])).unwrap();
        assert_eq!(b.strides().as_slice(), &[0, 1]);
        assert!(b.fits(4));
    }

    #[test]
    fn row_major_iteration_order() {
        let mut seen = Vec::new();
        for_each_index(&Shape::new([2, 2]), |idx| seen.push(idx.to_vec()));
        assert_eq!(seen, vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]);

        let mut count = 0;
        for_each_index(&Shape::scalar(), |_| count += 1);
        assert_eq!(count, 1);
    }
}
