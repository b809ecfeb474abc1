//! Elementwise opcodes and the two kernel drivers that evaluate them.
//!
//! [`eval_checked`] resolves every operand element through slice bounds checks. [`eval_raw`]
//! validates each operand layout once and then walks raw pointers. Both visit the output in
//! row-major order and apply the same [`Element`] scalar functions, so they agree bit for bit,
//! including which element reports the first failure.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

use super::dtype::DType;
use super::shape::{for_each_index, Layout, Shape};
use super::storage::Element;

/// Operation identifiers understood by every accessor and by the remote engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    Identity,
    Negate,
    Absolute,
    Add,
    Subtract,
    Multiply,
    Divide,
    Maximum,
    Minimum,
}

impl Opcode {
    pub const ALL: [Opcode; 9] = [
        Opcode::Identity,
        Opcode::Negate,
        Opcode::Absolute,
        Opcode::Add,
        Opcode::Subtract,
        Opcode::Multiply,
        Opcode::Divide,
        Opcode::Maximum,
        Opcode::Minimum,
    ];

    /// Number of array operands the opcode consumes.
    pub fn arity(self) -> usize {
        match self {
            Opcode::Identity | Opcode::Negate | Opcode::Absolute => 1,
            _ => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Identity => "identity",
            Opcode::Negate => "negate",
            Opcode::Absolute => "absolute",
            Opcode::Add => "add",
            Opcode::Subtract => "subtract",
            Opcode::Multiply => "multiply",
            Opcode::Divide => "divide",
            Opcode::Maximum => "maximum",
            Opcode::Minimum => "minimum",
        }
    }
}

/// Failures raised while evaluating an opcode.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum KernelError {
    #[error("integer division by zero")]
    DivisionByZero,
    #[error("{} takes {} operands, {given} given", .op.name(), .op.arity())]
    Arity { op: Opcode, given: usize },
    #[error("operand shape {operand:?} does not match output shape {output:?}")]
    ShapeMismatch {
        operand: Vec<usize>,
        output: Vec<usize>,
    },
    #[error("operand layout reaches offset {max_offset} of a {len}-element buffer")]
    OutOfRange { max_offset: usize, len: usize },
    #[error("expected {expected} data, found {found}")]
    DType { expected: DType, found: DType },
    #[error("engine error: {0}")]
    Engine(String),
}

/// One operand of a kernel invocation: flat data plus the view describing it.
#[derive(Clone, Copy)]
pub struct KernelInput<'a, T> {
    pub data: &'a [T],
    pub layout: &'a Layout,
}

impl<'a, T> KernelInput<'a, T> {
    pub fn new(data: &'a [T], layout: &'a Layout) -> Self {
        KernelInput { data, layout }
    }
}

fn validate_operands<T>(
    op: Opcode,
    shape: &Shape,
    inputs: &[KernelInput<'_, T>],
) -> Result<(), KernelError> {
    if inputs.len() != op.arity() {
        return Err(KernelError::Arity {
            op,
            given: inputs.len(),
        });
    }
    for input in inputs {
        if input.layout.shape() != shape {
            return Err(KernelError::ShapeMismatch {
                operand: input.layout.shape().dims().to_vec(),
                output: shape.dims().to_vec(),
            });
        }
    }
    Ok(())
}

#[inline]
fn combine<T: Element>(op: Opcode, values: &[T]) -> Result<T, KernelError> {
    match values {
        [x] => T::unary(op, *x),
        [a, b] => T::binary(op, *a, *b),
        _ => Err(KernelError::Arity {
            op,
            given: values.len(),
        }),
    }
}

/// Evaluates `op` into a fresh row-major buffer, bounds-checking every operand read.
pub fn eval_checked<T: Element>(
    op: Opcode,
    shape: &Shape,
    inputs: &[KernelInput<'_, T>],
) -> Result<Vec<T>, KernelError> {
    validate_operands(op, shape, inputs)?;
    let mut out = Vec::with_capacity(shape.num_elements());
    let mut failure = None;
    let mut values: SmallVec<[T; 2]> = SmallVec::new();
    for_each_index(shape, |index| {
        if failure.is_some() {
            return;
        }
        values.clear();
        for input in inputs {
            let offset = input.layout.offset_of(index);
            match input.data.get(offset) {
                Some(value) => values.push(*value),
                None => {
                    failure = Some(KernelError::OutOfRange {
                        max_offset: offset,
                        len: input.data.len(),
                    });
                    return;
                }
            }
        }
        match combine(op, &values) {
            Ok(value) => out.push(value),
            Err(err) => failure = Some(err),
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(out),
    }
}

/// Evaluates `op` with raw-pointer operand reads.
///
/// Each operand layout is checked against its buffer once up front; the inner loop then
/// advances per-operand offsets odometer-style without further validation.
pub fn eval_raw<T: Element>(
    op: Opcode,
    shape: &Shape,
    inputs: &[KernelInput<'_, T>],
) -> Result<Vec<T>, KernelError> {
    validate_operands(op, shape, inputs)?;
    for input in inputs {
        if let Some(max_offset) = input.layout.max_offset() {
            if max_offset >= input.data.len() {
                return Err(KernelError::OutOfRange {
                    max_offset,
                    len: input.data.len(),
                });
            }
        }
    }

    let total = shape.num_elements();
    let mut out = Vec::with_capacity(total);
    if total == 0 {
        return Ok(out);
    }

    let dims = shape.dims();
    let rank = dims.len();
    let ptrs: SmallVec<[*const T; 2]> = inputs.iter().map(|i| i.data.as_ptr()).collect();
    let mut offsets: SmallVec<[usize; 2]> = inputs.iter().map(|i| i.layout.offset()).collect();
    let mut index: SmallVec<[usize; 4]> = SmallVec::from_elem(0, rank);
    let mut values: SmallVec<[T; 2]> = SmallVec::new();

    for _ in 0..total {
        values.clear();
        for (ptr, &offset) in ptrs.iter().zip(offsets.iter()) {
            // SAFETY: every index tuple of `shape` maps to an offset <= max_offset, which was
            // checked against the operand's length above, and the slices outlive this loop.
            values.push(unsafe { *ptr.add(offset) });
        }
        out.push(combine(op, &values)?);

        let mut axis = rank;
        while axis > 0 {
            axis -= 1;
            index[axis] += 1;
            for (offset, input) in offsets.iter_mut().zip(inputs) {
                *offset += input.layout.strides().as_slice()[axis];
            }
            if index[axis] < dims[axis] {
                break;
            }
            for (offset, input) in offsets.iter_mut().zip(inputs) {
                *offset -= input.layout.strides().as_slice()[axis] * dims[axis];
            }
            index[axis] = 0;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arange(n: usize) -> Vec<f64> {
        (0..n).map(|v| v as f64).collect()
    }

    #[test]
    fn checked_and_raw_agree_on_strided_views() {
        let data = arange(12);
        let base = Layout::contiguous(Shape::new([3, 4]));
        let t = base.transpose();
        let sliced = base.slice(1, 0, 4, 1).unwrap().transpose();
        let shape = Shape::new([4, 3]);

        let inputs = [KernelInput::new(&data, &t), KernelInput::new(&data, &sliced)];
        let checked = eval_checked(Opcode::Add, &shape, &inputs).unwrap();
        let raw = eval_raw(Opcode::Add, &shape, &inputs).unwrap();
        assert_eq!(checked, raw);
        assert_eq!(checked[1], 8.0);
    }

    fn drivers_agree_bitwise<T: Element>(lhs: &[T], rhs: &[T]) {
        let shape = Shape::new([lhs.len()]);
        let layout = Layout::contiguous(shape.clone());
        for op in Opcode::ALL {
            let inputs: Vec<KernelInput<'_, T>> = if op.arity() == 1 {
                vec![KernelInput::new(lhs, &layout)]
            } else {
                vec![KernelInput::new(lhs, &layout), KernelInput::new(rhs, &layout)]
            };
            let checked = eval_checked(op, &shape, &inputs).unwrap();
            let raw = eval_raw(op, &shape, &inputs).unwrap();
            let bits = |values: &[T]| values.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
            assert_eq!(bits(checked.as_slice()), bits(raw.as_slice()), "{}", op.name());
        }
    }

    #[test]
    fn drivers_agree_on_wrapping_and_special_values() {
        drivers_agree_bitwise(
            &[i32::MAX, i32::MIN, i32::MIN, -1, 7],
            &[1, -1, i32::MAX, i32::MIN, -2],
        );
        drivers_agree_bitwise(&[i64::MIN, i64::MAX, -1], &[-1, i64::MAX, i64::MIN]);
        drivers_agree_bitwise(
            &[f64::NAN, -0.0, 0.0, f64::INFINITY, 1.0, f64::MAX],
            &[1.0, 0.0, -0.0, f64::INFINITY, f64::NAN, f64::MAX],
        );
        drivers_agree_bitwise(&[0.1f32, f32::MIN_POSITIVE, -0.0], &[0.2, 3.0, f32::NAN]);

        let wrapped = Element::binary(Opcode::Add, i32::MAX, 1).unwrap();
        assert_eq!(wrapped, i32::MIN);
        assert_eq!(Element::unary(Opcode::Absolute, i64::MIN).unwrap(), i64::MIN);
    }

    #[test]
    fn broadcast_operand_repeats_values() {
        let row = vec![1i32, 2, 3];
        let ones = vec![10i32; 6];
        let shape = Shape::new([2, 3]);
        let row_layout = Layout::contiguous(Shape::new([3]))
            .broadcast_to(&shape)
            .unwrap();
        let full = Layout::contiguous(shape.clone());
        let inputs = [
            KernelInput::new(&ones, &full),
            KernelInput::new(&row, &row_layout),
        ];
        let out = eval_raw(Opcode::Multiply, &shape, &inputs).unwrap();
        assert_eq!(out, vec![10, 20, 30, 10, 20, 30]);
        assert_eq!(out, eval_checked(Opcode::Multiply, &shape, &inputs).unwrap());
    }

    #[test]
    fn failures_match_between_drivers() {
        let a = vec![4i64, 5, 6];
        let b = vec![2i64, 0, 3];
        let layout = Layout::contiguous(Shape::new([3]));
        let inputs = [KernelInput::new(&a, &layout), KernelInput::new(&b, &layout)];
        let shape = Shape::new([3]);
        assert_eq!(
            eval_checked(Opcode::Divide, &shape, &inputs),
            Err(KernelError::DivisionByZero)
        );
        assert_eq!(
            eval_raw(Opcode::Divide, &shape, &inputs),
            Err(KernelError::DivisionByZero)
        );
    }

    #[test]
    fn raw_driver_rejects_layouts_past_the_buffer() {
        let data = vec![1.0f32; 4];
        let layout = Layout::contiguous(Shape::new([5]));
        let inputs = [KernelInput::new(&data, &layout)];
        assert!(matches!(
            eval_raw(Opcode::Negate, &Shape::new([5]), &inputs),
            Err(KernelError::OutOfRange { max_offset: 4, len: 4 })
        ));
    }

    #[test]
    fn arity_is_enforced() {
        let data = vec![1.0f32];
        let layout = Layout::contiguous(Shape::new([1]));
        let inputs = [KernelInput::new(&data, &layout)];
        assert!(matches!(
            eval_checked(Opcode::Add, &Shape::new([1]), &inputs),
            Err(KernelError::Arity { given: 1, .. })
        ));
    }
}
