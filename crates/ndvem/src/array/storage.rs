//! Scalar element trait and the reference-counted storage buffer behind every local array.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::dtype::DType;
use super::kernel::{KernelError, Opcode};

/// Trait describing the numeric behaviour required by array storages.
///
/// Every accessor evaluates operations through [`Element::unary`] and [`Element::binary`], so the
/// checked and raw-memory accessors share one definition of overflow, NaN and rounding behaviour.
pub trait Element:
    Copy + Default + PartialEq + PartialOrd + fmt::Debug + Send + Sync + 'static
{
    /// Dtype tag used on the engine wire.
    const DTYPE: DType;

    /// Returns the additive identity for the element type.
    fn zero() -> Self;
    /// Returns the multiplicative identity for the element type.
    fn one() -> Self;
    /// Lossy conversion used by fill helpers and test fixtures.
    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
    /// Exact bit encoding, widened to 64 bits.
    fn to_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;
    /// Applies a single-operand opcode.
    fn unary(op: Opcode, x: Self) -> Result<Self, KernelError>;
    /// Applies a two-operand opcode.
    fn binary(op: Opcode, a: Self, b: Self) -> Result<Self, KernelError>;
}

// NaN is the only value unequal to itself.
#[allow(clippy::eq_op)]
fn nan_aware<F: Copy + PartialEq>(a: F, b: F, chosen: F) -> F {
    if a != a {
        a
    } else if b != b {
        b
    } else {
        chosen
    }
}

macro_rules! float_element {
    ($ty:ty, $dtype:expr, $bits:ty) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn zero() -> Self {
                0.0
            }

            fn one() -> Self {
                1.0
            }

            fn from_f64(v: f64) -> Self {
                v as $ty
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn to_bits(self) -> u64 {
                <$ty>::to_bits(self) as u64
            }

            fn from_bits(bits: u64) -> Self {
                <$ty>::from_bits(bits as $bits)
            }

            fn unary(op: Opcode, x: Self) -> Result<Self, KernelError> {
                match op {
                    Opcode::Identity => Ok(x),
                    Opcode::Negate => Ok(-x),
                    Opcode::Absolute => Ok(x.abs()),
                    other => Err(KernelError::Arity {
                        op: other,
                        given: 1,
                    }),
                }
            }

            fn binary(op: Opcode, a: Self, b: Self) -> Result<Self, KernelError> {
                match op {
                    Opcode::Add => Ok(a + b),
                    Opcode::Subtract => Ok(a - b),
                    Opcode::Multiply => Ok(a * b),
                    Opcode::Divide => Ok(a / b),
                    // NaN wins so results do not depend on operand order.
                    Opcode::Maximum => Ok(nan_aware(a, b, if a >= b { a } else { b })),
                    Opcode::Minimum => Ok(nan_aware(a, b, if a <= b { a } else { b })),
                    other => Err(KernelError::Arity {
                        op: other,
                        given: 2,
                    }),
                }
            }
        }
    };
}

macro_rules! int_element {
    ($ty:ty, $dtype:expr, $unsigned:ty) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn zero() -> Self {
                0
            }

            fn one() -> Self {
                1
            }

            fn from_f64(v: f64) -> Self {
                v as $ty
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn to_bits(self) -> u64 {
                self as $unsigned as u64
            }

            fn from_bits(bits: u64) -> Self {
                bits as $unsigned as $ty
            }

            fn unary(op: Opcode, x: Self) -> Result<Self, KernelError> {
                match op {
                    Opcode::Identity => Ok(x),
                    Opcode::Negate => Ok(x.wrapping_neg()),
                    Opcode::Absolute => Ok(x.wrapping_abs()),
                    other => Err(KernelError::Arity {
                        op: other,
                        given: 1,
                    }),
                }
            }

            fn binary(op: Opcode, a: Self, b: Self) -> Result<Self, KernelError> {
                match op {
                    Opcode::Add => Ok(a.wrapping_add(b)),
                    Opcode::Subtract => Ok(a.wrapping_sub(b)),
                    Opcode::Multiply => Ok(a.wrapping_mul(b)),
                    Opcode::Divide if b == 0 => Err(KernelError::DivisionByZero),
                    Opcode::Divide => Ok(a.wrapping_div(b)),
                    Opcode::Maximum => Ok(a.max(b)),
                    Opcode::Minimum => Ok(a.min(b)),
                    other => Err(KernelError::Arity {
                        op: other,
                        given: 2,
                    }),
                }
            }
        }
    };
}

float_element!(f32, DType::F32, u32);
float_element!(f64, DType::F64, u64);
int_element!(i32, DType::I32, u32);
int_element!(i64, DType::I64, u64);

static BUFFER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Contiguous element storage shared by views, accessors and lazy nodes.
///
/// The lock makes aliasing writes memory-safe. It does not order them: callers that write
/// overlapping regions from several threads must serialise those writes themselves.
pub struct StorageBuffer<T: Element> {
    id: u64,
    data: RwLock<Vec<T>>,
}

impl<T: Element> StorageBuffer<T> {
    pub fn from_vec(data: Vec<T>) -> Self {
        StorageBuffer {
            id: BUFFER_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            data: RwLock::new(data),
        }
    }

    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![T::zero(); len])
    }

    /// Process-unique identity, stable for the lifetime of the buffer.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<T>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, offset: usize) -> Option<T> {
        self.read().get(offset).copied()
    }

    /// Stores `value` at `offset`; returns `false` when the offset is outside the buffer.
    pub fn set(&self, offset: usize, value: T) -> bool {
        match self.write().get_mut(offset) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.read().clone()
    }
}

impl<T: Element> fmt::Debug for StorageBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageBuffer")
            .field("id", &self.id)
            .field("dtype", &T::DTYPE)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_encoding_is_exact() {
        let nan = f32::from_bits(0x7fc0_1234);
        assert_eq!(<f32 as Element>::from_bits(Element::to_bits(nan)).to_bits(), 0x7fc0_1234);
        assert_eq!(<i32 as Element>::from_bits(Element::to_bits(-7i32)), -7);
        assert_eq!(<i64 as Element>::from_bits(Element::to_bits(i64::MIN)), i64::MIN);
        assert_eq!(<f64 as Element>::from_bits(Element::to_bits(-0.0f64)).to_bits(), (-0.0f64).to_bits());
    }

    #[test]
    fn integer_arithmetic_wraps_and_rejects_zero_division() {
        assert_eq!(i32::binary(Opcode::Add, i32::MAX, 1).unwrap(), i32::MIN);
        assert_eq!(i32::binary(Opcode::Divide, i32::MIN, -1).unwrap(), i32::MIN);
        assert_eq!(
            i64::binary(Opcode::Divide, 1, 0),
            Err(KernelError::DivisionByZero)
        );
        assert_eq!(i32::unary(Opcode::Absolute, i32::MIN).unwrap(), i32::MIN);
    }

    #[test]
    fn float_extrema_propagate_nan() {
        assert!(f64::binary(Opcode::Maximum, f64::NAN, 1.0).unwrap().is_nan());
        assert!(f64::binary(Opcode::Maximum, 1.0, f64::NAN).unwrap().is_nan());
        assert!(f32::binary(Opcode::Minimum, 2.0, f32::NAN).unwrap().is_nan());
        assert_eq!(f32::binary(Opcode::Minimum, 2.0, -1.0).unwrap(), -1.0);
        assert_eq!(f32::binary(Opcode::Divide, 1.0, 0.0).unwrap(), f32::INFINITY);
    }

    #[test]
    fn buffers_have_distinct_ids() {
        let a = StorageBuffer::<f32>::zeroed(4);
        let b = StorageBuffer::<f32>::zeroed(4);
        assert_ne!(a.id(), b.id());
        assert!(a.set(3, 2.5));
        assert!(!a.set(4, 1.0));
        assert_eq!(a.get(3), Some(2.5));
        assert_eq!(a.to_vec(), vec![0.0, 0.0, 0.0, 2.5]);
    }
}
