//! Core array abstractions shared across accessors.
//!
//! The array module defines shapes and layouts, dtypes, the storage element trait, the
//! elementwise kernels and the user-facing [`NdArray`] that forwards every access to its
//! accessor.

pub mod dtype;
pub mod kernel;
mod ndarray;
pub mod shape;
pub mod storage;

pub use dtype::DType;
pub use kernel::{KernelError, Opcode};
pub use ndarray::NdArray;
pub use shape::{Layout, Shape, Strides};
pub use storage::{Element, StorageBuffer};
