extern crate self as ndvem;

pub mod accessor;
pub mod array;
mod env;
pub mod error;
pub mod factory;
pub mod lazy;
pub mod timing;
pub mod vem;

pub use accessor::{Accessor, AccessorKind, Capability};
pub use array::{DType, Element, Layout, NdArray, Opcode, Shape};
pub use error::{ArrayError, ArrayResult};
pub use factory::{
    AccessorFactory, ArrayContext, DirectAccessorFactory, LazyAccessorFactory,
    RemoteAccessorFactory, Settings, UnsafeAccessorFactory,
};
