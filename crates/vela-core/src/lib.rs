//! # vela-core
//!
//! Core tensor primitives, backend traits and autograd for vela.
//!
//! - [`Tensor`]: n-dimensional f32 array with strided views
//! - [`Shape`] / [`Layout`]: extents, strides and view bookkeeping
//! - [`Backend`]: the interface host and device backends implement
//! - [`Operation`]: the catalogue of differentiable operations
//! - [`AutogradContext`]: per-tensor gradient state driven by `backward()`

pub mod autograd;
pub mod backend;
pub mod error;
mod grad_ops;
pub mod layout;
pub mod op;
pub mod shape;
pub mod slice;
pub mod tensor;

pub use autograd::{AutogradContext, BackwardOptions};
pub use backend::{
    Activation, AttentionParams, Backend, BackendDevice, BackendStorage, BinaryOp, Conv2dParams,
    Pool2dParams,
};
pub use error::{DeviceError, Error, ErrorKind, Result};
pub use layout::Layout;
pub use op::{InputArity, LayerNormGradMode, Operation, TensorId};
pub use shape::Shape;
pub use slice::{ResolvedRange, SliceRange};
pub use tensor::Tensor;
