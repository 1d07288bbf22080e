//! # vela
//!
//! Strided f32 tensors with reverse-mode autodiff, on the host or on a
//! CUDA device (`cuda` feature; an emulated device is always available).
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```ignore
//! use vela::prelude::*;
//!
//! let x = CpuTensor::randn((2, 3), &CpuDevice::default())?.with_grad();
//! let y = x.mul_grad(&x)?.sum_grad()?;
//! y.backward()?;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `vela-core` | Tensor, Shape, Layout, Backend trait, operation catalogue, autograd |
//! | `vela-cpu` | Host backend: broadcast engine, fork-join and SIMD kernels |
//! | `vela-device` | Device backend: CUDA runtime and emulator, buffers, kernel registry, flash attention |
//!
//! ## Modules
//!
//! - [`placement`] — [`AnyTensor`], a tensor on either backend, and `to(device)`

/// Re-export core types.
pub use vela_core::{
    backend::{Backend, BackendDevice, BackendStorage},
    Activation, AttentionParams, AutogradContext, BackwardOptions, BinaryOp, Conv2dParams,
    DeviceError, Error, ErrorKind, LayerNormGradMode, Layout, Operation, Pool2dParams, Result,
    Shape, SliceRange, Tensor, TensorId,
};

/// Re-export the host backend.
pub use vela_cpu::{CpuBackend, CpuDevice, CpuStorage, CpuTensor, HostConfig};

/// Re-export the device backend.
pub use vela_device::{
    init_kernels, Device, DeviceBackend, DeviceConfig, DeviceStorage, DeviceTensor, MemoryStats,
};

/// Placement — tensors that may live on either backend.
pub mod placement;

pub use placement::AnyTensor;

/// Convenient glob import.
pub mod prelude {
    pub use crate::placement::AnyTensor;
    pub use vela_core::{
        Activation, BackwardOptions, Conv2dParams, Error, LayerNormGradMode, Pool2dParams,
        Result, Shape, SliceRange, Tensor,
    };
    pub use vela_cpu::{CpuBackend, CpuDevice, CpuTensor};
    pub use vela_device::{init_kernels, Device, DeviceBackend, DeviceConfig, DeviceTensor};
}
