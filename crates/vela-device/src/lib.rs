// Device Backend — tensors on a CUDA device through named kernels
//
// A `Device` owns a runtime, a registry of named kernels and a memory
// tracker. The runtime is the CUDA driver (via cudarc, `cuda` feature) or
// the in-process emulator used as a test double. Tensor operations never
// touch device memory directly: they allocate buffers, bind arguments to a
// named kernel and submit the launch. Only reads back to the host (and
// `synchronize`) wait for the device, and a fault raised by any earlier
// launch surfaces there.
//
// ARCHITECTURE:
// - `Device` wraps the runtime, kernel registry and memory accounting (Arc)
// - `DeviceBuffer<T>` is a typed handle to device memory; dropping it
//   returns its bytes to the tracker
// - `DeviceStorage` is one tensor's data plus its dims/strides descriptors
// - `programs` holds the kernel programs (CUDA C source plus emulated
//   bodies); `init_kernels` builds and registers all of them
// - All kernels operate on contiguous data; strided views are copied by
//   the `copy_strided` kernel first
//
// USAGE:
//   let device = Device::cuda(0)?;          // or Device::emulator()?
//   vela_device::init_kernels(&device)?;
//   let t = DeviceTensor::randn((2, 3), &device)?;

pub mod backend;
pub mod buffer;
pub mod config;
pub mod device;
pub mod kernel;
pub mod memory;
pub mod programs;
pub mod runtime;
pub mod storage;

use vela_core::{BackendDevice, Result, Tensor};

pub use backend::DeviceBackend;
pub use buffer::{DeviceBuffer, DeviceScalar, ElemKind};
pub use config::{DeviceConfig, RuntimeKind};
pub use device::Device;
pub use kernel::KernelFactory;
pub use memory::MemoryStats;
pub use storage::DeviceStorage;

pub type DeviceTensor = Tensor<DeviceBackend>;

/// Build and load every bundled kernel program into `device`. Loading is
/// idempotent per program, so calling this twice is harmless.
#[tracing::instrument(skip(device), fields(device = %device.name()))]
pub fn init_kernels(device: &Device) -> Result<()> {
    let mut loaded = 0;
    for program in programs::PROGRAMS {
        loaded += device.load_program(program.path)?;
    }
    tracing::debug!(kernels = device.kernel_count(), loaded, "kernels ready");
    Ok(())
}
