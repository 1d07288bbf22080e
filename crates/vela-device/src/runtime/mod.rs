// Runtime — where device memory lives and kernels execute
//
// Two runtimes sit behind one dispatch:
//
//   Cuda      the CUDA driver through cudarc (`cuda` feature). Programs are
//             compiled from their CUDA C source with NVRTC when loaded,
//             launches go to the device's stream, reads synchronize.
//   Emulator  an in-process test double that runs each kernel's emulated
//             body on the host. Always available.
//
// `DeviceConfig::runtime` picks one when the device is created. Everything
// above this module (buffers, kernel registry, the backend) is the same for
// both.

#[cfg(feature = "cuda")]
pub mod cuda;
pub mod emulator;

use std::sync::Arc;

use vela_core::{DeviceError, Result};

use crate::buffer::RawBuffer;
use crate::config::{DeviceConfig, RuntimeKind};
use crate::kernel::{Launch, Program};

/// Backing memory of a buffer.
pub(crate) enum Memory {
    Emulated(emulator::Cells),
    #[cfg(feature = "cuda")]
    Cuda(cuda::CudaMemory),
}

pub(crate) enum Runtime {
    Emulator(emulator::Emulator),
    #[cfg(feature = "cuda")]
    Cuda(cuda::CudaRuntime),
}

impl Runtime {
    pub(crate) fn create(config: &DeviceConfig, name: &str) -> Result<Self> {
        match config.runtime {
            RuntimeKind::Emulator => Ok(Runtime::Emulator(emulator::Emulator::spawn(name)?)),
            #[cfg(feature = "cuda")]
            RuntimeKind::Cuda { ordinal } => Ok(Runtime::Cuda(cuda::CudaRuntime::new(ordinal)?)),
            #[cfg(not(feature = "cuda"))]
            RuntimeKind::Cuda { ordinal } => Err(DeviceError::Unavailable(format!(
                "CUDA device {ordinal} requested, but vela-device was built without the `cuda` feature"
            ))
            .into()),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Runtime::Emulator(_) => "emulator",
            #[cfg(feature = "cuda")]
            Runtime::Cuda(_) => "cuda",
        }
    }

    /// Memory for `len` 32-bit elements, zero-filled unless `init` is given.
    pub(crate) fn alloc(&self, id: u64, len: usize, init: Option<Vec<u32>>) -> Result<Memory> {
        match self {
            Runtime::Emulator(e) => Ok(match init {
                Some(bits) => e.alloc(id, bits.into_iter()),
                None => e.alloc(id, std::iter::repeat(0).take(len)),
            }),
            #[cfg(feature = "cuda")]
            Runtime::Cuda(c) => c.alloc(len, init).map(Memory::Cuda),
        }
    }

    /// Make `program`'s kernels launchable. The emulator has nothing to
    /// build; CUDA compiles the source and loads the module.
    pub(crate) fn load_program(&self, program: &'static Program) -> Result<()> {
        match self {
            Runtime::Emulator(_) => Ok(()),
            #[cfg(feature = "cuda")]
            Runtime::Cuda(c) => c.load_program(program),
        }
    }

    pub(crate) fn launch(&self, launch: Launch) -> Result<()> {
        match self {
            Runtime::Emulator(e) => e.launch(launch),
            #[cfg(feature = "cuda")]
            Runtime::Cuda(c) => c.launch(&launch),
        }
    }

    pub(crate) fn write(&self, buffer: &Arc<RawBuffer>, offset: usize, data: Vec<u32>) -> Result<()> {
        match self {
            Runtime::Emulator(e) => e.write(buffer, offset, data),
            #[cfg(feature = "cuda")]
            Runtime::Cuda(c) => c.write(memory_of(buffer)?, offset, &data),
        }
    }

    pub(crate) fn read(&self, buffer: &Arc<RawBuffer>, offset: usize, len: usize) -> Result<Vec<u32>> {
        match self {
            Runtime::Emulator(e) => e.read(buffer, offset, len),
            #[cfg(feature = "cuda")]
            Runtime::Cuda(c) => c.read(memory_of(buffer)?, offset, len),
        }
    }

    pub(crate) fn synchronize(&self) -> Result<()> {
        match self {
            Runtime::Emulator(e) => e.finish(),
            #[cfg(feature = "cuda")]
            Runtime::Cuda(c) => c.synchronize(),
        }
    }
}

#[cfg(feature = "cuda")]
fn memory_of(buffer: &RawBuffer) -> Result<&cuda::CudaMemory> {
    match buffer.memory() {
        Memory::Cuda(m) => Ok(m),
        Memory::Emulated(_) => Err(DeviceError::DeviceMismatch.into()),
    }
}
