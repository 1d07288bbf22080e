// CUDA Runtime — device memory, NVRTC-built programs and kernel launches
//
// Each bundled program is one CUDA module: its source (with the shared
// prelude) is compiled to PTX by NVRTC for the device's compute capability
// and loaded under the program's resource path, so a kernel is addressed as
// (path, name). Launches are asynchronous on the device's stream; reads and
// `synchronize` block, and a fault raised by a kernel comes back from the
// driver at that point.
//
// Buffers are `CudaSlice<u32>`: f32 and i32 data travel as raw 32-bit words
// and the kernels declare the real element type in their signatures.

use std::ffi::c_void;
use std::sync::{Arc, Mutex};

use cudarc::driver::sys::CUdevice_attribute_enum;
use cudarc::driver::{CudaDevice, CudaSlice, DevicePtr, DriverError, LaunchAsync, LaunchConfig};
use cudarc::nvrtc::{compile_ptx_with_opts, CompileError, CompileOptions};
use tracing::{debug, trace};
use vela_core::{DeviceError, Error, Result};

use crate::kernel::{KernelArg, Launch, Program};
use crate::programs::PRELUDE;
use crate::runtime::Memory;

/// NVRTC_ERROR_INTERNAL_ERROR, for build failures that carry no status.
const NVRTC_INTERNAL: i32 = 11;

fn driver(call: &str, e: DriverError) -> Error {
    DeviceError::Driver {
        call: call.to_string(),
        code: e.0 as i32,
        message: e.to_string(),
    }
    .into()
}

fn build_error(program: &str, e: CompileError) -> Error {
    let (code, reason) = match &e {
        CompileError::CompileError { nvrtc, log, .. } => {
            (nvrtc.0 as i32, log.to_string_lossy().into_owned())
        }
        other => (NVRTC_INTERNAL, format!("{other:?}")),
    };
    DeviceError::KernelBuild {
        program: program.to_string(),
        code,
        reason,
    }
    .into()
}

/// Device memory of one buffer. `ptr` is fixed for the allocation's life;
/// the slice sits behind a lock because host writes need it mutably.
pub struct CudaMemory {
    ptr: u64,
    slice: Mutex<CudaSlice<u32>>,
}

impl CudaMemory {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, CudaSlice<u32>>> {
        self.slice
            .lock()
            .map_err(|_| Error::LockPoisoned("device buffer"))
    }
}

/// One scalar kernel parameter, kept alive until the launch call copies it.
enum ParamValue {
    Ptr(u64),
    Int(i32),
    Float(f32),
}

impl ParamValue {
    fn as_param(&mut self) -> *mut c_void {
        match self {
            ParamValue::Ptr(p) => p as *mut u64 as *mut c_void,
            ParamValue::Int(v) => v as *mut i32 as *mut c_void,
            ParamValue::Float(v) => v as *mut f32 as *mut c_void,
        }
    }
}

pub struct CudaRuntime {
    dev: Arc<CudaDevice>,
    arch: &'static str,
}

impl CudaRuntime {
    pub(crate) fn new(ordinal: usize) -> Result<Self> {
        let dev = CudaDevice::new(ordinal).map_err(|e| driver("cuDeviceGet", e))?;
        let major = dev
            .attribute(CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
            .map_err(|e| driver("cuDeviceGetAttribute", e))?;
        let minor = dev
            .attribute(CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
            .map_err(|e| driver("cuDeviceGetAttribute", e))?;
        // `CompileOptions::arch` takes a static str.
        let arch: &'static str = Box::leak(format!("sm_{major}{minor}").into_boxed_str());
        debug!(ordinal, arch, "opened CUDA device");
        Ok(CudaRuntime { dev, arch })
    }

    pub(crate) fn alloc(&self, len: usize, init: Option<Vec<u32>>) -> Result<CudaMemory> {
        // the driver rejects empty allocations
        let slice = match init {
            Some(bits) if !bits.is_empty() => self.dev.htod_copy(bits),
            _ => self.dev.alloc_zeros::<u32>(len.max(1)),
        }
        .map_err(|e| driver("cuMemAlloc", e))?;
        let ptr = *slice.device_ptr();
        Ok(CudaMemory {
            ptr,
            slice: Mutex::new(slice),
        })
    }

    pub(crate) fn load_program(&self, program: &'static Program) -> Result<()> {
        let source = format!("{PRELUDE}\n{}", program.source);
        let opts = CompileOptions {
            arch: Some(self.arch),
            ..Default::default()
        };
        let ptx = compile_ptx_with_opts(source, opts).map_err(|e| build_error(program.path, e))?;
        let names: Vec<&'static str> = program.kernels.iter().map(|k| k.name).collect();
        self.dev
            .load_ptx(ptx, program.path, &names)
            .map_err(|e| driver("cuModuleLoadData", e))?;
        debug!(program = program.path, arch = self.arch, "compiled program");
        Ok(())
    }

    pub(crate) fn launch(&self, launch: &Launch) -> Result<()> {
        let func = self
            .dev
            .get_func(launch.module(), launch.name())
            .ok_or_else(|| DeviceError::UnknownKernel {
                name: launch.name().to_string(),
            })?;
        let mut values = launch
            .args()
            .iter()
            .map(|arg| match arg {
                KernelArg::Buffer(b) => match b.memory() {
                    Memory::Cuda(m) => Ok(ParamValue::Ptr(m.ptr)),
                    Memory::Emulated(_) => Err(DeviceError::DeviceMismatch),
                },
                KernelArg::Int(v) => Ok(ParamValue::Int(*v)),
                KernelArg::Float(v) => Ok(ParamValue::Float(*v)),
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut params: Vec<*mut c_void> = values.iter_mut().map(ParamValue::as_param).collect();

        let (global, local) = (launch.global(), launch.local());
        let cfg = LaunchConfig {
            grid_dim: (
                (global[0] / local[0]) as u32,
                (global[1] / local[1]) as u32,
                (global[2] / local[2]) as u32,
            ),
            block_dim: (local[0] as u32, local[1] as u32, local[2] as u32),
            shared_mem_bytes: 0,
        };
        trace!(kernel = launch.name(), ?cfg.grid_dim, ?cfg.block_dim, "cuLaunchKernel");
        // Argument kinds and count were checked against the kernel's
        // declaration, which matches its CUDA signature.
        unsafe { func.launch(cfg, &mut params[..]) }.map_err(|e| driver("cuLaunchKernel", e))
    }

    pub(crate) fn write(&self, memory: &CudaMemory, offset: usize, data: &[u32]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut slice = memory.lock()?;
        let mut view = slice.slice_mut(offset..offset + data.len());
        self.dev
            .htod_sync_copy_into(data, &mut view)
            .map_err(|e| driver("cuMemcpyHtoD", e))
    }

    pub(crate) fn read(&self, memory: &CudaMemory, offset: usize, len: usize) -> Result<Vec<u32>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let slice = memory.lock()?;
        self.dev
            .dtoh_sync_copy(&slice.slice(offset..offset + len))
            .map_err(|e| driver("cuMemcpyDtoH", e))
    }

    pub(crate) fn synchronize(&self) -> Result<()> {
        self.dev
            .synchronize()
            .map_err(|e| driver("cuCtxSynchronize", e))
    }
}

#[cfg(test)]
mod tests {
    use cudarc::driver::sys::CUresult;
    use vela_core::error::status;

    #[test]
    fn host_side_statuses_match_the_driver() {
        assert_eq!(status::INVALID_VALUE, CUresult::CUDA_ERROR_INVALID_VALUE as i32);
        assert_eq!(status::OUT_OF_MEMORY, CUresult::CUDA_ERROR_OUT_OF_MEMORY as i32);
        assert_eq!(status::NOT_INITIALIZED, CUresult::CUDA_ERROR_NOT_INITIALIZED as i32);
        assert_eq!(status::NO_DEVICE, CUresult::CUDA_ERROR_NO_DEVICE as i32);
        assert_eq!(status::INVALID_CONTEXT, CUresult::CUDA_ERROR_INVALID_CONTEXT as i32);
        assert_eq!(status::NOT_FOUND, CUresult::CUDA_ERROR_NOT_FOUND as i32);
        assert_eq!(status::ILLEGAL_ADDRESS, CUresult::CUDA_ERROR_ILLEGAL_ADDRESS as i32);
        assert_eq!(status::UNKNOWN, CUresult::CUDA_ERROR_UNKNOWN as i32);
    }
}
