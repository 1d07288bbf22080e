// Device — context handle: runtime, kernel registry and memory accounting
//
// `Device` is a cheap clone (Arc inside). All clones share one runtime (a
// CUDA context and stream, or the emulator's queue), one kernel registry and
// one set of memory counters. Buffers keep a clone of their device so
// releasing a handle can always credit the right counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};
use vela_core::{BackendDevice, DeviceError, Error, Result};

use crate::buffer::{DeviceBuffer, DeviceScalar, RawBuffer};
use crate::config::DeviceConfig;
use crate::kernel::{KernelFactory, KernelRegistry};
use crate::memory::{MemoryStats, MemoryTracker};
use crate::programs;
use crate::runtime::Runtime;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(0);

struct DeviceInner {
    id: u64,
    config: DeviceConfig,
    runtime: Runtime,
    kernels: KernelRegistry,
    memory: MemoryTracker,
    next_buffer: AtomicU64,
}

/// A compute device. Clonable; clones share the same context.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// CUDA device 0 with the default configuration. Kernels still need
    /// [`init_kernels`](crate::init_kernels) before arithmetic can run.
    pub fn new() -> Result<Self> {
        Self::with_config(DeviceConfig::default())
    }

    /// The CUDA device with the given ordinal (`cuda` feature).
    pub fn cuda(ordinal: usize) -> Result<Self> {
        Self::with_config(DeviceConfig::cuda(ordinal))
    }

    /// An in-process emulated device: same programs, same API, kernels run
    /// on the host. Meant for tests and machines without a GPU.
    pub fn emulator() -> Result<Self> {
        Self::with_config(DeviceConfig::emulator())
    }

    pub fn with_config(config: DeviceConfig) -> Result<Self> {
        let id = NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
        let runtime = Runtime::create(&config, &format!("{}{id}", config.label))?;
        debug!(
            device = id,
            runtime = runtime.name(),
            label = %config.label,
            local_size = config.local_size,
            "created device"
        );
        Ok(Device {
            inner: Arc::new(DeviceInner {
                id,
                config,
                runtime,
                kernels: KernelRegistry::default(),
                memory: MemoryTracker::default(),
                next_buffer: AtomicU64::new(0),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// Whether kernels run in the in-process emulator rather than on a GPU.
    pub fn is_emulated(&self) -> bool {
        matches!(self.inner.runtime, Runtime::Emulator(_))
    }

    pub fn same_device(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // Buffers

    fn allocate<T: DeviceScalar>(&self, len: usize, init: Option<Vec<u32>>) -> Result<DeviceBuffer<T>> {
        let bytes = len * std::mem::size_of::<u32>();
        if let Err(e) = self.inner.memory.charge(bytes, self.inner.config.memory_limit) {
            debug!(device = self.inner.id, bytes, error = %e, "buffer allocation failed");
            return Err(e.into());
        }
        let id = self.inner.next_buffer.fetch_add(1, Ordering::Relaxed);
        let memory = match self.inner.runtime.alloc(id, len, init) {
            Ok(m) => m,
            Err(e) => {
                self.inner.memory.rollback(bytes);
                debug!(device = self.inner.id, bytes, error = %e, "buffer allocation failed");
                return Err(e);
            }
        };
        let raw = RawBuffer::new(id, self.inner.id, T::KIND, len, memory);
        trace!(device = self.inner.id, buffer = id, len, "create buffer");
        Ok(DeviceBuffer::new(Arc::new(raw), self.clone()))
    }

    /// A zero-filled buffer of `len` elements.
    pub fn create_buffer<T: DeviceScalar>(&self, len: usize) -> Result<DeviceBuffer<T>> {
        self.allocate(len, None)
    }

    /// A buffer initialized from host data, ordered before any launch that
    /// uses it.
    pub fn buffer_from_slice<T: DeviceScalar>(&self, data: &[T]) -> Result<DeviceBuffer<T>> {
        self.allocate(data.len(), Some(data.iter().map(|v| v.to_bits()).collect()))
    }

    /// An index buffer from host sizes.
    pub fn index_buffer(&self, values: &[usize]) -> Result<DeviceBuffer<i32>> {
        let ints = values
            .iter()
            .map(|&v| {
                i32::try_from(v).map_err(|_| {
                    Error::from(DeviceError::Allocation {
                        bytes: values.len() * 4,
                        reason: format!("index {v} does not fit in i32"),
                    })
                })
            })
            .collect::<Result<Vec<i32>>>()?;
        self.buffer_from_slice(&ints)
    }

    /// Release a buffer handle. Equivalent to dropping it.
    pub fn release_buffer<T: DeviceScalar>(&self, buffer: DeviceBuffer<T>) {
        drop(buffer);
    }

    pub(crate) fn release_raw(&self, raw: &RawBuffer) {
        self.inner.memory.credit(raw.len() * std::mem::size_of::<u32>());
        trace!(device = self.inner.id, buffer = raw.id(), "release buffer");
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.inner.memory.snapshot()
    }

    // Kernels

    /// Build and register the program bundled under `path`. Returns the
    /// number of kernels it added (0 if it was already loaded).
    pub fn load_program(&self, path: &str) -> Result<usize> {
        let program = programs::bundled(path).ok_or_else(|| DeviceError::KernelBuild {
            program: path.to_string(),
            code: vela_core::error::status::NOT_FOUND,
            reason: "no bundled program at this path".into(),
        })?;
        if self.inner.kernels.has_program(program.path) {
            return Ok(0);
        }
        self.inner.runtime.load_program(program)?;
        self.inner.kernels.register(program)
    }

    pub fn kernels_initialized(&self) -> bool {
        !self.inner.kernels.is_empty()
    }

    pub fn kernel_count(&self) -> usize {
        self.inner.kernels.len()
    }

    /// Argument builder for the kernel registered as `name`.
    pub fn kernel(&self, name: &str) -> Result<KernelFactory<'_>> {
        let (module, def) = self.inner.kernels.lookup(name)?;
        Ok(KernelFactory::new(self, module, def))
    }

    /// Wait for all submitted work; reports any kernel fault raised since
    /// the last synchronization point.
    pub fn synchronize(&self) -> Result<()> {
        self.inner.runtime.synchronize()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Device({}:{}, {})",
            self.inner.config.label,
            self.inner.id,
            self.inner.runtime.name()
        )
    }
}

impl BackendDevice for Device {
    fn name(&self) -> String {
        format!("{}:{}", self.inner.config.label, self.inner.id)
    }
}
