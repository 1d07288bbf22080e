// Kernels — named compute kernels, their registry and the launch builder
//
// A kernel is a named entry point with a declared parameter list. Kernels are
// grouped into programs addressed by resource path ("kernels/elementwise",
// ...); a program carries the CUDA C source of its kernels plus an emulated
// body per kernel for the in-process runtime. `init_kernels` builds and
// registers every bundled program on a device; after that,
// `device.kernel(name)` hands out a `KernelFactory` that collects arguments
// in declaration order and launches:
//
//   device.kernel("scalar")?
//       .arg_buffer(&input)
//       .arg_buffer(&out)
//       .arg_int(op.code())
//       .arg_float(2.0)
//       .arg_usize(n)
//       .global(&[n])
//       .launch()?;
//
// Argument lists are validated against the declaration before anything
// reaches the runtime, so the declaration must match the CUDA signature
// (f32 buffer = `float*`, index buffer = `int*`, int = `int`, float =
// `float`). The global size is rounded up to a multiple of the local size,
// so kernels must ignore ids past their problem size.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use tracing::{debug, trace};
use vela_core::{DeviceError, Error, Result};

use crate::buffer::{DeviceBuffer, ElemKind, RawBuffer};
use crate::device::Device;
use crate::runtime::emulator::KernelFn;

/// Largest work-group (block) a launch may request.
pub const MAX_WORK_GROUP_SIZE: usize = 1024;
/// Largest z extent of a work-group.
pub const MAX_WORK_GROUP_Z: usize = 64;

// Declarations

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// f32 data buffer
    Buffer,
    /// i32 index/descriptor buffer
    Indices,
    Int,
    Float,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParamKind::Buffer => "f32 buffer",
            ParamKind::Indices => "index buffer",
            ParamKind::Int => "int",
            ParamKind::Float => "float",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    pub name: &'static str,
    pub kind: ParamKind,
}

impl Param {
    pub const fn buffer(name: &'static str) -> Self {
        Param {
            name,
            kind: ParamKind::Buffer,
        }
    }

    pub const fn indices(name: &'static str) -> Self {
        Param {
            name,
            kind: ParamKind::Indices,
        }
    }

    pub const fn int(name: &'static str) -> Self {
        Param {
            name,
            kind: ParamKind::Int,
        }
    }

    pub const fn float(name: &'static str) -> Self {
        Param {
            name,
            kind: ParamKind::Float,
        }
    }
}

/// A kernel as bundled in a program.
pub struct KernelDef {
    pub name: &'static str,
    pub params: &'static [Param],
    /// Body run by the emulator, once per work item.
    pub emulated: KernelFn,
}

impl fmt::Debug for KernelDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelDef")
            .field("name", &self.name)
            .field("params", &self.params.len())
            .finish()
    }
}

/// A group of kernels built and loaded together from one resource path.
#[derive(Debug)]
pub struct Program {
    pub path: &'static str,
    /// CUDA C source defining every kernel in `kernels` as `extern "C"`.
    pub source: &'static str,
    pub kernels: &'static [KernelDef],
}

// Launch — a validated kernel invocation handed to the runtime

#[derive(Debug, Clone)]
pub(crate) enum KernelArg {
    Buffer(Arc<RawBuffer>),
    Int(i32),
    Float(f32),
}

pub(crate) struct Launch {
    module: &'static str,
    def: &'static KernelDef,
    args: Vec<KernelArg>,
    global: [usize; 3],
    local: [usize; 3],
}

impl Launch {
    /// Resource path of the program the kernel was loaded from.
    pub(crate) fn module(&self) -> &'static str {
        self.module
    }

    pub(crate) fn name(&self) -> &'static str {
        self.def.name
    }

    pub(crate) fn def(&self) -> &'static KernelDef {
        self.def
    }

    pub(crate) fn args(&self) -> &[KernelArg] {
        &self.args
    }

    /// Rounded up to whole work-groups.
    pub(crate) fn global(&self) -> [usize; 3] {
        self.global
    }

    pub(crate) fn local(&self) -> [usize; 3] {
        self.local
    }
}

// Registry — per-device table of loaded kernels

#[derive(Default)]
pub(crate) struct KernelRegistry {
    kernels: RwLock<HashMap<&'static str, (&'static str, &'static KernelDef)>>,
    programs: RwLock<Vec<&'static str>>,
}

impl KernelRegistry {
    pub(crate) fn has_program(&self, path: &str) -> bool {
        self.programs
            .read()
            .map(|p| p.iter().any(|&loaded| loaded == path))
            .unwrap_or(false)
    }

    /// Register every kernel of `program`. Loading the same program twice is
    /// a no-op; a kernel name already provided by another program is a
    /// build failure.
    pub(crate) fn register(&self, program: &'static Program) -> Result<usize> {
        let mut programs = self
            .programs
            .write()
            .map_err(|_| Error::LockPoisoned("kernel registry"))?;
        if programs.contains(&program.path) {
            return Ok(0);
        }
        let mut kernels = self
            .kernels
            .write()
            .map_err(|_| Error::LockPoisoned("kernel registry"))?;
        for def in program.kernels {
            if def.name.is_empty() || kernels.contains_key(def.name) {
                return Err(DeviceError::KernelBuild {
                    program: program.path.to_string(),
                    code: vela_core::error::status::INVALID_VALUE,
                    reason: format!("duplicate or empty kernel name {:?}", def.name),
                }
                .into());
            }
        }
        for def in program.kernels {
            kernels.insert(def.name, (program.path, def));
        }
        programs.push(program.path);
        debug!(
            program = program.path,
            kernels = program.kernels.len(),
            "registered program"
        );
        Ok(program.kernels.len())
    }

    /// (program path, declaration) of kernel `name`.
    pub(crate) fn lookup(&self, name: &str) -> Result<(&'static str, &'static KernelDef)> {
        let kernels = self
            .kernels
            .read()
            .map_err(|_| Error::LockPoisoned("kernel registry"))?;
        if kernels.is_empty() {
            return Err(DeviceError::KernelsNotInitialized.into());
        }
        kernels.get(name).copied().ok_or_else(|| {
            DeviceError::UnknownKernel {
                name: name.to_string(),
            }
            .into()
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.kernels.read().map(|k| k.is_empty()).unwrap_or(true)
    }

    pub(crate) fn len(&self) -> usize {
        self.kernels.read().map(|k| k.len()).unwrap_or(0)
    }
}

// KernelFactory — argument builder and launcher

/// Collects the arguments and work size of one launch.
pub struct KernelFactory<'d> {
    device: &'d Device,
    module: &'static str,
    def: &'static KernelDef,
    args: Vec<(ParamKind, KernelArg)>,
    global: Vec<usize>,
    local: Option<Vec<usize>>,
    error: Option<DeviceError>,
}

impl<'d> KernelFactory<'d> {
    pub(crate) fn new(device: &'d Device, module: &'static str, def: &'static KernelDef) -> Self {
        KernelFactory {
            device,
            module,
            def,
            args: Vec::with_capacity(def.params.len()),
            global: Vec::new(),
            local: None,
            error: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.def.name
    }

    fn buffer_arg(mut self, raw: &Arc<RawBuffer>) -> Self {
        let kind = match raw.kind() {
            ElemKind::F32 => ParamKind::Buffer,
            ElemKind::I32 => ParamKind::Indices,
        };
        if raw.device_id() != self.device.id() && self.error.is_none() {
            self.error = Some(DeviceError::DeviceMismatch);
        }
        self.args.push((kind, KernelArg::Buffer(Arc::clone(raw))));
        self
    }

    pub fn arg_buffer(self, buffer: &DeviceBuffer<f32>) -> Self {
        self.buffer_arg(buffer.raw())
    }

    pub fn arg_index(self, buffer: &DeviceBuffer<i32>) -> Self {
        self.buffer_arg(buffer.raw())
    }

    pub fn arg_int(mut self, value: i32) -> Self {
        self.args.push((ParamKind::Int, KernelArg::Int(value)));
        self
    }

    /// An int argument from a host size; overflow is reported at launch.
    pub fn arg_usize(mut self, value: usize) -> Self {
        match i32::try_from(value) {
            Ok(v) => self.args.push((ParamKind::Int, KernelArg::Int(v))),
            Err(_) => {
                if self.error.is_none() {
                    self.error = Some(DeviceError::KernelArgs {
                        kernel: self.def.name.to_string(),
                        reason: format!("argument {} does not fit in i32: {value}", self.args.len()),
                    });
                }
                self.args.push((ParamKind::Int, KernelArg::Int(0)));
            }
        }
        self
    }

    pub fn arg_float(mut self, value: f32) -> Self {
        self.args.push((ParamKind::Float, KernelArg::Float(value)));
        self
    }

    /// Global work size, 1 to 3 dims.
    pub fn global(mut self, size: &[usize]) -> Self {
        self.global = size.to_vec();
        self
    }

    /// Local (work-group) size; defaults to the device's `local_size` along
    /// dim 0.
    pub fn local(mut self, size: &[usize]) -> Self {
        self.local = Some(size.to_vec());
        self
    }

    fn check_args(&self) -> std::result::Result<(), DeviceError> {
        let kernel = self.def.name;
        if self.args.len() != self.def.params.len() {
            return Err(DeviceError::KernelArgs {
                kernel: kernel.to_string(),
                reason: format!(
                    "expected {} arguments, got {}",
                    self.def.params.len(),
                    self.args.len()
                ),
            });
        }
        for (i, (param, (kind, _))) in self.def.params.iter().zip(&self.args).enumerate() {
            if param.kind != *kind {
                return Err(DeviceError::KernelArgs {
                    kernel: kernel.to_string(),
                    reason: format!("argument {i} ({}) expects {}, got {kind}", param.name, param.kind),
                });
            }
        }
        Ok(())
    }

    fn work_size(&self) -> std::result::Result<Option<([usize; 3], [usize; 3])>, DeviceError> {
        let invalid = |reason: String| DeviceError::InvalidWorkSize {
            kernel: self.def.name.to_string(),
            reason,
        };
        let dims = self.global.len();
        if !(1..=3).contains(&dims) {
            return Err(invalid(format!("global size must have 1 to 3 dims, got {dims}")));
        }
        let local = match &self.local {
            Some(l) if l.len() != dims => {
                return Err(invalid(format!(
                    "local size has {} dims, global has {dims}",
                    l.len()
                )))
            }
            Some(l) => l.clone(),
            None => {
                let mut l = vec![1; dims];
                l[0] = self.device.config().local_size;
                l
            }
        };
        if local.iter().any(|&l| l == 0) {
            return Err(invalid("local size must be non-zero".into()));
        }
        if dims == 3 && local[2] > MAX_WORK_GROUP_Z {
            return Err(invalid(format!(
                "work-group z extent {} exceeds {MAX_WORK_GROUP_Z}",
                local[2]
            )));
        }
        let group: usize = local.iter().product();
        if group > MAX_WORK_GROUP_SIZE {
            return Err(invalid(format!(
                "work-group of {group} items exceeds {MAX_WORK_GROUP_SIZE}"
            )));
        }
        if self.global.iter().any(|&g| g == 0) {
            return Ok(None);
        }
        let mut g3 = [1usize; 3];
        let mut l3 = [1usize; 3];
        for d in 0..dims {
            l3[d] = local[d];
            g3[d] = self.global[d].div_ceil(local[d]) * local[d];
        }
        Ok(Some((g3, l3)))
    }

    /// Validate and submit. Returns once the runtime has the launch queued;
    /// the kernel itself runs asynchronously.
    pub fn launch(self) -> Result<()> {
        if let Some(e) = self.error {
            return Err(e.into());
        }
        self.check_args()?;
        let Some((global, local)) = self.work_size()? else {
            trace!(kernel = self.def.name, "empty launch skipped");
            return Ok(());
        };
        trace!(kernel = self.def.name, ?global, ?local, "launch");
        let launch = Launch {
            module: self.module,
            def: self.def,
            args: self.args.into_iter().map(|(_, a)| a).collect(),
            global,
            local,
        };
        self.device.runtime().launch(launch)
    }
}
