use crate::shape::Shape;

// Error — one error type for the whole library
//
// Every fallible operation in vela returns `Result<T>`. Errors fall into four
// families, exposed through `Error::kind()`:
//
//   InvalidArgument — shapes, ranks and dims that don't line up
//   OutOfBounds     — element indices or slice ranges past a dimension
//   InvalidState    — autograd misuse, wrong operation input counts
//   Device          — driver, kernel and buffer failures from the device runtime
//
// Device failures carry a nested `DeviceError` with the driver's status code
// so callers can still match on the underlying status.

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    OutOfBounds,
    InvalidState,
    Device,
}

/// All errors that can occur within vela.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors (e.g., in-place add of [2,3] into [4,5]).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operation requires a specific rank (number of dimensions).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Two shapes cannot be broadcast against each other.
    #[error("shapes {lhs} and {rhs} are not broadcast-compatible")]
    NotBroadcastable { lhs: Shape, rhs: Shape },

    /// Element count mismatch when creating from a vec.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Matrix multiplication dimension mismatch.
    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}], inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// Cannot reshape because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// More slice ranges than the tensor has dimensions.
    #[error("too many slice ranges: {ranges} ranges for tensor with {rank} dimensions")]
    TooManySliceRanges { ranges: usize, rank: usize },

    /// A slice range that does not fit its dimension.
    #[error("slice out of bounds on dim {dim}: {start}..{end} step {step}, dim size {size}")]
    SliceOutOfBounds {
        dim: usize,
        start: usize,
        end: usize,
        step: usize,
        size: usize,
    },

    /// Element index outside a dimension.
    #[error("index {index} out of bounds for dim {dim} with size {size}")]
    IndexOutOfBounds {
        dim: usize,
        index: usize,
        size: usize,
    },

    /// Element access with the wrong number of indices.
    #[error("expected {expected} indices, got {got}")]
    IndexRankMismatch { expected: usize, got: usize },

    /// Tried to access a scalar from a non-scalar tensor.
    #[error("not a scalar: tensor has shape {shape}")]
    NotAScalar { shape: Shape },

    /// An operation received the wrong number of inputs.
    #[error("{op} expects {expected} inputs, got {got}")]
    WrongInputCount {
        op: &'static str,
        expected: usize,
        got: usize,
    },

    /// backward() on a tensor that never had gradients enabled.
    #[error("tensor has no autograd context; call with_grad() before backward()")]
    NoAutogradContext,

    /// A gradient rule needed forward state that is no longer available.
    #[error("invalid autograd state: {0}")]
    InvalidState(String),

    /// A storage or autograd lock was poisoned by a panicking thread.
    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),

    /// Failure reported by the device runtime.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::IndexOutOfBounds { .. } | Error::SliceOutOfBounds { .. } => {
                ErrorKind::OutOfBounds
            }
            Error::NoAutogradContext
            | Error::InvalidState(_)
            | Error::LockPoisoned(_)
            | Error::WrongInputCount { .. } => ErrorKind::InvalidState,
            Error::Device(_) => ErrorKind::Device,
            _ => ErrorKind::InvalidArgument,
        }
    }
}

// DeviceError — failures from the device runtime
//
// Codes use the CUDA driver's status numbering (`CUresult`). Failures the
// driver reports keep the driver's own value; failures caught before any
// driver call (argument checks, registry lookups, the memory limit) report
// the status the driver uses for the same condition. Program builds report
// the NVRTC status.

/// Driver status values reported for failures detected on the host side.
pub mod status {
    pub const INVALID_VALUE: i32 = 1;
    pub const OUT_OF_MEMORY: i32 = 2;
    pub const NOT_INITIALIZED: i32 = 3;
    pub const NO_DEVICE: i32 = 100;
    pub const INVALID_CONTEXT: i32 = 201;
    pub const NOT_FOUND: i32 = 500;
    pub const ILLEGAL_ADDRESS: i32 = 700;
    pub const UNKNOWN: i32 = 999;
}

/// Error raised by the device runtime (driver, kernels, buffers).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("failed to build kernel program {program} (status {code}): {reason}")]
    KernelBuild {
        program: String,
        code: i32,
        reason: String,
    },

    #[error("kernel {name} is not registered on this device")]
    UnknownKernel { name: String },

    #[error("device kernels are not initialized; call init_kernels first")]
    KernelsNotInitialized,

    #[error("invalid arguments for kernel {kernel}: {reason}")]
    KernelArgs { kernel: String, reason: String },

    #[error("invalid work size for kernel {kernel}: {reason}")]
    InvalidWorkSize { kernel: String, reason: String },

    #[error("failed to allocate {bytes} bytes: {reason}")]
    Allocation { bytes: usize, reason: String },

    #[error("kernel {kernel} faulted: {reason}")]
    KernelFault { kernel: String, reason: String },

    /// A driver call failed; `code` is the driver's status value.
    #[error("{call} failed with status {code}: {message}")]
    Driver {
        call: String,
        code: i32,
        message: String,
    },

    #[error("command queue is unavailable: {0}")]
    QueueLost(String),

    #[error("buffer belongs to a different device")]
    DeviceMismatch,

    #[error("device runtime unavailable: {0}")]
    Unavailable(String),
}

impl DeviceError {
    /// Numeric status of the failure.
    pub fn code(&self) -> i32 {
        match self {
            DeviceError::KernelBuild { code, .. } | DeviceError::Driver { code, .. } => *code,
            DeviceError::UnknownKernel { .. } => status::NOT_FOUND,
            DeviceError::KernelsNotInitialized => status::NOT_INITIALIZED,
            DeviceError::KernelArgs { .. } | DeviceError::InvalidWorkSize { .. } => {
                status::INVALID_VALUE
            }
            DeviceError::Allocation { .. } => status::OUT_OF_MEMORY,
            DeviceError::KernelFault { .. } => status::ILLEGAL_ADDRESS,
            DeviceError::QueueLost(_) => status::UNKNOWN,
            DeviceError::DeviceMismatch => status::INVALID_CONTEXT,
            DeviceError::Unavailable(_) => status::NO_DEVICE,
        }
    }
}

/// Convenience Result type used throughout vela.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_classify_variants() {
        let oob = Error::IndexOutOfBounds {
            dim: 0,
            index: 4,
            size: 3,
        };
        assert_eq!(oob.kind(), ErrorKind::OutOfBounds);
        assert_eq!(Error::NoAutogradContext.kind(), ErrorKind::InvalidState);
        let dev: Error = DeviceError::KernelsNotInitialized.into();
        assert_eq!(dev.kind(), ErrorKind::Device);
        let shape = Error::ShapeMismatch {
            expected: Shape::from(3),
            got: Shape::from(4),
        };
        assert_eq!(shape.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn device_errors_keep_codes() {
        let e = DeviceError::UnknownKernel {
            name: "missing".into(),
        };
        assert_eq!(e.code(), status::NOT_FOUND);
        assert!(e.to_string().contains("missing"));
        let driver = DeviceError::Driver {
            call: "cuMemAlloc".into(),
            code: 2,
            message: "out of memory".into(),
        };
        assert_eq!(driver.code(), 2);
    }
}
