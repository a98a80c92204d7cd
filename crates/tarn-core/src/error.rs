//! Error type shared by every fallible Tarn operation.

use tarn_kernels::KernelError;

use crate::{DType, Device};

/// Errors are `Clone` so a failed node can hand the same error to every
/// dependent and every waiter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TarnError {
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("cannot broadcast shapes {a:?} and {b:?}")]
    BroadcastError { a: Vec<usize>, b: Vec<usize> },

    #[error("cannot reshape {from:?} into {to:?}")]
    InvalidReshape { from: Vec<usize>, to: Vec<isize> },

    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("axis {axis} out of range for {ndim}-d tensor")]
    InvalidAxis { axis: usize, ndim: usize },

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("{op} does not support dtype {dtype}")]
    UnsupportedDType { op: &'static str, dtype: DType },

    #[error("device {device} unavailable ({available} accelerator(s) configured)")]
    DeviceUnavailable { device: Device, available: usize },

    #[error("invalid kernel: {0}")]
    InvalidKernel(String),

    #[error("kernel '{kernel}' failed to compile at {line}:{column}: {message}")]
    KernelCompilation {
        kernel: String,
        line: usize,
        column: usize,
        message: String,
    },

    #[error("kernel '{kernel}' failed: {message}")]
    KernelExecution { kernel: String, message: String },

    #[error("ragged array: {0}")]
    RaggedArray(String),

    #[error("execution engine has shut down")]
    EngineShutdown,

    #[error("configuration error: {0}")]
    Config(String),
}

impl TarnError {
    /// Attach a kernel name to a kernel-language error.
    pub fn from_kernel(kernel: &str, err: KernelError) -> Self {
        match err {
            KernelError::Syntax { line, column, message } => TarnError::KernelCompilation {
                kernel: kernel.to_string(),
                line,
                column,
                message,
            },
            KernelError::Execution(message) | KernelError::Operands(message) => TarnError::KernelExecution {
                kernel: kernel.to_string(),
                message,
            },
        }
    }
}

impl From<KernelError> for TarnError {
    fn from(err: KernelError) -> Self {
        TarnError::from_kernel("anonymous", err)
    }
}
