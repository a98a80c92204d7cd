//! Errors raised while compiling or running kernel fragments.

/// Kernel-language errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KernelError {
    #[error("{line}:{column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("kernel execution failed: {0}")]
    Execution(String),

    #[error("operand mismatch: {0}")]
    Operands(String),
}

impl KernelError {
    pub(crate) fn syntax(line: usize, column: usize, message: impl Into<String>) -> Self {
        KernelError::Syntax {
            line,
            column,
            message: message.into(),
        }
    }
}
