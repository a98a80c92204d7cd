//! Convenience re-exports for common tarn-core types.
//!
//! ```rust
//! use tarn_core::prelude::*;
//! ```

pub use crate::DType;
pub use crate::Device;
pub use crate::Engine;
pub use crate::EngineConfig;
pub use crate::KernelSource;
pub use crate::NoGradGuard;
pub use crate::Result;
pub use crate::Scope;
pub use crate::Shape;
pub use crate::TarnError;
pub use crate::Tensor;
