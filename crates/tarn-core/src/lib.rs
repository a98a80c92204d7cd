//! # tarn-core
//!
//! Lazy tensor execution engine.
//!
//! Operations on a [`Tensor`] record immutable graph nodes. Nothing runs
//! until a result is requested with [`Tensor::sync`], [`Tensor::fetch`] or a
//! host read. The [`Engine`] then plans the pending subgraph and dispatches
//! it onto a host stream and, per virtual accelerator, a copy stream and a
//! compute stream, overlapping uploads with computation.
//!
//! - Placement through RAII [`Scope`]s
//! - Strong and weak host views ([`DataView`], [`WeakDataView`])
//! - Process-wide [`liveness`] counters for leak checks
//! - User element kernels ([`KernelSource`]) compiled by `tarn-kernels`

pub mod array;
pub mod buffer;
pub mod config;
pub mod device;
pub mod dtype;
pub mod engine;
pub mod error;
mod exec;
pub mod liveness;
pub mod node;
pub mod ops;
pub mod prelude;
pub mod scope;
pub mod shape;
mod stream;
pub mod tensor;

pub use array::{ArrayData, IntoArray};
pub use buffer::{Buffer, HostData};
pub use config::EngineConfig;
pub use device::Device;
pub use dtype::{DType, Element};
pub use engine::{Engine, EngineStats};
pub use error::TarnError;
pub use liveness::Liveness;
pub use node::{BinaryOp, CompareOp, KernelSource, Node, Op, UnaryOp};
pub use scope::{is_grad_enabled, NoGradGuard, Scope};
pub use shape::Shape;
pub use tensor::{DataView, Tensor, WeakDataView};

pub type Result<T> = std::result::Result<T, TarnError>;
