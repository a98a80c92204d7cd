//! # tarn-kernels
//!
//! The custom element-kernel language used by Tarn.
//!
//! Provides:
//! - A tokenizer and recursive-descent parser for a small C-like subset
//! - Compile-time resolution of `@out(..)`, `@inK(..)` and shape variables
//! - A bounds-checked interpreter over typed host slices
//! - A bounded, process-wide LRU cache of compiled programs

pub mod cache;
pub mod error;
pub mod interp;
pub mod ir;
pub mod lexer;
pub mod parser;

pub use cache::{compile, CacheStats, ProgramCache};
pub use error::KernelError;
pub use interp::{ArgData, OutData, Scalar, TensorArg, TensorOut, Value};
pub use ir::{Program, Signature};
pub use parser::parse;
