//! # tarn-autograd
//!
//! Reverse-mode differentiation over Tarn's lazy graphs.
//!
//! Gradients are ordinary lazy tensors built from the recorded forward
//! nodes, so they are scheduled and materialized like any other result.
//!
//! - Reverse topological traversal from the output
//! - Per-op vector-Jacobian products with broadcast reduction
//! - Stop-gradient, comparison, custom-kernel and integer boundaries

pub mod backward;
pub mod grad_fn;
pub mod graph;

pub use backward::{grad, grad_many};
