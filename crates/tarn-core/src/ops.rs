//! Graph-building tensor operations.
//!
//! Every operation records a new node and returns at once. Shape and dtype
//! errors are reported here; execution errors surface on materialization.
//! A result lives on the device of its first input.

pub mod arithmetic;
pub mod comparison;
pub mod linalg;
pub mod manipulation;
pub mod reduction;

use std::sync::Arc;

use crate::node::Op;
use crate::{DType, Result, Shape, TarnError, Tensor};

/// Record `op` over `inputs`, placed on the first input's device.
pub(crate) fn record(op: Op, inputs: &[&Tensor], shape: Shape, dtype: DType) -> Result<Tensor> {
    let first = inputs
        .first()
        .ok_or_else(|| TarnError::InvalidKernel(format!("{} needs at least one input", op.name())))?;
    let engine = first.engine();
    for t in &inputs[1..] {
        engine.check_same_engine(t)?;
    }
    let nodes = inputs.iter().map(|t| Arc::clone(t.node())).collect();
    engine.record(op, nodes, shape, dtype, first.device())
}

/// Broadcast shape of two operands.
pub(crate) fn broadcast_shape(a: &Tensor, b: &Tensor) -> Result<Shape> {
    a.shape().broadcast_with(b.shape()).ok_or_else(|| TarnError::BroadcastError {
        a: a.shape().dims().to_vec(),
        b: b.shape().dims().to_vec(),
    })
}
