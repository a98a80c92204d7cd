//! Comparison operations on tensors.

use super::{broadcast_shape, record};
use crate::node::{CompareOp, Op};
use crate::{Result, Tensor};

impl Tensor {
    /// Element-wise greater-than. Returns 1 where self > other, 0 elsewhere.
    pub fn gt(&self, other: &Tensor) -> Result<Tensor> {
        cmp_op(self, other, CompareOp::Gt)
    }

    pub fn ge(&self, other: &Tensor) -> Result<Tensor> {
        cmp_op(self, other, CompareOp::Ge)
    }

    pub fn lt(&self, other: &Tensor) -> Result<Tensor> {
        cmp_op(self, other, CompareOp::Lt)
    }

    pub fn le(&self, other: &Tensor) -> Result<Tensor> {
        cmp_op(self, other, CompareOp::Le)
    }

    /// Exact element-wise equality.
    pub fn eq_tensor(&self, other: &Tensor) -> Result<Tensor> {
        cmp_op(self, other, CompareOp::Eq)
    }
}

fn cmp_op(a: &Tensor, b: &Tensor, op: CompareOp) -> Result<Tensor> {
    let shape = broadcast_shape(a, b)?;
    let dtype = a.dtype().promote(b.dtype());
    record(Op::Compare(op), &[a, b], shape, dtype)
}
