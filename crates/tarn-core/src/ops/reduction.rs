//! Reductions.

use super::record;
use crate::node::Op;
use crate::{DType, Result, Shape, TarnError, Tensor};

impl Tensor {
    /// Sum of all elements as a rank-0 tensor.
    pub fn sum(&self) -> Result<Tensor> {
        record(Op::Sum, &[self], Shape::scalar(), self.dtype())
    }

    /// Mean of all elements. Integer tensors are averaged as `F32`.
    pub fn mean(&self) -> Result<Tensor> {
        let x = if self.dtype().is_integer() {
            self.cast(DType::F32)?
        } else {
            self.clone()
        };
        x.sum()?.mul_scalar(1.0 / self.numel() as f64)
    }

    /// Sum over broadcast axes so the result has `shape`. The inverse of
    /// [`broadcast_to`](Tensor::broadcast_to).
    pub fn reduce_to(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        if !shape.broadcasts_to(self.shape()) {
            return Err(TarnError::BroadcastError {
                a: self.shape().dims().to_vec(),
                b: shape.dims().to_vec(),
            });
        }
        if &shape == self.shape() {
            return Ok(self.clone());
        }
        record(Op::ReduceTo, &[self], shape, self.dtype())
    }
}
