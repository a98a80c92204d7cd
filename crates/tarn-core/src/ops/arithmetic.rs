//! Element-wise arithmetic with broadcasting and dtype promotion.

use super::{broadcast_shape, record};
use crate::node::{BinaryOp, Op, UnaryOp};
use crate::{Result, Shape, TarnError, Tensor};

impl Tensor {
    /// Element-wise addition: self + other.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, BinaryOp::Add)
    }

    /// Element-wise subtraction: self - other.
    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, BinaryOp::Sub)
    }

    /// Element-wise multiplication: self * other.
    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, BinaryOp::Mul)
    }

    /// Element-wise division: self / other. Integer division by zero fails
    /// at materialization.
    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, BinaryOp::Div)
    }

    pub fn maximum(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, BinaryOp::Maximum)
    }

    pub fn minimum(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, BinaryOp::Minimum)
    }

    pub fn add_scalar(&self, value: f64) -> Result<Tensor> {
        self.add(&self.scalar_like(value)?)
    }

    pub fn mul_scalar(&self, value: f64) -> Result<Tensor> {
        self.mul(&self.scalar_like(value)?)
    }

    pub fn maximum_scalar(&self, value: f64) -> Result<Tensor> {
        self.maximum(&self.scalar_like(value)?)
    }

    /// max(self, 0).
    pub fn relu(&self) -> Result<Tensor> {
        self.maximum_scalar(0.0)
    }

    pub fn neg(&self) -> Result<Tensor> {
        unary_op(self, UnaryOp::Neg)
    }

    pub fn abs(&self) -> Result<Tensor> {
        unary_op(self, UnaryOp::Abs)
    }

    pub fn exp(&self) -> Result<Tensor> {
        unary_op(self, UnaryOp::Exp)
    }

    /// Natural logarithm.
    pub fn log(&self) -> Result<Tensor> {
        unary_op(self, UnaryOp::Log)
    }

    pub fn sqrt(&self) -> Result<Tensor> {
        unary_op(self, UnaryOp::Sqrt)
    }

    /// Rank-0 constant with this tensor's dtype and device.
    pub(crate) fn scalar_like(&self, value: f64) -> Result<Tensor> {
        self.engine().full_on(Shape::scalar(), value, self.dtype(), self.device())
    }
}

fn binary_op(a: &Tensor, b: &Tensor, op: BinaryOp) -> Result<Tensor> {
    let shape = broadcast_shape(a, b)?;
    let dtype = a.dtype().promote(b.dtype());
    record(Op::Binary(op), &[a, b], shape, dtype)
}

fn unary_op(a: &Tensor, op: UnaryOp) -> Result<Tensor> {
    let float_only = matches!(op, UnaryOp::Exp | UnaryOp::Log | UnaryOp::Sqrt);
    if float_only && !a.dtype().is_float() {
        return Err(TarnError::UnsupportedDType {
            op: Op::Unary(op).name(),
            dtype: a.dtype(),
        });
    }
    record(Op::Unary(op), &[a], a.shape().clone(), a.dtype())
}
