//! Shape, dtype and gradient-boundary manipulation.

use super::record;
use crate::node::Op;
use crate::{DType, Result, Shape, TarnError, Tensor};

impl Tensor {
    /// Repeat along broadcast axes to reach `shape`.
    pub fn broadcast_to(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        if !self.shape().broadcasts_to(&shape) {
            return Err(TarnError::BroadcastError {
                a: self.shape().dims().to_vec(),
                b: shape.dims().to_vec(),
            });
        }
        if &shape == self.shape() {
            return Ok(self.clone());
        }
        record(Op::BroadcastTo, &[self], shape, self.dtype())
    }

    /// Same elements under a new shape; one dimension may be `-1`.
    /// Shares the input buffer.
    pub fn reshape(&self, dims: &[isize]) -> Result<Tensor> {
        let shape = self
            .shape()
            .resolve_reshape(dims)
            .ok_or_else(|| TarnError::InvalidReshape {
                from: self.shape().dims().to_vec(),
                to: dims.to_vec(),
            })?;
        record(Op::Reshape, &[self], shape, self.dtype())
    }

    /// Swap the last two axes.
    pub fn transpose(&self) -> Result<Tensor> {
        let shape = self.shape().transpose().ok_or(TarnError::InvalidAxis {
            axis: 1,
            ndim: self.ndim(),
        })?;
        record(Op::Transpose, &[self], shape, self.dtype())
    }

    /// Same values, but gradients stop here.
    pub fn stop_grad(&self) -> Result<Tensor> {
        record(Op::Detach, &[self], self.shape().clone(), self.dtype())
    }

    /// Alias for [`stop_grad`](Tensor::stop_grad).
    pub fn detach(&self) -> Result<Tensor> {
        self.stop_grad()
    }

    pub fn cast(&self, dtype: DType) -> Result<Tensor> {
        record(Op::Cast, &[self], self.shape().clone(), dtype)
    }

    pub fn zeros_like(&self) -> Result<Tensor> {
        self.full_like(0.0)
    }

    pub fn ones_like(&self) -> Result<Tensor> {
        self.full_like(1.0)
    }

    /// Constant with this tensor's shape, dtype and device.
    pub fn full_like(&self, value: f64) -> Result<Tensor> {
        self.engine()
            .full_on(self.shape().clone(), value, self.dtype(), self.device())
    }
}

#[cfg(test)]
mod tests {
    use crate::{DType, Device, Engine, EngineConfig, TarnError};

    fn engine() -> Engine {
        Engine::new(EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_reshape_shares_buffer() {
        let e = engine();
        let x = e.array(vec![1i64, 2, 3, 4, 5, 6]).unwrap();
        let y = x.reshape(&[2, -1]).unwrap();
        assert_eq!(y.shape().dims(), &[2, 3]);
        assert!(y.sync().unwrap().ptr_eq(&x.sync().unwrap()));
        assert!(matches!(x.reshape(&[4, -1]), Err(TarnError::InvalidReshape { .. })));
    }

    #[test]
    fn test_reshape_on_accelerator() {
        let e = engine();
        let scope = e.scope(Device::Accel(0)).unwrap();
        let x = scope.array(vec![1.0f32, 2.0, 3.0]).unwrap();
        let y = x.reshape(&[1, 3]).unwrap();
        assert_eq!(y.device(), Device::Accel(0));
        assert_eq!(y.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
        let z = y.mul_scalar(2.0).unwrap().reshape(&[3]).unwrap();
        assert_eq!(z.to_vec::<f32>().unwrap(), vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_transpose_and_broadcast() {
        let e = engine();
        let x = e.array(vec![vec![1i32, 2, 3], vec![4, 5, 6]]).unwrap();
        let t = x.transpose().unwrap();
        assert_eq!(t.shape().dims(), &[3, 2]);
        assert_eq!(t.to_vec::<i32>().unwrap(), vec![1, 4, 2, 5, 3, 6]);
        assert!(matches!(e.array(vec![1i32]).unwrap().transpose(), Err(TarnError::InvalidAxis { .. })));

        let b = e.array(vec![1i32, 2]).unwrap().reshape(&[2, 1]).unwrap().broadcast_to([2, 3]).unwrap();
        assert_eq!(b.to_vec::<i32>().unwrap(), vec![1, 1, 1, 2, 2, 2]);
    }

    #[test]
    fn test_stop_grad_and_cast() {
        let e = engine();
        let x = e.array(vec![1.5f64, -2.5]).unwrap();
        let d = x.stop_grad().unwrap();
        assert!(d.is_stop_grad());
        assert!(!x.is_stop_grad());
        let c = x.cast(DType::I32).unwrap();
        assert_eq!(c.to_vec::<i32>().unwrap(), vec![1, -2]);
        let f = x.full_like(7.0).unwrap();
        assert_eq!(f.to_vec::<f64>().unwrap(), vec![7.0, 7.0]);
    }
}
