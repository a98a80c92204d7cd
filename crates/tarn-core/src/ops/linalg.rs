use super::record;
use crate::node::Op;
use crate::{Result, Shape, TarnError, Tensor};

impl Tensor {
    /// 2-D matrix product: [M, K] @ [K, N] -> [M, N].
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        let (a, b) = (self.shape().dims(), other.shape().dims());
        if a.len() != 2 || b.len() != 2 {
            return Err(TarnError::ShapeMismatch {
                expected: vec![0, 0],
                got: if a.len() != 2 { a.to_vec() } else { b.to_vec() },
            });
        }
        if a[1] != b[0] {
            return Err(TarnError::ShapeMismatch {
                expected: vec![a[1], b[1]],
                got: b.to_vec(),
            });
        }
        let dtype = self.dtype().promote(other.dtype());
        record(Op::Matmul, &[self, other], Shape::new(&[a[0], b[1]]), dtype)
    }
}
