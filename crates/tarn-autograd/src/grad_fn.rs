//! Vector-Jacobian products for every differentiable op.

use tarn_core::{BinaryOp, Op, Result, Tensor, UnaryOp};

/// Gradients for each input of `out` given the gradient of `out`.
///
/// `None` means no gradient flows to that input.
pub fn vjp(out: &Tensor, grad: &Tensor) -> Result<Vec<Option<Tensor>>> {
    let inputs = out.inputs();

    Ok(match out.op() {
        Op::Leaf | Op::Fill(_) => Vec::new(),
        Op::Compare(_) | Op::Custom(_) | Op::Detach => vec![None; inputs.len()],

        Op::Binary(op) => {
            let (a, b) = (&inputs[0], &inputs[1]);
            let (ga, gb) = binary(*op, a, b, grad)?;
            vec![Some(ga.reduce_to(a.shape().clone())?), Some(gb.reduce_to(b.shape().clone())?)]
        }

        Op::Unary(op) => {
            let x = &inputs[0];
            let g = match op {
                UnaryOp::Neg => grad.neg()?,
                // d/dx e^x = e^x, the node itself
                UnaryOp::Exp => grad.mul(out)?,
                UnaryOp::Log => grad.div(x)?,
                UnaryOp::Sqrt => grad.div(&out.mul_scalar(2.0)?)?,
                UnaryOp::Abs => {
                    let zero = x.zeros_like()?;
                    let sign = x.gt(&zero)?.sub(&x.lt(&zero)?)?;
                    grad.mul(&sign)?
                }
            };
            vec![Some(g)]
        }

        Op::Sum | Op::ReduceTo => vec![Some(grad.broadcast_to(inputs[0].shape().clone())?)],
        Op::BroadcastTo => vec![Some(grad.reduce_to(inputs[0].shape().clone())?)],
        Op::Reshape => {
            let dims: Vec<isize> = inputs[0].shape().dims().iter().map(|&d| d as isize).collect();
            vec![Some(grad.reshape(&dims)?)]
        }
        Op::Transpose => vec![Some(grad.transpose()?)],
        Op::Matmul => {
            let (a, b) = (&inputs[0], &inputs[1]);
            vec![
                Some(grad.matmul(&b.transpose()?)?),
                Some(a.transpose()?.matmul(grad)?),
            ]
        }
        Op::Cast => {
            let x = &inputs[0];
            if x.dtype().is_float() {
                vec![Some(grad.cast(x.dtype())?)]
            } else {
                vec![None]
            }
        }
    })
}

/// Unreduced gradients of a broadcasting binary op.
fn binary(op: BinaryOp, a: &Tensor, b: &Tensor, g: &Tensor) -> Result<(Tensor, Tensor)> {
    Ok(match op {
        BinaryOp::Add => (g.clone(), g.clone()),
        BinaryOp::Sub => (g.clone(), g.neg()?),
        BinaryOp::Mul => (g.mul(b)?, g.mul(a)?),
        BinaryOp::Div => {
            // d/db a/b = -a / b^2
            let gb = g.mul(a)?.div(&b.mul(b)?)?.neg()?;
            (g.div(b)?, gb)
        }
        // ties send the gradient to `b`
        BinaryOp::Maximum => (g.mul(&a.gt(b)?)?, g.mul(&a.le(b)?)?),
        BinaryOp::Minimum => (g.mul(&a.lt(b)?)?, g.mul(&a.ge(b)?)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarn_core::{Engine, EngineConfig};

    #[test]
    fn test_mul_vjp_reduces_broadcast() {
        let e = Engine::new(EngineConfig::default()).unwrap();
        let a = e.array(vec![vec![1.0f64, 2.0], vec![3.0, 4.0]]).unwrap();
        let b = e.array(vec![10.0f64, 100.0]).unwrap();
        let out = a.mul(&b).unwrap();
        let grads = vjp(&out, &out.ones_like().unwrap()).unwrap();
        let ga = grads[0].as_ref().unwrap();
        let gb = grads[1].as_ref().unwrap();
        assert_eq!(ga.to_vec::<f64>().unwrap(), vec![10.0, 100.0, 10.0, 100.0]);
        assert_eq!(gb.shape().dims(), &[2]);
        assert_eq!(gb.to_vec::<f64>().unwrap(), vec![4.0, 6.0]);
    }

    #[test]
    fn test_compare_has_no_gradient() {
        let e = Engine::new(EngineConfig::default()).unwrap();
        let a = e.array(vec![1.0f32]).unwrap();
        let out = a.gt(&a).unwrap();
        let grads = vjp(&out, &out.ones_like().unwrap()).unwrap();
        assert!(grads.iter().all(Option::is_none));
    }
}
