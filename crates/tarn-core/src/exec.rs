//! Element kernels: compute one node from its materialized inputs.
//!
//! The same kernels serve the host and the accelerator streams; only where
//! the operands live differs.

use std::borrow::Cow;

use rayon::prelude::*;
use tarn_kernels::{Signature, TensorArg, TensorOut};

use crate::buffer::HostData;
use crate::dtype::Element;
use crate::node::{BinaryOp, CompareOp, KernelSource, Node, Op, UnaryOp};
use crate::shape::broadcast_index;
use crate::{DType, Result, Shape, TarnError};

const PAR_THRESHOLD: usize = 8192;

/// Arithmetic shared by every element type.
trait Arith: Element {
    fn zero() -> Self;
    fn one() -> Self;
    fn add(a: Self, b: Self) -> Self;
    fn mul(a: Self, b: Self) -> Self;
    /// `None` for integer division by zero.
    fn binary(op: BinaryOp, a: Self, b: Self) -> Option<Self>;
    fn unary(op: UnaryOp, a: Self) -> Self;
}

macro_rules! impl_arith_float {
    ($t:ty) => {
        impl Arith for $t {
            fn zero() -> Self {
                0.0
            }
            fn one() -> Self {
                1.0
            }
            fn add(a: Self, b: Self) -> Self {
                a + b
            }
            fn mul(a: Self, b: Self) -> Self {
                a * b
            }
            fn binary(op: BinaryOp, a: Self, b: Self) -> Option<Self> {
                Some(match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Maximum => a.max(b),
                    BinaryOp::Minimum => a.min(b),
                })
            }
            fn unary(op: UnaryOp, a: Self) -> Self {
                match op {
                    UnaryOp::Neg => -a,
                    UnaryOp::Exp => a.exp(),
                    UnaryOp::Log => a.ln(),
                    UnaryOp::Sqrt => a.sqrt(),
                    UnaryOp::Abs => a.abs(),
                }
            }
        }
    };
}

macro_rules! impl_arith_int {
    ($t:ty) => {
        impl Arith for $t {
            fn zero() -> Self {
                0
            }
            fn one() -> Self {
                1
            }
            fn add(a: Self, b: Self) -> Self {
                a.wrapping_add(b)
            }
            fn mul(a: Self, b: Self) -> Self {
                a.wrapping_mul(b)
            }
            fn binary(op: BinaryOp, a: Self, b: Self) -> Option<Self> {
                match op {
                    BinaryOp::Add => Some(a.wrapping_add(b)),
                    BinaryOp::Sub => Some(a.wrapping_sub(b)),
                    BinaryOp::Mul => Some(a.wrapping_mul(b)),
                    BinaryOp::Div => (b != 0).then(|| a.wrapping_div(b)),
                    BinaryOp::Maximum => Some(a.max(b)),
                    BinaryOp::Minimum => Some(a.min(b)),
                }
            }
            fn unary(op: UnaryOp, a: Self) -> Self {
                match op {
                    UnaryOp::Neg => a.wrapping_neg(),
                    UnaryOp::Abs => a.wrapping_abs(),
                    // float-only ops are rejected at graph construction
                    UnaryOp::Exp => Self::from_f64((a as f64).exp()),
                    UnaryOp::Log => Self::from_f64((a as f64).ln()),
                    UnaryOp::Sqrt => Self::from_f64((a as f64).sqrt()),
                }
            }
        }
    };
}

impl_arith_float!(f32);
impl_arith_float!(f64);
impl_arith_int!(i32);
impl_arith_int!(i64);

/// Dispatch a generic kernel over two operands already cast to one dtype.
macro_rules! dispatch2 {
    ($a:expr, $b:expr, ($x:ident, $y:ident) => $body:expr) => {
        match ($a, $b) {
            (HostData::F32($x), HostData::F32($y)) => $body.map(HostData::F32),
            (HostData::F64($x), HostData::F64($y)) => $body.map(HostData::F64),
            (HostData::I32($x), HostData::I32($y)) => $body.map(HostData::I32),
            (HostData::I64($x), HostData::I64($y)) => $body.map(HostData::I64),
            (a, b) => Err(TarnError::DTypeMismatch {
                expected: a.dtype(),
                got: b.dtype(),
            }),
        }
    };
}

/// Dispatch a generic kernel over one operand.
macro_rules! dispatch1 {
    ($a:expr, $x:ident => $body:expr) => {
        match $a {
            HostData::F32($x) => HostData::F32($body),
            HostData::F64($x) => HostData::F64($body),
            HostData::I32($x) => HostData::I32($body),
            HostData::I64($x) => HostData::I64($body),
        }
    };
}

fn cast_to(data: &HostData, dtype: DType) -> Cow<'_, HostData> {
    if data.dtype() == dtype {
        Cow::Borrowed(data)
    } else {
        Cow::Owned(data.cast(dtype))
    }
}

/// Compute `node` from its input data. Buffer-sharing ops and leaves never
/// reach here.
pub(crate) fn compute(node: &Node, inputs: &[HostData]) -> Result<HostData> {
    let shape = node.shape();
    let dtype = node.dtype();
    let ins = node.inputs();

    match node.op() {
        Op::Fill(value) => Ok(HostData::full(dtype, shape.numel(), *value)),
        Op::Unary(op) => {
            let a = cast_to(&inputs[0], dtype);
            Ok(dispatch1!(a.as_ref(), x => unary(*op, x)))
        }
        Op::Binary(op) => {
            let a = cast_to(&inputs[0], dtype);
            let b = cast_to(&inputs[1], dtype);
            let (sa, sb) = (ins[0].shape(), ins[1].shape());
            dispatch2!(a.as_ref(), b.as_ref(), (x, y) => binary(*op, x, sa, y, sb, shape))
        }
        Op::Compare(op) => {
            let a = cast_to(&inputs[0], dtype);
            let b = cast_to(&inputs[1], dtype);
            let (sa, sb) = (ins[0].shape(), ins[1].shape());
            dispatch2!(a.as_ref(), b.as_ref(), (x, y) => Ok::<_, TarnError>(compare(*op, x, sa, y, sb, shape)))
        }
        Op::Sum => Ok(dispatch1!(&inputs[0], x => vec![sum(x)])),
        Op::ReduceTo => Ok(dispatch1!(&inputs[0], x => reduce_to(x, ins[0].shape(), shape))),
        Op::BroadcastTo => Ok(dispatch1!(&inputs[0], x => broadcast_to(x, ins[0].shape(), shape))),
        Op::Transpose => Ok(dispatch1!(&inputs[0], x => transpose(x, ins[0].shape()))),
        Op::Matmul => {
            let a = cast_to(&inputs[0], dtype);
            let b = cast_to(&inputs[1], dtype);
            let (sa, sb) = (ins[0].shape(), ins[1].shape());
            dispatch2!(a.as_ref(), b.as_ref(), (x, y) => Ok::<_, TarnError>(matmul(x, sa, y, sb)))
        }
        Op::Cast => Ok(inputs[0].cast(dtype)),
        Op::Custom(source) => custom(source, node, inputs),
        Op::Leaf | Op::Reshape | Op::Detach => Err(TarnError::InvalidKernel(format!(
            "{} nodes are not computed",
            node.op().name()
        ))),
    }
}

fn unary<T: Arith>(op: UnaryOp, x: &[T]) -> Vec<T> {
    if x.len() >= PAR_THRESHOLD {
        x.par_iter().map(|&v| T::unary(op, v)).collect()
    } else {
        x.iter().map(|&v| T::unary(op, v)).collect()
    }
}

/// Element pairs of a broadcasting op, as flat indices into each operand.
fn broadcast_pairs<'s>(sa: &'s Shape, sb: &'s Shape, out: &'s Shape) -> impl Fn(usize) -> (usize, usize) + Sync + 's {
    let same = sa == out && sb == out;
    let os = out.contiguous_strides();
    let (ssa, ssb) = (sa.contiguous_strides(), sb.contiguous_strides());
    move |i| {
        if same {
            (i, i)
        } else {
            (broadcast_index(i, out, &os, sa, &ssa), broadcast_index(i, out, &os, sb, &ssb))
        }
    }
}

fn binary<T: Arith>(op: BinaryOp, a: &[T], sa: &Shape, b: &[T], sb: &Shape, out: &Shape) -> Result<Vec<T>> {
    let pair = broadcast_pairs(sa, sb, out);
    let f = |i: usize| {
        let (ia, ib) = pair(i);
        T::binary(op, a[ia], b[ib])
    };
    let result: Option<Vec<T>> = if out.numel() >= PAR_THRESHOLD {
        (0..out.numel()).into_par_iter().map(f).collect()
    } else {
        (0..out.numel()).map(f).collect()
    };
    result.ok_or_else(|| TarnError::KernelExecution {
        kernel: "div".into(),
        message: "integer division by zero".into(),
    })
}

fn compare<T: Arith>(op: CompareOp, a: &[T], sa: &Shape, b: &[T], sb: &Shape, out: &Shape) -> Vec<T> {
    let pair = broadcast_pairs(sa, sb, out);
    (0..out.numel())
        .map(|i| {
            let (ia, ib) = pair(i);
            let (x, y) = (a[ia], b[ib]);
            let hit = match op {
                CompareOp::Gt => x > y,
                CompareOp::Ge => x >= y,
                CompareOp::Lt => x < y,
                CompareOp::Le => x <= y,
                CompareOp::Eq => x == y,
            };
            if hit {
                T::one()
            } else {
                T::zero()
            }
        })
        .collect()
}

fn sum<T: Arith>(x: &[T]) -> T {
    if x.len() >= PAR_THRESHOLD {
        x.par_iter().copied().reduce(T::zero, T::add)
    } else {
        x.iter().copied().fold(T::zero(), T::add)
    }
}

fn reduce_to<T: Arith>(x: &[T], from: &Shape, to: &Shape) -> Vec<T> {
    let mut out = vec![T::zero(); to.numel()];
    let (fs, ts) = (from.contiguous_strides(), to.contiguous_strides());
    for (i, &v) in x.iter().enumerate() {
        let j = broadcast_index(i, from, &fs, to, &ts);
        out[j] = T::add(out[j], v);
    }
    out
}

fn broadcast_to<T: Arith>(x: &[T], from: &Shape, to: &Shape) -> Vec<T> {
    let (fs, ts) = (from.contiguous_strides(), to.contiguous_strides());
    (0..to.numel()).map(|i| x[broadcast_index(i, to, &ts, from, &fs)]).collect()
}

fn transpose<T: Arith>(x: &[T], from: &Shape) -> Vec<T> {
    let dims = from.dims();
    let n = dims.len();
    let (rows, cols) = (dims[n - 2], dims[n - 1]);
    let plane = rows * cols;
    let mut out = vec![T::zero(); x.len()];
    for (src, dst) in x.chunks(plane).zip(out.chunks_mut(plane)) {
        for r in 0..rows {
            for c in 0..cols {
                dst[c * rows + r] = src[r * cols + c];
            }
        }
    }
    out
}

/// [M, K] @ [K, N] -> [M, N], rows in parallel.
fn matmul<T: Arith>(a: &[T], sa: &Shape, b: &[T], sb: &Shape) -> Vec<T> {
    let (m, k) = (sa.dims()[0], sa.dims()[1]);
    let n = sb.dims()[1];
    let mut c = vec![T::zero(); m * n];
    c.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        let a_row = &a[i * k..(i + 1) * k];
        for (p, &av) in a_row.iter().enumerate() {
            let b_row = &b[p * n..(p + 1) * n];
            for (dst, &bv) in row.iter_mut().zip(b_row) {
                *dst = T::add(*dst, T::mul(av, bv));
            }
        }
    });
    c
}

fn custom(source: &KernelSource, node: &Node, inputs: &[HostData]) -> Result<HostData> {
    let fragment = source
        .fragment_for(node.device())
        .ok_or_else(|| TarnError::InvalidKernel(format!("kernel '{}' has no fragment", source.name)))?;
    let signature = Signature::new(
        node.inputs().iter().map(|n| n.shape().ndim()).collect(),
        node.shape().ndim(),
    );
    let program = tarn_kernels::compile(&source.name, fragment, &signature)
        .map_err(|e| TarnError::from_kernel(&source.name, e))?;

    let args: Vec<TensorArg<'_>> = node
        .inputs()
        .iter()
        .zip(inputs)
        .map(|(n, data)| TensorArg {
            shape: n.shape().dims(),
            data: data.as_arg(),
        })
        .collect();
    let mut out = HostData::zeros(node.dtype(), node.shape().numel());
    program
        .run(
            &args,
            &mut TensorOut {
                shape: node.shape().dims(),
                data: out.as_out(),
            },
        )
        .map_err(|e| TarnError::from_kernel(&source.name, e))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::buffer::Buffer;
    use crate::Device;

    fn leaf(data: HostData, dims: &[usize]) -> Arc<Node> {
        Node::leaf(Buffer::from_host(data, Device::Cpu), Shape::new(dims), Device::Cpu, false)
    }

    fn run(op: Op, inputs: Vec<(HostData, Vec<usize>)>, out: &[usize], dtype: DType) -> Result<HostData> {
        let data: Vec<HostData> = inputs.iter().map(|(d, _)| d.clone()).collect();
        let nodes = inputs.into_iter().map(|(d, s)| leaf(d, &s)).collect();
        let node = Node::computed(op, nodes, Shape::new(out), dtype, Device::Cpu, false);
        compute(&node, &data)
    }

    #[test]
    fn test_broadcast_add_promotes() {
        let out = run(
            Op::Binary(BinaryOp::Add),
            vec![(HostData::I32(vec![1, 2, 3, 4, 5, 6]), vec![2, 3]), (HostData::F32(vec![0.5, 1.5, 2.5]), vec![3])],
            &[2, 3],
            DType::F32,
        )
        .unwrap();
        assert_eq!(out, HostData::F32(vec![1.5, 3.5, 5.5, 4.5, 6.5, 8.5]));
    }

    #[test]
    fn test_integer_division_by_zero() {
        let err = run(
            Op::Binary(BinaryOp::Div),
            vec![(HostData::I64(vec![4, 2]), vec![2]), (HostData::I64(vec![2, 0]), vec![2])],
            &[2],
            DType::I64,
        )
        .unwrap_err();
        assert!(matches!(err, TarnError::KernelExecution { .. }));
    }

    #[test]
    fn test_compare_ties() {
        let out = run(
            Op::Compare(CompareOp::Gt),
            vec![(HostData::F64(vec![1.0, 0.0, -1.0]), vec![3]), (HostData::F64(vec![0.0]), vec![])],
            &[3],
            DType::F64,
        )
        .unwrap();
        assert_eq!(out, HostData::F64(vec![1.0, 0.0, 0.0]));
    }

    #[test]
    fn test_reduce_and_broadcast() {
        let x = HostData::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let rows = run(Op::ReduceTo, vec![(x.clone(), vec![2, 3])], &[3], DType::F32).unwrap();
        assert_eq!(rows, HostData::F32(vec![5.0, 7.0, 9.0]));
        let cols = run(Op::ReduceTo, vec![(x.clone(), vec![2, 3])], &[2, 1], DType::F32).unwrap();
        assert_eq!(cols, HostData::F32(vec![6.0, 15.0]));
        let all = run(Op::Sum, vec![(x, vec![2, 3])], &[], DType::F32).unwrap();
        assert_eq!(all, HostData::F32(vec![21.0]));

        let b = run(Op::BroadcastTo, vec![(HostData::I32(vec![7, 8]), vec![2, 1])], &[2, 2], DType::I32).unwrap();
        assert_eq!(b, HostData::I32(vec![7, 7, 8, 8]));
    }

    #[test]
    fn test_large_sum_parallel() {
        let n = PAR_THRESHOLD * 2;
        let out = run(Op::Sum, vec![(HostData::I64(vec![1; n]), vec![n])], &[], DType::I64).unwrap();
        assert_eq!(out, HostData::I64(vec![n as i64]));
    }

    #[test]
    fn test_transpose_and_matmul() {
        let a = HostData::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let t = run(Op::Transpose, vec![(a.clone(), vec![2, 3])], &[3, 2], DType::F32).unwrap();
        assert_eq!(t, HostData::F32(vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]));

        let c = run(Op::Matmul, vec![(a, vec![2, 3]), (t, vec![3, 2])], &[2, 2], DType::F32).unwrap();
        assert_eq!(c, HostData::F32(vec![14.0, 32.0, 32.0, 77.0]));
    }

    #[test]
    fn test_custom_kernel_host() {
        let src = Arc::new(KernelSource::new("square2", "for (int i=0; i<in0shape0; i++) @out(i) = @in0(i)*@in0(i)*2;"));
        let out = run(Op::Custom(src), vec![(HostData::F32(vec![1.0, 2.0, 3.0]), vec![3])], &[3], DType::F32).unwrap();
        assert_eq!(out, HostData::F32(vec![2.0, 8.0, 18.0]));
    }

    #[test]
    fn test_custom_kernel_compile_error_named() {
        let src = Arc::new(KernelSource::new("broken", "@out(0) = 1"));
        let err = run(Op::Custom(src), vec![], &[1], DType::F32).unwrap_err();
        match err {
            TarnError::KernelCompilation { kernel, line, .. } => {
                assert_eq!(kernel, "broken");
                assert_eq!(line, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
