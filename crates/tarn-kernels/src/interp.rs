//! Tree-walking interpreter for checked programs.

use crate::error::KernelError;
use crate::ir::{BinOp, Builtin, DeclTy, Expr, Place, Program, Stmt, TensorRef, UnaryOp};

/// Runtime value. Integer arithmetic stays integral, anything touching a
/// float promotes to `f64`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
}

impl Value {
    pub fn as_f64(self) -> f64 {
        match self {
            Value::Int(v) => v as f64,
            Value::Float(v) => v,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Value::Int(v) => v,
            Value::Float(v) => v as i64,
        }
    }

    fn truthy(self) -> bool {
        match self {
            Value::Int(v) => v != 0,
            Value::Float(v) => v != 0.0,
        }
    }

    fn from_bool(b: bool) -> Self {
        Value::Int(b as i64)
    }

    fn convert(self, ty: DeclTy) -> Self {
        match ty {
            DeclTy::Int => Value::Int(self.as_i64()),
            DeclTy::Float => Value::Float(self.as_f64()),
            DeclTy::Bool => Value::from_bool(self.truthy()),
            DeclTy::Auto => self,
        }
    }
}

/// Element types a kernel operand can hold.
pub trait Scalar: Copy {
    fn to_value(self) -> Value;
    fn from_value(v: Value) -> Self;
}

impl Scalar for f32 {
    fn to_value(self) -> Value {
        Value::Float(self as f64)
    }
    fn from_value(v: Value) -> Self {
        v.as_f64() as f32
    }
}

impl Scalar for f64 {
    fn to_value(self) -> Value {
        Value::Float(self)
    }
    fn from_value(v: Value) -> Self {
        v.as_f64()
    }
}

impl Scalar for i32 {
    fn to_value(self) -> Value {
        Value::Int(self as i64)
    }
    fn from_value(v: Value) -> Self {
        v.as_i64() as i32
    }
}

impl Scalar for i64 {
    fn to_value(self) -> Value {
        Value::Int(self)
    }
    fn from_value(v: Value) -> Self {
        v.as_i64()
    }
}

/// Read-only operand storage.
#[derive(Debug, Clone, Copy)]
pub enum ArgData<'a> {
    F32(&'a [f32]),
    F64(&'a [f64]),
    I32(&'a [i32]),
    I64(&'a [i64]),
}

impl ArgData<'_> {
    fn len(&self) -> usize {
        match self {
            ArgData::F32(d) => d.len(),
            ArgData::F64(d) => d.len(),
            ArgData::I32(d) => d.len(),
            ArgData::I64(d) => d.len(),
        }
    }

    fn load(&self, i: usize) -> Value {
        match self {
            ArgData::F32(d) => d[i].to_value(),
            ArgData::F64(d) => d[i].to_value(),
            ArgData::I32(d) => d[i].to_value(),
            ArgData::I64(d) => d[i].to_value(),
        }
    }
}

/// Output storage, written in place.
#[derive(Debug)]
pub enum OutData<'a> {
    F32(&'a mut [f32]),
    F64(&'a mut [f64]),
    I32(&'a mut [i32]),
    I64(&'a mut [i64]),
}

impl OutData<'_> {
    fn len(&self) -> usize {
        match self {
            OutData::F32(d) => d.len(),
            OutData::F64(d) => d.len(),
            OutData::I32(d) => d.len(),
            OutData::I64(d) => d.len(),
        }
    }

    fn load(&self, i: usize) -> Value {
        match self {
            OutData::F32(d) => d[i].to_value(),
            OutData::F64(d) => d[i].to_value(),
            OutData::I32(d) => d[i].to_value(),
            OutData::I64(d) => d[i].to_value(),
        }
    }

    fn store(&mut self, i: usize, v: Value) -> Value {
        match self {
            OutData::F32(d) => {
                d[i] = f32::from_value(v);
                d[i].to_value()
            }
            OutData::F64(d) => {
                d[i] = f64::from_value(v);
                d[i].to_value()
            }
            OutData::I32(d) => {
                d[i] = i32::from_value(v);
                d[i].to_value()
            }
            OutData::I64(d) => {
                d[i] = i64::from_value(v);
                d[i].to_value()
            }
        }
    }
}

/// An input operand: row-major contiguous data and its shape.
#[derive(Debug, Clone, Copy)]
pub struct TensorArg<'a> {
    pub shape: &'a [usize],
    pub data: ArgData<'a>,
}

/// The output operand.
#[derive(Debug)]
pub struct TensorOut<'a> {
    pub shape: &'a [usize],
    pub data: OutData<'a>,
}

fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

enum Flow {
    Normal,
    Break,
    Continue,
}

struct Frame<'p, 'a, 'o> {
    inputs: &'p [TensorArg<'a>],
    input_strides: Vec<Vec<usize>>,
    output: &'p mut TensorOut<'o>,
    output_strides: Vec<usize>,
    locals: Vec<Value>,
}

impl Program {
    /// Execute against concrete operands. Operand ranks must match the
    /// signature the program was compiled for.
    pub fn run(&self, inputs: &[TensorArg<'_>], output: &mut TensorOut<'_>) -> Result<(), KernelError> {
        let sig = &self.signature;
        if inputs.len() != sig.input_ranks.len() {
            return Err(KernelError::Operands(format!(
                "program expects {} input(s), got {}",
                sig.input_ranks.len(),
                inputs.len()
            )));
        }
        for (k, (arg, &rank)) in inputs.iter().zip(&sig.input_ranks).enumerate() {
            check_operand(&format!("input {k}"), arg.shape, rank, arg.data.len())?;
        }
        check_operand("output", output.shape, sig.output_rank, output.data.len())?;

        let output_strides = row_major_strides(output.shape);
        let mut frame = Frame {
            inputs,
            input_strides: inputs.iter().map(|a| row_major_strides(a.shape)).collect(),
            output,
            output_strides,
            locals: vec![Value::Int(0); self.slots],
        };
        for stmt in &self.body {
            match frame.exec(stmt)? {
                Flow::Normal => {}
                // rejected by the parser
                Flow::Break | Flow::Continue => break,
            }
        }
        Ok(())
    }
}

fn check_operand(what: &str, shape: &[usize], rank: usize, len: usize) -> Result<(), KernelError> {
    if shape.len() != rank {
        return Err(KernelError::Operands(format!(
            "{what} has rank {}, program was compiled for rank {rank}",
            shape.len()
        )));
    }
    let numel: usize = shape.iter().product();
    if numel != len {
        return Err(KernelError::Operands(format!(
            "{what} shape {shape:?} needs {numel} elements, buffer holds {len}"
        )));
    }
    Ok(())
}

impl Frame<'_, '_, '_> {
    fn exec(&mut self, stmt: &Stmt) -> Result<Flow, KernelError> {
        match stmt {
            Stmt::Expr(e) => {
                self.eval(e)?;
                Ok(Flow::Normal)
            }
            Stmt::Declare { slot, ty, init } => {
                let v = match init {
                    Some(e) => self.eval(e)?.convert(*ty),
                    None => match ty {
                        DeclTy::Float => Value::Float(0.0),
                        _ => Value::Int(0),
                    },
                };
                self.locals[*slot] = v;
                Ok(Flow::Normal)
            }
            Stmt::Block(stmts) => {
                for s in stmts {
                    match self.exec(s)? {
                        Flow::Normal => {}
                        other => return Ok(other),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::If { cond, then, otherwise } => {
                if self.eval(cond)?.truthy() {
                    self.exec(then)
                } else if let Some(o) = otherwise {
                    self.exec(o)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::Loop { cond, body, step } => {
                loop {
                    if let Some(c) = cond {
                        if !self.eval(c)?.truthy() {
                            break;
                        }
                    }
                    if let Flow::Break = self.exec(body)? {
                        break;
                    }
                    if let Some(s) = step {
                        self.eval(s)?;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
        }
    }

    fn shape_of(&self, tensor: TensorRef) -> &[usize] {
        match tensor {
            TensorRef::Input(k) => self.inputs[k].shape,
            TensorRef::Output => self.output.shape,
        }
    }

    fn offset(&mut self, tensor: TensorRef, indices: &[Expr]) -> Result<usize, KernelError> {
        let mut idx = Vec::with_capacity(indices.len());
        for e in indices {
            idx.push(self.eval(e)?.as_i64());
        }
        let shape = self.shape_of(tensor);
        let strides = match tensor {
            TensorRef::Input(k) => &self.input_strides[k],
            TensorRef::Output => &self.output_strides,
        };
        let mut offset = 0;
        for (axis, (&i, (&dim, &stride))) in idx.iter().zip(shape.iter().zip(strides)).enumerate() {
            if i < 0 || i as usize >= dim {
                let name = match tensor {
                    TensorRef::Input(k) => format!("@in{k}"),
                    TensorRef::Output => "@out".to_string(),
                };
                return Err(KernelError::Execution(format!(
                    "index {i} out of bounds for axis {axis} of {name} with size {dim}"
                )));
            }
            offset += i as usize * stride;
        }
        Ok(offset)
    }

    fn read_place(&mut self, place: &Place) -> Result<(Value, Option<usize>), KernelError> {
        match place {
            Place::Local { slot, .. } => Ok((self.locals[*slot], None)),
            Place::Output { indices } => {
                let off = self.offset(TensorRef::Output, indices)?;
                Ok((self.output.data.load(off), Some(off)))
            }
        }
    }

    fn write_place(&mut self, place: &Place, offset: Option<usize>, v: Value) -> Value {
        match (place, offset) {
            (Place::Output { .. }, Some(off)) => self.output.data.store(off, v),
            (Place::Local { slot, ty }, _) => {
                let v = v.convert(*ty);
                self.locals[*slot] = v;
                v
            }
            (Place::Output { .. }, None) => v,
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, KernelError> {
        Ok(match expr {
            Expr::Int(v) => Value::Int(*v),
            Expr::Float(v) => Value::Float(*v),
            Expr::Local(slot) => self.locals[*slot],
            Expr::Dim { tensor, axis } => Value::Int(self.shape_of(*tensor)[*axis] as i64),
            Expr::Stride { tensor, axis } => {
                let s = match tensor {
                    TensorRef::Input(k) => self.input_strides[*k][*axis],
                    TensorRef::Output => self.output_strides[*axis],
                };
                Value::Int(s as i64)
            }
            Expr::Load { tensor, indices } => {
                let off = self.offset(*tensor, indices)?;
                match tensor {
                    TensorRef::Input(k) => self.inputs[*k].data.load(off),
                    TensorRef::Output => self.output.data.load(off),
                }
            }
            Expr::Assign { place, op, value } => {
                let rhs = self.eval(value)?;
                let (current, offset) = match place {
                    Place::Output { indices } => {
                        let off = self.offset(TensorRef::Output, indices)?;
                        (self.output.data.load(off), Some(off))
                    }
                    Place::Local { slot, .. } => (self.locals[*slot], None),
                };
                let v = match op {
                    Some(op) => binary(*op, current, rhs)?,
                    None => rhs,
                };
                self.write_place(place, offset, v)
            }
            Expr::Step { place, delta, prefix } => {
                let (old, offset) = self.read_place(place)?;
                let new = binary(BinOp::Add, old, Value::Int(*delta))?;
                let stored = self.write_place(place, offset, new);
                if *prefix {
                    stored
                } else {
                    old
                }
            }
            Expr::Unary { op, expr } => {
                let v = self.eval(expr)?;
                match op {
                    UnaryOp::Neg => match v {
                        Value::Int(i) => Value::Int(i.wrapping_neg()),
                        Value::Float(f) => Value::Float(-f),
                    },
                    UnaryOp::Not => Value::from_bool(!v.truthy()),
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let l = self.eval(lhs)?;
                let r = self.eval(rhs)?;
                binary(*op, l, r)?
            }
            Expr::And(lhs, rhs) => Value::from_bool(self.eval(lhs)?.truthy() && self.eval(rhs)?.truthy()),
            Expr::Or(lhs, rhs) => Value::from_bool(self.eval(lhs)?.truthy() || self.eval(rhs)?.truthy()),
            Expr::Select { cond, then, otherwise } => {
                if self.eval(cond)?.truthy() {
                    self.eval(then)?
                } else {
                    self.eval(otherwise)?
                }
            }
            Expr::Cast { ty, expr } => self.eval(expr)?.convert(*ty),
            Expr::Call { func, args } => {
                let mut vals = Vec::with_capacity(args.len());
                for a in args {
                    vals.push(self.eval(a)?);
                }
                call(*func, &vals)
            }
        })
    }
}

fn binary(op: BinOp, l: Value, r: Value) -> Result<Value, KernelError> {
    use Value::{Float, Int};
    let v = match (l, r) {
        (Int(a), Int(b)) => match op {
            BinOp::Add => Int(a.wrapping_add(b)),
            BinOp::Sub => Int(a.wrapping_sub(b)),
            BinOp::Mul => Int(a.wrapping_mul(b)),
            BinOp::Div | BinOp::Rem if b == 0 => {
                return Err(KernelError::Execution("integer division by zero".into()));
            }
            BinOp::Div => Int(a.wrapping_div(b)),
            BinOp::Rem => Int(a.wrapping_rem(b)),
            BinOp::Eq => Value::from_bool(a == b),
            BinOp::Ne => Value::from_bool(a != b),
            BinOp::Lt => Value::from_bool(a < b),
            BinOp::Le => Value::from_bool(a <= b),
            BinOp::Gt => Value::from_bool(a > b),
            BinOp::Ge => Value::from_bool(a >= b),
        },
        _ => {
            let (a, b) = (l.as_f64(), r.as_f64());
            match op {
                BinOp::Add => Float(a + b),
                BinOp::Sub => Float(a - b),
                BinOp::Mul => Float(a * b),
                BinOp::Div => Float(a / b),
                BinOp::Rem => Float(a % b),
                BinOp::Eq => Value::from_bool(a == b),
                BinOp::Ne => Value::from_bool(a != b),
                BinOp::Lt => Value::from_bool(a < b),
                BinOp::Le => Value::from_bool(a <= b),
                BinOp::Gt => Value::from_bool(a > b),
                BinOp::Ge => Value::from_bool(a >= b),
            }
        }
    };
    Ok(v)
}

fn call(func: Builtin, args: &[Value]) -> Value {
    use Value::{Float, Int};
    match (func, args) {
        (Builtin::Min, [Int(a), Int(b)]) => Int(*a.min(b)),
        (Builtin::Max, [Int(a), Int(b)]) => Int(*a.max(b)),
        (Builtin::Min, [a, b]) => Float(a.as_f64().min(b.as_f64())),
        (Builtin::Max, [a, b]) => Float(a.as_f64().max(b.as_f64())),
        (Builtin::Abs, [Int(a)]) => Int(a.wrapping_abs()),
        (Builtin::Abs, [a]) => Float(a.as_f64().abs()),
        (Builtin::Exp, [a]) => Float(a.as_f64().exp()),
        (Builtin::Log, [a]) => Float(a.as_f64().ln()),
        (Builtin::Sqrt, [a]) => Float(a.as_f64().sqrt()),
        (Builtin::Pow, [a, b]) => Float(a.as_f64().powf(b.as_f64())),
        (Builtin::Floor, [a]) => Float(a.as_f64().floor()),
        (Builtin::Ceil, [a]) => Float(a.as_f64().ceil()),
        // arity is checked by the parser
        _ => Int(0),
    }
}
