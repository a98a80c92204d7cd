//! Resolved program representation produced by the parser.
//!
//! Identifiers are bound during parsing: locals become frame slots and
//! shape/stride names become [`Expr::Dim`]/[`Expr::Stride`], so the
//! interpreter never looks anything up by name.

/// Declared type of a local variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclTy {
    Int,
    Float,
    Bool,
    /// `auto`: keeps whatever the initializer produced.
    Auto,
}

/// Tensor operand referenced by a macro or a shape variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorRef {
    Input(usize),
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Min,
    Max,
    Abs,
    Exp,
    Log,
    Sqrt,
    Pow,
    Floor,
    Ceil,
}

impl Builtin {
    pub(crate) fn lookup(name: &str) -> Option<(Builtin, usize)> {
        let b = match name {
            "min" | "fmin" | "fminf" => (Builtin::Min, 2),
            "max" | "fmax" | "fmaxf" => (Builtin::Max, 2),
            "abs" | "fabs" | "fabsf" => (Builtin::Abs, 1),
            "exp" | "expf" => (Builtin::Exp, 1),
            "log" | "logf" => (Builtin::Log, 1),
            "sqrt" | "sqrtf" => (Builtin::Sqrt, 1),
            "pow" | "powf" => (Builtin::Pow, 2),
            "floor" | "floorf" => (Builtin::Floor, 1),
            "ceil" | "ceilf" => (Builtin::Ceil, 1),
            _ => return None,
        };
        Some(b)
    }
}

/// Assignable location.
#[derive(Debug, Clone, PartialEq)]
pub enum Place {
    Local { slot: usize, ty: DeclTy },
    Output { indices: Vec<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Local(usize),
    Dim { tensor: TensorRef, axis: usize },
    Stride { tensor: TensorRef, axis: usize },
    Load { tensor: TensorRef, indices: Vec<Expr> },
    Assign { place: Place, op: Option<BinOp>, value: Box<Expr> },
    Step { place: Place, delta: i64, prefix: bool },
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Select { cond: Box<Expr>, then: Box<Expr>, otherwise: Box<Expr> },
    Cast { ty: DeclTy, expr: Box<Expr> },
    Call { func: Builtin, args: Vec<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Declare { slot: usize, ty: DeclTy, init: Option<Expr> },
    Block(Vec<Stmt>),
    If { cond: Expr, then: Box<Stmt>, otherwise: Option<Box<Stmt>> },
    /// `while` and desugared `for`; `step` also runs after `continue`.
    Loop { cond: Option<Expr>, body: Box<Stmt>, step: Option<Expr> },
    Break,
    Continue,
}

/// Operand ranks a fragment is compiled against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub input_ranks: Vec<usize>,
    pub output_rank: usize,
}

impl Signature {
    pub fn new(input_ranks: Vec<usize>, output_rank: usize) -> Self {
        Self {
            input_ranks,
            output_rank,
        }
    }

    pub(crate) fn rank_of(&self, tensor: TensorRef) -> usize {
        match tensor {
            TensorRef::Input(k) => self.input_ranks[k],
            TensorRef::Output => self.output_rank,
        }
    }
}

/// A checked fragment ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub(crate) body: Vec<Stmt>,
    pub(crate) slots: usize,
    pub(crate) signature: Signature,
}

impl Program {
    pub fn signature(&self) -> &Signature {
        &self.signature
    }
}
