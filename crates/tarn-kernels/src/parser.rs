//! Recursive-descent parser that turns tokens into a checked [`Program`].
//!
//! Name resolution and arity checks happen here, against the operand ranks
//! in the [`Signature`], so every error carries the position of the
//! offending token.

use std::collections::HashMap;

use crate::error::KernelError;
use crate::ir::{BinOp, Builtin, DeclTy, Expr, Place, Program, Signature, Stmt, TensorRef, UnaryOp};
use crate::lexer::{tokenize, Token, TokenKind};

/// Parse and resolve a fragment.
pub fn parse(source: &str, signature: &Signature) -> Result<Program, KernelError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        signature,
        scopes: vec![HashMap::new()],
        slots: 0,
        loop_depth: 0,
    };
    let mut body = Vec::new();
    while !parser.at_eof() {
        body.push(parser.statement()?);
    }
    Ok(Program {
        body,
        slots: parser.slots,
        signature: signature.clone(),
    })
}

struct Parser<'s> {
    tokens: Vec<Token>,
    pos: usize,
    signature: &'s Signature,
    scopes: Vec<HashMap<String, (usize, DeclTy)>>,
    slots: usize,
    loop_depth: usize,
}

fn decl_type(word: &str) -> Option<DeclTy> {
    match word {
        "int" | "long" | "index_t" | "size_t" | "int32_t" | "int64_t" | "unsigned" => Some(DeclTy::Int),
        "float" | "double" | "float32" | "float64" | "float32_t" | "float64_t" => Some(DeclTy::Float),
        "bool" => Some(DeclTy::Bool),
        "auto" => Some(DeclTy::Auto),
        _ => None,
    }
}

/// Split `in0shape1`, `in0_stride1`, `out_shape0`, `outshape0`, `out0shape0`.
fn tensor_attr(name: &str) -> Option<(TensorRef, bool, usize)> {
    let (tensor, rest) = if let Some(rest) = name.strip_prefix("in") {
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return None;
        }
        let k = digits.parse().ok()?;
        (TensorRef::Input(k), &rest[digits.len()..])
    } else if let Some(rest) = name.strip_prefix("out0") {
        (TensorRef::Output, rest)
    } else if let Some(rest) = name.strip_prefix("out") {
        (TensorRef::Output, rest)
    } else {
        return None;
    };
    let rest = rest.strip_prefix('_').unwrap_or(rest);
    let (is_shape, axis) = if let Some(axis) = rest.strip_prefix("shape") {
        (true, axis)
    } else if let Some(axis) = rest.strip_prefix("stride") {
        (false, axis)
    } else {
        return None;
    };
    if axis.is_empty() || !axis.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((tensor, is_shape, axis.parse().ok()?))
}

/// Map `@out`, `@out0`, `@inK` to a tensor reference.
fn tensor_macro(name: &str) -> Option<TensorRef> {
    match name {
        "out" | "out0" => Some(TensorRef::Output),
        _ => {
            let k = name.strip_prefix("in")?;
            if k.is_empty() || !k.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            k.parse().ok().map(TensorRef::Input)
        }
    }
}

impl<'s> Parser<'s> {
    // =========================================================================
    // Token helpers
    // =========================================================================

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind_at(&self, offset: usize) -> &TokenKind {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].kind
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if !matches!(tok.kind, TokenKind::Eof) {
            self.pos += 1;
        }
        tok
    }

    fn is_punct(&self, p: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Punct(q) if *q == p)
    }

    fn is_keyword(&self, kw: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Ident(w) if w == kw)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.is_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<(), KernelError> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(self.error_here(format!("expected '{p}', found {}", describe(&self.peek().kind))))
        }
    }

    fn error_here(&self, message: impl Into<String>) -> KernelError {
        let tok = self.peek();
        KernelError::syntax(tok.line, tok.column, message)
    }

    fn error_at(&self, tok: &Token, message: impl Into<String>) -> KernelError {
        KernelError::syntax(tok.line, tok.column, message)
    }

    // =========================================================================
    // Scopes
    // =========================================================================

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn declare(&mut self, tok: &Token, name: String, ty: DeclTy) -> Result<usize, KernelError> {
        if tensor_attr(&name).is_some() {
            return Err(self.error_at(tok, format!("'{name}' is a reserved shape name")));
        }
        let scope = self
            .scopes
            .last_mut()
            .ok_or_else(|| KernelError::syntax(tok.line, tok.column, "no open scope"))?;
        if scope.contains_key(&name) {
            return Err(KernelError::syntax(tok.line, tok.column, format!("redeclaration of '{name}'")));
        }
        let slot = self.slots;
        self.slots += 1;
        scope.insert(name, (slot, ty));
        Ok(slot)
    }

    fn lookup(&self, name: &str) -> Option<(usize, DeclTy)> {
        self.scopes.iter().rev().find_map(|s| s.get(name).copied())
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn statement(&mut self) -> Result<Stmt, KernelError> {
        if self.eat_punct(";") {
            return Ok(Stmt::Block(Vec::new()));
        }
        if self.is_punct("{") {
            return self.block();
        }
        let keyword = match &self.peek().kind {
            TokenKind::Ident(word) => Some(word.clone()),
            _ => None,
        };
        if let Some(word) = keyword {
            match word.as_str() {
                "for" => return self.for_loop(),
                "while" => return self.while_loop(),
                "if" => return self.if_stmt(),
                "break" | "continue" => {
                    let tok = self.advance();
                    if self.loop_depth == 0 {
                        return Err(self.error_at(&tok, "break/continue outside of a loop"));
                    }
                    self.expect_punct(";")?;
                    return Ok(if matches!(&tok.kind, TokenKind::Ident(w) if w == "break") {
                        Stmt::Break
                    } else {
                        Stmt::Continue
                    });
                }
                _ => {}
            }
            if self.starts_declaration() {
                let decl = self.declaration()?;
                self.expect_punct(";")?;
                return Ok(decl);
            }
        }
        let expr = self.expression()?;
        self.expect_punct(";")?;
        Ok(Stmt::Expr(expr))
    }

    fn starts_declaration(&self) -> bool {
        let mut offset = 0;
        if matches!(self.peek_kind_at(0), TokenKind::Ident(w) if w == "const") {
            offset = 1;
        }
        matches!(self.peek_kind_at(offset), TokenKind::Ident(w) if decl_type(w).is_some())
            && matches!(self.peek_kind_at(offset + 1), TokenKind::Ident(_))
    }

    fn declaration(&mut self) -> Result<Stmt, KernelError> {
        if self.is_keyword("const") {
            self.advance();
        }
        let ty_tok = self.advance();
        let ty = match &ty_tok.kind {
            TokenKind::Ident(w) => decl_type(w),
            _ => None,
        }
        .ok_or_else(|| self.error_at(&ty_tok, "expected a type"))?;
        // `unsigned int`, `long long`
        while matches!(&self.peek().kind, TokenKind::Ident(w) if decl_type(w).is_some())
            && matches!(self.peek_kind_at(1), TokenKind::Ident(_))
        {
            self.advance();
        }

        let mut decls = Vec::new();
        loop {
            let name_tok = self.advance();
            let name = match &name_tok.kind {
                TokenKind::Ident(n) => n.clone(),
                other => return Err(self.error_at(&name_tok, format!("expected a variable name, found {}", describe(other)))),
            };
            let init = if self.eat_punct("=") {
                Some(self.assignment()?)
            } else {
                None
            };
            // Declared after the initializer so `int x = x;` does not see itself.
            let slot = self.declare(&name_tok, name, ty)?;
            decls.push(Stmt::Declare { slot, ty, init });
            if !self.eat_punct(",") {
                break;
            }
        }
        Ok(if decls.len() == 1 {
            decls.remove(0)
        } else {
            Stmt::Block(decls)
        })
    }

    fn block(&mut self) -> Result<Stmt, KernelError> {
        self.expect_punct("{")?;
        self.push_scope();
        let mut stmts = Vec::new();
        while !self.is_punct("}") {
            if self.at_eof() {
                return Err(self.error_here("unexpected end of fragment, missing '}'"));
            }
            stmts.push(self.statement()?);
        }
        self.advance();
        self.pop_scope();
        Ok(Stmt::Block(stmts))
    }

    fn for_loop(&mut self) -> Result<Stmt, KernelError> {
        self.advance();
        self.expect_punct("(")?;
        self.push_scope();
        let init = if self.eat_punct(";") {
            None
        } else if self.starts_declaration() {
            let decl = self.declaration()?;
            self.expect_punct(";")?;
            Some(decl)
        } else {
            let e = self.expression()?;
            self.expect_punct(";")?;
            Some(Stmt::Expr(e))
        };
        let cond = if self.is_punct(";") { None } else { Some(self.expression()?) };
        self.expect_punct(";")?;
        let step = if self.is_punct(")") { None } else { Some(self.expression()?) };
        self.expect_punct(")")?;
        self.loop_depth += 1;
        let body = self.statement();
        self.loop_depth -= 1;
        let body = body?;
        self.pop_scope();

        let mut stmts = Vec::new();
        stmts.extend(init);
        stmts.push(Stmt::Loop {
            cond,
            body: Box::new(body),
            step,
        });
        Ok(Stmt::Block(stmts))
    }

    fn while_loop(&mut self) -> Result<Stmt, KernelError> {
        self.advance();
        self.expect_punct("(")?;
        let cond = self.expression()?;
        self.expect_punct(")")?;
        self.loop_depth += 1;
        let body = self.statement();
        self.loop_depth -= 1;
        Ok(Stmt::Loop {
            cond: Some(cond),
            body: Box::new(body?),
            step: None,
        })
    }

    fn if_stmt(&mut self) -> Result<Stmt, KernelError> {
        self.advance();
        self.expect_punct("(")?;
        let cond = self.expression()?;
        self.expect_punct(")")?;
        let then = Box::new(self.statement()?);
        let otherwise = if self.is_keyword("else") {
            self.advance();
            Some(Box::new(self.statement()?))
        } else {
            None
        };
        Ok(Stmt::If { cond, then, otherwise })
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn expression(&mut self) -> Result<Expr, KernelError> {
        self.assignment()
    }

    fn assignment(&mut self) -> Result<Expr, KernelError> {
        let start = self.peek().clone();
        let lhs = self.ternary()?;
        let op = match &self.peek().kind {
            TokenKind::Punct("=") => None,
            TokenKind::Punct("+=") => Some(BinOp::Add),
            TokenKind::Punct("-=") => Some(BinOp::Sub),
            TokenKind::Punct("*=") => Some(BinOp::Mul),
            TokenKind::Punct("/=") => Some(BinOp::Div),
            TokenKind::Punct("%=") => Some(BinOp::Rem),
            _ => return Ok(lhs),
        };
        self.advance();
        let place = self.place_of(lhs, &start)?;
        let value = self.assignment()?;
        Ok(Expr::Assign {
            place,
            op,
            value: Box::new(value),
        })
    }

    fn place_of(&self, expr: Expr, tok: &Token) -> Result<Place, KernelError> {
        match expr {
            Expr::Local(slot) => {
                let ty = self
                    .scopes
                    .iter()
                    .rev()
                    .flat_map(|s| s.values())
                    .find(|(s, _)| *s == slot)
                    .map(|(_, ty)| *ty)
                    .unwrap_or(DeclTy::Auto);
                Ok(Place::Local { slot, ty })
            }
            Expr::Load {
                tensor: TensorRef::Output,
                indices,
            } => Ok(Place::Output { indices }),
            Expr::Load {
                tensor: TensorRef::Input(k),
                ..
            } => Err(self.error_at(tok, format!("input @in{k} is read-only"))),
            _ => Err(self.error_at(tok, "left side of assignment is not assignable")),
        }
    }

    fn ternary(&mut self) -> Result<Expr, KernelError> {
        let cond = self.binary(0)?;
        if !self.eat_punct("?") {
            return Ok(cond);
        }
        let then = self.assignment()?;
        self.expect_punct(":")?;
        let otherwise = self.ternary()?;
        Ok(Expr::Select {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn binary(&mut self, min_prec: u8) -> Result<Expr, KernelError> {
        let mut lhs = self.unary()?;
        loop {
            let (prec, kind) = match &self.peek().kind {
                TokenKind::Punct(p) => match binary_op(p) {
                    Some(entry) => entry,
                    None => break,
                },
                _ => break,
            };
            if prec < min_prec {
                break;
            }
            self.advance();
            let rhs = self.binary(prec + 1)?;
            lhs = match kind {
                Infix::Op(op) => Expr::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                Infix::And => Expr::And(Box::new(lhs), Box::new(rhs)),
                Infix::Or => Expr::Or(Box::new(lhs), Box::new(rhs)),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, KernelError> {
        let tok = self.peek().clone();
        match &tok.kind {
            TokenKind::Punct("-") => {
                self.advance();
                let expr = self.unary()?;
                Ok(match expr {
                    Expr::Int(v) => Expr::Int(-v),
                    Expr::Float(v) => Expr::Float(-v),
                    other => Expr::Unary {
                        op: UnaryOp::Neg,
                        expr: Box::new(other),
                    },
                })
            }
            TokenKind::Punct("+") => {
                self.advance();
                self.unary()
            }
            TokenKind::Punct("!") => {
                self.advance();
                Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    expr: Box::new(self.unary()?),
                })
            }
            TokenKind::Punct(p @ ("++" | "--")) => {
                let delta = if *p == "++" { 1 } else { -1 };
                self.advance();
                let operand = self.unary()?;
                let place = self.place_of(operand, &tok)?;
                Ok(Expr::Step {
                    place,
                    delta,
                    prefix: true,
                })
            }
            TokenKind::Punct("(")
                if matches!(self.peek_kind_at(1), TokenKind::Ident(w) if decl_type(w).is_some())
                    && matches!(self.peek_kind_at(2), TokenKind::Punct(")")) =>
            {
                self.advance();
                let ty_tok = self.advance();
                let ty = match &ty_tok.kind {
                    TokenKind::Ident(w) => decl_type(w).unwrap_or(DeclTy::Auto),
                    _ => DeclTy::Auto,
                };
                self.advance();
                Ok(Expr::Cast {
                    ty,
                    expr: Box::new(self.unary()?),
                })
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr, KernelError> {
        let tok = self.peek().clone();
        let expr = self.primary()?;
        let delta = match &self.peek().kind {
            TokenKind::Punct("++") => 1,
            TokenKind::Punct("--") => -1,
            _ => return Ok(expr),
        };
        self.advance();
        let place = self.place_of(expr, &tok)?;
        Ok(Expr::Step {
            place,
            delta,
            prefix: false,
        })
    }

    fn primary(&mut self) -> Result<Expr, KernelError> {
        let tok = self.advance();
        match &tok.kind {
            TokenKind::Int(v) => Ok(Expr::Int(*v)),
            TokenKind::Float(v) => Ok(Expr::Float(*v)),
            TokenKind::Punct("(") => {
                let e = self.expression()?;
                self.expect_punct(")")?;
                Ok(e)
            }
            TokenKind::Ident(name) => self.identifier(&tok, name),
            TokenKind::Macro(name) => self.macro_call(&tok, name),
            other => Err(self.error_at(&tok, format!("expected an expression, found {}", describe(other)))),
        }
    }

    fn identifier(&mut self, tok: &Token, name: &str) -> Result<Expr, KernelError> {
        if name == "true" {
            return Ok(Expr::Int(1));
        }
        if name == "false" {
            return Ok(Expr::Int(0));
        }
        if self.is_punct("(") {
            let (func, arity) = Builtin::lookup(name)
                .ok_or_else(|| self.error_at(tok, format!("unknown function '{name}'")))?;
            let args = self.call_args()?;
            if args.len() != arity {
                return Err(self.error_at(
                    tok,
                    format!("'{name}' takes {arity} argument(s), got {}", args.len()),
                ));
            }
            return Ok(Expr::Call { func, args });
        }
        if let Some((slot, _)) = self.lookup(name) {
            return Ok(Expr::Local(slot));
        }
        if let Some((tensor, is_shape, axis)) = tensor_attr(name) {
            self.check_axis(tok, tensor, axis)?;
            return Ok(if is_shape {
                Expr::Dim { tensor, axis }
            } else {
                Expr::Stride { tensor, axis }
            });
        }
        Err(self.error_at(tok, format!("unknown identifier '{name}'")))
    }

    fn macro_call(&mut self, tok: &Token, name: &str) -> Result<Expr, KernelError> {
        for (suffix, is_shape) in [("_shape", true), ("_stride", false)] {
            if let Some(base) = name.strip_suffix(suffix) {
                let tensor = tensor_macro(base)
                    .ok_or_else(|| self.error_at(tok, format!("unknown macro '@{name}'")))?;
                self.check_tensor(tok, tensor)?;
                let args = self.call_args()?;
                let axis = match args.as_slice() {
                    [Expr::Int(a)] if *a >= 0 => *a as usize,
                    _ => return Err(self.error_at(tok, format!("'@{name}' expects one constant axis"))),
                };
                self.check_axis(tok, tensor, axis)?;
                return Ok(if is_shape {
                    Expr::Dim { tensor, axis }
                } else {
                    Expr::Stride { tensor, axis }
                });
            }
        }

        let tensor = tensor_macro(name).ok_or_else(|| self.error_at(tok, format!("unknown macro '@{name}'")))?;
        self.check_tensor(tok, tensor)?;
        let indices = self.call_args()?;
        let rank = self.signature.rank_of(tensor);
        if indices.len() != rank {
            return Err(self.error_at(
                tok,
                format!("'@{name}' has rank {rank} but was indexed with {} index(es)", indices.len()),
            ));
        }
        Ok(Expr::Load { tensor, indices })
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, KernelError> {
        self.expect_punct("(")?;
        let mut args = Vec::new();
        if self.eat_punct(")") {
            return Ok(args);
        }
        loop {
            args.push(self.assignment()?);
            if self.eat_punct(")") {
                return Ok(args);
            }
            self.expect_punct(",")?;
        }
    }

    fn check_tensor(&self, tok: &Token, tensor: TensorRef) -> Result<(), KernelError> {
        match tensor {
            TensorRef::Input(k) if k >= self.signature.input_ranks.len() => Err(self.error_at(
                tok,
                format!("@in{k} used but only {} input(s) were given", self.signature.input_ranks.len()),
            )),
            _ => Ok(()),
        }
    }

    fn check_axis(&self, tok: &Token, tensor: TensorRef, axis: usize) -> Result<(), KernelError> {
        self.check_tensor(tok, tensor)?;
        let rank = self.signature.rank_of(tensor);
        if axis >= rank {
            return Err(self.error_at(tok, format!("axis {axis} out of range for rank {rank}")));
        }
        Ok(())
    }
}

enum Infix {
    Op(BinOp),
    And,
    Or,
}

fn binary_op(p: &str) -> Option<(u8, Infix)> {
    let entry = match p {
        "||" => (1, Infix::Or),
        "&&" => (2, Infix::And),
        "==" => (3, Infix::Op(BinOp::Eq)),
        "!=" => (3, Infix::Op(BinOp::Ne)),
        "<" => (4, Infix::Op(BinOp::Lt)),
        "<=" => (4, Infix::Op(BinOp::Le)),
        ">" => (4, Infix::Op(BinOp::Gt)),
        ">=" => (4, Infix::Op(BinOp::Ge)),
        "+" => (5, Infix::Op(BinOp::Add)),
        "-" => (5, Infix::Op(BinOp::Sub)),
        "*" => (6, Infix::Op(BinOp::Mul)),
        "/" => (6, Infix::Op(BinOp::Div)),
        "%" => (6, Infix::Op(BinOp::Rem)),
        _ => return None,
    };
    Some(entry)
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Ident(n) => format!("'{n}'"),
        TokenKind::Macro(n) => format!("'@{n}'"),
        TokenKind::Int(v) => format!("'{v}'"),
        TokenKind::Float(v) => format!("'{v}'"),
        TokenKind::Punct(p) => format!("'{p}'"),
        TokenKind::Eof => "end of fragment".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(inputs: &[usize], out: usize) -> Signature {
        Signature::new(inputs.to_vec(), out)
    }

    #[test]
    fn test_square_kernel() {
        let src = "for (int i=0; i<in0shape0; i++)\n    @out(i) = @in0(i)*@in0(i)*2;";
        let prog = parse(src, &sig(&[1], 1)).unwrap();
        assert_eq!(prog.slots, 1);
        assert_eq!(prog.body.len(), 1);
    }

    #[test]
    fn test_shape_spellings() {
        for name in ["in0shape0", "in0_shape0", "outshape0", "out_shape0", "out0shape0", "in0stride0"] {
            let src = format!("int n = {name};");
            assert!(parse(&src, &sig(&[1], 1)).is_ok(), "{name}");
        }
        assert!(parse("int n = @in0_shape(0);", &sig(&[1], 1)).is_ok());
    }

    #[test]
    fn test_missing_semicolon_position() {
        let err = parse("int x = 1\nint y = 2;", &sig(&[], 1)).unwrap_err();
        match err {
            KernelError::Syntax { line, column, .. } => {
                assert_eq!(line, 2);
                assert_eq!(column, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_input() {
        let err = parse("@out(0) = @in2(0);", &sig(&[1], 1)).unwrap_err();
        assert!(err.to_string().contains("@in2"));
    }

    #[test]
    fn test_arity_checked() {
        let err = parse("@out(0, 1) = 1;", &sig(&[], 1)).unwrap_err();
        assert!(err.to_string().contains("rank 1"));
    }

    #[test]
    fn test_axis_checked() {
        assert!(parse("int n = in0shape1;", &sig(&[1], 1)).is_err());
    }

    #[test]
    fn test_inputs_read_only() {
        let err = parse("@in0(0) = 1;", &sig(&[1], 1)).unwrap_err();
        assert!(err.to_string().contains("read-only"));
    }

    #[test]
    fn test_scoping() {
        // `i` is not visible after the loop
        assert!(parse("for (int i=0;i<3;i++) {} int j = i;", &sig(&[], 1)).is_err());
        assert!(parse("{ int a = 1; } int a = 2;", &sig(&[], 1)).is_ok());
    }

    #[test]
    fn test_break_outside_loop() {
        assert!(parse("break;", &sig(&[], 1)).is_err());
    }
}
