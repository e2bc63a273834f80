//! Expression lowering.

use crate::ast::{BinaryOp, Expr, ExprKind, TableItem, UnaryOp};
use crate::bytecode::compiler::{CompileResult, Compiler};
use crate::bytecode::instruction::{Instruction, OpCode, MULTI};
use crate::bytecode::proto::Constant;
use crate::error::CompileError;
use crate::resolve::Binding;

impl Compiler<'_> {
    /// Evaluate `expr` into exactly one value in register `dest`.
    /// Temporaries allocate above the current watermark and are released.
    pub(crate) fn compile_expr_to(&mut self, expr: &Expr, dest: u8) -> CompileResult<()> {
        if let Some(n) = fold_number(expr) {
            let k = self.add_const(Constant::Number(n));
            self.emit(Instruction::ab(OpCode::LoadK, dest, k));
            return Ok(());
        }

        match &expr.kind {
            ExprKind::Nil => {
                self.emit(Instruction::ab(OpCode::LoadNil, dest, dest as u32));
            }
            ExprKind::True => {
                self.emit(Instruction::ab(OpCode::LoadBool, dest, 1));
            }
            ExprKind::False => {
                self.emit(Instruction::ab(OpCode::LoadBool, dest, 0));
            }
            ExprKind::Number(n) => {
                let k = self.add_const(Constant::Number(*n));
                self.emit(Instruction::ab(OpCode::LoadK, dest, k));
            }
            ExprKind::Str(bytes) => {
                let k = self.add_const(Constant::Str(bytes.clone()));
                self.emit(Instruction::ab(OpCode::LoadK, dest, k));
            }

            ExprKind::Vararg => {
                if !self.state().is_vararg {
                    return Err(CompileError::internal(
                        "vararg expression outside vararg function",
                        expr.span,
                    ));
                }
                self.emit(Instruction::ab(OpCode::Vararg, dest, 2));
            }

            ExprKind::Name(text) => match self.binding_of(expr.id) {
                Binding::Local { slot, .. } => {
                    if slot != dest {
                        self.emit(Instruction::ab(OpCode::Move, dest, slot as u32));
                    }
                }
                Binding::Upvalue { index, .. } => {
                    self.emit(Instruction::ab(OpCode::GetUpval, dest, index as u32));
                }
                Binding::Global => {
                    let k = self.string_const(text);
                    self.emit(Instruction::ab(OpCode::GetGlobal, dest, k));
                }
            },

            ExprKind::Paren(inner) => {
                // Parentheses truncate to one value, which single-value
                // context already guarantees.
                self.compile_expr_to(inner, dest)?;
            }

            ExprKind::Function(body) => {
                let proto = self.compile_func_body(body)?;
                self.emit(Instruction::ab(OpCode::Closure, dest, proto));
            }

            ExprKind::Index { obj, key } => {
                let (obj_reg, obj_temp) = self.expr_operand(obj)?;
                let (key_reg, key_temp) = self.expr_operand(key)?;
                self.emit(Instruction::new(
                    OpCode::GetIndex,
                    dest,
                    obj_reg as u32,
                    key_reg as u32,
                ));
                if key_temp {
                    self.free_to(key_reg);
                }
                if obj_temp {
                    self.free_to(obj_reg);
                }
            }

            ExprKind::Call { .. } | ExprKind::MethodCall { .. } => {
                let base = self.state().free_reg;
                self.compile_call(expr, base, 2)?;
                if base != dest {
                    self.emit(Instruction::ab(OpCode::Move, dest, base as u32));
                }
            }

            ExprKind::Binary { op, lhs, rhs } => {
                self.compile_binary(*op, lhs, rhs, dest, expr.span)?;
            }

            ExprKind::Unary { op, operand } => {
                let (reg, is_temp) = self.expr_operand(operand)?;
                let opcode = match op {
                    UnaryOp::Neg => OpCode::Unm,
                    UnaryOp::Not => OpCode::Not,
                    UnaryOp::Len => OpCode::Len,
                };
                self.emit(Instruction::ab(opcode, dest, reg as u32));
                if is_temp {
                    self.free_to(reg);
                }
            }

            ExprKind::Table { items } => {
                self.compile_table(items, dest, expr)?;
            }
        }
        Ok(())
    }

    /// Get a register holding the expression's value: locals are used in
    /// place, everything else goes through a temporary the caller frees.
    pub(crate) fn expr_operand(&mut self, expr: &Expr) -> CompileResult<(u8, bool)> {
        if let ExprKind::Name(_) = &expr.kind {
            if let Binding::Local { slot, .. } = self.binding_of(expr.id) {
                return Ok((slot, false));
            }
        }
        let temp = self.alloc_reg(expr.span)?;
        self.compile_expr_to(expr, temp)?;
        Ok((temp, true))
    }

    fn compile_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        dest: u8,
        span: crate::span::Span,
    ) -> CompileResult<()> {
        match op {
            BinaryOp::And | BinaryOp::Or => {
                // Short-circuit through a dedicated temporary: writing
                // straight into `dest` could clobber a slot the right side
                // still reads.
                let temp = self.alloc_reg(span)?;
                self.compile_expr_to(lhs, temp)?;
                let want_truthy = if op == BinaryOp::Or { 1 } else { 0 };
                let skip = self.emit_jump(OpCode::Test, temp, want_truthy);
                self.compile_expr_to(rhs, temp)?;
                self.patch_jump(skip);
                if temp != dest {
                    self.emit(Instruction::ab(OpCode::Move, dest, temp as u32));
                }
                self.free_to(temp);
                Ok(())
            }

            BinaryOp::Add
            | BinaryOp::Sub
            | BinaryOp::Mul
            | BinaryOp::Div
            | BinaryOp::Mod
            | BinaryOp::Pow
            | BinaryOp::Concat => {
                let opcode = match op {
                    BinaryOp::Add => OpCode::Add,
                    BinaryOp::Sub => OpCode::Sub,
                    BinaryOp::Mul => OpCode::Mul,
                    BinaryOp::Div => OpCode::Div,
                    BinaryOp::Mod => OpCode::Mod,
                    BinaryOp::Pow => OpCode::Pow,
                    BinaryOp::Concat => OpCode::Concat,
                    _ => unreachable!(),
                };
                let (lreg, ltemp) = self.expr_operand(lhs)?;
                let (rreg, rtemp) = self.expr_operand(rhs)?;
                self.emit(Instruction::new(opcode, dest, lreg as u32, rreg as u32));
                if rtemp {
                    self.free_to(rreg);
                }
                if ltemp {
                    self.free_to(lreg);
                }
                Ok(())
            }

            BinaryOp::Eq | BinaryOp::NotEq => {
                let (lreg, ltemp) = self.expr_operand(lhs)?;
                let (rreg, rtemp) = self.expr_operand(rhs)?;
                self.emit(Instruction::new(OpCode::Eq, dest, lreg as u32, rreg as u32));
                if op == BinaryOp::NotEq {
                    self.emit(Instruction::ab(OpCode::Not, dest, dest as u32));
                }
                if rtemp {
                    self.free_to(rreg);
                }
                if ltemp {
                    self.free_to(lreg);
                }
                Ok(())
            }

            BinaryOp::Less | BinaryOp::LessEq | BinaryOp::Greater | BinaryOp::GreaterEq => {
                // a > b lowers to b < a, a >= b to b <= a.
                let swapped = matches!(op, BinaryOp::Greater | BinaryOp::GreaterEq);
                let opcode = match op {
                    BinaryOp::Less | BinaryOp::Greater => OpCode::Lt,
                    _ => OpCode::Le,
                };
                let (lreg, ltemp) = self.expr_operand(lhs)?;
                let (rreg, rtemp) = self.expr_operand(rhs)?;
                let (first, second) = if swapped { (rreg, lreg) } else { (lreg, rreg) };
                self.emit(Instruction::new(
                    opcode,
                    dest,
                    first as u32,
                    second as u32,
                ));
                if rtemp {
                    self.free_to(rreg);
                }
                if ltemp {
                    self.free_to(lreg);
                }
                Ok(())
            }
        }
    }

    /// Evaluate a multi-valued expression (call or `...`) at `base` with the
    /// given Lua-style result encoding (`count + 1`, or 0 to keep all).
    pub(crate) fn compile_multi(
        &mut self,
        expr: &Expr,
        base: u8,
        results_plus1: u32,
    ) -> CompileResult<()> {
        match &expr.kind {
            ExprKind::Call { .. } | ExprKind::MethodCall { .. } => {
                self.compile_call(expr, base, results_plus1)
            }
            ExprKind::Vararg => {
                if !self.state().is_vararg {
                    return Err(CompileError::internal(
                        "vararg expression outside vararg function",
                        expr.span,
                    ));
                }
                self.reserve_through(base);
                self.emit(Instruction::ab(OpCode::Vararg, base, results_plus1));
                Ok(())
            }
            _ => Err(CompileError::internal(
                "multi-value context on single-valued expression",
                expr.span,
            )),
        }
    }

    /// Compile a call expression with the callee at `base` and arguments
    /// above it. `results_plus1` follows the Lua encoding.
    pub(crate) fn compile_call(
        &mut self,
        expr: &Expr,
        base: u8,
        results_plus1: u32,
    ) -> CompileResult<()> {
        match &expr.kind {
            ExprKind::Call { func, args } => {
                self.reserve_through(base);
                self.compile_expr_to(func, base)?;
                let b = self.compile_args(args, base + 1, 0)?;
                self.emit(Instruction::new(OpCode::Call, base, b, results_plus1));
                self.free_to(base + 1);
                Ok(())
            }
            ExprKind::MethodCall { obj, name, args } => {
                self.reserve_through(base + 1);
                self.compile_expr_to(obj, base)?;
                let k = self.string_const(name);
                self.emit(Instruction::new(OpCode::SelfIndex, base, base as u32, k));
                let b = self.compile_args(args, base + 2, 1)?;
                self.emit(Instruction::new(OpCode::Call, base, b, results_plus1));
                self.free_to(base + 1);
                Ok(())
            }
            _ => Err(CompileError::internal(
                "call lowering on non-call expression",
                expr.span,
            )),
        }
    }

    /// Arguments at `args_base..`; returns the Lua-style argument count
    /// encoding, `extra` counting a method receiver already in place.
    fn compile_args(&mut self, args: &[Expr], args_base: u8, extra: u32) -> CompileResult<u32> {
        if args.is_empty() {
            return Ok(extra + 1);
        }
        let last = args.len() - 1;
        for (i, arg) in args.iter().enumerate() {
            let dest = args_base + i as u8;
            self.reserve_through(dest);
            if i == last && arg.is_multi_valued() {
                self.compile_multi(arg, dest, MULTI)?;
                return Ok(MULTI);
            }
            self.compile_expr_to(arg, dest)?;
        }
        Ok(args.len() as u32 + extra + 1)
    }

    fn compile_table(
        &mut self,
        items: &[TableItem],
        dest: u8,
        expr: &Expr,
    ) -> CompileResult<()> {
        self.emit(Instruction::a_only(OpCode::NewTable, dest));

        let mut array_index = 1u32;
        let last = items.len().saturating_sub(1);
        for (i, item) in items.iter().enumerate() {
            match item {
                TableItem::Item(value) => {
                    if i == last && value.is_multi_valued() {
                        let base = self.state().free_reg;
                        self.reserve_through(base);
                        self.compile_multi(value, base, MULTI)?;
                        self.emit(Instruction::new(
                            OpCode::SetList,
                            dest,
                            base as u32,
                            array_index,
                        ));
                        self.free_to(base);
                        continue;
                    }
                    let val = self.alloc_reg(value.span)?;
                    self.compile_expr_to(value, val)?;
                    let k = self.add_const(Constant::Number(array_index as f64));
                    let key = self.alloc_reg(expr.span)?;
                    self.emit(Instruction::ab(OpCode::LoadK, key, k));
                    self.emit(Instruction::new(
                        OpCode::SetIndex,
                        dest,
                        key as u32,
                        val as u32,
                    ));
                    self.free_to(val);
                    array_index += 1;
                }
                TableItem::Named(name, value) => {
                    let val = self.alloc_reg(value.span)?;
                    self.compile_expr_to(value, val)?;
                    let k = self.string_const(name);
                    let key = self.alloc_reg(expr.span)?;
                    self.emit(Instruction::ab(OpCode::LoadK, key, k));
                    self.emit(Instruction::new(
                        OpCode::SetIndex,
                        dest,
                        key as u32,
                        val as u32,
                    ));
                    self.free_to(val);
                }
                TableItem::Keyed(key_expr, value) => {
                    let key = self.alloc_reg(key_expr.span)?;
                    self.compile_expr_to(key_expr, key)?;
                    let val = self.alloc_reg(value.span)?;
                    self.compile_expr_to(value, val)?;
                    self.emit(Instruction::new(
                        OpCode::SetIndex,
                        dest,
                        key as u32,
                        val as u32,
                    ));
                    self.free_to(key);
                }
            }
        }
        Ok(())
    }
}

/// Fold literal numeric arithmetic. Lua number arithmetic is total (1/0 is
/// inf, 0/0 is nan), so folding any of these cannot change error behavior.
/// Concat and comparisons are never folded; string-pass decrypt calls are
/// calls and therefore unreachable here by construction.
fn fold_number(expr: &Expr) -> Option<f64> {
    match &expr.kind {
        ExprKind::Number(n) => Some(*n),
        ExprKind::Paren(inner) => fold_number(inner),
        ExprKind::Unary {
            op: UnaryOp::Neg,
            operand,
        } => fold_number(operand).map(|n| -n),
        ExprKind::Binary { op, lhs, rhs } => {
            let a = fold_number(lhs)?;
            let b = fold_number(rhs)?;
            match op {
                BinaryOp::Add => Some(a + b),
                BinaryOp::Sub => Some(a - b),
                BinaryOp::Mul => Some(a * b),
                BinaryOp::Div => Some(a / b),
                // Lua modulo: a - floor(a/b)*b
                BinaryOp::Mod => Some(a - (a / b).floor() * b),
                BinaryOp::Pow => Some(a.powf(b)),
                _ => None,
            }
        }
        _ => None,
    }
}
