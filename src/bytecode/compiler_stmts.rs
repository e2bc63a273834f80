//! Statement lowering.

use crate::ast::{Block, Expr, ExprKind, FuncName, Name, Stmt, StmtKind};
use crate::bytecode::compiler::{CompileResult, Compiler, UNPATCHED};
use crate::bytecode::instruction::{Instruction, OpCode, MULTI};
use crate::bytecode::proto::Constant;
use crate::error::CompileError;
use crate::resolve::Binding;

impl Compiler<'_> {
    pub(crate) fn compile_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                // Statement position: the call's results are discarded.
                let base = self.state().free_reg;
                self.compile_call(expr, base, 1)?;
            }

            StmtKind::Local { names, exprs } => {
                let base = self.state().nlocals;
                self.compile_expr_list_to(exprs, base, names.len())?;
                for name in names {
                    self.declare_local(name)?;
                }
            }

            StmtKind::Assign { targets, values } => {
                self.compile_assign(targets, values)?;
            }

            StmtKind::If { arms, else_block } => {
                let mut end_jumps = Vec::new();
                let arm_count = arms.len();
                for (i, (cond, block)) in arms.iter().enumerate() {
                    let (reg, is_temp) = self.expr_operand(cond)?;
                    let next = self.emit_jump(OpCode::Test, reg, 0);
                    if is_temp {
                        self.free_to(reg);
                    }
                    self.compile_block(block)?;
                    let is_last = i + 1 == arm_count && else_block.is_none();
                    if !is_last {
                        end_jumps.push(self.emit_jump(OpCode::Jmp, 0, 0));
                    }
                    self.patch_jump(next);
                }
                if let Some(block) = else_block {
                    self.compile_block(block)?;
                }
                for jump in end_jumps {
                    self.patch_jump(jump);
                }
            }

            StmtKind::While { cond, body } => {
                let start = self.here();
                let (reg, is_temp) = self.expr_operand(cond)?;
                let exit = self.emit_jump(OpCode::Test, reg, 0);
                if is_temp {
                    self.free_to(reg);
                }
                self.enter_loop();
                self.compile_block(body)?;
                self.emit(Instruction::ab(OpCode::Jmp, 0, start));
                self.patch_jump(exit);
                self.exit_loop();
            }

            StmtKind::Repeat { body, cond } => {
                let start = self.here();
                self.enter_loop();
                self.begin_scope();
                for stmt in &body.stmts {
                    self.compile_stmt(stmt)?;
                }
                // The condition sees the body's locals; close their upvalues
                // on every iteration boundary, then loop back while false.
                let (reg, _) = self.expr_operand(cond)?;
                self.emit_scope_close();
                self.emit(Instruction::new(OpCode::Test, reg, start, 0));
                self.end_scope(false);
                self.exit_loop();
            }

            StmtKind::NumericFor {
                var,
                start,
                limit,
                step,
                body,
            } => {
                self.enter_loop();
                self.begin_scope();
                let base = self.state().nlocals;

                self.reserve_through(base);
                self.compile_expr_to(start, base)?;
                self.reserve_through(base + 1);
                self.compile_expr_to(limit, base + 1)?;
                self.reserve_through(base + 2);
                match step {
                    Some(step) => self.compile_expr_to(step, base + 2)?,
                    None => {
                        let k = self.add_const(Constant::Number(1.0));
                        self.emit(Instruction::ab(OpCode::LoadK, base + 2, k));
                    }
                }

                self.declare_hidden();
                self.declare_hidden();
                self.declare_hidden();
                self.declare_local(var)?;

                let prep = self.emit_jump(OpCode::ForPrep, base, 0);
                let body_start = self.here();
                for stmt in &body.stmts {
                    self.compile_stmt(stmt)?;
                }
                // Each iteration closes captured loop locals before the
                // next ForLoop step, so closures see per-iteration values.
                self.patch_jump(prep);
                self.emit_scope_close();
                self.emit(Instruction::ab(OpCode::ForLoop, base, body_start));

                self.end_scope(false);
                self.exit_loop();
            }

            StmtKind::GenericFor { vars, exprs, body } => {
                self.enter_loop();
                self.begin_scope();
                let base = self.state().nlocals;

                // Generator, state, control.
                self.compile_expr_list_to(exprs, base, 3)?;
                self.declare_hidden();
                self.declare_hidden();
                self.declare_hidden();
                for var in vars {
                    self.declare_local(var)?;
                }

                let head = self.here();
                let tfor = self.emit(Instruction::new(
                    OpCode::TForLoop,
                    base,
                    vars.len() as u32,
                    UNPATCHED,
                ));
                for stmt in &body.stmts {
                    self.compile_stmt(stmt)?;
                }
                self.emit_scope_close();
                self.emit(Instruction::ab(OpCode::Jmp, 0, head));
                let exit = self.here();
                self.state().code[tfor].c = exit;

                self.end_scope(false);
                self.exit_loop();
            }

            StmtKind::FunctionDecl { name, body } => {
                self.compile_function_decl(name, body)?;
            }

            StmtKind::LocalFunction { name, body } => {
                let slot = self.declare_local(name)?;
                let proto = self.compile_func_body(body)?;
                self.emit(Instruction::ab(OpCode::Closure, slot, proto));
            }

            StmtKind::Return { exprs } => {
                if exprs.is_empty() {
                    self.emit(Instruction::ab(OpCode::Return, 0, 1));
                } else {
                    let base = self.state().free_reg;
                    let b = self.compile_expr_list_open(exprs, base)?;
                    self.emit(Instruction::ab(OpCode::Return, base, b));
                }
            }

            StmtKind::Break => {
                self.compile_break(stmt.span)?;
            }

            StmtKind::Do(block) => {
                self.compile_block(block)?;
            }
        }

        self.settle();
        Ok(())
    }

    pub(crate) fn compile_block(&mut self, block: &Block) -> CompileResult<()> {
        self.begin_scope();
        for stmt in &block.stmts {
            self.compile_stmt(stmt)?;
        }
        self.end_scope(true);
        Ok(())
    }

    // ===== Assignment =====

    fn compile_assign(&mut self, targets: &[Expr], values: &[Expr]) -> CompileResult<()> {
        if targets.len() == 1 {
            return self.compile_single_assign(&targets[0], &values[0], &values[1..]);
        }

        // Multiple assignment: all values first (adjusted to the target
        // count), then the stores.
        let base = self.state().free_reg;
        self.compile_expr_list_to(values, base, targets.len())?;
        self.reserve_through(base + targets.len() as u8 - 1);
        for (i, target) in targets.iter().enumerate() {
            self.store_into(target, base + i as u8)?;
        }
        Ok(())
    }

    /// `x = v` with any extra values still evaluated for their effects.
    fn compile_single_assign(
        &mut self,
        target: &Expr,
        value: &Expr,
        extra: &[Expr],
    ) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Name(_) => match self.binding_of(target.id) {
                Binding::Local { slot, .. } => {
                    // Table constructors write their destination before
                    // evaluating items, so they go through a temporary.
                    if matches!(value.kind, ExprKind::Table { .. }) {
                        let temp = self.alloc_reg(value.span)?;
                        self.compile_expr_to(value, temp)?;
                        self.emit(Instruction::ab(OpCode::Move, slot, temp as u32));
                        self.free_to(temp);
                    } else {
                        self.compile_expr_to(value, slot)?;
                    }
                }
                Binding::Upvalue { index, .. } => {
                    let temp = self.alloc_reg(value.span)?;
                    self.compile_expr_to(value, temp)?;
                    self.emit(Instruction::ab(OpCode::SetUpval, temp, index as u32));
                    self.free_to(temp);
                }
                Binding::Global => {
                    let name = match &target.kind {
                        ExprKind::Name(text) => text.clone(),
                        _ => unreachable!(),
                    };
                    let temp = self.alloc_reg(value.span)?;
                    self.compile_expr_to(value, temp)?;
                    let k = self.string_const(&name);
                    self.emit(Instruction::ab(OpCode::SetGlobal, temp, k));
                    self.free_to(temp);
                }
            },
            ExprKind::Index { obj, key } => {
                let (obj_reg, obj_temp) = self.expr_operand(obj)?;
                let (key_reg, key_temp) = self.expr_operand(key)?;
                let val = self.alloc_reg(value.span)?;
                self.compile_expr_to(value, val)?;
                self.emit(Instruction::new(
                    OpCode::SetIndex,
                    obj_reg,
                    key_reg as u32,
                    val as u32,
                ));
                self.free_to(val);
                if key_temp {
                    self.free_to(key_reg);
                }
                if obj_temp {
                    self.free_to(obj_reg);
                }
            }
            _ => {
                return Err(CompileError::internal(
                    "assignment target is not a variable",
                    target.span,
                ))
            }
        }

        // `a = f(), g()` still runs g.
        for expr in extra {
            let temp = self.alloc_reg(expr.span)?;
            self.compile_expr_to(expr, temp)?;
            self.free_to(temp);
        }
        Ok(())
    }

    /// Store register `src` into an assignment target.
    fn store_into(&mut self, target: &Expr, src: u8) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Name(text) => match self.binding_of(target.id) {
                Binding::Local { slot, .. } => {
                    self.emit(Instruction::ab(OpCode::Move, slot, src as u32));
                }
                Binding::Upvalue { index, .. } => {
                    self.emit(Instruction::ab(OpCode::SetUpval, src, index as u32));
                }
                Binding::Global => {
                    let k = self.string_const(text);
                    self.emit(Instruction::ab(OpCode::SetGlobal, src, k));
                }
            },
            ExprKind::Index { obj, key } => {
                let (obj_reg, obj_temp) = self.expr_operand(obj)?;
                let (key_reg, key_temp) = self.expr_operand(key)?;
                self.emit(Instruction::new(
                    OpCode::SetIndex,
                    obj_reg,
                    key_reg as u32,
                    src as u32,
                ));
                if key_temp {
                    self.free_to(key_reg);
                }
                if obj_temp {
                    self.free_to(obj_reg);
                }
            }
            _ => {
                return Err(CompileError::internal(
                    "assignment target is not a variable",
                    target.span,
                ))
            }
        }
        Ok(())
    }

    // ===== Function declarations =====

    fn compile_function_decl(
        &mut self,
        name: &FuncName,
        body: &crate::ast::FuncBody,
    ) -> CompileResult<()> {
        let proto = self.compile_func_body(body)?;

        let mut keys: Vec<&str> = name.path.iter().map(|s| s.as_str()).collect();
        if let Some(method) = &name.method {
            keys.push(method.as_str());
        }

        if keys.is_empty() {
            // Plain `function f()` assigns to the variable f.
            return self.store_closure_into_name(&name.base, proto);
        }

        // `function a.b.c()` / `function a.b:m()` — walk the prefix, then
        // set the final key.
        let obj = self.alloc_reg(name.base.span)?;
        self.compile_name_use(&name.base, obj)?;
        let final_key = keys.pop().expect("at least one key");
        for seg in keys {
            let k = self.string_const(seg);
            let key_reg = self.alloc_reg(name.base.span)?;
            self.emit(Instruction::ab(OpCode::LoadK, key_reg, k));
            self.emit(Instruction::new(
                OpCode::GetIndex,
                obj,
                obj as u32,
                key_reg as u32,
            ));
            self.free_to(key_reg);
        }
        let closure = self.alloc_reg(body.span)?;
        self.emit(Instruction::ab(OpCode::Closure, closure, proto));
        let k = self.string_const(final_key);
        let key_reg = self.alloc_reg(name.base.span)?;
        self.emit(Instruction::ab(OpCode::LoadK, key_reg, k));
        self.emit(Instruction::new(
            OpCode::SetIndex,
            obj,
            key_reg as u32,
            closure as u32,
        ));
        self.free_to(obj);
        Ok(())
    }

    fn store_closure_into_name(&mut self, name: &Name, proto: u32) -> CompileResult<()> {
        match self.res.binding(name.id) {
            Binding::Local { slot, .. } => {
                self.emit(Instruction::ab(OpCode::Closure, slot, proto));
            }
            Binding::Upvalue { index, .. } => {
                let temp = self.alloc_reg(name.span)?;
                self.emit(Instruction::ab(OpCode::Closure, temp, proto));
                self.emit(Instruction::ab(OpCode::SetUpval, temp, index as u32));
                self.free_to(temp);
            }
            Binding::Global => {
                let temp = self.alloc_reg(name.span)?;
                self.emit(Instruction::ab(OpCode::Closure, temp, proto));
                let k = self.string_const(&name.text);
                self.emit(Instruction::ab(OpCode::SetGlobal, temp, k));
                self.free_to(temp);
            }
        }
        Ok(())
    }

    /// Load the value of a (possibly global) name into `dest`.
    pub(crate) fn compile_name_use(&mut self, name: &Name, dest: u8) -> CompileResult<()> {
        match self.res.binding(name.id) {
            Binding::Local { slot, .. } => {
                if slot != dest {
                    self.emit(Instruction::ab(OpCode::Move, dest, slot as u32));
                }
            }
            Binding::Upvalue { index, .. } => {
                self.emit(Instruction::ab(OpCode::GetUpval, dest, index as u32));
            }
            Binding::Global => {
                let k = self.string_const(&name.text);
                self.emit(Instruction::ab(OpCode::GetGlobal, dest, k));
            }
        }
        Ok(())
    }

    // ===== Expression lists =====

    /// Evaluate `exprs` into exactly `want` registers at `base..`,
    /// following Lua's adjustment rules (pad with nil, spread a trailing
    /// multi-valued expression, evaluate extras for their effects).
    pub(crate) fn compile_expr_list_to(
        &mut self,
        exprs: &[Expr],
        base: u8,
        want: usize,
    ) -> CompileResult<()> {
        if exprs.is_empty() {
            if want > 0 {
                self.reserve_through(base + want as u8 - 1);
                self.emit(Instruction::ab(
                    OpCode::LoadNil,
                    base,
                    (base + want as u8 - 1) as u32,
                ));
            }
            return Ok(());
        }

        let last = exprs.len() - 1;
        for (i, expr) in exprs.iter().enumerate() {
            let have = i;
            if i < last {
                if have < want {
                    let dest = base + i as u8;
                    self.reserve_through(dest);
                    self.compile_expr_to(expr, dest)?;
                } else {
                    // Surplus expression: evaluate, discard.
                    let temp = self.alloc_reg(expr.span)?;
                    self.compile_expr_to(expr, temp)?;
                    self.free_to(temp);
                }
                continue;
            }

            // Last expression fills the remaining slots.
            let remaining = want.saturating_sub(have);
            match remaining {
                0 => {
                    let temp = self.alloc_reg(expr.span)?;
                    self.compile_expr_to(expr, temp)?;
                    self.free_to(temp);
                }
                1 => {
                    let dest = base + i as u8;
                    self.reserve_through(dest);
                    self.compile_expr_to(expr, dest)?;
                }
                _ => {
                    let dest = base + i as u8;
                    self.reserve_through(dest);
                    if expr.is_multi_valued() {
                        self.compile_multi(expr, dest, remaining as u32 + 1)?;
                        self.reserve_through(base + want as u8 - 1);
                    } else {
                        self.compile_expr_to(expr, dest)?;
                        self.reserve_through(base + want as u8 - 1);
                        self.emit(Instruction::ab(
                            OpCode::LoadNil,
                            dest + 1,
                            (base + want as u8 - 1) as u32,
                        ));
                    }
                }
            }
        }
        if want > 0 {
            self.reserve_through(base + want as u8 - 1);
        }
        Ok(())
    }

    /// Evaluate `exprs` at `base..` leaving the trailing expression open if
    /// it is multi-valued. Returns the Lua-style count encoding (count + 1,
    /// or 0 for "to top").
    pub(crate) fn compile_expr_list_open(
        &mut self,
        exprs: &[Expr],
        base: u8,
    ) -> CompileResult<u32> {
        let last = exprs.len() - 1;
        for (i, expr) in exprs.iter().enumerate() {
            let dest = base + i as u8;
            self.reserve_through(dest);
            if i == last && expr.is_multi_valued() {
                self.compile_multi(expr, dest, MULTI)?;
                return Ok(MULTI);
            }
            self.compile_expr_to(expr, dest)?;
        }
        Ok(exprs.len() as u32 + 1)
    }
}
