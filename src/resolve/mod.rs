//! Scope resolution: binds every identifier use to a local slot, an upvalue,
//! or a global, and builds the per-function symbol tables the transform
//! passes and the bytecode compiler consume.
//!
//! One top-down traversal with a scope stack. Results live in side tables
//! keyed by `NodeId`, so the AST itself stays a pure ownership tree.

use indexmap::IndexMap;
use std::collections::HashSet;

use crate::ast::{Block, Chunk, Expr, ExprKind, FuncBody, NodeId, Stmt, StmtKind, TableItem};
use crate::error::ResolveError;
use crate::span::Span;

/// Register file limits imposed by the instruction encoding (u8 registers,
/// with headroom above the named locals reserved for expression temporaries).
pub const MAX_LOCALS: usize = 200;
pub const MAX_UPVALUES: usize = 60;

pub type ResolveResult<T> = Result<T, ResolveError>;

/// What an identifier use refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// A local in the current function, at a frame slot.
    Local { slot: u8, decl: NodeId },
    /// A capture from an enclosing function.
    Upvalue { index: u8, decl: NodeId },
    /// Falls through to the global table; looked up by name at runtime.
    Global,
}

/// One upvalue a function captures, in capture order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpvalueSpec {
    pub name: String,
    /// True: captures a local (by slot) of the immediately enclosing
    /// function. False: captures an upvalue (by index) of it.
    pub is_local: bool,
    pub index: u8,
    /// Declaration the chain ultimately resolves to.
    pub decl: NodeId,
}

/// Per-function facts the compiler and transforms need.
#[derive(Debug, Clone, Default)]
pub struct FunctionInfo {
    pub upvalues: Vec<UpvalueSpec>,
    /// High-water mark of named (and hidden loop-control) slots.
    pub max_slots: u8,
    /// A nested closure captures a local declared inside a loop in this
    /// function. Control-flow flattening must skip such functions: hoisting
    /// would merge captures that are per-iteration in the original.
    pub captures_loop_local: bool,
}

/// The resolver's output: side tables over the AST.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Identifier-use expression id -> binding.
    pub bindings: IndexMap<NodeId, Binding>,
    /// Declared name id -> frame slot in its owning function.
    pub slots: IndexMap<NodeId, u8>,
    /// Declared name ids captured by some nested function.
    pub captured: HashSet<NodeId>,
    /// FuncBody id -> per-function info.
    pub functions: IndexMap<NodeId, FunctionInfo>,
    /// Info for the implicit main function of the chunk.
    pub main: FunctionInfo,
}

impl Resolution {
    pub fn binding(&self, id: NodeId) -> Binding {
        *self.bindings.get(&id).unwrap_or(&Binding::Global)
    }

    pub fn slot(&self, decl: NodeId) -> u8 {
        *self.slots.get(&decl).expect("declared name has a slot")
    }

    pub fn function(&self, id: NodeId) -> &FunctionInfo {
        self.functions.get(&id).expect("function was resolved")
    }
}

struct LocalSlot {
    name: String,
    decl: NodeId,
    depth: u32,
    /// Declared lexically inside a loop body of its owning function.
    in_loop: bool,
}

struct FuncScope {
    locals: Vec<LocalSlot>,
    upvalues: Vec<UpvalueSpec>,
    depth: u32,
    loop_depth: u32,
    max_slots: u8,
    captures_loop_local: bool,
}

impl FuncScope {
    fn new() -> Self {
        Self {
            locals: Vec::new(),
            upvalues: Vec::new(),
            depth: 0,
            loop_depth: 0,
            max_slots: 0,
            captures_loop_local: false,
        }
    }
}

/// The resolver. One instance per resolve call.
pub struct Resolver {
    funcs: Vec<FuncScope>,
    out: Resolution,
}

impl Resolver {
    pub fn new() -> Self {
        Self {
            funcs: vec![FuncScope::new()],
            out: Resolution::default(),
        }
    }

    pub fn resolve(mut self, chunk: &Chunk) -> ResolveResult<Resolution> {
        self.resolve_block(&chunk.block)?;
        let main = self.funcs.pop().expect("main scope");
        self.out.main = FunctionInfo {
            upvalues: Vec::new(),
            max_slots: main.max_slots,
            captures_loop_local: main.captures_loop_local,
        };
        Ok(self.out)
    }

    // ===== Scope bookkeeping =====

    fn current(&mut self) -> &mut FuncScope {
        self.funcs.last_mut().expect("at least the main scope")
    }

    fn begin_scope(&mut self) {
        self.current().depth += 1;
    }

    fn end_scope(&mut self) {
        let func = self.current();
        let depth = func.depth;
        while func
            .locals
            .last()
            .is_some_and(|local| local.depth == depth)
        {
            func.locals.pop();
        }
        func.depth -= 1;
    }

    fn declare(&mut self, name: &str, decl: NodeId, span: Span) -> ResolveResult<u8> {
        let in_loop = {
            let func = self.current();
            func.loop_depth > 0
        };
        let func = self.current();
        if func.locals.len() >= MAX_LOCALS {
            return Err(ResolveError::TooManyLocals {
                limit: MAX_LOCALS,
                span,
            });
        }
        let slot = func.locals.len() as u8;
        let depth = func.depth;
        func.locals.push(LocalSlot {
            name: name.to_string(),
            decl,
            depth,
            in_loop,
        });
        func.max_slots = func.max_slots.max(func.locals.len() as u8);
        self.out.slots.insert(decl, slot);
        Ok(slot)
    }

    /// Hidden loop-control slots occupy the frame like locals but are never
    /// nameable, so lookups can't see them.
    fn declare_hidden(&mut self, decl: NodeId, span: Span) -> ResolveResult<u8> {
        self.declare("(for control)", decl, span)
    }

    // ===== Name lookup =====

    fn resolve_use(&mut self, use_id: NodeId, name: &str, span: Span) -> ResolveResult<()> {
        let top = self.funcs.len() - 1;
        let binding = match self.lookup(top, name, span)? {
            Some((slot, decl)) => Binding::Local { slot, decl },
            None => match self.capture_upvalue(top, name, span)? {
                Some((index, decl)) => Binding::Upvalue { index, decl },
                None => Binding::Global,
            },
        };
        self.out.bindings.insert(use_id, binding);
        Ok(())
    }

    /// Search one function's live locals, innermost declaration first.
    fn lookup(
        &mut self,
        func_index: usize,
        name: &str,
        _span: Span,
    ) -> ResolveResult<Option<(u8, NodeId)>> {
        let func = &self.funcs[func_index];
        for (slot, local) in func.locals.iter().enumerate().rev() {
            if local.name == name {
                return Ok(Some((slot as u8, local.decl)));
            }
        }
        Ok(None)
    }

    /// Walk outward, adding upvalue links at each level (the transitive
    /// capture chain). Returns the upvalue index in `func_index`.
    fn capture_upvalue(
        &mut self,
        func_index: usize,
        name: &str,
        span: Span,
    ) -> ResolveResult<Option<(u8, NodeId)>> {
        if func_index == 0 {
            return Ok(None);
        }
        let parent = func_index - 1;

        if let Some((slot, decl)) = self.lookup(parent, name, span)? {
            self.out.captured.insert(decl);
            let in_loop = self.funcs[parent].locals[slot as usize].in_loop;
            if in_loop {
                self.funcs[parent].captures_loop_local = true;
            }
            let index = self.add_upvalue(
                func_index,
                UpvalueSpec {
                    name: name.to_string(),
                    is_local: true,
                    index: slot,
                    decl,
                },
                span,
            )?;
            return Ok(Some((index, decl)));
        }

        if let Some((parent_index, decl)) = self.capture_upvalue(parent, name, span)? {
            let index = self.add_upvalue(
                func_index,
                UpvalueSpec {
                    name: name.to_string(),
                    is_local: false,
                    index: parent_index,
                    decl,
                },
                span,
            )?;
            return Ok(Some((index, decl)));
        }

        Ok(None)
    }

    fn add_upvalue(
        &mut self,
        func_index: usize,
        spec: UpvalueSpec,
        span: Span,
    ) -> ResolveResult<u8> {
        let func = &mut self.funcs[func_index];
        for (i, existing) in func.upvalues.iter().enumerate() {
            if existing.is_local == spec.is_local && existing.index == spec.index {
                return Ok(i as u8);
            }
        }
        if func.upvalues.len() >= MAX_UPVALUES {
            return Err(ResolveError::TooManyUpvalues {
                limit: MAX_UPVALUES,
                span,
            });
        }
        func.upvalues.push(spec);
        Ok((func.upvalues.len() - 1) as u8)
    }

    // ===== Traversal =====

    fn resolve_block(&mut self, block: &Block) -> ResolveResult<()> {
        self.begin_scope();
        for stmt in &block.stmts {
            self.resolve_stmt(stmt)?;
        }
        self.end_scope();
        Ok(())
    }

    /// A block whose scope the caller keeps open (repeat-until, loop bodies
    /// with hidden control slots).
    fn resolve_block_in_current_scope(&mut self, block: &Block) -> ResolveResult<()> {
        for stmt in &block.stmts {
            self.resolve_stmt(stmt)?;
        }
        Ok(())
    }

    fn resolve_stmt(&mut self, stmt: &Stmt) -> ResolveResult<()> {
        match &stmt.kind {
            StmtKind::Expr(expr) => self.resolve_expr(expr),

            StmtKind::Local { names, exprs } => {
                // Initializers see the *outer* binding: `local x = x` reads
                // the enclosing x.
                for expr in exprs {
                    self.resolve_expr(expr)?;
                }
                for name in names {
                    self.declare(&name.text, name.id, name.span)?;
                }
                Ok(())
            }

            StmtKind::Assign { targets, values } => {
                for target in targets {
                    self.resolve_expr(target)?;
                }
                for value in values {
                    self.resolve_expr(value)?;
                }
                Ok(())
            }

            StmtKind::If { arms, else_block } => {
                for (cond, block) in arms {
                    self.resolve_expr(cond)?;
                    self.resolve_block(block)?;
                }
                if let Some(block) = else_block {
                    self.resolve_block(block)?;
                }
                Ok(())
            }

            StmtKind::While { cond, body } => {
                self.resolve_expr(cond)?;
                self.current().loop_depth += 1;
                self.resolve_block(body)?;
                self.current().loop_depth -= 1;
                Ok(())
            }

            StmtKind::Repeat { body, cond } => {
                // The until-condition sees the body's locals, so the body's
                // scope stays open until the condition is resolved.
                self.current().loop_depth += 1;
                self.begin_scope();
                self.resolve_block_in_current_scope(body)?;
                self.resolve_expr(cond)?;
                self.end_scope();
                self.current().loop_depth -= 1;
                Ok(())
            }

            StmtKind::NumericFor {
                var,
                start,
                limit,
                step,
                body,
            } => {
                self.resolve_expr(start)?;
                self.resolve_expr(limit)?;
                if let Some(step) = step {
                    self.resolve_expr(step)?;
                }
                self.current().loop_depth += 1;
                self.begin_scope();
                // Three hidden control slots, then the visible variable at
                // base+3 — the layout ForPrep/ForLoop expect.
                self.declare_hidden(hidden_id(var.id, 1), var.span)?;
                self.declare_hidden(hidden_id(var.id, 2), var.span)?;
                self.declare_hidden(hidden_id(var.id, 3), var.span)?;
                self.declare(&var.text, var.id, var.span)?;
                self.resolve_block_in_current_scope(body)?;
                self.end_scope();
                self.current().loop_depth -= 1;
                Ok(())
            }

            StmtKind::GenericFor { vars, exprs, body } => {
                for expr in exprs {
                    self.resolve_expr(expr)?;
                }
                self.current().loop_depth += 1;
                self.begin_scope();
                let anchor = vars[0].id;
                // Generator, state, control at base..base+2; loop variables
                // follow — the layout TForLoop expects.
                self.declare_hidden(hidden_id(anchor, 1), vars[0].span)?;
                self.declare_hidden(hidden_id(anchor, 2), vars[0].span)?;
                self.declare_hidden(hidden_id(anchor, 3), vars[0].span)?;
                for var in vars {
                    self.declare(&var.text, var.id, var.span)?;
                }
                self.resolve_block_in_current_scope(body)?;
                self.end_scope();
                self.current().loop_depth -= 1;
                Ok(())
            }

            StmtKind::FunctionDecl { name, body } => {
                // `function a.b.c()` assigns into an existing variable; the
                // base name is a plain use.
                self.resolve_use(name.base.id, &name.base.text, name.base.span)?;
                self.resolve_function(body)
            }

            StmtKind::LocalFunction { name, body } => {
                // Declared before the body resolves, so the function can
                // recurse.
                self.declare(&name.text, name.id, name.span)?;
                self.resolve_function(body)
            }

            StmtKind::Return { exprs } => {
                for expr in exprs {
                    self.resolve_expr(expr)?;
                }
                Ok(())
            }

            StmtKind::Break => {
                if self.current().loop_depth == 0 {
                    return Err(ResolveError::BreakOutsideLoop(stmt.span));
                }
                Ok(())
            }

            StmtKind::Do(block) => self.resolve_block(block),
        }
    }

    fn resolve_function(&mut self, body: &FuncBody) -> ResolveResult<()> {
        self.funcs.push(FuncScope::new());
        self.begin_scope();
        for param in &body.params {
            self.declare(&param.text, param.id, param.span)?;
        }
        self.resolve_block_in_current_scope(&body.body)?;
        self.end_scope();

        let func = self.funcs.pop().expect("function scope");
        self.out.functions.insert(
            body.id,
            FunctionInfo {
                upvalues: func.upvalues,
                max_slots: func.max_slots,
                captures_loop_local: func.captures_loop_local,
            },
        );
        Ok(())
    }

    fn resolve_expr(&mut self, expr: &Expr) -> ResolveResult<()> {
        match &expr.kind {
            ExprKind::Nil
            | ExprKind::True
            | ExprKind::False
            | ExprKind::Number(_)
            | ExprKind::Str(_)
            | ExprKind::Vararg => Ok(()),

            ExprKind::Name(text) => self.resolve_use(expr.id, text, expr.span),

            ExprKind::Function(body) => self.resolve_function(body),

            ExprKind::Index { obj, key } => {
                self.resolve_expr(obj)?;
                self.resolve_expr(key)
            }

            ExprKind::Call { func, args } => {
                self.resolve_expr(func)?;
                for arg in args {
                    self.resolve_expr(arg)?;
                }
                Ok(())
            }

            ExprKind::MethodCall { obj, args, .. } => {
                self.resolve_expr(obj)?;
                for arg in args {
                    self.resolve_expr(arg)?;
                }
                Ok(())
            }

            ExprKind::Binary { lhs, rhs, .. } => {
                self.resolve_expr(lhs)?;
                self.resolve_expr(rhs)
            }

            ExprKind::Unary { operand, .. } => self.resolve_expr(operand),

            ExprKind::Table { items } => {
                for item in items {
                    match item {
                        TableItem::Item(value) | TableItem::Named(_, value) => {
                            self.resolve_expr(value)?
                        }
                        TableItem::Keyed(key, value) => {
                            self.resolve_expr(key)?;
                            self.resolve_expr(value)?;
                        }
                    }
                }
                Ok(())
            }

            ExprKind::Paren(inner) => self.resolve_expr(inner),
        }
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Ids for the hidden loop-control slots, derived from the loop variable's
/// id so the compiler can find them without an extra side table.
pub fn hidden_id(anchor: NodeId, n: u32) -> NodeId {
    // Top bit marks hidden ids; parser-issued ids stay below it.
    NodeId(0x8000_0000 | (anchor.0 << 2) | n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Scanner;
    use crate::parser::Parser;

    fn resolve(source: &str) -> Resolution {
        let tokens = Scanner::new(source).scan_tokens().unwrap();
        let chunk = Parser::new(tokens).parse().unwrap();
        Resolver::new().resolve(&chunk).unwrap()
    }

    fn resolve_err(source: &str) -> ResolveError {
        let tokens = Scanner::new(source).scan_tokens().unwrap();
        let chunk = Parser::new(tokens).parse().unwrap();
        Resolver::new().resolve(&chunk).unwrap_err()
    }

    #[test]
    fn binds_local_use_to_slot() {
        let res = resolve("local a = 1 local b = a");
        let bindings: Vec<_> = res.bindings.values().collect();
        assert_eq!(bindings.len(), 1);
        assert!(matches!(bindings[0], Binding::Local { slot: 0, .. }));
    }

    #[test]
    fn unknown_name_is_global() {
        let res = resolve("print(x)");
        assert!(res.bindings.values().all(|b| *b == Binding::Global));
        assert_eq!(res.bindings.len(), 2);
    }

    #[test]
    fn shadowing_rebinds_later_uses_only() {
        let res = resolve("local x = 1 local y = x local x = 2 local z = x");
        let locals: Vec<u8> = res
            .bindings
            .values()
            .filter_map(|b| match b {
                Binding::Local { slot, .. } => Some(*slot),
                _ => None,
            })
            .collect();
        // y reads slot 0, z reads the shadowing slot 2 (after y at 1).
        assert_eq!(locals, vec![0, 2]);
    }

    #[test]
    fn local_initializer_sees_outer_binding() {
        let res = resolve("local x = 1 do local x = x end");
        // The inner initializer's use binds to the *outer* slot 0.
        let inner_use = res
            .bindings
            .values()
            .find(|b| matches!(b, Binding::Local { .. }))
            .unwrap();
        assert!(matches!(inner_use, Binding::Local { slot: 0, .. }));
    }

    #[test]
    fn slots_are_reused_after_scope_exit() {
        let res = resolve("do local a = 1 end local b = 2");
        let slots: Vec<u8> = res.slots.values().copied().collect();
        assert_eq!(slots, vec![0, 0]);
    }

    #[test]
    fn upvalue_capture_direct() {
        let res = resolve("local x = 1 local f = function() return x end");
        let func = res.functions.values().next().unwrap();
        assert_eq!(func.upvalues.len(), 1);
        assert!(func.upvalues[0].is_local);
        assert_eq!(func.upvalues[0].index, 0);
        assert!(!res.captured.is_empty());
    }

    #[test]
    fn upvalue_capture_transitive() {
        let res = resolve(
            "local x = 1\nlocal f = function()\n  return function() return x end\nend",
        );
        // Outer closure captures x as a local; inner captures it as an
        // upvalue of the outer.
        let infos: Vec<&FunctionInfo> = res.functions.values().collect();
        assert_eq!(infos.len(), 2);
        let inner = &infos[0];
        let outer = &infos[1];
        assert!(outer.upvalues[0].is_local);
        assert!(!inner.upvalues[0].is_local);
    }

    #[test]
    fn local_function_can_recurse() {
        let res = resolve("local function f(n) if n > 0 then return f(n - 1) end return 0 end");
        let recursive_use = res
            .bindings
            .values()
            .find(|b| matches!(b, Binding::Local { slot: 0, .. }));
        assert!(recursive_use.is_some());
    }

    #[test]
    fn numeric_for_reserves_control_slots() {
        let res = resolve("for i = 1, 10 do local a = i end");
        // Control slots 0..2, i at 3, a at 4.
        let visible: Vec<u8> = res
            .slots
            .iter()
            .filter(|(id, _)| id.0 < 0x8000_0000)
            .map(|(_, slot)| *slot)
            .collect();
        assert_eq!(visible, vec![3, 4]);
        assert_eq!(res.main.max_slots, 5);
    }

    #[test]
    fn repeat_condition_sees_body_locals() {
        let res = resolve("repeat local done = true until done");
        assert!(res
            .bindings
            .values()
            .any(|b| matches!(b, Binding::Local { .. })));
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        // The parser accepts break as a block closer; the resolver rejects
        // the placement.
        let err = resolve_err("do break end");
        assert!(matches!(err, ResolveError::BreakOutsideLoop(_)));
    }

    #[test]
    fn too_many_locals() {
        let mut source = String::new();
        for i in 0..=MAX_LOCALS {
            source.push_str(&format!("local v{} = {}\n", i, i));
        }
        let err = resolve_err(&source);
        assert!(matches!(err, ResolveError::TooManyLocals { .. }));
    }

    #[test]
    fn marks_loop_local_capture() {
        let res = resolve(
            "local fs = {}\nfor i = 1, 3 do\n  fs[i] = function() return i end\nend",
        );
        assert!(res.main.captures_loop_local);
    }

    #[test]
    fn plain_capture_is_not_loop_capture() {
        let res = resolve("local x = 1\nlocal f = function() return x end");
        assert!(!res.main.captures_loop_local);
    }

    #[test]
    fn method_self_is_param_zero() {
        let res = resolve("local t = {} function t:m() return self end");
        let func = res.functions.values().next().unwrap();
        assert!(func.upvalues.is_empty());
        let self_binding = res
            .bindings
            .values()
            .find(|b| matches!(b, Binding::Local { slot: 0, .. }));
        assert!(self_binding.is_some());
    }
}
