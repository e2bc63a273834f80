//! Bytecode compiler: lowers the resolved AST into a prototype tree.
//!
//! Single pass, one `FuncState` per function with the enclosing states kept
//! on a stack. Named locals occupy the frame slots the resolver assigned;
//! expression temporaries allocate above the live locals through a free-
//! register watermark and are released statement by statement.

use crate::ast::{Chunk, FuncBody, Name, NodeId};
use crate::bytecode::instruction::{Instruction, OpCode};
use crate::bytecode::proto::{ConstPool, Constant, FunctionProto, UpvalueDescriptor};
use crate::error::CompileError;
use crate::resolve::Resolution;
use crate::span::Span;

pub type CompileResult<T> = Result<T, CompileError>;

/// Placeholder jump target, patched before the function is finished.
pub(crate) const UNPATCHED: u32 = u32::MAX;

/// Per-function compilation state.
pub(crate) struct FuncState {
    pub(crate) num_params: u8,
    pub(crate) is_vararg: bool,
    pub(crate) code: Vec<Instruction>,
    pub(crate) pool: ConstPool,
    pub(crate) protos: Vec<FunctionProto>,
    pub(crate) upvalues: Vec<UpvalueDescriptor>,
    /// Live named (and hidden loop-control) slots.
    pub(crate) nlocals: u8,
    /// First free register for temporaries; reset to `nlocals` between
    /// statements.
    pub(crate) free_reg: u8,
    /// High-water mark of touched registers.
    pub(crate) max_reg: u8,
    pub(crate) scopes: Vec<Scope>,
    pub(crate) loops: Vec<LoopCtx>,
}

pub(crate) struct Scope {
    /// `nlocals` at scope entry.
    pub(crate) base: u8,
    /// A local declared in this scope is captured by a nested closure.
    pub(crate) has_captured: bool,
}

pub(crate) struct LoopCtx {
    /// Jumps to patch to the loop exit.
    pub(crate) break_jumps: Vec<usize>,
    /// `scopes` depth at loop entry; scopes above it belong to the loop.
    pub(crate) scope_marker: usize,
    /// `nlocals` at loop entry, the base for upvalue closing on break.
    pub(crate) base_slot: u8,
}

impl FuncState {
    fn new(num_params: u8, is_vararg: bool) -> Self {
        Self {
            num_params,
            is_vararg,
            code: Vec::new(),
            pool: ConstPool::new(),
            protos: Vec::new(),
            upvalues: Vec::new(),
            nlocals: 0,
            free_reg: 0,
            max_reg: 0,
            scopes: Vec::new(),
            loops: Vec::new(),
        }
    }
}

/// The compiler. Borrows the resolver's side tables for the whole run.
pub struct Compiler<'a> {
    pub(crate) res: &'a Resolution,
    pub(crate) funcs: Vec<FuncState>,
}

impl<'a> Compiler<'a> {
    pub fn new(res: &'a Resolution) -> Self {
        Self {
            res,
            funcs: vec![FuncState::new(0, true)],
        }
    }

    /// Compile a resolved chunk into the root prototype.
    pub fn compile(mut self, chunk: &Chunk) -> CompileResult<FunctionProto> {
        self.begin_scope();
        for stmt in &chunk.block.stmts {
            self.compile_stmt(stmt)?;
        }
        self.end_scope(true);
        self.emit(Instruction::ab(OpCode::Return, 0, 1));

        let state = self.funcs.pop().expect("root function state");
        Ok(finish(state))
    }

    // ===== Function nesting =====

    /// Compile a nested function body; returns its proto index in the
    /// current function.
    pub(crate) fn compile_func_body(&mut self, body: &FuncBody) -> CompileResult<u32> {
        let info = self.res.function(body.id);
        let descriptors: Vec<UpvalueDescriptor> = info
            .upvalues
            .iter()
            .map(|u| UpvalueDescriptor {
                is_local: u.is_local,
                index: u.index,
            })
            .collect();

        self.funcs
            .push(FuncState::new(body.params.len() as u8, body.is_vararg));
        self.begin_scope();
        for param in &body.params {
            self.declare_local(param)?;
        }
        for stmt in &body.body.stmts {
            self.compile_stmt(stmt)?;
        }
        self.end_scope(true);
        self.emit(Instruction::ab(OpCode::Return, 0, 1));

        let mut state = self.funcs.pop().expect("function state");
        state.upvalues = descriptors;
        let proto = finish(state);

        let parent = self.state();
        parent.protos.push(proto);
        Ok((parent.protos.len() - 1) as u32)
    }

    // ===== State access and emission =====

    pub(crate) fn state(&mut self) -> &mut FuncState {
        self.funcs.last_mut().expect("at least the root state")
    }

    pub(crate) fn emit(&mut self, instruction: Instruction) -> usize {
        let code = &mut self.state().code;
        code.push(instruction);
        code.len() - 1
    }

    /// Emit a jump-shaped instruction with an unpatched target in `b`.
    pub(crate) fn emit_jump(&mut self, op: OpCode, a: u8, c: u32) -> usize {
        self.emit(Instruction::new(op, a, UNPATCHED, c))
    }

    /// Point a previously emitted jump at the current position.
    pub(crate) fn patch_jump(&mut self, index: usize) {
        let target = self.here();
        self.patch_jump_to(index, target);
    }

    pub(crate) fn patch_jump_to(&mut self, index: usize, target: u32) {
        let instr = &mut self.state().code[index];
        debug_assert_eq!(instr.b, UNPATCHED, "jump patched twice");
        instr.b = target;
    }

    /// Current program counter (the index the next instruction will get).
    pub(crate) fn here(&mut self) -> u32 {
        self.state().code.len() as u32
    }

    pub(crate) fn add_const(&mut self, constant: Constant) -> u32 {
        self.state().pool.add(constant)
    }

    pub(crate) fn string_const(&mut self, text: &str) -> u32 {
        self.add_const(Constant::Str(text.as_bytes().to_vec()))
    }

    // ===== Register allocation =====

    pub(crate) fn alloc_reg(&mut self, span: Span) -> CompileResult<u8> {
        let state = self.state();
        if state.free_reg == u8::MAX {
            return Err(CompileError::internal("register file exhausted", span));
        }
        let reg = state.free_reg;
        state.free_reg += 1;
        state.max_reg = state.max_reg.max(state.free_reg);
        Ok(reg)
    }

    /// Make sure `reg` is reserved and temporaries start above it.
    pub(crate) fn reserve_through(&mut self, reg: u8) {
        let state = self.state();
        state.free_reg = state.free_reg.max(reg + 1);
        state.max_reg = state.max_reg.max(state.free_reg);
    }

    pub(crate) fn free_to(&mut self, reg: u8) {
        let state = self.state();
        debug_assert!(reg >= state.nlocals, "freed into live locals");
        state.free_reg = reg;
    }

    /// Release all temporaries; called between statements.
    pub(crate) fn settle(&mut self) {
        let state = self.state();
        state.free_reg = state.nlocals;
    }

    // ===== Scopes and locals =====

    pub(crate) fn begin_scope(&mut self) {
        let base = self.state().nlocals;
        self.state().scopes.push(Scope {
            base,
            has_captured: false,
        });
    }

    /// Close the scope: drop its locals and, when `emit_close` and a local
    /// was captured, emit the upvalue close for its slots.
    pub(crate) fn end_scope(&mut self, emit_close: bool) {
        let scope = self.state().scopes.pop().expect("scope underflow");
        if emit_close && scope.has_captured {
            self.emit(Instruction::a_only(OpCode::Close, scope.base));
        }
        let state = self.state();
        state.nlocals = scope.base;
        state.free_reg = scope.base;
    }

    /// Emit the close a scope would emit, without popping it (repeat-until
    /// runs it before the loop-back test).
    pub(crate) fn emit_scope_close(&mut self) {
        let (base, captured) = {
            let scope = self.state().scopes.last().expect("scope");
            (scope.base, scope.has_captured)
        };
        if captured {
            self.emit(Instruction::a_only(OpCode::Close, base));
        }
    }

    /// Declare a named local at the next slot; the slot must agree with the
    /// resolver's assignment.
    pub(crate) fn declare_local(&mut self, name: &Name) -> CompileResult<u8> {
        let slot = self.state().nlocals;
        debug_assert_eq!(
            self.res.slot(name.id),
            slot,
            "compiler and resolver disagree on slot for '{}'",
            name.text
        );
        if self.res.captured.contains(&name.id) {
            if let Some(scope) = self.state().scopes.last_mut() {
                scope.has_captured = true;
            }
        }
        let state = self.state();
        state.nlocals = slot + 1;
        state.free_reg = state.free_reg.max(state.nlocals);
        state.max_reg = state.max_reg.max(state.free_reg);
        Ok(slot)
    }

    /// Declare a hidden loop-control slot.
    pub(crate) fn declare_hidden(&mut self) -> u8 {
        let state = self.state();
        let slot = state.nlocals;
        state.nlocals = slot + 1;
        state.free_reg = state.free_reg.max(state.nlocals);
        state.max_reg = state.max_reg.max(state.free_reg);
        slot
    }

    // ===== Loops =====

    pub(crate) fn enter_loop(&mut self) {
        let state = self.state();
        let marker = state.scopes.len();
        let base = state.nlocals;
        state.loops.push(LoopCtx {
            break_jumps: Vec::new(),
            scope_marker: marker,
            base_slot: base,
        });
    }

    /// Patch every break in the innermost loop to the current position.
    pub(crate) fn exit_loop(&mut self) {
        let ctx = self.state().loops.pop().expect("loop underflow");
        for jump in ctx.break_jumps {
            self.patch_jump(jump);
        }
    }

    /// Record a break jump; closes loop-scoped upvalues first if any were
    /// captured so far.
    pub(crate) fn compile_break(&mut self, span: Span) -> CompileResult<()> {
        let state = self.state();
        let Some(ctx) = state.loops.last() else {
            return Err(CompileError::internal("break outside loop", span));
        };
        let base = ctx.base_slot;
        let marker = ctx.scope_marker;
        let needs_close = state.scopes[marker..].iter().any(|s| s.has_captured);
        if needs_close {
            self.emit(Instruction::a_only(OpCode::Close, base));
        }
        let jump = self.emit_jump(OpCode::Jmp, 0, 0);
        self.state()
            .loops
            .last_mut()
            .expect("loop")
            .break_jumps
            .push(jump);
        Ok(())
    }

    // ===== Binding helpers =====

    pub(crate) fn binding_of(&self, id: NodeId) -> crate::resolve::Binding {
        self.res.binding(id)
    }
}

/// Seal a function state into its prototype.
fn finish(state: FuncState) -> FunctionProto {
    FunctionProto {
        num_params: state.num_params,
        is_vararg: state.is_vararg,
        // One spare register so Call setup always has room.
        max_stack: state.max_reg.saturating_add(1),
        upvalues: state.upvalues,
        constants: state.pool.into_vec(),
        code: state.code,
        protos: state.protos,
    }
}
