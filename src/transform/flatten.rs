//! Control-flow flattening.
//!
//! Each function body is linearized into numbered basic blocks driven by a
//! dispatch loop:
//!
//! ```text
//! local <hoisted locals...>
//! local STATE = <entry>
//! while STATE ~= 0 do
//!   if STATE == n1 then ... STATE = n2
//!   elseif STATE == n2 then ...
//!   end
//! end
//! ```
//!
//! Locals of the flattened region are renamed to fresh unique names and
//! hoisted into the dispatcher preamble, so cross-block visibility is
//! preserved and shadowing can never recombine. Expressions are moved, not
//! rewritten: evaluation order and short-circuiting are untouched. Structured
//! `break` becomes a transition to the loop's exit state; code after an
//! unconditional `return`/`break` survives as dead dispatch states.
//!
//! Safety precondition, checked per function: if a nested closure captures a
//! local declared inside a loop, hoisting would merge captures that are
//! per-iteration in the original, so that function is left structured (its
//! nested functions still flatten independently). Functions whose hoisted
//! local count would breach the register file are likewise left structured.

use std::collections::{HashMap, HashSet};

use crate::ast::{
    BinaryOp, Block, Chunk, Expr, ExprKind, FuncBody, Name, NodeId, NodeIdGen, Stmt, StmtKind,
    TableItem,
};
use crate::error::TransformError;
use crate::resolve::{Binding, Resolution};
use crate::span::Span;
use crate::transform::build::{collect_identifiers, AstBuilder};
use crate::transform::context::BuildContext;

/// Dispatch tables beyond this are refused outright.
pub const MAX_STATES: usize = 60_000;

/// Hoisting budget: leave headroom under the resolver's 200-local limit.
const MAX_HOISTED: usize = 150;

/// Flatten every function in the chunk (the main body included) that
/// passes the safety preconditions.
pub fn flatten_control_flow(
    chunk: &mut Chunk,
    res: &Resolution,
    ctx: &mut BuildContext,
) -> Result<(), TransformError> {
    ctx.reserve_names(collect_identifiers(chunk));
    let mut ids = NodeIdGen::starting_after(chunk);

    let mut pass = Flatten {
        res,
        ctx,
        ids: &mut ids,
    };
    let main_safe = !res.main.captures_loop_local;
    pass.flatten_function_block(&mut chunk.block, main_safe)?;

    chunk.id_bound = ids.bound();
    Ok(())
}

struct Flatten<'a> {
    res: &'a Resolution,
    ctx: &'a mut BuildContext,
    ids: &'a mut NodeIdGen,
}

/// Working state for one function's dispatcher.
struct Dispatch {
    state_name: String,
    /// (state number, statements) per block, in creation order.
    blocks: Vec<(u32, Vec<Stmt>)>,
    numbers: HashSet<u32>,
    /// Names synthesized during lowering (loop temporaries, decoys).
    extra_locals: Vec<String>,
}

impl Flatten<'_> {
    fn flatten_function_block(
        &mut self,
        block: &mut Block,
        safe: bool,
    ) -> Result<(), TransformError> {
        if safe {
            self.flatten_body(block)?;
        }
        self.recurse_block(block)?;
        Ok(())
    }

    // ===== Nested functions =====

    fn recurse_block(&mut self, block: &mut Block) -> Result<(), TransformError> {
        for stmt in &mut block.stmts {
            self.recurse_stmt(stmt)?;
        }
        Ok(())
    }

    fn recurse_stmt(&mut self, stmt: &mut Stmt) -> Result<(), TransformError> {
        match &mut stmt.kind {
            StmtKind::Expr(e) => self.recurse_expr(e),
            StmtKind::Local { exprs, .. } => {
                for e in exprs {
                    self.recurse_expr(e)?;
                }
                Ok(())
            }
            StmtKind::Assign { targets, values } => {
                for e in targets.iter_mut().chain(values.iter_mut()) {
                    self.recurse_expr(e)?;
                }
                Ok(())
            }
            StmtKind::If { arms, else_block } => {
                for (cond, block) in arms {
                    self.recurse_expr(cond)?;
                    self.recurse_block(block)?;
                }
                if let Some(block) = else_block {
                    self.recurse_block(block)?;
                }
                Ok(())
            }
            StmtKind::While { cond, body } => {
                self.recurse_expr(cond)?;
                self.recurse_block(body)
            }
            StmtKind::Repeat { body, cond } => {
                self.recurse_block(body)?;
                self.recurse_expr(cond)
            }
            StmtKind::NumericFor {
                start,
                limit,
                step,
                body,
                ..
            } => {
                self.recurse_expr(start)?;
                self.recurse_expr(limit)?;
                if let Some(step) = step {
                    self.recurse_expr(step)?;
                }
                self.recurse_block(body)
            }
            StmtKind::GenericFor { exprs, body, .. } => {
                for e in exprs {
                    self.recurse_expr(e)?;
                }
                self.recurse_block(body)
            }
            StmtKind::FunctionDecl { body, .. } => self.recurse_func(body),
            StmtKind::LocalFunction { body, .. } => self.recurse_func(body),
            StmtKind::Return { exprs } => {
                for e in exprs {
                    self.recurse_expr(e)?;
                }
                Ok(())
            }
            StmtKind::Break => Ok(()),
            StmtKind::Do(block) => self.recurse_block(block),
        }
    }

    fn recurse_expr(&mut self, expr: &mut Expr) -> Result<(), TransformError> {
        match &mut expr.kind {
            ExprKind::Function(body) => self.recurse_func(body),
            ExprKind::Index { obj, key } => {
                self.recurse_expr(obj)?;
                self.recurse_expr(key)
            }
            ExprKind::Call { func, args } => {
                self.recurse_expr(func)?;
                for a in args {
                    self.recurse_expr(a)?;
                }
                Ok(())
            }
            ExprKind::MethodCall { obj, args, .. } => {
                self.recurse_expr(obj)?;
                for a in args {
                    self.recurse_expr(a)?;
                }
                Ok(())
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                self.recurse_expr(lhs)?;
                self.recurse_expr(rhs)
            }
            ExprKind::Unary { operand, .. } => self.recurse_expr(operand),
            ExprKind::Table { items } => {
                for item in items {
                    match item {
                        TableItem::Item(v) | TableItem::Named(_, v) => self.recurse_expr(v)?,
                        TableItem::Keyed(k, v) => {
                            self.recurse_expr(k)?;
                            self.recurse_expr(v)?;
                        }
                    }
                }
                Ok(())
            }
            ExprKind::Paren(inner) => self.recurse_expr(inner),
            _ => Ok(()),
        }
    }

    fn recurse_func(&mut self, body: &mut FuncBody) -> Result<(), TransformError> {
        let safe = self
            .res
            .functions
            .get(&body.id)
            .map(|info| !info.captures_loop_local)
            .unwrap_or(false);
        self.flatten_function_block(&mut body.body, safe)
    }

    // ===== Flattening one body =====

    fn flatten_body(&mut self, block: &mut Block) -> Result<(), TransformError> {
        let decls = collect_decls(block);
        let loop_count = count_loops(block);
        if decls.len() + 3 * loop_count + 4 > MAX_HOISTED {
            return Ok(()); // leave structured, still within semantics
        }

        // Rename every region-local to a fresh unique name, declaration
        // sites and bound uses alike (including uses inside nested bodies).
        let mut renames: HashMap<NodeId, String> = HashMap::new();
        let mut hoisted: Vec<String> = Vec::new();
        for decl in &decls {
            let fresh = self.ctx.fresh_name();
            renames.insert(*decl, fresh.clone());
            hoisted.push(fresh);
        }
        rename_block(block, &renames, self.res);

        let mut dispatch = Dispatch {
            state_name: self.ctx.fresh_name(),
            blocks: Vec::new(),
            numbers: HashSet::new(),
            extra_locals: Vec::new(),
        };

        let stmts = std::mem::take(&mut block.stmts);
        let (entry_index, entry_number) = self.new_state(&mut dispatch);
        let tail = self.lower_stmts(&mut dispatch, stmts, entry_index, None)?;
        let state_name = dispatch.state_name.clone();
        let exit = self.goto(&state_name, 0.0);
        dispatch.blocks[tail].1.push(exit);

        if dispatch.blocks.len() > MAX_STATES {
            return Err(TransformError::TooManyStates {
                limit: MAX_STATES,
                span: Span::synthetic(),
            });
        }

        if self.ctx.memes() {
            self.add_decoy_states(&mut dispatch);
        }

        block.stmts = self.build_dispatcher(dispatch, hoisted, entry_number);
        Ok(())
    }

    fn new_state(&mut self, dispatch: &mut Dispatch) -> (usize, f64) {
        let number = self.ctx.fresh_state_number(&mut dispatch.numbers);
        dispatch.blocks.push((number, Vec::new()));
        (dispatch.blocks.len() - 1, number as f64)
    }

    /// `STATE = n`
    fn goto(&mut self, state_name: &str, number: f64) -> Stmt {
        let mut b = AstBuilder::new(self.ids);
        let value = b.num(number);
        b.assign_name(state_name, value)
    }

    fn lower_stmts(
        &mut self,
        d: &mut Dispatch,
        stmts: Vec<Stmt>,
        entry: usize,
        break_target: Option<f64>,
    ) -> Result<usize, TransformError> {
        let mut cur = entry;
        let state_name = d.state_name.clone();

        for stmt in stmts {
            match stmt.kind {
                StmtKind::If { arms, else_block } => {
                    let (cont_index, cont_number) = self.new_state(d);
                    let mut dispatch_arms = Vec::with_capacity(arms.len());
                    for (cond, arm_block) in arms {
                        let (arm_index, arm_number) = self.new_state(d);
                        let tail =
                            self.lower_stmts(d, arm_block.stmts, arm_index, break_target)?;
                        let jump = self.goto(&state_name, cont_number);
                        d.blocks[tail].1.push(jump);
                        let enter = self.goto(&state_name, arm_number);
                        dispatch_arms.push((cond, Block::new(vec![enter])));
                    }
                    let else_stmts = match else_block {
                        Some(else_block) => {
                            let (else_index, else_number) = self.new_state(d);
                            let tail = self.lower_stmts(
                                d,
                                else_block.stmts,
                                else_index,
                                break_target,
                            )?;
                            let jump = self.goto(&state_name, cont_number);
                            d.blocks[tail].1.push(jump);
                            vec![self.goto(&state_name, else_number)]
                        }
                        None => vec![self.goto(&state_name, cont_number)],
                    };
                    let mut b = AstBuilder::new(self.ids);
                    let dispatch_if = b.stmt(StmtKind::If {
                        arms: dispatch_arms,
                        else_block: Some(Block::new(else_stmts)),
                    });
                    d.blocks[cur].1.push(dispatch_if);
                    cur = cont_index;
                }

                StmtKind::While { cond, body } => {
                    let (head_index, head_number) = self.new_state(d);
                    let (body_index, body_number) = self.new_state(d);
                    let (cont_index, cont_number) = self.new_state(d);

                    let enter = self.goto(&state_name, head_number);
                    d.blocks[cur].1.push(enter);

                    let to_body = self.goto(&state_name, body_number);
                    let to_cont = self.goto(&state_name, cont_number);
                    let mut b = AstBuilder::new(self.ids);
                    let branch = b.if_else(cond, vec![to_body], vec![to_cont]);
                    d.blocks[head_index].1.push(branch);

                    let tail =
                        self.lower_stmts(d, body.stmts, body_index, Some(cont_number))?;
                    let back = self.goto(&state_name, head_number);
                    d.blocks[tail].1.push(back);

                    cur = cont_index;
                }

                StmtKind::Repeat { body, cond } => {
                    let (body_index, body_number) = self.new_state(d);
                    let (cont_index, cont_number) = self.new_state(d);

                    let enter = self.goto(&state_name, body_number);
                    d.blocks[cur].1.push(enter);

                    let tail =
                        self.lower_stmts(d, body.stmts, body_index, Some(cont_number))?;
                    let to_cont = self.goto(&state_name, cont_number);
                    let to_body = self.goto(&state_name, body_number);
                    let mut b = AstBuilder::new(self.ids);
                    let branch = b.if_else(cond, vec![to_cont], vec![to_body]);
                    d.blocks[tail].1.push(branch);

                    cur = cont_index;
                }

                StmtKind::NumericFor {
                    var,
                    start,
                    limit,
                    step,
                    body,
                } => {
                    cur = self.lower_numeric_for(
                        d, cur, var, start, limit, step, body, break_target,
                    )?;
                }

                StmtKind::GenericFor { vars, exprs, body } => {
                    cur = self.lower_generic_for(d, cur, vars, exprs, body)?;
                }

                StmtKind::Break => {
                    if let Some(target) = break_target {
                        let jump = self.goto(&state_name, target);
                        d.blocks[cur].1.push(jump);
                    }
                    // Anything after an unconditional break survives as a
                    // dead dispatch state.
                    let (dead_index, _) = self.new_state(d);
                    cur = dead_index;
                }

                StmtKind::Return { exprs } => {
                    let mut b = AstBuilder::new(self.ids);
                    let ret = b.stmt(StmtKind::Return { exprs });
                    d.blocks[cur].1.push(ret);
                    let (dead_index, _) = self.new_state(d);
                    cur = dead_index;
                }

                StmtKind::Do(inner) => {
                    cur = self.lower_stmts(d, inner.stmts, cur, break_target)?;
                }

                StmtKind::Local { names, exprs } => {
                    // Hoisted: the declaration becomes a plain assignment,
                    // explicitly nil when there was no initializer so each
                    // pass through the block resets the variable.
                    let mut b = AstBuilder::new(self.ids);
                    let values = if exprs.is_empty() {
                        names.iter().map(|_| b.nil()).collect()
                    } else {
                        exprs
                    };
                    let targets = names.iter().map(|n| b.name(&n.text)).collect();
                    let assign = b.stmt(StmtKind::Assign { targets, values });
                    d.blocks[cur].1.push(assign);
                }

                StmtKind::LocalFunction { name, body } => {
                    let mut b = AstBuilder::new(self.ids);
                    let func = b.expr(ExprKind::Function(body));
                    let assign = b.assign_name(&name.text, func);
                    d.blocks[cur].1.push(assign);
                }

                other => {
                    d.blocks[cur].1.push(Stmt::new(other, stmt.span));
                }
            }
        }

        Ok(cur)
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_numeric_for(
        &mut self,
        d: &mut Dispatch,
        cur: usize,
        var: Name,
        start: Expr,
        limit: Expr,
        step: Option<Expr>,
        body: Block,
        _break_target: Option<f64>,
    ) -> Result<usize, TransformError> {
        let state_name = d.state_name.clone();
        let counter = self.ctx.fresh_name();
        let limit_name = self.ctx.fresh_name();
        let step_name = self.ctx.fresh_name();
        d.extra_locals
            .extend([counter.clone(), limit_name.clone(), step_name.clone()]);

        // counter = start + 0 etc: the +0 reproduces the numeric coercion
        // a for-loop header performs.
        {
            let mut b = AstBuilder::new(self.ids);
            let zero = b.num(0.0);
            let coerced = b.binary(BinaryOp::Add, start, zero);
            let init = b.assign_name(&counter, coerced);
            d.blocks[cur].1.push(init);
            let zero = b.num(0.0);
            let coerced = b.binary(BinaryOp::Add, limit, zero);
            let init = b.assign_name(&limit_name, coerced);
            d.blocks[cur].1.push(init);
            let step_expr = step.unwrap_or_else(|| b.num(1.0));
            let zero = b.num(0.0);
            let coerced = b.binary(BinaryOp::Add, step_expr, zero);
            let init = b.assign_name(&step_name, coerced);
            d.blocks[cur].1.push(init);
        }

        let (head_index, head_number) = self.new_state(d);
        let (body_index, body_number) = self.new_state(d);
        let (cont_index, cont_number) = self.new_state(d);

        let enter = self.goto(&state_name, head_number);
        d.blocks[cur].1.push(enter);

        // (step > 0 and counter <= limit) or (step <= 0 and counter >= limit)
        {
            let mut b = AstBuilder::new(self.ids);
            let pos = {
                let s = b.name(&step_name);
                let z = b.num(0.0);
                let sgt = b.binary(BinaryOp::Greater, s, z);
                let c = b.name(&counter);
                let l = b.name(&limit_name);
                let cle = b.binary(BinaryOp::LessEq, c, l);
                b.binary(BinaryOp::And, sgt, cle)
            };
            let neg = {
                let s = b.name(&step_name);
                let z = b.num(0.0);
                let sle = b.binary(BinaryOp::LessEq, s, z);
                let c = b.name(&counter);
                let l = b.name(&limit_name);
                let cge = b.binary(BinaryOp::GreaterEq, c, l);
                b.binary(BinaryOp::And, sle, cge)
            };
            let cond = b.binary(BinaryOp::Or, pos, neg);
            let to_body = self.goto(&state_name, body_number);
            let to_cont = self.goto(&state_name, cont_number);
            let mut b = AstBuilder::new(self.ids);
            let branch = b.if_else(cond, vec![to_body], vec![to_cont]);
            d.blocks[head_index].1.push(branch);
        }

        // Body entry copies the counter into the user's loop variable.
        let mut body_stmts = Vec::with_capacity(body.stmts.len() + 1);
        {
            let mut b = AstBuilder::new(self.ids);
            let c = b.name(&counter);
            body_stmts.push(b.assign_name(&var.text, c));
        }
        body_stmts.extend(body.stmts);

        let tail = self.lower_stmts(d, body_stmts, body_index, Some(cont_number))?;
        {
            let mut b = AstBuilder::new(self.ids);
            let c = b.name(&counter);
            let s = b.name(&step_name);
            let sum = b.binary(BinaryOp::Add, c, s);
            let advance = b.assign_name(&counter, sum);
            d.blocks[tail].1.push(advance);
            let back = self.goto(&state_name, head_number);
            d.blocks[tail].1.push(back);
        }

        Ok(cont_index)
    }

    fn lower_generic_for(
        &mut self,
        d: &mut Dispatch,
        cur: usize,
        vars: Vec<Name>,
        exprs: Vec<Expr>,
        body: Block,
    ) -> Result<usize, TransformError> {
        let state_name = d.state_name.clone();
        let gen = self.ctx.fresh_name();
        let state_arg = self.ctx.fresh_name();
        let control = self.ctx.fresh_name();
        d.extra_locals
            .extend([gen.clone(), state_arg.clone(), control.clone()]);

        {
            let mut b = AstBuilder::new(self.ids);
            let targets = [gen.clone(), state_arg.clone(), control.clone()];
            let init = b.assign_names(&targets, exprs);
            d.blocks[cur].1.push(init);
        }

        let (head_index, head_number) = self.new_state(d);
        let (body_index, body_number) = self.new_state(d);
        let (cont_index, cont_number) = self.new_state(d);

        let enter = self.goto(&state_name, head_number);
        d.blocks[cur].1.push(enter);

        // v1..vn = gen(state, control); if v1 == nil then exit else
        // control = v1 and enter the body.
        {
            let var_names: Vec<String> = vars.iter().map(|v| v.text.clone()).collect();
            let mut b = AstBuilder::new(self.ids);
            let callee = b.name(&gen);
            let a1 = b.name(&state_arg);
            let a2 = b.name(&control);
            let call = b.call(callee, vec![a1, a2]);
            let step = b.assign_names(&var_names, vec![call]);
            d.blocks[head_index].1.push(step);

            let v1 = b.name(&var_names[0]);
            let nil = b.nil();
            let done = b.binary(BinaryOp::Eq, v1, nil);
            let to_cont = self.goto(&state_name, cont_number);
            let mut b = AstBuilder::new(self.ids);
            let v1 = b.name(&var_names[0]);
            let update = b.assign_name(&control, v1);
            let to_body = self.goto(&state_name, body_number);
            let mut b = AstBuilder::new(self.ids);
            let branch = b.if_else(done, vec![to_cont], vec![update, to_body]);
            d.blocks[head_index].1.push(branch);
        }

        let tail = self.lower_stmts(d, body.stmts, body_index, Some(cont_number))?;
        let back = self.goto(&state_name, head_number);
        d.blocks[tail].1.push(back);

        Ok(cont_index)
    }

    /// Unreachable junk states, added under the memes toggle only.
    fn add_decoy_states(&mut self, d: &mut Dispatch) {
        let decoy_var = self.ctx.fresh_name();
        d.extra_locals.push(decoy_var.clone());
        let count = 1 + self.ctx.gen_range(2);
        for _ in 0..count {
            let (index, _) = self.new_state(d);
            let junk = (self.ctx.gen_range(100_000)) as f64;
            let existing = d.blocks[self.ctx.gen_range(d.blocks.len())].0 as f64;
            let state_name = d.state_name.clone();
            let mut b = AstBuilder::new(self.ids);
            let value = b.num(junk);
            let noise = b.assign_name(&decoy_var, value);
            d.blocks[index].1.push(noise);
            let jump = self.goto(&state_name, existing);
            d.blocks[index].1.push(jump);
        }
    }

    /// Assemble the final body: hoisted locals, the state variable, and the
    /// dispatch loop with its arms in shuffled order.
    fn build_dispatcher(
        &mut self,
        dispatch: Dispatch,
        mut hoisted: Vec<String>,
        entry_number: f64,
    ) -> Vec<Stmt> {
        let Dispatch {
            state_name,
            mut blocks,
            extra_locals,
            ..
        } = dispatch;
        hoisted.extend(extra_locals);

        // Fisher-Yates over the arm order.
        for i in (1..blocks.len()).rev() {
            let j = self.ctx.gen_range(i + 1);
            blocks.swap(i, j);
        }

        let mut b = AstBuilder::new(self.ids);
        let mut stmts = Vec::with_capacity(3);

        if !hoisted.is_empty() {
            let names = hoisted.iter().map(|n| b.decl_name(n)).collect();
            stmts.push(b.local(names, Vec::new()));
        }

        let state_decl_name = b.decl_name(&state_name);
        let entry = b.num(entry_number);
        stmts.push(b.local(vec![state_decl_name], vec![entry]));

        let arms = blocks
            .into_iter()
            .map(|(number, body)| {
                let lhs = b.name(&state_name);
                let rhs = b.num(number as f64);
                let cond = b.binary(BinaryOp::Eq, lhs, rhs);
                (cond, Block::new(body))
            })
            .collect();
        let dispatch_if = b.stmt(StmtKind::If {
            arms,
            else_block: None,
        });

        let lhs = b.name(&state_name);
        let rhs = b.num(0.0);
        let running = b.binary(BinaryOp::NotEq, lhs, rhs);
        stmts.push(b.stmt(StmtKind::While {
            cond: running,
            body: Block::new(vec![dispatch_if]),
        }));

        stmts
    }
}

// ===== Declaration collection and renaming =====

/// Declared names of a function body, nested function bodies excluded.
fn collect_decls(block: &Block) -> Vec<NodeId> {
    let mut out = Vec::new();
    collect_decls_block(block, &mut out);
    out
}

fn collect_decls_block(block: &Block, out: &mut Vec<NodeId>) {
    for stmt in &block.stmts {
        match &stmt.kind {
            StmtKind::Local { names, .. } => out.extend(names.iter().map(|n| n.id)),
            StmtKind::LocalFunction { name, .. } => out.push(name.id),
            StmtKind::If { arms, else_block } => {
                for (_, block) in arms {
                    collect_decls_block(block, out);
                }
                if let Some(block) = else_block {
                    collect_decls_block(block, out);
                }
            }
            StmtKind::While { body, .. } | StmtKind::Repeat { body, .. } => {
                collect_decls_block(body, out)
            }
            StmtKind::NumericFor { var, body, .. } => {
                out.push(var.id);
                collect_decls_block(body, out);
            }
            StmtKind::GenericFor { vars, body, .. } => {
                out.extend(vars.iter().map(|v| v.id));
                collect_decls_block(body, out);
            }
            StmtKind::Do(block) => collect_decls_block(block, out),
            _ => {}
        }
    }
}

fn count_loops(block: &Block) -> usize {
    let mut count = 0;
    for stmt in &block.stmts {
        match &stmt.kind {
            StmtKind::NumericFor { body, .. } | StmtKind::GenericFor { body, .. } => {
                count += 1;
                count += count_loops(body);
            }
            StmtKind::While { body, .. } | StmtKind::Repeat { body, .. } => {
                count += count_loops(body);
            }
            StmtKind::If { arms, else_block } => {
                for (_, b) in arms {
                    count += count_loops(b);
                }
                if let Some(b) = else_block {
                    count += count_loops(b);
                }
            }
            StmtKind::Do(b) => count += count_loops(b),
            _ => {}
        }
    }
    count
}

fn rename_block(block: &mut Block, renames: &HashMap<NodeId, String>, res: &Resolution) {
    for stmt in &mut block.stmts {
        rename_stmt(stmt, renames, res);
    }
}

fn rename_name_decl(name: &mut Name, renames: &HashMap<NodeId, String>) {
    if let Some(fresh) = renames.get(&name.id) {
        name.text = fresh.clone();
    }
}

fn rename_stmt(stmt: &mut Stmt, renames: &HashMap<NodeId, String>, res: &Resolution) {
    match &mut stmt.kind {
        StmtKind::Expr(e) => rename_expr(e, renames, res),
        StmtKind::Local { names, exprs } => {
            for e in exprs {
                rename_expr(e, renames, res);
            }
            for n in names {
                rename_name_decl(n, renames);
            }
        }
        StmtKind::Assign { targets, values } => {
            for e in targets.iter_mut().chain(values.iter_mut()) {
                rename_expr(e, renames, res);
            }
        }
        StmtKind::If { arms, else_block } => {
            for (cond, block) in arms {
                rename_expr(cond, renames, res);
                rename_block(block, renames, res);
            }
            if let Some(block) = else_block {
                rename_block(block, renames, res);
            }
        }
        StmtKind::While { cond, body } => {
            rename_expr(cond, renames, res);
            rename_block(body, renames, res);
        }
        StmtKind::Repeat { body, cond } => {
            rename_block(body, renames, res);
            rename_expr(cond, renames, res);
        }
        StmtKind::NumericFor {
            var,
            start,
            limit,
            step,
            body,
        } => {
            rename_expr(start, renames, res);
            rename_expr(limit, renames, res);
            if let Some(step) = step {
                rename_expr(step, renames, res);
            }
            rename_name_decl(var, renames);
            rename_block(body, renames, res);
        }
        StmtKind::GenericFor { vars, exprs, body } => {
            for e in exprs {
                rename_expr(e, renames, res);
            }
            for v in vars {
                rename_name_decl(v, renames);
            }
            rename_block(body, renames, res);
        }
        StmtKind::FunctionDecl { name, body } => {
            rename_use(&mut name.base.text, name.base.id, renames, res);
            rename_block(&mut body.body, renames, res);
        }
        StmtKind::LocalFunction { name, body } => {
            rename_name_decl(name, renames);
            rename_block(&mut body.body, renames, res);
        }
        StmtKind::Return { exprs } => {
            for e in exprs {
                rename_expr(e, renames, res);
            }
        }
        StmtKind::Break => {}
        StmtKind::Do(block) => rename_block(block, renames, res),
    }
}

fn rename_use(
    text: &mut String,
    id: NodeId,
    renames: &HashMap<NodeId, String>,
    res: &Resolution,
) {
    let decl = match res.binding(id) {
        Binding::Local { decl, .. } | Binding::Upvalue { decl, .. } => decl,
        Binding::Global => return,
    };
    if let Some(fresh) = renames.get(&decl) {
        *text = fresh.clone();
    }
}

fn rename_expr(expr: &mut Expr, renames: &HashMap<NodeId, String>, res: &Resolution) {
    let id = expr.id;
    match &mut expr.kind {
        ExprKind::Name(text) => rename_use(text, id, renames, res),
        ExprKind::Function(body) => rename_block(&mut body.body, renames, res),
        ExprKind::Index { obj, key } => {
            rename_expr(obj, renames, res);
            rename_expr(key, renames, res);
        }
        ExprKind::Call { func, args } => {
            rename_expr(func, renames, res);
            for a in args {
                rename_expr(a, renames, res);
            }
        }
        ExprKind::MethodCall { obj, args, .. } => {
            rename_expr(obj, renames, res);
            for a in args {
                rename_expr(a, renames, res);
            }
        }
        ExprKind::Binary { lhs, rhs, .. } => {
            rename_expr(lhs, renames, res);
            rename_expr(rhs, renames, res);
        }
        ExprKind::Unary { operand, .. } => rename_expr(operand, renames, res),
        ExprKind::Table { items } => {
            for item in items {
                match item {
                    TableItem::Item(v) | TableItem::Named(_, v) => {
                        rename_expr(v, renames, res)
                    }
                    TableItem::Keyed(k, v) => {
                        rename_expr(k, renames, res);
                        rename_expr(v, renames, res);
                    }
                }
            }
        }
        ExprKind::Paren(inner) => rename_expr(inner, renames, res),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Scanner;
    use crate::parser::Parser;
    use crate::resolve::Resolver;

    fn flatten_source(source: &str) -> Chunk {
        let tokens = Scanner::new(source).scan_tokens().unwrap();
        let mut chunk = Parser::new(tokens).parse().unwrap();
        let res = Resolver::new().resolve(&chunk).unwrap();
        let mut ctx = BuildContext::with_seed(42, false);
        flatten_control_flow(&mut chunk, &res, &mut ctx).unwrap();
        chunk
    }

    fn dispatcher_shape(chunk: &Chunk) -> (&Stmt, &Stmt) {
        let stmts = &chunk.block.stmts;
        let while_stmt = stmts.last().unwrap();
        let state_decl = &stmts[stmts.len() - 2];
        (state_decl, while_stmt)
    }

    #[test]
    fn body_becomes_dispatch_loop() {
        let chunk = flatten_source("local x = 1\nprint(x)");
        let (state_decl, while_stmt) = dispatcher_shape(&chunk);
        assert!(matches!(state_decl.kind, StmtKind::Local { .. }));
        match &while_stmt.kind {
            StmtKind::While { body, .. } => {
                assert_eq!(body.stmts.len(), 1);
                assert!(matches!(body.stmts[0].kind, StmtKind::If { .. }));
            }
            other => panic!("expected dispatch while, got {:?}", other),
        }
    }

    #[test]
    fn while_loop_becomes_states() {
        let chunk = flatten_source("local i = 0\nwhile i < 3 do i = i + 1 end\nprint(i)");
        match &chunk.block.stmts.last().unwrap().kind {
            StmtKind::While { body, .. } => match &body.stmts[0].kind {
                // Head, body, continuation, entry: at least four arms.
                StmtKind::If { arms, .. } => assert!(arms.len() >= 4),
                other => panic!("expected dispatch if, got {:?}", other),
            },
            other => panic!("expected while, got {:?}", other),
        }
    }

    #[test]
    fn locals_are_hoisted_and_renamed() {
        let chunk = flatten_source("local x = 1\nlocal y = x + 1\nprint(y)");
        match &chunk.block.stmts[0].kind {
            StmtKind::Local { names, exprs } => {
                assert_eq!(names.len(), 2);
                assert!(exprs.is_empty());
                assert_ne!(names[0].text, "x");
                assert_ne!(names[1].text, "y");
            }
            other => panic!("expected hoisted locals, got {:?}", other),
        }
    }

    #[test]
    fn break_becomes_state_transition() {
        // Break must vanish from the flattened tree; it has no meaning
        // inside the dispatch loop.
        let chunk = flatten_source("while true do break end\nprint('after')");
        fn contains_break(block: &Block) -> bool {
            block.stmts.iter().any(|s| match &s.kind {
                StmtKind::Break => true,
                StmtKind::If { arms, else_block } => {
                    arms.iter().any(|(_, b)| contains_break(b))
                        || else_block.as_ref().is_some_and(contains_break)
                }
                StmtKind::While { body, .. } => contains_break(body),
                _ => false,
            })
        }
        assert!(!contains_break(&chunk.block));
    }

    #[test]
    fn function_with_loop_capture_is_left_structured() {
        let source = "local fs = {}\nfor i = 1, 3 do\n  fs[i] = function() return i end\nend";
        let chunk = flatten_source(source);
        // Main captures a loop local, so its body keeps the structured for.
        assert!(chunk
            .block
            .stmts
            .iter()
            .any(|s| matches!(s.kind, StmtKind::NumericFor { .. })));
    }

    #[test]
    fn nested_functions_flatten_independently() {
        let source = "local f = function()\n  local a = 1\n  return a\nend\nprint(f())";
        let chunk = flatten_source(source);
        // Find the nested function expression and check its body shape.
        fn find_func(block: &Block) -> Option<&FuncBody> {
            for stmt in &block.stmts {
                if let StmtKind::If { arms, .. } = &stmt.kind {
                    for (_, b) in arms {
                        if let Some(f) = find_func(b) {
                            return Some(f);
                        }
                    }
                }
                if let StmtKind::While { body, .. } = &stmt.kind {
                    if let Some(f) = find_func(body) {
                        return Some(f);
                    }
                }
                if let StmtKind::Assign { values, .. } = &stmt.kind {
                    for v in values {
                        if let ExprKind::Function(f) = &v.kind {
                            return Some(f);
                        }
                    }
                }
                if let StmtKind::Local { exprs, .. } = &stmt.kind {
                    for v in exprs {
                        if let ExprKind::Function(f) = &v.kind {
                            return Some(f);
                        }
                    }
                }
            }
            None
        }
        let func = find_func(&chunk.block).expect("nested function present");
        assert!(func
            .body
            .stmts
            .iter()
            .any(|s| matches!(s.kind, StmtKind::While { .. })));
    }

    #[test]
    fn memes_adds_decoy_states() {
        let tokens = Scanner::new("print(1)").scan_tokens().unwrap();
        let mut chunk = Parser::new(tokens).parse().unwrap();
        let res = Resolver::new().resolve(&chunk).unwrap();
        let mut plain_ctx = BuildContext::with_seed(5, false);
        let mut plain = chunk.clone();
        flatten_control_flow(&mut plain, &res, &mut plain_ctx).unwrap();

        let mut meme_ctx = BuildContext::with_seed(5, true);
        flatten_control_flow(&mut chunk, &res, &mut meme_ctx).unwrap();

        fn arm_count(chunk: &Chunk) -> usize {
            match &chunk.block.stmts.last().unwrap().kind {
                StmtKind::While { body, .. } => match &body.stmts[0].kind {
                    StmtKind::If { arms, .. } => arms.len(),
                    _ => 0,
                },
                _ => 0,
            }
        }
        assert!(arm_count(&chunk) > arm_count(&plain));
    }
}
