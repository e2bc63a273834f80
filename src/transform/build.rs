//! AST synthesis helpers for the transform passes.
//!
//! Synthesized nodes get fresh `NodeId`s from the chunk's id space so the
//! re-resolution that follows a pass sees a consistent tree. Larger
//! fragments are generated as source text and run through the real lexer
//! and parser, then remapped into the chunk's id space.

use crate::ast::{
    Block, Chunk, Expr, ExprKind, FuncBody, Name, NodeIdGen, Stmt, StmtKind, TableItem,
};
use crate::lexer::Scanner;
use crate::parser::Parser;
use crate::span::Span;

/// Thin wrapper over the id generator with one constructor per node shape.
pub struct AstBuilder<'a> {
    pub ids: &'a mut NodeIdGen,
}

impl<'a> AstBuilder<'a> {
    pub fn new(ids: &'a mut NodeIdGen) -> Self {
        Self { ids }
    }

    fn span(&self) -> Span {
        Span::synthetic()
    }

    pub fn expr(&mut self, kind: ExprKind) -> Expr {
        let span = self.span();
        Expr::new(kind, span, self.ids.fresh())
    }

    pub fn num(&mut self, n: f64) -> Expr {
        self.expr(ExprKind::Number(n))
    }

    pub fn nil(&mut self) -> Expr {
        self.expr(ExprKind::Nil)
    }

    pub fn name(&mut self, text: &str) -> Expr {
        self.expr(ExprKind::Name(text.to_string()))
    }

    pub fn decl_name(&mut self, text: &str) -> Name {
        let span = self.span();
        Name::new(text, self.ids.fresh(), span)
    }

    pub fn binary(&mut self, op: crate::ast::BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        self.expr(ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    pub fn call(&mut self, func: Expr, args: Vec<Expr>) -> Expr {
        self.expr(ExprKind::Call {
            func: Box::new(func),
            args,
        })
    }

    pub fn table(&mut self, items: Vec<TableItem>) -> Expr {
        self.expr(ExprKind::Table { items })
    }

    pub fn stmt(&mut self, kind: StmtKind) -> Stmt {
        Stmt::new(kind, self.span())
    }

    /// `target = value`
    pub fn assign_name(&mut self, target: &str, value: Expr) -> Stmt {
        let target = self.name(target);
        self.stmt(StmtKind::Assign {
            targets: vec![target],
            values: vec![value],
        })
    }

    pub fn assign_names(&mut self, targets: &[String], values: Vec<Expr>) -> Stmt {
        let targets = targets.iter().map(|t| self.name(t)).collect();
        self.stmt(StmtKind::Assign { targets, values })
    }

    pub fn local(&mut self, names: Vec<Name>, exprs: Vec<Expr>) -> Stmt {
        self.stmt(StmtKind::Local { names, exprs })
    }

    /// `if cond then then_stmts else else_stmts end`
    pub fn if_else(&mut self, cond: Expr, then_stmts: Vec<Stmt>, else_stmts: Vec<Stmt>) -> Stmt {
        self.stmt(StmtKind::If {
            arms: vec![(cond, Block::new(then_stmts))],
            else_block: Some(Block::new(else_stmts)),
        })
    }
}

/// Parse a source fragment and remap its node ids into the chunk's space.
/// Panics on invalid source: fragments are compiled in, not user input.
pub fn parse_fragment(source: &str, ids: &mut NodeIdGen) -> Vec<Stmt> {
    let tokens = Scanner::new(source)
        .scan_tokens()
        .expect("fragment lexes");
    let mut chunk = Parser::new(tokens).parse().expect("fragment parses");
    for stmt in &mut chunk.block.stmts {
        remap_stmt(stmt, ids);
    }
    chunk.block.stmts
}

fn remap_stmt(stmt: &mut Stmt, ids: &mut NodeIdGen) {
    match &mut stmt.kind {
        StmtKind::Expr(e) => remap_expr(e, ids),
        StmtKind::Local { names, exprs } => {
            for n in names {
                n.id = ids.fresh();
            }
            for e in exprs {
                remap_expr(e, ids);
            }
        }
        StmtKind::Assign { targets, values } => {
            for e in targets.iter_mut().chain(values.iter_mut()) {
                remap_expr(e, ids);
            }
        }
        StmtKind::If { arms, else_block } => {
            for (cond, block) in arms {
                remap_expr(cond, ids);
                remap_block(block, ids);
            }
            if let Some(block) = else_block {
                remap_block(block, ids);
            }
        }
        StmtKind::While { cond, body } => {
            remap_expr(cond, ids);
            remap_block(body, ids);
        }
        StmtKind::Repeat { body, cond } => {
            remap_block(body, ids);
            remap_expr(cond, ids);
        }
        StmtKind::NumericFor {
            var,
            start,
            limit,
            step,
            body,
        } => {
            var.id = ids.fresh();
            remap_expr(start, ids);
            remap_expr(limit, ids);
            if let Some(step) = step {
                remap_expr(step, ids);
            }
            remap_block(body, ids);
        }
        StmtKind::GenericFor { vars, exprs, body } => {
            for v in vars {
                v.id = ids.fresh();
            }
            for e in exprs {
                remap_expr(e, ids);
            }
            remap_block(body, ids);
        }
        StmtKind::FunctionDecl { name, body } => {
            name.base.id = ids.fresh();
            remap_func_body(body, ids);
        }
        StmtKind::LocalFunction { name, body } => {
            name.id = ids.fresh();
            remap_func_body(body, ids);
        }
        StmtKind::Return { exprs } => {
            for e in exprs {
                remap_expr(e, ids);
            }
        }
        StmtKind::Break => {}
        StmtKind::Do(block) => remap_block(block, ids),
    }
}

fn remap_block(block: &mut Block, ids: &mut NodeIdGen) {
    for stmt in &mut block.stmts {
        remap_stmt(stmt, ids);
    }
}

fn remap_func_body(body: &mut FuncBody, ids: &mut NodeIdGen) {
    body.id = ids.fresh();
    for param in &mut body.params {
        param.id = ids.fresh();
    }
    remap_block(&mut body.body, ids);
}

fn remap_expr(expr: &mut Expr, ids: &mut NodeIdGen) {
    expr.id = ids.fresh();
    match &mut expr.kind {
        ExprKind::Nil
        | ExprKind::True
        | ExprKind::False
        | ExprKind::Number(_)
        | ExprKind::Str(_)
        | ExprKind::Vararg
        | ExprKind::Name(_) => {}
        ExprKind::Function(body) => remap_func_body(body, ids),
        ExprKind::Index { obj, key } => {
            remap_expr(obj, ids);
            remap_expr(key, ids);
        }
        ExprKind::Call { func, args } => {
            remap_expr(func, ids);
            for a in args {
                remap_expr(a, ids);
            }
        }
        ExprKind::MethodCall { obj, args, .. } => {
            remap_expr(obj, ids);
            for a in args {
                remap_expr(a, ids);
            }
        }
        ExprKind::Binary { lhs, rhs, .. } => {
            remap_expr(lhs, ids);
            remap_expr(rhs, ids);
        }
        ExprKind::Unary { operand, .. } => remap_expr(operand, ids),
        ExprKind::Table { items } => {
            for item in items {
                match item {
                    TableItem::Item(v) | TableItem::Named(_, v) => remap_expr(v, ids),
                    TableItem::Keyed(k, v) => {
                        remap_expr(k, ids);
                        remap_expr(v, ids);
                    }
                }
            }
        }
        ExprKind::Paren(inner) => remap_expr(inner, ids),
    }
}

/// Collect every identifier text in a chunk, for collision-free fresh names.
pub fn collect_identifiers(chunk: &Chunk) -> Vec<String> {
    let mut out = Vec::new();
    collect_block(&chunk.block, &mut out);
    out
}

fn collect_block(block: &Block, out: &mut Vec<String>) {
    for stmt in &block.stmts {
        collect_stmt(stmt, out);
    }
}

fn collect_stmt(stmt: &Stmt, out: &mut Vec<String>) {
    match &stmt.kind {
        StmtKind::Expr(e) => collect_expr(e, out),
        StmtKind::Local { names, exprs } => {
            out.extend(names.iter().map(|n| n.text.clone()));
            for e in exprs {
                collect_expr(e, out);
            }
        }
        StmtKind::Assign { targets, values } => {
            for e in targets.iter().chain(values.iter()) {
                collect_expr(e, out);
            }
        }
        StmtKind::If { arms, else_block } => {
            for (cond, block) in arms {
                collect_expr(cond, out);
                collect_block(block, out);
            }
            if let Some(block) = else_block {
                collect_block(block, out);
            }
        }
        StmtKind::While { cond, body } => {
            collect_expr(cond, out);
            collect_block(body, out);
        }
        StmtKind::Repeat { body, cond } => {
            collect_block(body, out);
            collect_expr(cond, out);
        }
        StmtKind::NumericFor {
            var,
            start,
            limit,
            step,
            body,
        } => {
            out.push(var.text.clone());
            collect_expr(start, out);
            collect_expr(limit, out);
            if let Some(step) = step {
                collect_expr(step, out);
            }
            collect_block(body, out);
        }
        StmtKind::GenericFor { vars, exprs, body } => {
            out.extend(vars.iter().map(|v| v.text.clone()));
            for e in exprs {
                collect_expr(e, out);
            }
            collect_block(body, out);
        }
        StmtKind::FunctionDecl { name, body } => {
            out.push(name.base.text.clone());
            collect_func(body, out);
        }
        StmtKind::LocalFunction { name, body } => {
            out.push(name.text.clone());
            collect_func(body, out);
        }
        StmtKind::Return { exprs } => {
            for e in exprs {
                collect_expr(e, out);
            }
        }
        StmtKind::Break => {}
        StmtKind::Do(block) => collect_block(block, out),
    }
}

fn collect_func(body: &FuncBody, out: &mut Vec<String>) {
    out.extend(body.params.iter().map(|p| p.text.clone()));
    collect_block(&body.body, out);
}

fn collect_expr(expr: &Expr, out: &mut Vec<String>) {
    match &expr.kind {
        ExprKind::Name(text) => out.push(text.clone()),
        ExprKind::Function(body) => collect_func(body, out),
        ExprKind::Index { obj, key } => {
            collect_expr(obj, out);
            collect_expr(key, out);
        }
        ExprKind::Call { func, args } => {
            collect_expr(func, out);
            for a in args {
                collect_expr(a, out);
            }
        }
        ExprKind::MethodCall { obj, args, .. } => {
            collect_expr(obj, out);
            for a in args {
                collect_expr(a, out);
            }
        }
        ExprKind::Binary { lhs, rhs, .. } => {
            collect_expr(lhs, out);
            collect_expr(rhs, out);
        }
        ExprKind::Unary { operand, .. } => collect_expr(operand, out),
        ExprKind::Table { items } => {
            for item in items {
                match item {
                    TableItem::Item(v) => collect_expr(v, out),
                    TableItem::Named(k, v) => {
                        out.push(k.clone());
                        collect_expr(v, out);
                    }
                    TableItem::Keyed(k, v) => {
                        collect_expr(k, out);
                        collect_expr(v, out);
                    }
                }
            }
        }
        ExprKind::Paren(inner) => collect_expr(inner, out),
        _ => {}
    }
}
