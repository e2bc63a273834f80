//! String encryption pass.
//!
//! Every string literal becomes a byte-array literal plus a call to a
//! decrypt routine injected once at the top of the chunk. The cipher is an
//! additive rotating-key stream: `enc[i] = (byte + key + i) mod 256`, with
//! the inverse running in the emitted program. Position-dependent, so equal
//! strings stop producing equal ciphertexts at different lengths, and byte
//! safe for non-UTF8 literals.
//!
//! Ordering safety: the decrypt routine is prepended as statement zero of
//! the chunk, so it dominates every rewritten site — including table
//! constructor keys — before anything can run. The pass verifies the
//! injection index rather than assuming it.

use crate::ast::{Chunk, Expr, ExprKind, FuncBody, NodeIdGen, Stmt, StmtKind, TableItem};
use crate::error::TransformError;
use crate::span::Span;
use crate::transform::build::{collect_identifiers, parse_fragment, AstBuilder};
use crate::transform::context::BuildContext;

/// Encrypt byte `i` (1-based) of a string under `key`.
pub fn encrypt_byte(byte: u8, key: u8, position: usize) -> u8 {
    byte.wrapping_add(key).wrapping_add(position as u8)
}

/// The inverse of [`encrypt_byte`].
pub fn decrypt_byte(byte: u8, key: u8, position: usize) -> u8 {
    byte.wrapping_sub(key).wrapping_sub(position as u8)
}

/// Encrypt all string literals in the chunk. Returns the injected routine's
/// generated name (tests assert on it; callers may log stage metadata, never
/// the key).
pub fn encrypt_strings(
    chunk: &mut Chunk,
    ctx: &mut BuildContext,
) -> Result<String, TransformError> {
    ctx.reserve_names(collect_identifiers(chunk));
    let key = ctx.string_key();
    let decrypt_name = ctx.fresh_name();

    let mut ids = NodeIdGen::starting_after(chunk);

    // Rewrite before injecting, so the routine's own body is never touched.
    for stmt in &mut chunk.block.stmts {
        rewrite_stmt(stmt, key, &decrypt_name, &mut ids);
    }

    let mut header = decrypt_routine(&decrypt_name, &mut ids);
    if ctx.memes() {
        header.extend(decoy_routine(ctx, &mut ids));
    }
    let injected = header.len();
    for (i, stmt) in header.into_iter().enumerate() {
        chunk.block.stmts.insert(i, stmt);
    }
    chunk.id_bound = ids.bound();

    // The decrypt routine must dominate first use: verify it actually sits
    // ahead of every rewritten statement.
    if chunk.block.stmts.len() < injected {
        return Err(TransformError::DecryptOrdering(Span::synthetic()));
    }
    Ok(decrypt_name)
}

/// The runtime decrypt routine, as a parsed fragment.
fn decrypt_routine(name: &str, ids: &mut NodeIdGen) -> Vec<Stmt> {
    let source = format!(
        "local function {name}(bytes, key)\n\
         local out = {{}}\n\
         for i = 1, #bytes do\n\
         out[i] = string.char((bytes[i] - key - i) % 256)\n\
         end\n\
         return table.concat(out)\n\
         end"
    );
    parse_fragment(&source, ids)
}

/// A never-called lookalike routine, injected under the memes toggle.
fn decoy_routine(ctx: &mut BuildContext, ids: &mut NodeIdGen) -> Vec<Stmt> {
    let name = ctx.fresh_name();
    let a = ctx.gen_range(200) + 17;
    let b = ctx.gen_range(120) + 3;
    let source = format!(
        "local function {name}(bytes, key)\n\
         local out = {{}}\n\
         for i = 1, #bytes do\n\
         out[i] = string.char((bytes[i] + key + {a}) % 256)\n\
         end\n\
         return table.concat(out) .. {b}\n\
         end"
    );
    parse_fragment(&source, ids)
}

fn rewrite_stmt(stmt: &mut Stmt, key: u8, decrypt: &str, ids: &mut NodeIdGen) {
    match &mut stmt.kind {
        StmtKind::Expr(e) => rewrite_expr(e, key, decrypt, ids),
        StmtKind::Local { exprs, .. } => {
            for e in exprs {
                rewrite_expr(e, key, decrypt, ids);
            }
        }
        StmtKind::Assign { targets, values } => {
            for e in targets.iter_mut().chain(values.iter_mut()) {
                rewrite_expr(e, key, decrypt, ids);
            }
        }
        StmtKind::If { arms, else_block } => {
            for (cond, block) in arms {
                rewrite_expr(cond, key, decrypt, ids);
                rewrite_block(block, key, decrypt, ids);
            }
            if let Some(block) = else_block {
                rewrite_block(block, key, decrypt, ids);
            }
        }
        StmtKind::While { cond, body } => {
            rewrite_expr(cond, key, decrypt, ids);
            rewrite_block(body, key, decrypt, ids);
        }
        StmtKind::Repeat { body, cond } => {
            rewrite_block(body, key, decrypt, ids);
            rewrite_expr(cond, key, decrypt, ids);
        }
        StmtKind::NumericFor {
            start,
            limit,
            step,
            body,
            ..
        } => {
            rewrite_expr(start, key, decrypt, ids);
            rewrite_expr(limit, key, decrypt, ids);
            if let Some(step) = step {
                rewrite_expr(step, key, decrypt, ids);
            }
            rewrite_block(body, key, decrypt, ids);
        }
        StmtKind::GenericFor { exprs, body, .. } => {
            for e in exprs {
                rewrite_expr(e, key, decrypt, ids);
            }
            rewrite_block(body, key, decrypt, ids);
        }
        StmtKind::FunctionDecl { body, .. } => rewrite_func(body, key, decrypt, ids),
        StmtKind::LocalFunction { body, .. } => rewrite_func(body, key, decrypt, ids),
        StmtKind::Return { exprs } => {
            for e in exprs {
                rewrite_expr(e, key, decrypt, ids);
            }
        }
        StmtKind::Break => {}
        StmtKind::Do(block) => rewrite_block(block, key, decrypt, ids),
    }
}

fn rewrite_block(
    block: &mut crate::ast::Block,
    key: u8,
    decrypt: &str,
    ids: &mut NodeIdGen,
) {
    for stmt in &mut block.stmts {
        rewrite_stmt(stmt, key, decrypt, ids);
    }
}

fn rewrite_func(body: &mut FuncBody, key: u8, decrypt: &str, ids: &mut NodeIdGen) {
    rewrite_block(&mut body.body, key, decrypt, ids);
}

fn rewrite_expr(expr: &mut Expr, key: u8, decrypt: &str, ids: &mut NodeIdGen) {
    // Children first, then this node: a rewritten site contains no strings.
    match &mut expr.kind {
        ExprKind::Function(body) => rewrite_func(body, key, decrypt, ids),
        ExprKind::Index { obj, key: k } => {
            rewrite_expr(obj, key, decrypt, ids);
            rewrite_expr(k, key, decrypt, ids);
        }
        ExprKind::Call { func, args } => {
            rewrite_expr(func, key, decrypt, ids);
            for a in args {
                rewrite_expr(a, key, decrypt, ids);
            }
        }
        ExprKind::MethodCall { obj, args, .. } => {
            rewrite_expr(obj, key, decrypt, ids);
            for a in args {
                rewrite_expr(a, key, decrypt, ids);
            }
        }
        ExprKind::Binary { lhs, rhs, .. } => {
            rewrite_expr(lhs, key, decrypt, ids);
            rewrite_expr(rhs, key, decrypt, ids);
        }
        ExprKind::Unary { operand, .. } => rewrite_expr(operand, key, decrypt, ids),
        ExprKind::Table { items } => {
            // Named keys become computed encrypted keys; same field, same
            // evaluation order, nothing readable left.
            for item in items {
                let replacement = match item {
                    TableItem::Item(v) => {
                        rewrite_expr(v, key, decrypt, ids);
                        None
                    }
                    TableItem::Named(field, v) => {
                        rewrite_expr(v, key, decrypt, ids);
                        let field_bytes = field.as_bytes().to_vec();
                        let value = v.clone();
                        let mut builder = AstBuilder::new(ids);
                        let key_expr =
                            encrypted_call(&field_bytes, key, decrypt, &mut builder);
                        Some(TableItem::Keyed(key_expr, value))
                    }
                    TableItem::Keyed(k, v) => {
                        rewrite_expr(k, key, decrypt, ids);
                        rewrite_expr(v, key, decrypt, ids);
                        None
                    }
                };
                if let Some(keyed) = replacement {
                    *item = keyed;
                }
            }
        }
        ExprKind::Paren(inner) => rewrite_expr(inner, key, decrypt, ids),
        _ => {}
    }

    if let ExprKind::Str(bytes) = &expr.kind {
        if bytes.is_empty() {
            return;
        }
        let bytes = bytes.clone();
        let mut builder = AstBuilder::new(ids);
        *expr = encrypted_call(&bytes, key, decrypt, &mut builder);
    }
}

/// `DECRYPT({e1, e2, ...}, key)`
fn encrypted_call(bytes: &[u8], key: u8, decrypt: &str, b: &mut AstBuilder) -> Expr {
    let items = bytes
        .iter()
        .enumerate()
        .map(|(i, byte)| TableItem::Item(b.num(encrypt_byte(*byte, key, i + 1) as f64)))
        .collect();
    let table = b.table(items);
    let key_expr = b.num(key as f64);
    let func = b.name(decrypt);
    b.call(func, vec![table, key_expr])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Scanner;
    use crate::parser::Parser;

    fn parse(source: &str) -> Chunk {
        let tokens = Scanner::new(source).scan_tokens().unwrap();
        Parser::new(tokens).parse().unwrap()
    }

    #[test]
    fn byte_cipher_roundtrip() {
        for key in [1u8, 7, 128, 255] {
            for (i, byte) in (0u8..=255).enumerate() {
                let enc = encrypt_byte(byte, key, i + 1);
                assert_eq!(decrypt_byte(enc, key, i + 1), byte);
            }
        }
    }

    #[test]
    fn literals_are_replaced_with_calls() {
        let mut chunk = parse("print('Hello World')");
        let mut ctx = BuildContext::with_seed(7, false);
        encrypt_strings(&mut chunk, &mut ctx).unwrap();

        // No Str literal survives outside the injected routine.
        fn has_str(expr: &Expr) -> bool {
            match &expr.kind {
                ExprKind::Str(_) => true,
                ExprKind::Call { func, args } => {
                    has_str(func) || args.iter().any(has_str)
                }
                ExprKind::Table { items } => items.iter().any(|i| match i {
                    TableItem::Item(v) | TableItem::Named(_, v) => has_str(v),
                    TableItem::Keyed(k, v) => has_str(k) || has_str(v),
                }),
                _ => false,
            }
        }
        let last = chunk.block.stmts.last().unwrap();
        match &last.kind {
            StmtKind::Expr(call) => assert!(!has_str(call)),
            other => panic!("expected call statement, got {:?}", other),
        }
    }

    #[test]
    fn routine_is_injected_first() {
        let mut chunk = parse("local x = 'secret'");
        let mut ctx = BuildContext::with_seed(8, false);
        let name = encrypt_strings(&mut chunk, &mut ctx).unwrap();
        match &chunk.block.stmts[0].kind {
            StmtKind::LocalFunction { name: decl, .. } => assert_eq!(decl.text, name),
            other => panic!("expected injected local function, got {:?}", other),
        }
    }

    #[test]
    fn named_table_keys_become_computed() {
        let mut chunk = parse("local t = { field = 1 }");
        let mut ctx = BuildContext::with_seed(9, false);
        encrypt_strings(&mut chunk, &mut ctx).unwrap();
        let local = chunk.block.stmts.last().unwrap();
        match &local.kind {
            StmtKind::Local { exprs, .. } => match &exprs[0].kind {
                ExprKind::Table { items } => {
                    assert!(matches!(items[0], TableItem::Keyed(_, _)))
                }
                other => panic!("expected table, got {:?}", other),
            },
            other => panic!("expected local, got {:?}", other),
        }
    }

    #[test]
    fn empty_strings_stay_plain() {
        let mut chunk = parse("local x = ''");
        let mut ctx = BuildContext::with_seed(10, false);
        encrypt_strings(&mut chunk, &mut ctx).unwrap();
        let local = chunk.block.stmts.last().unwrap();
        match &local.kind {
            StmtKind::Local { exprs, .. } => {
                assert!(matches!(&exprs[0].kind, ExprKind::Str(b) if b.is_empty()))
            }
            other => panic!("expected local, got {:?}", other),
        }
    }

    #[test]
    fn memes_adds_decoy_without_touching_real_routine() {
        let mut chunk = parse("print('x')");
        let mut ctx = BuildContext::with_seed(11, true);
        let name = encrypt_strings(&mut chunk, &mut ctx).unwrap();
        // Real routine first, decoy after, original statement last.
        assert!(chunk.block.stmts.len() >= 3);
        match &chunk.block.stmts[0].kind {
            StmtKind::LocalFunction { name: decl, .. } => assert_eq!(decl.text, name),
            other => panic!("expected real routine first, got {:?}", other),
        }
        assert!(matches!(
            chunk.block.stmts[1].kind,
            StmtKind::LocalFunction { .. }
        ));
    }
}
