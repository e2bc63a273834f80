//! Parser tests.

#[cfg(test)]
mod tests {
    use crate::ast::*;
    use crate::error::ParserError;
    use crate::lexer::Scanner;
    use crate::parser::Parser;

    fn parse(source: &str) -> Chunk {
        let tokens = Scanner::new(source).scan_tokens().unwrap();
        Parser::new(tokens).parse().unwrap()
    }

    fn parse_err(source: &str) -> ParserError {
        let tokens = Scanner::new(source).scan_tokens().unwrap();
        Parser::new(tokens).parse().unwrap_err()
    }

    fn first_stmt(source: &str) -> StmtKind {
        parse(source).block.stmts.into_iter().next().unwrap().kind
    }

    fn parse_expr(source: &str) -> Expr {
        match first_stmt(&format!("return {}", source)) {
            StmtKind::Return { exprs } => exprs.into_iter().next().unwrap(),
            other => panic!("expected return, got {:?}", other),
        }
    }

    #[test]
    fn precedence_mul_over_add() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        let expr = parse_expr("1 + 2 * 3");
        match expr.kind {
            ExprKind::Binary {
                op: BinaryOp::Add,
                rhs,
                ..
            } => match rhs.kind {
                ExprKind::Binary {
                    op: BinaryOp::Mul, ..
                } => {}
                other => panic!("expected mul on right, got {:?}", other),
            },
            other => panic!("expected add at top, got {:?}", other),
        }
    }

    #[test]
    fn pow_is_right_associative() {
        // 2 ^ 3 ^ 2 parses as 2 ^ (3 ^ 2)
        let expr = parse_expr("2 ^ 3 ^ 2");
        match expr.kind {
            ExprKind::Binary {
                op: BinaryOp::Pow,
                rhs,
                ..
            } => assert!(matches!(
                rhs.kind,
                ExprKind::Binary {
                    op: BinaryOp::Pow,
                    ..
                }
            )),
            other => panic!("expected pow at top, got {:?}", other),
        }
    }

    #[test]
    fn concat_is_right_associative() {
        let expr = parse_expr("'a' .. 'b' .. 'c'");
        match expr.kind {
            ExprKind::Binary {
                op: BinaryOp::Concat,
                rhs,
                ..
            } => assert!(matches!(
                rhs.kind,
                ExprKind::Binary {
                    op: BinaryOp::Concat,
                    ..
                }
            )),
            other => panic!("expected concat at top, got {:?}", other),
        }
    }

    #[test]
    fn unary_binds_below_pow() {
        // -2 ^ 2 parses as -(2 ^ 2)
        let expr = parse_expr("-2 ^ 2");
        match expr.kind {
            ExprKind::Unary {
                op: UnaryOp::Neg,
                operand,
            } => assert!(matches!(
                operand.kind,
                ExprKind::Binary {
                    op: BinaryOp::Pow,
                    ..
                }
            )),
            other => panic!("expected neg at top, got {:?}", other),
        }
    }

    #[test]
    fn dot_access_is_string_index() {
        let expr = parse_expr("t.field");
        match expr.kind {
            ExprKind::Index { key, .. } => {
                assert!(matches!(key.kind, ExprKind::Str(ref b) if b == b"field"))
            }
            other => panic!("expected index, got {:?}", other),
        }
    }

    #[test]
    fn method_call_sugar() {
        let expr = parse_expr("obj:method(1, 2)");
        match expr.kind {
            ExprKind::MethodCall { name, args, .. } => {
                assert_eq!(name, "method");
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected method call, got {:?}", other),
        }
    }

    #[test]
    fn call_with_string_and_table_args() {
        assert!(matches!(
            parse_expr("f 'lit'").kind,
            ExprKind::Call { ref args, .. } if args.len() == 1
        ));
        assert!(matches!(
            parse_expr("f { 1, 2 }").kind,
            ExprKind::Call { ref args, .. } if args.len() == 1
        ));
    }

    #[test]
    fn table_constructor_field_kinds() {
        let expr = parse_expr("{ 1, x = 2, [3] = 4; 5 }");
        match expr.kind {
            ExprKind::Table { items } => {
                assert_eq!(items.len(), 4);
                assert!(matches!(items[0], TableItem::Item(_)));
                assert!(matches!(items[1], TableItem::Named(ref n, _) if n == "x"));
                assert!(matches!(items[2], TableItem::Keyed(_, _)));
                assert!(matches!(items[3], TableItem::Item(_)));
            }
            other => panic!("expected table, got {:?}", other),
        }
    }

    #[test]
    fn multiple_assignment() {
        match first_stmt("a, b.c = 1, 2") {
            StmtKind::Assign { targets, values } => {
                assert_eq!(targets.len(), 2);
                assert_eq!(values.len(), 2);
            }
            other => panic!("expected assign, got {:?}", other),
        }
    }

    #[test]
    fn local_declaration_without_init() {
        match first_stmt("local a, b") {
            StmtKind::Local { names, exprs } => {
                assert_eq!(names.len(), 2);
                assert!(exprs.is_empty());
            }
            other => panic!("expected local, got {:?}", other),
        }
    }

    #[test]
    fn method_decl_gets_implicit_self() {
        match first_stmt("function t:m(a) end") {
            StmtKind::FunctionDecl { name, body } => {
                assert_eq!(name.method.as_deref(), Some("m"));
                assert_eq!(body.params.len(), 2);
                assert_eq!(body.params[0].text, "self");
            }
            other => panic!("expected function decl, got {:?}", other),
        }
    }

    #[test]
    fn numeric_and_generic_for() {
        assert!(matches!(
            first_stmt("for i = 1, 10, 2 do end"),
            StmtKind::NumericFor { step: Some(_), .. }
        ));
        assert!(matches!(
            first_stmt("for k, v in pairs(t) do end"),
            StmtKind::GenericFor { ref vars, .. } if vars.len() == 2
        ));
    }

    #[test]
    fn repeat_until() {
        assert!(matches!(
            first_stmt("repeat x() until done"),
            StmtKind::Repeat { .. }
        ));
    }

    #[test]
    fn return_must_close_block() {
        let err = parse_err("return 1 x()");
        assert!(matches!(err, ParserError::UnexpectedToken { .. }));
    }

    #[test]
    fn unbalanced_then_end_is_rejected() {
        let err = parse_err("if x then print(1)");
        assert!(matches!(err, ParserError::UnexpectedEof(_)));
    }

    #[test]
    fn bare_expression_statement_is_rejected() {
        let err = parse_err("x + 1");
        assert!(matches!(err, ParserError::UnexpectedToken { .. }));
    }

    #[test]
    fn vararg_only_in_vararg_position() {
        match first_stmt("local f = function(a, ...) return ... end") {
            StmtKind::Local { exprs, .. } => match &exprs[0].kind {
                ExprKind::Function(body) => {
                    assert!(body.is_vararg);
                    assert_eq!(body.params.len(), 1);
                }
                other => panic!("expected function, got {:?}", other),
            },
            other => panic!("expected local, got {:?}", other),
        }
    }

    #[test]
    fn deep_nesting_fails_closed() {
        // The depth guard returns `TooDeep` long before any real overflow,
        // but 200 levels of recursive-descent frames exceed the default
        // 2 MiB test-thread stack in debug builds, so run the check on a
        // thread with a generous stack.
        std::thread::Builder::new()
            .stack_size(16 * 1024 * 1024)
            .spawn(|| {
                let source = format!("return {}1{}", "(".repeat(600), ")".repeat(600));
                let err = parse_err(&source);
                assert!(matches!(err, ParserError::TooDeep(_)));
            })
            .unwrap()
            .join()
            .unwrap();
    }

    #[test]
    fn node_ids_are_unique() {
        let chunk = parse("local a = 1 local b = a + a");
        let mut seen = std::collections::HashSet::new();
        for stmt in &chunk.block.stmts {
            if let StmtKind::Local { names, exprs } = &stmt.kind {
                for n in names {
                    assert!(seen.insert(n.id));
                }
                for e in exprs {
                    assert!(seen.insert(e.id));
                }
            }
        }
    }
}
