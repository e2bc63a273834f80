//! Expression parsing: Pratt-style binding powers over the Lua operator
//! table, with the prefix-expression suffix chain (index, call, method).

use crate::ast::{BinaryOp, Expr, ExprKind, TableItem, UnaryOp};
use crate::error::ParserError;
use crate::lexer::TokenKind;
use crate::parser::core::{ParseResult, Parser};

impl Parser {
    pub(crate) fn parse_expr(&mut self) -> ParseResult<Expr> {
        self.parse_binary(0)
    }

    fn parse_binary(&mut self, min_bp: u8) -> ParseResult<Expr> {
        self.enter_nested()?;
        let span = self.current_span();

        let mut lhs = if let Some(op) = self.peek_unary_op() {
            self.advance();
            let operand = self.parse_binary(BinaryOp::UNARY_POWER)?;
            Expr::new(
                ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                span.merge(self.previous_span()),
                self.node_id(),
            )
        } else {
            self.parse_simple_expr()?
        };

        while let Some(op) = self.peek_binary_op() {
            let (left_bp, right_bp) = op.binding_power();
            if left_bp < min_bp {
                break;
            }
            self.advance();
            let rhs = self.parse_binary(right_bp)?;
            let merged = lhs.span.merge(rhs.span);
            lhs = Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                merged,
                self.node_id(),
            );
        }

        self.exit_nested();
        Ok(lhs)
    }

    fn peek_unary_op(&self) -> Option<UnaryOp> {
        match self.peek().kind {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Not => Some(UnaryOp::Not),
            TokenKind::Hash => Some(UnaryOp::Len),
            _ => None,
        }
    }

    fn peek_binary_op(&self) -> Option<BinaryOp> {
        match self.peek().kind {
            TokenKind::Plus => Some(BinaryOp::Add),
            TokenKind::Minus => Some(BinaryOp::Sub),
            TokenKind::Star => Some(BinaryOp::Mul),
            TokenKind::Slash => Some(BinaryOp::Div),
            TokenKind::Percent => Some(BinaryOp::Mod),
            TokenKind::Caret => Some(BinaryOp::Pow),
            TokenKind::Concat => Some(BinaryOp::Concat),
            TokenKind::EqualEqual => Some(BinaryOp::Eq),
            TokenKind::NotEqual => Some(BinaryOp::NotEq),
            TokenKind::Less => Some(BinaryOp::Less),
            TokenKind::LessEqual => Some(BinaryOp::LessEq),
            TokenKind::Greater => Some(BinaryOp::Greater),
            TokenKind::GreaterEqual => Some(BinaryOp::GreaterEq),
            TokenKind::And => Some(BinaryOp::And),
            TokenKind::Or => Some(BinaryOp::Or),
            _ => None,
        }
    }

    fn parse_simple_expr(&mut self) -> ParseResult<Expr> {
        let span = self.current_span();
        match self.peek().kind.clone() {
            TokenKind::Nil => {
                self.advance();
                Ok(Expr::new(ExprKind::Nil, span, self.node_id()))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::new(ExprKind::True, span, self.node_id()))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::new(ExprKind::False, span, self.node_id()))
            }
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::new(ExprKind::Number(n), span, self.node_id()))
            }
            TokenKind::Str(bytes) => {
                self.advance();
                Ok(Expr::new(ExprKind::Str(bytes), span, self.node_id()))
            }
            TokenKind::Ellipsis => {
                if !self.vararg_ok.last().copied().unwrap_or(false) {
                    return Err(ParserError::unexpected_token(
                        "'...' inside a vararg function",
                        "...",
                        span,
                    ));
                }
                self.advance();
                Ok(Expr::new(ExprKind::Vararg, span, self.node_id()))
            }
            TokenKind::Function => {
                self.advance();
                let body = self.parse_func_body(false)?;
                let merged = span.merge(self.previous_span());
                Ok(Expr::new(ExprKind::Function(body), merged, self.node_id()))
            }
            TokenKind::LeftBrace => self.parse_table(),
            _ => self.parse_suffixed_expr(),
        }
    }

    /// `prefixexp` with its suffix chain: primary (`Name` or `(expr)`),
    /// then any number of `.k`, `[k]`, `:m(args)`, `(args)`, `"lit"`, `{t}`.
    pub(crate) fn parse_suffixed_expr(&mut self) -> ParseResult<Expr> {
        let span = self.current_span();

        let mut expr = match self.peek().kind.clone() {
            TokenKind::Identifier(text) => {
                self.advance();
                Expr::new(ExprKind::Name(text), span, self.node_id())
            }
            TokenKind::LeftParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(&TokenKind::RightParen)?;
                Expr::new(
                    ExprKind::Paren(Box::new(inner)),
                    span.merge(self.previous_span()),
                    self.node_id(),
                )
            }
            TokenKind::Eof => return Err(ParserError::unexpected_eof(span)),
            other => {
                return Err(ParserError::expected_expression(
                    format!("{}", other),
                    span,
                ))
            }
        };

        loop {
            match self.peek().kind.clone() {
                TokenKind::Dot => {
                    self.advance();
                    let name = self.expect_name()?;
                    let key_span = name.span;
                    let key = Expr::new(
                        ExprKind::Str(name.text.into_bytes()),
                        key_span,
                        self.node_id(),
                    );
                    let merged = expr.span.merge(key_span);
                    expr = Expr::new(
                        ExprKind::Index {
                            obj: Box::new(expr),
                            key: Box::new(key),
                        },
                        merged,
                        self.node_id(),
                    );
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let key = self.parse_expr()?;
                    self.expect(&TokenKind::RightBracket)?;
                    let merged = expr.span.merge(self.previous_span());
                    expr = Expr::new(
                        ExprKind::Index {
                            obj: Box::new(expr),
                            key: Box::new(key),
                        },
                        merged,
                        self.node_id(),
                    );
                }
                TokenKind::Colon => {
                    self.advance();
                    let name = self.expect_name()?;
                    let args = self.parse_call_args()?;
                    let merged = expr.span.merge(self.previous_span());
                    expr = Expr::new(
                        ExprKind::MethodCall {
                            obj: Box::new(expr),
                            name: name.text,
                            args,
                        },
                        merged,
                        self.node_id(),
                    );
                }
                TokenKind::LeftParen | TokenKind::Str(_) | TokenKind::LeftBrace => {
                    let args = self.parse_call_args()?;
                    let merged = expr.span.merge(self.previous_span());
                    expr = Expr::new(
                        ExprKind::Call {
                            func: Box::new(expr),
                            args,
                        },
                        merged,
                        self.node_id(),
                    );
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    /// `(explist)`, a lone string literal, or a table constructor.
    fn parse_call_args(&mut self) -> ParseResult<Vec<Expr>> {
        match self.peek().kind.clone() {
            TokenKind::LeftParen => {
                self.advance();
                let args = if self.check(&TokenKind::RightParen) {
                    Vec::new()
                } else {
                    self.parse_expr_list()?
                };
                self.expect(&TokenKind::RightParen)?;
                Ok(args)
            }
            TokenKind::Str(bytes) => {
                let span = self.current_span();
                self.advance();
                Ok(vec![Expr::new(ExprKind::Str(bytes), span, self.node_id())])
            }
            TokenKind::LeftBrace => Ok(vec![self.parse_table()?]),
            other => Err(ParserError::unexpected_token(
                "call arguments",
                format!("{}", other),
                self.current_span(),
            )),
        }
    }

    fn parse_table(&mut self) -> ParseResult<Expr> {
        let span = self.current_span();
        self.expect(&TokenKind::LeftBrace)?;

        let mut items = Vec::new();
        while !self.check(&TokenKind::RightBrace) {
            match self.peek().kind.clone() {
                TokenKind::LeftBracket => {
                    self.advance();
                    let key = self.parse_expr()?;
                    self.expect(&TokenKind::RightBracket)?;
                    self.expect(&TokenKind::Equal)?;
                    let value = self.parse_expr()?;
                    items.push(TableItem::Keyed(key, value));
                }
                TokenKind::Identifier(name)
                    if self.tokens[self.current + 1].kind == TokenKind::Equal =>
                {
                    self.advance();
                    self.advance(); // =
                    let value = self.parse_expr()?;
                    items.push(TableItem::Named(name, value));
                }
                _ => {
                    items.push(TableItem::Item(self.parse_expr()?));
                }
            }

            if !self.match_token(&TokenKind::Comma) && !self.match_token(&TokenKind::Semicolon) {
                break;
            }
        }
        self.expect(&TokenKind::RightBrace)?;

        Ok(Expr::new(
            ExprKind::Table { items },
            span.merge(self.previous_span()),
            self.node_id(),
        ))
    }
}
