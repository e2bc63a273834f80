//! Statement parsing.

use crate::ast::{Block, Expr, ExprKind, FuncBody, FuncName, Name, Stmt, StmtKind};
use crate::error::ParserError;
use crate::lexer::TokenKind;
use crate::parser::core::{ParseResult, Parser};

impl Parser {
    /// Parse statements until a block terminator (`end`, `else`, `elseif`,
    /// `until`, or EOF). `return` and `break` close the block.
    pub(crate) fn parse_block(&mut self) -> ParseResult<Block> {
        self.enter_nested()?;
        let mut stmts = Vec::new();

        loop {
            while self.match_token(&TokenKind::Semicolon) {}
            if self.at_block_end() {
                break;
            }

            let stmt = self.parse_statement()?;
            let closes = matches!(stmt.kind, StmtKind::Return { .. } | StmtKind::Break);
            stmts.push(stmt);

            if closes {
                self.match_token(&TokenKind::Semicolon);
                break;
            }
        }

        self.exit_nested();
        Ok(Block::new(stmts))
    }

    fn at_block_end(&self) -> bool {
        matches!(
            self.peek().kind,
            TokenKind::End
                | TokenKind::Else
                | TokenKind::Elseif
                | TokenKind::Until
                | TokenKind::Eof
        )
    }

    fn parse_statement(&mut self) -> ParseResult<Stmt> {
        let span = self.current_span();

        match self.peek().kind {
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::Repeat => self.parse_repeat(),
            TokenKind::For => self.parse_for(),
            TokenKind::Function => self.parse_function_decl(),
            TokenKind::Local => self.parse_local(),
            TokenKind::Do => {
                self.advance();
                let block = self.parse_block()?;
                self.expect(&TokenKind::End)?;
                Ok(Stmt::new(StmtKind::Do(block), span.merge(self.previous_span())))
            }
            TokenKind::Return => {
                self.advance();
                let mut exprs = Vec::new();
                if !self.at_block_end() && !self.check(&TokenKind::Semicolon) {
                    exprs = self.parse_expr_list()?;
                }
                Ok(Stmt::new(
                    StmtKind::Return { exprs },
                    span.merge(self.previous_span()),
                ))
            }
            TokenKind::Break => {
                self.advance();
                Ok(Stmt::new(StmtKind::Break, span))
            }
            _ => self.parse_expr_statement(),
        }
    }

    /// An expression statement is either an assignment (`varlist = explist`)
    /// or a bare call; any other expression is a syntax error.
    fn parse_expr_statement(&mut self) -> ParseResult<Stmt> {
        let span = self.current_span();
        let first = self.parse_suffixed_expr()?;

        if self.check(&TokenKind::Equal) || self.check(&TokenKind::Comma) {
            let mut targets = vec![first];
            while self.match_token(&TokenKind::Comma) {
                targets.push(self.parse_suffixed_expr()?);
            }
            for target in &targets {
                if !matches!(target.kind, ExprKind::Name(_) | ExprKind::Index { .. }) {
                    return Err(ParserError::unexpected_token(
                        "an assignable variable",
                        "expression",
                        target.span,
                    ));
                }
            }
            self.expect(&TokenKind::Equal)?;
            let values = self.parse_expr_list()?;
            return Ok(Stmt::new(
                StmtKind::Assign { targets, values },
                span.merge(self.previous_span()),
            ));
        }

        if !matches!(first.kind, ExprKind::Call { .. } | ExprKind::MethodCall { .. }) {
            return Err(ParserError::unexpected_token(
                "'=' or a call",
                format!("{}", self.peek().kind),
                self.current_span(),
            ));
        }
        Ok(Stmt::new(StmtKind::Expr(first), span.merge(self.previous_span())))
    }

    fn parse_if(&mut self) -> ParseResult<Stmt> {
        let span = self.current_span();
        self.advance(); // if

        let mut arms = Vec::new();
        let cond = self.parse_expr()?;
        self.expect(&TokenKind::Then)?;
        arms.push((cond, self.parse_block()?));

        let mut else_block = None;
        loop {
            if self.match_token(&TokenKind::Elseif) {
                let cond = self.parse_expr()?;
                self.expect(&TokenKind::Then)?;
                arms.push((cond, self.parse_block()?));
            } else if self.match_token(&TokenKind::Else) {
                else_block = Some(self.parse_block()?);
                self.expect(&TokenKind::End)?;
                break;
            } else {
                self.expect(&TokenKind::End)?;
                break;
            }
        }

        Ok(Stmt::new(
            StmtKind::If { arms, else_block },
            span.merge(self.previous_span()),
        ))
    }

    fn parse_while(&mut self) -> ParseResult<Stmt> {
        let span = self.current_span();
        self.advance(); // while
        let cond = self.parse_expr()?;
        self.expect(&TokenKind::Do)?;
        let body = self.parse_block()?;
        self.expect(&TokenKind::End)?;
        Ok(Stmt::new(
            StmtKind::While { cond, body },
            span.merge(self.previous_span()),
        ))
    }

    fn parse_repeat(&mut self) -> ParseResult<Stmt> {
        let span = self.current_span();
        self.advance(); // repeat
        let body = self.parse_block()?;
        self.expect(&TokenKind::Until)?;
        let cond = self.parse_expr()?;
        Ok(Stmt::new(
            StmtKind::Repeat { body, cond },
            span.merge(self.previous_span()),
        ))
    }

    fn parse_for(&mut self) -> ParseResult<Stmt> {
        let span = self.current_span();
        self.advance(); // for
        let first = self.expect_name()?;

        if self.match_token(&TokenKind::Equal) {
            // Numeric form
            let start = self.parse_expr()?;
            self.expect(&TokenKind::Comma)?;
            let limit = self.parse_expr()?;
            let step = if self.match_token(&TokenKind::Comma) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            self.expect(&TokenKind::Do)?;
            let body = self.parse_block()?;
            self.expect(&TokenKind::End)?;
            return Ok(Stmt::new(
                StmtKind::NumericFor {
                    var: first,
                    start,
                    limit,
                    step,
                    body,
                },
                span.merge(self.previous_span()),
            ));
        }

        // Generic form
        let mut vars = vec![first];
        while self.match_token(&TokenKind::Comma) {
            vars.push(self.expect_name()?);
        }
        self.expect(&TokenKind::In)?;
        let exprs = self.parse_expr_list()?;
        self.expect(&TokenKind::Do)?;
        let body = self.parse_block()?;
        self.expect(&TokenKind::End)?;
        Ok(Stmt::new(
            StmtKind::GenericFor { vars, exprs, body },
            span.merge(self.previous_span()),
        ))
    }

    fn parse_function_decl(&mut self) -> ParseResult<Stmt> {
        let span = self.current_span();
        self.advance(); // function

        let base = self.expect_name()?;
        let mut path = Vec::new();
        while self.match_token(&TokenKind::Dot) {
            path.push(self.expect_name()?.text);
        }
        let method = if self.match_token(&TokenKind::Colon) {
            Some(self.expect_name()?.text)
        } else {
            None
        };

        let is_method = method.is_some();
        let body = self.parse_func_body(is_method)?;

        Ok(Stmt::new(
            StmtKind::FunctionDecl {
                name: FuncName { base, path, method },
                body,
            },
            span.merge(self.previous_span()),
        ))
    }

    fn parse_local(&mut self) -> ParseResult<Stmt> {
        let span = self.current_span();
        self.advance(); // local

        if self.match_token(&TokenKind::Function) {
            let name = self.expect_name()?;
            let body = self.parse_func_body(false)?;
            return Ok(Stmt::new(
                StmtKind::LocalFunction { name, body },
                span.merge(self.previous_span()),
            ));
        }

        let mut names = vec![self.expect_name()?];
        while self.match_token(&TokenKind::Comma) {
            names.push(self.expect_name()?);
        }

        let exprs = if self.match_token(&TokenKind::Equal) {
            self.parse_expr_list()?
        } else {
            Vec::new()
        };

        Ok(Stmt::new(
            StmtKind::Local { names, exprs },
            span.merge(self.previous_span()),
        ))
    }

    /// Parse `(params) block end`. Method sugar prepends an implicit `self`.
    pub(crate) fn parse_func_body(&mut self, is_method: bool) -> ParseResult<FuncBody> {
        let span = self.current_span();
        let id = self.node_id();
        self.expect(&TokenKind::LeftParen)?;

        let mut params = Vec::new();
        if is_method {
            let self_span = self.current_span();
            params.push(Name::new("self", self.node_id(), self_span));
        }

        let mut is_vararg = false;
        if !self.check(&TokenKind::RightParen) {
            loop {
                if self.match_token(&TokenKind::Ellipsis) {
                    is_vararg = true;
                    break;
                }
                params.push(self.expect_name()?);
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RightParen)?;

        self.vararg_ok.push(is_vararg);
        let body = self.parse_block()?;
        self.vararg_ok.pop();
        self.expect(&TokenKind::End)?;

        Ok(FuncBody {
            params,
            is_vararg,
            body,
            id,
            span: span.merge(self.previous_span()),
        })
    }

    pub(crate) fn parse_expr_list(&mut self) -> ParseResult<Vec<Expr>> {
        let mut exprs = vec![self.parse_expr()?];
        while self.match_token(&TokenKind::Comma) {
            exprs.push(self.parse_expr()?);
        }
        Ok(exprs)
    }
}
