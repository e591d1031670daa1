//! Statement parsing.

use super::Parser;
use crate::ast::{Expr, ExprKind, MatchArm, Stmt, StmtKind};
use crate::error::{ParseError, ParseResult};
use crate::lexer::Tok;

impl Parser {
    /// One statement inside a block: compound forms own their suites,
    /// simple forms consume the trailing newline.
    pub(crate) fn stmt(&mut self) -> ParseResult<Stmt> {
        match self.peek() {
            Tok::If => self.if_stmt(),
            Tok::While => self.while_stmt(),
            Tok::For => self.for_stmt(),
            Tok::Try => self.try_stmt(),
            Tok::Match => self.match_stmt(),
            _ => {
                let stmt = self.simple_stmt()?;
                self.end_of_line()?;
                Ok(stmt)
            }
        }
    }

    /// A one-line statement; the terminator is left for the caller so
    /// inline suites can chain these with `;`.
    pub(crate) fn simple_stmt(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        match self.peek() {
            Tok::Let => self.let_stmt(),
            Tok::Break => {
                self.advance();
                Ok(Stmt::new(StmtKind::Break, line))
            }
            Tok::Continue => {
                self.advance();
                Ok(Stmt::new(StmtKind::Continue, line))
            }
            Tok::Return => {
                self.advance();
                let value = if matches!(
                    self.peek(),
                    Tok::Newline | Tok::Semi | Tok::Dedent | Tok::Eof
                ) {
                    None
                } else {
                    Some(self.expr()?)
                };
                Ok(Stmt::new(StmtKind::Return(value), line))
            }
            Tok::Throw => {
                self.advance();
                let value = self.expr()?;
                Ok(Stmt::new(StmtKind::Throw(value), line))
            }
            _ => self.assign_or_expr_stmt(),
        }
    }

    pub(crate) fn let_stmt(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        self.expect(Tok::Let, "'let'")?;
        let name = self.expect_ident("variable name")?;
        self.expect(Tok::Colon, "':' after variable name")?;
        let ty = self.type_expr()?;
        self.expect(Tok::Assign, "'='")?;
        let init = self.expr()?;
        Ok(Stmt::new(StmtKind::Let { name, ty, init }, line))
    }

    /// Parse an expression, then decide between plain expression
    /// statement and the three assignment forms based on a trailing `=`.
    fn assign_or_expr_stmt(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        let expr = self.expr()?;
        if !self.eat(&Tok::Assign) {
            return Ok(Stmt::new(StmtKind::Expr(expr), line));
        }
        let value = self.expr()?;
        match expr.kind {
            ExprKind::Var(name) => Ok(Stmt::new(StmtKind::Assign { name, value }, line)),
            ExprKind::Index { base, index } => Ok(Stmt::new(
                StmtKind::IndexAssign {
                    base: *base,
                    index: *index,
                    value,
                },
                line,
            )),
            ExprKind::Field { base, name, index } => Ok(Stmt::new(
                StmtKind::FieldAssign {
                    base: *base,
                    field: name,
                    index,
                    value,
                },
                line,
            )),
            _ => Err(ParseError::InvalidSyntax {
                message: "invalid assignment target".to_string(),
                line,
            }),
        }
    }

    fn if_stmt(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        self.expect(Tok::If, "'if'")?;
        let cond = self.expr()?;
        let then_body = self.suite()?;
        let else_body = self.else_tail()?;
        Ok(Stmt::new(
            StmtKind::If {
                cond,
                then_body,
                else_body,
            },
            line,
        ))
    }

    /// `elif` chains desugar to a nested `if` in the else branch.
    fn else_tail(&mut self) -> ParseResult<Vec<Stmt>> {
        // Peek past blank lines without committing: elif/else must be
        // at the same indentation, so they follow immediately.
        if matches!(self.peek(), Tok::Elif) {
            let line = self.line();
            self.advance();
            let cond = self.expr()?;
            let then_body = self.suite()?;
            let else_body = self.else_tail()?;
            return Ok(vec![Stmt::new(
                StmtKind::If {
                    cond,
                    then_body,
                    else_body,
                },
                line,
            )]);
        }
        if matches!(self.peek(), Tok::Else) {
            self.advance();
            return self.suite();
        }
        Ok(Vec::new())
    }

    fn while_stmt(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        self.expect(Tok::While, "'while'")?;
        let cond = self.expr()?;
        let body = self.suite()?;
        Ok(Stmt::new(StmtKind::While { cond, body }, line))
    }

    /// `for x in range(a, b)` becomes a range loop; any other iterable
    /// becomes a collection loop.
    fn for_stmt(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        self.expect(Tok::For, "'for'")?;
        let var = self.expect_ident("loop variable")?;
        self.expect(Tok::In, "'in'")?;
        let iter = self.expr()?;
        let body = self.suite()?;
        if let ExprKind::Call { name, args, .. } = &iter.kind {
            if name == "range" && (args.len() == 1 || args.len() == 2) {
                let mut args = args.clone();
                let (start, end) = if args.len() == 2 {
                    let end = args.pop().unwrap();
                    (args.pop().unwrap(), end)
                } else {
                    (
                        Expr::new(ExprKind::IntLit(0), iter.line),
                        args.pop().unwrap(),
                    )
                };
                return Ok(Stmt::new(
                    StmtKind::ForRange {
                        var,
                        start,
                        end,
                        body,
                    },
                    line,
                ));
            }
        }
        Ok(Stmt::new(StmtKind::ForEach { var, iter, body }, line))
    }

    fn try_stmt(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        self.expect(Tok::Try, "'try'")?;
        let body = self.suite()?;
        self.skip_newlines();
        let catch = if matches!(self.peek(), Tok::Catch) {
            self.advance();
            let name = self.expect_ident("exception variable")?;
            let catch_body = self.suite()?;
            Some((name, catch_body))
        } else {
            None
        };
        self.skip_newlines();
        let finally_body = if matches!(self.peek(), Tok::Finally) {
            self.advance();
            self.suite()?
        } else {
            Vec::new()
        };
        if catch.is_none() && finally_body.is_empty() {
            return Err(ParseError::InvalidSyntax {
                message: "try statement needs a catch or finally clause".to_string(),
                line,
            });
        }
        Ok(Stmt::new(
            StmtKind::Try {
                body,
                catch,
                finally_body,
            },
            line,
        ))
    }

    fn match_stmt(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        self.expect(Tok::Match, "'match'")?;
        let subject = self.expr()?;
        self.expect(Tok::Colon, "':'")?;
        self.expect(Tok::Newline, "newline")?;
        self.expect(Tok::Indent, "indented match body")?;
        let mut arms = Vec::new();
        let mut default = None;
        loop {
            self.skip_newlines();
            if self.eat(&Tok::Dedent) || matches!(self.peek(), Tok::Eof) {
                break;
            }
            if self.eat(&Tok::Case) {
                let pattern = self.expr()?;
                let body = self.suite()?;
                arms.push(MatchArm { pattern, body });
            } else if self.eat(&Tok::Default) {
                if default.is_some() {
                    return Err(ParseError::InvalidSyntax {
                        message: "duplicate default arm".to_string(),
                        line: self.line(),
                    });
                }
                default = Some(self.suite()?);
            } else {
                return Err(self.unexpected("'case' or 'default'"));
            }
        }
        Ok(Stmt::new(
            StmtKind::Match {
                subject,
                arms,
                default,
            },
            line,
        ))
    }
}
