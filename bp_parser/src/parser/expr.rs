//! Expression parsing: precedence climbing plus postfix chains.

use super::Parser;
use crate::ast::{BinOp, CallTarget, Expr, ExprKind, FStringPart, Param, UnOp};
use crate::error::{ParseError, ParseResult};
use crate::lexer::{unescape, Tok};

impl Parser {
    pub(crate) fn expr(&mut self) -> ParseResult<Expr> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.and_expr()?;
        while matches!(self.peek(), Tok::Or) {
            let line = self.line();
            self.advance();
            let rhs = self.and_expr()?;
            lhs = binary(BinOp::Or, lhs, rhs, line);
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.not_expr()?;
        while matches!(self.peek(), Tok::And) {
            let line = self.line();
            self.advance();
            let rhs = self.not_expr()?;
            lhs = binary(BinOp::And, lhs, rhs, line);
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> ParseResult<Expr> {
        if matches!(self.peek(), Tok::Not) {
            let line = self.line();
            self.advance();
            let operand = self.not_expr()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnOp::Not,
                    operand: Box::new(operand),
                },
                line,
            ));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.bit_or()?;
        loop {
            let op = match self.peek() {
                Tok::EqEq => BinOp::Eq,
                Tok::NotEq => BinOp::Ne,
                Tok::Lt => BinOp::Lt,
                Tok::Le => BinOp::Le,
                Tok::Gt => BinOp::Gt,
                Tok::Ge => BinOp::Ge,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.bit_or()?;
            lhs = binary(op, lhs, rhs, line);
        }
        Ok(lhs)
    }

    fn bit_or(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.bit_xor()?;
        while matches!(self.peek(), Tok::Pipe) {
            let line = self.line();
            self.advance();
            let rhs = self.bit_xor()?;
            lhs = binary(BinOp::BitOr, lhs, rhs, line);
        }
        Ok(lhs)
    }

    fn bit_xor(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.bit_and()?;
        while matches!(self.peek(), Tok::Caret) {
            let line = self.line();
            self.advance();
            let rhs = self.bit_and()?;
            lhs = binary(BinOp::BitXor, lhs, rhs, line);
        }
        Ok(lhs)
    }

    fn bit_and(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.shift()?;
        while matches!(self.peek(), Tok::Amp) {
            let line = self.line();
            self.advance();
            let rhs = self.shift()?;
            lhs = binary(BinOp::BitAnd, lhs, rhs, line);
        }
        Ok(lhs)
    }

    fn shift(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.add_sub()?;
        loop {
            let op = match self.peek() {
                Tok::Shl => BinOp::Shl,
                Tok::Shr => BinOp::Shr,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.add_sub()?;
            lhs = binary(op, lhs, rhs, line);
        }
        Ok(lhs)
    }

    fn add_sub(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.mul_div()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.mul_div()?;
            lhs = binary(op, lhs, rhs, line);
        }
        Ok(lhs)
    }

    fn mul_div(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::Percent => BinOp::Mod,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs, line);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        let line = self.line();
        match self.peek() {
            Tok::Minus => {
                self.advance();
                let operand = self.unary()?;
                // Fold a negated literal so `-9` is a plain constant.
                if let ExprKind::IntLit(v) = operand.kind {
                    return Ok(Expr::new(ExprKind::IntLit(v.wrapping_neg()), line));
                }
                if let ExprKind::FloatLit(v) = operand.kind {
                    return Ok(Expr::new(ExprKind::FloatLit(-v), line));
                }
                Ok(Expr::new(
                    ExprKind::Unary {
                        op: UnOp::Neg,
                        operand: Box::new(operand),
                    },
                    line,
                ))
            }
            Tok::Tilde => {
                self.advance();
                let operand = self.unary()?;
                Ok(Expr::new(
                    ExprKind::Unary {
                        op: UnOp::BitNot,
                        operand: Box::new(operand),
                    },
                    line,
                ))
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Tok::LParen => {
                    let line = self.line();
                    let args = self.call_args()?;
                    expr = match expr.kind {
                        // A bare name applied to arguments is a direct
                        // call; the checker may rewrite it to a value
                        // call or an instantiation.
                        ExprKind::Var(name) => Expr::new(
                            ExprKind::Call {
                                name,
                                args,
                                target: CallTarget::Unresolved,
                            },
                            expr.line,
                        ),
                        _ => Expr::new(
                            ExprKind::CallValue {
                                callee: Box::new(expr),
                                args,
                            },
                            line,
                        ),
                    };
                }
                Tok::LBracket => {
                    let line = self.line();
                    self.advance();
                    let index = self.expr()?;
                    self.expect(Tok::RBracket, "']'")?;
                    expr = Expr::new(
                        ExprKind::Index {
                            base: Box::new(expr),
                            index: Box::new(index),
                        },
                        line,
                    );
                }
                Tok::Dot => {
                    let line = self.line();
                    self.advance();
                    let name = self.expect_ident("field or method name")?;
                    if matches!(self.peek(), Tok::LParen) {
                        let args = self.call_args()?;
                        expr = Expr::new(
                            ExprKind::MethodCall {
                                base: Box::new(expr),
                                name,
                                args,
                                method_id: None,
                            },
                            line,
                        );
                    } else {
                        expr = Expr::new(
                            ExprKind::Field {
                                base: Box::new(expr),
                                name,
                                index: None,
                            },
                            line,
                        );
                    }
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn call_args(&mut self) -> ParseResult<Vec<Expr>> {
        self.expect(Tok::LParen, "'('")?;
        let mut args = Vec::new();
        if !self.eat(&Tok::RParen) {
            loop {
                args.push(self.expr()?);
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
            self.expect(Tok::RParen, "')'")?;
        }
        Ok(args)
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let line = self.line();
        match self.peek().clone() {
            Tok::Int(v) => {
                self.advance();
                Ok(Expr::new(ExprKind::IntLit(v), line))
            }
            Tok::Float(v) => {
                self.advance();
                Ok(Expr::new(ExprKind::FloatLit(v), line))
            }
            Tok::True => {
                self.advance();
                Ok(Expr::new(ExprKind::BoolLit(true), line))
            }
            Tok::False => {
                self.advance();
                Ok(Expr::new(ExprKind::BoolLit(false), line))
            }
            Tok::Null => {
                self.advance();
                Ok(Expr::new(ExprKind::Null, line))
            }
            Tok::Str(s) => {
                self.advance();
                Ok(Expr::new(ExprKind::StrLit(s), line))
            }
            Tok::FStr(raw) => {
                self.advance();
                self.fstring(&raw, line)
            }
            Tok::Ident(name) => {
                self.advance();
                if matches!(self.peek(), Tok::LBrace) {
                    return self.struct_lit(name, line);
                }
                Ok(Expr::new(ExprKind::Var(name), line))
            }
            Tok::Super => {
                self.advance();
                self.expect(Tok::Dot, "'.' after super")?;
                let name = self.expect_ident("method name")?;
                let args = self.call_args()?;
                Ok(Expr::new(
                    ExprKind::SuperCall {
                        name,
                        args,
                        method_id: None,
                    },
                    line,
                ))
            }
            Tok::Fn => self.lambda(line),
            Tok::LParen => {
                self.advance();
                let first = self.expr()?;
                if self.eat(&Tok::Comma) {
                    let mut elems = vec![first];
                    if !matches!(self.peek(), Tok::RParen) {
                        loop {
                            elems.push(self.expr()?);
                            if !self.eat(&Tok::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(Tok::RParen, "')'")?;
                    return Ok(Expr::new(ExprKind::TupleLit(elems), line));
                }
                self.expect(Tok::RParen, "')'")?;
                Ok(first)
            }
            Tok::LBracket => {
                self.advance();
                let mut elems = Vec::new();
                if !self.eat(&Tok::RBracket) {
                    loop {
                        elems.push(self.expr()?);
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                    self.expect(Tok::RBracket, "']'")?;
                }
                Ok(Expr::new(ExprKind::ArrayLit(elems), line))
            }
            Tok::LBrace => {
                self.advance();
                let mut pairs = Vec::new();
                if !self.eat(&Tok::RBrace) {
                    loop {
                        let key = self.expr()?;
                        self.expect(Tok::Colon, "':' in map literal")?;
                        let value = self.expr()?;
                        pairs.push((key, value));
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                    self.expect(Tok::RBrace, "'}'")?;
                }
                Ok(Expr::new(ExprKind::MapLit(pairs), line))
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    /// `Name { field: expr, ... }`
    fn struct_lit(&mut self, name: String, line: u32) -> ParseResult<Expr> {
        self.expect(Tok::LBrace, "'{'")?;
        let mut fields = Vec::new();
        if !self.eat(&Tok::RBrace) {
            loop {
                let fname = self.expect_ident("field name")?;
                self.expect(Tok::Colon, "':' after field name")?;
                let value = self.expr()?;
                fields.push((fname, value));
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
            self.expect(Tok::RBrace, "'}'")?;
        }
        Ok(Expr::new(
            ExprKind::StructLit {
                name,
                fields,
                type_id: None,
            },
            line,
        ))
    }

    /// `fn(a: int, b: int) -> int: expr`
    fn lambda(&mut self, line: u32) -> ParseResult<Expr> {
        self.expect(Tok::Fn, "'fn'")?;
        let params: Vec<Param> = self.param_list()?;
        self.expect(Tok::Arrow, "'->' in lambda")?;
        let ret = self.type_expr()?;
        self.expect(Tok::Colon, "':' before lambda body")?;
        let body = self.expr()?;
        Ok(Expr::new(
            ExprKind::Lambda {
                params,
                ret,
                body: Box::new(body),
                fn_index: None,
            },
            line,
        ))
    }

    /// Split a raw f-string body into literal and `{expr}` parts.
    /// `{{` and `}}` escape literal braces.
    fn fstring(&mut self, raw: &str, line: u32) -> ParseResult<Expr> {
        let mut parts = Vec::new();
        let mut lit = String::new();
        let mut chars = raw.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    lit.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    lit.push('}');
                }
                '{' => {
                    if !lit.is_empty() {
                        parts.push(FStringPart::Lit(unescape(&lit, line)?));
                        lit.clear();
                    }
                    let mut body = String::new();
                    let mut depth = 1usize;
                    for c in chars.by_ref() {
                        match c {
                            '{' => depth += 1,
                            '}' => {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            _ => {}
                        }
                        body.push(c);
                    }
                    if depth != 0 {
                        return Err(ParseError::UnterminatedFStringExpr { line });
                    }
                    let expr = super::parse_expression(&body, line)?;
                    parts.push(FStringPart::Expr(expr));
                }
                '}' => {
                    return Err(ParseError::InvalidSyntax {
                        message: "unmatched '}' in format string".to_string(),
                        line,
                    })
                }
                _ => lit.push(c),
            }
        }
        if !lit.is_empty() {
            parts.push(FStringPart::Lit(unescape(&lit, line)?));
        }
        Ok(Expr::new(ExprKind::FString(parts), line))
    }
}

fn binary(op: BinOp, lhs: Expr, rhs: Expr, line: u32) -> Expr {
    Expr::new(
        ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        line,
    )
}
