//! Recursive-descent parser for BP source files.
//!
//! Declarations are handled here; statements and expressions live in the
//! sibling modules. The parser performs no name resolution: calls,
//! fields, enum members and instantiations all come out with empty
//! resolution slots that the type checker fills in.

mod expr;
mod stmt;

use crate::ast::{
    ClassDef, EnumDef, ExternDecl, FuncDef, Module, Param, Stmt, StructDef, Type,
};
use crate::error::{ParseError, ParseResult};
use crate::lexer::{lex, SpannedTok, Tok};

pub struct Parser {
    toks: Vec<SpannedTok>,
    pos: usize,
}

impl std::fmt::Debug for Parser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parser(pos {} of {})", self.pos, self.toks.len())
    }
}

/// Parse a whole source file into a `Module`.
pub fn parse_module(source: &str) -> ParseResult<Module> {
    Parser::new(source)?.module()
}

/// Parse a single expression (used for f-string fragments and tests).
pub fn parse_expression(source: &str, line: u32) -> ParseResult<crate::ast::Expr> {
    let mut parser = Parser::new(source)?;
    parser.rebase_lines(line);
    let expr = parser.expr()?;
    match parser.peek() {
        Tok::Newline | Tok::Eof => Ok(expr),
        other => Err(ParseError::UnexpectedToken {
            found: other.describe(),
            expected: "end of expression".to_string(),
            line: parser.line(),
        }),
    }
}

impl Parser {
    pub fn new(source: &str) -> ParseResult<Self> {
        Ok(Self {
            toks: lex(source)?,
            pos: 0,
        })
    }

    /// Shift every token's line so fragments report positions in the
    /// enclosing file (f-string bodies re-lex from column zero).
    fn rebase_lines(&mut self, base: u32) {
        for t in &mut self.toks {
            t.line = base + t.line - 1;
        }
    }

    pub(crate) fn peek(&self) -> &Tok {
        &self.toks[self.pos].tok
    }

    pub(crate) fn line(&self) -> u32 {
        self.toks[self.pos].line
    }

    pub(crate) fn advance(&mut self) -> Tok {
        let tok = self.toks[self.pos].tok.clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        tok
    }

    pub(crate) fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(crate) fn expect(&mut self, tok: Tok, expected: &str) -> ParseResult<()> {
        if self.peek() == &tok {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    pub(crate) fn expect_ident(&mut self, expected: &str) -> ParseResult<String> {
        match self.peek() {
            Tok::Ident(_) => match self.advance() {
                Tok::Ident(name) => Ok(name),
                _ => unreachable!(),
            },
            _ => Err(self.unexpected(expected)),
        }
    }

    pub(crate) fn unexpected(&self, expected: &str) -> ParseError {
        match self.peek() {
            Tok::Eof => ParseError::UnexpectedEof {
                expected: expected.to_string(),
                line: self.line(),
            },
            other => ParseError::UnexpectedToken {
                found: other.describe(),
                expected: expected.to_string(),
                line: self.line(),
            },
        }
    }

    pub(crate) fn skip_newlines(&mut self) {
        while matches!(self.peek(), Tok::Newline) {
            self.advance();
        }
    }

    fn module(&mut self) -> ParseResult<Module> {
        let mut module = Module::default();
        loop {
            self.skip_newlines();
            match self.peek() {
                Tok::Eof => break,
                Tok::Def => module.funcs.push(self.func_def()?),
                Tok::Struct => module.structs.push(self.struct_def()?),
                Tok::Enum => module.enums.push(self.enum_def()?),
                Tok::Class => module.classes.push(self.class_def()?),
                Tok::Extern => module.externs.push(self.extern_decl()?),
                Tok::Import => {
                    self.advance();
                    let name = match self.advance() {
                        Tok::Ident(n) => n,
                        Tok::Str(n) => n,
                        _ => return Err(self.unexpected("module name")),
                    };
                    module.imports.push(name);
                    self.end_of_line()?;
                }
                Tok::Let => {
                    let stmt = self.let_stmt()?;
                    self.end_of_line()?;
                    module.globals.push(stmt);
                }
                _ => return Err(self.unexpected("declaration")),
            }
        }
        Ok(module)
    }

    /// Consume the newline terminating a simple statement. Dedent and
    /// end-of-input also terminate, without being consumed.
    pub(crate) fn end_of_line(&mut self) -> ParseResult<()> {
        match self.peek() {
            Tok::Newline => {
                self.advance();
                Ok(())
            }
            Tok::Dedent | Tok::Eof => Ok(()),
            _ => Err(self.unexpected("end of line")),
        }
    }

    fn func_def(&mut self) -> ParseResult<FuncDef> {
        let line = self.line();
        self.expect(Tok::Def, "'def'")?;
        let name = self.expect_ident("function name")?;
        let params = self.param_list()?;
        let ret = if self.eat(&Tok::Arrow) {
            self.type_expr()?
        } else {
            Type::Void
        };
        let body = self.suite()?;
        Ok(FuncDef {
            name,
            params,
            ret,
            body,
            line,
        })
    }

    pub(crate) fn param_list(&mut self) -> ParseResult<Vec<Param>> {
        self.expect(Tok::LParen, "'('")?;
        let mut params = Vec::new();
        if !self.eat(&Tok::RParen) {
            loop {
                let name = self.expect_ident("parameter name")?;
                self.expect(Tok::Colon, "':' after parameter name")?;
                let ty = self.type_expr()?;
                params.push(Param { name, ty });
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
            self.expect(Tok::RParen, "')'")?;
        }
        Ok(params)
    }

    fn struct_def(&mut self) -> ParseResult<StructDef> {
        let line = self.line();
        self.expect(Tok::Struct, "'struct'")?;
        let name = self.expect_ident("struct name")?;
        self.expect(Tok::Colon, "':'")?;
        self.expect(Tok::Newline, "newline")?;
        self.expect(Tok::Indent, "indented struct body")?;
        let mut fields = Vec::new();
        loop {
            self.skip_newlines();
            if self.eat(&Tok::Dedent) {
                break;
            }
            let fname = self.expect_ident("field name")?;
            self.expect(Tok::Colon, "':' after field name")?;
            let ty = self.type_expr()?;
            fields.push(Param { name: fname, ty });
            self.end_of_line()?;
        }
        Ok(StructDef { name, fields, line })
    }

    fn enum_def(&mut self) -> ParseResult<EnumDef> {
        let line = self.line();
        self.expect(Tok::Enum, "'enum'")?;
        let name = self.expect_ident("enum name")?;
        self.expect(Tok::Colon, "':'")?;
        self.expect(Tok::Newline, "newline")?;
        self.expect(Tok::Indent, "indented enum body")?;
        let mut members = Vec::new();
        loop {
            self.skip_newlines();
            if self.eat(&Tok::Dedent) {
                break;
            }
            members.push(self.expect_ident("enum member")?);
            self.end_of_line()?;
        }
        Ok(EnumDef {
            name,
            members,
            line,
        })
    }

    fn class_def(&mut self) -> ParseResult<ClassDef> {
        let line = self.line();
        self.expect(Tok::Class, "'class'")?;
        let name = self.expect_ident("class name")?;
        let parent = if self.eat(&Tok::LParen) {
            let p = self.expect_ident("parent class name")?;
            self.expect(Tok::RParen, "')'")?;
            Some(p)
        } else {
            None
        };
        self.expect(Tok::Colon, "':'")?;
        self.expect(Tok::Newline, "newline")?;
        self.expect(Tok::Indent, "indented class body")?;
        let mut fields = Vec::new();
        let mut methods = Vec::new();
        loop {
            self.skip_newlines();
            if self.eat(&Tok::Dedent) {
                break;
            }
            if matches!(self.peek(), Tok::Def) {
                methods.push(self.func_def()?);
            } else {
                let fname = self.expect_ident("field or method")?;
                self.expect(Tok::Colon, "':' after field name")?;
                let ty = self.type_expr()?;
                fields.push(Param { name: fname, ty });
                self.end_of_line()?;
            }
        }
        Ok(ClassDef {
            name,
            parent,
            fields,
            methods,
            line,
        })
    }

    /// `extern def bp_name(t, ...) -> ret from "lib" [as "c_name"] [variadic]`
    fn extern_decl(&mut self) -> ParseResult<ExternDecl> {
        let line = self.line();
        self.expect(Tok::Extern, "'extern'")?;
        self.expect(Tok::Def, "'def'")?;
        let bp_name = self.expect_ident("extern function name")?;
        self.expect(Tok::LParen, "'('")?;
        let mut params = Vec::new();
        if !self.eat(&Tok::RParen) {
            loop {
                params.push(self.type_expr()?);
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
            self.expect(Tok::RParen, "')'")?;
        }
        let ret = if self.eat(&Tok::Arrow) {
            self.type_expr()?
        } else {
            Type::Void
        };
        self.expect(Tok::From, "'from'")?;
        let library = match self.advance() {
            Tok::Str(s) => s,
            _ => return Err(self.unexpected("library path string")),
        };
        let c_name = if self.eat(&Tok::As) {
            match self.advance() {
                Tok::Str(s) => s,
                _ => return Err(self.unexpected("symbol name string")),
            }
        } else {
            bp_name.clone()
        };
        let variadic = self.eat(&Tok::Variadic);
        self.end_of_line()?;
        Ok(ExternDecl {
            bp_name,
            c_name,
            library,
            params,
            ret,
            variadic,
            line,
        })
    }

    /// Parse a type expression.
    pub(crate) fn type_expr(&mut self) -> ParseResult<Type> {
        match self.peek().clone() {
            Tok::Ident(name) => {
                self.advance();
                if name == "ptr" && self.eat(&Tok::LBracket) {
                    let elem = self.type_expr()?;
                    self.expect(Tok::RBracket, "']'")?;
                    return Ok(Type::Ptr(Box::new(elem)));
                }
                Ok(match name.as_str() {
                    "int" => Type::Int,
                    "float" => Type::Float,
                    "bool" => Type::Bool,
                    "str" => Type::Str,
                    "void" => Type::Void,
                    "i8" => Type::I8,
                    "i16" => Type::I16,
                    "i32" => Type::I32,
                    "i64" => Type::I64,
                    "u8" => Type::U8,
                    "u16" => Type::U16,
                    "u32" => Type::U32,
                    "u64" => Type::U64,
                    "ptr" => Type::Ptr(Box::new(Type::Void)),
                    _ => Type::Named(name),
                })
            }
            Tok::LBracket => {
                self.advance();
                let elem = self.type_expr()?;
                self.expect(Tok::RBracket, "']'")?;
                Ok(Type::Array(Box::new(elem)))
            }
            Tok::LBrace => {
                self.advance();
                let key = self.type_expr()?;
                self.expect(Tok::Colon, "':' in map type")?;
                let value = self.type_expr()?;
                self.expect(Tok::RBrace, "'}'")?;
                Ok(Type::Map(Box::new(key), Box::new(value)))
            }
            Tok::LParen => {
                self.advance();
                let mut elems = vec![self.type_expr()?];
                while self.eat(&Tok::Comma) {
                    elems.push(self.type_expr()?);
                }
                self.expect(Tok::RParen, "')'")?;
                Ok(Type::Tuple(elems))
            }
            Tok::Fn => {
                self.advance();
                self.expect(Tok::LParen, "'('")?;
                let mut params = Vec::new();
                if !self.eat(&Tok::RParen) {
                    loop {
                        params.push(self.type_expr()?);
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                    self.expect(Tok::RParen, "')'")?;
                }
                self.expect(Tok::Arrow, "'->'")?;
                let ret = self.type_expr()?;
                Ok(Type::Function(params, Box::new(ret)))
            }
            _ => Err(self.unexpected("type")),
        }
    }

    /// A suite: `:` then either an indented block or inline simple
    /// statements separated by `;` on the same line.
    pub(crate) fn suite(&mut self) -> ParseResult<Vec<Stmt>> {
        self.expect(Tok::Colon, "':'")?;
        if self.eat(&Tok::Newline) {
            self.expect(Tok::Indent, "indented block")?;
            self.block()
        } else {
            let mut stmts = vec![self.simple_stmt()?];
            while self.eat(&Tok::Semi) {
                if matches!(self.peek(), Tok::Newline | Tok::Dedent | Tok::Eof) {
                    break;
                }
                stmts.push(self.simple_stmt()?);
            }
            self.end_of_line()?;
            Ok(stmts)
        }
    }

    /// Statements until the matching dedent.
    pub(crate) fn block(&mut self) -> ParseResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            if self.eat(&Tok::Dedent) || matches!(self.peek(), Tok::Eof) {
                break;
            }
            stmts.push(self.stmt()?);
        }
        Ok(stmts)
    }
}
