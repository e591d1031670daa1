//! Indentation-aware lexer.
//!
//! Wraps the logos-generated raw lexer and synthesizes the layout tokens
//! the parser consumes: `Newline` terminates a logical line, and
//! `Indent`/`Dedent` bracket suites, Python-style. Newlines inside
//! parentheses, brackets and braces are implicit continuations and
//! produce no layout tokens.

use logos::Logos;

use crate::error::{ParseError, ParseResult};
use crate::token::RawTok;

/// A cooked token. Literal variants carry their decoded payload;
/// `FStr` keeps the raw inner text, which the parser splits into
/// literal and expression parts.
#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    FStr(String),
    Ident(String),

    Def,
    Let,
    If,
    Elif,
    Else,
    While,
    For,
    In,
    Break,
    Continue,
    Return,
    Try,
    Catch,
    Finally,
    Throw,
    Match,
    Case,
    Default,
    Struct,
    Enum,
    Class,
    Extern,
    From,
    As,
    Import,
    Variadic,
    Fn,
    Super,
    And,
    Or,
    Not,
    True,
    False,
    Null,

    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semi,
    Dot,
    Arrow,
    Assign,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Shl,
    Shr,
    Tilde,

    Newline,
    Indent,
    Dedent,
    Eof,
}

impl Tok {
    /// Short description for error messages.
    pub fn describe(&self) -> String {
        match self {
            Tok::Int(v) => format!("{}", v),
            Tok::Float(v) => format!("{}", v),
            Tok::Str(_) => "string literal".to_string(),
            Tok::FStr(_) => "format string".to_string(),
            Tok::Ident(name) => format!("'{}'", name),
            Tok::Newline => "end of line".to_string(),
            Tok::Indent => "indent".to_string(),
            Tok::Dedent => "dedent".to_string(),
            Tok::Eof => "end of input".to_string(),
            other => format!("{:?}", other).to_lowercase(),
        }
    }
}

/// A token with the 1-based line it starts on.
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedTok {
    pub tok: Tok,
    pub line: u32,
}

/// Indentation width: spaces count 1, tabs count 4.
fn measure_indent(ws: &str) -> usize {
    ws.chars()
        .map(|c| if c == '\t' { 4 } else { 1 })
        .sum()
}

/// Decode the escapes of a plain string literal body.
pub(crate) fn unescape(body: &str, line: u32) -> ParseResult<String> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('{') => out.push('{'),
            Some('}') => out.push('}'),
            Some(other) => {
                return Err(ParseError::InvalidEscape {
                    sequence: other,
                    line,
                })
            }
            None => {
                return Err(ParseError::InvalidEscape {
                    sequence: '\\',
                    line,
                })
            }
        }
    }
    Ok(out)
}

/// Lex a whole source file into a flat token stream ending in `Eof`.
pub fn lex(source: &str) -> ParseResult<Vec<SpannedTok>> {
    let mut raw = RawTok::lexer(source);
    let mut out: Vec<SpannedTok> = Vec::new();
    let mut indents: Vec<usize> = vec![0];
    let mut line: u32 = 1;
    let mut depth: usize = 0;
    // Pending layout from the last newline seen at bracket depth 0:
    // (indent of the upcoming line, line number the newline ended).
    let mut pending: Option<(usize, u32)> = None;

    while let Some(res) = raw.next() {
        let tok = match res {
            Ok(t) => t,
            Err(()) => return Err(ParseError::LexerError { line }),
        };
        if tok == RawTok::NewlineWs {
            let text = raw.slice();
            if depth == 0 {
                pending = Some((measure_indent(&text[1..]), line));
            }
            line += 1;
            continue;
        }

        if let Some((indent, nl_line)) = pending.take() {
            if !out.is_empty() {
                out.push(SpannedTok {
                    tok: Tok::Newline,
                    line: nl_line,
                });
            }
            let top = *indents.last().unwrap_or(&0);
            if indent > top {
                indents.push(indent);
                out.push(SpannedTok {
                    tok: Tok::Indent,
                    line,
                });
            } else if indent < top {
                while *indents.last().unwrap_or(&0) > indent {
                    indents.pop();
                    out.push(SpannedTok {
                        tok: Tok::Dedent,
                        line,
                    });
                }
                if *indents.last().unwrap_or(&0) != indent {
                    return Err(ParseError::BadIndent { line });
                }
            }
        }

        let slice = raw.slice();
        let cooked = match tok {
            RawTok::Int => {
                let value: i64 = slice.parse().map_err(|_| ParseError::InvalidNumber {
                    literal: slice.to_string(),
                    line,
                })?;
                Tok::Int(value)
            }
            RawTok::HexInt => {
                let value = i64::from_str_radix(&slice[2..], 16).map_err(|_| {
                    ParseError::InvalidNumber {
                        literal: slice.to_string(),
                        line,
                    }
                })?;
                Tok::Int(value)
            }
            RawTok::Float => {
                let value: f64 = slice.parse().map_err(|_| ParseError::InvalidNumber {
                    literal: slice.to_string(),
                    line,
                })?;
                Tok::Float(value)
            }
            RawTok::Str => Tok::Str(unescape(&slice[1..slice.len() - 1], line)?),
            RawTok::FStr => Tok::FStr(slice[2..slice.len() - 1].to_string()),
            RawTok::Ident => Tok::Ident(slice.to_string()),
            RawTok::Def => Tok::Def,
            RawTok::Let => Tok::Let,
            RawTok::If => Tok::If,
            RawTok::Elif => Tok::Elif,
            RawTok::Else => Tok::Else,
            RawTok::While => Tok::While,
            RawTok::For => Tok::For,
            RawTok::In => Tok::In,
            RawTok::Break => Tok::Break,
            RawTok::Continue => Tok::Continue,
            RawTok::Return => Tok::Return,
            RawTok::Try => Tok::Try,
            RawTok::Catch => Tok::Catch,
            RawTok::Finally => Tok::Finally,
            RawTok::Throw => Tok::Throw,
            RawTok::Match => Tok::Match,
            RawTok::Case => Tok::Case,
            RawTok::Default => Tok::Default,
            RawTok::Struct => Tok::Struct,
            RawTok::Enum => Tok::Enum,
            RawTok::Class => Tok::Class,
            RawTok::Extern => Tok::Extern,
            RawTok::From => Tok::From,
            RawTok::As => Tok::As,
            RawTok::Import => Tok::Import,
            RawTok::Variadic => Tok::Variadic,
            RawTok::Fn => Tok::Fn,
            RawTok::Super => Tok::Super,
            RawTok::And => Tok::And,
            RawTok::Or => Tok::Or,
            RawTok::Not => Tok::Not,
            RawTok::True => Tok::True,
            RawTok::False => Tok::False,
            RawTok::Null => Tok::Null,
            RawTok::LParen => {
                depth += 1;
                Tok::LParen
            }
            RawTok::RParen => {
                depth = depth.saturating_sub(1);
                Tok::RParen
            }
            RawTok::LBracket => {
                depth += 1;
                Tok::LBracket
            }
            RawTok::RBracket => {
                depth = depth.saturating_sub(1);
                Tok::RBracket
            }
            RawTok::LBrace => {
                depth += 1;
                Tok::LBrace
            }
            RawTok::RBrace => {
                depth = depth.saturating_sub(1);
                Tok::RBrace
            }
            RawTok::Comma => Tok::Comma,
            RawTok::Colon => Tok::Colon,
            RawTok::Semi => Tok::Semi,
            RawTok::Dot => Tok::Dot,
            RawTok::Arrow => Tok::Arrow,
            RawTok::Assign => Tok::Assign,
            RawTok::EqEq => Tok::EqEq,
            RawTok::NotEq => Tok::NotEq,
            RawTok::Lt => Tok::Lt,
            RawTok::Le => Tok::Le,
            RawTok::Gt => Tok::Gt,
            RawTok::Ge => Tok::Ge,
            RawTok::Plus => Tok::Plus,
            RawTok::Minus => Tok::Minus,
            RawTok::Star => Tok::Star,
            RawTok::Slash => Tok::Slash,
            RawTok::Percent => Tok::Percent,
            RawTok::Amp => Tok::Amp,
            RawTok::Pipe => Tok::Pipe,
            RawTok::Caret => Tok::Caret,
            RawTok::Shl => Tok::Shl,
            RawTok::Shr => Tok::Shr,
            RawTok::Tilde => Tok::Tilde,
            RawTok::NewlineWs => unreachable!(),
        };
        out.push(SpannedTok { tok: cooked, line });
    }

    if !out.is_empty() && !matches!(out.last().map(|t| &t.tok), Some(Tok::Newline)) {
        out.push(SpannedTok {
            tok: Tok::Newline,
            line,
        });
    }
    while indents.len() > 1 {
        indents.pop();
        out.push(SpannedTok {
            tok: Tok::Dedent,
            line,
        });
    }
    out.push(SpannedTok {
        tok: Tok::Eof,
        line,
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        lex(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_simple_line() {
        assert_eq!(
            toks("let x: int = 1"),
            vec![
                Tok::Let,
                Tok::Ident("x".into()),
                Tok::Colon,
                Tok::Ident("int".into()),
                Tok::Assign,
                Tok::Int(1),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_indent_dedent() {
        let t = toks("if x:\n    y = 1\nz = 2\n");
        assert!(t.contains(&Tok::Indent));
        assert!(t.contains(&Tok::Dedent));
        let indent_pos = t.iter().position(|t| *t == Tok::Indent).unwrap();
        let dedent_pos = t.iter().position(|t| *t == Tok::Dedent).unwrap();
        assert!(indent_pos < dedent_pos);
    }

    #[test]
    fn test_blank_and_comment_lines_ignored() {
        let t = toks("a = 1\n\n# comment\n\nb = 2\n");
        assert!(!t.contains(&Tok::Indent));
        let newlines = t.iter().filter(|t| **t == Tok::Newline).count();
        assert_eq!(newlines, 2);
    }

    #[test]
    fn test_bracket_continuation_suppresses_layout() {
        let t = toks("a = [1,\n    2,\n    3]\n");
        assert!(!t.contains(&Tok::Indent));
        assert_eq!(t.iter().filter(|t| **t == Tok::Newline).count(), 1);
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            toks(r#"s = "a\n\"b\"""#)[2],
            Tok::Str("a\n\"b\"".to_string())
        );
    }

    #[test]
    fn test_hex_literal() {
        assert_eq!(toks("x = 0xff")[2], Tok::Int(255));
    }

    #[test]
    fn test_fstring_keeps_raw_body() {
        assert_eq!(toks(r#"s = f"n = {n}""#)[2], Tok::FStr("n = {n}".into()));
    }

    #[test]
    fn test_bad_dedent_is_error() {
        let err = lex("if x:\n    y = 1\n  z = 2\n").unwrap_err();
        assert!(matches!(err, ParseError::BadIndent { line: 3 }));
    }

    #[test]
    fn test_line_numbers() {
        let t = lex("a = 1\nb = 2\n").unwrap();
        let b = t
            .iter()
            .find(|t| t.tok == Tok::Ident("b".into()))
            .unwrap();
        assert_eq!(b.line, 2);
    }
}
