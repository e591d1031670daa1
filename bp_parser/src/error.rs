//! Parse error types. Every error is keyed by a 1-based source line.

use thiserror::Error;

/// Parse error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("line {line}: unexpected token '{found}', expected {expected}")]
    UnexpectedToken {
        found: String,
        expected: String,
        line: u32,
    },

    #[error("line {line}: unexpected end of input, expected {expected}")]
    UnexpectedEof { expected: String, line: u32 },

    #[error("line {line}: unrecognized character")]
    LexerError { line: u32 },

    #[error("line {line}: invalid number literal '{literal}'")]
    InvalidNumber { literal: String, line: u32 },

    #[error("line {line}: invalid escape sequence '\\{sequence}'")]
    InvalidEscape { sequence: char, line: u32 },

    #[error("line {line}: inconsistent indentation")]
    BadIndent { line: u32 },

    #[error("line {line}: unterminated expression in format string")]
    UnterminatedFStringExpr { line: u32 },

    #[error("line {line}: {message}")]
    InvalidSyntax { message: String, line: u32 },
}

impl ParseError {
    pub fn line(&self) -> u32 {
        match self {
            ParseError::UnexpectedToken { line, .. }
            | ParseError::UnexpectedEof { line, .. }
            | ParseError::LexerError { line }
            | ParseError::InvalidNumber { line, .. }
            | ParseError::InvalidEscape { line, .. }
            | ParseError::BadIndent { line }
            | ParseError::UnterminatedFStringExpr { line }
            | ParseError::InvalidSyntax { line, .. } => *line,
        }
    }
}

pub type ParseResult<T> = Result<T, ParseError>;
