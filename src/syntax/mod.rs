//! Syntax module for Stencil templates.
//!
//! Provides the lexical unit ([`Token`]), the lazy [`lexer`], and the
//! [`stream`] types that carry tokens through the filter chain into the parser.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod lexer;
pub mod stream;

pub use lexer::{tokenize, Lexer, LexerOptions};
pub use stream::{TokenIter, TokenStream};

/// The kind tag of a [`Token`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Data,
    VariableBegin,
    VariableEnd,
    BlockBegin,
    BlockEnd,
    Name,
    String,
    Integer,
    Float,
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    Tilde,
    Assign,
    Eq,
    Ne,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Dot,
    Comma,
    Colon,
    Pipe,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Eof,
}

impl TokenKind {
    /// The string tag used in diagnostics and token dumps.
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Data => "data",
            TokenKind::VariableBegin => "variable_begin",
            TokenKind::VariableEnd => "variable_end",
            TokenKind::BlockBegin => "block_begin",
            TokenKind::BlockEnd => "block_end",
            TokenKind::Name => "name",
            TokenKind::String => "string",
            TokenKind::Integer => "integer",
            TokenKind::Float => "float",
            TokenKind::Add => "add",
            TokenKind::Sub => "sub",
            TokenKind::Mul => "mul",
            TokenKind::Div => "div",
            TokenKind::FloorDiv => "floordiv",
            TokenKind::Mod => "mod",
            TokenKind::Pow => "pow",
            TokenKind::Tilde => "tilde",
            TokenKind::Assign => "assign",
            TokenKind::Eq => "eq",
            TokenKind::Ne => "ne",
            TokenKind::Lt => "lt",
            TokenKind::LtEq => "lteq",
            TokenKind::Gt => "gt",
            TokenKind::GtEq => "gteq",
            TokenKind::Dot => "dot",
            TokenKind::Comma => "comma",
            TokenKind::Colon => "colon",
            TokenKind::Pipe => "pipe",
            TokenKind::LParen => "lparen",
            TokenKind::RParen => "rparen",
            TokenKind::LBracket => "lbracket",
            TokenKind::RBracket => "rbracket",
            TokenKind::LBrace => "lbrace",
            TokenKind::RBrace => "rbrace",
            TokenKind::Eof => "eof",
        }
    }

    /// Human readable description, used in "expected X" messages.
    pub fn describe(&self) -> &'static str {
        match self {
            TokenKind::Data => "template data",
            TokenKind::VariableBegin => "begin of print statement",
            TokenKind::VariableEnd => "end of print statement",
            TokenKind::BlockBegin => "begin of statement block",
            TokenKind::BlockEnd => "end of statement block",
            TokenKind::Name => "name",
            TokenKind::String => "string literal",
            TokenKind::Integer | TokenKind::Float => "number",
            TokenKind::Add => "'+'",
            TokenKind::Sub => "'-'",
            TokenKind::Mul => "'*'",
            TokenKind::Div => "'/'",
            TokenKind::FloorDiv => "'//'",
            TokenKind::Mod => "'%'",
            TokenKind::Pow => "'**'",
            TokenKind::Tilde => "'~'",
            TokenKind::Assign => "'='",
            TokenKind::Eq => "'=='",
            TokenKind::Ne => "'!='",
            TokenKind::Lt => "'<'",
            TokenKind::LtEq => "'<='",
            TokenKind::Gt => "'>'",
            TokenKind::GtEq => "'>='",
            TokenKind::Dot => "'.'",
            TokenKind::Comma => "','",
            TokenKind::Colon => "':'",
            TokenKind::Pipe => "'|'",
            TokenKind::LParen => "'('",
            TokenKind::RParen => "')'",
            TokenKind::LBracket => "'['",
            TokenKind::RBracket => "']'",
            TokenKind::LBrace => "'{'",
            TokenKind::RBrace => "'}'",
            TokenKind::Eof => "end of template",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable unit of lexical output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub value: Option<String>,
    /// 1-based source line the token starts on.
    pub line: u32,
}

impl Token {
    pub fn new(line: u32, kind: TokenKind, value: Option<String>) -> Self {
        Self { kind, value, line }
    }

    /// A token without a value (delimiters, operators, `eof`).
    pub fn bare(line: u32, kind: TokenKind) -> Self {
        Self::new(line, kind, None)
    }

    /// A token carrying a value (data, names, literals).
    pub fn valued(line: u32, kind: TokenKind, value: impl Into<String>) -> Self {
        Self::new(line, kind, Some(value.into()))
    }

    /// The token's value, or the empty string.
    pub fn value_str(&self) -> &str {
        self.value.as_deref().unwrap_or("")
    }

    /// True for a `name` token with exactly this value.
    pub fn is_name(&self, name: &str) -> bool {
        self.kind == TokenKind::Name && self.value.as_deref() == Some(name)
    }

    /// Tests against an expression of the form `kind` or `kind:value`,
    /// e.g. `"name:endfor"`.
    pub fn test(&self, expr: &str) -> bool {
        match expr.split_once(':') {
            Some((kind, value)) => {
                self.kind.as_str() == kind && self.value.as_deref() == Some(value)
            }
            None => self.kind.as_str() == expr,
        }
    }

    /// Tests against any of the given expressions.
    pub fn test_any(&self, exprs: &[&str]) -> bool {
        exprs.iter().any(|e| self.test(e))
    }

    /// Human readable description for error messages.
    pub fn describe(&self) -> String {
        match (&self.kind, &self.value) {
            (TokenKind::Name, Some(v)) => format!("'{}'", v),
            (TokenKind::String, Some(v)) => format!("string \"{}\"", v),
            (TokenKind::Integer | TokenKind::Float, Some(v)) => format!("number {}", v),
            (kind, _) => kind.describe().to_string(),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}:{} {:?}", self.line, self.kind, v),
            None => write!(f, "{}:{}", self.line, self.kind),
        }
    }
}

/// Counts newline characters, the unit of line attribution.
pub fn count_newlines(text: &str) -> u32 {
    text.bytes().filter(|b| *b == b'\n').count() as u32
}
