//! Stencil Lexer
//!
//! Converts template source into a lazy, finite sequence of [`Token`]s. The
//! lexer is a pull iterator: each call to `next()` scans only as far as the
//! next token, so a filter chain wrapped around it never forces the whole
//! template into memory.
//!
//! Line numbers are counted from every newline consumed, including those
//! inside data spans, string literals, comments and stripped whitespace.

use std::collections::VecDeque;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::syntax::{count_newlines, Token, TokenKind};
use crate::TemplateError;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*").expect("name pattern is valid"));
static NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+(\.\d+)?").expect("number pattern is valid"));

/// Two-character operators, checked before single characters.
const OPERATORS_2: &[(&str, TokenKind)] = &[
    ("//", TokenKind::FloorDiv),
    ("**", TokenKind::Pow),
    ("==", TokenKind::Eq),
    ("!=", TokenKind::Ne),
    ("<=", TokenKind::LtEq),
    (">=", TokenKind::GtEq),
];

const OPERATORS_1: &[(char, TokenKind)] = &[
    ('+', TokenKind::Add),
    ('-', TokenKind::Sub),
    ('*', TokenKind::Mul),
    ('/', TokenKind::Div),
    ('%', TokenKind::Mod),
    ('~', TokenKind::Tilde),
    ('=', TokenKind::Assign),
    ('<', TokenKind::Lt),
    ('>', TokenKind::Gt),
    ('.', TokenKind::Dot),
    (',', TokenKind::Comma),
    (':', TokenKind::Colon),
    ('|', TokenKind::Pipe),
    ('(', TokenKind::LParen),
    (')', TokenKind::RParen),
    ('[', TokenKind::LBracket),
    (']', TokenKind::RBracket),
    ('{', TokenKind::LBrace),
    ('}', TokenKind::RBrace),
];

/// Lexer behaviour switches, taken from the environment configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LexerOptions {
    /// Drop the first newline after a block tag.
    pub trim_blocks: bool,
    /// Keep a single trailing newline at the end of the source.
    pub keep_trailing_newline: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Variable,
    Block,
}

impl TagKind {
    fn end_delimiter(&self) -> &'static str {
        match self {
            TagKind::Variable => "}}",
            TagKind::Block => "%}",
        }
    }

    fn end_token(&self) -> TokenKind {
        match self {
            TagKind::Variable => TokenKind::VariableEnd,
            TagKind::Block => TokenKind::BlockEnd,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    Tag(TagKind),
    Done,
}

/// Lazy tokenizer over a borrowed source string.
pub struct Lexer<'s> {
    source: &'s str,
    pos: usize,
    line: u32,
    state: State,
    pending: VecDeque<Token>,
    /// Open brackets inside the current tag, with the line they opened on.
    balance: Vec<(char, u32)>,
    lstrip_next: bool,
    options: LexerOptions,
}

/// Creates a fresh lexer; every call restarts from the top of `source`.
pub fn tokenize(source: &str, options: LexerOptions) -> Lexer<'_> {
    Lexer::new(source, options)
}

impl<'s> Lexer<'s> {
    pub fn new(source: &'s str, options: LexerOptions) -> Self {
        let source = if options.keep_trailing_newline {
            source
        } else {
            source
                .strip_suffix("\r\n")
                .or_else(|| source.strip_suffix('\n'))
                .unwrap_or(source)
        };
        Self {
            source,
            pos: 0,
            line: 1,
            state: State::Data,
            pending: VecDeque::new(),
            balance: Vec::new(),
            lstrip_next: false,
            options,
        }
    }

    fn rest(&self) -> &'s str {
        &self.source[self.pos..]
    }

    fn advance(&mut self, len: usize) -> &'s str {
        let text = &self.source[self.pos..self.pos + len];
        self.line += count_newlines(text);
        self.pos += len;
        text
    }

    fn fail(&mut self, line: u32, message: String) -> TemplateError {
        self.state = State::Done;
        self.pending.clear();
        err_ctx!(Syntax, line, "{}", message)
    }

    /// Finds the next `{{`, `{%` or `{#` at or after the current position.
    fn find_opening(&self) -> Option<(usize, char)> {
        let rest = self.rest();
        let mut offset = 0;
        while let Some(idx) = rest[offset..].find('{') {
            let at = offset + idx;
            match rest[at + 1..].chars().next() {
                Some(c @ ('{' | '%' | '#')) => return Some((at, c)),
                _ => offset = at + 1,
            }
        }
        None
    }

    /// Queues a data token for `raw`, applying whitespace control.
    fn push_data(&mut self, raw: &'s str, rstrip: bool) {
        let start_line = self.line;
        self.advance(raw.len());
        let mut text = raw;
        let mut line = start_line;
        if std::mem::take(&mut self.lstrip_next) {
            let trimmed = text.trim_start();
            line += count_newlines(&text[..text.len() - trimmed.len()]);
            text = trimmed;
        }
        if rstrip {
            text = text.trim_end();
        }
        if !text.is_empty() {
            self.pending
                .push_back(Token::valued(line, TokenKind::Data, text));
        }
    }

    fn lex_data(&mut self) -> Result<(), TemplateError> {
        let Some((at, kind)) = self.find_opening() else {
            let rest = self.rest();
            if !rest.is_empty() {
                self.push_data(rest, false);
            }
            self.state = State::Done;
            return Ok(());
        };

        let rest = self.rest();
        let strip_before = rest[at + 2..].starts_with('-');
        self.push_data(&rest[..at], strip_before);

        let opener_len = if strip_before { 3 } else { 2 };
        let line = self.line;
        match kind {
            '#' => {
                self.advance(opener_len);
                let body = self.rest();
                let Some(end) = body.find("#}") else {
                    return Err(self.fail(line, "missing end of comment tag".to_string()));
                };
                self.lstrip_next = body[..end].ends_with('-');
                self.advance(end + 2);
            }
            '{' => {
                self.advance(opener_len);
                self.pending
                    .push_back(Token::bare(line, TokenKind::VariableBegin));
                self.state = State::Tag(TagKind::Variable);
            }
            _ => {
                self.advance(opener_len);
                self.pending.push_back(Token::bare(line, TokenKind::BlockBegin));
                self.state = State::Tag(TagKind::Block);
            }
        }
        Ok(())
    }

    fn lex_tag(&mut self, tag: TagKind) -> Result<(), TemplateError> {
        let rest = self.rest();
        let ws = rest.len() - rest.trim_start().len();
        self.advance(ws);

        let rest = self.rest();
        let line = self.line;
        if rest.is_empty() {
            let message = match self.balance.last() {
                Some((open, opened)) => format!(
                    "unexpected end of template, '{}' opened on line {} was never closed",
                    open, opened
                ),
                None => format!(
                    "unexpected end of template, expected '{}'",
                    tag.end_delimiter()
                ),
            };
            return Err(self.fail(line, message));
        }

        if self.balance.is_empty() {
            let end = tag.end_delimiter();
            let stripped = rest.starts_with('-') && rest[1..].starts_with(end);
            if stripped || rest.starts_with(end) {
                self.advance(if stripped { 3 } else { 2 });
                self.pending.push_back(Token::bare(line, tag.end_token()));
                self.lstrip_next = stripped;
                if tag == TagKind::Block && !stripped && self.options.trim_blocks {
                    if self.rest().starts_with("\r\n") {
                        self.advance(2);
                    } else if self.rest().starts_with('\n') {
                        self.advance(1);
                    }
                }
                self.state = State::Data;
                return Ok(());
            }
        }

        if let Some(m) = NAME_RE.find(rest) {
            let name = self.advance(m.end());
            self.pending
                .push_back(Token::valued(line, TokenKind::Name, name));
            return Ok(());
        }

        if let Some(caps) = NUMBER_RE.captures(rest) {
            let kind = if caps.get(1).is_some() {
                TokenKind::Float
            } else {
                TokenKind::Integer
            };
            let len = caps.get(0).map_or(0, |m| m.end());
            let text = self.advance(len);
            self.pending.push_back(Token::valued(line, kind, text));
            return Ok(());
        }

        let first = rest.chars().next().unwrap_or_default();
        if first == '"' || first == '\'' {
            return self.lex_string(first, line);
        }

        for (op, kind) in OPERATORS_2 {
            if rest.starts_with(op) {
                self.advance(op.len());
                self.pending.push_back(Token::bare(line, *kind));
                return Ok(());
            }
        }

        let Some((_, kind)) = OPERATORS_1.iter().find(|(c, _)| *c == first) else {
            return Err(self.fail(line, format!("unexpected char '{}'", first)));
        };
        match first {
            '(' | '[' | '{' => self.balance.push((first, line)),
            ')' | ']' | '}' => {
                let expected = match self.balance.pop() {
                    Some(('(', _)) => ')',
                    Some(('[', _)) => ']',
                    Some(_) => '}',
                    None => {
                        return Err(self.fail(line, format!("unexpected '{}'", first)));
                    }
                };
                if expected != first {
                    return Err(self.fail(
                        line,
                        format!("unexpected '{}', expected '{}'", first, expected),
                    ));
                }
            }
            _ => {}
        }
        self.advance(first.len_utf8());
        self.pending.push_back(Token::bare(line, *kind));
        Ok(())
    }

    fn lex_string(&mut self, quote: char, line: u32) -> Result<(), TemplateError> {
        let rest = self.rest();
        let mut value = String::new();
        let mut chars = rest.char_indices().skip(1);
        while let Some((idx, c)) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, 'r')) => value.push('\r'),
                    Some((_, other)) => value.push(other),
                    None => break,
                },
                c if c == quote => {
                    self.advance(idx + c.len_utf8());
                    self.pending
                        .push_back(Token::valued(line, TokenKind::String, value));
                    return Ok(());
                }
                c => value.push(c),
            }
        }
        Err(self.fail(line, "unexpected end of string literal".to_string()))
    }
}

impl Iterator for Lexer<'_> {
    type Item = Result<Token, TemplateError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return Some(Ok(token));
            }
            let step = match self.state {
                State::Done => return None,
                State::Data => self.lex_data(),
                State::Tag(tag) => self.lex_tag(tag),
            };
            if let Err(err) = step {
                return Some(Err(err));
            }
        }
    }
}

#[cfg(test)]
mod lexer_tests {
    use super::*;

    fn kinds(source: &str) -> Vec<&'static str> {
        tokenize(source, LexerOptions::default())
            .map(|t| t.map(|t| t.kind.as_str()))
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn test_data_and_variable() {
        assert_eq!(
            kinds("Hello {{ name }}!"),
            vec!["data", "variable_begin", "name", "variable_end", "data"]
        );
    }

    #[test]
    fn test_lines_follow_newlines_in_data() {
        let tokens: Vec<Token> = tokenize("a\nb\n{{ x }}\n{% y %}", LexerOptions::default())
            .collect::<Result<_, _>>()
            .unwrap();
        let x = tokens.iter().find(|t| t.is_name("x")).unwrap();
        let y = tokens.iter().find(|t| t.is_name("y")).unwrap();
        assert_eq!(x.line, 3);
        assert_eq!(y.line, 4);
    }

    #[test]
    fn test_whitespace_control() {
        let tokens: Vec<Token> = tokenize("a  \n {%- x -%} \n b", LexerOptions::default())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(tokens[0].value_str(), "a");
        assert_eq!(tokens.last().unwrap().value_str(), "b");
        assert_eq!(tokens.last().unwrap().line, 3);
    }

    #[test]
    fn test_comments_are_skipped_but_counted() {
        let tokens: Vec<Token> = tokenize("{# one\ntwo #}{{ x }}", LexerOptions::default())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(tokens[0].kind, TokenKind::VariableBegin);
        assert_eq!(tokens[0].line, 2);
    }

    #[test]
    fn test_mismatched_brackets_fail_with_line() {
        let err = tokenize("\n{{ foo(] }}", LexerOptions::default())
            .collect::<Result<Vec<_>, _>>()
            .unwrap_err();
        assert_eq!(err.line(), Some(2));
        assert!(err.message().contains("expected ')'"));
    }

    #[test]
    fn test_trailing_newline_is_dropped_by_default() {
        let tokens: Vec<Token> = tokenize("x\n", LexerOptions::default())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(tokens[0].value_str(), "x");
        let keep = LexerOptions {
            keep_trailing_newline: true,
            ..LexerOptions::default()
        };
        let tokens: Vec<Token> = tokenize("x\n", keep).collect::<Result<_, _>>().unwrap();
        assert_eq!(tokens[0].value_str(), "x\n");
    }
}
