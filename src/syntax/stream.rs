//! Token streams.
//!
//! [`TokenIter`] is the pull interface shared by the lexer and every stream
//! filter: a boxed iterator of `Result<Token, TemplateError>`. Filters wrap
//! the iterator they receive, so the chain stays lazy end to end.
//!
//! [`TokenStream`] is the parser-side cursor over the final iterator. It keeps
//! the current token plus a small push-back queue for lookahead and
//! synthesizes a single `eof` token once the upstream iterator is exhausted.

use std::collections::VecDeque;

use crate::syntax::{Token, TokenKind};
use crate::TemplateError;

/// A lazy, pull-based token sequence.
pub type TokenIter<'s> = Box<dyn Iterator<Item = Result<Token, TemplateError>> + 's>;

/// Cursor over a [`TokenIter`] used by the parser and extension parse hooks.
pub struct TokenStream<'s> {
    upstream: TokenIter<'s>,
    current: Token,
    pushed: VecDeque<Token>,
    exhausted: bool,
}

impl<'s> TokenStream<'s> {
    /// Wraps `upstream` and pulls the first token.
    pub fn new(upstream: TokenIter<'s>) -> Result<Self, TemplateError> {
        let mut stream = Self {
            upstream,
            current: Token::bare(1, TokenKind::Eof),
            pushed: VecDeque::new(),
            exhausted: false,
        };
        stream.current = stream.pull()?;
        Ok(stream)
    }

    fn pull(&mut self) -> Result<Token, TemplateError> {
        if let Some(token) = self.pushed.pop_front() {
            return Ok(token);
        }
        if !self.exhausted {
            match self.upstream.next() {
                Some(item) => return item,
                None => self.exhausted = true,
            }
        }
        Ok(Token::bare(self.current.line, TokenKind::Eof))
    }

    /// The token under the cursor.
    pub fn current(&self) -> &Token {
        &self.current
    }

    /// True once the cursor sits on the synthesized end-of-stream token.
    pub fn is_eof(&self) -> bool {
        self.current.kind == TokenKind::Eof
    }

    /// Returns the current token and advances the cursor by one.
    pub fn next_token(&mut self) -> Result<Token, TemplateError> {
        if self.is_eof() {
            return Ok(self.current.clone());
        }
        let next = self.pull()?;
        Ok(std::mem::replace(&mut self.current, next))
    }

    /// Peeks at the token after the current one.
    pub fn look(&mut self) -> Result<&Token, TemplateError> {
        if self.pushed.is_empty() {
            let next = self.pull()?;
            self.pushed.push_back(next);
        }
        Ok(&self.pushed[0])
    }

    /// Queues a token to be read after the current one.
    pub fn push(&mut self, token: Token) {
        self.pushed.push_back(token);
    }

    /// Advances past the current token if it matches `expr`.
    pub fn next_if(&mut self, expr: &str) -> Result<Option<Token>, TemplateError> {
        if self.current.test(expr) {
            self.next_token().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Like [`next_if`](Self::next_if) but only reports whether it advanced.
    pub fn skip_if(&mut self, expr: &str) -> Result<bool, TemplateError> {
        Ok(self.next_if(expr)?.is_some())
    }

    /// Consumes the current token, failing unless it matches `expr`.
    pub fn expect(&mut self, expr: &str) -> Result<Token, TemplateError> {
        if self.current.test(expr) {
            return self.next_token();
        }
        let expected = match expr.split_once(':') {
            Some((_, value)) => format!("'{}'", value),
            None => expr.to_string(),
        };
        let line = self.current.line;
        if self.is_eof() {
            return Err(err_ctx!(
                Syntax,
                line,
                "unexpected end of template, expected {}",
                expected
            ));
        }
        Err(err_ctx!(
            Syntax,
            line,
            "expected token {}, got {}",
            expected,
            self.current.describe()
        ))
    }
}

impl std::fmt::Debug for TokenStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream")
            .field("current", &self.current)
            .field("pushed", &self.pushed)
            .finish_non_exhaustive()
    }
}
