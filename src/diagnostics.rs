//!
//! # Stencil Diagnostics
//!
//! This module defines the unified, `miette`-based diagnostic type for the
//! Stencil engine. Every stage of the pipeline (preprocessing, lexing,
//! filtering, parsing, compiling, rendering) reports failures through
//! [`TemplateError`].
//!
//! # Error Construction Macros
//!
//! - **Use `err_msg!` for message-only errors.**
//!   - `err_msg!(Configuration, "tag '{}' is owned twice", tag)`
//!
//! - **Use `err_ctx!` when the source line is known.**
//!   - `err_ctx!(Syntax, line, "unexpected '{}'", found)`
//!
//! The template name and source text are attached once, at the pipeline
//! boundary, with [`TemplateError::with_template`]. Stages never need to carry
//! the full source around just to build an error.

use std::fmt;
use std::sync::Arc;

use miette::{Diagnostic, LabeledSpan, NamedSource, SourceCode, SourceSpan};
use thiserror::Error;

/// Constructs a [`TemplateError`] variant with a formatted message and no context.
#[macro_export]
macro_rules! err_msg {
    ($variant:ident, $($arg:tt)+) => {
        $crate::TemplateError::$variant {
            message: format!($($arg)+),
            ctx: $crate::ErrorContext::none(),
            source: None,
        }
    };
}

/// Constructs a [`TemplateError`] variant attributed to a source line.
#[macro_export]
macro_rules! err_ctx {
    ($variant:ident, $line:expr, $($arg:tt)+) => {
        $crate::TemplateError::$variant {
            message: format!($($arg)+),
            ctx: $crate::ErrorContext::at_line($line),
            source: None,
        }
    };
}

// Type aliases for clarity and brevity
pub type SourceArc = Arc<NamedSource<String>>;
pub type BoxedCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Type-safe error classification corresponding to [`TemplateError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    /// Malformed source, unknown tags, unbalanced delimiters.
    Syntax,
    /// A preprocessing hook failed before lexing began.
    Preprocess,
    /// Render-time failure, including extension method calls.
    Runtime,
    /// An imported name could not be resolved when the template was loaded.
    Import,
    /// Invalid environment configuration (tag collisions, unknown extensions).
    Configuration,
    /// Filesystem failures in the CLI and config loaders.
    Io,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Syntax => "syntax",
            ErrorType::Preprocess => "preprocess",
            ErrorType::Runtime => "runtime",
            ErrorType::Import => "import",
            ErrorType::Configuration => "configuration",
            ErrorType::Io => "io",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where an error happened and how to help.
#[derive(Debug, Default, Clone)]
pub struct ErrorContext {
    /// Template name, when the failing source had one.
    pub name: Option<String>,
    /// 1-based source line.
    pub line: Option<u32>,
    /// The source text, for labelled diagnostics.
    pub source: Option<SourceArc>,
    /// An optional help message.
    pub help: Option<String>,
}

impl ErrorContext {
    /// Returns an empty error context.
    pub fn none() -> Self {
        Self::default()
    }

    /// Creates a context pointing at a source line.
    pub fn at_line(line: u32) -> Self {
        Self {
            line: Some(line),
            ..Self::default()
        }
    }

    fn location(&self) -> String {
        match (&self.name, self.line) {
            (Some(name), Some(line)) => format!(" (in '{}', line {})", name, line),
            (None, Some(line)) => format!(" (line {})", line),
            (Some(name), None) => format!(" (in '{}')", name),
            (None, None) => String::new(),
        }
    }

    /// Byte span of the context's line within its source, if both are known.
    fn line_span(&self) -> Option<SourceSpan> {
        let line = self.line? as usize;
        let source = self.source.as_ref()?;
        let text = source.inner();
        let start = text
            .split_inclusive('\n')
            .take(line.saturating_sub(1))
            .map(str::len)
            .sum::<usize>();
        if start > text.len() {
            return None;
        }
        let len = text[start..].find('\n').unwrap_or(text.len() - start);
        Some(SourceSpan::new(start.into(), len.max(1).min(text.len() - start)))
    }
}

/// Unified error type for all Stencil failure modes.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("syntax error: {message}{}", .ctx.location())]
    Syntax {
        message: String,
        ctx: ErrorContext,
        #[source]
        source: Option<BoxedCause>,
    },
    #[error("preprocess error: {message}{}", .ctx.location())]
    Preprocess {
        message: String,
        ctx: ErrorContext,
        #[source]
        source: Option<BoxedCause>,
    },
    #[error("runtime error: {message}{}", .ctx.location())]
    Runtime {
        message: String,
        ctx: ErrorContext,
        #[source]
        source: Option<BoxedCause>,
    },
    #[error("import error: {message}{}", .ctx.location())]
    Import {
        message: String,
        ctx: ErrorContext,
        #[source]
        source: Option<BoxedCause>,
    },
    #[error("configuration error: {message}")]
    Configuration {
        message: String,
        ctx: ErrorContext,
        #[source]
        source: Option<BoxedCause>,
    },
    #[error("io error: {message}")]
    Io {
        message: String,
        ctx: ErrorContext,
        #[source]
        source: Option<BoxedCause>,
    },
}

impl TemplateError {
    fn ctx(&self) -> &ErrorContext {
        match self {
            TemplateError::Syntax { ctx, .. }
            | TemplateError::Preprocess { ctx, .. }
            | TemplateError::Runtime { ctx, .. }
            | TemplateError::Import { ctx, .. }
            | TemplateError::Configuration { ctx, .. }
            | TemplateError::Io { ctx, .. } => ctx,
        }
    }

    fn ctx_mut(&mut self) -> &mut ErrorContext {
        match self {
            TemplateError::Syntax { ctx, .. }
            | TemplateError::Preprocess { ctx, .. }
            | TemplateError::Runtime { ctx, .. }
            | TemplateError::Import { ctx, .. }
            | TemplateError::Configuration { ctx, .. }
            | TemplateError::Io { ctx, .. } => ctx,
        }
    }

    /// The bare message, without location.
    pub fn message(&self) -> &str {
        match self {
            TemplateError::Syntax { message, .. }
            | TemplateError::Preprocess { message, .. }
            | TemplateError::Runtime { message, .. }
            | TemplateError::Import { message, .. }
            | TemplateError::Configuration { message, .. }
            | TemplateError::Io { message, .. } => message,
        }
    }

    /// Returns the type-safe error classification for this error.
    pub fn error_type(&self) -> ErrorType {
        match self {
            TemplateError::Syntax { .. } => ErrorType::Syntax,
            TemplateError::Preprocess { .. } => ErrorType::Preprocess,
            TemplateError::Runtime { .. } => ErrorType::Runtime,
            TemplateError::Import { .. } => ErrorType::Import,
            TemplateError::Configuration { .. } => ErrorType::Configuration,
            TemplateError::Io { .. } => ErrorType::Io,
        }
    }

    /// Source line the error is attributed to, if any.
    pub fn line(&self) -> Option<u32> {
        self.ctx().line
    }

    /// Template name the error is attributed to, if any.
    pub fn template_name(&self) -> Option<&str> {
        self.ctx().name.as_deref()
    }

    /// Attributes the error to a line unless it already carries one.
    pub fn with_line(mut self, line: u32) -> Self {
        let ctx = self.ctx_mut();
        if ctx.line.is_none() {
            ctx.line = Some(line);
        }
        self
    }

    /// Attaches a help message.
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.ctx_mut().help = Some(help.into());
        self
    }

    /// Attaches the chained cause.
    pub fn with_cause(mut self, cause: impl Into<BoxedCause>) -> Self {
        match &mut self {
            TemplateError::Syntax { source, .. }
            | TemplateError::Preprocess { source, .. }
            | TemplateError::Runtime { source, .. }
            | TemplateError::Import { source, .. }
            | TemplateError::Configuration { source, .. }
            | TemplateError::Io { source, .. } => *source = Some(cause.into()),
        }
        self
    }

    /// Attributes the error to a template name unless it already carries one.
    pub fn with_name(mut self, name: Option<&str>) -> Self {
        let ctx = self.ctx_mut();
        if ctx.name.is_none() {
            ctx.name = name.map(str::to_string);
        }
        self
    }

    /// Attaches template name and source text, keeping any already present.
    pub fn with_template(mut self, name: Option<&str>, source: &str) -> Self {
        let ctx = self.ctx_mut();
        if ctx.name.is_none() {
            ctx.name = name.map(str::to_string);
        }
        if ctx.source.is_none() {
            let label = name.unwrap_or("<string>");
            ctx.source = Some(to_error_source(label, source));
        }
        self
    }
}

impl Diagnostic for TemplateError {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new(format!("stencil::{}", self.error_type())))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        self.ctx()
            .help
            .as_ref()
            .map(|h| Box::new(h) as Box<dyn fmt::Display + 'a>)
    }

    fn source_code(&self) -> Option<&dyn SourceCode> {
        self.ctx()
            .source
            .as_ref()
            .map(|s| s.as_ref() as &dyn SourceCode)
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = LabeledSpan> + '_>> {
        let span = self.ctx().line_span()?;
        let label = LabeledSpan::new_with_span(Some(self.message().to_string()), span);
        Some(Box::new(std::iter::once(label)))
    }
}

impl From<std::io::Error> for TemplateError {
    fn from(err: std::io::Error) -> Self {
        let message = err.to_string();
        err_msg!(Io, "{}", message).with_cause(err)
    }
}

/// Converts a source string into an `Arc<NamedSource<String>>` for use in error contexts.
pub fn to_error_source(name: &str, source: &str) -> SourceArc {
    Arc::new(NamedSource::new(name, source.to_string()))
}

#[cfg(test)]
mod diagnostics_tests {
    use miette::Report;

    use super::*;

    #[test]
    fn test_location_in_display() {
        let err = err_ctx!(Syntax, 3, "unexpected '{}'", "}");
        assert_eq!(err.to_string(), "syntax error: unexpected '}' (line 3)");
        assert_eq!(err.line(), Some(3));
        assert_eq!(err.error_type(), ErrorType::Syntax);
    }

    #[test]
    fn test_with_template_labels_the_line() {
        let err = err_ctx!(Syntax, 2, "Encountered unknown tag 'nope'.")
            .with_template(Some("page.txt"), "first\n{% nope %}\nthird");
        let report = Report::new(err);
        let output = format!("{report:?}");
        assert!(output.contains("unknown tag 'nope'"));
        assert!(output.contains("page.txt"));
    }

    #[test]
    fn test_with_line_keeps_existing_line() {
        let err = err_ctx!(Runtime, 4, "boom").with_line(9);
        assert_eq!(err.line(), Some(4));
        let err = err_msg!(Runtime, "boom").with_line(9);
        assert_eq!(err.line(), Some(9));
    }

    #[test]
    fn test_error_chaining() {
        let cause = err_ctx!(Syntax, 1, "inner");
        let err = err_msg!(Preprocess, "outer").with_cause(cause);
        let report = Report::new(err);
        let output = format!("{report:?}");
        assert!(output.contains("outer"));
        assert!(output.contains("inner"));
    }
}
