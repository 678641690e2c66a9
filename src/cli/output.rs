//! Handles all user-facing output for the CLI.
//!
//! Token dumps and check summaries are colorized when stdout is a terminal;
//! errors are rendered as `miette` reports on stderr.

use std::io::Write;

use miette::Report;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use crate::syntax::{Token, TokenKind};
use crate::TemplateError;

// ============================================================================
// STREAMS
// ============================================================================

fn color_choice(stream: atty::Stream) -> ColorChoice {
    if atty::is(stream) {
        ColorChoice::Auto
    } else {
        ColorChoice::Never
    }
}

pub fn stdout() -> StandardStream {
    StandardStream::stdout(color_choice(atty::Stream::Stdout))
}

fn stderr() -> StandardStream {
    StandardStream::stderr(color_choice(atty::Stream::Stderr))
}

fn kind_color(kind: TokenKind) -> Color {
    match kind {
        TokenKind::Data => Color::White,
        TokenKind::VariableBegin
        | TokenKind::VariableEnd
        | TokenKind::BlockBegin
        | TokenKind::BlockEnd => Color::Magenta,
        TokenKind::Name => Color::Cyan,
        TokenKind::String | TokenKind::Integer | TokenKind::Float => Color::Green,
        TokenKind::Eof => Color::Red,
        _ => Color::Yellow,
    }
}

// ============================================================================
// CORE OUTPUT FUNCTIONS
// ============================================================================

/// Prints one token per line: line number, kind, and value when present.
pub fn print_token(out: &mut impl WriteColor, token: &Token) -> std::io::Result<()> {
    write!(out, "{:>4}  ", token.line)?;
    out.set_color(ColorSpec::new().set_fg(Some(kind_color(token.kind))).set_bold(true))?;
    write!(out, "{:<14}", token.kind.as_str())?;
    out.reset()?;
    match &token.value {
        Some(value) => writeln!(out, " {:?}", value),
        None => writeln!(out),
    }
}

/// Prints a per-file check result.
pub fn print_check_result(out: &mut impl WriteColor, path: &str, ok: bool) -> std::io::Result<()> {
    let (label, color) = if ok { ("ok", Color::Green) } else { ("FAIL", Color::Red) };
    out.set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true))?;
    write!(out, "{:>4}", label)?;
    out.reset()?;
    writeln!(out, "  {}", path)
}

/// Prints the closing line of `check`.
pub fn print_check_summary(out: &mut impl WriteColor, checked: usize, failed: usize) -> std::io::Result<()> {
    let color = if failed == 0 { Color::Green } else { Color::Red };
    out.set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true))?;
    writeln!(out, "{} checked, {} failed", checked, failed)?;
    out.reset()
}

/// Renders an error as a miette report on stderr.
pub fn print_error(error: TemplateError) {
    let report = Report::new(error);
    let mut err = stderr();
    if writeln!(err, "{:?}", report).is_err() {
        eprintln!("{}", report);
    }
}

#[cfg(test)]
mod output_tests {
    use termcolor::NoColor;

    use super::*;

    #[test]
    fn test_print_token_without_color() {
        let mut out = NoColor::new(Vec::new());
        print_token(&mut out, &Token::valued(3, TokenKind::Name, "foo")).unwrap();
        print_token(&mut out, &Token::bare(3, TokenKind::Eof)).unwrap();
        let text = String::from_utf8(out.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0].trim_end(), "   3  name           \"foo\"");
        assert_eq!(lines[1].trim_end(), "   3  eof");
    }
}
