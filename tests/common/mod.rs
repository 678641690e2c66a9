//! # Stencil Test Support
//!
//! Extensions and helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use regex::Regex;
use stencil::ast::{Expr, ExprNode, Stmt, StmtNode};
use stencil::syntax::count_newlines;
use stencil::{
    err_msg, CallState, Environment, EnvironmentId, Extension, ExtensionSpec, Kwargs, Parser,
    TemplateError, Token, TokenIter, TokenKind, Value,
};

/// Fully qualified name the example extension imports.
pub const IMPORTABLE: &str = "tests.importable_object";

static GETTEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)_\((.*?)\)").expect("gettext pattern is valid"));

/// Builds an environment or panics with the error.
pub fn env_with(specs: Vec<ExtensionSpec>) -> Environment {
    specs
        .into_iter()
        .fold(Environment::builder(), |builder, spec| builder.extension_spec(spec))
        .build()
        .unwrap_or_else(|err| panic!("environment failed to build: {err}"))
}

/// Compiles and renders `source` without variables.
pub fn render(env: &Environment, source: &str) -> String {
    env.from_string(source)
        .and_then(|template| template.render())
        .unwrap_or_else(|err| panic!("render failed: {err}"))
}

/// Collects every token the environment's pipeline yields for `source`.
pub fn tokens(env: &Environment, source: &str) -> Vec<Token> {
    env.tokenize(source)
        .collect::<Result<Vec<_>, _>>()
        .unwrap_or_else(|err| panic!("tokenize failed: {err}"))
}

// ============================================================================
// EXAMPLE EXTENSION: `{% test %}` exercising every extension-authored node
// ============================================================================

#[derive(Debug)]
pub struct ExampleExtension {
    environment: EnvironmentId,
}

impl Extension for ExampleExtension {
    fn new(environment: EnvironmentId) -> Self {
        Self { environment }
    }

    fn environment(&self) -> EnvironmentId {
        self.environment
    }

    fn tags(&self) -> &[&'static str] {
        &["test"]
    }

    fn attribute(&self, name: &str) -> Option<Value> {
        (name == "ext_attr").then(|| Value::from(42))
    }

    fn parse(&self, parser: &mut Parser<'_>) -> Result<Vec<StmtNode>, TemplateError> {
        let line = parser.stream().next_token()?.line;
        let call = self.call_method_node(
            "dump",
            vec![
                ExprNode::new(Expr::EnvironmentAttribute("sandboxed".to_string()), line),
                self.attr("ext_attr", line),
                ExprNode::new(Expr::ImportedName(IMPORTABLE.to_string()), line),
                ExprNode::new(Expr::ContextReference, line),
            ],
            Vec::new(),
            line,
        );
        Ok(vec![StmtNode::new(Stmt::Output(vec![call]), line)])
    }

    fn call_method(
        &self,
        method: &str,
        args: &[Value],
        _kwargs: &Kwargs,
        _state: &CallState<'_>,
    ) -> Result<Value, TemplateError> {
        match (method, args) {
            ("dump", [sandboxed, ext_attr, imported, Value::Context(context)]) => Ok(Value::String(
                format!("{}|{}|{}|{}", sandboxed, ext_attr, imported, context.blocks()),
            )),
            _ => Err(err_msg!(Runtime, "bad call to '{}'", method)),
        }
    }
}

/// The example extension's environment with its imported object registered.
pub fn example_env() -> Environment {
    Environment::builder()
        .extension::<ExampleExtension>()
        .import(IMPORTABLE, 23)
        .build()
        .unwrap_or_else(|err| panic!("environment failed to build: {err}"))
}

// ============================================================================
// PREPROCESSOR AND STREAM FILTER
// ============================================================================

#[derive(Debug)]
pub struct PreprocessorExtension {
    environment: EnvironmentId,
}

impl Extension for PreprocessorExtension {
    fn new(environment: EnvironmentId) -> Self {
        Self { environment }
    }

    fn environment(&self) -> EnvironmentId {
        self.environment
    }

    fn preprocess(
        &self,
        source: String,
        _name: Option<&str>,
        _filename: Option<&str>,
    ) -> Result<String, TemplateError> {
        Ok(source.replace("[[TEST]]", "({{ foo }})"))
    }
}

/// Rewrites `_(text)` inside template data into `{{ gettext("text") }}`.
#[derive(Debug)]
pub struct StreamFilterExtension {
    environment: EnvironmentId,
}

impl Extension for StreamFilterExtension {
    fn new(environment: EnvironmentId) -> Self {
        Self { environment }
    }

    fn environment(&self) -> EnvironmentId {
        self.environment
    }

    fn filter_stream<'s>(&'s self, stream: TokenIter<'s>) -> TokenIter<'s> {
        Box::new(stream.flat_map(|item| match item {
            Ok(token) if token.kind == TokenKind::Data => {
                interpolate(&token).into_iter().map(Ok).collect::<Vec<_>>()
            }
            other => vec![other],
        }))
    }
}

fn interpolate(token: &Token) -> Vec<Token> {
    let value = token.value_str();
    let mut out = Vec::new();
    let mut line = token.line;
    let mut pos = 0;
    for caps in GETTEXT_RE.captures_iter(value) {
        let whole = caps.get(0).expect("group 0 always matches");
        let preceding = &value[pos..whole.start()];
        if !preceding.is_empty() {
            out.push(Token::valued(line, TokenKind::Data, preceding));
        }
        line += count_newlines(preceding);
        out.push(Token::bare(line, TokenKind::VariableBegin));
        out.push(Token::valued(line, TokenKind::Name, "gettext"));
        out.push(Token::bare(line, TokenKind::LParen));
        out.push(Token::valued(line, TokenKind::String, &caps[1]));
        out.push(Token::bare(line, TokenKind::RParen));
        out.push(Token::bare(line, TokenKind::VariableEnd));
        pos = whole.end();
    }
    if pos < value.len() {
        out.push(Token::valued(line, TokenKind::Data, &value[pos..]));
    }
    out
}

/// `gettext` stand-in that upper-cases its argument.
pub fn upper_gettext() -> Value {
    Value::from_fn("gettext", |args| {
        Ok(Value::String(
            args.first().map(|v| v.to_string()).unwrap_or_default().to_uppercase(),
        ))
    })
}

// ============================================================================
// INSTRUMENTED EXTENSIONS
// ============================================================================

/// Appends a suffix in `preprocess` and records every hook it runs.
#[derive(Debug)]
pub struct Recorder {
    environment: EnvironmentId,
    identifier: &'static str,
    priority: i32,
    log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn spec(identifier: &'static str, priority: i32, log: Arc<Mutex<Vec<String>>>) -> ExtensionSpec {
        ExtensionSpec::from_fn(identifier, move |environment| {
            Arc::new(Recorder {
                environment,
                identifier,
                priority,
                log: Arc::clone(&log),
            }) as Arc<dyn Extension>
        })
    }

    fn record(&self, event: &str) {
        self.log
            .lock()
            .expect("log lock")
            .push(format!("{}:{}", event, self.identifier));
    }
}

impl Extension for Recorder {
    fn new(_environment: EnvironmentId) -> Self {
        unreachable!("built through Recorder::spec")
    }

    fn environment(&self) -> EnvironmentId {
        self.environment
    }

    fn identifier(&self) -> &'static str {
        self.identifier
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn preprocess(
        &self,
        source: String,
        _name: Option<&str>,
        _filename: Option<&str>,
    ) -> Result<String, TemplateError> {
        self.record("preprocess");
        Ok(format!("{}{}", source, self.identifier))
    }

    fn filter_stream<'s>(&'s self, stream: TokenIter<'s>) -> TokenIter<'s> {
        Box::new(stream.inspect(move |_| self.record("filter")))
    }
}

/// Counts how many tokens its filter stage pulls from upstream.
#[derive(Debug)]
pub struct PullCounter {
    environment: EnvironmentId,
    pulls: Arc<AtomicUsize>,
}

impl PullCounter {
    pub fn spec(pulls: Arc<AtomicUsize>) -> ExtensionSpec {
        ExtensionSpec::from_fn("tests.PullCounter", move |environment| {
            Arc::new(PullCounter {
                environment,
                pulls: Arc::clone(&pulls),
            }) as Arc<dyn Extension>
        })
    }
}

impl Extension for PullCounter {
    fn new(_environment: EnvironmentId) -> Self {
        unreachable!("built through PullCounter::spec")
    }

    fn environment(&self) -> EnvironmentId {
        self.environment
    }

    fn identifier(&self) -> &'static str {
        "tests.PullCounter"
    }

    fn filter_stream<'s>(&'s self, stream: TokenIter<'s>) -> TokenIter<'s> {
        Box::new(stream.inspect(move |_| {
            self.pulls.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

/// Does nothing at any hook.
#[derive(Debug)]
pub struct NoopExtension {
    environment: EnvironmentId,
}

impl Extension for NoopExtension {
    fn new(environment: EnvironmentId) -> Self {
        Self { environment }
    }

    fn environment(&self) -> EnvironmentId {
        self.environment
    }
}

/// Claims `with`, colliding with `WithExtension`.
#[derive(Debug)]
pub struct ShadowWithExtension {
    environment: EnvironmentId,
}

impl Extension for ShadowWithExtension {
    fn new(environment: EnvironmentId) -> Self {
        Self { environment }
    }

    fn environment(&self) -> EnvironmentId {
        self.environment
    }

    fn tags(&self) -> &[&'static str] {
        &["with"]
    }
}

/// Fails in `preprocess` and at every method call.
#[derive(Debug)]
pub struct FailingExtension {
    environment: EnvironmentId,
}

impl Extension for FailingExtension {
    fn new(environment: EnvironmentId) -> Self {
        Self { environment }
    }

    fn environment(&self) -> EnvironmentId {
        self.environment
    }

    fn tags(&self) -> &[&'static str] {
        &["explode"]
    }

    fn preprocess(
        &self,
        source: String,
        _name: Option<&str>,
        _filename: Option<&str>,
    ) -> Result<String, TemplateError> {
        if source.contains("[[fail]]") {
            return Err(err_msg!(Preprocess, "refusing to preprocess [[fail]]"));
        }
        Ok(source)
    }

    fn parse(&self, parser: &mut Parser<'_>) -> Result<Vec<StmtNode>, TemplateError> {
        let line = parser.stream().next_token()?.line;
        let call = self.call_method_node("explode", Vec::new(), Vec::new(), line);
        Ok(vec![StmtNode::new(Stmt::Output(vec![call]), line)])
    }

    fn call_method(
        &self,
        method: &str,
        _args: &[Value],
        _kwargs: &Kwargs,
        state: &CallState<'_>,
    ) -> Result<Value, TemplateError> {
        Err(err_msg!(
            Runtime,
            "'{}' exploded while rendering in {}",
            method,
            state.environment().id()
        ))
    }
}
