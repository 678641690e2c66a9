//! # Stencil Extension System
//!
//! An extension is a unit of pluggable behaviour owned by exactly one
//! [`Environment`]. It may implement any subset of four hooks:
//!
//! - **`preprocess`**: rewrite raw source text before lexing.
//! - **`filter_stream`**: wrap the lazy token stream before parsing.
//! - **`parse`**: build AST nodes for the tag keywords listed in `tags()`.
//! - **`call_method`**: runtime entry point for the
//!   [`Expr::CallExtensionMethod`] nodes its parse hook emitted.
//!
//! ## Identity and ownership
//!
//! `identifier()` defaults to the fully qualified type name and is what the
//! compiler writes into `CallExtensionMethod` nodes, so two environments with
//! the same extension types produce identical programs. Instances are built by
//! an [`ExtensionSpec`] factory and receive the [`EnvironmentId`] of their
//! owner; they never hold a reference to the environment itself. Runtime
//! access to the environment goes through [`CallState`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::ast::{Expr, ExprNode, Keyword, StmtNode, Value};
use crate::environment::{Environment, EnvironmentId};
use crate::parser::Parser;
use crate::syntax::TokenIter;
use crate::TemplateError;

pub mod builtin;
pub mod registry;

pub use builtin::{ExprStmtExtension, LoopControlsExtension, WithExtension};
pub use registry::{ExtensionCatalog, ExtensionRegistry};

/// Keyword arguments passed to [`Extension::call_method`].
pub type Kwargs = BTreeMap<String, Value>;

/// Chain ordering key used when an extension does not override `priority`.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Returns the identifier an extension type reports by default.
pub fn identifier_of<E: Extension + ?Sized>() -> &'static str {
    std::any::type_name::<E>()
}

/// A pluggable unit of compile-time and render-time behaviour.
pub trait Extension: Send + Sync {
    /// Builds an instance bound to the environment `environment`.
    fn new(environment: EnvironmentId) -> Self
    where
        Self: Sized;

    /// The owning environment.
    fn environment(&self) -> EnvironmentId;

    /// Stable identifier, the fully qualified type name unless overridden.
    fn identifier(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Tag keywords this extension's parse hook handles.
    fn tags(&self) -> &[&'static str] {
        &[]
    }

    /// Ordering key for the preprocess and filter chains. Lower runs first;
    /// equal priorities keep registration order.
    fn priority(&self) -> i32 {
        DEFAULT_PRIORITY
    }

    /// Attributes fixed at definition time, readable from templates through
    /// [`Expr::ExtensionAttribute`].
    fn attribute(&self, _name: &str) -> Option<Value> {
        None
    }

    /// Rewrites source text before lexing.
    fn preprocess(
        &self,
        source: String,
        _name: Option<&str>,
        _filename: Option<&str>,
    ) -> Result<String, TemplateError> {
        Ok(source)
    }

    /// Wraps the token stream. Implementations must pass unrecognised tokens
    /// through unchanged and keep line numbers non-decreasing.
    fn filter_stream<'s>(&'s self, stream: TokenIter<'s>) -> TokenIter<'s> {
        stream
    }

    /// Parses one of the tags in [`tags`](Self::tags). The parser's current
    /// token is the tag keyword itself.
    fn parse(&self, parser: &mut Parser<'_>) -> Result<Vec<StmtNode>, TemplateError> {
        let token = parser.stream().current().clone();
        Err(parser.fail(
            format!(
                "extension '{}' does not implement a parser for tag '{}'",
                self.identifier(),
                token.value_str()
            ),
            token.line,
        ))
    }

    /// Runtime target of `CallExtensionMethod` nodes.
    fn call_method(
        &self,
        method: &str,
        _args: &[Value],
        _kwargs: &Kwargs,
        _state: &CallState<'_>,
    ) -> Result<Value, TemplateError> {
        Err(err_msg!(
            Runtime,
            "extension '{}' has no method '{}'",
            self.identifier(),
            method
        ))
    }

    // ------------------------------------------------------------------------
    // Node builders for parse hooks
    // ------------------------------------------------------------------------

    /// A node reading one of this extension's attributes at render time.
    fn attr(&self, name: &str, line: u32) -> ExprNode {
        ExprNode::new(
            Expr::ExtensionAttribute {
                extension: self.identifier().to_string(),
                name: name.to_string(),
            },
            line,
        )
    }

    /// A node calling one of this extension's methods at render time.
    fn call_method_node(
        &self,
        method: &str,
        args: Vec<ExprNode>,
        kwargs: Vec<Keyword>,
        line: u32,
    ) -> ExprNode {
        ExprNode::new(
            Expr::CallExtensionMethod {
                extension: self.identifier().to_string(),
                method: method.to_string(),
                args,
                kwargs,
            },
            line,
        )
    }
}

type Factory = dyn Fn(EnvironmentId) -> Arc<dyn Extension> + Send + Sync;

/// How to build an extension for a given environment.
///
/// Environments keep their specs so that [`Environment::overlay`] can build
/// fresh instances instead of sharing the parent's.
#[derive(Clone)]
pub struct ExtensionSpec {
    identifier: String,
    factory: Arc<Factory>,
}

impl ExtensionSpec {
    /// Spec for an extension type.
    pub fn of<E: Extension + 'static>() -> Self {
        Self {
            identifier: identifier_of::<E>().to_string(),
            factory: Arc::new(|env| Arc::new(E::new(env)) as Arc<dyn Extension>),
        }
    }

    /// Spec from an explicit factory.
    pub fn from_fn<F>(identifier: impl Into<String>, factory: F) -> Self
    where
        F: Fn(EnvironmentId) -> Arc<dyn Extension> + Send + Sync + 'static,
    {
        Self {
            identifier: identifier.into(),
            factory: Arc::new(factory),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Builds a new instance bound to `environment`.
    pub fn instantiate(&self, environment: EnvironmentId) -> Arc<dyn Extension> {
        (self.factory)(environment)
    }
}

impl fmt::Debug for ExtensionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ExtensionSpec").field(&self.identifier).finish()
    }
}

/// Render-time state handed to [`Extension::call_method`].
#[derive(Debug, Clone, Copy)]
pub struct CallState<'a> {
    environment: &'a Environment,
    template_name: Option<&'a str>,
    line: u32,
}

impl<'a> CallState<'a> {
    pub fn new(environment: &'a Environment, template_name: Option<&'a str>, line: u32) -> Self {
        Self {
            environment,
            template_name,
            line,
        }
    }

    /// The environment the template is rendering against.
    pub fn environment(&self) -> &'a Environment {
        self.environment
    }

    pub fn template_name(&self) -> Option<&'a str> {
        self.template_name
    }

    /// Line of the node that issued the call.
    pub fn line(&self) -> u32 {
        self.line
    }
}
