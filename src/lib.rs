//! # Stencil
//!
//! An embeddable text-templating engine built around a pluggable extension
//! pipeline. Extensions can rewrite template source before lexing, rewrite the
//! lazy token stream before parsing, and claim tag keywords whose parse hooks
//! emit AST nodes that call back into the extension at render time.
//!
//! ```rust
//! use stencil::{Environment, LoopControlsExtension};
//!
//! let env = Environment::builder()
//!     .extension::<LoopControlsExtension>()
//!     .build()
//!     .unwrap();
//! let template = env
//!     .from_string("{% for i in [1, 2, 3, 4] %}{% if i == 3 %}{% break %}{% endif %}{{ i }}{% endfor %}")
//!     .unwrap();
//! assert_eq!(template.render().unwrap(), "12");
//! ```

#[macro_use]
pub mod diagnostics;

pub mod ast;
pub mod cli;
pub mod compiler;
pub mod environment;
pub mod extensions;
pub mod parser;
pub mod runtime;
pub mod syntax;

pub use crate::ast::{Expr, ExprNode, Spanned, Stmt, StmtNode, Value};
pub use crate::compiler::Program;
pub use crate::diagnostics::{to_error_source, ErrorContext, ErrorType, TemplateError};
pub use crate::environment::{
    ConfigOverrides, Environment, EnvironmentBuilder, EnvironmentConfig, EnvironmentId,
    ImportResolver, SymbolTable,
};
pub use crate::extensions::{
    CallState, ExprStmtExtension, Extension, ExtensionCatalog, ExtensionRegistry, ExtensionSpec,
    Kwargs, LoopControlsExtension, WithExtension,
};
pub use crate::parser::Parser;
pub use crate::runtime::{Context, Template};
pub use crate::syntax::{Token, TokenIter, TokenKind, TokenStream};
