//! Extensions shipped with Stencil.
//!
//! | Extension               | Tags                  | Produces           |
//! |-------------------------|-----------------------|--------------------|
//! | `LoopControlsExtension` | `break`, `continue`   | `Stmt::Break/Continue` |
//! | `ExprStmtExtension`     | `do`                  | `Stmt::ExprStmt`   |
//! | `WithExtension`         | `with` ... `endwith`  | `Stmt::Scope`      |

use crate::ast::{Stmt, StmtNode};
use crate::environment::EnvironmentId;
use crate::extensions::Extension;
use crate::parser::Parser;
use crate::syntax::TokenKind;
use crate::TemplateError;

/// Adds `{% break %}` and `{% continue %}` inside `for` loops.
#[derive(Debug)]
pub struct LoopControlsExtension {
    environment: EnvironmentId,
}

impl Extension for LoopControlsExtension {
    fn new(environment: EnvironmentId) -> Self {
        Self { environment }
    }

    fn environment(&self) -> EnvironmentId {
        self.environment
    }

    fn tags(&self) -> &[&'static str] {
        &["break", "continue"]
    }

    fn parse(&self, parser: &mut Parser<'_>) -> Result<Vec<StmtNode>, TemplateError> {
        let token = parser.stream().next_token()?;
        let stmt = if token.is_name("break") {
            Stmt::Break
        } else {
            Stmt::Continue
        };
        Ok(vec![StmtNode::new(stmt, token.line)])
    }
}

/// Adds `{% do expr %}`: evaluate an expression for its side effects.
#[derive(Debug)]
pub struct ExprStmtExtension {
    environment: EnvironmentId,
}

impl Extension for ExprStmtExtension {
    fn new(environment: EnvironmentId) -> Self {
        Self { environment }
    }

    fn environment(&self) -> EnvironmentId {
        self.environment
    }

    fn tags(&self) -> &[&'static str] {
        &["do"]
    }

    fn parse(&self, parser: &mut Parser<'_>) -> Result<Vec<StmtNode>, TemplateError> {
        let line = parser.stream().next_token()?.line;
        let expr = parser.parse_expression()?;
        Ok(vec![StmtNode::new(Stmt::ExprStmt(expr), line)])
    }
}

/// Adds `{% with a=1, b=2 %}...{% endwith %}`. Bindings are evaluated in the
/// enclosing scope and visible only inside the body.
#[derive(Debug)]
pub struct WithExtension {
    environment: EnvironmentId,
}

impl Extension for WithExtension {
    fn new(environment: EnvironmentId) -> Self {
        Self { environment }
    }

    fn environment(&self) -> EnvironmentId {
        self.environment
    }

    fn tags(&self) -> &[&'static str] {
        &["with"]
    }

    fn parse(&self, parser: &mut Parser<'_>) -> Result<Vec<StmtNode>, TemplateError> {
        let line = parser.stream().next_token()?.line;
        let mut bindings = Vec::new();
        while parser.stream().current().kind != TokenKind::BlockEnd {
            if !bindings.is_empty() {
                parser.stream().expect("comma")?;
            }
            let target = parser.stream().expect("name")?;
            parser.stream().expect("assign")?;
            let value = parser.parse_expression()?;
            bindings.push((target.value.unwrap_or_default(), value));
        }
        let body = parser.parse_statements(&["name:endwith"], true)?;
        Ok(vec![StmtNode::new(Stmt::Scope { bindings, body }, line)])
    }
}
