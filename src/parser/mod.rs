//! # Stencil Parser
//!
//! Recursive descent over a [`TokenStream`]. Template data and `{{ }}` output
//! are merged into [`Stmt::Output`] nodes; `{% %}` tags are dispatched by
//! keyword.
//!
//! ## Tag dispatch
//!
//! Extension tags are looked up first, through the environment's single tag
//! map, and handed to the owning extension's `parse` hook with the cursor on
//! the tag keyword. Remaining keywords go to the core grammar: `for`, `if`,
//! `set` and `block`. Anything else is an unknown tag.
//!
//! The statement helpers (`parse_statements`, `parse_expression`,
//! `parse_assign_target`, `fail`) are public so extension hooks can parse
//! nested bodies the same way built-in tags do.

use std::collections::HashSet;

use tracing::trace;

use crate::ast::{AssignTarget, Expr, ExprNode, Stmt, StmtNode};
use crate::extensions::ExtensionRegistry;
use crate::syntax::{TokenKind, TokenStream};
use crate::TemplateError;

mod expr;

/// Tag keywords of the core grammar. Extensions may not claim these.
pub const RESERVED_KEYWORDS: &[&str] = &[
    "for", "endfor", "if", "elif", "else", "endif", "set", "block", "endblock",
];

/// Statement keywords the core grammar parses itself.
const STATEMENT_KEYWORDS: &[&str] = &["for", "if", "set", "block"];

/// Names that can never be assignment targets.
const CONSTANT_NAMES: &[&str] = &["true", "false", "none", "True", "False", "None"];

/// Template parser. One instance parses one template.
pub struct Parser<'p> {
    stream: TokenStream<'p>,
    extensions: &'p ExtensionRegistry,
    name: Option<String>,
    /// End tokens of every open `parse_statements` call, innermost last.
    end_token_stack: Vec<Vec<String>>,
    /// Keywords of every open statement, innermost last.
    tag_stack: Vec<String>,
    blocks: HashSet<String>,
}

impl<'p> Parser<'p> {
    pub fn new(
        stream: TokenStream<'p>,
        extensions: &'p ExtensionRegistry,
        name: Option<&str>,
    ) -> Self {
        Self {
            stream,
            extensions,
            name: name.map(str::to_string),
            end_token_stack: Vec::new(),
            tag_stack: Vec::new(),
            blocks: HashSet::new(),
        }
    }

    /// Parses the whole template into its root statement list.
    pub fn parse(mut self) -> Result<Vec<StmtNode>, TemplateError> {
        let body = self.subparse(None)?;
        if !self.stream.is_eof() {
            let token = self.stream.current().clone();
            return Err(self.fail(format!("unexpected {}", token.describe()), token.line));
        }
        Ok(body)
    }

    /// The token cursor.
    pub fn stream(&mut self) -> &mut TokenStream<'p> {
        &mut self.stream
    }

    /// The extensions of the environment this template is parsed for.
    pub fn extensions(&self) -> &'p ExtensionRegistry {
        self.extensions
    }

    /// Name of the template being parsed, if it has one.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Builds a syntax error attributed to `line` and this template.
    pub fn fail(&self, message: impl Into<String>, line: u32) -> TemplateError {
        err_ctx!(Syntax, line, "{}", message.into()).with_name(self.name())
    }

    fn fail_unclosed(&self, name: Option<&str>, stack: &[Vec<String>], line: u32) -> TemplateError {
        let expected: Vec<&str> = stack
            .iter()
            .flatten()
            .map(|expr| describe_token_expr(expr))
            .collect();
        let looking_for = stack.last().map(|exprs| {
            exprs
                .iter()
                .map(|expr| format!("'{}'", describe_token_expr(expr)))
                .collect::<Vec<_>>()
                .join(" or ")
        });

        let mut message = vec![match name {
            Some(name) => format!("Encountered unknown tag '{}'.", name),
            None => "Unexpected end of template.".to_string(),
        }];
        if let Some(looking_for) = looking_for {
            if name.is_some_and(|name| expected.contains(&name)) {
                message.push(format!(
                    "You probably made a nesting mistake. Stencil is expecting this tag, \
                     but currently looking for {}.",
                    looking_for
                ));
            } else {
                message.push(format!(
                    "Stencil was looking for the following tags: {}.",
                    looking_for
                ));
            }
        }
        if let Some(innermost) = self.tag_stack.last() {
            message.push(format!(
                "The innermost block that needs to be closed is '{}'.",
                innermost
            ));
        }
        self.fail(message.join(" "), line)
    }

    fn fail_eof(&self, end_tokens: &[&str]) -> TemplateError {
        let mut stack = self.end_token_stack.clone();
        stack.push(end_tokens.iter().map(|s| s.to_string()).collect());
        self.fail_unclosed(None, &stack, self.stream.current().line)
    }

    // ------------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------------

    /// Parses template content until eof or, when given, until a block tag
    /// matching one of `end_tokens`. The cursor is left on that tag keyword.
    pub fn subparse(&mut self, end_tokens: Option<&[&str]>) -> Result<Vec<StmtNode>, TemplateError> {
        if let Some(end_tokens) = end_tokens {
            self.end_token_stack
                .push(end_tokens.iter().map(|s| s.to_string()).collect());
        }
        let mut body = Vec::new();
        let result = self.subparse_into(&mut body, end_tokens);
        if end_tokens.is_some() {
            self.end_token_stack.pop();
        }
        result.map(|()| body)
    }

    fn subparse_into(
        &mut self,
        body: &mut Vec<StmtNode>,
        end_tokens: Option<&[&str]>,
    ) -> Result<(), TemplateError> {
        let mut buffer: Vec<ExprNode> = Vec::new();
        while !self.stream.is_eof() {
            let token = self.stream.current().clone();
            match token.kind {
                TokenKind::Data => {
                    self.stream.next_token()?;
                    buffer.push(ExprNode::new(
                        Expr::TemplateData(token.value.unwrap_or_default()),
                        token.line,
                    ));
                }
                TokenKind::VariableBegin => {
                    self.stream.next_token()?;
                    buffer.push(self.parse_expression()?);
                    self.stream.expect("variable_end")?;
                }
                TokenKind::BlockBegin => {
                    flush_output(body, &mut buffer);
                    self.stream.next_token()?;
                    if let Some(end_tokens) = end_tokens {
                        if self.stream.current().test_any(end_tokens) {
                            return Ok(());
                        }
                    }
                    let statements = self.parse_statement()?;
                    body.extend(statements);
                    self.stream.expect("block_end")?;
                }
                _ => {
                    return Err(self.fail(
                        format!("unexpected {} in template data", token.describe()),
                        token.line,
                    ));
                }
            }
        }
        flush_output(body, &mut buffer);
        Ok(())
    }

    /// Parses one `{% ... %}` statement. The cursor is on the tag keyword and
    /// is left on the closing `block_end`.
    pub fn parse_statement(&mut self) -> Result<Vec<StmtNode>, TemplateError> {
        let token = self.stream.current().clone();
        if token.kind != TokenKind::Name {
            return Err(self.fail("tag name expected", token.line));
        }
        let tag = token.value_str().to_string();
        let extensions = self.extensions;
        let extension = extensions.for_tag(&tag);
        if extension.is_none() && !STATEMENT_KEYWORDS.contains(&tag.as_str()) {
            let stack = self.end_token_stack.clone();
            return Err(self.fail_unclosed(Some(&tag), &stack, token.line));
        }

        self.tag_stack.push(tag.clone());
        let result = match extension {
            Some(extension) => {
                trace!(tag = %tag, extension = extension.identifier(), "extension tag");
                extension.parse(self).map_err(|err| {
                    err.with_line(token.line).with_name(self.name())
                })
            }
            None => match tag.as_str() {
                "for" => self.parse_for().map(|node| vec![node]),
                "if" => self.parse_if().map(|node| vec![node]),
                "set" => self.parse_set().map(|node| vec![node]),
                _ => self.parse_block().map(|node| vec![node]),
            },
        };
        self.tag_stack.pop();
        result
    }

    /// Parses a tag body up to one of `end_tokens`. An optional colon and the
    /// closing `block_end` of the opening tag are consumed first. With
    /// `drop_needle` the matching end keyword is consumed too.
    pub fn parse_statements(
        &mut self,
        end_tokens: &[&str],
        drop_needle: bool,
    ) -> Result<Vec<StmtNode>, TemplateError> {
        self.stream.skip_if("colon")?;
        self.stream.expect("block_end")?;
        let body = self.subparse(Some(end_tokens))?;
        if self.stream.is_eof() {
            return Err(self.fail_eof(end_tokens));
        }
        if drop_needle {
            self.stream.next_token()?;
        }
        Ok(body)
    }

    fn parse_for(&mut self) -> Result<StmtNode, TemplateError> {
        let line = self.stream.expect("name:for")?.line;
        let target = self.parse_assign_target(true)?;
        self.stream.expect("name:in")?;
        let iter = self.parse_expression()?;
        let body = self.parse_statements(&["name:endfor", "name:else"], false)?;
        let else_body = if self.stream.next_token()?.is_name("endfor") {
            Vec::new()
        } else {
            self.parse_statements(&["name:endfor"], true)?
        };
        Ok(StmtNode::new(
            Stmt::For {
                target,
                iter,
                body,
                else_body,
            },
            line,
        ))
    }

    fn parse_if(&mut self) -> Result<StmtNode, TemplateError> {
        let line = self.stream.expect("name:if")?.line;
        self.parse_if_branch(line)
    }

    fn parse_if_branch(&mut self, line: u32) -> Result<StmtNode, TemplateError> {
        let test = self.parse_expression()?;
        let body = self.parse_statements(&["name:elif", "name:else", "name:endif"], false)?;
        let token = self.stream.next_token()?;
        let else_body = if token.is_name("elif") {
            vec![self.parse_if_branch(token.line)?]
        } else if token.is_name("else") {
            self.parse_statements(&["name:endif"], true)?
        } else {
            Vec::new()
        };
        Ok(StmtNode::new(
            Stmt::If {
                test,
                body,
                else_body,
            },
            line,
        ))
    }

    fn parse_set(&mut self) -> Result<StmtNode, TemplateError> {
        let line = self.stream.expect("name:set")?.line;
        let target = self.parse_assign_target(true)?;
        self.stream.expect("assign")?;
        let value = self.parse_expression()?;
        Ok(StmtNode::new(Stmt::Assign { target, value }, line))
    }

    fn parse_block(&mut self) -> Result<StmtNode, TemplateError> {
        let line = self.stream.expect("name:block")?.line;
        let name = self.stream.expect("name")?;
        let name = name.value.unwrap_or_default();
        if !self.blocks.insert(name.clone()) {
            return Err(self.fail(format!("block '{}' defined twice", name), line));
        }
        let body = self.parse_statements(&["name:endblock"], true)?;
        self.stream.skip_if(&format!("name:{}", name))?;
        Ok(StmtNode::new(Stmt::Block { name, body }, line))
    }

    /// Parses a `set`/`for` target: a name, or with `with_tuple` a
    /// comma-separated list of names.
    pub fn parse_assign_target(&mut self, with_tuple: bool) -> Result<AssignTarget, TemplateError> {
        let mut names = vec![self.parse_target_name()?];
        let mut is_tuple = false;
        while with_tuple && self.stream.current().kind == TokenKind::Comma {
            self.stream.next_token()?;
            is_tuple = true;
            if self.stream.current().kind != TokenKind::Name {
                break;
            }
            names.push(self.parse_target_name()?);
        }
        Ok(if is_tuple {
            AssignTarget::Tuple(names)
        } else {
            AssignTarget::Name(names.remove(0))
        })
    }

    fn parse_target_name(&mut self) -> Result<String, TemplateError> {
        let token = self.stream.expect("name")?;
        let name = token.value_str();
        if CONSTANT_NAMES.contains(&name) {
            return Err(self.fail(format!("can't assign to constant '{}'", name), token.line));
        }
        Ok(name.to_string())
    }
}

/// Moves buffered output children into a single `Output` node.
fn flush_output(body: &mut Vec<StmtNode>, buffer: &mut Vec<ExprNode>) {
    if let Some(first) = buffer.first() {
        let line = first.line;
        body.push(StmtNode::new(Stmt::Output(std::mem::take(buffer)), line));
    }
}

/// `name:endfor` → `endfor`.
fn describe_token_expr(expr: &str) -> &str {
    expr.split_once(':').map_or(expr, |(_, value)| value)
}
