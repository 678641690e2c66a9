//! # Stencil AST
//!
//! Statement and expression nodes produced by the parser and by extension
//! parse hooks. Every node is wrapped in [`Spanned`], which carries the source
//! line it came from; constructors require the line, so every node reachable
//! from a template root is attributable.
//!
//! ## Extension-authored nodes
//!
//! - [`Expr::CallExtensionMethod`]: invoke a method on the owning extension
//!   instance at render time.
//! - [`Expr::ExtensionAttribute`]: read an extension attribute at render time.
//! - [`Expr::EnvironmentAttribute`]: read an environment attribute at render
//!   time (not compile time).
//! - [`Expr::ImportedName`]: a fully qualified symbol resolved once, when the
//!   template is loaded.
//! - [`Expr::ContextReference`]: the render-time context.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod value;

pub use value::Value;

/// A node together with the 1-based source line that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spanned<T> {
    pub value: T,
    pub line: u32,
}

impl<T> Spanned<T> {
    pub fn new(value: T, line: u32) -> Self {
        Self { value, line }
    }

    /// Re-stamps the node's line.
    pub fn with_line(mut self, line: u32) -> Self {
        self.line = line;
        self
    }
}

pub type ExprNode = Spanned<Expr>;
pub type StmtNode = Spanned<Stmt>;

/// Template statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// Writes each child in order: template data verbatim, expressions via
    /// their string form.
    Output(Vec<ExprNode>),
    For {
        target: AssignTarget,
        iter: ExprNode,
        body: Vec<StmtNode>,
        else_body: Vec<StmtNode>,
    },
    If {
        test: ExprNode,
        body: Vec<StmtNode>,
        else_body: Vec<StmtNode>,
    },
    Assign {
        target: AssignTarget,
        value: ExprNode,
    },
    /// A named block, registered in the context and rendered in place.
    Block { name: String, body: Vec<StmtNode> },
    /// A nested variable scope with initial bindings.
    Scope {
        bindings: Vec<(String, ExprNode)>,
        body: Vec<StmtNode>,
    },
    /// Evaluates an expression and discards the result.
    ExprStmt(ExprNode),
    Continue,
    Break,
}

/// Left-hand side of `set` and `for`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AssignTarget {
    Name(String),
    Tuple(Vec<String>),
}

impl AssignTarget {
    pub fn names(&self) -> Vec<&str> {
        match self {
            AssignTarget::Name(name) => vec![name.as_str()],
            AssignTarget::Tuple(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

impl fmt::Display for AssignTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssignTarget::Name(name) => f.write_str(name),
            AssignTarget::Tuple(names) => write!(f, "({})", names.join(", ")),
        }
    }
}

/// Literal constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Str(String),
    Number(f64),
    Bool(bool),
    None,
}

impl Literal {
    pub fn to_value(&self) -> Value {
        match self {
            Literal::Str(s) => Value::String(s.clone()),
            Literal::Number(n) => Value::Number(*n),
            Literal::Bool(b) => Value::Bool(*b),
            Literal::None => Value::None,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Str(s) => write!(f, "{:?}", s),
            Literal::Number(n) => write!(f, "{}", Value::Number(*n)),
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::None => f.write_str("none"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
    Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    Concat,
    Eq,
    Ne,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
    NotIn,
    And,
    Or,
}

impl BinOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::FloorDiv => "floordiv",
            BinOp::Mod => "mod",
            BinOp::Pow => "pow",
            BinOp::Concat => "concat",
            BinOp::Eq => "eq",
            BinOp::Ne => "ne",
            BinOp::Lt => "lt",
            BinOp::LtEq => "lteq",
            BinOp::Gt => "gt",
            BinOp::GtEq => "gteq",
            BinOp::In => "in",
            BinOp::NotIn => "notin",
            BinOp::And => "and",
            BinOp::Or => "or",
        }
    }
}

/// A keyword argument in a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyword {
    pub name: String,
    pub value: ExprNode,
}

/// Template expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Raw template text inside an `Output` node.
    TemplateData(String),
    Literal(Literal),
    Name(String),
    List(Vec<ExprNode>),
    Map(Vec<(ExprNode, ExprNode)>),
    GetAttr {
        target: Box<ExprNode>,
        attr: String,
    },
    GetItem {
        target: Box<ExprNode>,
        index: Box<ExprNode>,
    },
    Call {
        func: Box<ExprNode>,
        args: Vec<ExprNode>,
        kwargs: Vec<Keyword>,
    },
    Filter {
        target: Box<ExprNode>,
        name: String,
        args: Vec<ExprNode>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<ExprNode>,
    },
    Binary {
        op: BinOp,
        left: Box<ExprNode>,
        right: Box<ExprNode>,
    },
    /// Calls `method` on the extension registered under `extension`.
    CallExtensionMethod {
        extension: String,
        method: String,
        args: Vec<ExprNode>,
        kwargs: Vec<Keyword>,
    },
    /// Attribute of the rendering environment.
    EnvironmentAttribute(String),
    /// Attribute of the extension registered under `extension`.
    ExtensionAttribute { extension: String, name: String },
    /// Fully qualified symbol from the environment's symbol table.
    ImportedName(String),
    /// The live render context.
    ContextReference,
}

impl ExprNode {
    pub fn boxed(self) -> Box<ExprNode> {
        Box::new(self)
    }
}
