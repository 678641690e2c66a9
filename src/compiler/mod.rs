//! # Stencil Compiler
//!
//! Lowers a template AST into a [`Program`]: a flat instruction list per code
//! chunk, a parallel line table, one chunk per named block, and the table of
//! imported values resolved at load time.
//!
//! ## Determinism
//!
//! Lowering is a pure function of the AST and the resolved imports: arguments
//! are emitted left to right, nothing is elided or reordered, and the
//! [`Display`](std::fmt::Display) listing names extensions by identifier and
//! imports by fully qualified name. Two environments holding the same
//! extension types therefore produce byte-identical listings.
//!
//! ## Extension nodes
//!
//! | Node                   | Instruction        | Resolved        |
//! |------------------------|--------------------|-----------------|
//! | `CallExtensionMethod`  | `CALL_EXTENSION`   | render time     |
//! | `ExtensionAttribute`   | `LOAD_EXT_ATTR`    | render time     |
//! | `EnvironmentAttribute` | `LOAD_ENV_ATTR`    | render time     |
//! | `ImportedName`         | `LOAD_IMPORT`      | compile time    |
//! | `ContextReference`     | `LOAD_CONTEXT`     | render time     |

use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::ast::{AssignTarget, BinOp, Expr, ExprNode, Keyword, Literal, Stmt, StmtNode, UnaryOp, Value};
use crate::environment::ImportResolver;
use crate::runtime::FilterRegistry;
use crate::TemplateError;

/// One VM instruction. Jump targets are indices into the owning chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    EmitRaw(String),
    /// Pops a value and writes its string form.
    Emit,
    LoadConst(Literal),
    Lookup(String),
    Store(String),
    UnpackStore(Vec<String>),
    GetAttr(String),
    GetItem,
    BuildList(usize),
    BuildMap(usize),
    Unary(UnaryOp),
    Binary(BinOp),
    JumpIfFalseOrPop(usize),
    JumpIfTrueOrPop(usize),
    Call {
        argc: usize,
        kwargs: Vec<String>,
    },
    CallMethod {
        name: String,
        argc: usize,
        kwargs: Vec<String>,
    },
    ApplyFilter {
        name: String,
        argc: usize,
    },
    CallExtension {
        extension: String,
        method: String,
        argc: usize,
        kwargs: Vec<String>,
    },
    LoadEnvAttr(String),
    LoadExtAttr {
        extension: String,
        name: String,
    },
    LoadImport(usize),
    LoadContext,
    Jump(usize),
    JumpIfFalse(usize),
    JumpIfTrue(usize),
    PushScope,
    PopScope,
    /// Pops an iterable and starts a loop over it.
    PushLoop,
    /// Binds the next item in a fresh scope, or jumps to `exit` when done.
    ForNext {
        target: AssignTarget,
        exit: usize,
    },
    /// Ends the innermost loop and pushes whether it ran at least once.
    PopLoop,
    Pop,
    RenderBlock(String),
}

fn write_kwargs(f: &mut fmt::Formatter<'_>, kwargs: &[String]) -> fmt::Result {
    write!(f, " kwargs=[{}]", kwargs.join(", "))
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::EmitRaw(text) => write!(f, "EMIT_RAW {:?}", text),
            Instr::Emit => f.write_str("EMIT"),
            Instr::LoadConst(literal) => write!(f, "LOAD_CONST {}", literal),
            Instr::Lookup(name) => write!(f, "LOOKUP {}", name),
            Instr::Store(name) => write!(f, "STORE {}", name),
            Instr::UnpackStore(names) => write!(f, "UNPACK_STORE {}", names.join(", ")),
            Instr::GetAttr(name) => write!(f, "GET_ATTR {}", name),
            Instr::GetItem => f.write_str("GET_ITEM"),
            Instr::BuildList(n) => write!(f, "BUILD_LIST {}", n),
            Instr::BuildMap(n) => write!(f, "BUILD_MAP {}", n),
            Instr::Unary(op) => write!(f, "UNARY {:?}", op),
            Instr::Binary(op) => write!(f, "BINARY {}", op.as_str()),
            Instr::JumpIfFalseOrPop(to) => write!(f, "JUMP_IF_FALSE_OR_POP {:04}", to),
            Instr::JumpIfTrueOrPop(to) => write!(f, "JUMP_IF_TRUE_OR_POP {:04}", to),
            Instr::Call { argc, kwargs } => {
                write!(f, "CALL argc={}", argc)?;
                write_kwargs(f, kwargs)
            }
            Instr::CallMethod { name, argc, kwargs } => {
                write!(f, "CALL_METHOD {} argc={}", name, argc)?;
                write_kwargs(f, kwargs)
            }
            Instr::ApplyFilter { name, argc } => write!(f, "FILTER {} argc={}", name, argc),
            Instr::CallExtension {
                extension,
                method,
                argc,
                kwargs,
            } => {
                write!(f, "CALL_EXTENSION {}.{} argc={}", extension, method, argc)?;
                write_kwargs(f, kwargs)
            }
            Instr::LoadEnvAttr(name) => write!(f, "LOAD_ENV_ATTR {}", name),
            Instr::LoadExtAttr { extension, name } => {
                write!(f, "LOAD_EXT_ATTR {}.{}", extension, name)
            }
            Instr::LoadImport(index) => write!(f, "LOAD_IMPORT {}", index),
            Instr::LoadContext => f.write_str("LOAD_CONTEXT"),
            Instr::Jump(to) => write!(f, "JUMP {:04}", to),
            Instr::JumpIfFalse(to) => write!(f, "JUMP_IF_FALSE {:04}", to),
            Instr::JumpIfTrue(to) => write!(f, "JUMP_IF_TRUE {:04}", to),
            Instr::PushScope => f.write_str("PUSH_SCOPE"),
            Instr::PopScope => f.write_str("POP_SCOPE"),
            Instr::PushLoop => f.write_str("PUSH_LOOP"),
            Instr::ForNext { target, exit } => write!(f, "FOR_NEXT {} exit={:04}", target, exit),
            Instr::PopLoop => f.write_str("POP_LOOP"),
            Instr::Pop => f.write_str("POP"),
            Instr::RenderBlock(name) => write!(f, "RENDER_BLOCK {}", name),
        }
    }
}

/// A straight-line instruction sequence with its line table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    pub code: Vec<Instr>,
    /// Source line of each instruction, parallel to `code`.
    pub lines: Vec<u32>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    fn write_listing(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (instr, line)) in self.code.iter().zip(&self.lines).enumerate() {
            writeln!(f, "{:04}  L{:<4} {}", index, line, instr)?;
        }
        Ok(())
    }
}

/// An imported value, resolved when the template was compiled.
#[derive(Debug, Clone)]
pub struct Import {
    pub name: String,
    pub value: Value,
}

/// The compiled form of one template.
#[derive(Debug, Clone)]
pub struct Program {
    pub name: Option<String>,
    pub root: Chunk,
    pub blocks: BTreeMap<String, Chunk>,
    pub imports: Vec<Import>,
}

impl Program {
    /// Hex SHA-256 of the listing.
    pub fn digest(&self) -> String {
        let digest = Sha256::digest(self.to_string().as_bytes());
        digest.iter().map(|byte| format!("{:02x}", byte)).collect()
    }

    /// Names of the blocks this template defines.
    pub fn block_names(&self) -> impl Iterator<Item = &str> {
        self.blocks.keys().map(String::as_str)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; program {}", self.name.as_deref().unwrap_or("<string>"))?;
        if !self.imports.is_empty() {
            writeln!(f, "; imports")?;
            for (index, import) in self.imports.iter().enumerate() {
                writeln!(f, "{:>4}  {}", index, import.name)?;
            }
        }
        writeln!(f, "; root")?;
        self.root.write_listing(f)?;
        for (name, chunk) in &self.blocks {
            writeln!(f, "; block {}", name)?;
            chunk.write_listing(f)?;
        }
        Ok(())
    }
}

// ============================================================================
// LOWERING
// ============================================================================

struct LoopLabels {
    /// Scope depth outside the per-iteration scope.
    base_depth: usize,
    next: usize,
    break_jumps: Vec<usize>,
}

#[derive(Default)]
struct ChunkBuilder {
    chunk: Chunk,
    depth: usize,
    loops: Vec<LoopLabels>,
}

impl ChunkBuilder {
    fn emit(&mut self, instr: Instr, line: u32) -> usize {
        self.chunk.code.push(instr);
        self.chunk.lines.push(line);
        self.chunk.code.len() - 1
    }

    fn here(&self) -> usize {
        self.chunk.code.len()
    }

    /// Points the jump at `at` to `target`.
    fn patch(&mut self, at: usize, target: usize) {
        match &mut self.chunk.code[at] {
            Instr::Jump(to)
            | Instr::JumpIfFalse(to)
            | Instr::JumpIfTrue(to)
            | Instr::JumpIfFalseOrPop(to)
            | Instr::JumpIfTrueOrPop(to) => *to = target,
            Instr::ForNext { exit, .. } => *exit = target,
            _ => {}
        }
    }
}

/// Lowers template ASTs. One compiler per template.
pub struct Compiler<'c> {
    name: Option<String>,
    resolver: &'c dyn ImportResolver,
    filters: &'c FilterRegistry,
    imports: Vec<Import>,
    blocks: BTreeMap<String, Chunk>,
}

impl<'c> Compiler<'c> {
    pub fn new(
        name: Option<&str>,
        resolver: &'c dyn ImportResolver,
        filters: &'c FilterRegistry,
    ) -> Self {
        Self {
            name: name.map(str::to_string),
            resolver,
            filters,
            imports: Vec::new(),
            blocks: BTreeMap::new(),
        }
    }

    /// Compiles a root statement list.
    pub fn compile(mut self, body: &[StmtNode]) -> Result<Program, TemplateError> {
        let mut builder = ChunkBuilder::default();
        self.stmts(&mut builder, body)
            .map_err(|err| err.with_name(self.name.as_deref()))?;
        let program = Program {
            name: self.name,
            root: builder.chunk,
            blocks: self.blocks,
            imports: self.imports,
        };
        debug!(
            template = program.name.as_deref().unwrap_or("<string>"),
            instructions = program.root.len(),
            blocks = program.blocks.len(),
            imports = program.imports.len(),
            "compiled template"
        );
        Ok(program)
    }

    fn stmts(&mut self, b: &mut ChunkBuilder, body: &[StmtNode]) -> Result<(), TemplateError> {
        body.iter().try_for_each(|node| self.stmt(b, node))
    }

    fn stmt(&mut self, b: &mut ChunkBuilder, node: &StmtNode) -> Result<(), TemplateError> {
        let line = node.line;
        match &node.value {
            Stmt::Output(children) => {
                for child in children {
                    match &child.value {
                        Expr::TemplateData(text) => {
                            b.emit(Instr::EmitRaw(text.clone()), child.line);
                        }
                        _ => {
                            self.expr(b, child)?;
                            b.emit(Instr::Emit, child.line);
                        }
                    }
                }
            }
            Stmt::For {
                target,
                iter,
                body,
                else_body,
            } => {
                self.expr(b, iter)?;
                b.emit(Instr::PushLoop, line);
                let next = b.emit(
                    Instr::ForNext {
                        target: target.clone(),
                        exit: 0,
                    },
                    line,
                );
                b.loops.push(LoopLabels {
                    base_depth: b.depth,
                    next,
                    break_jumps: Vec::new(),
                });
                b.depth += 1;
                let body_result = self.stmts(b, body);
                b.depth -= 1;
                let labels = b.loops.pop();
                body_result?;
                b.emit(Instr::PopScope, line);
                b.emit(Instr::Jump(next), line);
                let end = b.emit(Instr::PopLoop, line);
                b.patch(next, end);
                for jump in labels.map(|l| l.break_jumps).unwrap_or_default() {
                    b.patch(jump, end);
                }
                let skip_else = b.emit(Instr::JumpIfTrue(0), line);
                self.stmts(b, else_body)?;
                let after = b.here();
                b.patch(skip_else, after);
            }
            Stmt::If {
                test,
                body,
                else_body,
            } => {
                self.expr(b, test)?;
                let to_else = b.emit(Instr::JumpIfFalse(0), line);
                self.stmts(b, body)?;
                let to_end = b.emit(Instr::Jump(0), line);
                let else_start = b.here();
                b.patch(to_else, else_start);
                self.stmts(b, else_body)?;
                let end = b.here();
                b.patch(to_end, end);
            }
            Stmt::Assign { target, value } => {
                self.expr(b, value)?;
                b.emit(store(target), line);
            }
            Stmt::Block { name, body } => {
                let mut block = ChunkBuilder::default();
                self.stmts(&mut block, body)?;
                self.blocks.insert(name.clone(), block.chunk);
                b.emit(Instr::RenderBlock(name.clone()), line);
            }
            Stmt::Scope { bindings, body } => {
                for (_, value) in bindings {
                    self.expr(b, value)?;
                }
                b.emit(Instr::PushScope, line);
                for (name, value) in bindings.iter().rev() {
                    b.emit(Instr::Store(name.clone()), value.line);
                }
                b.depth += 1;
                let result = self.stmts(b, body);
                b.depth -= 1;
                result?;
                b.emit(Instr::PopScope, line);
            }
            Stmt::ExprStmt(expr) => {
                self.expr(b, expr)?;
                b.emit(Instr::Pop, line);
            }
            Stmt::Break | Stmt::Continue => {
                let is_break = matches!(node.value, Stmt::Break);
                let keyword = if is_break { "break" } else { "continue" };
                let Some(labels) = b.loops.last() else {
                    return Err(err_ctx!(Syntax, line, "'{}' outside of a loop", keyword));
                };
                let (pops, next) = (b.depth - labels.base_depth, labels.next);
                for _ in 0..pops {
                    b.emit(Instr::PopScope, line);
                }
                if is_break {
                    let jump = b.emit(Instr::Jump(0), line);
                    if let Some(labels) = b.loops.last_mut() {
                        labels.break_jumps.push(jump);
                    }
                } else {
                    b.emit(Instr::Jump(next), line);
                }
            }
        }
        Ok(())
    }

    fn expr(&mut self, b: &mut ChunkBuilder, node: &ExprNode) -> Result<(), TemplateError> {
        let line = node.line;
        match &node.value {
            Expr::TemplateData(text) => {
                b.emit(Instr::LoadConst(Literal::Str(text.clone())), line);
            }
            Expr::Literal(literal) => {
                b.emit(Instr::LoadConst(literal.clone()), line);
            }
            Expr::Name(name) => {
                b.emit(Instr::Lookup(name.clone()), line);
            }
            Expr::List(items) => {
                for item in items {
                    self.expr(b, item)?;
                }
                b.emit(Instr::BuildList(items.len()), line);
            }
            Expr::Map(pairs) => {
                for (key, value) in pairs {
                    self.expr(b, key)?;
                    self.expr(b, value)?;
                }
                b.emit(Instr::BuildMap(pairs.len()), line);
            }
            Expr::GetAttr { target, attr } => {
                self.expr(b, target)?;
                b.emit(Instr::GetAttr(attr.clone()), line);
            }
            Expr::GetItem { target, index } => {
                self.expr(b, target)?;
                self.expr(b, index)?;
                b.emit(Instr::GetItem, line);
            }
            Expr::Call { func, args, kwargs } => match &func.value {
                Expr::GetAttr { target, attr } => {
                    self.expr(b, target)?;
                    let kwargs = self.arguments(b, args, kwargs)?;
                    b.emit(
                        Instr::CallMethod {
                            name: attr.clone(),
                            argc: args.len(),
                            kwargs,
                        },
                        line,
                    );
                }
                _ => {
                    self.expr(b, func)?;
                    let kwargs = self.arguments(b, args, kwargs)?;
                    b.emit(
                        Instr::Call {
                            argc: args.len(),
                            kwargs,
                        },
                        line,
                    );
                }
            },
            Expr::Filter { target, name, args } => {
                if !self.filters.contains(name) {
                    return Err(err_ctx!(Syntax, line, "no filter named '{}'", name));
                }
                self.expr(b, target)?;
                for arg in args {
                    self.expr(b, arg)?;
                }
                b.emit(
                    Instr::ApplyFilter {
                        name: name.clone(),
                        argc: args.len(),
                    },
                    line,
                );
            }
            Expr::Unary { op, operand } => {
                self.expr(b, operand)?;
                b.emit(Instr::Unary(*op), line);
            }
            Expr::Binary { op, left, right } => {
                self.expr(b, left)?;
                match op {
                    BinOp::And | BinOp::Or => {
                        let jump = if *op == BinOp::And {
                            Instr::JumpIfFalseOrPop(0)
                        } else {
                            Instr::JumpIfTrueOrPop(0)
                        };
                        let at = b.emit(jump, line);
                        self.expr(b, right)?;
                        let end = b.here();
                        b.patch(at, end);
                    }
                    _ => {
                        self.expr(b, right)?;
                        b.emit(Instr::Binary(*op), line);
                    }
                }
            }
            Expr::CallExtensionMethod {
                extension,
                method,
                args,
                kwargs,
            } => {
                let kwargs = self.arguments(b, args, kwargs)?;
                b.emit(
                    Instr::CallExtension {
                        extension: extension.clone(),
                        method: method.clone(),
                        argc: args.len(),
                        kwargs,
                    },
                    line,
                );
            }
            Expr::EnvironmentAttribute(name) => {
                b.emit(Instr::LoadEnvAttr(name.clone()), line);
            }
            Expr::ExtensionAttribute { extension, name } => {
                b.emit(
                    Instr::LoadExtAttr {
                        extension: extension.clone(),
                        name: name.clone(),
                    },
                    line,
                );
            }
            Expr::ImportedName(name) => {
                let index = self.import(name, line)?;
                b.emit(Instr::LoadImport(index), line);
            }
            Expr::ContextReference => {
                b.emit(Instr::LoadContext, line);
            }
        }
        Ok(())
    }

    /// Emits positional then keyword argument values; returns keyword names.
    fn arguments(
        &mut self,
        b: &mut ChunkBuilder,
        args: &[ExprNode],
        kwargs: &[Keyword],
    ) -> Result<Vec<String>, TemplateError> {
        for arg in args {
            self.expr(b, arg)?;
        }
        for keyword in kwargs {
            self.expr(b, &keyword.value)?;
        }
        Ok(kwargs.iter().map(|k| k.name.clone()).collect())
    }

    fn import(&mut self, name: &str, line: u32) -> Result<usize, TemplateError> {
        if let Some(index) = self.imports.iter().position(|import| import.name == name) {
            return Ok(index);
        }
        let value = self
            .resolver
            .resolve(name)
            .ok_or_else(|| err_ctx!(Import, line, "could not import '{}'", name))?;
        self.imports.push(Import {
            name: name.to_string(),
            value,
        });
        Ok(self.imports.len() - 1)
    }
}

fn store(target: &AssignTarget) -> Instr {
    match target {
        AssignTarget::Name(name) => Instr::Store(name.clone()),
        AssignTarget::Tuple(names) => Instr::UnpackStore(names.clone()),
    }
}
