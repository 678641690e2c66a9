//! # Stencil Runtime
//!
//! A [`Template`] pairs a compiled [`Program`] with the [`Environment`] that
//! compiled it and renders it on a small stack machine.
//!
//! ## Name lookup
//!
//! Innermost scope first, then the render variables, then the environment's
//! globals. Names that resolve nowhere are `Undefined` and render as the
//! empty string.
//!
//! ## Extension calls
//!
//! `CALL_EXTENSION` looks the extension up by identifier in the rendering
//! environment and hands it a [`CallState`]. Failures surface as `Runtime`
//! errors attributed to the template name and the line of the calling node.

use std::collections::BTreeMap;
use std::sync::Arc;

use im::OrdMap;
use tracing::{debug, trace};

use crate::ast::{AssignTarget, BinOp, UnaryOp, Value};
use crate::compiler::{Chunk, Instr, Program};
use crate::environment::Environment;
use crate::extensions::{CallState, Kwargs};
use crate::TemplateError;

pub mod context;
pub mod filters;
pub mod methods;

pub use context::Context;
pub use filters::{FilterFn, FilterRegistry};

/// A compiled template bound to its environment.
#[derive(Debug, Clone)]
pub struct Template<'env> {
    environment: &'env Environment,
    program: Program,
}

impl<'env> Template<'env> {
    pub fn new(environment: &'env Environment, program: Program) -> Self {
        Self {
            environment,
            program,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.program.name.as_deref()
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn environment(&self) -> &'env Environment {
        self.environment
    }

    /// Renders without variables.
    pub fn render(&self) -> Result<String, TemplateError> {
        self.render_with(std::iter::empty::<(String, Value)>())
    }

    /// Renders with the given variables.
    pub fn render_with<I, K, V>(&self, vars: I) -> Result<String, TemplateError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let vars: OrdMap<String, Value> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let mut vm = Vm::new(self, vars);
        vm.run(&self.program.root)?;
        debug!(
            template = self.name().unwrap_or("<string>"),
            bytes = vm.out.len(),
            "rendered template"
        );
        Ok(vm.out)
    }

    /// Renders with the members of a JSON object as variables.
    pub fn render_json(&self, json: serde_json::Value) -> Result<String, TemplateError> {
        match Value::from_json(json) {
            Value::Map(map) => self.render_with(map),
            Value::None => self.render(),
            other => Err(err_msg!(
                Runtime,
                "render variables must be an object, got {}",
                other.type_name()
            )),
        }
    }
}

// ============================================================================
// STACK MACHINE
// ============================================================================

struct LoopState {
    items: Vec<Value>,
    index: usize,
}

struct Vm<'t, 'env> {
    template: &'t Template<'env>,
    vars: OrdMap<String, Value>,
    frames: Vec<OrdMap<String, Value>>,
    loops: Vec<LoopState>,
    stack: Vec<Value>,
    out: String,
}

impl<'t, 'env> Vm<'t, 'env> {
    fn new(template: &'t Template<'env>, vars: OrdMap<String, Value>) -> Self {
        Self {
            template,
            vars,
            frames: vec![OrdMap::new()],
            loops: Vec::new(),
            stack: Vec::new(),
            out: String::new(),
        }
    }

    fn environment(&self) -> &'env Environment {
        self.template.environment
    }

    fn run(&mut self, chunk: &Chunk) -> Result<(), TemplateError> {
        let template = self.template;
        let mut pc = 0;
        while let Some(instr) = chunk.code.get(pc) {
            let line = chunk.lines.get(pc).copied().unwrap_or(1);
            pc += 1;
            self.step(instr, line, &mut pc)
                .map_err(|err| err.with_line(line).with_name(template.name()))?;
        }
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, TemplateError> {
        self.stack
            .pop()
            .ok_or_else(|| err_msg!(Runtime, "value stack underflow"))
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, TemplateError> {
        if self.stack.len() < n {
            return Err(err_msg!(Runtime, "value stack underflow"));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn pop_kwargs(&mut self, names: &[String]) -> Result<Kwargs, TemplateError> {
        let values = self.pop_n(names.len())?;
        Ok(names.iter().cloned().zip(values).collect::<BTreeMap<_, _>>())
    }

    fn peek(&self) -> Result<&Value, TemplateError> {
        self.stack
            .last()
            .ok_or_else(|| err_msg!(Runtime, "value stack underflow"))
    }

    fn lookup(&self, name: &str) -> Value {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.get(name))
            .or_else(|| self.vars.get(name))
            .cloned()
            .or_else(|| self.environment().global(name))
            .unwrap_or_default()
    }

    fn store(&mut self, name: &str, value: Value) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.to_string(), value);
        }
    }

    fn bind(&mut self, target: &AssignTarget, value: Value) -> Result<(), TemplateError> {
        match target {
            AssignTarget::Name(name) => self.store(name, value),
            AssignTarget::Tuple(names) => self.unpack(names, value)?,
        }
        Ok(())
    }

    fn unpack(&mut self, names: &[String], value: Value) -> Result<(), TemplateError> {
        let items = value.iterate().ok_or_else(|| {
            err_msg!(Runtime, "cannot unpack non-iterable {}", value.type_name())
        })?;
        if items.len() != names.len() {
            return Err(err_msg!(
                Runtime,
                "cannot unpack {} value(s) into {} name(s)",
                items.len(),
                names.len()
            ));
        }
        for (name, item) in names.iter().zip(items) {
            self.store(name, item);
        }
        Ok(())
    }

    /// Snapshot of the variables visible right now, with the template's blocks.
    fn context(&self) -> Context {
        let mut vars = self.vars.clone();
        for frame in &self.frames {
            vars = frame.clone().union(vars);
        }
        Context::new(
            self.template.name(),
            vars,
            self.template.program.block_names().map(str::to_string),
        )
    }

    fn step(&mut self, instr: &Instr, line: u32, pc: &mut usize) -> Result<(), TemplateError> {
        match instr {
            Instr::EmitRaw(text) => self.out.push_str(text),
            Instr::Emit => {
                let value = self.pop()?;
                self.out.push_str(&value.to_string());
            }
            Instr::LoadConst(literal) => self.stack.push(literal.to_value()),
            Instr::Lookup(name) => {
                let value = self.lookup(name);
                self.stack.push(value);
            }
            Instr::Store(name) => {
                let value = self.pop()?;
                self.store(name, value);
            }
            Instr::UnpackStore(names) => {
                let value = self.pop()?;
                self.unpack(names, value)?;
            }
            Instr::GetAttr(name) => {
                let target = self.pop()?;
                self.stack.push(target.get_attr(name));
            }
            Instr::GetItem => {
                let index = self.pop()?;
                let target = self.pop()?;
                self.stack.push(target.get_item(&index));
            }
            Instr::BuildList(n) => {
                let items = self.pop_n(*n)?;
                self.stack.push(Value::from(items));
            }
            Instr::BuildMap(n) => {
                let flat = self.pop_n(n * 2)?;
                let map = flat
                    .chunks(2)
                    .map(|pair| (pair[0].to_string(), pair[1].clone()))
                    .collect();
                self.stack.push(Value::Map(map));
            }
            Instr::Unary(op) => {
                let operand = self.pop()?;
                self.stack.push(unary(*op, &operand)?);
            }
            Instr::Binary(op) => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.stack.push(binary(*op, &left, &right)?);
            }
            Instr::JumpIfFalseOrPop(to) => {
                if self.peek()?.is_true() {
                    self.pop()?;
                } else {
                    *pc = *to;
                }
            }
            Instr::JumpIfTrueOrPop(to) => {
                if self.peek()?.is_true() {
                    *pc = *to;
                } else {
                    self.pop()?;
                }
            }
            Instr::Call { argc, kwargs } => {
                if !kwargs.is_empty() {
                    return Err(err_msg!(
                        Runtime,
                        "native functions do not take keyword arguments"
                    ));
                }
                let args = self.pop_n(*argc)?;
                let func = self.pop()?;
                match func {
                    Value::Function(func) => self.stack.push(func.call(&args)?),
                    other => {
                        return Err(err_msg!(
                            Runtime,
                            "'{}' object is not callable",
                            other.type_name()
                        ))
                    }
                }
            }
            Instr::CallMethod { name, argc, kwargs } => {
                if !kwargs.is_empty() {
                    return Err(err_msg!(
                        Runtime,
                        "method '{}' does not take keyword arguments",
                        name
                    ));
                }
                let args = self.pop_n(*argc)?;
                let target = self.pop()?;
                self.stack.push(methods::call_method(&target, name, &args)?);
            }
            Instr::ApplyFilter { name, argc } => {
                let args = self.pop_n(*argc)?;
                let value = self.pop()?;
                let filter = self
                    .environment()
                    .filters()
                    .get(name)
                    .ok_or_else(|| err_msg!(Runtime, "no filter named '{}'", name))?;
                self.stack.push(filter(&value, &args)?);
            }
            Instr::CallExtension {
                extension,
                method,
                argc,
                kwargs,
            } => {
                let kwargs = self.pop_kwargs(kwargs)?;
                let args = self.pop_n(*argc)?;
                let environment = self.environment();
                let instance = environment.extension(extension).ok_or_else(|| {
                    err_msg!(
                        Runtime,
                        "extension '{}' is not registered with this environment",
                        extension
                    )
                })?;
                trace!(extension = %extension, method = %method, line, "extension call");
                let state = CallState::new(environment, self.template.name(), line);
                let result = instance
                    .call_method(method, &args, &kwargs, &state)
                    .map_err(|err| match err {
                        err @ TemplateError::Runtime { .. } => err,
                        other => err_msg!(
                            Runtime,
                            "call to '{}.{}' failed",
                            extension,
                            method
                        )
                        .with_cause(other),
                    })?;
                self.stack.push(result);
            }
            Instr::LoadEnvAttr(name) => {
                let value = self.environment().attribute(name).ok_or_else(|| {
                    err_msg!(Runtime, "environment has no attribute '{}'", name)
                })?;
                self.stack.push(value);
            }
            Instr::LoadExtAttr { extension, name } => {
                let instance = self.environment().extension(extension).ok_or_else(|| {
                    err_msg!(
                        Runtime,
                        "extension '{}' is not registered with this environment",
                        extension
                    )
                })?;
                let value = instance.attribute(name).ok_or_else(|| {
                    err_msg!(Runtime, "extension '{}' has no attribute '{}'", extension, name)
                })?;
                self.stack.push(value);
            }
            Instr::LoadImport(index) => {
                let import = self.template.program.imports.get(*index).ok_or_else(|| {
                    err_msg!(Runtime, "import slot {} is out of range", index)
                })?;
                self.stack.push(import.value.clone());
            }
            Instr::LoadContext => {
                let context = self.context();
                self.stack.push(Value::Context(Arc::new(context)));
            }
            Instr::Jump(to) => *pc = *to,
            Instr::JumpIfFalse(to) => {
                if !self.pop()?.is_true() {
                    *pc = *to;
                }
            }
            Instr::JumpIfTrue(to) => {
                if self.pop()?.is_true() {
                    *pc = *to;
                }
            }
            Instr::PushScope => self.frames.push(OrdMap::new()),
            Instr::PopScope => {
                self.frames.pop();
            }
            Instr::PushLoop => {
                let iterable = self.pop()?;
                let items = iterable.iterate().ok_or_else(|| {
                    err_msg!(Runtime, "'{}' object is not iterable", iterable.type_name())
                })?;
                self.loops.push(LoopState { items, index: 0 });
            }
            Instr::ForNext { target, exit } => {
                let Some(state) = self.loops.last_mut() else {
                    return Err(err_msg!(Runtime, "FOR_NEXT outside of a loop"));
                };
                if state.index >= state.items.len() {
                    *pc = *exit;
                    return Ok(());
                }
                let item = state.items[state.index].clone();
                let loop_var = loop_variable(state.index, state.items.len());
                state.index += 1;
                self.frames.push(OrdMap::new());
                self.store("loop", loop_var);
                self.bind(target, item)?;
            }
            Instr::PopLoop => {
                let iterated = self.loops.pop().is_some_and(|state| state.index > 0);
                self.stack.push(Value::Bool(iterated));
            }
            Instr::Pop => {
                self.pop()?;
            }
            Instr::RenderBlock(name) => {
                let template = self.template;
                let block = template
                    .program
                    .blocks
                    .get(name)
                    .ok_or_else(|| err_msg!(Runtime, "block '{}' is not defined", name))?;
                self.frames.push(OrdMap::new());
                let result = self.run(block);
                self.frames.pop();
                result?;
            }
        }
        Ok(())
    }
}

/// The `loop` variable bound inside `for` bodies.
fn loop_variable(index0: usize, length: usize) -> Value {
    let mut map = OrdMap::new();
    map.insert("index".to_string(), Value::from(index0 + 1));
    map.insert("index0".to_string(), Value::from(index0));
    map.insert("revindex".to_string(), Value::from(length - index0));
    map.insert("revindex0".to_string(), Value::from(length - index0 - 1));
    map.insert("first".to_string(), Value::Bool(index0 == 0));
    map.insert("last".to_string(), Value::Bool(index0 + 1 == length));
    map.insert("length".to_string(), Value::from(length));
    Value::Map(map)
}

fn numbers(op: BinOp, left: &Value, right: &Value) -> Result<(f64, f64), TemplateError> {
    match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(err_msg!(
            Runtime,
            "unsupported operand types for {}: '{}' and '{}'",
            op.as_str(),
            left.type_name(),
            right.type_name()
        )),
    }
}

/// Upper bound on the byte length of a string built by `*`.
const MAX_REPEAT_LEN: usize = 10_000_000;

/// `s * count`. Non-positive counts give the empty string.
fn repeat(s: &str, count: f64) -> Result<String, TemplateError> {
    if !count.is_finite() {
        return Err(err_msg!(Runtime, "cannot repeat a string {} times", count));
    }
    if count <= 0.0 || s.is_empty() {
        return Ok(String::new());
    }
    let len = (count.trunc() as usize)
        .checked_mul(s.len())
        .filter(|&len| len <= MAX_REPEAT_LEN)
        .ok_or_else(|| {
            err_msg!(
                Runtime,
                "string repetition exceeds the limit of {} bytes",
                MAX_REPEAT_LEN
            )
        })?;
    Ok(s.repeat(len / s.len()))
}

fn unary(op: UnaryOp,operand: &Value) -> Result<Value, TemplateError> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!operand.is_true())),
        UnaryOp::Neg | UnaryOp::Pos => {
            let n = operand.as_number().ok_or_else(|| {
                err_msg!(Runtime, "bad operand type for unary {:?}: '{}'", op, operand.type_name())
            })?;
            Ok(Value::Number(if op == UnaryOp::Neg { -n } else { n }))
        }
    }
}

fn binary(op: BinOp, left: &Value, right: &Value) -> Result<Value, TemplateError> {
    let value = match op {
        BinOp::Add => match (left, right) {
            (Value::String(a), Value::String(b)) => Value::String(format!("{}{}", a, b)),
            (Value::List(a), Value::List(b)) => {
                let mut items = a.snapshot();
                items.extend(b.snapshot());
                Value::from(items)
            }
            _ => {
                let (a, b) = numbers(op, left, right)?;
                Value::Number(a + b)
            }
        },
        BinOp::Mul => match (left, right) {
            (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
                Value::String(repeat(s, *n)?)
            }
            _ => {
                let (a, b) = numbers(op, left, right)?;
                Value::Number(a * b)
            }
        },
        BinOp::Sub => {
            let (a, b) = numbers(op, left, right)?;
            Value::Number(a - b)
        }
        BinOp::Div | BinOp::FloorDiv | BinOp::Mod => {
            let (a, b) = numbers(op, left, right)?;
            if b == 0.0 {
                return Err(err_msg!(Runtime, "division by zero"));
            }
            Value::Number(match op {
                BinOp::Div => a / b,
                BinOp::FloorDiv => (a / b).floor(),
                _ => a - b * (a / b).floor(),
            })
        }
        BinOp::Pow => {
            let (a, b) = numbers(op, left, right)?;
            Value::Number(a.powf(b))
        }
        BinOp::Concat => Value::String(format!("{}{}", left, right)),
        BinOp::Eq => Value::Bool(left == right),
        BinOp::Ne => Value::Bool(left != right),
        BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq => {
            let ordering = left.compare(right).ok_or_else(|| {
                err_msg!(
                    Runtime,
                    "'{}' not supported between '{}' and '{}'",
                    op.as_str(),
                    left.type_name(),
                    right.type_name()
                )
            })?;
            Value::Bool(match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::LtEq => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
        BinOp::In | BinOp::NotIn => {
            let found = right.contains(left).ok_or_else(|| {
                err_msg!(
                    Runtime,
                    "argument of type '{}' is not a container",
                    right.type_name()
                )
            })?;
            Value::Bool(if op == BinOp::In { found } else { !found })
        }
        BinOp::And | BinOp::Or => {
            return Err(err_msg!(
                Runtime,
                "'{}' must be compiled as a short-circuit jump",
                op.as_str()
            ))
        }
    };
    Ok(value)
}

#[cfg(test)]
mod runtime_tests {
    use super::*;

    #[test]
    fn test_loop_variable_bounds() {
        let first = loop_variable(0, 3);
        assert_eq!(first.get_attr("index"), Value::from(1));
        assert_eq!(first.get_attr("first"), Value::Bool(true));
        assert_eq!(first.get_attr("last"), Value::Bool(false));
        let last = loop_variable(2, 3);
        assert_eq!(last.get_attr("revindex0"), Value::from(0));
        assert_eq!(last.get_attr("last"), Value::Bool(true));
    }

    #[test]
    fn test_binary_arithmetic() {
        let seven = Value::from(7);
        let two = Value::from(2);
        assert_eq!(binary(BinOp::FloorDiv, &seven, &two).unwrap(), Value::from(3));
        assert_eq!(binary(BinOp::Mod, &seven, &two).unwrap(), Value::from(1));
        assert_eq!(binary(BinOp::Div, &seven, &two).unwrap(), Value::from(3.5));
        assert!(binary(BinOp::Div, &seven, &Value::from(0)).is_err());
        assert_eq!(
            binary(BinOp::Concat, &Value::from("a"), &seven).unwrap(),
            Value::from("a7")
        );
    }

    #[test]
    fn test_repeat_bounds() {
        assert_eq!(repeat("ab", 3.0).unwrap(), "ababab");
        assert_eq!(repeat("ab", 0.0).unwrap(), "");
        assert_eq!(repeat("ab", -4.0).unwrap(), "");
        assert_eq!(repeat("", 1e30).unwrap(), "");
        assert!(repeat("ab", f64::INFINITY).is_err());
        assert!(repeat("ab", f64::NAN).is_err());
        assert!(repeat("ab", 1e20).is_err());
        assert!(repeat("x", (MAX_REPEAT_LEN + 1) as f64).is_err());
    }
}
