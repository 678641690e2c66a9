use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use im::OrdMap;

use crate::runtime::Context;
use crate::TemplateError;

/// Signature of native callables exposed to templates.
pub type NativeFn = dyn Fn(&[Value]) -> Result<Value, TemplateError> + Send + Sync;

/// Represents a value in the Stencil runtime.
///
/// # Examples
///
/// ```rust
/// use stencil::Value;
/// let n = Value::from(3);
/// assert_eq!(n.to_string(), "3");
/// assert_eq!(Value::from(false).to_string(), "False");
/// assert_eq!(Value::Undefined.to_string(), "");
/// ```
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// A name that resolved to nothing. Renders as the empty string.
    #[default]
    Undefined,
    None,
    Bool(bool),
    Number(f64),
    String(String),
    List(List),
    Map(OrdMap<String, Value>),
    Function(Function),
    Context(Arc<Context>),
}

impl Value {
    /// Returns the type name of the value as a string.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Function(_) => "function",
            Value::Context(_) => "context",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Template truthiness.
    pub fn is_true(&self) -> bool {
        match self {
            Value::Undefined | Value::None => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(list) => !list.is_empty(),
            Value::Map(map) => !map.is_empty(),
            Value::Function(_) | Value::Context(_) => true,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Wraps a native function.
    pub fn from_fn<F>(name: &str, func: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, TemplateError> + Send + Sync + 'static,
    {
        Value::Function(Function {
            name: name.to_string(),
            func: Arc::new(func),
        })
    }

    /// Converts a JSON document into a template value.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(List::new(items.into_iter().map(Value::from_json).collect()))
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// The items a `for` loop walks over, or `None` if not iterable.
    pub fn iterate(&self) -> Option<Vec<Value>> {
        match self {
            Value::List(list) => Some(list.snapshot()),
            Value::String(s) => Some(s.chars().map(|c| Value::String(c.to_string())).collect()),
            Value::Map(map) => Some(map.keys().cloned().map(Value::String).collect()),
            Value::Undefined => Some(Vec::new()),
            _ => None,
        }
    }

    /// Ordering for `<`, `>`, and friends. Only numbers and strings compare.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => self.as_number()?.partial_cmp(&other.as_number()?),
        }
    }

    /// Membership test for `in`.
    pub fn contains(&self, needle: &Value) -> Option<bool> {
        match self {
            Value::List(list) => Some(list.snapshot().iter().any(|v| v == needle)),
            Value::String(s) => needle.as_str().map(|n| s.contains(n)),
            Value::Map(map) => needle.as_str().map(|n| map.contains_key(n)),
            _ => None,
        }
    }

    /// Attribute-style lookup (`x.name`).
    pub fn get_attr(&self, name: &str) -> Value {
        match self {
            Value::Map(map) => map.get(name).cloned().unwrap_or_default(),
            Value::Context(ctx) if name == "blocks" => ctx.blocks(),
            Value::Context(ctx) => ctx.get(name).cloned().unwrap_or_default(),
            _ => Value::Undefined,
        }
    }

    /// Subscript lookup (`x[key]`).
    pub fn get_item(&self, key: &Value) -> Value {
        match (self, key) {
            (Value::List(list), Value::Number(n)) => {
                let items = list.snapshot();
                let len = items.len() as i64;
                let mut idx = *n as i64;
                if idx < 0 {
                    idx += len;
                }
                usize::try_from(idx)
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or_default()
            }
            (Value::String(s), Value::Number(n)) => {
                let idx = *n as i64;
                usize::try_from(idx)
                    .ok()
                    .and_then(|i| s.chars().nth(i))
                    .map(|c| Value::String(c.to_string()))
                    .unwrap_or_default()
            }
            (_, Value::String(name)) => self.get_attr(name),
            _ => Value::Undefined,
        }
    }

    /// Quoted form used inside list and map displays.
    fn fmt_repr(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "'{}'", s.replace('\'', "\\'")),
            Value::Undefined => f.write_str("Undefined"),
            other => write!(f, "{}", other),
        }
    }

    fn fmt_list(f: &mut fmt::Formatter<'_>, list: &List) -> fmt::Result {
        let Some(_guard) = CycleGuard::enter(list) else {
            return f.write_str("[...]");
        };
        write!(f, "[")?;
        for (i, item) in list.snapshot().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            item.fmt_repr(f)?;
        }
        write!(f, "]")
    }

    fn fmt_map(f: &mut fmt::Formatter<'_>, map: &OrdMap<String, Value>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in map.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "'{}': ", k)?;
            v.fmt_repr(f)?;
        }
        write!(f, "}}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => Ok(()),
            Value::None => f.write_str("None"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::String(s) => f.write_str(s),
            Value::List(list) => Value::fmt_list(f, list),
            Value::Map(map) => Value::fmt_map(f, map),
            Value::Function(func) => write!(f, "<function {}>", func.name),
            Value::Context(ctx) => write!(f, "{}", ctx),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(&a.func, &b.func),
            (Value::Context(a), Value::Context(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(List::new(items))
    }
}

// ============================================================================
// SHARED LIST
// ============================================================================

/// A list with reference semantics: `items.append(x)` inside a template is
/// visible through every binding of `items`.
#[derive(Clone, Default)]
pub struct List(Arc<RwLock<Vec<Value>>>);

impl List {
    pub fn new(items: Vec<Value>) -> Self {
        Self(Arc::new(RwLock::new(items)))
    }

    /// A copy of the current items.
    pub fn snapshot(&self) -> Vec<Value> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.0.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identity of the shared storage.
    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn push(&self, value: Value) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(value);
    }

    pub fn pop(&self) -> Option<Value> {
        self.0.write().unwrap_or_else(PoisonError::into_inner).pop()
    }
}

impl PartialEq for List {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        // A list reached again mid-comparison compares unequal.
        let Some(_guard) = CycleGuard::enter(self) else {
            return false;
        };
        self.snapshot() == other.snapshot()
    }
}

impl fmt::Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(_guard) = CycleGuard::enter(self) else {
            return f.write_str("[...]");
        };
        f.debug_list().entries(self.snapshot()).finish()
    }
}

thread_local! {
    /// Lists currently being formatted or compared on this thread.
    static ACTIVE_LISTS: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks a list as active until dropped. A list may contain itself through
/// `append`, so recursive walks stop at the first repeat.
struct CycleGuard(usize);

impl CycleGuard {
    fn enter(list: &List) -> Option<Self> {
        let addr = list.addr();
        ACTIVE_LISTS.with(|active| {
            let mut active = active.borrow_mut();
            if active.contains(&addr) {
                return None;
            }
            active.push(addr);
            Some(CycleGuard(addr))
        })
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        ACTIVE_LISTS.with(|active| {
            let mut active = active.borrow_mut();
            if let Some(pos) = active.iter().rposition(|&addr| addr == self.0) {
                active.remove(pos);
            }
        });
    }
}

// ============================================================================
// NATIVE FUNCTIONS
// ============================================================================

/// A named native callable.
#[derive(Clone)]
pub struct Function {
    pub name: String,
    func: Arc<NativeFn>,
}

impl Function {
    pub fn call(&self, args: &[Value]) -> Result<Value, TemplateError> {
        (self.func)(args)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {}>", self.name)
    }
}
