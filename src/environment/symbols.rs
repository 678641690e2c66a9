//! Symbol table for `ImportedName` nodes.
//!
//! Extensions refer to host values by fully qualified name
//! (`"myapp.helpers.slugify"`). The compiler resolves each name once, when the
//! template is loaded, through an [`ImportResolver`]; an unknown name is an
//! `Import` error at compile time rather than a failure mid-render.

use im::HashMap;

use crate::ast::Value;

/// Resolves fully qualified names to values at template load time.
pub trait ImportResolver {
    fn resolve(&self, name: &str) -> Option<Value>;
}

/// The environment's registry of importable values.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: HashMap<String, Value>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `value` under the fully qualified `name`, replacing any
    /// previous registration.
    pub fn register(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.symbols.insert(name.into(), value.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.symbols.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl ImportResolver for SymbolTable {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.symbols.get(name).cloned()
    }
}
