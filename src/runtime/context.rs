//! Render context.
//!
//! A [`Context`] is the snapshot handed to templates through
//! `ContextReference`: the variables visible at the point of reference and
//! the block registry of the template being rendered.

use std::fmt;

use im::OrdMap;

use crate::ast::Value;

/// Variables and block registry as they stood when `ContextReference` was
/// evaluated. This is a snapshot: bindings made afterwards, including by the
/// extension call that received it, are not reflected.
#[derive(Debug, Clone, Default)]
pub struct Context {
    name: Option<String>,
    vars: OrdMap<String, Value>,
    blocks: OrdMap<String, Value>,
}

impl Context {
    pub fn new(
        name: Option<&str>,
        vars: OrdMap<String, Value>,
        block_names: impl IntoIterator<Item = String>,
    ) -> Self {
        let blocks = block_names
            .into_iter()
            .map(|block| {
                let marker = Value::String(format!("<block '{}'>", block));
                (block, marker)
            })
            .collect();
        Self {
            name: name.map(str::to_string),
            vars,
            blocks,
        }
    }

    /// Name of the template being rendered.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    pub fn vars(&self) -> &OrdMap<String, Value> {
        &self.vars
    }

    /// The block registry as a map from block name to block marker. Displays
    /// as `{}` when the template defines no blocks.
    pub fn blocks(&self) -> Value {
        Value::Map(self.blocks.clone())
    }

    pub fn has_block(&self, name: &str) -> bool {
        self.blocks.contains_key(name)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Context {}>", self.blocks())
    }
}

#[cfg(test)]
mod context_tests {
    use super::*;

    #[test]
    fn test_later_bindings_are_not_reflected() {
        let mut vars = OrdMap::new();
        vars.insert("a".to_string(), Value::from(1));
        let context = Context::new(Some("page.html"), vars.clone(), vec!["body".to_string()]);

        vars.insert("b".to_string(), Value::from(2));
        vars.insert("a".to_string(), Value::from(3));
        assert_eq!(context.get("a"), Some(&Value::from(1)));
        assert_eq!(context.get("b"), None);
        assert!(context.has_block("body"));
        assert_eq!(context.name(), Some("page.html"));
    }
}
