//! # Template Filters
//!
//! Filters are the `|name(args)` operations applied to a value. Each filter
//! receives the piped value and its positional arguments.
//!
//! ## Filters Provided
//!
//! - **`upper`**, **`lower`**, **`trim`**: string case and whitespace.
//! - **`length`**: item count of strings, lists and maps.
//! - **`join`**: joins an iterable with a separator.
//! - **`default`**: replaces undefined values.
//! - **`first`**, **`last`**, **`reverse`**: sequence access.
//! - **`string`**: string form of any value.

use std::sync::Arc;

use im::HashMap;

use crate::ast::Value;
use crate::TemplateError;

/// Signature of a filter: piped value, then positional arguments.
pub type FilterFn = Arc<dyn Fn(&Value, &[Value]) -> Result<Value, TemplateError> + Send + Sync>;

// Registry for all filters, inspectable at runtime.
#[derive(Clone, Default)]
pub struct FilterRegistry {
    filters: HashMap<String, FilterFn>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in filters.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        register_builtin_filters(&mut registry);
        registry
    }

    pub fn get(&self, name: &str) -> Option<&FilterFn> {
        self.filters.get(name)
    }

    pub fn register<F>(&mut self, name: &str, filter: F)
    where
        F: Fn(&Value, &[Value]) -> Result<Value, TemplateError> + Send + Sync + 'static,
    {
        self.filters.insert(name.to_string(), Arc::new(filter));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.filters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FilterRegistry").field(&self.names()).finish()
    }
}

fn expect_arity(name: &str, args: &[Value], max: usize) -> Result<(), TemplateError> {
    if args.len() > max {
        return Err(err_msg!(
            Runtime,
            "filter '{}' takes at most {} argument(s), got {}",
            name,
            max,
            args.len()
        ));
    }
    Ok(())
}

fn not_iterable(name: &str, value: &Value) -> TemplateError {
    err_msg!(
        Runtime,
        "filter '{}' expects a sequence, got {}",
        name,
        value.type_name()
    )
}

// ============================================================================
// BUILT-IN FILTERS
// ============================================================================

/// Registers every built-in filter with `registry`.
pub fn register_builtin_filters(registry: &mut FilterRegistry) {
    registry.register("upper", |value, args| {
        expect_arity("upper", args, 0)?;
        Ok(Value::String(value.to_string().to_uppercase()))
    });
    registry.register("lower", |value, args| {
        expect_arity("lower", args, 0)?;
        Ok(Value::String(value.to_string().to_lowercase()))
    });
    registry.register("trim", |value, args| {
        expect_arity("trim", args, 0)?;
        Ok(Value::String(value.to_string().trim().to_string()))
    });
    registry.register("string", |value, args| {
        expect_arity("string", args, 0)?;
        Ok(Value::String(value.to_string()))
    });
    registry.register("length", filter_length);
    registry.register("join", filter_join);
    registry.register("default", |value, args| {
        expect_arity("default", args, 1)?;
        if value.is_undefined() {
            Ok(args.first().cloned().unwrap_or_else(|| Value::from("")))
        } else {
            Ok(value.clone())
        }
    });
    registry.register("first", |value, args| {
        expect_arity("first", args, 0)?;
        let items = value.iterate().ok_or_else(|| not_iterable("first", value))?;
        Ok(items.into_iter().next().unwrap_or_default())
    });
    registry.register("last", |value, args| {
        expect_arity("last", args, 0)?;
        let items = value.iterate().ok_or_else(|| not_iterable("last", value))?;
        Ok(items.into_iter().next_back().unwrap_or_default())
    });
    registry.register("reverse", |value, args| {
        expect_arity("reverse", args, 0)?;
        match value {
            Value::String(s) => Ok(Value::String(s.chars().rev().collect())),
            other => {
                let mut items = other.iterate().ok_or_else(|| not_iterable("reverse", other))?;
                items.reverse();
                Ok(Value::from(items))
            }
        }
    });
}

/// Usage: `value|length`
fn filter_length(value: &Value, args: &[Value]) -> Result<Value, TemplateError> {
    expect_arity("length", args, 0)?;
    let len = match value {
        Value::String(s) => s.chars().count(),
        Value::List(list) => list.len(),
        Value::Map(map) => map.len(),
        Value::Undefined => 0,
        other => return Err(not_iterable("length", other)),
    };
    Ok(Value::from(len))
}

/// Usage: `items|join(", ")`
fn filter_join(value: &Value, args: &[Value]) -> Result<Value, TemplateError> {
    expect_arity("join", args, 1)?;
    let separator = args.first().map(|v| v.to_string()).unwrap_or_default();
    let items = value.iterate().ok_or_else(|| not_iterable("join", value))?;
    let joined = items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(&separator);
    Ok(Value::String(joined))
}
