//! # Stencil Environment
//!
//! The [`Environment`] owns everything a template needs from compile to
//! render: its extension instances, globals, filters, importable symbols and
//! render-time attributes. It drives the pipeline:
//!
//! ```text
//! source ─▶ preprocess chain ─▶ lexer ─▶ filter chain ─▶ parser ─▶ compiler ─▶ Program
//! ```
//!
//! ## Identity
//!
//! Every environment has a process-unique [`EnvironmentId`]. Extension
//! instances hold the id of their owner instead of a reference to it;
//! [`Environment::overlay`] builds a new environment with a new id and fresh
//! extension instances bound to that id.
//!
//! ## Attributes
//!
//! `sandboxed`, `trim_blocks` and `keep_trailing_newline` plus any user
//! attributes live behind a lock and are read when they are used, so a value
//! set after a template was compiled is what that template observes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::ast::{StmtNode, Value};
use crate::compiler::{Compiler, Program};
use crate::extensions::{
    identifier_of, Extension, ExtensionCatalog, ExtensionRegistry, ExtensionSpec,
};
use crate::parser::Parser;
use crate::runtime::{FilterRegistry, Template};
use crate::syntax::{tokenize, LexerOptions, TokenIter, TokenStream};
use crate::TemplateError;

pub mod config;
pub mod symbols;

pub use config::{ConfigOverrides, EnvironmentConfig};
pub use symbols::{ImportResolver, SymbolTable};

static NEXT_ENVIRONMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an [`Environment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvironmentId(u64);

impl EnvironmentId {
    fn next() -> Self {
        Self(NEXT_ENVIRONMENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "env#{}", self.0)
    }
}

/// Attribute names backed by configuration fields.
const BUILTIN_ATTRIBUTES: &[&str] = &["sandboxed", "trim_blocks", "keep_trailing_newline"];

pub struct Environment {
    id: EnvironmentId,
    /// The environment this one was overlaid from.
    linked_to: Option<EnvironmentId>,
    config: EnvironmentConfig,
    specs: Vec<ExtensionSpec>,
    extensions: ExtensionRegistry,
    globals: im::HashMap<String, Value>,
    filters: FilterRegistry,
    symbols: SymbolTable,
    attributes: RwLock<BTreeMap<String, Value>>,
}

impl Environment {
    /// Builds an environment from configuration, resolving extension names
    /// against the built-in catalog.
    pub fn new(config: EnvironmentConfig) -> Result<Self, TemplateError> {
        Self::builder().config(config).build()
    }

    /// Like [`new`](Self::new), with a caller-supplied catalog.
    pub fn from_config(
        config: EnvironmentConfig,
        catalog: &ExtensionCatalog,
    ) -> Result<Self, TemplateError> {
        Self::builder().config(config).catalog(catalog.clone()).build()
    }

    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::new()
    }

    pub fn id(&self) -> EnvironmentId {
        self.id
    }

    /// True for environments created by [`overlay`](Self::overlay).
    pub fn is_overlay(&self) -> bool {
        self.linked_to.is_some()
    }

    pub fn linked_to(&self) -> Option<EnvironmentId> {
        self.linked_to
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    /// A new environment with this one's configuration, globals, filters,
    /// symbols and attributes, the given overrides applied, and freshly built
    /// extension instances owned by the new environment.
    ///
    /// Attributes start from the parent's current values, including any set
    /// with [`set_attribute`](Self::set_attribute) after construction. Only
    /// the fields set on `overrides` replace them.
    pub fn overlay(&self, overrides: ConfigOverrides) -> Result<Environment, TemplateError> {
        let id = EnvironmentId::next();
        let mut config = self.config.clone();
        overrides.apply(&mut config);

        let mut specs = self.specs.clone();
        specs.extend(overrides.extensions.iter().cloned());
        let extensions = ExtensionRegistry::instantiate(&specs, id)?;

        let mut attributes = self.read_attributes().clone();
        insert_overridden_attributes(&mut attributes, &overrides);

        debug!(parent = %self.id, environment = %id, "overlay created");
        Ok(Environment {
            id,
            linked_to: Some(self.id),
            config,
            specs,
            extensions,
            globals: self.globals.clone(),
            filters: self.filters.clone(),
            symbols: self.symbols.clone(),
            attributes: RwLock::new(attributes),
        })
    }

    // ------------------------------------------------------------------------
    // Extensions, globals, filters, symbols
    // ------------------------------------------------------------------------

    pub fn extensions(&self) -> &ExtensionRegistry {
        &self.extensions
    }

    /// The instance registered under `identifier`.
    pub fn extension(&self, identifier: &str) -> Option<&Arc<dyn Extension>> {
        self.extensions.get(identifier)
    }

    /// The instance of extension type `E`.
    pub fn extension_of<E: Extension + 'static>(&self) -> Option<&Arc<dyn Extension>> {
        self.extensions.get(identifier_of::<E>())
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    pub fn add_global(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.globals.insert(name.into(), value.into());
    }

    pub fn filters(&self) -> &FilterRegistry {
        &self.filters
    }

    pub fn add_filter<F>(&mut self, name: &str, filter: F)
    where
        F: Fn(&Value, &[Value]) -> Result<Value, TemplateError> + Send + Sync + 'static,
    {
        self.filters.register(name, filter);
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Makes `value` importable under the fully qualified `name`.
    pub fn register_import(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.symbols.register(name, value);
    }

    // ------------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------------

    fn read_attributes(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Value>> {
        self.attributes.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current value of an environment attribute.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.read_attributes().get(name).cloned()
    }

    /// Sets an attribute; templates observe it on their next render.
    pub fn set_attribute(&self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        debug!(environment = %self.id, attribute = %name, "attribute set");
        self.attributes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, value.into());
    }

    pub fn lexer_options(&self) -> LexerOptions {
        let flag = |name: &str| self.attribute(name).is_some_and(|v| v.is_true());
        LexerOptions {
            trim_blocks: flag("trim_blocks"),
            keep_trailing_newline: flag("keep_trailing_newline"),
        }
    }

    // ------------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------------

    /// Runs the preprocess chain.
    pub fn preprocess(
        &self,
        source: &str,
        name: Option<&str>,
        filename: Option<&str>,
    ) -> Result<String, TemplateError> {
        self.extensions
            .preprocess(source, name, filename)
            .map_err(|err| err.with_name(name))
    }

    /// Lexes already preprocessed source and wraps the result in the filter
    /// chain. Nothing is scanned until the returned iterator is pulled.
    pub fn tokenize<'s>(&'s self, source: &'s str) -> TokenIter<'s> {
        let lexer: TokenIter<'s> = Box::new(tokenize(source, self.lexer_options()));
        self.extensions.filter_stream(lexer)
    }

    /// Preprocesses, lexes, filters and parses `source`.
    pub fn parse(
        &self,
        source: &str,
        name: Option<&str>,
        filename: Option<&str>,
    ) -> Result<Vec<StmtNode>, TemplateError> {
        let source = self.preprocess(source, name, filename)?;
        let parsed = TokenStream::new(self.tokenize(&source))
            .and_then(|stream| Parser::new(stream, &self.extensions, name).parse());
        parsed.map_err(|err| err.with_template(name, &source))
    }

    /// Lowers a parsed template.
    pub fn compile_ast(
        &self,
        body: &[StmtNode],
        name: Option<&str>,
    ) -> Result<Program, TemplateError> {
        Compiler::new(name, &self.symbols, &self.filters).compile(body)
    }

    /// Runs the full pipeline on `source`.
    pub fn compile(
        &self,
        source: &str,
        name: Option<&str>,
        filename: Option<&str>,
    ) -> Result<Program, TemplateError> {
        let body = self.parse(source, name, filename)?;
        self.compile_ast(&body, name)
            .map_err(|err| err.with_template(name, source))
    }

    /// Compiles an unnamed template.
    pub fn from_string(&self, source: &str) -> Result<Template<'_>, TemplateError> {
        self.compile(source, None, None)
            .map(|program| Template::new(self, program))
    }

    /// Compiles a named template.
    pub fn from_source(&self, source: &str, name: &str) -> Result<Template<'_>, TemplateError> {
        self.compile(source, Some(name), Some(name))
            .map(|program| Template::new(self, program))
    }

    /// Binds an already compiled program to this environment.
    pub fn template(&self, program: Program) -> Template<'_> {
        Template::new(self, program)
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("id", &self.id)
            .field("linked_to", &self.linked_to)
            .field("extensions", &self.extensions)
            .finish_non_exhaustive()
    }
}

fn insert_builtin_attributes(attributes: &mut BTreeMap<String, Value>, config: &EnvironmentConfig) {
    let values = [config.sandboxed, config.trim_blocks, config.keep_trailing_newline];
    for (name, value) in BUILTIN_ATTRIBUTES.iter().zip(values) {
        attributes.insert(name.to_string(), Value::Bool(value));
    }
}

fn insert_overridden_attributes(
    attributes: &mut BTreeMap<String, Value>,
    overrides: &ConfigOverrides,
) {
    let values = [
        overrides.sandboxed,
        overrides.trim_blocks,
        overrides.keep_trailing_newline,
    ];
    for (name, value) in BUILTIN_ATTRIBUTES.iter().zip(values) {
        if let Some(value) = value {
            attributes.insert(name.to_string(), Value::Bool(value));
        }
    }
}

/// Globals every environment starts with.
fn default_globals() -> im::HashMap<String, Value> {
    let mut globals = im::HashMap::new();
    globals.insert("range".to_string(), Value::from_fn("range", range));
    globals
}

/// Most items `range()` will produce.
const MAX_RANGE: usize = 100_000;

/// `range(stop)`, `range(start, stop)` or `range(start, stop, step)`.
fn range(args: &[Value]) -> Result<Value, TemplateError> {
    let numbers = args
        .iter()
        .map(|arg| {
            arg.as_number()
                .ok_or_else(|| err_msg!(Runtime, "range() expects numbers, got {}", arg.type_name()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let (start, stop, step) = match numbers.as_slice() {
        [stop] => (0.0, *stop, 1.0),
        [start, stop] => (*start, *stop, 1.0),
        [start, stop, step] => (*start, *stop, *step),
        _ => {
            return Err(err_msg!(
                Runtime,
                "range() takes 1 to 3 arguments, got {}",
                args.len()
            ))
        }
    };
    if !(start.is_finite() && stop.is_finite() && step.is_finite()) {
        return Err(err_msg!(Runtime, "range() arguments must be finite"));
    }
    if step == 0.0 {
        return Err(err_msg!(Runtime, "range() step must not be zero"));
    }
    let count = ((stop - start) / step).ceil().max(0.0);
    if count > MAX_RANGE as f64 {
        return Err(err_msg!(
            Runtime,
            "range() would produce {} items, more than the limit of {}",
            count,
            MAX_RANGE
        ));
    }
    let items: Vec<Value> = (0..count as usize)
        .map(|i| Value::Number(start + step * i as f64))
        .collect();
    Ok(Value::from(items))
}

// ============================================================================
// BUILDER
// ============================================================================

/// Assembles an [`Environment`] from configuration and code.
pub struct EnvironmentBuilder {
    config: EnvironmentConfig,
    catalog: Option<ExtensionCatalog>,
    specs: Vec<ExtensionSpec>,
    globals: im::HashMap<String, Value>,
    filters: FilterRegistry,
    symbols: SymbolTable,
    attributes: BTreeMap<String, Value>,
}

impl Default for EnvironmentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentBuilder {
    pub fn new() -> Self {
        Self {
            config: EnvironmentConfig::default(),
            catalog: None,
            specs: Vec::new(),
            globals: default_globals(),
            filters: FilterRegistry::with_builtins(),
            symbols: SymbolTable::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn config(mut self, config: EnvironmentConfig) -> Self {
        self.config = config;
        self
    }

    /// Catalog used to resolve extension names in the configuration.
    pub fn catalog(mut self, catalog: ExtensionCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn extension<E: Extension + 'static>(mut self) -> Self {
        self.specs.push(ExtensionSpec::of::<E>());
        self
    }

    pub fn extension_spec(mut self, spec: ExtensionSpec) -> Self {
        self.specs.push(spec);
        self
    }

    /// Adds an extension by catalog name or identifier.
    pub fn extension_name(mut self, name: impl Into<String>) -> Self {
        self.config.extensions.push(name.into());
        self
    }

    pub fn trim_blocks(mut self, value: bool) -> Self {
        self.config.trim_blocks = value;
        self
    }

    pub fn keep_trailing_newline(mut self, value: bool) -> Self {
        self.config.keep_trailing_newline = value;
        self
    }

    pub fn sandboxed(mut self, value: bool) -> Self {
        self.config.sandboxed = value;
        self
    }

    pub fn global(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.globals.insert(name.into(), value.into());
        self
    }

    pub fn function<F>(mut self, name: &str, func: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, TemplateError> + Send + Sync + 'static,
    {
        self.globals.insert(name.to_string(), Value::from_fn(name, func));
        self
    }

    pub fn filter<F>(mut self, name: &str, filter: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> Result<Value, TemplateError> + Send + Sync + 'static,
    {
        self.filters.register(name, filter);
        self
    }

    pub fn import(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.symbols.register(name, value);
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> Result<Environment, TemplateError> {
        let id = EnvironmentId::next();
        let catalog = self.catalog.unwrap_or_else(ExtensionCatalog::builtin);
        let mut specs = self
            .config
            .extensions
            .iter()
            .map(|name| catalog.resolve(name))
            .collect::<Result<Vec<_>, _>>()?;
        specs.extend(self.specs);
        let extensions = ExtensionRegistry::instantiate(&specs, id)?;

        let mut globals = self.globals;
        for (name, json) in &self.config.globals {
            globals.insert(name.clone(), Value::from_json(json.clone()));
        }

        let mut attributes: BTreeMap<String, Value> = self
            .config
            .attributes
            .iter()
            .map(|(name, json)| (name.clone(), Value::from_json(json.clone())))
            .collect();
        attributes.extend(self.attributes);
        insert_builtin_attributes(&mut attributes, &self.config);

        debug!(
            environment = %id,
            extensions = extensions.len(),
            globals = globals.len(),
            "environment created"
        );
        Ok(Environment {
            id,
            linked_to: None,
            config: self.config,
            specs,
            extensions,
            globals,
            filters: self.filters,
            symbols: self.symbols,
            attributes: RwLock::new(attributes),
        })
    }
}

#[cfg(test)]
mod environment_tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = Environment::builder().build().unwrap();
        let b = Environment::builder().build().unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_range() {
        assert_eq!(
            range(&[Value::from(3)]).unwrap(),
            Value::from(vec![Value::from(0), Value::from(1), Value::from(2)])
        );
        assert_eq!(
            range(&[Value::from(5), Value::from(0), Value::from(-2)]).unwrap(),
            Value::from(vec![Value::from(5), Value::from(3), Value::from(1)])
        );
        assert!(range(&[Value::from(1), Value::from(2), Value::from(0)]).is_err());
    }

    #[test]
    fn test_range_limits() {
        assert_eq!(range(&[Value::from(0)]).unwrap(), Value::from(Vec::new()));
        assert_eq!(range(&[Value::from(3), Value::from(1)]).unwrap(), Value::from(Vec::new()));
        assert!(range(&[Value::from(MAX_RANGE)]).is_ok());
        assert!(range(&[Value::from(MAX_RANGE + 1)]).is_err());
        assert!(range(&[Value::from(1e20)]).is_err());
        assert!(range(&[Value::from(f64::INFINITY)]).is_err());
        assert!(range(&[Value::from(0), Value::from(f64::NAN)]).is_err());
    }

    #[test]
    fn test_overlay_keeps_live_parent_attributes() {
        let env = Environment::builder().build().unwrap();
        env.set_attribute("sandboxed", true);
        env.set_attribute("site", "Example");

        let overlay = env.overlay(ConfigOverrides::new()).unwrap();
        assert_eq!(overlay.attribute("sandboxed"), Some(Value::Bool(true)));
        assert_eq!(overlay.attribute("site"), Some(Value::from("Example")));

        let overlay = env
            .overlay(ConfigOverrides::new().sandboxed(false).trim_blocks(true))
            .unwrap();
        assert_eq!(overlay.attribute("sandboxed"), Some(Value::Bool(false)));
        assert!(overlay.lexer_options().trim_blocks);
    }

    #[test]
    fn test_builtin_attributes_follow_config() {
        let env = Environment::builder().sandboxed(true).build().unwrap();
        assert_eq!(env.attribute("sandboxed"), Some(Value::Bool(true)));
        assert_eq!(env.attribute("trim_blocks"), Some(Value::Bool(false)));
        assert!(env.attribute("missing").is_none());
    }
}
