//! Extension registry and catalog.
//!
//! # Error Handling
//!
//! Registry construction fails with a `Configuration` error, never at parse
//! time, when two extensions claim the same tag keyword or an extension
//! claims a keyword of the core grammar.
//!
//! # Chain ordering
//!
//! The preprocess and filter chains run in priority order; extensions with
//! equal priority keep registration order. Preprocessing always completes
//! before the first filter pulls a token.
//!
//! # Summary Table
//! | Type                | Holds                         | Lifetime                    |
//! |---------------------|-------------------------------|-----------------------------|
//! | `ExtensionCatalog`  | name → `ExtensionSpec`        | process-wide, user-built    |
//! | `ExtensionRegistry` | identifier → instance, tags   | one per `Environment`       |

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::environment::EnvironmentId;
use crate::extensions::{
    identifier_of, Extension, ExtensionSpec, ExprStmtExtension, LoopControlsExtension,
    WithExtension,
};
use crate::parser::RESERVED_KEYWORDS;
use crate::syntax::TokenIter;
use crate::TemplateError;

/// The extension instances owned by one environment.
#[derive(Default)]
pub struct ExtensionRegistry {
    /// Instances in registration order.
    entries: Vec<Arc<dyn Extension>>,
    by_identifier: HashMap<String, usize>,
    tags: HashMap<String, usize>,
    /// Indices into `entries`, sorted by priority (stable).
    chain: Vec<usize>,
}

impl ExtensionRegistry {
    /// Builds one fresh instance per spec, bound to `environment`.
    pub fn instantiate(
        specs: &[ExtensionSpec],
        environment: EnvironmentId,
    ) -> Result<Self, TemplateError> {
        let mut registry = Self::default();
        for spec in specs {
            if registry.by_identifier.contains_key(spec.identifier()) {
                debug!(extension = spec.identifier(), "skipping duplicate extension");
                continue;
            }
            registry.insert(spec.instantiate(environment))?;
        }
        registry.chain = (0..registry.entries.len()).collect();
        let entries = &registry.entries;
        registry.chain.sort_by_key(|&i| entries[i].priority());
        debug!(
            environment = %environment,
            extensions = registry.entries.len(),
            tags = registry.tags.len(),
            "extension registry ready"
        );
        Ok(registry)
    }

    fn insert(&mut self, extension: Arc<dyn Extension>) -> Result<(), TemplateError> {
        let identifier = extension.identifier().to_string();
        if self.by_identifier.contains_key(&identifier) {
            debug!(extension = %identifier, "skipping duplicate extension");
            return Ok(());
        }
        let index = self.entries.len();
        for tag in extension.tags() {
            if RESERVED_KEYWORDS.contains(tag) {
                return Err(err_msg!(
                    Configuration,
                    "extension '{}' claims tag '{}', which is reserved by the core grammar",
                    identifier,
                    tag
                ));
            }
            if let Some(&owner) = self.tags.get(*tag) {
                return Err(err_msg!(
                    Configuration,
                    "tag '{}' is claimed by both '{}' and '{}'",
                    tag,
                    self.entries[owner].identifier(),
                    identifier
                ));
            }
            self.tags.insert(tag.to_string(), index);
        }
        self.by_identifier.insert(identifier, index);
        self.entries.push(extension);
        Ok(())
    }

    /// Looks up an instance by identifier.
    pub fn get(&self, identifier: &str) -> Option<&Arc<dyn Extension>> {
        self.by_identifier
            .get(identifier)
            .map(|&index| &self.entries[index])
    }

    /// Looks up an instance by extension type.
    pub fn get_type<E: Extension + 'static>(&self) -> Option<&Arc<dyn Extension>> {
        self.get(identifier_of::<E>())
    }

    /// The extension owning tag keyword `tag`, if any.
    pub fn for_tag(&self, tag: &str) -> Option<&Arc<dyn Extension>> {
        self.tags.get(tag).map(|&index| &self.entries[index])
    }

    /// Instances in chain order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Extension>> + '_ {
        self.chain.iter().map(move |&index| &self.entries[index])
    }

    /// Identifiers in registration order.
    pub fn identifiers(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.identifier()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs every preprocess hook, threading each output into the next.
    pub fn preprocess(
        &self,
        source: &str,
        name: Option<&str>,
        filename: Option<&str>,
    ) -> Result<String, TemplateError> {
        let mut source = source.to_string();
        for extension in self.iter() {
            trace!(extension = extension.identifier(), "preprocess");
            source = extension
                .preprocess(source, name, filename)
                .map_err(|err| match err {
                    err @ TemplateError::Preprocess { .. } => err,
                    other => err_msg!(
                        Preprocess,
                        "extension '{}' failed to preprocess the source",
                        extension.identifier()
                    )
                    .with_cause(other),
                })?;
        }
        Ok(source)
    }

    /// Wraps `stream` in every filter hook; the first extension in chain order
    /// reads the lexer output directly.
    pub fn filter_stream<'s>(&'s self, stream: TokenIter<'s>) -> TokenIter<'s> {
        self.iter()
            .fold(stream, |stream, extension| extension.filter_stream(stream))
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("extensions", &self.identifiers())
            .field("tags", &self.tags.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// CATALOG: name → spec resolution for configuration files
// ============================================================================

/// Resolves extension names used in configuration to specs.
///
/// Names may be a full identifier or a registered alias.
#[derive(Debug, Clone, Default)]
pub struct ExtensionCatalog {
    specs: HashMap<String, ExtensionSpec>,
}

impl ExtensionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The catalog of extensions shipped with Stencil, under both their
    /// identifiers and the aliases `loopcontrols`, `do` and `with`.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register_as("loopcontrols", ExtensionSpec::of::<LoopControlsExtension>());
        catalog.register_as("do", ExtensionSpec::of::<ExprStmtExtension>());
        catalog.register_as("with", ExtensionSpec::of::<WithExtension>());
        catalog
    }

    /// Registers a spec under its identifier.
    pub fn register(&mut self, spec: ExtensionSpec) {
        self.specs.insert(spec.identifier().to_string(), spec);
    }

    /// Registers a spec under its identifier and an alias.
    pub fn register_as(&mut self, alias: &str, spec: ExtensionSpec) {
        self.specs.insert(alias.to_string(), spec.clone());
        self.register(spec);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    /// Resolves a configured name.
    pub fn resolve(&self, name: &str) -> Result<ExtensionSpec, TemplateError> {
        self.specs.get(name).cloned().ok_or_else(|| {
            let mut known: Vec<&str> = self.specs.keys().map(String::as_str).collect();
            known.sort_unstable();
            err_msg!(Configuration, "unknown extension '{}'", name)
                .with_help(format!("known extensions: {}", known.join(", ")))
        })
    }
}
