//! Environment configuration.
//!
//! [`EnvironmentConfig`] is the serializable part of an environment: lexer
//! switches, built-in attributes, extension names, globals and attributes as
//! JSON-compatible values. It loads from YAML or JSON:
//!
//! ```yaml
//! extensions: [loopcontrols, do]
//! trim_blocks: true
//! globals:
//!   site: Example
//! ```
//!
//! [`ConfigOverrides`] carries the changes applied by `Environment::overlay`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::extensions::{Extension, ExtensionSpec};
use crate::TemplateError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// Extension names, resolved through an `ExtensionCatalog`.
    pub extensions: Vec<String>,
    pub trim_blocks: bool,
    pub keep_trailing_newline: bool,
    /// Exposed to templates as the `sandboxed` environment attribute.
    pub sandboxed: bool,
    pub globals: BTreeMap<String, serde_json::Value>,
    /// Extra environment attributes readable through `EnvironmentAttribute`.
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl EnvironmentConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, TemplateError> {
        serde_yaml::from_str(text).map_err(|err| {
            err_msg!(Configuration, "invalid YAML configuration: {}", err).with_cause(err)
        })
    }

    pub fn from_json_str(text: &str) -> Result<Self, TemplateError> {
        serde_json::from_str(text).map_err(|err| {
            err_msg!(Configuration, "invalid JSON configuration: {}", err).with_cause(err)
        })
    }

    /// Loads a `.json` file as JSON and anything else as YAML.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            err_msg!(Io, "cannot read '{}': {}", path.display(), err).with_cause(err)
        })?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_yaml_str(&text)
        }
    }
}

/// Settings changed by an overlay. Unset fields keep the parent's value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub trim_blocks: Option<bool>,
    pub keep_trailing_newline: Option<bool>,
    pub sandboxed: Option<bool>,
    /// Extensions added on top of the parent's.
    pub extensions: Vec<ExtensionSpec>,
}

impl ConfigOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trim_blocks(mut self, value: bool) -> Self {
        self.trim_blocks = Some(value);
        self
    }

    pub fn keep_trailing_newline(mut self, value: bool) -> Self {
        self.keep_trailing_newline = Some(value);
        self
    }

    pub fn sandboxed(mut self, value: bool) -> Self {
        self.sandboxed = Some(value);
        self
    }

    pub fn extension<E: Extension + 'static>(mut self) -> Self {
        self.extensions.push(ExtensionSpec::of::<E>());
        self
    }

    pub fn extension_spec(mut self, spec: ExtensionSpec) -> Self {
        self.extensions.push(spec);
        self
    }

    pub(crate) fn apply(&self, config: &mut EnvironmentConfig) {
        if let Some(value) = self.trim_blocks {
            config.trim_blocks = value;
        }
        if let Some(value) = self.keep_trailing_newline {
            config.keep_trailing_newline = value;
        }
        if let Some(value) = self.sandboxed {
            config.sandboxed = value;
        }
    }
}
