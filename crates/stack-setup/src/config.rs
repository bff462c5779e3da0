//! Stack configuration document (YAML or JSON).
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Result, SetupError};

pub const DEFAULT_BITS: u32 = 18;

fn default_bits() -> u32 {
    DEFAULT_BITS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackConfig {
    /// log2 of the number of feature slots
    #[serde(default = "default_bits")]
    pub bits: u32,
    #[serde(default)]
    pub quiet: bool,
    /// Enabled directives. Order is irrelevant; the registry fixes it.
    #[serde(default)]
    pub stages: Vec<String>,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            bits: DEFAULT_BITS,
            quiet: false,
            stages: Vec::new(),
            options: BTreeMap::new(),
        }
    }
}

impl StackConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| SetupError::Config(e.to_string()))
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SetupError::Config(e.to_string()))
    }

    /// `.json` files parse as JSON, anything else as YAML.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SetupError::Io {
            path: path.display().to_string(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_yaml_str(&text),
        }
    }

    pub fn enable(mut self, directive: impl Into<String>) -> Self {
        self.stages.push(directive.into());
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn bits(mut self, bits: u32) -> Self {
        self.bits = bits;
        self
    }
}
