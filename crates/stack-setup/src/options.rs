//! Typed access to configuration options, tracking which keys were read.
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::StackConfig;
use crate::error::{Result, SetupError};

#[derive(Debug)]
pub struct OptionReader {
    options: BTreeMap<String, Value>,
    directives: BTreeSet<String>,
    read: RefCell<BTreeSet<String>>,
}

impl OptionReader {
    pub fn new(config: &StackConfig) -> Self {
        Self {
            options: config.options.clone(),
            directives: config.stages.iter().cloned().collect(),
            read: RefCell::new(BTreeSet::new()),
        }
    }

    fn mark(&self, key: &str) {
        self.read.borrow_mut().insert(key.to_string());
    }

    /// `Ok(None)` when the key is absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.mark(key);
        match self.options.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| SetupError::InvalidOption {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    pub fn was_supplied(&self, key: &str) -> bool {
        self.options.contains_key(key) || self.directives.contains(key)
    }

    /// Whether `directive` is listed under `stages`.
    pub fn enabled(&self, directive: &str) -> bool {
        self.directives.contains(directive)
    }

    /// Option keys supplied but never read.
    pub fn unused(&self) -> Vec<String> {
        let read = self.read.borrow();
        self.options
            .keys()
            .filter(|k| !read.contains(*k))
            .cloned()
            .collect()
    }
}
