//! Setup registry: maps directives to stage-construction functions.
//!
//! Entries are registered top to bottom. Assembly calls the topmost entry;
//! an entry that applies asks for everything beneath it with
//! [`SetupContext::setup_base`] and wraps the result, one that does not
//! returns `Ok(None)` and the next entry is tried in its place. The stack is
//! therefore built bottom-up while the registry reads top-down.
use stack_core::{StageHandle, StrideLayout, Workspace};

use crate::config::StackConfig;
use crate::error::{Result, SetupError};
use crate::options::OptionReader;

pub type SetupFn = fn(&mut SetupContext<'_>) -> Result<Option<StageHandle>>;

#[derive(Clone)]
struct Entry {
    name: &'static str,
    setup: SetupFn,
}

#[derive(Clone, Default)]
pub struct SetupRegistry {
    entries: Vec<Entry>,
}

/// What a setup function sees while the stack is assembled.
pub struct SetupContext<'a> {
    options: &'a OptionReader,
    remaining: &'a [Entry],
    built: Vec<&'static str>,
}

impl<'a> SetupContext<'a> {
    pub fn options(&self) -> &OptionReader {
        self.options
    }

    /// Builds every applicable stage beneath the caller and returns the top
    /// of that sub-stack.
    pub fn setup_base(&mut self) -> Result<StageHandle> {
        while let Some((entry, rest)) = self.remaining.split_first() {
            self.remaining = rest;
            if let Some(stage) = (entry.setup)(self)? {
                tracing::debug!(directive = entry.name, stage = %stage.name(), "setup applied");
                self.built.push(entry.name);
                return Ok(stage);
            }
        }
        Err(SetupError::NoTerminal)
    }
}

impl SetupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `setup` beneath every entry registered so far.
    pub fn register(mut self, name: &'static str, setup: SetupFn) -> Self {
        self.entries.push(Entry { name, setup });
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.name).collect()
    }

    /// Builds the top stage for `config`.
    pub fn build(&self, config: &StackConfig) -> Result<(StageHandle, OptionReader)> {
        for directive in &config.stages {
            if !self.entries.iter().any(|e| e.name == directive.as_str()) {
                return Err(SetupError::UnknownDirective(directive.clone()));
            }
        }
        let options = OptionReader::new(config);
        let top = {
            let mut ctx = SetupContext {
                options: &options,
                remaining: &self.entries,
                built: Vec::new(),
            };
            let top = ctx.setup_base()?;
            tracing::debug!(applied = ?ctx.built, "setup functions applied bottom-up");
            top
        };
        Ok((top, options))
    }

    /// Builds the stack and wraps it in a fresh workspace. `bits` is
    /// checked against the stack's increment before any weights are allocated.
    pub fn assemble(&self, config: &StackConfig) -> Result<Workspace> {
        let (top, options) = self.build(config)?;
        for key in options.unused() {
            tracing::warn!(key = %key, "configuration option was never read");
        }
        StrideLayout::checked(config.bits, top.increment()).map_err(|e| SetupError::InvalidOption {
            key: "bits".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Workspace::new(top, config.bits)?.quiet(config.quiet))
    }
}

impl std::fmt::Debug for SetupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SetupRegistry")
            .field("entries", &self.names())
            .finish()
    }
}
