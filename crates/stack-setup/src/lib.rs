//! Stack Setup: configuration, option reader and the setup registry
//!
//! ```text
//! StackConfig (YAML/JSON) → OptionReader → SetupRegistry::assemble
//!                                             ↓ top-down lookup
//!                                          setup fns build bottom-up
//!                                             ↓
//!                                          Workspace
//! ```
pub mod config;
pub mod error;
pub mod options;
pub mod registry;

pub use config::{StackConfig, DEFAULT_BITS};
pub use error::{Result, SetupError};
pub use options::OptionReader;
pub use registry::{SetupContext, SetupFn, SetupRegistry};
