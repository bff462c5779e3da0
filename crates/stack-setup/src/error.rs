use thiserror::Error;

use stack_core::StackError;

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("SETUP/config: {0}")]
    Config(String),

    #[error("SETUP/config: cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("SETUP/option `{key}`: {reason}")]
    InvalidOption { key: String, reason: String },

    #[error("SETUP/stages: no setup function named `{0}`")]
    UnknownDirective(String),

    #[error("SETUP/stages: every setup function declined, no terminal stage")]
    NoTerminal,

    #[error(transparent)]
    Stack(#[from] StackError),
}

pub type Result<T, E = SetupError> = std::result::Result<T, E>;
