//! Stack Stages: reference stages and the default setup registry.
//!
//! Small and deterministic; they exercise every part of the stage contract
//! and serve as templates for real reductions.
//!
//! # Default Stack Order
//!
//! ```text
//! each_line  (multi-line → single-line)
//!     ↓
//! counting → pass → doubling (×N)
//!     ↓
//! sentinel | noop | linear   (first enabled terminal; linear always applies)
//! ```

mod counting;
mod doubling;
mod each_line;
mod linear;
mod noop;
mod pass;
mod progress;
mod sentinel;

pub use counting::CountingStage;
pub use doubling::{DoublingStage, DEFAULT_COPIES};
pub use each_line::EachLineStage;
pub use linear::{LinearStage, DEFAULT_LEARNING_RATE};
pub use noop::NoopStage;
pub use sentinel::{SentinelStage, SlotWrite};

use once_cell::sync::Lazy;
use stack_setup::{SetupRegistry, StackConfig};

static DEFAULT_REGISTRY: Lazy<SetupRegistry> = Lazy::new(|| {
    SetupRegistry::new()
        .register("each_line", each_line::setup)
        .register("counting", counting::setup)
        .register("pass", pass::setup)
        .register("doubling", doubling::setup)
        .register("sentinel", sentinel::setup)
        .register("noop", noop::setup)
        .register("linear", linear::setup)
});

/// Registry with every reference stage, top to bottom.
pub fn default_registry() -> &'static SetupRegistry {
    &DEFAULT_REGISTRY
}

/// Assembles `config` with the default registry.
pub fn assemble(config: &StackConfig) -> stack_setup::Result<stack_core::Workspace> {
    default_registry().assemble(config)
}

// ============================================================================
// TESTS
// ============================================================================
