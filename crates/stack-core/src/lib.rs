//! Stack Core: stage contract, builder, pipeline and the shared weight space
//!
//! A learner is a chain of stages. Each stage owns the stage beneath it
//! (its base) and transforms the examples, labels and predictions passing
//! through. All stages of a workspace share one flat weight vector; a stage
//! built with multiplier `m` on a base with increment `i` gets increment
//! `i * m` and addresses its sub-slots by shifting each example's offset.
pub mod aggregate;
pub mod builder;
pub mod context;
pub mod contract;
pub mod data_model;
pub mod error;
pub mod io;
pub mod logging;
pub mod metrics;
pub mod offset;
pub mod pipeline;
pub mod stage;
pub mod weights;
pub mod workspace;

pub use builder::{PassThrough, StageBuilder};
pub use context::{ExecutionContext, SharedStats};
pub use contract::{AggregationKind, AnyStage, Base, Stage, StageHandle, StageMeta};
pub use data_model::{
    Example, ExampleUnit, Label, LabelKind, MultiEx, Prediction, PredictionKind, ShapeKind,
};
pub use error::{Result, StackError};
pub use io::{ModelBuffer, ModelIo};
pub use metrics::{MetricSink, MetricValue};
pub use offset::{Offset, OffsetGuard};
pub use pipeline::{Pipeline, StageSummary, MODEL_FORMAT_VERSION};
pub use stage::{
    Capabilities, Capability, CrossCuttingStage, DelegatingStage, MergeWithAllStage,
    MergeableStage, Multi, Shape, Single, StageError, Unit,
};
pub use weights::{StrideLayout, WeightVector, MAX_ADDRESS_BITS};
pub use workspace::Workspace;

pub const STACK_VERSION: &str = env!("CARGO_PKG_VERSION");
