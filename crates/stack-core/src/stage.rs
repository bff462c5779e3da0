//! Stage traits: the contract every reduction implements.
//!
//! A stage is split along how its calls propagate:
//!
//! ```text
//! CrossCuttingStage   save_load, pre_save_load, persist_metrics,
//!                     end_pass, end_examples, finish
//!                     → own callback runs, then the pipeline calls the base
//!
//! DelegatingStage     learn, predict, update, sensitivity, multipredict,
//!                     finish_example (+ split finish callbacks)
//!                     → the stage decides whether and how to call its base
//! ```
use serde::Serialize;
use std::io;

use crate::context::ExecutionContext;
use crate::contract::{Base, Stage, StageHandle};
use crate::data_model::{Example, MultiEx, Prediction, ShapeKind};
use crate::error::Result;
use crate::metrics::MetricSink;
use crate::offset::Offset;

/// Static tag for what a stage consumes.
pub trait Shape: Send + Sized + 'static {
    type Unit: Offset + Send + 'static;
    const KIND: ShapeKind;

    fn into_handle(stage: Stage<Self>) -> StageHandle;

    /// Takes the stage out of `handle` if it has this shape.
    fn from_handle(handle: StageHandle) -> std::result::Result<Box<Stage<Self>>, StageHandle>;

    /// Prediction reported for the whole unit.
    fn prediction(unit: &Self::Unit) -> Prediction;
}

/// One example per call.
pub struct Single;

/// An ordered list of examples per call.
pub struct Multi;

pub type Unit<S> = <S as Shape>::Unit;

impl Shape for Single {
    type Unit = Example;
    const KIND: ShapeKind = ShapeKind::Single;

    fn into_handle(stage: Stage<Self>) -> StageHandle {
        StageHandle::Single(Box::new(stage))
    }

    fn from_handle(handle: StageHandle) -> std::result::Result<Box<Stage<Self>>, StageHandle> {
        match handle {
            StageHandle::Single(stage) => Ok(stage),
            other => Err(other),
        }
    }

    fn prediction(unit: &Example) -> Prediction {
        unit.prediction.clone()
    }
}

impl Shape for Multi {
    type Unit = MultiEx;
    const KIND: ShapeKind = ShapeKind::Multi;

    fn into_handle(stage: Stage<Self>) -> StageHandle {
        StageHandle::Multi(Box::new(stage))
    }

    fn from_handle(handle: StageHandle) -> std::result::Result<Box<Stage<Self>>, StageHandle> {
        match handle {
            StageHandle::Multi(stage) => Ok(stage),
            other => Err(other),
        }
    }

    // Multi-line predictions live on the first line.
    fn prediction(unit: &MultiEx) -> Prediction {
        unit.first().map(|ex| ex.prediction.clone()).unwrap_or_default()
    }
}

/// Optional explicit-delegate callbacks a stage may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Update,
    Sensitivity,
    Multipredict,
    FinishExample,
    UpdateStats,
    OutputPrediction,
    PrintUpdate,
    Cleanup,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::Update,
        Capability::Sensitivity,
        Capability::Multipredict,
        Capability::FinishExample,
        Capability::UpdateStats,
        Capability::OutputPrediction,
        Capability::PrintUpdate,
        Capability::Cleanup,
    ];

    const fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities(u16);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);

    pub const fn with(self, capability: Capability) -> Self {
        Capabilities(self.0 | capability.bit())
    }

    pub const fn contains(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    /// Any of update_stats, output_prediction, print_update, cleanup.
    pub const fn has_split_finish(self) -> bool {
        self.contains(Capability::UpdateStats)
            || self.contains(Capability::OutputPrediction)
            || self.contains(Capability::PrintUpdate)
            || self.contains(Capability::Cleanup)
    }

    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

/// Algorithm-level failure raised from inside a stage callback.
#[derive(Debug, Clone)]
pub enum StageError {
    InvalidExample(String),
    ExecutionFailed(String),
    NotImplemented(&'static str),
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::InvalidExample(msg) => write!(f, "STAGE/EXAMPLE: {}", msg),
            Self::ExecutionFailed(msg) => write!(f, "STAGE/EXEC: {}", msg),
            Self::NotImplemented(call) => {
                write!(f, "STAGE/UNIMPLEMENTED: {} declared but not implemented", call)
            }
        }
    }
}

impl std::error::Error for StageError {}

/// Callbacks every stage observes. The pipeline runs a stage's own callback
/// and then the same call on its base, so none of these forward by hand.
pub trait CrossCuttingStage {
    /// Reads or writes this stage's own fields only.
    fn save_load(
        &mut self,
        _ctx: &mut ExecutionContext,
        _io: &mut dyn crate::io::ModelIo,
        _read: bool,
    ) -> io::Result<()> {
        Ok(())
    }

    fn pre_save_load(&mut self, _ctx: &mut ExecutionContext) -> Result<()> {
        Ok(())
    }

    fn persist_metrics(&self, _sink: &mut MetricSink) -> Result<()> {
        Ok(())
    }

    fn end_pass(&mut self, _ctx: &mut ExecutionContext) -> Result<()> {
        Ok(())
    }

    fn end_examples(&mut self, _ctx: &mut ExecutionContext) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self, _ctx: &mut ExecutionContext) -> Result<()> {
        Ok(())
    }
}

/// Callbacks a stage forwards to its base itself, if at all.
///
/// `learn` and `predict` are mandatory. The remaining callbacks only run
/// when listed in [`DelegatingStage::capabilities`]; otherwise the contract
/// substitutes the default behaviour (see [`Stage`]).
pub trait DelegatingStage: CrossCuttingStage + Send + 'static {
    type Shape: Shape;
    type BaseShape: Shape;

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    fn learn(
        &mut self,
        base: &mut Base<Self::BaseShape>,
        ctx: &mut ExecutionContext,
        unit: &mut Unit<Self::Shape>,
    ) -> Result<()>;

    fn predict(
        &mut self,
        base: &mut Base<Self::BaseShape>,
        ctx: &mut ExecutionContext,
        unit: &mut Unit<Self::Shape>,
    ) -> Result<()>;

    fn update(
        &mut self,
        base: &mut Base<Self::BaseShape>,
        ctx: &mut ExecutionContext,
        unit: &mut Unit<Self::Shape>,
    ) -> Result<()> {
        self.learn(base, ctx, unit)
    }

    fn sensitivity(
        &mut self,
        _base: &mut Base<Self::BaseShape>,
        _ctx: &mut ExecutionContext,
        _unit: &mut Unit<Self::Shape>,
    ) -> Result<f32> {
        Err(StageError::NotImplemented("sensitivity").into())
    }

    /// Writes `count` predictions for sub-indices `0..count` into `out`.
    /// The unit arrives already shifted by the caller's `lo`.
    fn multipredict(
        &mut self,
        _base: &mut Base<Self::BaseShape>,
        _ctx: &mut ExecutionContext,
        _unit: &mut Unit<Self::Shape>,
        _count: usize,
        _out: &mut Vec<Prediction>,
    ) -> Result<()> {
        Err(StageError::NotImplemented("multipredict").into())
    }

    fn finish_example(
        &mut self,
        _base: &mut Base<Self::BaseShape>,
        _ctx: &mut ExecutionContext,
        _unit: &mut Unit<Self::Shape>,
    ) -> Result<()> {
        Err(StageError::NotImplemented("finish_example").into())
    }

    fn update_stats(&mut self, _ctx: &mut ExecutionContext, _unit: &Unit<Self::Shape>) -> Result<()> {
        Ok(())
    }

    fn output_prediction(
        &mut self,
        _ctx: &mut ExecutionContext,
        _unit: &Unit<Self::Shape>,
    ) -> Result<()> {
        Ok(())
    }

    fn print_update(&mut self, _ctx: &mut ExecutionContext, _unit: &Unit<Self::Shape>) -> Result<()> {
        Ok(())
    }

    fn cleanup(&mut self, _unit: &mut Unit<Self::Shape>) -> Result<()> {
        Ok(())
    }
}

/// Delta aggregation over stages of the same concrete type.
pub trait MergeableStage: DelegatingStage + Sized {
    /// Weighted combination of `sources` written into `into`.
    fn merge(weights: &[f32], sources: &[&Self], into: &mut Self) -> Result<()>;

    fn add(base: &Self, delta: &Self, into: &mut Self) -> Result<()>;

    fn subtract(minuend: &Self, subtrahend: &Self, into: &mut Self) -> Result<()>;
}

/// Aggregation that also needs each workspace's shared state (weights, stats).
pub trait MergeWithAllStage: DelegatingStage + Sized {
    fn merge_with_all(
        weights: &[f32],
        sources: &[(&Self, &ExecutionContext)],
        into: &mut Self,
        into_ctx: &mut ExecutionContext,
    ) -> Result<()>;

    fn add_with_all(
        base: (&Self, &ExecutionContext),
        delta: (&Self, &ExecutionContext),
        into: &mut Self,
        into_ctx: &mut ExecutionContext,
    ) -> Result<()>;

    fn subtract_with_all(
        minuend: (&Self, &ExecutionContext),
        subtrahend: (&Self, &ExecutionContext),
        into: &mut Self,
        into_ctx: &mut ExecutionContext,
    ) -> Result<()>;
}
