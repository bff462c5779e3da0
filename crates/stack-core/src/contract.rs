//! Stage contract: a concrete stage bound to its base and erased behind
//! `Stage<S>`, where `S` is the shape it consumes.
//!
//! Undeclared optional callbacks fall back as follows:
//!
//! - `update` runs the stage's own `learn`;
//! - `sensitivity` forwards to a base of the same shape;
//! - `multipredict` calls the stage's own `predict` once per sub-index;
//! - `finish_example` forwards to a base of the same shape.
//!
//! Forwarding across shapes, or with no base at all, fails with a named error.
use serde::Serialize;
use std::any::Any;

use crate::context::ExecutionContext;
use crate::data_model::{LabelKind, Prediction, PredictionKind, ShapeKind};
use crate::error::{Result, StackError};
use crate::metrics::MetricSink;
use crate::offset::OffsetGuard;
use crate::stage::{
    Capabilities, Capability, CrossCuttingStage, DelegatingStage, MergeWithAllStage,
    MergeableStage, Shape, Unit,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    None,
    Merge,
    MergeWithAll,
}

/// Immutable description of a built stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageMeta {
    pub name: String,
    pub shape: ShapeKind,
    pub weights_per_example: u64,
    pub increment: u64,
    pub input_label: LabelKind,
    pub output_label: LabelKind,
    pub input_prediction: PredictionKind,
    pub output_prediction: PredictionKind,
    /// Built through the pass-through variant: owns no state
    pub stateless: bool,
    pub aggregation: AggregationKind,
}

/// The stage directly beneath a stage, as its callbacks see it.
pub struct Base<S: Shape> {
    owner: String,
    stage: Option<Box<Stage<S>>>,
}

impl<S: Shape> Base<S> {
    pub(crate) fn new(owner: String, stage: Option<Box<Stage<S>>>) -> Self {
        Self { owner, stage }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_none()
    }

    pub fn stage(&self) -> Option<&Stage<S>> {
        self.stage.as_deref()
    }

    /// Increment of the base; a missing base counts as 1.
    pub fn increment(&self) -> u64 {
        self.stage.as_ref().map(|s| s.meta.increment).unwrap_or(1)
    }

    fn get(&mut self, call: &'static str) -> Result<&mut Stage<S>> {
        match self.stage.as_deref_mut() {
            Some(stage) => Ok(stage),
            None => Err(StackError::NoBase {
                stage: self.owner.clone(),
                call,
            }),
        }
    }

    pub fn learn(&mut self, ctx: &mut ExecutionContext, unit: &mut Unit<S>, index: u64) -> Result<()> {
        self.get("learn")?.learn(ctx, unit, index)
    }

    pub fn predict(&mut self, ctx: &mut ExecutionContext, unit: &mut Unit<S>, index: u64) -> Result<()> {
        self.get("predict")?.predict(ctx, unit, index)
    }

    pub fn update(&mut self, ctx: &mut ExecutionContext, unit: &mut Unit<S>, index: u64) -> Result<()> {
        self.get("update")?.update(ctx, unit, index)
    }

    pub fn sensitivity(
        &mut self,
        ctx: &mut ExecutionContext,
        unit: &mut Unit<S>,
        index: u64,
    ) -> Result<f32> {
        self.get("sensitivity")?.sensitivity(ctx, unit, index)
    }

    pub fn multipredict(
        &mut self,
        ctx: &mut ExecutionContext,
        unit: &mut Unit<S>,
        lo: u64,
        count: usize,
    ) -> Result<Vec<Prediction>> {
        self.get("multipredict")?.multipredict(ctx, unit, lo, count)
    }

    pub fn finish_example(&mut self, ctx: &mut ExecutionContext, unit: &mut Unit<S>) -> Result<()> {
        self.get("finish_example")?.finish_example(ctx, unit)
    }
}

type MergeFn<L> = fn(&[f32], &[&L], &mut L) -> Result<()>;
type CombineFn<L> = fn(&L, &L, &mut L) -> Result<()>;
type MergeAllFn<L> = fn(&[f32], &[(&L, &ExecutionContext)], &mut L, &mut ExecutionContext) -> Result<()>;
type CombineAllFn<L> =
    fn((&L, &ExecutionContext), (&L, &ExecutionContext), &mut L, &mut ExecutionContext) -> Result<()>;

pub(crate) enum Aggregation<L> {
    Delta {
        merge: MergeFn<L>,
        add: CombineFn<L>,
        subtract: CombineFn<L>,
    },
    WithAll {
        merge: MergeAllFn<L>,
        add: CombineAllFn<L>,
        subtract: CombineAllFn<L>,
    },
}

impl<L: MergeableStage> Aggregation<L> {
    pub(crate) fn delta() -> Self {
        Aggregation::Delta {
            merge: L::merge,
            add: L::add,
            subtract: L::subtract,
        }
    }
}

impl<L: MergeWithAllStage> Aggregation<L> {
    pub(crate) fn with_all() -> Self {
        Aggregation::WithAll {
            merge: L::merge_with_all,
            add: L::add_with_all,
            subtract: L::subtract_with_all,
        }
    }
}

/// Shape-specific half of the erased stage.
trait Erased<S: Shape>: Send {
    fn learn(&mut self, ctx: &mut ExecutionContext, unit: &mut Unit<S>) -> Result<()>;
    fn predict(&mut self, ctx: &mut ExecutionContext, unit: &mut Unit<S>) -> Result<()>;
    fn update(&mut self, ctx: &mut ExecutionContext, unit: &mut Unit<S>) -> Result<()>;
    fn sensitivity(&mut self, ctx: &mut ExecutionContext, unit: &mut Unit<S>) -> Result<f32>;
    fn multipredict(
        &mut self,
        ctx: &mut ExecutionContext,
        unit: &mut Unit<S>,
        count: usize,
        out: &mut Vec<Prediction>,
    ) -> Result<()>;
    fn finish_example(&mut self, ctx: &mut ExecutionContext, unit: &mut Unit<S>) -> Result<()>;
    fn update_stats(&mut self, ctx: &mut ExecutionContext, unit: &Unit<S>) -> Result<()>;
    fn output_prediction(&mut self, ctx: &mut ExecutionContext, unit: &Unit<S>) -> Result<()>;
    fn print_update(&mut self, ctx: &mut ExecutionContext, unit: &Unit<S>) -> Result<()>;
    fn cleanup(&mut self, unit: &mut Unit<S>) -> Result<()>;

    /// The base, if it consumes the same shape. `Err(None)` means terminal.
    fn same_shape_base(&mut self) -> std::result::Result<&mut Stage<S>, Option<(String, ShapeKind)>>;
    fn base(&self) -> Option<&dyn AnyStage>;
    fn base_mut(&mut self) -> Option<&mut dyn AnyStage>;
    fn cross_cutting(&mut self) -> &mut dyn CrossCuttingStage;
    fn persist_metrics(&self, sink: &mut MetricSink) -> Result<()>;
    fn logic(&self) -> &dyn Any;
    fn logic_mut(&mut self) -> &mut dyn Any;

    fn merge(
        &mut self,
        name: &str,
        weights: &[f32],
        sources: &[(&dyn Any, &ExecutionContext)],
        ctx: &mut ExecutionContext,
    ) -> Result<()>;
    fn combine(
        &mut self,
        name: &str,
        op: CombineOp,
        left: (&dyn Any, &ExecutionContext),
        right: (&dyn Any, &ExecutionContext),
        ctx: &mut ExecutionContext,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CombineOp {
    Add,
    Subtract,
}

impl CombineOp {
    fn name(self) -> &'static str {
        match self {
            CombineOp::Add => "add",
            CombineOp::Subtract => "subtract",
        }
    }
}

pub(crate) struct Bound<L: DelegatingStage> {
    pub(crate) logic: L,
    pub(crate) base: Base<L::BaseShape>,
    pub(crate) aggregation: Option<Aggregation<L>>,
}

fn downcast<'a, L: 'static>(name: &str, logic: &'a dyn Any) -> Result<&'a L> {
    logic.downcast_ref::<L>().ok_or_else(|| StackError::StructureMismatch {
        depth: 0,
        detail: format!("stage `{}` is backed by a different implementation", name),
    })
}

impl<L: DelegatingStage> Erased<L::Shape> for Bound<L> {
    fn learn(&mut self, ctx: &mut ExecutionContext, unit: &mut Unit<L::Shape>) -> Result<()> {
        self.logic.learn(&mut self.base, ctx, unit)
    }

    fn predict(&mut self, ctx: &mut ExecutionContext, unit: &mut Unit<L::Shape>) -> Result<()> {
        self.logic.predict(&mut self.base, ctx, unit)
    }

    fn update(&mut self, ctx: &mut ExecutionContext, unit: &mut Unit<L::Shape>) -> Result<()> {
        self.logic.update(&mut self.base, ctx, unit)
    }

    fn sensitivity(&mut self, ctx: &mut ExecutionContext, unit: &mut Unit<L::Shape>) -> Result<f32> {
        self.logic.sensitivity(&mut self.base, ctx, unit)
    }

    fn multipredict(
        &mut self,
        ctx: &mut ExecutionContext,
        unit: &mut Unit<L::Shape>,
        count: usize,
        out: &mut Vec<Prediction>,
    ) -> Result<()> {
        self.logic.multipredict(&mut self.base, ctx, unit, count, out)
    }

    fn finish_example(&mut self, ctx: &mut ExecutionContext, unit: &mut Unit<L::Shape>) -> Result<()> {
        self.logic.finish_example(&mut self.base, ctx, unit)
    }

    fn update_stats(&mut self, ctx: &mut ExecutionContext, unit: &Unit<L::Shape>) -> Result<()> {
        self.logic.update_stats(ctx, unit)
    }

    fn output_prediction(&mut self, ctx: &mut ExecutionContext, unit: &Unit<L::Shape>) -> Result<()> {
        self.logic.output_prediction(ctx, unit)
    }

    fn print_update(&mut self, ctx: &mut ExecutionContext, unit: &Unit<L::Shape>) -> Result<()> {
        self.logic.print_update(ctx, unit)
    }

    fn cleanup(&mut self, unit: &mut Unit<L::Shape>) -> Result<()> {
        self.logic.cleanup(unit)
    }

    fn same_shape_base(
        &mut self,
    ) -> std::result::Result<&mut Stage<L::Shape>, Option<(String, ShapeKind)>> {
        let stage = match self.base.stage.as_deref_mut() {
            Some(stage) => stage,
            None => return Err(None),
        };
        let found = (stage.meta.name.clone(), stage.meta.shape);
        (stage as &mut dyn Any)
            .downcast_mut::<Stage<L::Shape>>()
            .ok_or(Some(found))
    }

    fn base(&self) -> Option<&dyn AnyStage> {
        self.base.stage.as_deref().map(|s| s as &dyn AnyStage)
    }

    fn base_mut(&mut self) -> Option<&mut dyn AnyStage> {
        self.base.stage.as_deref_mut().map(|s| s as &mut dyn AnyStage)
    }

    fn cross_cutting(&mut self) -> &mut dyn CrossCuttingStage {
        &mut self.logic
    }

    fn persist_metrics(&self, sink: &mut MetricSink) -> Result<()> {
        self.logic.persist_metrics(sink)
    }

    fn logic(&self) -> &dyn Any {
        &self.logic
    }

    fn logic_mut(&mut self) -> &mut dyn Any {
        &mut self.logic
    }

    fn merge(
        &mut self,
        name: &str,
        weights: &[f32],
        sources: &[(&dyn Any, &ExecutionContext)],
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        match &self.aggregation {
            Some(Aggregation::Delta { merge, .. }) => {
                let mut typed = Vec::with_capacity(sources.len());
                for (logic, _) in sources {
                    typed.push(downcast::<L>(name, *logic)?);
                }
                merge(weights, &typed, &mut self.logic)
            }
            Some(Aggregation::WithAll { merge, .. }) => {
                let mut typed = Vec::with_capacity(sources.len());
                for (logic, source_ctx) in sources {
                    typed.push((downcast::<L>(name, *logic)?, *source_ctx));
                }
                merge(weights, &typed, &mut self.logic, ctx)
            }
            None => Err(StackError::AggregationUnsupported {
                stage: name.to_string(),
                op: "merge",
            }),
        }
    }

    fn combine(
        &mut self,
        name: &str,
        op: CombineOp,
        left: (&dyn Any, &ExecutionContext),
        right: (&dyn Any, &ExecutionContext),
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let l = downcast::<L>(name, left.0)?;
        let r = downcast::<L>(name, right.0)?;
        match (&self.aggregation, op) {
            (Some(Aggregation::Delta { add, .. }), CombineOp::Add) => add(l, r, &mut self.logic),
            (Some(Aggregation::Delta { subtract, .. }), CombineOp::Subtract) => {
                subtract(l, r, &mut self.logic)
            }
            (Some(Aggregation::WithAll { add, .. }), CombineOp::Add) => {
                add((l, left.1), (r, right.1), &mut self.logic, ctx)
            }
            (Some(Aggregation::WithAll { subtract, .. }), CombineOp::Subtract) => {
                subtract((l, left.1), (r, right.1), &mut self.logic, ctx)
            }
            (None, op) => Err(StackError::AggregationUnsupported {
                stage: name.to_string(),
                op: op.name(),
            }),
        }
    }
}

/// A built stage consuming units of shape `S`; owns everything beneath it.
pub struct Stage<S: Shape> {
    pub(crate) meta: StageMeta,
    pub(crate) caps: Capabilities,
    inner: Box<dyn Erased<S>>,
}

impl<S: Shape> Stage<S> {
    pub(crate) fn from_bound<L>(meta: StageMeta, bound: Bound<L>) -> Self
    where
        L: DelegatingStage<Shape = S>,
    {
        let caps = bound.logic.capabilities();
        Self {
            meta,
            caps,
            inner: Box::new(bound),
        }
    }

    pub fn meta(&self) -> &StageMeta {
        &self.meta
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn increment(&self) -> u64 {
        self.meta.increment
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Borrows the concrete stage logic, if it is an `L`.
    pub fn logic<L: 'static>(&self) -> Option<&L> {
        self.inner.logic().downcast_ref::<L>()
    }

    pub fn logic_mut<L: 'static>(&mut self) -> Option<&mut L> {
        self.inner.logic_mut().downcast_mut::<L>()
    }

    pub fn learn(&mut self, ctx: &mut ExecutionContext, unit: &mut Unit<S>, index: u64) -> Result<()> {
        let mut unit = OffsetGuard::new(unit, self.meta.increment * index);
        self.inner.learn(ctx, &mut unit)
    }

    pub fn predict(&mut self, ctx: &mut ExecutionContext, unit: &mut Unit<S>, index: u64) -> Result<()> {
        let mut unit = OffsetGuard::new(unit, self.meta.increment * index);
        self.inner.predict(ctx, &mut unit)
    }

    pub fn update(&mut self, ctx: &mut ExecutionContext, unit: &mut Unit<S>, index: u64) -> Result<()> {
        let mut unit = OffsetGuard::new(unit, self.meta.increment * index);
        if self.caps.contains(Capability::Update) {
            self.inner.update(ctx, &mut unit)
        } else {
            self.inner.learn(ctx, &mut unit)
        }
    }

    pub fn sensitivity(
        &mut self,
        ctx: &mut ExecutionContext,
        unit: &mut Unit<S>,
        index: u64,
    ) -> Result<f32> {
        let mut unit = OffsetGuard::new(unit, self.meta.increment * index);
        if self.caps.contains(Capability::Sensitivity) {
            return self.inner.sensitivity(ctx, &mut unit);
        }
        match self.inner.same_shape_base() {
            Ok(base) => base.sensitivity(ctx, &mut unit, 0),
            Err(lookup) => Err(forward_error(&self.meta.name, "sensitivity", lookup)),
        }
    }

    /// Predictions for sub-indices `lo..lo + count`.
    pub fn multipredict(
        &mut self,
        ctx: &mut ExecutionContext,
        unit: &mut Unit<S>,
        lo: u64,
        count: usize,
    ) -> Result<Vec<Prediction>> {
        let mut out = Vec::with_capacity(count);
        if self.caps.contains(Capability::Multipredict) {
            let mut unit = OffsetGuard::new(unit, self.meta.increment * lo);
            self.inner.multipredict(ctx, &mut unit, count, &mut out)?;
            return Ok(out);
        }
        for c in 0..count as u64 {
            let mut unit = OffsetGuard::new(&mut *unit, self.meta.increment * (lo + c));
            self.inner.predict(ctx, &mut unit)?;
            out.push(S::prediction(&unit));
        }
        Ok(out)
    }

    /// Terminal per-example call. Runs the legacy callback, or the declared
    /// split callbacks in order, or forwards to a same-shape base.
    pub fn finish_example(&mut self, ctx: &mut ExecutionContext, unit: &mut Unit<S>) -> Result<()> {
        if self.caps.contains(Capability::FinishExample) {
            return self.inner.finish_example(ctx, unit);
        }
        if self.caps.has_split_finish() {
            if self.caps.contains(Capability::UpdateStats) {
                self.inner.update_stats(ctx, unit)?;
            }
            if self.caps.contains(Capability::OutputPrediction) {
                self.inner.output_prediction(ctx, unit)?;
            }
            if self.caps.contains(Capability::PrintUpdate) {
                self.inner.print_update(ctx, unit)?;
            }
            if self.caps.contains(Capability::Cleanup) {
                self.inner.cleanup(unit)?;
            }
            return Ok(());
        }
        match self.inner.same_shape_base() {
            Ok(base) => base.finish_example(ctx, unit),
            Err(lookup) => Err(forward_error(&self.meta.name, "finish_example", lookup)),
        }
    }
}

fn forward_error(stage: &str, call: &'static str, lookup: Option<(String, ShapeKind)>) -> StackError {
    match lookup {
        None => StackError::CapabilityMissing {
            stage: stage.to_string(),
            call,
        },
        Some((base, found)) => StackError::ShapeCrossing {
            stage: stage.to_string(),
            base,
            call,
            found,
        },
    }
}

impl<S: Shape> std::fmt::Debug for Stage<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("meta", &self.meta)
            .field("capabilities", &self.caps)
            .finish()
    }
}

/// Shape-independent view of a stage, used for walking the chain.
pub trait AnyStage: Send {
    fn meta(&self) -> &StageMeta;
    fn capabilities(&self) -> Capabilities;
    fn base(&self) -> Option<&dyn AnyStage>;
    fn base_mut(&mut self) -> Option<&mut dyn AnyStage>;
    fn cross_cutting(&mut self) -> &mut dyn CrossCuttingStage;
    fn persist_metrics(&self, sink: &mut MetricSink) -> Result<()>;
    fn logic_any(&self) -> &dyn Any;

    /// Not auto-recursive: affects this stage only.
    fn merge(
        &mut self,
        weights: &[f32],
        sources: &[(&dyn AnyStage, &ExecutionContext)],
        ctx: &mut ExecutionContext,
    ) -> Result<()>;

    fn add(
        &mut self,
        base: (&dyn AnyStage, &ExecutionContext),
        delta: (&dyn AnyStage, &ExecutionContext),
        ctx: &mut ExecutionContext,
    ) -> Result<()>;

    fn subtract(
        &mut self,
        minuend: (&dyn AnyStage, &ExecutionContext),
        subtrahend: (&dyn AnyStage, &ExecutionContext),
        ctx: &mut ExecutionContext,
    ) -> Result<()>;
}

impl<S: Shape> AnyStage for Stage<S> {
    fn meta(&self) -> &StageMeta {
        &self.meta
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn base(&self) -> Option<&dyn AnyStage> {
        self.inner.base()
    }

    fn base_mut(&mut self) -> Option<&mut dyn AnyStage> {
        self.inner.base_mut()
    }

    fn cross_cutting(&mut self) -> &mut dyn CrossCuttingStage {
        self.inner.cross_cutting()
    }

    fn persist_metrics(&self, sink: &mut MetricSink) -> Result<()> {
        self.inner.persist_metrics(sink)
    }

    fn logic_any(&self) -> &dyn Any {
        self.inner.logic()
    }

    fn merge(
        &mut self,
        weights: &[f32],
        sources: &[(&dyn AnyStage, &ExecutionContext)],
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        if weights.len() != sources.len() {
            return Err(StackError::Aggregation(format!(
                "{}: {} weights for {} sources",
                self.meta.name,
                weights.len(),
                sources.len()
            )));
        }
        let logics: Vec<(&dyn Any, &ExecutionContext)> =
            sources.iter().map(|(s, c)| (s.logic_any(), *c)).collect();
        self.inner.merge(&self.meta.name, weights, &logics, ctx)
    }

    fn add(
        &mut self,
        base: (&dyn AnyStage, &ExecutionContext),
        delta: (&dyn AnyStage, &ExecutionContext),
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        self.inner.combine(
            &self.meta.name,
            CombineOp::Add,
            (base.0.logic_any(), base.1),
            (delta.0.logic_any(), delta.1),
            ctx,
        )
    }

    fn subtract(
        &mut self,
        minuend: (&dyn AnyStage, &ExecutionContext),
        subtrahend: (&dyn AnyStage, &ExecutionContext),
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        self.inner.combine(
            &self.meta.name,
            CombineOp::Subtract,
            (minuend.0.logic_any(), minuend.1),
            (subtrahend.0.logic_any(), subtrahend.1),
            ctx,
        )
    }
}

/// Owning handle to a stage of either shape.
pub enum StageHandle {
    Single(Box<Stage<crate::stage::Single>>),
    Multi(Box<Stage<crate::stage::Multi>>),
}

impl StageHandle {
    pub fn shape(&self) -> ShapeKind {
        self.as_any().meta().shape
    }

    pub fn name(&self) -> &str {
        &self.as_any().meta().name
    }

    pub fn increment(&self) -> u64 {
        self.as_any().meta().increment
    }

    pub fn as_any(&self) -> &dyn AnyStage {
        match self {
            StageHandle::Single(stage) => stage.as_ref(),
            StageHandle::Multi(stage) => stage.as_ref(),
        }
    }

    pub fn as_any_mut(&mut self) -> &mut dyn AnyStage {
        match self {
            StageHandle::Single(stage) => stage.as_mut(),
            StageHandle::Multi(stage) => stage.as_mut(),
        }
    }
}

impl<S: Shape> From<Stage<S>> for StageHandle {
    fn from(stage: Stage<S>) -> Self {
        S::into_handle(stage)
    }
}

impl std::fmt::Debug for StageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("StageHandle")
            .field("name", &self.name())
            .field("shape", &self.shape())
            .field("increment", &self.increment())
            .finish()
    }
}
