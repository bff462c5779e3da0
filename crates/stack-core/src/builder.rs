//! Stage builder: binds stage logic to the stage beneath it.
//!
//! ```text
//! StageBuilder::new("counting", Counting::default())
//!     .weights_per_example(1)
//!     .with_aggregation()
//!     .build(Some(base))?
//! ```
//!
//! Building validates the base shape and the label/prediction adjacency
//! against the base, computes the increment, and consumes the builder.
use std::marker::PhantomData;

use crate::context::ExecutionContext;
use crate::contract::{AggregationKind, Aggregation, Base, Bound, Stage, StageHandle, StageMeta};
use crate::data_model::{LabelKind, PredictionKind};
use crate::error::{Result, StackError};
use crate::stage::{
    Capabilities, Capability, CrossCuttingStage, DelegatingStage, MergeWithAllStage, MergeableStage, Shape, Unit,
};
use crate::weights::allocate;

pub struct StageBuilder<L: DelegatingStage> {
    name: String,
    logic: L,
    weights_per_example: u64,
    input_label: Option<LabelKind>,
    output_label: Option<LabelKind>,
    input_prediction: Option<PredictionKind>,
    output_prediction: Option<PredictionKind>,
    merge: Option<Aggregation<L>>,
    merge_with_all: Option<Aggregation<L>>,
    stateless: bool,
}

impl<L: DelegatingStage> StageBuilder<L> {
    pub fn new(name: impl Into<String>, logic: L) -> Self {
        Self {
            name: name.into(),
            logic,
            weights_per_example: 1,
            input_label: None,
            output_label: None,
            input_prediction: None,
            output_prediction: None,
            merge: None,
            merge_with_all: None,
            stateless: false,
        }
    }

    /// Number of sub-regions this stage addresses in its base per feature.
    pub fn weights_per_example(mut self, multiplier: u64) -> Self {
        self.weights_per_example = multiplier;
        self
    }

    /// Label kind this stage consumes.
    pub fn input_label(mut self, kind: LabelKind) -> Self {
        self.input_label = Some(kind);
        self
    }

    /// Label kind this stage hands to its base.
    pub fn output_label(mut self, kind: LabelKind) -> Self {
        self.output_label = Some(kind);
        self
    }

    /// Prediction kind this stage expects from its base.
    pub fn input_prediction(mut self, kind: PredictionKind) -> Self {
        self.input_prediction = Some(kind);
        self
    }

    /// Prediction kind this stage produces.
    pub fn output_prediction(mut self, kind: PredictionKind) -> Self {
        self.output_prediction = Some(kind);
        self
    }

    fn check_declarations(&self) -> Result<()> {
        if self.weights_per_example == 0 {
            return Err(StackError::ZeroMultiplier {
                stage: self.name.clone(),
            });
        }
        if self.merge.is_some() && self.merge_with_all.is_some() {
            return Err(StackError::DuplicateMerge {
                stage: self.name.clone(),
            });
        }
        let caps = self.logic.capabilities();
        if caps.contains(Capability::FinishExample) && caps.has_split_finish() {
            return Err(StackError::DuplicateFinish {
                stage: self.name.clone(),
            });
        }
        Ok(())
    }

    fn aggregation(&mut self) -> (Option<Aggregation<L>>, AggregationKind) {
        match (self.merge.take(), self.merge_with_all.take()) {
            (Some(agg), _) => (Some(agg), AggregationKind::Merge),
            (None, Some(agg)) => (Some(agg), AggregationKind::MergeWithAll),
            (None, None) => (None, AggregationKind::None),
        }
    }

    /// Builds on `base`. A missing base, a base of the wrong shape or an
    /// incompatible label/prediction kind fails here, never at first call.
    pub fn build(mut self, base: Option<StageHandle>) -> Result<Stage<L::Shape>> {
        let base = base.ok_or_else(|| StackError::NullBase {
            stage: self.name.clone(),
        })?;
        self.check_declarations()?;

        let base = <L::BaseShape as Shape>::from_handle(base).map_err(|other| {
            StackError::BaseShapeMismatch {
                stage: self.name.clone(),
                base: other.name().to_string(),
                expected: <L::BaseShape as Shape>::KIND,
                found: other.shape(),
            }
        })?;

        let below = base.meta();
        let input_label = self.input_label.unwrap_or(below.input_label);
        let output_label = self.output_label.unwrap_or(below.input_label);
        let input_prediction = self.input_prediction.unwrap_or(below.output_prediction);
        let output_prediction = self.output_prediction.unwrap_or(below.output_prediction);

        if output_label != below.input_label {
            return Err(StackError::TypeMismatch {
                stage: self.name.clone(),
                base: below.name.clone(),
                what: "label",
                upper: output_label.to_string(),
                lower: below.input_label.to_string(),
            });
        }
        if input_prediction != below.output_prediction {
            return Err(StackError::TypeMismatch {
                stage: self.name.clone(),
                base: below.name.clone(),
                what: "prediction",
                upper: input_prediction.to_string(),
                lower: below.output_prediction.to_string(),
            });
        }

        let increment = allocate(below.increment, self.weights_per_example);
        let (aggregation, aggregation_kind) = self.aggregation();
        let meta = StageMeta {
            name: self.name.clone(),
            shape: <L::Shape as Shape>::KIND,
            weights_per_example: self.weights_per_example,
            increment,
            input_label,
            output_label,
            input_prediction,
            output_prediction,
            stateless: self.stateless,
            aggregation: aggregation_kind,
        };
        tracing::info!(
            stage = %meta.name,
            base = %below.name,
            shape = %meta.shape,
            multiplier = meta.weights_per_example,
            increment = meta.increment,
            "stage built"
        );

        let bound = Bound {
            logic: self.logic,
            base: Base::new(self.name, Some(base)),
            aggregation,
        };
        Ok(Stage::from_bound(meta, bound))
    }

    /// Shorthand for `build(Some(base.into()))`.
    pub fn build_on(self, base: impl Into<StageHandle>) -> Result<Stage<L::Shape>> {
        self.build(Some(base.into()))
    }

    /// Builds a bottom stage with no base. Its increment is its own
    /// multiplier; tags default to simple labels in, scalar predictions out.
    pub fn build_terminal(mut self) -> Result<Stage<L::Shape>> {
        self.check_declarations()?;
        let (aggregation, aggregation_kind) = self.aggregation();
        let meta = StageMeta {
            name: self.name.clone(),
            shape: <L::Shape as Shape>::KIND,
            weights_per_example: self.weights_per_example,
            increment: self.weights_per_example,
            input_label: self.input_label.unwrap_or(LabelKind::Simple),
            output_label: self.output_label.unwrap_or(LabelKind::NoLabel),
            input_prediction: self.input_prediction.unwrap_or(PredictionKind::NoPred),
            output_prediction: self.output_prediction.unwrap_or(PredictionKind::Scalar),
            stateless: self.stateless,
            aggregation: aggregation_kind,
        };
        tracing::info!(stage = %meta.name, shape = %meta.shape, increment = meta.increment, "terminal stage built");

        let bound = Bound {
            logic: self.logic,
            base: Base::new(self.name, None),
            aggregation,
        };
        Ok(Stage::from_bound(meta, bound))
    }
}

impl<L: MergeableStage> StageBuilder<L> {
    /// Opts into merge/add/subtract. Never inherited from the base.
    pub fn with_aggregation(mut self) -> Self {
        self.merge = Some(Aggregation::delta());
        self
    }
}

impl<L: MergeWithAllStage> StageBuilder<L> {
    /// Opts into aggregation with access to every workspace's shared state.
    pub fn with_merge_with_all(mut self) -> Self {
        self.merge_with_all = Some(Aggregation::with_all());
        self
    }
}

/// Stateless stage forwarding every call to its base unchanged.
pub struct PassThrough<S: Shape> {
    _shape: PhantomData<fn() -> S>,
}

impl<S: Shape> CrossCuttingStage for PassThrough<S> {}

impl<S: Shape> DelegatingStage for PassThrough<S> {
    type Shape = S;
    type BaseShape = S;

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE.with(Capability::Update)
    }

    fn learn(
        &mut self,
        base: &mut Base<S>,
        ctx: &mut ExecutionContext,
        unit: &mut Unit<S>,
    ) -> Result<()> {
        base.learn(ctx, unit, 0)
    }

    fn predict(
        &mut self,
        base: &mut Base<S>,
        ctx: &mut ExecutionContext,
        unit: &mut Unit<S>,
    ) -> Result<()> {
        base.predict(ctx, unit, 0)
    }

    fn update(
        &mut self,
        base: &mut Base<S>,
        ctx: &mut ExecutionContext,
        unit: &mut Unit<S>,
    ) -> Result<()> {
        base.update(ctx, unit, 0)
    }
}

impl<S: Shape> StageBuilder<PassThrough<S>> {
    /// The no-private-state variant.
    pub fn pass_through(name: impl Into<String>) -> Self {
        let mut builder = Self::new(
            name,
            PassThrough {
                _shape: PhantomData,
            },
        );
        builder.stateless = true;
        builder
    }
}
