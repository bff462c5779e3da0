//! Runs its base once per copy, each copy in its own weight sub-slot.
use stack_core::{
    Base, CrossCuttingStage, DelegatingStage, Example, ExecutionContext, MergeableStage,
    Prediction, Result, Single, StageBuilder, StageError, StageHandle,
};
use stack_setup::{SetupContext, SetupError};

pub const DEFAULT_COPIES: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoublingStage {
    copies: u64,
}

impl DoublingStage {
    pub fn new(copies: u64) -> Self {
        Self { copies }
    }

    pub fn copies(&self) -> u64 {
        self.copies
    }

    fn average(&self, sum: f32, ex: &mut Example) {
        ex.prediction = Prediction::Scalar(sum / self.copies as f32);
    }
}

impl CrossCuttingStage for DoublingStage {}

impl DelegatingStage for DoublingStage {
    type Shape = Single;
    type BaseShape = Single;

    fn learn(&mut self, base: &mut Base<Single>, ctx: &mut ExecutionContext, ex: &mut Example) -> Result<()> {
        let mut sum = 0.0;
        let mut loss = 0.0;
        for i in 0..self.copies {
            base.learn(ctx, ex, i)?;
            sum += ex.prediction.scalar().unwrap_or(0.0);
            loss += ex.loss;
        }
        ex.loss = loss / self.copies as f32;
        self.average(sum, ex);
        Ok(())
    }

    fn predict(&mut self, base: &mut Base<Single>, ctx: &mut ExecutionContext, ex: &mut Example) -> Result<()> {
        let mut sum = 0.0;
        for i in 0..self.copies {
            base.predict(ctx, ex, i)?;
            sum += ex.prediction.scalar().unwrap_or(0.0);
        }
        self.average(sum, ex);
        Ok(())
    }
}

impl MergeableStage for DoublingStage {
    fn merge(_weights: &[f32], sources: &[&Self], into: &mut Self) -> Result<()> {
        for source in sources {
            if source.copies != into.copies {
                return Err(StageError::ExecutionFailed(format!(
                    "cannot merge {} copies into {}",
                    source.copies, into.copies
                ))
                .into());
            }
        }
        Ok(())
    }

    fn add(base: &Self, delta: &Self, into: &mut Self) -> Result<()> {
        Self::merge(&[1.0, 1.0], &[base, delta], into)
    }

    fn subtract(minuend: &Self, subtrahend: &Self, into: &mut Self) -> Result<()> {
        Self::merge(&[1.0, 1.0], &[minuend, subtrahend], into)
    }
}

/// `doubling: <copies>` sets the number of copies.
pub fn setup(ctx: &mut SetupContext<'_>) -> stack_setup::Result<Option<StageHandle>> {
    if !ctx.options().enabled("doubling") {
        return Ok(None);
    }
    let copies: u64 = ctx.options().get_or("doubling", DEFAULT_COPIES)?;
    if copies == 0 {
        return Err(SetupError::InvalidOption {
            key: "doubling".to_string(),
            reason: "needs at least one copy".to_string(),
        });
    }
    let base = ctx.setup_base()?;
    let stage = StageBuilder::new("doubling", DoublingStage::new(copies))
        .weights_per_example(copies)
        .with_aggregation()
        .build(Some(base))?;
    Ok(Some(stage.into()))
}
