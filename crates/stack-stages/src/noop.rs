use stack_core::{
    Base, Capabilities, Capability, CrossCuttingStage, DelegatingStage, Example, ExecutionContext,
    MergeableStage, Prediction, Result, Single, StageBuilder, StageHandle,
};
use stack_setup::SetupContext;

/// Terminal stage that learns nothing and always predicts zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStage;

impl CrossCuttingStage for NoopStage {}

impl DelegatingStage for NoopStage {
    type Shape = Single;
    type BaseShape = Single;

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE.with(Capability::FinishExample)
    }

    fn learn(&mut self, _base: &mut Base<Single>, _ctx: &mut ExecutionContext, ex: &mut Example) -> Result<()> {
        ex.prediction = Prediction::Scalar(0.0);
        Ok(())
    }

    fn predict(&mut self, _base: &mut Base<Single>, _ctx: &mut ExecutionContext, ex: &mut Example) -> Result<()> {
        ex.prediction = Prediction::Scalar(0.0);
        Ok(())
    }

    fn finish_example(&mut self, _base: &mut Base<Single>, ctx: &mut ExecutionContext, _ex: &mut Example) -> Result<()> {
        ctx.stats.examples += 1;
        Ok(())
    }
}

impl MergeableStage for NoopStage {
    fn merge(_weights: &[f32], _sources: &[&Self], _into: &mut Self) -> Result<()> {
        Ok(())
    }

    fn add(_base: &Self, _delta: &Self, _into: &mut Self) -> Result<()> {
        Ok(())
    }

    fn subtract(_minuend: &Self, _subtrahend: &Self, _into: &mut Self) -> Result<()> {
        Ok(())
    }
}

pub fn setup(ctx: &mut SetupContext<'_>) -> stack_setup::Result<Option<StageHandle>> {
    if !ctx.options().enabled("noop") {
        return Ok(None);
    }
    let stage = StageBuilder::new("noop", NoopStage)
        .with_aggregation()
        .build_terminal()?;
    Ok(Some(stage.into()))
}
