//! Multi-line stage that hands each line to a single-line base.
use stack_core::{
    Base, Capabilities, Capability, CrossCuttingStage, DelegatingStage, ExecutionContext,
    MergeableStage, Multi, MultiEx, Prediction, Result, Single, StageBuilder, StageHandle,
};
use stack_setup::SetupContext;

use crate::progress::Progress;

#[derive(Debug, Clone, Default)]
pub struct EachLineStage {
    progress: Progress,
}

impl CrossCuttingStage for EachLineStage {}

impl DelegatingStage for EachLineStage {
    type Shape = Multi;
    type BaseShape = Single;

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
            .with(Capability::UpdateStats)
            .with(Capability::OutputPrediction)
            .with(Capability::PrintUpdate)
    }

    fn learn(&mut self, base: &mut Base<Single>, ctx: &mut ExecutionContext, lines: &mut MultiEx) -> Result<()> {
        for line in lines.iter_mut() {
            base.learn(ctx, line, 0)?;
        }
        Ok(())
    }

    fn predict(&mut self, base: &mut Base<Single>, ctx: &mut ExecutionContext, lines: &mut MultiEx) -> Result<()> {
        for line in lines.iter_mut() {
            base.predict(ctx, line, 0)?;
        }
        Ok(())
    }

    /// One unit counts as one example; labeled lines contribute loss.
    fn update_stats(&mut self, ctx: &mut ExecutionContext, lines: &MultiEx) -> Result<()> {
        ctx.stats.examples += 1;
        ctx.stats.weighted_examples += lines.first().map(|l| l.weight as f64).unwrap_or(0.0);
        for line in lines.iter().filter(|l| l.is_labeled()) {
            ctx.stats.weighted_labeled += line.weight as f64;
            ctx.stats.sum_loss += (line.loss * line.weight) as f64;
        }
        Ok(())
    }

    fn output_prediction(&mut self, ctx: &mut ExecutionContext, lines: &MultiEx) -> Result<()> {
        let predictions: Vec<&Prediction> = lines.iter().map(|l| &l.prediction).collect();
        let line = serde_json::to_string(&predictions).unwrap_or_default();
        ctx.predictions.push(line);
        Ok(())
    }

    fn print_update(&mut self, ctx: &mut ExecutionContext, lines: &MultiEx) -> Result<()> {
        self.progress.report(ctx, &format!("{} lines", lines.len()));
        Ok(())
    }
}

impl MergeableStage for EachLineStage {
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
    if !ctx.options().enabled("each_line") {
        return Ok(None);
    }
    let base = ctx.setup_base()?;
    let stage = StageBuilder::new("each_line", EachLineStage::default())
        .with_aggregation()
        .build(Some(base))?;
    Ok(Some(stage.into()))
}
