//! Counts the calls that pass through it; otherwise transparent.
use serde::Serialize;
use std::io;

use stack_core::{
    Base, CrossCuttingStage, DelegatingStage, Example, ExecutionContext, MergeableStage,
    MetricSink, ModelIo, Result, Single, StageBuilder, StageHandle,
};
use stack_setup::SetupContext;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CountingStage {
    pub learns: u64,
    pub predicts: u64,
    pub passes: u32,
}

impl CrossCuttingStage for CountingStage {
    fn save_load(&mut self, _ctx: &mut ExecutionContext, io: &mut dyn ModelIo, read: bool) -> io::Result<()> {
        if read {
            self.learns = io.read_u64()?;
            self.predicts = io.read_u64()?;
        } else {
            io.write_u64("counting_learns", self.learns)?;
            io.write_u64("counting_predicts", self.predicts)?;
        }
        Ok(())
    }

    fn persist_metrics(&self, sink: &mut MetricSink) -> Result<()> {
        sink.set_int("counting_learns", self.learns as i64);
        sink.set_int("counting_predicts", self.predicts as i64);
        Ok(())
    }

    fn end_pass(&mut self, _ctx: &mut ExecutionContext) -> Result<()> {
        self.passes += 1;
        tracing::debug!(learns = self.learns, passes = self.passes, "counting: pass complete");
        Ok(())
    }
}

impl DelegatingStage for CountingStage {
    type Shape = Single;
    type BaseShape = Single;

    fn learn(&mut self, base: &mut Base<Single>, ctx: &mut ExecutionContext, ex: &mut Example) -> Result<()> {
        self.learns += 1;
        base.learn(ctx, ex, 0)
    }

    fn predict(&mut self, base: &mut Base<Single>, ctx: &mut ExecutionContext, ex: &mut Example) -> Result<()> {
        self.predicts += 1;
        base.predict(ctx, ex, 0)
    }
}

fn weighted(count: u64, weight: f32) -> u64 {
    (count as f64 * weight as f64).round() as u64
}

impl MergeableStage for CountingStage {
    /// Counters add up; each source is scaled by its weight.
    fn merge(weights: &[f32], sources: &[&Self], into: &mut Self) -> Result<()> {
        into.learns = weights.iter().zip(sources).map(|(w, s)| weighted(s.learns, *w)).sum();
        into.predicts = weights.iter().zip(sources).map(|(w, s)| weighted(s.predicts, *w)).sum();
        into.passes = sources.iter().map(|s| s.passes).max().unwrap_or(0);
        Ok(())
    }

    fn add(base: &Self, delta: &Self, into: &mut Self) -> Result<()> {
        into.learns = base.learns + delta.learns;
        into.predicts = base.predicts + delta.predicts;
        into.passes = base.passes.max(delta.passes);
        Ok(())
    }

    fn subtract(minuend: &Self, subtrahend: &Self, into: &mut Self) -> Result<()> {
        into.learns = minuend.learns.saturating_sub(subtrahend.learns);
        into.predicts = minuend.predicts.saturating_sub(subtrahend.predicts);
        into.passes = minuend.passes;
        Ok(())
    }
}

pub fn setup(ctx: &mut SetupContext<'_>) -> stack_setup::Result<Option<StageHandle>> {
    if !ctx.options().enabled("counting") {
        return Ok(None);
    }
    let base = ctx.setup_base()?;
    let stage = StageBuilder::new("counting", CountingStage::default())
        .with_aggregation()
        .build(Some(base))?;
    Ok(Some(stage.into()))
}
