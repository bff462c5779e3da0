//! Terminal stage that bumps and records every weight slot it touches.
use stack_core::{
    Base, Capabilities, Capability, CrossCuttingStage, DelegatingStage, Example, ExecutionContext,
    MergeableStage, MetricSink, Prediction, Result, Single, StageBuilder, StageHandle,
};
use stack_setup::SetupContext;

/// One recorded write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotWrite {
    pub offset: u64,
    pub address: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SentinelStage {
    writes: Vec<SlotWrite>,
}

impl SentinelStage {
    pub fn writes(&self) -> &[SlotWrite] {
        &self.writes
    }

    /// Addresses written while the example carried `offset`.
    pub fn addresses_at(&self, offset: u64) -> Vec<usize> {
        let mut out: Vec<usize> = self
            .writes
            .iter()
            .filter(|w| w.offset == offset)
            .map(|w| w.address)
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}

impl CrossCuttingStage for SentinelStage {
    fn persist_metrics(&self, sink: &mut MetricSink) -> Result<()> {
        sink.set_int("sentinel_writes", self.writes.len() as i64);
        Ok(())
    }
}

impl DelegatingStage for SentinelStage {
    type Shape = Single;
    type BaseShape = Single;

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE.with(Capability::FinishExample)
    }

    fn learn(&mut self, _base: &mut Base<Single>, ctx: &mut ExecutionContext, ex: &mut Example) -> Result<()> {
        for (f, _) in &ex.features {
            let address = ctx.weights.address(*f, ex.ft_offset);
            *ctx.weights.get_mut(*f, ex.ft_offset) += 1.0;
            self.writes.push(SlotWrite {
                offset: ex.ft_offset,
                address,
            });
        }
        Ok(())
    }

    fn predict(&mut self, _base: &mut Base<Single>, ctx: &mut ExecutionContext, ex: &mut Example) -> Result<()> {
        ex.prediction = Prediction::Scalar(ctx.weights.dot(&ex.features, ex.ft_offset));
        Ok(())
    }

    fn finish_example(&mut self, _base: &mut Base<Single>, ctx: &mut ExecutionContext, _ex: &mut Example) -> Result<()> {
        ctx.stats.examples += 1;
        Ok(())
    }
}

impl MergeableStage for SentinelStage {
    fn merge(_weights: &[f32], sources: &[&Self], into: &mut Self) -> Result<()> {
        into.writes = sources.iter().flat_map(|s| s.writes.iter().copied()).collect();
        Ok(())
    }

    fn add(base: &Self, delta: &Self, into: &mut Self) -> Result<()> {
        into.writes = base.writes.iter().chain(&delta.writes).copied().collect();
        Ok(())
    }

    fn subtract(minuend: &Self, subtrahend: &Self, into: &mut Self) -> Result<()> {
        into.writes = minuend
            .writes
            .iter()
            .filter(|w| !subtrahend.writes.contains(*w))
            .copied()
            .collect();
        Ok(())
    }
}

pub fn setup(ctx: &mut SetupContext<'_>) -> stack_setup::Result<Option<StageHandle>> {
    if !ctx.options().enabled("sentinel") {
        return Ok(None);
    }
    let stage = StageBuilder::new("sentinel", SentinelStage::default())
        .with_aggregation()
        .build_terminal()?;
    Ok(Some(stage.into()))
}
