//! Linear scorer over the shared weight vector, trained with the delta rule.
//!
//! This is the usual terminal stage: it owns the weights' persistence and
//! averages them across workspaces on merge.
use std::io;

use stack_core::{
    Base, Capabilities, Capability, CrossCuttingStage, DelegatingStage, Example, ExecutionContext,
    Label, MergeWithAllStage, MetricSink, ModelIo, Prediction, Result, Single, StageBuilder,
    StageError, StageHandle,
};
use stack_setup::SetupContext;

use crate::progress::Progress;

pub const DEFAULT_LEARNING_RATE: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct LinearStage {
    learning_rate: f32,
    updates: u64,
    progress: Progress,
}

impl LinearStage {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            updates: 0,
            progress: Progress::default(),
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }
}

impl Default for LinearStage {
    fn default() -> Self {
        Self::new(DEFAULT_LEARNING_RATE)
    }
}

impl CrossCuttingStage for LinearStage {
    fn save_load(&mut self, ctx: &mut ExecutionContext, io: &mut dyn ModelIo, read: bool) -> io::Result<()> {
        if read {
            self.updates = io.read_u64()?;
        } else {
            io.write_u64("updates", self.updates)?;
        }
        ctx.weights.save_load(io, read)
    }

    fn persist_metrics(&self, sink: &mut MetricSink) -> Result<()> {
        sink.set_int("linear_updates", self.updates as i64);
        sink.set_float("linear_learning_rate", self.learning_rate as f64);
        Ok(())
    }
}

impl DelegatingStage for LinearStage {
    type Shape = Single;
    type BaseShape = Single;

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
            .with(Capability::Sensitivity)
            .with(Capability::UpdateStats)
            .with(Capability::OutputPrediction)
            .with(Capability::PrintUpdate)
    }

    fn learn(&mut self, base: &mut Base<Single>, ctx: &mut ExecutionContext, ex: &mut Example) -> Result<()> {
        self.predict(base, ctx, ex)?;
        let y = match ex.label {
            Label::Simple(y) if !ex.test_only => y,
            Label::None => return Ok(()),
            Label::Simple(_) => return Ok(()),
            ref other => {
                return Err(StageError::InvalidExample(format!(
                    "linear stage needs a simple label, got {}",
                    other.kind()
                ))
                .into())
            }
        };
        let pred = ex.prediction.scalar().unwrap_or(0.0);
        let err = y - pred;
        ex.loss = err * err;
        let step = self.learning_rate * err * ex.weight;
        for (f, v) in &ex.features {
            *ctx.weights.get_mut(*f, ex.ft_offset) += step * v;
        }
        self.updates += 1;
        Ok(())
    }

    fn predict(&mut self, _base: &mut Base<Single>, ctx: &mut ExecutionContext, ex: &mut Example) -> Result<()> {
        ex.prediction = Prediction::Scalar(ctx.weights.dot(&ex.features, ex.ft_offset));
        Ok(())
    }

    /// Change in prediction per unit of label error on this example.
    fn sensitivity(&mut self, _base: &mut Base<Single>, _ctx: &mut ExecutionContext, ex: &mut Example) -> Result<f32> {
        let norm: f32 = ex.features.iter().map(|(_, v)| v * v).sum();
        Ok(self.learning_rate * ex.weight * norm)
    }

    fn update_stats(&mut self, ctx: &mut ExecutionContext, ex: &Example) -> Result<()> {
        let weight = ex.weight as f64;
        ctx.stats.examples += 1;
        ctx.stats.weighted_examples += weight;
        if ex.is_labeled() {
            ctx.stats.weighted_labeled += weight;
            ctx.stats.sum_loss += ex.loss as f64 * weight;
        }
        Ok(())
    }

    fn output_prediction(&mut self, ctx: &mut ExecutionContext, ex: &Example) -> Result<()> {
        let line = match &ex.tag {
            Some(tag) => format!("{} {}", ex.prediction, tag),
            None => ex.prediction.to_string(),
        };
        ctx.predictions.push(line);
        Ok(())
    }

    fn print_update(&mut self, ctx: &mut ExecutionContext, ex: &Example) -> Result<()> {
        self.progress.report(ctx, &ex.prediction.to_string());
        Ok(())
    }
}

impl MergeWithAllStage for LinearStage {
    fn merge_with_all(
        weights: &[f32],
        sources: &[(&Self, &ExecutionContext)],
        into: &mut Self,
        into_ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let total: f32 = weights.iter().sum();
        if total <= 0.0 {
            return Err(StageError::ExecutionFailed("merge weights must sum to a positive value".to_string()).into());
        }
        let out = into_ctx.weights.as_mut_slice();
        out.iter_mut().for_each(|w| *w = 0.0);
        for (scale, (_, ctx)) in weights.iter().zip(sources) {
            let scale = scale / total;
            for (o, s) in out.iter_mut().zip(ctx.weights.as_slice()) {
                *o += scale * s;
            }
        }

        let stats = &mut into_ctx.stats;
        stats.examples = sources.iter().map(|(_, c)| c.stats.examples).sum();
        stats.weighted_examples = sources.iter().map(|(_, c)| c.stats.weighted_examples).sum();
        stats.weighted_labeled = sources.iter().map(|(_, c)| c.stats.weighted_labeled).sum();
        stats.sum_loss = sources.iter().map(|(_, c)| c.stats.sum_loss).sum();
        stats.passes_complete = sources
            .iter()
            .map(|(_, c)| c.stats.passes_complete)
            .max()
            .unwrap_or(stats.passes_complete);

        into.updates = sources.iter().map(|(s, _)| s.updates).sum();
        if let Some((first, _)) = sources.first() {
            into.learning_rate = first.learning_rate;
        }
        Ok(())
    }

    fn add_with_all(
        base: (&Self, &ExecutionContext),
        delta: (&Self, &ExecutionContext),
        into: &mut Self,
        into_ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let out = into_ctx.weights.as_mut_slice();
        for ((o, b), d) in out.iter_mut().zip(base.1.weights.as_slice()).zip(delta.1.weights.as_slice()) {
            *o = b + d;
        }
        into.updates = base.0.updates + delta.0.updates;
        into.learning_rate = base.0.learning_rate;
        Ok(())
    }

    fn subtract_with_all(
        minuend: (&Self, &ExecutionContext),
        subtrahend: (&Self, &ExecutionContext),
        into: &mut Self,
        into_ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let out = into_ctx.weights.as_mut_slice();
        for ((o, a), b) in out
            .iter_mut()
            .zip(minuend.1.weights.as_slice())
            .zip(subtrahend.1.weights.as_slice())
        {
            *o = a - b;
        }
        into.updates = minuend.0.updates.saturating_sub(subtrahend.0.updates);
        into.learning_rate = minuend.0.learning_rate;
        Ok(())
    }
}

/// Always applies; the bottom of every default stack.
pub fn setup(ctx: &mut SetupContext<'_>) -> stack_setup::Result<Option<StageHandle>> {
    let learning_rate = ctx.options().get_or("learning_rate", DEFAULT_LEARNING_RATE)?;
    let stage = StageBuilder::new("linear", LinearStage::new(learning_rate))
        .with_merge_with_all()
        .build_terminal()?;
    Ok(Some(stage.into()))
}
