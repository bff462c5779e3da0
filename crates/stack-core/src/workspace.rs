//! Workspace: one pipeline plus the state its stages share.
use std::path::Path;

use crate::context::ExecutionContext;
use crate::contract::StageHandle;
use crate::data_model::{ExampleUnit, Prediction};
use crate::error::Result;
use crate::metrics::MetricSink;
use crate::pipeline::Pipeline;
use crate::weights::WeightVector;

/// Independent unit of training. Workspaces never share state; parallel
/// training uses one per thread and combines them with [`crate::aggregate`].
#[derive(Debug)]
pub struct Workspace {
    pub pipeline: Pipeline,
    pub ctx: ExecutionContext,
}

impl Workspace {
    /// Sizes the weight vector from the top stage's increment. Fails when
    /// `bits` plus the stride shift exceeds [`crate::weights::MAX_ADDRESS_BITS`].
    pub fn new(top: impl Into<StageHandle>, bits: u32) -> Result<Self> {
        let pipeline = Pipeline::new(top.into());
        let weights = WeightVector::new(bits, pipeline.increment())?;
        let ctx = ExecutionContext::new(weights);
        tracing::info!(
            trace_id = %ctx.trace_id,
            stack = %pipeline.stack_id(),
            bits,
            stride_shift = ctx.weights.layout().stride_shift,
            "workspace assembled"
        );
        Ok(Self { pipeline, ctx })
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.ctx.quiet = quiet;
        self
    }

    pub fn learn(&mut self, unit: &mut ExampleUnit) -> Result<()> {
        self.pipeline.learn(&mut self.ctx, unit)
    }

    pub fn predict(&mut self, unit: &mut ExampleUnit) -> Result<()> {
        self.pipeline.predict(&mut self.ctx, unit)
    }

    pub fn update(&mut self, unit: &mut ExampleUnit) -> Result<()> {
        self.pipeline.update(&mut self.ctx, unit)
    }

    pub fn sensitivity(&mut self, unit: &mut ExampleUnit) -> Result<f32> {
        self.pipeline.sensitivity(&mut self.ctx, unit)
    }

    pub fn multipredict(&mut self, unit: &mut ExampleUnit, lo: u64, count: usize) -> Result<Vec<Prediction>> {
        self.pipeline.multipredict(&mut self.ctx, unit, lo, count)
    }

    pub fn finish_example(&mut self, unit: &mut ExampleUnit) -> Result<()> {
        self.pipeline.finish_example(&mut self.ctx, unit)
    }

    /// Learns (or predicts, for test-only units) and then finishes the unit.
    pub fn process(&mut self, unit: &mut ExampleUnit) -> Result<()> {
        let test_only = match &*unit {
            ExampleUnit::Single(ex) => ex.test_only,
            ExampleUnit::Multi(exs) => exs.iter().all(|ex| ex.test_only),
        };
        if test_only {
            self.predict(unit)?;
        } else {
            self.learn(unit)?;
        }
        self.finish_example(unit)
    }

    pub fn end_pass(&mut self) -> Result<()> {
        self.pipeline.end_pass(&mut self.ctx)?;
        self.ctx.stats.passes_complete += 1;
        Ok(())
    }

    pub fn end_examples(&mut self) -> Result<()> {
        self.pipeline.end_examples(&mut self.ctx)
    }

    /// Shared statistics first, then every stage top to bottom.
    pub fn metrics(&self) -> Result<MetricSink> {
        let mut sink = MetricSink::new();
        sink.set_string("stack", self.pipeline.stack_id());
        self.ctx.stats.persist(&mut sink);
        self.pipeline.persist_metrics(&mut sink)?;
        sink.stamp();
        Ok(sink)
    }

    pub fn save_to_bytes(&mut self) -> Result<Vec<u8>> {
        self.pipeline.save_to_bytes(&mut self.ctx)
    }

    pub fn load_from_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.pipeline.load_from_bytes(&mut self.ctx, bytes)
    }

    pub fn save_readable(&mut self) -> Result<String> {
        self.pipeline.save_readable(&mut self.ctx)
    }

    pub fn save_to_path(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.pipeline.save_to_path(&mut self.ctx, path)
    }

    pub fn load_from_path(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.pipeline.load_from_path(&mut self.ctx, path)
    }

    /// Runs `end_examples` and `finish` on every stage, consuming the workspace.
    pub fn finish(mut self) -> Result<ExecutionContext> {
        self.pipeline.end_examples(&mut self.ctx)?;
        self.pipeline.finish(&mut self.ctx)?;
        tracing::info!(
            trace_id = %self.ctx.trace_id,
            examples = self.ctx.stats.examples,
            average_loss = self.ctx.stats.average_loss(),
            "workspace finished"
        );
        Ok(self.ctx)
    }
}
