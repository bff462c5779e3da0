//! Pipeline: the assembled chain, driven from its top stage.
//!
//! `learn`, `predict`, `update`, `sensitivity`, `multipredict` and
//! `finish_example` go to the top stage only; whatever happens below is up
//! to the stages. `save_load`, `pre_save_load`, `persist_metrics`,
//! `end_pass`, `end_examples` and `finish` visit every stage, top first.
use serde::Serialize;

use crate::context::ExecutionContext;
use crate::contract::{AnyStage, Stage, StageHandle, StageMeta};
use crate::data_model::{Example, ExampleUnit, MultiEx, Prediction, ShapeKind};
use crate::error::{Result, StackError};
use crate::io::{ModelBuffer, ModelIo};
use crate::metrics::MetricSink;
use crate::stage::{Capability, Multi, Single};

const MODEL_MAGIC: &[u8; 4] = b"RSTK";
pub const MODEL_FORMAT_VERSION: u32 = 1;
const CHECKSUM_LEN: usize = 32;

/// Serializable view of one stage at a given depth (0 = top).
#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub depth: usize,
    #[serde(flatten)]
    pub meta: StageMeta,
    pub capabilities: Vec<Capability>,
}

pub struct Pipeline {
    top: StageHandle,
    stack_id: String,
}

fn walk(stage: &dyn AnyStage, f: &mut dyn FnMut(&dyn AnyStage)) {
    f(stage);
    if let Some(base) = stage.base() {
        walk(base, f);
    }
}

fn walk_mut(
    stage: &mut dyn AnyStage,
    f: &mut dyn FnMut(&mut dyn AnyStage) -> Result<()>,
) -> Result<()> {
    f(stage)?;
    match stage.base_mut() {
        Some(base) => walk_mut(base, f),
        None => Ok(()),
    }
}

impl Pipeline {
    pub fn new(top: StageHandle) -> Self {
        let mut names = Vec::new();
        walk(top.as_any(), &mut |s| names.push(s.meta().name.clone()));
        let stack_id = names.join("→");
        Self { top, stack_id }
    }

    pub fn top(&self) -> &dyn AnyStage {
        self.top.as_any()
    }

    pub fn top_mut(&mut self) -> &mut dyn AnyStage {
        self.top.as_any_mut()
    }

    pub fn handle(&self) -> &StageHandle {
        &self.top
    }

    pub fn shape(&self) -> ShapeKind {
        self.top.shape()
    }

    /// Increment of the top stage: offsets needed per feature.
    pub fn increment(&self) -> u64 {
        self.top.increment()
    }

    /// Stage names, top to bottom, joined with `→`.
    pub fn stack_id(&self) -> &str {
        &self.stack_id
    }

    pub fn depth(&self) -> usize {
        let mut depth = 0;
        walk(self.top(), &mut |_| depth += 1);
        depth
    }

    /// Stage at `depth` (0 = top).
    pub fn stage_at(&self, depth: usize) -> Option<&dyn AnyStage> {
        let mut current = Some(self.top());
        for _ in 0..depth {
            current = current?.base();
        }
        current
    }

    pub fn stage_at_mut(&mut self, depth: usize) -> Option<&mut dyn AnyStage> {
        fn descend(stage: &mut dyn AnyStage, depth: usize) -> Option<&mut dyn AnyStage> {
            if depth == 0 {
                Some(stage)
            } else {
                descend(stage.base_mut()?, depth - 1)
            }
        }
        descend(self.top.as_any_mut(), depth)
    }

    /// First stage named `name`, searching from the top.
    pub fn find(&self, name: &str) -> Option<&dyn AnyStage> {
        let mut current = Some(self.top());
        while let Some(stage) = current {
            if stage.meta().name == name {
                return Some(stage);
            }
            current = stage.base();
        }
        None
    }

    pub fn describe(&self) -> Vec<StageSummary> {
        let mut out = Vec::new();
        walk(self.top(), &mut |s| {
            out.push(StageSummary {
                depth: out.len(),
                meta: s.meta().clone(),
                capabilities: s.capabilities().iter().collect(),
            })
        });
        out
    }

    /// Hash of the stack composition; a saved model only loads into a
    /// pipeline with the same fingerprint.
    pub fn fingerprint(&self) -> blake3::Hash {
        let summary = serde_json::to_vec(&self.describe()).unwrap_or_default();
        blake3::hash(&summary)
    }

    fn dispatch<T>(
        &mut self,
        ctx: &mut ExecutionContext,
        unit: &mut ExampleUnit,
        single: impl FnOnce(&mut Stage<Single>, &mut ExecutionContext, &mut Example) -> Result<T>,
        multi: impl FnOnce(&mut Stage<Multi>, &mut ExecutionContext, &mut MultiEx) -> Result<T>,
    ) -> Result<T> {
        match (&mut self.top, unit) {
            (StageHandle::Single(top), ExampleUnit::Single(ex)) => single(top.as_mut(), ctx, ex),
            (StageHandle::Multi(top), ExampleUnit::Multi(exs)) => multi(top.as_mut(), ctx, exs),
            (top, unit) => Err(StackError::ShapeMismatch {
                stage: top.name().to_string(),
                expected: top.shape(),
                found: unit.shape(),
            }),
        }
    }

    pub fn learn(&mut self, ctx: &mut ExecutionContext, unit: &mut ExampleUnit) -> Result<()> {
        self.dispatch(
            ctx,
            unit,
            |top, ctx, ex| top.learn(ctx, ex, 0),
            |top, ctx, exs| top.learn(ctx, exs, 0),
        )
    }

    pub fn predict(&mut self, ctx: &mut ExecutionContext, unit: &mut ExampleUnit) -> Result<()> {
        self.dispatch(
            ctx,
            unit,
            |top, ctx, ex| top.predict(ctx, ex, 0),
            |top, ctx, exs| top.predict(ctx, exs, 0),
        )
    }

    pub fn update(&mut self, ctx: &mut ExecutionContext, unit: &mut ExampleUnit) -> Result<()> {
        self.dispatch(
            ctx,
            unit,
            |top, ctx, ex| top.update(ctx, ex, 0),
            |top, ctx, exs| top.update(ctx, exs, 0),
        )
    }

    pub fn sensitivity(&mut self, ctx: &mut ExecutionContext, unit: &mut ExampleUnit) -> Result<f32> {
        self.dispatch(
            ctx,
            unit,
            |top, ctx, ex| top.sensitivity(ctx, ex, 0),
            |top, ctx, exs| top.sensitivity(ctx, exs, 0),
        )
    }

    pub fn multipredict(
        &mut self,
        ctx: &mut ExecutionContext,
        unit: &mut ExampleUnit,
        lo: u64,
        count: usize,
    ) -> Result<Vec<Prediction>> {
        self.dispatch(
            ctx,
            unit,
            |top, ctx, ex| top.multipredict(ctx, ex, lo, count),
            |top, ctx, exs| top.multipredict(ctx, exs, lo, count),
        )
    }

    /// Terminal call for a unit; call exactly once, after the last learn/predict.
    pub fn finish_example(&mut self, ctx: &mut ExecutionContext, unit: &mut ExampleUnit) -> Result<()> {
        self.dispatch(
            ctx,
            unit,
            |top, ctx, ex| top.finish_example(ctx, ex),
            |top, ctx, exs| top.finish_example(ctx, exs),
        )
    }

    pub fn save_load(&mut self, ctx: &mut ExecutionContext, io: &mut dyn ModelIo, read: bool) -> Result<()> {
        let span = tracing::debug_span!("save_load", read, stack = %self.stack_id);
        let _enter = span.enter();
        walk_mut(self.top.as_any_mut(), &mut |stage: &mut dyn AnyStage| {
            let name = stage.meta().name.clone();
            stage
                .cross_cutting()
                .save_load(ctx, io, read)
                .map_err(|source| StackError::Persistence { stage: name, source })
        })
    }

    pub fn pre_save_load(&mut self, ctx: &mut ExecutionContext) -> Result<()> {
        walk_mut(self.top.as_any_mut(), &mut |stage: &mut dyn AnyStage| {
            stage.cross_cutting().pre_save_load(ctx)
        })
    }

    pub fn persist_metrics(&self, sink: &mut MetricSink) -> Result<()> {
        let mut result = Ok(());
        walk(self.top(), &mut |stage| {
            if result.is_ok() {
                result = stage.persist_metrics(sink);
            }
        });
        result
    }

    pub fn end_pass(&mut self, ctx: &mut ExecutionContext) -> Result<()> {
        tracing::debug!(stack = %self.stack_id, "end of pass");
        walk_mut(self.top.as_any_mut(), &mut |stage: &mut dyn AnyStage| {
            stage.cross_cutting().end_pass(ctx)
        })
    }

    pub fn end_examples(&mut self, ctx: &mut ExecutionContext) -> Result<()> {
        walk_mut(self.top.as_any_mut(), &mut |stage: &mut dyn AnyStage| {
            stage.cross_cutting().end_examples(ctx)
        })
    }

    pub fn finish(&mut self, ctx: &mut ExecutionContext) -> Result<()> {
        tracing::debug!(stack = %self.stack_id, "finishing stack");
        walk_mut(self.top.as_any_mut(), &mut |stage: &mut dyn AnyStage| {
            stage.cross_cutting().finish(ctx)
        })
    }

    fn write_header(&self, ctx: &ExecutionContext, io: &mut dyn ModelIo) -> std::io::Result<()> {
        if io.text_mode() {
            io.write_text(&format!("stack {}\n", self.stack_id))?;
            io.write_text(&format!("fingerprint blake3:{}\n", self.fingerprint()))?;
            return io.write_u32("bits", ctx.weights.layout().bits);
        }
        io.write_fixed(MODEL_MAGIC)?;
        io.write_u32("version", MODEL_FORMAT_VERSION)?;
        io.write_fixed(self.fingerprint().as_bytes())?;
        io.write_u32("bits", ctx.weights.layout().bits)
    }

    fn check_header(&self, ctx: &ExecutionContext, io: &mut dyn ModelIo) -> Result<()> {
        let header_err = |e: std::io::Error| StackError::ModelFormat(format!("unreadable header: {}", e));
        let mut magic = [0u8; 4];
        io.read_fixed(&mut magic).map_err(header_err)?;
        if &magic != MODEL_MAGIC {
            return Err(StackError::ModelFormat("not a stack model".to_string()));
        }
        let version = io.read_u32().map_err(header_err)?;
        if version != MODEL_FORMAT_VERSION {
            return Err(StackError::ModelFormat(format!(
                "format version {} (expected {})",
                version, MODEL_FORMAT_VERSION
            )));
        }
        let mut fingerprint = [0u8; 32];
        io.read_fixed(&mut fingerprint).map_err(header_err)?;
        if &fingerprint != self.fingerprint().as_bytes() {
            return Err(StackError::ModelFormat(format!(
                "model was saved by a different stack than {}",
                self.stack_id
            )));
        }
        let bits = io.read_u32().map_err(header_err)?;
        if bits != ctx.weights.layout().bits {
            return Err(StackError::ModelFormat(format!(
                "model has {} bits, workspace has {}",
                bits,
                ctx.weights.layout().bits
            )));
        }
        Ok(())
    }

    /// Header, one record per stage top to bottom, then a blake3 checksum.
    pub fn save_to_bytes(&mut self, ctx: &mut ExecutionContext) -> Result<Vec<u8>> {
        self.pre_save_load(ctx)?;
        let mut io = ModelBuffer::new();
        self.write_header(ctx, &mut io)
            .map_err(|e| StackError::ModelFormat(e.to_string()))?;
        self.save_load(ctx, &mut io, false)?;
        let mut bytes = io.into_bytes();
        let checksum = blake3::hash(&bytes);
        bytes.extend_from_slice(checksum.as_bytes());
        Ok(bytes)
    }

    /// Validates checksum and header before any stage reads. If a stage
    /// record fails to read, every stage is put back to its state before the
    /// call.
    pub fn load_from_bytes(&mut self, ctx: &mut ExecutionContext, bytes: &[u8]) -> Result<()> {
        if bytes.len() < CHECKSUM_LEN {
            return Err(StackError::ModelFormat("model file is truncated".to_string()));
        }
        let (payload, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        if blake3::hash(payload).as_bytes() != checksum {
            return Err(StackError::ModelFormat("checksum mismatch".to_string()));
        }
        let mut io = ModelBuffer::from_bytes(payload.to_vec());
        self.check_header(ctx, &mut io)?;
        self.pre_save_load(ctx)?;

        let mut snapshot = ModelBuffer::new();
        self.save_load(ctx, &mut snapshot, false)?;
        let loaded = self.save_load(ctx, &mut io, true).and_then(|()| match io.remaining() {
            0 => Ok(()),
            n => Err(StackError::ModelFormat(format!(
                "{} unread bytes after the last stage",
                n
            ))),
        });
        if let Err(err) = loaded {
            tracing::warn!(stack = %self.stack_id, error = %err, "model load failed, restoring previous state");
            let mut restore = ModelBuffer::from_bytes(snapshot.into_bytes());
            self.save_load(ctx, &mut restore, true)?;
            return Err(err);
        }
        Ok(())
    }

    /// Human-readable dump of the model; cannot be loaded back.
    pub fn save_readable(&mut self, ctx: &mut ExecutionContext) -> Result<String> {
        self.pre_save_load(ctx)?;
        let mut io = ModelBuffer::text();
        self.write_header(ctx, &mut io)
            .map_err(|e| StackError::ModelFormat(e.to_string()))?;
        self.save_load(ctx, &mut io, false)?;
        Ok(String::from_utf8_lossy(io.as_bytes()).into_owned())
    }

    pub fn save_to_path(&mut self, ctx: &mut ExecutionContext, path: impl AsRef<std::path::Path>) -> Result<()> {
        let bytes = self.save_to_bytes(ctx)?;
        std::fs::write(path.as_ref(), bytes).map_err(|source| StackError::Persistence {
            stage: format!("{} ({})", self.stack_id, path.as_ref().display()),
            source,
        })
    }

    pub fn load_from_path(&mut self, ctx: &mut ExecutionContext, path: impl AsRef<std::path::Path>) -> Result<()> {
        let bytes = std::fs::read(path.as_ref()).map_err(|source| StackError::Persistence {
            stage: format!("{} ({})", self.stack_id, path.as_ref().display()),
            source,
        })?;
        self.load_from_bytes(ctx, &bytes)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stack_id", &self.stack_id)
            .field("increment", &self.increment())
            .finish()
    }
}
