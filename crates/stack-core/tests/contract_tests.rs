//! Integration tests for the stage contract, builder and pipeline.
//!
//! ```text
//! top  (fanout ×2)   increment 6
//!   ↓
//! mid  (fanout ×3)   increment 3
//!   ↓
//! rec  (recorder)    increment 1
//! ```

use stack_core::{
    aggregate, Base, Capabilities, Capability, CrossCuttingStage, DelegatingStage, Example,
    ExampleUnit, ExecutionContext, Label, LabelKind, MergeableStage, ModelBuffer, ModelIo, Multi,
    PassThrough, Prediction, Result, Single, StackError, StageBuilder, StageError, StageHandle,
    Workspace,
};

// =============================================================================
// Test stages
// =============================================================================

/// Terminal stage remembering every offset it was called with.
struct Recorder {
    offsets: Vec<u64>,
    learns: u64,
    passes: u32,
    caps: Capabilities,
}

fn recorder() -> Recorder {
    Recorder {
        offsets: Vec::new(),
        learns: 0,
        passes: 0,
        caps: Capabilities::NONE.with(Capability::FinishExample),
    }
}

impl CrossCuttingStage for Recorder {
    fn save_load(
        &mut self,
        _ctx: &mut ExecutionContext,
        io: &mut dyn ModelIo,
        read: bool,
    ) -> std::io::Result<()> {
        if read {
            self.learns = io.read_u64()?;
        } else {
            io.write_u64("learns", self.learns)?;
        }
        Ok(())
    }

    fn end_pass(&mut self, _ctx: &mut ExecutionContext) -> Result<()> {
        self.passes += 1;
        Ok(())
    }
}

impl DelegatingStage for Recorder {
    type Shape = Single;
    type BaseShape = Single;

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn learn(&mut self, _base: &mut Base<Single>, _ctx: &mut ExecutionContext, unit: &mut Example) -> Result<()> {
        self.offsets.push(unit.ft_offset);
        self.learns += 1;
        Ok(())
    }

    fn predict(&mut self, _base: &mut Base<Single>, _ctx: &mut ExecutionContext, unit: &mut Example) -> Result<()> {
        unit.prediction = Prediction::Scalar(unit.ft_offset as f32);
        Ok(())
    }

    fn sensitivity(&mut self, _base: &mut Base<Single>, _ctx: &mut ExecutionContext, unit: &mut Example) -> Result<f32> {
        Ok(unit.ft_offset as f32 + 0.5)
    }

    fn finish_example(&mut self, _base: &mut Base<Single>, ctx: &mut ExecutionContext, _unit: &mut Example) -> Result<()> {
        ctx.stats.examples += 1;
        Ok(())
    }
}

/// Terminal stage that fails on its second learn.
#[derive(Default)]
struct Failing {
    calls: u32,
}

impl CrossCuttingStage for Failing {}

impl DelegatingStage for Failing {
    type Shape = Single;
    type BaseShape = Single;

    fn learn(&mut self, _base: &mut Base<Single>, _ctx: &mut ExecutionContext, _unit: &mut Example) -> Result<()> {
        self.calls += 1;
        if self.calls == 2 {
            return Err(StageError::ExecutionFailed("second call".to_string()).into());
        }
        Ok(())
    }

    fn predict(&mut self, _base: &mut Base<Single>, _ctx: &mut ExecutionContext, _unit: &mut Example) -> Result<()> {
        Ok(())
    }
}

/// Calls its base once per sub-slot on learn, once on predict.
struct Fanout {
    n: u64,
    passes: u32,
}

impl Fanout {
    fn new(n: u64) -> Self {
        Self { n, passes: 0 }
    }
}

impl CrossCuttingStage for Fanout {
    fn end_pass(&mut self, _ctx: &mut ExecutionContext) -> Result<()> {
        self.passes += 1;
        Ok(())
    }
}

impl DelegatingStage for Fanout {
    type Shape = Single;
    type BaseShape = Single;

    fn learn(&mut self, base: &mut Base<Single>, ctx: &mut ExecutionContext, unit: &mut Example) -> Result<()> {
        for i in 0..self.n {
            base.learn(ctx, unit, i)?;
        }
        Ok(())
    }

    fn predict(&mut self, base: &mut Base<Single>, ctx: &mut ExecutionContext, unit: &mut Example) -> Result<()> {
        base.predict(ctx, unit, 0)
    }
}

impl MergeableStage for Fanout {
    fn merge(_weights: &[f32], sources: &[&Self], into: &mut Self) -> Result<()> {
        into.passes = sources.iter().map(|s| s.passes).max().unwrap_or(0);
        Ok(())
    }

    fn add(base: &Self, delta: &Self, into: &mut Self) -> Result<()> {
        into.passes = base.passes + delta.passes;
        Ok(())
    }

    fn subtract(minuend: &Self, subtrahend: &Self, into: &mut Self) -> Result<()> {
        into.passes = minuend.passes.saturating_sub(subtrahend.passes);
        Ok(())
    }
}

/// Multi-line stage over a single-line base.
struct Lines;

impl CrossCuttingStage for Lines {}

impl DelegatingStage for Lines {
    type Shape = Multi;
    type BaseShape = Single;

    fn learn(&mut self, base: &mut Base<Single>, ctx: &mut ExecutionContext, unit: &mut Vec<Example>) -> Result<()> {
        for ex in unit.iter_mut() {
            base.learn(ctx, ex, 0)?;
        }
        Ok(())
    }

    fn predict(&mut self, base: &mut Base<Single>, ctx: &mut ExecutionContext, unit: &mut Vec<Example>) -> Result<()> {
        for ex in unit.iter_mut() {
            base.predict(ctx, ex, 0)?;
        }
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn three_level() -> StageHandle {
    let rec = StageBuilder::new("rec", recorder()).build_terminal().unwrap();
    let mid = StageBuilder::new("mid", Fanout::new(3))
        .weights_per_example(3)
        .build_on(rec)
        .unwrap();
    StageBuilder::new("top", Fanout::new(2))
        .weights_per_example(2)
        .build_on(mid)
        .unwrap()
        .into()
}

fn example() -> ExampleUnit {
    Example::new(vec![(1, 1.0)], Label::Simple(1.0)).into()
}

fn logic<T: 'static>(ws: &Workspace, depth: usize) -> &T {
    ws.pipeline
        .stage_at(depth)
        .and_then(|s| s.logic_any().downcast_ref::<T>())
        .expect("stage logic at depth")
}

// =============================================================================
// Builder
// =============================================================================

#[test]
fn test_increment_arithmetic() {
    let rec = StageBuilder::new("rec", recorder()).build_terminal().unwrap();
    assert_eq!(rec.increment(), 1);
    let mid = StageBuilder::new("mid", Fanout::new(3))
        .weights_per_example(3)
        .build_on(rec)
        .unwrap();
    assert_eq!(mid.increment(), 3);
    let top = StageBuilder::new("top", Fanout::new(2))
        .weights_per_example(2)
        .build_on(mid)
        .unwrap();
    assert_eq!(top.increment(), 6);
}

#[test]
fn test_build_without_base_fails() {
    let err = StageBuilder::new("orphan", Fanout::new(1)).build(None).unwrap_err();
    assert!(matches!(err, StackError::NullBase { .. }));
    assert!(err.to_string().starts_with("BUILD/orphan"));
}

#[test]
fn test_build_rejects_base_of_wrong_shape() {
    let rec = StageBuilder::new("rec", recorder()).build_terminal().unwrap();
    let lines = StageBuilder::new("lines", Lines).build_on(rec).unwrap();
    let err = StageBuilder::new("lines2", Lines).build_on(lines).unwrap_err();
    assert!(matches!(err, StackError::BaseShapeMismatch { .. }));
}

#[test]
fn test_build_rejects_label_mismatch() {
    let rec = StageBuilder::new("rec", recorder()).build_terminal().unwrap();
    let err = StageBuilder::new("mc", Fanout::new(1))
        .output_label(LabelKind::Multiclass)
        .build_on(rec)
        .unwrap_err();
    match err {
        StackError::TypeMismatch { what, stage, base, .. } => {
            assert_eq!(what, "label");
            assert_eq!(stage, "mc");
            assert_eq!(base, "rec");
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_build_rejects_zero_multiplier() {
    let rec = StageBuilder::new("rec", recorder()).build_terminal().unwrap();
    let err = StageBuilder::new("zero", Fanout::new(0))
        .weights_per_example(0)
        .build_on(rec)
        .unwrap_err();
    assert!(matches!(err, StackError::ZeroMultiplier { .. }));
}

#[test]
fn test_build_rejects_legacy_and_split_finish_together() {
    let mut both = recorder();
    both.caps = Capabilities::NONE
        .with(Capability::FinishExample)
        .with(Capability::PrintUpdate);
    let err = StageBuilder::new("both", both).build_terminal().unwrap_err();
    assert!(matches!(err, StackError::DuplicateFinish { .. }));
}

#[test]
fn test_tags_default_to_base() {
    let rec = StageBuilder::new("rec", recorder()).build_terminal().unwrap();
    let top = StageBuilder::new("top", Fanout::new(1)).build_on(rec).unwrap();
    assert_eq!(top.meta().input_label, LabelKind::Simple);
    assert_eq!(top.meta().output_label, LabelKind::Simple);
}

// =============================================================================
// Offsets
// =============================================================================

#[test]
fn test_nested_fanout_addresses_disjoint_slots() {
    let mut ws = Workspace::new(three_level(), 8).unwrap();
    let mut unit = example();
    ws.learn(&mut unit).unwrap();

    assert_eq!(unit.offsets(), vec![0]);
    let rec: &Recorder = logic(&ws, 2);
    assert_eq!(rec.offsets, vec![0, 1, 2, 3, 4, 5]);
}

#[test]
fn test_offset_restored_after_inner_failure() {
    let failing = StageBuilder::new("failing", Failing::default())
        .build_terminal()
        .unwrap();
    let top = StageBuilder::new("fan", Fanout::new(4))
        .weights_per_example(4)
        .build_on(failing)
        .unwrap();
    let mut ws = Workspace::new(top, 6).unwrap();

    let mut ex = Example::new(vec![(3, 1.0)], Label::Simple(0.0));
    ex.ft_offset = 7;
    let mut unit = ExampleUnit::Single(ex);
    let err = ws.learn(&mut unit).unwrap_err();

    assert!(matches!(err, StackError::Stage(StageError::ExecutionFailed(_))));
    assert_eq!(unit.offsets(), vec![7]);
}

// =============================================================================
// Dispatch
// =============================================================================

#[test]
fn test_pipeline_rejects_unit_of_wrong_shape() {
    let mut ws = Workspace::new(three_level(), 8).unwrap();
    let mut unit = ExampleUnit::Multi(vec![Example::new(vec![], Label::None)]);
    let err = ws.learn(&mut unit).unwrap_err();
    assert!(matches!(err, StackError::ShapeMismatch { .. }));
}

#[test]
fn test_update_defaults_to_learn() {
    let mut ws = Workspace::new(three_level(), 8).unwrap();
    let mut unit = example();
    ws.update(&mut unit).unwrap();
    assert_eq!(logic::<Recorder>(&ws, 2).learns, 6);
}

#[test]
fn test_sensitivity_forwards_to_same_shape_base() {
    let mut rec = recorder();
    rec.caps = rec.caps.with(Capability::Sensitivity);
    let rec = StageBuilder::new("rec", rec).build_terminal().unwrap();
    let top = StageBuilder::new("fan", Fanout::new(2))
        .weights_per_example(2)
        .build_on(rec)
        .unwrap();
    let mut ws = Workspace::new(top, 6).unwrap();
    assert_eq!(ws.sensitivity(&mut example()).unwrap(), 0.5);
}

#[test]
fn test_sensitivity_does_not_cross_shapes() {
    let rec = StageBuilder::new("rec", recorder()).build_terminal().unwrap();
    let lines = StageBuilder::new("lines", Lines).build_on(rec).unwrap();
    let mut ws = Workspace::new(lines, 6).unwrap();
    let mut unit = ExampleUnit::Multi(vec![Example::new(vec![], Label::None)]);
    let err = ws.sensitivity(&mut unit).unwrap_err();
    assert!(matches!(err, StackError::ShapeCrossing { .. }));
}

#[test]
fn test_sensitivity_without_implementation_or_base() {
    let rec = StageBuilder::new("rec", recorder()).build_terminal().unwrap();
    let mut ws = Workspace::new(rec, 6).unwrap();
    let err = ws.sensitivity(&mut example()).unwrap_err();
    assert!(matches!(err, StackError::CapabilityMissing { call: "sensitivity", .. }));
}

#[test]
fn test_multipredict_defaults_to_predict_per_slot() {
    let rec = StageBuilder::new("rec", recorder()).build_terminal().unwrap();
    let top = StageBuilder::new("fan", Fanout::new(3))
        .weights_per_example(3)
        .build_on(rec)
        .unwrap();
    let mut ws = Workspace::new(top, 6).unwrap();
    let mut unit = example();
    let preds = ws.multipredict(&mut unit, 1, 2).unwrap();
    assert_eq!(preds, vec![Prediction::Scalar(3.0), Prediction::Scalar(6.0)]);
    assert_eq!(unit.offsets(), vec![0]);
}

#[test]
fn test_finish_example_forwards_to_base() {
    let mut ws = Workspace::new(three_level(), 8).unwrap();
    let mut unit = example();
    ws.process(&mut unit).unwrap();
    assert_eq!(ws.ctx.stats.examples, 1);
}

#[test]
fn test_pass_through_forwards_unchanged() {
    let rec = StageBuilder::new("rec", recorder()).build_terminal().unwrap();
    let pass = StageBuilder::<PassThrough<Single>>::pass_through("pass").build_on(rec).unwrap();
    assert!(pass.meta().stateless);
    assert_eq!(pass.increment(), 1);
    let mut ws = Workspace::new(pass, 6).unwrap();
    ws.learn(&mut example()).unwrap();
    ws.update(&mut example()).unwrap();
    assert_eq!(logic::<Recorder>(&ws, 1).offsets, vec![0, 0]);
}

// =============================================================================
// Auto-recursive calls
// =============================================================================

#[test]
fn test_end_pass_reaches_every_stage() {
    let mut ws = Workspace::new(three_level(), 8).unwrap();
    ws.end_pass().unwrap();
    assert_eq!(logic::<Fanout>(&ws, 0).passes, 1);
    assert_eq!(logic::<Fanout>(&ws, 1).passes, 1);
    assert_eq!(logic::<Recorder>(&ws, 2).passes, 1);
    assert_eq!(ws.ctx.stats.passes_complete, 1);
}

#[test]
fn test_save_load_reaches_stage_without_forwarding() {
    let mut ws = Workspace::new(three_level(), 8).unwrap();
    for _ in 0..3 {
        ws.learn(&mut example()).unwrap();
    }
    let bytes = ws.save_to_bytes().unwrap();

    let mut restored = Workspace::new(three_level(), 8).unwrap();
    restored.load_from_bytes(&bytes).unwrap();
    assert_eq!(logic::<Recorder>(&restored, 2).learns, 18);
}

#[test]
fn test_stage_without_save_load_writes_exactly_its_base_records() {
    let mut alone = Workspace::new(StageBuilder::new("rec", recorder()).build_terminal().unwrap(), 6).unwrap();
    let rec = StageBuilder::new("rec", recorder()).build_terminal().unwrap();
    let pass = StageBuilder::<PassThrough<Single>>::pass_through("pass").build_on(rec).unwrap();
    let mut wrapped = Workspace::new(pass, 6).unwrap();
    for _ in 0..4 {
        alone.learn(&mut example()).unwrap();
        wrapped.learn(&mut example()).unwrap();
    }

    let mut direct = ModelBuffer::new();
    alone.pipeline.save_load(&mut alone.ctx, &mut direct, false).unwrap();
    let mut through = ModelBuffer::new();
    wrapped.pipeline.save_load(&mut wrapped.ctx, &mut through, false).unwrap();
    assert_eq!(through.as_bytes(), direct.as_bytes());
    assert_eq!(direct.as_bytes(), &4u64.to_le_bytes());
}

/// `front` and `back` each persist an 8-byte learn counter.
fn two_records() -> Workspace {
    let back = StageBuilder::new("back", recorder()).build_terminal().unwrap();
    let front = StageBuilder::new("front", recorder()).build_on(back).unwrap();
    Workspace::new(front, 6).unwrap()
}

#[test]
fn test_failed_stage_read_restores_every_stage() {
    let mut source = two_records();
    for _ in 0..12 {
        source.learn(&mut example()).unwrap();
    }
    let bytes = source.save_to_bytes().unwrap();

    // Keep the header and front's record, cut back's record short and
    // re-seal the payload so checksum and header still validate.
    let header = 4 + 4 + 32 + 4;
    let mut payload = bytes[..header + 8 + 4].to_vec();
    let checksum = blake3::hash(&payload);
    payload.extend_from_slice(checksum.as_bytes());

    let mut dest = two_records();
    for _ in 0..5 {
        dest.learn(&mut example()).unwrap();
    }
    let err = dest.load_from_bytes(&payload).unwrap_err();
    match &err {
        StackError::Persistence { stage, .. } => assert_eq!(stage, "back"),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(logic::<Recorder>(&dest, 0).learns, 5);
    assert_eq!(logic::<Recorder>(&dest, 1).learns, 0);
}

#[test]
fn test_trailing_bytes_restore_previous_state() {
    let mut source = two_records();
    source.learn(&mut example()).unwrap();
    let bytes = source.save_to_bytes().unwrap();
    let mut payload = bytes[..bytes.len() - 32].to_vec();
    payload.extend_from_slice(&[0u8; 3]);
    let checksum = blake3::hash(&payload);
    payload.extend_from_slice(checksum.as_bytes());

    let mut dest = two_records();
    let err = dest.load_from_bytes(&payload).unwrap_err();
    assert!(err.to_string().contains("3 unread bytes"));
    assert_eq!(logic::<Recorder>(&dest, 0).learns, 0);
}

#[test]
fn test_corrupted_model_is_rejected() {
    let mut ws = Workspace::new(three_level(), 8).unwrap();
    let mut bytes = ws.save_to_bytes().unwrap();
    bytes[5] ^= 0xff;

    let mut restored = Workspace::new(three_level(), 8).unwrap();
    let err = restored.load_from_bytes(&bytes).unwrap_err();
    assert!(matches!(err, StackError::ModelFormat(_)));
    assert_eq!(logic::<Recorder>(&restored, 2).learns, 0);
}

#[test]
fn test_model_from_different_stack_is_rejected() {
    let mut ws = Workspace::new(three_level(), 8).unwrap();
    let bytes = ws.save_to_bytes().unwrap();

    let rec = StageBuilder::new("rec", recorder()).build_terminal().unwrap();
    let mut other = Workspace::new(rec, 8).unwrap();
    let err = other.load_from_bytes(&bytes).unwrap_err();
    assert!(err.to_string().contains("different stack"));
}

#[test]
fn test_readable_model_names_the_stack() {
    let mut ws = Workspace::new(three_level(), 8).unwrap();
    let text = ws.save_readable().unwrap();
    assert!(text.starts_with("stack top→mid→rec\n"));
    assert!(text.contains("learns 0\n"));
}

// =============================================================================
// Pipeline introspection and aggregation preconditions
// =============================================================================

#[test]
fn test_describe_lists_stages_top_down() {
    let ws = Workspace::new(three_level(), 8).unwrap();
    assert_eq!(ws.pipeline.stack_id(), "top→mid→rec");
    let summary = ws.pipeline.describe();
    let increments: Vec<u64> = summary.iter().map(|s| s.meta.increment).collect();
    assert_eq!(increments, vec![6, 3, 1]);
    assert_eq!(summary[2].capabilities, vec![Capability::FinishExample]);
    assert_eq!(ws.ctx.weights.layout().stride_shift, 3);
}

#[test]
fn test_merge_requires_aggregation_callbacks() {
    let a = Workspace::new(three_level(), 8).unwrap();
    let mut dest = Workspace::new(three_level(), 8).unwrap();
    let err = aggregate::merge(&mut dest, &[1.0], &[&a]).unwrap_err();
    match err {
        StackError::AggregationUnsupported { stage, op } => {
            assert_eq!(stage, "top");
            assert_eq!(op, "merge");
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_merge_rejects_different_structures() {
    let rec = StageBuilder::new("rec", recorder()).build_terminal().unwrap();
    let shallow = Workspace::new(rec, 8).unwrap();
    let mut dest = Workspace::new(three_level(), 8).unwrap();
    let err = aggregate::merge(&mut dest, &[1.0], &[&shallow]).unwrap_err();
    assert!(err.is_structural());
    assert!(matches!(err, StackError::StructureMismatch { .. }));
}

fn fanout_over_recorder() -> Workspace {
    let rec = StageBuilder::new("rec", recorder()).build_terminal().unwrap();
    let top = StageBuilder::new("top", Fanout::new(2))
        .weights_per_example(2)
        .with_aggregation()
        .build_on(rec)
        .unwrap();
    Workspace::new(top, 6).unwrap()
}

#[test]
fn test_unsupported_stage_below_leaves_destination_untouched() {
    let mut source = fanout_over_recorder();
    for _ in 0..3 {
        source.end_pass().unwrap();
    }
    let mut dest = fanout_over_recorder();

    let err = aggregate::merge(&mut dest, &[1.0], &[&source]).unwrap_err();
    assert!(matches!(err, StackError::AggregationUnsupported { ref stage, op: "merge" } if stage == "rec"));
    let err = aggregate::add(&mut dest, &source, &source).unwrap_err();
    assert!(matches!(err, StackError::AggregationUnsupported { op: "add", .. }));
    let err = aggregate::subtract(&mut dest, &source, &source).unwrap_err();
    assert!(matches!(err, StackError::AggregationUnsupported { op: "subtract", .. }));
    assert_eq!(logic::<Fanout>(&dest, 0).passes, 0);
}

#[test]
fn test_merge_rejects_non_positive_weights() {
    let source = fanout_over_recorder();
    let mut dest = fanout_over_recorder();
    let err = aggregate::merge(&mut dest, &[0.0], &[&source]).unwrap_err();
    assert!(matches!(err, StackError::Aggregation(_)));
}
