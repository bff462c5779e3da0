//! End-to-end stacks built from the reference stages.
//!
//! ```text
//! counting (×1) → doubling (×2) → noop | sentinel
//! ```

use stack_core::{Example, ExampleUnit, Label, StageBuilder, Workspace};
use stack_setup::StackConfig;
use stack_stages::{assemble, CountingStage, DoublingStage, NoopStage, SentinelStage};

fn fixture(name: &str) -> std::path::PathBuf {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    let workspace_root = std::path::Path::new(&manifest_dir).parent().unwrap().parent().unwrap();
    workspace_root.join("testing/fixtures").join(name)
}

fn hand_built() -> Workspace {
    let base = StageBuilder::new("sentinel", SentinelStage::default())
        .with_aggregation()
        .build_terminal()
        .unwrap();
    let mid = StageBuilder::new("doubling", DoublingStage::new(2))
        .weights_per_example(2)
        .with_aggregation()
        .build_on(base)
        .unwrap();
    let top = StageBuilder::new("counting", CountingStage::default())
        .with_aggregation()
        .build_on(mid)
        .unwrap();
    Workspace::new(top, 8).unwrap()
}

fn example(i: u64) -> ExampleUnit {
    Example::new(vec![(i, 1.0), (i + 100, 0.5)], Label::Simple(1.0)).into()
}

fn sentinel(ws: &Workspace) -> &SentinelStage {
    ws.pipeline
        .find("sentinel")
        .and_then(|s| s.logic_any().downcast_ref::<SentinelStage>())
        .unwrap()
}

fn counting(ws: &Workspace) -> &CountingStage {
    ws.pipeline
        .find("counting")
        .and_then(|s| s.logic_any().downcast_ref::<CountingStage>())
        .unwrap()
}

#[test]
fn test_counting_over_doubling_over_noop() {
    let base = StageBuilder::new("noop", NoopStage).build_terminal().unwrap();
    let mid = StageBuilder::new("doubling", DoublingStage::new(2))
        .weights_per_example(2)
        .build_on(base)
        .unwrap();
    let top = StageBuilder::new("counting", CountingStage::default())
        .build_on(mid)
        .unwrap();
    let mut ws = Workspace::new(top, 8).unwrap().quiet(true);
    assert_eq!(ws.pipeline.stack_id(), "counting→doubling→noop");

    for i in 0..5 {
        let mut unit = example(i);
        ws.learn(&mut unit).unwrap();
        ws.finish_example(&mut unit).unwrap();
        assert_eq!(unit.offsets(), vec![0]);
    }

    let top = ws.pipeline.stage_at(0).unwrap().meta().increment;
    let base = ws.pipeline.stage_at(2).unwrap().meta().increment;
    assert_eq!(top, base * 2);
    assert_eq!(counting(&ws).learns, 5);
    // finish_example forwarded through counting and doubling to noop
    assert_eq!(ws.ctx.stats.examples, 5);
}

#[test]
fn test_counting_over_doubling_over_sentinel() {
    let mut ws = hand_built();
    for i in 0..5 {
        ws.learn(&mut example(i)).unwrap();
    }

    let top = ws.pipeline.stage_at(0).unwrap().meta().increment;
    let base = ws.pipeline.stage_at(2).unwrap().meta().increment;
    assert_eq!(top, base * 2);
    assert_eq!(counting(&ws).learns, 5);

    let sentinel = sentinel(&ws);
    assert_eq!(sentinel.writes().len(), 5 * 2 * 2);
    let first = sentinel.addresses_at(0);
    let second = sentinel.addresses_at(1);
    assert_eq!(first.len(), 10);
    assert_eq!(second.len(), 10);
    assert!(first.iter().all(|a| !second.contains(a)));
}

#[test]
fn test_registry_builds_same_stack() {
    let config = StackConfig::default()
        .bits(8)
        .enable("counting")
        .enable("doubling")
        .enable("sentinel");
    let ws = assemble(&config).unwrap();
    assert_eq!(ws.pipeline.stack_id(), hand_built().pipeline.stack_id());
    assert_eq!(ws.pipeline.fingerprint(), hand_built().pipeline.fingerprint());
}

#[test]
fn test_offsets_are_restored_after_every_call() {
    let mut ws = hand_built();
    let mut unit = example(3);
    ws.learn(&mut unit).unwrap();
    ws.predict(&mut unit).unwrap();
    ws.update(&mut unit).unwrap();
    assert_eq!(unit.offsets(), vec![0]);
}

#[test]
fn test_metrics_cover_stats_and_stages() {
    let mut ws = hand_built().quiet(true);
    for i in 0..3 {
        ws.process(&mut example(i)).unwrap();
    }
    ws.end_pass().unwrap();
    let metrics = ws.metrics().unwrap();
    assert_eq!(metrics.get_int("examples"), Some(3));
    assert_eq!(metrics.get_int("counting_learns"), Some(3));
    assert_eq!(metrics.get_int("sentinel_writes"), Some(12));
    assert_eq!(metrics.get_int("passes_complete"), Some(1));
    assert!(metrics.recorded_at.is_some());
    assert_eq!(counting(&ws).passes, 1);
}

#[test]
fn test_linear_stack_from_fixture_learns() {
    let config = StackConfig::from_path(fixture("stack.yaml")).unwrap();
    let mut ws = assemble(&config).unwrap();
    assert_eq!(ws.pipeline.stack_id(), "counting→doubling→linear");

    let mut first_loss = None;
    for _ in 0..20 {
        let mut unit = example(7);
        ws.learn(&mut unit).unwrap();
        ws.finish_example(&mut unit).unwrap();
        if let ExampleUnit::Single(ex) = &unit {
            first_loss.get_or_insert(ex.loss);
        }
    }
    let mut unit = example(7);
    ws.predict(&mut unit).unwrap();
    let ExampleUnit::Single(ex) = unit else { unreachable!() };
    assert!((ex.prediction.scalar().unwrap() - 1.0).abs() < 1e-3);
    assert_eq!(first_loss, Some(1.0));
    assert_eq!(ws.ctx.stats.examples, 20);
    assert_eq!(ws.ctx.predictions.len(), 20);

    let ctx = ws.finish().unwrap();
    assert!(ctx.stats.average_loss() < 0.5);
}
