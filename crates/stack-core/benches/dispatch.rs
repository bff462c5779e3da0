//! Dispatch overhead through a stack of fan-out stages over a dot-product base.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use stack_core::{
    Base, CrossCuttingStage, DelegatingStage, Example, ExampleUnit, ExecutionContext, Label,
    Prediction, Result, Single, StageBuilder, StageHandle, Workspace,
};

struct Dot;

impl CrossCuttingStage for Dot {}

impl DelegatingStage for Dot {
    type Shape = Single;
    type BaseShape = Single;

    fn learn(&mut self, base: &mut Base<Single>, ctx: &mut ExecutionContext, unit: &mut Example) -> Result<()> {
        self.predict(base, ctx, unit)?;
        for (f, v) in &unit.features {
            *ctx.weights.get_mut(*f, unit.ft_offset) += 0.01 * v;
        }
        Ok(())
    }

    fn predict(&mut self, _base: &mut Base<Single>, ctx: &mut ExecutionContext, unit: &mut Example) -> Result<()> {
        unit.prediction = Prediction::Scalar(ctx.weights.dot(&unit.features, unit.ft_offset));
        Ok(())
    }
}

struct Fan(u64);

impl CrossCuttingStage for Fan {}

impl DelegatingStage for Fan {
    type Shape = Single;
    type BaseShape = Single;

    fn learn(&mut self, base: &mut Base<Single>, ctx: &mut ExecutionContext, unit: &mut Example) -> Result<()> {
        for i in 0..self.0 {
            base.learn(ctx, unit, i)?;
        }
        Ok(())
    }

    fn predict(&mut self, base: &mut Base<Single>, ctx: &mut ExecutionContext, unit: &mut Example) -> Result<()> {
        base.predict(ctx, unit, 0)
    }
}

fn stack(depth: usize) -> StageHandle {
    let mut top: StageHandle = StageBuilder::new("dot", Dot).build_terminal().unwrap().into();
    for level in 0..depth {
        top = StageBuilder::new(format!("fan{}", level), Fan(2))
            .weights_per_example(2)
            .build(Some(top))
            .unwrap()
            .into();
    }
    top
}

fn bench_learn(c: &mut Criterion) {
    let mut group = c.benchmark_group("learn");
    for depth in [0usize, 2, 4] {
        let mut ws = Workspace::new(stack(depth), 18).unwrap();
        let features: Vec<(u64, f32)> = (0..32).map(|i| (i * 7919, 1.0)).collect();
        let mut unit = ExampleUnit::Single(Example::new(features, Label::Simple(1.0)));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| ws.learn(black_box(&mut unit)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_learn);
criterion_main!(benches);
