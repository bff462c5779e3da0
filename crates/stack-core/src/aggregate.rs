//! Model aggregation across independently trained workspaces.
//!
//! Aggregation callbacks are not auto-recursive, so these walkers visit each
//! depth of the destination chain and hand the stage its counterparts from
//! the source workspaces. Every workspace must be assembled identically.
use crate::contract::{AggregationKind, AnyStage};
use crate::error::{Result, StackError};
use crate::pipeline::Pipeline;
use crate::workspace::Workspace;

fn structure_error(depth: usize, detail: String) -> StackError {
    StackError::StructureMismatch { depth, detail }
}

/// Same depth, names, multipliers, increments and weight layout.
fn check_structure(dest: &Workspace, others: &[&Workspace]) -> Result<usize> {
    let depth = dest.pipeline.depth();
    for other in others {
        if other.pipeline.depth() != depth {
            return Err(structure_error(
                depth,
                format!(
                    "`{}` has {} stages, `{}` has {}",
                    dest.pipeline.stack_id(),
                    depth,
                    other.pipeline.stack_id(),
                    other.pipeline.depth()
                ),
            ));
        }
        dest.ctx.weights.check_same_layout(&other.ctx.weights)?;
        for d in 0..depth {
            let (Some(a), Some(b)) = (dest.pipeline.stage_at(d), other.pipeline.stage_at(d)) else {
                return Err(structure_error(d, "chain ended early".to_string()));
            };
            let (a, b) = (a.meta(), b.meta());
            if a.name != b.name {
                return Err(structure_error(d, format!("stage `{}` vs `{}`", a.name, b.name)));
            }
            if a.weights_per_example != b.weights_per_example || a.increment != b.increment {
                return Err(structure_error(
                    d,
                    format!(
                        "`{}` allocates ×{} (increment {}) vs ×{} (increment {})",
                        a.name, a.weights_per_example, a.increment, b.weights_per_example, b.increment
                    ),
                ));
            }
        }
    }
    Ok(depth)
}

fn is_skipped(stage: &dyn AnyStage) -> bool {
    stage.meta().stateless
}

/// Every stateful stage of `dest` must aggregate before any of them is written.
fn check_aggregation(dest: &Workspace, depth: usize, op: &'static str) -> Result<()> {
    for d in 0..depth {
        let meta = stage_ref(dest, d)?.meta();
        if !meta.stateless && meta.aggregation == AggregationKind::None {
            return Err(StackError::AggregationUnsupported {
                stage: meta.name.clone(),
                op,
            });
        }
    }
    Ok(())
}

fn stage_mut(pipeline: &mut Pipeline, depth: usize) -> Result<&mut dyn AnyStage> {
    pipeline
        .stage_at_mut(depth)
        .ok_or_else(|| structure_error(depth, "chain ended early".to_string()))
}

fn stage_ref(ws: &Workspace, depth: usize) -> Result<&dyn AnyStage> {
    ws.pipeline
        .stage_at(depth)
        .ok_or_else(|| structure_error(depth, "chain ended early".to_string()))
}

/// Weighted merge of `sources` into `dest`, stage by stage.
pub fn merge(dest: &mut Workspace, weights: &[f32], sources: &[&Workspace]) -> Result<()> {
    if sources.is_empty() {
        return Err(StackError::Aggregation("nothing to merge".to_string()));
    }
    if weights.len() != sources.len() {
        return Err(StackError::Aggregation(format!(
            "{} weights for {} workspaces",
            weights.len(),
            sources.len()
        )));
    }
    let total: f32 = weights.iter().sum();
    if !total.is_finite() || total <= 0.0 || weights.iter().any(|w| *w < 0.0) {
        return Err(StackError::Aggregation(format!(
            "merge weights {:?} must be non-negative with a positive sum",
            weights
        )));
    }
    let depth = check_structure(dest, sources)?;
    check_aggregation(dest, depth, "merge")?;
    let span = tracing::debug_span!("merge", stack = %dest.pipeline.stack_id(), sources = sources.len());
    let _enter = span.enter();

    for d in 0..depth {
        let mut stages = Vec::with_capacity(sources.len());
        for ws in sources {
            stages.push((stage_ref(ws, d)?, &ws.ctx));
        }
        let Workspace { pipeline, ctx } = &mut *dest;
        let target = stage_mut(pipeline, d)?;
        if is_skipped(target) {
            continue;
        }
        target.merge(weights, &stages, ctx)?;
    }
    Ok(())
}

/// Writes `base + delta` into `dest`.
pub fn add(dest: &mut Workspace, base: &Workspace, delta: &Workspace) -> Result<()> {
    let depth = check_structure(dest, &[base, delta])?;
    check_aggregation(dest, depth, "add")?;
    for d in 0..depth {
        let left = (stage_ref(base, d)?, &base.ctx);
        let right = (stage_ref(delta, d)?, &delta.ctx);
        let Workspace { pipeline, ctx } = &mut *dest;
        let target = stage_mut(pipeline, d)?;
        if is_skipped(target) {
            continue;
        }
        target.add(left, right, ctx)?;
    }
    Ok(())
}

/// Writes `minuend - subtrahend` into `dest`.
pub fn subtract(dest: &mut Workspace, minuend: &Workspace, subtrahend: &Workspace) -> Result<()> {
    let depth = check_structure(dest, &[minuend, subtrahend])?;
    check_aggregation(dest, depth, "subtract")?;
    for d in 0..depth {
        let left = (stage_ref(minuend, d)?, &minuend.ctx);
        let right = (stage_ref(subtrahend, d)?, &subtrahend.ctx);
        let Workspace { pipeline, ctx } = &mut *dest;
        let target = stage_mut(pipeline, d)?;
        if is_skipped(target) {
            continue;
        }
        target.subtract(left, right, ctx)?;
    }
    Ok(())
}
