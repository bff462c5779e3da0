use stack_core::ExecutionContext;

/// Logs progress at exponentially spaced example counts.
#[derive(Debug, Clone)]
pub(crate) struct Progress {
    next: u64,
}

impl Default for Progress {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl Progress {
    pub(crate) fn report(&mut self, ctx: &ExecutionContext, last: &str) {
        if ctx.quiet || ctx.stats.examples < self.next {
            return;
        }
        tracing::info!(
            trace_id = %ctx.trace_id,
            examples = ctx.stats.examples,
            weighted_examples = ctx.stats.weighted_examples,
            average_loss = ctx.stats.average_loss(),
            last = %last,
            "progress"
        );
        self.next = self.next.saturating_mul(2);
    }
}
